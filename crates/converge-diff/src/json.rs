//! JSON value helpers shared by the diff strategies

use serde_json::{Map, Number, Value};

use crate::error::Result;

/// Keep only the fields of `live` that also appear in `config`
///
/// Used to subtract server-populated fields from a live object before a
/// patch is computed. Values present in both are filtered recursively.
pub fn remove_map_fields(config: &Map<String, Value>, live: &Map<String, Value>) -> Map<String, Value> {
    let mut result = Map::new();
    for (key, config_value) in config {
        let Some(live_value) = live.get(key) else {
            continue;
        };
        let value = if live_value.is_null() {
            Value::Null
        } else {
            remove_fields(config_value, live_value)
        };
        result.insert(key.clone(), value);
    }
    result
}

/// Element-wise [`remove_map_fields`] for lists
///
/// Extra trailing elements of `live` are kept so they still show up in a diff.
pub fn remove_list_fields(config: &[Value], live: &[Value]) -> Vec<Value> {
    live.iter()
        .enumerate()
        .map(|(i, live_value)| match config.get(i) {
            Some(config_value) if !live_value.is_null() => remove_fields(config_value, live_value),
            _ => live_value.clone(),
        })
        .collect()
}

fn remove_fields(config: &Value, live: &Value) -> Value {
    match (config, live) {
        (Value::Object(config), Value::Object(live)) => Value::Object(remove_map_fields(config, live)),
        (Value::Array(config), Value::Array(live)) => Value::Array(remove_list_fields(config, live)),
        _ => live.clone(),
    }
}

/// Strip numeric representation differences
///
/// Floats with an integral value become integers so that `1` and `1.0` compare
/// equal, the same way a typed round trip through the API would print them.
pub fn remarshal(value: &Value) -> Value {
    match value {
        Value::Number(n) => Value::Number(integral(n)),
        Value::Array(items) => Value::Array(items.iter().map(remarshal).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), remarshal(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn integral(n: &Number) -> Number {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Number::from(f as i64)
        }
        _ => n.clone(),
    }
}

/// Rebuild a value with object keys in lexicographic order
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Byte form used for comparison; identical values always yield identical bytes
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&sort_keys(value))?)
}

/// Literal marker used for an absent side of a diff
pub const NULL_BYTES: &[u8] = b"null";

/// Drop `metadata.namespace`, and `metadata.annotations` when null or empty
pub fn remove_namespace_annotation(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.remove("namespace");
        let empty = match metadata.get("annotations") {
            Some(Value::Null) => true,
            Some(Value::Object(map)) => map.is_empty(),
            _ => false,
        };
        if empty {
            metadata.remove("annotations");
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remove_map_fields() {
        let config = json!({"spec": {"replicas": 2, "template": {"x": 1}}});
        let live = json!({
            "spec": {"replicas": 3, "template": {"x": 1, "defaulted": true}, "extra": 1},
            "status": {}
        });
        let result = remove_map_fields(
            config.as_object().unwrap(),
            live.as_object().unwrap(),
        );
        assert_eq!(
            Value::Object(result),
            json!({"spec": {"replicas": 3, "template": {"x": 1}}})
        );
    }

    #[test]
    fn test_remove_list_fields_keeps_extra_items() {
        let config = vec![json!({"name": "a"})];
        let live = vec![json!({"name": "a", "x": 1}), json!({"name": "b"})];
        assert_eq!(
            remove_list_fields(&config, &live),
            vec![json!({"name": "a"}), json!({"name": "b"})]
        );
    }

    #[test]
    fn test_remarshal_integral_floats() {
        let value = json!({"a": 1.0, "b": [2.0, 2.5], "c": "3"});
        assert_eq!(remarshal(&value), json!({"a": 1, "b": [2, 2.5], "c": "3"}));
    }

    #[test]
    fn test_canonical_bytes_sorted() {
        let a = json!({"b": 1, "a": {"d": 1, "c": 2}});
        let b = json!({"a": {"c": 2, "d": 1}, "b": 1});
        assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
        assert_eq!(
            String::from_utf8(canonical_bytes(&a).unwrap()).unwrap(),
            r#"{"a":{"c":2,"d":1},"b":1}"#
        );
    }

    #[test]
    fn test_remove_namespace_annotation() {
        let value = json!({"metadata": {"name": "x", "namespace": "ns", "annotations": {}}});
        assert_eq!(
            remove_namespace_annotation(&value),
            json!({"metadata": {"name": "x"}})
        );

        let value = json!({"metadata": {"annotations": {"a": "b"}}});
        assert_eq!(remove_namespace_annotation(&value), value);
    }
}
