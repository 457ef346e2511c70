//! Field ownership aware merging
//!
//! Mirrors what server-side apply does with `metadata.managedFields`: the
//! applied configuration is merged over the live object, and fields the acting
//! manager applied before but no longer sets are removed unless another
//! manager also owns them.
//!
//! Field paths use the `FieldsV1` vocabulary: `f:<field>`, `k:<key object>`
//! for keyed list elements, `v:<value>` for set list elements and `i:<index>`.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use converge_core::ManagedFieldsEntry;

use crate::error::{DiffError, Result};
use crate::json::sort_keys;
use crate::schema::{KindSchema, ListStrategy};

/// Operation recorded for server-side apply in managed fields entries
pub const APPLY_OPERATION: &str = "Apply";

/// One step of a field path
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathElement {
    Field(String),
    /// Canonical JSON of the key fields of a keyed list element
    Key(String),
    /// Canonical JSON of a set list element
    Value(String),
    Index(usize),
}

pub type FieldPath = Vec<PathElement>;

/// Set of owned field paths
pub type FieldSet = BTreeSet<FieldPath>;

/// Parse a `fieldsV1` tree into a set of paths
///
/// Multi-field element keys are narrowed to the merge key the schema
/// registers for the list, so they line up with [`to_field_set`].
pub fn from_fields_v1(fields: &Value, schema: Option<&KindSchema>) -> Result<FieldSet> {
    let mut set = FieldSet::new();
    let root = fields.as_object().ok_or_else(|| DiffError::ManagedFields {
        message: "fieldsV1 is not an object".to_string(),
    })?;
    walk_fields_v1(root, "", &mut Vec::new(), schema, &mut set)?;
    Ok(set)
}

fn walk_fields_v1(
    node: &Map<String, Value>,
    path: &str,
    prefix: &mut FieldPath,
    schema: Option<&KindSchema>,
    set: &mut FieldSet,
) -> Result<()> {
    for (raw, child) in node {
        if raw == "." {
            set.insert(prefix.clone());
            continue;
        }
        let (element, child_path) = parse_element(raw, path, schema)?;
        prefix.push(element);
        match child.as_object() {
            Some(map) if map.is_empty() => {
                set.insert(prefix.clone());
            }
            Some(map) => walk_fields_v1(map, &child_path, prefix, schema, set)?,
            None => {
                return Err(DiffError::ManagedFields {
                    message: format!("expected an object under {}", raw),
                });
            }
        }
        prefix.pop();
    }
    Ok(())
}

fn parse_element(raw: &str, path: &str, schema: Option<&KindSchema>) -> Result<(PathElement, String)> {
    let invalid = |message: String| DiffError::ManagedFields { message };
    if let Some(field) = raw.strip_prefix("f:") {
        return Ok((PathElement::Field(field.to_string()), child_path(path, field)));
    }
    if let Some(key) = raw.strip_prefix("k:") {
        let mut key: Map<String, Value> = serde_json::from_str(key)
            .map_err(|e| invalid(format!("invalid key {}: {}", raw, e)))?;
        if let ListStrategy::Keyed(merge_key) = strategy(schema, path) {
            if let Some(id) = key.remove(&merge_key) {
                key = Map::new();
                key.insert(merge_key, id);
            }
        }
        return Ok((PathElement::Key(canonical(&Value::Object(key))), path.to_string()));
    }
    if let Some(value) = raw.strip_prefix("v:") {
        let value: Value = serde_json::from_str(value)
            .map_err(|e| invalid(format!("invalid value {}: {}", raw, e)))?;
        return Ok((PathElement::Value(canonical(&value)), path.to_string()));
    }
    if let Some(index) = raw.strip_prefix("i:") {
        let index = index
            .parse()
            .map_err(|e| invalid(format!("invalid index {}: {}", raw, e)))?;
        return Ok((PathElement::Index(index), path.to_string()));
    }
    Err(invalid(format!("unknown path element {}", raw)))
}

/// All leaf paths of an object
///
/// Scalars, empty maps and atomic lists are leaves. Keyed list elements and
/// set list values are members themselves, and keyed elements also contribute
/// their fields.
pub fn to_field_set(value: &Value, schema: Option<&KindSchema>) -> FieldSet {
    let mut set = FieldSet::new();
    if let Some(map) = value.as_object() {
        let mut prefix = Vec::new();
        collect_map(map, "", &mut prefix, schema, &mut set);
    }
    set
}

fn collect_map(
    map: &Map<String, Value>,
    path: &str,
    prefix: &mut FieldPath,
    schema: Option<&KindSchema>,
    set: &mut FieldSet,
) {
    for (key, value) in map {
        prefix.push(PathElement::Field(key.clone()));
        collect(value, &child_path(path, key), prefix, schema, set);
        prefix.pop();
    }
}

fn collect(
    value: &Value,
    path: &str,
    prefix: &mut FieldPath,
    schema: Option<&KindSchema>,
    set: &mut FieldSet,
) {
    match value {
        Value::Object(map) if !map.is_empty() => collect_map(map, path, prefix, schema, set),
        Value::Array(items) => match strategy(schema, path) {
            ListStrategy::Keyed(merge_key) if keyed(items, &merge_key) => {
                for item in items {
                    prefix.push(key_element(item, &merge_key));
                    set.insert(prefix.clone());
                    if let Some(map) = item.as_object() {
                        collect_map(map, path, prefix, schema, set);
                    }
                    prefix.pop();
                }
            }
            ListStrategy::Set => {
                for item in items {
                    prefix.push(PathElement::Value(canonical(item)));
                    set.insert(prefix.clone());
                    prefix.pop();
                }
            }
            _ => {
                set.insert(prefix.clone());
            }
        },
        _ => {
            set.insert(prefix.clone());
        }
    }
}

/// Merge `config` over `live`, element-wise for keyed and set lists
pub fn merge_values(live: &Value, config: &Value, path: &str, schema: Option<&KindSchema>) -> Value {
    match (live, config) {
        (Value::Object(live_map), Value::Object(config_map)) => {
            let mut result = live_map.clone();
            for (key, config_value) in config_map {
                let merged = match live_map.get(key) {
                    Some(live_value) => {
                        merge_values(live_value, config_value, &child_path(path, key), schema)
                    }
                    None => config_value.clone(),
                };
                result.insert(key.clone(), merged);
            }
            Value::Object(result)
        }
        (Value::Array(live_items), Value::Array(config_items)) => match strategy(schema, path) {
            ListStrategy::Keyed(merge_key)
                if keyed(live_items, &merge_key) && keyed(config_items, &merge_key) =>
            {
                let mut result = live_items.clone();
                for item in config_items {
                    let id = item.get(&merge_key);
                    match result.iter().position(|existing| existing.get(&merge_key) == id) {
                        Some(index) => {
                            result[index] = merge_values(&result[index], item, path, schema);
                        }
                        None => result.push(item.clone()),
                    }
                }
                Value::Array(result)
            }
            ListStrategy::Set => {
                let mut result = live_items.clone();
                for item in config_items {
                    if !result.contains(item) {
                        result.push(item.clone());
                    }
                }
                Value::Array(result)
            }
            _ => config.clone(),
        },
        _ => config.clone(),
    }
}

/// Remove every path of `set` from `value`
///
/// Paths are removed deepest-first so that element removal never shifts the
/// target of a later index.
pub fn remove_items(value: &mut Value, set: &FieldSet) {
    for path in set.iter().rev() {
        remove_path(value, path);
    }
}

fn remove_path(value: &mut Value, path: &[PathElement]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let Some(parent) = parents
        .iter()
        .try_fold(value, |current, element| descend(current, element))
    else {
        return;
    };
    match (last, parent) {
        (PathElement::Field(field), Value::Object(map)) => {
            map.remove(field);
        }
        (PathElement::Key(_) | PathElement::Value(_), Value::Array(items)) => {
            items.retain(|item| !matches_element(item, last));
        }
        (PathElement::Index(index), Value::Array(items)) if *index < items.len() => {
            items.remove(*index);
        }
        _ => {}
    }
}

fn descend<'a>(value: &'a mut Value, element: &PathElement) -> Option<&'a mut Value> {
    match (element, value) {
        (PathElement::Field(field), Value::Object(map)) => map.get_mut(field),
        (PathElement::Index(index), Value::Array(items)) => items.get_mut(*index),
        (element, Value::Array(items)) => items.iter_mut().find(|item| matches_element(item, element)),
        _ => None,
    }
}

fn matches_element(item: &Value, element: &PathElement) -> bool {
    match element {
        PathElement::Key(key) => match serde_json::from_str::<Map<String, Value>>(key) {
            Ok(fields) => fields.iter().all(|(k, v)| item.get(k) == Some(v)),
            Err(_) => false,
        },
        PathElement::Value(value) => canonical(item) == *value,
        _ => false,
    }
}

/// Union of the field sets of the entries accepted by `select`
pub fn owned_fields(
    entries: &[ManagedFieldsEntry],
    schema: Option<&KindSchema>,
    select: impl Fn(&ManagedFieldsEntry) -> bool,
) -> Result<FieldSet> {
    let mut set = FieldSet::new();
    for entry in entries.iter().filter(|entry| select(entry)) {
        if let Some(fields) = &entry.fields_v1 {
            set.extend(from_fields_v1(fields, schema)?);
        }
    }
    Ok(set)
}

/// Predict the result of applying `config` as `manager`
///
/// Returns `None` when the apply would leave `live` unchanged.
pub fn apply(
    live: &Value,
    config: &Value,
    managed_fields: &[ManagedFieldsEntry],
    manager: &str,
    schema: Option<&KindSchema>,
) -> Result<Option<Value>> {
    let is_own_apply =
        |entry: &ManagedFieldsEntry| entry.manager == manager && entry.operation == APPLY_OPERATION;
    let previous = owned_fields(managed_fields, schema, is_own_apply)?;
    let others = owned_fields(managed_fields, schema, |entry| !is_own_apply(entry))?;
    let applied = to_field_set(config, schema);

    let mut merged = merge_values(live, config, "", schema);
    let released: FieldSet = previous
        .difference(&applied)
        .filter(|path| !others.contains(*path))
        .cloned()
        .collect();
    remove_items(&mut merged, &released);

    if merged == *live {
        Ok(None)
    } else {
        Ok(Some(merged))
    }
}

/// Revert everything in `predicted` that `manager` does not own back to `live`
pub fn remove_webhook_mutation(
    predicted: &Value,
    live: &Value,
    managed_fields: &[ManagedFieldsEntry],
    manager: &str,
    schema: Option<&KindSchema>,
) -> Result<Value> {
    let owned = owned_fields(managed_fields, schema, |entry| entry.manager == manager)?;
    if owned.is_empty() {
        return Err(DiffError::NoManagedFieldsForManager {
            manager: manager.to_string(),
        });
    }
    let foreign: FieldSet = to_field_set(predicted, schema)
        .difference(&owned)
        .cloned()
        .collect();
    let mut restricted = predicted.clone();
    remove_items(&mut restricted, &foreign);
    Ok(merge_values(live, &restricted, "", schema))
}

fn strategy(schema: Option<&KindSchema>, path: &str) -> ListStrategy {
    schema
        .map(|schema| schema.list_strategy(path))
        .unwrap_or(ListStrategy::Atomic)
}

fn keyed(items: &[Value], merge_key: &str) -> bool {
    items.iter().all(|item| item.get(merge_key).is_some())
}

fn key_element(item: &Value, merge_key: &str) -> PathElement {
    let mut key = Map::new();
    if let Some(id) = item.get(merge_key) {
        key.insert(merge_key.to_string(), id.clone());
    }
    PathElement::Key(canonical(&Value::Object(key)))
}

fn canonical(value: &Value) -> String {
    sort_keys(value).to_string()
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}
