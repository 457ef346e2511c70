//! Server default values
//!
//! The API server fills in a number of fields on write. Applying the same
//! defaults to both sides of a diff keeps those fields from being reported as
//! drift when the manifest leaves them out. Defaults are only set where a field
//! is absent or null; explicit values are never overwritten.

use serde_json::{Map, Value, json};

use converge_core::GroupKind;

use crate::schema::{KindSchema, SchemaRegistry};

/// Apply server defaults for a registered kind; unregistered kinds are left alone
pub fn apply_defaults(value: &mut Value, registry: &SchemaRegistry) {
    let Some(group_kind) = group_kind_of(value) else {
        return;
    };
    let Some(schema) = registry.get(&group_kind) else {
        return;
    };
    apply_kind_defaults(value, &group_kind, schema);
}

fn apply_kind_defaults(value: &mut Value, group_kind: &GroupKind, schema: &KindSchema) {
    match (group_kind.group.as_str(), group_kind.kind.as_str()) {
        ("apps" | "extensions", "Deployment") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "replicas", json!(1));
                set_default(spec, "revisionHistoryLimit", json!(10));
                set_default(spec, "progressDeadlineSeconds", json!(600));
                if let Some(rolling) = rolling_update(spec, "strategy") {
                    set_default(rolling, "maxUnavailable", json!("25%"));
                    set_default(rolling, "maxSurge", json!("25%"));
                }
            }
        }
        ("apps", "StatefulSet") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "replicas", json!(1));
                set_default(spec, "podManagementPolicy", json!("OrderedReady"));
                set_default(spec, "revisionHistoryLimit", json!(10));
                if let Some(rolling) = rolling_update(spec, "updateStrategy") {
                    set_default(rolling, "partition", json!(0));
                }
                if let Some(retention) = child_object(spec, "persistentVolumeClaimRetentionPolicy") {
                    set_default(retention, "whenDeleted", json!("Retain"));
                    set_default(retention, "whenScaled", json!("Retain"));
                }
            }
        }
        ("apps" | "extensions", "DaemonSet") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "revisionHistoryLimit", json!(10));
                if let Some(rolling) = rolling_update(spec, "updateStrategy") {
                    set_default(rolling, "maxUnavailable", json!(1));
                    set_default(rolling, "maxSurge", json!(0));
                }
            }
        }
        ("apps" | "extensions", "ReplicaSet") | ("", "ReplicationController") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "replicas", json!(1));
            }
        }
        ("batch", "Job") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "backoffLimit", json!(6));
                set_default(spec, "completions", json!(1));
                set_default(spec, "parallelism", json!(1));
                set_default(spec, "completionMode", json!("NonIndexed"));
                set_default(spec, "suspend", json!(false));
            }
        }
        ("batch", "CronJob") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "concurrencyPolicy", json!("Allow"));
                set_default(spec, "suspend", json!(false));
                set_default(spec, "successfulJobsHistoryLimit", json!(3));
                set_default(spec, "failedJobsHistoryLimit", json!(1));
            }
        }
        ("", "Service") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "type", json!("ClusterIP"));
                set_default(spec, "sessionAffinity", json!("None"));
                if spec.get("type") != Some(&json!("ExternalName")) {
                    set_default(spec, "internalTrafficPolicy", json!("Cluster"));
                }
                for port in objects_in(spec, "ports") {
                    set_default(port, "protocol", json!("TCP"));
                    if let Some(number) = port.get("port").cloned() {
                        set_default(port, "targetPort", number);
                    }
                }
            }
        }
        ("", "PersistentVolumeClaim") => {
            if let Some(spec) = object_at(value, "spec") {
                set_default(spec, "volumeMode", json!("Filesystem"));
            }
        }
        _ => {}
    }

    if let Some(root) = schema.pod_spec() {
        let path: Vec<&str> = root.split('.').collect();
        if let Some(pod_spec) = object_at_path(value, &path) {
            apply_pod_spec_defaults(pod_spec);
        }
    }
}

fn apply_pod_spec_defaults(spec: &mut Map<String, Value>) {
    set_default(spec, "restartPolicy", json!("Always"));
    set_default(spec, "dnsPolicy", json!("ClusterFirst"));
    set_default(spec, "schedulerName", json!("default-scheduler"));
    set_default(spec, "terminationGracePeriodSeconds", json!(30));
    set_default(spec, "securityContext", json!({}));

    for field in ["containers", "initContainers"] {
        for container in objects_in(spec, field) {
            apply_container_defaults(container);
        }
    }

    for volume in objects_in(spec, "volumes") {
        for source in ["configMap", "secret"] {
            if let Some(source) = volume.get_mut(source).and_then(Value::as_object_mut) {
                set_default(source, "defaultMode", json!(420));
            }
        }
    }
}

fn apply_container_defaults(container: &mut Map<String, Value>) {
    set_default(
        container,
        "terminationMessagePath",
        json!("/dev/termination-log"),
    );
    set_default(container, "terminationMessagePolicy", json!("File"));
    set_default(container, "resources", json!({}));
    let pull_policy = container
        .get("image")
        .and_then(Value::as_str)
        .map(default_pull_policy)
        .unwrap_or("IfNotPresent");
    set_default(container, "imagePullPolicy", json!(pull_policy));
    for port in objects_in(container, "ports") {
        set_default(port, "protocol", json!("TCP"));
    }
}

/// `Always` for untagged or `:latest` images, `IfNotPresent` otherwise
fn default_pull_policy(image: &str) -> &'static str {
    if image.contains('@') {
        return "IfNotPresent";
    }
    let name = image.rsplit('/').next().unwrap_or(image);
    match name.split_once(':') {
        Some((_, "latest")) | None => "Always",
        Some(_) => "IfNotPresent",
    }
}

fn group_kind_of(value: &Value) -> Option<GroupKind> {
    let api_version = value.get("apiVersion")?.as_str()?;
    let kind = value.get("kind")?.as_str()?;
    let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    Some(GroupKind::new(group, kind))
}

fn set_default(map: &mut Map<String, Value>, key: &str, default: Value) {
    match map.get(key) {
        Some(existing) if !existing.is_null() => {}
        _ => {
            map.insert(key.to_string(), default);
        }
    }
}

fn object_at<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    value.get_mut(key).and_then(Value::as_object_mut)
}

fn object_at_path<'a>(value: &'a mut Value, path: &[&str]) -> Option<&'a mut Map<String, Value>> {
    path.iter()
        .try_fold(value, |current, key| current.get_mut(*key))
        .and_then(Value::as_object_mut)
}

/// Child object of `map`, created when missing or null
fn child_object<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    let entry = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if entry.is_null() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut()
}

/// Default an update strategy to `RollingUpdate` and return its parameters
/// when the strategy is a rolling update
fn rolling_update<'a>(
    spec: &'a mut Map<String, Value>,
    field: &str,
) -> Option<&'a mut Map<String, Value>> {
    let strategy = child_object(spec, field)?;
    set_default(strategy, "type", json!("RollingUpdate"));
    if strategy.get("type") != Some(&json!("RollingUpdate")) {
        return None;
    }
    child_object(strategy, "rollingUpdate")
}

fn objects_in<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> impl Iterator<Item = &'a mut Map<String, Value>> {
    map.get_mut(key)
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|items| items.iter_mut())
        .filter_map(Value::as_object_mut)
}
