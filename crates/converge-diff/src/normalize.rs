//! Pre-diff normalization
//!
//! Brings both sides of a diff into a canonical form so that structurally
//! equivalent objects compare equal:
//! - `metadata.creationTimestamp` is dropped
//! - Secret `stringData` is folded into base64 `data`, and null values become ""
//! - Role and ClusterRole rules are nulled when empty or aggregated
//! - Endpoints ports get their default protocol and subsets a stable order
//!
//! Callers add their own rules through a [`Normalizer`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tracing::{error, info, warn};

use converge_core::Resource;

use crate::diff::DiffOptions;
use crate::error::Result;
use crate::json::sort_keys;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Resource-specific normalization supplied by the caller
pub trait Normalizer: Send + Sync {
    fn normalize(&self, resource: &mut Resource) -> Result<()>;
}

/// Normalizer that leaves resources untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNormalizer;

impl Normalizer for NoopNormalizer {
    fn normalize(&self, _resource: &mut Resource) -> Result<()> {
        Ok(())
    }
}

/// Normalize a resource in place
///
/// Failures of the custom normalizer are logged and otherwise ignored.
pub fn normalize(resource: &mut Resource, options: &DiffOptions) {
    resource.remove_nested(&["metadata", "creationTimestamp"]);

    let group_kind = resource.group_kind();
    match (group_kind.group.as_str(), group_kind.kind.as_str()) {
        ("", "Secret") => normalize_secret(resource),
        (RBAC_GROUP, "Role" | "ClusterRole") => {
            normalize_role(resource, options.ignore_aggregated_roles)
        }
        ("", "Endpoints") => normalize_endpoints(resource),
        _ => {}
    }

    if let Err(err) = options.normalizer.normalize(resource) {
        error!(
            resource = %resource,
            gvk = %resource.group_version_kind(),
            error = %err,
            "Failed to normalize resource"
        );
    }
}

/// Fold `stringData` into base64 `data` and turn null values into ""
///
/// Non-secrets are left alone, as are secrets whose data is not valid base64.
pub fn normalize_secret(resource: &mut Resource) {
    if !resource.group().is_empty() || resource.kind() != "Secret" {
        return;
    }

    if let Some(string_data) = resource.nested(&["stringData"]).and_then(Value::as_object).cloned() {
        let mut data = resource
            .nested(&["data"])
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        for (key, value) in string_data {
            let encoded = match value {
                Value::String(plain) => Value::String(STANDARD.encode(plain)),
                other => other,
            };
            data.insert(key, encoded);
        }
        resource.set_nested(&["data"], Value::Object(data));
        resource.remove_nested(&["stringData"]);
    }

    let Some(data) = resource.nested_mut(&["data"]).and_then(Value::as_object_mut) else {
        return;
    };
    let valid = data.values().all(|value| match value {
        Value::Null => true,
        Value::String(encoded) => STANDARD.decode(encoded).is_ok(),
        _ => false,
    });
    if !valid {
        warn!("Failed to convert secret data, leaving it as is");
        return;
    }
    for value in data.values_mut() {
        if value.is_null() {
            *value = Value::String(String::new());
        }
    }
}

fn normalize_role(resource: &mut Resource, ignore_aggregated_roles: bool) {
    if ignore_aggregated_roles {
        match resource.nested(&["aggregationRule"]).map(Value::is_object) {
            Some(true) => resource.set_nested(&["rules"], Value::Null),
            Some(false) => {
                info!(
                    name = resource.name(),
                    "Malformed aggregationRule, won't modify"
                );
            }
            None => {}
        }
    }

    let empty = matches!(resource.nested(&["rules"]), Some(Value::Array(rules)) if rules.is_empty());
    if empty {
        resource.set_nested(&["rules"], Value::Null);
    }
}

fn normalize_endpoints(resource: &mut Resource) {
    let Some(subsets) = resource.nested_mut(&["subsets"]).and_then(Value::as_array_mut) else {
        return;
    };

    for subset in subsets.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(ports) = subset.get_mut("ports").and_then(Value::as_array_mut) {
            for port in ports.iter_mut().filter_map(Value::as_object_mut) {
                let unset = match port.get("protocol") {
                    None | Some(Value::Null) => true,
                    Some(Value::String(protocol)) => protocol.is_empty(),
                    Some(_) => false,
                };
                if unset {
                    port.insert("protocol".to_string(), Value::String("TCP".to_string()));
                }
            }
            ports.sort_by_cached_key(canonical);
        }
        for field in ["addresses", "notReadyAddresses"] {
            if let Some(addresses) = subset.get_mut(field).and_then(Value::as_array_mut) {
                addresses.sort_by_cached_key(address_key);
            }
        }
    }
    subsets.sort_by_cached_key(canonical);
}

/// Addresses sort by IP, then by the UID of their target
fn address_key(address: &Value) -> (String, String) {
    let ip = address
        .get("ip")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let uid = address
        .get("targetRef")
        .and_then(|target| target.get("uid"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (ip, uid)
}

fn canonical(value: &Value) -> String {
    sort_keys(value).to_string()
}
