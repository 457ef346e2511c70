//! Unstructured resource model
//!
//! A [`Resource`] is a thin wrapper over a JSON object. Everything the engine
//! needs (identity, annotations, finalizers, managed fields) is read through
//! accessors so that arbitrary kinds, including custom resources, round-trip
//! without loss.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};

/// API group and kind, independent of version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Fully qualified type of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build from an `apiVersion` string such as `v1` or `apps/v1`
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        Self::new(group, version, kind)
    }

    /// The `apiVersion` string of this type
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of a resource independent of its API version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.group, self.kind, self.namespace, self.name
        )
    }
}

/// One entry of `metadata.managedFields`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedFieldsEntry {
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub fields_type: String,
    #[serde(default, rename = "fieldsV1")]
    pub fields_v1: Option<Value>,
    #[serde(default)]
    pub subresource: String,
}

/// An unstructured Kubernetes object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    object: Value,
}

impl Resource {
    /// Wrap a JSON value, which must be an object
    pub fn from_value(object: Value) -> Result<Self> {
        if !object.is_object() {
            return Err(CoreError::InvalidResource {
                message: format!("expected an object, got {}", type_name(&object)),
            });
        }
        Ok(Self { object })
    }

    /// Parse a single YAML document
    pub fn from_yaml(content: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(content)?;
        Self::from_value(value)
    }

    /// Parse a JSON document
    pub fn from_json(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)?;
        Self::from_value(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.object
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.object
    }

    pub fn into_value(self) -> Value {
        self.object
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.object)?)
    }

    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"])
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(self.api_version(), self.kind())
    }

    pub fn group_kind(&self) -> GroupKind {
        self.group_version_kind().group_kind()
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        match self.api_version().split_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"])
    }

    pub fn set_name(&mut self, name: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert("name".to_string(), Value::String(name.to_string()));
        }
    }

    pub fn generate_name(&self) -> &str {
        self.str_at(&["metadata", "generateName"])
    }

    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        let Some(metadata) = self.metadata_mut() else {
            return;
        };
        if namespace.is_empty() {
            metadata.remove("namespace");
        } else {
            metadata.insert(
                "namespace".to_string(),
                Value::String(namespace.to_string()),
            );
        }
    }

    pub fn uid(&self) -> &str {
        self.str_at(&["metadata", "uid"])
    }

    pub fn resource_version(&self) -> &str {
        self.str_at(&["metadata", "resourceVersion"])
    }

    pub fn set_resource_version(&mut self, version: &str) {
        if let Some(metadata) = self.metadata_mut() {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }
    }

    /// All annotations with string values
    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.nested(&["metadata", "annotations"]))
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let Some(metadata) = self.metadata_mut() else {
            return;
        };
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Some(map) = annotations.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let removed = self
            .nested_mut(&["metadata", "annotations"])
            .and_then(Value::as_object_mut)
            .and_then(|map| map.remove(key));
        removed.and_then(|v| v.as_str().map(String::from))
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.nested(&["metadata", "labels"]))
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.nested(&["metadata", "finalizers"])
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace the finalizer list, dropping the field when empty
    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        let Some(metadata) = self.metadata_mut() else {
            return;
        };
        if finalizers.is_empty() {
            metadata.remove("finalizers");
        } else {
            metadata.insert(
                "finalizers".to_string(),
                Value::Array(finalizers.into_iter().map(Value::String).collect()),
            );
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers().iter().any(|f| f == finalizer)
    }

    /// Deletion timestamp, if set and parseable
    pub fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.nested(&["metadata", "deletionTimestamp"])
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// True once the server has marked the object for deletion
    pub fn is_being_deleted(&self) -> bool {
        matches!(
            self.nested(&["metadata", "deletionTimestamp"]),
            Some(v) if !v.is_null()
        )
    }

    pub fn managed_fields(&self) -> Vec<ManagedFieldsEntry> {
        self.nested(&["metadata", "managedFields"])
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.group(), self.kind(), self.namespace(), self.name())
    }

    /// Value at a field path
    pub fn nested(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.object, |current, key| current.get(*key))
    }

    pub fn nested_mut(&mut self, path: &[&str]) -> Option<&mut Value> {
        path.iter()
            .try_fold(&mut self.object, |current, key| current.get_mut(*key))
    }

    pub fn nested_str(&self, path: &[&str]) -> Option<&str> {
        self.nested(path).and_then(Value::as_str)
    }

    /// Set a value, creating intermediate objects as needed
    pub fn set_nested(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else {
            return;
        };
        let mut current = &mut self.object;
        for key in parents {
            let Some(map) = current.as_object_mut() else {
                return;
            };
            let next = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !next.is_object() {
                *next = Value::Object(Map::new());
            }
            current = next;
        }
        if let Some(map) = current.as_object_mut() {
            map.insert(last.to_string(), value);
        }
    }

    pub fn remove_nested(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        self.nested_mut(parents)
            .and_then(Value::as_object_mut)
            .and_then(|map| map.remove(*last))
    }

    fn str_at(&self, path: &[&str]) -> &str {
        self.nested(path).and_then(Value::as_str).unwrap_or("")
    }

    fn metadata_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let root = self.object.as_object_mut()?;
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        metadata.as_object_mut()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace().is_empty() {
            write!(f, "{}/{}", self.kind(), self.name())
        } else {
            write!(f, "{}/{}/{}", self.namespace(), self.kind(), self.name())
        }
    }
}

/// Parse a multi-document YAML manifest, skipping empty documents
pub fn parse_manifest(manifest: &str) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value = Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        resources.push(Resource::from_value(value)?);
    }
    Ok(resources)
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
