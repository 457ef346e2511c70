//! In-memory cluster for testing
//!
//! Implements every collaborator trait the sync engine needs without a
//! Kubernetes API server. Objects are keyed by [`ResourceKey`]; cluster-scoped
//! kinds are stored without a namespace. Responses can be scripted per
//! resource: injected failures, missing types, unauthorized discovery,
//! finalizer-removal conflicts and health.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use converge_core::{
    GroupKind, GroupVersionKind, HealthStatus, HealthStatusCode, Resource, ResourceKey,
};

use crate::client::{
    ApplyOptions, ClusterResourceClient, DeleteOptions, HealthEvaluator, PermissionValidator,
    ScopeResolver, ServerResource,
};
use crate::error::{KubeError, Result};
use crate::tasks::crd_group_kind;

const CLUSTER_SCOPED_KINDS: [(&str, &str); 9] = [
    ("", "Namespace"),
    ("", "PersistentVolume"),
    ("", "Node"),
    ("apiextensions.k8s.io", "CustomResourceDefinition"),
    ("rbac.authorization.k8s.io", "ClusterRole"),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding"),
    ("storage.k8s.io", "StorageClass"),
    ("networking.k8s.io", "IngressClass"),
    ("apiregistration.k8s.io", "APIService"),
];

const ALL_VERBS: [&str; 8] = [
    "create", "delete", "get", "list", "patch", "update", "watch", "deletecollection",
];

/// Operations whose outcome can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Get,
    Apply,
    /// Any write made with `dry_run`
    DryRun,
    Create,
    Replace,
    Update,
    Delete,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub applies: usize,
    pub dry_run_applies: usize,
    pub creates: usize,
    pub replaces: usize,
    pub updates: usize,
    pub deletes: usize,
    pub discoveries: usize,
}

/// A write as the mock received it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub operation: MockOperation,
    pub key: ResourceKey,
    pub options: ApplyOptions,
}

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ResourceKey, Resource>,
    counts: OperationCounts,
    writes: Vec<RecordedWrite>,
    failures: HashMap<(MockOperation, ResourceKey), String>,
    conflicts: HashMap<ResourceKey, usize>,
    missing_types: HashSet<GroupKind>,
    unauthorized: HashMap<GroupKind, usize>,
    denied: HashMap<ResourceKey, String>,
    health: HashMap<ResourceKey, HealthStatus>,
    health_errors: HashMap<ResourceKey, String>,
    next_version: u64,
}

/// In-memory cluster for testing
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<MockState>>,
}

impl MockCluster {
    /// Create a new empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated objects
    pub fn with_resources(resources: Vec<Resource>) -> Self {
        let cluster = Self::new();
        {
            let mut state = cluster.state();
            for resource in resources {
                state.store(resource);
            }
        }
        cluster
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        self.state().counts.clone()
    }

    /// Reset operation counts and the write log
    pub fn reset_counts(&self) {
        let mut state = self.state();
        state.counts = OperationCounts::default();
        state.writes.clear();
    }

    /// Writes in the order they were received
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    /// Current object stored under `key`
    pub fn object(&self, key: &ResourceKey) -> Option<Resource> {
        let state = self.state();
        state.objects.get(&state.normalize_key(key)).cloned()
    }

    /// All stored objects keyed by identity, as a live-state cache would provide
    pub fn live_by_key(&self) -> HashMap<ResourceKey, Resource> {
        self.state()
            .objects
            .iter()
            .map(|(key, resource)| (key.clone(), resource.clone()))
            .collect()
    }

    pub fn insert(&self, resource: Resource) {
        self.state().store(resource);
    }

    /// Make `operation` on `key` fail with `message`
    pub fn fail_on(&self, operation: MockOperation, key: &ResourceKey, message: &str) {
        let mut state = self.state();
        let key = state.normalize_key(key);
        state.failures.insert((operation, key), message.to_string());
    }

    /// Answer the next `times` updates of `key` with a conflict
    pub fn conflict_on_update(&self, key: &ResourceKey, times: usize) {
        let mut state = self.state();
        let key = state.normalize_key(key);
        state.conflicts.insert(key, times);
    }

    /// Pretend the API server does not serve this kind
    pub fn remove_type(&self, group_kind: GroupKind) {
        self.state().missing_types.insert(group_kind);
    }

    pub fn add_type(&self, group_kind: &GroupKind) {
        self.state().missing_types.remove(group_kind);
    }

    /// Answer the next `times` discovery calls for the kind as unauthorized
    pub fn unauthorized_discovery(&self, group_kind: GroupKind, times: usize) {
        self.state().unauthorized.insert(group_kind, times);
    }

    /// Reject `key` in the permission validator
    pub fn deny(&self, key: &ResourceKey, message: &str) {
        self.state().denied.insert(key.clone(), message.to_string());
    }

    /// Health reported for `key`; unset keys have no health
    pub fn set_health(&self, key: &ResourceKey, status: HealthStatusCode, message: &str) {
        let mut state = self.state();
        let key = state.normalize_key(key);
        state.health.insert(key, HealthStatus::new(status, message));
    }

    pub fn fail_health(&self, key: &ResourceKey, message: &str) {
        let mut state = self.state();
        let key = state.normalize_key(key);
        state.health_errors.insert(key, message.to_string());
    }

    /// Finish a pending deletion as the garbage collector would
    pub fn complete_deletion(&self, key: &ResourceKey) {
        let mut state = self.state();
        let key = state.normalize_key(key);
        state.objects.remove(&key);
    }
}

impl MockState {
    fn is_cluster_scoped(group: &str, kind: &str) -> bool {
        CLUSTER_SCOPED_KINDS
            .iter()
            .any(|(g, k)| *g == group && *k == kind)
    }

    fn normalize_key(&self, key: &ResourceKey) -> ResourceKey {
        if Self::is_cluster_scoped(&key.group, &key.kind) {
            ResourceKey::new(&key.group, &key.kind, "", &key.name)
        } else {
            key.clone()
        }
    }

    fn key_of(&self, resource: &Resource) -> ResourceKey {
        self.normalize_key(&resource.resource_key())
    }

    fn store(&mut self, mut resource: Resource) -> Resource {
        if Self::is_cluster_scoped(resource.group(), resource.kind()) {
            resource.set_namespace("");
        }
        self.next_version += 1;
        if resource.uid().is_empty() {
            resource.set_nested(
                &["metadata", "uid"],
                serde_json::Value::String(format!("uid-{}", self.next_version)),
            );
        }
        resource.set_resource_version(&self.next_version.to_string());
        let key = resource.resource_key();
        self.objects.insert(key, resource.clone());
        resource
    }

    fn check(&self, operation: MockOperation, key: &ResourceKey) -> Result<()> {
        if self.missing_types.contains(&key.group_kind()) {
            return Err(KubeError::ResourceTypeNotFound {
                gvk: GroupVersionKind::new(&key.group, "", &key.kind),
            });
        }
        match self.failures.get(&(operation, key.clone())) {
            Some(message) => Err(KubeError::Rejected(message.clone())),
            None => Ok(()),
        }
    }

    fn record(&mut self, operation: MockOperation, key: &ResourceKey, options: &ApplyOptions) {
        if options.dry_run {
            self.counts.dry_run_applies += 1;
        } else {
            match operation {
                MockOperation::Apply => self.counts.applies += 1,
                MockOperation::Create => self.counts.creates += 1,
                MockOperation::Replace => self.counts.replaces += 1,
                _ => {}
            }
        }
        self.writes.push(RecordedWrite {
            operation,
            key: key.clone(),
            options: options.clone(),
        });
    }

    fn write(
        &mut self,
        operation: MockOperation,
        resource: &Resource,
        options: &ApplyOptions,
    ) -> Result<String> {
        let key = self.key_of(resource);
        self.record(operation, &key, options);
        let scripted = if options.dry_run {
            MockOperation::DryRun
        } else {
            operation
        };
        self.check(scripted, &key)?;

        let exists = self.objects.contains_key(&key);
        let verb = match operation {
            MockOperation::Create if exists => {
                return Err(KubeError::Rejected(format!(
                    "{} \"{}\" already exists",
                    resource.kind(),
                    resource.name()
                )));
            }
            MockOperation::Replace if !exists => {
                return Err(KubeError::not_found(resource.kind(), resource.name()));
            }
            MockOperation::Replace => "replaced",
            _ if exists => "configured",
            _ => "created",
        };

        if !options.dry_run {
            let mut stored = resource.clone();
            if let Some(existing) = self.objects.get(&key) {
                if operation != MockOperation::Replace || !options.force {
                    stored.set_nested(
                        &["metadata", "uid"],
                        serde_json::Value::String(existing.uid().to_string()),
                    );
                }
            }
            if key.group == "apiextensions.k8s.io" && key.kind == "CustomResourceDefinition" {
                stored.set_nested(
                    &["status", "conditions"],
                    serde_json::json!([{"type": "Established", "status": "True"}]),
                );
                // an established CRD starts serving its custom resources
                if let Some((group, kind)) = crd_group_kind(&stored) {
                    let served = GroupKind::new(group, kind);
                    self.missing_types.remove(&served);
                }
            }
            self.store(stored);
        }

        let suffix = if options.dry_run { " (dry run)" } else { "" };
        Ok(format!(
            "{}/{} {}{}",
            key.group_kind().to_string().to_lowercase(),
            resource.name(),
            verb,
            suffix
        ))
    }
}

#[async_trait]
impl ClusterResourceClient for MockCluster {
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<Resource> {
        let mut state = self.state();
        state.counts.gets += 1;
        let key = state.normalize_key(&ResourceKey::new(&gvk.group, &gvk.kind, namespace, name));
        state.check(MockOperation::Get, &key)?;
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| KubeError::not_found(&gvk.kind, name))
    }

    async fn apply(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        self.state().write(MockOperation::Apply, resource, options)
    }

    async fn create(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        self.state().write(MockOperation::Create, resource, options)
    }

    async fn replace(&self, resource: &Resource, options: &ApplyOptions) -> Result<String> {
        self.state().write(MockOperation::Replace, resource, options)
    }

    async fn update(&self, resource: &Resource, dry_run: bool) -> Result<Resource> {
        let mut state = self.state();
        let key = state.key_of(resource);
        if !dry_run {
            state.counts.updates += 1;
        }
        state.check(MockOperation::Update, &key)?;

        if let Some(remaining) = state.conflicts.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KubeError::Conflict {
                    kind: resource.kind().to_string(),
                    name: resource.name().to_string(),
                });
            }
        }

        let Some(existing) = state.objects.get(&key) else {
            return Err(KubeError::not_found(resource.kind(), resource.name()));
        };
        if !resource.resource_version().is_empty()
            && resource.resource_version() != existing.resource_version()
        {
            return Err(KubeError::Conflict {
                kind: resource.kind().to_string(),
                name: resource.name().to_string(),
            });
        }
        if dry_run {
            return Ok(resource.clone());
        }

        // the last finalizer gone on a deleting object completes the deletion
        if resource.is_being_deleted() && resource.finalizers().is_empty() {
            state.objects.remove(&key);
            return Ok(resource.clone());
        }
        Ok(state.store(resource.clone()))
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        _options: &DeleteOptions,
    ) -> Result<()> {
        let mut state = self.state();
        state.counts.deletes += 1;
        let key = state.normalize_key(&ResourceKey::new(&gvk.group, &gvk.kind, namespace, name));
        state.check(MockOperation::Delete, &key)?;

        let Some(existing) = state.objects.get_mut(&key) else {
            return Err(KubeError::not_found(&gvk.kind, name));
        };
        if existing.finalizers().is_empty() {
            state.objects.remove(&key);
        } else if !existing.is_being_deleted() {
            existing.set_nested(
                &["metadata", "deletionTimestamp"],
                serde_json::Value::String(Utc::now().to_rfc3339()),
            );
        }
        Ok(())
    }

    async fn discover_resource_type(
        &self,
        gvk: &GroupVersionKind,
        verb: &str,
    ) -> Result<ServerResource> {
        let mut state = self.state();
        state.counts.discoveries += 1;
        let group_kind = gvk.group_kind();

        if let Some(remaining) = state.unauthorized.get_mut(&group_kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(KubeError::Unauthorized(format!(
                    "discovery of {} refused",
                    group_kind
                )));
            }
        }
        if state.missing_types.contains(&group_kind) {
            return Err(KubeError::ResourceTypeNotFound { gvk: gvk.clone() });
        }

        let server_resource = ServerResource {
            name: format!("{}s", gvk.kind.to_lowercase()),
            namespaced: !MockState::is_cluster_scoped(&gvk.group, &gvk.kind),
            verbs: ALL_VERBS.iter().map(|v| v.to_string()).collect(),
        };
        if !server_resource.supports(verb) {
            return Err(KubeError::MethodNotSupported {
                gvk: gvk.clone(),
                verb: verb.to_string(),
            });
        }
        Ok(server_resource)
    }
}

impl ScopeResolver for MockCluster {
    fn is_namespaced(&self, group_kind: &GroupKind) -> Result<bool> {
        if self.state().missing_types.contains(group_kind) {
            return Err(KubeError::ResourceTypeNotFound {
                gvk: GroupVersionKind::new(&group_kind.group, "", &group_kind.kind),
            });
        }
        Ok(!MockState::is_cluster_scoped(
            &group_kind.group,
            &group_kind.kind,
        ))
    }
}

impl HealthEvaluator for MockCluster {
    fn evaluate(&self, resource: &Resource) -> Result<Option<HealthStatus>> {
        let state = self.state();
        let key = state.key_of(resource);
        if let Some(message) = state.health_errors.get(&key) {
            return Err(KubeError::Rejected(message.clone()));
        }
        Ok(state.health.get(&key).cloned())
    }
}

impl PermissionValidator for MockCluster {
    fn validate(&self, resource: &Resource, _server_resource: &ServerResource) -> Result<()> {
        match self.state().denied.get(&resource.resource_key()) {
            Some(message) => Err(KubeError::PermissionDenied(message.clone())),
            None => Ok(()),
        }
    }
}
