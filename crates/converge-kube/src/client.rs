//! Collaborator interfaces the sync engine talks to the cluster through
//!
//! The engine never touches a transport directly. Everything it needs from a
//! cluster (reads, writes, discovery, scope, health and permission checks) is
//! expressed here so that the kube-rs backed implementation in [`crate::cluster`]
//! and the in-memory [`crate::mock::MockCluster`] are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use converge_core::{GroupKind, GroupVersionKind, HealthStatus, Resource};

use crate::error::Result;

/// Field manager used for server-side apply unless configured otherwise
pub const DEFAULT_FIELD_MANAGER: &str = "argocd-controller";

/// How dependents are handled when an object is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PropagationPolicy {
    /// Dependents are deleted before the owner disappears
    #[default]
    Foreground,
    Background,
    Orphan,
}

/// Options of a write (apply, create or replace)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// Take over conflicting fields, or delete and recreate on replace
    pub force: bool,
    /// Ask the server to validate the manifest
    pub validate: bool,
    /// Use server-side apply instead of a client-side merge
    pub server_side: bool,
    /// Field manager recorded for the write
    pub manager: String,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            validate: true,
            server_side: false,
            manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOptions {
    pub propagation: PropagationPolicy,
}

/// What discovery knows about a resource type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerResource {
    /// Plural resource name, e.g. `deployments`
    pub name: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
}

impl ServerResource {
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// Reads and writes of arbitrary objects
///
/// Write operations return the human readable outcome message recorded in
/// the sync result, e.g. `deployment.apps/web configured`.
#[async_trait]
pub trait ClusterResourceClient: Send + Sync {
    /// Fetch an object; a missing object is a not-found error
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<Resource>;

    async fn apply(&self, resource: &Resource, options: &ApplyOptions) -> Result<String>;

    async fn create(&self, resource: &Resource, options: &ApplyOptions) -> Result<String>;

    /// Replace the whole object; with `force` the object is deleted and recreated
    async fn replace(&self, resource: &Resource, options: &ApplyOptions) -> Result<String>;

    /// Update in place; the resource version of `resource` guards the write
    async fn update(&self, resource: &Resource, dry_run: bool) -> Result<Resource>;

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<()>;

    /// Look up a type, failing with a not-found or method-not-supported error
    async fn discover_resource_type(
        &self,
        gvk: &GroupVersionKind,
        verb: &str,
    ) -> Result<ServerResource>;
}

/// Decides whether a kind lives in a namespace
pub trait ScopeResolver: Send + Sync {
    fn is_namespaced(&self, group_kind: &GroupKind) -> Result<bool>;
}

/// Health of a live object
///
/// `Ok(None)` means the kind has no notion of health and counts as healthy.
pub trait HealthEvaluator: Send + Sync {
    fn evaluate(&self, resource: &Resource) -> Result<Option<HealthStatus>>;
}

/// Checked once per task before anything is written
pub trait PermissionValidator: Send + Sync {
    fn validate(&self, resource: &Resource, server_resource: &ServerResource) -> Result<()>;
}

/// Allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionValidator for AllowAll {
    fn validate(&self, _resource: &Resource, _server_resource: &ServerResource) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_options_default() {
        let options = ApplyOptions::default();
        assert!(options.validate);
        assert!(!options.dry_run);
        assert!(!options.server_side);
        assert_eq!(options.manager, DEFAULT_FIELD_MANAGER);
    }

    #[test]
    fn test_default_propagation_is_foreground() {
        assert_eq!(
            DeleteOptions::default().propagation,
            PropagationPolicy::Foreground
        );
    }

    #[test]
    fn test_server_resource_supports() {
        let info = ServerResource {
            name: "jobs".to_string(),
            namespaced: true,
            verbs: vec!["get".to_string(), "delete".to_string()],
        };
        assert!(info.supports("get"));
        assert!(!info.supports("patch"));
    }
}
