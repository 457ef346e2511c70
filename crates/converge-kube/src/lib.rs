//! Converge Kube - Reconciliation and the sync state machine for converge
//!
//! This crate provides:
//! - **Reconciliation**: Pair desired manifests with live objects and split off hooks
//! - **Sync Planning**: Tasks ordered by phase, wave, kind and dependencies
//! - **Sync State Machine**: Resumable, step-wise execution of waves and hooks
//! - **Health**: Built-in health rules used to gate waves and judge hooks
//! - **CRD Readiness**: Waiting for freshly applied CRDs to be established
//! - **Cluster Access**: A kube-rs backed client and an in-memory mock

pub mod client;
pub mod cluster;
pub mod crd;
pub mod error;
pub mod health;
pub mod mock;
pub mod reconcile;
pub mod sync;
pub mod tasks;

pub use client::{
    AllowAll, ApplyOptions, ClusterResourceClient, DEFAULT_FIELD_MANAGER, DeleteOptions,
    HealthEvaluator, PermissionValidator, PropagationPolicy, ScopeResolver, ServerResource,
};
pub use cluster::KubeClusterClient;
pub use error::{KubeError, Result};
pub use health::StandardHealthEvaluator;
pub use mock::{MockCluster, MockOperation, OperationCounts, RecordedWrite};
pub use reconcile::{ReconciliationResult, modification_results, reconcile};
pub use sync::{
    DEFAULT_CLIENT_SIDE_APPLY_MIGRATION_MANAGER, NamespaceModifier, OperationState,
    ResourceFilter, SyncContext, SyncOptions, SyncWaveHook,
};
pub use tasks::{RunState, SyncTask, TaskList, kind_order, sort_tasks};
