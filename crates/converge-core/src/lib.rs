//! Converge Core - Resource model and shared vocabulary for the converge GitOps engine
//!
//! This crate provides the foundational types used throughout converge:
//! - `Resource`: An unstructured Kubernetes object with typed accessors
//! - `ResourceKey`: Version-independent identity of a resource
//! - `annotations`: Sync-option and hook annotation keys with parsing helpers
//! - `hook`: Hook detection, phases and delete policies
//! - `types`: Sync phases, result codes, operation phases and health

pub mod annotations;
pub mod error;
pub mod hook;
pub mod resource;
pub mod types;

pub use annotations::AnnotationSource;
pub use error::{CoreError, Result};
pub use hook::{HookDeletePolicy, HookType};
pub use resource::{
    GroupKind, GroupVersionKind, ManagedFieldsEntry, Resource, ResourceKey, parse_manifest,
};
pub use types::{
    HealthSource, HealthStatus, HealthStatusCode, OperationPhase, ResourceSyncResult, ResultCode,
    SyncPhase,
};
