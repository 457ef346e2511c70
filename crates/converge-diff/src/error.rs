//! Diff error types

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DiffError {
    #[error("both live and config are null objects")]
    BothAbsent,

    #[error("unexpected state: expected live or config to be null: not create or delete operation")]
    BothPresent,

    #[error("left and right arrays have mismatched lengths ({left} != {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("failed to unmarshal last-applied-configuration in {name}: {source}")]
    LastApplied {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid patch: {message}")]
    Patch { message: String },

    #[error("invalid managed fields: {message}")]
    ManagedFields { message: String },

    #[error("predictedLive for resource {kind}/{name} must have the managedFields")]
    MissingManagedFields { kind: String, name: String },

    #[error("no managed fields found for manager: {manager}")]
    NoManagedFieldsForManager { manager: String },

    #[error("server side diff requested but no dry runner is available")]
    DryRunnerRequired,

    #[error("error running server side apply in dryrun mode for resource {kind}/{name}: {message}")]
    DryRun {
        kind: String,
        name: String,
        message: String,
    },

    #[error("normalizer failed: {message}")]
    Normalizer { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Resource error: {0}")]
    Core(#[from] converge_core::CoreError),
}

pub type Result<T> = std::result::Result<T, DiffError>;
