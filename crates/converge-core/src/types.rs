//! Sync vocabulary shared by the diff and sync crates

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hook::HookType;
use crate::resource::{Resource, ResourceKey};

/// Coarse ordering bucket of a sync operation
///
/// The declaration order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl SyncPhase {
    /// Position used when sorting tasks
    pub fn order(self) -> i32 {
        match self {
            SyncPhase::PreSync => -1,
            SyncPhase::Sync => 0,
            SyncPhase::PostSync => 1,
            SyncPhase::SyncFail => 2,
        }
    }
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncPhase::PreSync => write!(f, "PreSync"),
            SyncPhase::Sync => write!(f, "Sync"),
            SyncPhase::PostSync => write!(f, "PostSync"),
            SyncPhase::SyncFail => write!(f, "SyncFail"),
        }
    }
}

/// Outcome of syncing one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Synced,
    SyncFailed,
    Pruned,
    PruneSkipped,
}

impl ResultCode {
    /// Operation phase implied by a fresh result
    pub fn operation_phase(self) -> OperationPhase {
        match self {
            ResultCode::Synced => OperationPhase::Running,
            ResultCode::SyncFailed => OperationPhase::Failed,
            ResultCode::Pruned | ResultCode::PruneSkipped => OperationPhase::Succeeded,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Synced => write!(f, "Synced"),
            ResultCode::SyncFailed => write!(f, "SyncFailed"),
            ResultCode::Pruned => write!(f, "Pruned"),
            ResultCode::PruneSkipped => write!(f, "PruneSkipped"),
        }
    }
}

/// State of a sync operation, or of a single hook within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationPhase {
    Running,
    Terminating,
    Failed,
    Error,
    Succeeded,
}

impl OperationPhase {
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            OperationPhase::Failed | OperationPhase::Error | OperationPhase::Succeeded
        )
    }

    pub fn is_successful(self) -> bool {
        self == OperationPhase::Succeeded
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationPhase::Running => write!(f, "Running"),
            OperationPhase::Terminating => write!(f, "Terminating"),
            OperationPhase::Failed => write!(f, "Failed"),
            OperationPhase::Error => write!(f, "Error"),
            OperationPhase::Succeeded => write!(f, "Succeeded"),
        }
    }
}

/// Health classification of a live resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatusCode {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Unknown,
}

impl std::fmt::Display for HealthStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatusCode::Healthy => write!(f, "Healthy"),
            HealthStatusCode::Progressing => write!(f, "Progressing"),
            HealthStatusCode::Degraded => write!(f, "Degraded"),
            HealthStatusCode::Suspended => write!(f, "Suspended"),
            HealthStatusCode::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthStatusCode,
    #[serde(default)]
    pub message: String,
}

impl HealthStatus {
    pub fn new(status: HealthStatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Read access to the parts of an object that health evaluation looks at
pub trait HealthSource {
    /// The `status` subtree, if any
    fn status(&self) -> Option<&Value>;

    fn generation(&self) -> Option<i64>;

    fn is_being_deleted(&self) -> bool;

    /// `status.conditions[type == condition_type].status`
    fn condition_status(&self, condition_type: &str) -> Option<&str> {
        self.status()?
            .get("conditions")?
            .as_array()?
            .iter()
            .find(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))?
            .get("status")?
            .as_str()
    }
}

impl HealthSource for Resource {
    fn status(&self) -> Option<&Value> {
        self.nested(&["status"])
    }

    fn generation(&self) -> Option<i64> {
        self.nested(&["metadata", "generation"])
            .and_then(Value::as_i64)
    }

    fn is_being_deleted(&self) -> bool {
        Resource::is_being_deleted(self)
    }
}

/// Durable per-resource record of a sync operation
///
/// One record exists per `(ResourceKey, SyncPhase)`; later updates overwrite
/// status, hook phase and message but keep the original insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncResult {
    pub resource_key: ResourceKey,
    #[serde(default)]
    pub version: String,
    pub order: usize,
    pub status: Option<ResultCode>,
    #[serde(default)]
    pub message: String,
    pub hook_type: Option<HookType>,
    pub hook_phase: Option<OperationPhase>,
    pub sync_phase: SyncPhase,
}
