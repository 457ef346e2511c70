//! The wave and hook sync state machine
//!
//! A [`SyncContext`] drives one sync operation. Every call to
//! [`SyncContext::sync`] re-plans the tasks from the current reconciliation
//! result, carries over the recorded per-resource results and then makes at
//! most one step of progress:
//!
//! 1. On the first call every task is applied with `dry_run` first. A
//!    namespace that has to be created for the operation is applied for real
//!    before that, since the validation of everything else depends on it.
//! 2. Tasks still running from an earlier call are re-evaluated from the
//!    health of their live objects. Running hooks, or running tasks of a
//!    multi-wave sync, end the call in `Running`.
//! 3. A failed task fails the operation, after the `SyncFail` hooks ran.
//! 4. Otherwise the pending tasks of the lowest phase and wave run: prunes
//!    first, then deletion of hooks that get recreated, then creates and
//!    applies in batches of consecutive tasks of one kind.
//!
//! The caller keeps calling `sync` (on a timer or on live state changes)
//! until [`SyncContext::get_state`] reports a completed phase.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use indexmap::IndexMap;
use indexmap::map::Entry;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use converge_core::annotations::argocd::HOOK_FINALIZER;
use converge_core::annotations::sync_option;
use converge_core::{
    AnnotationSource, GroupVersionKind, HealthStatus, HealthStatusCode, OperationPhase, Resource,
    ResourceKey, ResourceSyncResult, ResultCode, SyncPhase, hook,
};

use crate::client::{
    AllowAll, ApplyOptions, ClusterResourceClient, DEFAULT_FIELD_MANAGER, DeleteOptions,
    HealthEvaluator, PermissionValidator, PropagationPolicy, ServerResource,
};
use crate::crd::{self, CRD_POLL_INTERVAL, CRD_READINESS_TIMEOUT};
use crate::error::Result;
use crate::health::StandardHealthEvaluator;
use crate::reconcile::ReconciliationResult;
use crate::tasks::{
    RunState, SyncTask, TaskList, crd_group_kind, is_crd, is_namespace_kind,
    is_namespace_with_name, prune_last_wave, result_key, reverse_prune_waves, sort_tasks,
};

/// Field manager of objects written by `kubectl apply` without `--server-side`
pub const DEFAULT_CLIENT_SIDE_APPLY_MIGRATION_MANAGER: &str = "kubectl-client-side-apply";

/// Attempts of discovery calls answered as unauthorized, and of finalizer
/// removals answered with a conflict
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Called after every wave that did not fail, with the phase, the wave and
/// whether it was the final one. An error moves the operation to `Error`.
pub type SyncWaveHook =
    Arc<dyn Fn(SyncPhase, i32, bool) -> std::result::Result<(), String> + Send + Sync>;

/// Decides per `(target, live)` pair whether it takes part in the sync
pub type ResourceFilter = Arc<dyn Fn(Option<&Resource>, Option<&Resource>) -> bool + Send + Sync>;

/// Shapes the namespace created for the operation
///
/// Receives the namespace about to be applied and the live one, if any, and
/// reports whether the namespace needs to be applied.
pub type NamespaceModifier =
    Arc<dyn Fn(&mut Resource, Option<&Resource>) -> std::result::Result<bool, String> + Send + Sync>;

/// Phase, message and per-resource results of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub phase: OperationPhase,
    pub message: String,
    /// Ordered by insertion
    pub results: Vec<ResourceSyncResult>,
}

impl Default for OperationState {
    fn default() -> Self {
        Self {
            phase: OperationPhase::Running,
            message: String::new(),
            results: Vec::new(),
        }
    }
}

/// Settings of one sync operation
#[derive(Clone)]
pub struct SyncOptions {
    /// Delete live resources that are no longer desired
    pub prune: bool,
    /// Pruning of resources annotated `Prune=confirm` was approved
    pub prune_confirmed: bool,
    /// Validate everything, change nothing
    pub dry_run: bool,
    /// Take over conflicting fields, or delete and recreate on replace
    pub force: bool,
    pub validate: bool,
    /// Replace whole objects instead of applying them
    pub replace: bool,
    pub server_side_apply: bool,
    pub server_side_apply_manager: String,
    /// Legacy manager whose field ownership is migrated before server-side apply
    pub client_side_apply_migration_manager: Option<String>,
    pub skip_hooks: bool,
    /// Prune only after every other Sync-phase wave
    pub prune_last: bool,
    /// Skip resources recorded as unmodified in `modification_results`
    pub apply_out_of_sync_only: bool,
    /// Skip the validation of every resource whose type is not served yet
    pub skip_dry_run_on_missing_resource: bool,
    pub resource_filter: Option<ResourceFilter>,
    pub sync_wave_hook: Option<SyncWaveHook>,
    /// Consulted before the built-in health rules
    pub health_override: Option<Arc<dyn HealthEvaluator>>,
    /// Allows everything when unset
    pub permission_validator: Option<Arc<dyn PermissionValidator>>,
    /// Default namespace of the operation
    pub namespace: String,
    /// Revision being synced, used to name hooks that only have a `generateName`
    pub revision: String,
    /// Enables creation of the operation namespace
    pub namespace_modifier: Option<NamespaceModifier>,
    pub modification_results: HashMap<ResourceKey, bool>,
    pub prune_propagation_policy: PropagationPolicy,
    /// State to resume from
    pub initial_state: Option<OperationState>,
    /// Start of the operation, now when unset
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prune: false,
            prune_confirmed: false,
            dry_run: false,
            force: false,
            validate: true,
            replace: false,
            server_side_apply: false,
            server_side_apply_manager: DEFAULT_FIELD_MANAGER.to_string(),
            client_side_apply_migration_manager: Some(
                DEFAULT_CLIENT_SIDE_APPLY_MIGRATION_MANAGER.to_string(),
            ),
            skip_hooks: false,
            prune_last: false,
            apply_out_of_sync_only: false,
            skip_dry_run_on_missing_resource: false,
            resource_filter: None,
            sync_wave_hook: None,
            health_override: None,
            permission_validator: None,
            namespace: String::new(),
            revision: String::new(),
            namespace_modifier: None,
            modification_results: HashMap::new(),
            prune_propagation_policy: PropagationPolicy::default(),
            initial_state: None,
            started_at: None,
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("prune", &self.prune)
            .field("prune_confirmed", &self.prune_confirmed)
            .field("dry_run", &self.dry_run)
            .field("force", &self.force)
            .field("validate", &self.validate)
            .field("replace", &self.replace)
            .field("server_side_apply", &self.server_side_apply)
            .field("server_side_apply_manager", &self.server_side_apply_manager)
            .field("skip_hooks", &self.skip_hooks)
            .field("prune_last", &self.prune_last)
            .field("apply_out_of_sync_only", &self.apply_out_of_sync_only)
            .field("namespace", &self.namespace)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// One sync operation
pub struct SyncContext {
    client: Arc<dyn ClusterResourceClient>,
    permission_validator: Arc<dyn PermissionValidator>,
    options: SyncOptions,
    resources: ReconciliationResult,
    results: IndexMap<String, ResourceSyncResult>,
    phase: OperationPhase,
    message: String,
    started_at: DateTime<Utc>,
}

impl SyncContext {
    pub fn new(
        client: Arc<dyn ClusterResourceClient>,
        resources: ReconciliationResult,
        options: SyncOptions,
    ) -> Self {
        let permission_validator = options
            .permission_validator
            .clone()
            .unwrap_or_else(|| Arc::new(AllowAll));
        let state = options.initial_state.clone().unwrap_or_default();
        let results = state
            .results
            .into_iter()
            .map(|result| (result_key(&result.resource_key, result.sync_phase), result))
            .collect();
        let started_at = options.started_at.unwrap_or_else(Utc::now);

        Self {
            client,
            permission_validator,
            options,
            resources,
            results,
            phase: state.phase,
            message: state.message,
            started_at,
        }
    }

    /// Replace the reconciliation result with a fresh one for the next pass
    pub fn set_reconciliation(&mut self, resources: ReconciliationResult) {
        self.resources = resources;
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current phase, message and results ordered by insertion
    pub fn get_state(&self) -> OperationState {
        let mut results: Vec<ResourceSyncResult> = self.results.values().cloned().collect();
        results.sort_by_key(|result| result.order);
        OperationState {
            phase: self.phase,
            message: self.message.clone(),
            results,
        }
    }

    fn started(&self) -> bool {
        !self.results.is_empty()
    }

    /// Make one step of progress
    pub async fn sync(&mut self) {
        info!(
            skip_hooks = self.options.skip_hooks,
            started = self.started(),
            "Syncing"
        );
        let (mut tasks, valid) = self.get_sync_tasks().await;
        if !valid {
            self.set_operation_phase(
                OperationPhase::Failed,
                "one or more synchronization tasks are not valid",
            );
            return;
        }

        if self.started() {
            debug!(tasks = %describe(&tasks), "Tasks");
        } else {
            let mut dry_run_tasks = tasks.clone();

            if let Some(index) = self.namespace_creation_task(&tasks) {
                let mut namespace_tasks = vec![tasks[index].clone()];
                info!(tasks = %describe(&namespace_tasks), "Creating namespace");
                if self.run_tasks(&mut namespace_tasks, false).await == RunState::Failed {
                    self.set_operation_failed(&[], &namespace_tasks, "the namespace failed to apply")
                        .await;
                    return;
                }
                dry_run_tasks.remove(index);
            }

            if self.options.apply_out_of_sync_only {
                dry_run_tasks = self.filter_out_of_sync(dry_run_tasks);
            }

            info!(tasks = %describe(&dry_run_tasks), "Tasks (dry-run)");
            if self.run_tasks(&mut dry_run_tasks, true).await == RunState::Failed {
                self.set_operation_phase(
                    OperationPhase::Failed,
                    "one or more objects failed to apply (dry run)",
                );
                return;
            }
            self.load_results(&mut tasks);
        }

        self.update_running_tasks(&mut tasks);

        let multi_step = tasks.multi_step();
        let running: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| (multi_step || t.is_hook()) && t.running())
            .cloned()
            .collect();
        if !running.is_empty() {
            self.set_running_phase(&running, false);
            return;
        }

        let pending_deletion: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| t.pruned() && t.live().is_some_and(Resource::is_being_deleted))
            .cloned()
            .collect();
        if !pending_deletion.is_empty() {
            self.set_running_phase(&pending_deletion, true);
            return;
        }

        for index in 0..tasks.len() {
            if !(tasks[index].is_hook() && tasks[index].completed()) {
                continue;
            }
            if let Err(e) = self.remove_hook_finalizer(&mut tasks[index]).await {
                let status = tasks[index].sync_status;
                self.set_resource_result(
                    &mut tasks[index],
                    status,
                    Some(OperationPhase::Error),
                    &format!("Failed to remove hook finalizer: {}", e),
                );
            }
        }

        let hooks_pending_deletion_successful: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| {
                t.is_hook() && t.live().is_some() && !t.running() && t.delete_on_phase_successful()
            })
            .cloned()
            .collect();
        let hooks_pending_deletion_failed: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| {
                t.is_hook() && t.live().is_some() && !t.running() && t.delete_on_phase_failed()
            })
            .cloned()
            .collect();

        let (sync_fail_tasks, mut tasks): (Vec<SyncTask>, Vec<SyncTask>) = tasks
            .into_iter()
            .partition(|t| t.phase == SyncPhase::SyncFail);
        let sync_failed_tasks: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| t.sync_status == Some(ResultCode::SyncFailed))
            .cloned()
            .collect();

        if tasks.iter().any(|t| t.completed() && !t.successful()) {
            self.delete_hooks(&hooks_pending_deletion_failed).await;
            self.set_operation_failed(
                &sync_fail_tasks,
                &sync_failed_tasks,
                "one or more synchronization tasks completed unsuccessfully",
            )
            .await;
            return;
        }

        tasks.retain(SyncTask::pending);
        if self.options.apply_out_of_sync_only {
            tasks = self.filter_out_of_sync(tasks);
        }

        if !self.options.prune_confirmed {
            let unconfirmed: Vec<String> = tasks
                .iter()
                .filter(|t| {
                    t.is_prune() && t.obj().has_sync_option(sync_option::PRUNE_REQUIRE_CONFIRM)
                })
                .map(|t| format!("{}/{}/{}", t.obj().api_version(), t.kind(), t.name()))
                .collect();
            if !unconfirmed.is_empty() {
                info!(resources = ?unconfirmed, "Prune requires confirmation");
                self.set_operation_phase(
                    OperationPhase::Running,
                    format!(
                        "waiting for pruning confirmation of {}",
                        unconfirmed.join(", ")
                    ),
                );
                return;
            }
        }

        let Some(phase) = tasks.phase() else {
            self.delete_hooks(&hooks_pending_deletion_successful).await;
            self.set_operation_phase(
                OperationPhase::Succeeded,
                "successfully synced (no more tasks)",
            );
            return;
        };

        let wave = tasks.wave();
        let final_wave = Some(phase) == tasks.last_phase() && wave == tasks.last_wave();
        let remaining: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| t.phase != phase || t.wave() != wave || t.is_hook())
            .cloned()
            .collect();

        debug!(%phase, wave, tasks = %describe(&tasks), "Filtering tasks in correct phase and wave");
        tasks.retain(|t| t.phase == phase && t.wave() == wave);

        self.set_operation_phase(OperationPhase::Running, "one or more tasks are running");

        debug!(tasks = %describe(&tasks), "Wet-run");
        let run_state = self.run_tasks(&mut tasks, false).await;

        if run_state != RunState::Failed {
            if let Some(wave_hook) = self.options.sync_wave_hook.clone() {
                if let Err(e) = wave_hook(phase, wave, final_wave) {
                    error!(error = %e, "SyncWaveHook failed");
                    self.delete_hooks(&hooks_pending_deletion_failed).await;
                    self.set_operation_phase(
                        OperationPhase::Error,
                        format!("SyncWaveHook failed: {}", e),
                    );
                    return;
                }
            }
        }

        match run_state {
            RunState::Failed => {
                let failed: Vec<SyncTask> = tasks
                    .iter()
                    .filter(|t| t.sync_status == Some(ResultCode::SyncFailed))
                    .cloned()
                    .collect();
                self.delete_hooks(&hooks_pending_deletion_failed).await;
                self.set_operation_failed(
                    &sync_fail_tasks,
                    &failed,
                    "one or more objects failed to apply",
                )
                .await;
            }
            RunState::Successful if remaining.is_empty() => {
                self.delete_hooks(&hooks_pending_deletion_successful).await;
                self.set_operation_phase(
                    OperationPhase::Succeeded,
                    "successfully synced (all tasks run)",
                );
            }
            RunState::Successful => self.set_running_phase(&remaining, false),
            RunState::Pending => {
                let deleting: Vec<SyncTask> = tasks
                    .iter()
                    .filter(|t| t.delete_on_phase_completion())
                    .cloned()
                    .collect();
                self.set_running_phase(&deleting, true);
            }
        }
    }

    /// Stop the operation, deleting hooks that are still running
    pub async fn terminate(&mut self) {
        debug!("Terminating");
        let mut successful = true;
        let (mut tasks, _) = self.get_sync_tasks().await;

        for index in 0..tasks.len() {
            if !tasks[index].is_hook() || tasks[index].live().is_none() {
                continue;
            }
            if let Err(e) = self.remove_hook_finalizer(&mut tasks[index]).await {
                let status = tasks[index].sync_status;
                self.set_resource_result(
                    &mut tasks[index],
                    status,
                    Some(OperationPhase::Error),
                    &format!("Failed to remove hook finalizer: {}", e),
                );
                successful = false;
                continue;
            }

            let Some(live) = tasks[index].live().cloned() else {
                continue;
            };
            let (phase, message) = match self.operation_phase_of(&live) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.set_operation_phase(
                        OperationPhase::Error,
                        format!("Failed to get hook health: {}", e),
                    );
                    return;
                }
            };

            let status = tasks[index].sync_status;
            if phase != OperationPhase::Running {
                self.set_resource_result(&mut tasks[index], status, Some(phase), &message);
                continue;
            }
            match self.delete_resource(&tasks[index]).await {
                Err(e) if !e.is_not_found() => {
                    self.set_resource_result(
                        &mut tasks[index],
                        status,
                        Some(OperationPhase::Failed),
                        &format!("Failed to delete: {}", e),
                    );
                    successful = false;
                }
                _ => self.set_resource_result(
                    &mut tasks[index],
                    status,
                    Some(OperationPhase::Failed),
                    "Deleted",
                ),
            }
        }

        if successful {
            self.set_operation_phase(OperationPhase::Failed, "Operation terminated");
        } else {
            self.set_operation_phase(OperationPhase::Error, "Operation termination had errors");
        }
    }

    /// Build the ordered task list; `false` when a task cannot be synced at all
    async fn get_sync_tasks(&mut self) -> (Vec<SyncTask>, bool) {
        let mut tasks = Vec::new();
        for (target, live) in self.resources.pairs() {
            if !self.contains_resource(target, live) {
                if let Some(obj) = target.or(live) {
                    debug!(resource = %obj, "Skipping");
                }
                continue;
            }
            let Some(obj) = target.or(live) else {
                continue;
            };
            if hook::is_hook(obj) {
                debug!(resource = %obj, "Skipping hook");
                continue;
            }
            for phase in hook::sync_phases(obj) {
                if let Some(task) = SyncTask::from_pair(phase, target.cloned(), live.cloned()) {
                    tasks.push(task);
                }
            }
        }
        debug!(tasks = %describe(&tasks), "Tasks from managed resources");

        if !self.options.skip_hooks {
            let mut hook_tasks = Vec::new();
            for obj in &self.resources.hooks {
                for phase in hook::sync_phases(obj) {
                    let mut target = obj.clone();
                    if target.name().is_empty() {
                        target.set_name(&self.hook_name(obj, phase));
                    }
                    hook_tasks.push(SyncTask::new(phase, target, None));
                }
            }
            debug!(tasks = %describe(&hook_tasks), "Tasks from hooks");
            tasks.extend(hook_tasks);
        }

        // cluster-scoped targets get the namespace too, so nothing lands in
        // another namespace by accident
        for task in tasks.iter_mut() {
            if let Some(target) = task.target_mut() {
                if target.namespace().is_empty() {
                    target.set_namespace(&self.options.namespace);
                }
            }
        }

        if self.options.namespace_modifier.is_some() && !self.options.namespace.is_empty() {
            self.auto_create_namespace(&mut tasks).await;
        }

        for task in tasks.iter_mut() {
            if task.live().is_some() {
                continue;
            }
            let live = task.target().and_then(|target| self.live_object(target));
            if let Some(live) = live {
                task.set_live(live);
            }
        }

        for task in tasks.iter_mut().filter(|t| t.is_hook()) {
            let deleting = task.live().is_some_and(Resource::is_being_deleted);
            if let Some(target) = task.target_mut() {
                let mut finalizers = target.finalizers();
                if deleting {
                    finalizers.retain(|f| f != HOOK_FINALIZER);
                } else if !finalizers.iter().any(|f| f == HOOK_FINALIZER) {
                    finalizers.push(HOOK_FINALIZER.to_string());
                }
                target.set_finalizers(finalizers);
            }
        }

        let mut valid = true;
        let mut server_resources: HashMap<GroupVersionKind, ServerResource> = HashMap::new();
        for index in 0..tasks.len() {
            let gvk = tasks[index].group_version_kind();
            let discovered = match server_resources.get(&gvk) {
                Some(found) => Ok(found.clone()),
                None => self.discover(&gvk).await,
            };
            match discovered {
                Ok(server_resource) => {
                    let permitted = self
                        .permission_validator
                        .validate(tasks[index].obj(), &server_resource);
                    server_resources.insert(gvk, server_resource);
                    if let Err(e) = permitted {
                        self.set_resource_result(
                            &mut tasks[index],
                            Some(ResultCode::SyncFailed),
                            None,
                            &e.to_string(),
                        );
                        valid = false;
                    }
                }
                Err(e) if e.is_not_found() && self.skip_dry_run_on_missing(&tasks[index]) => {
                    debug!(task = %tasks[index], "Skip dry-run for custom resource");
                    tasks[index].skip_dry_run = true;
                }
                Err(e) => {
                    self.set_resource_result(
                        &mut tasks[index],
                        Some(ResultCode::SyncFailed),
                        None,
                        &e.to_string(),
                    );
                    valid = false;
                }
            }
        }

        reverse_prune_waves(&mut tasks);

        let last_wave = prune_last_wave(&tasks);
        for task in tasks.iter_mut().filter(|t| t.is_prune()) {
            if self.options.prune_last || task.obj().has_sync_option(sync_option::PRUNE_LAST) {
                task.wave_override = Some(last_wave);
            }
        }

        sort_tasks(&mut tasks);
        self.load_results(&mut tasks);
        (tasks, valid)
    }

    fn contains_resource(&self, target: Option<&Resource>, live: Option<&Resource>) -> bool {
        self.options
            .resource_filter
            .as_ref()
            .is_none_or(|filter| filter(target, live))
    }

    /// `<generateName><revision[..7]>-<phase>-<unix start>`, lowercased
    fn hook_name(&self, obj: &Resource, phase: SyncPhase) -> String {
        let revision = &self.options.revision;
        let revision: String = if revision.chars().count() >= 8 {
            revision.chars().take(7).collect()
        } else {
            revision.clone()
        };
        let postfix = format!("{}-{}-{}", revision, phase, self.started_at.timestamp());
        format!("{}{}", obj.generate_name(), postfix.to_lowercase())
    }

    /// Live object of a target; cluster-scoped live objects have no namespace
    fn live_object(&self, target: &Resource) -> Option<Resource> {
        self.resources.pairs().find_map(|(t, live)| {
            let key = t.or(live)?.resource_key();
            let matches = key.group == target.group()
                && key.kind == target.kind()
                && (key.namespace.is_empty() || key.namespace == target.namespace())
                && key.name == target.name();
            if matches { live.cloned() } else { None }
        })
    }

    fn has_crd_of_group_kind(&self, group: &str, kind: &str) -> bool {
        self.resources
            .target
            .iter()
            .flatten()
            .any(|target| crd_group_kind(target) == Some((group, kind)))
    }

    fn skip_dry_run_on_missing(&self, task: &SyncTask) -> bool {
        self.options.skip_dry_run_on_missing_resource
            || task.target().is_some_and(|target| {
                target.has_sync_option(sync_option::SKIP_DRY_RUN_ON_MISSING_RESOURCE)
            })
            || self.has_crd_of_group_kind(task.group(), task.kind())
    }

    async fn discover(&self, gvk: &GroupVersionKind) -> Result<ServerResource> {
        let mut attempt = 1;
        loop {
            match self.client.discover_resource_type(gvk, "get").await {
                Err(e) if e.is_unauthorized() && attempt < RETRY_ATTEMPTS => {
                    debug!(%gvk, attempt, "Retrying unauthorized discovery");
                    sleep(RETRY_INTERVAL).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn auto_create_namespace(&mut self, tasks: &mut Vec<SyncTask>) {
        let namespace = self.options.namespace.clone();
        let declared = self
            .resources
            .hooks
            .iter()
            .chain(self.resources.target.iter().flatten())
            .any(|resource| is_namespace_with_name(resource, &namespace));
        if declared {
            return;
        }

        let managed = match Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": namespace},
        })) {
            Ok(managed) => managed,
            Err(e) => {
                self.set_operation_phase(
                    OperationPhase::Failed,
                    format!("namespace auto creation failed: {}", e),
                );
                return;
            }
        };

        match self
            .client
            .get(&managed.group_version_kind(), "", &namespace)
            .await
        {
            Ok(live) => {
                let task = SyncTask::new(SyncPhase::PreSync, managed, Some(live));
                if !self.results.contains_key(&task.result_key()) {
                    info!(%namespace, "Namespace already exists");
                }
                self.append_namespace_task(tasks, task);
            }
            Err(e) if e.is_not_found() => {
                self.append_namespace_task(tasks, SyncTask::new(SyncPhase::PreSync, managed, None));
            }
            Err(e) => self.append_failed_namespace_task(
                tasks,
                managed,
                format!("namespace auto creation failed: {}", e),
            ),
        }
    }

    fn append_namespace_task(&mut self, tasks: &mut Vec<SyncTask>, mut task: SyncTask) {
        let Some(modifier) = self.options.namespace_modifier.clone() else {
            return;
        };
        let live = task.live().cloned();
        let result_key = task.result_key();
        let Some(target) = task.target_mut() else {
            return;
        };
        match modifier(target, live.as_ref()) {
            Ok(true) => tasks.push(task),
            // keep reporting a namespace this operation already created
            Ok(false) if self.results.contains_key(&result_key) => tasks.push(task),
            Ok(false) => {}
            Err(e) => {
                let target = target.clone();
                self.append_failed_namespace_task(
                    tasks,
                    target,
                    format!("namespaceModifier error: {}", e),
                );
            }
        }
    }

    fn append_failed_namespace_task(
        &mut self,
        tasks: &mut Vec<SyncTask>,
        target: Resource,
        message: String,
    ) {
        let mut task = SyncTask::new(SyncPhase::PreSync, target, None);
        self.set_resource_result(
            &mut task,
            Some(ResultCode::SyncFailed),
            Some(OperationPhase::Error),
            &message,
        );
        tasks.push(task);
    }

    /// The not yet existing namespace of the operation, created ahead of validation
    fn namespace_creation_task(&self, tasks: &[SyncTask]) -> Option<usize> {
        if self.options.namespace.is_empty() {
            return None;
        }
        tasks.iter().position(|task| {
            task.live().is_none()
                && task
                    .target()
                    .is_some_and(|target| is_namespace_with_name(target, &self.options.namespace))
        })
    }

    fn filter_out_of_sync(&self, tasks: Vec<SyncTask>) -> Vec<SyncTask> {
        tasks
            .into_iter()
            .filter(|task| {
                if task.is_hook() || task.target().is_none() || task.live().is_none() {
                    return true;
                }
                let key = task.resource_key();
                match self.options.modification_results.get(&key) {
                    Some(false) => {
                        debug!(%key, "Skipping as resource was not modified");
                        false
                    }
                    _ => true,
                }
            })
            .collect()
    }

    fn load_results(&self, tasks: &mut [SyncTask]) {
        for task in tasks.iter_mut() {
            if let Some(result) = self.results.get(&task.result_key()) {
                task.sync_status = result.status;
                task.operation_state = result.hook_phase;
                task.message = result.message.clone();
            }
        }
    }

    /// Re-evaluate tasks left running by an earlier pass
    fn update_running_tasks(&mut self, tasks: &mut [SyncTask]) {
        for task in tasks.iter_mut() {
            if !task.running() {
                continue;
            }
            let Some(live) = task.live().cloned() else {
                continue;
            };
            let status = task.sync_status;

            if task.is_hook() {
                match self.operation_phase_of(&live) {
                    Ok((phase, message)) => {
                        self.set_resource_result(task, status, Some(phase), &message)
                    }
                    Err(e) => self.set_resource_result(
                        task,
                        status,
                        Some(OperationPhase::Error),
                        &format!("failed to get resource health: {}", e),
                    ),
                }
                continue;
            }

            match self.resource_health(&live) {
                Ok(None) => {
                    let message = task.message.clone();
                    self.set_resource_result(
                        task,
                        status,
                        Some(OperationPhase::Succeeded),
                        &message,
                    );
                }
                Ok(Some(health)) => {
                    debug!(task = %task, health = %health.status, "Updating health of running task");
                    match health.status {
                        HealthStatusCode::Healthy => self.set_resource_result(
                            task,
                            status,
                            Some(OperationPhase::Succeeded),
                            &health.message,
                        ),
                        HealthStatusCode::Degraded => self.set_resource_result(
                            task,
                            status,
                            Some(OperationPhase::Failed),
                            &health.message,
                        ),
                        _ => {}
                    }
                }
                Err(e) => debug!(task = %task, error = %e, "Failed to get resource health"),
            }
        }
    }

    fn resource_health(&self, live: &Resource) -> Result<Option<HealthStatus>> {
        if let Some(health_override) = &self.options.health_override {
            if let Some(health) = health_override.evaluate(live)? {
                return Ok(Some(health));
            }
        }
        StandardHealthEvaluator.evaluate(live)
    }

    /// Phase of a hook judged by the health of its live object
    fn operation_phase_of(&self, live: &Resource) -> Result<(OperationPhase, String)> {
        let Some(health) = self.resource_health(live)? else {
            return Ok((
                OperationPhase::Succeeded,
                format!("{} created", live.name()),
            ));
        };
        let phase = match health.status {
            HealthStatusCode::Unknown | HealthStatusCode::Degraded => OperationPhase::Failed,
            HealthStatusCode::Progressing | HealthStatusCode::Suspended => {
                OperationPhase::Running
            }
            HealthStatusCode::Healthy => OperationPhase::Succeeded,
        };
        Ok((phase, health.message))
    }

    /// Run prunes, hook deletions and applies of `tasks` in that order
    async fn run_tasks(&mut self, tasks: &mut [SyncTask], dry_run: bool) -> RunState {
        let dry_run = dry_run || self.options.dry_run;
        debug!(tasks = tasks.len(), dry_run, "Running tasks");
        let mut state = RunState::Successful;

        let (prune_indices, create_indices): (Vec<usize>, Vec<usize>) =
            (0..tasks.len()).partition(|&i| tasks[i].is_prune());

        let view: &[SyncTask] = &*tasks;
        let outcomes = join_all(
            prune_indices
                .iter()
                .map(|&i| self.prune_object(&view[i], dry_run)),
        )
        .await;
        for (&i, (code, message)) in prune_indices.iter().zip(outcomes) {
            if code == ResultCode::SyncFailed {
                state = state.combine(RunState::Failed);
                warn!(task = %tasks[i], %message, "Pruning failed");
            }
            if !dry_run || self.options.dry_run || code == ResultCode::SyncFailed {
                self.set_resource_result(
                    &mut tasks[i],
                    Some(code),
                    Some(code.operation_phase()),
                    &message,
                );
            }
        }
        if state != RunState::Successful {
            return state;
        }

        let deletions: Vec<usize> = create_indices
            .iter()
            .copied()
            .filter(|&i| tasks[i].delete_before_creation())
            .collect();
        if !deletions.is_empty() && !dry_run {
            let view: &[SyncTask] = &*tasks;
            let outcomes = join_all(
                deletions
                    .iter()
                    .map(|&i| self.delete_before_creation(&view[i])),
            )
            .await;
            for (&i, outcome) in deletions.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => state = state.combine(RunState::Pending),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        state = state.combine(RunState::Failed);
                        let status = tasks[i].sync_status;
                        self.set_resource_result(
                            &mut tasks[i],
                            status,
                            Some(OperationPhase::Error),
                            &format!("failed to delete resource: {}", e),
                        );
                    }
                }
            }
        }
        if state != RunState::Successful {
            return state;
        }

        let mut start = 0;
        while start < create_indices.len() {
            let kind = tasks[create_indices[start]].kind().to_string();
            let mut end = start + 1;
            while end < create_indices.len() && tasks[create_indices[end]].kind() == kind {
                end += 1;
            }
            state = self
                .process_create_tasks(state, tasks, &create_indices[start..end], dry_run)
                .await;
            start = end;
        }
        state
    }

    /// Apply one batch of same-kind tasks concurrently
    async fn process_create_tasks(
        &mut self,
        state: RunState,
        tasks: &mut [SyncTask],
        batch: &[usize],
        dry_run: bool,
    ) -> RunState {
        let selected: Vec<usize> = batch
            .iter()
            .copied()
            .filter(|&i| !(dry_run && tasks[i].skip_dry_run))
            .collect();

        let view: &[SyncTask] = &*tasks;
        let outcomes = join_all(
            selected
                .iter()
                .map(|&i| self.apply_object(&view[i], dry_run)),
        )
        .await;

        let mut state = state;
        for (&i, (code, message)) in selected.iter().zip(outcomes) {
            if code == ResultCode::SyncFailed {
                state = state.combine(RunState::Failed);
                warn!(task = %tasks[i], %message, dry_run, "Apply failed");
            }
            if !dry_run || self.options.dry_run || code == ResultCode::SyncFailed {
                let mut phase = code.operation_phase();
                // nothing gets created in an operation-wide dry run
                if self.options.dry_run && phase == OperationPhase::Running {
                    phase = OperationPhase::Succeeded;
                }
                self.set_resource_result(&mut tasks[i], Some(code), Some(phase), &message);
            }
        }
        state
    }

    async fn prune_object(&self, task: &SyncTask, dry_run: bool) -> (ResultCode, String) {
        let live = task.obj();
        debug!(task = %task, dry_run, "Pruning");
        if !self.options.prune {
            return (ResultCode::PruneSkipped, "ignored (requires pruning)".to_string());
        }
        if live.has_sync_option(sync_option::PRUNE_DISABLED) {
            return (ResultCode::PruneSkipped, "ignored (no prune)".to_string());
        }
        if dry_run {
            return (ResultCode::Pruned, "pruned (dry run)".to_string());
        }
        // deleting again would only bump the object while it waits for finalizers
        if !live.is_being_deleted() {
            if let Err(e) = self.delete_resource(task).await {
                return (ResultCode::SyncFailed, e.to_string());
            }
        }
        (ResultCode::Pruned, "pruned".to_string())
    }

    async fn delete_before_creation(&self, task: &SyncTask) -> Result<()> {
        debug!(task = %task, "Deleting");
        let mut task = task.clone();
        self.remove_hook_finalizer(&mut task).await?;
        self.delete_resource(&task).await
    }

    fn use_server_side_apply(&self, target: &Resource, dry_run: bool) -> bool {
        if dry_run {
            return false;
        }
        self.options.server_side_apply || target.has_sync_option(sync_option::SERVER_SIDE_APPLY)
    }

    async fn apply_object(&self, task: &SyncTask, dry_run: bool) -> (ResultCode, String) {
        debug!(task = %task, dry_run, "Applying");
        let Some(target) = task.target() else {
            return (
                ResultCode::SyncFailed,
                format!("{} has no desired state to apply", task.resource_key()),
            );
        };

        let replace = self.options.replace || target.has_sync_option(sync_option::REPLACE);
        let server_side = self.use_server_side_apply(target, dry_run);
        let options = ApplyOptions {
            dry_run,
            force: self.options.force || target.has_sync_option(sync_option::FORCE),
            validate: self.options.validate
                && !target.has_sync_option(sync_option::VALIDATE_DISABLED),
            server_side,
            manager: self.options.server_side_apply_manager.clone(),
        };

        if server_side {
            if let Some(manager) = &self.options.client_side_apply_migration_manager {
                if let Err(e) = self.migrate_client_side_apply(task, target, manager).await {
                    return (
                        ResultCode::SyncFailed,
                        format!("failed to perform client-side apply migration: {}", e),
                    );
                }
            }
        }

        let outcome = if replace {
            match task.live() {
                // replacing these would delete everything they contain
                Some(live) if is_crd(target) || is_namespace_kind(target) => {
                    let mut update = target.clone();
                    update.set_resource_version(live.resource_version());
                    match self.client.update(&update, dry_run).await {
                        Ok(_) => Ok(format!("{}/{} updated", target.kind(), target.name())),
                        Err(e) => Err(format!("error when updating: {}", e)),
                    }
                }
                Some(_) => self
                    .client
                    .replace(target, &options)
                    .await
                    .map_err(|e| e.to_string()),
                None => self
                    .client
                    .create(target, &options)
                    .await
                    .map_err(|e| e.to_string()),
            }
        } else {
            self.client
                .apply(target, &options)
                .await
                .map_err(|e| e.to_string())
        };

        match outcome {
            Err(message) => (ResultCode::SyncFailed, message),
            Ok(message) => {
                if is_crd(target) && !dry_run {
                    if let Err(e) = crd::wait_for_established(
                        self.client.as_ref(),
                        target.name(),
                        CRD_POLL_INTERVAL,
                        CRD_READINESS_TIMEOUT,
                    )
                    .await
                    {
                        error!(crd = target.name(), error = %e, "Failed to ensure that CRD is ready");
                    }
                }
                (ResultCode::Synced, message)
            }
        }
    }

    /// Apply once as the legacy manager while it still owns fields of the live object
    async fn migrate_client_side_apply(
        &self,
        task: &SyncTask,
        target: &Resource,
        manager: &str,
    ) -> Result<()> {
        let owned = task.live().is_some_and(|live| {
            live.managed_fields()
                .iter()
                .any(|entry| entry.manager == manager && entry.operation == "Update")
        });
        if !owned {
            return Ok(());
        }
        debug!(task = %task, %manager, "Migrating client-side apply field ownership");
        let options = ApplyOptions {
            server_side: false,
            manager: manager.to_string(),
            ..ApplyOptions::default()
        };
        self.client.apply(target, &options).await.map(|_| ())
    }

    async fn delete_resource(&self, task: &SyncTask) -> Result<()> {
        debug!(task = %task, "Deleting resource");
        let options = DeleteOptions {
            propagation: self.options.prune_propagation_policy,
        };
        self.client
            .delete(
                &task.group_version_kind(),
                task.namespace(),
                task.name(),
                &options,
            )
            .await
    }

    async fn delete_hooks(&mut self, hooks: &[SyncTask]) {
        for task in hooks {
            if task.obj().has_sync_option(sync_option::DELETE_DISABLED) {
                continue;
            }
            if let Err(e) = self.delete_resource(task).await {
                if !e.is_not_found() {
                    let mut task = task.clone();
                    let status = task.sync_status;
                    self.set_resource_result(
                        &mut task,
                        status,
                        Some(OperationPhase::Error),
                        &format!("failed to delete resource: {}", e),
                    );
                }
            }
        }
    }

    /// Strip the hook finalizer from the live object, retrying on conflicts
    async fn remove_hook_finalizer(&self, task: &mut SyncTask) -> Result<()> {
        let Some(mut live) = task.live().cloned() else {
            return Ok(());
        };

        let mut attempt = 1;
        loop {
            if !live.has_finalizer(HOOK_FINALIZER) {
                return Ok(());
            }
            let mut updated = live.clone();
            updated.set_finalizers(
                live.finalizers()
                    .into_iter()
                    .filter(|f| f != HOOK_FINALIZER)
                    .collect(),
            );

            match self.client.update(&updated, false).await {
                Ok(_) => {
                    task.set_live(updated);
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    debug!(task = %task, "Resource is already deleted");
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempt < RETRY_ATTEMPTS => {
                    debug!(task = %task, attempt, "Retrying hook finalizer removal due to conflict on update");
                    attempt += 1;
                    sleep(RETRY_INTERVAL).await;
                    match self
                        .client
                        .get(&live.group_version_kind(), live.namespace(), live.name())
                        .await
                    {
                        Ok(latest) => live = latest,
                        Err(e) if e.is_not_found() => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail the operation once the `SyncFail` hooks completed, starting them if needed
    async fn set_operation_failed(
        &mut self,
        sync_fail_tasks: &[SyncTask],
        sync_failed_tasks: &[SyncTask],
        message: &str,
    ) {
        let mut message = message.to_string();
        if !sync_failed_tasks.is_empty() {
            let reasons: Vec<&str> = sync_failed_tasks
                .iter()
                .map(|t| t.message.as_str())
                .collect();
            message = format!("{}, reason: {}", message, reasons.join(","));
        }

        if sync_fail_tasks.is_empty() || sync_fail_tasks.iter().all(SyncTask::completed) {
            self.set_operation_phase(OperationPhase::Failed, message);
            return;
        }

        // the phase stays as it is so the caller syncs again
        debug!(tasks = %describe(sync_fail_tasks), "Running sync fail tasks");
        let mut sync_fail_tasks = sync_fail_tasks.to_vec();
        if self.run_tasks(&mut sync_fail_tasks, false).await == RunState::Failed {
            self.set_operation_phase(OperationPhase::Failed, message);
        }
    }

    fn set_running_phase(&mut self, tasks: &[SyncTask], pending_deletion: bool) {
        let first_hook = tasks.iter().find(|t| t.is_hook());
        let Some(first) = first_hook.or_else(|| tasks.first()) else {
            return;
        };
        let (mut reason, task_type) = if first_hook.is_some() {
            ("completion of hook", "hooks")
        } else {
            ("healthy state of", "resources")
        };
        if pending_deletion {
            reason = "deletion of";
        }

        let more = tasks.len() - 1;
        let suffix = if more > 0 {
            format!(" and {} more {}", more, task_type)
        } else {
            String::new()
        };
        let message = format!(
            "waiting for {} {}/{}/{}{}",
            reason,
            first.group(),
            first.kind(),
            first.name(),
            suffix
        );
        self.set_operation_phase(OperationPhase::Running, message);
    }

    fn set_operation_phase(&mut self, phase: OperationPhase, message: impl Into<String>) {
        let message = message.into();
        if self.phase != phase || self.message != message {
            info!(
                from = %self.phase,
                to = %phase,
                old_message = %self.message,
                new_message = %message,
                "Updating operation state"
            );
        }
        self.phase = phase;
        self.message = message;
    }

    /// Record a task outcome; an empty message keeps the previous one
    fn set_resource_result(
        &mut self,
        task: &mut SyncTask,
        status: Option<ResultCode>,
        phase: Option<OperationPhase>,
        message: &str,
    ) {
        task.sync_status = status;
        task.operation_state = phase;
        if !message.is_empty() {
            task.message = message.to_string();
        }

        match self.results.entry(task.result_key()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get_mut();
                if existing.status != status
                    || existing.hook_phase != phase
                    || existing.message != task.message
                {
                    info!(
                        resource = %existing.resource_key,
                        sync_phase = %task.phase,
                        status = ?status,
                        hook_phase = ?phase,
                        message = %task.message,
                        "Updating resource result"
                    );
                    existing.status = status;
                    existing.hook_phase = phase;
                    existing.message = task.message.clone();
                }
            }
            Entry::Vacant(entry) => {
                let result = ResourceSyncResult {
                    resource_key: task.resource_key(),
                    version: task.group_version_kind().version,
                    order: entry.index() + 1,
                    status,
                    message: task.message.clone(),
                    hook_type: task.hook_type(),
                    hook_phase: phase,
                    sync_phase: task.phase,
                };
                info!(
                    resource = %result.resource_key,
                    sync_phase = %task.phase,
                    status = ?status,
                    hook_phase = ?phase,
                    message = %task.message,
                    "Adding resource result"
                );
                entry.insert(result);
            }
        }
    }
}

fn describe(tasks: &[SyncTask]) -> String {
    tasks
        .iter()
        .map(SyncTask::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCluster, MockOperation};
    use crate::reconcile::reconcile;
    use converge_core::annotations::argocd;

    fn resource(yaml: &str) -> Resource {
        Resource::from_yaml(yaml).unwrap()
    }

    fn pod(name: &str) -> Resource {
        resource(&format!(
            r#"
apiVersion: v1
kind: Pod
metadata:
  name: {name}
  namespace: apps
spec:
  containers:
    - name: main
      image: nginx
"#
        ))
    }

    fn context(cluster: &MockCluster, targets: Vec<Resource>, options: SyncOptions) -> SyncContext {
        let result = reconcile(targets, cluster.live_by_key(), "apps", cluster);
        let options = SyncOptions {
            namespace: "apps".to_string(),
            health_override: Some(Arc::new(cluster.clone())),
            ..options
        };
        SyncContext::new(Arc::new(cluster.clone()), result, options)
    }

    #[tokio::test]
    async fn test_hook_name_from_generate_name() {
        let cluster = MockCluster::new();
        let options = SyncOptions {
            revision: "ABCDEF0123456".to_string(),
            started_at: DateTime::from_timestamp(1_700_000_000, 0),
            ..Default::default()
        };
        let ctx = context(&cluster, vec![], options);
        let hook = resource(
            r#"
apiVersion: batch/v1
kind: Job
metadata:
  generateName: migrate-
  annotations:
    argocd.argoproj.io/hook: PreSync
"#,
        );
        assert_eq!(
            ctx.hook_name(&hook, SyncPhase::PreSync),
            "migrate-abcdef0-presync-1700000000"
        );
    }

    #[tokio::test]
    async fn test_short_revision_is_kept_whole() {
        let cluster = MockCluster::new();
        let options = SyncOptions {
            revision: "v1".to_string(),
            started_at: DateTime::from_timestamp(42, 0),
            ..Default::default()
        };
        let ctx = context(&cluster, vec![], options);
        let hook = resource(
            r#"
apiVersion: batch/v1
kind: Job
metadata:
  generateName: seed-
"#,
        );
        assert_eq!(ctx.hook_name(&hook, SyncPhase::PostSync), "seed-v1-postsync-42");
    }

    #[tokio::test]
    async fn test_targets_get_operation_namespace() {
        let cluster = MockCluster::new();
        let target = resource(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
"#,
        );
        let mut ctx = context(&cluster, vec![target], SyncOptions::default());
        let (tasks, valid) = ctx.get_sync_tasks().await;
        assert!(valid);
        assert_eq!(tasks[0].namespace(), "apps");
    }

    #[tokio::test]
    async fn test_hook_targets_carry_finalizer() {
        let cluster = MockCluster::new();
        let mut hook = pod("migrate");
        hook.set_annotation(argocd::HOOK, "PreSync,PostSync");
        let mut ctx = context(&cluster, vec![hook], SyncOptions::default());

        let (tasks, _) = ctx.get_sync_tasks().await;
        assert_eq!(tasks.len(), 2);
        for task in &tasks {
            assert!(task.target().unwrap().has_finalizer(HOOK_FINALIZER));
        }
    }

    #[tokio::test]
    async fn test_missing_type_fails_planning() {
        let cluster = MockCluster::new();
        let widget = resource(
            r#"
apiVersion: example.com/v1
kind: Widget
metadata:
  name: w
  namespace: apps
"#,
        );
        cluster.remove_type(widget.group_kind());
        let mut ctx = context(&cluster, vec![widget], SyncOptions::default());

        ctx.sync().await;
        let state = ctx.get_state();
        assert_eq!(state.phase, OperationPhase::Failed);
        assert_eq!(state.message, "one or more synchronization tasks are not valid");
        assert_eq!(state.results[0].status, Some(ResultCode::SyncFailed));
    }

    #[tokio::test]
    async fn test_missing_type_with_crd_in_sync_skips_dry_run() {
        let cluster = MockCluster::new();
        let crd = resource(
            r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  names:
    kind: Widget
"#,
        );
        let widget = resource(
            r#"
apiVersion: example.com/v1
kind: Widget
metadata:
  name: w
  namespace: apps
"#,
        );
        cluster.remove_type(widget.group_kind());
        let mut ctx = context(&cluster, vec![crd, widget], SyncOptions::default());

        let (tasks, valid) = ctx.get_sync_tasks().await;
        assert!(valid);
        let widget_task = tasks.iter().find(|t| t.kind() == "Widget").unwrap();
        assert!(widget_task.skip_dry_run);
    }

    #[tokio::test]
    async fn test_unauthorized_discovery_is_retried() {
        let cluster = MockCluster::new();
        let target = pod("web");
        cluster.unauthorized_discovery(target.group_kind(), 2);
        let mut ctx = context(&cluster, vec![target], SyncOptions::default());

        let (_, valid) = ctx.get_sync_tasks().await;
        assert!(valid);
        assert_eq!(cluster.operation_counts().discoveries, 3);
    }

    #[tokio::test]
    async fn test_permission_denied_fails_planning() {
        let cluster = MockCluster::new();
        let target = resource(
            r#"
apiVersion: v1
kind: Secret
metadata:
  name: token
  namespace: apps
"#,
        );
        cluster.deny(&target.resource_key(), "secrets are off limits");
        let options = SyncOptions {
            permission_validator: Some(Arc::new(cluster.clone())),
            ..Default::default()
        };
        let mut ctx = context(&cluster, vec![target], options);

        ctx.sync().await;
        let state = ctx.get_state();
        assert_eq!(state.phase, OperationPhase::Failed);
        assert_eq!(
            state.results[0].message,
            "permission denied: secrets are off limits"
        );
        assert_eq!(cluster.operation_counts().dry_run_applies, 0);
    }

    #[tokio::test]
    async fn test_prune_last_moves_prune_after_last_wave() {
        let live = resource(
            r#"
apiVersion: v1
kind: Service
metadata:
  name: old
  namespace: apps
"#,
        );
        let cluster = MockCluster::with_resources(vec![live]);
        let mut target = pod("web");
        target.set_annotation(argocd::SYNC_WAVE, "3");
        let options = SyncOptions {
            prune: true,
            prune_last: true,
            ..Default::default()
        };
        let mut ctx = context(&cluster, vec![target], options);

        let (tasks, _) = ctx.get_sync_tasks().await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].kind(), "Service");
        assert_eq!(tasks[1].wave(), 4);
    }

    #[tokio::test]
    async fn test_resource_filter_skips_pairs() {
        let cluster = MockCluster::new();
        let options = SyncOptions {
            resource_filter: Some(Arc::new(|target: Option<&Resource>, _: Option<&Resource>| {
                target.is_some_and(|t| t.name() != "skipped")
            })),
            ..Default::default()
        };
        let mut ctx = context(&cluster, vec![pod("kept"), pod("skipped")], options);

        let (tasks, _) = ctx.get_sync_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name(), "kept");
    }

    #[tokio::test]
    async fn test_running_message_counts_remaining() {
        let cluster = MockCluster::new();
        let mut ctx = context(&cluster, vec![], SyncOptions::default());
        let tasks = vec![
            SyncTask::new(SyncPhase::Sync, pod("a"), None),
            SyncTask::new(SyncPhase::Sync, pod("b"), None),
        ];

        ctx.set_running_phase(&tasks, false);
        assert_eq!(
            ctx.get_state().message,
            "waiting for healthy state of /Pod/a and 1 more resources"
        );

        ctx.set_running_phase(&tasks[..1], true);
        assert_eq!(ctx.get_state().message, "waiting for deletion of /Pod/a");
    }

    #[tokio::test]
    async fn test_result_updates_keep_order() {
        let cluster = MockCluster::new();
        let mut ctx = context(&cluster, vec![], SyncOptions::default());
        let mut first = SyncTask::new(SyncPhase::Sync, pod("a"), None);
        let mut second = SyncTask::new(SyncPhase::Sync, pod("b"), None);

        let synced = Some(ResultCode::Synced);
        ctx.set_resource_result(&mut first, synced, Some(OperationPhase::Running), "created");
        ctx.set_resource_result(&mut second, synced, Some(OperationPhase::Running), "created");
        ctx.set_resource_result(&mut first, synced, Some(OperationPhase::Succeeded), "");

        let results = ctx.get_state().results;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].resource_key.name, "a");
        assert_eq!(results[0].order, 1);
        assert_eq!(results[0].hook_phase, Some(OperationPhase::Succeeded));
        assert_eq!(results[0].message, "created");
        assert_eq!(results[1].order, 2);
        assert_eq!(results[0].version, "v1");
    }

    #[tokio::test]
    async fn test_initial_state_is_resumed() {
        let cluster = MockCluster::new();
        let mut previous = context(&cluster, vec![], SyncOptions::default());
        let mut task = SyncTask::new(SyncPhase::Sync, pod("a"), None);
        previous.set_resource_result(
            &mut task,
            Some(ResultCode::Synced),
            Some(OperationPhase::Running),
            "pod/a created",
        );
        let state = previous.get_state();

        let options = SyncOptions {
            initial_state: Some(state.clone()),
            ..Default::default()
        };
        let resumed = context(&cluster, vec![], options);
        assert_eq!(resumed.get_state(), state);
    }

    #[tokio::test]
    async fn test_operation_failed_appends_reasons() {
        let cluster = MockCluster::new();
        let mut ctx = context(&cluster, vec![], SyncOptions::default());
        let mut a = SyncTask::new(SyncPhase::Sync, pod("a"), None);
        a.message = "quota exceeded".to_string();
        let mut b = SyncTask::new(SyncPhase::Sync, pod("b"), None);
        b.message = "invalid image".to_string();

        ctx.set_operation_failed(&[], &[a, b], "one or more objects failed to apply")
            .await;
        let state = ctx.get_state();
        assert_eq!(state.phase, OperationPhase::Failed);
        assert_eq!(
            state.message,
            "one or more objects failed to apply, reason: quota exceeded,invalid image"
        );
    }

    #[tokio::test]
    async fn test_finalizer_removal_retries_conflicts() {
        let mut live = pod("migrate");
        live.set_finalizers(vec![HOOK_FINALIZER.to_string()]);
        let cluster = MockCluster::with_resources(vec![live.clone()]);
        cluster.conflict_on_update(&live.resource_key(), 2);
        let ctx = context(&cluster, vec![], SyncOptions::default());

        let stored = cluster.object(&live.resource_key()).unwrap();
        let mut task = SyncTask::new(SyncPhase::PreSync, live.clone(), Some(stored));
        ctx.remove_hook_finalizer(&mut task).await.unwrap();

        let stored = cluster.object(&live.resource_key()).unwrap();
        assert!(!stored.has_finalizer(HOOK_FINALIZER));
        assert_eq!(cluster.operation_counts().updates, 3);
    }

    #[tokio::test]
    async fn test_scripted_apply_failure_is_recorded() {
        let cluster = MockCluster::new();
        let target = pod("web");
        cluster.fail_on(MockOperation::Apply, &target.resource_key(), "admission webhook denied");
        let mut ctx = context(&cluster, vec![target], SyncOptions::default());

        ctx.sync().await;
        let state = ctx.get_state();
        assert_eq!(state.phase, OperationPhase::Failed);
        assert_eq!(
            state.message,
            "one or more objects failed to apply, reason: admission webhook denied"
        );
    }
}
