//! Sync tasks and their ordering
//!
//! A [`SyncTask`] is one resource in one sync phase. Tasks are rebuilt on every
//! pass over the reconciliation result and only their status survives, through
//! the result store of the sync context.
//!
//! Tasks are ordered by phase, wave, kind priority and name. Two dependency
//! adjustments follow the sort: a Namespace moves in front of the first task
//! placed in it, and a CustomResourceDefinition moves in front of the first
//! custom resource of its kind. A moved dependency takes over the phase and
//! wave of that first dependent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use converge_core::annotations::parse_sync_wave;
use converge_core::hook::{self, HookDeletePolicy, HookType};
use converge_core::{
    GroupVersionKind, OperationPhase, Resource, ResourceKey, ResultCode, SyncPhase,
};

/// Kinds synced before anything else, in this order
///
/// Kinds missing from the table sort after all of them.
pub const KIND_ORDER: [&str; 35] = [
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "SecretList",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleList",
    "ClusterRoleBinding",
    "ClusterRoleBindingList",
    "Role",
    "RoleList",
    "RoleBinding",
    "RoleBindingList",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";
const NAMESPACE_KIND: &str = "Namespace";

/// Priority of a kind; known kinds are negative so unknown ones (0) come last
pub fn kind_order(kind: &str) -> i32 {
    KIND_ORDER
        .iter()
        .position(|k| *k == kind)
        .map(|index| index as i32 - KIND_ORDER.len() as i32)
        .unwrap_or(0)
}

pub(crate) fn is_crd(resource: &Resource) -> bool {
    resource.group() == CRD_GROUP && resource.kind() == CRD_KIND
}

pub(crate) fn is_namespace_kind(resource: &Resource) -> bool {
    resource.group().is_empty() && resource.kind() == NAMESPACE_KIND
}

pub(crate) fn is_namespace_with_name(resource: &Resource, name: &str) -> bool {
    is_namespace_kind(resource) && resource.name() == name
}

/// `spec.group` and `spec.names.kind` of a CRD
pub(crate) fn crd_group_kind(resource: &Resource) -> Option<(&str, &str)> {
    if !is_crd(resource) {
        return None;
    }
    let group = resource.nested_str(&["spec", "group"])?;
    let kind = resource.nested_str(&["spec", "names", "kind"])?;
    Some((group, kind))
}

#[derive(Debug, Clone)]
enum Objects {
    Target {
        target: Resource,
        live: Option<Resource>,
    },
    Prune {
        live: Resource,
    },
}

/// One resource to sync in one phase
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub phase: SyncPhase,
    objects: Objects,
    /// Skip this task during the validation dry-run
    pub skip_dry_run: bool,
    pub sync_status: Option<ResultCode>,
    pub operation_state: Option<OperationPhase>,
    pub message: String,
    /// Wave assigned by planning, taking precedence over annotations
    pub wave_override: Option<i32>,
}

impl SyncTask {
    /// A task that creates or updates `target`
    pub fn new(phase: SyncPhase, target: Resource, live: Option<Resource>) -> Self {
        Self::with_objects(phase, Objects::Target { target, live })
    }

    /// A task that deletes `live`
    pub fn prune(phase: SyncPhase, live: Resource) -> Self {
        Self::with_objects(phase, Objects::Prune { live })
    }

    /// A task for a reconciled pair; `None` when both sides are absent
    pub fn from_pair(
        phase: SyncPhase,
        target: Option<Resource>,
        live: Option<Resource>,
    ) -> Option<Self> {
        match (target, live) {
            (Some(target), live) => Some(Self::new(phase, target, live)),
            (None, Some(live)) => Some(Self::prune(phase, live)),
            (None, None) => None,
        }
    }

    fn with_objects(phase: SyncPhase, objects: Objects) -> Self {
        Self {
            phase,
            objects,
            skip_dry_run: false,
            sync_status: None,
            operation_state: None,
            message: String::new(),
            wave_override: None,
        }
    }

    pub fn target(&self) -> Option<&Resource> {
        match &self.objects {
            Objects::Target { target, .. } => Some(target),
            Objects::Prune { .. } => None,
        }
    }

    pub fn target_mut(&mut self) -> Option<&mut Resource> {
        match &mut self.objects {
            Objects::Target { target, .. } => Some(target),
            Objects::Prune { .. } => None,
        }
    }

    pub fn live(&self) -> Option<&Resource> {
        match &self.objects {
            Objects::Target { live, .. } => live.as_ref(),
            Objects::Prune { live } => Some(live),
        }
    }

    /// Attach the live object of a create or update task
    pub fn set_live(&mut self, resource: Resource) {
        match &mut self.objects {
            Objects::Target { live, .. } => *live = Some(resource),
            Objects::Prune { live } => *live = resource,
        }
    }

    /// The target if there is one, else the live object
    pub fn obj(&self) -> &Resource {
        match &self.objects {
            Objects::Target { target, .. } => target,
            Objects::Prune { live } => live,
        }
    }

    pub fn group(&self) -> &str {
        self.obj().group()
    }

    pub fn kind(&self) -> &str {
        self.obj().kind()
    }

    pub fn name(&self) -> &str {
        self.obj().name()
    }

    pub fn namespace(&self) -> &str {
        self.obj().namespace()
    }

    pub fn group_version_kind(&self) -> GroupVersionKind {
        self.obj().group_version_kind()
    }

    pub fn resource_key(&self) -> ResourceKey {
        self.obj().resource_key()
    }

    /// Key of this task's record in the result store
    pub fn result_key(&self) -> String {
        result_key(&self.resource_key(), self.phase)
    }

    pub fn is_prune(&self) -> bool {
        matches!(self.objects, Objects::Prune { .. })
    }

    pub fn is_hook(&self) -> bool {
        hook::is_hook(self.obj())
    }

    pub fn hook_type(&self) -> Option<HookType> {
        self.is_hook().then(|| HookType::from_phase(self.phase))
    }

    pub fn wave(&self) -> i32 {
        self.wave_override
            .unwrap_or_else(|| parse_sync_wave(self.obj()))
    }

    pub fn pending(&self) -> bool {
        self.operation_state.is_none()
    }

    pub fn running(&self) -> bool {
        self.operation_state == Some(OperationPhase::Running)
    }

    pub fn completed(&self) -> bool {
        self.operation_state.is_some_and(OperationPhase::is_completed)
    }

    pub fn successful(&self) -> bool {
        self.operation_state.is_some_and(OperationPhase::is_successful)
    }

    pub fn pruned(&self) -> bool {
        self.sync_status == Some(ResultCode::Pruned)
    }

    /// Delete policies only mean something for hooks
    pub fn has_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        self.is_hook() && hook::has_delete_policy(self.obj(), policy)
    }

    /// An existing hook object that has to go before this task creates it again
    pub fn delete_before_creation(&self) -> bool {
        self.live().is_some()
            && self.pending()
            && self.has_delete_policy(HookDeletePolicy::BeforeHookCreation)
    }

    pub fn delete_on_phase_successful(&self) -> bool {
        self.live().is_some() && self.has_delete_policy(HookDeletePolicy::HookSucceeded)
    }

    pub fn delete_on_phase_failed(&self) -> bool {
        self.live().is_some() && self.has_delete_policy(HookDeletePolicy::HookFailed)
    }

    pub fn delete_on_phase_completion(&self) -> bool {
        self.delete_on_phase_successful() || self.delete_on_phase_failed()
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .sync_status
            .map(|s| s.to_string())
            .unwrap_or_default();
        let state = self
            .operation_state
            .map(|s| s.to_string())
            .unwrap_or_default();
        write!(
            f,
            "{}/{} {} {}/{}:{}/{} {}/{} {}",
            self.phase,
            self.wave(),
            if self.is_hook() { "hook" } else { "resource" },
            self.group(),
            self.kind(),
            self.namespace(),
            self.name(),
            status,
            state,
            self.message
        )
    }
}

/// Key of a result record: the resource key and the phase
pub fn result_key(key: &ResourceKey, phase: SyncPhase) -> String {
    format!("{}:{}", key, phase)
}

/// Queries over an ordered task list
pub trait TaskList {
    /// Phase of the first task
    fn phase(&self) -> Option<SyncPhase>;
    /// Wave of the first task, 0 when empty
    fn wave(&self) -> i32;
    fn last_phase(&self) -> Option<SyncPhase>;
    fn last_wave(&self) -> i32;
    /// Whether the tasks span more than one phase or wave
    fn multi_step(&self) -> bool;
}

impl TaskList for [SyncTask] {
    fn phase(&self) -> Option<SyncPhase> {
        self.first().map(|t| t.phase)
    }

    fn wave(&self) -> i32 {
        self.first().map(SyncTask::wave).unwrap_or(0)
    }

    fn last_phase(&self) -> Option<SyncPhase> {
        self.last().map(|t| t.phase)
    }

    fn last_wave(&self) -> i32 {
        self.last().map(SyncTask::wave).unwrap_or(0)
    }

    fn multi_step(&self) -> bool {
        self.wave() != self.last_wave() || self.phase() != self.last_phase()
    }
}

/// Sort tasks and move dependencies in front of their first dependent
pub fn sort_tasks(tasks: &mut Vec<SyncTask>) {
    tasks.sort_by(|a, b| {
        a.phase
            .cmp(&b.phase)
            .then_with(|| a.wave().cmp(&b.wave()))
            .then_with(|| kind_order(a.kind()).cmp(&kind_order(b.kind())))
            .then_with(|| a.name().cmp(b.name()))
    });

    adjust_dependencies(
        tasks,
        |target| is_namespace_kind(target).then(|| target.name().to_string()),
        |target| {
            let namespace = target.namespace();
            (!namespace.is_empty()).then(|| namespace.to_string())
        },
    );
    adjust_dependencies(
        tasks,
        |target| crd_group_kind(target).map(|(group, kind)| format!("{}/{}", group, kind)),
        |target| Some(format!("{}/{}", target.group(), target.kind())),
    );
}

/// Relocate each dependency before the first earlier task that depends on it
///
/// The first pass finds, for every dependency, the first preceding dependent
/// (its anchor). The second pass rebuilds the list, emitting anchored
/// dependencies in encounter order right before their anchor.
fn adjust_dependencies<D, F>(tasks: &mut Vec<SyncTask>, dependency_key: D, dependent_key: F)
where
    D: Fn(&Resource) -> Option<String>,
    F: Fn(&Resource) -> Option<String>,
{
    let mut first_dependent: HashMap<String, usize> = HashMap::new();
    let mut anchored: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut moved: BTreeSet<usize> = BTreeSet::new();

    for (index, task) in tasks.iter().enumerate() {
        let Some(target) = task.target() else {
            continue;
        };
        if let Some(key) = dependency_key(target) {
            if let Some(&anchor) = first_dependent.get(&key) {
                anchored.entry(anchor).or_default().push(index);
                moved.insert(index);
            }
        } else if let Some(key) = dependent_key(target) {
            first_dependent.entry(key).or_insert(index);
        }
    }

    if moved.is_empty() {
        return;
    }

    for (&anchor, dependencies) in &anchored {
        let wave = tasks[anchor].wave();
        let phase = tasks[anchor].phase;
        for &index in dependencies {
            tasks[index].wave_override = Some(wave);
            tasks[index].phase = phase;
        }
    }

    let mut slots: Vec<Option<SyncTask>> = std::mem::take(tasks).into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for index in 0..slots.len() {
        if moved.contains(&index) {
            continue;
        }
        if let Some(dependencies) = anchored.get(&index) {
            for &dependency in dependencies {
                ordered.extend(slots[dependency].take());
            }
        }
        ordered.extend(slots[index].take());
    }
    *tasks = ordered;
}

/// Reflect the distinct waves of prune tasks so the last created goes first
pub fn reverse_prune_waves(tasks: &mut [SyncTask]) {
    let waves: Vec<i32> = tasks
        .iter()
        .filter(|t| t.is_prune())
        .map(SyncTask::wave)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if waves.len() < 2 {
        return;
    }
    let reflected: HashMap<i32, i32> = waves
        .iter()
        .zip(waves.iter().rev())
        .map(|(from, to)| (*from, *to))
        .collect();
    for task in tasks.iter_mut().filter(|t| t.is_prune()) {
        if let Some(&wave) = reflected.get(&task.wave()) {
            task.wave_override = Some(wave);
        }
    }
}

/// One wave past the highest Sync-phase wave of the non-prune tasks
pub fn prune_last_wave(tasks: &[SyncTask]) -> i32 {
    tasks
        .iter()
        .filter(|t| t.phase == SyncPhase::Sync && !t.is_prune())
        .map(SyncTask::wave)
        .fold(0, i32::max)
        + 1
}

/// Aggregate outcome of a batch of tasks
///
/// Ordered so that combining two states keeps the worse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RunState {
    #[default]
    Successful,
    Pending,
    Failed,
}

impl RunState {
    pub fn combine(self, other: RunState) -> RunState {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::annotations::{argocd, helm};
    use serde_json::json;

    fn resource(api_version: &str, kind: &str, namespace: &str, name: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": name, "namespace": namespace}
        }))
        .unwrap()
    }

    fn with_wave(mut resource: Resource, wave: i32) -> Resource {
        resource.set_annotation(argocd::SYNC_WAVE, &wave.to_string());
        resource
    }

    fn names(tasks: &[SyncTask]) -> Vec<String> {
        tasks
            .iter()
            .map(|t| format!("{}/{}", t.kind(), t.name()))
            .collect()
    }

    fn crd(group: &str, kind: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": format!("{}s.{}", kind.to_lowercase(), group)},
            "spec": {"group": group, "names": {"kind": kind}}
        }))
        .unwrap()
    }

    #[test]
    fn test_kind_order() {
        assert_eq!(kind_order("Namespace"), -35);
        assert_eq!(kind_order("APIService"), -1);
        assert_eq!(kind_order("Widget"), 0);
        assert!(kind_order("Secret") < kind_order("Deployment"));
    }

    #[test]
    fn test_sort_by_phase_wave_kind_name() {
        let mut tasks = vec![
            SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "ns", "b"), None),
            SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "ns", "a"), None),
            SyncTask::new(SyncPhase::Sync, resource("v1", "ConfigMap", "ns", "z"), None),
            SyncTask::new(
                SyncPhase::Sync,
                with_wave(resource("v1", "ConfigMap", "ns", "late"), 1),
                None,
            ),
            SyncTask::new(SyncPhase::PreSync, resource("example.com/v1", "Widget", "ns", "w"), None),
            SyncTask::new(
                SyncPhase::Sync,
                with_wave(resource("v1", "Service", "ns", "early"), -1),
                None,
            ),
        ];
        sort_tasks(&mut tasks);

        assert_eq!(
            names(&tasks),
            vec![
                "Widget/w",
                "Service/early",
                "ConfigMap/z",
                "Pod/a",
                "Pod/b",
                "ConfigMap/late"
            ]
        );
    }

    #[test]
    fn test_namespace_moves_before_first_dependent() {
        let mut tasks = vec![
            SyncTask::new(
                SyncPhase::Sync,
                with_wave(resource("v1", "ConfigMap", "apps", "settings"), -1),
                None,
            ),
            SyncTask::new(
                SyncPhase::Sync,
                with_wave(resource("v1", "Namespace", "", "apps"), 2),
                None,
            ),
        ];
        sort_tasks(&mut tasks);

        assert_eq!(names(&tasks), vec!["Namespace/apps", "ConfigMap/settings"]);
        assert_eq!(tasks[0].wave(), -1);
        assert_eq!(tasks[0].phase, SyncPhase::Sync);
    }

    #[test]
    fn test_namespace_inherits_phase_of_dependent() {
        let mut hook = resource("batch/v1", "Job", "apps", "migrate");
        hook.set_annotation(argocd::HOOK, "PreSync");
        let mut tasks = vec![
            SyncTask::new(SyncPhase::PreSync, hook, None),
            SyncTask::new(SyncPhase::Sync, resource("v1", "Namespace", "", "apps"), None),
        ];
        sort_tasks(&mut tasks);

        assert_eq!(names(&tasks), vec!["Namespace/apps", "Job/migrate"]);
        assert_eq!(tasks[0].phase, SyncPhase::PreSync);
    }

    #[test]
    fn test_crd_moves_before_custom_resources() {
        let mut tasks = vec![
            SyncTask::new(SyncPhase::Sync, resource("example.com/v1", "Widget", "", "w"), None),
            SyncTask::new(SyncPhase::Sync, with_wave(crd("example.com", "Widget"), 5), None),
            SyncTask::new(SyncPhase::Sync, resource("v1", "ConfigMap", "", "unrelated"), None),
        ];
        // Widget has wave 0 and the CRD wave 5, so the sort puts the CRD last
        sort_tasks(&mut tasks);

        assert_eq!(
            names(&tasks),
            vec![
                "ConfigMap/unrelated",
                "CustomResourceDefinition/widgets.example.com",
                "Widget/w"
            ]
        );
        assert_eq!(tasks[1].wave(), 0);
    }

    #[test]
    fn test_dependencies_keep_encounter_order() {
        let mut tasks = vec![
            SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "a", "p1"), None),
            SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "b", "p2"), None),
            SyncTask::new(SyncPhase::Sync, with_wave(resource("v1", "Namespace", "", "b"), 1), None),
            SyncTask::new(SyncPhase::Sync, with_wave(resource("v1", "Namespace", "", "a"), 2), None),
        ];
        sort_tasks(&mut tasks);

        assert_eq!(
            names(&tasks),
            vec!["Namespace/a", "Pod/p1", "Namespace/b", "Pod/p2"]
        );
    }

    #[test]
    fn test_prune_waves_are_reflected() {
        let mut tasks = vec![
            SyncTask::prune(SyncPhase::Sync, with_wave(resource("v1", "ConfigMap", "", "a"), 1)),
            SyncTask::prune(SyncPhase::Sync, with_wave(resource("v1", "ConfigMap", "", "b"), 2)),
            SyncTask::prune(SyncPhase::Sync, with_wave(resource("v1", "ConfigMap", "", "c"), 5)),
            SyncTask::new(
                SyncPhase::Sync,
                with_wave(resource("v1", "ConfigMap", "", "kept"), 1),
                None,
            ),
        ];
        reverse_prune_waves(&mut tasks);

        let waves: Vec<i32> = tasks.iter().map(SyncTask::wave).collect();
        assert_eq!(waves, vec![5, 2, 1, 1]);
    }

    #[test]
    fn test_prune_last_wave_ignores_prune_tasks() {
        let tasks = vec![
            SyncTask::new(SyncPhase::Sync, with_wave(resource("v1", "Pod", "", "a"), 3), None),
            SyncTask::prune(SyncPhase::Sync, with_wave(resource("v1", "Pod", "", "b"), 9)),
            SyncTask::new(SyncPhase::PostSync, with_wave(resource("v1", "Pod", "", "c"), 7), None),
        ];
        assert_eq!(prune_last_wave(&tasks), 4);
        assert_eq!(prune_last_wave(&[]), 1);
    }

    #[test]
    fn test_multi_step() {
        let single = vec![SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "", "a"), None)];
        assert!(!single.multi_step());

        let spread = vec![
            SyncTask::new(SyncPhase::Sync, resource("v1", "Pod", "", "a"), None),
            SyncTask::new(SyncPhase::Sync, with_wave(resource("v1", "Pod", "", "b"), 1), None),
        ];
        assert!(spread.multi_step());
        assert_eq!(spread.last_wave(), 1);
    }

    #[test]
    fn test_delete_policies_apply_to_hooks_only() {
        let mut job = resource("batch/v1", "Job", "", "migrate");
        job.set_annotation(helm::HOOK, "pre-install");
        job.set_annotation(helm::HOOK_DELETE_POLICY, "hook-succeeded");

        let task = SyncTask::new(SyncPhase::PreSync, job.clone(), Some(job));
        assert!(task.is_hook());
        assert_eq!(task.hook_type(), Some(HookType::PreSync));
        assert!(task.delete_on_phase_successful());
        assert!(!task.delete_on_phase_failed());
        assert!(!task.delete_before_creation());

        let plain = resource("v1", "Pod", "", "web");
        let task = SyncTask::new(SyncPhase::Sync, plain.clone(), Some(plain));
        assert!(!task.has_delete_policy(HookDeletePolicy::BeforeHookCreation));
        assert_eq!(task.hook_type(), None);
    }

    #[test]
    fn test_default_delete_policy_before_creation() {
        let mut job = resource("batch/v1", "Job", "", "migrate");
        job.set_annotation(argocd::HOOK, "Sync");
        let mut task = SyncTask::new(SyncPhase::Sync, job.clone(), Some(job));
        assert!(task.delete_before_creation());

        task.operation_state = Some(OperationPhase::Running);
        assert!(!task.delete_before_creation());
    }

    #[test]
    fn test_task_state_predicates() {
        let mut task = SyncTask::prune(SyncPhase::Sync, resource("v1", "Service", "ns", "web"));
        assert!(task.is_prune());
        assert!(task.pending());

        task.sync_status = Some(ResultCode::Pruned);
        task.operation_state = Some(OperationPhase::Succeeded);
        assert!(task.pruned());
        assert!(task.completed());
        assert!(task.successful());
        assert_eq!(task.result_key(), "/Service/ns/web:Sync");
    }

    #[test]
    fn test_run_state_combine() {
        use RunState::*;
        assert_eq!(Successful.combine(Pending), Pending);
        assert_eq!(Pending.combine(Failed), Failed);
        assert_eq!(Failed.combine(Successful), Failed);
        assert_eq!(
            [Successful, Pending, Successful]
                .into_iter()
                .fold(RunState::default(), RunState::combine),
            Pending
        );
    }
}
