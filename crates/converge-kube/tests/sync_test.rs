//! End-to-end sync operations against the in-memory cluster

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use converge_core::annotations::argocd;
use converge_core::{
    AnnotationSource, HealthStatusCode, HookType, OperationPhase, Resource, ResourceKey,
    ResultCode, SyncPhase,
};
use converge_kube::{
    MockCluster, MockOperation, ReconciliationResult, SyncContext, SyncOptions, reconcile,
};

const NAMESPACE: &str = "apps";

fn resource(yaml: &str) -> Resource {
    Resource::from_yaml(yaml).unwrap()
}

fn config_map(name: &str) -> Resource {
    resource(&format!(
        r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: {name}
  namespace: apps
data:
  mode: production
"#
    ))
}

fn job_hook(name: &str, hook: &str) -> Resource {
    resource(&format!(
        r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: {name}
  namespace: apps
  annotations:
    argocd.argoproj.io/hook: {hook}
spec:
  template:
    spec:
      restartPolicy: Never
      containers:
        - name: main
          image: busybox
"#
    ))
}

fn with_annotation(mut resource: Resource, key: &str, value: &str) -> Resource {
    resource.set_annotation(key, value);
    resource
}

fn plan(cluster: &MockCluster, targets: &[Resource]) -> ReconciliationResult {
    reconcile(targets.to_vec(), cluster.live_by_key(), NAMESPACE, cluster)
}

fn context(cluster: &MockCluster, targets: &[Resource], options: SyncOptions) -> SyncContext {
    let options = SyncOptions {
        namespace: NAMESPACE.to_string(),
        health_override: Some(Arc::new(cluster.clone())),
        ..options
    };
    SyncContext::new(Arc::new(cluster.clone()), plan(cluster, targets), options)
}

/// Re-read the cluster and run one more pass, as a controller would
async fn resync(ctx: &mut SyncContext, cluster: &MockCluster, targets: &[Resource]) {
    ctx.set_reconciliation(plan(cluster, targets));
    ctx.sync().await;
}

fn result_of<'a>(
    state: &'a converge_kube::OperationState,
    name: &str,
) -> &'a converge_core::ResourceSyncResult {
    state
        .results
        .iter()
        .find(|r| r.resource_key.name == name)
        .unwrap()
}

#[tokio::test]
async fn test_creates_missing_resource() {
    let cluster = MockCluster::new();
    let targets = [config_map("settings")];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.message, "successfully synced (all tasks run)");
    assert_eq!(state.results.len(), 1);
    assert_eq!(state.results[0].status, Some(ResultCode::Synced));
    assert_eq!(state.results[0].sync_phase, SyncPhase::Sync);

    let counts = cluster.operation_counts();
    assert_eq!(counts.dry_run_applies, 1);
    assert_eq!(counts.applies, 1);
    assert!(cluster.object(&targets[0].resource_key()).is_some());
}

#[tokio::test]
async fn test_single_pod() {
    let cluster = MockCluster::new();
    let pod = resource(
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: p
spec:
  containers:
    - name: main
      image: nginx
"#,
    );
    let targets = [pod];
    let result = plan(&cluster, &targets);
    assert_eq!(result.live, vec![None]);
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.message, "successfully synced (all tasks run)");
    assert_eq!(state.results.len(), 1);
    assert_eq!(state.results[0].resource_key.kind, "Pod");
    assert_eq!(state.results[0].resource_key.name, "p");
    assert_eq!(state.results[0].resource_key.namespace, NAMESPACE);
    assert_eq!(state.results[0].status, Some(ResultCode::Synced));
}

#[tokio::test]
async fn test_prunes_resources_no_longer_desired() {
    let stale = resource(
        r#"
apiVersion: v1
kind: Service
metadata:
  name: old
  namespace: apps
"#,
    );
    let cluster = MockCluster::with_resources(vec![stale.clone()]);
    let targets = [config_map("settings")];
    let options = SyncOptions {
        prune: true,
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    let pruned = result_of(&state, "old");
    assert_eq!(pruned.status, Some(ResultCode::Pruned));
    assert_eq!(pruned.message, "pruned");
    assert!(cluster.object(&stale.resource_key()).is_none());
}

#[tokio::test]
async fn test_prune_requires_opt_in() {
    let stale = config_map("old");
    let cluster = MockCluster::with_resources(vec![stale.clone()]);
    let mut ctx = context(&cluster, &[], SyncOptions::default());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    let skipped = result_of(&state, "old");
    assert_eq!(skipped.status, Some(ResultCode::PruneSkipped));
    assert_eq!(skipped.message, "ignored (requires pruning)");
    assert!(cluster.object(&stale.resource_key()).is_some());
}

#[tokio::test]
async fn test_prune_confirmation() {
    let stale = with_annotation(
        resource(
            r#"
apiVersion: v1
kind: Service
metadata:
  name: old
  namespace: apps
"#,
        ),
        argocd::SYNC_OPTIONS,
        "Prune=confirm",
    );
    let cluster = MockCluster::with_resources(vec![stale.clone()]);
    let options = SyncOptions {
        prune: true,
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[], options.clone());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert_eq!(state.message, "waiting for pruning confirmation of v1/Service/old");
    assert!(state.results.is_empty());
    assert_eq!(cluster.operation_counts().deletes, 0);

    let confirmed = SyncOptions {
        prune_confirmed: true,
        initial_state: Some(state),
        ..options
    };
    let mut ctx = context(&cluster, &[], confirmed);
    ctx.sync().await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    assert!(cluster.object(&stale.resource_key()).is_none());
}

#[tokio::test]
async fn test_pre_sync_hook_gates_resources() {
    let cluster = MockCluster::new();
    let hook = with_annotation(
        job_hook("migrate", "PreSync"),
        argocd::HOOK_DELETE_POLICY,
        "HookSucceeded",
    );
    let settings = config_map("settings");
    let targets = [hook.clone(), settings.clone()];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;
    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert!(
        state
            .message
            .starts_with("waiting for completion of hook batch/Job/migrate")
    );
    let created = cluster.object(&hook.resource_key()).unwrap();
    assert!(created.has_finalizer(argocd::HOOK_FINALIZER));
    assert!(cluster.object(&settings.resource_key()).is_none());

    // the job has no completion condition yet
    resync(&mut ctx, &cluster, &targets).await;
    assert_eq!(ctx.get_state().phase, OperationPhase::Running);
    assert!(cluster.object(&settings.resource_key()).is_none());

    cluster.set_health(&hook.resource_key(), HealthStatusCode::Healthy, "Job completed");
    resync(&mut ctx, &cluster, &targets).await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.message, "successfully synced (all tasks run)");
    let hook_result = result_of(&state, "migrate");
    assert_eq!(hook_result.hook_type, Some(HookType::PreSync));
    assert_eq!(hook_result.hook_phase, Some(OperationPhase::Succeeded));
    assert_eq!(hook_result.message, "Job completed");
    assert!(cluster.object(&settings.resource_key()).is_some());
    // HookSucceeded removes the hook once everything synced
    assert!(cluster.object(&hook.resource_key()).is_none());
}

#[tokio::test]
async fn test_failed_hook_fails_operation() {
    let cluster = MockCluster::new();
    let hook = job_hook("migrate", "PreSync");
    let targets = [hook.clone(), config_map("settings")];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;
    cluster.set_health(&hook.resource_key(), HealthStatusCode::Degraded, "BackoffLimitExceeded");
    resync(&mut ctx, &cluster, &targets).await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Failed);
    assert_eq!(
        state.message,
        "one or more synchronization tasks completed unsuccessfully"
    );
    assert_eq!(
        result_of(&state, "migrate").hook_phase,
        Some(OperationPhase::Failed)
    );
    let live = cluster.object(&hook.resource_key()).unwrap();
    assert!(!live.has_finalizer(argocd::HOOK_FINALIZER));
}

#[tokio::test]
async fn test_sync_fail_hooks_run_before_failing() {
    let cluster = MockCluster::new();
    let settings = config_map("settings");
    let notify = job_hook("notify", "SyncFail");
    cluster.fail_on(MockOperation::Apply, &settings.resource_key(), "quota exceeded");
    let targets = [settings.clone(), notify.clone()];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;
    assert_eq!(ctx.get_state().phase, OperationPhase::Running);
    assert!(cluster.object(&notify.resource_key()).is_some());

    resync(&mut ctx, &cluster, &targets).await;
    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert_eq!(state.message, "waiting for completion of hook batch/Job/notify");

    cluster.set_health(&notify.resource_key(), HealthStatusCode::Healthy, "sent");
    resync(&mut ctx, &cluster, &targets).await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Failed);
    assert_eq!(
        state.message,
        "one or more synchronization tasks completed unsuccessfully, reason: quota exceeded"
    );
    assert_eq!(
        result_of(&state, "settings").status,
        Some(ResultCode::SyncFailed)
    );
}

#[tokio::test]
async fn test_terminate_deletes_running_hooks() {
    let cluster = MockCluster::new();
    let hook = job_hook("migrate", "PreSync");
    let targets = [hook.clone(), config_map("settings")];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;
    assert!(cluster.object(&hook.resource_key()).is_some());

    ctx.set_reconciliation(plan(&cluster, &targets));
    ctx.terminate().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Failed);
    assert_eq!(state.message, "Operation terminated");
    let hook_result = result_of(&state, "migrate");
    assert_eq!(hook_result.hook_phase, Some(OperationPhase::Failed));
    assert_eq!(hook_result.message, "Deleted");
    assert!(cluster.object(&hook.resource_key()).is_none());
}

#[tokio::test]
async fn test_dry_run_failure_changes_nothing() {
    let cluster = MockCluster::new();
    let settings = config_map("settings");
    cluster.fail_on(MockOperation::DryRun, &settings.resource_key(), "invalid data");
    let targets = [settings.clone(), config_map("other")];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Failed);
    assert_eq!(state.message, "one or more objects failed to apply (dry run)");
    assert_eq!(state.results.len(), 1);
    assert_eq!(state.results[0].message, "invalid data");
    assert_eq!(cluster.operation_counts().applies, 0);
}

#[tokio::test]
async fn test_operation_dry_run_records_results() {
    let cluster = MockCluster::new();
    let settings = config_map("settings");
    let options = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[settings.clone()], options);

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.message, "successfully synced (no more tasks)");
    assert_eq!(state.results[0].hook_phase, Some(OperationPhase::Succeeded));
    assert!(state.results[0].message.ends_with("(dry run)"));
    assert!(cluster.object(&settings.resource_key()).is_none());
}

#[tokio::test]
async fn test_waves_run_in_order() {
    let cluster = MockCluster::new();
    let first = with_annotation(config_map("first"), argocd::SYNC_WAVE, "-1");
    let second = with_annotation(config_map("second"), argocd::SYNC_WAVE, "5");
    let targets = [second.clone(), first.clone()];

    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorder = calls.clone();
    let options = SyncOptions {
        sync_wave_hook: Some(Arc::new(move |phase: SyncPhase, wave: i32, final_wave: bool| {
            recorder.lock().unwrap().push((phase, wave, final_wave));
            Ok(())
        })),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;
    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert_eq!(state.message, "waiting for healthy state of /ConfigMap/second");
    assert!(cluster.object(&first.resource_key()).is_some());
    assert!(cluster.object(&second.resource_key()).is_none());

    resync(&mut ctx, &cluster, &targets).await;
    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    assert!(cluster.object(&second.resource_key()).is_some());

    assert_eq!(
        *calls.lock().unwrap(),
        vec![(SyncPhase::Sync, -1, false), (SyncPhase::Sync, 5, true)]
    );
}

#[tokio::test]
async fn test_unhealthy_wave_blocks_next() {
    let cluster = MockCluster::new();
    let first = config_map("first");
    let second = with_annotation(config_map("second"), argocd::SYNC_WAVE, "1");
    let targets = [first.clone(), second.clone()];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;
    cluster.set_health(&first.resource_key(), HealthStatusCode::Progressing, "rolling out");
    resync(&mut ctx, &cluster, &targets).await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert_eq!(state.message, "waiting for healthy state of /ConfigMap/first");
    assert!(cluster.object(&second.resource_key()).is_none());

    cluster.set_health(&first.resource_key(), HealthStatusCode::Healthy, "ready");
    resync(&mut ctx, &cluster, &targets).await;
    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    assert!(cluster.object(&second.resource_key()).is_some());
}

#[tokio::test]
async fn test_wave_hook_error() {
    let cluster = MockCluster::new();
    let options = SyncOptions {
        sync_wave_hook: Some(Arc::new(|_: SyncPhase, _: i32, _: bool| {
            Err("quota check failed".to_string())
        })),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[config_map("settings")], options);

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Error);
    assert_eq!(state.message, "SyncWaveHook failed: quota check failed");
}

#[tokio::test]
async fn test_replace_option() {
    let live = config_map("settings");
    let cluster = MockCluster::with_resources(vec![live.clone()]);
    let target = with_annotation(config_map("settings"), argocd::SYNC_OPTIONS, "Replace=true");
    let mut ctx = context(&cluster, &[target], SyncOptions::default());

    ctx.sync().await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    let counts = cluster.operation_counts();
    assert_eq!(counts.replaces, 1);
    assert_eq!(counts.applies, 0);
}

#[tokio::test]
async fn test_server_side_apply_migrates_client_side_owner() {
    let live = resource(
        r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: apps
  managedFields:
    - manager: kubectl-client-side-apply
      operation: Update
      apiVersion: v1
data:
  mode: staging
"#,
    );
    let cluster = MockCluster::with_resources(vec![live]);
    let options = SyncOptions {
        server_side_apply: true,
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[config_map("settings")], options);

    ctx.sync().await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    let writes = cluster.writes();
    assert_eq!(writes.len(), 3);
    assert!(writes[0].options.dry_run);
    assert!(!writes[0].options.server_side);
    assert_eq!(writes[1].options.manager, "kubectl-client-side-apply");
    assert!(!writes[1].options.server_side);
    assert!(writes[2].options.server_side);
    assert_eq!(writes[2].options.manager, "argocd-controller");
}

#[tokio::test]
async fn test_apply_out_of_sync_only() {
    let live = config_map("settings");
    let cluster = MockCluster::with_resources(vec![live.clone()]);
    let options = SyncOptions {
        apply_out_of_sync_only: true,
        modification_results: HashMap::from([(live.resource_key(), false)]),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[config_map("settings")], options);

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.message, "successfully synced (no more tasks)");
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn test_namespace_is_created_first() {
    let cluster = MockCluster::new();
    let targets = [config_map("settings")];
    let options = SyncOptions {
        namespace_modifier: Some(Arc::new(|namespace: &mut Resource, _: Option<&Resource>| {
            namespace.set_annotation("team", "platform");
            Ok(true)
        })),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;

    let namespace_key = ResourceKey::new("", "Namespace", "", NAMESPACE);
    let namespace = cluster.object(&namespace_key).unwrap();
    assert_eq!(namespace.annotation("team").as_deref(), Some("platform"));
    assert_eq!(ctx.get_state().phase, OperationPhase::Running);

    // the namespace is not tracked as a managed resource
    let mut live = cluster.live_by_key();
    live.remove(&namespace_key);
    ctx.set_reconciliation(reconcile(targets.to_vec(), live, NAMESPACE, &cluster));
    ctx.sync().await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    assert!(cluster.object(&targets[0].resource_key()).is_some());
}

#[tokio::test]
async fn test_namespace_modifier_error() {
    let cluster = MockCluster::new();
    let options = SyncOptions {
        namespace_modifier: Some(Arc::new(|_: &mut Resource, _: Option<&Resource>| {
            Err("labels not allowed".to_string())
        })),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &[config_map("settings")], options);

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Failed);
    let namespace = result_of(&state, NAMESPACE);
    assert_eq!(namespace.message, "namespaceModifier error: labels not allowed");
    assert_eq!(cluster.operation_counts().applies, 0);
}

#[tokio::test]
async fn test_custom_resource_waits_for_its_crd() {
    let crd = resource(
        r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  scope: Namespaced
  names:
    kind: Widget
    plural: widgets
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
    let cluster = MockCluster::new();
    cluster.remove_type(widget.group_kind());
    let targets = [widget.clone(), crd.clone()];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(state.results[0].resource_key.kind, "CustomResourceDefinition");
    assert!(cluster.object(&widget.resource_key()).is_some());
}

#[tokio::test]
async fn test_generated_hook_names() {
    let cluster = MockCluster::new();
    let smoke = resource(
        r#"
apiVersion: batch/v1
kind: Job
metadata:
  generateName: smoke-
  namespace: apps
  annotations:
    argocd.argoproj.io/hook: PostSync
"#,
    );
    let targets = [config_map("settings"), smoke];
    let options = SyncOptions {
        revision: "3f9c2a1b7e".to_string(),
        started_at: DateTime::from_timestamp(1_700_000_000, 0),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;
    resync(&mut ctx, &cluster, &targets).await;

    let name = "smoke-3f9c2a1-postsync-1700000000";
    let key = ResourceKey::new("batch", "Job", NAMESPACE, name);
    assert!(cluster.object(&key).is_some());
    assert_eq!(
        ctx.get_state().message,
        format!("waiting for completion of hook batch/Job/{}", name)
    );
}

#[tokio::test]
async fn test_existing_namespace_keeps_its_result() {
    let cluster = MockCluster::new();
    let targets = [config_map("settings")];
    let options = SyncOptions {
        namespace_modifier: Some(Arc::new(|_: &mut Resource, live: Option<&Resource>| {
            Ok(live.is_none())
        })),
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;
    assert_eq!(ctx.get_state().phase, OperationPhase::Running);

    let namespace_key = ResourceKey::new("", "Namespace", "", NAMESPACE);
    let mut live = cluster.live_by_key();
    live.remove(&namespace_key);
    ctx.set_reconciliation(reconcile(targets.to_vec(), live, NAMESPACE, &cluster));
    ctx.sync().await;

    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Succeeded);
    assert_eq!(result_of(&state, NAMESPACE).status, Some(ResultCode::Synced));
    let namespace_applies = cluster
        .writes()
        .iter()
        .filter(|w| w.key == namespace_key && w.operation == MockOperation::Apply)
        .filter(|w| !w.options.dry_run)
        .count();
    assert_eq!(namespace_applies, 1);
}

#[tokio::test]
async fn test_next_wave_waits_for_pending_deletion() {
    let held = resource(
        r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: old
  namespace: apps
  finalizers:
    - example.com/protect
"#,
    );
    let cluster = MockCluster::with_resources(vec![held.clone()]);
    let later = with_annotation(config_map("later"), argocd::SYNC_WAVE, "5");
    let targets = [later.clone()];
    let options = SyncOptions {
        prune: true,
        ..Default::default()
    };
    let mut ctx = context(&cluster, &targets, options);

    ctx.sync().await;
    let deleting = cluster.object(&held.resource_key()).unwrap();
    assert!(deleting.is_being_deleted());
    assert_eq!(result_of(&ctx.get_state(), "old").status, Some(ResultCode::Pruned));

    resync(&mut ctx, &cluster, &targets).await;
    let state = ctx.get_state();
    assert_eq!(state.phase, OperationPhase::Running);
    assert_eq!(state.message, "waiting for deletion of /ConfigMap/old");
    assert!(cluster.object(&later.resource_key()).is_none());

    cluster.complete_deletion(&held.resource_key());
    resync(&mut ctx, &cluster, &targets).await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Succeeded);
    assert!(cluster.object(&later.resource_key()).is_some());
}

#[tokio::test]
async fn test_existing_hook_is_deleted_before_recreation() {
    let hook = job_hook("migrate", "PreSync");
    let cluster = MockCluster::with_resources(vec![hook.clone()]);
    let original_uid = cluster.object(&hook.resource_key()).unwrap().uid().to_string();
    let targets = [hook.clone(), config_map("settings")];
    let mut ctx = context(&cluster, &targets, SyncOptions::default());

    ctx.sync().await;

    assert_eq!(ctx.get_state().phase, OperationPhase::Running);
    let counts = cluster.operation_counts();
    assert_eq!(counts.deletes, 1);
    assert_eq!(counts.applies, 0);
    assert!(cluster.object(&hook.resource_key()).is_none());

    resync(&mut ctx, &cluster, &targets).await;

    let counts = cluster.operation_counts();
    assert_eq!(counts.deletes, 1);
    assert_eq!(counts.applies, 1);
    let recreated = cluster.object(&hook.resource_key()).unwrap();
    assert_ne!(recreated.uid(), original_uid);
    assert!(recreated.has_finalizer(argocd::HOOK_FINALIZER));
}
