//! Built-in health assessment of live objects
//!
//! Workloads are read through their typed `k8s-openapi` representation:
//!
//! - Deployment: paused is Suspended, an exceeded progress deadline is
//!   Degraded, otherwise Healthy once every replica is updated and available
//! - StatefulSet: ready replicas and a finished rolling update
//! - DaemonSet: updated and available pods on every scheduled node
//! - Job: Complete or Failed condition, Suspended when `spec.suspend` is set
//! - Pod: phase, readiness of `restartPolicy: Always` pods and image/crash
//!   back-off states
//!
//! A handful of other kinds only look at conditions or status fields. Kinds
//! not listed have no health and evaluate to `None`.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use serde::de::DeserializeOwned;
use serde_json::Value;

use converge_core::{HealthSource, HealthStatus, HealthStatusCode, Resource};

use crate::client::HealthEvaluator;
use crate::error::{KubeError, Result};

/// Container waiting reasons that will not resolve on their own
const BROKEN_WAITING_REASONS: [&str; 5] = [
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Health rules for the built-in kinds
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardHealthEvaluator;

impl HealthEvaluator for StandardHealthEvaluator {
    fn evaluate(&self, resource: &Resource) -> Result<Option<HealthStatus>> {
        if resource.is_being_deleted() {
            return Ok(Some(HealthStatus::new(
                HealthStatusCode::Progressing,
                "Pending deletion",
            )));
        }

        match (resource.group(), resource.kind()) {
            ("apps", "Deployment") => typed::<Deployment>(resource).map(|d| d.map(deployment)),
            ("apps", "StatefulSet") => typed::<StatefulSet>(resource).map(|s| s.map(stateful_set)),
            ("apps", "DaemonSet") => typed::<DaemonSet>(resource).map(|d| d.map(daemon_set)),
            ("apps", "ReplicaSet") => typed::<ReplicaSet>(resource).map(|r| r.map(replica_set)),
            ("batch", "Job") => typed::<Job>(resource).map(|j| j.map(job)),
            ("", "Pod") => typed::<Pod>(resource).map(|p| p.map(pod)),
            ("", "PersistentVolumeClaim") => {
                typed::<PersistentVolumeClaim>(resource).map(|p| p.map(pvc))
            }
            ("", "Service") => Ok(Some(service(resource))),
            ("networking.k8s.io", "Ingress") | ("extensions", "Ingress") => {
                Ok(Some(load_balanced(resource)))
            }
            ("apiextensions.k8s.io", "CustomResourceDefinition") => Ok(Some(crd(resource))),
            ("apiregistration.k8s.io", "APIService") => Ok(Some(api_service(resource))),
            _ => Ok(None),
        }
    }
}

/// Deserialize into `K` when apiVersion and kind are the ones `K` describes
fn typed<K>(resource: &Resource) -> Result<Option<K>>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    if resource.api_version() != K::API_VERSION || resource.kind() != K::KIND {
        return Ok(None);
    }
    serde_json::from_value(resource.as_value().clone())
        .map(Some)
        .map_err(|e| KubeError::Serialization(format!("{} {}: {}", K::KIND, resource.name(), e)))
}

fn healthy(message: impl Into<String>) -> HealthStatus {
    HealthStatus::new(HealthStatusCode::Healthy, message)
}

fn progressing(message: impl Into<String>) -> HealthStatus {
    HealthStatus::new(HealthStatusCode::Progressing, message)
}

fn degraded(message: impl Into<String>) -> HealthStatus {
    HealthStatus::new(HealthStatusCode::Degraded, message)
}

fn observed_is_current(generation: Option<i64>, observed: Option<i64>) -> bool {
    generation.unwrap_or(0) <= observed.unwrap_or(0)
}

fn deployment(deployment: Deployment) -> HealthStatus {
    let spec = deployment.spec.unwrap_or_default();
    if spec.paused.unwrap_or(false) {
        return HealthStatus::new(HealthStatusCode::Suspended, "Deployment is paused");
    }
    let Some(status) = deployment.status else {
        return progressing("Waiting for rollout to finish: status not reported yet");
    };
    if !observed_is_current(deployment.metadata.generation, status.observed_generation) {
        return progressing(
            "Waiting for rollout to finish: observed deployment generation less than desired generation",
        );
    }

    let deadline_exceeded = status.conditions.as_ref().is_some_and(|conditions| {
        conditions.iter().any(|c| {
            c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        })
    });
    if deadline_exceeded {
        return degraded(format!(
            "Deployment \"{}\" exceeded its progress deadline",
            deployment.metadata.name.unwrap_or_default()
        ));
    }

    let desired = spec.replicas.unwrap_or(1);
    let replicas = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        return progressing(format!(
            "Waiting for rollout to finish: {} out of {} new replicas have been updated...",
            updated, desired
        ));
    }
    if replicas > updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} old replicas are pending termination...",
            replicas - updated
        ));
    }
    if available < updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} of {} updated replicas are available...",
            available, updated
        ));
    }
    healthy(format!(
        "Deployment has {}/{} available replicas",
        available, desired
    ))
}

fn stateful_set(sts: StatefulSet) -> HealthStatus {
    let spec = sts.spec.unwrap_or_default();
    let Some(status) = sts.status else {
        return progressing("Waiting for statefulset spec update to be observed...");
    };
    if !observed_is_current(sts.metadata.generation, status.observed_generation) {
        return progressing("Waiting for statefulset spec update to be observed...");
    }

    let desired = spec.replicas.unwrap_or(1);
    let ready = status.ready_replicas.unwrap_or(0);
    if ready < desired {
        return progressing(format!(
            "Waiting for {} pods to be ready...",
            desired - ready
        ));
    }

    let strategy = spec.update_strategy.unwrap_or_default();
    if strategy.type_.as_deref() == Some("OnDelete") {
        return healthy("Partitioned roll out complete");
    }
    if let Some(partition) = strategy.rolling_update.and_then(|r| r.partition) {
        let updated = status.updated_replicas.unwrap_or(0);
        if updated < desired - partition {
            return progressing(format!(
                "Waiting for partitioned roll out to finish: {} out of {} new pods have been updated...",
                updated,
                desired - partition
            ));
        }
        return healthy(format!(
            "partitioned roll out complete: {} new pods have been updated...",
            updated
        ));
    }
    if status.update_revision != status.current_revision {
        return progressing(format!(
            "waiting for statefulset rolling update to complete {} pods at revision {}...",
            status.updated_replicas.unwrap_or(0),
            status.update_revision.unwrap_or_default()
        ));
    }
    healthy(format!(
        "statefulset rolling update complete {} pods at revision {}...",
        status.current_replicas.unwrap_or(0),
        status.current_revision.unwrap_or_default()
    ))
}

fn daemon_set(ds: DaemonSet) -> HealthStatus {
    let Some(status) = ds.status else {
        return progressing("Waiting for rollout to finish: status not reported yet");
    };
    if !observed_is_current(ds.metadata.generation, status.observed_generation) {
        return progressing(
            "Waiting for rollout to finish: observed daemon set generation less than desired generation",
        );
    }
    let on_delete = ds
        .spec
        .and_then(|s| s.update_strategy)
        .and_then(|s| s.type_)
        .as_deref()
        == Some("OnDelete");
    if on_delete {
        return healthy(format!(
            "daemon set {} out of {} new pods have been updated",
            status.updated_number_scheduled.unwrap_or(0),
            status.desired_number_scheduled
        ));
    }

    let desired = status.desired_number_scheduled;
    let updated = status.updated_number_scheduled.unwrap_or(0);
    let available = status.number_available.unwrap_or(0);
    if updated < desired {
        return progressing(format!(
            "Waiting for daemon set rollout to finish: {} out of {} new pods have been updated...",
            updated, desired
        ));
    }
    if available < desired {
        return progressing(format!(
            "Waiting for daemon set rollout to finish: {} of {} updated pods are available...",
            available, desired
        ));
    }
    healthy(format!(
        "daemon set {} of {} updated pods are available",
        available, desired
    ))
}

fn replica_set(rs: ReplicaSet) -> HealthStatus {
    let desired = rs.spec.and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = rs.status else {
        return progressing("Waiting for rollout to finish: status not reported yet");
    };
    let failure = status.conditions.as_ref().and_then(|conditions| {
        conditions
            .iter()
            .find(|c| c.type_ == "ReplicaFailure" && c.status == "True")
    });
    if let Some(condition) = failure {
        return degraded(condition.message.clone().unwrap_or_default());
    }
    let available = status.available_replicas.unwrap_or(0);
    if available < desired {
        return progressing(format!(
            "Waiting for rollout to finish: {} out of {} new replicas are available...",
            available, desired
        ));
    }
    healthy("")
}

fn job(job: Job) -> HealthStatus {
    let suspended = job.spec.as_ref().and_then(|s| s.suspend).unwrap_or(false);
    let status = job.status.unwrap_or_default();
    let conditions = status.conditions.unwrap_or_default();

    let condition = |type_: &str| {
        conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    };
    if let Some(failed) = condition("Failed") {
        return degraded(
            failed
                .message
                .clone()
                .unwrap_or_else(|| format!("Job failed with {} failures", status.failed.unwrap_or(0))),
        );
    }
    if let Some(complete) = condition("Complete") {
        return healthy(complete.message.clone().unwrap_or_else(|| "Job completed".to_string()));
    }
    if suspended {
        return HealthStatus::new(HealthStatusCode::Suspended, "Job is suspended");
    }
    progressing(format!(
        "Running: {} active, {} succeeded",
        status.active.unwrap_or(0),
        status.succeeded.unwrap_or(0)
    ))
}

fn pod(pod: Pod) -> HealthStatus {
    let restart_always = pod
        .spec
        .as_ref()
        .and_then(|s| s.restart_policy.as_deref())
        .unwrap_or("Always")
        == "Always";
    let status = pod.status.unwrap_or_default();
    let message = status.message.clone().unwrap_or_default();
    let containers = status.container_statuses.unwrap_or_default();

    let broken = containers.iter().find_map(|c| {
        let waiting = c.state.as_ref()?.waiting.as_ref()?;
        let reason = waiting.reason.as_deref()?;
        BROKEN_WAITING_REASONS
            .contains(&reason)
            .then(|| waiting.message.clone().unwrap_or_else(|| reason.to_string()))
    });

    match status.phase.as_deref() {
        Some("Succeeded") => healthy(message),
        Some("Failed") => degraded(message),
        Some("Running") => {
            if let Some(reason) = broken.filter(|_| restart_always) {
                return degraded(reason);
            }
            if restart_always && containers.iter().all(|c| c.ready) && !containers.is_empty() {
                healthy(message)
            } else {
                progressing(message)
            }
        }
        _ => match broken {
            Some(reason) => degraded(reason),
            None => progressing(message),
        },
    }
}

fn pvc(pvc: PersistentVolumeClaim) -> HealthStatus {
    match pvc.status.and_then(|s| s.phase).as_deref() {
        Some("Bound") => healthy(""),
        Some("Lost") => degraded(""),
        _ => progressing(""),
    }
}

fn has_load_balancer_ingress(resource: &Resource) -> bool {
    resource
        .nested(&["status", "loadBalancer", "ingress"])
        .and_then(Value::as_array)
        .is_some_and(|ingress| !ingress.is_empty())
}

fn service(resource: &Resource) -> HealthStatus {
    if resource.nested_str(&["spec", "type"]) == Some("LoadBalancer")
        && !has_load_balancer_ingress(resource)
    {
        return progressing("");
    }
    healthy("")
}

fn load_balanced(resource: &Resource) -> HealthStatus {
    if has_load_balancer_ingress(resource) {
        healthy("")
    } else {
        progressing("")
    }
}

fn crd(resource: &Resource) -> HealthStatus {
    if resource.condition_status("NamesAccepted") == Some("False") {
        return degraded("CRD names have not been accepted");
    }
    match resource.condition_status("Established") {
        Some("True") => healthy(""),
        _ => progressing("CRD is not established yet"),
    }
}

fn api_service(resource: &Resource) -> HealthStatus {
    match resource.condition_status("Available") {
        Some("True") => healthy(""),
        _ => progressing("APIService is not available yet"),
    }
}
