//! Waiting for a freshly applied CRD to be served

use std::time::Duration;

use tokio::time::{Instant, sleep};

use converge_core::{GroupVersionKind, HealthSource, Resource};

use crate::client::ClusterResourceClient;
use crate::error::{KubeError, Result};

/// Interval between readiness checks
pub const CRD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long an apply waits for a CRD to become established
pub const CRD_READINESS_TIMEOUT: Duration = Duration::from_secs(3);

fn crd_gvk() -> GroupVersionKind {
    GroupVersionKind::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition")
}

/// A CRD is ready when it has the "Established" condition set to "True"
pub fn is_established(crd: &Resource) -> bool {
    crd.condition_status("Established") == Some("True")
}

/// Poll until the named CRD is established
///
/// A CRD that does not exist yet is polled again; any other error ends the wait.
pub async fn wait_for_established(
    client: &dyn ClusterResourceClient,
    name: &str,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let gvk = crd_gvk();
    let start = Instant::now();

    loop {
        match client.get(&gvk, "", name).await {
            Ok(crd) if is_established(&crd) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if start.elapsed() >= timeout {
            return Err(KubeError::Timeout(format!(
                "CRD {} not established after {:?}",
                name, timeout
            )));
        }
        sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;
    use serde_json::json;

    fn crd(established: &str) -> Resource {
        Resource::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "status": {"conditions": [{"type": "Established", "status": established}]}
        }))
        .unwrap()
    }

    #[test]
    fn test_is_established() {
        assert!(is_established(&crd("True")));
        assert!(!is_established(&crd("False")));
    }

    #[tokio::test]
    async fn test_wait_returns_once_established() {
        let cluster = MockCluster::with_resources(vec![crd("True")]);
        wait_for_established(
            &cluster,
            "widgets.example.com",
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let cluster = MockCluster::with_resources(vec![crd("False")]);
        let err = wait_for_established(
            &cluster,
            "widgets.example.com",
            Duration::from_millis(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, KubeError::Timeout(_)));
    }
}
