//! Conversions between [`Resource`] and the dynamic kube-rs types

use kube::api::{DynamicObject, PropagationPolicy as KubePropagationPolicy};
use kube::core::GroupVersionKind as KubeGroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};

use converge_core::annotations::kubectl::LAST_APPLIED_CONFIG;
use converge_core::{GroupVersionKind, Resource};

use crate::client::{PropagationPolicy, ServerResource};
use crate::error::Result;

pub(crate) fn kube_gvk(gvk: &GroupVersionKind) -> KubeGroupVersionKind {
    KubeGroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
}

pub(crate) fn to_dynamic(resource: &Resource) -> Result<DynamicObject> {
    Ok(serde_json::from_value(resource.as_value().clone())?)
}

pub(crate) fn from_dynamic(object: &DynamicObject) -> Result<Resource> {
    let value = serde_json::to_value(object)?;
    Ok(Resource::from_value(value)?)
}

pub(crate) fn propagation(policy: PropagationPolicy) -> KubePropagationPolicy {
    match policy {
        PropagationPolicy::Foreground => KubePropagationPolicy::Foreground,
        PropagationPolicy::Background => KubePropagationPolicy::Background,
        PropagationPolicy::Orphan => KubePropagationPolicy::Orphan,
    }
}

pub(crate) fn server_resource(api_resource: &ApiResource, caps: &ApiCapabilities) -> ServerResource {
    ServerResource {
        name: api_resource.plural.clone(),
        namespaced: caps.scope == Scope::Namespaced,
        verbs: caps.operations.clone(),
    }
}

/// The object as `kubectl apply` would send it, remembering itself for the next three-way merge
pub(crate) fn with_last_applied(resource: &Resource) -> Result<Resource> {
    let mut original = resource.clone();
    original.remove_annotation(LAST_APPLIED_CONFIG);
    original.remove_nested(&["status"]);
    let serialized = serde_json::to_string(original.as_value())?;

    let mut applied = resource.clone();
    applied.set_annotation(LAST_APPLIED_CONFIG, &serialized);
    Ok(applied)
}

/// `<kind>/<name>` in the lowercase form kubectl prints
pub(crate) fn describe(resource: &Resource) -> String {
    let kind = resource.kind().to_lowercase();
    match resource.group() {
        "" => format!("{}/{}", kind, resource.name()),
        group => format!("{}.{}/{}", kind, group, resource.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::AnnotationSource;
    use serde_json::json;

    fn deployment() -> Resource {
        Resource::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "apps", "labels": {"app": "web"}},
            "spec": {"replicas": 2},
            "status": {"readyReplicas": 2}
        }))
        .unwrap()
    }

    #[test]
    fn test_kube_gvk() {
        let gvk = kube_gvk(&deployment().group_version_kind());
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn test_dynamic_conversion_keeps_content() {
        let resource = deployment();
        let dynamic = to_dynamic(&resource).unwrap();
        assert_eq!(dynamic.metadata.name.as_deref(), Some("web"));
        assert_eq!(dynamic.data["spec"]["replicas"], json!(2));

        let back = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.kind(), "Deployment");
        assert_eq!(back.namespace(), "apps");
        assert_eq!(back.labels().get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_last_applied_excludes_status() {
        let applied = with_last_applied(&deployment()).unwrap();
        let raw = applied.annotation(LAST_APPLIED_CONFIG).unwrap();
        let recorded: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(recorded["spec"]["replicas"], json!(2));
        assert!(recorded.get("status").is_none());
        assert!(recorded["metadata"].get("annotations").is_none());
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe(&deployment()), "deployment.apps/web");
        let config_map = Resource::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings"}
        }))
        .unwrap();
        assert_eq!(describe(&config_map), "configmap/settings");
    }

    #[test]
    fn test_propagation_mapping() {
        assert!(matches!(
            propagation(PropagationPolicy::default()),
            KubePropagationPolicy::Foreground
        ));
        assert!(matches!(
            propagation(PropagationPolicy::Orphan),
            KubePropagationPolicy::Orphan
        ));
    }
}
