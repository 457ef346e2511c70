//! Annotation keys and sync-option parsing
//!
//! converge understands the Argo CD annotation family for waves, hooks and
//! sync options, and falls back to `helm.sh/*` annotations for hook phases,
//! weights and delete policies so that Helm charts can be synced as-is.

use std::collections::BTreeMap;

use crate::resource::Resource;

/// Argo CD compatible annotations
pub mod argocd {
    /// Sync wave for ordering resources
    pub const SYNC_WAVE: &str = "argocd.argoproj.io/sync-wave";
    /// Comma separated sync options (e.g. `Prune=false,Replace=true`)
    pub const SYNC_OPTIONS: &str = "argocd.argoproj.io/sync-options";
    /// Hook phase annotation
    pub const HOOK: &str = "argocd.argoproj.io/hook";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "argocd.argoproj.io/hook-delete-policy";
    /// Finalizer keeping a hook visible until its phase completes
    pub const HOOK_FINALIZER: &str = "argocd.argoproj.io/hook-finalizer";
}

/// Helm-compatible annotations
pub mod helm {
    /// Hook phase annotation
    pub const HOOK: &str = "helm.sh/hook";
    /// Hook weight for ordering
    pub const HOOK_WEIGHT: &str = "helm.sh/hook-weight";
    /// Hook delete policy
    pub const HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
}

/// Annotations written by kubectl
pub mod kubectl {
    /// Previous desired state used as the base of a three-way diff
    pub const LAST_APPLIED_CONFIG: &str = "kubectl.kubernetes.io/last-applied-configuration";
}

/// Values recognised inside [`argocd::SYNC_OPTIONS`]
pub mod sync_option {
    pub const PRUNE_DISABLED: &str = "Prune=false";
    pub const PRUNE_REQUIRE_CONFIRM: &str = "Prune=confirm";
    pub const PRUNE_LAST: &str = "PruneLast=true";
    pub const REPLACE: &str = "Replace=true";
    pub const FORCE: &str = "Force=true";
    pub const SERVER_SIDE_APPLY: &str = "ServerSideApply=true";
    pub const VALIDATE_DISABLED: &str = "Validate=false";
    pub const SKIP_DRY_RUN_ON_MISSING_RESOURCE: &str = "SkipDryRunOnMissingResource=true";
    pub const DELETE_DISABLED: &str = "Delete=false";
}

/// Read access to annotations
///
/// Everything that decides behaviour from annotations (hooks, waves, sync
/// options) goes through this trait rather than a concrete type.
pub trait AnnotationSource {
    fn annotation(&self, key: &str) -> Option<String>;

    /// Comma separated values of an annotation, trimmed, empty entries dropped
    fn annotation_csv(&self, key: &str) -> Vec<String> {
        self.annotation(key)
            .map(|value| parse_csv(&value))
            .unwrap_or_default()
    }

    /// Whether a comma separated annotation contains `option`
    fn has_annotation_option(&self, key: &str, option: &str) -> bool {
        self.annotation_csv(key).iter().any(|item| item == option)
    }

    fn has_sync_option(&self, option: &str) -> bool {
        self.has_annotation_option(argocd::SYNC_OPTIONS, option)
    }
}

impl AnnotationSource for Resource {
    fn annotation(&self, key: &str) -> Option<String> {
        self.nested_str(&["metadata", "annotations", key])
            .map(String::from)
    }
}

impl AnnotationSource for BTreeMap<String, String> {
    fn annotation(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<T: AnnotationSource + ?Sized> AnnotationSource for &T {
    fn annotation(&self, key: &str) -> Option<String> {
        (**self).annotation(key)
    }
}

/// Split a comma separated value
pub fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Sync wave: explicit wave annotation, else Helm hook weight, else 0
pub fn parse_sync_wave<T: AnnotationSource + ?Sized>(source: &T) -> i32 {
    if let Some(wave) = source
        .annotation(argocd::SYNC_WAVE)
        .and_then(|s| s.parse().ok())
    {
        return wave;
    }
    parse_hook_weight(source)
}

/// Helm hook weight (default: 0)
pub fn parse_hook_weight<T: AnnotationSource + ?Sized>(source: &T) -> i32 {
    source
        .annotation(helm::HOOK_WEIGHT)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_csv() {
        assert_eq!(
            parse_csv(" Prune=false , Replace=true,"),
            vec!["Prune=false", "Replace=true"]
        );
        assert!(parse_csv("").is_empty());
    }

    #[test]
    fn test_has_sync_option() {
        let annotations = make_annotations(&[(argocd::SYNC_OPTIONS, "Validate=false, Prune=confirm")]);
        assert!(annotations.has_sync_option(sync_option::PRUNE_REQUIRE_CONFIRM));
        assert!(annotations.has_sync_option(sync_option::VALIDATE_DISABLED));
        assert!(!annotations.has_sync_option(sync_option::PRUNE_DISABLED));
    }

    #[test]
    fn test_parse_sync_wave() {
        let annotations = make_annotations(&[(argocd::SYNC_WAVE, "2")]);
        assert_eq!(parse_sync_wave(&annotations), 2);

        let annotations = make_annotations(&[(argocd::SYNC_WAVE, "-1")]);
        assert_eq!(parse_sync_wave(&annotations), -1);

        let empty: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(parse_sync_wave(&empty), 0);
    }

    #[test]
    fn test_sync_wave_falls_back_to_helm_weight() {
        let annotations = make_annotations(&[(helm::HOOK_WEIGHT, "5")]);
        assert_eq!(parse_sync_wave(&annotations), 5);

        let annotations = make_annotations(&[(argocd::SYNC_WAVE, "bogus"), (helm::HOOK_WEIGHT, "3")]);
        assert_eq!(parse_sync_wave(&annotations), 3);
    }

    #[test]
    fn test_resource_annotation_source() {
        let resource = Resource::from_yaml(
            r#"
apiVersion: v1
kind: Service
metadata:
  name: svc
  annotations:
    argocd.argoproj.io/sync-options: PruneLast=true
"#,
        )
        .unwrap();
        assert!(resource.has_sync_option(sync_option::PRUNE_LAST));
        assert_eq!(resource.annotation("missing"), None);
    }
}
