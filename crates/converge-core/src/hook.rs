//! Hook detection
//!
//! A resource is a hook when it carries `argocd.argoproj.io/hook` (unless the
//! only value is `Skip`) or, failing that, `helm.sh/hook`. Helm hook types are
//! mapped onto sync phases:
//!
//! | Helm                                    | Phase    |
//! |-----------------------------------------|----------|
//! | `crd-install`, `pre-install`, `pre-upgrade` | PreSync  |
//! | `post-install`, `post-upgrade`          | PostSync |
//!
//! Other Helm hook types are not recognised, and a hook whose annotation
//! yields no recognised type is ignored altogether.

use serde::{Deserialize, Serialize};

use crate::annotations::{AnnotationSource, argocd, helm};
use crate::types::SyncPhase;

/// Hook type declared by annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HookType {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
    Skip,
}

impl HookType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PreSync" => Some(HookType::PreSync),
            "Sync" => Some(HookType::Sync),
            "PostSync" => Some(HookType::PostSync),
            "SyncFail" => Some(HookType::SyncFail),
            "Skip" => Some(HookType::Skip),
            _ => None,
        }
    }

    fn from_helm(value: &str) -> Option<Self> {
        match value {
            "crd-install" | "pre-install" | "pre-upgrade" => Some(HookType::PreSync),
            "post-install" | "post-upgrade" => Some(HookType::PostSync),
            _ => None,
        }
    }

    /// The sync phase this hook type runs in; `Skip` has none
    pub fn sync_phase(self) -> Option<SyncPhase> {
        match self {
            HookType::PreSync => Some(SyncPhase::PreSync),
            HookType::Sync => Some(SyncPhase::Sync),
            HookType::PostSync => Some(SyncPhase::PostSync),
            HookType::SyncFail => Some(SyncPhase::SyncFail),
            HookType::Skip => None,
        }
    }

    pub fn from_phase(phase: SyncPhase) -> Self {
        match phase {
            SyncPhase::PreSync => HookType::PreSync,
            SyncPhase::Sync => HookType::Sync,
            SyncPhase::PostSync => HookType::PostSync,
            SyncPhase::SyncFail => HookType::SyncFail,
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookType::PreSync => write!(f, "PreSync"),
            HookType::Sync => write!(f, "Sync"),
            HookType::PostSync => write!(f, "PostSync"),
            HookType::SyncFail => write!(f, "SyncFail"),
            HookType::Skip => write!(f, "Skip"),
        }
    }
}

/// When a hook object is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    /// Delete an existing hook object before creating it again (default)
    BeforeHookCreation,
    /// Delete once the operation succeeds
    HookSucceeded,
    /// Delete once the operation fails
    HookFailed,
}

impl HookDeletePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BeforeHookCreation" => Some(HookDeletePolicy::BeforeHookCreation),
            "HookSucceeded" => Some(HookDeletePolicy::HookSucceeded),
            "HookFailed" => Some(HookDeletePolicy::HookFailed),
            _ => None,
        }
    }

    fn from_helm(value: &str) -> Option<Self> {
        match value {
            "before-hook-creation" => Some(HookDeletePolicy::BeforeHookCreation),
            "hook-succeeded" => Some(HookDeletePolicy::HookSucceeded),
            "hook-failed" => Some(HookDeletePolicy::HookFailed),
            _ => None,
        }
    }
}

/// Recognised hook types; Argo annotations win over Helm ones
pub fn types<T: AnnotationSource + ?Sized>(source: &T) -> Vec<HookType> {
    let argo: Vec<HookType> = source
        .annotation_csv(argocd::HOOK)
        .iter()
        .filter_map(|value| HookType::parse(value))
        .collect();
    if !argo.is_empty() {
        return argo;
    }
    source
        .annotation_csv(helm::HOOK)
        .iter()
        .filter_map(|value| HookType::from_helm(value))
        .collect()
}

/// `Skip` only counts when it is the sole declared type
pub fn is_skip<T: AnnotationSource + ?Sized>(source: &T) -> bool {
    let types = types(source);
    types.contains(&HookType::Skip) && types.len() == 1
}

pub fn is_hook<T: AnnotationSource + ?Sized>(source: &T) -> bool {
    if source.annotation(argocd::HOOK).is_some() {
        return !is_skip(source);
    }
    is_helm_hook(source)
}

/// Helm marks CRDs with `crd-install` without them being hooks
fn is_helm_hook<T: AnnotationSource + ?Sized>(source: &T) -> bool {
    matches!(source.annotation(helm::HOOK), Some(value) if value != "crd-install")
}

/// A hook without any recognised type is dropped from the sync entirely
pub fn is_ignored<T: AnnotationSource + ?Sized>(source: &T) -> bool {
    is_hook(source) && types(source).is_empty()
}

/// Phases a resource produces tasks for
///
/// Skipped resources yield none, hooks one per distinct declared phase in
/// phase order, ordinary resources just `Sync`.
pub fn sync_phases<T: AnnotationSource + ?Sized>(source: &T) -> Vec<SyncPhase> {
    if is_skip(source) {
        return Vec::new();
    }
    if !is_hook(source) {
        return vec![SyncPhase::Sync];
    }
    let mut phases: Vec<SyncPhase> = types(source)
        .into_iter()
        .filter_map(HookType::sync_phase)
        .collect();
    phases.sort();
    phases.dedup();
    phases
}

/// Delete policies from both annotation families, defaulting to BeforeHookCreation
pub fn delete_policies<T: AnnotationSource + ?Sized>(source: &T) -> Vec<HookDeletePolicy> {
    let mut policies: Vec<HookDeletePolicy> = source
        .annotation_csv(argocd::HOOK_DELETE_POLICY)
        .iter()
        .filter_map(|value| HookDeletePolicy::parse(value))
        .collect();
    policies.extend(
        source
            .annotation_csv(helm::HOOK_DELETE_POLICY)
            .iter()
            .filter_map(|value| HookDeletePolicy::from_helm(value)),
    );
    if policies.is_empty() {
        policies.push(HookDeletePolicy::BeforeHookCreation);
    }
    policies
}

pub fn has_delete_policy<T: AnnotationSource + ?Sized>(
    source: &T,
    policy: HookDeletePolicy,
) -> bool {
    delete_policies(source).contains(&policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn make_annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_resource_is_not_hook() {
        let annotations = make_annotations(&[]);
        assert!(!is_hook(&annotations));
        assert!(!is_ignored(&annotations));
        assert_eq!(sync_phases(&annotations), vec![SyncPhase::Sync]);
    }

    #[test]
    fn test_argo_hook_phases() {
        let annotations = make_annotations(&[(argocd::HOOK, "PostSync,PreSync,PreSync")]);
        assert!(is_hook(&annotations));
        assert_eq!(
            sync_phases(&annotations),
            vec![SyncPhase::PreSync, SyncPhase::PostSync]
        );
    }

    #[test]
    fn test_skip_only() {
        let annotations = make_annotations(&[(argocd::HOOK, "Skip")]);
        assert!(is_skip(&annotations));
        assert!(!is_hook(&annotations));
        assert!(sync_phases(&annotations).is_empty());
    }

    #[test]
    fn test_skip_with_other_phases_is_hook() {
        let annotations = make_annotations(&[(argocd::HOOK, "Skip,PreSync")]);
        assert!(!is_skip(&annotations));
        assert!(is_hook(&annotations));
        assert!(types(&annotations).contains(&HookType::Skip));
        assert_eq!(sync_phases(&annotations), vec![SyncPhase::PreSync]);
    }

    #[test]
    fn test_unknown_argo_hook_is_ignored() {
        let annotations = make_annotations(&[(argocd::HOOK, "Garbage")]);
        assert!(is_hook(&annotations));
        assert!(is_ignored(&annotations));
    }

    #[test]
    fn test_helm_hooks() {
        let annotations = make_annotations(&[(helm::HOOK, "pre-install,post-upgrade")]);
        assert!(is_hook(&annotations));
        assert_eq!(
            sync_phases(&annotations),
            vec![SyncPhase::PreSync, SyncPhase::PostSync]
        );

        let annotations = make_annotations(&[(helm::HOOK, "crd-install")]);
        assert!(!is_hook(&annotations));

        let annotations = make_annotations(&[(helm::HOOK, "pre-delete")]);
        assert!(is_hook(&annotations));
        assert!(is_ignored(&annotations));
    }

    #[test]
    fn test_argo_hook_wins_over_helm() {
        let annotations =
            make_annotations(&[(argocd::HOOK, "Sync"), (helm::HOOK, "post-install")]);
        assert_eq!(types(&annotations), vec![HookType::Sync]);
    }

    #[test]
    fn test_delete_policies() {
        let annotations = make_annotations(&[]);
        assert_eq!(
            delete_policies(&annotations),
            vec![HookDeletePolicy::BeforeHookCreation]
        );

        let annotations = make_annotations(&[
            (argocd::HOOK_DELETE_POLICY, "HookSucceeded"),
            (helm::HOOK_DELETE_POLICY, "hook-failed"),
        ]);
        assert!(has_delete_policy(&annotations, HookDeletePolicy::HookSucceeded));
        assert!(has_delete_policy(&annotations, HookDeletePolicy::HookFailed));
        assert!(!has_delete_policy(
            &annotations,
            HookDeletePolicy::BeforeHookCreation
        ));
    }
}
