//! Pairing desired resources with live ones

use std::collections::{BTreeMap, HashMap, HashSet};

use converge_core::{Resource, ResourceKey, hook};
use converge_diff::DiffResultList;
use tracing::debug;

use crate::client::ScopeResolver;

/// Desired and live objects, index aligned, plus the hooks
///
/// `target[i]` and `live[i]` describe one managed resource; a missing target
/// means the live object is to be pruned, a missing live object that the
/// target is to be created.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    pub target: Vec<Option<Resource>>,
    pub live: Vec<Option<Resource>>,
    pub hooks: Vec<Resource>,
}

impl ReconciliationResult {
    /// Managed pairs in order
    pub fn pairs(&self) -> impl Iterator<Item = (Option<&Resource>, Option<&Resource>)> {
        self.target
            .iter()
            .zip(self.live.iter())
            .map(|(target, live)| (target.as_ref(), live.as_ref()))
    }
}

/// Match every desired resource with at most one live resource
///
/// Unmatched live resources are appended as prune candidates, sorted by key.
pub fn reconcile(
    targets: Vec<Resource>,
    mut live_by_key: HashMap<ResourceKey, Resource>,
    namespace: &str,
    scope: &dyn ScopeResolver,
) -> ReconciliationResult {
    let (targets, hooks) = split_hooks(targets);
    dedup_live_resources(&targets, &mut live_by_key);

    let mut live = Vec::with_capacity(targets.len());
    for target in &targets {
        let gvk = target.group_version_kind();
        let effective_namespace = if target.namespace().is_empty() {
            namespace
        } else {
            target.namespace()
        };

        let (check_namespaced, check_cluster) = match scope.is_namespaced(&gvk.group_kind()) {
            Ok(true) => (true, false),
            Ok(false) => (false, true),
            Err(e) => {
                debug!(kind = %gvk.kind, error = %e, "Unknown scope, checking both keys");
                (true, true)
            }
        };

        let mut keys = Vec::with_capacity(2);
        if check_namespaced {
            keys.push(ResourceKey::new(
                &gvk.group,
                &gvk.kind,
                effective_namespace,
                target.name(),
            ));
        }
        if check_cluster {
            keys.push(ResourceKey::new(&gvk.group, &gvk.kind, "", target.name()));
        }

        live.push(keys.iter().find_map(|key| live_by_key.remove(key)));
    }

    let mut target: Vec<Option<Resource>> = targets.into_iter().map(Some).collect();
    let leftovers: BTreeMap<ResourceKey, Resource> = live_by_key.into_iter().collect();
    for (_, resource) in leftovers {
        target.push(None);
        live.push(Some(resource));
    }

    ReconciliationResult {
        target,
        live,
        hooks,
    }
}

/// Separate hooks from managed resources, dropping ignored ones
fn split_hooks(targets: Vec<Resource>) -> (Vec<Resource>, Vec<Resource>) {
    let mut managed = Vec::new();
    let mut hooks = Vec::new();
    for resource in targets {
        if hook::is_ignored(&resource) {
            debug!(resource = %resource, "Ignoring hook without a recognised type");
            continue;
        }
        if hook::is_hook(&resource) {
            hooks.push(resource);
        } else {
            managed.push(resource);
        }
    }
    (managed, hooks)
}

/// Drop live aliases of one object, keeping those a target refers to
///
/// The same object can be served under several API groups. Aliases nobody
/// targets are removed until a single representative is left.
fn dedup_live_resources(targets: &[Resource], live_by_key: &mut HashMap<ResourceKey, Resource>) {
    let targeted: HashSet<ResourceKey> = targets.iter().map(Resource::resource_key).collect();

    let mut by_uid: BTreeMap<String, Vec<ResourceKey>> = BTreeMap::new();
    for (key, resource) in live_by_key.iter() {
        if resource.uid().is_empty() {
            continue;
        }
        by_uid
            .entry(resource.uid().to_string())
            .or_default()
            .push(key.clone());
    }

    for (uid, mut keys) in by_uid {
        if keys.len() < 2 {
            continue;
        }
        keys.sort();
        let mut left = keys.len();
        for key in keys {
            if targeted.contains(&key) {
                continue;
            }
            debug!(%uid, %key, "Dropping duplicate live resource");
            live_by_key.remove(&key);
            left -= 1;
            if left == 1 {
                break;
            }
        }
    }
}

/// Per-resource drift verdicts keyed by the live (or predicted) object
pub fn modification_results(diffs: &DiffResultList) -> HashMap<ResourceKey, bool> {
    let mut results = HashMap::new();
    for diff in &diffs.diffs {
        let object = resource_from_json(&diff.normalized_live)
            .or_else(|| resource_from_json(&diff.predicted_live));
        if let Some(object) = object {
            results.insert(object.resource_key(), diff.modified);
        }
    }
    results
}

/// `None` for the `null` marker of an absent side
fn resource_from_json(bytes: &[u8]) -> Option<Resource> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    Resource::from_value(value).ok()
}
