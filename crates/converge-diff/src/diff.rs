//! Drift detection between desired and live resources
//!
//! Strategy selection, in order:
//! 1. server-side diff, when requested (needs a [`ServerSideDryRunner`])
//! 2. structured merge, when requested or the config opts into server-side apply
//! 3. three-way diff against the live object's last-applied configuration
//! 4. two-way diff, which is a three-way diff with config as its own original
//!
//! Results carry canonical JSON of both the normalized live state and the
//! predicted live state after applying config.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use converge_core::annotations::kubectl::LAST_APPLIED_CONFIG;
use converge_core::annotations::sync_option::SERVER_SIDE_APPLY;
use converge_core::{AnnotationSource, GroupKind, Resource};

use crate::defaults::apply_defaults;
use crate::error::{DiffError, Result};
use crate::json::{
    NULL_BYTES, canonical_bytes, remarshal, remove_list_fields, remove_map_fields,
    remove_namespace_annotation,
};
use crate::normalize::{NoopNormalizer, Normalizer, normalize};
use crate::schema::SchemaRegistry;
use crate::strategic::{MergeMode, apply_patch, three_way_merge_patch};
use crate::structured;

/// Field manager used when none is configured
pub const DEFAULT_MANAGER: &str = "argocd-controller";

/// Options shared by all diff strategies
#[derive(Clone)]
pub struct DiffOptions {
    /// Null the rules of ClusterRoles that have an aggregation rule
    pub ignore_aggregated_roles: bool,
    /// Caller-supplied normalization, run after the built-in rules
    pub normalizer: Arc<dyn Normalizer>,
    /// Always use the structured merge strategy
    pub structured_merge_diff: bool,
    /// Field manager whose ownership the structured strategies consider
    pub manager: String,
    /// Predict live state through a server-side dry-run apply
    pub server_side_diff: bool,
    /// Revert fields the manager does not own in server-side predictions
    pub ignore_mutation_webhook: bool,
    /// Kinds with known list semantics and server defaults
    pub schema: SchemaRegistry,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            ignore_aggregated_roles: false,
            normalizer: Arc::new(NoopNormalizer),
            structured_merge_diff: false,
            manager: DEFAULT_MANAGER.to_string(),
            server_side_diff: false,
            ignore_mutation_webhook: true,
            schema: SchemaRegistry::default(),
        }
    }
}

impl fmt::Debug for DiffOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiffOptions")
            .field("ignore_aggregated_roles", &self.ignore_aggregated_roles)
            .field("structured_merge_diff", &self.structured_merge_diff)
            .field("manager", &self.manager)
            .field("server_side_diff", &self.server_side_diff)
            .field("ignore_mutation_webhook", &self.ignore_mutation_webhook)
            .finish_non_exhaustive()
    }
}

/// Outcome of diffing one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult {
    /// Whether predicted and normalized live differ
    pub modified: bool,
    /// Canonical JSON of the live object, or `null`
    pub normalized_live: Vec<u8>,
    /// Canonical JSON of the live object after applying config, or `null`
    pub predicted_live: Vec<u8>,
}

impl DiffResult {
    fn new(predicted_live: Vec<u8>, normalized_live: Vec<u8>) -> Self {
        Self {
            modified: predicted_live != normalized_live,
            normalized_live,
            predicted_live,
        }
    }

    pub fn normalized_live_value(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.normalized_live)?)
    }

    pub fn predicted_live_value(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.predicted_live)?)
    }
}

/// Diff results of several resource pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResultList {
    pub diffs: Vec<DiffResult>,
    /// True if any of the results is modified
    pub modified: bool,
}

/// Performs a server-side dry-run apply
#[async_trait]
pub trait ServerSideDryRunner: Send + Sync {
    /// Dry-run apply `resource` as `manager` and return the resulting object as JSON
    async fn run(&self, resource: &Resource, manager: &str) -> Result<String>;
}

/// The last-applied configuration stored on a live object
pub fn last_applied_config(live: &Resource) -> Result<Option<Resource>> {
    let Some(raw) = live.annotation(LAST_APPLIED_CONFIG) else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(&raw).map_err(|source| DiffError::LastApplied {
        name: live.name().to_string(),
        source,
    })?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(Resource::from_value(value)?))
}

/// Diff a config against a live object
///
/// Either side may be absent, but not both. Server-side diffs need a dry
/// runner and go through [`diff_with_runner`].
pub fn diff(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
) -> Result<DiffResult> {
    if options.server_side_diff {
        return Err(DiffError::DryRunnerRequired);
    }
    let config = prepare(config, options)?;
    let live = prepare(live, options)?;
    diff_prepared(config.as_ref(), live.as_ref(), options)
}

/// Like [`diff`], running server-side diffs through `runner`
pub async fn diff_with_runner(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
    runner: &dyn ServerSideDryRunner,
) -> Result<DiffResult> {
    if !options.server_side_diff {
        return diff(config, live, options);
    }
    let config = prepare(config, options)?;
    let live = prepare(live, options)?;
    server_side_diff(config.as_ref(), live.as_ref(), options, runner).await
}

/// Diff pairs of configs and live objects
pub fn diff_array(
    configs: &[Option<Resource>],
    lives: &[Option<Resource>],
    options: &DiffOptions,
) -> Result<DiffResultList> {
    if configs.len() != lives.len() {
        return Err(DiffError::LengthMismatch {
            left: configs.len(),
            right: lives.len(),
        });
    }

    let mut list = DiffResultList::default();
    for (config, live) in configs.iter().zip(lives) {
        let result = diff(config.as_ref(), live.as_ref(), options)?;
        list.modified |= result.modified;
        list.diffs.push(result);
    }
    Ok(list)
}

fn prepare(resource: Option<&Resource>, options: &DiffOptions) -> Result<Option<Resource>> {
    let Some(resource) = resource else {
        return Ok(None);
    };
    let mut resource = Resource::from_value(remarshal(resource.as_value()))?;
    normalize(&mut resource, options);
    Ok(Some(resource))
}

fn diff_prepared(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
) -> Result<DiffResult> {
    let server_side_apply = config.is_some_and(|config| config.has_sync_option(SERVER_SIDE_APPLY));
    if options.structured_merge_diff || server_side_apply {
        return structured_merge_diff(config, live, options);
    }

    if let (Some(config), Some(live)) = (config, live) {
        match last_applied_config(live) {
            Ok(Some(mut original)) => {
                normalize(&mut original, options);
                match three_way_diff(&original, config, live, options) {
                    Ok(result) => return Ok(result),
                    Err(err) => debug!(
                        resource = %live,
                        error = %err,
                        "Three-way diff failed, falling back to two-way diff"
                    ),
                }
            }
            Ok(None) => {}
            Err(err) => debug!(
                resource = %live,
                error = %err,
                "Could not read last-applied configuration, falling back to two-way diff"
            ),
        }
    }

    two_way_diff(config, live, options)
}

/// Diff without a last-applied configuration
///
/// Fields present only in live are assumed to be server defaults and are not
/// reported.
pub fn two_way_diff(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
) -> Result<DiffResult> {
    match (config, live) {
        (Some(config), Some(live)) => three_way_diff(config, config, live, options),
        _ => create_or_delete_diff(config, live),
    }
}

/// Three-way diff of `original` (last applied), `config` and `live`
///
/// Registered kinds are patched strategically and have server defaults
/// applied to both sides; other kinds use a JSON merge patch computed against
/// live with its unmanaged fields removed.
pub fn three_way_diff(
    original: &Resource,
    config: &Resource,
    live: &Resource,
    options: &DiffOptions,
) -> Result<DiffResult> {
    let original_value = remove_namespace_annotation(original.as_value());
    let config_value = remove_namespace_annotation(config.as_value());
    let group_kind = original.group_kind();

    let (predicted, live_value) = match options.schema.get(&group_kind) {
        Some(schema) => {
            let mut current = live.as_value().clone();
            if is_stateful_set(&group_kind) {
                stateful_set_workaround(&original_value, &mut current);
            }
            let mode = MergeMode::Strategic(schema);
            let patch = three_way_merge_patch(&original_value, &config_value, &current, mode)?;
            let mut predicted = apply_patch(live.as_value(), &patch, mode)?;
            let mut live_value = live.as_value().clone();
            apply_defaults(&mut predicted, &options.schema);
            apply_defaults(&mut live_value, &options.schema);
            (predicted, live_value)
        }
        None => {
            let current = match (original_value.as_object(), live.as_value().as_object()) {
                (Some(original_map), Some(live_map)) => {
                    Value::Object(remove_map_fields(original_map, live_map))
                }
                _ => live.as_value().clone(),
            };
            let patch =
                three_way_merge_patch(&original_value, &config_value, &current, MergeMode::Json)?;
            let predicted = apply_patch(live.as_value(), &patch, MergeMode::Json)?;
            (predicted, live.as_value().clone())
        }
    };

    Ok(DiffResult::new(
        canonical_bytes(&predicted)?,
        canonical_bytes(&live_value)?,
    ))
}

fn is_stateful_set(group_kind: &GroupKind) -> bool {
    group_kind.kind == "StatefulSet" && matches!(group_kind.group.as_str(), "apps" | "extensions")
}

/// Keep only the volume claim template fields that were applied
///
/// The API server fills in claim template status and defaults that can never
/// be patched away, so they must not appear as deletions.
fn stateful_set_workaround(original: &Value, live: &mut Value) {
    let Some(applied) = original
        .pointer("/spec/volumeClaimTemplates")
        .and_then(Value::as_array)
    else {
        return;
    };
    let Some(templates) = live
        .pointer_mut("/spec/volumeClaimTemplates")
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    *templates = remove_list_fields(applied, templates);
}

/// Predict the result of a server-side apply of `config` onto `live` locally
pub fn structured_merge_diff(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
) -> Result<DiffResult> {
    let (Some(config), Some(live)) = (config, live) else {
        return create_or_delete_diff(config, live);
    };

    let schema = options.schema.get(&config.group_kind());
    let merged = structured::apply(
        live.as_value(),
        config.as_value(),
        &live.managed_fields(),
        &options.manager,
        schema,
    )?;

    match merged {
        None => {
            let bytes = canonical_bytes(live.as_value())?;
            Ok(DiffResult::new(bytes.clone(), bytes))
        }
        Some(merged) => Ok(DiffResult::new(
            typed_bytes(merged, options)?,
            typed_bytes(live.as_value().clone(), options)?,
        )),
    }
}

fn typed_bytes(mut value: Value, options: &DiffOptions) -> Result<Vec<u8>> {
    if let Some(annotations) = value
        .pointer_mut("/metadata/annotations")
        .and_then(Value::as_object_mut)
    {
        annotations.remove(LAST_APPLIED_CONFIG);
    }
    apply_defaults(&mut value, &options.schema);
    canonical_bytes(&value)
}

/// Diff against the result of a server-side dry-run apply
///
/// With `ignore_mutation_webhook`, fields in the prediction that the manager
/// does not own are reverted to their live values.
pub async fn server_side_diff(
    config: Option<&Resource>,
    live: Option<&Resource>,
    options: &DiffOptions,
    runner: &dyn ServerSideDryRunner,
) -> Result<DiffResult> {
    let (Some(config), Some(live)) = (config, live) else {
        return create_or_delete_diff(config, live);
    };

    let predicted_json = runner.run(config, &options.manager).await?;
    let mut predicted = Resource::from_json(&predicted_json)?;

    if options.ignore_mutation_webhook {
        let managed_fields = predicted.managed_fields();
        if managed_fields.is_empty() {
            return Err(DiffError::MissingManagedFields {
                kind: predicted.kind().to_string(),
                name: predicted.name().to_string(),
            });
        }
        let schema = options.schema.get(&predicted.group_kind());
        let reverted = structured::remove_webhook_mutation(
            predicted.as_value(),
            live.as_value(),
            &managed_fields,
            &options.manager,
            schema,
        )?;
        predicted = Resource::from_value(reverted)?;
    }

    normalize(&mut predicted, options);
    predicted.remove_nested(&["metadata", "managedFields"]);
    let mut live = live.clone();
    live.remove_nested(&["metadata", "managedFields"]);

    Ok(DiffResult::new(
        canonical_bytes(predicted.as_value())?,
        canonical_bytes(live.as_value())?,
    ))
}

fn create_or_delete_diff(config: Option<&Resource>, live: Option<&Resource>) -> Result<DiffResult> {
    match (config, live) {
        (None, Some(live)) => Ok(DiffResult {
            modified: false,
            normalized_live: canonical_bytes(live.as_value())?,
            predicted_live: NULL_BYTES.to_vec(),
        }),
        (Some(config), None) => Ok(DiffResult {
            modified: true,
            normalized_live: NULL_BYTES.to_vec(),
            predicted_live: canonical_bytes(config.as_value())?,
        }),
        (None, None) => Err(DiffError::BothAbsent),
        (Some(_), Some(_)) => Err(DiffError::BothPresent),
    }
}
