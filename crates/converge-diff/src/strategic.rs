//! Three-way merge patches
//!
//! The patch that turns `current` into `modified` while honouring deletions
//! made since `original` is the union of two partial patches:
//! - the deletions from `original` to `modified`, ignoring changes and additions
//! - the changes from `current` to `modified`, ignoring deletions
//!
//! Fields that only exist in `current` (typically server-populated) are thus
//! left alone unless the user previously set them.
//!
//! In [`MergeMode::Strategic`] keyed lists are merged element by element and
//! primitive set lists by value, using these directives:
//! - `{"<key>": .., "$patch": "delete"}` removes a keyed element
//! - `$deleteFromPrimitiveList/<field>` removes values from a set list
//! - `$setElementOrder/<field>` restores the element order of a keyed list
//!
//! In [`MergeMode::Json`] every list is atomic and the result is an RFC 7386
//! merge patch.

use serde_json::{Map, Value};

use crate::error::{DiffError, Result};
use crate::schema::{KindSchema, ListStrategy};

const PATCH_DIRECTIVE: &str = "$patch";
const DELETE_FROM_PRIMITIVE_LIST: &str = "$deleteFromPrimitiveList/";
const SET_ELEMENT_ORDER: &str = "$setElementOrder/";

/// List semantics used while building and applying a patch
#[derive(Debug, Clone, Copy)]
pub enum MergeMode<'a> {
    Strategic(&'a KindSchema),
    Json,
}

impl MergeMode<'_> {
    fn list_strategy(&self, path: &str) -> ListStrategy {
        match self {
            MergeMode::Strategic(schema) => schema.list_strategy(path),
            MergeMode::Json => ListStrategy::Atomic,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DiffFlags {
    ignore_deletions: bool,
    ignore_changes_and_additions: bool,
}

/// Build the patch that moves `current` to `modified`
pub fn three_way_merge_patch(
    original: &Value,
    modified: &Value,
    current: &Value,
    mode: MergeMode<'_>,
) -> Result<Value> {
    let original = as_object(original, "original")?;
    let modified = as_object(modified, "modified")?;
    let current = as_object(current, "current")?;

    let delta = diff_maps(
        current,
        modified,
        "",
        mode,
        DiffFlags {
            ignore_deletions: true,
            ..DiffFlags::default()
        },
    );
    let deletions = diff_maps(
        original,
        modified,
        "",
        mode,
        DiffFlags {
            ignore_changes_and_additions: true,
            ..DiffFlags::default()
        },
    );
    Ok(Value::Object(merge_patches(deletions, delta)))
}

/// Apply a patch produced by [`three_way_merge_patch`]
pub fn apply_patch(target: &Value, patch: &Value, mode: MergeMode<'_>) -> Result<Value> {
    let mut result = as_object(target, "target")?.clone();
    merge_map(&mut result, as_object(patch, "patch")?, "", mode);
    Ok(Value::Object(result))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| DiffError::Patch {
        message: format!("{} is not an object", what),
    })
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn diff_maps(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
    path: &str,
    mode: MergeMode<'_>,
    flags: DiffFlags,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, original_value) in original {
        match modified.get(key) {
            None => {
                if !flags.ignore_deletions {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(modified_value) if modified_value != original_value => {
                diff_values(
                    key,
                    original_value,
                    modified_value,
                    &child_path(path, key),
                    mode,
                    flags,
                    &mut patch,
                );
            }
            Some(_) => {}
        }
    }

    if !flags.ignore_changes_and_additions {
        for (key, modified_value) in modified {
            if !original.contains_key(key) {
                patch.insert(key.clone(), modified_value.clone());
            }
        }
    }

    patch
}

fn diff_values(
    key: &str,
    original: &Value,
    modified: &Value,
    path: &str,
    mode: MergeMode<'_>,
    flags: DiffFlags,
    patch: &mut Map<String, Value>,
) {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let child = diff_maps(original, modified, path, mode, flags);
            if !child.is_empty() {
                patch.insert(key.to_string(), Value::Object(child));
            }
        }
        (Value::Array(original), Value::Array(modified)) => match mode.list_strategy(path) {
            ListStrategy::Keyed(merge_key)
                if keyed(original, &merge_key) && keyed(modified, &merge_key) =>
            {
                diff_keyed_lists(key, original, modified, &merge_key, path, mode, flags, patch);
            }
            ListStrategy::Set => diff_set_lists(key, original, modified, flags, patch),
            _ => {
                if !flags.ignore_changes_and_additions {
                    patch.insert(key.to_string(), Value::Array(modified.clone()));
                }
            }
        },
        _ => {
            if !flags.ignore_changes_and_additions {
                patch.insert(key.to_string(), modified.clone());
            }
        }
    }
}

/// Every element is an object carrying the merge key
fn keyed(items: &[Value], merge_key: &str) -> bool {
    items.iter().all(|item| item.get(merge_key).is_some())
}

#[allow(clippy::too_many_arguments)]
fn diff_keyed_lists(
    key: &str,
    original: &[Value],
    modified: &[Value],
    merge_key: &str,
    path: &str,
    mode: MergeMode<'_>,
    flags: DiffFlags,
    patch: &mut Map<String, Value>,
) {
    let mut entries = Vec::new();

    for modified_item in modified {
        let id = modified_item.get(merge_key);
        match original.iter().find(|item| item.get(merge_key) == id) {
            None => {
                if !flags.ignore_changes_and_additions {
                    entries.push(modified_item.clone());
                }
            }
            Some(original_item) if original_item != modified_item => {
                if let (Some(original_map), Some(modified_map)) =
                    (original_item.as_object(), modified_item.as_object())
                {
                    let mut child = diff_maps(original_map, modified_map, path, mode, flags);
                    if !child.is_empty() {
                        if let Some(id) = id {
                            child.insert(merge_key.to_string(), id.clone());
                        }
                        entries.push(Value::Object(child));
                    }
                }
            }
            Some(_) => {}
        }
    }

    if !flags.ignore_deletions {
        for original_item in original {
            let id = original_item.get(merge_key);
            if !modified.iter().any(|item| item.get(merge_key) == id) {
                let mut directive = Map::new();
                if let Some(id) = id {
                    directive.insert(merge_key.to_string(), id.clone());
                }
                directive.insert(PATCH_DIRECTIVE.to_string(), Value::from("delete"));
                entries.push(Value::Object(directive));
            }
        }
    }

    let reordered = !flags.ignore_changes_and_additions
        && common_order(modified, original, merge_key) != common_order(original, modified, merge_key);

    if !entries.is_empty() {
        patch.insert(key.to_string(), Value::Array(entries));
    }
    if reordered {
        let order = modified
            .iter()
            .filter_map(|item| item.get(merge_key))
            .map(|id| {
                let mut entry = Map::new();
                entry.insert(merge_key.to_string(), id.clone());
                Value::Object(entry)
            })
            .collect();
        patch.insert(format!("{}{}", SET_ELEMENT_ORDER, key), Value::Array(order));
    }
}

/// Merge keys of `items` that also appear in `other`, in `items` order
fn common_order<'a>(items: &'a [Value], other: &[Value], merge_key: &str) -> Vec<&'a Value> {
    items
        .iter()
        .filter_map(|item| item.get(merge_key))
        .filter(|id| other.iter().any(|o| o.get(merge_key) == Some(*id)))
        .collect()
}

fn diff_set_lists(
    key: &str,
    original: &[Value],
    modified: &[Value],
    flags: DiffFlags,
    patch: &mut Map<String, Value>,
) {
    if !flags.ignore_changes_and_additions {
        let additions: Vec<Value> = modified
            .iter()
            .filter(|item| !original.contains(item))
            .cloned()
            .collect();
        if !additions.is_empty() {
            patch.insert(key.to_string(), Value::Array(additions));
        }
    }
    if !flags.ignore_deletions {
        let deletions: Vec<Value> = original
            .iter()
            .filter(|item| !modified.contains(item))
            .cloned()
            .collect();
        if !deletions.is_empty() {
            patch.insert(
                format!("{}{}", DELETE_FROM_PRIMITIVE_LIST, key),
                Value::Array(deletions),
            );
        }
    }
}

/// Union of two patches over disjoint changes
fn merge_patches(mut base: Map<String, Value>, overlay: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                let merged = merge_patches(std::mem::take(existing), incoming);
                *existing = merged;
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => existing.extend(incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
    base
}

fn merge_map(target: &mut Map<String, Value>, patch: &Map<String, Value>, path: &str, mode: MergeMode<'_>) {
    for (key, value) in patch {
        if let Some(field) = key.strip_prefix(DELETE_FROM_PRIMITIVE_LIST) {
            if let (Some(Value::Array(items)), Value::Array(removed)) = (target.get_mut(field), value) {
                items.retain(|item| !removed.contains(item));
            }
            continue;
        }
        if key.starts_with(SET_ELEMENT_ORDER) || key.starts_with('$') {
            continue;
        }
        if value.is_null() {
            target.remove(key);
            continue;
        }
        let path = child_path(path, key);
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_map(existing, incoming, &path, mode);
            }
            (Some(Value::Array(existing)), Value::Array(incoming)) => {
                merge_list(existing, incoming, &path, mode);
            }
            (_, value) => {
                target.insert(key.clone(), strip_directives(value));
            }
        }
    }

    for (key, order) in patch {
        let (Some(field), Value::Array(order)) = (key.strip_prefix(SET_ELEMENT_ORDER), order) else {
            continue;
        };
        if let Some(Value::Array(items)) = target.get_mut(field) {
            reorder(items, order);
        }
    }
}

fn merge_list(target: &mut Vec<Value>, patch: &[Value], path: &str, mode: MergeMode<'_>) {
    match mode.list_strategy(path) {
        ListStrategy::Keyed(merge_key) => {
            for item in patch {
                let Some(id) = item.get(&merge_key) else {
                    target.push(strip_directives(item));
                    continue;
                };
                if item.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("delete") {
                    target.retain(|existing| existing.get(&merge_key) != Some(id));
                    continue;
                }
                let existing = target
                    .iter_mut()
                    .find(|existing| existing.get(&merge_key) == Some(id));
                match (existing, item) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        merge_map(existing, incoming, path, mode);
                    }
                    (Some(existing), _) => *existing = strip_directives(item),
                    (None, _) => target.push(strip_directives(item)),
                }
            }
        }
        ListStrategy::Set => {
            for item in patch {
                if !target.contains(item) {
                    target.push(item.clone());
                }
            }
        }
        ListStrategy::Atomic => {
            *target = patch.to_vec();
        }
    }
}

/// Place the ordered elements into the slots they already occupy
///
/// Elements not named in `order` keep their position.
fn reorder(items: &mut [Value], order: &[Value]) {
    let Some(merge_key) = order
        .first()
        .and_then(Value::as_object)
        .and_then(|entry| entry.keys().next().cloned())
    else {
        return;
    };
    let position = |item: &Value| {
        let id = item.get(&merge_key)?;
        order
            .iter()
            .position(|entry| entry.get(&merge_key) == Some(id))
    };
    let mut slots: Vec<usize> = Vec::new();
    let mut ordered: Vec<(usize, Value)> = Vec::new();
    for (index, item) in items.iter().enumerate() {
        if let Some(rank) = position(item) {
            slots.push(index);
            ordered.push((rank, item.clone()));
        }
    }
    ordered.sort_by_key(|(rank, _)| *rank);
    for (slot, (_, item)) in slots.into_iter().zip(ordered) {
        items[slot] = item;
    }
}

/// A patch fragment as a plain value: nulls and directives removed
fn strip_directives(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, v)| !key.starts_with('$') && !v.is_null())
                .map(|(key, v)| (key.clone(), strip_directives(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| {
                    item.get(PATCH_DIRECTIVE).and_then(Value::as_str) != Some("delete")
                })
                .map(strip_directives)
                .collect(),
        ),
        other => other.clone(),
    }
}
