//! Secret redaction
//!
//! Secret values are replaced by runs of `+` so that a diff of the redacted
//! objects still tells changed from unchanged without revealing content. Per
//! key, the first distinct value seen across target, live and the live
//! object's last-applied configuration becomes `++++++++`, and each further
//! distinct value gets a run four characters longer.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use converge_core::Resource;
use converge_core::annotations::kubectl::LAST_APPLIED_CONFIG;

use crate::diff::last_applied_config;
use crate::error::Result;
use crate::normalize::normalize_secret;

/// Replacement of the first distinct value of a key
pub const REPLACEMENT: &str = "++++++++";

const REPLACEMENT_STEP: &str = "++++";

/// Redact `data` values and the named annotations of target and live
///
/// The last-applied annotation of live is rewritten from its redacted form,
/// or collapsed to [`REPLACEMENT`] when it is itself one of `hide_annotations`.
/// Inputs are not modified.
pub fn hide_secret_data(
    target: Option<&Resource>,
    live: Option<&Resource>,
    hide_annotations: &BTreeSet<String>,
) -> Result<(Option<Resource>, Option<Resource>)> {
    let mut last_applied = live.and_then(|live| last_applied_config(live).ok().flatten());
    let mut target = target.cloned();
    let mut live = live.cloned();

    let mut keys = BTreeSet::new();
    for object in [target.as_mut(), live.as_mut(), last_applied.as_mut()]
        .into_iter()
        .flatten()
    {
        normalize_secret(object);
        if let Some(data) = object.nested(&["data"]).and_then(Value::as_object) {
            keys.extend(data.keys().cloned());
        }
    }

    {
        let mut objects = [target.as_mut(), live.as_mut(), last_applied.as_mut()];
        hide(&mut objects, &keys, &["data"]);
        hide(&mut objects, hide_annotations, &["metadata", "annotations"]);
    }

    if let (Some(live), Some(last_applied)) = (live.as_mut(), last_applied.as_ref()) {
        let annotation = if hide_annotations.contains(LAST_APPLIED_CONFIG) {
            REPLACEMENT.to_string()
        } else {
            serde_json::to_string(last_applied)?
        };
        live.set_annotation(LAST_APPLIED_CONFIG, &annotation);
    }

    Ok((target, live))
}

fn hide(objects: &mut [Option<&mut Resource>], keys: &BTreeSet<String>, fields: &[&str]) {
    for key in keys {
        let mut next = REPLACEMENT.to_string();
        let mut replacements: HashMap<String, String> = HashMap::new();
        let mut path = fields.to_vec();
        path.push(key.as_str());

        for object in objects.iter_mut().flatten() {
            // data: null
            if matches!(object.nested(fields), Some(Value::Null)) {
                continue;
            }
            let Some(value) = object.nested(&path) else {
                continue;
            };
            let plain = plain_text(value);
            let replacement = replacements
                .entry(plain)
                .or_insert_with(|| {
                    let replacement = next.clone();
                    next.push_str(REPLACEMENT_STEP);
                    replacement
                })
                .clone();
            object.set_nested(&path, Value::String(replacement));
        }
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
