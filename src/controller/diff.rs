//! Three-way diff of desired and observed children
//!
//! Only fields the operator sets are compared. Fields dropped from the
//! desired object since the last applied configuration are nulled. Arrays
//! match when every desired element is contained in the observed element at
//! the same index, so server-side defaults never cause a patch.

use serde_json::{Map, Value, json};

use crate::controller::error::Result;
use crate::resources::{Child, LAST_APPLIED_ANNOTATION};

/// Metadata the API server owns
const SERVER_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
    "generation",
    "managedFields",
    "ownerReferences",
    "finalizers",
    "selfLink",
];

fn remove_path(value: &mut Value, path: &[&str]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(*last);
    }
}

/// Drop server-managed and immutable fields, leaving what the operator manages
pub fn managed_fields(mut value: Value, immutable: &[&[&str]]) -> Value {
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        map.remove("apiVersion");
        map.remove("kind");
    }
    if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA {
            metadata.remove(*field);
        }
        let empty_annotations = match metadata.get_mut("annotations").and_then(Value::as_object_mut)
        {
            Some(annotations) => {
                annotations.remove(LAST_APPLIED_ANNOTATION);
                annotations.is_empty()
            }
            None => false,
        };
        if empty_annotations {
            metadata.remove("annotations");
        }
    }
    for path in immutable {
        remove_path(&mut value, path);
    }
    value
}

/// Whether `observed` contains everything in `desired`
pub fn contains(observed: &Value, desired: &Value) -> bool {
    match (observed, desired) {
        (Value::Object(o), Value::Object(d)) => d
            .iter()
            .all(|(k, dv)| o.get(k).is_some_and(|ov| contains(ov, dv))),
        (Value::Array(o), Value::Array(d)) => {
            o.len() == d.len() && o.iter().zip(d).all(|(ov, dv)| contains(ov, dv))
        }
        (o, d) => o == d,
    }
}

fn diff_value(desired: &Value, observed: Option<&Value>, last: Option<&Value>) -> Option<Value> {
    match (desired, observed) {
        (Value::Object(d), Some(Value::Object(o))) => {
            let last = last.and_then(Value::as_object);
            let mut patch = Map::new();
            for (key, dv) in d {
                if let Some(p) = diff_value(dv, o.get(key), last.and_then(|l| l.get(key))) {
                    patch.insert(key.clone(), p);
                }
            }
            if let Some(last) = last {
                for key in last.keys() {
                    if !d.contains_key(key) && o.get(key).is_some_and(|v| !v.is_null()) {
                        patch.insert(key.clone(), Value::Null);
                    }
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        (Value::Array(_), Some(o @ Value::Array(_))) => {
            let changed_since_last = last.is_some_and(|l| l != desired);
            if contains(o, desired) && !changed_since_last {
                None
            } else {
                Some(desired.clone())
            }
        }
        (d, Some(o)) if d == o => None,
        (d, _) => Some(d.clone()),
    }
}

/// Last applied configuration recorded on an observed object
pub fn last_applied(observed: &Value) -> Option<Value> {
    let raw = observed
        .get("metadata")?
        .get("annotations")?
        .get(LAST_APPLIED_ANNOTATION)?
        .as_str()?;
    serde_json::from_str(raw).ok()
}

/// Merge patch that brings `observed` in line with `desired`.
///
/// Returns `None` when nothing managed differs and the last applied
/// configuration is current. Any returned patch records the new last
/// applied configuration.
pub fn compute_patch(desired: &Value, observed: &Value, immutable: &[&[&str]]) -> Result<Option<Value>> {
    let desired = managed_fields(desired.clone(), immutable);
    let last = last_applied(observed).map(|l| managed_fields(l, immutable));

    let diff = diff_value(&desired, Some(observed), last.as_ref());
    if diff.is_none() && last.as_ref() == Some(&desired) {
        return Ok(None);
    }

    let mut patch = diff.unwrap_or_else(|| json!({}));
    let recorded = serde_json::to_string(&desired)?;
    if let Some(map) = patch.as_object_mut() {
        let metadata = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            let annotations = metadata
                .entry("annotations")
                .or_insert_with(|| json!({}));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(recorded));
            }
        }
    }
    Ok(Some(patch))
}

/// Merge patch for a child, if it needs one
pub fn child_patch(child: &Child, observed: &Value) -> Result<Option<Value>> {
    compute_patch(&child.to_value()?, observed, child.immutable_fields())
}

/// Annotate a child about to be created with its last applied configuration
pub fn with_last_applied(child: &Child) -> Result<Value> {
    let mut value = child.to_value()?;
    let recorded = serde_json::to_string(&managed_fields(value.clone(), child.immutable_fields()))?;
    if let Some(map) = value.as_object_mut() {
        let metadata = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            let annotations = metadata
                .entry("annotations")
                .or_insert_with(|| json!({}));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(LAST_APPLIED_ANNOTATION.to_string(), Value::String(recorded));
            }
        }
    }
    Ok(value)
}
