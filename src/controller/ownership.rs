//! Ownership classification of existing children
//!
//! An object with this Etcd as controller is owned. An object without any
//! controller whose labels satisfy the selector may be adopted, unless an
//! older Etcd in the same namespace would claim it too. Everything else is
//! foreign and never mutated. A StatefulSet is only ours if its immutable
//! selector fits the Etcd, see [`selector_compatible`].

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::{Value, json};

use crate::client::labels_match;
use crate::crd::Etcd;
use crate::resources::{child_labels, owner_reference, pod_labels};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Adoptable,
    /// Not ours to touch; the string says why
    Foreign(String),
}

/// The controlling owner reference, if any
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

pub fn is_controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    controller_of(meta).is_some_and(|r| r.uid == uid)
}

/// The Etcd among `candidates` that claims an unowned object with `labels`:
/// oldest `creationTimestamp` first, then name.
fn claimant<'a>(candidates: &'a [Etcd], meta: &ObjectMeta) -> Option<&'a Etcd> {
    candidates
        .iter()
        .filter(|e| !e.is_being_deleted())
        .filter(|e| {
            let selector = e.selector_labels();
            !selector.is_empty() && labels_match(meta.labels.as_ref(), &selector)
        })
        .min_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

/// Classify `meta` relative to `etcd`, given every Etcd in the namespace
pub fn classify(etcd: &Etcd, candidates: &[Etcd], meta: &ObjectMeta) -> Ownership {
    let uid = etcd.metadata.uid.as_deref().unwrap_or_default();
    if let Some(controller) = controller_of(meta) {
        if controller.uid == uid {
            return Ownership::Owned;
        }
        return Ownership::Foreign(format!(
            "controlled by {} {}",
            controller.kind, controller.name
        ));
    }

    if !labels_match(meta.labels.as_ref(), &etcd.selector_labels()) {
        return Ownership::Foreign("labels do not match the selector".to_string());
    }

    match claimant(candidates, meta) {
        Some(winner) if winner.metadata.uid.as_deref().unwrap_or_default() != uid => {
            Ownership::Foreign(format!("claimed by Etcd {}", winner.name_any()))
        }
        _ => Ownership::Adoptable,
    }
}

/// Whether a StatefulSet selecting `selector` can serve `etcd`: it must
/// select at least the Etcd's selector, and only labels the Etcd puts on its
/// pods so the template keeps matching.
pub fn selector_compatible(etcd: &Etcd, selector: &BTreeMap<String, String>) -> bool {
    let pod_labels = pod_labels(etcd);
    etcd.selector_labels()
        .iter()
        .all(|(k, v)| selector.get(k) == Some(v))
        && selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v))
}

/// Check the selector of an observed StatefulSet, given as JSON
pub fn check_statefulset_selector(etcd: &Etcd, observed: &Value) -> Ownership {
    let selector = observed.pointer("/spec/selector");
    if selector
        .and_then(|s| s.get("matchExpressions"))
        .and_then(Value::as_array)
        .is_some_and(|e| !e.is_empty())
    {
        return Ownership::Foreign("selector uses matchExpressions".to_string());
    }
    let match_labels: BTreeMap<String, String> = selector
        .and_then(|s| s.get("matchLabels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();
    if selector_compatible(etcd, &match_labels) {
        Ownership::Adoptable
    } else {
        Ownership::Foreign(format!(
            "selector {:?} does not fit the Etcd's selector and pod labels",
            match_labels
        ))
    }
}

/// Optimistic merge patch that makes `etcd` the controller of an object.
///
/// Existing non-controller owner references are kept since merge patches
/// replace arrays wholesale.
pub fn adoption_patch(etcd: &Etcd, meta: &ObjectMeta) -> Value {
    let mut owners: Vec<OwnerReference> = meta.owner_references.clone().unwrap_or_default();
    owners.retain(|r| r.controller != Some(true));
    owners.push(owner_reference(etcd));

    json!({
        "metadata": {
            "resourceVersion": meta.resource_version,
            "ownerReferences": owners,
            "labels": child_labels(etcd),
        }
    })
}
