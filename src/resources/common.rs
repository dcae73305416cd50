//! Common utilities for Kubernetes resource generation
//!
//! Shared naming, labelling and ownership helpers so that every child of an
//! `Etcd` is identified the same way.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::Etcd;

/// API version for the Etcd CRD
pub const API_VERSION: &str = "druid.gardener.cloud/v1alpha1";

/// Kind for the Etcd CRD
pub const KIND: &str = "Etcd";

/// Value of the managed-by label
pub const MANAGED_BY: &str = "etcd-druid";

pub const INSTANCE_LABEL: &str = "instance";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Pod label carrying an etcd member's role (`Leader`/`Member`)
pub const ROLE_LABEL: &str = "druid.gardener.cloud/role";

/// Last configuration applied by the operator, used for three-way diffs
pub const LAST_APPLIED_ANNOTATION: &str = "druid.gardener.cloud/last-applied-configuration";

/// Pod template annotation that rolls the stateful set on config changes
pub const CONFIG_CHECKSUM_ANNOTATION: &str = "checksum/etcd-configmap";

pub fn peer_service_name(etcd_name: &str) -> String {
    format!("{}-peer", etcd_name)
}

pub fn client_service_name(etcd_name: &str) -> String {
    format!("{}-client", etcd_name)
}

pub fn configmap_name(etcd_name: &str) -> String {
    format!("{}-bootstrap", etcd_name)
}

pub fn pdb_name(etcd_name: &str) -> String {
    etcd_name.to_string()
}

pub fn statefulset_name(etcd_name: &str) -> String {
    etcd_name.to_string()
}

/// Generate an owner reference for an Etcd
///
/// Children carry it as their controller so the garbage collector removes
/// them if the Etcd disappears without the finalizer running.
pub fn owner_reference(etcd: &Etcd) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: etcd.name_any(),
        uid: etcd.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels on every child: the user's labels plus `instance` and managed-by
pub fn child_labels(etcd: &Etcd) -> BTreeMap<String, String> {
    let mut labels = pod_labels(etcd);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    labels
}

/// Labels on the pod template: the user's labels plus `instance`
pub fn pod_labels(etcd: &Etcd) -> BTreeMap<String, String> {
    let mut labels = etcd.spec.labels.clone();
    labels.insert(INSTANCE_LABEL.to_string(), etcd.name_any());
    labels
}

/// Convert a memory quantity (`8Gi`, `100Mi`, `500M`, `1024`) to bytes.
///
/// Returns `None` for malformed values, fractional byte counts and overflow.
pub fn quantity_to_bytes(quantity: &Quantity) -> Option<i64> {
    let raw = quantity.0.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    if number.is_empty() {
        return None;
    }

    let multiplier: i64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };

    if let Ok(whole) = number.parse::<i64>() {
        return whole.checked_mul(multiplier);
    }
    let value = number.parse::<f64>().ok()? * multiplier as f64;
    if value.fract() != 0.0 || !value.is_finite() || value > i64::MAX as f64 {
        return None;
    }
    Some(value as i64)
}
