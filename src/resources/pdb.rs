//! PodDisruptionBudget generation for etcd clusters
//!
//! Voluntary disruptions must never cost the cluster its quorum.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Etcd;
use crate::resources::common::{child_labels, owner_reference, pdb_name};

/// Members that must stay available: the quorum size for multi-member
/// clusters, zero for a single member (which cannot survive any disruption).
pub fn min_available(replicas: i32) -> i32 {
    if replicas > 1 { replicas / 2 + 1 } else { 0 }
}

/// Generate a PodDisruptionBudget for the cluster
pub fn generate_pdb(etcd: &Etcd) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(&etcd.name_any())),
            namespace: etcd.namespace(),
            labels: Some(child_labels(etcd)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available(etcd.spec.replicas))),
            selector: Some(LabelSelector {
                match_labels: Some(etcd.selector_labels()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
