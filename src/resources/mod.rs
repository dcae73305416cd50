//! Desired state of an Etcd's children
//!
//! [`build`] is pure: the same Etcd always yields the same objects, in the
//! order they are created.

pub mod common;
pub mod configmap;
pub mod pdb;
pub mod service;
pub mod statefulset;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::core::ObjectMeta;
use serde_json::Value;

use crate::controller::error::Result;
use crate::crd::Etcd;

pub use common::{
    API_VERSION, CONFIG_CHECKSUM_ANNOTATION, INSTANCE_LABEL, KIND, LAST_APPLIED_ANNOTATION,
    MANAGED_BY, MANAGED_BY_LABEL, ROLE_LABEL, child_labels, owner_reference, pod_labels,
};

/// A child object of an Etcd
#[derive(Clone, Debug, PartialEq)]
pub enum Child {
    Service(Service),
    ConfigMap(ConfigMap),
    PodDisruptionBudget(PodDisruptionBudget),
    StatefulSet(StatefulSet),
}

const SERVICE_IMMUTABLE: &[&[&str]] = &[&["spec", "clusterIP"], &["spec", "clusterIPs"]];

const STATEFULSET_IMMUTABLE: &[&[&str]] = &[
    &["spec", "selector"],
    &["spec", "serviceName"],
    &["spec", "volumeClaimTemplates"],
    &["spec", "podManagementPolicy"],
];

impl Child {
    pub fn kind(&self) -> &'static str {
        match self {
            Child::Service(_) => "Service",
            Child::ConfigMap(_) => "ConfigMap",
            Child::PodDisruptionBudget(_) => "PodDisruptionBudget",
            Child::StatefulSet(_) => "StatefulSet",
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Child::Service(o) => &o.metadata,
            Child::ConfigMap(o) => &o.metadata,
            Child::PodDisruptionBudget(o) => &o.metadata,
            Child::StatefulSet(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    /// The object as sent to the API server
    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Child::Service(o) => serde_json::to_value(o),
            Child::ConfigMap(o) => serde_json::to_value(o),
            Child::PodDisruptionBudget(o) => serde_json::to_value(o),
            Child::StatefulSet(o) => serde_json::to_value(o),
        }
    }

    /// Paths the API server refuses to change after creation
    pub fn immutable_fields(&self) -> &'static [&'static [&'static str]] {
        match self {
            Child::Service(_) => SERVICE_IMMUTABLE,
            Child::StatefulSet(_) => STATEFULSET_IMMUTABLE,
            Child::ConfigMap(_) | Child::PodDisruptionBudget(_) => &[],
        }
    }
}

/// Every child of one Etcd
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredSet {
    /// In creation order
    pub children: Vec<Child>,
    /// sha256 of the bootstrap ConfigMap data
    pub config_checksum: String,
}

impl DesiredSet {
    pub fn creation_order(&self) -> impl Iterator<Item = &Child> {
        self.children.iter()
    }

    pub fn statefulset(&self) -> Option<&StatefulSet> {
        self.children.iter().find_map(|c| match c {
            Child::StatefulSet(sts) => Some(sts),
            _ => None,
        })
    }
}

/// The children of an Etcd, named by role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildKind {
    PeerService,
    ClientService,
    ConfigMap,
    PodDisruptionBudget,
    StatefulSet,
}

/// The order children are created in; deletion runs it backwards
pub const CREATION_ORDER: [ChildKind; 5] = [
    ChildKind::PeerService,
    ChildKind::ClientService,
    ChildKind::ConfigMap,
    ChildKind::PodDisruptionBudget,
    ChildKind::StatefulSet,
];

impl ChildKind {
    /// Name of this child for the Etcd `etcd_name`
    pub fn object_name(self, etcd_name: &str) -> String {
        match self {
            ChildKind::PeerService => common::peer_service_name(etcd_name),
            ChildKind::ClientService => common::client_service_name(etcd_name),
            ChildKind::ConfigMap => common::configmap_name(etcd_name),
            ChildKind::PodDisruptionBudget => common::pdb_name(etcd_name),
            ChildKind::StatefulSet => common::statefulset_name(etcd_name),
        }
    }
}

pub fn deletion_order() -> impl Iterator<Item = ChildKind> {
    CREATION_ORDER.into_iter().rev()
}

/// Compute the children of `etcd` in [`CREATION_ORDER`]
pub fn build(etcd: &Etcd) -> Result<DesiredSet> {
    let configmap = configmap::generate_configmap(etcd)?;
    let config_checksum = configmap::data_checksum(&configmap.data.clone().unwrap_or_default());

    let children = CREATION_ORDER
        .iter()
        .map(|kind| match kind {
            ChildKind::PeerService => Child::Service(service::generate_peer_service(etcd)),
            ChildKind::ClientService => Child::Service(service::generate_client_service(etcd)),
            ChildKind::ConfigMap => Child::ConfigMap(configmap.clone()),
            ChildKind::PodDisruptionBudget => {
                Child::PodDisruptionBudget(pdb::generate_pdb(etcd))
            }
            ChildKind::StatefulSet => Child::StatefulSet(statefulset::generate_statefulset(
                etcd,
                &config_checksum,
            )),
        })
        .collect();

    Ok(DesiredSet {
        children,
        config_checksum,
    })
}
