//! Service generation for etcd clusters
//!
//! Every Etcd gets two services:
//! - `<name>-peer`: headless, publishes not-ready addresses so members can
//!   find each other while bootstrapping
//! - `<name>-client`: ClusterIP for etcd clients and the backup-restore API

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Etcd;
use crate::resources::common::{
    child_labels, client_service_name, owner_reference, peer_service_name,
};

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the headless peer service used as the stateful set's governing service
pub fn generate_peer_service(etcd: &Etcd) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(peer_service_name(&etcd.name_any())),
            namespace: etcd.namespace(),
            labels: Some(child_labels(etcd)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(etcd.selector_labels()),
            ports: Some(vec![port("server", etcd.spec.etcd.server_port())]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client service exposing the client, peer and backup ports
pub fn generate_client_service(etcd: &Etcd) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(client_service_name(&etcd.name_any())),
            namespace: etcd.namespace(),
            labels: Some(child_labels(etcd)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(etcd.selector_labels()),
            ports: Some(vec![
                port("client", etcd.spec.etcd.client_port()),
                port("server", etcd.spec.etcd.server_port()),
                port("backuprestore", etcd.spec.backup.port()),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
