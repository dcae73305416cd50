//! Functional tests for etcd-druid
//!
//! Each test creates its own namespace and operator instance, then drives an
//! Etcd through the real API server with watch-based waiting.
//!
//! Run with: cargo test --test integration -- --ignored

use std::time::Duration;

use etcd_druid::controller::status::reasons;
use etcd_druid::FINALIZER;
use etcd_druid::crd::Etcd;
use etcd_druid::resources::common::{
    client_service_name, configmap_name, pdb_name, peer_service_name, statefulset_name,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;

use crate::common::{EtcdBuilder, STORE_SECRET, secret};
use crate::{
    SHORT_TIMEOUT, ScopedOperator, TestNamespace, ensure_crd_installed, has_finalizer,
    is_not_ready_because, is_observed, wait_for_etcd, wait_for_resource,
    wait_for_resource_deletion,
};

const NAME: &str = "etcd-it";

/// Initialize tracing, install the CRD and start an operator in a fresh namespace
async fn init_test(prefix: &str) -> (Client, TestNamespace, ScopedOperator) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn")
        .with_test_writer()
        .try_init();

    let client = Client::try_default().await.expect("create client");
    ensure_crd_installed(client.clone())
        .await
        .expect("install CRD");
    let ns = TestNamespace::create(client.clone(), prefix)
        .await
        .expect("create namespace");
    let operator = ScopedOperator::start(client.clone(), ns.name()).await;
    assert!(
        operator.wait_ready(Duration::from_secs(30)).await,
        "operator caches never synced"
    );
    (client, ns, operator)
}

/// Strip server-managed fields so the fixture can be created for real
fn fresh(etcd: Etcd) -> Etcd {
    let mut etcd = etcd;
    etcd.metadata.uid = None;
    etcd.metadata.generation = None;
    etcd
}

async fn create_etcd(api: &Api<Etcd>, etcd: Etcd) -> Etcd {
    api.create(&PostParams::default(), &fresh(etcd))
        .await
        .expect("create etcd")
}

fn assert_controlled_by<K: Resource>(child: &K, etcd: &Etcd) {
    let owner = child
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
        .expect("child has a controller");
    assert_eq!(owner.kind, "Etcd");
    assert_eq!(Some(&owner.uid), etcd.metadata.uid.as_ref());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_etcd_creates_children() {
    let (client, ns, operator) = init_test("druid-create").await;
    let etcds: Api<Etcd> = Api::namespaced(client.clone(), ns.name());

    let etcd = create_etcd(&etcds, EtcdBuilder::new(NAME, ns.name()).with_replicas(3).build()).await;
    wait_for_etcd(&etcds, NAME, has_finalizer(FINALIZER), SHORT_TIMEOUT)
        .await
        .expect("finalizer added");

    let services: Api<Service> = Api::namespaced(client.clone(), ns.name());
    let peer = wait_for_resource(&services, &peer_service_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("peer service");
    assert_eq!(
        peer.spec.as_ref().and_then(|s| s.cluster_ip.as_deref()),
        Some("None")
    );
    assert_controlled_by(&peer, &etcd);

    let client_svc = wait_for_resource(&services, &client_service_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("client service");
    assert_controlled_by(&client_svc, &etcd);

    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), ns.name());
    let cm = wait_for_resource(&configmaps, &configmap_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("bootstrap configmap");
    assert_controlled_by(&cm, &etcd);

    let pdbs: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), ns.name());
    let pdb = wait_for_resource(&pdbs, &pdb_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("pdb");
    assert_eq!(
        pdb.spec.as_ref().and_then(|s| s.min_available.clone()),
        Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(2))
    );

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    let sts = wait_for_resource(&statefulsets, &statefulset_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("statefulset");
    assert_eq!(sts.spec.as_ref().and_then(|s| s.replicas), Some(3));
    assert_controlled_by(&sts, &etcd);

    wait_for_etcd(&etcds, NAME, is_observed(), SHORT_TIMEOUT)
        .await
        .expect("generation observed");

    operator.stop().await;
    ns.cleanup().await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_scale_out_updates_statefulset() {
    let (client, ns, operator) = init_test("druid-scale").await;
    let etcds: Api<Etcd> = Api::namespaced(client.clone(), ns.name());
    create_etcd(&etcds, EtcdBuilder::new(NAME, ns.name()).build()).await;
    wait_for_etcd(&etcds, NAME, is_observed(), SHORT_TIMEOUT)
        .await
        .expect("first generation observed");

    etcds
        .patch(
            NAME,
            &PatchParams::default(),
            &Patch::Merge(json!({"spec": {"replicas": 3}})),
        )
        .await
        .expect("scale out");
    let etcd = wait_for_etcd(&etcds, NAME, is_observed(), SHORT_TIMEOUT)
        .await
        .expect("second generation observed");
    assert_eq!(etcd.metadata.generation, Some(2));

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    let sts = statefulsets.get(&statefulset_name(NAME)).await.expect("statefulset");
    assert_eq!(sts.spec.as_ref().and_then(|s| s.replicas), Some(3));

    operator.stop().await;
    ns.cleanup().await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_missing_store_secret_blocks_until_created() {
    let (client, ns, operator) = init_test("druid-secret").await;
    let etcds: Api<Etcd> = Api::namespaced(client.clone(), ns.name());
    create_etcd(
        &etcds,
        EtcdBuilder::new(NAME, ns.name()).with_backup_store().build(),
    )
    .await;

    wait_for_etcd(
        &etcds,
        NAME,
        is_not_ready_because(reasons::SECRET_NOT_FOUND),
        SHORT_TIMEOUT,
    )
    .await
    .expect("secret reported missing");
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    assert!(
        statefulsets
            .get_opt(&statefulset_name(NAME))
            .await
            .expect("get statefulset")
            .is_none()
    );

    let secrets: Api<Secret> = Api::namespaced(client.clone(), ns.name());
    secrets
        .create(&PostParams::default(), &secret(STORE_SECRET, ns.name()))
        .await
        .expect("create store secret");

    // Secrets are not watched; the backoff requeue picks the change up
    wait_for_resource(&statefulsets, &statefulset_name(NAME), Duration::from_secs(120))
        .await
        .expect("statefulset after secret");

    operator.stop().await;
    ns.cleanup().await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_invalid_spec_reported() {
    let (client, ns, operator) = init_test("druid-invalid").await;
    let etcds: Api<Etcd> = Api::namespaced(client.clone(), ns.name());
    create_etcd(&etcds, EtcdBuilder::new(NAME, ns.name()).with_replicas(0).build()).await;

    let etcd = wait_for_etcd(
        &etcds,
        NAME,
        is_not_ready_because(reasons::INVALID_SPEC),
        SHORT_TIMEOUT,
    )
    .await
    .expect("invalid spec reported");
    assert_eq!(
        etcd.status.as_ref().and_then(|s| s.observed_generation),
        None
    );

    operator.stop().await;
    ns.cleanup().await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires Kubernetes cluster"]
async fn test_deletion_removes_children_and_finalizer() {
    let (client, ns, operator) = init_test("druid-delete").await;
    let etcds: Api<Etcd> = Api::namespaced(client.clone(), ns.name());
    create_etcd(&etcds, EtcdBuilder::new(NAME, ns.name()).build()).await;
    wait_for_etcd(&etcds, NAME, is_observed(), SHORT_TIMEOUT)
        .await
        .expect("generation observed");

    etcds
        .delete(NAME, &DeleteParams::default())
        .await
        .expect("delete etcd");
    wait_for_resource_deletion(&etcds, NAME, SHORT_TIMEOUT)
        .await
        .expect("etcd gone");

    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), ns.name());
    wait_for_resource_deletion(&statefulsets, &statefulset_name(NAME), SHORT_TIMEOUT)
        .await
        .expect("statefulset gone");
    let services: Api<Service> = Api::namespaced(client.clone(), ns.name());
    let remaining: Vec<String> = services
        .list(&Default::default())
        .await
        .expect("list services")
        .items
        .iter()
        .map(|s| s.name_any())
        .filter(|n| n.starts_with(NAME))
        .collect();
    assert!(remaining.is_empty(), "leftover services: {:?}", remaining);

    operator.stop().await;
    ns.cleanup().await.expect("cleanup");
}
