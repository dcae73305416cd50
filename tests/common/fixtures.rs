//! Test fixtures and builders for Etcd resources and their members
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let etcd = create_test_etcd("etcd-main", "default", 3);
//! let etcd = EtcdBuilder::new("etcd-main", "default")
//!     .with_replicas(3)
//!     .with_tls()
//!     .with_backup_store()
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use etcd_druid::client::{ClusterClient, EventPublisher, InMemoryClient, RecordingEventPublisher};
use etcd_druid::config::OperatorConfig;
use etcd_druid::controller::{Context, ObjectKey, Requeue, process};
use etcd_druid::crd::Etcd;
use etcd_druid::health::Metrics;
use etcd_druid::resources::pod_labels;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::{Value, json};

/// Secret names referenced by [`EtcdBuilder::with_backup_store`] and
/// [`EtcdBuilder::with_tls`]
pub const STORE_SECRET: &str = "etcd-backup";
pub const CLIENT_TLS_SECRET: &str = "etcd-client-tls";
pub const SERVER_TLS_SECRET: &str = "etcd-server-tls";
pub const CA_SECRET: &str = "ca-etcd";

/// Create an Etcd with the common test labels, a selector and `replicas` members
pub fn create_test_etcd(name: &str, namespace: &str, replicas: i32) -> Etcd {
    EtcdBuilder::new(name, namespace)
        .with_replicas(replicas)
        .with_uid(&format!("uid-{}", name))
        .build()
}

/// Builder for Etcd test fixtures
pub struct EtcdBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    finalizers: Vec<String>,
    spec: Value,
}

impl EtcdBuilder {
    /// Labels `app=etcd-statefulset`, `role=test`, `instance=<name>`;
    /// selector on `app` and `instance`
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: None,
            generation: Some(1),
            finalizers: Vec::new(),
            spec: json!({
                "replicas": 1,
                "labels": {"app": "etcd-statefulset", "role": "test", "instance": name},
                "annotations": {"app": "etcd-statefulset", "role": "test"},
                "selector": {"matchLabels": {"app": "etcd-statefulset", "instance": name}},
                "storageClass": "gardener.cloud-fast",
                "storageCapacity": "80Gi",
                "priorityClassName": "class_priority",
                "etcd": {
                    "metrics": "basic",
                    "quota": "8Gi",
                    "clientPort": 2379,
                    "serverPort": 2380,
                    "defragmentationSchedule": "0 */24 * * *"
                },
                "backup": {
                    "port": 8080,
                    "fullSnapshotSchedule": "0 */24 * * *",
                    "garbageCollectionPolicy": "LimitBased",
                    "maxBackups": 7,
                    "garbageCollectionPeriod": "43200s",
                    "deltaSnapshotPeriod": "300s",
                    "deltaSnapshotMemoryLimit": "1Gi"
                }
            }),
        }
    }

    pub fn with_replicas(mut self, replicas: i32) -> Self {
        self.spec["replicas"] = json!(replicas);
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.finalizers.push(finalizer.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.spec["labels"][key] = json!(value);
        self
    }

    pub fn with_selector_label(mut self, key: &str, value: &str) -> Self {
        self.spec["selector"]["matchLabels"][key] = json!(value);
        self
    }

    /// Client, server and CA TLS secrets
    pub fn with_tls(mut self) -> Self {
        self.spec["etcd"]["tls"] = json!({
            "clientTLSSecretRef": {"name": CLIENT_TLS_SECRET},
            "serverTLSSecretRef": {"name": SERVER_TLS_SECRET},
            "tlsCASecretRef": {"name": CA_SECRET}
        });
        self
    }

    /// A local snapshot store backed by [`STORE_SECRET`]
    pub fn with_backup_store(mut self) -> Self {
        self.spec["backup"]["store"] = json!({
            "secretRef": {"name": STORE_SECRET},
            "container": "shoot--dev--i308301-1--b3caa",
            "provider": "Local",
            "prefix": "etcd-test"
        });
        self
    }

    /// Set an arbitrary spec field, e.g. `("etcd", "quota", json!("4Gi"))`
    pub fn with_spec_field(mut self, section: &str, field: &str, value: Value) -> Self {
        self.spec[section][field] = value;
        self
    }

    pub fn build(self) -> Etcd {
        Etcd {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                uid: self.uid,
                generation: self.generation,
                finalizers: if self.finalizers.is_empty() {
                    None
                } else {
                    Some(self.finalizers)
                },
                ..Default::default()
            },
            spec: serde_json::from_value(self.spec).expect("fixture spec must deserialize"),
            status: None,
        }
    }
}

/// An Opaque secret with a single key
pub fn secret(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([("key".to_string(), "value".to_string())])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Secrets referenced by `etcd`
pub fn referenced_secrets(etcd: &Etcd) -> Vec<Secret> {
    let namespace = etcd.namespace().unwrap_or_default();
    etcd.referenced_secrets()
        .iter()
        .map(|name| secret(name, &namespace))
        .collect()
}

/// Member pod `<sts>-<ordinal>` controlled by `sts`
pub fn member_pod(etcd: &Etcd, sts: &StatefulSet, ordinal: u32, ready: bool) -> Pod {
    serde_json::from_value(json!({
        "metadata": {
            "name": format!("{}-{}", sts.name_any(), ordinal),
            "namespace": sts.namespace(),
            "labels": pod_labels(etcd),
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "name": sts.name_any(),
                "uid": sts.metadata.uid.clone().unwrap_or_default(),
                "controller": true
            }]
        },
        "spec": {"containers": [{"name": "etcd"}, {"name": "backup-restore"}]},
        "status": {
            "conditions": [{"type": "Ready", "status": if ready { "True" } else { "False" }}]
        }
    }))
    .expect("fixture pod must deserialize")
}

/// A StatefulSet named after `etcd` that nobody owns yet, selecting `selector`
pub fn unowned_statefulset(etcd: &Etcd, selector: BTreeMap<String, String>) -> StatefulSet {
    serde_json::from_value(json!({
        "metadata": {
            "name": etcd.name_any(),
            "namespace": etcd.namespace(),
            "labels": etcd.spec.labels,
        },
        "spec": {
            "replicas": etcd.spec.replicas,
            "serviceName": format!("{}-peer", etcd.name_any()),
            "selector": {"matchLabels": selector},
            "template": {
                "metadata": {"labels": pod_labels(etcd)},
                "spec": {"containers": [{"name": "etcd", "image": "quay.io/coreos/etcd:v3.3.13"}]}
            }
        }
    }))
    .expect("fixture statefulset must deserialize")
}

/// `<etcd>-<ordinal>` carrying the pod labels but no owner
pub fn unowned_member_pod(etcd: &Etcd, ordinal: u32) -> Pod {
    serde_json::from_value(json!({
        "metadata": {
            "name": format!("{}-{}", etcd.name_any(), ordinal),
            "namespace": etcd.namespace(),
            "labels": pod_labels(etcd),
        },
        "spec": {"containers": [{"name": "etcd"}, {"name": "backup-restore"}]},
        "status": {"conditions": [{"type": "Ready", "status": "False"}]}
    }))
    .expect("fixture pod must deserialize")
}

/// The same pod with its etcd container waiting in `reason`
pub fn waiting(mut pod: Pod, reason: &str) -> Pod {
    let mut status = serde_json::to_value(pod.status.take().unwrap_or_default()).unwrap();
    status["containerStatuses"] = json!([{
        "name": "etcd",
        "image": "quay.io/coreos/etcd:v3.3.13",
        "imageID": "",
        "ready": false,
        "restartCount": 4,
        "state": {"waiting": {"reason": reason, "message": "back-off restarting failed container"}}
    }]);
    pod.status = Some(serde_json::from_value(status).unwrap());
    pod
}

/// StatefulSet status reporting every desired replica as ready
pub fn with_ready_status(mut sts: StatefulSet) -> StatefulSet {
    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    sts.status = Some(
        serde_json::from_value(json!({
            "replicas": replicas,
            "readyReplicas": replicas,
            "currentReplicas": replicas,
            "updatedReplicas": replicas
        }))
        .unwrap(),
    );
    sts
}

/// Reconciliation context backed by an in-memory API server
pub struct Harness {
    pub client: Arc<InMemoryClient>,
    pub events: Arc<RecordingEventPublisher>,
    pub metrics: Arc<Metrics>,
    pub ctx: Context<InMemoryClient>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(&OperatorConfig::default())
    }

    pub fn with_config(config: &OperatorConfig) -> Self {
        let client = Arc::new(InMemoryClient::new());
        let events = Arc::new(RecordingEventPublisher::new());
        let metrics = Arc::new(Metrics::new());
        let publisher: Arc<dyn EventPublisher> = events.clone();
        let ctx = Context::new(client.clone(), publisher, metrics.clone(), config);
        Self {
            client,
            events,
            metrics,
            ctx,
        }
    }

    /// One pass for `etcd` with the default timeout
    pub async fn pass(&self, etcd: &Etcd) -> Requeue {
        let key = ObjectKey::from_object(etcd).expect("etcd must have a namespace and name");
        process(&key, &self.ctx, Duration::from_secs(120)).await
    }

    pub async fn etcd(&self, namespace: &str, name: &str) -> Option<Etcd> {
        self.client.get::<Etcd>(namespace, name).await.unwrap()
    }

    /// Seed `etcd` and its referenced secrets, then run passes until the
    /// finalizer is in place and the children exist
    pub async fn converge(&self, etcd: &Etcd) -> Requeue {
        let namespace = etcd.namespace().unwrap_or_default();
        for secret in referenced_secrets(etcd) {
            self.client.seed(&secret).await.unwrap();
        }
        self.client.seed(etcd).await.unwrap();
        assert_eq!(self.pass(etcd).await, Requeue::After(Duration::ZERO));
        let requeue = self.pass(etcd).await;
        assert!(self.etcd(&namespace, &etcd.name_any()).await.is_some());
        requeue
    }

    /// Mark the stored StatefulSet ready and seed `ready` member pods
    pub async fn bring_up_members(&self, etcd: &Etcd) -> StatefulSet {
        let namespace = etcd.namespace().unwrap_or_default();
        let sts: StatefulSet = self
            .client
            .get(&namespace, &etcd.name_any())
            .await
            .unwrap()
            .expect("statefulset must exist");
        let sts = self.client.seed(&with_ready_status(sts)).await.unwrap();
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        for ordinal in 0..replicas {
            let pod = member_pod(etcd, &sts, ordinal as u32, true);
            self.client.seed(&pod).await.unwrap();
        }
        sts
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
