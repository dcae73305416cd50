//! Etcd CRD definition
//!
//! An `Etcd` resource declares a single etcd cluster together with its
//! backup-restore sidecar. The operator turns it into a StatefulSet, a peer
//! and a client Service, a bootstrap ConfigMap and a PodDisruptionBudget.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, SecretReference};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default values applied when optional spec fields are unset
pub mod defaults {
    pub const REPLICAS: i32 = 1;
    pub const ETCD_IMAGE: &str = "quay.io/coreos/etcd:v3.3.13";
    pub const BACKUP_IMAGE: &str = "eu.gcr.io/gardener-project/gardener/etcdbrctl:0.8.0";
    pub const CLIENT_PORT: i32 = 2379;
    pub const SERVER_PORT: i32 = 2380;
    pub const BACKUP_PORT: i32 = 8080;
    pub const DEFRAGMENTATION_SCHEDULE: &str = "0 */24 * * *";
    pub const FULL_SNAPSHOT_SCHEDULE: &str = "0 */24 * * *";
    pub const DELTA_SNAPSHOT_PERIOD: &str = "300s";
    pub const DELTA_SNAPSHOT_MEMORY_LIMIT: &str = "100Mi";
    pub const GARBAGE_COLLECTION_PERIOD: &str = "43200s";
    pub const STORAGE_CAPACITY: &str = "5Gi";
    pub const QUOTA: &str = "8Gi";
    /// Backups kept by the `LimitBased` garbage collection policy
    pub const MAX_BACKUPS: i32 = 7;
}

/// Etcd is the Schema for the etcds API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "druid.gardener.cloud",
    version = "v1alpha1",
    kind = "Etcd",
    plural = "etcds",
    shortname = "etcd",
    namespaced,
    status = "EtcdStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"ReadyReplicas", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSpec {
    /// Number of etcd members
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Labels stamped onto every managed object and pod.
    /// Must contain every label of `selector`.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Annotations stamped onto the StatefulSet and its pod template
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Selector for the managed StatefulSet and its pods. Immutable.
    pub selector: LabelSelector,

    /// Size of the data volume of each member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_capacity: Option<Quantity>,

    /// Storage class of the data volume (cluster default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Priority class of the etcd pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Name of the data volume claim template (defaults to the Etcd name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<String>,

    /// etcd process configuration
    #[serde(default)]
    pub etcd: EtcdConfig,

    /// backup-restore sidecar configuration
    #[serde(default)]
    pub backup: BackupSpec,
}

fn default_replicas() -> i32 {
    defaults::REPLICAS
}

/// Configuration of the etcd container
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdConfig {
    /// etcd image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Port serving client traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_port: Option<i32>,

    /// Port serving peer traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i32>,

    /// Metrics level exposed by etcd
    #[serde(default)]
    pub metrics: MetricsLevel,

    /// Cron schedule for defragmenting the backend database
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defragmentation_schedule: Option<String>,

    /// Backend quota
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quantity>,

    /// Compute resources of the etcd container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// TLS configuration; plain HTTP when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl EtcdConfig {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(defaults::ETCD_IMAGE)
    }

    pub fn client_port(&self) -> i32 {
        self.client_port.unwrap_or(defaults::CLIENT_PORT)
    }

    pub fn server_port(&self) -> i32 {
        self.server_port.unwrap_or(defaults::SERVER_PORT)
    }

    pub fn defragmentation_schedule(&self) -> &str {
        self.defragmentation_schedule
            .as_deref()
            .unwrap_or(defaults::DEFRAGMENTATION_SCHEDULE)
    }

    pub fn quota(&self) -> Quantity {
        self.quota
            .clone()
            .unwrap_or_else(|| Quantity(defaults::QUOTA.to_string()))
    }

    /// URL scheme used for client and peer URLs
    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() { "https" } else { "http" }
    }
}

/// Metrics level of etcd
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsLevel {
    #[default]
    Basic,
    Extensive,
}

impl std::fmt::Display for MetricsLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsLevel::Basic => write!(f, "basic"),
            MetricsLevel::Extensive => write!(f, "extensive"),
        }
    }
}

/// References to the secrets holding TLS material
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct TlsConfig {
    /// Certificate and key served on the client port
    #[serde(rename = "clientTLSSecretRef")]
    pub client_tls_secret_ref: SecretReference,

    /// Certificate and key served on the peer port
    #[serde(rename = "serverTLSSecretRef")]
    pub server_tls_secret_ref: SecretReference,

    /// CA bundle used to verify clients and peers
    #[serde(rename = "tlsCASecretRef")]
    pub tls_ca_secret_ref: SecretReference,
}

impl TlsConfig {
    /// Names of all referenced secrets, in a stable order
    pub fn secret_names(&self) -> Vec<String> {
        [
            &self.client_tls_secret_ref,
            &self.server_tls_secret_ref,
            &self.tls_ca_secret_ref,
        ]
        .iter()
        .filter_map(|r| r.name.clone())
        .collect()
    }
}

/// Configuration of the backup-restore sidecar
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// backup-restore image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Port of the sidecar HTTP server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Cron schedule for full snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_snapshot_schedule: Option<String>,

    /// Period between delta snapshots (e.g. "300s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_period: Option<String>,

    /// Memory threshold that forces a delta snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_snapshot_memory_limit: Option<Quantity>,

    /// Snapshot garbage collection policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_policy: Option<GarbageCollectionPolicy>,

    /// Period between garbage collection runs (e.g. "43200s")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub garbage_collection_period: Option<String>,

    /// Backups kept by the `LimitBased` policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backups: Option<i32>,

    /// Compute resources of the sidecar container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Snapshot store; backups are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreSpec>,
}

impl BackupSpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(defaults::BACKUP_IMAGE)
    }

    pub fn port(&self) -> i32 {
        self.port.unwrap_or(defaults::BACKUP_PORT)
    }

    pub fn full_snapshot_schedule(&self) -> &str {
        self.full_snapshot_schedule
            .as_deref()
            .unwrap_or(defaults::FULL_SNAPSHOT_SCHEDULE)
    }

    pub fn delta_snapshot_period(&self) -> &str {
        self.delta_snapshot_period
            .as_deref()
            .unwrap_or(defaults::DELTA_SNAPSHOT_PERIOD)
    }

    pub fn delta_snapshot_memory_limit(&self) -> Quantity {
        self.delta_snapshot_memory_limit
            .clone()
            .unwrap_or_else(|| Quantity(defaults::DELTA_SNAPSHOT_MEMORY_LIMIT.to_string()))
    }

    pub fn garbage_collection_policy(&self) -> GarbageCollectionPolicy {
        self.garbage_collection_policy.unwrap_or_default()
    }

    pub fn garbage_collection_period(&self) -> &str {
        self.garbage_collection_period
            .as_deref()
            .unwrap_or(defaults::GARBAGE_COLLECTION_PERIOD)
    }

    /// Backups kept by the garbage collector; only meaningful for `LimitBased`
    pub fn max_backups(&self) -> Option<i32> {
        match self.garbage_collection_policy() {
            GarbageCollectionPolicy::LimitBased => {
                Some(self.max_backups.unwrap_or(defaults::MAX_BACKUPS))
            }
            GarbageCollectionPolicy::Exponential => None,
        }
    }

    /// Name of the store secret, if a store with a secret is configured
    pub fn store_secret_name(&self) -> Option<&str> {
        self.store
            .as_ref()
            .and_then(|s| s.secret_ref.as_ref())
            .and_then(|r| r.name.as_deref())
    }
}

/// Snapshot garbage collection policy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum GarbageCollectionPolicy {
    #[default]
    Exponential,
    LimitBased,
}

impl std::fmt::Display for GarbageCollectionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GarbageCollectionPolicy::Exponential => write!(f, "Exponential"),
            GarbageCollectionPolicy::LimitBased => write!(f, "LimitBased"),
        }
    }
}

/// Snapshot store reference
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    /// Secret holding the provider credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// Storage provider tag (e.g. "S3", "GCS", "ABS", "Swift", "OSS", "Local")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Bucket or container name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Key prefix inside the container
    #[serde(default)]
    pub prefix: String,
}

/// Status of the Etcd
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdStatus {
    /// Generation of the spec reflected by this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Replicas of the managed StatefulSet
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    #[serde(default)]
    pub current_replicas: i32,

    #[serde(default)]
    pub updated_replicas: i32,

    /// Whether all members are ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,

    /// Name of the client Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Desired cluster size at the time of the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_size: Option<i32>,

    /// Last error encountered while reconciling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-member state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<EtcdMemberStatus>,
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// State of a single etcd member (one pod of the StatefulSet)
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdMemberStatus {
    /// Pod name
    pub name: String,

    /// Stable identifier derived from the pod identity
    pub id: String,

    /// Role reported for the member, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,

    pub status: MemberConditionStatus,

    /// Last time `status` changed
    pub last_transition_time: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MemberRole {
    Leader,
    Member,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum MemberConditionStatus {
    Ready,
    NotReady,
    Unknown,
}

impl std::fmt::Display for MemberConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberConditionStatus::Ready => write!(f, "Ready"),
            MemberConditionStatus::NotReady => write!(f, "NotReady"),
            MemberConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Etcd {
    /// Labels of the selector (`matchLabels` only)
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        self.spec.selector.match_labels.clone().unwrap_or_default()
    }

    /// Name of the data volume claim template
    pub fn volume_claim_template_name(&self) -> String {
        self.spec
            .volume_claim_template
            .clone()
            .unwrap_or_else(|| kube::ResourceExt::name_any(self))
    }

    pub fn storage_capacity(&self) -> Quantity {
        self.spec
            .storage_capacity
            .clone()
            .unwrap_or_else(|| Quantity(defaults::STORAGE_CAPACITY.to_string()))
    }

    /// Names of all secrets that must exist before children are created
    pub fn referenced_secrets(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(store) = self.spec.backup.store_secret_name() {
            names.push(store.to_string());
        }
        if let Some(tls) = &self.spec.etcd.tls {
            names.extend(tls.secret_names());
        }
        names
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
