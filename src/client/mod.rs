//! Typed access to cluster objects
//!
//! The reconciler only talks to the cluster through [`ClusterClient`]. The
//! production implementation wraps `kube::Api`; [`InMemoryClient`] models the
//! API server's object semantics for tests and dry runs.

pub mod events;
mod kube_client;
mod memory;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use events::{EventPublisher, KubeEventPublisher, RecordedEvent, RecordingEventPublisher};
pub use kube::api::Preconditions;
pub use kube_client::KubeClient;
pub use memory::{Fault, InMemoryClient, Mutation, Verb};

/// Field manager reported on every write
pub const FIELD_MANAGER: &str = "etcd-druid";

/// Namespaced object kinds the operator reads and writes
pub trait ClusterResource:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Errors returned by [`ClusterClient`] operations
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },

    /// Optimistic concurrency failure: re-read before retrying
    #[error("conflict on {kind} {key}: {message}")]
    Conflict {
        kind: String,
        key: String,
        message: String,
    },

    #[error("invalid {kind} {key}: {message}")]
    Invalid {
        kind: String,
        key: String,
        message: String,
    },

    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Connection, TLS or watch failures below the HTTP status layer
    #[error("Kubernetes transport error: {0}")]
    Transport(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Classify a `kube::Error` for the object `kind` `key`
    pub fn from_kube(err: kube::Error, kind: &str, key: &str) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClientError::NotFound {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 if resp.reason == "AlreadyExists" => ClientError::AlreadyExists {
                    kind: kind.to_string(),
                    key: key.to_string(),
                },
                409 => ClientError::Conflict {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    message: resp.message,
                },
                422 => ClientError::Invalid {
                    kind: kind.to_string(),
                    key: key.to_string(),
                    message: resp.message,
                },
                code => ClientError::Api {
                    code,
                    message: resp.message,
                },
            },
            other => ClientError::Transport(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClientError::AlreadyExists { .. })
    }
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The object is gone
    Deleted,
    /// Deletion was accepted but the object still exists (finalizers)
    Pending,
}

/// Read/write access to namespaced cluster objects with optimistic concurrency.
///
/// All calls are cancelled by dropping the returned future.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Fetch an object; a missing object is `Ok(None)`
    async fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClientError>;

    /// List objects whose labels contain every entry of `selector`
    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError>;

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError>;

    /// Replace an object; fails with `Conflict` on a stale `resourceVersion`
    async fn update<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError>;

    /// Apply a JSON merge patch. A `metadata.resourceVersion` inside the
    /// patch makes it conditional.
    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError>;

    async fn delete<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> Result<DeleteOutcome, ClientError>;

    /// Replace the status subresource
    async fn update_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError>;
}

/// Render a label map as a selector string (`k1=v1,k2=v2`)
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether `labels` contains every entry of `selector`
pub fn labels_match(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

/// `namespace/name` of an object, for messages
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    let meta = obj.meta();
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}
