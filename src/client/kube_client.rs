use std::collections::BTreeMap;

use async_trait::async_trait;
use either::Either;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{
    ClientError, ClusterClient, ClusterResource, DeleteOutcome, FIELD_MANAGER, object_key,
    selector_string,
};

/// [`ClusterClient`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: ClusterResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn kind<K: ClusterResource>() -> String {
    K::kind(&()).to_string()
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

fn namespace_of<K: ClusterResource>(obj: &K) -> Result<String, ClientError> {
    obj.namespace().ok_or_else(|| ClientError::Invalid {
        kind: kind::<K>(),
        key: object_key(obj),
        message: "object has no namespace".to_string(),
    })
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, ClientError> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &format!("{namespace}/{name}")))
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, ClientError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector_string(selector));
        }
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), namespace))?;
        Ok(list.items)
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let ns = namespace_of(obj)?;
        let created = self
            .api::<K>(&ns)
            .create(&post_params(), obj)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &object_key(obj)))?;
        debug!(kind = %kind::<K>(), key = %object_key(obj), "Created object");
        Ok(created)
    }

    async fn update<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let ns = namespace_of(obj)?;
        self.api::<K>(&ns)
            .replace(&obj.name_any(), &post_params(), obj)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &object_key(obj)))
    }

    async fn patch<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K, ClientError> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.api::<K>(namespace)
            .patch(name, &params, &Patch::Merge(patch))
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &format!("{namespace}/{name}")))
    }

    async fn delete<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
        preconditions: Option<Preconditions>,
    ) -> Result<DeleteOutcome, ClientError> {
        let params = DeleteParams {
            preconditions,
            ..DeleteParams::background()
        };
        let outcome = self
            .api::<K>(namespace)
            .delete(name, &params)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &format!("{namespace}/{name}")))?;
        Ok(match outcome {
            Either::Left(_) => DeleteOutcome::Pending,
            Either::Right(_) => DeleteOutcome::Deleted,
        })
    }

    async fn update_status<K: ClusterResource>(&self, obj: &K) -> Result<K, ClientError> {
        let ns = namespace_of(obj)?;
        let data = serde_json::to_vec(obj)?;
        self.api::<K>(&ns)
            .replace_status(&obj.name_any(), &post_params(), data)
            .await
            .map_err(|e| ClientError::from_kube(e, &kind::<K>(), &object_key(obj)))
    }
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient").finish_non_exhaustive()
    }
}
