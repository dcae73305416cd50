//! Reflector-backed watches that feed the work queue
//!
//! Every change to an Etcd or one of its children enqueues the Etcd's key.
//! Only Etcds and StatefulSets are cached; their reflector stores are shared
//! read-only with the owner resolution. The other kinds are plain watches.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::core::ObjectMeta;
use kube::runtime::reflector::{self, ObjectRef, Store, store::Writer};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::ownership::controller_of;
use crate::controller::queue::{ObjectKey, QueueError, WorkQueue};
use crate::crd::Etcd;
use crate::resources::{API_VERSION, INSTANCE_LABEL, KIND};

/// The Etcd that should react to a change of the object described by `meta`.
///
/// Resolution order: a controlling Etcd owner reference, a controlling
/// StatefulSet resolved through `statefulset_owner`, then the `instance`
/// label if an Etcd of that name exists.
pub fn resolve_owner<F, G>(meta: &ObjectMeta, etcd_exists: F, statefulset_owner: G) -> Option<ObjectKey>
where
    F: Fn(&ObjectKey) -> bool,
    G: Fn(&ObjectKey) -> Option<ObjectKey>,
{
    let namespace = meta.namespace.as_deref()?;
    if let Some(owner) = controller_of(meta) {
        if owner.kind == KIND && owner.api_version == API_VERSION {
            return Some(ObjectKey::new(namespace, owner.name.as_str()));
        }
        if owner.kind == "StatefulSet"
            && let Some(key) = statefulset_owner(&ObjectKey::new(namespace, owner.name.as_str()))
        {
            return Some(key);
        }
    }
    let instance = meta.labels.as_ref()?.get(INSTANCE_LABEL)?;
    let key = ObjectKey::new(namespace, instance.as_str());
    etcd_exists(&key).then_some(key)
}

fn object_ref<K: Resource<DynamicType = ()>>(key: &ObjectKey) -> ObjectRef<K> {
    ObjectRef::new(&key.name).within(&key.namespace)
}

fn etcd_in_store(etcds: &Store<Etcd>, key: &ObjectKey) -> bool {
    etcds.get(&object_ref(key)).is_some()
}

fn statefulset_owner(
    etcds: &Store<Etcd>,
    statefulsets: &Store<StatefulSet>,
    key: &ObjectKey,
) -> Option<ObjectKey> {
    let sts = statefulsets.get(&object_ref(key))?;
    resolve_owner(&sts.metadata, |k| etcd_in_store(etcds, k), |_| None)
}

/// Enqueue `key`; returns `false` once the queue is shutting down
pub async fn enqueue(queue: &WorkQueue, key: ObjectKey) -> bool {
    match queue.add(key.clone()).await {
        Ok(()) => true,
        Err(QueueError::Full(capacity)) => {
            warn!(key = %key, capacity, "Work queue full, dropping event");
            true
        }
        Err(QueueError::ShuttingDown) => false,
    }
}

/// Enqueue every key; used by the periodic resync
pub async fn enqueue_all(queue: &WorkQueue, keys: impl IntoIterator<Item = ObjectKey>) -> usize {
    let mut count = 0;
    for key in keys {
        if !enqueue(queue, key).await {
            break;
        }
        count += 1;
    }
    count
}

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch `api`, keeping `writer`'s store up to date
fn cached<K>(
    api: Api<K>,
    writer: Writer<K>,
    config: WatcherConfig,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    reflector::reflector(writer, watcher::watcher(api, config))
        .default_backoff()
        .touched_objects()
}

/// Watch `api` for changes only
fn uncached<K>(
    api: Api<K>,
    config: WatcherConfig,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    watcher::watcher(api, config)
        .default_backoff()
        .touched_objects()
}

fn spawn_watch<K, S, F>(
    stream: S,
    queue: Arc<WorkQueue>,
    owner: F,
    shutdown: CancellationToken,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Send + 'static,
    S: Stream<Item = Result<K, watcher::Error>> + Send + 'static,
    F: Fn(&K) -> Option<ObjectKey> + Send + 'static,
{
    tokio::spawn(async move {
        let kind = K::kind(&()).to_string();
        let mut stream = std::pin::pin!(stream);
        debug!(kind = %kind, "Watch started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(obj)) => {
                        if let Some(key) = owner(&obj)
                            && !enqueue(&queue, key).await
                        {
                            break;
                        }
                    }
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                    None => break,
                },
            }
        }
        debug!(kind = %kind, "Watch stopped");
    })
}

/// Running watches and the caches they maintain
pub struct Watchers {
    pub etcds: Store<Etcd>,
    pub statefulsets: Store<StatefulSet>,
    handles: Vec<JoinHandle<()>>,
}

impl Watchers {
    /// Start one watch per kind, scoped to `namespace` when set
    pub fn start(
        client: Client,
        namespace: Option<&str>,
        queue: Arc<WorkQueue>,
        shutdown: CancellationToken,
    ) -> Self {
        let config = WatcherConfig::default().any_semantic();
        let (etcds, etcd_writer) = reflector::store::<Etcd>();
        let (statefulsets, sts_writer) = reflector::store::<StatefulSet>();

        let owner_of = {
            let etcds = etcds.clone();
            let statefulsets = statefulsets.clone();
            move |meta: &ObjectMeta| {
                resolve_owner(
                    meta,
                    |k| etcd_in_store(&etcds, k),
                    |k| statefulset_owner(&etcds, &statefulsets, k),
                )
            }
        };

        let mut handles = vec![spawn_watch(
            cached(
                scoped_api::<Etcd>(client.clone(), namespace),
                etcd_writer,
                config.clone(),
            ),
            queue.clone(),
            |etcd: &Etcd| ObjectKey::from_object(etcd),
            shutdown.clone(),
        )];

        let owner = owner_of.clone();
        handles.push(spawn_watch(
            cached(
                scoped_api::<StatefulSet>(client.clone(), namespace),
                sts_writer,
                config.clone(),
            ),
            queue.clone(),
            move |obj: &StatefulSet| owner(&obj.metadata),
            shutdown.clone(),
        ));

        let owner = owner_of.clone();
        handles.push(spawn_watch(
            uncached(scoped_api::<Service>(client.clone(), namespace), config.clone()),
            queue.clone(),
            move |obj: &Service| owner(&obj.metadata),
            shutdown.clone(),
        ));

        let owner = owner_of.clone();
        handles.push(spawn_watch(
            uncached(scoped_api::<ConfigMap>(client.clone(), namespace), config.clone()),
            queue.clone(),
            move |obj: &ConfigMap| owner(&obj.metadata),
            shutdown.clone(),
        ));

        let owner = owner_of.clone();
        handles.push(spawn_watch(
            uncached(scoped_api::<PodDisruptionBudget>(client.clone(), namespace), config.clone()),
            queue.clone(),
            move |obj: &PodDisruptionBudget| owner(&obj.metadata),
            shutdown.clone(),
        ));

        // Member pods always carry the instance label
        let owner = owner_of;
        handles.push(spawn_watch(
            uncached(scoped_api::<Pod>(client, namespace), config.labels(INSTANCE_LABEL)),
            queue,
            move |obj: &Pod| owner(&obj.metadata),
            shutdown,
        ));

        Self {
            etcds,
            statefulsets,
            handles,
        }
    }

    /// Wait for the Etcd and StatefulSet caches to complete their first list
    pub async fn wait_until_ready(&self) -> bool {
        self.etcds.wait_until_ready().await.is_ok()
            && self.statefulsets.wait_until_ready().await.is_ok()
    }

    /// Wait for every watch task to finish
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Watch task failed");
            }
        }
    }
}

/// Enqueue every cached Etcd each `period` until shutdown
pub async fn run_resync(
    etcds: Store<Etcd>,
    queue: Arc<WorkQueue>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let keys: Vec<ObjectKey> = etcds
                    .state()
                    .iter()
                    .filter_map(|etcd| ObjectKey::from_object(etcd.as_ref()))
                    .collect();
                let count = enqueue_all(&queue, keys).await;
                info!(count, "Resync enqueued Etcds");
            }
        }
    }
}
