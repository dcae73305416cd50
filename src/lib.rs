pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use client::{ClusterClient, InMemoryClient, KubeClient};
pub use config::{ConfigError, OperatorConfig};
pub use controller::{
    BackoffConfig, Context, Error, FINALIZER, ObjectKey, Requeue, Result, WorkQueue, reconcile,
};
pub use crd::Etcd;
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use client::{EventPublisher, KubeEventPublisher};
use controller::watch::{Watchers, run_resync};
use controller::run_worker;
use resources::MANAGED_BY;

/// Run the operator until `shutdown` is cancelled.
///
/// Starts the watches, waits for their caches, then runs `config.workers`
/// workers against a shared queue. On shutdown the workers stop first so
/// interrupted keys are put back, then the queue and the watches close.
pub async fn run_operator(
    client: kube::Client,
    config: OperatorConfig,
    health_state: Arc<HealthState>,
    shutdown: CancellationToken,
) {
    let scope = config.watch_namespace.as_deref().unwrap_or("cluster-wide");
    info!(
        scope,
        workers = config.workers,
        resync_period = ?config.resync_period,
        "Starting Etcd controller"
    );

    let queue = Arc::new(WorkQueue::new(config.queue_capacity, config.backoff.clone()));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), MANAGED_BY));
    let ctx = Arc::new(Context::new(
        Arc::new(KubeClient::new(client.clone())),
        events,
        health_state.metrics.clone(),
        &config,
    ));

    let watch_shutdown = CancellationToken::new();
    let watchers = Watchers::start(
        client,
        config.watch_namespace.as_deref(),
        queue.clone(),
        watch_shutdown.clone(),
    );

    tokio::select! {
        _ = shutdown.cancelled() => {
            watch_shutdown.cancel();
            queue.shutdown().await;
            watchers.join().await;
            return;
        }
        synced = watchers.wait_until_ready() => {
            if synced {
                info!("Caches synced");
                health_state.set_ready(true).await;
            } else {
                warn!("Watch caches closed before syncing");
            }
        }
    }

    let resync = tokio::spawn(run_resync(
        watchers.etcds.clone(),
        queue.clone(),
        config.resync_period,
        watch_shutdown.clone(),
    ));

    let workers: Vec<_> = (0..config.workers)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                queue.clone(),
                ctx.clone(),
                config.reconcile_timeout,
                shutdown.clone(),
            ))
        })
        .collect();

    shutdown.cancelled().await;
    info!("Shutting down Etcd controller");
    health_state.set_ready(false).await;

    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Worker task failed");
        }
    }
    queue.shutdown().await;
    watch_shutdown.cancel();
    if let Err(e) = resync.await {
        warn!(error = %e, "Resync task failed");
    }
    watchers.join().await;
    info!("Etcd controller stopped");
}
