use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClusterClient, EventPublisher};
use crate::config::OperatorConfig;
use crate::controller::error::BackoffConfig;
use crate::controller::remediation::Remediator;
use crate::health::Metrics;

/// Requeue delay while members are still becoming ready
pub const NOT_READY_REQUEUE: Duration = Duration::from_secs(10);

/// Shared context for reconciliation passes
pub struct Context<C: ClusterClient> {
    /// Cluster client
    pub client: Arc<C>,
    pub events: Arc<dyn EventPublisher>,
    pub metrics: Arc<Metrics>,
    pub remediator: Remediator,
    pub backoff: BackoffConfig,
    /// Requeue delay for converged Etcds
    pub resync_period: Duration,
    pub not_ready_requeue: Duration,
}

impl<C: ClusterClient> Context<C> {
    pub fn new(
        client: Arc<C>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<Metrics>,
        config: &OperatorConfig,
    ) -> Self {
        Self {
            client,
            events,
            metrics,
            remediator: Remediator::new(config.remediation.clone()),
            backoff: config.backoff.clone(),
            resync_period: config.resync_period,
            not_ready_requeue: NOT_READY_REQUEUE,
        }
    }
}
