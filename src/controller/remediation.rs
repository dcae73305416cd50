//! Crash-loop remediation for etcd member pods
//!
//! A member whose container is stuck waiting with a configured reason
//! (`CrashLoopBackOff` by default) is deleted so the StatefulSet recreates
//! it with fresh state. Each pod is deleted at most once per backoff window.

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::events::{actions, reasons};
use crate::client::{ClusterClient, EventPublisher, Preconditions};
use crate::controller::error::Result;
use crate::controller::ownership::{controller_of, is_controlled_by};

/// Container waiting reasons that trigger remediation by default
pub const DEFAULT_REASONS: &[&str] = &["CrashLoopBackOff"];

/// Remediation settings
#[derive(Clone, Debug)]
pub struct RemediationConfig {
    pub reasons: Vec<String>,
    /// Minimum time between two deletions of the same pod
    pub backoff: Duration,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            reasons: DEFAULT_REASONS.iter().map(|r| r.to_string()).collect(),
            backoff: Duration::from_secs(60),
        }
    }
}

/// The first container (init containers included) waiting with one of `reasons`
pub fn stuck_container<'a>(pod: &'a Pod, reasons: &[String]) -> Option<(&'a str, &'a str)> {
    let status = pod.status.as_ref()?;
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .find_map(|cs| {
            let reason = cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref()?;
            reasons
                .iter()
                .any(|r| r == reason)
                .then_some((cs.name.as_str(), reason))
        })
}

/// Whether `pod` is a member of `sts`: controlled by it, or unowned and
/// named `<sts>-<ordinal>`
pub fn is_member(pod: &Pod, sts: &StatefulSet) -> bool {
    let meta = pod.meta();
    if let Some(uid) = sts.metadata.uid.as_deref()
        && is_controlled_by(meta, uid)
    {
        return true;
    }
    if controller_of(meta).is_some() {
        return false;
    }
    let prefix = format!("{}-", sts.name_any());
    pod.name_any()
        .strip_prefix(&prefix)
        .is_some_and(|ordinal| !ordinal.is_empty() && ordinal.bytes().all(|b| b.is_ascii_digit()))
}

fn pod_reference(pod: &Pod) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Pod".to_string()),
        name: pod.metadata.name.clone(),
        namespace: pod.metadata.namespace.clone(),
        uid: pod.metadata.uid.clone(),
        ..Default::default()
    }
}

/// Deletes crash-looping member pods, rate limited per pod
pub struct Remediator {
    config: RemediationConfig,
    /// Last deletion per `namespace/pod`
    last_deleted: Mutex<HashMap<String, Instant>>,
}

impl Remediator {
    pub fn new(config: RemediationConfig) -> Self {
        Self {
            config,
            last_deleted: Mutex::new(HashMap::new()),
        }
    }

    /// Delete stuck members of `sts` among `pods`; returns the deleted pod names
    pub async fn remediate<C: ClusterClient>(
        &self,
        client: &C,
        events: &dyn EventPublisher,
        sts: &StatefulSet,
        pods: &[Pod],
    ) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for pod in pods.iter().filter(|p| is_member(p, sts)) {
            let Some((container, reason)) = stuck_container(pod, &self.config.reasons) else {
                continue;
            };
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            let key = format!("{}/{}", namespace, name);

            {
                let last_deleted = self.last_deleted.lock().await;
                if let Some(at) = last_deleted.get(&key)
                    && at.elapsed() < self.config.backoff
                {
                    debug!(pod = %key, "Skipping remediation within backoff window");
                    continue;
                }
            }

            let preconditions = Preconditions {
                uid: pod.metadata.uid.clone(),
                resource_version: None,
            };
            match client
                .delete::<Pod>(&namespace, &name, Some(preconditions))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    // Already replaced by a newer incarnation
                    debug!(pod = %key, error = %e, "Pod changed before remediation");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            info!(pod = %key, container, reason, "Deleted crash-looping etcd member");
            {
                let backoff = self.config.backoff;
                let mut last_deleted = self.last_deleted.lock().await;
                // Entries past the window no longer rate limit anything
                last_deleted.retain(|_, at| at.elapsed() < backoff);
                last_deleted.insert(key, Instant::now());
            }
            events
                .publish(
                    &pod_reference(pod),
                    EventType::Warning,
                    reasons::POD_REMEDIATED,
                    actions::REMEDIATE,
                    Some(format!(
                        "Deleted pod {}: container {} is in {}",
                        name, container, reason
                    )),
                )
                .await;
            deleted.push(name);
        }

        if !deleted.is_empty() {
            warn!(
                statefulset = %sts.name_any(),
                count = deleted.len(),
                "Remediated etcd members"
            );
        }
        Ok(deleted)
    }
}
