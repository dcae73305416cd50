//! Status and conditions management for Etcd resources
//!
//! Status is computed from what a pass observed and written through the
//! status subresource with optimistic concurrency. Nothing is written when
//! the computed status equals the stored one.

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::client::{ClientError, ClusterClient};
use crate::controller::error::{Error, Result};
use crate::crd::{
    Condition, Etcd, EtcdMemberStatus, EtcdStatus, MemberConditionStatus, MemberRole,
};
use crate::resources::ROLE_LABEL;
use crate::resources::common::client_service_name;

/// Standard condition types following Kubernetes conventions
pub mod condition_types {
    /// The cluster is serving with every desired member ready
    pub const READY: &str = "Ready";
    /// Every member pod reports ready
    pub const ALL_MEMBERS_READY: &str = "AllMembersReady";
    /// Snapshots are being taken into a configured store
    pub const BACKUP_READY: &str = "BackupReady";
}

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
    pub const UNKNOWN: &str = "Unknown";
}

/// Condition reasons
pub mod reasons {
    pub const ALL_MEMBERS_READY: &str = "AllMembersReady";
    pub const NOT_ALL_MEMBERS_READY: &str = "NotAllMembersReady";
    pub const NO_MEMBERS: &str = "NoMembers";
    pub const READY: &str = "Ready";
    pub const NOT_READY: &str = "NotReady";
    pub const INVALID_SPEC: &str = "InvalidSpec";
    pub const SECRET_NOT_FOUND: &str = "SecretNotFound";
    pub const FOREIGN_OBJECT: &str = "ForeignObject";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const BACKUP_STORE_CONFIGURED: &str = "BackupStoreConfigured";
    pub const BACKUP_DISABLED: &str = "BackupDisabled";
    pub const DELETING: &str = "Deleting";
}

/// Attempts for one status write before giving up on conflicts
pub const MAX_STATUS_RETRIES: u32 = 3;

/// Builder for creating and updating status conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    /// `lastTransitionTime` only moves when the status changes.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    fn boolean(self, type_: &str, value: bool, reason: &str, message: &str) -> Self {
        let status = if value {
            condition_status::TRUE
        } else {
            condition_status::FALSE
        };
        self.set_condition(type_, status, reason, message)
    }

    /// Set the Ready condition
    pub fn ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.boolean(condition_types::READY, is_ready, reason, message)
    }

    /// Set the AllMembersReady condition
    pub fn all_members_ready(self, all_ready: bool, reason: &str, message: &str) -> Self {
        self.boolean(condition_types::ALL_MEMBERS_READY, all_ready, reason, message)
    }

    /// Set the BackupReady condition
    pub fn backup_ready(self, is_ready: bool, reason: &str, message: &str) -> Self {
        self.boolean(condition_types::BACKUP_READY, is_ready, reason, message)
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Why a pass could not converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub reason: &'static str,
    pub message: String,
    /// Set when the problem also affects backups (e.g. missing store secret)
    pub backup_reason: Option<&'static str>,
}

impl Problem {
    pub fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            backup_reason: None,
        }
    }

    pub fn with_backup_reason(mut self, reason: &'static str) -> Self {
        self.backup_reason = Some(reason);
        self
    }
}

/// What a pass observed, as input to the status computation
#[derive(Debug, Default)]
pub struct Observation<'a> {
    pub statefulset: Option<&'a StatefulSet>,
    pub pods: &'a [Pod],
    pub problem: Option<Problem>,
    /// The pass reached every child; advances `observedGeneration`
    pub completed: bool,
    pub last_error: Option<String>,
}

/// Stable member id derived from the pod's identity
pub fn member_id(namespace: &str, pod_name: &str) -> String {
    let digest = Sha256::digest(format!("{}/{}", namespace, pod_name).as_bytes());
    format!("{:x}", digest).chars().take(16).collect()
}

fn member_status(pod: &Pod) -> MemberConditionStatus {
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"));
    match ready.map(|c| c.status.as_str()) {
        Some("True") => MemberConditionStatus::Ready,
        Some("False") => MemberConditionStatus::NotReady,
        _ => MemberConditionStatus::Unknown,
    }
}

fn member_role(pod: &Pod) -> Option<MemberRole> {
    match pod.labels().get(ROLE_LABEL).map(String::as_str) {
        Some("Leader") => Some(MemberRole::Leader),
        Some("Member") => Some(MemberRole::Member),
        _ => None,
    }
}

/// Member entries for `pods`, keeping transition times of unchanged members
pub fn compute_members(
    namespace: &str,
    pods: &[Pod],
    previous: &[EtcdMemberStatus],
) -> Vec<EtcdMemberStatus> {
    let mut members: Vec<EtcdMemberStatus> = pods
        .iter()
        .map(|pod| {
            let name = pod.name_any();
            let status = member_status(pod);
            let last_transition_time = previous
                .iter()
                .find(|m| m.name == name && m.status == status)
                .map(|m| m.last_transition_time.clone())
                .unwrap_or_else(|| Utc::now().to_rfc3339());
            EtcdMemberStatus {
                id: member_id(namespace, &name),
                role: member_role(pod),
                name,
                status,
                last_transition_time,
            }
        })
        .collect();
    members.sort_by(|a, b| a.name.cmp(&b.name));
    members
}

/// Compute the status an Etcd should carry after a pass
pub fn compute_status(etcd: &Etcd, observation: &Observation<'_>) -> EtcdStatus {
    let previous = etcd.status.clone().unwrap_or_default();
    let generation = etcd.metadata.generation;
    let namespace = etcd.namespace().unwrap_or_default();
    let desired = etcd.spec.replicas;

    let sts_status = observation.statefulset.and_then(|s| s.status.as_ref());
    let replicas = sts_status.map(|s| s.replicas).unwrap_or(0);
    let ready_replicas = sts_status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let current_replicas = sts_status.and_then(|s| s.current_replicas).unwrap_or(0);
    let updated_replicas = sts_status.and_then(|s| s.updated_replicas).unwrap_or(0);

    let members = compute_members(&namespace, observation.pods, &previous.members);
    let ready_members = members
        .iter()
        .filter(|m| m.status == MemberConditionStatus::Ready)
        .count();

    let mut builder = ConditionBuilder::from_existing(previous.conditions.clone(), generation);

    builder = if members.is_empty() {
        builder.all_members_ready(false, reasons::NO_MEMBERS, "No members have been created yet")
    } else if ready_members == members.len() {
        builder.all_members_ready(true, reasons::ALL_MEMBERS_READY, "All members are ready")
    } else {
        builder.all_members_ready(
            false,
            reasons::NOT_ALL_MEMBERS_READY,
            &format!("{} of {} members are ready", ready_members, members.len()),
        )
    };

    let all_ready = !members.is_empty()
        && ready_members == members.len()
        && ready_replicas >= desired;
    builder = match &observation.problem {
        Some(problem) => builder.ready(false, problem.reason, &problem.message),
        None if all_ready => builder.ready(true, reasons::READY, "All replicas are ready"),
        None => builder.ready(
            false,
            reasons::NOT_READY,
            &format!("{} of {} replicas are ready", ready_replicas, desired),
        ),
    };

    builder = match (
        observation.problem.as_ref().and_then(|p| p.backup_reason),
        etcd.spec.backup.store.is_some(),
    ) {
        (Some(reason), _) => builder.backup_ready(
            false,
            reason,
            observation
                .problem
                .as_ref()
                .map(|p| p.message.as_str())
                .unwrap_or_default(),
        ),
        (None, true) => builder.backup_ready(
            true,
            reasons::BACKUP_STORE_CONFIGURED,
            "Backup store is configured",
        ),
        (None, false) => {
            builder.backup_ready(false, reasons::BACKUP_DISABLED, "No backup store configured")
        }
    };

    let conditions = builder.build();
    let ready = conditions
        .iter()
        .any(|c| c.type_ == condition_types::READY && c.status == condition_status::TRUE);

    let observed_generation = if observation.completed {
        match (previous.observed_generation, generation) {
            (Some(prev), Some(current)) => Some(prev.max(current)),
            (prev, current) => current.or(prev),
        }
    } else {
        previous.observed_generation
    };

    EtcdStatus {
        observed_generation,
        replicas,
        ready_replicas,
        current_replicas,
        updated_replicas,
        ready: Some(ready),
        service_name: Some(client_service_name(&etcd.name_any())),
        cluster_size: Some(desired),
        last_error: observation.last_error.clone(),
        conditions,
        members,
    }
}

/// Only the Ready condition changes; used while the Etcd is being deleted
pub fn deleting_status(etcd: &Etcd) -> EtcdStatus {
    let mut status = etcd.status.clone().unwrap_or_default();
    status.conditions =
        ConditionBuilder::from_existing(status.conditions, etcd.metadata.generation)
            .ready(false, reasons::DELETING, "Etcd is being deleted")
            .build();
    status.ready = Some(false);
    status
}

/// Write the status produced by `compute` for the current revision of `etcd`.
///
/// On a conflict the Etcd is re-read and the status recomputed. Returns the
/// stored Etcd; no write happens when the status is unchanged.
pub async fn write_status<C, F>(client: &C, etcd: &Etcd, compute: F) -> Result<Etcd>
where
    C: ClusterClient,
    F: Fn(&Etcd) -> EtcdStatus + Send + Sync,
{
    let namespace = etcd
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = etcd.name_any();
    let mut current = etcd.clone();

    for attempt in 1..=MAX_STATUS_RETRIES {
        let status = compute(&current);
        if current.status.as_ref() == Some(&status) {
            debug!(name = %name, "Status unchanged, skipping write");
            return Ok(current);
        }

        let mut updated = current.clone();
        updated.status = Some(status);
        match client.update_status(&updated).await {
            Ok(stored) => return Ok(stored),
            Err(e) if e.is_conflict() && attempt < MAX_STATUS_RETRIES => {
                debug!(name = %name, attempt, "Status write conflicted, re-reading");
                current = client
                    .get::<Etcd>(&namespace, &name)
                    .await?
                    .ok_or_else(|| ClientError::NotFound {
                        kind: "Etcd".to_string(),
                        key: format!("{}/{}", namespace, name),
                    })?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::ConflictRetriesExhausted(MAX_STATUS_RETRIES))
}
