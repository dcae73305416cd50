//! Reconciliation of Etcd resources
//!
//! A pass reads the Etcd, brings every child in line with the desired set
//! and writes the status back. Passes are level-triggered: they never rely
//! on what a previous pass did, only on what the cluster currently holds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::events::{actions, reasons as event_reasons};
use crate::client::{ClientError, ClusterClient, ClusterResource, DeleteOutcome, Preconditions};
use crate::controller::context::Context;
use crate::controller::diff::{child_patch, with_last_applied};
use crate::controller::error::{Error, ErrorKind, Result};
use crate::controller::ownership::{
    Ownership, adoption_patch, check_statefulset_selector, classify, is_controlled_by,
};
use crate::controller::queue::{ObjectKey, Requeue, WorkQueue};
use crate::controller::remediation::is_member;
use crate::controller::status::{
    ConditionBuilder, Observation, Problem, compute_status, condition_types, deleting_status,
    reasons, write_status,
};
use crate::controller::validation::{validate_selector_unchanged, validate_spec};
use crate::crd::Etcd;
use crate::resources::common::statefulset_name;
use crate::resources::{self, API_VERSION, Child, ChildKind, KIND};

/// Finalizer guarding explicit cleanup of children
pub const FINALIZER: &str = "druid.gardener.cloud/etcd-druid";

/// Requeue delay while children are still being deleted
pub const DELETION_REQUEUE: Duration = Duration::from_secs(5);

/// Passes restarted on conflicts before backing off
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;

/// Outcome of bringing one child in line
enum ChildState {
    Converged,
    StatefulSet(Box<StatefulSet>),
    Foreign { kind: String, name: String, reason: String },
}

/// Main reconciliation function
///
/// Conflicts restart the pass from a fresh read, up to
/// [`MAX_CONFLICT_ATTEMPTS`] times; after that the key backs off like any
/// transient failure.
#[instrument(skip(key, ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile<C: ClusterClient>(key: &ObjectKey, ctx: &Context<C>) -> Result<Requeue> {
    for attempt in 1..=MAX_CONFLICT_ATTEMPTS {
        match reconcile_pass(key, ctx).await {
            Err(e) if e.is_conflict() => {
                debug!(attempt, error = %e, "Conflict during pass, restarting");
            }
            other => return other,
        }
    }
    Err(Error::ConflictRetriesExhausted(MAX_CONFLICT_ATTEMPTS))
}

async fn reconcile_pass<C: ClusterClient>(key: &ObjectKey, ctx: &Context<C>) -> Result<Requeue> {
    let client = ctx.client.as_ref();
    let Some(etcd) = client.get::<Etcd>(&key.namespace, &key.name).await? else {
        debug!("Etcd no longer exists");
        return Ok(Requeue::Never);
    };

    if etcd.is_being_deleted() {
        return handle_deletion(&etcd, ctx).await;
    }

    if !has_finalizer(&etcd) {
        add_finalizer(&etcd, ctx).await?;
        return Ok(Requeue::After(Duration::ZERO));
    }

    debug!(generation = ?etcd.metadata.generation, "Reconciling Etcd");

    let observed_sts = client
        .get::<StatefulSet>(&key.namespace, &statefulset_name(&key.name))
        .await?
        .filter(|sts| owned_by_etcd(&etcd, sts));

    let validation = validate_spec(&etcd).and_then(|()| match &observed_sts {
        Some(sts) => validate_selector_unchanged(&etcd, sts),
        None => Ok(()),
    });
    if let Err(e) = validation {
        let pods = member_pods(client, &etcd, observed_sts.as_ref()).await?;
        report_problem(
            ctx,
            &etcd,
            observed_sts.as_ref(),
            &pods,
            Problem::new(reasons::INVALID_SPEC, e.to_string()),
            Some(event_reasons::INVALID_SPEC),
        )
        .await?;
        return Err(e);
    }

    if let Some((secret, problem)) = missing_secret(client, &etcd).await? {
        let pods = member_pods(client, &etcd, observed_sts.as_ref()).await?;
        report_problem(ctx, &etcd, observed_sts.as_ref(), &pods, problem, None).await?;
        return Err(Error::SecretNotFound(secret));
    }

    let desired = resources::build(&etcd)?;
    let candidates: Vec<Etcd> = client.list(&key.namespace, &BTreeMap::new()).await?;

    let mut foreign: Option<(String, String, String)> = None;
    let mut statefulset: Option<StatefulSet> = None;
    for child in desired.creation_order() {
        if matches!(child, Child::StatefulSet(_)) && foreign.is_some() {
            warn!("Not touching the StatefulSet while a dependency is foreign");
            continue;
        }
        match ensure_child(ctx, &etcd, &candidates, child).await? {
            ChildState::Converged => {}
            ChildState::StatefulSet(sts) => statefulset = Some(*sts),
            ChildState::Foreign { kind, name, reason } => {
                foreign.get_or_insert((kind, name, reason));
            }
        }
    }

    let mut pods = member_pods(client, &etcd, statefulset.as_ref()).await?;
    if let Some(sts) = &statefulset {
        let deleted = ctx
            .remediator
            .remediate(client, ctx.events.as_ref(), sts, &pods)
            .await?;
        ctx.metrics
            .record_remediations(&key.namespace, &key.name, deleted.len() as u64);
        pods.retain(|p| !deleted.contains(&p.name_any()));
    }

    if let Some((kind, name, reason)) = foreign {
        let problem = Problem::new(
            reasons::FOREIGN_OBJECT,
            format!("{} {} is not managed by this Etcd: {}", kind, name, reason),
        );
        report_problem(
            ctx,
            &etcd,
            statefulset.as_ref(),
            &pods,
            problem,
            Some(event_reasons::FOREIGN_OBJECT),
        )
        .await?;
        return Err(Error::ForeignObject { kind, name });
    }

    let stored = write_status(client, &etcd, |current| {
        compute_status(
            current,
            &Observation {
                statefulset: statefulset.as_ref(),
                pods: &pods,
                problem: None,
                completed: true,
                last_error: None,
            },
        )
    })
    .await?;

    let ready = stored
        .status
        .as_ref()
        .and_then(|s| s.ready)
        .unwrap_or(false);
    if ready {
        debug!("Etcd is ready");
        Ok(Requeue::After(ctx.resync_period))
    } else {
        debug!("Etcd is not ready yet");
        Ok(Requeue::After(ctx.not_ready_requeue))
    }
}

fn has_finalizer(etcd: &Etcd) -> bool {
    etcd.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer with an optimistic update
async fn add_finalizer<C: ClusterClient>(etcd: &Etcd, ctx: &Context<C>) -> Result<()> {
    let mut updated = etcd.clone();
    updated.finalizers_mut().push(FINALIZER.to_string());
    ctx.client.update(&updated).await?;
    info!("Added finalizer");
    Ok(())
}

fn owned_by_etcd<K: Resource>(etcd: &Etcd, obj: &K) -> bool {
    etcd.metadata
        .uid
        .as_deref()
        .is_some_and(|uid| is_controlled_by(obj.meta(), uid))
}

fn etcd_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(API_VERSION.to_string()),
        kind: Some(KIND.to_string()),
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

fn ready_reason(etcd: &Etcd) -> Option<&str> {
    etcd.status
        .as_ref()?
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::READY)
        .map(|c| c.reason.as_str())
}

/// Write a blocking problem to the status. A Warning event named
/// `event_reason`, if any, is published when the Ready reason changes.
async fn report_problem<C: ClusterClient>(
    ctx: &Context<C>,
    etcd: &Etcd,
    statefulset: Option<&StatefulSet>,
    pods: &[Pod],
    problem: Problem,
    event_reason: Option<&str>,
) -> Result<()> {
    let transition = ready_reason(etcd) != Some(problem.reason);
    let message = problem.message.clone();
    write_status(ctx.client.as_ref(), etcd, |current| {
        compute_status(
            current,
            &Observation {
                statefulset,
                pods,
                problem: Some(problem.clone()),
                completed: false,
                last_error: None,
            },
        )
    })
    .await?;

    if let Some(event_reason) = event_reason
        && transition
    {
        ctx.events
            .publish(
                &etcd.object_ref(&()),
                EventType::Warning,
                event_reason,
                actions::RECONCILE,
                Some(message),
            )
            .await;
    }
    Ok(())
}

/// The first referenced secret that does not exist
async fn missing_secret<C: ClusterClient>(
    client: &C,
    etcd: &Etcd,
) -> Result<Option<(String, Problem)>> {
    let namespace = etcd.namespace().unwrap_or_default();
    let store_secret = etcd.spec.backup.store_secret_name();
    for secret in etcd.referenced_secrets() {
        if client.get::<Secret>(&namespace, &secret).await?.is_some() {
            continue;
        }
        let is_store = store_secret == Some(secret.as_str());
        let message = if is_store {
            format!("Backup store secret {} not found", secret)
        } else {
            format!("TLS secret {} not found", secret)
        };
        debug!(secret = %secret, "Referenced secret is missing");
        let mut problem = Problem::new(reasons::SECRET_NOT_FOUND, message);
        if is_store {
            problem = problem.with_backup_reason(reasons::SECRET_NOT_FOUND);
        }
        return Ok(Some((secret, problem)));
    }
    Ok(None)
}

/// Member pods of `sts`, sorted by name
async fn member_pods<C: ClusterClient>(
    client: &C,
    etcd: &Etcd,
    sts: Option<&StatefulSet>,
) -> Result<Vec<Pod>> {
    let Some(sts) = sts else {
        return Ok(Vec::new());
    };
    let selector = etcd.selector_labels();
    if selector.is_empty() {
        return Ok(Vec::new());
    }
    let namespace = etcd.namespace().unwrap_or_default();
    let mut pods: Vec<Pod> = client
        .list::<Pod>(&namespace, &selector)
        .await?
        .into_iter()
        .filter(|p| is_member(p, sts))
        .collect();
    pods.sort_by_key(|p| p.name_any());
    Ok(pods)
}

async fn ensure_child<C: ClusterClient>(
    ctx: &Context<C>,
    etcd: &Etcd,
    candidates: &[Etcd],
    child: &Child,
) -> Result<ChildState> {
    match child {
        Child::Service(_) => ensure::<C, Service>(ctx, etcd, candidates, child)
            .await
            .map(|r| r.map_or_else(|f| f, |_| ChildState::Converged)),
        Child::ConfigMap(_) => ensure::<C, ConfigMap>(ctx, etcd, candidates, child)
            .await
            .map(|r| r.map_or_else(|f| f, |_| ChildState::Converged)),
        Child::PodDisruptionBudget(_) => {
            ensure::<C, PodDisruptionBudget>(ctx, etcd, candidates, child)
                .await
                .map(|r| r.map_or_else(|f| f, |_| ChildState::Converged))
        }
        Child::StatefulSet(_) => ensure::<C, StatefulSet>(ctx, etcd, candidates, child)
            .await
            .map(|r| r.map_or_else(|f| f, |sts| ChildState::StatefulSet(Box::new(sts)))),
    }
}

/// Create, adopt or patch one child. `Err(ChildState::Foreign)` inside the
/// result means the object exists and is left alone.
async fn ensure<C, K>(
    ctx: &Context<C>,
    etcd: &Etcd,
    candidates: &[Etcd],
    child: &Child,
) -> Result<std::result::Result<K, ChildState>>
where
    C: ClusterClient,
    K: ClusterResource,
{
    let client = ctx.client.as_ref();
    let namespace = etcd.namespace().unwrap_or_default();
    let kind = child.kind();
    let name = child.name();

    let existing = match client.get::<K>(&namespace, &name).await? {
        Some(existing) => existing,
        None => {
            let obj: K = serde_json::from_value(with_last_applied(child)?)?;
            match client.create(&obj).await {
                Ok(created) => {
                    info!(kind, child = %name, "Created child");
                    ctx.events
                        .publish(
                            &etcd.object_ref(&()),
                            EventType::Normal,
                            event_reasons::CREATED,
                            actions::CREATE,
                            Some(format!("Created {} {}", kind, name)),
                        )
                        .await;
                    return Ok(Ok(created));
                }
                Err(e) if e.is_already_exists() => {
                    debug!(kind, child = %name, "Child appeared concurrently, re-reading");
                    client
                        .get::<K>(&namespace, &name)
                        .await?
                        .ok_or_else(|| ClientError::Conflict {
                            kind: kind.to_string(),
                            key: format!("{}/{}", namespace, name),
                            message: "object vanished after AlreadyExists".to_string(),
                        })?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let mut current = existing;
    let ownership = match classify(etcd, candidates, current.meta()) {
        Ownership::Adoptable if matches!(child, Child::StatefulSet(_)) => {
            check_statefulset_selector(etcd, &serde_json::to_value(&current)?)
        }
        other => other,
    };
    match ownership {
        Ownership::Owned => {}
        Ownership::Adoptable => {
            current = client
                .patch::<K>(&namespace, &name, &adoption_patch(etcd, current.meta()))
                .await?;
            info!(kind, child = %name, "Adopted child");
            ctx.events
                .publish(
                    &etcd.object_ref(&()),
                    EventType::Normal,
                    event_reasons::ADOPTED,
                    actions::ADOPT,
                    Some(format!("Adopted {} {}", kind, name)),
                )
                .await;
        }
        Ownership::Foreign(reason) => {
            warn!(kind, child = %name, reason = %reason, "Child exists and is not ours");
            return Ok(Err(ChildState::Foreign {
                kind: kind.to_string(),
                name,
                reason,
            }));
        }
    }

    let observed = serde_json::to_value(&current)?;
    let Some(mut patch) = child_patch(child, &observed)? else {
        return Ok(Ok(current));
    };
    // Conditional on the revision the diff was computed against
    patch["metadata"]["resourceVersion"] = json!(current.meta().resource_version);
    let updated = client.patch::<K>(&namespace, &name, &patch).await?;
    info!(kind, child = %name, "Updated child");
    Ok(Ok(updated))
}

/// Delete one owned child; returns whether it still exists
async fn delete_owned<C, K>(client: &C, etcd: &Etcd, name: &str) -> Result<bool>
where
    C: ClusterClient,
    K: ClusterResource,
{
    let namespace = etcd.namespace().unwrap_or_default();
    let Some(existing) = client.get::<K>(&namespace, name).await? else {
        return Ok(false);
    };
    if !owned_by_etcd(etcd, &existing) {
        debug!(kind = %K::kind(&()), child = name, "Leaving unowned object in place");
        return Ok(false);
    }
    if existing.meta().deletion_timestamp.is_some() {
        return Ok(true);
    }

    let preconditions = Preconditions {
        uid: existing.meta().uid.clone(),
        resource_version: None,
    };
    match client.delete::<K>(&namespace, name, Some(preconditions)).await {
        Ok(DeleteOutcome::Deleted) => {
            info!(kind = %K::kind(&()), child = name, "Deleted child");
            Ok(false)
        }
        Ok(DeleteOutcome::Pending) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) if e.is_conflict() => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Deletion is absorbing: children go in reverse creation order, then the
/// finalizer is released.
async fn handle_deletion<C: ClusterClient>(etcd: &Etcd, ctx: &Context<C>) -> Result<Requeue> {
    if !has_finalizer(etcd) {
        return Ok(Requeue::Never);
    }
    let client = ctx.client.as_ref();
    let name = etcd.name_any();
    info!("Handling deletion");

    let stored = write_status(client, etcd, deleting_status).await?;
    if ready_reason(etcd) != Some(reasons::DELETING) {
        ctx.events
            .publish(
                &etcd.object_ref(&()),
                EventType::Normal,
                event_reasons::DELETING,
                actions::DELETE,
                Some("Deleting children".to_string()),
            )
            .await;
    }

    let mut remaining = Vec::new();
    for kind in resources::deletion_order() {
        let child = kind.object_name(&name);
        let present = match kind {
            ChildKind::StatefulSet => delete_owned::<C, StatefulSet>(client, etcd, &child).await?,
            ChildKind::PodDisruptionBudget => {
                delete_owned::<C, PodDisruptionBudget>(client, etcd, &child).await?
            }
            ChildKind::ConfigMap => delete_owned::<C, ConfigMap>(client, etcd, &child).await?,
            ChildKind::PeerService | ChildKind::ClientService => {
                delete_owned::<C, Service>(client, etcd, &child).await?
            }
        };
        if present {
            remaining.push(child);
        }
    }
    if !remaining.is_empty() {
        debug!(remaining = ?remaining, "Waiting for children to go away");
        return Ok(Requeue::After(DELETION_REQUEUE));
    }

    let finalizers: Vec<String> = stored
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({
        "metadata": {
            "resourceVersion": stored.resource_version(),
            "finalizers": finalizers,
        }
    });
    match client
        .patch::<Etcd>(&etcd.namespace().unwrap_or_default(), &name, &patch)
        .await
    {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!("Removed finalizer");
    Ok(Requeue::Never)
}

/// Map a failed pass to a requeue, recording metrics, events and
/// `status.lastError` along the way
pub async fn handle_error<C: ClusterClient>(
    key: &ObjectKey,
    error: &Error,
    ctx: &Context<C>,
) -> Requeue {
    let kind = error.kind();
    ctx.metrics
        .record_error(&key.namespace, &key.name, kind.as_str());

    match kind {
        ErrorKind::Transient => {
            warn!(key = %key, error = %error, "Transient error, retrying with backoff");
            record_last_error(ctx, key, error, false).await;
            Requeue::Backoff
        }
        ErrorKind::Precondition => {
            info!(key = %key, error = %error, "Precondition not met");
            if error.is_retryable() {
                Requeue::Backoff
            } else {
                Requeue::Never
            }
        }
        ErrorKind::ConflictForeign => {
            warn!(key = %key, error = %error, "Foreign object blocks reconciliation");
            Requeue::After(ctx.resync_period)
        }
        ErrorKind::Fatal => {
            error!(key = %key, error = %error, "Reconciliation failed");
            ctx.events
                .publish(
                    &etcd_reference(&key.namespace, &key.name),
                    EventType::Warning,
                    event_reasons::RECONCILE_FAILED,
                    actions::RECONCILE,
                    Some(error.to_string()),
                )
                .await;
            record_last_error(ctx, key, error, true).await;
            Requeue::After(ctx.backoff.delay_for_error(error, 0))
        }
    }
}

/// Best-effort write of `status.lastError`
async fn record_last_error<C: ClusterClient>(
    ctx: &Context<C>,
    key: &ObjectKey,
    error: &Error,
    fatal: bool,
) {
    let client = ctx.client.as_ref();
    let etcd = match client.get::<Etcd>(&key.namespace, &key.name).await {
        Ok(Some(etcd)) if !etcd.is_being_deleted() => etcd,
        Ok(_) => return,
        Err(e) => {
            debug!(key = %key, error = %e, "Could not read Etcd to record the error");
            return;
        }
    };
    let message = error.to_string();
    let result = write_status(client, &etcd, |current| {
        let mut status = current.status.clone().unwrap_or_default();
        status.last_error = Some(message.clone());
        if fatal {
            status.conditions =
                ConditionBuilder::from_existing(status.conditions, current.metadata.generation)
                    .ready(false, reasons::RECONCILE_FAILED, &message)
                    .build();
            status.ready = Some(false);
        }
        status
    })
    .await;
    if let Err(e) = result {
        debug!(key = %key, error = %e, "Could not record the error in status");
    }
}

/// Run one pass for `key` under `timeout` and decide how to requeue it
pub async fn process<C: ClusterClient>(
    key: &ObjectKey,
    ctx: &Context<C>,
    timeout: Duration,
) -> Requeue {
    let start = tokio::time::Instant::now();
    let result = match tokio::time::timeout(timeout, reconcile(key, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(timeout)),
    };
    ctx.metrics.record_reconcile(
        &key.namespace,
        &key.name,
        start.elapsed().as_secs_f64(),
    );
    match result {
        Ok(requeue) => requeue,
        Err(e) => handle_error(key, &e, ctx).await,
    }
}

/// Pull keys from `queue` until shutdown. A pass interrupted by shutdown
/// puts its key back before the worker exits.
pub async fn run_worker<C: ClusterClient>(
    id: usize,
    queue: Arc<WorkQueue>,
    ctx: Arc<Context<C>>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    debug!(worker = id, "Worker started");
    loop {
        let key = tokio::select! {
            _ = shutdown.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let requeue = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(worker = id, key = %key, "Pass cancelled by shutdown");
                queue.done(&key, Requeue::Never).await;
                if let Err(e) = queue.add(key.clone()).await {
                    debug!(key = %key, error = %e, "Could not re-add interrupted key");
                }
                break;
            }
            requeue = process(&key, &ctx, timeout) => requeue,
        };
        queue.done(&key, requeue).await;
        ctx.metrics.set_queue_depth(queue.len().await);
    }
    debug!(worker = id, "Worker stopped");
}
