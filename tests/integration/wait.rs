//! Wait condition helpers for Etcd resources and their children

use std::time::Duration;

use etcd_druid::controller::status::{condition_status, condition_types};
use etcd_druid::crd::Etcd;
use kube::{Api, ResourceExt};
use kube::runtime::wait::{Condition, await_condition, conditions};
use thiserror::Error;

pub const SHORT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("Timeout waiting for condition")]
    Timeout,

    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::wait::Error),

    #[error("Resource not found after wait")]
    ResourceNotFound,
}

/// Condition that checks the Etcd's observedGeneration caught up with its generation
pub fn is_observed() -> impl Condition<Etcd> {
    |obj: Option<&Etcd>| {
        obj.is_some_and(|etcd| {
            etcd.metadata.generation.is_some()
                && etcd.status.as_ref().and_then(|s| s.observed_generation)
                    == etcd.metadata.generation
        })
    }
}

/// Condition that checks a condition type has a given status and reason
pub fn has_condition(type_: &str, status: &str, reason: &str) -> impl Condition<Etcd> {
    let (type_, status, reason) = (type_.to_string(), status.to_string(), reason.to_string());
    move |obj: Option<&Etcd>| {
        obj.and_then(|etcd| etcd.status.as_ref()).is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == type_ && c.status == status && c.reason == reason)
        })
    }
}

/// Condition that checks the Etcd reports not ready for `reason`
pub fn is_not_ready_because(reason: &str) -> impl Condition<Etcd> {
    has_condition(condition_types::READY, condition_status::FALSE, reason)
}

/// Condition that checks the finalizer list contains `finalizer`
pub fn has_finalizer(finalizer: &str) -> impl Condition<Etcd> {
    let finalizer = finalizer.to_string();
    move |obj: Option<&Etcd>| obj.is_some_and(|etcd| etcd.finalizers().contains(&finalizer))
}

/// Wait until `condition` holds for `name`
pub async fn wait_for_etcd(
    api: &Api<Etcd>,
    name: &str,
    condition: impl Condition<Etcd>,
    timeout: Duration,
) -> Result<Etcd, WaitError> {
    let result = tokio::time::timeout(timeout, await_condition(api.clone(), name, condition))
        .await
        .map_err(|_| WaitError::Timeout)??;
    result.ok_or(WaitError::ResourceNotFound)
}

/// Wait for any resource to exist
pub async fn wait_for_resource<T>(api: &Api<T>, name: &str, timeout: Duration) -> Result<T, WaitError>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: serde::de::DeserializeOwned,
{
    let exists = |obj: Option<&T>| obj.is_some();
    let result = tokio::time::timeout(timeout, await_condition(api.clone(), name, exists))
        .await
        .map_err(|_| WaitError::Timeout)??;
    result.ok_or(WaitError::ResourceNotFound)
}

/// Wait for any resource to be deleted
pub async fn wait_for_resource_deletion<T>(
    api: &Api<T>,
    name: &str,
    timeout: Duration,
) -> Result<(), WaitError>
where
    T: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    T: serde::de::DeserializeOwned,
{
    tokio::time::timeout(
        timeout,
        await_condition(api.clone(), name, conditions::is_deleted("")),
    )
    .await
    .map_err(|_| WaitError::Timeout)??;
    Ok(())
}
