//! Validation of Etcd specs
//!
//! Checks the parts of a spec that the CRD schema cannot express: label
//! containment, parsable quantities and durations, distinct ports, and the
//! immutability of the selector once a StatefulSet exists.

use std::str::FromStr;

use cron::Schedule;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::controller::error::{Error, Result};
use crate::controller::ownership::selector_compatible;
use crate::crd::Etcd;
use crate::resources::common::{pod_labels, quantity_to_bytes};

/// Minimum number of members
pub const MIN_REPLICAS: i32 = 1;

/// Validate the Etcd spec
pub fn validate_spec(etcd: &Etcd) -> Result<()> {
    validate_replicas(etcd)?;
    validate_selector(etcd)?;
    validate_quantities(etcd)?;
    validate_ports(etcd)?;
    validate_schedules(etcd)?;
    validate_backup(etcd)?;
    validate_tls(etcd)?;
    Ok(())
}

fn invalid(message: String) -> Error {
    Error::ValidationError(message)
}

fn validate_replicas(etcd: &Etcd) -> Result<()> {
    let replicas = etcd.spec.replicas;
    if replicas < MIN_REPLICAS {
        return Err(invalid(format!(
            "replica count {} is below minimum {}",
            replicas, MIN_REPLICAS
        )));
    }
    Ok(())
}

/// The selector must be non-empty matchLabels, all of them present in `labels`
fn validate_selector(etcd: &Etcd) -> Result<()> {
    let selector = &etcd.spec.selector;
    if selector
        .match_expressions
        .as_ref()
        .is_some_and(|e| !e.is_empty())
    {
        return Err(invalid(
            "selector.matchExpressions is not supported, use matchLabels".to_string(),
        ));
    }

    let match_labels = etcd.selector_labels();
    if match_labels.is_empty() {
        return Err(invalid("selector.matchLabels must not be empty".to_string()));
    }

    for (key, value) in &match_labels {
        match etcd.spec.labels.get(key) {
            Some(v) if v == value => {}
            Some(v) => {
                return Err(invalid(format!(
                    "selector label {}={} does not match labels ({}={})",
                    key, value, key, v
                )));
            }
            None => {
                return Err(invalid(format!(
                    "selector label {}={} is missing from labels",
                    key, value
                )));
            }
        }
    }
    Ok(())
}

fn positive_bytes(field: &str, quantity: &Quantity) -> Result<()> {
    match quantity_to_bytes(quantity) {
        Some(bytes) if bytes > 0 => Ok(()),
        _ => Err(invalid(format!(
            "{} must be a positive quantity, got {}",
            field, quantity.0
        ))),
    }
}

fn validate_quantities(etcd: &Etcd) -> Result<()> {
    positive_bytes("storageCapacity", &etcd.storage_capacity())?;
    positive_bytes("etcd.quota", &etcd.spec.etcd.quota())?;
    positive_bytes(
        "backup.deltaSnapshotMemoryLimit",
        &etcd.spec.backup.delta_snapshot_memory_limit(),
    )?;
    Ok(())
}

fn validate_ports(etcd: &Etcd) -> Result<()> {
    let ports = [
        ("etcd.clientPort", etcd.spec.etcd.client_port()),
        ("etcd.serverPort", etcd.spec.etcd.server_port()),
        ("backup.port", etcd.spec.backup.port()),
    ];
    for (field, port) in ports {
        if !(1..=65535).contains(&port) {
            return Err(invalid(format!("{} {} is out of range", field, port)));
        }
    }
    for (i, (field, port)) in ports.iter().enumerate() {
        if let Some((other, _)) = ports.iter().skip(i + 1).find(|(_, p)| p == port) {
            return Err(invalid(format!(
                "{} and {} must differ (both {})",
                field, other, port
            )));
        }
    }
    Ok(())
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite numeric weekdays (0 and 7 are Sunday) as names, which the `cron`
/// crate reads independently of its 1-based numbering
fn weekday_names(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            let base = base
                .split('-')
                .map(|day| match day.parse::<usize>() {
                    Ok(n) => WEEKDAYS.get(n % 7).map_or(day, |name| *name),
                    Err(_) => day,
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", base, step),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a standard five-field cron expression
pub fn parse_cron(schedule: &str) -> std::result::Result<Schedule, String> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields.as_slice() else {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    };
    let expression = format!(
        "0 {} {} {} {} {}",
        minute,
        hour,
        day,
        month,
        weekday_names(weekday)
    );
    Schedule::from_str(&expression).map_err(|e| e.to_string())
}

fn validate_cron(field: &str, schedule: &str) -> Result<()> {
    parse_cron(schedule)
        .map(|_| ())
        .map_err(|e| {
            invalid(format!(
                "{} '{}' is not a valid cron expression: {}",
                field, schedule, e
            ))
        })
}

fn validate_duration(field: &str, value: &str) -> Result<()> {
    humantime::parse_duration(value)
        .map(|_| ())
        .map_err(|e| invalid(format!("{} '{}' is not a duration: {}", field, value, e)))
}

fn validate_schedules(etcd: &Etcd) -> Result<()> {
    validate_cron(
        "etcd.defragmentationSchedule",
        etcd.spec.etcd.defragmentation_schedule(),
    )?;
    validate_cron(
        "backup.fullSnapshotSchedule",
        etcd.spec.backup.full_snapshot_schedule(),
    )?;
    validate_duration(
        "backup.deltaSnapshotPeriod",
        etcd.spec.backup.delta_snapshot_period(),
    )?;
    validate_duration(
        "backup.garbageCollectionPeriod",
        etcd.spec.backup.garbage_collection_period(),
    )?;
    Ok(())
}

fn validate_backup(etcd: &Etcd) -> Result<()> {
    let backup = &etcd.spec.backup;
    if let Some(max) = backup.max_backups
        && max < 1
    {
        return Err(invalid(format!("backup.maxBackups {} must be at least 1", max)));
    }
    if let Some(store) = &backup.store {
        if let Some(secret_ref) = &store.secret_ref
            && secret_ref.name.as_deref().unwrap_or_default().is_empty()
        {
            return Err(invalid(
                "backup.store.secretRef.name must not be empty".to_string(),
            ));
        }
        if store.prefix.is_empty() {
            return Err(invalid("backup.store.prefix must not be empty".to_string()));
        }
    }
    Ok(())
}

fn validate_tls(etcd: &Etcd) -> Result<()> {
    let Some(tls) = &etcd.spec.etcd.tls else {
        return Ok(());
    };
    let refs = [
        ("clientTLSSecretRef", &tls.client_tls_secret_ref),
        ("serverTLSSecretRef", &tls.server_tls_secret_ref),
        ("tlsCASecretRef", &tls.tls_ca_secret_ref),
    ];
    for (field, secret) in refs {
        if secret.name.as_deref().unwrap_or_default().is_empty() {
            return Err(invalid(format!("etcd.tls.{}.name must not be empty", field)));
        }
    }
    Ok(())
}

/// The selector of an existing StatefulSet cannot change, so it must stay
/// compatible with the spec
pub fn validate_selector_unchanged(etcd: &Etcd, observed: &StatefulSet) -> Result<()> {
    let Some(spec) = &observed.spec else {
        return Ok(());
    };
    let observed_labels = spec.selector.match_labels.clone().unwrap_or_default();
    if !selector_compatible(etcd, &observed_labels) {
        return Err(invalid(format!(
            "selector is immutable: StatefulSet selects {:?}, spec selects {:?} with pod labels {:?}",
            observed_labels,
            etcd.selector_labels(),
            pod_labels(etcd)
        )));
    }
    Ok(())
}
