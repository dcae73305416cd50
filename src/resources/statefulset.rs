//! StatefulSet generation for etcd clusters
//!
//! Each pod runs two containers:
//! - `etcd`, started by the bootstrap script from the ConfigMap
//! - `backup-restore`, which validates or restores the data directory before
//!   etcd starts and takes full/delta snapshots into the backup store

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, ExecAction, HTTPGetAction,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    SecretVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Etcd;
use crate::resources::common::{
    CONFIG_CHECKSUM_ANNOTATION, child_labels, configmap_name, owner_reference,
    peer_service_name, pod_labels, quantity_to_bytes, statefulset_name,
};
use crate::resources::configmap::{
    BOOTSTRAP_SCRIPT_KEY, CA_MOUNT_PATH, CLIENT_TLS_MOUNT_PATH, CONFIG_MOUNT_PATH, DATA_DIR,
    SERVER_TLS_MOUNT_PATH,
};

pub const ETCD_CONTAINER: &str = "etcd";
pub const BACKUP_CONTAINER: &str = "backup-restore";

pub const CONFIG_VOLUME: &str = "etcd-config-file";
pub const CLIENT_TLS_VOLUME: &str = "client-url-tls";
pub const SERVER_TLS_VOLUME: &str = "server-url-tls";
pub const CA_VOLUME: &str = "ca-etcd";
pub const STORE_SECRET_VOLUME: &str = "etcd-backup";

const DATA_MOUNT_PATH: &str = "/var/etcd/data";
const STORE_SECRET_MOUNT_PATH: &str = "/root/etcd-backup";

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            default_mode: Some(0o640),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volumes and the per-container mounts for TLS material
fn tls_volumes(etcd: &Etcd) -> (Vec<Volume>, Vec<VolumeMount>) {
    let Some(tls) = &etcd.spec.etcd.tls else {
        return (Vec::new(), Vec::new());
    };
    let refs = [
        (
            CLIENT_TLS_VOLUME,
            &tls.client_tls_secret_ref,
            CLIENT_TLS_MOUNT_PATH,
        ),
        (
            SERVER_TLS_VOLUME,
            &tls.server_tls_secret_ref,
            SERVER_TLS_MOUNT_PATH,
        ),
        (CA_VOLUME, &tls.tls_ca_secret_ref, CA_MOUNT_PATH),
    ];
    let volumes = refs
        .iter()
        .map(|(volume, secret, _)| {
            secret_volume(volume, secret.name.as_deref().unwrap_or_default())
        })
        .collect();
    let mounts = refs
        .iter()
        .map(|(volume, _, path)| mount(volume, path))
        .collect();
    (volumes, mounts)
}

/// `etcdctl` flags for talking to the local member
fn etcdctl_flags(etcd: &Etcd) -> Vec<String> {
    let config = &etcd.spec.etcd;
    let mut flags = vec![format!(
        "--endpoints={}://localhost:{}",
        config.scheme(),
        config.client_port()
    )];
    if config.tls.is_some() {
        flags.push(format!("--cacert={}/ca.crt", CA_MOUNT_PATH));
        flags.push(format!("--cert={}/tls.crt", CLIENT_TLS_MOUNT_PATH));
        flags.push(format!("--key={}/tls.key", CLIENT_TLS_MOUNT_PATH));
    }
    flags
}

fn etcd_container(etcd: &Etcd, tls_mounts: &[VolumeMount]) -> Container {
    let config = &etcd.spec.etcd;
    let data_volume = etcd.volume_claim_template_name();

    let mut volume_mounts = vec![
        mount(&data_volume, DATA_MOUNT_PATH),
        mount(CONFIG_VOLUME, CONFIG_MOUNT_PATH),
    ];
    volume_mounts.extend(tls_mounts.iter().cloned());

    // The backup-restore sidecar only reports healthy once etcd serves requests
    let readiness_probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(etcd.spec.backup.port()),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        period_seconds: Some(5),
        ..Default::default()
    };

    let mut liveness_command = vec!["/bin/sh".to_string(), "-ec".to_string()];
    liveness_command.push(format!(
        "ETCDCTL_API=3 etcdctl {} get foo",
        etcdctl_flags(etcd).join(" ")
    ));
    let liveness_probe = Probe {
        exec: Some(ExecAction {
            command: Some(liveness_command),
        }),
        initial_delay_seconds: Some(15),
        period_seconds: Some(5),
        ..Default::default()
    };

    Container {
        name: ETCD_CONTAINER.to_string(),
        image: Some(config.image().to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![format!(
            "{}/{}",
            CONFIG_MOUNT_PATH, BOOTSTRAP_SCRIPT_KEY
        )]),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: config.client_port(),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("server".to_string()),
                container_port: config.server_port(),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        resources: config.resources.clone(),
        readiness_probe: Some(readiness_probe),
        liveness_probe: Some(liveness_probe),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

/// Arguments of `etcdbrctl server`
pub fn backup_restore_args(etcd: &Etcd) -> Vec<String> {
    let backup = &etcd.spec.backup;
    let config = &etcd.spec.etcd;
    let mut args = vec![
        "server".to_string(),
        format!("--schedule={}", backup.full_snapshot_schedule()),
        format!("--data-dir={}", DATA_DIR),
        format!("--server-port={}", backup.port()),
        format!(
            "--endpoints={}://localhost:{}",
            config.scheme(),
            config.client_port()
        ),
        format!(
            "--defragmentation-schedule={}",
            config.defragmentation_schedule()
        ),
        format!("--delta-snapshot-period={}", backup.delta_snapshot_period()),
        format!(
            "--garbage-collection-policy={}",
            backup.garbage_collection_policy()
        ),
        format!(
            "--garbage-collection-period={}",
            backup.garbage_collection_period()
        ),
    ];

    if let Some(bytes) = quantity_to_bytes(&config.quota()) {
        args.push(format!("--embedded-etcd-quota-bytes={}", bytes));
    }
    if let Some(bytes) = quantity_to_bytes(&backup.delta_snapshot_memory_limit()) {
        args.push(format!("--delta-snapshot-memory-limit={}", bytes));
    }
    if let Some(max) = backup.max_backups() {
        args.push(format!("--max-backups={}", max));
    }

    if let Some(store) = &backup.store {
        if let Some(provider) = &store.provider {
            args.push(format!("--storage-provider={}", provider));
        }
        args.push(format!("--store-prefix={}", store.prefix));
    }

    if config.tls.is_some() {
        args.push("--insecure-transport=false".to_string());
        args.push("--insecure-skip-tls-verify=false".to_string());
        args.push(format!("--cacert={}/ca.crt", CA_MOUNT_PATH));
        args.push(format!("--cert={}/tls.crt", CLIENT_TLS_MOUNT_PATH));
        args.push(format!("--key={}/tls.key", CLIENT_TLS_MOUNT_PATH));
    } else {
        args.push("--insecure-transport=true".to_string());
        args.push("--insecure-skip-tls-verify=true".to_string());
    }

    args
}

fn backup_container(etcd: &Etcd, tls_mounts: &[VolumeMount]) -> Container {
    let backup = &etcd.spec.backup;
    let data_volume = etcd.volume_claim_template_name();

    let mut volume_mounts = vec![mount(&data_volume, DATA_MOUNT_PATH)];
    volume_mounts.extend(tls_mounts.iter().cloned());

    let mut env = Vec::new();
    if let Some(store) = &backup.store {
        if let Some(container) = &store.container {
            env.push(EnvVar {
                name: "STORAGE_CONTAINER".to_string(),
                value: Some(container.clone()),
                ..Default::default()
            });
        }
        if backup.store_secret_name().is_some() {
            volume_mounts.push(mount(STORE_SECRET_VOLUME, STORE_SECRET_MOUNT_PATH));
            env.push(EnvVar {
                name: "STORE_SECRET_DIR".to_string(),
                value: Some(STORE_SECRET_MOUNT_PATH.to_string()),
                ..Default::default()
            });
        }
    }

    Container {
        name: BACKUP_CONTAINER.to_string(),
        image: Some(backup.image().to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["etcdbrctl".to_string()]),
        args: Some(backup_restore_args(etcd)),
        ports: Some(vec![ContainerPort {
            name: Some("backuprestore".to_string()),
            container_port: backup.port(),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: if env.is_empty() { None } else { Some(env) },
        resources: backup.resources.clone(),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

/// Generate the StatefulSet.
///
/// `config_checksum` is stamped on the pod template so that changing the
/// bootstrap ConfigMap rolls the members.
pub fn generate_statefulset(etcd: &Etcd, config_checksum: &str) -> StatefulSet {
    let name = etcd.name_any();
    let (mut volumes, tls_mounts) = tls_volumes(etcd);

    volumes.insert(
        0,
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: configmap_name(&name),
                default_mode: Some(0o755),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    if let Some(secret) = etcd.spec.backup.store_secret_name() {
        volumes.push(secret_volume(STORE_SECRET_VOLUME, secret));
    }

    let mut template_annotations: BTreeMap<String, String> = etcd.spec.annotations.clone();
    template_annotations.insert(
        CONFIG_CHECKSUM_ANNOTATION.to_string(),
        config_checksum.to_string(),
    );

    let pvc_template = PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(etcd.volume_claim_template_name()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: etcd.spec.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    etcd.storage_capacity(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let update_strategy = StatefulSetUpdateStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateStatefulSetStrategy {
            partition: Some(0),
            ..Default::default()
        }),
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(&name)),
            namespace: etcd.namespace(),
            labels: Some(child_labels(etcd)),
            annotations: if etcd.spec.annotations.is_empty() {
                None
            } else {
                Some(etcd.spec.annotations.clone())
            },
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(etcd.spec.replicas),
            service_name: Some(peer_service_name(&name)),
            selector: LabelSelector {
                match_labels: Some(etcd.selector_labels()),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(update_strategy),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(etcd)),
                    annotations: Some(template_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![
                        etcd_container(etcd, &tls_mounts),
                        backup_container(etcd, &tls_mounts),
                    ],
                    volumes: Some(volumes),
                    priority_class_name: etcd.spec.priority_class_name.clone(),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![pvc_template]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
