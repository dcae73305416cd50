//! Bootstrap ConfigMap generation
//!
//! Holds the etcd configuration file and the bootstrap script that waits for
//! the backup-restore sidecar to validate (or restore) the data directory
//! before starting etcd.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::controller::error::{Error, Result};
use crate::crd::Etcd;
use crate::resources::common::{
    child_labels, configmap_name, owner_reference, peer_service_name, quantity_to_bytes,
    statefulset_name,
};

pub const CONFIG_FILE_KEY: &str = "etcd.conf.yaml";
pub const BOOTSTRAP_SCRIPT_KEY: &str = "bootstrap.sh";

/// Where the ConfigMap is mounted in the etcd container
pub const CONFIG_MOUNT_PATH: &str = "/var/etcd/config";
pub const DATA_DIR: &str = "/var/etcd/data/new.etcd";

pub const CLIENT_TLS_MOUNT_PATH: &str = "/var/etcd/ssl/client";
pub const SERVER_TLS_MOUNT_PATH: &str = "/var/etcd/ssl/server";
pub const CA_MOUNT_PATH: &str = "/var/etcd/ssl/ca";

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct TransportSecurity {
    cert_file: String,
    key_file: String,
    client_cert_auth: bool,
    trusted_ca_file: String,
    auto_tls: bool,
}

/// etcd's `--config-file` format
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct EtcdConfigFile {
    name: String,
    data_dir: String,
    metrics: String,
    snapshot_count: i64,
    enable_v2: bool,
    quota_backend_bytes: i64,
    listen_client_urls: String,
    advertise_client_urls: String,
    listen_peer_urls: String,
    initial_advertise_peer_urls: String,
    initial_cluster: String,
    initial_cluster_token: String,
    initial_cluster_state: String,
    auto_compaction_mode: String,
    auto_compaction_retention: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_transport_security: Option<TransportSecurity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    peer_transport_security: Option<TransportSecurity>,
}

fn transport_security(cert_dir: &str) -> TransportSecurity {
    TransportSecurity {
        cert_file: format!("{}/tls.crt", cert_dir),
        key_file: format!("{}/tls.key", cert_dir),
        client_cert_auth: true,
        trusted_ca_file: format!("{}/ca.crt", CA_MOUNT_PATH),
        auto_tls: false,
    }
}

/// Render `etcd.conf.yaml` for the cluster
pub fn render_config(etcd: &Etcd) -> Result<String> {
    let name = etcd.name_any();
    let namespace = etcd
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let sts = statefulset_name(&name);
    let peer_service = peer_service_name(&name);
    let config = &etcd.spec.etcd;
    let scheme = config.scheme();

    let quota = config.quota();
    let quota_backend_bytes = quantity_to_bytes(&quota)
        .ok_or_else(|| Error::ValidationError(format!("invalid etcd quota {}", quota.0)))?;

    let initial_cluster = (0..etcd.spec.replicas.max(1))
        .map(|ordinal| {
            format!(
                "{sts}-{ordinal}={scheme}://{sts}-{ordinal}.{peer_service}.{namespace}.svc:{}",
                config.server_port()
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    let file = EtcdConfigFile {
        name: format!("etcd-{}", name),
        data_dir: DATA_DIR.to_string(),
        metrics: config.metrics.to_string(),
        snapshot_count: 75000,
        enable_v2: false,
        quota_backend_bytes,
        listen_client_urls: format!("{}://0.0.0.0:{}", scheme, config.client_port()),
        advertise_client_urls: format!("{}://0.0.0.0:{}", scheme, config.client_port()),
        listen_peer_urls: format!("{}://0.0.0.0:{}", scheme, config.server_port()),
        initial_advertise_peer_urls: format!("{}://0.0.0.0:{}", scheme, config.server_port()),
        initial_cluster,
        initial_cluster_token: "new".to_string(),
        initial_cluster_state: "new".to_string(),
        auto_compaction_mode: "periodic".to_string(),
        auto_compaction_retention: "24".to_string(),
        client_transport_security: config
            .tls
            .as_ref()
            .map(|_| transport_security(CLIENT_TLS_MOUNT_PATH)),
        peer_transport_security: config
            .tls
            .as_ref()
            .map(|_| transport_security(SERVER_TLS_MOUNT_PATH)),
    };

    Ok(serde_yaml::to_string(&file)?)
}

/// Render the bootstrap script run as the etcd container's entrypoint
pub fn render_bootstrap_script(etcd: &Etcd) -> String {
    let backup_port = etcd.spec.backup.port();
    format!(
        r#"#!/bin/sh
VALIDATION_MARKER=/var/etcd/data/validation_marker

trap_and_propagate() {{
    PID=$1
    shift
    for sig in "$@"; do
        trap "kill -$sig $PID" "$sig"
    done
}}

start_managed_etcd() {{
    rm -rf $VALIDATION_MARKER
    etcd --config-file {config}/{file} &
    ETCDPID=$!
    trap_and_propagate $ETCDPID INT TERM
    wait $ETCDPID
    RET=$?
    echo $RET > $VALIDATION_MARKER
    exit $RET
}}

check_and_start_etcd() {{
    while true; do
        wget http://localhost:{port}/initialization/status -S -O status
        STATUS=$(cat status)
        case $STATUS in
        "New")
            wget "http://localhost:{port}/initialization/start?mode=$1" -S -O - ;;
        "Progress")
            sleep 1
            continue ;;
        "Failed")
            continue ;;
        "Successful")
            echo "Bootstrap preprocessing end time: $(date)"
            start_managed_etcd
            break ;;
        esac
    done
}}

echo "Bootstrap preprocessing start time: $(date)"
if [ ! -f $VALIDATION_MARKER ]; then
    echo "No marker file. Perform complete initialization routine and start etcd..."
    check_and_start_etcd full
else
    echo "Marker file present. Check return status and decide on initialization"
    run_status=$(cat $VALIDATION_MARKER)
    echo "Marker content: $run_status"
    if [ $run_status = '143' ] || [ $run_status = '130' ] || [ $run_status = '0' ]; then
        echo "Requesting sidecar to perform sanity validation"
        check_and_start_etcd sanity
    else
        echo "Requesting sidecar to perform full validation"
        check_and_start_etcd full
    fi
fi
"#,
        config = CONFIG_MOUNT_PATH,
        file = CONFIG_FILE_KEY,
        port = backup_port,
    )
}

/// Hex sha256 over the ConfigMap data, keys in order
pub fn data_checksum(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Generate the bootstrap ConfigMap
pub fn generate_configmap(etcd: &Etcd) -> Result<ConfigMap> {
    let data = BTreeMap::from([
        (CONFIG_FILE_KEY.to_string(), render_config(etcd)?),
        (
            BOOTSTRAP_SCRIPT_KEY.to_string(),
            render_bootstrap_script(etcd),
        ),
    ]);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(configmap_name(&etcd.name_any())),
            namespace: etcd.namespace(),
            labels: Some(child_labels(etcd)),
            owner_references: Some(vec![owner_reference(etcd)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}
