use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use etcd_druid::config::OperatorConfig;
use etcd_druid::health::{HealthState, run_health_server};
use etcd_druid::run_operator;

/// Upper bound for the operator to wind down after a shutdown signal
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("etcd_druid=info".parse()?)
        .add_directive("kube=info".parse()?);
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting etcd-druid");

    let config = OperatorConfig::from_env()?;
    info!(
        namespace = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        workers = config.workers,
        health_addr = %config.health_addr,
        "Loaded configuration"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    let health_state = Arc::new(HealthState::new());

    // Probes should answer while the caches are still syncing
    let health_handle = {
        let health_state = health_state.clone();
        let shutdown = shutdown.clone();
        let addr = config.health_addr;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr, shutdown).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let mut operator_handle = tokio::spawn(run_operator(
        client,
        config,
        health_state.clone(),
        shutdown.clone(),
    ));

    tokio::select! {
        result = &mut operator_handle => {
            if let Err(e) = result {
                error!("Operator task panicked: {}", e);
            }
            shutdown.cancel();
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            shutdown.cancel();

            match tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS),
                &mut operator_handle,
            )
            .await
            {
                Ok(Err(e)) => error!("Operator task panicked: {}", e),
                Ok(Ok(())) => {}
                Err(_) => error!(
                    "Operator did not stop within {}s, exiting",
                    SHUTDOWN_GRACE_PERIOD_SECS
                ),
            }
        }
    }

    if let Err(e) = health_handle.await {
        error!("Health server task panicked: {}", e);
    }

    info!("Operator stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
