//! kunit operator - runs the Unit and UnitSet controllers

mod cli;
mod controller_runner;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use kunit_common::crd::{Unit, UnitSet};
use kunit_common::telemetry::init_telemetry;

use crate::cli::Cli;
use crate::controller_runner::{build_unit_controller, build_unitset_controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let unit = serde_yaml::to_string(&Unit::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize Unit CRD: {}", e))?;
        let unitset = serde_yaml::to_string(&UnitSet::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize UnitSet CRD: {}", e))?;
        println!("{unit}---\n{unitset}");
        return Ok(());
    }

    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        anyhow::bail!("failed to install rustls crypto provider: {:?}", e);
    }

    let _log_guard = init_telemetry(cli.telemetry_config())?;
    run_controllers(cli).await
}

async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    let config = cli.operator_config();
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    // Aborts in-flight waits (readiness, teardown) once shutdown starts
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    tracing::info!(
        manager_namespace = %config.manager_namespace,
        agent_host_type = %config.agent_host_type,
        concurrency = config.concurrency,
        "Starting kunit controllers"
    );

    let controllers = vec![
        build_unit_controller(client.clone(), config.clone(), cancel.clone())?,
        build_unitset_controller(client, config, cancel),
    ];
    futures::future::join_all(controllers).await;

    tracing::info!("kunit controllers stopped");
    Ok(())
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("shutdown signal received, cancelling in-flight waits");
    cancel.cancel();
}
