//! Hollow Fleet - simulated cluster nodes for control-plane load testing
//!
//! This binary impersonates a configurable number of worker agents that
//! register, heartbeat and publish status against a single control plane.

use anyhow::{Context, Result};
use fleet_lib::{
    control_plane::{ControlPlane, GrpcControlPlane, MemoryControlPlane},
    health::HealthRegistry,
    observability::{FleetMetrics, StructuredLogger},
    FleetSupervisor,
};
use hollow_fleet::{
    api,
    config::{ControlPlaneKind, DaemonConfig},
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting hollow-fleet");

    // Load configuration; an invalid fleet fails here, before any agent starts
    let config = DaemonConfig::load().context("Failed to load configuration")?;
    info!(
        fleet_size = config.fleet.fleet_size,
        name_prefix = %config.fleet.name_prefix,
        control_plane = ?config.control_plane.kind,
        "Fleet configured"
    );

    let control_plane: Arc<dyn ControlPlane> = match config.control_plane.kind {
        ControlPlaneKind::Grpc => {
            let client = GrpcControlPlane::connect(config.control_plane.client_config())
                .await
                .context("Failed to configure control plane client")?;
            info!(endpoint = client.endpoint(), "Control plane client configured");
            Arc::new(client)
        }
        ControlPlaneKind::Memory => {
            warn!("Using the in-memory control plane; no external calls will be made");
            Arc::new(MemoryControlPlane::with_call_log_capacity(0))
        }
    };

    let health_registry = HealthRegistry::new();
    let metrics = FleetMetrics::new();
    let logger = StructuredLogger::new(config.fleet.name_prefix.clone());

    let supervisor = Arc::new(FleetSupervisor::new(
        config.fleet.clone(),
        control_plane,
        health_registry.clone(),
        metrics,
    )?);

    // Start health, metrics and placement server
    let app_state = Arc::new(api::AppState::new(supervisor.clone(), health_registry));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    supervisor.start().await?;

    let reason = tokio::select! {
        reason = shutdown_signal() => reason,
        result = api_handle => {
            match result {
                Ok(Ok(())) => "API server exited",
                Ok(Err(e)) => {
                    error!(error = %e, "API server failed");
                    "API server failed"
                }
                Err(e) => {
                    error!(error = %e, "API server task panicked");
                    "API server panicked"
                }
            }
        }
    };
    logger.log_shutdown(reason);

    let report = supervisor.shutdown().await;
    if !report.is_clean() {
        warn!(
            failed = report.failed.len(),
            "Shutdown finished with agents that did not stop cleanly"
        );
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
