//! 5GMS Application Function
//!
//! # Servers
//!
//! Four HTTP surfaces, each on its own bind address unless configured to
//! share one:
//! - M1 provisioning (default: 0.0.0.0:7778)
//! - M5 service access (default: 0.0.0.0:7779)
//! - Management, health and metrics (default: 127.0.0.1:7780)
//! - SBI callbacks (default: 0.0.0.0:7777)
//!
//! # Startup Flow
//!
//! 1. Initialize tracing
//! 2. Load configuration from environment (fatal on error)
//! 3. Initialize Prometheus metrics recorder
//! 4. Build the context (server name resolution, configured servers)
//! 5. Spawn the dispatcher with the M3 and registry clients
//! 6. Bind every listener (fail fast), then serve
//! 7. Start the interfaces
//! 8. Wait for shutdown signal
//!
//! # Shutdown Flow
//!
//! Mark not ready, submit an orderly shutdown, wait (bounded) for the
//! dispatcher to stop every interface, then stop the HTTP servers.

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use af_service::config::Config;
use af_service::context::Context;
use af_service::dispatcher::{DispatcherHandle, Transport};
use af_service::http::{self, AppState};
use af_service::observability::{init_metrics_recorder, HealthState};
use af_service::transport::{M3Client, NrfClient};
use common::config::{LogFormat, ObservabilityConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for the orderly shutdown of the interfaces.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let vars: HashMap<String, String> = std::env::vars().collect();

    // Initialize tracing
    let observability = ObservabilityConfig::from_vars(&vars)?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| observability.log_filter.clone().into());
    match observability.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    info!("Starting 5GMS Application Function");

    // Load configuration
    let config = Config::from_vars(&vars).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        application_servers = config.application_servers.len(),
        m1_bind_address = %config.m1_bind_address,
        m5_bind_address = %config.m5_bind_address,
        mgmt_bind_address = %config.mgmt_bind_address,
        sbi_bind_address = %config.sbi_bind_address,
        core_integration = config.core_integration,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let config = Arc::new(config);

    let context = Context::init(Arc::clone(&config)).map_err(|e| {
        error!(error = %e, "Failed to initialize context");
        e
    })?;

    let transport = Transport {
        application_servers: Arc::new(M3Client::new(config.request_timeout)?),
        registry: Arc::new(NrfClient::new(
            config.registry_url.clone(),
            config.request_timeout,
        )?),
    };

    let (dispatcher, dispatcher_task) =
        DispatcherHandle::spawn(context, transport, Arc::clone(&health_state));
    info!("Dispatcher started");

    let shutdown_token = CancellationToken::new();
    let app_state = Arc::new(AppState {
        dispatcher: dispatcher.clone(),
    });

    // Bind every listener BEFORE spawning to fail fast on bind errors
    let mut bound = Vec::new();
    for (address, router) in http::listeners(
        &config,
        app_state,
        Arc::clone(&health_state),
        metrics_handle,
    ) {
        let addr: SocketAddr = address.parse().map_err(|e| {
            error!(error = %e, addr = %address, "Invalid bind address");
            format!("Invalid bind address {address}: {e}")
        })?;
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            error!(error = %e, addr = %addr, "Failed to bind listener");
            format!("Failed to bind {addr}: {e}")
        })?;
        info!(addr = %addr, "Listener bound successfully");
        bound.push((addr, listener, router));
    }

    for (addr, listener, router) in bound {
        let server_token = shutdown_token.child_token();
        tokio::spawn(async move {
            info!(addr = %addr, "HTTP server starting");
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                server_token.cancelled().await;
                info!(addr = %addr, "HTTP server shutting down");
            });
            if let Err(e) = server.await {
                error!(error = %e, addr = %addr, "HTTP server failed");
            }
        });
    }

    dispatcher.start().await?;
    info!("Application Function running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so traffic drains away
    health_state.set_not_ready();

    if let Err(e) = dispatcher.shutdown().await {
        warn!(error = %e, "Dispatcher already stopped");
    }

    let abort = dispatcher_task.abort_handle();
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, dispatcher_task).await {
        Ok(Ok(report)) => info!(
            sessions = report.sessions,
            servers = report.servers,
            pending_purges = report.pending_purges,
            "Interfaces stopped"
        ),
        Ok(Err(e)) => error!(error = %e, "Dispatcher task failed"),
        Err(_) => {
            warn!(
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Orderly shutdown timed out; cancelling dispatcher"
            );
            dispatcher.cancel();
            abort.abort();
        }
    }

    shutdown_token.cancel();
    health_state.set_not_live();

    info!("Application Function shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
