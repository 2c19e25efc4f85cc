//! kbagent
//!
//! Sidecar agent that runs lifecycle actions for a database replica.
//!
//! ## Components
//!
//! - **HTTP server**: `POST /v1.0/action` request/response calls
//! - **Streaming server**: raw data pipes for dump/load between replicas
//! - **Probes**: periodic health/role checks reported as cluster events
//! - **Tasks**: replica bootstrap started at process start

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kbagent::config::{self, Config};
use kbagent::server::{create_router, AppState};
use kbagent::{
    ActionExecutor, ActionService, ClusterEventSender, EventSender, LogEventSender, ProbeService,
    StreamingService, TaskService,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Prefer RUST_LOG, fall back to KB_AGENT_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kbagent");

    let startup = config::startup_from_env()?;
    let pod = config::pod_identity_from_env();
    info!(
        actions = startup.actions.len(),
        probes = startup.probes.len(),
        streaming = startup.streaming.len(),
        tasks = startup.tasks.len(),
        pod = %pod.pod_name,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let executor = ActionExecutor::with_defaults()?;
    let actions = Arc::new(ActionService::new(startup.actions, executor, shutdown.clone())?);

    let sender: Arc<dyn EventSender> = match ClusterEventSender::from_service_account(pod.clone()) {
        Ok(Some(sender)) => Arc::new(sender),
        Ok(None) => {
            info!("Not running in a cluster, events go to the log");
            Arc::new(LogEventSender)
        }
        Err(e) => {
            warn!(error = %e, "Failed to set up cluster event sender, events go to the log");
            Arc::new(LogEventSender)
        }
    };

    let probes = ProbeService::new(
        pod.pod_name.clone(),
        startup.probes,
        Arc::clone(&actions),
        Arc::clone(&sender),
    )?;

    // Request/response server
    let listener = TcpListener::bind(config.http_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr()))?;
    info!(addr = %config.http_addr(), "Listening for connections");
    let app = create_router(AppState::new(Arc::clone(&actions), config.max_concurrency));
    let server_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.cancelled().await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    // Streaming server
    let streaming_listener = TcpListener::bind(config.streaming_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.streaming_addr()))?;
    let streaming = Arc::new(StreamingService::new(Arc::clone(&actions), &startup.streaming));
    let streaming_handle = tokio::spawn(streaming.run(streaming_listener, shutdown.clone()));

    let probe_handles = probes.start(&shutdown);

    let tasks = TaskService::new(pod.pod_name.clone(), Arc::clone(&actions), Arc::clone(&sender));
    tasks.start(startup.tasks);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
        result = streaming_handle => {
            match result {
                Ok(Ok(())) => info!("Streaming server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Streaming server error"),
                Err(e) => error!(error = %e, "Streaming server task panicked"),
            }
        }
    }

    shutdown.cancel();

    info!("Waiting for probes to shut down...");
    let shutdown_timeout = Duration::from_secs(10);
    for handle in probe_handles {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Probe did not shut down in time");
        }
    }

    info!("kbagent shutdown complete");
    Ok(())
}
