//! Horde Stats Server - Live telemetry aggregation for zombie-survival matches
//!
//! This is the main entry point for the stats engine. It handles:
//! - TCP feed connections from game servers (script events + lifecycle verbs)
//! - HTTP endpoints for health and per-client metrics
//! - Periodic flushing of queued stat records to Supabase

mod app;
mod config;
mod events;
mod http;
mod ingest;
mod state;
mod store;
mod util;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::Config;
use crate::events::{EventProcessor, SyntheticEvent};
use crate::http::build_router;
use crate::state::ClientStateManager;
use crate::store::{StatsGateway, SupabaseGateway};
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Horde Stats Server");
    info!("Server address: {}", config.server_addr);
    info!("Feed address: {}", config.ingest_addr);

    let gateway = SupabaseGateway::new(&config);
    let manager = Arc::new(ClientStateManager::new(gateway));
    manager.initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Kill/damage/round events re-emitted for downstream consumers. Nothing
    // subscribes in-process yet, so the drain task just logs them.
    let (synthetic_tx, synthetic_rx) = mpsc::unbounded_channel::<SyntheticEvent>();
    tokio::spawn(drain_synthetic_events(synthetic_rx));

    let processor = Arc::new(EventProcessor::new(Arc::clone(&manager), synthetic_tx));

    // Game server feed listener
    let feed_listener = TcpListener::bind(config.ingest_addr).await?;
    tokio::spawn(ingest::run_listener(
        feed_listener,
        processor,
        Arc::clone(&manager),
        shutdown_rx.clone(),
    ));

    // Periodic flush of the persistence queue, independent of feed traffic
    tokio::spawn(flush_loop(
        Arc::clone(&manager),
        config.flush_interval_secs,
        shutdown_rx.clone(),
    ));

    // Build router
    let state = AppState::new(config.clone(), Arc::clone(&manager));
    let router = build_router(state);

    let addr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the feed and flush tasks, then drain whatever is still queued.
    // The final flush gets its own, never-signalled cancellation handle so it
    // runs to completion.
    let _ = shutdown_tx.send(true);
    let (_drain_tx, drain_rx) = watch::channel(false);
    manager.update_state(&drain_rx).await;

    info!("Server shutdown complete");
    Ok(())
}

async fn drain_synthetic_events(mut rx: mpsc::UnboundedReceiver<SyntheticEvent>) {
    while let Some(event) = rx.recv().await {
        debug!(?event, "synthetic event emitted");
    }
}

async fn flush_loop<G: StatsGateway>(
    manager: Arc<ClientStateManager<G>>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                manager.update_state(&shutdown).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
