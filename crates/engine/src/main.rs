//! storesync Engine - headless runner.
//!
//! Runs the sync engine against a standalone host whose main context only
//! logs the commands it is handed. Every player counts as online.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storesync_engine::infrastructure::clock::SystemClock;
use storesync_engine::infrastructure::host::{main_context_queue, run_main_context, StandaloneHost};
use storesync_engine::infrastructure::ports::{ClockPort, CommandStorePort, ExecutionRequest};
use storesync_engine::infrastructure::sqlite_store::SqliteCommandStore;
use storesync_engine::infrastructure::websocket::WebSocketTransport;
use storesync_engine::{EngineConfig, SyncCoordinator};

/// Host main-context tick, roughly one game server tick.
const TICK: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment from repo root when run through cargo from `crates/engine`.
    load_dotenv_from_repo_root();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storesync_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting storesync engine");

    let config = EngineConfig::from_env();
    config.validate()?;

    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());
    let store = Arc::new(SqliteCommandStore::open(&config.database_path, clock.clone()).await?);
    tracing::info!(path = %config.database_path, "Command store opened");

    let transport = Arc::new(WebSocketTransport::new(config.endpoint.clone()));

    let (queue, drain) = main_context_queue();
    let host = Arc::new(StandaloneHost::new(queue).with_everyone_online());
    let host_cancel = CancellationToken::new();
    let host_loop = tokio::spawn(run_main_context(
        drain,
        TICK,
        host_cancel.clone(),
        |request: &ExecutionRequest| {
            tracing::info!(
                command_id = %request.command_id,
                player = %request.player,
                attempt = request.attempt,
                payload = %request.payload,
                "Dispatching command"
            );
            Ok(())
        },
    ));

    let coordinator = SyncCoordinator::new(config, store.clone(), transport, host, clock);
    coordinator.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    coordinator.shutdown().await?;
    store.close().await;
    host_cancel.cancel();
    host_loop.await?;

    Ok(())
}

fn load_dotenv_from_repo_root() {
    let repo_root = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..");

    // Prefer local overrides.
    for filename in [".env.local", ".env"] {
        let path = repo_root.join(filename);
        if path.exists() {
            let _ = dotenvy::from_path(path);
        }
    }
}
