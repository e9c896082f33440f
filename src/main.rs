//! Aquamon - real-time telemetry service for an aquaculture monitoring rig.
//!
//! Startup wiring: storage, the persisted alert configuration, the rate
//! limiter and its sweep loop, the stream ingestion manager (live bridge
//! or synthetic fallback), the alert evaluation loop, and the HTTP API.
//! Everything long-running is tied to one shutdown signal so teardown is
//! clean and idempotent.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use aquamon::alerts::{AlertEngine, LogNotifier, spawn_evaluation_loop};
use aquamon::api::{AppState, router};
use aquamon::config::{AlertConfig, PREFERENCES_KEY};
use aquamon::rate_limit::{ForwardedClientIdentity, RateLimiter, spawn_sweeper};
use aquamon::storage::Storage;
use aquamon::stream::{StreamConfig, StreamManager};

/// Default port if not specified via environment variable.
const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
const DEFAULT_DB_PATH: &str = "sqlite:aquamon.db?mode=rwc";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with environment filter
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("aquamon=info".parse()?))
        .init();

    // Load configuration from environment
    let port: u16 = env::var("AQUAMON_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let db_url = env::var("AQUAMON_DATABASE_URL").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());

    // No bridge URL selects the synthetic generator
    let bridge_url = env::var("AQUAMON_BRIDGE_URL").ok().filter(|url| !url.is_empty());

    let mut stream_config = StreamConfig { bridge_url, ..StreamConfig::default() };
    if let Some(size) = env::var("AQUAMON_BUFFER_SIZE").ok().and_then(|s| s.parse().ok()) {
        stream_config.buffer_size = size;
    }

    info!(port, db_url = %db_url, bridge = ?stream_config.bridge_url, "Starting Aquamon");

    // Initialize storage
    let storage = Storage::new(&db_url).await?;
    info!("Database initialized");

    // Alert configuration is loaded once at session start; a missing or
    // malformed blob merges down to the defaults.
    let alert_config = storage
        .load_preference(PREFERENCES_KEY)
        .await?
        .as_deref()
        .map(AlertConfig::from_blob)
        .unwrap_or_default();

    let engine = Arc::new(AlertEngine::new(
        alert_config.thresholds.clone(),
        Duration::from_millis(alert_config.notifications.cooldown_ms),
        Arc::new(LogNotifier),
    ));

    // One shutdown signal for every background loop
    let (shutdown_tx, _) = watch::channel(false);

    let limiter = Arc::new(RateLimiter::new());
    spawn_sweeper(limiter.clone(), shutdown_tx.subscribe());

    let stream = StreamManager::spawn(stream_config).await;
    spawn_evaluation_loop(stream.subscribe_latest(), engine.clone(), shutdown_tx.subscribe());

    // Create application state
    let state = AppState {
        storage,
        stream: stream.clone(),
        limiter,
        engine,
        identity: Arc::new(ForwardedClientIdentity),
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Aquamon is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
            stream.shutdown();
        })
        .await?;

    Ok(())
}
