//! Stream ingestion manager.
//!
//! Maintains a bounded, ordered in-memory history of [`Reading`]s and a
//! last-write-wins `latest` slot, fed by one of three sources:
//!
//! - the bridge's live WebSocket channel, when a bridge URL is configured
//! - a synthetic generator that random-walks the last reading, when no
//!   bridge is configured (so the dashboard always has data to show)
//! - an injected event channel, which is what tests drive directly
//!
//! On startup the live path performs one history backfill from the
//! bridge before any live appends; backfill failures are swallowed and
//! leave the history empty, since the live/synthetic path self-heals.
//!
//! All background tasks watch a shutdown channel and wind down
//! idempotently without leaking timers or subscriptions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeClient, BridgeFrame};
use crate::model::Reading;

/// Default bounded history capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 200;

/// Default synthetic generator tick.
pub const DEFAULT_SYNTHETIC_INTERVAL: Duration = Duration::from_millis(3000);

/// Default row cap for the startup backfill.
pub const DEFAULT_BACKFILL_MAX: u32 = 5000;

/// Default bound on consecutive reconnect attempts before giving up.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Synthetic seed values used when there is no previous reading.
const SEED_PH: f64 = 7.2;
const SEED_TEMP: f64 = 25.0;
const SEED_DO: f64 = 6.5;

/// Stream manager configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// HTTP base URL of the sensor bridge. `None` selects synthetic mode.
    pub bridge_url: Option<String>,
    /// Bounded history capacity.
    pub buffer_size: usize,
    /// Synthetic generator tick interval.
    pub synthetic_interval: Duration,
    /// Row cap for the startup backfill.
    pub backfill_max: u32,
    /// Consecutive reconnect attempts before surfacing `Disconnected`.
    pub reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bridge_url: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            synthetic_interval: DEFAULT_SYNTHETIC_INTERVAL,
            backfill_max: DEFAULT_BACKFILL_MAX,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

/// Where the manager currently gets its data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No live channel and no synthetic generator.
    Disconnected,
    /// Establishing the live channel.
    Connecting,
    /// Live channel up and delivering.
    Connected,
    /// Live channel lost, retrying.
    Reconnecting,
    /// Permanent fallback generator, entered when no bridge is configured.
    Synthetic,
}

/// One event on the ingestion channel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A new reading to append.
    Reading(Reading),
    /// Hardware connectivity changed.
    Connectivity { connected: bool },
}

struct Inner {
    buffer_size: usize,
    history: RwLock<VecDeque<Reading>>,
    latest_tx: watch::Sender<Option<Reading>>,
    state: RwLock<ConnectionState>,
}

impl Inner {
    fn new(buffer_size: usize) -> Self {
        let (latest_tx, _) = watch::channel(None);
        Self {
            buffer_size,
            history: RwLock::new(VecDeque::with_capacity(buffer_size)),
            latest_tx,
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Append one reading, evicting the oldest past capacity, and make
    /// it the new latest.
    async fn append(&self, reading: Reading) {
        {
            let mut history = self.history.write().await;
            if history.len() >= self.buffer_size {
                history.pop_front();
            }
            history.push_back(reading.clone());
        }
        self.latest_tx.send_replace(Some(reading));
    }

    /// Replace the history with backfilled readings (oldest dropped to
    /// fit capacity).
    async fn seed(&self, readings: Vec<Reading>) {
        let mut history = self.history.write().await;
        history.clear();
        let skip = readings.len().saturating_sub(self.buffer_size);
        for reading in readings.into_iter().skip(skip) {
            history.push_back(reading);
        }
        if let Some(last) = history.back() {
            self.latest_tx.send_replace(Some(last.clone()));
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }
}

/// Owner of the telemetry history and its feeding tasks.
///
/// Constructed once per session and shared via `Arc`; there is no
/// process-global state.
pub struct StreamManager {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamManager {
    fn with_inner(inner: Arc<Inner>) -> (Arc<Self>, watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::new(Self {
            inner,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        (manager, shutdown_rx)
    }

    /// Start the manager: live bridge subscription when a URL is
    /// configured, otherwise the permanent synthetic generator.
    pub async fn spawn(config: StreamConfig) -> Arc<Self> {
        let inner = Arc::new(Inner::new(config.buffer_size));
        let (manager, shutdown_rx) = Self::with_inner(inner.clone());

        let task = match config.bridge_url.clone() {
            Some(url) => {
                let client = BridgeClient::new(&url);
                tokio::spawn(run_live(inner, client, config, shutdown_rx))
            }
            None => {
                info!("No bridge configured, generating synthetic telemetry");
                tokio::spawn(run_synthetic(inner, config.synthetic_interval, shutdown_rx))
            }
        };
        manager.tasks.lock().await.push(task);
        manager
    }

    /// Drive the manager from an injected event channel.
    ///
    /// This is the seam tests use; the live WebSocket task is just a
    /// production producer for the same event shape.
    pub async fn from_channel(
        config: StreamConfig,
        events: mpsc::Receiver<StreamEvent>,
    ) -> Arc<Self> {
        let inner = Arc::new(Inner::new(config.buffer_size));
        let (manager, shutdown_rx) = Self::with_inner(inner.clone());
        let task = tokio::spawn(run_ingest(inner, events, shutdown_rx));
        manager.tasks.lock().await.push(task);
        manager
    }

    /// Snapshot of the bounded history, oldest first.
    pub async fn history(&self) -> Vec<Reading> {
        self.inner.history.read().await.iter().cloned().collect()
    }

    /// The most recently appended reading, if any.
    pub fn latest(&self) -> Option<Reading> {
        self.inner.latest_tx.borrow().clone()
    }

    /// Watch the latest reading; used by the alert evaluation loop.
    pub fn subscribe_latest(&self) -> watch::Receiver<Option<Reading>> {
        self.inner.latest_tx.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Signal all feeding tasks to stop. Idempotent; safe to call from
    /// multiple places during teardown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shut down and wait for the feeding tasks to finish.
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Consume an event channel until it closes or shutdown is signaled.
async fn run_ingest(
    inner: Arc<Inner>,
    mut events: mpsc::Receiver<StreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // Drain queued events before observing shutdown so nothing
            // already accepted is dropped on teardown.
            biased;
            event = events.recv() => match event {
                Some(StreamEvent::Reading(reading)) => inner.append(reading).await,
                Some(StreamEvent::Connectivity { connected }) => {
                    let state = if connected {
                        ConnectionState::Connected
                    } else {
                        ConnectionState::Disconnected
                    };
                    inner.set_state(state).await;
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Live path: backfill once, then subscribe with bounded reconnects.
async fn run_live(
    inner: Arc<Inner>,
    client: BridgeClient,
    config: StreamConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    inner.set_state(ConnectionState::Connecting).await;

    // One backfill before live appends. Failures leave the history
    // empty; the live channel will fill it back up.
    tokio::select! {
        result = client.fetch_history("24h", config.backfill_max) => match result {
            Ok(readings) => {
                info!(count = readings.len(), "Backfilled telemetry history");
                inner.seed(readings).await;
            }
            Err(e) => {
                warn!(error = %e, "History backfill failed, starting empty");
            }
        },
        _ = wait_for_shutdown(&mut shutdown) => return,
    }

    let mut failures = 0u32;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match client.connect().await {
            Ok(socket) => {
                failures = 0;
                inner.set_state(ConnectionState::Connected).await;
                let stopped = run_session(&inner, socket, &mut shutdown).await;
                if stopped {
                    break;
                }
                warn!("Bridge session ended, reconnecting");
            }
            Err(e) => {
                warn!(error = %e, "Bridge connection failed");
            }
        }

        failures += 1;
        if failures >= config.reconnect_attempts {
            warn!(attempts = failures, "Giving up on the bridge");
            inner.set_state(ConnectionState::Disconnected).await;
            break;
        }
        inner.set_state(ConnectionState::Reconnecting).await;

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }
}

/// Drive one WebSocket session. Returns true when shutdown was signaled.
async fn run_session(
    inner: &Inner,
    socket: crate::bridge::BridgeSocket,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (_sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(inner, &text).await,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Bridge closed the live channel");
                    return false;
                }
                Some(Ok(_)) => {
                    // Binary / Frame: ignore.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Live channel receive error");
                    return false;
                }
                None => {
                    info!("Live channel exhausted");
                    return false;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
        }
    }
}

async fn handle_frame(inner: &Inner, text: &str) {
    match serde_json::from_str::<BridgeFrame>(text) {
        Ok(BridgeFrame::Telemetry { data }) => inner.append(data).await,
        Ok(status @ BridgeFrame::SerialStatus { .. }) => {
            let state = if status.any_connected() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            debug!(?state, "Hardware status frame");
            inner.set_state(state).await;
        }
        Err(e) => {
            warn!(error = %e, raw = %text, "Unknown or malformed bridge frame");
        }
    }
}

/// Permanent fallback generator.
async fn run_synthetic(
    inner: Arc<Inner>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    inner.set_state(ConnectionState::Synthetic).await;

    let mut ticker = tokio::time::interval(interval);
    let mut last: Option<Reading> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let next = next_synthetic(last.as_ref());
                inner.append(next.clone()).await;
                last = Some(next);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Perturb the previous reading with bounded random-walk noise, with an
/// occasional larger pH excursion to exercise the alerting paths.
fn next_synthetic(last: Option<&Reading>) -> Reading {
    let mut rng = rand::thread_rng();

    let (last_ph, last_temp, last_do) = match last {
        Some(r) => (r.ph, r.temp_c.unwrap_or(SEED_TEMP), r.do_mg_l),
        None => (SEED_PH, SEED_TEMP, SEED_DO),
    };

    let mut ph = last_ph + rng.gen_range(-0.04..=0.04);
    if rng.gen_bool(0.05) {
        let excursion = rng.gen_range(0.8..=2.0);
        ph += if rng.gen_bool(0.5) { excursion } else { -excursion };
    }
    let ph = ph.clamp(0.0, 14.0);
    let temp = (last_temp + rng.gen_range(-0.2..=0.2)).clamp(0.0, 40.0);
    let do_mg_l = (last_do + rng.gen_range(-0.1..=0.1)).clamp(0.0, 15.0);
    let fish_health = (75.0_f64 + rng.gen_range(-5.0..=5.0)).round();

    Reading {
        timestamp: Utc::now(),
        ph: round_to(ph, 2),
        temp_c: Some(round_to(temp, 1)),
        do_mg_l: round_to(do_mg_l, 2),
        fish_health: Some(fish_health),
        quality_ai: None,
        status_ai: None,
    }
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
