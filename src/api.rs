//! HTTP API handlers for Aquamon.
//!
//! The write boundary (`POST /telemetry`) sits behind the sliding-window
//! rate limiter; a denied request gets a 429 with a `Retry-After` hint
//! rather than an error the caller should treat as failure. Read
//! endpoints serve the stored history, the stream manager's live view,
//! and the alert configuration.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::alerts::{self, ActiveAlert, AlertEngine};
use crate::config::{AlertConfig, PREFERENCES_KEY};
use crate::model::{HistoryQuery, Reading, ReadingSubmission, SaveBody, SaveResponse};
use crate::rate_limit::{ClientIdentity, RateLimiter};
use crate::storage::Storage;
use crate::stream::{ConnectionState, StreamManager};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub stream: Arc<StreamManager>,
    pub limiter: Arc<RateLimiter>,
    pub engine: Arc<AlertEngine>,
    pub identity: Arc<dyn ClientIdentity>,
}

impl AppState {
    /// The freshest reading available: the live view first, then storage.
    async fn latest_reading(&self) -> Option<Reading> {
        if let Some(reading) = self.stream.latest() {
            return Some(reading);
        }
        self.storage.latest(None).await.ok().flatten()
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/telemetry", post(post_telemetry).get(get_history))
        .route("/telemetry/latest", get(get_latest))
        .route("/telemetry/status", get(get_status))
        .route("/alerts/active", get(get_active_alerts))
        .route("/alerts/thresholds", get(get_thresholds).put(put_thresholds))
        .route("/health", get(health_check))
        .with_state(state)
}

/// POST /telemetry - Persist externally-reported readings.
///
/// Accepts a single record or an array. A record must carry a timestamp
/// and at least one of pH / dissolved oxygen; invalid records are
/// filtered rather than failing the batch.
///
/// # Response
///
/// - `200` with `{success, saved, total}` on success
/// - `400` when no valid records remain
/// - `429` with a `Retry-After` header when the rate limiter denies
#[instrument(skip(state, headers, body))]
pub async fn post_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SaveBody>,
) -> Response {
    let client_id = state.identity.identify(&headers);
    let decision = state.limiter.check(&client_id);
    if !decision.allowed {
        let retry_after = decision.retry_after_secs.unwrap_or(1);
        warn!(client = %client_id, retry_after, "Telemetry write rate limited");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Rate limit exceeded" })),
        )
            .into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let records = body.into_records();
    let total = records.len();
    let valid: Vec<_> = records
        .into_iter()
        .filter_map(ReadingSubmission::normalize)
        .collect();

    if valid.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No valid telemetry records found" })),
        )
            .into_response();
    }

    match state.storage.insert_readings(&valid).await {
        Ok(saved) => {
            info!(saved, total, "Telemetry saved");
            Json(SaveResponse { success: true, saved, total }).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Failed to save telemetry");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to save telemetry data" })),
            )
                .into_response()
        }
    }
}

/// GET /telemetry - Query stored readings, ascending by timestamp.
///
/// # Query Parameters
///
/// - `from` / `to` (optional): RFC 3339 bounds; `from` overrides `range`
/// - `range` (optional): "24h" (default), "1w" or "1m"
/// - `user_id` (optional): per-user filter
/// - `max` (optional): row cap, clamped to 10 000
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Reading>>, StatusCode> {
    let (from, to, max) = query.resolve(Utc::now());

    match state
        .storage
        .query_range(from, to, query.user_id.as_deref(), max)
        .await
    {
        Ok(readings) => {
            info!(count = readings.len(), "History queried");
            Ok(Json(readings))
        }
        Err(e) => {
            warn!(error = %e, "Failed to fetch telemetry history");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /telemetry/latest - The most recent reading.
///
/// Prefers the stream manager's live view, falls back to storage, and
/// 404s when neither has data yet.
#[instrument(skip(state))]
pub async fn get_latest(State(state): State<AppState>) -> Response {
    match state.latest_reading().await {
        Some(reading) => Json(reading).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No telemetry data found" })),
        )
            .into_response(),
    }
}

/// Storage-side statistics for the status endpoint.
#[derive(Debug, Serialize)]
pub struct DatabaseStats {
    pub total_records: i64,
    pub records_last_24h: i64,
    pub latest_timestamp: Option<DateTime<Utc>>,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub is_active: bool,
}

/// Stream-side status for the status endpoint.
#[derive(Debug, Serialize)]
pub struct StreamStatus {
    pub state: ConnectionState,
    pub connected: bool,
}

/// Response for `GET /telemetry/status`.
#[derive(Debug, Serialize)]
pub struct TelemetryStatus {
    pub database: DatabaseStats,
    pub stream: StreamStatus,
    pub timestamp: DateTime<Utc>,
}

/// GET /telemetry/status - Pipeline health overview.
#[instrument(skip(state))]
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<TelemetryStatus>, StatusCode> {
    let now = Utc::now();

    let stats = async {
        let total_records = state.storage.total_count().await?;
        let records_last_24h = state.storage.count_since(now - Duration::hours(24)).await?;
        let latest_timestamp = state.storage.latest(None).await?.map(|r| r.timestamp);
        let oldest_timestamp = state.storage.oldest_timestamp().await?;
        anyhow::Ok(DatabaseStats {
            total_records,
            records_last_24h,
            latest_timestamp,
            oldest_timestamp,
            is_active: total_records > 0,
        })
    }
    .await;

    match stats {
        Ok(database) => {
            let connection_state = state.stream.connection_state().await;
            Ok(Json(TelemetryStatus {
                database,
                stream: StreamStatus {
                    state: connection_state,
                    connected: connection_state == ConnectionState::Connected,
                },
                timestamp: now,
            }))
        }
        Err(e) => {
            warn!(error = %e, "Failed to get telemetry status");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Response for `GET /alerts/active`.
#[derive(Debug, Serialize)]
pub struct ActiveAlertsResponse {
    pub alerts: Vec<ActiveAlert>,
    /// Timestamp of the reading that was evaluated, if any.
    pub reading_timestamp: Option<DateTime<Utc>>,
}

/// GET /alerts/active - Evaluate the latest reading against the current
/// thresholds. Read-only: does not advance the notification cooldown.
#[instrument(skip(state))]
pub async fn get_active_alerts(State(state): State<AppState>) -> Json<ActiveAlertsResponse> {
    let thresholds = state.engine.thresholds().await;

    let (alerts, reading_timestamp) = match state.latest_reading().await {
        Some(reading) => (
            alerts::evaluate(&reading, &thresholds),
            Some(reading.timestamp),
        ),
        None => (Vec::new(), None),
    };

    info!(count = alerts.len(), "Active alerts queried");
    Json(ActiveAlertsResponse { alerts, reading_timestamp })
}

/// GET /alerts/thresholds - The persisted alert configuration, with
/// defaults merged under any missing keys.
#[instrument(skip(state))]
pub async fn get_thresholds(State(state): State<AppState>) -> Result<Json<AlertConfig>, StatusCode> {
    match state.storage.load_preference(PREFERENCES_KEY).await {
        Ok(blob) => {
            let config = blob
                .as_deref()
                .map(AlertConfig::from_blob)
                .unwrap_or_default();
            Ok(Json(config))
        }
        Err(e) => {
            warn!(error = %e, "Failed to load alert config");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /alerts/thresholds - Overwrite the alert configuration.
///
/// The body is merged with defaults, persisted as the new blob, and the
/// running alert engine picks up the threshold changes immediately.
#[instrument(skip(state, config))]
pub async fn put_thresholds(
    State(state): State<AppState>,
    Json(config): Json<AlertConfig>,
) -> Result<Json<AlertConfig>, StatusCode> {
    match state
        .storage
        .save_preference(PREFERENCES_KEY, &config.to_blob())
        .await
    {
        Ok(()) => {
            state.engine.set_thresholds(config.thresholds.clone()).await;
            info!("Alert config updated");
            Ok(Json(config))
        }
        Err(e) => {
            warn!(error = %e, "Failed to save alert config");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
