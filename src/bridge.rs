//! Client for the sensor bridge.
//!
//! The bridge is the small process that talks to the rig's sensor boards
//! and re-exposes them over HTTP and WebSocket:
//!
//! - `GET /history?range=24h&max=5000` returns recent readings as JSON
//! - `GET /ws` streams live frames: telemetry readings interleaved with
//!   hardware connectivity updates
//!
//! [`BridgeClient`] holds the connection configuration; the stream
//! manager drives the actual subscription loop.

use std::time::Duration;

use serde::Deserialize;
use tokio_tungstenite::{MaybeTlsStream, connect_async};

use crate::model::Reading;

/// Upper bound on the one-shot history backfill request.
const BACKFILL_TIMEOUT: Duration = Duration::from_secs(10);

/// A live WebSocket connection to the bridge.
pub type BridgeSocket =
    tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One frame on the bridge's live channel.
///
/// The bridge interleaves telemetry with serial-port status so consumers
/// can tell "no data" apart from "no hardware".
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeFrame {
    /// A new reading from the rig.
    #[serde(rename = "telemetry")]
    Telemetry { data: Reading },

    /// Hardware connectivity of the two sensor boards.
    #[serde(rename = "serial:status")]
    SerialStatus {
        #[serde(default)]
        main: bool,
        #[serde(default)]
        secondary: bool,
    },
}

impl BridgeFrame {
    /// Whether any sensor board is attached, for a status frame.
    pub fn any_connected(&self) -> bool {
        match self {
            BridgeFrame::Telemetry { .. } => true,
            BridgeFrame::SerialStatus { main, secondary } => *main || *secondary,
        }
    }
}

/// Errors from the bridge's live channel.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Configuration handle for one sensor bridge.
#[derive(Clone)]
pub struct BridgeClient {
    client: reqwest::Client,
    base_url: String,
}

impl BridgeClient {
    /// Create a client targeting `base_url` (e.g. `http://rig-pi:4000`).
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BACKFILL_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// HTTP base URL of the bridge.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket endpoint derived from the HTTP base URL.
    pub fn ws_url(&self) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base_url)
        };
        format!("{base}/ws")
    }

    /// Fetch recent history from the bridge.
    ///
    /// # Arguments
    ///
    /// * `range` - named lookback understood by the bridge, e.g. "24h"
    /// * `max` - row cap applied bridge-side
    pub async fn fetch_history(&self, range: &str, max: u32) -> anyhow::Result<Vec<Reading>> {
        let url = format!("{}/history?range={}&max={}", self.base_url, range, max);

        let response = self.client.get(&url).send().await?;
        let data = response.error_for_status()?.json::<Vec<Reading>>().await?;
        Ok(data)
    }

    /// Open the live WebSocket channel.
    pub async fn connect(&self) -> Result<BridgeSocket, BridgeError> {
        let url = self.ws_url();

        let (socket, _response) = connect_async(&url).await.map_err(|e| {
            BridgeError::Connection(format!("Failed to connect to bridge at {url}: {e}"))
        })?;

        tracing::info!(url = %url, "Connected to sensor bridge");

        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(
            BridgeClient::new("http://rig-pi:4000").ws_url(),
            "ws://rig-pi:4000/ws"
        );
        assert_eq!(
            BridgeClient::new("https://bridge.example.com/").ws_url(),
            "wss://bridge.example.com/ws"
        );
        assert_eq!(BridgeClient::new("rig-pi:4000").ws_url(), "ws://rig-pi:4000/ws");
    }

    #[test]
    fn test_telemetry_frame_parses() {
        let frame: BridgeFrame = serde_json::from_str(
            r#"{"type":"telemetry","data":{"timestamp":"2025-06-01T12:00:00Z","pH":7.2,"temp_c":25.0,"do_mg_l":6.5,"fish_health":80.0,"quality_ai":null,"status_ai":null}}"#,
        )
        .unwrap();

        match frame {
            BridgeFrame::Telemetry { data } => {
                assert_eq!(data.ph, 7.2);
                assert_eq!(data.temp_c, Some(25.0));
            }
            other => panic!("expected telemetry frame, got {other:?}"),
        }
    }

    #[test]
    fn test_serial_status_frame_defaults_missing_boards() {
        let frame: BridgeFrame =
            serde_json::from_str(r#"{"type":"serial:status","main":true}"#).unwrap();
        assert!(frame.any_connected());

        let frame: BridgeFrame = serde_json::from_str(r#"{"type":"serial:status"}"#).unwrap();
        assert!(!frame.any_connected());
    }
}
