//! Aquamon - real-time telemetry service for an aquaculture monitoring rig.
//!
//! # Overview
//!
//! Aquamon ingests a continuous stream of sensor readings (pH,
//! temperature, dissolved oxygen) from a sensor bridge, keeps a bounded
//! in-memory history, derives a normalized health score and per-metric
//! severity, and evaluates user-configurable alert thresholds with
//! hysteresis-based escalation and cooldown-gated notifications. When no
//! bridge is configured it falls back to a synthetic generator so the
//! dashboard always has data.
//!
//! The write-side API boundary that accepts externally-reported
//! telemetry is protected by a multi-window sliding-rate limiter.
//!
//! # API Endpoints
//!
//! - `POST /telemetry` - Persist readings (rate limited)
//! - `GET /telemetry` - Query stored history
//! - `GET /telemetry/latest` - The most recent reading
//! - `GET /telemetry/status` - Pipeline health overview
//! - `GET /alerts/active` - Threshold violations for the latest reading
//! - `GET /alerts/thresholds` / `PUT /alerts/thresholds` - Alert configuration
//! - `GET /health` - Health check
//!
//! # Modules
//!
//! - [`model`]: Reading, severity classification, API request/query types
//! - [`scoring`]: Overall water quality score
//! - [`rate_limit`]: Sliding-window rate limiter and client identity
//! - [`bridge`]: HTTP/WebSocket client for the sensor bridge
//! - [`stream`]: Stream ingestion manager (live, synthetic, backfill)
//! - [`alerts`]: Threshold evaluation and notification dispatch
//! - [`config`]: Versioned alert/notification preferences
//! - [`storage`]: SQLite storage layer
//! - [`api`]: HTTP API handlers

pub mod alerts;
pub mod api;
pub mod bridge;
pub mod config;
pub mod model;
pub mod rate_limit;
pub mod scoring;
pub mod storage;
pub mod stream;
