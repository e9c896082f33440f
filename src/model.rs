//! Data models for Aquamon.
//!
//! The central type is [`Reading`], one timestamped telemetry sample from
//! the rig (pH, temperature, dissolved oxygen, plus optional derived
//! scores). Everything else in the crate either produces readings (the
//! stream manager), classifies them ([`Severity`]), or moves them across
//! an API boundary (the submission/query types below).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single telemetry sample.
///
/// Immutable once appended to the in-memory history. Temperature and the
/// derived scores are optional because the rig's sensor boards report
/// independently: the main board carries pH and dissolved oxygen, the
/// secondary board carries temperature, and the AI enrichment may be
/// absent entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// When the sample was taken (UTC).
    pub timestamp: DateTime<Utc>,

    /// pH of the tank water.
    #[serde(rename = "pH")]
    pub ph: f64,

    /// Water temperature in degrees Celsius, if the secondary board reported.
    pub temp_c: Option<f64>,

    /// Dissolved oxygen in mg/L.
    pub do_mg_l: f64,

    /// Fish health score on a 0-100 scale. Treated as 80 when absent.
    pub fish_health: Option<f64>,

    /// Water quality score (1-10) predicted by the AI service.
    pub quality_ai: Option<f64>,

    /// Status classification produced by the AI service, if any.
    pub status_ai: Option<Severity>,
}

/// The metrics a threshold rule or classifier can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "pH")]
    Ph,
    #[serde(rename = "temp_c")]
    TempC,
    #[serde(rename = "do_mg_l")]
    DoMgL,
    #[serde(rename = "quality_ai")]
    QualityAi,
}

impl Metric {
    /// Human-readable label used in alert messages.
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Ph => "pH",
            Metric::TempC => "Temperature",
            Metric::DoMgL => "Dissolved oxygen",
            Metric::QualityAi => "Quality score",
        }
    }
}

/// Three-level severity classification for a metric or a whole reading.
///
/// The derived `Ord` gives `Good < Average < Alert`, which is what
/// "worst wins" aggregation relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Within the good band.
    Good,
    /// Drifting out of the good band but not yet dangerous.
    Average,
    /// Outside the safe range.
    Alert,
}

impl Severity {
    /// Classify a single metric value.
    ///
    /// # Bands
    ///
    /// - pH: alert below 6.0 or above 8.5, average below 6.5 or above 8.0
    /// - temperature: alert below 18 or above 32 °C, average below 20 or above 30 °C
    /// - dissolved oxygen: alert below 3.5 mg/L, average below 5.0 mg/L, no upper bound
    ///
    /// `QualityAi` has no classifier bands; it is only checked by the
    /// user-configurable alert thresholds and always classifies `Good` here.
    pub fn for_metric(metric: Metric, value: f64) -> Self {
        match metric {
            Metric::Ph => {
                if value < 6.0 || value > 8.5 {
                    Severity::Alert
                } else if value < 6.5 || value > 8.0 {
                    Severity::Average
                } else {
                    Severity::Good
                }
            }
            Metric::TempC => {
                if value < 18.0 || value > 32.0 {
                    Severity::Alert
                } else if value < 20.0 || value > 30.0 {
                    Severity::Average
                } else {
                    Severity::Good
                }
            }
            Metric::DoMgL => {
                if value < 3.5 {
                    Severity::Alert
                } else if value < 5.0 {
                    Severity::Average
                } else {
                    Severity::Good
                }
            }
            Metric::QualityAi => Severity::Good,
        }
    }

    /// Classify a whole reading: the worst of its per-metric severities.
    ///
    /// A missing temperature contributes `Good`; only metrics that were
    /// actually reported can push the classification up.
    pub fn for_reading(reading: &Reading) -> Self {
        let mut worst = Severity::for_metric(Metric::Ph, reading.ph);
        if let Some(temp) = reading.temp_c {
            worst = worst.max(Severity::for_metric(Metric::TempC, temp));
        }
        worst.max(Severity::for_metric(Metric::DoMgL, reading.do_mg_l))
    }
}

/// One record in a `POST /telemetry` request body.
///
/// Every field is optional at the wire level; [`normalize`](Self::normalize)
/// decides which records survive. Missing pH/DO default to 0 so a
/// single-board rig can still report.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingSubmission {
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "pH")]
    pub ph: Option<f64>,
    pub temp_c: Option<f64>,
    pub do_mg_l: Option<f64>,
    pub fish_health: Option<f64>,
    pub quality_ai: Option<f64>,
    pub status_ai: Option<Severity>,
    /// Optional user association for multi-user rigs.
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
}

impl ReadingSubmission {
    /// Validate and convert into a storable reading.
    ///
    /// A record is valid when it has a timestamp and at least one of
    /// pH / dissolved oxygen. Returns `None` otherwise.
    pub fn normalize(self) -> Option<StoredReading> {
        let timestamp = self.timestamp?;
        if self.ph.is_none() && self.do_mg_l.is_none() {
            return None;
        }
        Some(StoredReading {
            reading: Reading {
                timestamp,
                ph: self.ph.unwrap_or(0.0),
                temp_c: self.temp_c,
                do_mg_l: self.do_mg_l.unwrap_or(0.0),
                fish_health: self.fish_health,
                quality_ai: self.quality_ai,
                status_ai: self.status_ai,
            },
            user_id: self.user_id,
        })
    }
}

/// A reading paired with its optional user association, as persisted.
#[derive(Debug, Clone)]
pub struct StoredReading {
    pub reading: Reading,
    pub user_id: Option<String>,
}

/// Request body for `POST /telemetry`: a single record or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SaveBody {
    One(ReadingSubmission),
    Many(Vec<ReadingSubmission>),
}

impl SaveBody {
    pub fn into_records(self) -> Vec<ReadingSubmission> {
        match self {
            SaveBody::One(record) => vec![record],
            SaveBody::Many(records) => records,
        }
    }
}

/// Response for `POST /telemetry`.
#[derive(Debug, Serialize)]
pub struct SaveResponse {
    pub success: bool,
    /// Records actually persisted.
    pub saved: u64,
    /// Records in the request, valid or not.
    pub total: usize,
}

/// Query parameters for `GET /telemetry`.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Explicit range start; overrides `range` when present.
    pub from: Option<DateTime<Utc>>,
    /// Explicit range end; defaults to now.
    pub to: Option<DateTime<Utc>>,
    /// Named lookback: "24h" (default), "1w" or "1m".
    pub range: Option<String>,
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    /// Row cap, clamped to 10 000.
    pub max: Option<u32>,
}

/// Hard cap on history query size.
pub const HISTORY_QUERY_MAX: u32 = 10_000;

/// Default history query size when `max` is absent.
pub const HISTORY_QUERY_DEFAULT: u32 = 1_000;

impl HistoryQuery {
    /// Resolve the query into a concrete `(from, to, max)` triple.
    pub fn resolve(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>, u32) {
        let from = self.from.unwrap_or_else(|| {
            let lookback = match self.range.as_deref() {
                Some("1w") => chrono::Duration::days(7),
                Some("1m") => chrono::Duration::days(30),
                _ => chrono::Duration::hours(24),
            };
            now - lookback
        });
        let to = self.to.unwrap_or(now);
        let max = self.max.unwrap_or(HISTORY_QUERY_DEFAULT).min(HISTORY_QUERY_MAX);
        (from, to, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(ph: f64, temp_c: Option<f64>, do_mg_l: f64) -> Reading {
        Reading {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            ph,
            temp_c,
            do_mg_l,
            fish_health: None,
            quality_ai: None,
            status_ai: None,
        }
    }

    #[test]
    fn test_ph_severity_bands() {
        assert_eq!(Severity::for_metric(Metric::Ph, 5.9), Severity::Alert);
        assert_eq!(Severity::for_metric(Metric::Ph, 8.6), Severity::Alert);
        assert_eq!(Severity::for_metric(Metric::Ph, 6.2), Severity::Average);
        assert_eq!(Severity::for_metric(Metric::Ph, 8.3), Severity::Average);
        assert_eq!(Severity::for_metric(Metric::Ph, 7.0), Severity::Good);
        // Band edges are inclusive on the good side
        assert_eq!(Severity::for_metric(Metric::Ph, 6.5), Severity::Good);
        assert_eq!(Severity::for_metric(Metric::Ph, 8.0), Severity::Good);
    }

    #[test]
    fn test_temperature_severity_bands() {
        assert_eq!(Severity::for_metric(Metric::TempC, 17.0), Severity::Alert);
        assert_eq!(Severity::for_metric(Metric::TempC, 33.0), Severity::Alert);
        assert_eq!(Severity::for_metric(Metric::TempC, 19.0), Severity::Average);
        assert_eq!(Severity::for_metric(Metric::TempC, 31.0), Severity::Average);
        assert_eq!(Severity::for_metric(Metric::TempC, 25.0), Severity::Good);
    }

    #[test]
    fn test_dissolved_oxygen_has_no_upper_bound() {
        assert_eq!(Severity::for_metric(Metric::DoMgL, 3.0), Severity::Alert);
        assert_eq!(Severity::for_metric(Metric::DoMgL, 4.0), Severity::Average);
        assert_eq!(Severity::for_metric(Metric::DoMgL, 6.0), Severity::Good);
        assert_eq!(Severity::for_metric(Metric::DoMgL, 25.0), Severity::Good);
    }

    #[test]
    fn test_reading_severity_worst_wins() {
        // All good
        assert_eq!(
            Severity::for_reading(&reading(7.2, Some(25.0), 6.5)),
            Severity::Good
        );
        // One average metric dominates two good ones
        assert_eq!(
            Severity::for_reading(&reading(7.2, Some(19.0), 6.5)),
            Severity::Average
        );
        // One alert metric dominates everything
        assert_eq!(
            Severity::for_reading(&reading(5.5, Some(25.0), 6.5)),
            Severity::Alert
        );
        // Alert beats average
        assert_eq!(
            Severity::for_reading(&reading(6.2, Some(17.0), 6.5)),
            Severity::Alert
        );
    }

    #[test]
    fn test_reading_severity_missing_temperature() {
        // Absent temperature cannot raise the classification
        assert_eq!(
            Severity::for_reading(&reading(7.2, None, 6.5)),
            Severity::Good
        );
    }

    #[test]
    fn test_submission_requires_timestamp() {
        let submission = ReadingSubmission {
            timestamp: None,
            ph: Some(7.0),
            temp_c: None,
            do_mg_l: Some(6.0),
            fish_health: None,
            quality_ai: None,
            status_ai: None,
            user_id: None,
        };
        assert!(submission.normalize().is_none());
    }

    #[test]
    fn test_submission_requires_ph_or_do() {
        let submission = ReadingSubmission {
            timestamp: Some(Utc::now()),
            ph: None,
            temp_c: Some(24.0),
            do_mg_l: None,
            fish_health: None,
            quality_ai: None,
            status_ai: None,
            user_id: None,
        };
        assert!(submission.normalize().is_none());
    }

    #[test]
    fn test_submission_defaults_missing_numerics_to_zero() {
        let submission = ReadingSubmission {
            timestamp: Some(Utc::now()),
            ph: Some(7.1),
            temp_c: None,
            do_mg_l: None,
            fish_health: None,
            quality_ai: None,
            status_ai: None,
            user_id: Some("user-1".to_string()),
        };
        let stored = submission.normalize().unwrap();
        assert_eq!(stored.reading.do_mg_l, 0.0);
        assert_eq!(stored.reading.temp_c, None);
        assert_eq!(stored.user_id.as_deref(), Some("user-1"));
    }

    #[test]
    fn test_save_body_accepts_single_or_array() {
        let single: SaveBody =
            serde_json::from_str(r#"{"timestamp":"2025-06-01T12:00:00Z","pH":7.0}"#).unwrap();
        assert_eq!(single.into_records().len(), 1);

        let many: SaveBody = serde_json::from_str(
            r#"[{"timestamp":"2025-06-01T12:00:00Z","pH":7.0},{"timestamp":"2025-06-01T12:01:00Z","do_mg_l":6.0}]"#,
        )
        .unwrap();
        assert_eq!(many.into_records().len(), 2);
    }

    #[test]
    fn test_history_query_resolution() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let query = HistoryQuery {
            from: None,
            to: None,
            range: Some("1w".to_string()),
            user_id: None,
            max: Some(50_000),
        };
        let (from, to, max) = query.resolve(now);
        assert_eq!(from, now - chrono::Duration::days(7));
        assert_eq!(to, now);
        assert_eq!(max, HISTORY_QUERY_MAX);
    }
}
