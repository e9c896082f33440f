//! Threshold evaluation and notification dispatch.
//!
//! Users configure a [`ThresholdRule`] per metric; every new reading (or
//! threshold change) is evaluated into a set of [`ActiveAlert`]s. An
//! out-of-range value escalates from `warning` to `alert` only once it
//! clears a metric-specific margin beyond the bound, which keeps small
//! oscillations around a threshold from flapping the severity.
//!
//! Dispatch is cooldown-gated: one shared timer across the whole alert
//! set, advanced only when a notification actually fires. The sink is a
//! [`Notifier`] trait; the production sink just logs, since sound and
//! toast rendering live in the dashboard frontend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::model::{Metric, Reading};

/// Default shared notification cooldown.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(5000);

/// Escalation margin for pH and temperature: 10% beyond the bound.
const BAND_MARGIN: f64 = 0.1;

/// Escalation factor for dissolved oxygen and AI quality: below 80% of
/// the minimum. Dissolved oxygen has no upper-bound escalation, an
/// asymmetry preserved from the rig's observed behavior.
const LOW_FACTOR: f64 = 0.8;

/// Acceptable range for one metric. Never deleted, only overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub min: f64,
    pub max: f64,
    pub enabled: bool,
}

impl ThresholdRule {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max, enabled: true }
    }
}

/// The full user-configurable rule set, one rule per metric.
///
/// `min > max` is tolerated rather than validated away: such a rule
/// simply never resolves a value as in-range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(rename = "pH", default = "default_ph_rule")]
    pub ph: ThresholdRule,
    #[serde(default = "default_temp_rule")]
    pub temp_c: ThresholdRule,
    #[serde(default = "default_do_rule")]
    pub do_mg_l: ThresholdRule,
    #[serde(default = "default_quality_rule")]
    pub quality_ai: ThresholdRule,
}

fn default_ph_rule() -> ThresholdRule {
    ThresholdRule::new(6.5, 8.0)
}

fn default_temp_rule() -> ThresholdRule {
    ThresholdRule::new(20.0, 30.0)
}

fn default_do_rule() -> ThresholdRule {
    ThresholdRule::new(5.0, 12.0)
}

fn default_quality_rule() -> ThresholdRule {
    ThresholdRule::new(6.0, 10.0)
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            ph: default_ph_rule(),
            temp_c: default_temp_rule(),
            do_mg_l: default_do_rule(),
            quality_ai: default_quality_rule(),
        }
    }
}

/// Severity of an active alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Alert,
}

/// Snapshot of the violated rule's bounds at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdBounds {
    pub min: f64,
    pub max: f64,
}

/// A derived, transient record of a threshold violation.
///
/// Recomputed on every new reading or threshold change; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAlert {
    pub metric: Metric,
    pub value: f64,
    pub threshold: ThresholdBounds,
    pub severity: AlertSeverity,
    pub message: String,
}

/// Evaluate a reading against the rule set.
///
/// Only enabled rules whose metric is actually present in the reading
/// can fire. Output order is fixed: pH, temperature, DO, AI quality.
pub fn evaluate(reading: &Reading, thresholds: &AlertThresholds) -> Vec<ActiveAlert> {
    let mut alerts = Vec::new();

    if thresholds.ph.enabled {
        let ThresholdRule { min, max, .. } = thresholds.ph;
        let value = reading.ph;
        if value < min || value > max {
            alerts.push(ActiveAlert {
                metric: Metric::Ph,
                value,
                threshold: ThresholdBounds { min, max },
                severity: band_severity(value, min, max),
                message: format!(
                    "pH level {value:.2} is outside safe range ({})",
                    range_text(min, max)
                ),
            });
        }
    }

    if thresholds.temp_c.enabled {
        if let Some(value) = reading.temp_c {
            let ThresholdRule { min, max, .. } = thresholds.temp_c;
            if value < min || value > max {
                alerts.push(ActiveAlert {
                    metric: Metric::TempC,
                    value,
                    threshold: ThresholdBounds { min, max },
                    severity: band_severity(value, min, max),
                    message: format!(
                        "Temperature {value:.1}°C is outside safe range ({}°C)",
                        range_text(min, max)
                    ),
                });
            }
        }
    }

    if thresholds.do_mg_l.enabled {
        let ThresholdRule { min, max, .. } = thresholds.do_mg_l;
        let value = reading.do_mg_l;
        if value < min || value > max {
            alerts.push(ActiveAlert {
                metric: Metric::DoMgL,
                value,
                threshold: ThresholdBounds { min, max },
                severity: low_severity(value, min),
                message: format!(
                    "Dissolved oxygen {value:.2} mg/L is outside safe range ({} mg/L)",
                    range_text(min, max)
                ),
            });
        }
    }

    if thresholds.quality_ai.enabled {
        if let Some(value) = reading.quality_ai {
            let ThresholdRule { min, max, .. } = thresholds.quality_ai;
            if value < min || value > max {
                alerts.push(ActiveAlert {
                    metric: Metric::QualityAi,
                    value,
                    threshold: ThresholdBounds { min, max },
                    severity: low_severity(value, min),
                    message: format!(
                        "Quality score {value:.1}/10 is below acceptable range ({})",
                        range_text(min, max)
                    ),
                });
            }
        }
    }

    alerts
}

/// Escalation for banded metrics: alert once 10% beyond either bound.
fn band_severity(value: f64, min: f64, max: f64) -> AlertSeverity {
    if value < min * (1.0 - BAND_MARGIN) || value > max * (1.0 + BAND_MARGIN) {
        AlertSeverity::Alert
    } else {
        AlertSeverity::Warning
    }
}

/// Escalation with only a lower-bound margin.
fn low_severity(value: f64, min: f64) -> AlertSeverity {
    if value < min * LOW_FACTOR {
        AlertSeverity::Alert
    } else {
        AlertSeverity::Warning
    }
}

/// Format bounds the way the dashboard shows them: always with a
/// decimal, e.g. "6.5-8.0".
fn range_text(min: f64, max: f64) -> String {
    format!("{min:?}-{max:?}")
}

/// Which tone an actually-fired notification carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Warning,
    Alert,
}

/// Sink for fired notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, tone: Tone, alerts: &[ActiveAlert]);
}

/// Production sink: structured log lines. The dashboard frontend owns
/// the actual sound and toast rendering.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, tone: Tone, alerts: &[ActiveAlert]) {
        info!(?tone, count = alerts.len(), "Alert notification");
    }
}

#[derive(Default)]
struct DispatchState {
    prev_alert_metrics: HashSet<Metric>,
    prev_count: usize,
    last_fired_ms: Option<u64>,
}

/// Evaluates readings and drives cooldown-gated notification dispatch.
///
/// Owned by the application state; constructed once per session with its
/// notifier injected.
pub struct AlertEngine {
    thresholds: RwLock<AlertThresholds>,
    cooldown: Duration,
    notifier: Arc<dyn Notifier>,
    state: Mutex<DispatchState>,
}

impl AlertEngine {
    pub fn new(
        thresholds: AlertThresholds,
        cooldown: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            cooldown,
            notifier,
            state: Mutex::new(DispatchState::default()),
        }
    }

    pub async fn thresholds(&self) -> AlertThresholds {
        self.thresholds.read().await.clone()
    }

    pub async fn set_thresholds(&self, thresholds: AlertThresholds) {
        *self.thresholds.write().await = thresholds;
    }

    /// Evaluate a reading, dispatch at most one notification, and return
    /// the active alert set.
    pub async fn process(&self, reading: &Reading) -> Vec<ActiveAlert> {
        self.process_at(reading, now_ms()).await
    }

    /// Like [`process`](Self::process) with an explicit clock reading.
    ///
    /// Fires the alert tone when alert-severity entries appear that the
    /// previous evaluation did not have; fires the warning tone when the
    /// alert count grew without new alert-severity entries. At most one
    /// tone per evaluation, and only when the shared cooldown has
    /// elapsed. The cooldown timestamp moves only on an actual fire.
    pub async fn process_at(&self, reading: &Reading, now_ms: u64) -> Vec<ActiveAlert> {
        let thresholds = self.thresholds.read().await.clone();
        let alerts = evaluate(reading, &thresholds);

        let mut state = self.state.lock().await;

        let alert_metrics: HashSet<Metric> = alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Alert)
            .map(|a| a.metric)
            .collect();
        let has_new_alerts = alert_metrics
            .difference(&state.prev_alert_metrics)
            .next()
            .is_some();
        let cooldown_elapsed = state
            .last_fired_ms
            .is_none_or(|t| now_ms.saturating_sub(t) >= self.cooldown.as_millis() as u64);

        if has_new_alerts && cooldown_elapsed {
            self.notifier.notify(Tone::Alert, &alerts);
            state.last_fired_ms = Some(now_ms);
        } else if !has_new_alerts && alerts.len() > state.prev_count && cooldown_elapsed {
            self.notifier.notify(Tone::Warning, &alerts);
            state.last_fired_ms = Some(now_ms);
        }

        state.prev_alert_metrics = alert_metrics;
        state.prev_count = alerts.len();

        alerts
    }
}

/// Spawn the evaluation loop: every change to `latest` is processed by
/// the engine, so alerts always reflect the most recently appended
/// reading (stale evaluations are never applied; the watch channel
/// collapses superseded values).
pub fn spawn_evaluation_loop(
    mut latest: tokio::sync::watch::Receiver<Option<Reading>>,
    engine: Arc<AlertEngine>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = latest.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let reading = latest.borrow_and_update().clone();
                    if let Some(reading) = reading {
                        engine.process(&reading).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn reading(ph: f64, temp_c: Option<f64>, do_mg_l: f64, quality_ai: Option<f64>) -> Reading {
        Reading {
            timestamp: Utc::now(),
            ph,
            temp_c,
            do_mg_l,
            fish_health: None,
            quality_ai,
            status_ai: None,
        }
    }

    fn in_range_reading() -> Reading {
        reading(7.2, Some(25.0), 6.5, None)
    }

    #[derive(Default)]
    struct CapturingNotifier {
        fired: StdMutex<Vec<Tone>>,
    }

    impl Notifier for CapturingNotifier {
        fn notify(&self, tone: Tone, _alerts: &[ActiveAlert]) {
            self.fired.lock().unwrap().push(tone);
        }
    }

    #[test]
    fn test_in_range_reading_has_no_alerts() {
        let alerts = evaluate(&in_range_reading(), &AlertThresholds::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_ph_far_below_min_is_alert() {
        // 5.0 < 6.5 * 0.9 = 5.85
        let alerts = evaluate(&reading(5.0, Some(25.0), 6.5, None), &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::Ph);
        assert_eq!(alerts[0].severity, AlertSeverity::Alert);
    }

    #[test]
    fn test_ph_just_below_min_is_warning() {
        // 6.2 is below min but above the 5.85 escalation margin
        let alerts = evaluate(&reading(6.2, Some(25.0), 6.5, None), &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_ph_far_above_max_alert_and_message() {
        // 9.5 > 8.0 * 1.1 = 8.8
        let alerts = evaluate(&reading(9.5, Some(25.0), 6.5, None), &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::Alert);
        assert!(alerts[0].message.contains("9.50"));
        assert!(alerts[0].message.contains("6.5-8.0"));
    }

    #[test]
    fn test_dissolved_oxygen_upper_bound_never_escalates() {
        // Far above max, but DO only has a lower-bound margin
        let alerts = evaluate(&reading(7.2, Some(25.0), 14.5, None), &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::DoMgL);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_dissolved_oxygen_low_escalation() {
        // 3.9 < 5.0 * 0.8 = 4.0
        let alerts = evaluate(&reading(7.2, Some(25.0), 3.9, None), &AlertThresholds::default());
        assert_eq!(alerts[0].severity, AlertSeverity::Alert);
    }

    #[test]
    fn test_quality_score_low_escalation() {
        // 4.0 < 6.0 * 0.8 = 4.8
        let alerts = evaluate(&reading(7.2, Some(25.0), 6.5, Some(4.0)), &AlertThresholds::default());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::QualityAi);
        assert_eq!(alerts[0].severity, AlertSeverity::Alert);
    }

    #[test]
    fn test_disabled_rule_never_fires() {
        let thresholds = AlertThresholds {
            ph: ThresholdRule { min: 6.5, max: 8.0, enabled: false },
            ..AlertThresholds::default()
        };
        let alerts = evaluate(&reading(4.0, Some(25.0), 6.5, None), &thresholds);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_missing_metric_never_fires() {
        // Temperature rule enabled but the reading has no temperature
        let alerts = evaluate(&reading(7.2, None, 6.5, None), &AlertThresholds::default());
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_inverted_bounds_are_tolerated() {
        // min > max never resolves in-range; accepted misconfiguration
        let thresholds = AlertThresholds {
            ph: ThresholdRule { min: 8.0, max: 6.5, enabled: true },
            ..AlertThresholds::default()
        };
        let alerts = evaluate(&reading(7.2, Some(25.0), 6.5, None), &thresholds);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::Ph);
    }

    #[tokio::test]
    async fn test_new_alert_fires_alert_tone() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 1_000).await;

        assert_eq!(*notifier.fired.lock().unwrap(), vec![Tone::Alert]);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_refire() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        // Two evaluations 2000ms apart, both with alert-severity entries
        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 1_000).await;
        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 3_000).await;

        assert_eq!(notifier.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persisting_alert_does_not_refire_after_cooldown() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 1_000).await;
        // Well past the cooldown, but the same alert is not "new"
        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 60_000).await;

        assert_eq!(notifier.fired.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_growing_warning_count_fires_warning_tone() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        // One warning-severity entry
        engine.process_at(&reading(6.2, Some(25.0), 6.5, None), 1_000).await;
        // A second warning joins after the cooldown
        engine.process_at(&reading(6.2, Some(19.5), 6.5, None), 10_000).await;

        assert_eq!(*notifier.fired.lock().unwrap(), vec![Tone::Warning, Tone::Warning]);
    }

    #[tokio::test]
    async fn test_alert_tone_takes_priority_over_warning() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        // A new alert and a new warning in the same evaluation: one
        // notification, alert tone
        engine.process_at(&reading(5.0, Some(19.5), 6.5, None), 1_000).await;

        assert_eq!(*notifier.fired.lock().unwrap(), vec![Tone::Alert]);
    }

    #[tokio::test]
    async fn test_recovered_then_violated_again_refires() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 1_000).await;
        // Recovery clears the previous alert set
        engine.process_at(&in_range_reading(), 10_000).await;
        // The violation is new again
        engine.process_at(&reading(5.0, Some(25.0), 6.5, None), 20_000).await;

        assert_eq!(*notifier.fired.lock().unwrap(), vec![Tone::Alert, Tone::Alert]);
    }

    #[tokio::test]
    async fn test_threshold_update_applies_to_next_evaluation() {
        let notifier = Arc::new(CapturingNotifier::default());
        let engine =
            AlertEngine::new(AlertThresholds::default(), DEFAULT_COOLDOWN, notifier.clone());

        assert!(engine.process_at(&in_range_reading(), 1_000).await.is_empty());

        let mut tightened = AlertThresholds::default();
        tightened.ph = ThresholdRule::new(7.5, 8.0);
        engine.set_thresholds(tightened).await;

        let alerts = engine.process_at(&in_range_reading(), 2_000).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, Metric::Ph);
    }
}
