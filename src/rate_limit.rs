//! Sliding-window rate limiting for the telemetry write boundary.
//!
//! Several window/limit rules are enforced concurrently per caller; a
//! request is admitted only when every rule has headroom. The check runs
//! strictly before any counter moves, so a rejected request never leaks a
//! partial increment into the windows.
//!
//! The window store is in-memory and intentionally non-durable: this is
//! an abuse-mitigation control, not a security boundary. Caller identity
//! comes from forwarded-address headers and is spoofable; unidentified
//! callers all share one `"default"` bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

/// One admission rule: at most `max_requests` per `window_ms`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRule {
    pub key: &'static str,
    pub max_requests: u32,
    pub window_ms: u64,
}

/// The concurrently-enforced defaults for the write boundary.
pub const DEFAULT_RULES: [RateLimitRule; 3] = [
    RateLimitRule { key: "1min", max_requests: 15, window_ms: 60 * 1000 },
    RateLimitRule { key: "10sec", max_requests: 3, window_ms: 10 * 1000 },
    RateLimitRule { key: "30min", max_requests: 5, window_ms: 30 * 60 * 1000 },
];

/// How often the background sweep purges expired windows.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A counted admission quota for one (caller, rule) pair.
#[derive(Debug)]
struct Window {
    count: u32,
    reset_at_ms: u64,
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the first over-limit rule's window resets. Only set
    /// on denial.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self { allowed: true, retry_after_secs: None }
    }

    fn denied(retry_after_secs: u64) -> Self {
        Self { allowed: false, retry_after_secs: Some(retry_after_secs) }
    }
}

/// Multi-rule sliding-window limiter.
///
/// Owned by the application state and shared by reference; there is no
/// process-global store. Per-caller updates run under that caller's map
/// entry guard, which gives the check-then-increment sequence the single
/// mutual-exclusion scope it needs. Callers are independent keys, so no
/// cross-caller locking happens.
pub struct RateLimiter {
    rules: Vec<RateLimitRule>,
    store: DashMap<String, HashMap<&'static str, Window>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create a limiter with the default rule set.
    pub fn new() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }

    /// Create a limiter with custom rules (used by tests and by callers
    /// that need a different policy).
    pub fn with_rules(rules: Vec<RateLimitRule>) -> Self {
        Self { rules, store: DashMap::new() }
    }

    /// Check and count a request for `client_id` at the current time.
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, now_ms())
    }

    /// Check and count a request at an explicit clock reading.
    ///
    /// The order of operations matters:
    /// 1. drop this caller's expired windows,
    /// 2. lazily create a fresh window for every rule,
    /// 3. check every rule *before* incrementing anything: the first
    ///    over-limit rule produces the retry hint and nothing is counted,
    /// 4. only when all rules pass, increment every window.
    pub fn check_at(&self, client_id: &str, now_ms: u64) -> RateLimitDecision {
        let mut windows = self.store.entry(client_id.to_string()).or_default();

        windows.retain(|_, window| window.reset_at_ms > now_ms);

        for rule in &self.rules {
            windows
                .entry(rule.key)
                .or_insert_with(|| Window { count: 0, reset_at_ms: now_ms + rule.window_ms });
        }

        for rule in &self.rules {
            if let Some(window) = windows.get(rule.key) {
                if window.count >= rule.max_requests {
                    let retry_after = (window.reset_at_ms - now_ms).div_ceil(1000);
                    return RateLimitDecision::denied(retry_after);
                }
            }
        }

        for rule in &self.rules {
            if let Some(window) = windows.get_mut(rule.key) {
                window.count += 1;
            }
        }

        RateLimitDecision::allowed()
    }

    /// Purge expired windows and empty callers, independent of traffic.
    pub fn sweep(&self) {
        self.sweep_at(now_ms());
    }

    fn sweep_at(&self, now_ms: u64) {
        self.store.retain(|_, windows| {
            windows.retain(|_, window| window.reset_at_ms > now_ms);
            !windows.is_empty()
        });
    }

    /// Number of callers currently tracked. Exposed for the sweep task's
    /// logging and for tests.
    pub fn tracked_callers(&self) -> usize {
        self.store.len()
    }
}

/// Spawn the periodic sweep loop. It runs until `shutdown` flips to true.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    limiter.sweep();
                    debug!(callers = limiter.tracked_callers(), "Rate-limit windows swept");
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

/// Strategy for deriving a caller identity from a request.
///
/// Kept behind a trait so tests inject deterministic identities instead
/// of parsing forwarded-address headers.
pub trait ClientIdentity: Send + Sync {
    fn identify(&self, headers: &HeaderMap) -> String;
}

/// Production identity: first `x-forwarded-for` entry, then `x-real-ip`,
/// then a shared `"default"` bucket.
///
/// Spoofable by construction: acceptable for throttling, not for
/// authentication.
pub struct ForwardedClientIdentity;

impl ClientIdentity for ForwardedClientIdentity {
    fn identify(&self, headers: &HeaderMap) -> String {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            let first = forwarded.split(',').next().map(str::trim).unwrap_or("");
            return if first.is_empty() { "unknown".to_string() } else { first.to_string() };
        }
        if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            return real_ip.to_string();
        }
        "default".to_string()
    }
}

/// Fixed identity for tests.
pub struct FixedClientIdentity(pub String);

impl ClientIdentity for FixedClientIdentity {
    fn identify(&self, _headers: &HeaderMap) -> String {
        self.0.clone()
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_fourth_call_within_ten_seconds_is_denied() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;

        for i in 0..3 {
            assert!(limiter.check_at("caller-a", t0 + i * 100).allowed);
        }

        let denied = limiter.check_at("caller-a", t0 + 1000);
        assert!(!denied.allowed);
        let retry = denied.retry_after_secs.unwrap();
        assert!(retry > 0, "retry hint must be positive");
        // The 10sec window opened at t0 and resets 10s later
        assert!(retry <= 10);
    }

    #[test]
    fn test_callers_have_independent_windows() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;

        for i in 0..3 {
            assert!(limiter.check_at("caller-a", t0 + i * 100).allowed);
        }
        assert!(!limiter.check_at("caller-a", t0 + 500).allowed);

        // A different caller is unaffected
        assert!(limiter.check_at("caller-b", t0 + 500).allowed);
    }

    #[test]
    fn test_denied_call_does_not_increment() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;

        // Exhaust the 10sec rule (3 admits), then get denied twice
        for i in 0..3 {
            assert!(limiter.check_at("caller-a", t0 + i * 100).allowed);
        }
        assert!(!limiter.check_at("caller-a", t0 + 1000).allowed);
        assert!(!limiter.check_at("caller-a", t0 + 2000).allowed);

        // After the 10sec window expires the 30min rule still has 3 of 5
        // counted. If the two denials above had leaked increments the
        // next two calls could not both pass.
        assert!(limiter.check_at("caller-a", t0 + 11_000).allowed);
        assert!(limiter.check_at("caller-a", t0 + 11_100).allowed);

        // 30min rule is now exhausted at 5; the next call is denied with
        // a retry hint pointing at that window's reset.
        let denied = limiter.check_at("caller-a", t0 + 12_000);
        assert!(!denied.allowed);
        let retry = denied.retry_after_secs.unwrap();
        assert!(retry > 10, "expected the 30min window to be the blocker, got {retry}s");
    }

    #[test]
    fn test_expired_window_resets_count() {
        let limiter = RateLimiter::with_rules(vec![RateLimitRule {
            key: "10sec",
            max_requests: 3,
            window_ms: 10_000,
        }]);
        let t0 = 1_000_000;

        for i in 0..3 {
            assert!(limiter.check_at("caller-a", t0 + i).allowed);
        }
        assert!(!limiter.check_at("caller-a", t0 + 5_000).allowed);

        // A fresh window after expiry admits again
        assert!(limiter.check_at("caller-a", t0 + 10_001).allowed);
    }

    #[test]
    fn test_sweep_purges_expired_entries() {
        let limiter = RateLimiter::new();
        let t0 = 1_000_000;

        limiter.check_at("caller-a", t0);
        limiter.check_at("caller-b", t0);
        assert_eq!(limiter.tracked_callers(), 2);

        // Nothing expires inside the longest window
        limiter.sweep_at(t0 + 60_000);
        assert_eq!(limiter.tracked_callers(), 2);

        // Two hours later everything is gone
        limiter.sweep_at(t0 + 2 * 60 * 60 * 1000);
        assert_eq!(limiter.tracked_callers(), 0);
    }

    #[test]
    fn test_forwarded_identity_prefers_first_hop() {
        let identity = ForwardedClientIdentity;

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        assert_eq!(identity.identify(&headers), "10.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.3"));
        assert_eq!(identity.identify(&headers), "10.0.0.3");

        assert_eq!(identity.identify(&HeaderMap::new()), "default");
    }

    #[test]
    fn test_forwarded_identity_empty_list_falls_back_to_unknown() {
        let identity = ForwardedClientIdentity;
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(""));
        assert_eq!(identity.identify(&headers), "unknown");
    }
}
