//! Versioned alert/notification preferences.
//!
//! Preferences travel as an opaque JSON blob through the persistence
//! boundary and are loaded once at session start. The blob is never
//! trusted blindly: missing keys merge with explicit defaults, and an
//! unparseable blob falls back to the full default set with a warning;
//! a bad preference write must never take the pipeline down.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::alerts::AlertThresholds;

/// Storage key the preference blob lives under.
pub const PREFERENCES_KEY: &str = "alert_config";

/// Current schema version of the blob.
pub const CONFIG_VERSION: u32 = 1;

/// Notification behavior preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPrefs {
    /// Whether fired notifications should carry a sound.
    #[serde(default = "default_sound_enabled")]
    pub sound_enabled: bool,

    /// Shared cooldown between notifications, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_sound_enabled() -> bool {
    true
}

fn default_cooldown_ms() -> u64 {
    5000
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            sound_enabled: default_sound_enabled(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// The versioned preference set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub thresholds: AlertThresholds,

    #[serde(default)]
    pub notifications: NotificationPrefs,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            thresholds: AlertThresholds::default(),
            notifications: NotificationPrefs::default(),
        }
    }
}

impl AlertConfig {
    /// Parse a persisted blob, merging defaults under missing keys.
    ///
    /// A blob that does not parse at all yields the defaults.
    pub fn from_blob(blob: &str) -> Self {
        match serde_json::from_str(blob) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Malformed alert config blob, using defaults");
                Self::default()
            }
        }
    }

    /// Serialize for the persistence boundary.
    pub fn to_blob(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
