//! Overall water quality scoring.
//!
//! Combines the raw metrics of a [`Reading`] into one normalized score on
//! a 1-10 scale. Each metric contributes a linear proximity score in
//! `[0, 1]` measuring how close the value sits to its target band, and the
//! contributions are blended with fixed weights.
//!
//! The weights sum to 1.0 by construction and are never renormalized, so
//! the affine map at the end (`weighted * 9 + 1`) sends a perfect 1.0 to
//! exactly 10 and a worst-case 0.0 to exactly 1.

use crate::model::Reading;

/// Target pH band considered good.
pub const PH_GOOD: (f64, f64) = (6.5, 8.0);

/// Target temperature band considered good (°C).
pub const TEMP_GOOD: (f64, f64) = (22.0, 28.0);

/// Ideal dissolved oxygen level (mg/L). DO has no upper good bound in the
/// classifier, so scoring measures proximity to this single ideal point.
pub const DO_IDEAL: f64 = 6.0;

/// Decay slope per metric: distance from the band center at which the
/// proximity score reaches zero.
const PH_GAP: f64 = 1.5;
const TEMP_GAP: f64 = 6.0;
const DO_GAP: f64 = 3.0;

/// Fish health assumed when the reading carries none.
const DEFAULT_FISH_HEALTH: f64 = 80.0;

/// Blend weights. pH + temperature + DO + fish health = 1.0.
const WEIGHT_PH: f64 = 0.28;
const WEIGHT_TEMP: f64 = 0.24;
const WEIGHT_DO: f64 = 0.30;
const WEIGHT_FISH: f64 = 0.18;

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Proximity score for a banded metric: 1.0 anywhere inside the good
/// band, then linear decay with distance from the band center.
fn band_score(value: f64, band: (f64, f64), gap: f64) -> f64 {
    let (low, high) = band;
    if value >= low && value <= high {
        return 1.0;
    }
    let center = (low + high) / 2.0;
    (1.0 - (value - center).abs() / gap).max(0.0)
}

/// Proximity score for dissolved oxygen: linear decay around the single
/// ideal point, no plateau.
fn do_score(value: f64) -> f64 {
    (1.0 - (value - DO_IDEAL).abs() / DO_GAP).max(0.0)
}

/// Compute the overall quality score for a reading, in `[1, 10]` with one
/// decimal place.
///
/// A reading without a temperature is not penalized for it; the missing
/// metric contributes a full proximity score.
pub fn overall_score(reading: &Reading) -> f64 {
    let ph = band_score(reading.ph, PH_GOOD, PH_GAP);
    let temp = reading
        .temp_c
        .map(|t| band_score(t, TEMP_GOOD, TEMP_GAP))
        .unwrap_or(1.0);
    let oxygen = do_score(reading.do_mg_l);
    let fish = clamp(reading.fish_health.unwrap_or(DEFAULT_FISH_HEALTH) / 100.0, 0.0, 1.0);

    let weighted = ph * WEIGHT_PH + temp * WEIGHT_TEMP + oxygen * WEIGHT_DO + fish * WEIGHT_FISH;

    clamp(((weighted * 9.0 + 1.0) * 10.0).round() / 10.0, 1.0, 10.0)
}
