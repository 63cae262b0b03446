//! Creation/modification timestamps.
//!
//! Timestamps are fractional seconds since the Unix epoch with microsecond
//! resolution, stored as `f64` so they compare and sort natively in SQL.

use chrono::Utc;

/// Smallest step between two timestamps.
pub const RESOLUTION: f64 = 0.000_001;

/// Current time as fractional seconds.
#[must_use]
pub fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Current time, bumped forward if needed so the result is strictly greater
/// than `previous`.
#[must_use]
pub fn after(previous: Option<f64>) -> f64 {
    let now = now();
    match previous {
        Some(prev) if now <= prev => prev + RESOLUTION,
        _ => now,
    }
}
