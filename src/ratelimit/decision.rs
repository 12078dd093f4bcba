//! Quota decisions derived from a hit history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Quota telemetry for one key at one instant.
///
/// Computed fresh from the stored history on every check and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    /// Configured maximum hits per window
    pub limit: u64,
    /// Hits inside the window, including the one just recorded
    pub current_count: u64,
    /// Hits still available in the window, never negative
    pub remaining: u64,
    /// When the oldest surviving hit leaves the window (epoch milliseconds)
    pub reset_at_ms: u64,
}

impl QuotaDecision {
    /// Build a decision from an already pruned history.
    ///
    /// An empty history resets one window after `now`.
    pub fn from_history(history: &[u64], limit: u64, window_ms: u64, now: u64) -> Self {
        let current_count = history.len() as u64;
        let oldest = history.first().copied().unwrap_or(now);

        Self {
            limit,
            current_count,
            remaining: limit.saturating_sub(current_count),
            reset_at_ms: oldest.saturating_add(window_ms),
        }
    }

    /// The limit-th hit in a window is still admitted; the next one is not.
    pub fn is_admitted(&self) -> bool {
        self.current_count <= self.limit
    }

    /// Reset instant as a UTC timestamp.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.reset_at_ms)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    /// Time left until the window shrinks, as seen at `now`.
    pub fn reset_after(&self, now: u64) -> Duration {
        Duration::from_millis(self.reset_at_ms.saturating_sub(now))
    }
}
