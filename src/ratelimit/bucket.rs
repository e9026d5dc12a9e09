//! Last known state of a server-assigned rate-limit bucket.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::headers::RateLimitHeaders;

/// Stand-in for a reset too far out to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// One server-assigned quota, as reported by the most recent response that
/// carried its bucket id.
///
/// Records are never patched in place: each observation builds a fresh
/// record that replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRecord {
    /// Server-assigned bucket id
    pub id: String,
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window, never above `limit`
    pub remaining: u32,
    /// Absolute reset time reported by the server
    pub reset: DateTime<Utc>,
    /// Time until reset, relative to `cached_at`
    pub reset_after: Duration,
    /// Local monotonic time the record was built
    pub cached_at: Instant,
}

impl BucketRecord {
    /// Build a record from parsed headers.
    ///
    /// Returns `None` unless the bucket id, limit, remaining and reset-after
    /// are all present. A missing absolute reset is derived from the wall
    /// clock and `reset_after`.
    pub fn from_headers(headers: &RateLimitHeaders, cached_at: Instant) -> Option<Self> {
        let id = headers.bucket.clone()?;
        let limit = headers.limit?;
        let remaining = headers.remaining?;
        let reset_after = headers.reset_after?;

        let reset = headers.reset.unwrap_or_else(|| {
            chrono::Duration::from_std(reset_after)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        });

        Some(Self {
            id,
            limit,
            remaining: remaining.min(limit),
            reset,
            reset_after,
            cached_at,
        })
    }

    /// Whether the last response said the bucket had no requests left.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// The instant the bucket is expected to refill.
    ///
    /// A reset-after past what an [`Instant`] can hold saturates to a
    /// far-future instant.
    pub fn resets_at(&self) -> Instant {
        self.cached_at
            .checked_add(self.reset_after)
            .unwrap_or_else(|| self.cached_at + FAR_FUTURE)
    }

    /// Time left until the bucket refills, as of `now`.
    pub fn wait_duration(&self, now: Instant) -> Duration {
        self.resets_at().saturating_duration_since(now)
    }
}
