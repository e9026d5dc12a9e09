//! Application-wide lockout triggered by a global 429.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

/// A single shared deadline that, while in the future, holds back every
/// request regardless of its bucket.
///
/// The deadline is stored as microseconds past a fixed origin so it can be
/// read and raised with plain atomics. Offsets too large to store saturate. It only ever moves forward: a
/// trigger that would end sooner than the current lockout is absorbed.
#[derive(Debug)]
pub struct GlobalLimitGuard {
    origin: Instant,
    /// Lockout end as microseconds since `origin`; zero means never triggered
    until_micros: AtomicU64,
}

impl GlobalLimitGuard {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            until_micros: AtomicU64::new(0),
        }
    }

    /// Lock out all requests for `retry_after` from now.
    pub fn trigger(&self, retry_after: Duration) {
        let now = self.offset(Instant::now());
        let until = u64::try_from(retry_after.as_micros())
            .map_or(u64::MAX, |delta| now.saturating_add(delta));
        let previous = self.until_micros.fetch_max(until, Ordering::SeqCst);

        if until > previous {
            warn!(
                retry_after_ms = retry_after.as_millis() as u64,
                "Global rate limit hit, pausing all requests"
            );
        }
    }

    /// Whether the lockout is still in effect.
    pub fn is_active(&self) -> bool {
        self.offset(Instant::now()) < self.until_micros.load(Ordering::SeqCst)
    }

    /// Time left until the lockout ends, zero when inactive.
    pub fn remaining(&self) -> Duration {
        let now = self.offset(Instant::now());
        let until = self.until_micros.load(Ordering::SeqCst);
        Duration::from_micros(until.saturating_sub(now))
    }

    /// The instant the current (or last) lockout ends.
    pub fn until(&self) -> Option<Instant> {
        match self.until_micros.load(Ordering::SeqCst) {
            0 => None,
            micros => self.origin.checked_add(Duration::from_micros(micros)),
        }
    }

    fn offset(&self, instant: Instant) -> u64 {
        let elapsed = instant.saturating_duration_since(self.origin).as_micros();
        u64::try_from(elapsed).unwrap_or(u64::MAX)
    }
}

impl Default for GlobalLimitGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_inactive_by_default() {
        let guard = GlobalLimitGuard::new();
        assert!(!guard.is_active());
        assert_eq!(guard.remaining(), Duration::ZERO);
        assert!(guard.until().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_and_expire() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::from_secs(1));

        assert!(guard.is_active());
        assert_eq!(guard.remaining(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(guard.is_active());
        assert_eq!(guard.remaining(), Duration::from_millis(600));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!guard.is_active());
        assert_eq!(guard.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shorter_trigger_does_not_shorten_lockout() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::from_secs(5));
        guard.trigger(Duration::from_secs(1));

        assert_eq!(guard.remaining(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_trigger_extends_lockout() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(500)).await;
        guard.trigger(Duration::from_secs(2));

        assert_eq!(guard.remaining(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_retry_after_is_not_truncated() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::from_secs(100_000_000_000));

        assert!(guard.is_active());
        assert_eq!(guard.remaining(), Duration::from_secs(100_000_000_000));

        // A shorter trigger must not wrap past the stored deadline.
        guard.trigger(Duration::from_secs(1));
        assert_eq!(guard.remaining(), Duration::from_secs(100_000_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_retry_after_saturates() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::MAX);

        assert!(guard.is_active());
        assert_eq!(guard.remaining(), Duration::from_micros(u64::MAX));

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(guard.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_after_expiry() {
        let guard = GlobalLimitGuard::new();
        guard.trigger(Duration::from_millis(100));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!guard.is_active());

        guard.trigger(Duration::from_millis(300));
        assert!(guard.is_active());
        assert_eq!(guard.remaining(), Duration::from_millis(300));
    }
}
