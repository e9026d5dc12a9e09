//! The wait decision in front of every outbound request.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace};

use super::global::GlobalLimitGuard;
use super::headers::{Outcome, RateLimitHeaders};
use super::registry::BucketRegistry;
use super::route::RouteKey;
use crate::error::{Result, WardenError};

/// Lockout applied when a global 429 arrives without a usable `Retry-After`.
pub const DEFAULT_GLOBAL_FALLBACK: Duration = Duration::from_secs(1);

/// Coordinates concurrent requests against server-reported quotas.
///
/// Callers `acquire` before sending and `observe` after every response.
/// Waiting is a timer-backed suspension of the calling task only; requests
/// against other buckets keep flowing unless a global lockout is active.
///
/// `remaining` is taken from the last response as-is and is never
/// decremented locally, so a burst of concurrent requests against a bucket
/// with quota left is let through and the server's 429s correct it.
#[derive(Debug)]
pub struct RateGate {
    registry: BucketRegistry,
    global: GlobalLimitGuard,
    /// Lockout used for a global 429 with no retry hint
    global_fallback: Duration,
}

impl RateGate {
    /// Create a new gate with default settings.
    pub fn new() -> Self {
        Self::with_global_fallback(DEFAULT_GLOBAL_FALLBACK)
    }

    /// Create a new gate with a custom fallback for hint-less global 429s.
    pub fn with_global_fallback(global_fallback: Duration) -> Self {
        Self {
            registry: BucketRegistry::new(),
            global: GlobalLimitGuard::new(),
            global_fallback,
        }
    }

    pub fn registry(&self) -> &BucketRegistry {
        &self.registry
    }

    pub fn global(&self) -> &GlobalLimitGuard {
        &self.global
    }

    /// Suspend until `route` may be sent.
    ///
    /// Dropping the returned future mid-wait is safe: shared state is only
    /// read here, never written.
    pub async fn acquire(&self, route: &RouteKey) {
        self.wait_global(route).await;
        self.wait_bucket(route).await;
    }

    /// Like [`acquire`](Self::acquire), but gives up once `deadline` elapses.
    pub async fn acquire_with_deadline(
        &self,
        route: &RouteKey,
        deadline: Option<Duration>,
    ) -> Result<()> {
        match deadline {
            None => {
                self.acquire(route).await;
                Ok(())
            }
            Some(deadline) => timeout(deadline, self.acquire(route)).await.map_err(|_| {
                debug!(route = %route, "Deadline elapsed while waiting for rate limit");
                WardenError::Timeout {
                    route: route.to_string(),
                }
            }),
        }
    }

    /// Wait out any global lockout. The lockout can be extended while we
    /// sleep, so keep checking until it is really over.
    pub async fn wait_global(&self, route: &RouteKey) -> Duration {
        let started = Instant::now();

        loop {
            let remaining = self.global.remaining();
            if remaining.is_zero() {
                break;
            }

            debug!(
                route = %route,
                wait_ms = remaining.as_millis() as u64,
                "Waiting for global rate limit to end"
            );
            sleep(remaining).await;
        }

        started.elapsed()
    }

    /// Wait for the route's bucket to refill if the last response said it
    /// was empty. Does not re-check afterwards; only the next response can
    /// refresh `remaining`.
    pub async fn wait_bucket(&self, route: &RouteKey) -> Duration {
        let Some(bucket_id) = self.registry.resolve_bucket(route) else {
            trace!(route = %route, "Route is unmetered");
            return Duration::ZERO;
        };
        let Some(record) = self.registry.get_bucket(&bucket_id) else {
            return Duration::ZERO;
        };

        if !record.is_exhausted() {
            trace!(
                route = %route,
                bucket = %bucket_id,
                remaining = record.remaining,
                "Bucket has quota left"
            );
            return Duration::ZERO;
        }

        let wait = record.wait_duration(Instant::now());
        if wait.is_zero() {
            return wait;
        }

        info!(
            route = %route,
            bucket = %bucket_id,
            wait_ms = wait.as_millis() as u64,
            "Waiting until rate limit for bucket is over"
        );
        sleep(wait).await;
        debug!(bucket = %bucket_id, "Bucket rate limit ended");

        wait
    }

    /// Feed a response back into the gate. Call this after every response,
    /// successful or not. Returns the bucket id the route now maps to, if the
    /// headers described one.
    pub fn observe(
        &self,
        route: &RouteKey,
        headers: &RateLimitHeaders,
        outcome: Outcome,
    ) -> Option<String> {
        let bucket = self.registry.record_headers(route, headers);

        if outcome == Outcome::RateLimited {
            if headers.is_global() {
                let retry_after = headers.retry_after.unwrap_or(self.global_fallback);
                self.global.trigger(retry_after);
            } else {
                debug!(
                    route = %route,
                    bucket = ?bucket,
                    scope = ?headers.scope,
                    retry_after_ms = headers.retry_after.map(|d| d.as_millis() as u64),
                    "Route rate limited"
                );
            }
        }

        bucket
    }

    /// Drop bucket records that reset more than `grace` ago.
    pub fn prune(&self, grace: Duration) -> usize {
        self.registry.prune(grace)
    }

    /// Periodically prune stale buckets until the gate is dropped.
    ///
    /// The task only holds a weak reference, so it never keeps the gate
    /// alive on its own.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration, grace: Duration) -> JoinHandle<()> {
        let gate = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(every));
            // The first tick completes immediately.
            ticks.next().await;

            while ticks.next().await.is_some() {
                let Some(gate) = gate.upgrade() else {
                    break;
                };
                gate.prune(grace);
            }

            trace!("Bucket pruner stopped");
        })
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}
