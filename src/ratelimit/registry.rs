//! Concurrent store of observed rate-limit buckets.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::bucket::BucketRecord;
use super::headers::RateLimitHeaders;
use super::route::RouteKey;

/// Maps routes to server-assigned bucket ids, and bucket ids to their last
/// known state.
///
/// Both maps are sharded, so updates to unrelated buckets do not contend.
/// Replacing a record is a single insert and therefore atomic per bucket id.
/// Writes are last-arrival-wins: two responses for the same bucket that are
/// observed out of order leave the staler one in place. The server still
/// enforces the real limit, so this only costs an extra 429 at worst.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    /// Route -> bucket id
    routes: DashMap<RouteKey, String>,
    /// Bucket id -> last observed record
    buckets: DashMap<String, BucketRecord>,
}

impl BucketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the bucket id a route was last seen in.
    pub fn resolve_bucket(&self, route: &RouteKey) -> Option<String> {
        self.routes.get(route).map(|id| id.value().clone())
    }

    /// Get a snapshot of a bucket's last known state.
    pub fn get_bucket(&self, bucket_id: &str) -> Option<BucketRecord> {
        self.buckets.get(bucket_id).map(|r| r.value().clone())
    }

    /// Resolve a route and fetch its bucket in one call.
    pub fn bucket_for_route(&self, route: &RouteKey) -> Option<BucketRecord> {
        let id = self.resolve_bucket(route)?;
        self.get_bucket(&id)
    }

    /// Record the rate-limit headers of a response for `route`.
    ///
    /// When the headers describe a complete bucket, its record is replaced
    /// and the route is (re)mapped to it. Otherwise nothing changes and the
    /// route keeps whatever mapping it had.
    pub fn record_headers(&self, route: &RouteKey, headers: &RateLimitHeaders) -> Option<String> {
        let Some(record) = BucketRecord::from_headers(headers, Instant::now()) else {
            if headers.bucket.is_some() {
                debug!(
                    route = %route,
                    bucket = ?headers.bucket,
                    "Ignoring incomplete rate limit headers"
                );
            }
            return None;
        };

        let id = record.id.clone();
        trace!(
            route = %route,
            bucket = %id,
            limit = record.limit,
            remaining = record.remaining,
            reset_after_ms = record.reset_after.as_millis() as u64,
            "Recording bucket state"
        );

        // Insert the record before the mapping so a resolved id always has one.
        if self.buckets.insert(id.clone(), record).is_none() {
            info!(bucket = %id, route = %route, "Rate limit bucket detected");
        }
        self.routes.insert(route.clone(), id.clone());

        Some(id)
    }

    /// Drop buckets that reset more than `grace` ago, along with the routes
    /// pointing at them. Returns the number of buckets removed.
    pub fn prune(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();

        self.buckets.retain(|_, record| {
            record
                .resets_at()
                .checked_add(grace)
                .map_or(true, |expires| expires > now)
        });
        self.routes.retain(|_, id| self.buckets.contains_key(id.as_str()));

        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "Pruned stale buckets");
        }
        removed
    }

    /// Get the number of known buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Get the number of routes mapped to a bucket.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.routes.clear();
        self.buckets.clear();
    }
}
