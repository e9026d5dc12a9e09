//! Typed view over the rate-limit headers of a response.
//!
//! Every field is optional: the server omits them on unmetered routes and
//! only sends `Retry-After` and the scope on a 429. Values that fail to
//! parse are treated as absent rather than as errors.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Deserialize;

pub const BUCKET: &str = "x-ratelimit-bucket";
pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const RESET_AFTER: &str = "x-ratelimit-reset-after";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const SCOPE: &str = "x-ratelimit-scope";
pub const RETRY_AFTER: &str = "retry-after";

/// Which quota a 429 rejection was charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Per-route quota for this client
    User,
    /// Application-wide lockout
    Global,
    /// Per-resource quota shared with other clients
    Shared,
}

impl RateLimitScope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(RateLimitScope::User),
            "global" => Some(RateLimitScope::Global),
            "shared" => Some(RateLimitScope::Shared),
            _ => None,
        }
    }
}

/// How a response should be treated by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    Failed,
}

impl Outcome {
    /// Classify an HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Outcome::Success
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Outcome::RateLimited
        } else {
            Outcome::Failed
        }
    }
}

/// Rate-limit information extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub bucket: Option<String>,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Absolute reset time reported by the server
    pub reset: Option<DateTime<Utc>>,
    /// Relative time until the bucket resets
    pub reset_after: Option<Duration>,
    pub retry_after: Option<Duration>,
    pub scope: Option<RateLimitScope>,
}

/// The JSON body the server sends alongside a 429.
#[derive(Debug, Deserialize)]
struct RateLimitBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: Option<bool>,
}

impl RateLimitHeaders {
    /// Parse the rate-limit headers out of a response header map.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut scope = header_str(headers, SCOPE).and_then(RateLimitScope::parse);
        if header_str(headers, GLOBAL).is_some_and(|v| v.trim().eq_ignore_ascii_case("true")) {
            scope = Some(RateLimitScope::Global);
        }

        Self {
            bucket: header_str(headers, BUCKET)
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string),
            limit: header_u32(headers, LIMIT),
            remaining: header_u32(headers, REMAINING),
            reset: header_str(headers, RESET).and_then(parse_epoch),
            reset_after: header_str(headers, RESET_AFTER).and_then(parse_seconds),
            retry_after: header_str(headers, RETRY_AFTER).and_then(parse_seconds),
            scope,
        }
    }

    /// Fill in `retry_after` and the global flag from a 429 JSON body when the
    /// headers did not carry them. Bodies that are not JSON are ignored.
    pub fn merge_body(&mut self, body: &[u8]) {
        let Ok(parsed) = serde_json::from_slice::<RateLimitBody>(body) else {
            return;
        };

        if self.retry_after.is_none() {
            self.retry_after = parsed
                .retry_after
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        }
        if self.scope.is_none() && parsed.global == Some(true) {
            self.scope = Some(RateLimitScope::Global);
        }
    }

    /// Whether the rejection applies to the whole application.
    pub fn is_global(&self) -> bool {
        self.scope == Some(RateLimitScope::Global)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|s| s.trim().parse().ok())
}

/// Parse floating seconds into a duration. Negative and non-finite values
/// are rejected.
fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Parse floating epoch seconds into a UTC timestamp.
fn parse_epoch(value: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = value.trim().parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract() * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
}
