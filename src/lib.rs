//! Ratewarden - Client-Side Rate Limit Governor
//!
//! This crate lets many concurrent requests against a quota-enforcing HTTP
//! API share the server's per-route buckets without manual throttling. The
//! server reports bucket state in response headers; the [`ratelimit::RateGate`]
//! turns that into waits, and a global 429 pauses every request until the
//! lockout ends.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use http::HttpClient;
pub use ratelimit::{RateGate, RouteKey};
