//! Rate limit tracking and the wait decision.
//!
//! Responses feed bucket state in through [`RateGate::observe`]; requests
//! ask [`RateGate::acquire`] before they go out.

mod bucket;
mod gate;
mod global;
mod headers;
mod registry;
mod route;

pub use bucket::BucketRecord;
pub use gate::{RateGate, DEFAULT_GLOBAL_FALLBACK};
pub use global::GlobalLimitGuard;
pub use headers::{Outcome, RateLimitHeaders, RateLimitScope};
pub use registry::BucketRegistry;
pub use route::{Route, RouteKey};
