//! Request execution against the remote API.
//!
//! The [`RequestExecutor`] drives one logical call through the rate gate and
//! a [`Transport`], retrying on 429 within a small budget. [`HttpClient`]
//! is the session that owns the gate and builds requests.

mod client;
mod executor;
mod transport;

pub use client::HttpClient;
pub use executor::{RequestExecutor, RequestState};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
