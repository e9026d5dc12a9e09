//! Client session wrapping the rate gate and executor.

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::executor::RequestExecutor;
use super::transport::{ApiRequest, ReqwestTransport, Transport};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::ratelimit::{RateGate, Route};

/// A session against the remote API.
///
/// Each session owns its own [`RateGate`]; bucket and lockout state live
/// exactly as long as the session and are never shared between sessions.
pub struct HttpClient<T: Transport + ?Sized = ReqwestTransport> {
    executor: RequestExecutor<T>,
    api_root: String,
    default_headers: HeaderMap,
    pruner: Mutex<Option<JoinHandle<()>>>,
}

impl HttpClient<ReqwestTransport> {
    /// Create a new session using `reqwest`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &WardenConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.api.user_agent)?;
        Self::with_transport(config, Arc::new(transport))
    }
}

impl<T: Transport + ?Sized> HttpClient<T> {
    /// Create a new session on top of a custom transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(config: &WardenConfig, transport: Arc<T>) -> Result<Self> {
        config.validate()?;

        let mut default_headers = HeaderMap::new();
        if let Some(token) = &config.api.token {
            let mut value = HeaderValue::from_str(&format!("Bot {}", token))
                .map_err(|e| WardenError::Config(format!("Invalid token: {}", e)))?;
            value.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, value);
        }

        let limits = &config.rate_limiting;
        let gate = Arc::new(RateGate::with_global_fallback(limits.global_fallback()));
        let pruner = gate.spawn_pruner(limits.prune_interval(), limits.prune_grace());

        let executor = RequestExecutor::new(gate, transport)
            .with_max_attempts(limits.max_attempts)
            .with_default_timeout(config.request_timeout());

        info!(
            api_root = %config.api_root(),
            max_attempts = limits.max_attempts,
            "Client session started"
        );

        Ok(Self {
            executor,
            api_root: config.api_root(),
            default_headers,
            pruner: Mutex::new(Some(pruner)),
        })
    }

    /// The session's rate gate.
    pub fn gate(&self) -> &Arc<RateGate> {
        self.executor.gate()
    }

    /// Send a request and decode the JSON response.
    ///
    /// `template` is the endpoint relative to the API root, with path
    /// parameters written as `{name}` and filled from `params`. An empty
    /// response body decodes to [`Value::Null`].
    pub async fn request(
        &self,
        method: Method,
        template: &str,
        params: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value> {
        let route = Route::compile(method, template, params);
        let mut request = ApiRequest::new(route.method().clone(), self.url_for(route.path()));
        request.headers = self.default_headers.clone();
        request.body = body;

        let response = self.executor.execute(&route, request).await?;
        debug!(route = %route.key(), status = %response.status, "Request complete");

        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    pub async fn get(&self, template: &str, params: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::GET, template, params, None).await
    }

    pub async fn post(&self, template: &str, params: &[(&str, &str)], body: Value) -> Result<Value> {
        self.request(Method::POST, template, params, Some(body)).await
    }

    pub async fn patch(&self, template: &str, params: &[(&str, &str)], body: Value) -> Result<Value> {
        self.request(Method::PATCH, template, params, Some(body)).await
    }

    pub async fn put(&self, template: &str, params: &[(&str, &str)], body: Value) -> Result<Value> {
        self.request(Method::PUT, template, params, Some(body)).await
    }

    pub async fn delete(&self, template: &str, params: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::DELETE, template, params, None).await
    }

    /// Stop background work. Rate limit state is dropped with the session.
    pub fn shutdown(&self) {
        if let Some(pruner) = self.pruner.lock().take() {
            pruner.abort();
            info!("Client session stopped");
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.api_root, path.trim_start_matches('/'))
    }
}

impl<T: Transport + ?Sized> Drop for HttpClient<T> {
    fn drop(&mut self) {
        if let Some(pruner) = self.pruner.get_mut().take() {
            pruner.abort();
        }
    }
}
