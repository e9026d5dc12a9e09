//! Drives one logical request through the rate gate and the transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, instrument, trace, warn};
use uuid::Uuid;

use super::transport::{ApiRequest, ApiResponse, Transport};
use crate::error::{Result, WardenError};
use crate::ratelimit::{Outcome, RateGate, RateLimitHeaders, Route};

/// Default number of attempts per logical request, the first included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    WaitingGlobal,
    WaitingBucket,
    InFlight,
    Succeeded,
    /// Got a 429 with attempts left; loops back to waiting
    RateLimited,
    /// Got a 429 on the last attempt
    Exhausted,
    Failed,
}

impl RequestState {
    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Succeeded | RequestState::Exhausted | RequestState::Failed
        )
    }

    /// State after a 429 on `attempt` out of `max_attempts`.
    fn after_rate_limit(attempt: u32, max_attempts: u32) -> RequestState {
        if attempt >= max_attempts {
            RequestState::Exhausted
        } else {
            RequestState::RateLimited
        }
    }

    fn transition(&mut self, next: RequestState, attempt: u32) {
        trace!(from = ?self, to = ?next, attempt, "Request state change");
        *self = next;
    }
}

/// Executes requests for one client session.
pub struct RequestExecutor<T: Transport + ?Sized> {
    gate: Arc<RateGate>,
    transport: Arc<T>,
    max_attempts: u32,
    /// Applied when a request carries no deadline of its own
    default_timeout: Option<Duration>,
}

impl<T: Transport + ?Sized> RequestExecutor<T> {
    /// Create a new executor.
    pub fn new(gate: Arc<RateGate>, transport: Arc<T>) -> Self {
        Self {
            gate,
            transport,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_timeout: None,
        }
    }

    /// Set the attempt budget. Values below one are raised to one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the deadline used for requests without their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    /// Run a request to completion.
    ///
    /// Successful responses are returned as-is. A 429 is observed, waited
    /// out and retried until the attempt budget is spent. Other non-2xx
    /// responses become [`WardenError::Http`]; transport errors are passed
    /// through without retry.
    #[instrument(
        skip(self, route, request),
        fields(
            request_id = %Uuid::new_v4(),
            route = %route.key(),
        )
    )]
    pub async fn execute(&self, route: &Route, request: ApiRequest) -> Result<ApiResponse> {
        match request.timeout.or(self.default_timeout) {
            None => self.run(route, &request).await,
            Some(deadline) => timeout(deadline, self.run(route, &request))
                .await
                .map_err(|_| {
                    debug!(deadline_ms = deadline.as_millis() as u64, "Request deadline elapsed");
                    WardenError::Timeout {
                        route: route.key().to_string(),
                    }
                })?,
        }
    }

    async fn run(&self, route: &Route, request: &ApiRequest) -> Result<ApiResponse> {
        let key = route.key();
        let mut state = RequestState::Pending;
        let mut attempt = 0;

        loop {
            attempt += 1;

            if self.gate.global().is_active() {
                state.transition(RequestState::WaitingGlobal, attempt);
            }
            self.gate.wait_global(key).await;

            state.transition(RequestState::WaitingBucket, attempt);
            self.gate.wait_bucket(key).await;

            state.transition(RequestState::InFlight, attempt);
            let response = match self.transport.send(request).await {
                Ok(response) => response,
                Err(e) => {
                    state.transition(RequestState::Failed, attempt);
                    debug!(error = %e, attempt, "Transport failed");
                    return Err(WardenError::Transport(e));
                }
            };

            let outcome = Outcome::from_status(response.status);
            let mut headers = RateLimitHeaders::from_headers(&response.headers);
            if outcome == Outcome::RateLimited {
                headers.merge_body(&response.body);
            }
            self.gate.observe(key, &headers, outcome);

            match outcome {
                Outcome::Success => {
                    state.transition(RequestState::Succeeded, attempt);
                    return Ok(response);
                }
                Outcome::Failed => {
                    state.transition(RequestState::Failed, attempt);
                    return Err(WardenError::Http {
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    });
                }
                Outcome::RateLimited => {
                    state.transition(
                        RequestState::after_rate_limit(attempt, self.max_attempts),
                        attempt,
                    );

                    if state.is_terminal() {
                        warn!(attempt, "Rate limit retry budget exhausted");
                        return Err(WardenError::RateLimitExceededRetries {
                            route: key.to_string(),
                            attempts: attempt,
                        });
                    }

                    // A route-scoped 429 may come without bucket headers, so
                    // honor its retry hint before going back to the gate.
                    if !headers.is_global() {
                        if let Some(retry_after) = headers.retry_after {
                            debug!(
                                attempt,
                                retry_after_ms = retry_after.as_millis() as u64,
                                "Backing off before retry"
                            );
                            sleep(retry_after).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
    use reqwest::{Method, StatusCode};
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Replays canned responses in order and records when each call happened.
    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<std::result::Result<ApiResponse, BoxError>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<std::result::Result<ApiResponse, BoxError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &ApiRequest) -> std::result::Result<ApiResponse, BoxError> {
            self.calls.lock().push(Instant::now());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".into()))
        }
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> std::result::Result<ApiResponse, BoxError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        Ok(ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body: body.as_bytes().to_vec(),
        })
    }

    fn route(template: &str) -> Route {
        Route::compile(Method::GET, template, &[])
    }

    fn request() -> ApiRequest {
        ApiRequest::new(Method::GET, "https://example.invalid/v10/test")
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_bucket() {
        let transport = ScriptedTransport::new(vec![response(
            200,
            &[
                ("X-RateLimit-Bucket", "b1"),
                ("X-RateLimit-Limit", "5"),
                ("X-RateLimit-Remaining", "4"),
                ("X-RateLimit-Reset-After", "1.0"),
            ],
            "{}",
        )]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone());
        let r = route("users/@me");

        let result = executor.execute(&r, request()).await.unwrap();

        assert_eq!(result.status, StatusCode::OK);
        assert_eq!(transport.call_count(), 1);
        let record = executor.gate().registry().bucket_for_route(r.key()).unwrap();
        assert_eq!(record.id, "b1");
        assert_eq!(record.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_429_retried_and_second_response_wins() {
        let transport = ScriptedTransport::new(vec![
            response(
                429,
                &[
                    ("Retry-After", "0.5"),
                    ("X-RateLimit-Scope", "user"),
                    ("X-RateLimit-Bucket", "b1"),
                    ("X-RateLimit-Limit", "5"),
                    ("X-RateLimit-Remaining", "0"),
                    ("X-RateLimit-Reset-After", "0.5"),
                ],
                r#"{"message": "You are being rate limited.", "retry_after": 0.5, "global": false}"#,
            ),
            response(
                200,
                &[
                    ("X-RateLimit-Bucket", "b1"),
                    ("X-RateLimit-Limit", "5"),
                    ("X-RateLimit-Remaining", "4"),
                    ("X-RateLimit-Reset-After", "2.0"),
                ],
                "{}",
            ),
        ]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone());
        let r = route("channels/{channel_id}/messages");

        let result = executor.execute(&r, request()).await;

        assert!(result.is_ok());
        assert_eq!(transport.call_count(), 2);
        let calls = transport.calls.lock().clone();
        assert!(calls[1] - calls[0] >= Duration::from_millis(500));
        let record = executor.gate().registry().get_bucket("b1").unwrap();
        assert_eq!(record.remaining, 4);
        assert_eq!(record.reset_after, Duration::from_secs(2));
        assert!(!executor.gate().global().is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let limited = || response(429, &[("Retry-After", "0.1")], "");
        let transport = ScriptedTransport::new(vec![limited(), limited(), limited(), limited()]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone())
            .with_max_attempts(3);

        let err = executor.execute(&route("a"), request()).await.unwrap_err();

        assert!(err.is_rate_limited());
        match err {
            WardenError::RateLimitExceededRetries { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_429_pauses_other_routes() {
        let transport = ScriptedTransport::new(vec![
            response(429, &[("Retry-After", "1.0"), ("X-RateLimit-Global", "true")], ""),
            response(200, &[], "{}"),
            response(200, &[], "{}"),
        ]);
        let gate = Arc::new(RateGate::new());
        let executor = RequestExecutor::new(gate.clone(), transport.clone()).with_max_attempts(1);

        let start = Instant::now();
        let err = executor.execute(&route("offender"), request()).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(gate.global().is_active());

        executor.execute(&route("bystander"), request()).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "waited {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_flag_from_body() {
        let transport = ScriptedTransport::new(vec![
            response(429, &[], r#"{"retry_after": 0.75, "global": true}"#),
            response(200, &[], "{}"),
        ]);
        let gate = Arc::new(RateGate::new());
        let executor = RequestExecutor::new(gate.clone(), transport.clone());

        let start = Instant::now();
        executor.execute(&route("a"), request()).await.unwrap();

        assert_eq!(transport.call_count(), 2);
        assert!(start.elapsed() >= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_not_retried() {
        let transport = ScriptedTransport::new(vec![Err("connection reset".into())]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone());

        let err = executor.execute(&route("a"), request()).await.unwrap_err();

        assert!(matches!(err, WardenError::Transport(_)));
        assert_eq!(err.to_string(), "Transport error: connection reset");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_observed_and_surfaced() {
        let transport = ScriptedTransport::new(vec![response(
            500,
            &[
                ("X-RateLimit-Bucket", "b1"),
                ("X-RateLimit-Limit", "5"),
                ("X-RateLimit-Remaining", "0"),
                ("X-RateLimit-Reset-After", "1.0"),
            ],
            "oops",
        )]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone());

        let err = executor.execute(&route("a"), request()).await.unwrap_err();

        match err {
            WardenError::Http { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.call_count(), 1);
        assert!(executor.gate().registry().get_bucket("b1").unwrap().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_bucket_wait() {
        let transport = ScriptedTransport::new(vec![
            response(
                200,
                &[
                    ("X-RateLimit-Bucket", "b1"),
                    ("X-RateLimit-Limit", "1"),
                    ("X-RateLimit-Remaining", "0"),
                    ("X-RateLimit-Reset-After", "10"),
                ],
                "{}",
            ),
            response(200, &[], "{}"),
        ]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone());
        let r = route("a");
        executor.execute(&r, request()).await.unwrap();

        let mut hurried = request();
        hurried.timeout = Some(Duration::from_millis(200));
        let err = executor.execute(&r, hurried).await.unwrap_err();

        assert!(matches!(err, WardenError::Timeout { .. }));
        assert!(!err.is_rate_limited());
        assert_eq!(transport.call_count(), 1);
        assert!(executor.gate().registry().get_bucket("b1").unwrap().is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let transport = ScriptedTransport::new(vec![response(
            429,
            &[("Retry-After", "30"), ("X-RateLimit-Global", "true")],
            "",
        )]);
        let executor = RequestExecutor::new(Arc::new(RateGate::new()), transport.clone())
            .with_default_timeout(Some(Duration::from_secs(1)));

        let err = executor.execute(&route("a"), request()).await.unwrap_err();

        assert!(matches!(err, WardenError::Timeout { .. }));
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_request_state_terminal() {
        assert!(RequestState::Succeeded.is_terminal());
        assert!(RequestState::Failed.is_terminal());
        assert!(RequestState::Exhausted.is_terminal());
        assert!(!RequestState::RateLimited.is_terminal());
        assert!(!RequestState::InFlight.is_terminal());
    }

    #[test]
    fn test_last_rate_limited_attempt_is_terminal() {
        assert_eq!(RequestState::after_rate_limit(1, 3), RequestState::RateLimited);
        assert_eq!(RequestState::after_rate_limit(2, 3), RequestState::RateLimited);
        assert_eq!(RequestState::after_rate_limit(3, 3), RequestState::Exhausted);
        assert!(RequestState::after_rate_limit(1, 1).is_terminal());
    }

    #[test]
    fn test_max_attempts_floor() {
        let executor = RequestExecutor::new(
            Arc::new(RateGate::new()),
            ScriptedTransport::new(Vec::new()),
        )
        .with_max_attempts(0);
        assert_eq!(executor.max_attempts, 1);
    }
}
