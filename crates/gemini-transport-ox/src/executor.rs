//! Drives one logical call through attempts, backoff and classification.
//!
//! Per call: `Attempting(n) → Success | Retrying(delay) → Attempting(n + 1) |
//! Exhausted`. The transitions live on [`Attempt`] so they can be exercised
//! without a transport.

use std::{future::Future, sync::Arc, time::Duration};

use async_stream::try_stream;
use futures_util::{StreamExt, stream::BoxStream};
#[cfg(feature = "leaky-bucket")]
use leaky_bucket::RateLimiter;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{ErrorKind, classify_status_code, classify_transport_failure},
    request_builder::PreparedRequest,
    retry::RetryPolicy,
    streaming::decode_json_stream,
    transport::{ByteStream, Transport, TransportFailure},
};

/// One execution of a call against the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    number: u32,
    last_error: Option<ErrorKind>,
}

/// What happens after an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Wait `delay`, then run `next`.
    Retrying { delay: Duration, next: Attempt },
    /// Give up and surface the error.
    Exhausted(ErrorKind),
}

impl Attempt {
    #[must_use]
    pub fn first() -> Self {
        Self {
            number: 1,
            last_error: None,
        }
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The failure that ended the previous attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&ErrorKind> {
        self.last_error.as_ref()
    }

    /// Consults `policy` about `error`, which ended this attempt.
    #[must_use]
    pub fn fail(self, error: ErrorKind, policy: &RetryPolicy) -> Transition {
        if !policy.should_retry(&error, self.number) {
            return Transition::Exhausted(error);
        }

        Transition::Retrying {
            delay: policy.delay_after(&error, self.number),
            next: Attempt {
                number: self.number + 1,
                last_error: Some(error),
            },
        }
    }
}

/// Runs requests with per-attempt deadlines and policy-driven retries.
///
/// Cheap to clone; every clone shares the transport and the policy.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    policy: Arc<RetryPolicy>,
    timeout: Duration,
    #[cfg(feature = "leaky-bucket")]
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            transport,
            policy: Arc::new(policy),
            timeout,
            #[cfg(feature = "leaky-bucket")]
            rate_limiter: None,
        }
    }

    /// Waits on `limiter` before every attempt, retries included.
    #[cfg(feature = "leaky-bucket")]
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deadline applied to each attempt.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and parses the response body as one JSON value.
    ///
    /// A success body that is not JSON, including an empty one, fails with
    /// [`ErrorKind::Validation`].
    pub async fn execute_unary(&self, request: &PreparedRequest) -> Result<Value, ErrorKind> {
        self.run(request, || self.attempt_unary(request)).await
    }

    /// Sends `request` and decodes the response body as a stream of JSON values.
    ///
    /// Nothing is sent until the stream is first polled. Retries cover
    /// establishing the response; once values start flowing, a read failure
    /// ends the stream with its classified error.
    pub fn execute_streaming(
        &self,
        request: PreparedRequest,
    ) -> BoxStream<'static, Result<Value, ErrorKind>> {
        let executor = self.clone();

        Box::pin(try_stream! {
            let body = executor.run(&request, || executor.attempt_stream(&request)).await?;
            let mut values = decode_json_stream(body, executor.timeout);
            while let Some(value) = values.next().await {
                yield value?;
            }
        })
    }

    async fn run<T, F, Fut>(&self, request: &PreparedRequest, mut send: F) -> Result<T, ErrorKind>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ErrorKind>>,
    {
        let mut attempt = Attempt::first();

        loop {
            debug!(
                method = %request.method,
                path = request.url.path(),
                attempt = attempt.number(),
                max_attempts = self.policy.max_attempts(),
                "sending request"
            );

            let error = match send().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let failed = attempt.number();
            match attempt.fail(error, &self.policy) {
                Transition::Retrying { delay, next } => {
                    if let Some(error) = next.last_error() {
                        warn!(
                            path = request.url.path(),
                            attempt = failed,
                            ?delay,
                            %error,
                            "request failed, retrying"
                        );
                    }
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                Transition::Exhausted(error) => {
                    debug!(
                        path = request.url.path(),
                        attempt = failed,
                        category = %error.category(),
                        "giving up"
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn attempt_unary(&self, request: &PreparedRequest) -> Result<Value, ErrorKind> {
        self.acquire_permit().await;
        let deadline = Instant::now() + self.timeout;

        let exchange = async {
            let response = self.transport.send(request).await?;
            let status = response.status;
            let body = response.collect_body().await?;
            Ok::<_, TransportFailure>((status, body))
        };

        let (status, body) = self.within_deadline(deadline, exchange).await?;

        if status.as_u16() >= 400 {
            return Err(classify_response(status, &body));
        }

        serde_json::from_slice(&body).map_err(|e| {
            classify_transport_failure(&TransportFailure::Decode(e.to_string()), self.timeout)
        })
    }

    async fn attempt_stream(&self, request: &PreparedRequest) -> Result<ByteStream, ErrorKind> {
        self.acquire_permit().await;
        let deadline = Instant::now() + self.timeout;

        let response = self
            .within_deadline(deadline, self.transport.send(request))
            .await?;

        if response.status.as_u16() >= 400 {
            let status = response.status;
            // The error body is best-effort; classification only needs the status.
            let body = tokio::time::timeout_at(deadline, response.collect_body())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(classify_response(status, &body));
        }

        Ok(response.body)
    }

    async fn within_deadline<T>(
        &self,
        deadline: Instant,
        exchange: impl Future<Output = Result<T, TransportFailure>>,
    ) -> Result<T, ErrorKind> {
        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(classify_transport_failure(&failure, self.timeout)),
            Err(_elapsed) => Err(ErrorKind::Timeout {
                duration: self.timeout,
            }),
        }
    }

    async fn acquire_permit(&self) {
        #[cfg(feature = "leaky-bucket")]
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire_one().await;
        }
    }
}

fn classify_response(status: http::StatusCode, body: &[u8]) -> ErrorKind {
    let reason = status.canonical_reason().unwrap_or("unexpected status");
    let text = String::from_utf8_lossy(body);
    classify_status_code(status.as_u16(), reason, Some(&text))
}
