//! Request/reply with resilience policy.
//!
//! # Algorithm
//! ```text
//! encode once (typed entry point only)
//! breaker.admit()?  no → CircuitOpen, zero attempts
//! for attempt in 1..=max_attempts:
//!     transport.request(destination, envelope, timeout)
//!     reply          → decode; success → on_success, return
//!                             decode error → on_failure, Deserialization
//!     no responders  → on_failure, ServiceUnavailable (never retried)
//!     timeout        → on_failure; last? ServiceTimeout : sleep backoff
//!     other error    → on_failure; last? RetryExhausted : sleep backoff
//! ```
//!
//! The same envelope (payload bytes and idempotency key) is sent on every
//! attempt. No lock is held across the backoff sleep.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::BusClient;
use crate::codec::headers::MSG_ID;
use crate::codec::{Envelope, Headers, Schema};
use crate::error::{BusError, Result};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::Admission;
use crate::resilience::retries::is_retryable;
use crate::resilience::RetryPolicy;
use crate::transport::TransportError;

/// Per-call overrides of the configured request policy.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    /// Total attempts.
    pub max_attempts: Option<u32>,
    /// Forwarded unchanged on every attempt so the responder can deduplicate.
    pub idempotency_key: Option<String>,
    /// Extra headers merged into the request.
    pub headers: Headers,
}

impl RequestOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// One logical request, fixed before the first attempt.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub destination: String,
    pub envelope: Envelope,
    /// Schema the reply must carry.
    pub expected_response_schema: &'static str,
    pub timeout: Duration,
    pub policy: RetryPolicy,
}

impl BusClient {
    /// Send a typed request and decode the typed reply.
    pub async fn request_typed<Req, Resp>(&self, destination: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Schema,
        Resp: DeserializeOwned + Schema,
    {
        self.request_typed_with(destination, request, RequestOptions::default())
            .await
    }

    pub async fn request_typed_with<Req, Resp>(
        &self,
        destination: &str,
        request: &Req,
        options: RequestOptions,
    ) -> Result<Resp>
    where
        Req: Serialize + Schema,
        Resp: DeserializeOwned + Schema,
    {
        let payload = self.inner.codec.encode(request)?;
        let headers = self.inner.outgoing_headers::<Req>();
        let ctx = self.context(destination, payload, headers, Resp::schema_name(), options);

        let codec = self.inner.codec;
        self.execute(ctx, move |reply| codec.decode_envelope::<Resp>(reply))
            .await
    }

    /// Send pre-encoded bytes and return the raw reply envelope.
    pub async fn request_raw(
        &self,
        destination: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<Envelope> {
        self.request_raw_with(destination, payload, RequestOptions::default().with_headers(headers))
            .await
    }

    pub async fn request_raw_with(
        &self,
        destination: &str,
        payload: Bytes,
        options: RequestOptions,
    ) -> Result<Envelope> {
        let mut headers = Headers::new();
        if self.inner.codec.headers_enabled() {
            self.inner.propagator.inject(&mut headers);
        }
        let ctx = self.context(destination, payload, headers, "", options);
        self.execute(ctx, |reply| Ok(reply.clone())).await
    }

    fn context(
        &self,
        destination: &str,
        payload: Bytes,
        mut headers: Headers,
        expected_response_schema: &'static str,
        options: RequestOptions,
    ) -> RequestContext {
        headers.extend(&options.headers);
        if let Some(key) = options.idempotency_key {
            headers.insert(MSG_ID, key);
        }

        let mut policy = self.inner.retry;
        if let Some(max_attempts) = options.max_attempts {
            policy.max_attempts = max_attempts.max(1);
        }

        RequestContext {
            destination: destination.to_string(),
            envelope: Envelope::new(payload).with_headers(headers),
            expected_response_schema,
            timeout: options.timeout.unwrap_or(self.inner.request_timeout),
            policy,
        }
    }

    /// Run one logical exchange under breaker and retry policy.
    pub async fn execute<T, F>(&self, ctx: RequestContext, decode: F) -> Result<T>
    where
        F: Fn(&Envelope) -> Result<T>,
    {
        let _in_flight = self.inner.connection.begin()?;
        let start = Instant::now();
        let destination = ctx.destination.as_str();

        let breaker = self.inner.connection.get_or_create_breaker(destination);
        let Some(mut admission) = breaker.admit() else {
            tracing::debug!(destination = %destination, "Request rejected by open circuit");
            metrics::record_request(destination, "circuit_open", start);
            return Err(BusError::CircuitOpen {
                destination: ctx.destination,
            });
        };
        let transport = self.inner.connection.transport();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            tracing::trace!(destination = %destination, attempt, "Sending request");

            let failure = match transport
                .request(destination, ctx.envelope.clone(), ctx.timeout)
                .await
            {
                Ok(reply) => {
                    if !ctx.expected_response_schema.is_empty() {
                        if let Err(e) = self.inner.codec.check_schema(&reply, ctx.expected_response_schema) {
                            return Err(self.fail_decode(&mut admission, destination, start, e));
                        }
                    }
                    return match decode(&reply) {
                        Ok(value) => {
                            admission.success();
                            metrics::record_attempt(destination, "success");
                            metrics::record_request(destination, "success", start);
                            Ok(value)
                        }
                        Err(e) => Err(self.fail_decode(&mut admission, destination, start, e)),
                    };
                }
                Err(TransportError::NoResponders) => {
                    admission.failure();
                    metrics::record_attempt(destination, "no_responders");
                    metrics::record_request(destination, "unavailable", start);
                    tracing::warn!(destination = %destination, "No responders for request");
                    return Err(BusError::ServiceUnavailable {
                        destination: ctx.destination,
                    });
                }
                Err(TransportError::Closed) => {
                    metrics::record_request(destination, "closed", start);
                    return Err(BusError::Closed);
                }
                // The caller's mistake, not the destination's health.
                Err(source @ TransportError::InvalidSubject(_)) => {
                    metrics::record_request(destination, "invalid_subject", start);
                    return Err(BusError::RetryExhausted {
                        destination: ctx.destination,
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => e,
            };

            admission.failure();
            let result = if failure == TransportError::TimedOut { "timeout" } else { "error" };
            metrics::record_attempt(destination, result);

            if ctx.policy.is_last(attempt) || !is_retryable(&failure) {
                tracing::warn!(
                    destination = %destination,
                    attempts = attempt,
                    error = %failure,
                    "Request failed"
                );
                return Err(match failure {
                    TransportError::TimedOut => {
                        metrics::record_request(destination, "timeout", start);
                        BusError::ServiceTimeout {
                            destination: ctx.destination,
                            attempts: attempt,
                            timeout_ms: ctx.timeout.as_millis() as u64,
                        }
                    }
                    source => {
                        metrics::record_request(destination, "retry_exhausted", start);
                        BusError::RetryExhausted {
                            destination: ctx.destination,
                            attempts: attempt,
                            source,
                        }
                    }
                });
            }

            let delay = ctx.policy.delay_for(attempt);
            tracing::debug!(
                destination = %destination,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn fail_decode(
        &self,
        admission: &mut Admission,
        destination: &str,
        start: Instant,
        error: BusError,
    ) -> BusError {
        admission.failure();
        metrics::record_attempt(destination, "decode_error");
        metrics::record_request(destination, "decode_error", start);
        tracing::warn!(destination = %destination, error = %error, "Reply could not be decoded");
        error
    }
}
