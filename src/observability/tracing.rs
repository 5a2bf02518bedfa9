//! Distributed trace-context propagation.
//!
//! # Responsibilities
//! - Inject the current trace context into outgoing message headers
//! - Extract trace context from incoming message headers
//! - Carry the current context across `.await` points of a task
//!
//! # Design Decisions
//! - Propagation is a capability chosen at client construction; the default
//!   `NoopPropagator` never touches headers and never fails
//! - Supports W3C Trace Context (`traceparent`) headers
//! - The current context lives in a tokio task-local, so it follows the
//!   future rather than the worker thread

use std::fmt;
use std::future::Future;

use crate::codec::headers::{self, Headers};

tokio::task_local! {
    static CURRENT: TraceContext;
}

/// Identity of one span in a distributed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: nonzero_u128(),
            span_id: nonzero_u64(),
            sampled: true,
        }
    }

    /// A new span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: nonzero_u64(),
            sampled: self.sampled,
        }
    }

    /// Render as a W3C `traceparent` value.
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }

    /// Parse a W3C `traceparent` value. Invalid input yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version.len() != 2 || version.eq_ignore_ascii_case("ff") {
            return None;
        }
        // Version 00 has exactly four fields; later versions may append more.
        if version == "00" && parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let span_id = u64::from_str_radix(span_id, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            sampled: flags & 0x01 == 0x01,
        })
    }

    /// Context of the running task, if one was established.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| *ctx).ok()
    }

    /// Run `fut` with this context as the current one.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.trace_id)
    }
}

fn nonzero_u128() -> u128 {
    loop {
        let id = rand::random::<u128>();
        if id != 0 {
            return id;
        }
    }
}

fn nonzero_u64() -> u64 {
    loop {
        let id = rand::random::<u64>();
        if id != 0 {
            return id;
        }
    }
}

/// Moves trace context between the running task and message headers.
///
/// Implementations must never fail: a missing or malformed context is simply
/// not propagated.
pub trait Propagator: Send + Sync + fmt::Debug {
    /// Write the outgoing context into `headers`.
    fn inject(&self, headers: &mut Headers);

    /// Read an incoming context from `headers`.
    fn extract(&self, headers: &Headers) -> Option<TraceContext>;
}

/// Propagator used when tracing is not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPropagator;

impl Propagator for NoopPropagator {
    fn inject(&self, _headers: &mut Headers) {}

    fn extract(&self, _headers: &Headers) -> Option<TraceContext> {
        None
    }
}

/// W3C Trace Context propagator.
///
/// Outgoing messages carry a child of the current context, or a fresh root
/// when the task has none.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn inject(&self, headers: &mut Headers) {
        let ctx = TraceContext::current()
            .map(|parent| parent.child())
            .unwrap_or_else(TraceContext::new_root);
        headers.insert(headers::TRACEPARENT, ctx.to_traceparent());
    }

    fn extract(&self, headers: &Headers) -> Option<TraceContext> {
        headers.get(headers::TRACEPARENT).and_then(TraceContext::parse)
    }
}
