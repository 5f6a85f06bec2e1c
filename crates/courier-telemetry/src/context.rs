//! Remote parent contexts.
//!
//! A message carries its producer's span identity in two places: the
//! envelope's `traceContext` field and the W3C `traceparent` header. Either is
//! turned into a `RemoteParent`, which the receiving span adopts as its
//! OpenTelemetry parent.
//!
//! ```text
//! producer span ──→ PropagatedContext ──→ envelope.traceContext ─┐
//!               └─→ traceparent header ───────────────────────────┤
//!                                                                  ▼
//!                                  RemoteParent ──→ consumer span (child)
//! ```

use std::str::FromStr;

use opentelemetry::{
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use shared_types::PropagatedContext;

/// Convert the envelope wire shape into an OpenTelemetry span context.
///
/// Returns `None` for invalid or all-zero identifiers.
pub fn span_context_from(propagated: &PropagatedContext) -> Option<SpanContext> {
    if !propagated.is_valid() {
        return None;
    }

    let trace_id = TraceId::from_hex(&propagated.trace_id).ok()?;
    let span_id = SpanId::from_hex(&propagated.span_id).ok()?;
    let trace_state = propagated
        .trace_state
        .as_deref()
        .and_then(|s| TraceState::from_str(s).ok())
        .unwrap_or_default();

    let span_context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::new(propagated.trace_flags),
        true, // remote = true (came from another process)
        trace_state,
    );
    span_context.is_valid().then_some(span_context)
}

/// Convert an OpenTelemetry span context into the envelope wire shape.
pub fn propagated_from(span_context: &SpanContext) -> Option<PropagatedContext> {
    if !span_context.is_valid() {
        return None;
    }

    let trace_state = span_context.trace_state().header();
    Some(PropagatedContext {
        trace_id: span_context.trace_id().to_string(),
        span_id: span_context.span_id().to_string(),
        trace_flags: span_context.trace_flags().to_u8(),
        trace_state: (!trace_state.is_empty()).then_some(trace_state),
    })
}

/// A valid parent span context received from elsewhere.
#[derive(Debug, Clone)]
pub struct RemoteParent {
    context: Context,
}

impl RemoteParent {
    /// Parent from the envelope's `traceContext`.
    pub fn from_propagated(propagated: &PropagatedContext) -> Option<Self> {
        span_context_from(propagated).map(|sc| Self {
            context: Context::new().with_remote_span_context(sc),
        })
    }

    /// Parent from an OpenTelemetry context, if it holds a valid span.
    pub fn from_context(context: Context) -> Option<Self> {
        let valid = context.span().span_context().is_valid();
        valid.then_some(Self { context })
    }

    /// Parent from the span currently entered on this thread.
    pub fn current() -> Option<Self> {
        use tracing_opentelemetry::OpenTelemetrySpanExt;
        Self::from_context(tracing::Span::current().context())
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn span_context(&self) -> SpanContext {
        self.context.span().span_context().clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.span().span_context().trace_id()
    }

    pub fn to_propagated(&self) -> Option<PropagatedContext> {
        propagated_from(self.context.span().span_context())
    }
}
