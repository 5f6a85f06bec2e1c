//! # Message Spans
//!
//! Every produce or receive operation runs inside a `MessageSpan`: a
//! `tracing` span carrying the OpenTelemetry semantic fields the
//! `tracing-opentelemetry` bridge turns into span name, kind and status.
//!
//! ```text
//! Tracer::start_span("publish orders.created", attrs, parent?)
//!     │
//!     ├── ok  → finish()           otel.status_code = OK
//!     └── err → record_error(e)    otel.status_code = ERROR + error event
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry::trace::TraceContextExt;
use opentelemetry::Context;
use shared_bus::Headers;
use shared_types::PropagatedContext;
use tracing::field::Empty;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::context::{propagated_from, RemoteParent};
use crate::propagation::inject_headers;

/// What a span is doing with its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessagingAction {
    Publish,
    Subscribe,
    Request,
    Reply,
    Dispatch,
    Consume,
}

impl MessagingAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
            Self::Request => "request",
            Self::Reply => "reply",
            Self::Dispatch => "dispatch",
            Self::Consume => "consume",
        }
    }

    /// OpenTelemetry span kind for this action.
    #[must_use]
    pub fn span_kind(&self) -> &'static str {
        match self {
            Self::Publish | Self::Dispatch => "producer",
            Self::Subscribe | Self::Consume => "consumer",
            Self::Request => "client",
            Self::Reply => "server",
        }
    }
}

impl fmt::Display for MessagingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes attached to a message span at creation.
#[derive(Debug, Clone)]
pub struct SpanAttributes {
    pub subject: String,
    pub action: MessagingAction,
    pub message_id: Option<String>,
}

impl SpanAttributes {
    pub fn new(subject: impl Into<String>, action: MessagingAction) -> Self {
        Self {
            subject: subject.into(),
            action,
            message_id: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Starts message spans tagged with the producing service identity.
#[derive(Debug, Clone)]
pub struct Tracer {
    service: Arc<str>,
    instance: Arc<str>,
}

impl Tracer {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: Arc::from(service.into()),
            instance: Arc::from(instance.into()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Start a span named `name`.
    ///
    /// With a `parent` the span becomes its child; without one it follows the
    /// span current on this thread, or starts a new trace.
    pub fn start_span(
        &self,
        name: &str,
        attributes: SpanAttributes,
        parent: Option<&RemoteParent>,
    ) -> MessageSpan {
        let span = tracing::info_span!(
            "courier.message",
            otel.name = %name,
            otel.kind = attributes.action.span_kind(),
            otel.status_code = Empty,
            otel.status_message = Empty,
            messaging.system = "courier",
            messaging.operation = attributes.action.as_str(),
            messaging.destination.name = %attributes.subject,
            messaging.message.id = Empty,
            service.name = %self.service,
            service.instance.id = %self.instance,
        );

        if let Some(id) = &attributes.message_id {
            span.record("messaging.message.id", id.as_str());
        }
        if let Some(parent) = parent {
            span.set_parent(parent.context().clone());
        }

        MessageSpan {
            span,
            name: Arc::from(name),
            subject: Arc::from(attributes.subject),
            action: attributes.action,
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A started message span. Clones refer to the same span.
#[derive(Debug, Clone)]
pub struct MessageSpan {
    span: tracing::Span,
    name: Arc<str>,
    subject: Arc<str>,
    action: MessagingAction,
    failed: Arc<AtomicBool>,
}

impl MessageSpan {
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn action(&self) -> MessagingAction {
        self.action
    }

    /// OpenTelemetry context holding this span.
    pub fn context(&self) -> Context {
        self.span.context()
    }

    /// This span's identity in envelope wire form. `None` when no
    /// OpenTelemetry layer is installed.
    pub fn propagated(&self) -> Option<PropagatedContext> {
        propagated_from(self.context().span().span_context())
    }

    /// Use this span as the parent of another.
    pub fn as_parent(&self) -> Option<RemoteParent> {
        RemoteParent::from_context(self.context())
    }

    /// Write `traceparent`/`tracestate` for this span.
    pub fn inject(&self, headers: &mut Headers) {
        inject_headers(&self.context(), headers);
    }

    /// Record the envelope id once it is known.
    pub fn record_message_id(&self, id: &str) {
        self.span.record("messaging.message.id", id);
    }

    /// Mark the span failed and attach an error event.
    pub fn record_error(&self, error: &dyn fmt::Display) {
        self.failed.store(true, Ordering::SeqCst);
        let message = error.to_string();
        self.span.record("otel.status_code", "ERROR");
        self.span.record("otel.status_message", message.as_str());
        tracing::error!(
            parent: &self.span,
            subject = %self.subject,
            operation = %self.name,
            error = %message,
            "Message operation failed"
        );
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record success unless an error was recorded earlier.
    pub fn finish(&self) {
        if !self.is_failed() {
            self.span.record("otel.status_code", "OK");
        }
    }
}
