//! # Shared Manager Base
//!
//! Per-message plumbing reused by the three pattern managers. It never runs
//! loops itself.
//!
//! ```text
//! outbound:  Draft ──resolve──→ Envelope ──validate──→ codec ──→ BusMessage (+traceparent)
//!
//! inbound:   BusMessage ──codec──→ Value ──parent?──→ span ──validate──→ Envelope<T> ──→ handler
//!                                                      │
//!                                                      └── every failure lands on the span
//! ```

use std::future::Future;
use std::sync::Arc;

use courier_telemetry::metrics::{MESSAGES_RECEIVED, VALIDATION_FAILURES};
use courier_telemetry::{
    extract_parent, metric_inc, MessageSpan, MessagingAction, RemoteParent, SpanAttributes,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_bus::{BusMessage, Headers, MessageBus};
use shared_types::{
    BaseEnvelope, Draft, Envelope, EnvelopeFactory, EnvelopeSchema, PropagatedContext, Schema,
    SchemaError,
};
use tracing::Instrument;

use crate::codec::CodecError;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::handler::{Delivery, MessageContext};

/// Direction label of validation metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

#[derive(Clone)]
pub struct ManagerBase {
    config: Arc<BrokerConfig>,
    bus: Arc<dyn MessageBus>,
    pattern: &'static str,
}

impl ManagerBase {
    /// `pattern` labels this manager's metrics.
    pub fn new(config: Arc<BrokerConfig>, bus: Arc<dyn MessageBus>, pattern: &'static str) -> Self {
        Self {
            config,
            bus,
            pattern,
        }
    }

    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn pattern(&self) -> &'static str {
        self.pattern
    }

    /// Fresh header for `subject`, carrying `parent` as its trace context.
    pub fn build_envelope(&self, subject: &str, parent: Option<&MessageSpan>) -> BaseEnvelope {
        BaseEnvelope::new(subject, self.config.name(), self.config.instance().clone())
            .with_trace_context(parent.and_then(MessageSpan::propagated))
    }

    /// Turn a draft into an envelope produced under `span`.
    ///
    /// Complete envelopes keep their own trace context; one without gets the
    /// producing span's.
    pub fn resolve_draft<T>(
        &self,
        subject: &str,
        draft: Draft<Envelope<T>>,
        span: &MessageSpan,
    ) -> Envelope<T> {
        let factory = EnvelopeFactory::new(self.build_envelope(subject, Some(span)));
        let mut envelope = draft.resolve(factory);
        if envelope.base.trace_context.is_none() {
            envelope.base.trace_context = span.propagated();
        }
        envelope
    }

    /// Run `body` inside a new span. This is the one place failures are
    /// mapped onto span status: `Err` marks the span errored, `Ok` ends it
    /// cleanly. The result is passed through unchanged.
    pub async fn with_span<R, F, Fut>(
        &self,
        subject: &str,
        action: MessagingAction,
        parent: Option<&RemoteParent>,
        body: F,
    ) -> Result<R, BrokerError>
    where
        F: FnOnce(MessageSpan) -> Fut,
        Fut: Future<Output = Result<R, BrokerError>>,
    {
        let name = format!("{action} {subject}");
        let span = self
            .config
            .tracer()
            .start_span(&name, SpanAttributes::new(subject, action), parent);

        let result = body(span.clone()).instrument(span.span().clone()).await;
        match &result {
            Ok(_) => span.finish(),
            Err(e) => span.record_error(e),
        }
        result
    }

    /// Run both validation stages, counting failures.
    pub fn validate(
        &self,
        direction: Direction,
        value: &Value,
        base: &dyn Schema,
        payload: Option<&dyn Schema>,
    ) -> Result<(), SchemaError> {
        self.config
            .validator()
            .validate(value, base, payload)
            .map_err(|e| self.count_failure(direction, e))
    }

    /// Validate a bare value, e.g. `error.data` of an error reply.
    pub fn validate_value(
        &self,
        direction: Direction,
        subject: &str,
        value: &Value,
        schema: &dyn Schema,
    ) -> Result<(), SchemaError> {
        self.config
            .validator()
            .validate_value(subject, value, schema)
            .map_err(|e| self.count_failure(direction, e))
    }

    fn count_failure(&self, direction: Direction, error: SchemaError) -> SchemaError {
        let stage = error.stage.to_string();
        metric_inc!(VALIDATION_FAILURES, direction.as_str(), stage.as_str());
        error
    }

    /// Validate an outbound message and encode it with the configured codec.
    pub fn encode_outbound<M: Serialize>(
        &self,
        message: &M,
        base: &dyn Schema,
        payload: Option<&dyn Schema>,
    ) -> Result<Vec<u8>, BrokerError> {
        let value = serde_json::to_value(message).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.validate(Direction::Outbound, &value, base, payload)?;
        Ok(self.config.codec().encode(&value)?)
    }

    /// Wrap encoded bytes in a bus message carrying `span` in its headers.
    pub fn bus_message(&self, subject: &str, payload: Vec<u8>, span: &MessageSpan) -> BusMessage {
        let mut headers = Headers::new();
        span.inject(&mut headers);
        BusMessage::new(subject, payload).with_headers(headers)
    }

    pub fn decode(&self, message: &BusMessage) -> Result<Value, CodecError> {
        self.config.codec().decode(&message.payload)
    }

    /// Remote parent of a received message: envelope first, headers second.
    pub fn parent_of(&self, value: Option<&Value>, headers: &Headers) -> Option<RemoteParent> {
        let propagated = value
            .and_then(|v| v.get("traceContext"))
            .and_then(|v| PropagatedContext::deserialize(v).ok());
        extract_parent(propagated.as_ref(), headers)
    }

    /// Decode, trace, validate and deserialize one inbound message, then hand
    /// the composed context to `body`. Every failure, `body`'s included, is
    /// recorded on the receiving span and returned.
    pub async fn with_validated_payload<T, F, Fut>(
        &self,
        subject: &str,
        message: BusMessage,
        action: MessagingAction,
        payload: Option<&dyn Schema>,
        delivery: Option<Delivery>,
        body: F,
    ) -> Result<(), BrokerError>
    where
        T: DeserializeOwned,
        F: FnOnce(MessageContext<T>) -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        metric_inc!(MESSAGES_RECEIVED, self.pattern, subject);

        let decoded = self.decode(&message);
        let parent = self.parent_of(decoded.as_ref().ok(), &message.headers);

        self.with_span(subject, action, parent.as_ref(), |span| async move {
            let value = decoded?;
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                span.record_message_id(id);
            }

            self.validate(Direction::Inbound, &value, &EnvelopeSchema, payload)?;
            let envelope: Envelope<T> =
                serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))?;

            let ctx = MessageContext {
                message,
                envelope,
                span: span.clone(),
                tracer: self.config.tracer().clone(),
                logger: self.config.logger().for_subject(subject),
                bus: self.bus.clone(),
                delivery,
            };
            body(ctx).await
        })
        .await
    }
}
