//! # Envelope
//!
//! The unit exchanged on the bus. Every message, whatever the interaction
//! pattern, is an `Envelope<T>`: a machine-generated header (`BaseEnvelope`)
//! flattened next to the application payload `data`.
//!
//! ## Wire Format
//!
//! ```text
//! { id, subject, date (ms epoch), service, instance, traceContext?, data }
//! ```
//!
//! Request/reply responses use `ReplyEnvelope<T>`, which replaces `data` with a
//! `type`-tagged body:
//!
//! ```text
//! { ...base, type: "success", data }
//! { ...base, type: "error", error: { code, data? } }
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::trace_context::PropagatedContext;

/// Reserved error code sent when an inbound request fails its schema.
pub const PAYLOAD_VALIDATION: &str = "PAYLOAD_VALIDATION";

/// Reserved error code sent when the replying side failed internally.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Identity of a producing process. The wire format allows a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceId {
    Number(u64),
    Text(String),
}

impl InstanceId {
    /// Generate a random instance identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self::Text(Uuid::new_v4().to_string())
    }

    /// An instance id is empty only when it is an empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Text(s) if s.is_empty())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<u64> for InstanceId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

/// The machine-generated part of every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEnvelope {
    /// Unique identifier, generated per envelope.
    pub id: String,
    /// Destination / routing key.
    pub subject: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub date: u64,
    /// Logical producer name.
    pub service: String,
    /// Producer instance identifier.
    pub instance: InstanceId,
    /// Parent span reference of the producing operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<PropagatedContext>,
}

impl BaseEnvelope {
    /// Create a header with a fresh id and the current time.
    pub fn new(
        subject: impl Into<String>,
        service: impl Into<String>,
        instance: impl Into<InstanceId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            date: crate::now_millis(),
            service: service.into(),
            instance: instance.into(),
            trace_context: None,
        }
    }

    /// Attach a parent span reference. Invalid contexts are dropped.
    #[must_use]
    pub fn with_trace_context(mut self, context: Option<PropagatedContext>) -> Self {
        self.trace_context = context.filter(PropagatedContext::is_valid);
        self
    }
}

/// A message on the bus: header plus application payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    #[serde(flatten)]
    pub base: BaseEnvelope,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(base: BaseEnvelope, data: T) -> Self {
        Self { base, data }
    }

    pub fn subject(&self) -> &str {
        &self.base.subject
    }

    /// Replace the payload, keeping the header.
    pub fn with_data<U>(self, data: U) -> Envelope<U> {
        Envelope {
            base: self.base,
            data,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            base: self.base,
            data: f(self.data),
        }
    }
}

/// Error code of an error reply: a producer-declared code or a reserved one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Text(String),
}

impl ErrorCode {
    #[must_use]
    pub fn payload_validation() -> Self {
        Self::Text(PAYLOAD_VALIDATION.to_string())
    }

    #[must_use]
    pub fn internal_error() -> Self {
        Self::Text(INTERNAL_ERROR.to_string())
    }

    /// Whether this is one of the two codes reserved by the protocol.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        matches!(self, Self::Text(s) if s == PAYLOAD_VALIDATION || s == INTERNAL_ERROR)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ErrorCode {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

/// The `error` object of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReplyError {
    pub fn new(code: impl Into<ErrorCode>) -> Self {
        Self {
            code: code.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} ({data})", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

/// Body of a reply, discriminated by the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplyBody<T> {
    Success { data: T },
    Error { error: ReplyError },
}

/// Which of the two reply variants a reply carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Success,
    Error,
}

impl ReplyKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Response envelope of the request/reply pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope<T = Value> {
    #[serde(flatten)]
    pub base: BaseEnvelope,
    #[serde(flatten)]
    pub body: ReplyBody<T>,
}

impl<T> ReplyEnvelope<T> {
    /// Turn a data envelope into a success reply.
    pub fn success(envelope: Envelope<T>) -> Self {
        Self {
            base: envelope.base,
            body: ReplyBody::Success {
                data: envelope.data,
            },
        }
    }

    pub fn failure(base: BaseEnvelope, error: ReplyError) -> Self {
        Self {
            base,
            body: ReplyBody::Error { error },
        }
    }

    pub fn kind(&self) -> ReplyKind {
        match self.body {
            ReplyBody::Success { .. } => ReplyKind::Success,
            ReplyBody::Error { .. } => ReplyKind::Error,
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind() == ReplyKind::Success
    }

    pub fn data(&self) -> Option<&T> {
        match &self.body {
            ReplyBody::Success { data } => Some(data),
            ReplyBody::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ReplyError> {
        match &self.body {
            ReplyBody::Success { .. } => None,
            ReplyBody::Error { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, ReplyError> {
        match self.body {
            ReplyBody::Success { data } => Ok(data),
            ReplyBody::Error { error } => Err(error),
        }
    }
}

/// Pre-filled envelope header handed to builder callbacks.
///
/// The caller supplies only the payload; id, date, service, instance and
/// trace context were generated by the manager.
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    base: BaseEnvelope,
}

impl EnvelopeFactory {
    pub fn new(base: BaseEnvelope) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &BaseEnvelope {
        &self.base
    }

    pub fn into_base(self) -> BaseEnvelope {
        self.base
    }

    /// Finish the envelope with the given payload.
    pub fn data<T>(self, data: T) -> Envelope<T> {
        Envelope::new(self.base, data)
    }
}

/// An outbound message: either a complete envelope or a builder callback.
pub enum Draft<M> {
    /// Caller built the whole message, header included.
    Complete(M),
    /// Caller supplies the payload through a pre-filled factory.
    Build(Box<dyn FnOnce(EnvelopeFactory) -> M + Send>),
}

impl<M> Draft<M> {
    pub fn build<F>(f: F) -> Self
    where
        F: FnOnce(EnvelopeFactory) -> M + Send + 'static,
    {
        Self::Build(Box::new(f))
    }

    /// Produce the final message. The factory is ignored for complete drafts.
    pub fn resolve(self, factory: EnvelopeFactory) -> M {
        match self {
            Self::Complete(message) => message,
            Self::Build(build) => build(factory),
        }
    }
}

impl<T: Send + 'static> Draft<Envelope<T>> {
    /// Shorthand for a builder that only sets the payload.
    pub fn data(data: T) -> Self {
        Self::build(move |factory| factory.data(data))
    }
}

impl<T> From<Envelope<T>> for Draft<Envelope<T>> {
    fn from(envelope: Envelope<T>) -> Self {
        Self::Complete(envelope)
    }
}

impl From<ReplyError> for Draft<Envelope<ReplyError>> {
    fn from(error: ReplyError) -> Self {
        Self::data(error)
    }
}

impl<M: fmt::Debug> fmt::Debug for Draft<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete(message) => f.debug_tuple("Complete").field(message).finish(),
            Self::Build(_) => f.write_str("Build(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> BaseEnvelope {
        BaseEnvelope::new("foo.bar", "svc", "instance-1")
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new(base(), json!({"n": 1}));
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["subject"], "foo.bar");
        assert_eq!(value["service"], "svc");
        assert_eq!(value["instance"], "instance-1");
        assert_eq!(value["data"], json!({"n": 1}));
        assert!(value["date"].is_u64());
        assert!(value.get("traceContext").is_none());
    }

    #[test]
    fn test_envelope_roundtrip_is_structural() {
        let envelope = Envelope::new(base().with_trace_context(None), vec![1u32, 2, 3]);
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: Envelope<Vec<u32>> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope, back);
    }

    #[test]
    fn test_numeric_instance() {
        let envelope: Envelope = serde_json::from_value(json!({
            "id": "1", "subject": "s", "date": 5, "service": "svc", "instance": 42, "data": null
        }))
        .unwrap();
        assert_eq!(envelope.base.instance, InstanceId::Number(42));
    }

    #[test]
    fn test_success_reply_wire_shape() {
        let reply = ReplyEnvelope::success(Envelope::new(base(), 20));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "success");
        assert_eq!(value["data"], 20);
        assert!(value.get("error").is_none());

        let back: ReplyEnvelope<i64> = serde_json::from_value(value).unwrap();
        assert_eq!(back.data(), Some(&20));
    }

    #[test]
    fn test_error_reply_wire_shape() {
        let reply: ReplyEnvelope<i64> =
            ReplyEnvelope::failure(base(), ReplyError::new("YO").with_data("error"));
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "YO");
        assert_eq!(value["error"]["data"], "error");
        assert!(value.get("data").is_none());

        let back: ReplyEnvelope<i64> = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), ReplyKind::Error);
        assert_eq!(back.error().unwrap().code, ErrorCode::from("YO"));
    }

    #[test]
    fn test_draft_builder_uses_factory() {
        let draft = Draft::data(10);
        let envelope = draft.resolve(EnvelopeFactory::new(base()));
        assert_eq!(envelope.data, 10);
        assert_eq!(envelope.subject(), "foo.bar");
    }

    #[test]
    fn test_complete_draft_ignores_factory() {
        let mut own = base();
        own.id = "fixed".to_string();
        let draft: Draft<Envelope<i32>> = Envelope::new(own, 1).into();
        let envelope = draft.resolve(EnvelopeFactory::new(base()));
        assert_eq!(envelope.base.id, "fixed");
    }

    #[test]
    fn test_reserved_codes() {
        assert!(ErrorCode::payload_validation().is_reserved());
        assert!(ErrorCode::internal_error().is_reserved());
        assert!(!ErrorCode::from("YO").is_reserved());
        assert!(!ErrorCode::from(7i64).is_reserved());
    }
}
