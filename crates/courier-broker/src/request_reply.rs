//! # Request/Reply Manager
//!
//! One request, exactly one typed reply: `success` with data or `error`
//! with a code.
//!
//! ## Request Lifecycle
//!
//! ```text
//! Received ──→ Validating ──✓──→ Handling ──→ Replied
//!                  │
//!                  ✗──→ Rejected   (automatic PAYLOAD_VALIDATION reply)
//! ```
//!
//! - No reply inbox: the request is dropped before validation, the handler
//!   never runs.
//! - Handler error or panic without a reply: automatic `INTERNAL_ERROR` reply.
//! - Reply failing its schema: `INTERNAL_ERROR` is sent instead and the
//!   handler gets the validation error back.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_telemetry::metrics::{HANDLER_ERRORS, MESSAGES_PUBLISHED};
use courier_telemetry::{
    extract_headers, log_message, metric_inc, MessageSpan, MessagingAction, RequestTimer,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use shared_bus::{BusError, BusMessage, Headers, MessageBus};
use shared_types::{
    Draft, Envelope, EnvelopeSchema, ErrorCode, ReplyEnvelope, ReplyEnvelopeSchema, ReplyError,
    RequestReplyDefinition, RequestReplyRegistry, INTERNAL_ERROR, PAYLOAD_VALIDATION,
};
use tracing::{debug, info, warn};

use crate::base::{Direction, ManagerBase};
use crate::codec::CodecError;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::handler::{guarded, ReplyHandler};
use crate::pubsub::SubscriptionHandle;

/// Processing state of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Validating,
    Handling,
    Replied,
    Rejected,
}

impl RequestState {
    #[must_use]
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Handling)
                | (Validating, Rejected)
                | (Handling, Replied)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Replied | Self::Rejected)
    }
}

/// Tracks one request through its states.
#[derive(Debug)]
struct RequestTracker {
    subject: String,
    state: Mutex<RequestState>,
}

impl RequestTracker {
    fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            state: Mutex::new(RequestState::Received),
        }
    }

    fn state(&self) -> RequestState {
        *self.state.lock()
    }

    /// Move to `next` if the transition is allowed.
    fn advance(&self, next: RequestState) -> bool {
        let mut state = self.state.lock();
        if !state.can_advance_to(next) {
            return false;
        }
        debug!(subject = %self.subject, from = ?*state, to = ?next, "Request state");
        *state = next;
        true
    }
}

/// Per-call request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Round-trip window. Defaults to the configured request timeout.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Per-call reply endpoint options.
#[derive(Debug, Clone, Default)]
pub struct ReplyOptions {
    /// Queue group override. Defaults to the configured queue name.
    pub queue_group: Option<String>,
}

impl ReplyOptions {
    pub fn queue_group(group: impl Into<String>) -> Self {
        Self {
            queue_group: Some(group.into()),
        }
    }
}

struct ResponderInner {
    base: ManagerBase,
    subject: String,
    reply_to: String,
    definition: RequestReplyDefinition,
    span: MessageSpan,
    tracker: Arc<RequestTracker>,
    replied: AtomicBool,
}

/// Sends the one reply of a request. Clones share the same reply slot.
pub struct Responder<Rep> {
    inner: Arc<ResponderInner>,
    _reply: PhantomData<fn(Rep)>,
}

impl<Rep> Clone for Responder<Rep> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _reply: PhantomData,
        }
    }
}

impl<Rep> std::fmt::Debug for Responder<Rep> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("subject", &self.inner.subject)
            .field("reply_to", &self.inner.reply_to)
            .field("replied", &self.has_replied())
            .finish()
    }
}

impl<Rep> Responder<Rep> {
    fn new(
        base: ManagerBase,
        subject: &str,
        reply_to: &str,
        definition: RequestReplyDefinition,
        span: MessageSpan,
        tracker: Arc<RequestTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                base,
                subject: subject.to_string(),
                reply_to: reply_to.to_string(),
                definition,
                span,
                tracker,
                replied: AtomicBool::new(false),
            }),
            _reply: PhantomData,
        }
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    /// Reply inbox of the request.
    pub fn reply_to(&self) -> &str {
        &self.inner.reply_to
    }

    pub fn has_replied(&self) -> bool {
        self.inner.replied.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<(), BrokerError> {
        if self.inner.replied.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyReplied(self.inner.subject.clone()));
        }
        Ok(())
    }

    /// Reply with an error code.
    ///
    /// `error.data` is checked against the schema declared for the code, if
    /// any. On a violation `INTERNAL_ERROR` is sent instead.
    pub async fn reply_with_error<D>(&self, draft: D) -> Result<(), BrokerError>
    where
        D: Into<Draft<Envelope<ReplyError>>>,
    {
        self.claim()?;
        let inner = &self.inner;

        let envelope = inner
            .base
            .resolve_draft(&inner.subject, draft.into(), &inner.span);
        let code = envelope.data.code.clone();
        let reply: ReplyEnvelope<Value> = ReplyEnvelope::failure(envelope.base, envelope.data);
        let value = to_value(&reply)?;

        let checked = inner
            .base
            .validate(Direction::Outbound, &value, &ReplyEnvelopeSchema, None)
            .and_then(|()| match inner.definition.error_schema(&code) {
                Some(schema) => {
                    let data = value.pointer("/error/data").cloned().unwrap_or(Value::Null);
                    inner
                        .base
                        .validate_value(Direction::Outbound, &inner.subject, &data, schema.as_ref())
                }
                None => Ok(()),
            });

        match checked {
            Ok(()) => self.send(&value).await,
            Err(e) => {
                self.send_internal_error().await;
                Err(e.into())
            }
        }
    }

    /// Claim the reply slot and answer `INTERNAL_ERROR`. `false` when a reply
    /// was already sent.
    async fn fail_internal(&self) -> bool {
        if self.claim().is_err() {
            return false;
        }
        self.send_internal_error().await;
        true
    }

    /// Claim the reply slot and answer `PAYLOAD_VALIDATION`.
    async fn reject(&self, violations: Vec<String>) -> Result<(), BrokerError> {
        self.claim()?;
        let error = ReplyError::new(PAYLOAD_VALIDATION).with_data(json!(violations));
        self.send_error(error).await
    }

    async fn send_internal_error(&self) {
        if let Err(e) = self.send_error(ReplyError::new(INTERNAL_ERROR)).await {
            warn!(subject = %self.inner.subject, error = %e, "Failed to send INTERNAL_ERROR reply");
        }
    }

    /// Send an error reply built from reserved codes. Not validated.
    async fn send_error(&self, error: ReplyError) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let base = inner.base.build_envelope(&inner.subject, Some(&inner.span));
        let reply: ReplyEnvelope<Value> = ReplyEnvelope::failure(base, error);
        self.send(&to_value(&reply)?).await
    }

    async fn send(&self, value: &Value) -> Result<(), BrokerError> {
        let inner = &self.inner;
        let payload = inner.base.config().codec().encode(value)?;
        let message = inner.base.bus_message(&inner.reply_to, payload, &inner.span);

        let receivers = inner.base.bus().publish(message).await?;
        inner.tracker.advance(RequestState::Replied);
        metric_inc!(MESSAGES_PUBLISHED, inner.base.pattern(), inner.subject.as_str());
        if receivers == 0 {
            debug!(subject = %inner.subject, "Reply sent but the requester is gone");
        }
        Ok(())
    }
}

impl<Rep: Serialize> Responder<Rep> {
    /// Reply with data checked against the subject's reply schema. On a
    /// violation `INTERNAL_ERROR` is sent instead.
    pub async fn reply_with_data<D>(&self, draft: D) -> Result<(), BrokerError>
    where
        D: Into<Draft<Envelope<Rep>>>,
    {
        self.claim()?;
        let inner = &self.inner;

        let envelope = inner
            .base
            .resolve_draft(&inner.subject, draft.into(), &inner.span);
        let value = to_value(&ReplyEnvelope::success(envelope))?;

        let checked = inner.base.validate(
            Direction::Outbound,
            &value,
            &ReplyEnvelopeSchema,
            Some(inner.definition.reply.as_ref()),
        );
        match checked {
            Ok(()) => self.send(&value).await,
            Err(e) => {
                self.send_internal_error().await;
                Err(e.into())
            }
        }
    }
}

fn to_value<M: Serialize>(message: &M) -> Result<Value, CodecError> {
    serde_json::to_value(message).map_err(|e| CodecError::Encode(e.to_string()))
}

#[derive(Clone)]
pub struct RequestReplyManager {
    base: ManagerBase,
    registry: RequestReplyRegistry,
}

impl RequestReplyManager {
    pub fn new(
        config: Arc<BrokerConfig>,
        bus: Arc<dyn MessageBus>,
        registry: RequestReplyRegistry,
    ) -> Self {
        Self {
            base: ManagerBase::new(config, bus, "request_reply"),
            registry,
        }
    }

    pub fn registry(&self) -> &RequestReplyRegistry {
        &self.registry
    }

    /// Serve requests on `subject` with `handler`.
    pub async fn reply<Req, Rep, H>(
        &self,
        subject: &str,
        handler: H,
        options: ReplyOptions,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Send + 'static,
        H: ReplyHandler<Req, Rep>,
    {
        self.registry.get(subject)?;
        let queue_group = options
            .queue_group
            .unwrap_or_else(|| self.base.config().queue_name().to_string());

        let subscription = self.base.bus().subscribe(subject, Some(&queue_group)).await?;
        info!(subject, queue_group = %queue_group, "Serving requests");

        let manager = self.clone();
        let handler = Arc::new(handler);
        let owned_subject = subject.to_string();
        Ok(SubscriptionHandle::spawn(subject, subscription, move |message| {
            let manager = manager.clone();
            let handler = handler.clone();
            let subject = owned_subject.clone();
            Box::pin(async move {
                manager
                    .handle_request::<Req, Rep, H>(&subject, message, handler.as_ref())
                    .await
            })
        }))
    }

    async fn handle_request<Req, Rep, H>(&self, subject: &str, message: BusMessage, handler: &H)
    where
        Req: DeserializeOwned + Send + 'static,
        Rep: Send + 'static,
        H: ReplyHandler<Req, Rep>,
    {
        let Ok(definition) = self.registry.get(subject) else {
            return;
        };

        let Some(reply_to) = message.reply.clone() else {
            let parent = self
                .base
                .parent_of(self.base.decode(&message).ok().as_ref(), &message.headers);
            let _ = self
                .base
                .with_span(subject, MessagingAction::Reply, parent.as_ref(), |_| async {
                    Err::<(), _>(BrokerError::MissingReplyDestination(subject.to_string()))
                })
                .await;
            return;
        };

        let headers = message.headers.clone();
        let tracker = Arc::new(RequestTracker::new(subject));
        tracker.advance(RequestState::Validating);

        let handling = tracker.clone();
        let result = self
            .base
            .with_validated_payload::<Req, _, _>(
                subject,
                message,
                MessagingAction::Reply,
                Some(definition.request.as_ref()),
                None,
                |ctx| {
                    let responder = Responder::<Rep>::new(
                        self.base.clone(),
                        subject,
                        &reply_to,
                        definition.clone(),
                        ctx.span.clone(),
                        handling.clone(),
                    );
                    let logger = ctx.logger.clone();
                    async move {
                        handling.advance(RequestState::Handling);
                        match guarded(handler.handle(ctx, responder.clone())).await {
                            Ok(()) => {
                                if !responder.has_replied() {
                                    log_message!(warn, logger, "Handler returned without replying");
                                }
                                Ok(())
                            }
                            Err(e) => {
                                responder.fail_internal().await;
                                Err(BrokerError::Handler(e))
                            }
                        }
                    }
                },
            )
            .await;

        match result {
            Err(e) if e.is_rejection() && tracker.state() == RequestState::Validating => {
                tracker.advance(RequestState::Rejected);
                let violations = match e {
                    BrokerError::SchemaValidation(err) => err.violations,
                    other => vec![other.to_string()],
                };
                self.reject::<Rep>(subject, &reply_to, definition, &headers, tracker, violations)
                    .await;
            }
            Err(BrokerError::Handler(_)) => {
                metric_inc!(HANDLER_ERRORS, self.base.pattern());
            }
            _ => {}
        }
    }

    async fn reject<Rep>(
        &self,
        subject: &str,
        reply_to: &str,
        definition: &RequestReplyDefinition,
        headers: &Headers,
        tracker: Arc<RequestTracker>,
        violations: Vec<String>,
    ) {
        let parent = extract_headers(headers);
        let result = self
            .base
            .with_span(subject, MessagingAction::Reply, parent.as_ref(), |span| {
                let responder = Responder::<Rep>::new(
                    self.base.clone(),
                    subject,
                    reply_to,
                    definition.clone(),
                    span,
                    tracker,
                );
                async move { responder.reject(violations).await }
            })
            .await;
        if let Err(e) = result {
            warn!(subject, error = %e, "Failed to send PAYLOAD_VALIDATION reply");
        }
    }

    /// Send a request and wait for its single reply.
    ///
    /// Outbound violations fail before anything is sent. The reply is checked
    /// against the reply envelope shape, then against the reply schema
    /// (`success`) or the schema declared for its error code (`error`).
    pub async fn request<Req, Rep, D>(
        &self,
        subject: &str,
        draft: D,
        parent: Option<&MessageSpan>,
        options: RequestOptions,
    ) -> Result<ReplyEnvelope<Rep>, BrokerError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
        D: Into<Draft<Envelope<Req>>>,
    {
        let draft = draft.into();
        let parent = parent.and_then(MessageSpan::as_parent);
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.base.config().request_timeout());

        self.base
            .with_span(subject, MessagingAction::Request, parent.as_ref(), |span| async move {
                let definition = self.registry.get(subject)?;
                let envelope = self.base.resolve_draft(subject, draft, &span);
                span.record_message_id(&envelope.base.id);
                let payload = self.base.encode_outbound(
                    &envelope,
                    &EnvelopeSchema,
                    Some(definition.request.as_ref()),
                )?;

                let mut timer = RequestTimer::start(subject);
                let message = self.base.bus_message(subject, payload, &span);
                let response = match self.base.bus().request(message, timeout).await {
                    Ok(response) => response,
                    Err(BusError::Timeout { .. }) => {
                        timer.set_outcome("timeout");
                        return Err(BrokerError::RoundTripTimeout {
                            subject: subject.to_string(),
                            timeout,
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                metric_inc!(MESSAGES_PUBLISHED, self.base.pattern(), subject);

                let value = self.base.decode(&response)?;
                self.check_reply(subject, definition, &value)?;
                let reply: ReplyEnvelope<Rep> =
                    serde_json::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))?;

                timer.set_outcome(reply.kind().as_str());
                if let Some(error) = reply.error() {
                    debug!(subject, code = %error.code, "Request answered with an error");
                }
                Ok(reply)
            })
            .await
    }

    fn check_reply(
        &self,
        subject: &str,
        definition: &RequestReplyDefinition,
        value: &Value,
    ) -> Result<(), BrokerError> {
        self.base
            .validate(Direction::Inbound, value, &ReplyEnvelopeSchema, None)?;

        let null = Value::Null;
        match value.get("type").and_then(Value::as_str) {
            Some("success") => {
                let data = value.get("data").unwrap_or(&null);
                self.base.validate_value(
                    Direction::Inbound,
                    subject,
                    data,
                    definition.reply.as_ref(),
                )?;
            }
            Some("error") => {
                let code = value
                    .pointer("/error/code")
                    .and_then(|c| serde_json::from_value::<ErrorCode>(c.clone()).ok());
                let schema = code.and_then(|code| definition.error_schema(&code));
                if let Some(schema) = schema {
                    let data = value.pointer("/error/data").unwrap_or(&null);
                    self.base
                        .validate_value(Direction::Inbound, subject, data, schema.as_ref())?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
