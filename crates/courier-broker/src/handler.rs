//! Application handler traits and the per-message context handed to them.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use courier_telemetry::{Logger, MessageSpan, Tracer};
use futures::FutureExt;
use shared_bus::{BusMessage, MessageBus};
use shared_types::Envelope;

use crate::request_reply::Responder;

/// Stream position of a message delivered by a durable consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub sequence: u64,
    /// Delivery attempt, starting at 1.
    pub delivered: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivered > 1
    }
}

/// Everything a handler gets for one validated message.
pub struct MessageContext<T> {
    /// The raw bus message.
    pub message: BusMessage,
    pub envelope: Envelope<T>,
    /// Span of the receiving operation. Pass it as the parent of anything
    /// published while handling.
    pub span: MessageSpan,
    pub tracer: Tracer,
    pub logger: Logger,
    pub bus: Arc<dyn MessageBus>,
    /// Set for durable consumer deliveries.
    pub delivery: Option<Delivery>,
}

impl<T> MessageContext<T> {
    pub fn data(&self) -> &T {
        &self.envelope.data
    }

    pub fn into_data(self) -> T {
        self.envelope.data
    }

    pub fn subject(&self) -> &str {
        self.envelope.subject()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MessageContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("envelope", &self.envelope)
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

/// Handles messages of publish/subscribe subscriptions and durable consumers.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, ctx: MessageContext<T>) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(MessageContext<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: MessageContext<T>) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Handles requests; answers through the [`Responder`].
#[async_trait]
pub trait ReplyHandler<Req, Rep>: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: MessageContext<Req>,
        responder: Responder<Rep>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<Req, Rep, F, Fut> ReplyHandler<Req, Rep> for F
where
    Req: Send + 'static,
    Rep: Send + 'static,
    F: Fn(MessageContext<Req>, Responder<Rep>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: MessageContext<Req>,
        responder: Responder<Rep>,
    ) -> anyhow::Result<()> {
        (self)(ctx, responder).await
    }
}

/// Run a handler call, turning a panic into an ordinary handler error so the
/// loop driving it survives.
pub(crate) async fn guarded<F>(handling: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(handling).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(anyhow::anyhow!("handler panicked: {reason}"))
        }
    }
}
