//! # Subscriptions
//!
//! The receiving side of core publish/subscribe.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::debug;

use crate::message::BusMessage;

type Cleanup = Box<dyn FnOnce() + Send + Sync>;

/// A subscription handle for receiving messages.
///
/// When dropped, the subscription is removed from the bus.
pub struct Subscription {
    subject: String,
    queue_group: Option<String>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    cleanup: Option<Cleanup>,
}

impl Subscription {
    /// Create a subscription. `cleanup` runs once when the handle goes away.
    pub fn new(
        subject: impl Into<String>,
        queue_group: Option<String>,
        receiver: mpsc::UnboundedReceiver<BusMessage>,
        cleanup: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            queue_group,
            receiver,
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Receive the next message.
    ///
    /// Returns `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Receive without waiting. `Ok(None)` means nothing is queued.
    pub fn try_recv(&mut self) -> Result<Option<BusMessage>, crate::BusError> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(crate::BusError::Closed),
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn queue_group(&self) -> Option<&str> {
        self.queue_group.as_deref()
    }

    /// Stop receiving new messages. Already queued messages stay readable.
    pub fn unsubscribe(&mut self) {
        self.receiver.close();
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
            debug!(subject = %self.subject, "Unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
            debug!(subject = %self.subject, "Subscription dropped");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("queue_group", &self.queue_group)
            .finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
