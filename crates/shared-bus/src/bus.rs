//! # Bus Boundary
//!
//! `MessageBus` is everything the broker needs from a transport. Core
//! publish/subscribe, the request inbox round trip, and the durable stream
//! API (publish-with-ack, pull consumers) are all reached through it, so the
//! broker never depends on a concrete bus.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::BusMessage;
use crate::stream::PullSubscription;
use crate::subscriber::Subscription;

/// Errors raised by bus operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus (or the subscription) was closed.
    #[error("Message bus closed")]
    Closed,

    #[error("Invalid subject '{0}'")]
    InvalidSubject(String),

    /// A request was published but nobody listens on the subject.
    #[error("No responders for subject '{0}'")]
    NoResponders(String),

    #[error("Request on '{subject}' timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    /// The pull subscription was drained and accepts no more requests.
    #[error("Pull subscription on consumer '{0}' is draining")]
    Draining(String),

    #[error("Durable consumer '{durable}' is bound to '{bound}', not '{requested}'")]
    ConsumerMismatch {
        durable: String,
        bound: String,
        requested: String,
    },
}

/// Acknowledgement returned by the stream for a retained message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Where a new durable consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Every retained message, from the start of the stream.
    #[default]
    All,
    /// Only messages stored after the consumer was created.
    New,
}

/// Settings for binding a pull subscription to a durable consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Durable name. Pull subscriptions sharing it share one cursor.
    pub durable: String,
    pub deliver: DeliverPolicy,
    /// Unacknowledged messages become eligible for redelivery after this long.
    pub ack_wait: Duration,
    /// Deliveries after which an unsettled message is given up on.
    pub max_deliver: Option<u32>,
}

impl ConsumerOptions {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable: name.into(),
            deliver: DeliverPolicy::All,
            ack_wait: Duration::from_secs(30),
            max_deliver: None,
        }
    }

    #[must_use]
    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    #[must_use]
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    #[must_use]
    pub fn with_deliver(mut self, deliver: DeliverPolicy) -> Self {
        self.deliver = deliver;
        self
    }
}

/// The transport capability injected into the broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish. Returns how many subscribers received it.
    async fn publish(&self, message: BusMessage) -> Result<usize, BusError>;

    /// Subscribe to a subject pattern, optionally as a member of a queue
    /// group (one member per group receives each message).
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, BusError>;

    /// Publish `message` with a private reply inbox and wait for one answer.
    async fn request(&self, message: BusMessage, timeout: Duration) -> Result<BusMessage, BusError>;

    /// Publish into the durable stream, retained until acknowledged.
    async fn stream_publish(&self, message: BusMessage) -> Result<PublishAck, BusError>;

    /// Bind a pull subscription for `subject` to a durable consumer.
    async fn pull_subscribe(
        &self,
        subject: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn PullSubscription>, BusError>;
}
