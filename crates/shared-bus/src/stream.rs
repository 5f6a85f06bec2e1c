//! # Durable Stream Consumption
//!
//! Pull-based access to the durable stream. A consumer asks for a bounded
//! batch with an expiry; the bus answers with up to `batch` messages followed
//! by a `BatchComplete` marker, either when the batch is filled or when the
//! request expires.
//!
//! ```text
//! pull{batch: 3, expires} ──→ Message, Message, BatchComplete   (expired)
//! pull{batch: 2, expires} ──→ Message, Message, BatchComplete   (filled)
//! ```
//!
//! Every delivered message must be settled with `ack`, `nak` or `term`.
//! Unsettled messages are redelivered once the consumer's ack wait elapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::bus::BusError;
use crate::message::BusMessage;

/// How a delivered stream message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processed; never deliver again.
    Ack,
    /// Not processed; redeliver as soon as possible.
    Nak,
    /// Unprocessable; never deliver again.
    Term,
}

/// Settles messages on behalf of the bus that delivered them.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, sequence: u64, kind: AckKind) -> Result<(), BusError>;
}

/// A message delivered by a durable consumer.
#[derive(Clone)]
pub struct StreamMessage {
    pub message: BusMessage,
    /// Position in the stream.
    pub sequence: u64,
    /// How many times this message has been delivered, this time included.
    pub delivered: u32,
    acker: Arc<dyn Acker>,
}

impl StreamMessage {
    pub fn new(message: BusMessage, sequence: u64, delivered: u32, acker: Arc<dyn Acker>) -> Self {
        Self {
            message,
            sequence,
            delivered,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.settle(self.sequence, AckKind::Ack).await
    }

    pub async fn nak(&self) -> Result<(), BusError> {
        self.acker.settle(self.sequence, AckKind::Nak).await
    }

    pub async fn term(&self) -> Result<(), BusError> {
        self.acker.settle(self.sequence, AckKind::Term).await
    }
}

impl std::fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.message.subject)
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}

/// One pull request: at most `batch` messages, open for `expires`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRequest {
    pub batch: usize,
    pub expires: Duration,
}

impl PullRequest {
    pub fn new(batch: usize, expires: Duration) -> Self {
        Self { batch, expires }
    }
}

/// What a pull subscription yields.
#[derive(Debug)]
pub enum PullEvent {
    Message(StreamMessage),
    /// A pull request finished, filled or expired.
    BatchComplete,
}

/// A pull subscription bound to a durable consumer.
#[async_trait]
pub trait PullSubscription: Send + Sync {
    /// Durable consumer name this subscription is bound to.
    fn durable(&self) -> &str;

    /// Issue a pull request. Results arrive through `next`.
    async fn pull(&self, request: PullRequest) -> Result<(), BusError>;

    /// Next message or batch marker. `None` once drained and empty.
    async fn next(&mut self) -> Option<PullEvent>;

    /// Cancel open pull requests and stop accepting new ones. Events already
    /// delivered stay readable through `next`.
    async fn drain(&self) -> Result<(), BusError>;
}
