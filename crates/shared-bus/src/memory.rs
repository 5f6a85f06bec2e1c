//! # In-Memory Bus
//!
//! Single-process implementation of `MessageBus`.
//!
//! - Core subjects: fan-out to every plain subscriber, one member per queue
//!   group (round robin).
//! - Requests: a private `_INBOX.<id>` subscription per call.
//! - Stream: one append-only log shared by all durable consumers. Each
//!   durable consumer keeps a cursor, the set of delivered-but-unsettled
//!   messages and a FIFO of open pull requests. Pull subscriptions bound to
//!   the same durable name compete for its messages.
//!
//! Suitable for tests and single-node deployments; a networked deployment
//! plugs a different `MessageBus` into the broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::bus::{BusError, ConsumerOptions, DeliverPolicy, MessageBus, PublishAck};
use crate::message::{is_valid_pattern, is_valid_subject, subject_matches, BusMessage};
use crate::stream::{AckKind, Acker, PullEvent, PullRequest, PullSubscription, StreamMessage};
use crate::subscriber::Subscription;
use crate::{DEFAULT_STREAM, INBOX_PREFIX};

/// In-memory message bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    core: Mutex<CoreState>,
    stream: Mutex<StreamState>,
    published: AtomicU64,
}

#[derive(Default)]
struct CoreState {
    next_id: u64,
    /// Keyed by subscription id; ordered by registration.
    subscribers: BTreeMap<u64, SubscriberEntry>,
    /// Next member index per queue group.
    round_robin: HashMap<String, usize>,
}

struct SubscriberEntry {
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct StreamState {
    /// Sequence `n` lives at index `n - 1`.
    log: Vec<BusMessage>,
    consumers: HashMap<String, DurableConsumer>,
    next_pull_id: u64,
}

struct DurableConsumer {
    filter: String,
    ack_wait: Duration,
    max_deliver: Option<u32>,
    /// Index of the next never-delivered log entry.
    cursor: usize,
    pending: BTreeMap<u64, Pending>,
    redeliver: VecDeque<u64>,
    waiting: VecDeque<WaitingPull>,
    acker: Arc<dyn Acker>,
}

struct Pending {
    delivered_at: Instant,
    deliveries: u32,
    /// Already sitting in the redeliver queue.
    queued: bool,
}

struct WaitingPull {
    id: u64,
    remaining: usize,
    sender: mpsc::UnboundedSender<PullEvent>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages accepted by `publish` and `stream_publish`.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Number of live core subscriptions (request inboxes included).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.core.lock().subscribers.len()
    }

    /// Number of messages retained in the stream.
    #[must_use]
    pub fn stream_len(&self) -> usize {
        self.inner.stream.lock().log.len()
    }

    /// Delivered but not yet settled messages of a durable consumer.
    #[must_use]
    pub fn pending_count(&self, durable: &str) -> usize {
        self.inner
            .stream
            .lock()
            .consumers
            .get(durable)
            .map_or(0, |c| c.pending.len())
    }

    /// Open pull requests of a durable consumer.
    #[must_use]
    pub fn open_pulls(&self, durable: &str) -> usize {
        self.inner
            .stream
            .lock()
            .consumers
            .get(durable)
            .map_or(0, |c| c.waiting.iter().filter(|w| !w.sender.is_closed()).count())
    }
}

impl Inner {
    fn deliver(&self, message: &BusMessage) -> usize {
        let mut core = self.core.lock();
        let CoreState {
            subscribers,
            round_robin,
            ..
        } = &mut *core;

        let mut direct = Vec::new();
        let mut groups: BTreeMap<String, Vec<&SubscriberEntry>> = BTreeMap::new();
        for entry in subscribers.values() {
            if entry.sender.is_closed() || !subject_matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue_group {
                Some(group) => groups
                    .entry(format!("{group}|{}", entry.pattern))
                    .or_default()
                    .push(entry),
                None => direct.push(entry),
            }
        }

        let mut delivered = 0;
        for entry in direct {
            if entry.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        for (key, members) in groups {
            let next = round_robin.entry(key).or_insert(0);
            let member = members[*next % members.len()];
            *next = next.wrapping_add(1);
            if member.sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn unsubscribe(&self, id: u64) {
        let mut core = self.core.lock();
        core.subscribers.remove(&id);
    }

    fn settle(&self, durable: &str, sequence: u64, kind: AckKind) {
        let mut stream = self.stream.lock();
        let StreamState { log, consumers, .. } = &mut *stream;
        let Some(consumer) = consumers.get_mut(durable) else {
            return;
        };

        match kind {
            AckKind::Ack | AckKind::Term => {
                consumer.pending.remove(&sequence);
                trace!(durable, sequence, ?kind, "Stream message settled");
            }
            AckKind::Nak => {
                if let Some(pending) = consumer.pending.get_mut(&sequence) {
                    if !pending.queued {
                        pending.queued = true;
                        consumer.redeliver.push_front(sequence);
                    }
                }
                debug!(durable, sequence, "Stream message returned for redelivery");
                consumer.fill(log);
            }
        }
    }

    fn expire_pull(&self, durable: &str, id: u64) {
        let mut stream = self.stream.lock();
        let Some(consumer) = stream.consumers.get_mut(durable) else {
            return;
        };
        if let Some(index) = consumer.waiting.iter().position(|w| w.id == id) {
            if let Some(pull) = consumer.waiting.remove(index) {
                let _ = pull.sender.send(PullEvent::BatchComplete);
                trace!(durable, pull = id, unfilled = pull.remaining, "Pull request expired");
            }
        }
    }
}

impl DurableConsumer {
    /// Hand out deliverable messages to open pull requests, oldest first.
    fn fill(&mut self, log: &[BusMessage]) {
        self.waiting.retain(|w| !w.sender.is_closed());
        self.requeue_expired();

        while !self.waiting.is_empty() {
            let Some((sequence, delivered)) = self.next_deliverable(log) else {
                break;
            };
            let Some(message) = usize::try_from(sequence - 1).ok().and_then(|i| log.get(i)) else {
                break;
            };
            let event = PullEvent::Message(StreamMessage::new(
                message.clone(),
                sequence,
                delivered,
                self.acker.clone(),
            ));

            let Some(front) = self.waiting.front_mut() else {
                break;
            };
            // A failed send leaves the message pending; ack wait brings it back.
            let _ = front.sender.send(event);
            front.remaining = front.remaining.saturating_sub(1);
            if front.remaining == 0 {
                if let Some(done) = self.waiting.pop_front() {
                    let _ = done.sender.send(PullEvent::BatchComplete);
                }
            }
        }
    }

    fn requeue_expired(&mut self) {
        let now = Instant::now();
        for (sequence, pending) in &mut self.pending {
            if !pending.queued && now.duration_since(pending.delivered_at) >= self.ack_wait {
                pending.queued = true;
                self.redeliver.push_back(*sequence);
            }
        }
    }

    fn next_deliverable(&mut self, log: &[BusMessage]) -> Option<(u64, u32)> {
        while let Some(sequence) = self.redeliver.pop_front() {
            let Some(pending) = self.pending.get_mut(&sequence) else {
                continue;
            };
            if self.max_deliver.is_some_and(|max| pending.deliveries >= max) {
                self.pending.remove(&sequence);
                warn!(
                    filter = %self.filter,
                    sequence,
                    "Stream message exceeded max deliveries, dropped"
                );
                continue;
            }
            pending.queued = false;
            pending.deliveries += 1;
            pending.delivered_at = Instant::now();
            return Some((sequence, pending.deliveries));
        }

        while self.cursor < log.len() {
            let index = self.cursor;
            self.cursor += 1;
            if subject_matches(&self.filter, &log[index].subject) {
                let sequence = index as u64 + 1;
                self.pending.insert(
                    sequence,
                    Pending {
                        delivered_at: Instant::now(),
                        deliveries: 1,
                        queued: false,
                    },
                );
                return Some((sequence, 1));
            }
        }
        None
    }
}

struct ConsumerAcker {
    inner: Weak<Inner>,
    durable: String,
}

#[async_trait]
impl Acker for ConsumerAcker {
    async fn settle(&self, sequence: u64, kind: AckKind) -> Result<(), BusError> {
        let inner = self.inner.upgrade().ok_or(BusError::Closed)?;
        inner.settle(&self.durable, sequence, kind);
        Ok(())
    }
}

struct MemoryPullSubscription {
    inner: Arc<Inner>,
    durable: String,
    receiver: mpsc::UnboundedReceiver<PullEvent>,
    /// `None` once drained.
    sender: Mutex<Option<mpsc::UnboundedSender<PullEvent>>>,
}

#[async_trait]
impl PullSubscription for MemoryPullSubscription {
    fn durable(&self) -> &str {
        &self.durable
    }

    async fn pull(&self, request: PullRequest) -> Result<(), BusError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| BusError::Draining(self.durable.clone()))?;

        if request.batch == 0 {
            let _ = sender.send(PullEvent::BatchComplete);
            return Ok(());
        }

        let (id, still_open) = {
            let mut stream = self.inner.stream.lock();
            let StreamState {
                log,
                consumers,
                next_pull_id,
            } = &mut *stream;
            *next_pull_id += 1;
            let id = *next_pull_id;

            let consumer = consumers.get_mut(&self.durable).ok_or(BusError::Closed)?;
            consumer.waiting.push_back(WaitingPull {
                id,
                remaining: request.batch,
                sender,
            });
            consumer.fill(log);
            (id, consumer.waiting.iter().any(|w| w.id == id))
        };

        trace!(durable = %self.durable, pull = id, batch = request.batch, "Pull request issued");

        if still_open {
            let inner = Arc::downgrade(&self.inner);
            let durable = self.durable.clone();
            let expires = request.expires;
            tokio::spawn(async move {
                tokio::time::sleep(expires).await;
                if let Some(inner) = inner.upgrade() {
                    inner.expire_pull(&durable, id);
                }
            });
        }
        Ok(())
    }

    async fn next(&mut self) -> Option<PullEvent> {
        self.receiver.recv().await
    }

    async fn drain(&self) -> Result<(), BusError> {
        let Some(sender) = self.sender.lock().take() else {
            return Ok(());
        };

        let mut stream = self.inner.stream.lock();
        if let Some(consumer) = stream.consumers.get_mut(&self.durable) {
            consumer.waiting.retain(|w| !w.sender.same_channel(&sender));
        }
        debug!(durable = %self.durable, "Pull subscription drained");
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> Result<usize, BusError> {
        if !is_valid_subject(&message.subject) {
            return Err(BusError::InvalidSubject(message.subject));
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let receivers = self.inner.deliver(&message);
        if receivers == 0 {
            trace!(subject = %message.subject, "Message published with no receivers");
        } else {
            trace!(subject = %message.subject, receivers, "Message published");
        }
        Ok(receivers)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, BusError> {
        if !is_valid_pattern(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = {
            let mut core = self.inner.core.lock();
            core.next_id += 1;
            let id = core.next_id;
            core.subscribers.insert(
                id,
                SubscriberEntry {
                    pattern: subject.to_string(),
                    queue_group: queue_group.map(str::to_string),
                    sender,
                },
            );
            id
        };

        debug!(subject, queue_group, "New subscription created");

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(
            subject,
            queue_group.map(str::to_string),
            receiver,
            move || {
                if let Some(inner) = inner.upgrade() {
                    inner.unsubscribe(id);
                }
            },
        ))
    }

    async fn request(
        &self,
        message: BusMessage,
        timeout: Duration,
    ) -> Result<BusMessage, BusError> {
        let subject = message.subject.clone();
        let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox, None).await?;

        if self.publish(message.with_reply(inbox)).await? == 0 {
            return Err(BusError::NoResponders(subject));
        }

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout { subject, timeout }),
        }
    }

    async fn stream_publish(&self, message: BusMessage) -> Result<PublishAck, BusError> {
        if !is_valid_subject(&message.subject) {
            return Err(BusError::InvalidSubject(message.subject));
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let sequence = {
            let mut stream = self.inner.stream.lock();
            let StreamState { log, consumers, .. } = &mut *stream;
            log.push(message.clone());
            let sequence = log.len() as u64;
            for consumer in consumers.values_mut() {
                if subject_matches(&consumer.filter, &message.subject) {
                    consumer.fill(log);
                }
            }
            sequence
        };

        self.inner.deliver(&message);
        trace!(subject = %message.subject, sequence, "Message stored in stream");

        Ok(PublishAck {
            stream: DEFAULT_STREAM.to_string(),
            sequence,
        })
    }

    async fn pull_subscribe(
        &self,
        subject: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn PullSubscription>, BusError> {
        if !is_valid_pattern(subject) {
            return Err(BusError::InvalidSubject(subject.to_string()));
        }

        {
            let mut stream = self.inner.stream.lock();
            let start = match options.deliver {
                DeliverPolicy::All => 0,
                DeliverPolicy::New => stream.log.len(),
            };
            if let Some(existing) = stream.consumers.get(&options.durable) {
                if existing.filter != subject {
                    return Err(BusError::ConsumerMismatch {
                        durable: options.durable,
                        bound: existing.filter.clone(),
                        requested: subject.to_string(),
                    });
                }
            } else {
                let acker: Arc<dyn Acker> = Arc::new(ConsumerAcker {
                    inner: Arc::downgrade(&self.inner),
                    durable: options.durable.clone(),
                });
                stream.consumers.insert(
                    options.durable.clone(),
                    DurableConsumer {
                        filter: subject.to_string(),
                        ack_wait: options.ack_wait,
                        max_deliver: options.max_deliver,
                        cursor: start,
                        pending: BTreeMap::new(),
                        redeliver: VecDeque::new(),
                        waiting: VecDeque::new(),
                        acker,
                    },
                );
                debug!(durable = %options.durable, subject, "Durable consumer created");
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Box::new(MemoryPullSubscription {
            inner: self.inner.clone(),
            durable: options.durable,
            receiver,
            sender: Mutex::new(Some(sender)),
        }))
    }
}
