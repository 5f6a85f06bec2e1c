//! # Durable Consumer Manager
//!
//! At-least-once consumption from the durable stream through pull
//! subscriptions. Each subject gets one loop driven by a [`PollController`]:
//!
//! ```text
//!            start: arm + pull
//!                  │
//!                  ▼
//!   ┌──────────► POLLING ───── tick ───► pull{batch, expires}
//!   │               │
//!   │          message arrives
//!   │               ▼
//!   └─ batch ── DRAINING  (no interval armed, messages processed in order)
//!     complete
//!     (re-arm + pull)
//! ```
//!
//! Ticks come slightly later than the pull expiry, so the previous pull has
//! lapsed before the next one is issued.
//!
//! Settlement policy: `ack` after the handler returns `Ok`, `nak` when it
//! fails or panics (the bus redelivers), `term` when the message is
//! undecodable or fails its schema.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use courier_telemetry::metrics::{
    HANDLER_ERRORS, MESSAGES_PUBLISHED, PULL_REQUESTS, STREAM_SETTLEMENTS,
};
use courier_telemetry::{metric_inc, MessageSpan, MessagingAction};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_bus::{
    AckKind, ConsumerOptions, DeliverPolicy, MessageBus, PublishAck, PullEvent, PullRequest,
    PullSubscription, StreamMessage,
};
use shared_types::{Draft, Envelope, EnvelopeSchema, SchemaRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::base::ManagerBase;
use crate::config::{BrokerConfig, ConfigError};
use crate::error::BrokerError;
use crate::handler::{guarded, Delivery, MessageHandler};

/// Shortest poll period, and the least gap between a pull's expiry and the
/// next tick.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Tick period for pulls open for `expires`.
fn poll_period(expires: Duration) -> Duration {
    expires + (expires / 10).max(MIN_PERIOD)
}

/// Polling state of one durable consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Interval armed, pulls issued on every tick.
    Polling,
    /// Interval disarmed while a batch is processed.
    Draining,
    /// Stop requested; never re-armed.
    Stopped,
}

/// Two-state pull scheduler. The interval lives in an `Option`, so at most
/// one can ever be armed.
#[derive(Debug)]
pub struct PollController {
    state: PollState,
    period: Duration,
    interval: Option<Interval>,
}

impl PollController {
    /// A disarmed controller ticking every `period` once armed. Periods
    /// below 1ms are raised to 1ms.
    pub fn new(period: Duration) -> Self {
        Self {
            state: PollState::Draining,
            period: period.max(MIN_PERIOD),
            interval: None,
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn armed_intervals(&self) -> usize {
        usize::from(self.interval.is_some())
    }

    /// Enter `Polling`. Returns `false` once stopped.
    pub fn arm(&mut self) -> bool {
        if self.state == PollState::Stopped {
            return false;
        }
        if self.interval.is_none() {
            let mut interval = interval_at(Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.interval = Some(interval);
        }
        self.state = PollState::Polling;
        true
    }

    /// Enter `Draining`. Only meaningful while polling.
    pub fn disarm(&mut self) {
        if self.state == PollState::Polling {
            self.interval = None;
            self.state = PollState::Draining;
        }
    }

    pub fn stop(&mut self) {
        self.interval = None;
        self.state = PollState::Stopped;
    }

    /// Wait for the next tick. Pending forever while disarmed.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

/// Per-call consumer options. Unset fields fall back to the configuration.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub batch: Option<usize>,
    pub expires: Option<Duration>,
    /// Durable name prefix override. Defaults to the configured queue name.
    pub queue_name: Option<String>,
}

impl ConsumeOptions {
    #[must_use]
    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = Some(batch);
        self
    }

    #[must_use]
    pub fn expires(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }
}

/// Durable consumer name for `subject` under queue `queue_name`.
pub fn durable_name(queue_name: &str, subject: &str) -> String {
    format!("d{queue_name}-{subject}")
}

struct ConsumerState {
    durable: String,
    stop: watch::Sender<bool>,
    poll: watch::Receiver<PollState>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ConsumerManager {
    base: ManagerBase,
    registry: SchemaRegistry,
    consumers: Arc<Mutex<HashMap<String, ConsumerState>>>,
}

impl ConsumerManager {
    pub fn new(
        config: Arc<BrokerConfig>,
        bus: Arc<dyn MessageBus>,
        registry: SchemaRegistry,
    ) -> Self {
        Self {
            base: ManagerBase::new(config, bus, "consumer"),
            registry,
            consumers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Subjects with a running consumer loop.
    pub fn subjects(&self) -> Vec<String> {
        self.consumers.lock().keys().cloned().collect()
    }

    /// Durable name bound for `subject`, if consuming.
    pub fn durable(&self, subject: &str) -> Option<String> {
        self.consumers.lock().get(subject).map(|c| c.durable.clone())
    }

    /// Current poll state of `subject`'s loop.
    pub fn poll_state(&self, subject: &str) -> Option<PollState> {
        self.consumers.lock().get(subject).map(|c| *c.poll.borrow())
    }

    /// Bind `subject` to its durable consumer and start the pull loop.
    /// Returns the durable name.
    pub async fn consume<T, H>(
        &self,
        subject: &str,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<String, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.registry.get(subject)?;
        if self.consumers.lock().contains_key(subject) {
            return Err(BrokerError::AlreadyConsuming(subject.to_string()));
        }

        let config = self.base.config();
        let defaults = config.consumer();
        let queue_name = options
            .queue_name
            .unwrap_or_else(|| config.queue_name().to_string());
        let durable = durable_name(&queue_name, subject);
        let request = PullRequest::new(
            options.batch.unwrap_or(defaults.batch),
            options.expires.unwrap_or_else(|| defaults.expires()),
        );
        if request.batch == 0 {
            return Err(ConfigError::InvalidConsumer("batch cannot be 0".into()).into());
        }
        if request.expires.is_zero() {
            return Err(ConfigError::InvalidConsumer("expires cannot be 0".into()).into());
        }

        let mut consumer_options =
            ConsumerOptions::durable(durable.as_str()).with_deliver(DeliverPolicy::All);
        if let Some(ack_wait) = defaults.ack_wait() {
            consumer_options = consumer_options.with_ack_wait(ack_wait);
        }
        if let Some(max_deliver) = defaults.max_deliver {
            consumer_options = consumer_options.with_max_deliver(max_deliver);
        }

        let subscription = self
            .base
            .bus()
            .pull_subscribe(subject, consumer_options)
            .await?;

        let (stop, stopped) = watch::channel(false);
        let (poll_tx, poll) = watch::channel(PollState::Draining);
        let worker = ConsumerLoop {
            manager: self.clone(),
            subject: subject.to_string(),
            durable: durable.clone(),
            request,
            handler: Arc::new(handler),
            _payload: std::marker::PhantomData,
        };
        let task = tokio::spawn(worker.run(subscription, stopped, poll_tx));

        let mut consumers = self.consumers.lock();
        if consumers.contains_key(subject) {
            task.abort();
            return Err(BrokerError::AlreadyConsuming(subject.to_string()));
        }
        consumers.insert(
            subject.to_string(),
            ConsumerState {
                durable: durable.clone(),
                stop,
                poll,
                task,
            },
        );
        info!(
            subject,
            durable = %durable,
            batch = request.batch,
            expires_ms = request.expires.as_millis() as u64,
            "Consuming"
        );
        Ok(durable)
    }

    /// Validate and append a message to the durable stream.
    pub async fn dispatch<T, D>(
        &self,
        subject: &str,
        draft: D,
        parent: Option<&MessageSpan>,
    ) -> Result<PublishAck, BrokerError>
    where
        T: Serialize,
        D: Into<Draft<Envelope<T>>>,
    {
        let draft = draft.into();
        let parent = parent.and_then(MessageSpan::as_parent);

        self.base
            .with_span(subject, MessagingAction::Dispatch, parent.as_ref(), |span| async move {
                let schema = self.registry.get(subject)?;
                let envelope = self.base.resolve_draft(subject, draft, &span);
                span.record_message_id(&envelope.base.id);
                let payload =
                    self.base
                        .encode_outbound(&envelope, &EnvelopeSchema, Some(schema.as_ref()))?;

                let ack = self
                    .base
                    .bus()
                    .stream_publish(self.base.bus_message(subject, payload, &span))
                    .await?;
                metric_inc!(MESSAGES_PUBLISHED, self.base.pattern(), subject);
                debug!(subject, stream = %ack.stream, sequence = ack.sequence, "Dispatched");
                Ok(ack)
            })
            .await
    }

    /// Stop the loop of one subject. `false` when it was not consuming.
    pub async fn stop_subject(&self, subject: &str) -> bool {
        let state = self.consumers.lock().remove(subject);
        match state {
            Some(state) => {
                shutdown(subject.to_string(), state).await;
                true
            }
            None => false,
        }
    }

    /// Stop every consumer loop. Messages already delivered are processed and
    /// settled before this returns.
    pub async fn stop(&self) {
        let states: Vec<(String, ConsumerState)> = self.consumers.lock().drain().collect();
        futures::future::join_all(
            states
                .into_iter()
                .map(|(subject, state)| shutdown(subject, state)),
        )
        .await;
    }

    async fn process<T, H>(
        &self,
        subject: &str,
        durable: &str,
        message: StreamMessage,
        handler: &H,
    ) where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let delivery = Delivery {
            sequence: message.sequence,
            delivered: message.delivered,
        };

        let result = match self.registry.get(subject) {
            Ok(schema) => {
                self.base
                    .with_validated_payload::<T, _, _>(
                        subject,
                        message.message.clone(),
                        MessagingAction::Consume,
                        Some(schema.as_ref()),
                        Some(delivery),
                        |ctx| async move {
                            guarded(handler.handle(ctx)).await.map_err(BrokerError::Handler)
                        },
                    )
                    .await
            }
            Err(e) => Err(e.into()),
        };

        let kind = match &result {
            Ok(()) => AckKind::Ack,
            Err(e) if e.is_rejection() => {
                error!(
                    subject,
                    durable,
                    sequence = delivery.sequence,
                    error = %e,
                    "Unprocessable message terminated"
                );
                AckKind::Term
            }
            Err(e) => {
                if matches!(e, BrokerError::Handler(_)) {
                    metric_inc!(HANDLER_ERRORS, self.base.pattern());
                }
                AckKind::Nak
            }
        };

        let settled = match kind {
            AckKind::Ack => message.ack().await,
            AckKind::Nak => message.nak().await,
            AckKind::Term => message.term().await,
        };
        match settled {
            Ok(()) => {
                metric_inc!(STREAM_SETTLEMENTS, durable, settlement_label(kind));
            }
            Err(e) => warn!(
                subject,
                durable,
                sequence = delivery.sequence,
                error = %e,
                "Failed to settle message"
            ),
        }
    }
}

fn settlement_label(kind: AckKind) -> &'static str {
    match kind {
        AckKind::Ack => "ack",
        AckKind::Nak => "nak",
        AckKind::Term => "term",
    }
}

async fn shutdown(subject: String, state: ConsumerState) {
    let _ = state.stop.send(true);
    if let Err(e) = state.task.await {
        warn!(
            subject = %subject,
            durable = %state.durable,
            error = %e,
            "Consumer loop ended abnormally"
        );
    } else {
        info!(subject = %subject, durable = %state.durable, "Consumer stopped");
    }
}

struct ConsumerLoop<T, H> {
    manager: ConsumerManager,
    subject: String,
    durable: String,
    request: PullRequest,
    handler: Arc<H>,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T, H> ConsumerLoop<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn pull(&self, subscription: &dyn PullSubscription) {
        match subscription.pull(self.request).await {
            Ok(()) => {
                metric_inc!(PULL_REQUESTS, self.durable.as_str());
            }
            Err(e) => warn!(durable = %self.durable, error = %e, "Pull request failed"),
        }
    }

    async fn run(
        self,
        mut subscription: Box<dyn PullSubscription>,
        mut stopped: watch::Receiver<bool>,
        poll: watch::Sender<PollState>,
    ) {
        let mut controller = PollController::new(poll_period(self.request.expires));
        controller.arm();
        let _ = poll.send(controller.state());
        self.pull(subscription.as_ref()).await;

        loop {
            tokio::select! {
                biased;
                Ok(()) = stopped.changed() => {
                    if *stopped.borrow() {
                        break;
                    }
                }
                event = subscription.next() => match event {
                    Some(PullEvent::Message(message)) => {
                        controller.disarm();
                        let _ = poll.send(controller.state());
                        self.manager
                            .process::<T, H>(
                                &self.subject,
                                &self.durable,
                                message,
                                self.handler.as_ref(),
                            )
                            .await;
                    }
                    Some(PullEvent::BatchComplete) => {
                        if controller.state() == PollState::Draining && controller.arm() {
                            let _ = poll.send(controller.state());
                            self.pull(subscription.as_ref()).await;
                        }
                    }
                    None => break,
                },
                () = controller.tick() => {
                    if controller.state() == PollState::Polling {
                        self.pull(subscription.as_ref()).await;
                    }
                }
            }
        }

        controller.stop();
        let _ = poll.send(controller.state());
        if let Err(e) = subscription.drain().await {
            warn!(durable = %self.durable, error = %e, "Drain failed");
        }
        // Whatever was delivered before the drain is still processed and settled.
        while let Some(event) = subscription.next().await {
            if let PullEvent::Message(message) = event {
                self.manager
                    .process::<T, H>(&self.subject, &self.durable, message, self.handler.as_ref())
                    .await;
            }
        }
        debug!(durable = %self.durable, "Consumer loop finished");
    }
}
