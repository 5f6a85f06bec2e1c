//! # Publish/Subscribe Manager
//!
//! Fire-and-forget messaging. Subscriptions join the configured queue group,
//! so instances of one service share the load of a subject.
//!
//! Inbound failures never end a subscription loop:
//!
//! | Failure | Effect |
//! |---------|--------|
//! | undecodable / schema violation | recorded on the span, message dropped |
//! | handler error or panic | recorded on the span, swallowed |
//!
//! Outbound schema violations are returned to the publisher before anything
//! reaches the bus.

use std::sync::Arc;

use courier_telemetry::metrics::{HANDLER_ERRORS, MESSAGES_PUBLISHED};
use courier_telemetry::{metric_inc, MessageSpan, MessagingAction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_bus::{BusMessage, MessageBus, Subscription};
use shared_types::{Draft, Envelope, EnvelopeSchema, SchemaRegistry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::base::ManagerBase;
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::handler::{guarded, MessageHandler};

/// Per-call subscription options.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group override. Defaults to the configured queue name.
    pub queue_group: Option<String>,
}

impl SubscribeOptions {
    pub fn queue_group(group: impl Into<String>) -> Self {
        Self {
            queue_group: Some(group.into()),
        }
    }
}

/// Handle of a running subscription loop.
///
/// Dropping the handle leaves the loop running; call
/// [`SubscriptionHandle::unsubscribe`] to end it.
#[must_use = "dropping the handle detaches the subscription"]
pub struct SubscriptionHandle {
    subject: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub(crate) fn spawn<F>(subject: &str, subscription: Subscription, mut process: F) -> Self
    where
        F: FnMut(BusMessage) -> futures::future::BoxFuture<'static, ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut subscription = subscription;
            loop {
                tokio::select! {
                    biased;
                    Ok(()) = stopped.changed() => {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                    next = subscription.recv() => match next {
                        Some(message) => process(message).await,
                        None => break,
                    },
                }
            }
            subscription.unsubscribe();
        });

        Self {
            subject: subject.to_string(),
            stop,
            task,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the loop and wait for it. A message being handled is finished first.
    pub async fn unsubscribe(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(
                subject = %self.subject,
                error = %e,
                "Subscription loop ended abnormally"
            );
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct PubSubManager {
    base: ManagerBase,
    registry: SchemaRegistry,
}

impl PubSubManager {
    pub fn new(
        config: Arc<BrokerConfig>,
        bus: Arc<dyn MessageBus>,
        registry: SchemaRegistry,
    ) -> Self {
        Self {
            base: ManagerBase::new(config, bus, "pubsub"),
            registry,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Subscribe `handler` to `subject` and start its loop.
    pub async fn subscribe<T, H>(
        &self,
        subject: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        self.registry.get(subject)?;
        let queue_group = options
            .queue_group
            .unwrap_or_else(|| self.base.config().queue_name().to_string());

        let subscription = self.base.bus().subscribe(subject, Some(&queue_group)).await?;
        info!(subject, queue_group = %queue_group, "Subscribed");

        let manager = self.clone();
        let handler = Arc::new(handler);
        let owned_subject = subject.to_string();
        Ok(SubscriptionHandle::spawn(subject, subscription, move |message| {
            let manager = manager.clone();
            let handler = handler.clone();
            let subject = owned_subject.clone();
            Box::pin(async move {
                manager
                    .process::<T, H>(&subject, message, handler.as_ref())
                    .await
            })
        }))
    }

    async fn process<T, H>(&self, subject: &str, message: BusMessage, handler: &H)
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let Ok(schema) = self.registry.get(subject) else {
            return;
        };

        let result = self
            .base
            .with_validated_payload::<T, _, _>(
                subject,
                message,
                MessagingAction::Subscribe,
                Some(schema.as_ref()),
                None,
                |ctx| async move {
                    guarded(handler.handle(ctx)).await.map_err(BrokerError::Handler)
                },
            )
            .await;

        match result {
            Ok(()) => {}
            Err(BrokerError::Handler(_)) => {
                metric_inc!(HANDLER_ERRORS, self.base.pattern());
            }
            Err(e) => debug!(subject, error = %e, "Message dropped"),
        }
    }

    /// Validate and publish a message. Delivery is best effort.
    pub async fn publish<T, D>(
        &self,
        subject: &str,
        draft: D,
        parent: Option<&MessageSpan>,
    ) -> Result<(), BrokerError>
    where
        T: Serialize,
        D: Into<Draft<Envelope<T>>>,
    {
        let draft = draft.into();
        let parent = parent.and_then(MessageSpan::as_parent);

        self.base
            .with_span(subject, MessagingAction::Publish, parent.as_ref(), |span| async move {
                let schema = self.registry.get(subject)?;
                let envelope = self.base.resolve_draft(subject, draft, &span);
                span.record_message_id(&envelope.base.id);
                let payload =
                    self.base
                        .encode_outbound(&envelope, &EnvelopeSchema, Some(schema.as_ref()))?;

                let receivers = self
                    .base
                    .bus()
                    .publish(self.base.bus_message(subject, payload, &span))
                    .await?;
                metric_inc!(MESSAGES_PUBLISHED, self.base.pattern(), subject);
                debug!(subject, receivers, id = %envelope.base.id, "Published");
                Ok(())
            })
            .await
    }
}
