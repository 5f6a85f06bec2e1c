//! # Broker Facade
//!
//! One entry point over the three messaging patterns. The facade owns the
//! bus handle and the immutable [`BrokerConfig`]; every manager it builds is
//! bound to both.
//!
//! ```rust,ignore
//! let broker = Broker::builder(Arc::new(InMemoryBus::new()))
//!     .options(BrokerOptions::from_env())
//!     .publish_subscribe(events)
//!     .request_reply(endpoints)
//!     .consumer(jobs)
//!     .build()?;
//!
//! broker.publish("orders.created", Draft::data(order), None).await?;
//! ```
//!
//! A pattern left unconfigured gets an empty registry, so every subject used
//! with it fails with [`BrokerError::UnknownSubject`].

use std::sync::Arc;

use courier_telemetry::{register_metrics, Logger, MessageSpan, Tracer};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_bus::{MessageBus, PublishAck};
use shared_types::{Draft, Envelope, ReplyEnvelope, RequestReplyRegistry, SchemaRegistry};
use tracing::{info, warn};

use crate::codec::Codec;
use crate::config::{BrokerConfig, BrokerOptions};
use crate::consumer::{ConsumeOptions, ConsumerManager};
use crate::error::BrokerError;
use crate::handler::{MessageHandler, ReplyHandler};
use crate::pubsub::{PubSubManager, SubscribeOptions, SubscriptionHandle};
use crate::request_reply::{ReplyOptions, RequestOptions, RequestReplyManager};

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    bus: Arc<dyn MessageBus>,
    options: BrokerOptions,
    codec: Option<Arc<dyn Codec>>,
    tracer: Option<Tracer>,
    logger: Option<Logger>,
    publish_subscribe: SchemaRegistry,
    request_reply: RequestReplyRegistry,
    consumer: SchemaRegistry,
}

impl BrokerBuilder {
    #[must_use]
    pub fn options(mut self, options: BrokerOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the default JSON codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    #[must_use]
    pub fn tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Subjects available to `publish` / `subscribe`.
    #[must_use]
    pub fn publish_subscribe(mut self, registry: SchemaRegistry) -> Self {
        self.publish_subscribe = registry;
        self
    }

    /// Subjects available to `request` / `reply`.
    #[must_use]
    pub fn request_reply(mut self, registry: RequestReplyRegistry) -> Self {
        self.request_reply = registry;
        self
    }

    /// Subjects available to `dispatch` / `consume`.
    #[must_use]
    pub fn consumer(mut self, registry: SchemaRegistry) -> Self {
        self.consumer = registry;
        self
    }

    /// Validate the options and wire the managers.
    pub fn build(self) -> Result<Broker, BrokerError> {
        if let Err(e) = register_metrics() {
            warn!(error = %e, "Metrics registration failed; continuing without them");
        }

        let mut config = BrokerConfig::new(self.options)?;
        if let Some(codec) = self.codec {
            config = config.with_codec(codec);
        }
        if let Some(tracer) = self.tracer {
            config = config.with_tracer(tracer);
        }
        if let Some(logger) = self.logger {
            config = config.with_logger(logger);
        }
        let config = Arc::new(config);

        info!(
            service = %config.name(),
            instance = %config.instance(),
            queue_name = %config.queue_name(),
            schema_validation = config.options().schema_validation,
            "Broker ready"
        );

        Ok(Broker {
            pubsub: PubSubManager::new(config.clone(), self.bus.clone(), self.publish_subscribe),
            request_reply: RequestReplyManager::new(
                config.clone(),
                self.bus.clone(),
                self.request_reply,
            ),
            consumer: ConsumerManager::new(config.clone(), self.bus.clone(), self.consumer),
            config,
            bus: self.bus,
        })
    }
}

/// Messaging facade bound to one bus.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    bus: Arc<dyn MessageBus>,
    pubsub: PubSubManager,
    request_reply: RequestReplyManager,
    consumer: ConsumerManager,
}

impl Broker {
    pub fn builder(bus: Arc<dyn MessageBus>) -> BrokerBuilder {
        BrokerBuilder {
            bus,
            options: BrokerOptions::default(),
            codec: None,
            tracer: None,
            logger: None,
            publish_subscribe: SchemaRegistry::default(),
            request_reply: RequestReplyRegistry::default(),
            consumer: SchemaRegistry::default(),
        }
    }

    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    pub fn tracer(&self) -> &Tracer {
        self.config.tracer()
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn consumers(&self) -> &ConsumerManager {
        &self.consumer
    }

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
        self.pubsub.publish(subject, draft, parent).await
    }

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
        self.pubsub.subscribe(subject, handler, options).await
    }

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
        self.request_reply.request(subject, draft, parent, options).await
    }

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
        self.request_reply.reply(subject, handler, options).await
    }

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
        self.consumer.dispatch(subject, draft, parent).await
    }

    /// Start a durable consumer. Returns its durable name.
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
        self.consumer.consume(subject, handler, options).await
    }

    /// Stop every durable consumer. Subscriptions and reply endpoints end
    /// through their own handles.
    pub async fn stop(&self) {
        self.consumer.stop().await;
        info!(service = %self.config.name(), "Broker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MessageContext;
    use serde_json::Value;
    use shared_bus::InMemoryBus;
    use shared_types::schema;

    fn options() -> BrokerOptions {
        BrokerOptions {
            name: "facade".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_rejects_invalid_options() {
        let result = Broker::builder(Arc::new(InMemoryBus::new()))
            .options(BrokerOptions {
                request_timeout_ms: 0,
                ..options()
            })
            .build();
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[tokio::test]
    async fn test_unconfigured_pattern_knows_no_subjects() {
        let bus = InMemoryBus::new();
        let broker = Broker::builder(Arc::new(bus.clone()))
            .options(options())
            .publish_subscribe(
                SchemaRegistry::builder()
                    .subject("foo.bar", schema::typed::<i64>())
                    .build(),
            )
            .build()
            .unwrap();

        broker.publish("foo.bar", Draft::data(1i64), None).await.unwrap();

        let err = broker.dispatch("foo.bar", Draft::data(1i64), None).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSubject(_)));

        let err = broker
            .consume(
                "foo.bar",
                |_: MessageContext<Value>| async { anyhow::Ok(()) },
                ConsumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::UnknownSubject(_)));
        assert_eq!(bus.stream_len(), 0);
    }

    #[test]
    fn test_accessors() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let broker = Broker::builder(bus.clone()).options(options()).build().unwrap();
        assert_eq!(broker.config().name(), "facade");
        assert_eq!(broker.config().queue_name(), "facade");
        assert!(Arc::ptr_eq(broker.bus(), &bus));
    }
}
