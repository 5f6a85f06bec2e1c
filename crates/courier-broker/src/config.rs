//! # Broker Configuration
//!
//! [`BrokerOptions`] is the plain, serde-friendly part: identity, naming and
//! timing. [`BrokerConfig`] is what the managers share: the options plus the
//! injected capabilities (codec, tracer, logger, validator). It is built once
//! and handed out as `Arc<BrokerConfig>`; nothing mutates it afterwards.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_telemetry::{Logger, Tracer};
use serde::{Deserialize, Serialize};
use shared_types::{InstanceId, Validator};
use uuid::Uuid;

use crate::codec::{Codec, JsonCodec};

/// Pull parameters of durable consumers, overridable per `consume()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerDefaults {
    /// Messages requested per pull
    pub batch: usize,

    /// Lifetime of one pull request, also the poll interval period
    pub expires_ms: u64,

    /// Redelivery delay for unacknowledged messages. Bus default when unset.
    pub ack_wait_ms: Option<u64>,

    /// Delivery attempts before a message is given up. Unlimited when unset.
    pub max_deliver: Option<u32>,
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            batch: 20,
            expires_ms: 5000,
            ack_wait_ms: None,
            max_deliver: None,
        }
    }
}

impl ConsumerDefaults {
    pub fn expires(&self) -> Duration {
        Duration::from_millis(self.expires_ms)
    }

    pub fn ack_wait(&self) -> Option<Duration> {
        self.ack_wait_ms.map(Duration::from_millis)
    }
}

/// Broker options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Logical service name stamped on every envelope
    pub name: String,

    /// Instance identifier stamped on every envelope
    pub id: String,

    /// Queue group and durable-name prefix. Defaults to `name`.
    pub queue_name: Option<String>,

    /// Reject messages failing their schema. When off, failures are only logged.
    pub schema_validation: bool,

    /// Default round-trip window of `request()`
    pub request_timeout_ms: u64,

    pub consumer: ConsumerDefaults,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            name: format!("courier-{}", &suffix[..8]),
            id: Uuid::new_v4().to_string(),
            queue_name: None,
            schema_validation: true,
            request_timeout_ms: 1000,
            consumer: ConsumerDefaults::default(),
        }
    }
}

impl BrokerOptions {
    /// Create options from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COURIER_SERVICE_NAME`: Service name (default: `courier-<8 hex>`)
    /// - `COURIER_INSTANCE_ID`: Instance identifier (default: random UUID)
    /// - `COURIER_QUEUE_NAME`: Queue group (default: service name)
    /// - `COURIER_SCHEMA_VALIDATION`: Enforce schemas (default: true)
    /// - `COURIER_REQUEST_TIMEOUT_MS`: Request timeout (default: 1000)
    /// - `COURIER_CONSUMER_BATCH`: Pull batch size (default: 20)
    /// - `COURIER_CONSUMER_EXPIRES_MS`: Pull expiry (default: 5000)
    /// - `COURIER_CONSUMER_ACK_WAIT_MS`: Redelivery delay (default: bus default)
    /// - `COURIER_CONSUMER_MAX_DELIVER`: Delivery attempts (default: unlimited)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            name: env::var("COURIER_SERVICE_NAME").unwrap_or(defaults.name),
            id: env::var("COURIER_INSTANCE_ID").unwrap_or(defaults.id),
            queue_name: env::var("COURIER_QUEUE_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            schema_validation: env::var("COURIER_SCHEMA_VALIDATION")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.schema_validation),
            request_timeout_ms: parse_env("COURIER_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            consumer: ConsumerDefaults {
                batch: parse_env("COURIER_CONSUMER_BATCH").unwrap_or(defaults.consumer.batch),
                expires_ms: parse_env("COURIER_CONSUMER_EXPIRES_MS")
                    .unwrap_or(defaults.consumer.expires_ms),
                ack_wait_ms: parse_env("COURIER_CONSUMER_ACK_WAIT_MS"),
                max_deliver: parse_env("COURIER_CONSUMER_MAX_DELIVER"),
            },
        }
    }

    /// Queue group shared by all instances of this service.
    pub fn queue_name(&self) -> &str {
        self.queue_name.as_deref().unwrap_or(&self.name)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyIdentity("name"));
        }
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyIdentity("id"));
        }
        if self.queue_name().trim().is_empty() {
            return Err(ConfigError::EmptyIdentity("queue_name"));
        }

        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout_ms cannot be 0".into(),
            ));
        }

        if self.consumer.batch == 0 {
            return Err(ConfigError::InvalidConsumer("batch cannot be 0".into()));
        }
        if self.consumer.expires_ms == 0 {
            return Err(ConfigError::InvalidConsumer("expires_ms cannot be 0".into()));
        }
        if self.consumer.ack_wait_ms == Some(0) {
            return Err(ConfigError::InvalidConsumer("ack_wait_ms cannot be 0".into()));
        }
        if self.consumer.max_deliver == Some(0) {
            return Err(ConfigError::InvalidConsumer("max_deliver cannot be 0".into()));
        }

        Ok(())
    }

    /// Validate and build the shared configuration with default capabilities.
    pub fn resolve(self) -> Result<Arc<BrokerConfig>, ConfigError> {
        BrokerConfig::new(self).map(Arc::new)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A service identity field is empty
    #[error("{0} cannot be empty")]
    EmptyIdentity(&'static str),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid durable consumer parameter
    #[error("invalid consumer option: {0}")]
    InvalidConsumer(String),
}

/// Immutable configuration shared by all managers of one broker.
pub struct BrokerConfig {
    options: BrokerOptions,
    instance: InstanceId,
    codec: Arc<dyn Codec>,
    tracer: Tracer,
    logger: Logger,
    validator: Validator,
}

impl BrokerConfig {
    /// Validate `options` and attach the default capabilities: JSON codec and
    /// a tracer and logger tagged with the service identity.
    pub fn new(options: BrokerOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        Ok(Self {
            instance: InstanceId::from(options.id.as_str()),
            codec: Arc::new(JsonCodec),
            tracer: Tracer::new(options.name.as_str(), options.id.as_str()),
            logger: Logger::new(options.name.as_str(), options.id.as_str()),
            validator: Validator::new(options.schema_validation),
            options,
        })
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn queue_name(&self) -> &str {
        self.options.queue_name()
    }

    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn request_timeout(&self) -> Duration {
        self.options.request_timeout()
    }

    pub fn consumer(&self) -> &ConsumerDefaults {
        &self.options.consumer
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("options", &self.options)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}
