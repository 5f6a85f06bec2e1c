//! # Broker Errors
//!
//! Every fallible broker operation returns [`BrokerError`]. Application
//! handlers return `anyhow::Result`; their failures are wrapped in
//! [`BrokerError::Handler`] before being recorded on the message span.

use std::time::Duration;

use shared_bus::BusError;
use shared_types::{RegistryError, SchemaError};
use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A message failed its envelope or payload schema.
    #[error(transparent)]
    SchemaValidation(#[from] SchemaError),

    /// No schema is registered for the subject in this pattern's registry.
    #[error("no schema registered for subject '{0}'")]
    UnknownSubject(String),

    /// A request arrived without a reply inbox.
    #[error("request on '{0}' carries no reply destination")]
    MissingReplyDestination(String),

    /// The application handler returned an error.
    #[error("handler failed: {0}")]
    Handler(anyhow::Error),

    /// No reply arrived within the round-trip window.
    #[error("no reply on '{subject}' within {timeout:?}")]
    RoundTripTimeout { subject: String, timeout: Duration },

    #[error(transparent)]
    Serialization(#[from] CodecError),

    /// The request was already answered.
    #[error("request on '{0}' was already answered")]
    AlreadyReplied(String),

    /// `consume()` was called twice for the same subject.
    #[error("subject '{0}' already has a durable consumer")]
    AlreadyConsuming(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<RegistryError> for BrokerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownSubject(subject) => Self::UnknownSubject(subject),
        }
    }
}

impl BrokerError {
    /// Whether the error means the message itself is unusable.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::SchemaValidation(_) | Self::Serialization(_))
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
