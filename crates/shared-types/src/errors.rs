//! # Error Types
//!
//! Errors produced by the validation engine.

use std::fmt;

use thiserror::Error;

/// Which stage of the validation chain rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    /// The base envelope shape (id, subject, date, service, instance, ...).
    Envelope,
    /// The subject-specific payload schema applied to `data`.
    Payload,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Envelope => f.write_str("envelope"),
            Self::Payload => f.write_str("payload"),
        }
    }
}

/// A message failed one of its registered schemas.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{stage} schema validation failed for subject '{subject}': {}", .violations.join("; "))]
pub struct SchemaError {
    /// Subject the message was validated for.
    pub subject: String,
    /// Stage that rejected it.
    pub stage: ValidationStage,
    /// Human-readable violations, one per failed check.
    pub violations: Vec<String>,
}

impl SchemaError {
    pub fn new(
        subject: impl Into<String>,
        stage: ValidationStage,
        violations: Vec<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            stage,
            violations,
        }
    }
}
