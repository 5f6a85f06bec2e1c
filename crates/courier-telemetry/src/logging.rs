//! Structured logging handle.
//!
//! Every log line carries the same identity fields so lines from many
//! instances can be told apart after aggregation:
//! - `service`: logical producer name
//! - `instance`: producer instance identifier
//! - `subject`: subject being handled, when bound
//!
//! The JSON formatting itself is done by the `tracing-subscriber` layer
//! installed in `tracing_setup`.

use std::sync::Arc;

use serde::Serialize;

/// Logger handed to message handlers, identity fields pre-bound.
#[derive(Debug, Clone)]
pub struct Logger {
    service: Arc<str>,
    instance: Arc<str>,
    subject: Option<Arc<str>>,
}

impl Logger {
    pub fn new(service: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            service: Arc::from(service.into()),
            instance: Arc::from(instance.into()),
            subject: None,
        }
    }

    /// Same identity, bound to `subject`.
    #[must_use]
    pub fn for_subject(&self, subject: &str) -> Self {
        Self {
            service: self.service.clone(),
            instance: self.instance.clone(),
            subject: Some(Arc::from(subject)),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(
            service = %self.service,
            instance = %self.instance,
            subject = self.subject().unwrap_or(""),
            "{}",
            message
        );
    }

    pub fn info(&self, message: &str) {
        tracing::info!(
            service = %self.service,
            instance = %self.instance,
            subject = self.subject().unwrap_or(""),
            "{}",
            message
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(
            service = %self.service,
            instance = %self.instance,
            subject = self.subject().unwrap_or(""),
            "{}",
            message
        );
    }

    pub fn error(&self, message: &str) {
        tracing::error!(
            service = %self.service,
            instance = %self.instance,
            subject = self.subject().unwrap_or(""),
            "{}",
            message
        );
    }

    /// Info line with a serializable value attached as a JSON `data` field.
    pub fn info_with<T: Serialize>(&self, message: &str, data: &T) {
        let data = serde_json::to_string(data).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        tracing::info!(
            service = %self.service,
            instance = %self.instance,
            subject = self.subject().unwrap_or(""),
            data = %data,
            "{}",
            message
        );
    }
}

/// Emit a log line with a logger's identity fields.
///
/// ```rust,ignore
/// log_message!(warn, logger, "Handler returned without replying", request_id = %id);
/// ```
#[macro_export]
macro_rules! log_message {
    ($level:ident, $logger:expr, $msg:literal $(, $($field:tt)*)?) => {
        tracing::$level!(
            service = $logger.service(),
            instance = $logger.instance(),
            subject = $logger.subject().unwrap_or(""),
            $($($field)*,)?
            $msg
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_subject_keeps_identity() {
        let logger = Logger::new("billing", "b-1");
        let bound = logger.for_subject("invoices.paid");
        assert_eq!(bound.service(), "billing");
        assert_eq!(bound.instance(), "b-1");
        assert_eq!(bound.subject(), Some("invoices.paid"));
        assert_eq!(logger.subject(), None);
    }

    #[test]
    fn test_logging_without_subscriber_is_harmless() {
        let logger = Logger::new("billing", "b-1").for_subject("invoices.paid");
        logger.info("hello");
        logger.info_with("payload", &serde_json::json!({"n": 1}));
        crate::log_message!(debug, logger, "with fields", attempt = 2);
    }
}
