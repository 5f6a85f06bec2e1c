//! # Bus Messages
//!
//! Raw messages as the bus sees them: a subject, an optional reply subject,
//! string headers and opaque payload bytes. Subject syntax follows the
//! dot-separated token convention with `*` (one token) and `>` (one or more
//! trailing tokens) wildcards on the subscribing side.

use std::collections::BTreeMap;

/// Transport metadata carried next to the payload.
pub type Headers = BTreeMap<String, String>;

/// A message in transit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    /// Where a responder should send its answer.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Whether `subject` is a concrete, publishable subject.
#[must_use]
pub fn is_valid_subject(subject: &str) -> bool {
    is_valid_pattern(subject) && !subject.split('.').any(|t| t == "*" || t == ">")
}

/// Whether `pattern` is a valid subscription subject (wildcards allowed).
#[must_use]
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() || pattern.chars().any(char::is_whitespace) {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| {
        !token.is_empty() && (*token != ">" || i == last)
    })
}

/// Match a concrete subject against a subscription pattern.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
