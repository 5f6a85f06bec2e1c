//! Serializable parent-span reference carried inside the envelope.
//!
//! When a message is produced inside a span, the span's identity is written
//! into the envelope's `traceContext` field. The consumer reads it back and
//! starts its own span as a child of it. The telemetry crate converts this
//! type to and from OpenTelemetry span contexts; this crate only knows the
//! wire shape.

use serde::{Deserialize, Serialize};

/// Trace context that can be serialized and sent across process boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagatedContext {
    /// Trace ID (32 hex characters)
    pub trace_id: String,
    /// Parent span ID (16 hex characters)
    pub span_id: String,
    /// Trace flags (sampled, etc.)
    #[serde(default)]
    pub trace_flags: u8,
    /// Optional trace state (vendor-specific data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
}

impl PropagatedContext {
    const INVALID_TRACE_ID: &'static str = "00000000000000000000000000000000";
    const INVALID_SPAN_ID: &'static str = "0000000000000000";

    /// Create an empty context (no parent trace)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            trace_id: Self::INVALID_TRACE_ID.to_string(),
            span_id: Self::INVALID_SPAN_ID.to_string(),
            trace_flags: 0,
            trace_state: None,
        }
    }

    /// Check if this context is valid (has a real trace and a real parent span)
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_hex_id(&self.trace_id, 32) && is_hex_id(&self.span_id, 16)
    }

    /// Whether the sampled flag is set.
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        self.trace_flags & 0x01 == 0x01
    }

    /// Render as a W3C `traceparent` header value.
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.trace_flags)
    }

    /// Parse a W3C `traceparent` header value (`version-trace_id-parent_id-flags`).
    ///
    /// Returns `None` for malformed values and for all-zero identifiers.
    #[must_use]
    pub fn from_traceparent(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 || parts[0].len() != 2 {
            return None;
        }

        let trace_flags = u8::from_str_radix(parts[3], 16).ok()?;
        let context = Self {
            trace_id: parts[1].to_ascii_lowercase(),
            span_id: parts[2].to_ascii_lowercase(),
            trace_flags,
            trace_state: None,
        };

        context.is_valid().then_some(context)
    }
}

impl Default for PropagatedContext {
    fn default() -> Self {
        Self::empty()
    }
}

fn is_hex_id(id: &str, len: usize) -> bool {
    id.len() == len
        && id.chars().all(|c| c.is_ascii_hexdigit())
        && !id.chars().all(|c| c == '0')
}
