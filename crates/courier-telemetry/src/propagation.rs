//! W3C trace-context propagation over message headers.

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use shared_bus::Headers;
use shared_types::PropagatedContext;

use crate::context::RemoteParent;

/// `traceparent` header name.
pub const TRACEPARENT: &str = "traceparent";
/// `tracestate` header name.
pub const TRACESTATE: &str = "tracestate";

struct HeaderInjector<'a>(&'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

struct HeaderExtractor<'a>(&'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Write `context`'s span into `traceparent`/`tracestate`.
pub fn inject_headers(context: &Context, headers: &mut Headers) {
    TraceContextPropagator::new().inject_context(context, &mut HeaderInjector(headers));
}

/// Read a parent from `traceparent`/`tracestate`.
pub fn extract_headers(headers: &Headers) -> Option<RemoteParent> {
    let context = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
    RemoteParent::from_context(context)
}

/// Resolve the parent of a received message.
///
/// The envelope's `traceContext` wins when valid; headers are the fallback.
/// `None` means the receiving span is a root.
pub fn extract_parent(
    envelope_context: Option<&PropagatedContext>,
    headers: &Headers,
) -> Option<RemoteParent> {
    envelope_context
        .and_then(RemoteParent::from_propagated)
        .or_else(|| extract_headers(headers))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn envelope_context() -> PropagatedContext {
        PropagatedContext {
            trace_id: "4bf92f3577b34da6a3ce929d0e0e4736".to_string(),
            span_id: "00f067aa0ba902b7".to_string(),
            trace_flags: 1,
            trace_state: None,
        }
    }

    #[test]
    fn test_inject_extract_roundtrip() {
        let parent = RemoteParent::from_propagated(&envelope_context()).unwrap();
        let mut headers = Headers::new();
        inject_headers(parent.context(), &mut headers);

        assert_eq!(
            headers.get(TRACEPARENT).map(String::as_str),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
        let back = extract_headers(&headers).unwrap();
        assert_eq!(back.to_propagated(), Some(envelope_context()));
    }

    #[test]
    fn test_envelope_context_wins() {
        let mut headers = Headers::new();
        headers.insert(TRACEPARENT.to_string(), HEADER.to_string());

        let parent = extract_parent(Some(&envelope_context()), &headers).unwrap();
        assert_eq!(parent.to_propagated().unwrap().trace_id, envelope_context().trace_id);
    }

    #[test]
    fn test_headers_are_fallback() {
        let mut headers = Headers::new();
        headers.insert(TRACEPARENT.to_string(), HEADER.to_string());

        let parent = extract_parent(Some(&PropagatedContext::empty()), &headers).unwrap();
        assert_eq!(
            parent.to_propagated().unwrap().trace_id,
            "0af7651916cd43dd8448eb211c80319c"
        );
    }

    #[test]
    fn test_no_context_means_root() {
        assert!(extract_parent(None, &Headers::new()).is_none());

        let mut headers = Headers::new();
        headers.insert(TRACEPARENT.to_string(), "garbage".to_string());
        assert!(extract_parent(None, &headers).is_none());
    }
}
