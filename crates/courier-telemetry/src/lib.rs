//! # Courier Telemetry
//!
//! Observability for the messaging layer.
//!
//! ## Components
//!
//! - **Tracer / MessageSpan**: one span per produce or receive operation,
//!   with OpenTelemetry name, kind and status
//! - **Propagation**: parent span identity carried in the envelope
//!   (`traceContext`) and in W3C `traceparent` headers
//! - **Logger**: structured log lines with service / instance / subject
//! - **Metrics**: Prometheus counters and histograms
//!
//! ## Usage
//!
//! ```rust,ignore
//! use courier_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).await.expect("Failed to init telemetry");
//!
//!     // Spans, logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP/gRPC collector, no export when unset |
//! | `COURIER_SERVICE_NAME` | `courier` | Service name in traces and logs |
//! | `COURIER_INSTANCE_ID` | `0` | Instance identifier |
//! | `COURIER_LOG_LEVEL` | `info` | Log level filter |
//! | `COURIER_JSON_LOGS` | `false` | JSON log lines |

mod config;
mod context;
mod logging;
pub mod metrics;
mod propagation;
mod tracer;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use context::{propagated_from, span_context_from, RemoteParent};
pub use logging::Logger;
pub use metrics::{encode_metrics, register_metrics, MetricsHandle, RequestTimer};
pub use propagation::{extract_headers, extract_parent, inject_headers, TRACEPARENT, TRACESTATE};
pub use tracer::{MessageSpan, MessagingAction, SpanAttributes, Tracer};
pub use tracing_setup::{scoped_tracing, ScopedTracing, TracingGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize metrics, the global subscriber and span export.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub async fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = register_metrics()?;
    let tracing = tracing_setup::init_tracing(&config).await?;

    Ok(TelemetryGuard {
        _tracing: tracing,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
