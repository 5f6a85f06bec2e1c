//! Prometheus metrics for the messaging patterns.
//!
//! All metrics follow the naming convention: `courier_<area>_<metric>_<unit>`
//!
//! Label values:
//! - `pattern`: pubsub / request_reply / consumer
//! - `direction`: inbound / outbound
//! - `stage`: envelope / payload
//! - `outcome`: ack / nak / term (settlements), success / error / timeout / failed (requests)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Messages handed to the bus
    pub static ref MESSAGES_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("courier_messages_published_total", "Messages handed to the bus"),
        &["pattern", "subject"]
    ).expect("metric creation failed");

    /// Messages taken from the bus
    pub static ref MESSAGES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("courier_messages_received_total", "Messages received from the bus"),
        &["pattern", "subject"]
    ).expect("metric creation failed");

    /// Schema validation failures
    pub static ref VALIDATION_FAILURES: CounterVec = CounterVec::new(
        Opts::new("courier_validation_failures_total", "Messages rejected by a schema"),
        &["direction", "stage"]
    ).expect("metric creation failed");

    /// Handler failures
    pub static ref HANDLER_ERRORS: CounterVec = CounterVec::new(
        Opts::new("courier_handler_errors_total", "Application handlers that returned an error"),
        &["pattern"]
    ).expect("metric creation failed");

    /// Request round-trip duration
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "courier_request_duration_seconds",
            "Time from sending a request to receiving its reply"
        ).buckets(exponential_buckets(0.0005, 2.0, 14).expect("bucket layout")),
        &["subject", "outcome"]
    ).expect("metric creation failed");

    /// Pull requests issued by durable consumers
    pub static ref PULL_REQUESTS: CounterVec = CounterVec::new(
        Opts::new("courier_consumer_pull_requests_total", "Pull requests issued"),
        &["durable"]
    ).expect("metric creation failed");

    /// Settled stream messages
    pub static ref STREAM_SETTLEMENTS: CounterVec = CounterVec::new(
        Opts::new("courier_consumer_settlements_total", "Stream messages acked, naked or terminated"),
        &["durable", "outcome"]
    ).expect("metric creation failed");
}

/// Handle returned once metrics are registered.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    _registered: (),
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(VALIDATION_FAILURES.clone()),
        Box::new(HANDLER_ERRORS.clone()),
        Box::new(REQUEST_DURATION.clone()),
        Box::new(PULL_REQUESTS.clone()),
        Box::new(STREAM_SETTLEMENTS.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle { _registered: () })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard observing a request duration on drop.
pub struct RequestTimer {
    subject: String,
    outcome: &'static str,
    start: std::time::Instant,
}

impl RequestTimer {
    pub fn start(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            outcome: "failed",
            start: std::time::Instant::now(),
        }
    }

    /// Label the observation with the reply type. Unlabelled round trips count as `failed`.
    pub fn set_outcome(&mut self, outcome: &'static str) {
        self.outcome = outcome;
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        REQUEST_DURATION
            .with_label_values(&[self.subject.as_str(), self.outcome])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Increment a labelled counter.
#[macro_export]
macro_rules! metric_inc {
    ($metric:expr, $($label:expr),+ $(,)?) => {
        $metric.with_label_values(&[$($label),+]).inc()
    };
}
