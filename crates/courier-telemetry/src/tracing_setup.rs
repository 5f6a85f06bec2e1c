//! OpenTelemetry tracing setup.
//!
//! Installs the global subscriber: env filter, the OpenTelemetry bridge and
//! a console layer (pretty or JSON). Spans are exported over OTLP/gRPC when an
//! endpoint is configured; otherwise they still get real trace and span ids so
//! context propagation between services keeps working.

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    runtime,
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Guard that shuts down the tracer provider on drop.
pub struct TracingGuard {
    provider: opentelemetry_sdk::trace::TracerProvider,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("Error shutting down tracer provider: {:?}", e);
        }
    }
}

fn trace_config(config: &TelemetryConfig) -> trace::Config {
    trace::Config::default()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", config.service_name.clone()),
            KeyValue::new("service.instance.id", config.instance_id.clone()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("deployment.environment", config.environment.clone()),
        ]))
}

fn build_provider(
    config: &TelemetryConfig,
) -> Result<opentelemetry_sdk::trace::TracerProvider, TelemetryError> {
    match &config.otlp_endpoint {
        Some(endpoint) => {
            let otlp_exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint);

            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(otlp_exporter)
                .with_trace_config(trace_config(config))
                .install_batch(runtime::Tokio)
                .map_err(|e| TelemetryError::TracerInit(e.to_string()))
        }
        None => Ok(opentelemetry_sdk::trace::TracerProvider::builder()
            .with_config(trace_config(config))
            .build()),
    }
}

/// Initialize tracing: global subscriber plus W3C propagator.
pub async fn init_tracing(config: &TelemetryConfig) -> Result<TracingGuard, TelemetryError> {
    let provider = build_provider(config)?;

    let tracer = provider.tracer(config.service_name.clone());
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    // JSON output for containers/production, pretty output for development
    let json_layer = (config.console_output && config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let pretty_layer = (config.console_output && !config.json_logs).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(true)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    tracing::info!(
        service = %config.service_name,
        instance = %config.instance_id,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        "OpenTelemetry tracing initialized"
    );

    Ok(TracingGuard { provider })
}

/// Thread-local tracing installed by [`scoped_tracing`].
pub struct ScopedTracing {
    _guard: tracing::subscriber::DefaultGuard,
    _provider: opentelemetry_sdk::trace::TracerProvider,
}

/// Install an OpenTelemetry-bridged subscriber for the current thread only.
///
/// Nothing is exported. Meant for tests and tools that need real span
/// identities without touching the global subscriber.
pub fn scoped_tracing(service_name: &str) -> ScopedTracing {
    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    let tracer = provider.tracer(service_name.to_string());
    let subscriber =
        tracing_subscriber::registry().with(tracing_opentelemetry::layer().with_tracer(tracer));

    ScopedTracing {
        _guard: tracing::subscriber::set_default(subscriber),
        _provider: provider,
    }
}
