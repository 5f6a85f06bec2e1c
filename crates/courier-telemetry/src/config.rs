//! Telemetry configuration from environment variables.

use std::env;

use serde::{Deserialize, Serialize};

/// Configuration for logging, tracing export and metrics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name for traces and logs
    pub service_name: String,

    /// Instance identifier reported next to the service name
    pub instance_id: String,

    /// OTLP/gRPC collector endpoint. No export when unset.
    pub otlp_endpoint: Option<String>,

    /// Log level filter (trace, debug, info, warn, error or a full directive)
    pub log_level: String,

    /// Whether to enable console output (for development)
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Deployment environment (dev, staging, production)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "courier".to_string(),
            instance_id: "0".to_string(),
            otlp_endpoint: None,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            environment: "dev".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COURIER_SERVICE_NAME` or `OTEL_SERVICE_NAME`: Service name (default: courier)
    /// - `COURIER_INSTANCE_ID`: Instance identifier (default: 0)
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: none, no export)
    /// - `COURIER_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `COURIER_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `COURIER_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    /// - `COURIER_ENVIRONMENT`: Deployment environment (default: dev)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();
        let defaults = Self::default();

        Self {
            service_name: env::var("COURIER_SERVICE_NAME")
                .or_else(|_| env::var("OTEL_SERVICE_NAME"))
                .unwrap_or(defaults.service_name),

            instance_id: env::var("COURIER_INSTANCE_ID").unwrap_or(defaults.instance_id),

            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty()),

            log_level: env::var("COURIER_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            console_output: env::var("COURIER_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("COURIER_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),

            environment: env::var("COURIER_ENVIRONMENT").unwrap_or(defaults.environment),
        }
    }

    /// Configuration for one named service instance.
    pub fn for_service(service_name: &str, instance_id: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = service_name.to_string();
        config.instance_id = instance_id.to_string();
        config
    }

    /// Whether spans are exported to a collector.
    pub fn exports_traces(&self) -> bool {
        self.otlp_endpoint.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "courier");
        assert_eq!(config.log_level, "info");
        assert!(!config.exports_traces());
    }

    #[test]
    fn test_for_service() {
        let config = TelemetryConfig::for_service("billing", "b-1");
        assert_eq!(config.service_name, "billing");
        assert_eq!(config.instance_id, "b-1");
    }

    #[test]
    fn test_partial_file_config() {
        let raw = r#"{"service_name":"orders","otlp_endpoint":"http://collector:4317"}"#;
        let config: TelemetryConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.service_name, "orders");
        assert!(config.exports_traces());
        assert!(config.console_output);
    }
}
