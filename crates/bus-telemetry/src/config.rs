//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for bus logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name attached to every log line
    pub service_name: String,

    /// Log level filter directive (e.g. `info`, `message_bus=debug`)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to register the Prometheus collectors
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "message-bus".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `MB_SERVICE_NAME`: Service name (default: message-bus)
    /// - `MB_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `MB_JSON_LOGS`: Enable JSON logs (default: false)
    /// - `MB_METRICS`: Register Prometheus collectors (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            service_name: env::var("MB_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: env::var("MB_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or(defaults.log_level),
            json_logs: env_flag("MB_JSON_LOGS").unwrap_or(defaults.json_logs),
            metrics_enabled: env_flag("MB_METRICS").unwrap_or(defaults.metrics_enabled),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
