//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber. Every bus component logs with
//! consistent structured fields so lines can be filtered per channel:
//! - `channel`: channel name (`out:<address>` / `in:<queue>`)
//! - `state`: channel state after a transition
//! - `action`: message action name
//! - `correlation_id`: RPC correlation id
//! - `consumer_tag`: subscriber consumer tag

use tracing_subscriber::EnvFilter;

use crate::{TelemetryConfig, TelemetryError};

/// Install the global fmt subscriber described by `config`.
///
/// Fails with [`TelemetryError::LoggingInit`] when the filter directive is
/// invalid or a global subscriber is already installed.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(&config.log_level)
        .map_err(|e| TelemetryError::Config(format!("invalid log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_logs {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.compact().try_init()
    };

    installed.map_err(|e| TelemetryError::LoggingInit(e.to_string()))?;

    tracing::debug!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Structured logging initialised"
    );

    Ok(())
}

/// Log a channel lifecycle event with standard fields.
#[macro_export]
macro_rules! log_channel_event {
    ($level:ident, $channel:expr, $state:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            channel = %$channel,
            state = %$state,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log a message-related event with standard fields.
#[macro_export]
macro_rules! log_message_event {
    ($level:ident, $action:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            action = %$action,
            $($($field)*,)?
            $msg
        )
    };
}
