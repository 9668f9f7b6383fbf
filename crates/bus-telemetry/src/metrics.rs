//! Prometheus metrics for the message bus.
//!
//! All metrics follow the naming convention: `mb_<component>_<metric>_<unit>`
//!
//! Collectors are process-wide statics so the hot paths can increment them
//! without threading a handle through every component. They only show up in
//! the exposition output once [`register_metrics`] has run.

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};
use std::sync::Once;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH PATH
    // =========================================================================

    /// Frames written by publishers
    pub static ref MESSAGES_PUBLISHED: Counter = Counter::new(
        "mb_publisher_messages_published_total",
        "Total number of messages written to a channel by publishers"
    ).expect("metric creation failed");

    // =========================================================================
    // DISPATCH PATH
    // =========================================================================

    /// Messages pulled off input channels
    pub static ref MESSAGES_RECEIVED: Counter = Counter::new(
        "mb_dispatcher_messages_received_total",
        "Total number of messages received by subscription dispatchers"
    ).expect("metric creation failed");

    /// Messages dropped before reaching a handler
    pub static ref MESSAGES_FILTERED: CounterVec = CounterVec::new(
        Opts::new(
            "mb_dispatcher_messages_filtered_total",
            "Messages dropped by the message filter"
        ),
        &["reason"]  // self_publish, routing, no_handler
    ).expect("metric creation failed");

    /// Handler invocations that returned an error or panicked
    pub static ref HANDLER_FAILURES: Counter = Counter::new(
        "mb_dispatcher_handler_failures_total",
        "Total number of failed handler invocations"
    ).expect("metric creation failed");

    /// Messages negatively acknowledged and returned to their queue
    pub static ref MESSAGES_REQUEUED: Counter = Counter::new(
        "mb_dispatcher_messages_requeued_total",
        "Total number of messages requeued after a retryable failure"
    ).expect("metric creation failed");

    // =========================================================================
    // RPC
    // =========================================================================

    /// Requests issued through `send_and_wait`
    pub static ref RPC_REQUESTS: Counter = Counter::new(
        "mb_rpc_requests_total",
        "Total number of RPC requests issued"
    ).expect("metric creation failed");

    /// Requests that expired without a reply
    pub static ref RPC_TIMEOUTS: Counter = Counter::new(
        "mb_rpc_timeouts_total",
        "Total number of RPC requests that timed out"
    ).expect("metric creation failed");

    /// Requests currently waiting for a reply
    pub static ref RPC_PENDING: Gauge = Gauge::new(
        "mb_rpc_pending_requests",
        "Number of RPC requests waiting for a reply"
    ).expect("metric creation failed");

    /// Request to reply latency
    pub static ref RPC_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mb_rpc_round_trip_duration_seconds",
            "Time between publishing an RPC request and receiving its reply"
        ).buckets(exponential_buckets(0.0005, 2.0, 14).expect("valid buckets"))
    ).expect("metric creation failed");

    // =========================================================================
    // CHANNELS
    // =========================================================================

    /// Channels that moved to the Faulted state
    pub static ref CHANNEL_FAULTS: Counter = Counter::new(
        "mb_channel_faults_total",
        "Total number of channel faults caused by transport or framing errors"
    ).expect("metric creation failed");
}

static REGISTER: Once = Once::new();

/// Handle to the registered collectors.
#[derive(Debug, Clone, Copy)]
pub struct MetricsHandle {
    _private: (),
}

impl MetricsHandle {
    /// Render every registered collector in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}

/// Register all bus collectors with [`REGISTRY`].
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let mut outcome = Ok(());
    REGISTER.call_once(|| {
        outcome = register_all();
    });
    outcome.map(|()| MetricsHandle { _private: () })
}

fn register_all() -> Result<(), TelemetryError> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_PUBLISHED.clone()),
        Box::new(MESSAGES_RECEIVED.clone()),
        Box::new(MESSAGES_FILTERED.clone()),
        Box::new(HANDLER_FAILURES.clone()),
        Box::new(MESSAGES_REQUEUED.clone()),
        Box::new(RPC_REQUESTS.clone()),
        Box::new(RPC_TIMEOUTS.clone()),
        Box::new(RPC_PENDING.clone()),
        Box::new(RPC_LATENCY.clone()),
        Box::new(CHANNEL_FAULTS.clone()),
    ];

    for collector in collectors {
        REGISTRY
            .register(collector)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }
    Ok(())
}
