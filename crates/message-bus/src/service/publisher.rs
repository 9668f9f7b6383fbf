//! # Publisher
//!
//! Validates and sends one message per call. No retry: a failed publish is
//! returned to the caller, who owns the retry policy.

use bus_telemetry::log_message_event;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelState, OutputChannel};
use crate::codec::SerializerRegistry;
use crate::domain::{headers, BusError, BusId, Message};
use crate::ports::MessageTrace;

/// Per-call publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    headers: BTreeMap<String, String>,
    routing_key: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application header. The bus headers (`BusId`, `ContentType`,
    /// `RpcError`) are rejected at publish time.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }
}

pub struct Publisher {
    bus_id: BusId,
    channel: Arc<OutputChannel>,
    serializers: SerializerRegistry,
    routing_key: Option<String>,
    trace: Option<Arc<dyn MessageTrace>>,
    close_timeout: Duration,
}

impl Publisher {
    pub(crate) fn new(
        bus_id: BusId,
        channel: Arc<OutputChannel>,
        serializers: SerializerRegistry,
        routing_key: Option<String>,
        trace: Option<Arc<dyn MessageTrace>>,
        close_timeout: Duration,
    ) -> Self {
        Self {
            bus_id,
            channel,
            serializers,
            routing_key,
            trace,
            close_timeout,
        }
    }

    pub fn channel(&self) -> &Arc<OutputChannel> {
        &self.channel
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub async fn publish<T>(&self, action: &str, value: &T) -> Result<(), BusError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with(action, value, PublishOptions::default())
            .await
    }

    pub async fn publish_with<T>(
        &self,
        action: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<(), BusError>
    where
        T: Serialize + ?Sized,
    {
        let message = self.build_message(action, value, options)?;
        self.send(message).await
    }

    /// Build a stamped message without sending it.
    pub(crate) fn build_message<T>(
        &self,
        action: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<Message, BusError>
    where
        T: Serialize + ?Sized,
    {
        if action.trim().is_empty() {
            return Err(BusError::InvalidMessage("action cannot be empty".into()));
        }
        for key in options.headers.keys() {
            if key.is_empty() {
                return Err(BusError::InvalidMessage("header name cannot be empty".into()));
            }
            if headers::RESERVED.contains(&key.as_str()) {
                return Err(BusError::InvalidMessage(format!(
                    "header {key} is reserved by the bus"
                )));
            }
        }

        let body = self.serializers.to_body(value)?;
        let routing_key = options
            .routing_key
            .or_else(|| self.routing_key.clone())
            .unwrap_or_else(|| action.to_string());

        let mut message = Message::new(action, body)
            .with_header(headers::ROUTING_KEY, routing_key)
            .with_header(headers::CONTENT_TYPE, self.serializers.content_type());
        for (key, value) in options.headers {
            message = message.with_header(key, value);
        }
        Ok(message.with_origin(&self.bus_id))
    }

    /// Write a built message to the channel.
    pub(crate) async fn send(&self, message: Message) -> Result<(), BusError> {
        self.channel.send(&message).await?;
        bus_telemetry::metrics::MESSAGES_PUBLISHED.inc();
        if let Some(trace) = &self.trace {
            trace.message_sent(&message);
        }
        log_message_event!(
            debug,
            message.action(),
            "Message published",
            channel = self.channel.name(),
            routing_key = message.routing_key()
        );
        Ok(())
    }

    pub async fn close(&self) -> Result<(), BusError> {
        self.channel.close(self.close_timeout).await
    }

    pub fn close_blocking(&self) -> Result<(), BusError> {
        self.channel.close_blocking(self.close_timeout)
    }

    pub fn abort(&self) {
        self.channel.abort();
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("bus_id", &self.bus_id)
            .field("channel", &self.channel)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}
