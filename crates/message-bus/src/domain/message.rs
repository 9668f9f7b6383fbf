//! # Message Envelope
//!
//! The unit that flows through the bus. A message is immutable once built:
//! every `with_*` method consumes the value and returns a new one.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::correlation::{BusId, CorrelationId};

/// Header names the bus itself reads or writes.
pub mod headers {
    /// Origin bus instance of the message.
    pub const BUS_ID: &str = "BusId";
    /// Routing key used by the transport; defaults to the action name.
    pub const ROUTING_KEY: &str = "RoutingKey";
    /// Content type of the body, selects the body serializer on receive.
    pub const CONTENT_TYPE: &str = "ContentType";
    /// Present on replies produced by a failed handler; value is the error text.
    pub const RPC_ERROR: &str = "RpcError";

    /// All headers a caller may not set through publish options.
    pub const RESERVED: [&str; 3] = [BUS_ID, CONTENT_TYPE, RPC_ERROR];
}

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    action: String,
    headers: BTreeMap<String, String>,
    correlation_id: Option<CorrelationId>,
    reply_to: Option<String>,
    body: Bytes,
}

impl Message {
    /// Create a message with an action name and an already serialized body.
    pub fn new(action: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            action: action.into(),
            headers: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            body: body.into(),
        }
    }

    /// Set (or replace) a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Stamp the origin bus.
    #[must_use]
    pub fn with_origin(self, bus_id: &BusId) -> Self {
        self.with_header(headers::BUS_ID, bus_id.as_str())
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// Reply address, if the sender expects a reply.
    ///
    /// An empty string counts as "no reply expected".
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref().filter(|r| !r.is_empty())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Bus instance that published this message.
    pub fn origin(&self) -> Option<&str> {
        self.header(headers::BUS_ID)
    }

    /// Routing key: the explicit header, else the action name.
    pub fn routing_key(&self) -> &str {
        self.header(headers::ROUTING_KEY).unwrap_or(&self.action)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(headers::CONTENT_TYPE)
    }

    /// Error text carried by an error reply.
    pub fn rpc_error(&self) -> Option<&str> {
        self.header(headers::RPC_ERROR)
    }
}
