//! `tracing`-backed message trace.

use tracing::trace;

use crate::domain::Message;
use crate::ports::MessageTrace;

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMessageTrace;

impl MessageTrace for TracingMessageTrace {
    fn message_arrived(&self, consumer_tag: &str, message: &Message) {
        trace!(
            consumer_tag,
            action = message.action(),
            origin = ?message.origin(),
            correlation_id = ?message.correlation_id().map(|c| c.to_string()),
            body_len = message.body().len(),
            "Message arrived"
        );
    }

    fn message_sent(&self, message: &Message) {
        trace!(
            action = message.action(),
            routing_key = message.routing_key(),
            correlation_id = ?message.correlation_id().map(|c| c.to_string()),
            reply_to = ?message.reply_to(),
            body_len = message.body().len(),
            "Message sent"
        );
    }
}
