//! # Message Filter
//!
//! Decides whether a received message reaches a handler. Two rules apply,
//! in order:
//!
//! 1. Self-publish suppression: a message stamped with this bus's id is
//!    dropped unless `receive_self_publish` is set.
//! 2. Routing predicate: if configured, the message must match it.

use std::fmt;
use std::sync::Arc;

use super::correlation::BusId;
use super::message::Message;

/// Caller-supplied routing check.
pub type RoutingFn = dyn Fn(&Message) -> bool + Send + Sync;

/// Routing predicate applied after self-publish suppression.
#[derive(Clone)]
pub enum RoutingPredicate {
    /// AMQP topic pattern matched against the message routing key.
    Topic(String),
    /// Arbitrary predicate over the whole message.
    Custom(Arc<RoutingFn>),
}

impl RoutingPredicate {
    pub fn topic(pattern: impl Into<String>) -> Self {
        Self::Topic(pattern.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Topic(pattern) => topic_matches(pattern, message.routing_key()),
            Self::Custom(f) => f(message),
        }
    }
}

impl fmt::Debug for RoutingPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(pattern) => f.debug_tuple("Topic").field(pattern).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Outcome of [`MessageFilter::accepts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    SelfPublished,
    RoutingMismatch,
}

impl FilterDecision {
    pub fn is_accepted(self) -> bool {
        self == Self::Accept
    }

    /// Label used for the filtered-messages metric.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Accept => "accepted",
            Self::SelfPublished => "self_publish",
            Self::RoutingMismatch => "routing",
        }
    }
}

/// Per-subscriber message filter.
#[derive(Debug, Clone)]
pub struct MessageFilter {
    bus_id: BusId,
    receive_self_publish: bool,
    routing: Option<RoutingPredicate>,
}

impl MessageFilter {
    pub fn new(
        bus_id: BusId,
        receive_self_publish: bool,
        routing: Option<RoutingPredicate>,
    ) -> Self {
        Self {
            bus_id,
            receive_self_publish,
            routing,
        }
    }

    pub fn accepts(&self, message: &Message) -> FilterDecision {
        if !self.receive_self_publish && message.origin() == Some(self.bus_id.as_str()) {
            return FilterDecision::SelfPublished;
        }

        match &self.routing {
            Some(predicate) if !predicate.matches(message) => FilterDecision::RoutingMismatch,
            _ => FilterDecision::Accept,
        }
    }
}

/// AMQP topic matching.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) if word == "*" || word == head => match_words(rest, tail),
            _ => false,
        },
    }
}
