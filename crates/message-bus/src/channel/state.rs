//! Channel state machine.
//!
//! ```text
//!   Created ──open──► Opening ──ok──► Opened ──close──► Closing ──► Closed
//!      │                 │               │                 │          ▲
//!      │                 └──── error ────┴──► Faulted ◄────┘          │
//!      │                                         │                    │
//!      └─────────────── abort (any state but Closed) ─────────────────┘
//! ```

use std::fmt;
use tokio::sync::{broadcast, watch};
use bus_telemetry::log_channel_event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl ChannelState {
    pub fn is_closed(self) -> bool {
        self == ChannelState::Closed
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: ChannelState) -> bool {
        use ChannelState::*;
        match (self, to) {
            (Created, Opening) | (Opening, Opened) | (Opened, Closing) | (Closing, Closed) => true,
            (Opening | Opened | Closing, Faulted) => true,
            // abort
            (from, Closed) => from != Closed,
            _ => false,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Created => "Created",
            ChannelState::Opening => "Opening",
            ChannelState::Opened => "Opened",
            ChannelState::Closing => "Closing",
            ChannelState::Closed => "Closed",
            ChannelState::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// One observed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ChannelState,
    pub to: ChannelState,
}

const TRANSITION_CAPACITY: usize = 16;

/// Current state plus notifications.
///
/// The `watch` value is the single source of truth; every transition is a
/// compare-and-set on it, so concurrent open/close/abort calls cannot both
/// win the same edge.
pub(crate) struct StateMachine {
    channel: String,
    current: watch::Sender<ChannelState>,
    transitions: broadcast::Sender<StateTransition>,
}

impl StateMachine {
    pub(crate) fn new(channel: impl Into<String>) -> Self {
        let (current, _) = watch::channel(ChannelState::Created);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            channel: channel.into(),
            current,
            transitions,
        }
    }

    pub(crate) fn current(&self) -> ChannelState {
        *self.current.borrow()
    }

    /// Move to `to` if the current state satisfies `allowed` and the edge
    /// exists. Returns the previous state, or the current one on refusal.
    pub(crate) fn transition(
        &self,
        to: ChannelState,
        allowed: impl FnOnce(ChannelState) -> bool,
    ) -> Result<ChannelState, ChannelState> {
        let mut outcome = Err(ChannelState::Created);
        self.current.send_if_modified(|state| {
            let from = *state;
            if allowed(from) && from.can_transition_to(to) {
                *state = to;
                outcome = Ok(from);
                // ignore "no receivers"
                let _ = self.transitions.send(StateTransition { from, to });
                true
            } else {
                outcome = Err(from);
                false
            }
        });

        if let Ok(from) = outcome {
            log_channel_event!(debug, self.channel, to, "Channel state changed", %from);
        }
        outcome
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.transitions.subscribe()
    }

    /// Resolve once the state equals `target`.
    pub(crate) async fn reached(&self, target: ChannelState) {
        let mut rx = self.current.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }
}
