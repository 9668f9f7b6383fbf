//! # Channels
//!
//! A channel owns one transport link in one direction. [`OutputChannel`]
//! sends frames, [`InputChannel`] receives them. Both share the lifecycle
//! implemented by [`ChannelCore`]:
//!
//! - `open(timeout)` at most once, `Created -> Opening -> Opened`, or
//!   `Faulted` on error or timeout.
//! - `close(timeout)` flushes in-flight sends, closes the link, and falls
//!   back to `abort` when the deadline passes.
//! - `abort()` is synchronous, idempotent, and cancels a pending open or
//!   close.
//!
//! Every async operation has a `*_blocking` twin driven on the runtime
//! handle captured at construction.

mod input;
mod output;
mod state;

pub use input::{InputChannel, ReceivedMessage};
pub use output::OutputChannel;
pub use state::{ChannelState, StateTransition};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use bus_telemetry::log_channel_event;
use tracing::{debug, warn};

use crate::domain::{BusError, TransportError};
use crate::ports::Link;
use state::StateMachine;

/// Lifecycle shared by both channel directions.
pub(crate) struct ChannelCore<L: ?Sized> {
    name: String,
    state: StateMachine,
    link: Mutex<Option<Arc<L>>>,
    runtime: Option<Handle>,
}

impl<L: Link + ?Sized> ChannelCore<L> {
    pub(crate) fn new(name: impl Into<String>, runtime: Option<Handle>) -> Self {
        let name = name.into();
        Self {
            state: StateMachine::new(name.clone()),
            name,
            link: Mutex::new(None),
            runtime,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.state.current()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.state.subscribe()
    }

    pub(crate) async fn closed(&self) {
        self.state.reached(ChannelState::Closed).await
    }

    /// Link of an opened channel.
    pub(crate) fn link_for(&self, operation: &'static str) -> Result<Arc<L>, BusError> {
        let state = self.state.current();
        if state != ChannelState::Opened {
            return Err(BusError::InvalidState { operation, state });
        }
        self.link
            .lock()
            .clone()
            .ok_or(BusError::InvalidState { operation, state })
    }

    pub(crate) fn ensure_opened(&self, operation: &'static str) -> Result<(), BusError> {
        match self.state.current() {
            ChannelState::Opened => Ok(()),
            state => Err(BusError::InvalidState { operation, state }),
        }
    }

    pub(crate) async fn open_with<Fut>(
        &self,
        timeout: Duration,
        connect: Fut,
    ) -> Result<(), BusError>
    where
        Fut: Future<Output = Result<Arc<L>, TransportError>>,
    {
        self.state
            .transition(ChannelState::Opening, |s| s == ChannelState::Created)
            .map_err(|state| BusError::InvalidState {
                operation: "open",
                state,
            })?;

        let outcome = tokio::select! {
            biased;
            _ = self.closed() => None,
            result = tokio::time::timeout(timeout, connect) => Some(result),
        };

        match outcome {
            None => Err(self.aborted()),
            Some(Ok(Ok(link))) => {
                *self.link.lock() = Some(link);
                if self
                    .state
                    .transition(ChannelState::Opened, |s| s == ChannelState::Opening)
                    .is_err()
                {
                    // abort raced the connect; it may have missed the link
                    if let Some(link) = self.link.lock().take() {
                        link.abort();
                    }
                    return Err(self.aborted());
                }
                Ok(())
            }
            Some(Ok(Err(e))) => {
                self.fault(&e.to_string());
                Err(e.into())
            }
            Some(Err(_elapsed)) => {
                self.fault("open timed out");
                Err(BusError::Timeout {
                    operation: "open",
                    after: timeout,
                })
            }
        }
    }

    /// Graceful close. `flush` resolves once in-flight work has drained.
    pub(crate) async fn close_with<Fut>(
        &self,
        timeout: Duration,
        flush: Fut,
    ) -> Result<(), BusError>
    where
        Fut: Future<Output = ()>,
    {
        match self
            .state
            .transition(ChannelState::Closing, |s| s == ChannelState::Opened)
        {
            Ok(_) => {}
            Err(ChannelState::Closed) => return Ok(()),
            Err(ChannelState::Created | ChannelState::Faulted) => {
                self.abort();
                return Ok(());
            }
            Err(state) => {
                return Err(BusError::InvalidState {
                    operation: "close",
                    state,
                })
            }
        }

        let link = self.link.lock().clone();
        let graceful = async {
            flush.await;
            match link {
                Some(link) => link.close().await,
                None => Ok(()),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.closed() => return Ok(()),
            result = tokio::time::timeout(timeout, graceful) => result,
        };

        match outcome {
            Ok(Ok(())) => {
                self.link.lock().take();
                let _ = self
                    .state
                    .transition(ChannelState::Closed, |s| s == ChannelState::Closing);
                Ok(())
            }
            Ok(Err(e)) => {
                self.fault(&e.to_string());
                self.abort();
                Err(e.into())
            }
            Err(_elapsed) => {
                warn!(channel = %self.name, ?timeout, "Close timed out, aborting");
                self.abort();
                Err(BusError::Timeout {
                    operation: "close",
                    after: timeout,
                })
            }
        }
    }

    /// Move straight to `Closed` and drop the link. No-op when already closed.
    pub(crate) fn abort(&self) {
        if let Ok(from) = self.state.transition(ChannelState::Closed, |_| true) {
            debug!(channel = %self.name, %from, "Channel aborted");
        }
        if let Some(link) = self.link.lock().take() {
            link.abort();
        }
    }

    /// Record a transport or framing failure.
    pub(crate) fn fault(&self, reason: &str) {
        if let Ok(from) = self.state.transition(ChannelState::Faulted, |_| true) {
            bus_telemetry::metrics::CHANNEL_FAULTS.inc();
            log_channel_event!(
                warn,
                self.name,
                ChannelState::Faulted,
                "Channel faulted",
                %from,
                reason
            );
        }
    }

    /// Fault, then abort.
    pub(crate) fn fail(&self, reason: &str) {
        self.fault(reason);
        self.abort();
    }

    fn aborted(&self) -> BusError {
        BusError::Aborted {
            channel: self.name.clone(),
        }
    }

    /// Drive `fut` to completion on the captured runtime.
    ///
    /// Refuses to run inside an async context, where blocking the thread
    /// would stall (or deadlock) the runtime.
    pub(crate) fn block_on<F: Future>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<F::Output, BusError> {
        if Handle::try_current().is_ok() {
            return Err(BusError::BlockingInAsyncContext { operation });
        }
        let runtime = self.runtime.as_ref().ok_or(BusError::NoRuntime)?;
        Ok(runtime.block_on(fut))
    }
}
