//! Publish-direction channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Mutex};

use super::{ChannelCore, ChannelState, StateTransition};
use crate::codec::FrameCodec;
use crate::domain::{BusError, Message};
use crate::ports::{OutputLink, Transport};

/// Sends framed messages to one exchange.
///
/// Safe to share between tasks: concurrent sends are serialized so one
/// frame is always written whole before the next starts.
pub struct OutputChannel {
    core: ChannelCore<dyn OutputLink>,
    transport: Arc<dyn Transport>,
    exchange: String,
    codec: FrameCodec,
    send_lock: Mutex<()>,
}

impl OutputChannel {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        exchange: impl Into<String>,
        codec: FrameCodec,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            core: ChannelCore::new(name, runtime),
            transport,
            exchange: exchange.into(),
            codec,
            send_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateTransition> {
        self.core.subscribe()
    }

    pub async fn open(&self, timeout: Duration) -> Result<(), BusError> {
        let connect = self.transport.connect_output(&self.exchange);
        self.core.open_with(timeout, connect).await
    }

    pub fn open_blocking(&self, timeout: Duration) -> Result<(), BusError> {
        self.core.block_on("open", self.open(timeout))?
    }

    /// Frame and write one message.
    ///
    /// Encoding failures are returned without touching the channel; a
    /// transport failure faults and aborts it.
    pub async fn send(&self, message: &Message) -> Result<(), BusError> {
        let link = self.core.link_for("send")?;
        let frame = self.codec.encode(message)?;

        let _guard = self.send_lock.lock().await;
        self.core.ensure_opened("send")?;
        if let Err(e) = link.send_frame(message.routing_key(), &frame).await {
            self.core.fail(&e.to_string());
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the in-flight send, then close the link.
    pub async fn close(&self, timeout: Duration) -> Result<(), BusError> {
        let flush = async {
            let _ = self.send_lock.lock().await;
        };
        self.core.close_with(timeout, flush).await
    }

    pub fn close_blocking(&self, timeout: Duration) -> Result<(), BusError> {
        self.core.block_on("close", self.close(timeout))?
    }

    pub fn abort(&self) {
        self.core.abort();
    }
}

impl std::fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputChannel")
            .field("name", &self.core.name())
            .field("state", &self.core.state())
            .field("exchange", &self.exchange)
            .finish()
    }
}
