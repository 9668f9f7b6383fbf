//! Receive-direction channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use super::{ChannelCore, ChannelState, StateTransition};
use crate::codec::FrameCodec;
use crate::domain::{BusError, Message, TransportError};
use crate::ports::{InputBinding, InputLink, Transport};

/// A decoded message plus what is needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message: Message,
    pub tag: u64,
    pub redelivered: bool,
}

/// Consumes frames from one queue.
pub struct InputChannel {
    core: ChannelCore<dyn InputLink>,
    transport: Arc<dyn Transport>,
    binding: InputBinding,
    codec: FrameCodec,
}

impl InputChannel {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        binding: InputBinding,
        codec: FrameCodec,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            core: ChannelCore::new(name, runtime),
            transport,
            binding,
            codec,
        }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn binding(&self) -> &InputBinding {
        &self.binding
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateTransition> {
        self.core.subscribe()
    }

    /// Name of the consumed queue, known once the channel is open.
    pub fn queue_name(&self) -> Option<String> {
        self.core
            .link_for("queue_name")
            .ok()
            .map(|link| link.queue_name().to_string())
    }

    pub async fn open(&self, timeout: Duration) -> Result<(), BusError> {
        let connect = self.transport.connect_input(&self.binding);
        self.core.open_with(timeout, connect).await
    }

    pub fn open_blocking(&self, timeout: Duration) -> Result<(), BusError> {
        self.core.block_on("open", self.open(timeout))?
    }

    /// Wait for the next message.
    ///
    /// `Ok(None)` once the channel is closed or aborted. Transport and
    /// framing errors fault and abort the channel; a corrupted stream
    /// cannot be resynchronized.
    pub async fn receive(&self) -> Result<Option<ReceivedMessage>, BusError> {
        let link = self.core.link_for("receive")?;

        let delivery = tokio::select! {
            biased;
            _ = self.core.closed() => return Ok(None),
            delivery = link.receive_frame() => delivery,
        };

        match delivery {
            Ok(Some(delivery)) => match self.codec.decode(&delivery.frame) {
                Ok(message) => Ok(Some(ReceivedMessage {
                    message,
                    tag: delivery.tag,
                    redelivered: delivery.redelivered,
                })),
                Err(e) => {
                    self.core.fail(&e.to_string());
                    Err(e.into())
                }
            },
            Ok(None) if self.core.state() == ChannelState::Opened => {
                // link ended while we still expected frames
                let error = TransportError::ConnectionClosed;
                self.core.fail(&error.to_string());
                Err(error.into())
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.core.fail(&e.to_string());
                Err(e.into())
            }
        }
    }

    pub async fn ack(&self, tag: u64) -> Result<(), BusError> {
        let link = self.core.link_for("ack")?;
        link.ack(tag).await.map_err(Into::into)
    }

    /// Reject a message; with `requeue` it goes back to the head of its queue.
    pub async fn nack(&self, tag: u64, requeue: bool) -> Result<(), BusError> {
        let link = self.core.link_for("nack")?;
        link.nack(tag, requeue).await.map_err(Into::into)
    }

    /// Close without waiting for unacknowledged messages; the transport
    /// returns them to the queue.
    pub async fn close(&self, timeout: Duration) -> Result<(), BusError> {
        self.core.close_with(timeout, async {}).await
    }

    pub fn close_blocking(&self, timeout: Duration) -> Result<(), BusError> {
        self.core.block_on("close", self.close(timeout))?
    }

    pub fn abort(&self) {
        self.core.abort();
    }
}

impl std::fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputChannel")
            .field("name", &self.core.name())
            .field("state", &self.core.state())
            .field("binding", &self.binding)
            .finish()
    }
}
