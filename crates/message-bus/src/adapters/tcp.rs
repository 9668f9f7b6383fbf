//! # TCP Byte-Stream Transport
//!
//! Length-prefixed frames over plain TCP. The subscriber side binds a
//! listener and fans in frames from every connected publisher; publishers
//! connect and write frames.
//!
//! A byte stream has no acknowledgements and no reply path, so this
//! transport only carries plain publish/subscribe. Routing keys and
//! exchanges are ignored: every publisher reaches every frame to the one
//! listening subscriber.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::domain::TransportError;
use crate::ports::{
    Delivery, InputBinding, InputLink, Link, OutputLink, Transport, TransportKind,
};

/// Frames buffered between the socket readers and the input channel.
const INBOUND_CAPACITY: usize = 1024;

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

pub struct TcpTransport {
    host: String,
    port: u16,
    codec: FrameCodec,
    bound: Mutex<Option<SocketAddr>>,
    accept_tasks: Mutex<Vec<AbortHandle>>,
    disposed: AtomicBool,
}

impl TcpTransport {
    /// `codec` delimits inbound frames; only its size limit matters here.
    pub fn new(host: impl Into<String>, port: u16, codec: FrameCodec) -> Self {
        Self {
            host: host.into(),
            port,
            codec,
            bound: Mutex::new(None),
            accept_tasks: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Address of the listener, once a subscriber has bound one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock()
    }

    /// Publishers target the bound listener when there is one, which
    /// resolves port 0 to the port actually chosen.
    fn target(&self) -> String {
        match *self.bound.lock() {
            Some(addr) => addr.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn supports_acknowledgement(&self) -> bool {
        false
    }

    async fn connect_output(&self, _exchange: &str) -> Result<Arc<dyn OutputLink>, TransportError> {
        self.check_open()?;
        let address = self.target();
        let stream = TcpStream::connect(&address).await.map_err(|e| {
            TransportError::ConnectionRefused {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;
        stream.set_nodelay(true)?;
        debug!(%address, "Connected to subscriber");

        Ok(Arc::new(TcpOutputLink {
            stream: tokio::sync::Mutex::new(Some(stream)),
            closed: AtomicBool::new(false),
        }))
    }

    async fn connect_input(
        &self,
        binding: &InputBinding,
    ) -> Result<Arc<dyn InputLink>, TransportError> {
        self.check_open()?;
        let address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            TransportError::ConnectionRefused {
                address: address.clone(),
                reason: e.to_string(),
            }
        })?;
        let local = listener.local_addr()?;
        *self.bound.lock() = Some(local);
        info!(%local, consumer_tag = %binding.consumer_tag, "Listening for publishers");

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let accept = tokio::spawn(accept_loop(listener, self.codec.clone(), tx));
        self.accept_tasks.lock().push(accept.abort_handle());

        Ok(Arc::new(TcpInputLink {
            queue_name: local.to_string(),
            inbound: tokio::sync::Mutex::new(rx),
            accept: accept.abort_handle(),
            next_tag: AtomicU64::new(1),
        }))
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for task in self.accept_tasks.lock().drain(..) {
            task.abort();
        }
        debug!("TCP transport disposed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    codec: FrameCodec,
    tx: mpsc::Sender<Result<Bytes, TransportError>>,
) {
    // readers die with this task when it is aborted
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Publisher connected");
                    readers.spawn(read_frames(stream, peer, codec.clone(), tx.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_frames(
    mut stream: TcpStream,
    peer: SocketAddr,
    codec: FrameCodec,
    tx: mpsc::Sender<Result<Bytes, TransportError>>,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        loop {
            match codec.split_frame(&mut buf) {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "Corrupt frame stream");
                    let _ = tx.send(Err(TransportError::CorruptStream(e))).await;
                    return;
                }
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                if !buf.is_empty() {
                    warn!(%peer, pending = buf.len(), "Publisher disconnected mid-frame");
                } else {
                    debug!(%peer, "Publisher disconnected");
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "Publisher connection failed");
                return;
            }
        }
    }
}

struct TcpOutputLink {
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

#[async_trait]
impl Link for TcpOutputLink {
    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }

    fn abort(&self) {
        self.closed.store(true, Ordering::Release);
        // a send in progress keeps the socket until it finishes
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }
    }
}

#[async_trait]
impl OutputLink for TcpOutputLink {
    async fn send_frame(&self, _routing_key: &str, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        stream.write_all(frame).await?;
        Ok(())
    }
}

struct TcpInputLink {
    queue_name: String,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Result<Bytes, TransportError>>>,
    accept: AbortHandle,
    next_tag: AtomicU64,
}

#[async_trait]
impl Link for TcpInputLink {
    async fn close(&self) -> Result<(), TransportError> {
        self.accept.abort();
        Ok(())
    }

    fn abort(&self) {
        self.accept.abort();
    }
}

#[async_trait]
impl InputLink for TcpInputLink {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn receive_frame(&self) -> Result<Option<Delivery>, TransportError> {
        match self.inbound.lock().await.recv().await {
            Some(Ok(frame)) => Ok(Some(Delivery {
                frame,
                tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
                redelivered: false,
            })),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}
