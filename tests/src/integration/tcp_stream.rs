//! # TCP Byte-Stream Transport
//!
//! Subscribers bind a listener, publishers connect and write length-prefixed
//! frames. Both buses share one transport so publishers find the port the
//! listener actually bound.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use message_bus::{
        BusConfig, BusError, ChannelState, CollectingErrorSubscriber, EncoderKind, ErrorStage,
        FrameCodec, HandlerError, MessageBus, PublisherConfig, SubscriberConfig, TcpTransport,
        Transport, TransportError,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::integration::support::{recv, TIMEOUT};

    fn tcp_pair(encoder: EncoderKind) -> (MessageBus, MessageBus, Arc<TcpTransport>) {
        let transport = Arc::new(TcpTransport::new("127.0.0.1", 0, FrameCodec::default()));
        let shared: Arc<dyn Transport> = transport.clone();
        let config = |id: &str| BusConfig {
            bus_id: Some(id.into()),
            encoder,
            open_timeout: TIMEOUT,
            close_timeout: TIMEOUT,
            ..BusConfig::default()
        };
        let publisher_bus =
            MessageBus::with_transport(config("tcp-a"), Arc::clone(&shared)).unwrap();
        let subscriber_bus = MessageBus::with_transport(config("tcp-b"), shared).unwrap();
        (publisher_bus, subscriber_bus, transport)
    }

    #[tokio::test]
    async fn test_frames_cross_the_socket_in_order() {
        for encoder in [EncoderKind::Json, EncoderKind::Bincode] {
            let (a, b, transport) = tcp_pair(encoder);

            let (tx, mut rx) = mpsc::unbounded_channel();
            let subscriber = b.create_subscriber(SubscriberConfig::new()).unwrap();
            subscriber
                .subscribe("Tick", move |n: u32| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(n);
                        Ok::<_, HandlerError>(())
                    }
                })
                .unwrap();
            subscriber.start(TIMEOUT).await.unwrap();
            assert!(transport.local_addr().is_some());

            let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
            for n in 0..100u32 {
                publisher.publish("Tick", &n).await.unwrap();
            }

            let mut seen = Vec::new();
            for _ in 0..100 {
                seen.push(recv(&mut rx).await);
            }
            assert_eq!(seen, (0..100).collect::<Vec<_>>(), "{encoder:?}");

            publisher.close().await.unwrap();
            subscriber.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_publisher_without_listener_fails_to_open() {
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::new("127.0.0.1", 1, FrameCodec::default()));
        let bus = MessageBus::with_transport(
            BusConfig {
                bus_id: Some("tcp-lonely".into()),
                ..BusConfig::default()
            },
            transport,
        )
        .unwrap();

        let result = bus.create_publisher(PublisherConfig::new()).await;
        assert!(matches!(
            result,
            Err(BusError::Transport(TransportError::ConnectionRefused { .. }))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_stream_faults_subscriber_channel() {
        let (_a, b, transport) = tcp_pair(EncoderKind::Json);
        let errors = Arc::new(CollectingErrorSubscriber::new());

        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_error_subscriber(errors.clone()))
            .unwrap();
        subscriber
            .subscribe("Tick", |_: u32| async { Ok::<_, HandlerError>(()) })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        // a length prefix far past the frame limit
        let address = transport.local_addr().unwrap();
        let mut raw = tokio::net::TcpStream::connect(address).await.unwrap();
        raw.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        raw.write_all(b"garbage").await.unwrap();

        tokio::time::timeout(TIMEOUT, async {
            while errors.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let reported = errors.errors();
        assert_eq!(reported[0].1.stage, ErrorStage::Receive);
        assert!(matches!(
            reported[0].0,
            BusError::Transport(TransportError::CorruptStream(_))
        ));
        assert!(matches!(
            subscriber.state(),
            ChannelState::Faulted | ChannelState::Closed
        ));
    }
}
