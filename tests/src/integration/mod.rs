//! Cross-component tests driving the bus through its public API.

pub mod rpc;
pub mod scenarios;
pub mod tcp_stream;
pub mod telemetry;
pub mod transactional;

#[cfg(test)]
pub(crate) mod support {
    use message_bus::{BusConfig, InMemoryBroker, MessageBus, Transport};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub const TIMEOUT: Duration = Duration::from_secs(2);

    pub fn config(bus_id: &str) -> BusConfig {
        BusConfig {
            bus_id: Some(bus_id.into()),
            open_timeout: TIMEOUT,
            close_timeout: TIMEOUT,
            ..BusConfig::default()
        }
    }

    /// Two buses sharing one in-memory broker.
    pub fn bus_pair() -> (MessageBus, MessageBus, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let transport: Arc<dyn Transport> = Arc::new(broker.clone());
        let a = MessageBus::with_transport(config("bus-a"), Arc::clone(&transport)).unwrap();
        let b = MessageBus::with_transport(config("bus-b"), transport).unwrap();
        (a, b, broker)
    }

    pub async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
        tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("message within timeout")
            .expect("sender alive")
    }

    /// Nothing arrives within a short grace period.
    pub async fn assert_silent<T: std::fmt::Debug>(rx: &mut UnboundedReceiver<T>) {
        let outcome = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(outcome.is_err(), "unexpected message: {outcome:?}");
    }
}
