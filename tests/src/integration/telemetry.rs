//! # Telemetry and Configuration
//!
//! Prometheus exposition after real traffic, and a bus built from a TOML
//! file on disk.

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use bus_telemetry::register_metrics;
    use futures::future::join_all;
    use message_bus::{BusConfig, HandlerError, MessageBus, PublisherConfig, SubscriberConfig};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use crate::integration::support::{bus_pair, recv, TIMEOUT};

    /// Value of an unlabelled sample in the text exposition.
    fn sample(exposition: &str, name: &str) -> f64 {
        exposition
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or_else(|| panic!("{name} missing from exposition"))
    }

    #[tokio::test]
    async fn test_exposition_counts_traffic() {
        let metrics = register_metrics().unwrap();
        // registration is idempotent
        register_metrics().unwrap();

        let (a, b, _broker) = bus_pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = b.create_subscriber(SubscriberConfig::new()).unwrap();
        {
            let seen = Arc::clone(&seen);
            subscriber
                .subscribe("Tick", move |n: u32| {
                    seen.lock().push(n);
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(());
                        Ok::<_, HandlerError>(())
                    }
                })
                .unwrap();
        }
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        let sends = join_all((0..5u32).map(|n| {
            let publisher = &publisher;
            async move { publisher.publish("Tick", &n).await }
        }))
        .await;
        assert!(sends.iter().all(Result::is_ok));
        for _ in 0..5 {
            recv(&mut rx).await;
        }

        let mut delivered = seen.lock().clone();
        delivered.sort_unstable();
        assert_eq!(delivered, vec![0, 1, 2, 3, 4]);

        // counters are process-wide; other tests only add to them
        let text = metrics.gather_text().unwrap();
        assert!(sample(&text, "mb_publisher_messages_published_total") >= 5.0);
        assert!(sample(&text, "mb_dispatcher_messages_received_total") >= 5.0);
        assert!(text.contains("mb_rpc_round_trip_duration_seconds"));
    }

    #[tokio::test]
    async fn test_bus_from_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
bus_id = "from-file"
exchange = "orders"
open_timeout = "1s"

[transport]
kind = "memory"
"#
        )
        .unwrap();

        let config = BusConfig::from_file(file.path()).unwrap();
        let bus = MessageBus::new(config).unwrap();
        assert_eq!(bus.bus_id().as_str(), "from-file");
        assert_eq!(bus.config().exchange, "orders");

        let publisher = bus.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher.publish("Created", &1u32).await.unwrap();
        bus.dispose().await;
        assert!(bus.is_disposed());
    }
}
