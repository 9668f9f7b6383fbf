//! # Publish/Subscribe Scenarios
//!
//! Two buses share one in-memory broker, the way two processes share a
//! broker in production. Covers delivery, self-publish suppression, topic
//! routing and the ordering/concurrency contract of the dispatcher.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use message_bus::{
        HandlerError, Message, MessageBus, PublishOptions, PublisherConfig, RoutingPredicate,
        SubscriberConfig,
    };
    use serde::{Deserialize, Serialize};
    use tokio::sync::mpsc;

    use crate::integration::support::{assert_silent, bus_pair, config, recv, TIMEOUT};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    #[tokio::test]
    async fn test_ping_reaches_other_bus() {
        let (a, b, _broker) = bus_pair();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = b.create_subscriber(SubscriberConfig::new()).unwrap();
        subscriber
            .subscribe("Ping", move |ping: Ping| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(ping);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        let ping = Ping {
            seq: 1,
            note: "hello".into(),
        };
        publisher.publish("Ping", &ping).await.unwrap();

        assert_eq!(recv(&mut rx).await, ping);
        assert_eq!(subscriber.stats().handled, 1);
    }

    #[tokio::test]
    async fn test_every_subscriber_queue_gets_a_copy() {
        let (a, b, _broker) = bus_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut subscribers = Vec::new();
        for name in ["first", "second"] {
            let subscriber = b
                .create_subscriber(SubscriberConfig::new().with_consumer_tag(name))
                .unwrap();
            let tx = tx.clone();
            subscriber
                .subscribe("Ping", move |ping: Ping| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((name, ping.seq));
                        Ok::<_, HandlerError>(())
                    }
                })
                .unwrap();
            subscriber.start(TIMEOUT).await.unwrap();
            subscribers.push(subscriber);
        }

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher
            .publish(
                "Ping",
                &Ping {
                    seq: 7,
                    note: String::new(),
                },
            )
            .await
            .unwrap();

        let mut seen = vec![recv(&mut rx).await, recv(&mut rx).await];
        seen.sort_unstable();
        assert_eq!(seen, vec![("first", 7), ("second", 7)]);
    }

    #[tokio::test]
    async fn test_application_headers_reach_raw_handler() {
        let (a, b, _broker) = bus_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        struct Capture(mpsc::UnboundedSender<Message>);

        #[async_trait::async_trait]
        impl message_bus::MessageHandler for Capture {
            async fn handle(
                &self,
                message: &Message,
                _serializers: &message_bus::SerializerRegistry,
            ) -> Result<serde_json::Value, HandlerError> {
                let _ = self.0.send(message.clone());
                Ok(serde_json::Value::Null)
            }
        }

        let subscriber = b.create_subscriber(SubscriberConfig::new()).unwrap();
        subscriber
            .subscribe_handler("Audit", Arc::new(Capture(tx)))
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher
            .publish_with(
                "Audit",
                &serde_json::json!({"user": 1}),
                PublishOptions::new().with_header("tenant", "acme"),
            )
            .await
            .unwrap();

        let message = recv(&mut rx).await;
        assert_eq!(message.header("tenant"), Some("acme"));
        assert_eq!(message.origin(), Some("bus-a"));
        assert_eq!(message.content_type(), Some("application/json"));
    }

    // =========================================================================
    // FILTERING
    // =========================================================================

    #[tokio::test]
    async fn test_self_published_messages_suppressed_by_default() {
        let bus = MessageBus::new(config("solo")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let deaf = bus.create_subscriber(SubscriberConfig::new()).unwrap();
        {
            let tx = tx.clone();
            deaf.subscribe("Ping", move |ping: Ping| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(("deaf", ping.seq));
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        }
        deaf.start(TIMEOUT).await.unwrap();

        let echo = bus
            .create_subscriber(SubscriberConfig::new().with_receive_self_publish())
            .unwrap();
        echo.subscribe("Ping", move |ping: Ping| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(("echo", ping.seq));
                Ok::<_, HandlerError>(())
            }
        })
        .unwrap();
        echo.start(TIMEOUT).await.unwrap();

        let publisher = bus.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher
            .publish(
                "Ping",
                &Ping {
                    seq: 3,
                    note: String::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(recv(&mut rx).await, ("echo", 3));
        assert_silent(&mut rx).await;
        assert_eq!(deaf.stats().filtered, 1);
        assert_eq!(deaf.stats().handled, 0);
    }

    #[tokio::test]
    async fn test_topic_binding_selects_routing_keys() {
        let (a, b, _broker) = bus_pair();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_routing_key("orders.*"))
            .unwrap();
        subscriber
            .subscribe("Event", move |name: String| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(name);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        for key in ["users.created", "orders.created", "orders.eu.created"] {
            publisher
                .publish_with("Event", key, PublishOptions::new().with_routing_key(key))
                .await
                .unwrap();
        }

        assert_eq!(recv(&mut rx).await, "orders.created");
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_routing_predicate_filters_after_delivery() {
        let (a, b, _broker) = bus_pair();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let only_acme = RoutingPredicate::custom(|m: &Message| m.header("tenant") == Some("acme"));
        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_routing_predicate(only_acme))
            .unwrap();
        subscriber
            .subscribe("Order", move |id: u32| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(id);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        for (id, tenant) in [(1u32, "globex"), (2, "acme")] {
            publisher
                .publish_with("Order", &id, PublishOptions::new().with_header("tenant", tenant))
                .await
                .unwrap();
        }

        assert_eq!(recv(&mut rx).await, 2);
        assert_eq!(subscriber.stats().filtered, 1);
    }

    // =========================================================================
    // ORDERING AND CONCURRENCY
    // =========================================================================

    #[tokio::test]
    async fn test_single_worker_delivers_in_publish_order() {
        let (a, b, _broker) = bus_pair();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = b.create_subscriber(SubscriberConfig::new()).unwrap();
        subscriber
            .subscribe("Seq", move |n: u32| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(u64::from(n % 3))).await;
                    let _ = tx.send(n);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        for n in 0..50u32 {
            publisher.publish("Seq", &n).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..50 {
            seen.push(recv(&mut rx).await);
        }
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_level_bounds_parallel_handlers() {
        const LEVEL: usize = 3;
        let (a, b, _broker) = bus_pair();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_concurrency_level(LEVEL))
            .unwrap();
        {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            subscriber
                .subscribe("Work", move |n: u32| {
                    let in_flight = Arc::clone(&in_flight);
                    let max_seen = Arc::clone(&max_seen);
                    let tx = tx.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        let _ = tx.send(n);
                        Ok::<_, HandlerError>(())
                    }
                })
                .unwrap();
        }
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        for n in 0..12u32 {
            publisher.publish("Work", &n).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..12 {
            seen.push(recv(&mut rx).await);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());

        let max = max_seen.load(Ordering::SeqCst);
        assert!(max <= LEVEL, "{max} handlers ran at once");
        assert!(max > 1, "handlers never overlapped");
    }
}
