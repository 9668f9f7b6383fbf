//! # Transactional Delivery
//!
//! Durable queues with acknowledge-after-success, requeue of retryable
//! failures and dropping of poison messages.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use message_bus::{
        BusError, CollectingErrorSubscriber, ErrorStage, HandlerError, PublisherConfig,
        SubscriberConfig,
    };
    use tokio::sync::mpsc;

    use crate::integration::support::{assert_silent, bus_pair, recv, TIMEOUT};

    fn durable(queue: &str) -> SubscriberConfig {
        SubscriberConfig::new()
            .with_durable_queue(queue, true)
            .with_transactional_delivery()
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_until_success() {
        let (a, b, broker) = bus_pair();
        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = b.create_subscriber(durable("billing")).unwrap();
        {
            let attempts = Arc::clone(&attempts);
            subscriber
                .subscribe("Charge", move |amount: u64| {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let tx = tx.clone();
                    async move {
                        if attempt < 3 {
                            return Err(HandlerError::transient("gateway unavailable"));
                        }
                        let _ = tx.send((attempt, amount));
                        Ok(())
                    }
                })
                .unwrap();
        }
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher.publish("Charge", &250u64).await.unwrap();

        assert_eq!(recv(&mut rx).await, (3, 250));
        let stats = subscriber.stats();
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.handled, 1);

        subscriber.close().await.unwrap();
        assert_eq!(broker.queue_depth("billing"), Some(0));
    }

    #[tokio::test]
    async fn test_exception_filter_drops_poison_message() {
        let (a, b, broker) = bus_pair();
        let errors = Arc::new(CollectingErrorSubscriber::new());
        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = b
            .create_subscriber(
                durable("billing")
                    .with_exception_filter(|e: &HandlerError| {
                        matches!(e, HandlerError::Transient(_))
                    })
                    .with_error_subscriber(errors.clone()),
            )
            .unwrap();
        {
            let attempts = Arc::clone(&attempts);
            subscriber
                .subscribe("Charge", move |amount: u64| {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let tx = tx.clone();
                    async move {
                        if amount == 0 {
                            return Err(HandlerError::failed("zero amount"));
                        }
                        let _ = tx.send(amount);
                        Ok(())
                    }
                })
                .unwrap();
        }
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher.publish("Charge", &0u64).await.unwrap();
        publisher.publish("Charge", &10u64).await.unwrap();

        assert_eq!(recv(&mut rx).await, 10);
        assert_silent(&mut rx).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(subscriber.stats().requeued, 0);

        let reported = errors.errors();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].1.stage, ErrorStage::Handle);
        assert_eq!(reported[0].1.action.as_deref(), Some("Charge"));
        assert!(matches!(
            reported[0].0,
            BusError::Handler(HandlerError::Failed(_))
        ));

        subscriber.close().await.unwrap();
        assert_eq!(broker.queue_depth("billing"), Some(0));
    }

    #[tokio::test]
    async fn test_unacknowledged_message_survives_subscriber_close() {
        let (a, b, broker) = bus_pair();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();

        let first = b.create_subscriber(durable("ledger")).unwrap();
        first
            .subscribe("Post", move |entry: u32| {
                let entered_tx = entered_tx.clone();
                async move {
                    let _ = entered_tx.send(entry);
                    // hold the message until the subscriber goes away
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        first.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher.publish("Post", &1u32).await.unwrap();
        assert_eq!(recv(&mut entered_rx).await, 1);

        first.abort();
        assert_eq!(broker.queue_depth("ledger"), Some(1));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = b.create_subscriber(durable("ledger")).unwrap();
        second
            .subscribe("Post", move |entry: u32| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(entry);
                    Ok::<_, HandlerError>(())
                }
            })
            .unwrap();
        second.start(TIMEOUT).await.unwrap();

        assert_eq!(recv(&mut rx).await, 1);
    }

    #[tokio::test]
    async fn test_plain_delivery_acknowledges_before_handling() {
        let (a, b, broker) = bus_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_durable_queue("audit", true))
            .unwrap();
        subscriber
            .subscribe("Record", move |n: u32| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(n);
                    Err::<(), _>(HandlerError::transient("not retried without transactions"))
                }
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let publisher = a.create_publisher(PublisherConfig::new()).await.unwrap();
        publisher.publish("Record", &5u32).await.unwrap();

        assert_eq!(recv(&mut rx).await, 5);
        assert_silent(&mut rx).await;
        assert_eq!(subscriber.stats().requeued, 0);
        assert_eq!(broker.queue_depth("audit"), Some(0));
    }
}
