//! # Request/Reply
//!
//! RPC publishers on one bus calling responders on another, with fast reply
//! and per-call reply queues.

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use message_bus::{
        BusError, HandlerError, MessageBus, RpcPublisherConfig, Subscriber, SubscriberConfig,
    };
    use serde::{Deserialize, Serialize};

    use crate::integration::support::{bus_pair, TIMEOUT};

    #[derive(Debug, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    async fn calculator(bus: &MessageBus) -> Subscriber {
        let subscriber = bus.create_subscriber(SubscriberConfig::new()).unwrap();
        subscriber
            .subscribe("Add", |req: Add| async move { Ok::<_, HandlerError>(req.a + req.b) })
            .unwrap();
        subscriber
            .subscribe("Divide", |req: Add| async move {
                if req.b == 0 {
                    return Err(HandlerError::failed("division by zero"));
                }
                Ok(req.a / req.b)
            })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();
        subscriber
    }

    // =========================================================================
    // REPLIES
    // =========================================================================

    #[tokio::test]
    async fn test_fast_reply_returns_result() {
        let (a, b, _broker) = bus_pair();
        let _responder = calculator(&b).await;

        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();
        assert!(rpc.uses_fast_reply());

        let started = Instant::now();
        let sum: i64 = rpc
            .send_and_wait("Add", &Add { a: 2, b: 40 }, Some(Duration::from_millis(2000)))
            .await
            .unwrap();
        assert_eq!(sum, 42);
        assert!(started.elapsed() < Duration::from_millis(2000));
        assert_eq!(rpc.pending().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_per_call_reply_queue() {
        let (a, b, _broker) = bus_pair();
        let _responder = calculator(&b).await;

        let rpc = a
            .create_rpc_publisher(RpcPublisherConfig::new().disable_fast_reply())
            .await
            .unwrap();
        assert!(!rpc.uses_fast_reply());

        let sum: i64 = rpc
            .send_and_wait("Add", &Add { a: 1, b: 1 }, None)
            .await
            .unwrap();
        assert_eq!(sum, 2);

        let completed = rpc
            .pending()
            .stats()
            .total_completed
            .load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(completed, 1);
        assert_eq!(rpc.pending().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let (a, b, _broker) = bus_pair();
        let _responder = calculator(&b).await;
        let rpc = std::sync::Arc::new(
            a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap(),
        );

        let calls: Vec<_> = (0..20i64)
            .map(|i| {
                let rpc = std::sync::Arc::clone(&rpc);
                tokio::spawn(async move {
                    let sum: i64 = rpc
                        .send_and_wait("Add", &Add { a: i, b: 1000 }, None)
                        .await
                        .unwrap();
                    (i, sum)
                })
            })
            .collect();

        for call in calls {
            let (i, sum) = call.await.unwrap();
            assert_eq!(sum, i + 1000);
        }
    }

    #[tokio::test]
    async fn test_remote_failure_fails_fast() {
        let (a, b, _broker) = bus_pair();
        let _responder = calculator(&b).await;
        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();

        let started = Instant::now();
        let result: Result<i64, _> = rpc
            .send_and_wait("Divide", &Add { a: 1, b: 0 }, Some(Duration::from_secs(5)))
            .await;

        match result {
            Err(BusError::RemoteHandler { action, message }) => {
                assert_eq!(action, "Divide");
                assert!(message.contains("division by zero"), "{message}");
            }
            other => panic!("expected a remote handler error, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_never_reply_subscriber_stays_silent() {
        let (a, b, _broker) = bus_pair();
        let subscriber = b
            .create_subscriber(SubscriberConfig::new().with_never_reply())
            .unwrap();
        subscriber
            .subscribe("Add", |req: Add| async move { Ok::<_, HandlerError>(req.a + req.b) })
            .unwrap();
        subscriber.start(TIMEOUT).await.unwrap();

        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();
        let result: Result<i64, _> = rpc
            .send_and_wait("Add", &Add { a: 1, b: 2 }, Some(Duration::from_millis(200)))
            .await;

        assert!(matches!(result, Err(BusError::RpcTimeout { .. })));
        assert_eq!(subscriber.stats().handled, 1);
        assert_eq!(subscriber.stats().replied, 0);
    }

    // =========================================================================
    // TIMEOUTS
    // =========================================================================

    #[tokio::test]
    async fn test_timeout_fires_within_bounds() {
        const DEADLINE: Duration = Duration::from_millis(250);
        const EPSILON: Duration = Duration::from_millis(250);

        let (a, _b, _broker) = bus_pair();
        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();

        let started = Instant::now();
        let result: Result<i64, _> = rpc
            .send_and_wait("Add", &Add { a: 1, b: 2 }, Some(DEADLINE))
            .await;
        let elapsed = started.elapsed();

        match result {
            Err(BusError::RpcTimeout { timeout, .. }) => assert_eq!(timeout, DEADLINE),
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(elapsed >= DEADLINE, "fired early after {elapsed:?}");
        assert!(elapsed < DEADLINE + EPSILON, "fired late after {elapsed:?}");
        assert_eq!(rpc.pending().pending_count(), 0);
        assert_eq!(
            rpc.pending()
                .stats()
                .total_timeouts
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_default_timeout_from_config() {
        let (a, _b, _broker) = bus_pair();
        let rpc = a
            .create_rpc_publisher(
                RpcPublisherConfig::new().with_default_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let result: Result<i64, _> = rpc.send_and_wait("Add", &Add { a: 1, b: 2 }, None).await;
        assert!(matches!(
            result,
            Err(BusError::RpcTimeout { timeout, .. }) if timeout == Duration::from_millis(100)
        ));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_still_gets_reply() {
        let (a, b, _broker) = bus_pair();
        let _responder = calculator(&b).await;
        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();

        let sum: i64 = rpc
            .send_and_wait("Add", &Add { a: 20, b: 22 }, Some(Duration::MAX))
            .await
            .unwrap();
        assert_eq!(sum, 42);
        assert_eq!(rpc.pending().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_per_call_request_releases_reply_queue() {
        let (a, _b, broker) = bus_pair();
        let rpc = a
            .create_rpc_publisher(RpcPublisherConfig::new().disable_fast_reply())
            .await
            .unwrap();

        let call = rpc.send_and_wait::<_, i64>(
            "Add",
            &Add { a: 1, b: 2 },
            Some(Duration::from_secs(10)),
        );
        let outcome = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(outcome.is_err(), "no responder, the call must still be waiting");

        assert_eq!(rpc.pending().pending_count(), 0);
        assert!(
            broker.queue_names().iter().all(|q| !q.starts_with("rpc.reply.")),
            "{:?}",
            broker.queue_names()
        );
        assert_eq!(
            rpc.pending()
                .stats()
                .total_cancelled
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (a, _b, _broker) = bus_pair();
        let rpc = a.create_rpc_publisher(RpcPublisherConfig::new()).await.unwrap();
        rpc.close().await.unwrap();

        let result: Result<i64, _> = rpc.send_and_wait("Add", &Add { a: 1, b: 2 }, None).await;
        assert!(matches!(result, Err(BusError::InvalidState { .. })));
        assert_eq!(rpc.pending().pending_count(), 0);
    }
}
