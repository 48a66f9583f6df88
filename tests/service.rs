//! End-to-end service tests against RabbitMQ and PostgreSQL containers.
//!
//! Run with: cargo test --test service --features container-tests -- --nocapture

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;

use eventbus::bus::{batch_handler_fn, HandlerError};
use eventbus::config::Config;
use eventbus::service::{EventBusService, DEFAULT_PUBLISHER};
use eventbus::storage::ReplayFilter;
use eventbus::Event;

fn config(amqp_url: &str, postgres_url: &str) -> Config {
    let mut config = Config::for_test();
    config.messaging.url = amqp_url.to_string();
    config.messaging.batch_size = 5;
    config.messaging.flush_interval_ms = 200;
    config.messaging.batch_timeout_ms = 200;
    config.messaging.retry_delay_ms = 500;
    config.storage.url = postgres_url.to_string();
    config.storage.pool_min = 1;
    config.storage.pool_max = 4;
    config
}

#[tokio::test]
async fn test_service_round_trip() {
    println!("=== EventBusService end-to-end ===");
    let (_rabbit, amqp_url) = common::start_rabbitmq().await;
    let (_postgres, postgres_url) = common::start_postgres().await;

    let service = EventBusService::new(config(&amqp_url, &postgres_url)).unwrap();
    service.start().await.expect("Failed to start service");
    assert!(service.health().await.is_healthy());

    let received: Arc<Mutex<Vec<Event>>> = Arc::default();
    let sink = received.clone();
    service
        .create_batch_consumer(
            "orders",
            "orders-service",
            "orders.#",
            batch_handler_fn(move |events| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.extend(events);
                    Ok::<(), HandlerError>(())
                }
            }),
            None,
        )
        .await
        .expect("Failed to create consumer");

    let events: Vec<Event> = (0..12)
        .map(|n| Event::from_value("orders.created", json!({ "n": n })).unwrap())
        .collect();
    assert_eq!(service.publish_events_batch(&events, None, None).await, 12);

    // Persisted before delivery
    let stored = service.replay_events(&ReplayFilter::new()).await.unwrap();
    assert_eq!(stored.len(), 12);

    let done = common::eventually(Duration::from_secs(15), || {
        let received = received.clone();
        async move { received.lock().await.len() == 12 }
    })
    .await;
    assert!(done, "all events consumed");
    assert_eq!(*received.lock().await, events);

    let metrics = service.metrics().await;
    assert_eq!(metrics.publishers[DEFAULT_PUBLISHER].total_messages_sent, 12);
    assert_eq!(metrics.consumers["orders"].messages_processed, 12);
    assert!(metrics.store.pooled);

    service.stop().await;
    assert!(!service.health().await.is_healthy());
    assert!(!service.publish_event(&events[0], None, None).await);
    println!("=== EventBusService end-to-end PASSED ===");
}

#[tokio::test]
async fn test_service_unbatched_publish() {
    let (_rabbit, amqp_url) = common::start_rabbitmq().await;
    let (_postgres, postgres_url) = common::start_postgres().await;

    let mut config = config(&amqp_url, &postgres_url);
    config.messaging.enable_batching = false;
    let service = EventBusService::new(config).unwrap();
    service.start().await.unwrap();

    let received: Arc<Mutex<Vec<Event>>> = Arc::default();
    let sink = received.clone();
    service
        .create_batch_consumer(
            "audit",
            "audit-service",
            "audit.*",
            batch_handler_fn(move |events| {
                let sink = sink.clone();
                async move {
                    sink.lock().await.extend(events);
                    Ok::<(), HandlerError>(())
                }
            }),
            None,
        )
        .await
        .unwrap();

    let event = Event::from_value("audit.login", json!({"user": "u-1"})).unwrap();
    assert!(service.publish_event(&event, None, None).await);

    let done = common::eventually(Duration::from_secs(10), || {
        let received = received.clone();
        async move { !received.lock().await.is_empty() }
    })
    .await;
    assert!(done, "event consumed");
    assert_eq!(received.lock().await[0], event);

    let metrics = service.metrics().await;
    assert!(metrics.publishers.is_empty());
    assert_eq!(metrics.direct_publisher.map(|m| m.published), Some(1));

    service.stop().await;
}
