use super::*;
use crate::event::Payload;
use crate::test_utils::RecordingTransport;
use serde_json::json;

fn config(batch_size: usize) -> BatchPublisherConfig {
    BatchPublisherConfig {
        batch_size,
        flush_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn event(n: u64) -> Event {
    Event::from_value("orders.created", json!({ "n": n })).unwrap()
}

fn setup(config: BatchPublisherConfig) -> (Arc<RecordingTransport>, BatchPublisher) {
    let transport = Arc::new(RecordingTransport::new());
    let publisher = BatchPublisher::new(transport.clone(), config);
    (transport, publisher)
}

#[tokio::test(start_paused = true)]
async fn test_flushes_when_batch_is_full() {
    let (transport, publisher) = setup(config(3));

    for n in 0..3 {
        assert!(publisher.publish(&event(n), "orders.created").await);
    }

    assert_eq!(transport.batch_sizes().await, vec![3]);
    let metrics = publisher.metrics().await;
    assert_eq!(metrics.total_messages_sent, 3);
    assert_eq!(metrics.total_batches_sent, 1);
    assert_eq!(metrics.pending_messages, 0);
    assert_eq!(metrics.last_flush_trigger, Some(FlushTrigger::Size));
}

#[tokio::test(start_paused = true)]
async fn test_seven_events_batch_of_three() {
    let (transport, publisher) = setup(config(3));
    let events: Vec<Event> = (0..7).map(event).collect();

    for event in &events {
        publisher.publish(event, "orders.created").await;
    }
    assert_eq!(transport.batch_sizes().await, vec![3, 3]);
    assert_eq!(publisher.pending().await, 1);

    assert!(publisher.close().await);

    assert_eq!(transport.batch_sizes().await, vec![3, 3, 1]);
    assert_eq!(transport.sent_events().await, events);
    assert_eq!(publisher.metrics().await.last_flush_trigger, Some(FlushTrigger::Close));
}

#[tokio::test(start_paused = true)]
async fn test_messages_carry_batch_headers() {
    let (transport, publisher) = setup(config(3));

    for n in 0..3 {
        publisher.publish(&event(n), "orders.created").await;
    }

    let sent = transport.sent().await;
    let tags: Vec<_> = sent.iter().map(|s| s.message.batch.clone().unwrap()).collect();
    assert!(tags.iter().all(|tag| tag.batch_id == tags[0].batch_id));
    assert_eq!(tags.iter().map(|tag| tag.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(Uuid::parse_str(&tags[0].batch_id).is_ok());
    assert!(sent.iter().all(|s| s.exchange == "events" && s.routing_key == "orders.created"));
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_partial_batch() {
    let (transport, publisher) = setup(config(10));

    publisher.publish(&event(1), "orders.created").await;
    assert!(transport.sent().await.is_empty());

    tokio::time::sleep(Duration::from_millis(110)).await;

    assert_eq!(transport.batch_sizes().await, vec![1]);
    assert_eq!(publisher.metrics().await.last_flush_trigger, Some(FlushTrigger::Timer));
}

#[tokio::test(start_paused = true)]
async fn test_append_resets_timer() {
    let (transport, publisher) = setup(config(10));

    publisher.publish(&event(1), "k").await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    publisher.publish(&event(2), "k").await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    // 120ms after the first append, 60ms after the second
    assert!(transport.sent().await.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.batch_sizes().await, vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_byte_threshold_forces_flush() {
    let (transport, publisher) = setup(BatchPublisherConfig {
        max_batch_bytes: 10,
        ..config(100)
    });

    publisher.publish(&event(1), "k").await;
    publisher.publish(&event(2), "k").await;

    assert_eq!(transport.batch_sizes().await, vec![1, 1]);
    let metrics = publisher.metrics().await;
    assert_eq!(metrics.last_flush_trigger, Some(FlushTrigger::Bytes));
    assert!(metrics.total_bytes_sent > 20);
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_requeues_batch() {
    let (transport, publisher) = setup(config(2));
    transport.fail_next(1).await;

    let events: Vec<Event> = (0..2).map(event).collect();
    for event in &events {
        assert!(publisher.publish(event, "k").await);
    }

    let metrics = publisher.metrics().await;
    assert_eq!(metrics.failed_batches, 1);
    assert_eq!(metrics.pending_messages, 2);
    assert!(transport.sent().await.is_empty());

    assert!(publisher.flush().await);
    assert_eq!(transport.sent_events().await, events);

    let metrics = publisher.metrics().await;
    assert_eq!(metrics.total_messages_sent, 2);
    assert_eq!(metrics.total_batches_sent, 1);
    assert_eq!(metrics.last_flush_trigger, Some(FlushTrigger::Manual));
}

#[tokio::test(start_paused = true)]
async fn test_requeued_batch_goes_ahead_of_new_events() {
    let (transport, publisher) = setup(config(2));
    transport.fail_next(1).await;

    let events: Vec<Event> = (0..3).map(event).collect();
    publisher.publish(&events[0], "k").await;
    publisher.publish(&events[1], "k").await;
    publisher.publish(&events[2], "k").await;

    assert_eq!(transport.batch_sizes().await, vec![3]);
    assert_eq!(transport.sent_events().await, events);
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_retried_by_timer() {
    let (transport, publisher) = setup(config(1));
    transport.fail_next(1).await;

    publisher.publish(&event(1), "k").await;
    assert_eq!(publisher.pending().await, 1);

    tokio::time::sleep(Duration::from_millis(110)).await;

    assert_eq!(transport.batch_sizes().await, vec![1]);
    assert_eq!(publisher.pending().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_of_empty_batch_succeeds() {
    let (transport, publisher) = setup(config(3));

    assert!(publisher.flush().await);
    assert!(transport.sent().await.is_empty());
    assert_eq!(publisher.metrics().await.total_batches_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let (transport, publisher) = setup(config(3));
    publisher.publish(&event(1), "k").await;

    assert!(publisher.close().await);
    assert!(publisher.close().await);

    assert_eq!(transport.batch_sizes().await, vec![1]);
    assert_eq!(transport.close_calls().await, 1);
    assert!(publisher.is_closed().await);
    assert!(!publisher.publish(&event(2), "k").await);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_timer() {
    let (transport, publisher) = setup(config(3));
    publisher.publish(&Event::new("t", Payload::new()), "k").await;
    publisher.close().await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(transport.attempts().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flush_in_flight_during_close() {
    let (transport, publisher) = setup(config(10));
    transport.set_delay(Duration::from_millis(50)).await;
    let events: Vec<Event> = (0..2).map(event).collect();
    for event in &events {
        assert!(publisher.publish(event, "k").await);
    }

    // The timer flush starts at 100ms and is still sending
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(transport.attempts().await, 1);

    assert!(publisher.close().await);

    assert_eq!(transport.batch_sizes().await, vec![2]);
    assert_eq!(transport.sent_events().await, events);
    assert_eq!(transport.close_calls().await, 1);
    assert_eq!(publisher.pending().await, 0);
    assert!(!publisher.publish(&event(3), "k").await);
}

#[tokio::test(start_paused = true)]
async fn test_publish_racing_close_is_sent_or_refused() {
    let transport = Arc::new(RecordingTransport::new());
    transport.set_delay(Duration::from_millis(10)).await;
    let publisher = Arc::new(BatchPublisher::new(transport.clone(), config(3)));
    let events: Vec<Event> = (0..5).map(event).collect();

    let publishing = {
        let publisher = publisher.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let mut accepted = Vec::new();
            for event in &events {
                accepted.push(publisher.publish(event, "k").await);
            }
            accepted
        })
    };
    // Lands while the size-triggered flush of the first three is sending
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(publisher.close().await);
    let accepted = publishing.await.unwrap();

    let expected: Vec<Event> = events
        .iter()
        .zip(&accepted)
        .filter(|(_, accepted)| **accepted)
        .map(|(event, _)| event.clone())
        .collect();
    assert_eq!(accepted, vec![true, true, true, false, false]);
    assert_eq!(transport.sent_events().await, expected);
    assert_eq!(publisher.pending().await, 0);
    assert_eq!(publisher.metrics().await.total_messages_sent, 3);
}
