//! Test utilities and mock implementations.
//!
//! In-memory doubles for the broker transport, delivery acknowledgement and the
//! event store, for testing without a running broker or database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bus::{
    Acknowledger, BusError, InboundMessage, MessageStream, OutboundMessage, Result as BusResult,
    Transport,
};
use crate::event::Event;
use crate::storage::{
    replay_order, EventStore, PerformanceReport, ReplayFilter, Result as StorageResult,
    StorageError, StoreStats,
};

/// A message accepted by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

/// Transport that records published messages in memory.
#[derive(Default)]
pub struct RecordingTransport {
    sent: RwLock<Vec<SentMessage>>,
    attempts: RwLock<usize>,
    fail_next: RwLock<usize>,
    fail_always: RwLock<bool>,
    close_calls: RwLock<usize>,
    delay: RwLock<Option<Duration>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes.
    pub async fn fail_next(&self, count: usize) {
        *self.fail_next.write().await = count;
    }

    pub async fn set_fail_always(&self, fail: bool) {
        *self.fail_always.write().await = fail;
    }

    /// Make every publish take `delay` before it completes.
    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.write().await = Some(delay);
    }

    pub async fn sent(&self) -> Vec<SentMessage> {
        self.sent.read().await.clone()
    }

    /// Decoded events in publish order.
    pub async fn sent_events(&self) -> Vec<Event> {
        self.sent
            .read()
            .await
            .iter()
            .map(|sent| Event::from_json(&sent.message.body).expect("recorded body is an event"))
            .collect()
    }

    /// Publish calls, including failed ones.
    pub async fn attempts(&self) -> usize {
        *self.attempts.read().await
    }

    /// Sizes of consecutive runs sharing a batch id, in publish order.
    /// Untagged messages count as batches of one.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        let sent = self.sent.read().await;
        let mut sizes: Vec<usize> = Vec::new();
        let mut current: Option<&str> = None;

        for message in sent.iter() {
            let batch_id = message.message.batch.as_ref().map(|tag| tag.batch_id.as_str());
            match (batch_id, current) {
                (Some(id), Some(previous)) if id == previous => {
                    if let Some(last) = sizes.last_mut() {
                        *last += 1;
                    }
                }
                _ => sizes.push(1),
            }
            current = batch_id;
        }
        sizes
    }

    pub async fn close_calls(&self) -> usize {
        *self.close_calls.read().await
    }

    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> BusResult<()> {
        *self.attempts.write().await += 1;
        let delay = *self.delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if *self.fail_always.read().await {
            return Err(BusError::Publish("Simulated broker failure".to_string()));
        }
        {
            let mut fail_next = self.fail_next.write().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(BusError::Publish("Simulated broker failure".to_string()));
            }
        }

        self.sent.write().await.push(SentMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        *self.close_calls.write().await += 1;
        Ok(())
    }
}

/// Acknowledgement recorded by [`AckLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Reject { requeue: bool },
}

/// Shared log of acknowledgements, keyed by delivery tag.
#[derive(Clone, Default)]
pub struct AckLog {
    entries: Arc<Mutex<Vec<(u64, AckAction)>>>,
}

impl AckLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// An inbound message with a raw body whose acknowledgement lands in this log.
    pub fn message(&self, delivery_tag: u64, body: impl Into<Vec<u8>>) -> InboundMessage {
        InboundMessage::new(
            body.into(),
            "test",
            delivery_tag,
            false,
            Arc::new(RecordingAcker {
                delivery_tag,
                log: self.clone(),
            }),
        )
    }

    /// An inbound message carrying `event`, routed by its type.
    pub fn event_message(&self, delivery_tag: u64, event: &Event) -> InboundMessage {
        let body = event.to_json().expect("test event encodes");
        let mut message = self.message(delivery_tag, body);
        message.routing_key = event.event_type().to_string();
        message
    }

    pub async fn entries(&self) -> Vec<(u64, AckAction)> {
        self.entries.lock().await.clone()
    }

    /// Last action recorded for `delivery_tag`.
    pub async fn action(&self, delivery_tag: u64) -> Option<AckAction> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .find(|(tag, _)| *tag == delivery_tag)
            .map(|(_, action)| *action)
    }

    pub async fn with_action(&self, action: AckAction) -> Vec<u64> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, recorded)| *recorded == action)
            .map(|(tag, _)| *tag)
            .collect()
    }
}

/// Acknowledger writing into an [`AckLog`].
pub struct RecordingAcker {
    delivery_tag: u64,
    log: AckLog,
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> BusResult<()> {
        self.log
            .entries
            .lock()
            .await
            .push((self.delivery_tag, AckAction::Ack));
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> BusResult<()> {
        self.log
            .entries
            .lock()
            .await
            .push((self.delivery_tag, AckAction::Reject { requeue }));
        Ok(())
    }
}

/// A message stream fed by the returned sender. Dropping the sender ends the stream.
pub fn message_channel() -> (mpsc::UnboundedSender<InboundMessage>, MessageStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Box::pin(UnboundedReceiverStream::new(rx)))
}

/// Event store that keeps events in memory.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<HashMap<String, Event>>,
    initialized: RwLock<bool>,
    closed: RwLock<bool>,
    fail_on_store: RwLock<bool>,
    fail_on_read: RwLock<bool>,
    store_delay: RwLock<Option<Duration>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_store(&self, fail: bool) {
        *self.fail_on_store.write().await = fail;
    }

    pub async fn set_fail_on_read(&self, fail: bool) {
        *self.fail_on_read.write().await = fail;
    }

    /// Make every `store_event` take `delay` before it completes.
    pub async fn set_store_delay(&self, delay: Duration) {
        *self.store_delay.write().await = Some(delay);
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    async fn check_read(&self) -> StorageResult<()> {
        if *self.fail_on_read.read().await {
            return Err(StorageError::Unavailable("Simulated read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn initialize_schema(&self) -> StorageResult<()> {
        *self.initialized.write().await = true;
        Ok(())
    }

    async fn store_event(&self, event: &Event) -> bool {
        let delay = *self.store_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_on_store.read().await {
            return false;
        }
        let mut events = self.events.write().await;
        if events.contains_key(event.id()) {
            return false;
        }
        events.insert(event.id().to_string(), event.clone());
        true
    }

    async fn store_events(&self, events: &[Event]) -> usize {
        if *self.fail_on_store.read().await {
            return 0;
        }
        let mut stored = self.events.write().await;
        let mut inserted = 0;
        for event in events {
            if !stored.contains_key(event.id()) {
                stored.insert(event.id().to_string(), event.clone());
                inserted += 1;
            }
        }
        inserted
    }

    async fn get_event_by_id(&self, event_id: &str) -> StorageResult<Option<Event>> {
        self.check_read().await?;
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn replay_events(&self, filter: &ReplayFilter) -> StorageResult<Vec<Event>> {
        self.check_read().await?;
        let mut events: Vec<Event> = self
            .events
            .read()
            .await
            .values()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        events.sort_by(replay_order);
        if let Some(limit) = filter.limit {
            events.truncate(limit as usize);
        }
        Ok(events)
    }

    async fn count_events(&self, filter: &ReplayFilter) -> StorageResult<u64> {
        self.check_read().await?;
        let events = self.events.read().await;
        Ok(events.values().filter(|event| filter.matches(event)).count() as u64)
    }

    async fn analyze_performance(&self) -> StorageResult<PerformanceReport> {
        self.check_read().await?;
        let rows = self.events.read().await.len() as i64;
        Ok(PerformanceReport {
            table: "events".to_string(),
            row_count: rows,
            estimated_rows: rows,
            ..Default::default()
        })
    }

    async fn stats(&self) -> StoreStats {
        if *self.closed.read().await {
            return StoreStats::default();
        }
        StoreStats {
            pooled: true,
            pool_size: 1,
            idle_connections: 1,
        }
    }

    async fn close(&self) {
        *self.closed.write().await = true;
    }
}
