//! Batching publisher.
//!
//! Events accumulate in memory and are flushed to the exchange when the batch
//! reaches `batch_size`, when its encoded size exceeds `max_batch_bytes`, or
//! when `flush_interval` passes without a further append. Every message of a
//! flush carries the same `batch_id` header and its `batch_index`.
//!
//! A flush that fails puts the whole batch back in front of the live batch and
//! re-arms the timer, so delivery is at-least-once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::transport::{OutboundMessage, Transport};
use super::EVENTS_EXCHANGE;
use crate::event::Event;

/// Batching thresholds for a [`BatchPublisher`].
#[derive(Debug, Clone)]
pub struct BatchPublisherConfig {
    /// Exchange every flush publishes to.
    pub exchange: String,
    /// Events that force a flush.
    pub batch_size: usize,
    /// Accumulated body bytes above which a flush is forced.
    pub max_batch_bytes: usize,
    /// Idle time after the last append before a flush.
    pub flush_interval: Duration,
    /// Delivery mode of published messages.
    pub persistent: bool,
}

impl Default for BatchPublisherConfig {
    fn default() -> Self {
        Self {
            exchange: EVENTS_EXCHANGE.to_string(),
            batch_size: 100,
            max_batch_bytes: 1024 * 1024,
            flush_interval: Duration::from_secs(1),
            persistent: true,
        }
    }
}

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Bytes,
    Timer,
    Manual,
    Close,
}

/// Counters for a [`BatchPublisher`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchPublisherMetrics {
    pub total_messages_sent: u64,
    pub total_batches_sent: u64,
    pub total_bytes_sent: u64,
    pub failed_batches: u64,
    pub pending_messages: usize,
    pub last_flush_trigger: Option<FlushTrigger>,
}

struct Pending {
    message: OutboundMessage,
    routing_key: String,
}

#[derive(Default)]
struct BatchState {
    pending: Vec<Pending>,
    bytes: usize,
    timer: Option<JoinHandle<()>>,
    closed: bool,
    last_trigger: Option<FlushTrigger>,
}

struct Inner {
    config: BatchPublisherConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<BatchState>,
    /// Held for the whole of a flush so batches leave in append order.
    send_lock: Mutex<()>,
    messages_sent: AtomicU64,
    batches_sent: AtomicU64,
    bytes_sent: AtomicU64,
    failed_batches: AtomicU64,
}

/// Publisher that groups events into batches.
pub struct BatchPublisher {
    inner: Arc<Inner>,
}

impl BatchPublisher {
    pub fn new(transport: Arc<dyn Transport>, config: BatchPublisherConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                state: Mutex::new(BatchState::default()),
                send_lock: Mutex::new(()),
                messages_sent: AtomicU64::new(0),
                batches_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                failed_batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &BatchPublisherConfig {
        &self.inner.config
    }

    /// Append `event` to the current batch, flushing if a threshold is crossed.
    ///
    /// Returns `false` if the publisher is closed or the event cannot be
    /// encoded. A failed flush does not fail the append: the events stay queued.
    pub async fn publish(&self, event: &Event, routing_key: &str) -> bool {
        let message = match OutboundMessage::from_event(event, self.inner.config.persistent) {
            Ok(message) => message,
            Err(e) => {
                error!(event_id = %event.id(), error = %e, "Failed to encode event");
                return false;
            }
        };

        let trigger = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                warn!(event_id = %event.id(), "Batch publisher is closed, dropping event");
                return false;
            }

            state.bytes += message.size();
            state.pending.push(Pending {
                message,
                routing_key: routing_key.to_string(),
            });

            let trigger = if state.pending.len() >= self.inner.config.batch_size {
                Some(FlushTrigger::Size)
            } else if state.bytes > self.inner.config.max_batch_bytes {
                Some(FlushTrigger::Bytes)
            } else {
                None
            };

            // Reset the idle timer on every append.
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if trigger.is_none() {
                state.timer = Some(Inner::spawn_timer(&self.inner));
            }
            trigger
        };

        if let Some(trigger) = trigger {
            self.inner.flush(trigger).await;
        }
        true
    }

    /// Send the current batch now.
    ///
    /// Returns `true` when the batch (possibly empty) reached the broker.
    pub async fn flush(&self) -> bool {
        self.inner.flush(FlushTrigger::Manual).await
    }

    /// Events waiting for the next flush.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    pub async fn metrics(&self) -> BatchPublisherMetrics {
        let state = self.inner.state.lock().await;
        BatchPublisherMetrics {
            total_messages_sent: self.inner.messages_sent.load(Ordering::Relaxed),
            total_batches_sent: self.inner.batches_sent.load(Ordering::Relaxed),
            total_bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            failed_batches: self.inner.failed_batches.load(Ordering::Relaxed),
            pending_messages: state.pending.len(),
            last_flush_trigger: state.last_trigger,
        }
    }

    /// Cancel the timer, flush what is left and release the transport.
    ///
    /// Later `publish` calls return `false`. Calling again is a no-op.
    pub async fn close(&self) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return true;
            }
            state.closed = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }

        let flushed = self.inner.flush(FlushTrigger::Close).await;
        if !flushed {
            let lost = self.inner.state.lock().await.pending.len();
            error!(lost, "Final flush failed, pending events dropped");
        }

        if let Err(e) = self.inner.transport.close().await {
            warn!(error = %e, "Failed to release batch publisher transport");
        }

        let metrics = self.metrics().await;
        info!(
            messages = metrics.total_messages_sent,
            batches = metrics.total_batches_sent,
            failed_batches = metrics.failed_batches,
            "Batch publisher closed"
        );
        flushed
    }
}

impl Inner {
    /// Spawn the idle timer. It only holds a weak reference so a dropped
    /// publisher is not kept alive.
    fn spawn_timer(inner: &Arc<Inner>) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let interval = inner.config.flush_interval;

        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                // Detached from the timer handle: resetting the timer must not
                // cancel a flush that has already drained the batch.
                tokio::spawn(async move {
                    inner.flush(FlushTrigger::Timer).await;
                });
            }
        })
    }

    async fn flush(self: &Arc<Self>, trigger: FlushTrigger) -> bool {
        let _sending = self.send_lock.lock().await;

        let (batch, bytes) = {
            let mut state = self.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if state.pending.is_empty() {
                return true;
            }
            state.last_trigger = Some(trigger);
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.bytes),
            )
        };

        let batch_id = Uuid::new_v4().to_string();
        let count = batch.len();

        for (index, pending) in batch.iter().enumerate() {
            let message = pending.message.clone().with_batch(batch_id.as_str(), index);
            let result = self
                .transport
                .publish(&self.config.exchange, &pending.routing_key, &message)
                .await;

            if let Err(e) = result {
                error!(
                    batch_id = %batch_id,
                    ?trigger,
                    index,
                    count,
                    error = %e,
                    "Batch flush failed, re-queuing batch"
                );
                self.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.requeue(batch, bytes).await;
                return false;
            }
        }

        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        debug!(batch_id = %batch_id, ?trigger, count, bytes, "Flushed batch");
        true
    }

    /// Put a failed batch back ahead of anything appended since it was drained.
    async fn requeue(self: &Arc<Self>, mut batch: Vec<Pending>, bytes: usize) {
        let mut state = self.state.lock().await;
        batch.append(&mut state.pending);
        state.pending = batch;
        state.bytes += bytes;

        if !state.closed && state.timer.is_none() {
            state.timer = Some(Inner::spawn_timer(self));
        }
    }
}

#[cfg(test)]
mod tests;
