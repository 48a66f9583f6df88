//! Per-event-type handler dispatch.
//!
//! Each message is decoded and handed to every handler registered for its
//! event type, in registration order. A handler failure stops dispatch and
//! leaves the message unacknowledged so the broker redelivers it once the
//! consumer goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use lapin::{options::BasicCancelOptions, types::FieldTable, Channel};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::transport::{consume_queue, delivery_stream, InboundMessage, MessageStream};
use super::{EventHandler, Result};

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every handler succeeded; acknowledged.
    Handled,
    /// No handler for the event type; acknowledged.
    Unhandled,
    /// Body was not an event; rejected without requeue.
    Malformed,
    /// A handler failed; left unacknowledged.
    HandlerFailed,
}

/// Counters for a [`Subscriber`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SubscriberMetrics {
    pub received: u64,
    pub acked: u64,
    pub rejected: u64,
    pub unacked: u64,
}

struct Consumption {
    channel: Option<(Channel, String)>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Routes events to handlers registered by event type.
pub struct Subscriber {
    exchange: String,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    consumption: Mutex<Option<Consumption>>,
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    unacked: AtomicU64,
}

impl Subscriber {
    /// Subscriber whose queues bind to `exchange`.
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            handlers: RwLock::new(HashMap::new()),
            consumption: Mutex::new(None),
            received: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            unacked: AtomicU64::new(0),
        }
    }

    /// Add `handler` after any already registered for `event_type`.
    pub async fn register_handler(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let event_type = event_type.into();
        let mut handlers = self.handlers.write().await;
        let list = handlers.entry(event_type.clone()).or_default();
        list.push(handler);
        debug!(event_type = %event_type, handlers = list.len(), "Registered handler");
    }

    /// Event types with at least one handler.
    pub async fn handled_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Decode one message, run its handlers and settle it with the broker.
    pub async fn process_message(&self, message: InboundMessage) -> DispatchOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        let event = match message.decode() {
            Ok(event) => Arc::new(event),
            Err(e) => {
                warn!(
                    delivery_tag = message.delivery_tag,
                    error = %e,
                    "Malformed message, rejecting"
                );
                if message.reject_logged(false).await {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
                return DispatchOutcome::Malformed;
            }
        };

        // Cloned so registration is not blocked while handlers run.
        let handlers = self
            .handlers
            .read()
            .await
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(event_type = %event.event_type(), "No handler registered, acknowledging");
            if message.ack_logged().await {
                self.acked.fetch_add(1, Ordering::Relaxed);
            }
            return DispatchOutcome::Unhandled;
        }

        let span = tracing::info_span!(
            "bus.consume",
            event_id = %event.id(),
            event_type = %event.event_type()
        );

        let failed = async {
            for (position, handler) in handlers.iter().enumerate() {
                if let Err(e) = handler.handle(Arc::clone(&event)).await {
                    error!(position, error = %e, "Handler failed, leaving message unacknowledged");
                    return true;
                }
            }
            false
        }
        .instrument(span)
        .await;

        if failed {
            self.unacked.fetch_add(1, Ordering::Relaxed);
            return DispatchOutcome::HandlerFailed;
        }

        if message.ack_logged().await {
            self.acked.fetch_add(1, Ordering::Relaxed);
        }
        DispatchOutcome::Handled
    }

    /// Declare `queue`, bind it with `binding_key` and dispatch its messages
    /// on a background task until [`stop`](Self::stop).
    pub async fn consume(
        self: &Arc<Self>,
        channel: Channel,
        queue: &str,
        binding_key: &str,
    ) -> Result<()> {
        let consumer_tag = format!("eventbus-subscriber-{}", Uuid::new_v4());
        let consumer = consume_queue(
            &channel,
            queue,
            &self.exchange,
            binding_key,
            FieldTable::default(),
            &consumer_tag,
        )
        .await?;

        info!(queue = %queue, consumer_tag = %consumer_tag, "Subscriber consuming");
        self.spawn(delivery_stream(consumer), Some((channel, consumer_tag)))
            .await;
        Ok(())
    }

    /// Dispatch messages from `stream` on a background task.
    pub async fn consume_stream(self: &Arc<Self>, stream: MessageStream) {
        self.spawn(stream, None).await;
    }

    async fn spawn(self: &Arc<Self>, stream: MessageStream, channel: Option<(Channel, String)>) {
        let (shutdown, signal) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).run(stream, signal));

        let previous = self.consumption.lock().await.replace(Consumption {
            channel,
            shutdown,
            task,
        });
        if let Some(previous) = previous {
            warn!("Subscriber already consuming, stopping previous consumer");
            Self::shutdown(previous).await;
        }
    }

    async fn run(self: Arc<Self>, mut stream: MessageStream, mut signal: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = signal.changed() => break,
                next = stream.next() => match next {
                    Some(message) => {
                        self.process_message(message).await;
                    }
                    None => {
                        warn!("Subscriber stream ended");
                        break;
                    }
                },
            }
        }
    }

    async fn shutdown(consumption: Consumption) {
        if let Some((channel, consumer_tag)) = &consumption.channel {
            if let Err(e) = channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
            }
        }
        let _ = consumption.shutdown.send(true);
        if let Err(e) = consumption.task.await {
            warn!(error = %e, "Subscriber task ended abnormally");
        }
    }

    /// Stop consuming. The message in flight, if any, finishes first.
    pub async fn stop(&self) {
        let consumption = self.consumption.lock().await.take();
        if let Some(consumption) = consumption {
            Self::shutdown(consumption).await;
            info!(metrics = ?self.metrics(), "Subscriber stopped");
        }
    }

    pub fn metrics(&self) -> SubscriberMetrics {
        SubscriberMetrics {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unacked: self.unacked.load(Ordering::Relaxed),
        }
    }
}
