//! Batching consumer with manual acknowledgement.
//!
//! A receive task appends deliveries to the current batch; a processing task
//! takes up to `batch_size` messages whenever the batch is full or
//! `batch_timeout` elapses. Messages that fail to decode are rejected on their
//! own without requeue. The rest go to the [`BatchHandler`] in one call and are
//! all acked on success or all rejected with requeue on failure.
//!
//! A batch that keeps failing is redelivered indefinitely: there is no attempt
//! cap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable},
    Channel,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::transport::{consume_queue, delivery_stream, InboundMessage, MessageStream};
use super::{BatchHandler, BusError, ErrorCallback, Result, EVENTS_EXCHANGE};

/// Queue and batching settings for a [`BatchConsumer`].
#[derive(Debug, Clone)]
pub struct BatchConsumerConfig {
    pub queue: String,
    pub exchange: String,
    pub binding_key: String,
    /// Messages handed to the handler at most per call.
    pub batch_size: usize,
    /// Longest wait before a partial batch is processed.
    pub batch_timeout: Duration,
    /// Per-message TTL set on the queue.
    pub message_ttl: Duration,
    /// Queue length limit set on the queue.
    pub max_queue_length: u32,
}

impl BatchConsumerConfig {
    pub fn new(queue: impl Into<String>, binding_key: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: EVENTS_EXCHANGE.to_string(),
            binding_key: binding_key.into(),
            batch_size: 100,
            batch_timeout: Duration::from_secs(1),
            message_ttl: Duration::from_secs(24 * 60 * 60),
            max_queue_length: 100_000,
        }
    }

    /// Unacknowledged deliveries the broker may push: two batches.
    pub fn prefetch_count(&self) -> u16 {
        self.batch_size
            .saturating_mul(2)
            .clamp(1, u16::MAX as usize) as u16
    }

    /// Queue arguments bounding broker-side backlog.
    pub fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(self.message_ttl.as_millis() as i64),
        );
        arguments.insert(
            "x-max-length".into(),
            AMQPValue::LongLongInt(i64::from(self.max_queue_length)),
        );
        arguments
    }
}

/// Counters for a [`BatchConsumer`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchConsumerMetrics {
    pub batches_processed: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub messages_rejected: u64,
}

struct Inner {
    config: BatchConsumerConfig,
    handler: Arc<dyn BatchHandler>,
    on_error: Option<ErrorCallback>,
    batch: Mutex<Vec<InboundMessage>>,
    batch_ready: Notify,
    accepting: AtomicBool,
    batches_processed: AtomicU64,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    messages_rejected: AtomicU64,
}

struct Running {
    consumer: Option<(Channel, String)>,
    intake_stop: watch::Sender<bool>,
    intake: Option<JoinHandle<()>>,
    processor_stop: watch::Sender<bool>,
    processor: JoinHandle<()>,
}

/// Consumes a queue in batches.
pub struct BatchConsumer {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl BatchConsumer {
    pub fn new(
        config: BatchConsumerConfig,
        handler: Arc<dyn BatchHandler>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                on_error,
                batch: Mutex::new(Vec::new()),
                batch_ready: Notify::new(),
                accepting: AtomicBool::new(false),
                batches_processed: AtomicU64::new(0),
                messages_processed: AtomicU64::new(0),
                messages_failed: AtomicU64::new(0),
                messages_rejected: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BatchConsumerConfig {
        &self.inner.config
    }

    /// Declare and bind the queue, set prefetch and start consuming.
    pub async fn start(&self, channel: Channel) -> Result<()> {
        let config = &self.inner.config;
        if self.is_running().await {
            warn!(queue = %config.queue, "Batch consumer already running");
            return Ok(());
        }

        channel
            .basic_qos(config.prefetch_count(), BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer_tag = format!("eventbus-batch-{}", Uuid::new_v4());
        let consumer = consume_queue(
            &channel,
            &config.queue,
            &config.exchange,
            &config.binding_key,
            config.queue_arguments(),
            &consumer_tag,
        )
        .await?;

        info!(
            queue = %config.queue,
            batch_size = config.batch_size,
            prefetch = config.prefetch_count(),
            "Batch consumer started"
        );
        self.spawn(delivery_stream(consumer), Some((channel, consumer_tag)))
            .await;
        Ok(())
    }

    /// Consume messages from `stream` instead of a broker queue.
    pub async fn start_with_stream(&self, stream: MessageStream) {
        self.spawn(stream, None).await;
    }

    async fn spawn(&self, stream: MessageStream, consumer: Option<(Channel, String)>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            warn!(queue = %self.inner.config.queue, "Batch consumer already running");
            return;
        }

        self.inner.accepting.store(true, Ordering::SeqCst);
        let (intake_stop, intake_signal) = watch::channel(false);
        let (processor_stop, processor_signal) = watch::channel(false);

        let intake = tokio::spawn(Inner::receive(
            Arc::clone(&self.inner),
            stream,
            intake_signal,
        ));
        let processor = tokio::spawn(Inner::process(
            Arc::clone(&self.inner),
            processor_signal,
        ));

        *running = Some(Running {
            consumer,
            intake_stop,
            intake: Some(intake),
            processor_stop,
            processor,
        });
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Messages received but not yet handed to the handler.
    pub async fn buffered(&self) -> usize {
        self.inner.batch.lock().await.len()
    }

    /// Stop receiving. Buffered messages are still processed until [`stop`](Self::stop).
    pub async fn cancel(&self) {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return;
        };
        let Some(intake) = running.intake.take() else {
            return;
        };

        self.inner.accepting.store(false, Ordering::SeqCst);
        if let Some((channel, consumer_tag)) = &running.consumer {
            if let Err(e) = channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel consumer");
            }
        }
        let _ = running.intake_stop.send(true);
        if let Err(e) = intake.await {
            warn!(error = %e, "Batch consumer intake ended abnormally");
        }
        debug!(queue = %self.inner.config.queue, "Batch consumer intake cancelled");
    }

    /// Stop receiving and processing, requeue any partial batch and return the
    /// final counters. Calling again only returns the counters.
    pub async fn stop(&self) -> BatchConsumerMetrics {
        self.cancel().await;

        let running = self.running.lock().await.take();
        let Some(running) = running else {
            return self.metrics();
        };

        let _ = running.processor_stop.send(true);
        if let Err(e) = running.processor.await {
            warn!(error = %e, "Batch consumer processor ended abnormally");
        }

        let leftover: Vec<InboundMessage> = self.inner.batch.lock().await.drain(..).collect();
        if !leftover.is_empty() {
            info!(count = leftover.len(), "Requeuing partial batch");
            for message in &leftover {
                message.reject_logged(true).await;
            }
        }

        let metrics = self.metrics();
        info!(
            queue = %self.inner.config.queue,
            batches = metrics.batches_processed,
            processed = metrics.messages_processed,
            failed = metrics.messages_failed,
            rejected = metrics.messages_rejected,
            "Batch consumer stopped"
        );
        metrics
    }

    pub fn metrics(&self) -> BatchConsumerMetrics {
        BatchConsumerMetrics {
            batches_processed: self.inner.batches_processed.load(Ordering::Relaxed),
            messages_processed: self.inner.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.inner.messages_failed.load(Ordering::Relaxed),
            messages_rejected: self.inner.messages_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    async fn receive(
        self: Arc<Self>,
        mut stream: MessageStream,
        mut signal: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = signal.changed() => break,
                next = stream.next() => match next {
                    Some(message) => self.enqueue(message).await,
                    None => {
                        warn!(queue = %self.config.queue, "Delivery stream ended");
                        break;
                    }
                },
            }
        }
    }

    async fn enqueue(&self, message: InboundMessage) {
        if !self.accepting.load(Ordering::SeqCst) {
            message.reject_logged(true).await;
            return;
        }

        let len = {
            let mut batch = self.batch.lock().await;
            batch.push(message);
            batch.len()
        };
        if len == self.config.batch_size {
            self.batch_ready.notify_one();
        }
    }

    async fn process(self: Arc<Self>, mut signal: watch::Receiver<bool>) {
        loop {
            let deadline = tokio::time::Instant::now() + self.config.batch_timeout;
            loop {
                tokio::select! {
                    _ = signal.changed() => return,
                    _ = self.batch_ready.notified() => {
                        // A wake left over from a batch already drained is ignored.
                        if self.batch.lock().await.len() >= self.config.batch_size {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
            self.drain().await;
        }
    }

    /// Process batches until fewer than `batch_size` messages remain buffered.
    async fn drain(&self) {
        loop {
            let (batch, more) = {
                let mut buffered = self.batch.lock().await;
                if buffered.is_empty() {
                    return;
                }
                let take = buffered.len().min(self.config.batch_size.max(1));
                let batch: Vec<InboundMessage> = buffered.drain(..take).collect();
                (batch, buffered.len() >= self.config.batch_size)
            };

            self.process_batch(batch).await;
            if !more {
                return;
            }
        }
    }

    async fn process_batch(&self, batch: Vec<InboundMessage>) {
        let mut events = Vec::with_capacity(batch.len());
        let mut messages = Vec::with_capacity(batch.len());

        for message in batch {
            match message.decode() {
                Ok(event) => {
                    events.push(event);
                    messages.push(message);
                }
                Err(e) => {
                    warn!(
                        delivery_tag = message.delivery_tag,
                        error = %e,
                        "Malformed message in batch, rejecting"
                    );
                    if message.reject_logged(false).await {
                        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if events.is_empty() {
            return;
        }
        let count = events.len() as u64;

        match self.handler.handle_batch(events).await {
            Ok(()) => {
                for message in &messages {
                    message.ack_logged().await;
                }
                self.batches_processed.fetch_add(1, Ordering::Relaxed);
                self.messages_processed.fetch_add(count, Ordering::Relaxed);
                debug!(queue = %self.config.queue, count, "Processed batch");
            }
            Err(e) => {
                error!(
                    queue = %self.config.queue,
                    count,
                    error = %e,
                    "Batch handler failed, requeuing batch"
                );
                for message in &messages {
                    message.reject_logged(true).await;
                }
                self.messages_failed.fetch_add(count, Ordering::Relaxed);
                if let Some(on_error) = &self.on_error {
                    on_error(&e, &messages);
                }
            }
        }
    }
}
