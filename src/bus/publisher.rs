//! Single-event publisher with bounded fixed-delay retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::transport::{OutboundMessage, Transport};
use crate::event::Event;
use crate::utils::retry::RetryConfig;

/// Retry settings for single-event publishing.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Total attempts per event.
    pub max_retries: usize,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Counters for a [`Publisher`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PublisherMetrics {
    pub published: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Publishes one event at a time.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    published: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl Publisher {
    pub fn new(transport: Arc<dyn Transport>, config: PublisherConfig) -> Self {
        Self {
            transport,
            retry: RetryConfig::new(config.max_retries, config.retry_delay),
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        }
    }

    /// Publish `event` to `exchange` with `routing_key`.
    ///
    /// Returns `false` only after every attempt failed (or the event could not
    /// be encoded); the failure is never silent.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event_id = %event.id(), event_type = %event.event_type(), routing_key = %routing_key)
    )]
    pub async fn publish(
        &self,
        event: &Event,
        exchange: &str,
        routing_key: &str,
        persistent: bool,
    ) -> bool {
        let message = match OutboundMessage::from_event(event, persistent) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Failed to encode event");
                self.failed.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let attempts = self.retry.attempts();
        let backoff = self.retry.backoff().build();

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                self.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
            }

            match self.transport.publish(exchange, routing_key, &message).await {
                Ok(()) => {
                    debug!(exchange = %exchange, "Published event");
                    self.published.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                }
                Err(e) => {
                    error!(attempts, error = %e, "Publish failed, giving up");
                }
            }
        }

        self.failed.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Release the transport.
    pub async fn close(&self) {
        if let Err(e) = self.transport.close().await {
            warn!(error = %e, "Failed to release publisher transport");
        }
    }

    pub fn metrics(&self) -> PublisherMetrics {
        PublisherMetrics {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use crate::test_utils::RecordingTransport;

    fn publisher(transport: Arc<RecordingTransport>, max_retries: usize) -> Publisher {
        Publisher::new(
            transport,
            PublisherConfig {
                max_retries,
                retry_delay: Duration::from_millis(100),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_success_first_attempt() {
        let transport = Arc::new(RecordingTransport::new());
        let publisher = publisher(transport.clone(), 3);
        let event = Event::new("orders.created", Payload::new());

        assert!(publisher.publish(&event, "events", "orders.created", true).await);

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].exchange, "events");
        assert_eq!(sent[0].routing_key, "orders.created");
        assert_eq!(sent[0].message.event_id, event.id());
        assert!(sent[0].message.persistent);
        assert_eq!(publisher.metrics().published, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_recovers_after_transient_failures() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_next(2).await;
        let publisher = publisher(transport.clone(), 3);
        let event = Event::new("orders.created", Payload::new());

        assert!(publisher.publish(&event, "events", "k", false).await);

        let metrics = publisher.metrics();
        assert_eq!(metrics.published, 1);
        assert_eq!(metrics.retries, 2);
        assert_eq!(transport.attempts().await, 3);
        // Same value every attempt
        assert_eq!(transport.sent().await[0].message.event_id, event.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_returns_false_after_exhaustion() {
        let transport = Arc::new(RecordingTransport::new());
        transport.set_fail_always(true).await;
        let publisher = publisher(transport.clone(), 3);
        let event = Event::new("orders.created", Payload::new());

        let started = tokio::time::Instant::now();
        assert!(!publisher.publish(&event, "events", "k", true).await);

        assert_eq!(transport.attempts().await, 3);
        assert!(transport.sent().await.is_empty());
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert_eq!(publisher.metrics().failed, 1);
    }
}
