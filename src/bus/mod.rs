//! AMQP messaging: connections, publishers and consumers.
//!
//! This module contains:
//! - `ConnectionManager`: pooled and dedicated broker connections
//! - `Publisher`: single-event publish with bounded retry
//! - `BatchPublisher`: size/byte/time triggered batching
//! - `Subscriber`: per-type handler dispatch
//! - `BatchConsumer`: batched consumption with full-batch ack/requeue
//! - `Transport` / `Acknowledger`: the seams between the logic above and lapin

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::event::Event;

pub mod batch_consumer;
pub mod batch_publisher;
pub mod connection;
pub mod publisher;
pub mod subscriber;
pub mod transport;

pub use batch_consumer::{BatchConsumer, BatchConsumerConfig, BatchConsumerMetrics};
pub use batch_publisher::{BatchPublisher, BatchPublisherConfig, BatchPublisherMetrics, FlushTrigger};
pub use connection::{ConnectionConfig, ConnectionKind, ConnectionManager, ConnectionStats};
pub use publisher::{Publisher, PublisherConfig, PublisherMetrics};
pub use subscriber::{DispatchOutcome, Subscriber, SubscriberMetrics};
pub use transport::{
    Acknowledger, BatchTag, InboundMessage, ManagedTransport, MessageStream, OutboundMessage,
    Transport,
};

/// Topic exchange for normal traffic.
pub const EVENTS_EXCHANGE: &str = "events";

/// Topic exchange reserved for dead-lettering.
pub const DEAD_LETTER_EXCHANGE: &str = "events.dlx";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),
}

/// Error returned by application handlers. Opaque to the bus.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Handler for single events, registered per event type on a [`Subscriber`].
pub trait EventHandler: Send + Sync {
    /// Process one event.
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Handler for a batch of events, driven by a [`BatchConsumer`].
pub trait BatchHandler: Send + Sync {
    /// Process a batch of events. Failure requeues the whole batch.
    fn handle_batch(
        &self,
        events: Vec<Event>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Callback invoked when a batch handler fails, with the raw messages of the batch.
pub type ErrorCallback = Arc<dyn Fn(&HandlerError, &[InboundMessage]) + Send + Sync>;

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, event: Arc<Event>) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self.0)(event))
    }
}

/// Adapter turning an async closure into a [`BatchHandler`].
pub struct FnBatchHandler<F>(F);

/// Wrap an async closure as a [`BatchHandler`].
pub fn batch_handler_fn<F, Fut>(f: F) -> Arc<dyn BatchHandler>
where
    F: Fn(Vec<Event>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnBatchHandler(f))
}

impl<F, Fut> BatchHandler for FnBatchHandler<F>
where
    F: Fn(Vec<Event>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle_batch(
        &self,
        events: Vec<Event>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self.0)(events))
    }
}
