//! Broker seams.
//!
//! `Transport` is the outbound side (publish one message to an exchange),
//! `Acknowledger` the inbound side (ack or reject one delivery). Publishers and
//! consumers only talk to these traits; lapin types implement them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionKind, ConnectionManager};
use super::{BusError, Result};
use crate::event::{Event, EventError};

/// Content type of every message body.
pub const CONTENT_TYPE: &str = "application/json";

/// Header carrying the event identity.
pub const HEADER_EVENT_ID: &str = "event_id";
/// Header carrying the event type.
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Header correlating messages flushed together.
pub const HEADER_BATCH_ID: &str = "batch_id";
/// Header with the position of a message inside its batch.
pub const HEADER_BATCH_INDEX: &str = "batch_index";

/// AMQP delivery modes.
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Best-effort correlation tag for messages sent in one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTag {
    pub batch_id: String,
    pub index: usize,
}

/// One encoded event ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub persistent: bool,
    pub batch: Option<BatchTag>,
}

impl OutboundMessage {
    /// Encode an event as a message.
    pub fn from_event(event: &Event, persistent: bool) -> std::result::Result<Self, EventError> {
        Ok(Self {
            body: event.to_json()?,
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            timestamp: event.timestamp(),
            persistent,
            batch: None,
        })
    }

    /// Tag the message as part of a batch.
    pub fn with_batch(mut self, batch_id: impl Into<String>, index: usize) -> Self {
        self.batch = Some(BatchTag {
            batch_id: batch_id.into(),
            index,
        });
        self
    }

    /// Body length in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// AMQP properties for this message.
    pub fn properties(&self) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            HEADER_EVENT_ID.into(),
            AMQPValue::LongString(self.event_id.clone().into()),
        );
        headers.insert(
            HEADER_EVENT_TYPE.into(),
            AMQPValue::LongString(self.event_type.clone().into()),
        );
        if let Some(tag) = &self.batch {
            headers.insert(
                HEADER_BATCH_ID.into(),
                AMQPValue::LongString(tag.batch_id.clone().into()),
            );
            headers.insert(
                HEADER_BATCH_INDEX.into(),
                AMQPValue::LongLongInt(tag.index as i64),
            );
        }

        let delivery_mode = if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_message_id(self.event_id.clone().into())
            .with_type(self.event_type.clone().into())
            .with_timestamp(self.timestamp.timestamp().max(0) as u64)
            .with_delivery_mode(delivery_mode)
            .with_headers(headers)
    }
}

/// Outbound side of the broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish one message and wait for the broker to confirm it.
    async fn publish(&self, exchange: &str, routing_key: &str, message: &OutboundMessage)
        -> Result<()>;

    /// Release any channel held by this transport.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Transport for Channel {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<()> {
        self.basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions::default(),
            &message.body,
            message.properties(),
        )
        .await
        .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
        .await
        .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.status().connected() {
            return Ok(());
        }
        Channel::close(self, 200, "Channel released")
            .await
            .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
    }
}

/// Transport that owns one channel opened from a [`ConnectionManager`].
///
/// The channel is opened lazily and reopened after any failure, so a retry
/// after a dropped channel gets a fresh one.
pub struct ManagedTransport {
    manager: Arc<ConnectionManager>,
    kind: ConnectionKind,
    channel: Mutex<Option<Channel>>,
}

impl ManagedTransport {
    pub fn new(manager: Arc<ConnectionManager>, kind: ConnectionKind) -> Self {
        Self {
            manager,
            kind,
            channel: Mutex::new(None),
        }
    }

    async fn current_channel(&self) -> Result<Channel> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!(kind = ?self.kind, "Cached channel is closed, reopening");
        }
        let channel = self.manager.channel_of(self.kind).await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }
}

#[async_trait]
impl Transport for ManagedTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<()> {
        let channel = self.current_channel().await?;
        let result = Transport::publish(&channel, exchange, routing_key, message).await;
        if result.is_err() {
            self.channel.lock().await.take();
        }
        result
    }

    async fn close(&self) -> Result<()> {
        match self.channel.lock().await.take() {
            Some(channel) => Transport::close(&channel).await,
            None => Ok(()),
        }
    }
}

/// Inbound side of the broker for one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Acknowledge successful processing.
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery, optionally asking the broker to requeue it.
    async fn reject(&self, requeue: bool) -> Result<()>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<()> {
        Acker::ack(self, BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        Acker::reject(self, BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to reject: {}", e)))
    }
}

/// A message received from a queue, not yet acknowledged.
#[derive(Clone)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Wrap a lapin delivery.
    pub fn from_delivery(delivery: Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.as_str().to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            body: delivery.data,
            acker: Arc::new(delivery.acker),
        }
    }

    /// Decode the body into an event.
    pub fn decode(&self) -> std::result::Result<Event, EventError> {
        Event::from_json(&self.body)
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    /// Ack, logging instead of failing.
    pub(crate) async fn ack_logged(&self) -> bool {
        match self.ack().await {
            Ok(()) => true,
            Err(e) => {
                error!(delivery_tag = self.delivery_tag, error = %e, "Failed to ack message");
                false
            }
        }
    }

    /// Reject, logging instead of failing.
    pub(crate) async fn reject_logged(&self, requeue: bool) -> bool {
        match self.reject(requeue).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    delivery_tag = self.delivery_tag,
                    requeue,
                    error = %e,
                    "Failed to reject message"
                );
                false
            }
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Stream of inbound messages feeding a consumer.
pub type MessageStream = BoxStream<'static, InboundMessage>;

/// Adapt a lapin consumer into a [`MessageStream`]. Delivery errors end the stream.
pub fn delivery_stream(consumer: lapin::Consumer) -> MessageStream {
    consumer
        .take_while(|delivery| {
            let keep = match delivery {
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "Consumer delivery error, ending stream");
                    false
                }
            };
            futures::future::ready(keep)
        })
        .filter_map(|delivery| futures::future::ready(delivery.ok().map(InboundMessage::from_delivery)))
        .boxed()
}

/// Declare a durable queue with `arguments`, bind it to `exchange` and start
/// consuming from it.
pub(crate) async fn consume_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    binding_key: &str,
    arguments: FieldTable,
    consumer_tag: &str,
) -> Result<lapin::Consumer> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments,
        )
        .await
        .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

    channel
        .queue_bind(
            queue,
            exchange,
            binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

    info!(
        queue = %queue,
        exchange = %exchange,
        binding_key = %binding_key,
        "Bound queue to exchange"
    );

    channel
        .basic_consume(
            queue,
            consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
}
