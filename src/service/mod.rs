//! Event bus service.
//!
//! Wires the connection manager, the event store and named batch publishers
//! and consumers into one lifecycle. Every published event is stored first;
//! a storage failure is logged and the publish still goes ahead.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lapin::{options::ExchangeDeclareOptions, types::FieldTable, ExchangeKind};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::bus::{
    BatchConsumer, BatchConsumerMetrics, BatchHandler, BatchPublisher, BatchPublisherMetrics,
    BusError, ConnectionKind, ConnectionManager, ConnectionStats, ErrorCallback,
    ManagedTransport, Publisher, PublisherMetrics, Transport,
};
use crate::config::{Config, ConfigError};
use crate::event::Event;
use crate::storage::{EventStore, PostgresEventStore, ReplayFilter, StorageError, StoreStats};

/// Publisher used when a call names none.
pub const DEFAULT_PUBLISHER: &str = "default";

/// Errors raised by the service lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Broker unreachable after {attempts} attempts")]
    BrokerUnavailable { attempts: usize },

    #[error("Service is not running")]
    NotRunning,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Aggregate counters, serializable for HTTP exposure.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub publishers: BTreeMap<String, BatchPublisherMetrics>,
    pub direct_publisher: Option<PublisherMetrics>,
    pub consumers: BTreeMap<String, BatchConsumerMetrics>,
    pub connection: ConnectionStats,
    pub store: StoreStats,
}

/// Liveness of the service's dependencies.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub broker_connected: bool,
    pub store_ready: bool,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.broker_connected && self.store_ready
    }
}

type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Publishes, persists and consumes events.
pub struct EventBusService {
    config: Config,
    connection: Arc<ConnectionManager>,
    store: Arc<dyn EventStore>,
    postgres: Option<Arc<PostgresEventStore>>,
    /// False when the transport was supplied by the caller; the service then
    /// neither connects to nor declares anything on a broker.
    managed_broker: bool,
    transport_factory: TransportFactory,
    publishers: Mutex<HashMap<String, Arc<BatchPublisher>>>,
    consumers: Mutex<HashMap<String, Arc<BatchConsumer>>>,
    direct: OnceCell<Publisher>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl EventBusService {
    /// Service backed by RabbitMQ and PostgreSQL as configured. Nothing is
    /// connected until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let connection = Arc::new(ConnectionManager::new(config.messaging.connection_config()));
        let postgres = Arc::new(PostgresEventStore::new(&config.storage)?);

        let manager = Arc::clone(&connection);
        let transport_factory: TransportFactory = Arc::new(move || {
            Arc::new(ManagedTransport::new(
                Arc::clone(&manager),
                ConnectionKind::Dedicated,
            )) as Arc<dyn Transport>
        });

        Ok(Self {
            config,
            connection,
            store: postgres.clone(),
            postgres: Some(postgres),
            managed_broker: true,
            transport_factory,
            publishers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            direct: OnceCell::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Service over a caller-supplied store and transport.
    pub fn with_components(
        config: Config,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(config.messaging.connection_config()));
        let transport_factory: TransportFactory = Arc::new(move || Arc::clone(&transport));

        Self {
            config,
            connection,
            store,
            postgres: None,
            managed_broker: false,
            transport_factory,
            publishers: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            direct: OnceCell::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Connect to the broker, open the store and create its schema, and
    /// declare the exchanges. Fails on the first step that fails.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServiceError::NotRunning);
        }

        if self.managed_broker && !self.connection.connect_dedicated().await {
            return Err(ServiceError::BrokerUnavailable {
                attempts: self.connection.config().max_retries,
            });
        }

        if let Some(postgres) = &self.postgres {
            postgres.connect_pool().await?;
        }
        self.store.initialize_schema().await?;

        if self.managed_broker {
            self.declare_exchanges().await?;
        }

        self.started.store(true, Ordering::SeqCst);
        info!(
            exchange = %self.config.messaging.exchange,
            batching = self.config.messaging.enable_batching,
            "Event bus service started"
        );
        Ok(())
    }

    async fn declare_exchanges(&self) -> Result<(), ServiceError> {
        let channel = self.connection.dedicated_channel().await?;
        let messaging = &self.config.messaging;

        for exchange in [&messaging.exchange, &messaging.dead_letter_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    BusError::Connection(format!("Failed to declare exchange {}: {}", exchange, e))
                })?;
            debug!(exchange = %exchange, "Declared exchange");
        }

        if let Err(e) = Transport::close(&channel).await {
            warn!(error = %e, "Failed to close declaration channel");
        }
        Ok(())
    }

    /// The batch publisher registered as `name`, created on first use.
    ///
    /// Returns `None` once the service has been stopped.
    pub async fn create_batch_publisher(&self, name: &str) -> Option<Arc<BatchPublisher>> {
        let mut publishers = self.publishers.lock().await;
        // Checked under the registry lock: stop() sets the flag before it
        // takes the lock, so nothing is registered after it closed the rest.
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        if let Some(publisher) = publishers.get(name) {
            return Some(Arc::clone(publisher));
        }

        let publisher = Arc::new(BatchPublisher::new(
            (self.transport_factory)(),
            self.config.messaging.batch_publisher_config(),
        ));
        publishers.insert(name.to_string(), Arc::clone(&publisher));
        info!(publisher = %name, "Created batch publisher");
        Some(publisher)
    }

    /// Start a batch consumer on `queue` registered as `name`. Returns the
    /// existing consumer if `name` is already registered.
    pub async fn create_batch_consumer(
        &self,
        name: &str,
        queue: &str,
        binding_key: &str,
        handler: Arc<dyn BatchHandler>,
        on_error: Option<ErrorCallback>,
    ) -> Result<Arc<BatchConsumer>, ServiceError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(name) {
            return Ok(Arc::clone(consumer));
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ServiceError::NotRunning);
        }

        let consumer = Arc::new(BatchConsumer::new(
            self.config.messaging.batch_consumer_config(queue, binding_key),
            handler,
            on_error,
        ));
        let channel = self.connection.dedicated_channel().await?;
        consumer.start(channel).await?;

        consumers.insert(name.to_string(), Arc::clone(&consumer));
        info!(consumer = %name, queue = %queue, binding_key = %binding_key, "Created batch consumer");
        Ok(consumer)
    }

    /// Hand an already started consumer to the service so it is reported in
    /// metrics and stopped with the service.
    pub async fn register_batch_consumer(&self, name: &str, consumer: Arc<BatchConsumer>) {
        let previous = self
            .consumers
            .lock()
            .await
            .insert(name.to_string(), consumer);
        if let Some(previous) = previous {
            warn!(consumer = %name, "Replacing registered consumer");
            previous.stop().await;
        }
    }

    async fn direct_publisher(&self) -> &Publisher {
        self.direct
            .get_or_init(|| async {
                Publisher::new(
                    (self.transport_factory)(),
                    self.config.messaging.publisher_config(),
                )
            })
            .await
    }

    /// Store `event`, then publish it.
    ///
    /// Goes through the batch publisher `publisher_name` (default
    /// [`DEFAULT_PUBLISHER`]) when batching is enabled, otherwise straight to
    /// the exchange with retry. The routing key defaults to the event type.
    /// Returns whether the event was accepted for delivery.
    #[tracing::instrument(
        name = "service.publish",
        skip_all,
        fields(event_id = %event.id(), event_type = %event.event_type())
    )]
    pub async fn publish_event(
        &self,
        event: &Event,
        publisher_name: Option<&str>,
        routing_key: Option<&str>,
    ) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Service stopped, not publishing");
            return false;
        }

        if !self.store.store_event(event).await {
            warn!("Event not persisted, publishing anyway");
        }
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Service stopped while storing, not publishing");
            return false;
        }

        let routing_key = routing_key.unwrap_or(event.event_type());
        if self.config.messaging.enable_batching {
            let name = publisher_name.unwrap_or(DEFAULT_PUBLISHER);
            match self.create_batch_publisher(name).await {
                Some(publisher) => publisher.publish(event, routing_key).await,
                None => {
                    warn!(publisher = %name, "Service stopped, not publishing");
                    false
                }
            }
        } else {
            self.direct_publisher()
                .await
                .publish(event, &self.config.messaging.exchange, routing_key, true)
                .await
        }
    }

    /// Publish each event as [`publish_event`](Self::publish_event) does, then
    /// flush the batch publisher. Returns how many events were accepted.
    pub async fn publish_events_batch(
        &self,
        events: &[Event],
        publisher_name: Option<&str>,
        routing_key: Option<&str>,
    ) -> usize {
        let mut accepted = 0;
        for event in events {
            if self.publish_event(event, publisher_name, routing_key).await {
                accepted += 1;
            }
        }

        if self.config.messaging.enable_batching {
            let publisher = self
                .create_batch_publisher(publisher_name.unwrap_or(DEFAULT_PUBLISHER))
                .await;
            if let Some(publisher) = publisher {
                if !publisher.flush().await {
                    warn!(count = events.len(), "Flush after batch publish failed, events stay queued");
                }
            }
        }

        debug!(accepted, total = events.len(), "Published event batch");
        accepted
    }

    /// Events from the store matching `filter`, oldest first.
    pub async fn replay_events(&self, filter: &ReplayFilter) -> Result<Vec<Event>, ServiceError> {
        Ok(self.store.replay_events(filter).await?)
    }

    pub async fn metrics(&self) -> ServiceMetrics {
        let publishers: Vec<(String, Arc<BatchPublisher>)> = self
            .publishers
            .lock()
            .await
            .iter()
            .map(|(name, publisher)| (name.clone(), Arc::clone(publisher)))
            .collect();
        let mut publisher_metrics = BTreeMap::new();
        for (name, publisher) in publishers {
            publisher_metrics.insert(name, publisher.metrics().await);
        }

        let consumers = self
            .consumers
            .lock()
            .await
            .iter()
            .map(|(name, consumer)| (name.clone(), consumer.metrics()))
            .collect();

        ServiceMetrics {
            publishers: publisher_metrics,
            direct_publisher: self.direct.get().map(Publisher::metrics),
            consumers,
            connection: self.connection.stats(),
            store: self.store.stats().await,
        }
    }

    pub async fn health(&self) -> HealthStatus {
        let running = self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst);
        let broker_connected = if self.managed_broker {
            self.connection.is_connected()
        } else {
            running
        };

        HealthStatus {
            broker_connected,
            store_ready: running && self.store.stats().await.pooled,
        }
    }

    /// Shut down in order: stop consumer intake, close publishers (final
    /// flush), stop consumers, disconnect, close the store. Each step is best
    /// effort; a second call is a no-op.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping event bus service");

        let consumers: Vec<(String, Arc<BatchConsumer>)> = self
            .consumers
            .lock()
            .await
            .iter()
            .map(|(name, consumer)| (name.clone(), Arc::clone(consumer)))
            .collect();
        for (_, consumer) in &consumers {
            consumer.cancel().await;
        }

        // Closed publishers stay registered so metrics keep their final counters.
        let publishers: Vec<(String, Arc<BatchPublisher>)> = self
            .publishers
            .lock()
            .await
            .iter()
            .map(|(name, publisher)| (name.clone(), Arc::clone(publisher)))
            .collect();
        for (name, publisher) in publishers {
            if !publisher.close().await {
                error!(publisher = %name, "Publisher closed with undelivered events");
            }
        }
        if let Some(direct) = self.direct.get() {
            direct.close().await;
        }

        for (name, consumer) in consumers {
            let metrics = consumer.stop().await;
            debug!(consumer = %name, ?metrics, "Consumer stopped");
        }

        if self.managed_broker {
            self.connection.disconnect().await;
        }
        self.store.close().await;

        info!("Event bus service stopped");
    }
}

#[cfg(test)]
mod tests;
