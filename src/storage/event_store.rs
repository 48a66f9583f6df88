//! EventStore trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Result;
use crate::event::Event;

/// Filters for [`EventStore::replay_events`]. Bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub limit: Option<u64>,
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only events at or after `start`.
    pub fn since(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Only events at or before `end`.
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn of_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` satisfies every bound (limit aside).
    pub fn matches(&self, event: &Event) -> bool {
        self.start.map_or(true, |start| event.timestamp() >= start)
            && self.end.map_or(true, |end| event.timestamp() <= end)
            && self
                .event_type
                .as_deref()
                .map_or(true, |event_type| event.event_type() == event_type)
    }
}

/// Replay order: timestamp ascending, ties broken by identity ascending.
pub fn replay_order(a: &Event, b: &Event) -> std::cmp::Ordering {
    a.timestamp()
        .cmp(&b.timestamp())
        .then_with(|| a.id().cmp(b.id()))
}

/// Connection state of a store, for health and metrics.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub pooled: bool,
    pub pool_size: u32,
    pub idle_connections: usize,
}

/// Statistics for one index on the events table.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IndexStats {
    pub name: String,
    pub definition: String,
    pub scans: i64,
    pub size_bytes: i64,
}

/// Diagnostics for the events table.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PerformanceReport {
    pub table: String,
    pub row_count: i64,
    pub estimated_rows: i64,
    pub table_size_bytes: i64,
    pub total_size_bytes: i64,
    pub indexes: Vec<IndexStats>,
}

/// Interface for event persistence.
///
/// Expected failures on the write path are reported as `false`/`0` and logged
/// rather than returned, so the publish path never has to handle them.
///
/// Implementations:
/// - `PostgresEventStore`: PostgreSQL storage
/// - `MemoryEventStore`: In-memory store for testing
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create the events table and its indexes if missing.
    async fn initialize_schema(&self) -> Result<()>;

    /// Store one event. Returns `false` on any failure, including a duplicate identity.
    async fn store_event(&self, event: &Event) -> bool;

    /// Store many events, skipping identities already present.
    ///
    /// Returns the number of rows inserted (0 on failure).
    async fn store_events(&self, events: &[Event]) -> usize;

    /// Look up one event. `None` means not found.
    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<Event>>;

    /// Events matching `filter`, in replay order.
    async fn replay_events(&self, filter: &ReplayFilter) -> Result<Vec<Event>>;

    /// Number of events matching `filter` (limit ignored).
    async fn count_events(&self, filter: &ReplayFilter) -> Result<u64>;

    /// Table and index diagnostics.
    async fn analyze_performance(&self) -> Result<PerformanceReport>;

    async fn stats(&self) -> StoreStats;

    /// Release pooled connections. Safe to call repeatedly.
    async fn close(&self);
}
