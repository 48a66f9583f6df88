//! Durable, replayable event log.

pub mod event_store;
pub mod postgres;
pub mod schema;

pub use event_store::{
    replay_order, EventStore, IndexStats, PerformanceReport, ReplayFilter, StoreStats,
};
pub use postgres::PostgresEventStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query build error: {0}")]
    Query(#[from] sea_query::error::Error),

    #[error("Payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
