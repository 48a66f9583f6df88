//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Events table schema.
#[derive(Iden)]
pub enum Events {
    Table,
    #[iden = "event_id"]
    EventId,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload"]
    Payload,
    #[iden = "created_at"]
    CreatedAt,
}

/// Name of the events table, for catalog queries.
pub const EVENTS_TABLE: &str = "events";

/// Statements creating the events table and its indexes, run in order.
pub const CREATE_EVENTS_TABLE: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    event_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    created_at TIMESTAMPTZ DEFAULT now()
)"#,
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_event_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events (created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp_type ON events (timestamp, event_type)",
    "CREATE INDEX IF NOT EXISTS idx_events_type_timestamp ON events (event_type, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp_desc ON events (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS idx_events_payload_gin ON events USING GIN (payload)",
];
