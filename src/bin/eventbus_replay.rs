//! eventbus-replay: Event log replay
//!
//! Reads events from the PostgreSQL event log and writes them to stdout as
//! JSON lines, oldest first.
//!
//! ## Configuration
//! - EVENTBUS_CONFIG: YAML config file (storage section is used)
//! - EVENTBUS__STORAGE__URL: PostgreSQL URL override
//! - EVENTBUS_REPLAY_TYPE: only events of this type
//! - EVENTBUS_REPLAY_START / EVENTBUS_REPLAY_END: inclusive RFC 3339 bounds
//! - EVENTBUS_REPLAY_LIMIT: maximum number of events

use std::io::Write;

use chrono::{DateTime, Utc};
use tracing::info;

use eventbus::config::Config;
use eventbus::storage::{EventStore, PostgresEventStore, ReplayFilter};
use eventbus::utils::bootstrap::init_tracing;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_timestamp(name: &str) -> Result<Option<DateTime<Utc>>, Box<dyn std::error::Error>> {
    match env_var(name) {
        Some(value) => {
            let parsed = DateTime::parse_from_rfc3339(&value)
                .map_err(|e| format!("{} must be an RFC 3339 timestamp: {}", name, e))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

fn filter_from_env() -> Result<ReplayFilter, Box<dyn std::error::Error>> {
    let mut filter = ReplayFilter::new();
    if let Some(event_type) = env_var("EVENTBUS_REPLAY_TYPE") {
        filter = filter.of_type(event_type);
    }
    if let Some(start) = env_timestamp("EVENTBUS_REPLAY_START")? {
        filter = filter.since(start);
    }
    if let Some(end) = env_timestamp("EVENTBUS_REPLAY_END")? {
        filter = filter.until(end);
    }
    if let Some(limit) = env_var("EVENTBUS_REPLAY_LIMIT") {
        filter = filter.limit(limit.parse()?);
    }
    Ok(filter)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let filter = filter_from_env()?;

    let store = PostgresEventStore::new(&config.storage)?;
    let events = store.replay_events(&filter).await?;
    store.close().await;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for event in &events {
        out.write_all(&event.to_json()?)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    info!(count = events.len(), ?filter, "Replay complete");
    Ok(())
}
