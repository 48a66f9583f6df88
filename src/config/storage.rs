//! Storage configuration types.

use std::time::Duration;

use serde::Deserialize;

/// PostgreSQL event store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// PostgreSQL connection URI.
    pub url: String,
    /// Connections kept open by the pool.
    pub pool_min: u32,
    /// Upper bound on pooled connections.
    pub pool_max: u32,
    /// Server-side statement timeout.
    pub command_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/events".to_string(),
            pool_min: 5,
            pool_max: 20,
            command_timeout_secs: 60,
        }
    }
}

impl StorageConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
