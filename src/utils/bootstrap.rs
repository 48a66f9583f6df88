//! Bootstrap utilities for eventbus binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

/// Default filter when `EVENTBUS_LOG` is unset or invalid.
const DEFAULT_LOG_FILTER: &str = "info";

/// Initialize tracing with the EVENTBUS_LOG environment variable.
///
/// Defaults to "info" level if EVENTBUS_LOG is not set. Logs go to stderr so
/// stdout stays free for command output. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
