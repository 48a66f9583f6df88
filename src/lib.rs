//! eventbus - Event-driven messaging core
//!
//! Reliable publish/subscribe over an AMQP broker with size/byte/time
//! triggered batching, at-least-once consumption with manual acknowledgment,
//! and a replayable PostgreSQL event log.
//!
//! ```text
//! producer -> EventBusService -> EventStore (persist)
//!                             -> BatchPublisher -> exchange "events"
//!                                                   -> queue -> BatchConsumer / Subscriber -> handlers
//! ```

pub mod bus;
pub mod config;
pub mod event;
pub mod service;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use event::{Event, EventError, Payload};
pub use service::{EventBusService, ServiceError};
