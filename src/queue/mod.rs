//! Durable work queue of file tokens.
//!
//! Delivery is at-least-once: a handler returning `false` (or a consumer
//! that disconnects before acknowledging) puts the token back on the queue.
//! Each consumer holds at most [`PREFETCH`] unacknowledged message.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpQueue;
pub use memory::MemoryQueue;

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH: u16 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O failed: {0}")]
    Io(String),
    #[error("queue operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("queue is closed")]
    Closed,
}

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

/// Callback run for every delivered token. `true` acknowledges the message,
/// `false` rejects it back onto the queue.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, token: &str) -> bool;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue `token` durably.
    async fn publish(&self, token: &str) -> Result<(), QueueError>;

    /// Subscribe `handler` to deliveries. The returned task ends when the
    /// delivery stream ends (broker connection lost or queue closed).
    async fn register_consumer(
        &self,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<JoinHandle<()>, QueueError>;

    /// Park a token that can never be processed.
    async fn dead_letter(&self, token: &str) -> Result<(), QueueError>;
}
