//! Queue traits and error types
//!
//! This module defines the broker interface every execution unit talks to,
//! and the connector used to (re)open a unit's private connection.

use crate::queue::Message;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Broker connection failed: {0}")]
    Connection(String),

    #[error("Broker operation failed: {0}")]
    Operation(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue not declared: {0}")]
    UnknownQueue(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
}

impl QueueError {
    /// Whether the unit should drop its connection and reconnect
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// How a fetched message is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The broker forgets the message as soon as it is handed out
    Auto,
    /// The receiver must `ack` or `nack` the delivery tag
    Manual,
}

/// A message handed out by `TaskQueue::get_one`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
}

/// Durable FIFO queue with at-least-once delivery
///
/// Unacknowledged manual deliveries are redelivered if the receiver goes
/// away. Every publish is persistent.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Declares a queue, creating it if it does not exist
    async fn declare(&self, queue: &str, durable: bool) -> QueueResult<()>;

    /// Publishes a persistent payload to a queue
    async fn publish(&self, queue: &str, payload: &[u8]) -> QueueResult<()>;

    /// Fetches at most one message without waiting
    async fn get_one(&self, queue: &str, mode: AckMode) -> QueueResult<Option<Delivery>>;

    /// Acknowledges a manual delivery
    async fn ack(&self, tag: u64) -> QueueResult<()>;

    /// Rejects a manual delivery, optionally putting it back on the queue
    async fn nack(&self, tag: u64, requeue: bool) -> QueueResult<()>;

    /// Number of ready messages in a queue
    async fn depth(&self, queue: &str) -> QueueResult<u32>;

    /// Closes the underlying connection
    ///
    /// Manual deliveries that were never acknowledged go back to their
    /// queue. Handles onto a shared in-process broker have nothing to close.
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Encodes and publishes a typed message
    async fn publish_message(&self, queue: &str, message: &Message) -> QueueResult<()> {
        let payload = message.encode()?;
        self.publish(queue, &payload).await
    }
}

/// Opens a fresh broker connection for one execution unit
#[async_trait]
pub trait QueueConnector: Send + Sync {
    async fn connect(&self) -> QueueResult<Arc<dyn TaskQueue>>;
}

/// Declares every queue the crawler uses on a new connection
pub async fn declare_queues(queue: &dyn TaskQueue, names: &[&str]) -> QueueResult<()> {
    for name in names {
        queue.declare(name, true).await?;
    }
    Ok(())
}
