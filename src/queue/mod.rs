//! Message queue plumbing
//!
//! Workers consume tasks from one durable queue and publish results and
//! heartbeats to a second one the coordinator consumes. Each execution unit
//! holds its own connection, opened through a `QueueConnector`.

pub mod amqp;
pub mod memory;
pub mod messages;
pub mod traits;

pub use amqp::{AmqpConnector, AmqpQueue};
pub use memory::{MemoryConnector, MemoryQueue};
pub use messages::{CrawlResult, Heartbeat, Message, MessageError, ResultStatus, Task, TaskStatus};
pub use traits::{
    declare_queues, AckMode, Delivery, QueueConnector, QueueError, QueueResult, TaskQueue,
};
