//! In-process broker
//!
//! Behaves like a single durable broker shared by every handle cloned from
//! it: FIFO per queue, manual acknowledgement, head-of-queue redelivery on
//! `nack(requeue)`. Used for single-process runs and in tests.

use crate::queue::traits::{AckMode, Delivery, QueueConnector, QueueError, QueueResult, TaskQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, (String, Vec<u8>)>,
    next_tag: u64,
    offline: bool,
}

impl BrokerState {
    fn ensure_online(&self) -> QueueResult<()> {
        if self.offline {
            return Err(QueueError::Connection("broker is offline".to_string()));
        }
        Ok(())
    }

    fn queue_mut(&mut self, name: &str) -> QueueResult<&mut VecDeque<Vec<u8>>> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }
}

/// Handle onto a shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the broker: every operation fails with a connection
    /// error and in-flight deliveries go back to the head of their queues
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.offline = true;

        let mut pending: Vec<(u64, (String, Vec<u8>))> = state.unacked.drain().collect();
        pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, payload)) in pending {
            if let Some(ready) = state.queues.get_mut(&queue) {
                ready.push_front(payload);
            }
        }
    }

    /// Brings the broker back after `disconnect`
    pub fn reconnect(&self) {
        self.lock().offline = false;
    }

    /// Number of deliveries handed out but not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn declare(&self, queue: &str, _durable: bool) -> QueueResult<()> {
        let mut state = self.lock();
        state.ensure_online()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> QueueResult<()> {
        let mut state = self.lock();
        state.ensure_online()?;
        state.queue_mut(queue)?.push_back(payload.to_vec());
        Ok(())
    }

    async fn get_one(&self, queue: &str, mode: AckMode) -> QueueResult<Option<Delivery>> {
        let mut state = self.lock();
        state.ensure_online()?;

        let payload = match state.queue_mut(queue)?.pop_front() {
            Some(payload) => payload,
            None => return Ok(None),
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        if mode == AckMode::Manual {
            state
                .unacked
                .insert(tag, (queue.to_string(), payload.clone()));
        }

        Ok(Some(Delivery { tag, payload }))
    }

    async fn ack(&self, tag: u64) -> QueueResult<()> {
        let mut state = self.lock();
        state.ensure_online()?;
        state
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(QueueError::UnknownDeliveryTag(tag))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> QueueResult<()> {
        let mut state = self.lock();
        state.ensure_online()?;

        let (queue, payload) = state
            .unacked
            .remove(&tag)
            .ok_or(QueueError::UnknownDeliveryTag(tag))?;

        if requeue {
            state.queue_mut(&queue)?.push_front(payload);
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> QueueResult<u32> {
        let mut state = self.lock();
        state.ensure_online()?;
        Ok(state.queue_mut(queue)?.len() as u32)
    }
}

/// Connector handing out handles onto one shared in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryQueue,
}

impl MemoryConnector {
    pub fn new(broker: MemoryQueue) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryQueue {
        &self.broker
    }
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    async fn connect(&self) -> QueueResult<Arc<dyn TaskQueue>> {
        self.broker.lock().ensure_online()?;
        Ok(Arc::new(self.broker.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue_with(name: &str, payloads: &[&[u8]]) -> MemoryQueue {
        let queue = MemoryQueue::new();
        queue.declare(name, true).await.unwrap();
        for payload in payloads {
            queue.publish(name, payload).await.unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue_with("q", &[b"one", b"two"]).await;

        let first = queue.get_one("q", AckMode::Auto).await.unwrap().unwrap();
        let second = queue.get_one("q", AckMode::Auto).await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(queue.get_one("q", AckMode::Auto).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_manual_ack_and_nack() {
        let queue = queue_with("q", &[b"one", b"two"]).await;

        let first = queue.get_one("q", AckMode::Manual).await.unwrap().unwrap();
        assert_eq!(queue.unacked_count(), 1);
        queue.nack(first.tag, true).await.unwrap();
        assert_eq!(queue.depth("q").await.unwrap(), 2);

        let again = queue.get_one("q", AckMode::Manual).await.unwrap().unwrap();
        assert_eq!(again.payload, b"one");
        queue.ack(again.tag).await.unwrap();
        assert_eq!(queue.unacked_count(), 0);
        assert_eq!(queue.depth("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let queue = queue_with("q", &[b"poison"]).await;
        let delivery = queue.get_one("q", AckMode::Manual).await.unwrap().unwrap();
        queue.nack(delivery.tag, false).await.unwrap();
        assert_eq!(queue.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tag_and_queue() {
        let queue = MemoryQueue::new();
        assert!(matches!(queue.ack(9).await, Err(QueueError::UnknownDeliveryTag(9))));
        assert!(matches!(
            queue.publish("missing", b"x").await,
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_redelivers_unacked() {
        let queue = queue_with("q", &[b"one", b"two"]).await;
        let _in_flight = queue.get_one("q", AckMode::Manual).await.unwrap().unwrap();

        queue.disconnect();
        let err = queue.depth("q").await.unwrap_err();
        assert!(err.is_connection());

        queue.reconnect();
        assert_eq!(queue.unacked_count(), 0);
        let redelivered = queue.get_one("q", AckMode::Auto).await.unwrap().unwrap();
        assert_eq!(redelivered.payload, b"one");
    }

    #[tokio::test]
    async fn test_connector_shares_broker() {
        let connector = MemoryConnector::default();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();

        a.declare("q", true).await.unwrap();
        a.publish("q", b"hello").await.unwrap();
        assert_eq!(b.depth("q").await.unwrap(), 1);

        connector.broker().disconnect();
        assert!(connector.connect().await.is_err());
    }
}
