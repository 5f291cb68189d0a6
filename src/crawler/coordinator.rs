//! Crawl coordinator - task generation and result handling
//!
//! This module contains the coordinator loop, which:
//! - Turns stale authors into crawl tasks, holding back while the task
//!   queue is above its high-water mark
//! - Applies worker results to the record store
//! - Re-publishes failed tasks with a growing delay, up to a retry limit
//! - Tracks worker liveness from heartbeats

use crate::config::{Config, CoordinatorConfig};
use crate::crawler::supervisor::Shutdown;
use crate::queue::{AckMode, CrawlResult, Message, QueueResult, ResultStatus, Task, TaskQueue};
use crate::storage::{CrawlIntervals, RecordStore, StorageError};
use crate::{CrawlerError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A failed task waiting out its retry delay
///
/// `delivery` is the unacknowledged result that asked for the retry. It is
/// acknowledged only once the retry is on the task queue, so the broker
/// keeps a copy until then.
#[derive(Debug)]
struct DeferredRetry {
    due: Instant,
    task: Task,
    delivery: Option<u64>,
}

/// Main coordinator structure
///
/// Async methods take `&mut self`: the record store is owned by the
/// coordinator and never shared.
pub struct Coordinator {
    queue: Arc<dyn TaskQueue>,
    store: Box<dyn RecordStore>,
    config: CoordinatorConfig,
    intervals: CrawlIntervals,
    task_queue: String,
    result_queue: String,
    poll_interval: Duration,
    liveness_timeout: chrono::Duration,
    active_nodes: HashMap<String, DateTime<Utc>>,
    deferred: Vec<DeferredRetry>,
}

impl Coordinator {
    pub fn new(queue: Arc<dyn TaskQueue>, store: Box<dyn RecordStore>, config: &Config) -> Self {
        Self {
            queue,
            store,
            config: config.coordinator.clone(),
            intervals: CrawlIntervals::from_config(&config.coordinator),
            task_queue: config.queue.task_queue.clone(),
            result_queue: config.queue.result_queue.clone(),
            poll_interval: config.queue.poll_interval(),
            liveness_timeout: liveness_timeout(config.worker.heartbeat_interval_secs),
            active_nodes: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    /// Swaps in a new broker connection after a reconnect
    ///
    /// Retries still holding a delivery from the old connection are dropped:
    /// the broker redelivers those results and they are handled again.
    pub fn set_queue(&mut self, queue: Arc<dyn TaskQueue>) {
        let before = self.deferred.len();
        self.deferred.retain(|retry| retry.delivery.is_none());
        if self.deferred.len() < before {
            tracing::info!(
                "Dropped {} retries awaiting redelivery of their results",
                before - self.deferred.len()
            );
        }
        self.queue = queue;
    }

    /// Workers heard from recently, with the time their last heartbeat arrived
    pub fn active_nodes(&self) -> &HashMap<String, DateTime<Utc>> {
        &self.active_nodes
    }

    /// Retries waiting for their delay to elapse
    pub fn pending_retries(&self) -> usize {
        self.deferred.len()
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Builds a task for every author due for a crawl
    ///
    /// Returns nothing while the task queue is deeper than the high-water
    /// mark. Each author's `last_crawl` is stamped as its task is created so
    /// the next scan does not pick it up again; a crash before the result is
    /// processed therefore skips that author for one interval.
    pub async fn generate_tasks(&mut self) -> Result<Vec<Task>> {
        let depth = self.queue.depth(&self.task_queue).await?;
        if depth > self.config.queue_high_water_mark {
            tracing::warn!(
                "Task queue holds {} messages (limit {}), skipping generation",
                depth,
                self.config.queue_high_water_mark
            );
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let authors = self.store.get_authors_due_for_crawl(&self.intervals, now)?;
        let mut tasks = Vec::with_capacity(authors.len());

        for author in authors {
            if let Err(e) = self.store.set_last_crawl(author.author_id, now) {
                tracing::error!("Failed to mark {} as queued: {}", author.name, e);
                continue;
            }
            tracing::info!("Generated task for {} ({})", author.name, author.source);
            tasks.push(Task::for_author(&author, now));
        }

        Ok(tasks)
    }

    /// Dispatches one decoded message from the result queue
    ///
    /// Heartbeats only touch the liveness map. Tasks do not belong on this
    /// queue and are dropped.
    pub async fn process_message(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Heartbeat(heartbeat) => {
                tracing::debug!("Heartbeat from {}", heartbeat.node_id);
                self.active_nodes.insert(heartbeat.node_id, Utc::now());
                Ok(())
            }
            Message::Result(result) => self.process_result(result).await,
            Message::Task(task) => {
                tracing::warn!(
                    "Dropping task for {} found on the result queue",
                    task.author_name
                );
                Ok(())
            }
        }
    }

    /// Applies one worker result to the record store
    ///
    /// Success stores the publications; failure goes through the retry
    /// policy. Both stamp the author's `last_crawl`. Results naming no
    /// usable task or an unknown author are dropped without side effects.
    pub async fn process_result(&mut self, result: CrawlResult) -> Result<()> {
        let task = &result.task_data;
        if let Err(e) = task.validate() {
            tracing::warn!("Dropping result from {}: {}", result.node_id, e);
            return Ok(());
        }

        match self.store.touch_last_crawl(task.author_id) {
            Ok(()) => {}
            Err(StorageError::AuthorNotFound(id)) => {
                tracing::warn!("Dropping result for unknown author {}", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match result.status {
            ResultStatus::Success => {
                let written = self
                    .store
                    .upsert_publications(task.author_id, &result.publications)?;
                tracing::info!(
                    "Stored {} publications for {} from {}",
                    written,
                    task.author_name,
                    result.node_id
                );
            }
            ResultStatus::Error => {
                let reason = result.error.as_deref().unwrap_or("unknown error");
                tracing::warn!("Crawl of {} failed: {}", task.author_name, reason);
                self.retry_policy(task).await?;
            }
        }

        Ok(())
    }

    /// Schedules a failed task for re-publication
    ///
    /// Returns whether the task will be retried. A task that has used up
    /// `max_retries` is logged and dropped. A delayed retry is held in
    /// memory; when it comes from `run_once` the result delivery stays
    /// unacknowledged until the retry is published.
    pub async fn retry_policy(&mut self, task: &Task) -> QueueResult<bool> {
        if task.retry_count >= self.config.max_retries {
            tracing::error!(
                "Task for {} failed after {} retries, giving up",
                task.author_name,
                self.config.max_retries
            );
            return Ok(false);
        }

        let delay = self.config.retry_delay(task.retry_count);
        let retry = task.next_retry();
        tracing::info!(
            "Retrying task for {}, attempt {} in {:?}",
            retry.author_name,
            retry.retry_count,
            delay
        );

        if delay.is_zero() {
            self.queue
                .publish_message(&self.task_queue, &Message::from(retry))
                .await?;
        } else {
            self.deferred.push(DeferredRetry {
                due: Instant::now() + delay,
                task: retry,
                delivery: None,
            });
        }
        Ok(true)
    }

    /// Evicts workers whose last heartbeat is older than twice the interval
    pub fn check_node_health(&mut self) -> Vec<String> {
        self.check_node_health_at(Utc::now())
    }

    pub fn check_node_health_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.liveness_timeout;
        let stale: Vec<String> = self
            .active_nodes
            .iter()
            .filter(|(_, last_seen)| now - **last_seen > timeout)
            .map(|(node_id, _)| node_id.clone())
            .collect();

        for node_id in &stale {
            tracing::warn!("Node {} inactive - removing", node_id);
            self.active_nodes.remove(node_id);
        }
        stale
    }

    /// Publishes deferred retries whose delay has elapsed
    pub async fn publish_due_retries(&mut self) -> QueueResult<usize> {
        self.publish_retries(Some(Instant::now())).await
    }

    /// Publishes every deferred retry regardless of its delay
    pub async fn flush_retries(&mut self) -> QueueResult<usize> {
        self.publish_retries(None).await
    }

    async fn publish_retries(&mut self, due_by: Option<Instant>) -> QueueResult<usize> {
        let mut published = 0;

        while let Some(index) = self
            .deferred
            .iter()
            .position(|retry| due_by.map_or(true, |now| retry.due <= now))
        {
            let message = Message::from(self.deferred[index].task.clone());
            self.queue.publish_message(&self.task_queue, &message).await?;
            let retry = self.deferred.remove(index);
            published += 1;

            if let Some(tag) = retry.delivery {
                self.queue.ack(tag).await?;
            }
        }

        Ok(published)
    }

    /// Runs one coordinator iteration
    ///
    /// Publishes due retries, checks liveness, generates and publishes new
    /// tasks, then handles at most one message from the result queue. The
    /// message is acknowledged after it has been applied, or after its
    /// delayed retry has been published. An undecodable message is rejected
    /// without requeue, and a store failure puts the message back for
    /// redelivery. Returns whether a message was handled.
    pub async fn run_once(&mut self) -> Result<bool> {
        self.publish_due_retries().await?;
        self.check_node_health();

        match self.generate_tasks().await {
            Ok(tasks) => {
                for task in tasks {
                    self.queue
                        .publish_message(&self.task_queue, &Message::from(task))
                        .await?;
                }
            }
            Err(e @ CrawlerError::Queue(_)) => return Err(e),
            Err(e) => tracing::error!("Error generating tasks: {}", e),
        }

        let delivery = match self.queue.get_one(&self.result_queue, AckMode::Manual).await? {
            Some(delivery) => delivery,
            None => return Ok(false),
        };

        let message = match Message::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Discarding undecodable message: {}", e);
                self.queue.nack(delivery.tag, false).await?;
                return Ok(true);
            }
        };

        let deferred_before = self.deferred.len();
        match self.process_message(message).await {
            Ok(()) if self.deferred.len() > deferred_before => {
                if let Some(retry) = self.deferred.last_mut() {
                    retry.delivery = Some(delivery.tag);
                }
            }
            Ok(()) => self.queue.ack(delivery.tag).await?,
            Err(e) if e.is_queue_connection() => return Err(e),
            Err(e) => {
                tracing::error!("Error processing result, requeueing: {}", e);
                self.queue.nack(delivery.tag, true).await?;
            }
        }

        Ok(true)
    }

    /// Runs iterations until shutdown, then publishes any deferred retries
    ///
    /// Returns early on any broker failure so the caller can reconnect;
    /// deferred retries are kept for the next run.
    pub async fn run(&mut self, shutdown: &Shutdown) -> Result<()> {
        tracing::info!("Coordinator started");

        while !shutdown.is_triggered() {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e @ CrawlerError::Queue(_)) => return Err(e),
                Err(e) => tracing::error!("Error in coordinator loop: {}", e),
            }

            if shutdown.sleep(self.poll_interval).await {
                break;
            }
        }

        match self.flush_retries().await {
            Ok(0) => {}
            Ok(count) => tracing::info!("Published {} pending retries before exit", count),
            Err(e) => {
                tracing::error!("Failed to publish {} pending retries: {}", self.deferred.len(), e);
                return Err(CrawlerError::Queue(e));
            }
        }

        tracing::info!("Coordinator stopped");
        Ok(())
    }
}

fn liveness_timeout(heartbeat_interval_secs: u64) -> chrono::Duration {
    let secs = heartbeat_interval_secs
        .saturating_mul(2)
        .min(i64::MAX as u64 / 1000);
    chrono::Duration::seconds(secs as i64)
}
