//! Crawl worker
//!
//! A worker pulls one task at a time from the task queue, fetches the
//! author page through a proxy from the shared pool, parses it, and always
//! reports a result for a well-formed task. A separate lightweight task
//! keeps publishing heartbeats while a slow crawl is in progress.

use crate::config::{Config, WorkerConfig};
use crate::crawler::fetcher::{classify_status, PageFetcher};
use crate::crawler::parser::parse_publications;
use crate::crawler::supervisor::Shutdown;
use crate::proxy::{ProxyInfo, ProxyPool};
use crate::queue::{AckMode, CrawlResult, Heartbeat, Message, QueueResult, Task, TaskQueue};
use crate::storage::{Publication, Source};
use crate::FetchError;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Worker {
    node_id: String,
    queue: Arc<dyn TaskQueue>,
    pool: Arc<ProxyPool>,
    fetcher: Arc<dyn PageFetcher>,
    config: WorkerConfig,
    task_queue: String,
    result_queue: String,
    poll_interval: Duration,
}

impl Worker {
    /// Creates a worker with a fresh random node ID
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        pool: Arc<ProxyPool>,
        fetcher: Arc<dyn PageFetcher>,
        config: &Config,
    ) -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().simple().to_string(),
            queue,
            pool,
            fetcher,
            config: config.worker.clone(),
            task_queue: config.queue.task_queue.clone(),
            result_queue: config.queue.result_queue.clone(),
            poll_interval: config.queue.poll_interval(),
        }
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Swaps in a new broker connection after a reconnect
    pub fn set_queue(&mut self, queue: Arc<dyn TaskQueue>) {
        self.queue = queue;
    }

    /// Fetches and parses an author page, retrying over proxies
    ///
    /// Each attempt reserves a proxy and always hands it back afterwards.
    /// Rate-limit and block responses also block the proxy. Parse failures
    /// end the crawl immediately; once attempts run out the last error is
    /// returned.
    pub async fn fetch_and_parse(
        &self,
        url: &str,
        source: Source,
    ) -> Result<Vec<Publication>, FetchError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = FetchError::ProxyExhausted;

        for attempt in 1..=max_attempts {
            let handle = self.pool.acquire().ok_or(FetchError::ProxyExhausted)?;

            let outcome = self.attempt(url, source, handle.proxy()).await;
            if let Err(e) = &outcome {
                if e.blocks_proxy() {
                    self.pool.mark_blocked(&handle);
                }
            }
            self.pool.release(handle);

            match outcome {
                Ok(publications) => return Ok(publications),
                Err(e) if e.is_retryable() => {
                    warn!(
                        node_id = %self.node_id,
                        attempt,
                        "Attempt for {} failed: {}",
                        url,
                        e
                    );
                    last_error = e;
                    if attempt < max_attempts {
                        let backoff = self.config.backoff(attempt);
                        if !backoff.is_zero() {
                            tokio::time::sleep(backoff).await;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn attempt(
        &self,
        url: &str,
        source: Source,
        proxy: &ProxyInfo,
    ) -> Result<Vec<Publication>, FetchError> {
        debug!(node_id = %self.node_id, "GET {} via {}", url, proxy);
        let page = self.fetcher.get(url, proxy).await?;
        classify_status(page.status)?;
        parse_publications(&page.body, source)
    }

    /// Crawls one task and publishes its result
    ///
    /// Malformed tasks are dropped without a result. Only publishing the
    /// result can fail.
    pub async fn process_task(&self, task: Task) -> QueueResult<()> {
        if let Err(e) = task.validate() {
            warn!(node_id = %self.node_id, "Dropping task: {}", e);
            return Ok(());
        }

        info!(
            node_id = %self.node_id,
            author = %task.author_name,
            source = %task.source,
            retry = task.retry_count,
            "Crawling {}",
            task.url
        );

        let result = match self.fetch_and_parse(&task.url, task.source).await {
            Ok(publications) => {
                info!(
                    node_id = %self.node_id,
                    "Found {} publications for {}",
                    publications.len(),
                    task.author_name
                );
                CrawlResult::success(task, publications, &self.node_id)
            }
            Err(e) => {
                error!(node_id = %self.node_id, "Task for {} failed: {}", task.author_name, e);
                CrawlResult::failure(task, e.to_string(), &self.node_id)
            }
        };

        self.queue
            .publish_message(&self.result_queue, &Message::from(result))
            .await
    }

    pub async fn send_heartbeat(&self) -> QueueResult<()> {
        publish_heartbeat(self.queue.as_ref(), &self.result_queue, &self.node_id).await
    }

    /// Takes at most one message off the task queue and handles it
    ///
    /// Returns whether a message was received. The delivery is acknowledged
    /// once the task has been handled; undecodable or non-task messages are
    /// acknowledged and dropped. If the result cannot be published the task
    /// is put back on the queue and the error is returned.
    pub async fn poll_once(&self) -> QueueResult<bool> {
        let delivery = match self.queue.get_one(&self.task_queue, AckMode::Manual).await? {
            Some(delivery) => delivery,
            None => return Ok(false),
        };

        match Message::decode(&delivery.payload) {
            Ok(Message::Task(task)) => {
                if let Err(e) = self.process_task(task).await {
                    // Hand the task back so another worker picks it up
                    if let Err(nack_err) = self.queue.nack(delivery.tag, true).await {
                        warn!(node_id = %self.node_id, "Failed to requeue task: {}", nack_err);
                    }
                    return Err(e);
                }
            }
            Ok(other) => {
                warn!(node_id = %self.node_id, "Dropping {} message on task queue", other.kind());
            }
            Err(e) => {
                warn!(node_id = %self.node_id, "Dropping undecodable task: {}", e);
            }
        }

        self.queue.ack(delivery.tag).await?;
        Ok(true)
    }

    /// Polls the task queue until shutdown
    ///
    /// Returns early with the error if the broker fails, so the caller can
    /// reconnect.
    pub async fn run(&self, shutdown: &Shutdown) -> QueueResult<()> {
        info!(node_id = %self.node_id, "Worker started");
        let heartbeat = self.spawn_heartbeat(shutdown.clone());

        let outcome = loop {
            if shutdown.is_triggered() {
                break Ok(());
            }

            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    if shutdown.sleep(self.poll_interval).await {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        heartbeat.abort();
        info!(node_id = %self.node_id, "Worker stopped");
        outcome
    }

    fn spawn_heartbeat(&self, shutdown: Shutdown) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let result_queue = self.result_queue.clone();
        let node_id = self.node_id.clone();
        let period = self.config.heartbeat_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = publish_heartbeat(queue.as_ref(), &result_queue, &node_id).await {
                            warn!(node_id = %node_id, "Failed to send heartbeat: {}", e);
                        }
                    }
                    _ = shutdown.wait() => break,
                }
            }
        })
    }
}

async fn publish_heartbeat(queue: &dyn TaskQueue, result_queue: &str, node_id: &str) -> QueueResult<()> {
    queue
        .publish_message(result_queue, &Message::from(Heartbeat::now(node_id)))
        .await?;
    debug!(node_id = %node_id, "Heartbeat sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::FetchedPage;
    use crate::queue::{declare_queues, Delivery, MemoryQueue, QueueError, ResultStatus, TaskStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const DBLP_PAGE: &str = r#"<ul><li class="entry article"><span class="title">Paper One.</span> 2019</li></ul>"#;

    /// Replays canned responses and records which proxy served each call
    #[derive(Default)]
    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<FetchedPage, FetchError>>>,
        hosts: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<FetchedPage, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                hosts: Mutex::new(Vec::new()),
            })
        }

        fn hosts(&self) -> Vec<String> {
            self.hosts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn get(&self, _url: &str, proxy: &ProxyInfo) -> Result<FetchedPage, FetchError> {
            self.hosts.lock().unwrap().push(proxy.host.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FetchedPage::new(StatusCode::OK, DBLP_PAGE)))
        }
    }

    fn page(status: StatusCode, body: &str) -> Result<FetchedPage, FetchError> {
        Ok(FetchedPage::new(status, body))
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.worker.backoff_step_ms = 0;
        config.worker.heartbeat_interval_secs = 1;
        config.queue.poll_interval_ms = 10;
        config
    }

    fn test_pool(hosts: &[&str]) -> Arc<ProxyPool> {
        let proxies = hosts.iter().map(|h| ProxyInfo::new(*h, 8080)).collect();
        Arc::new(ProxyPool::new(
            proxies,
            Duration::from_secs(2),
            Duration::from_secs(3600),
        ))
    }

    async fn test_worker(
        hosts: &[&str],
        fetcher: Arc<ScriptedFetcher>,
    ) -> (Worker, MemoryQueue, Arc<ProxyPool>) {
        let config = test_config();
        let broker = MemoryQueue::new();
        declare_queues(&broker, &[&config.queue.task_queue, &config.queue.result_queue])
            .await
            .unwrap();
        let pool = test_pool(hosts);
        let worker = Worker::new(Arc::new(broker.clone()), Arc::clone(&pool), fetcher, &config)
            .with_node_id("node-test");
        (worker, broker, pool)
    }

    fn sample_task() -> Task {
        Task {
            author_id: 1,
            url: "https://dblp.org/pid/1.html".to_string(),
            author_name: "Ada Lovelace".to_string(),
            source: Source::Dblp,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }

    async fn next_result(broker: &MemoryQueue) -> Option<Message> {
        broker
            .get_one("crawl_results", AckMode::Auto)
            .await
            .unwrap()
            .map(|d| Message::decode(&d.payload).unwrap())
    }

    #[tokio::test]
    async fn test_rate_limited_on_every_attempt() {
        let fetcher = ScriptedFetcher::new(vec![
            page(StatusCode::TOO_MANY_REQUESTS, ""),
            page(StatusCode::TOO_MANY_REQUESTS, ""),
            page(StatusCode::TOO_MANY_REQUESTS, ""),
        ]);
        let (worker, _broker, pool) = test_worker(&["a", "b", "c"], Arc::clone(&fetcher)).await;

        let result = worker.fetch_and_parse("https://dblp.org/x", Source::Dblp).await;

        assert_eq!(result, Err(FetchError::RateLimited));
        assert_eq!(fetcher.hosts(), vec!["a", "b", "c"]);
        assert!(pool.is_blocked("a") && pool.is_blocked("b") && pool.is_blocked("c"));
    }

    #[tokio::test]
    async fn test_retries_with_different_proxy_after_block() {
        let fetcher = ScriptedFetcher::new(vec![
            page(StatusCode::FORBIDDEN, ""),
            page(StatusCode::OK, DBLP_PAGE),
        ]);
        let (worker, _broker, pool) = test_worker(&["a", "b"], Arc::clone(&fetcher)).await;

        let publications = worker
            .fetch_and_parse("https://dblp.org/x", Source::Dblp)
            .await
            .unwrap();

        assert_eq!(publications.len(), 1);
        assert_eq!(fetcher.hosts(), vec!["a", "b"]);
        assert!(pool.is_blocked("a"));
        assert!(!pool.is_blocked("b"));
    }

    #[tokio::test]
    async fn test_transient_errors_do_not_block() {
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::Transient("connection reset".to_string())),
            page(StatusCode::BAD_GATEWAY, ""),
            page(StatusCode::OK, DBLP_PAGE),
        ]);
        let (worker, _broker, pool) = test_worker(&["a"], Arc::clone(&fetcher)).await;

        let publications = worker
            .fetch_and_parse("https://dblp.org/x", Source::Dblp)
            .await
            .unwrap();

        assert_eq!(publications[0].title, "Paper One.");
        assert_eq!(fetcher.hosts(), vec!["a", "a", "a"]);
        assert!(!pool.is_blocked("a"));
    }

    #[tokio::test]
    async fn test_parse_error_is_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![page(StatusCode::OK, "")]);
        let (worker, _broker, _pool) = test_worker(&["a", "b"], Arc::clone(&fetcher)).await;

        let result = worker.fetch_and_parse("https://dblp.org/x", Source::Dblp).await;

        assert!(matches!(result, Err(FetchError::Parse(_))));
        assert_eq!(fetcher.hosts().len(), 1);
    }

    #[tokio::test]
    async fn test_no_proxies_fails_fast() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let (worker, _broker, _pool) = test_worker(&[], Arc::clone(&fetcher)).await;

        let result = worker.fetch_and_parse("https://dblp.org/x", Source::Dblp).await;

        assert_eq!(result, Err(FetchError::ProxyExhausted));
        assert!(fetcher.hosts().is_empty());
    }

    #[tokio::test]
    async fn test_process_task_publishes_error_result() {
        let fetcher = ScriptedFetcher::new(vec![
            page(StatusCode::TOO_MANY_REQUESTS, ""),
            page(StatusCode::TOO_MANY_REQUESTS, ""),
            page(StatusCode::TOO_MANY_REQUESTS, ""),
        ]);
        let (worker, broker, _pool) = test_worker(&["a", "b", "c"], fetcher).await;

        worker.process_task(sample_task()).await.unwrap();

        match next_result(&broker).await {
            Some(Message::Result(result)) => {
                assert_eq!(result.status, ResultStatus::Error);
                assert_eq!(result.error.as_deref(), Some("Rate limit exceeded"));
                assert_eq!(result.node_id, "node-test");
                assert_eq!(result.task_data.author_id, 1);
                assert_eq!(result.task_data.retry_count, 0);
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_task_publishes_success_result() {
        let fetcher = ScriptedFetcher::new(vec![page(StatusCode::OK, DBLP_PAGE)]);
        let (worker, broker, _pool) = test_worker(&["a"], fetcher).await;

        worker.process_task(sample_task()).await.unwrap();

        match next_result(&broker).await {
            Some(Message::Result(result)) => {
                assert_eq!(result.status, ResultStatus::Success);
                assert_eq!(result.publications.len(), 1);
                assert_eq!(result.publications[0].year, Some(2019));
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_task_produces_no_result() {
        let fetcher = ScriptedFetcher::new(vec![]);
        let (worker, broker, _pool) = test_worker(&["a"], Arc::clone(&fetcher)).await;

        let mut task = sample_task();
        task.url = String::new();
        worker.process_task(task).await.unwrap();

        assert!(next_result(&broker).await.is_none());
        assert!(fetcher.hosts().is_empty());
    }

    #[tokio::test]
    async fn test_poll_once_acks_garbage_and_tasks() {
        let fetcher = ScriptedFetcher::new(vec![page(StatusCode::OK, DBLP_PAGE)]);
        let (worker, broker, _pool) = test_worker(&["a"], fetcher).await;

        broker.publish("crawl_tasks", b"{not json").await.unwrap();
        let task = Message::from(sample_task()).encode().unwrap();
        broker.publish("crawl_tasks", &task).await.unwrap();

        assert!(worker.poll_once().await.unwrap());
        assert!(next_result(&broker).await.is_none());

        assert!(worker.poll_once().await.unwrap());
        assert!(matches!(next_result(&broker).await, Some(Message::Result(_))));

        assert!(!worker.poll_once().await.unwrap());
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_send_heartbeat() {
        let (worker, broker, _pool) = test_worker(&["a"], ScriptedFetcher::new(vec![])).await;

        worker.send_heartbeat().await.unwrap();

        match next_result(&broker).await {
            Some(Message::Heartbeat(heartbeat)) => assert_eq!(heartbeat.node_id, "node-test"),
            other => panic!("expected heartbeat, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (worker, broker, _pool) = test_worker(&["a"], ScriptedFetcher::new(vec![])).await;
        let shutdown = Shutdown::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(&shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());

        // The heartbeat task fires on its first tick
        assert!(matches!(next_result(&broker).await, Some(Message::Heartbeat(_))));
    }

    #[tokio::test]
    async fn test_run_returns_connection_error() {
        let (worker, broker, _pool) = test_worker(&["a"], ScriptedFetcher::new(vec![])).await;
        broker.disconnect();

        let err = worker.run(&Shutdown::new()).await.unwrap_err();
        assert!(err.is_connection());
    }

    /// Delegates to a memory broker but refuses every publish to the result queue
    struct ResultsRejected {
        inner: MemoryQueue,
    }

    #[async_trait]
    impl TaskQueue for ResultsRejected {
        async fn declare(&self, queue: &str, durable: bool) -> QueueResult<()> {
            self.inner.declare(queue, durable).await
        }

        async fn publish(&self, queue: &str, payload: &[u8]) -> QueueResult<()> {
            if queue == "crawl_results" {
                return Err(QueueError::Operation("channel closed by server".to_string()));
            }
            self.inner.publish(queue, payload).await
        }

        async fn get_one(&self, queue: &str, mode: AckMode) -> QueueResult<Option<Delivery>> {
            self.inner.get_one(queue, mode).await
        }

        async fn ack(&self, tag: u64) -> QueueResult<()> {
            self.inner.ack(tag).await
        }

        async fn nack(&self, tag: u64, requeue: bool) -> QueueResult<()> {
            self.inner.nack(tag, requeue).await
        }

        async fn depth(&self, queue: &str) -> QueueResult<u32> {
            self.inner.depth(queue).await
        }
    }

    #[tokio::test]
    async fn test_unpublished_result_requeues_task() {
        let config = test_config();
        let broker = MemoryQueue::new();
        declare_queues(&broker, &["crawl_tasks", "crawl_results"])
            .await
            .unwrap();
        broker
            .publish_message("crawl_tasks", &Message::from(sample_task()))
            .await
            .unwrap();

        let queue = Arc::new(ResultsRejected {
            inner: broker.clone(),
        });
        let fetcher = ScriptedFetcher::new(vec![]);
        let worker = Worker::new(queue, test_pool(&["a"]), fetcher, &config);

        let err = worker.poll_once().await.unwrap_err();
        assert!(!err.is_connection());

        assert_eq!(broker.depth("crawl_tasks").await.unwrap(), 1);
        assert_eq!(broker.depth("crawl_results").await.unwrap(), 0);
        assert_eq!(broker.unacked_count(), 0);
    }
}
