//! Process supervision
//!
//! Runs one coordinator and a fixed number of workers as tokio tasks. Each
//! unit opens its own broker connection and reconnects on its own when the
//! broker goes away. A shared `Shutdown` signal stops them all, and each
//! unit gets a bounded amount of time to finish.

use crate::config::Config;
use crate::crawler::coordinator::Coordinator;
use crate::crawler::fetcher::PageFetcher;
use crate::crawler::worker::Worker;
use crate::proxy::ProxyPool;
use crate::queue::{declare_queues, QueueConnector, QueueResult, TaskQueue};
use crate::storage::{RecordStore, StorageResult};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cooperative shutdown signal shared by every unit
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signals every holder to stop; repeated calls are no-ops
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `duration` unless shutdown comes first
    ///
    /// Returns whether shutdown has been triggered.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_triggered(),
            _ = self.wait() => true,
        }
    }

    /// Triggers shutdown on the first Ctrl-C
    pub fn trigger_on_ctrl_c(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.trigger();
                }
                Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a record store connection for the coordinator
pub type StoreFactory = Arc<dyn Fn() -> StorageResult<Box<dyn RecordStore>> + Send + Sync>;

/// Starts and stops the coordinator and the workers
pub struct Supervisor {
    config: Config,
    connector: Arc<dyn QueueConnector>,
    pool: Arc<ProxyPool>,
    fetcher: Arc<dyn PageFetcher>,
    open_store: StoreFactory,
}

impl Supervisor {
    pub fn new(
        config: Config,
        connector: Arc<dyn QueueConnector>,
        pool: Arc<ProxyPool>,
        fetcher: Arc<dyn PageFetcher>,
        open_store: StoreFactory,
    ) -> Self {
        Self {
            config,
            connector,
            pool,
            fetcher,
            open_store,
        }
    }

    /// Runs every unit until `shutdown` is triggered
    ///
    /// After the signal each unit is given `shutdown-timeout-secs` to stop;
    /// units that take longer are left to finish on their own.
    pub async fn run(&self, shutdown: Shutdown) -> Result<()> {
        let store = (self.open_store)()?;
        let mut units: Vec<(String, JoinHandle<()>)> = Vec::new();

        units.push((
            "coordinator".to_string(),
            tokio::spawn(run_coordinator_unit(
                self.config.clone(),
                Arc::clone(&self.connector),
                store,
                shutdown.clone(),
            )),
        ));

        let stagger = Duration::from_millis(self.config.worker.start_stagger_ms);
        for index in 0..self.config.worker.count {
            if index > 0 && !stagger.is_zero() && shutdown.sleep(stagger).await {
                break;
            }
            units.push((
                format!("worker-{index}"),
                tokio::spawn(run_worker_unit(
                    self.config.clone(),
                    Arc::clone(&self.connector),
                    Arc::clone(&self.pool),
                    Arc::clone(&self.fetcher),
                    shutdown.clone(),
                )),
            ));
        }

        info!(
            "Started coordinator and {} workers with {} proxies",
            units.len() - 1,
            self.pool.len()
        );

        shutdown.wait().await;

        let timeout = self.config.coordinator.shutdown_timeout();
        for (name, handle) in units {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!("{} stopped", name),
                Ok(Err(e)) => error!("{} terminated abnormally: {}", name, e),
                Err(_) => warn!("{} did not stop within {:?}, leaving it", name, timeout),
            }
        }

        info!("All units stopped");
        Ok(())
    }
}

/// Opens a connection and declares both queues, retrying until shutdown
///
/// Returns `None` if shutdown is triggered before a connection is made.
pub async fn connect_with_retry(
    connector: &dyn QueueConnector,
    config: &Config,
    unit: &str,
    shutdown: &Shutdown,
) -> Option<Arc<dyn TaskQueue>> {
    let delay = config.queue.reconnect_delay();

    loop {
        if shutdown.is_triggered() {
            return None;
        }

        match open_queue(connector, config).await {
            Ok(queue) => {
                debug!("{} connected to broker", unit);
                return Some(queue);
            }
            Err(e) => {
                warn!("{} cannot reach broker ({}), retrying in {:?}", unit, e, delay);
                if shutdown.sleep(delay).await {
                    return None;
                }
            }
        }
    }
}

async fn open_queue(connector: &dyn QueueConnector, config: &Config) -> QueueResult<Arc<dyn TaskQueue>> {
    let queue = connector.connect().await?;
    declare_queues(
        queue.as_ref(),
        &[&config.queue.task_queue, &config.queue.result_queue],
    )
    .await?;
    Ok(queue)
}

async fn run_coordinator_unit(
    config: Config,
    connector: Arc<dyn QueueConnector>,
    store: Box<dyn RecordStore>,
    shutdown: Shutdown,
) {
    let Some(mut queue) =
        connect_with_retry(connector.as_ref(), &config, "coordinator", &shutdown).await
    else {
        return;
    };
    let mut coordinator = Coordinator::new(Arc::clone(&queue), store, &config);

    loop {
        let outcome = coordinator.run(&shutdown).await;
        close_queue(queue.as_ref(), "coordinator").await;

        match outcome {
            Ok(()) => break,
            Err(e) if e.is_queue_connection() => warn!("Coordinator lost broker connection: {}", e),
            Err(e) => error!("Coordinator failed, reconnecting: {}", e),
        }

        if shutdown.is_triggered() || shutdown.sleep(config.queue.reconnect_delay()).await {
            break;
        }
        match connect_with_retry(connector.as_ref(), &config, "coordinator", &shutdown).await {
            Some(fresh) => {
                queue = fresh;
                coordinator.set_queue(Arc::clone(&queue));
            }
            None => break,
        }
    }

    if coordinator.pending_retries() > 0 {
        warn!(
            "Coordinator exited with {} unpublished retries",
            coordinator.pending_retries()
        );
    }
}

async fn run_worker_unit(
    config: Config,
    connector: Arc<dyn QueueConnector>,
    pool: Arc<ProxyPool>,
    fetcher: Arc<dyn PageFetcher>,
    shutdown: Shutdown,
) {
    let Some(mut queue) = connect_with_retry(connector.as_ref(), &config, "worker", &shutdown).await
    else {
        return;
    };
    let mut worker = Worker::new(Arc::clone(&queue), pool, fetcher, &config);
    let node_id = worker.node_id().to_string();

    loop {
        let outcome = worker.run(&shutdown).await;
        close_queue(queue.as_ref(), &node_id).await;

        match outcome {
            Ok(()) => break,
            Err(e) if e.is_connection() => {
                warn!(node_id = %node_id, "Worker lost broker connection: {}", e)
            }
            Err(e) => error!(node_id = %node_id, "Worker failed, reconnecting: {}", e),
        }

        if shutdown.is_triggered() || shutdown.sleep(config.queue.reconnect_delay()).await {
            break;
        }
        match connect_with_retry(connector.as_ref(), &config, &node_id, &shutdown).await {
            Some(fresh) => {
                queue = fresh;
                worker.set_queue(Arc::clone(&queue));
            }
            None => break,
        }
    }
}

async fn close_queue(queue: &dyn TaskQueue, unit: &str) {
    if let Err(e) = queue.close().await {
        debug!("{} could not close its broker connection: {}", unit, e);
    }
}
