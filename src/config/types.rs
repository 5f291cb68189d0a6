use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for pubcrawl
///
/// Every section is optional in the TOML file; missing keys fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub database: DatabaseConfig,
    pub proxy: ProxyConfig,
    pub worker: WorkerConfig,
    pub coordinator: CoordinatorConfig,
}

/// Message broker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// AMQP connection URL
    pub url: String,

    /// Queue the coordinator publishes tasks to and workers consume
    #[serde(rename = "task-queue")]
    pub task_queue: String,

    /// Queue workers publish results and heartbeats to
    #[serde(rename = "result-queue")]
    pub result_queue: String,

    /// Sleep between poll iterations (milliseconds)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Delay before reconnecting after a broker failure (milliseconds)
    #[serde(rename = "reconnect-delay-ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672/%2f".to_string(),
            task_queue: "crawl_tasks".to_string(),
            result_queue: "crawl_results".to_string(),
            poll_interval_ms: 500,
            reconnect_delay_ms: 5000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Record store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `sqlite://path` or a plain file path
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://publications.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Returns the filesystem path the store should open
    pub fn path(&self) -> &str {
        self.url.strip_prefix("sqlite://").unwrap_or(&self.url)
    }
}

/// Proxy pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy list, one `IP:PORT` or `IP:PORT:USER:PASS` per line
    pub file: String,

    /// Minimum time between two requests from the same IP (seconds)
    #[serde(rename = "min-request-interval-secs")]
    pub min_request_interval_secs: u64,

    /// How long an IP stays unusable after a 429/403 (seconds)
    #[serde(rename = "block-duration-secs")]
    pub block_duration_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            file: "ips.txt".to_string(),
            min_request_interval_secs: 2,
            block_duration_secs: 3600,
        }
    }
}

impl ProxyConfig {
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_secs(self.min_request_interval_secs)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }
}

/// Worker behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker units the supervisor starts
    pub count: u32,

    /// Fetch attempts per task before reporting an error
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    /// HTTP request timeout (seconds)
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// Backoff unit between attempts; attempt `n` waits `n * step` (milliseconds)
    #[serde(rename = "backoff-step-ms")]
    pub backoff_step_ms: u64,

    /// Interval between heartbeats (seconds)
    #[serde(rename = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: u64,

    /// Delay between starting consecutive workers (milliseconds)
    #[serde(rename = "start-stagger-ms")]
    pub start_stagger_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 3,
            max_attempts: 3,
            request_timeout_secs: 10,
            backoff_step_ms: 2000,
            heartbeat_interval_secs: 60,
            start_stagger_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Backoff before the next attempt after `attempt` failed attempts
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Coordinator behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Re-publications allowed per task before it is dropped
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// First retry delay; doubled per retry (seconds)
    #[serde(rename = "base-retry-delay-secs")]
    pub base_retry_delay_secs: u64,

    /// Upper bound on the retry delay (seconds)
    #[serde(rename = "max-retry-delay-secs")]
    pub max_retry_delay_secs: u64,

    /// Task generation is skipped while the task queue holds more than this
    #[serde(rename = "queue-high-water-mark")]
    pub queue_high_water_mark: u32,

    /// Re-crawl interval for Google Scholar authors (days)
    #[serde(rename = "google-interval-days")]
    pub google_interval_days: u32,

    /// Re-crawl interval for DBLP authors (days)
    #[serde(rename = "dblp-interval-days")]
    pub dblp_interval_days: u32,

    /// How long shutdown waits for each unit (seconds)
    #[serde(rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_secs: 5,
            max_retry_delay_secs: 3600,
            queue_high_water_mark: 500,
            google_interval_days: 7,
            dblp_interval_days: 30,
            shutdown_timeout_secs: 10,
        }
    }
}

impl CoordinatorConfig {
    /// Delay before re-publishing a task that has already been retried
    /// `retry_count` times: `base * 2^retry_count`, capped at the maximum
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let secs = self
            .base_retry_delay_secs
            .saturating_mul(factor)
            .min(self.max_retry_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
