//! Pubcrawl: a distributed publication-metadata crawler
//!
//! This crate discovers publication titles and years for tracked authors on
//! Google Scholar and DBLP. A single coordinator turns stale authors into
//! crawl tasks on a durable queue, a pool of workers fetches the pages through
//! a rotating set of proxies, and the coordinator folds the results back into
//! the record store.

pub mod config;
pub mod crawler;
pub mod proxy;
pub mod queue;
pub mod storage;

use thiserror::Error;

/// Main error type for pubcrawl operations
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::QueueError),

    #[error("Message error: {0}")]
    Message(#[from] queue::MessageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

impl CrawlerError {
    /// Whether this error means the unit lost its broker connection
    pub fn is_queue_connection(&self) -> bool {
        matches!(self, Self::Queue(e) if e.is_connection())
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Outcome classification for a single crawl attempt
///
/// `ProxyExhausted` is retryable by the caller; `RateLimited`, `IpBlocked`
/// and `Transient` are retried locally by the worker; `Parse` is terminal
/// for the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("No proxies available")]
    ProxyExhausted,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("IP blocked by service")]
    IpBlocked,

    #[error("Request failed: {0}")]
    Transient(String),

    #[error("Error parsing page content: {0}")]
    Parse(String),
}

impl FetchError {
    /// Whether the worker should spend another local attempt on this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::IpBlocked | Self::Transient(_)
        )
    }

    /// Whether the proxy that produced this error should be blocked
    pub fn blocks_proxy(&self) -> bool {
        matches!(self, Self::RateLimited | Self::IpBlocked)
    }
}

/// Result type alias for pubcrawl operations
pub type Result<T> = std::result::Result<T, CrawlerError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, Supervisor, Worker};
pub use proxy::{ProxyHandle, ProxyInfo, ProxyPool};
pub use queue::{Message, TaskQueue};
pub use storage::{RecordStore, SqliteStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retry_classes() {
        assert!(FetchError::RateLimited.is_retryable());
        assert!(FetchError::IpBlocked.is_retryable());
        assert!(FetchError::Transient("timeout".to_string()).is_retryable());
        assert!(!FetchError::Parse("empty".to_string()).is_retryable());
        assert!(!FetchError::ProxyExhausted.is_retryable());
    }

    #[test]
    fn test_fetch_error_messages() {
        assert_eq!(FetchError::RateLimited.to_string(), "Rate limit exceeded");
        assert_eq!(FetchError::IpBlocked.to_string(), "IP blocked by service");
        assert!(FetchError::RateLimited.blocks_proxy());
        assert!(!FetchError::Transient("x".to_string()).blocks_proxy());
    }

    #[test]
    fn test_queue_connection_classification() {
        let lost = CrawlerError::from(queue::QueueError::Connection("reset".to_string()));
        let failed = CrawlerError::from(queue::QueueError::Operation("nope".to_string()));
        assert!(lost.is_queue_connection());
        assert!(!failed.is_queue_connection());
        assert!(!CrawlerError::from(FetchError::RateLimited).is_queue_connection());
    }
}
