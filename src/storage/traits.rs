//! Storage traits and error types
//!
//! This module defines the trait interface for record store backends and
//! associated error types.

use crate::storage::{Author, AuthorStats, CrawlIntervals, Publication, Source};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Author not found: {0}")]
    AuthorNotFound(i64),

    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for record store implementations
///
/// Each execution unit owns its own store; implementations are moved between
/// threads but never shared.
pub trait RecordStore: Send {
    // ===== Crawl Scheduling =====

    /// Gets authors never crawled, or crawled longer ago than their
    /// source's interval, oldest first
    fn get_authors_due_for_crawl(
        &self,
        intervals: &CrawlIntervals,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Author>>;

    /// Sets an author's last crawl time
    fn set_last_crawl(&mut self, author_id: i64, at: DateTime<Utc>) -> StorageResult<()>;

    /// Stamps an author's last crawl time with the current time
    fn touch_last_crawl(&mut self, author_id: i64) -> StorageResult<()> {
        self.set_last_crawl(author_id, Utc::now())
    }

    // ===== Publications =====

    /// Inserts publications for an author, updating the year of any
    /// (author, title) pair that already exists
    ///
    /// Runs in one transaction. Returns the number of rows written.
    fn upsert_publications(
        &mut self,
        author_id: i64,
        publications: &[Publication],
    ) -> StorageResult<usize>;

    /// Gets all publications of an author ordered by title
    fn get_publications(&self, author_id: i64) -> StorageResult<Vec<Publication>>;

    // ===== Authors =====

    /// Adds an author, or returns the existing ID for the same (name, source)
    fn add_author(&mut self, name: &str, source: Source, url: &str) -> StorageResult<i64>;

    /// Gets an author by ID
    fn get_author(&self, author_id: i64) -> StorageResult<Author>;

    // ===== Statistics =====

    /// Gets a progress row per author, least recently crawled first
    fn author_stats(&self) -> StorageResult<Vec<AuthorStats>>;
}
