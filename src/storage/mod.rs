//! Storage module for authors and their publications
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Selecting authors whose data has gone stale
//! - Idempotent publication upserts keyed on (author, title)
//! - Crawl timestamp bookkeeping and progress statistics

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStore;
pub use traits::{RecordStore, StorageError, StorageResult};

use crate::config::CoordinatorConfig;
use crate::CrawlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Opens the record store at the given path
pub fn open_store(path: &Path) -> Result<SqliteStore, CrawlerError> {
    Ok(SqliteStore::open(path)?)
}

/// Publication source an author is tracked on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Google,
    Dblp,
}

impl Source {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Dblp => "dblp",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "google" => Some(Self::Google),
            "dblp" => Some(Self::Dblp),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// A tracked author
#[derive(Debug, Clone, PartialEq)]
pub struct Author {
    pub author_id: i64,
    pub name: String,
    pub source: Source,
    pub url: String,
    pub last_crawl: Option<DateTime<Utc>>,
}

/// A publication extracted from an author page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub title: String,
    pub year: Option<i32>,
    pub source: Source,
}

/// Progress summary for one author
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorStats {
    pub name: String,
    pub source: Source,
    pub last_crawl: Option<DateTime<Utc>>,
    pub publication_count: u64,
}

/// Per-source minimum time between crawls of the same author
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlIntervals {
    pub google: chrono::Duration,
    pub dblp: chrono::Duration,
}

impl CrawlIntervals {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            google: chrono::Duration::days(i64::from(config.google_interval_days)),
            dblp: chrono::Duration::days(i64::from(config.dblp_interval_days)),
        }
    }

    pub fn for_source(&self, source: Source) -> chrono::Duration {
        match source {
            Source::Google => self.google,
            Source::Dblp => self.dblp,
        }
    }
}

impl Default for CrawlIntervals {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_db_roundtrip() {
        for source in [Source::Google, Source::Dblp] {
            assert_eq!(Source::from_db_string(source.to_db_string()), Some(source));
        }
        assert_eq!(Source::from_db_string("arxiv"), None);
    }

    #[test]
    fn test_source_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Source::Dblp).unwrap(), "\"dblp\"");
        let parsed: Source = serde_json::from_str("\"google\"").unwrap();
        assert_eq!(parsed, Source::Google);
    }

    #[test]
    fn test_default_intervals() {
        let intervals = CrawlIntervals::default();
        assert_eq!(intervals.for_source(Source::Google), chrono::Duration::days(7));
        assert_eq!(intervals.for_source(Source::Dblp), chrono::Duration::days(30));
    }
}
