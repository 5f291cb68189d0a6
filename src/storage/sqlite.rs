//! SQLite record store implementation
//!
//! This module provides a SQLite-based implementation of the RecordStore trait.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{RecordStore, StorageError, StorageResult};
use crate::storage::{Author, AuthorStats, CrawlIntervals, Publication, Source};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite record store
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens or creates the database file and ensures the schema exists
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

/// Fixed-width UTC form so stored timestamps compare correctly as text
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                Type::Text,
                Box::new(StorageError::InvalidTimestamp(raw.to_string())),
            )
        })
}

fn optional_timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(column)?
        .map(|raw| parse_timestamp(column, &raw))
        .transpose()
}

fn author_from_row(row: &Row<'_>) -> rusqlite::Result<Author> {
    Ok(Author {
        author_id: row.get(0)?,
        name: row.get(1)?,
        source: row.get(2)?,
        url: row.get(3)?,
        last_crawl: optional_timestamp(row, 4)?,
    })
}

impl ToSql for Source {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_db_string()))
    }
}

impl FromSql for Source {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        Source::from_db_string(raw)
            .ok_or_else(|| FromSqlError::Other(Box::new(StorageError::InvalidSource(raw.to_string()))))
    }
}

impl RecordStore for SqliteStore {
    // ===== Crawl Scheduling =====

    fn get_authors_due_for_crawl(
        &self,
        intervals: &CrawlIntervals,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Author>> {
        let google_cutoff = format_timestamp(now - intervals.google);
        let dblp_cutoff = format_timestamp(now - intervals.dblp);

        let mut stmt = self.conn.prepare(
            "SELECT author_id, author_name, source, url, last_crawl
             FROM authors
             WHERE last_crawl IS NULL
                OR (source = 'google' AND last_crawl < ?1)
                OR (source = 'dblp' AND last_crawl < ?2)
             ORDER BY last_crawl IS NOT NULL, last_crawl, author_id",
        )?;

        let authors = stmt
            .query_map(params![google_cutoff, dblp_cutoff], author_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(authors)
    }

    fn set_last_crawl(&mut self, author_id: i64, at: DateTime<Utc>) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE authors SET last_crawl = ?1 WHERE author_id = ?2",
            params![format_timestamp(at), author_id],
        )?;

        if updated == 0 {
            return Err(StorageError::AuthorNotFound(author_id));
        }
        Ok(())
    }

    // ===== Publications =====

    fn upsert_publications(
        &mut self,
        author_id: i64,
        publications: &[Publication],
    ) -> StorageResult<usize> {
        let now = format_timestamp(Utc::now());
        let tx = self.conn.transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO publications (author_id, title, year, source, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(author_id, title) DO UPDATE
                 SET year = excluded.year, updated_at = excluded.updated_at",
            )?;

            for publication in publications {
                written += stmt.execute(params![
                    author_id,
                    publication.title,
                    publication.year,
                    publication.source,
                    now
                ])?;
            }
        }

        tx.commit()?;
        Ok(written)
    }

    fn get_publications(&self, author_id: i64) -> StorageResult<Vec<Publication>> {
        let mut stmt = self.conn.prepare(
            "SELECT title, year, source FROM publications WHERE author_id = ?1 ORDER BY title",
        )?;

        let publications = stmt
            .query_map(params![author_id], |row| {
                Ok(Publication {
                    title: row.get(0)?,
                    year: row.get(1)?,
                    source: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(publications)
    }

    // ===== Authors =====

    fn add_author(&mut self, name: &str, source: Source, url: &str) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO authors (author_name, source, url) VALUES (?1, ?2, ?3)
             ON CONFLICT(author_name, source) DO NOTHING",
            params![name, source, url],
        )?;

        let id = self.conn.query_row(
            "SELECT author_id FROM authors WHERE author_name = ?1 AND source = ?2",
            params![name, source],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn get_author(&self, author_id: i64) -> StorageResult<Author> {
        self.conn
            .query_row(
                "SELECT author_id, author_name, source, url, last_crawl
                 FROM authors WHERE author_id = ?1",
                params![author_id],
                author_from_row,
            )
            .optional()?
            .ok_or(StorageError::AuthorNotFound(author_id))
    }

    // ===== Statistics =====

    fn author_stats(&self) -> StorageResult<Vec<AuthorStats>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.author_name, a.source, a.last_crawl, COUNT(p.publication_id)
             FROM authors a
             LEFT JOIN publications p ON a.author_id = p.author_id
             GROUP BY a.author_id, a.author_name, a.source, a.last_crawl
             ORDER BY a.last_crawl IS NOT NULL, a.last_crawl, a.author_name",
        )?;

        let stats = stmt
            .query_map([], |row| {
                Ok(AuthorStats {
                    name: row.get(0)?,
                    source: row.get(1)?,
                    last_crawl: optional_timestamp(row, 2)?,
                    publication_count: row.get::<_, i64>(3)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(title: &str, year: i32) -> Publication {
        Publication {
            title: title.to_string(),
            year: Some(year),
            source: Source::Dblp,
        }
    }

    #[test]
    fn test_add_author_is_idempotent() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = store.add_author("Ada", Source::Dblp, "https://dblp.org/pid/1").unwrap();
        let second = store.add_author("Ada", Source::Dblp, "https://dblp.org/pid/1").unwrap();
        let other = store.add_author("Ada", Source::Google, "https://scholar.google.com/x").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_never_crawled_author_is_due() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_author("Ada", Source::Dblp, "https://dblp.org/pid/1").unwrap();

        let due = store
            .get_authors_due_for_crawl(&CrawlIntervals::default(), Utc::now())
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].author_id, id);
        assert!(due[0].last_crawl.is_none());
    }

    #[test]
    fn test_staleness_is_per_source() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let google = store.add_author("G", Source::Google, "https://g").unwrap();
        let dblp = store.add_author("D", Source::Dblp, "https://d").unwrap();

        let now = Utc::now();
        let ten_days_ago = now - chrono::Duration::days(10);
        store.set_last_crawl(google, ten_days_ago).unwrap();
        store.set_last_crawl(dblp, ten_days_ago).unwrap();

        let due = store
            .get_authors_due_for_crawl(&CrawlIntervals::default(), now)
            .unwrap();
        let ids: Vec<i64> = due.iter().map(|a| a.author_id).collect();
        assert_eq!(ids, vec![google]);
    }

    #[test]
    fn test_touch_removes_author_from_due_list() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_author("Ada", Source::Google, "https://g").unwrap();
        store.touch_last_crawl(id).unwrap();

        let due = store
            .get_authors_due_for_crawl(&CrawlIntervals::default(), Utc::now())
            .unwrap();
        assert!(due.is_empty());
        assert!(store.get_author(id).unwrap().last_crawl.is_some());
    }

    #[test]
    fn test_touch_unknown_author() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let result = store.touch_last_crawl(42);
        assert!(matches!(result, Err(StorageError::AuthorNotFound(42))));
    }

    #[test]
    fn test_upsert_updates_year_without_duplicates() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_author("Ada", Source::Dblp, "https://d").unwrap();

        store
            .upsert_publications(id, &[publication("On Engines", 1842)])
            .unwrap();
        store
            .upsert_publications(id, &[publication("On Engines", 1843), publication("Notes", 1843)])
            .unwrap();

        let publications = store.get_publications(id).unwrap();
        assert_eq!(publications.len(), 2);
        let engines = publications.iter().find(|p| p.title == "On Engines").unwrap();
        assert_eq!(engines.year, Some(1843));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store.add_author("Ada", Source::Dblp, "https://d").unwrap();
        let at = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.123456Z")
            .unwrap()
            .with_timezone(&Utc);

        store.set_last_crawl(id, at).unwrap();
        assert_eq!(store.get_author(id).unwrap().last_crawl, Some(at));
    }

    #[test]
    fn test_author_stats_counts_publications() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let ada = store.add_author("Ada", Source::Dblp, "https://d").unwrap();
        store.add_author("Bob", Source::Google, "https://g").unwrap();
        store
            .upsert_publications(ada, &[publication("A", 2001), publication("B", 2002)])
            .unwrap();
        store.touch_last_crawl(ada).unwrap();

        let stats = store.author_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].name, "Bob");
        assert_eq!(stats[0].publication_count, 0);
        assert_eq!(stats[1].name, "Ada");
        assert_eq!(stats[1].publication_count, 2);
    }

    #[test]
    fn test_open_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubs.db");

        let mut store = SqliteStore::open(&path).unwrap();
        store.add_author("Ada", Source::Dblp, "https://d").unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.author_stats().unwrap().len(), 1);
    }
}
