//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the pubcrawl database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Tracked authors, one row per (name, source)
CREATE TABLE IF NOT EXISTS authors (
    author_id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_name TEXT NOT NULL,
    source TEXT NOT NULL CHECK (source IN ('google', 'dblp')),
    url TEXT NOT NULL,
    last_crawl TEXT,
    UNIQUE(author_name, source)
);

CREATE INDEX IF NOT EXISTS idx_authors_last_crawl ON authors(last_crawl);

-- Publications discovered per author
CREATE TABLE IF NOT EXISTS publications (
    publication_id INTEGER PRIMARY KEY AUTOINCREMENT,
    author_id INTEGER NOT NULL REFERENCES authors(author_id),
    title TEXT NOT NULL,
    year INTEGER,
    source TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(author_id, title)
);

CREATE INDEX IF NOT EXISTS idx_publications_author ON publications(author_id);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
