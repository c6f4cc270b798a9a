//! Ordered schema migrations tracked in `PRAGMA user_version`.

use rusqlite::Connection;
use thiserror::Error;

/// Schema version this build creates and migrates to.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS books (
  id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  authors TEXT NOT NULL DEFAULT '',
  isbn13 TEXT,
  reading_state TEXT NOT NULL DEFAULT 'to_read' CHECK(reading_state IN ('to_read','reading','finished')),
  started_at TEXT,
  finished_at TEXT,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS lists (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS list_items (
  list_id TEXT NOT NULL REFERENCES lists(id) ON DELETE CASCADE,
  book_id TEXT NOT NULL REFERENCES books(id) ON DELETE CASCADE,
  sort_index INTEGER NOT NULL,
  PRIMARY KEY (list_id, book_id)
);
"#,
    ),
    (
        3,
        r#"
ALTER TABLE books ADD COLUMN notes TEXT NOT NULL DEFAULT '';
ALTER TABLE books ADD COLUMN rating INTEGER CHECK(rating BETWEEN 1 AND 5);

CREATE INDEX IF NOT EXISTS idx_books_reading_state ON books(reading_state);
CREATE INDEX IF NOT EXISTS idx_list_items_sort ON list_items(list_id, sort_index);
"#,
    ),
];

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema {found} is newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

/// Whether files at `version` can be opened by this build.
pub fn is_supported(version: u32) -> bool {
    (1..=CURRENT_SCHEMA_VERSION).contains(&version)
}

/// Bring the database up to [`CURRENT_SCHEMA_VERSION`], one transaction per
/// step. A fresh database (version 0) gets every step. Returns the version the
/// database was at before migrating.
pub fn migrate(conn: &mut Connection) -> Result<u32, MigrateError> {
    let found = schema_version(conn)?;
    if found > CURRENT_SCHEMA_VERSION {
        return Err(MigrateError::NewerSchema {
            found,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > found) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        tracing::info!(version, "Applied schema migration");
    }

    Ok(found)
}
