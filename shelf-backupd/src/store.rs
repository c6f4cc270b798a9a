//! SQLite library database as the engine's persistent store.

use crate::db::connection::{close_pool, create_pool, DbPool};
use crate::db::migrate::{self, CURRENT_SCHEMA_VERSION};
use backup_engine::store::{PersistentStore, StoreError};
use rusqlite::DatabaseName;
use std::fmt::Display;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

fn db_error(e: impl Display) -> StoreError {
    StoreError::Database(e.to_string())
}

pub struct SqliteStore {
    path: PathBuf,
    pool: RwLock<Option<DbPool>>,
}

impl SqliteStore {
    /// Open (creating and migrating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pool = open_migrated(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            pool: RwLock::new(Some(pool)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn pool(&self) -> Result<DbPool, StoreError> {
        self.pool
            .read()
            .map_err(db_error)?
            .clone()
            .ok_or_else(|| StoreError::Database("store is closed".into()))
    }

    pub fn book_count(&self) -> Result<u64, StoreError> {
        let conn = self.pool()?.get().map_err(db_error)?;
        conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))
            .map_err(db_error)
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(pool) = self.pool.write().map_err(db_error)?.take() {
            close_pool(pool);
        }
        Ok(())
    }

    fn file_name(&self) -> &std::ffi::OsStr {
        self.path.file_name().unwrap_or_else(|| "library.db".as_ref())
    }

    /// The main database file and its WAL sidecars.
    fn file_set(&self) -> [PathBuf; 3] {
        let with_suffix = |suffix: &str| {
            let mut name = self.file_name().to_os_string();
            name.push(suffix);
            self.path.with_file_name(name)
        };
        [self.path.clone(), with_suffix("-wal"), with_suffix("-shm")]
    }
}

fn open_migrated(path: &Path) -> Result<DbPool, StoreError> {
    let pool = create_pool(path).map_err(db_error)?;
    let mut conn = pool.get().map_err(db_error)?;
    let found = migrate::migrate(&mut conn).map_err(db_error)?;
    if found != CURRENT_SCHEMA_VERSION {
        info!(from = found, to = CURRENT_SCHEMA_VERSION, path = %path.display(), "Migrated library database");
    }
    drop(conn);
    Ok(pool)
}

/// The database file inside an unpacked snapshot: `preferred` if present,
/// otherwise the only `*.db` file.
fn find_database(source: &Path, preferred: &std::ffi::OsStr) -> Result<PathBuf, StoreError> {
    let exact = source.join(preferred);
    if exact.is_file() {
        return Ok(exact);
    }
    let mut candidates = Vec::new();
    for entry in fs::read_dir(source)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "db") {
            candidates.push(path);
        }
    }
    match candidates.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(StoreError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no database file in {}", source.display()),
        ))),
        _ => Err(StoreError::Database(format!(
            "ambiguous database files in {}",
            source.display()
        ))),
    }
}

impl PersistentStore for SqliteStore {
    fn current_schema_version(&self) -> String {
        CURRENT_SCHEMA_VERSION.to_string()
    }

    fn recognizes_schema_version(&self, version: &str) -> bool {
        version.parse().is_ok_and(migrate::is_supported)
    }

    fn snapshot_copy(&self, destination: &Path) -> Result<(), StoreError> {
        let conn = self.pool()?.get().map_err(db_error)?;
        let target = destination.join(self.file_name());
        // Online backup: coherent even while other connections write
        conn.backup(DatabaseName::Main, &target, None).map_err(db_error)?;
        Ok(())
    }

    fn replace_files(&self, source: &Path) -> Result<(), StoreError> {
        let replacement = find_database(source, self.file_name())?;
        self.close()?;

        for file in self.file_set() {
            match fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        fs::copy(&replacement, &self.path)?;
        info!(path = %self.path.display(), "Replaced library database files");
        Ok(())
    }

    fn reinitialize(&self, files_schema_version: &str) -> Result<(), StoreError> {
        if !self.recognizes_schema_version(files_schema_version) {
            return Err(StoreError::UnknownSchemaVersion(files_schema_version.to_string()));
        }
        self.close()?;

        let pool = open_migrated(&self.path)?;
        let conn = pool.get().map_err(db_error)?;
        let found = migrate::schema_version(&conn).map_err(db_error)?;
        drop(conn);
        if found != CURRENT_SCHEMA_VERSION {
            warn!(found, expected = CURRENT_SCHEMA_VERSION, "Library database not at current schema after reopening");
            return Err(StoreError::UnknownSchemaVersion(found.to_string()));
        }

        *self.pool.write().map_err(db_error)? = Some(pool);
        info!(files_schema_version, "Library database reopened");
        Ok(())
    }
}
