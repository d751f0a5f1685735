//! `DuckDB`-backed durable cache storage.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::{params, Connection};

use super::{CacheBackend, CacheError};
use crate::data_source::BoxFuture;

const SCHEMA: &str = "PRAGMA disable_progress_bar;
CREATE TABLE IF NOT EXISTS cache_entries (
    key VARCHAR PRIMARY KEY,
    value VARCHAR NOT NULL
);";

/// Key/value table in a `DuckDB` database file.
///
/// `DuckDB` calls block, so every operation runs on the blocking pool.
#[derive(Clone)]
pub struct DuckDbBackend {
    connection: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl DuckDbBackend {
    /// Opens (or creates) the database file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let connection = Connection::open(path)?;
        Self::with_connection(connection, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(connection: Connection, path: Option<PathBuf>) -> Result<Self, CacheError> {
        connection.execute_batch(SCHEMA)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn run<'a, R, F>(&'a self, operation: F) -> BoxFuture<'a, Result<R, CacheError>>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, ::duckdb::Error> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let connection = connection.lock().expect("duckdb cache mutex poisoned");
                operation(&connection).map_err(CacheError::from)
            })
            .await
            .map_err(|error| CacheError::Task(error.to_string()))?
        })
    }
}

impl CacheBackend for DuckDbBackend {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        let key = key.to_owned();
        self.run(move |connection| {
            let mut statement =
                connection.prepare("SELECT value FROM cache_entries WHERE key = ?")?;
            let mut rows = statement.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
    }

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), CacheError>> {
        let key = key.to_owned();
        self.run(move |connection| {
            connection.execute(
                "INSERT OR REPLACE INTO cache_entries (key, value) VALUES (?, ?)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        let key = key.to_owned();
        self.run(move |connection| {
            let deleted =
                connection.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
            Ok(deleted > 0)
        })
    }

    fn keys<'a>(&'a self) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        self.run(|connection| {
            let mut statement = connection.prepare("SELECT key FROM cache_entries ORDER BY key")?;
            let keys = statement
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<(), CacheError>> {
        self.run(|connection| {
            connection.execute_batch("DELETE FROM cache_entries;")?;
            Ok(())
        })
    }
}
