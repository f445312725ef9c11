//! SQLite-backed [`CacheBackend`].
//!
//! Records are stored as a single `BLOB` column (bincode-free; we use
//! `serde_json` so the cache file stays at least somewhat inspectable with
//! `sqlite3 cache.db 'select key, record from records'`), keyed by the
//! task's mangled id.

use std::sync::Mutex;

use color_eyre::{Result, eyre::Context};
use rusqlite::{Connection, params};
use tracing::{instrument, trace};

use super::{CacheBackend, CacheRecord};
use crate::path::AbsFilePath;

pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    #[instrument]
    pub fn open(path: &AbsFilePath) -> Result<Self> {
        let conn = Connection::open(path.as_std_path())
            .with_context(|| format!("open cache db: {path:?}"))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )
        .context("create records table")?;
        trace!(?path, "opened sqlite cache");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-process, non-persistent cache backed by SQLite's `:memory:`
    /// database. Exists mainly for tests that want to exercise the real
    /// serialization path without touching disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory cache db")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY NOT NULL,
                record TEXT NOT NULL
            )",
            [],
        )
        .context("create records table")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CacheBackend for SqliteCache {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        let mut stmt = conn
            .prepare_cached("SELECT record FROM records WHERE key = ?1")
            .context("prepare select")?;
        let row: Option<String> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional_none_on_no_rows()?;
        row.map(|json| serde_json::from_str(&json).context("deserialize cache record"))
            .transpose()
    }

    #[instrument(skip(self, record))]
    fn set(&self, key: &str, record: CacheRecord) -> Result<()> {
        let json = serde_json::to_string(&record).context("serialize cache record")?;
        let conn = self.conn.lock().expect("cache connection mutex poisoned");
        conn.execute(
            "INSERT INTO records (key, record) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET record = excluded.record",
            params![key, json],
        )
        .context("upsert cache record")?;
        trace!(key, "wrote cache record");
        Ok(())
    }
}

/// Small helper so `get` reads as "a missing row is `None`, not an error"
/// without reaching for `rusqlite::OptionalExtension` at every call site.
trait OptionalNoRows<T> {
    fn optional_none_on_no_rows(self) -> Result<Option<T>>;
}

impl<T> OptionalNoRows<T> for rusqlite::Result<T> {
    fn optional_none_on_no_rows(self) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err).context("query cache record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_a_record() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let record = CacheRecord {
            input_metadata: serde_json::json!({"flags": ["-O2"]}),
            file_fingerprints: Default::default(),
            result: serde_json::json!({"exit_code": 0}),
        };

        assert!(cache.get("compile;a.c").unwrap().is_none());
        cache.set("compile;a.c", record.clone()).unwrap();
        let fetched = cache.get("compile;a.c").unwrap().unwrap();
        assert_eq!(fetched.input_metadata, record.input_metadata);
        assert_eq!(fetched.result, record.result);
    }

    #[test]
    fn set_overwrites_existing_key() {
        let cache = SqliteCache::open_in_memory().unwrap();
        let first = CacheRecord {
            input_metadata: serde_json::Value::Null,
            file_fingerprints: Default::default(),
            result: serde_json::json!(1),
        };
        let second = CacheRecord {
            result: serde_json::json!(2),
            ..first.clone()
        };

        cache.set("task", first).unwrap();
        cache.set("task", second).unwrap();
        assert_eq!(cache.get("task").unwrap().unwrap().result, serde_json::json!(2));
    }
}
