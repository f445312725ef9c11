//! Persistent task cache.
//!
//! A [`CacheRecord`] is the durable witness of a task's last successful run:
//! the fingerprints of every input and output file it touched, the task's
//! own declared input metadata, and the task-defined result it produced.
//! [`Task::drive`](crate::task::Task::drive) uses this to decide whether a
//! rerun is necessary (see [`crate::task`]'s up-to-date check) and, on a
//! cache hit, to recover the result without running the task body at all.

pub mod memory;
pub mod sqlite;

use std::{collections::BTreeMap, sync::Arc};

use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::{fingerprint::Fingerprint, path::AbsFilePath};

/// Everything recorded about a task's most recent successful run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The task's own declared input metadata at the time of the run
    /// ([`crate::task::TaskBody::input_metadata`]), compared by equality on
    /// the next run to decide whether the task is a candidate for being
    /// considered up to date at all.
    pub input_metadata: serde_json::Value,
    /// Fingerprints of every input and output file as of the run that
    /// produced this record, keyed by absolute path.
    pub file_fingerprints: BTreeMap<AbsFilePath, Fingerprint>,
    /// The task-defined result produced by that run.
    pub result: serde_json::Value,
}

/// Storage backend for [`CacheRecord`]s, keyed by a task's
/// [`crate::id::TaskId::mangled`] form.
///
/// Implementations must be safe to share behind an `Arc` and called
/// concurrently from many tasks at once; [`sqlite::SqliteCache`] serializes
/// access internally, and [`memory::MemoryCache`] is a plain mutex-guarded
/// map.
pub trait CacheBackend: Send + Sync {
    /// Look up the record for `key`, if one exists.
    fn get(&self, key: &str) -> Result<Option<CacheRecord>>;

    /// Store (overwriting any prior record for) `key`.
    fn set(&self, key: &str, record: CacheRecord) -> Result<()>;
}

/// Open the default on-disk cache at `path`, falling back to an in-memory
/// cache (with a warning) if the SQLite backend cannot be opened.
///
/// A build that can't persist its cache can still run correctly; it just
/// loses incrementality across process restarts. That's a degraded mode
/// worth tolerating rather than a fatal error.
pub fn open_or_memory(path: &AbsFilePath) -> Arc<dyn CacheBackend> {
    match sqlite::SqliteCache::open(path) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            tracing::warn!(?path, error = ?err, "could not open persistent cache, using in-memory cache");
            Arc::new(memory::MemoryCache::new())
        }
    }
}
