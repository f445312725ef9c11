//! In-memory [`CacheBackend`].
//!
//! Used when a persistent cache can't be opened, and in tests that want a
//! cache without a filesystem footprint. A build session using this backend
//! is incremental only within the process lifetime.

use std::{collections::HashMap, sync::Mutex};

use color_eyre::Result;

use super::{CacheBackend, CacheRecord};

#[derive(Default)]
pub struct MemoryCache {
    records: Mutex<HashMap<String, CacheRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CacheRecord>> {
        Ok(self
            .records
            .lock()
            .expect("cache mutex poisoned")
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, record: CacheRecord) -> Result<()> {
        self.records
            .lock()
            .expect("cache mutex poisoned")
            .insert(key.to_owned(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_a_record() {
        let cache = MemoryCache::new();
        assert!(cache.get("a").unwrap().is_none());

        let record = CacheRecord {
            input_metadata: serde_json::Value::Null,
            file_fingerprints: Default::default(),
            result: serde_json::json!("ok"),
        };
        cache.set("a", record).unwrap();
        assert_eq!(cache.get("a").unwrap().unwrap().result, serde_json::json!("ok"));
    }
}
