//! Per-session record cache keyed by (level, table, eid).

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::Record;
use crate::storage::level::LevelName;
use crate::storage::Eid;
use crate::Result;

/// Composite cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Storage level holding the record
    pub level: LevelName,
    /// Table name
    pub table: &'static str,
    /// Record id
    pub eid: Eid,
}

/// Explicit read-through cache for records fetched by id.
///
/// Controllers invalidate a whole level after every mutation on it, so a hit
/// never outlives a write made through this session.
#[derive(Debug)]
pub struct RecordCache {
    records: DashMap<RecordKey, Record, FxBuildHasher>,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: DashMap::with_hasher(FxBuildHasher),
        }
    }

    /// Cached record for `key`, loading it with `load` on a miss.
    /// Misses that load nothing are not cached.
    ///
    /// # Errors
    ///
    /// Propagates the loader's error.
    pub fn get_or_load(
        &self,
        key: RecordKey,
        load: impl FnOnce() -> Result<Option<Record>>,
    ) -> Result<Option<Record>> {
        if let Some(hit) = self.records.get(&key) {
            return Ok(Some(hit.value().clone()));
        }
        let loaded = load()?;
        if let Some(record) = &loaded {
            self.records.insert(key, record.clone());
        }
        Ok(loaded)
    }

    /// Forget every record of `level`.
    pub fn invalidate_level(&self, level: LevelName) {
        self.records.retain(|key, _| key.level != level);
    }

    /// Forget everything.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Number of cached records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
