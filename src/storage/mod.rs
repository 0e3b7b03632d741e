//! Storage backend contract
//!
//! A [`Storage`] is a transactional document container over named tables, scoped
//! to one filesystem prefix. Two implementations exist:
//!
//! - [`DocumentStore`]: embedded JSON document file (`<level>.json`)
//! - [`SqliteStore`]: relational store (`<level>.sqlite3`)
//!
//! Both assign monotonically increasing record ids (`Eid`, starting at 1) per
//! table and return search results ordered by id, so callers cannot tell them
//! apart.
//!
//! # Example
//!
//! ```rust,no_run
//! use perfcfg::storage::{Document, DocumentStore, Query, Storage};
//! use serde_json::json;
//!
//! # fn example() -> perfcfg::Result<()> {
//! let store = DocumentStore::open("/tmp/user.json", true)?;
//!
//! let mut doc = Document::new();
//! doc.insert("name".into(), json!("gcc-target"));
//! let eid = store.insert("target", doc)?;
//!
//! let found = store.get("target", &Query::Eid(eid))?;
//! assert!(found.is_some());
//! # Ok(())
//! # }
//! ```

mod document;
pub mod level;
pub mod registry;
mod sqlite;

use std::path::Path;

use serde_json::Value;

pub use document::DocumentStore;
pub use sqlite::SqliteStore;

use crate::backend::BackendKind;
use crate::{Error, Result};

/// Backend-assigned record identifier.
pub type Eid = u64;

/// Attribute name → value map stored per record.
pub type Document = serde_json::Map<String, Value>;

/// A document together with its id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Record id
    pub eid: Eid,
    /// Stored attributes
    pub data: Document,
}

/// Record selector.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Every record in the table
    All,
    /// One record by id
    Eid(Eid),
    /// Several records by id
    Eids(Vec<Eid>),
    /// Records whose attributes equal `keys`.
    ///
    /// AND of equalities by default; OR when `match_any` is set. A `null` key
    /// value matches records where the attribute is absent or null.
    Keys {
        /// Attribute equalities
        keys: Document,
        /// OR instead of AND
        match_any: bool,
    },
}

impl Query {
    /// Build a key query.
    #[must_use]
    pub const fn keys(keys: Document, match_any: bool) -> Self {
        Self::Keys { keys, match_any }
    }

    /// Key query with a single equality.
    #[must_use]
    pub fn key(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut keys = Document::new();
        keys.insert(name.into(), value.into());
        Self::Keys {
            keys,
            match_any: false,
        }
    }

    /// Evaluate the query against one stored document.
    #[must_use]
    pub fn matches(&self, eid: Eid, data: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eid(id) => *id == eid,
            Self::Eids(ids) => ids.contains(&eid),
            Self::Keys { keys, match_any } => {
                let mut equalities = keys
                    .iter()
                    .map(|(key, value)| data.get(key).unwrap_or(&Value::Null) == value);
                if *match_any {
                    equalities.any(|eq| eq)
                } else {
                    equalities.all(|eq| eq)
                }
            }
        }
    }
}

/// Transactional document storage over named tables.
///
/// Every mutating call is atomic on its own. [`Storage::transaction`] groups
/// several calls: the body's changes are applied entirely or rolled back
/// entirely. Transactions nest as savepoints.
pub trait Storage: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Path of the backing file.
    fn path(&self) -> &Path;

    /// Insert a document, returning its new id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the table name is invalid or the write fails.
    fn insert(&self, table: &str, data: Document) -> Result<Eid>;

    /// All documents matching `query`, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn search(&self, table: &str, query: &Query) -> Result<Vec<StoredDocument>>;

    /// First document matching `query`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn get(&self, table: &str, query: &Query) -> Result<Option<StoredDocument>> {
        Ok(self.search(table, query)?.into_iter().next())
    }

    /// True if any document matches `query`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn contains(&self, table: &str, query: &Query) -> Result<bool> {
        Ok(self.get(table, query)?.is_some())
    }

    /// Merge `fields` into every matching document; `null` fields are removed.
    /// Returns the number of documents changed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn update(&self, table: &str, fields: &Document, query: &Query) -> Result<usize>;

    /// Remove matching documents, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn remove(&self, table: &str, query: &Query) -> Result<usize>;

    /// Number of documents in `table`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend cannot be read.
    fn count(&self, table: &str) -> Result<usize>;

    /// Drop every document in `table` and reset its id sequence.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    fn purge(&self, table: &str) -> Result<()>;

    /// Run `body` atomically.
    ///
    /// # Errors
    ///
    /// Returns the body's error after rolling back, or a storage error if the
    /// commit fails.
    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Write a point-in-time copy of the whole store to `dest`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if called inside a transaction or the copy fails.
    fn snapshot(&self, dest: &Path) -> Result<()>;
}

/// Table names become file keys and SQL identifiers: ASCII alphanumerics and `_`.
pub(crate) fn validate_table(table: &str) -> Result<()> {
    if !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid table name '{table}'")))
    }
}

/// Merge `fields` into `data`, removing keys set to `null`.
/// Returns true if `data` changed.
pub(crate) fn merge_fields(data: &mut Document, fields: &Document) -> bool {
    let mut changed = false;
    for (key, value) in fields {
        if value.is_null() {
            changed |= data.remove(key).is_some();
        } else if data.get(key) != Some(value) {
            data.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
