//! Storage levels
//!
//! A [`StorageLevel`] is one scope (system, user, or project) rooted at a
//! filesystem prefix. It resolves its backend through the
//! [`BackendDispatcher`](crate::backend::BackendDispatcher) on first use and
//! forwards the [`Storage`] operations to it.
//!
//! Reads against a level whose store file does not exist yet behave like an
//! empty store; the first write creates the prefix directory and the store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use super::{Document, DocumentStore, Eid, Query, SqliteStore, Storage, StoredDocument};
use crate::backend::{BackendDispatcher, BackendKind};
use crate::{Error, Result};

/// Storage scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LevelName {
    /// Shared by every user of an installation
    System,
    /// Private to one user
    User,
    /// Private to one project directory
    Project,
}

impl LevelName {
    /// All levels, most specific last.
    pub const ALL: [Self; 3] = [Self::System, Self::User, Self::Project];

    /// Lowercase name, also the store file stem.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Project => "project",
        }
    }
}

impl fmt::Display for LevelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LevelName {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "project" => Ok(Self::Project),
            other => Err(Error::configuration(
                format!("Unknown storage level '{other}'"),
                ["Use one of: system, user, project"],
            )),
        }
    }
}

#[derive(Default)]
struct LevelState {
    backend: Option<Arc<dyn Storage>>,
    connections: usize,
}

/// One storage scope and its lazily opened backend.
pub struct StorageLevel {
    name: LevelName,
    prefix: PathBuf,
    requested: BackendKind,
    state: Mutex<LevelState>,
}

impl fmt::Debug for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLevel")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("requested", &self.requested)
            .finish_non_exhaustive()
    }
}

impl StorageLevel {
    /// Create a level rooted at `prefix`. Nothing is touched on disk.
    #[must_use]
    pub fn new(name: LevelName, prefix: impl Into<PathBuf>, requested: BackendKind) -> Self {
        Self {
            name,
            prefix: prefix.into(),
            requested,
            state: Mutex::new(LevelState::default()),
        }
    }

    /// Level name
    #[must_use]
    pub const fn name(&self) -> LevelName {
        self.name
    }

    /// Filesystem prefix
    #[must_use]
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Backend in use, or the one that would be chosen now.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level state lock is poisoned.
    pub fn backend_kind(&self) -> Result<BackendKind> {
        Ok(match &self.lock()?.backend {
            Some(backend) => backend.kind(),
            None => BackendDispatcher::select(&self.prefix, self.name, self.requested),
        })
    }

    /// Path of the store file in use (or to be created).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level state lock is poisoned.
    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(BackendDispatcher::store_path(
            &self.prefix,
            self.name,
            self.backend_kind()?,
        ))
    }

    fn lock(&self) -> Result<MutexGuard<'_, LevelState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage(format!("{} level lock poisoned", self.name)))
    }

    fn open(&self, create: bool) -> Result<Arc<dyn Storage>> {
        let kind = BackendDispatcher::select(&self.prefix, self.name, self.requested);
        let path = BackendDispatcher::store_path(&self.prefix, self.name, kind);
        let backend: Arc<dyn Storage> = match kind {
            BackendKind::Sqlite => Arc::new(SqliteStore::open(&path, create)?),
            BackendKind::Document | BackendKind::Auto => {
                Arc::new(DocumentStore::open(&path, create)?)
            }
        };
        debug!(level = %self.name, backend = %kind, path = %path.display(), "opened level storage");
        Ok(backend)
    }

    /// Cached backend, opening (and with `create`, creating) it if needed.
    /// `None` means the store does not exist and `create` was false.
    fn backend(&self, create: bool) -> Result<Option<Arc<dyn Storage>>> {
        let mut state = self.lock()?;
        if let Some(backend) = &state.backend {
            return Ok(Some(Arc::clone(backend)));
        }
        match self.open(create) {
            Ok(backend) => {
                state.backend = Some(Arc::clone(&backend));
                Ok(Some(backend))
            }
            Err(e) if !create && matches!(e, Error::StorageUninitialized { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn writable(&self) -> Result<Arc<dyn Storage>> {
        self.backend(true)?
            .ok_or_else(|| Error::Internal(format!("{} level did not open for writing", self.name)))
    }

    /// Open the store, creating the prefix and an empty store if needed.
    ///
    /// Calls are reference counted and must be paired with
    /// [`disconnect_filesystem`](Self::disconnect_filesystem).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is corrupt or cannot be created.
    pub fn connect_filesystem(&self) -> Result<()> {
        let backend = self.writable()?;
        let mut state = self.lock()?;
        state.connections += 1;
        if state.connections == 1 {
            info!(level = %self.name, path = %backend.path().display(), "connected storage");
        }
        Ok(())
    }

    /// Release one connection; the backend is closed when none remain.
    /// Extra calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level state lock is poisoned.
    pub fn disconnect_filesystem(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.connections == 0 {
            return Ok(());
        }
        state.connections -= 1;
        if state.connections == 0 {
            state.backend = None;
            debug!(level = %self.name, "disconnected storage");
        }
        Ok(())
    }

    /// Open connection count.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.lock().map_or(0, |s| s.connections)
    }

    /// Check whether the store exists and is readable.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the store exists but is corrupt.
    pub fn verify(&self) -> Result<bool> {
        match self.backend(false) {
            Ok(found) => Ok(found.is_some()),
            Err(e) if e.is_not_initialized() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// True if the store exists and opens cleanly.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.verify().unwrap_or(false)
    }

    /// Close the backend and recursively delete the prefix.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.backend = None;
            state.connections = 0;
        }
        if self.prefix.exists() {
            std::fs::remove_dir_all(&self.prefix)?;
        }
        info!(level = %self.name, prefix = %self.prefix.display(), "destroyed storage");
        Ok(())
    }

    /// Insert a document, creating the store if needed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn insert(&self, table: &str, data: Document) -> Result<Eid> {
        self.writable()?.insert(table, data)
    }

    /// Matching documents, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is corrupt.
    pub fn search(&self, table: &str, query: &Query) -> Result<Vec<StoredDocument>> {
        match self.backend(false)? {
            Some(backend) => backend.search(table, query),
            None => Ok(Vec::new()),
        }
    }

    /// First matching document.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is corrupt.
    pub fn get(&self, table: &str, query: &Query) -> Result<Option<StoredDocument>> {
        match self.backend(false)? {
            Some(backend) => backend.get(table, query),
            None => Ok(None),
        }
    }

    /// True if any document matches.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is corrupt.
    pub fn contains(&self, table: &str, query: &Query) -> Result<bool> {
        Ok(self.get(table, query)?.is_some())
    }

    /// Merge `fields` into matching documents.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn update(&self, table: &str, fields: &Document, query: &Query) -> Result<usize> {
        match self.backend(false)? {
            Some(backend) => backend.update(table, fields, query),
            None => Ok(0),
        }
    }

    /// Remove matching documents.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn remove(&self, table: &str, query: &Query) -> Result<usize> {
        match self.backend(false)? {
            Some(backend) => backend.remove(table, query),
            None => Ok(0),
        }
    }

    /// Number of documents in `table`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the store is corrupt.
    pub fn count(&self, table: &str) -> Result<usize> {
        match self.backend(false)? {
            Some(backend) => backend.count(table),
            None => Ok(0),
        }
    }

    /// Drop every document in `table`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn purge(&self, table: &str) -> Result<()> {
        match self.backend(false)? {
            Some(backend) => backend.purge(table),
            None => Ok(()),
        }
    }

    /// Run `body` atomically against this level, returning its value.
    ///
    /// # Errors
    ///
    /// Returns the body's error after rolling back its writes.
    pub fn transaction<T>(&self, mut body: impl FnMut() -> Result<T>) -> Result<T> {
        let backend = self.writable()?;
        let mut out = None;
        backend.transaction(&mut || {
            out = Some(body()?);
            Ok(())
        })?;
        out.ok_or_else(|| Error::Internal("transaction body produced no value".to_string()))
    }

    /// Copy the whole store to `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageUninitialized`] if the store does not exist.
    pub fn snapshot(&self, dest: &Path) -> Result<()> {
        match self.backend(false)? {
            Some(backend) => backend.snapshot(dest),
            None => Err(Error::StorageUninitialized {
                path: self.store_path()?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn level(dir: &Path, kind: BackendKind) -> StorageLevel {
        StorageLevel::new(LevelName::User, dir.join("prefix"), kind)
    }

    #[test]
    fn test_reads_before_creation_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let level = level(dir.path(), BackendKind::Auto);
        assert!(!level.verify().unwrap());
        assert!(level.search("target", &Query::All).unwrap().is_empty());
        assert_eq!(level.count("target").unwrap(), 0);
        assert!(!dir.path().join("prefix").exists());
    }

    #[test]
    fn test_first_write_creates_store() {
        let dir = tempfile::tempdir().unwrap();
        let level = level(dir.path(), BackendKind::Auto);
        let mut doc = Document::new();
        doc.insert("name".into(), json!("t"));
        level.insert("target", doc).unwrap();
        assert!(dir.path().join("prefix").join("user.json").is_file());
        assert!(level.is_initialized());
    }

    #[test]
    fn test_connect_is_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let level = level(dir.path(), BackendKind::Sqlite);
        level.connect_filesystem().unwrap();
        level.connect_filesystem().unwrap();
        assert_eq!(level.connections(), 2);
        assert!(dir.path().join("prefix").join("user.sqlite3").is_file());
        level.disconnect_filesystem().unwrap();
        level.disconnect_filesystem().unwrap();
        level.disconnect_filesystem().unwrap();
        assert_eq!(level.connections(), 0);
    }

    #[test]
    fn test_corrupt_store_fails_verify() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("prefix");
        std::fs::create_dir_all(&prefix).unwrap();
        std::fs::write(prefix.join("user.json"), b"[[[").unwrap();
        let level = level(dir.path(), BackendKind::Auto);
        assert!(level.verify().is_err());
        assert!(!level.is_initialized());
    }

    #[test]
    fn test_transaction_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let level = level(dir.path(), BackendKind::Document);
        let eid = level
            .transaction(|| level.insert("t", Document::new()))
            .unwrap();
        assert_eq!(eid, 1);
    }

    #[test]
    fn test_destroy_removes_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let level = level(dir.path(), BackendKind::Auto);
        level.connect_filesystem().unwrap();
        level.destroy().unwrap();
        assert!(!dir.path().join("prefix").exists());
        assert_eq!(level.connections(), 0);
    }

    #[test]
    fn test_level_name_parse() {
        assert_eq!("project".parse::<LevelName>().unwrap(), LevelName::Project);
        assert!("global".parse::<LevelName>().unwrap_err().is_configuration());
    }
}
