//! Embedded JSON document store.
//!
//! The whole store lives in memory and is rewritten to disk (temp file +
//! rename) after every committed change. Transactions keep a stack of
//! snapshots; rolling back restores the innermost one.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{merge_fields, validate_table, Document, Eid, Query, Storage, StoredDocument};
use crate::backend::BackendKind;
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    #[serde(default)]
    last_eid: Eid,
    #[serde(default)]
    records: BTreeMap<Eid, Document>,
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    savepoints: Vec<Tables>,
}

/// JSON-file backed [`Storage`].
#[derive(Debug)]
pub struct DocumentStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl DocumentStore {
    /// Open the store at `path`.
    ///
    /// With `create`, a missing file (and its parent directories) is created
    /// empty.
    ///
    /// # Errors
    ///
    /// - [`Error::StorageUninitialized`] if the file is missing and `create` is false
    /// - [`Error::StorageCorrupt`] if the file cannot be read or parsed
    pub fn open(path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let path = path.into();
        let tables = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Tables::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::StorageCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if !create {
                    return Err(Error::StorageUninitialized { path });
                }
                let tables = Tables::new();
                write_atomic(&path, &tables)?;
                debug!(path = %path.display(), "created document store");
                tables
            }
            Err(e) => {
                return Err(Error::StorageCorrupt {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(State {
                tables,
                savepoints: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("document store lock poisoned".to_string()))
    }

    /// Persist unless a transaction is open.
    fn commit(&self, state: &State) -> Result<()> {
        if state.savepoints.is_empty() {
            write_atomic(&self.path, &state.tables)?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, tables: &Tables) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(tables)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl Storage for DocumentStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn insert(&self, table: &str, data: Document) -> Result<Eid> {
        validate_table(table)?;
        let mut state = self.lock()?;
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.last_eid += 1;
        let eid = entry.last_eid;
        entry.records.insert(eid, data);
        self.commit(&state)?;
        trace!(table, eid, "document insert");
        Ok(eid)
    }

    fn search(&self, table: &str, query: &Query) -> Result<Vec<StoredDocument>> {
        validate_table(table)?;
        let state = self.lock()?;
        let Some(entry) = state.tables.get(table) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .records
            .iter()
            .filter(|(eid, data)| query.matches(**eid, data))
            .map(|(eid, data)| StoredDocument {
                eid: *eid,
                data: data.clone(),
            })
            .collect())
    }

    fn update(&self, table: &str, fields: &Document, query: &Query) -> Result<usize> {
        validate_table(table)?;
        let mut state = self.lock()?;
        let Some(entry) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut changed = 0;
        for (eid, data) in &mut entry.records {
            if query.matches(*eid, data) && merge_fields(data, fields) {
                changed += 1;
            }
        }
        if changed > 0 {
            self.commit(&state)?;
        }
        Ok(changed)
    }

    fn remove(&self, table: &str, query: &Query) -> Result<usize> {
        validate_table(table)?;
        let mut state = self.lock()?;
        let Some(entry) = state.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = entry.records.len();
        entry.records.retain(|eid, data| !query.matches(*eid, data));
        let removed = before - entry.records.len();
        if removed > 0 {
            self.commit(&state)?;
        }
        Ok(removed)
    }

    fn count(&self, table: &str) -> Result<usize> {
        validate_table(table)?;
        let state = self.lock()?;
        Ok(state.tables.get(table).map_or(0, |t| t.records.len()))
    }

    fn purge(&self, table: &str) -> Result<()> {
        validate_table(table)?;
        let mut state = self.lock()?;
        if state.tables.remove(table).is_some() {
            self.commit(&state)?;
        }
        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        {
            let mut state = self.lock()?;
            let saved = state.tables.clone();
            state.savepoints.push(saved);
        }
        let outcome = body();
        let mut state = self.lock()?;
        let saved = state
            .savepoints
            .pop()
            .ok_or_else(|| Error::Internal("document store savepoint stack underflow".into()))?;
        match outcome {
            Ok(()) => {
                self.commit(&state)?;
                Ok(())
            }
            Err(e) => {
                state.tables = saved;
                debug!(path = %self.path.display(), error = %e, "document transaction rolled back");
                Err(e)
            }
        }
    }

    fn snapshot(&self, dest: &Path) -> Result<()> {
        let state = self.lock()?;
        if !state.savepoints.is_empty() {
            return Err(Error::Storage(
                "cannot snapshot inside a transaction".to_string(),
            ));
        }
        write_atomic(dest, &state.tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentStore::open(dir.path().join("user.json"), false).unwrap_err();
        assert!(matches!(err, Error::StorageUninitialized { .. }));
        assert!(err.is_not_initialized());
    }

    #[test]
    fn test_open_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.json");
        fs::write(&path, b"{not json").unwrap();
        let err = DocumentStore::open(&path, true).unwrap_err();
        assert!(matches!(err, Error::StorageCorrupt { .. }));
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project.json");
        let eid = {
            let store = DocumentStore::open(&path, true).unwrap();
            store.insert("target", doc(json!({"name": "t1"}))).unwrap()
        };
        let store = DocumentStore::open(&path, false).unwrap();
        let found = store.get("target", &Query::Eid(eid)).unwrap().unwrap();
        assert_eq!(found.data["name"], json!("t1"));
    }

    #[test]
    fn test_eids_are_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("s.json"), true).unwrap();
        let a = store.insert("t", Document::new()).unwrap();
        store.remove("t", &Query::Eid(a)).unwrap();
        let b = store.insert("t", Document::new()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_transaction_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        let store = DocumentStore::open(&path, true).unwrap();
        store.insert("t", doc(json!({"n": 1}))).unwrap();

        let result = store.transaction(&mut || {
            store.insert("t", doc(json!({"n": 2})))?;
            store.update("t", &doc(json!({"n": 10})), &Query::All)?;
            Err(Error::Trial("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.count("t").unwrap(), 1);
        let reopened = DocumentStore::open(&path, false).unwrap();
        let rows = reopened.search("t", &Query::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].data["n"], json!(1));
    }

    #[test]
    fn test_nested_transaction_inner_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("s.json"), true).unwrap();
        store
            .transaction(&mut || {
                store.insert("t", Document::new())?;
                let inner = store.transaction(&mut || {
                    store.insert("t", Document::new())?;
                    Err(Error::Trial("inner".into()))
                });
                assert!(inner.is_err());
                Ok(())
            })
            .unwrap();
        assert_eq!(store.count("t").unwrap(), 1);
    }

    #[test]
    fn test_snapshot_copies_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path().join("s.json"), true).unwrap();
        store.insert("t", doc(json!({"x": true}))).unwrap();
        let dest = dir.path().join("snap").join("s.json");
        store.snapshot(&dest).unwrap();
        let copy = DocumentStore::open(&dest, false).unwrap();
        assert_eq!(copy.count("t").unwrap(), 1);
    }
}
