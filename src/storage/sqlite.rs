//! Relational store backed by `SQLite`.
//!
//! Each table is `(eid INTEGER PRIMARY KEY AUTOINCREMENT, data TEXT)` with the
//! document kept as JSON text. Key queries are narrowed in SQL with the JSON1
//! functions and then confirmed with [`Query::matches`], so matching semantics
//! are identical to the document store.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, trace};

use super::{merge_fields, validate_table, Document, Eid, Query, Storage, StoredDocument};
use crate::backend::BackendKind;
use crate::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner {
    conn: Connection,
    depth: usize,
}

/// `SQLite` backed [`Storage`].
pub struct SqliteStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open the database at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::StorageUninitialized`] if the file is missing and `create` is false
    /// - [`Error::StorageCorrupt`] if the file is not a readable database
    pub fn open(path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            if !create {
                return Err(Error::StorageUninitialized { path });
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let corrupt = |e: rusqlite::Error| Error::StorageCorrupt {
            path: path.clone(),
            reason: e.to_string(),
        };
        let conn = Connection::open(&path).map_err(corrupt)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(corrupt)?;
        // Forces a header read; a non-database file fails here.
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
            .map_err(corrupt)?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self {
            path,
            inner: Mutex::new(Inner { conn, depth: 0 }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("sqlite store lock poisoned".to_string()))
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn ensure_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (\
            eid INTEGER PRIMARY KEY AUTOINCREMENT, \
            data TEXT NOT NULL)"
    ))?;
    Ok(())
}

fn eid_param(eid: Eid) -> Result<SqlValue> {
    i64::try_from(eid)
        .map(SqlValue::Integer)
        .map_err(|_| Error::Storage(format!("record id {eid} out of range")))
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

/// SQL prefilter for `query`. Never stricter than [`Query::matches`].
fn where_clause(query: &Query) -> Result<(String, Vec<SqlValue>)> {
    match query {
        Query::All => Ok(("1".to_string(), Vec::new())),
        Query::Eid(eid) => Ok(("eid = ?".to_string(), vec![eid_param(*eid)?])),
        Query::Eids(eids) if eids.is_empty() => Ok(("0".to_string(), Vec::new())),
        Query::Eids(eids) => {
            let params = eids.iter().map(|e| eid_param(*e)).collect::<Result<Vec<_>>>()?;
            let marks = vec!["?"; params.len()].join(", ");
            Ok((format!("eid IN ({marks})"), params))
        }
        Query::Keys { keys, match_any } => {
            if keys.is_empty() {
                let clause = if *match_any { "0" } else { "1" };
                return Ok((clause.to_string(), Vec::new()));
            }
            let mut clauses = Vec::with_capacity(keys.len());
            let mut params = Vec::new();
            for (key, value) in keys {
                let scalar = match value {
                    Value::Null => {
                        clauses.push("json_extract(data, ?) IS NULL".to_string());
                        params.push(SqlValue::Text(json_path(key)));
                        continue;
                    }
                    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => SqlValue::Integer(i),
                        None => SqlValue::Real(n.as_f64().unwrap_or_default()),
                    },
                    Value::String(s) => SqlValue::Text(s.clone()),
                    // Containers are compared in Rust
                    Value::Array(_) | Value::Object(_) => {
                        clauses.push("1".to_string());
                        continue;
                    }
                };
                clauses.push("json_extract(data, ?) = ?".to_string());
                params.push(SqlValue::Text(json_path(key)));
                params.push(scalar);
            }
            let joiner = if *match_any { " OR " } else { " AND " };
            Ok((format!("({})", clauses.join(joiner)), params))
        }
    }
}

fn select(conn: &Connection, table: &str, query: &Query) -> Result<Vec<StoredDocument>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }
    let (clause, params) = where_clause(query)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT eid, data FROM \"{table}\" WHERE {clause} ORDER BY eid"
    ))?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut found = Vec::with_capacity(rows.len());
    for (eid, text) in rows {
        let eid = Eid::try_from(eid)
            .map_err(|_| Error::Storage(format!("negative record id {eid} in '{table}'")))?;
        let data: Document = serde_json::from_str(&text)?;
        if query.matches(eid, &data) {
            found.push(StoredDocument { eid, data });
        }
    }
    Ok(found)
}

impl Storage for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn insert(&self, table: &str, data: Document) -> Result<Eid> {
        validate_table(table)?;
        let mut inner = self.lock()?;
        let sp = inner.conn.savepoint()?;
        ensure_table(&sp, table)?;
        sp.execute(
            &format!("INSERT INTO \"{table}\" (data) VALUES (?1)"),
            [serde_json::to_string(&data)?],
        )?;
        let rowid = sp.last_insert_rowid();
        sp.commit()?;
        let eid = Eid::try_from(rowid)
            .map_err(|_| Error::Internal(format!("sqlite returned rowid {rowid}")))?;
        trace!(table, eid, "sqlite insert");
        Ok(eid)
    }

    fn search(&self, table: &str, query: &Query) -> Result<Vec<StoredDocument>> {
        validate_table(table)?;
        let inner = self.lock()?;
        select(&inner.conn, table, query)
    }

    fn update(&self, table: &str, fields: &Document, query: &Query) -> Result<usize> {
        validate_table(table)?;
        let mut inner = self.lock()?;
        let sp = inner.conn.savepoint()?;
        let mut changed = 0;
        for mut doc in select(&sp, table, query)? {
            if merge_fields(&mut doc.data, fields) {
                sp.execute(
                    &format!("UPDATE \"{table}\" SET data = ?1 WHERE eid = ?2"),
                    [
                        SqlValue::Text(serde_json::to_string(&doc.data)?),
                        eid_param(doc.eid)?,
                    ],
                )?;
                changed += 1;
            }
        }
        sp.commit()?;
        Ok(changed)
    }

    fn remove(&self, table: &str, query: &Query) -> Result<usize> {
        validate_table(table)?;
        let mut inner = self.lock()?;
        let sp = inner.conn.savepoint()?;
        let doomed = select(&sp, table, query)?;
        for doc in &doomed {
            sp.execute(
                &format!("DELETE FROM \"{table}\" WHERE eid = ?1"),
                [eid_param(doc.eid)?],
            )?;
        }
        sp.commit()?;
        Ok(doomed.len())
    }

    fn count(&self, table: &str) -> Result<usize> {
        validate_table(table)?;
        let inner = self.lock()?;
        if !table_exists(&inner.conn, table)? {
            return Ok(0);
        }
        let n: i64 = inner
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| {
                row.get(0)
            })?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn purge(&self, table: &str) -> Result<()> {
        validate_table(table)?;
        let inner = self.lock()?;
        // Dropping an AUTOINCREMENT table also drops its sqlite_sequence row.
        inner
            .conn
            .execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
        Ok(())
    }

    fn transaction(&self, body: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let name = {
            let mut inner = self.lock()?;
            let name = format!("perfcfg_sp{}", inner.depth + 1);
            inner.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
            inner.depth += 1;
            name
        };
        let outcome = body();
        let mut inner = self.lock()?;
        inner.depth = inner.depth.saturating_sub(1);
        match outcome {
            Ok(()) => {
                inner.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(())
            }
            Err(e) => {
                inner
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;
                debug!(path = %self.path.display(), error = %e, "sqlite transaction rolled back");
                Err(e)
            }
        }
    }

    fn snapshot(&self, dest: &Path) -> Result<()> {
        let inner = self.lock()?;
        if inner.depth > 0 {
            return Err(Error::Storage(
                "cannot snapshot inside a transaction".to_string(),
            ));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }
        inner
            .conn
            .execute("VACUUM INTO ?1", [dest.to_string_lossy().into_owned()])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("user.sqlite3"), true).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = SqliteStore::open(dir.path().join("user.sqlite3"), false).unwrap_err();
        assert!(err.is_not_initialized());
    }

    #[test]
    fn test_open_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.sqlite3");
        std::fs::write(&path, vec![0x42_u8; 4096]).unwrap();
        let err = SqliteStore::open(&path, false).unwrap_err();
        assert!(matches!(err, Error::StorageCorrupt { .. }));
    }

    #[test]
    fn test_search_on_missing_table_is_empty() {
        let (_dir, store) = store();
        assert!(store.search("target", &Query::All).unwrap().is_empty());
        assert_eq!(store.count("target").unwrap(), 0);
    }

    #[test]
    fn test_key_queries() {
        let (_dir, store) = store();
        store
            .insert("m", doc(json!({"name": "a", "mpi": true, "callpath": 100})))
            .unwrap();
        store
            .insert("m", doc(json!({"name": "b", "mpi": false})))
            .unwrap();

        let hits = store.search("m", &Query::key("mpi", true)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["name"], json!("a"));

        // integer 1 must not match boolean true
        assert!(store.search("m", &Query::key("mpi", 1)).unwrap().is_empty());

        let absent = store
            .search("m", &Query::key("callpath", Value::Null))
            .unwrap();
        assert_eq!(absent.len(), 1);
        assert_eq!(absent[0].data["name"], json!("b"));

        let either = Query::keys(doc(json!({"name": "a", "mpi": false})), true);
        assert_eq!(store.search("m", &either).unwrap().len(), 2);
    }

    #[test]
    fn test_update_and_remove() {
        let (_dir, store) = store();
        let a = store.insert("t", doc(json!({"n": 1}))).unwrap();
        store.insert("t", doc(json!({"n": 2}))).unwrap();
        let changed = store
            .update("t", &doc(json!({"n": null, "m": 5})), &Query::Eid(a))
            .unwrap();
        assert_eq!(changed, 1);
        let row = store.get("t", &Query::Eid(a)).unwrap().unwrap();
        assert_eq!(Value::Object(row.data), json!({"m": 5}));
        assert_eq!(store.remove("t", &Query::key("n", 2)).unwrap(), 1);
        assert_eq!(store.count("t").unwrap(), 1);
    }

    #[test]
    fn test_purge_resets_sequence() {
        let (_dir, store) = store();
        store.insert("t", Document::new()).unwrap();
        store.insert("t", Document::new()).unwrap();
        store.purge("t").unwrap();
        assert_eq!(store.insert("t", Document::new()).unwrap(), 1);
    }

    #[test]
    fn test_transaction_rollback() {
        let (_dir, store) = store();
        store.insert("t", doc(json!({"n": 1}))).unwrap();
        let result = store.transaction(&mut || {
            store.insert("t", doc(json!({"n": 2})))?;
            Err(Error::Trial("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.count("t").unwrap(), 1);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (dir, store) = store();
        store.insert("t", doc(json!({"x": "y"}))).unwrap();
        let dest = dir.path().join("trial0").join("user.sqlite3");
        store.snapshot(&dest).unwrap();
        let copy = SqliteStore::open(&dest, false).unwrap();
        assert_eq!(copy.count("t").unwrap(), 1);
    }
}
