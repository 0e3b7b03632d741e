//! Storage backend dispatcher
//!
//! Two interchangeable backends sit behind [`crate::storage::Storage`]: an embedded
//! JSON document store and a relational `SQLite` store. A level uses exactly one of
//! them; the first one created wins.
//!
//! ## Auto selection
//!
//! - relational file present at the level prefix → `Sqlite`
//! - otherwise → `Document`
//! - both present (interrupted switch) → `Sqlite`, with a warning

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::storage::level::LevelName;
use crate::{Error, Result};

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Use whichever store already exists at the level, document store otherwise
    #[default]
    Auto,
    /// Force the embedded JSON document store
    Document,
    /// Force the `SQLite` store
    Sqlite,
}

impl BackendKind {
    /// Configuration spelling of this backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Document => "document",
            Self::Sqlite => "sqlite",
        }
    }

    /// Store file name for `level` under this backend (`Auto` has none).
    #[must_use]
    pub fn file_name(self, level: LevelName) -> Option<String> {
        match self {
            Self::Auto => None,
            Self::Document => Some(format!("{}.json", level.as_str())),
            Self::Sqlite => Some(format!("{}.sqlite3", level.as_str())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "document" | "tinydb" | "json" => Ok(Self::Document),
            "sqlite" | "sql" => Ok(Self::Sqlite),
            other => Err(Error::configuration(
                format!("Unknown storage backend '{other}'"),
                ["Use one of: auto, document, sqlite"],
            )),
        }
    }
}

/// Backend selection for a storage level.
pub struct BackendDispatcher {
    _private: (),
}

impl BackendDispatcher {
    /// Resolve `requested` to a concrete backend for the level at `prefix`.
    ///
    /// Explicit requests are returned unchanged. `Auto` inspects the prefix for
    /// existing store files.
    #[must_use]
    pub fn select(prefix: &Path, level: LevelName, requested: BackendKind) -> BackendKind {
        if requested != BackendKind::Auto {
            return requested;
        }
        let sqlite = Self::store_path(prefix, level, BackendKind::Sqlite);
        let document = Self::store_path(prefix, level, BackendKind::Document);
        let selected = match (sqlite.is_file(), document.is_file()) {
            (true, true) => {
                warn!(
                    level = %level,
                    prefix = %prefix.display(),
                    "both document and sqlite stores exist; using sqlite"
                );
                BackendKind::Sqlite
            }
            (true, false) => BackendKind::Sqlite,
            _ => BackendKind::Document,
        };
        debug!(level = %level, backend = %selected, "auto-selected storage backend");
        selected
    }

    /// Path of the store file for a concrete backend.
    ///
    /// `Auto` maps to the document store path.
    #[must_use]
    pub fn store_path(prefix: &Path, level: LevelName, kind: BackendKind) -> PathBuf {
        let kind = if kind == BackendKind::Auto {
            BackendKind::Document
        } else {
            kind
        };
        // file_name is Some for concrete kinds
        prefix.join(kind.file_name(level).unwrap_or_default())
    }
}
