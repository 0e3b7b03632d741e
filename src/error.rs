//! Error types for perfcfg
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! Configuration-class errors (`Configuration`, `UniqueAttribute`, `ImmutableRecord`,
//! `IncompatibleRecord`) carry hint strings that callers display verbatim.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// perfcfg error types
#[derive(Error, Debug)]
pub enum Error {
    /// Store file does not exist yet (caller may create it)
    #[error("Storage not initialized at {}", path.display())]
    StorageUninitialized {
        /// Path of the missing store file
        path: PathBuf,
    },

    /// Store file exists but cannot be read or parsed (fatal)
    #[error("Storage at {} is corrupt or inaccessible: {reason}\nPlease report this issue.", path.display())]
    StorageCorrupt {
        /// Path of the store file
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Generic storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// No project marker found walking upward (expected, recoverable)
    #[error("No project found at or above {}\nCreate a project here to initialize project storage.", searched_from.display())]
    ProjectStorage {
        /// Directory the search started from
        searched_from: PathBuf,
    },

    /// User-supplied data is invalid relative to schema or compatibility rules
    #[error("{message}")]
    Configuration {
        /// Human-readable description
        message: String,
        /// Suggested remedial commands
        hints: Vec<String>,
    },

    /// A unique attribute value is already taken in the table
    #[error("A {model} with {attribute} = {value} already exists")]
    UniqueAttribute {
        /// Model name
        model: String,
        /// Colliding attribute
        attribute: String,
        /// Colliding value
        value: String,
    },

    /// Record is referenced by experiments that already hold trial data
    #[error("{message}")]
    ImmutableRecord {
        /// Human-readable description
        message: String,
        /// Suggested remedial commands
        hints: Vec<String>,
    },

    /// Change would leave an existing experiment internally incompatible
    #[error("{message}")]
    IncompatibleRecord {
        /// Human-readable description
        message: String,
        /// Suggested remedial commands
        hints: Vec<String>,
    },

    /// Framework invariant violated (critical bug)
    #[error("Internal error: {0}\nThis is a bug in perfcfg. Please report this issue with the full message.")]
    Internal(String),

    /// Managed trial run ended in a state that cannot be reconciled automatically
    #[error("Trial error: {0}")]
    Trial(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Build a configuration error with hints.
    pub fn configuration<I, S>(message: impl Into<String>, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Configuration {
            message: message.into(),
            hints: hints.into_iter().map(Into::into).collect(),
        }
    }

    /// Build an immutable-record error with the standard remedies.
    pub fn immutable(message: impl Into<String>) -> Self {
        Self::ImmutableRecord {
            message: message.into(),
            hints: vec![
                "Copy the record and modify the copy".to_string(),
                "Delete the dependent experiments first".to_string(),
            ],
        }
    }

    /// Hint strings for configuration-class errors; empty otherwise.
    #[must_use]
    pub fn hints(&self) -> &[String] {
        match self {
            Self::Configuration { hints, .. }
            | Self::ImmutableRecord { hints, .. }
            | Self::IncompatibleRecord { hints, .. } => hints,
            _ => &[],
        }
    }

    /// True for `Configuration` and its subtypes.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::UniqueAttribute { .. }
                | Self::ImmutableRecord { .. }
                | Self::IncompatibleRecord { .. }
        )
    }

    /// True when the store simply does not exist yet.
    #[must_use]
    pub const fn is_not_initialized(&self) -> bool {
        matches!(
            self,
            Self::StorageUninitialized { .. } | Self::ProjectStorage { .. }
        )
    }
}
