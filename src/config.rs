//! Process-wide configuration
//!
//! The storage backend is the only externally configurable knob of the core;
//! level prefixes and the discovery start directory are overridable for
//! packaging and tests.

use std::env;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::Result;

/// Environment variable selecting the storage backend.
pub const BACKEND_ENV: &str = "PERFCFG_STORAGE_BACKEND";
/// Environment variable overriding the system-level prefix.
pub const SYSTEM_PREFIX_ENV: &str = "PERFCFG_SYSTEM_PREFIX";
/// Environment variable overriding the user-level prefix.
pub const USER_PREFIX_ENV: &str = "PERFCFG_USER_PREFIX";

/// Name of the marker directory that holds project-level storage.
pub const PROJECT_MARKER: &str = ".perfcfg";

const DEFAULT_SYSTEM_PREFIX: &str = "/usr/local/share/perfcfg";

/// Resolved configuration for one process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    backend: BackendKind,
    system_prefix: PathBuf,
    user_prefix: PathBuf,
    cwd: PathBuf,
}

impl Config {
    /// Create a configuration builder with defaults.
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Read configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `PERFCFG_STORAGE_BACKEND` holds an
    /// unknown value, or an IO error if the current directory is unreadable.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Ok(value) = env::var(BACKEND_ENV) {
            builder = builder.backend(value.parse()?);
        }
        if let Some(path) = env::var_os(SYSTEM_PREFIX_ENV) {
            builder = builder.system_prefix(path);
        }
        if let Some(path) = env::var_os(USER_PREFIX_ENV) {
            builder = builder.user_prefix(path);
        }
        builder.cwd(env::current_dir()?).build()
    }

    /// Requested storage backend.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// System-level storage prefix.
    #[must_use]
    pub fn system_prefix(&self) -> &Path {
        &self.system_prefix
    }

    /// User-level storage prefix.
    #[must_use]
    pub fn user_prefix(&self) -> &Path {
        &self.user_prefix
    }

    /// Directory project discovery starts from.
    #[must_use]
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    backend: BackendKind,
    system_prefix: Option<PathBuf>,
    user_prefix: Option<PathBuf>,
    cwd: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Set backend selection strategy
    #[must_use]
    pub const fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the system-level prefix
    #[must_use]
    pub fn system_prefix(mut self, path: impl Into<PathBuf>) -> Self {
        self.system_prefix = Some(path.into());
        self
    }

    /// Set the user-level prefix
    #[must_use]
    pub fn user_prefix(mut self, path: impl Into<PathBuf>) -> Self {
        self.user_prefix = Some(path.into());
        self
    }

    /// Set the directory project discovery starts from
    #[must_use]
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    /// Build the configuration
    ///
    /// # Errors
    ///
    /// Returns an IO error if no `cwd` was given and the process current
    /// directory cannot be read.
    pub fn build(self) -> Result<Config> {
        let cwd = match self.cwd {
            Some(cwd) => cwd,
            None => env::current_dir()?,
        };
        let user_prefix = self.user_prefix.unwrap_or_else(default_user_prefix);
        Ok(Config {
            backend: self.backend,
            system_prefix: self
                .system_prefix
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_PREFIX)),
            user_prefix,
            cwd,
        })
    }
}

fn default_user_prefix() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || PathBuf::from(".perfcfg-user"),
        |home| PathBuf::from(home).join(".local").join("perfcfg"),
    )
}
