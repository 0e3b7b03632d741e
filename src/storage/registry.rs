//! Storage level registry and project discovery
//!
//! System and user levels sit at configured prefixes. The project level is
//! found by walking upward from the working directory until a `.perfcfg`
//! marker directory turns up that is not really a user or system prefix.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::level::{LevelName, StorageLevel};
use crate::backend::{BackendDispatcher, BackendKind};
use crate::config::{Config, PROJECT_MARKER};
use crate::{Error, Result};

/// The three storage levels of one process.
#[derive(Debug)]
pub struct StorageRegistry {
    backend: BackendKind,
    cwd: PathBuf,
    system: Arc<StorageLevel>,
    user: Arc<StorageLevel>,
    project: Mutex<Option<Arc<StorageLevel>>>,
}

impl StorageRegistry {
    /// Registry for `config`. The project level is discovered on first use.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            backend: config.backend(),
            cwd: config.cwd().to_path_buf(),
            system: Arc::new(StorageLevel::new(
                LevelName::System,
                config.system_prefix(),
                config.backend(),
            )),
            user: Arc::new(StorageLevel::new(
                LevelName::User,
                config.user_prefix(),
                config.backend(),
            )),
            project: Mutex::new(None),
        }
    }

    /// Look up a level by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectStorage`] for `Project` when no project exists
    /// at or above the working directory.
    pub fn level(&self, name: LevelName) -> Result<Arc<StorageLevel>> {
        match name {
            LevelName::System => Ok(Arc::clone(&self.system)),
            LevelName::User => Ok(Arc::clone(&self.user)),
            LevelName::Project => self.project(),
        }
    }

    /// System level
    #[must_use]
    pub fn system(&self) -> Arc<StorageLevel> {
        Arc::clone(&self.system)
    }

    /// User level
    #[must_use]
    pub fn user(&self) -> Arc<StorageLevel> {
        Arc::clone(&self.user)
    }

    /// Project level, discovering it on first call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectStorage`] if no project marker is found.
    pub fn project(&self) -> Result<Arc<StorageLevel>> {
        let mut slot = self.project_slot()?;
        if let Some(level) = slot.as_ref() {
            return Ok(Arc::clone(level));
        }
        let prefix =
            discover_project_prefix(&self.cwd, self.user.prefix(), self.system.prefix())?;
        let level = Arc::new(StorageLevel::new(LevelName::Project, prefix, self.backend));
        *slot = Some(Arc::clone(&level));
        Ok(level)
    }

    fn project_slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Arc<StorageLevel>>>> {
        self.project
            .lock()
            .map_err(|_| Error::Storage("project level lock poisoned".to_string()))
    }

    /// Create project storage under `dir` and make it the project level.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `dir/.perfcfg` coincides with the
    /// user or system prefix, or a storage error if the store cannot be created.
    pub fn create_project(&self, dir: &Path) -> Result<Arc<StorageLevel>> {
        let prefix = dir.join(PROJECT_MARKER);
        if same_path(&prefix, self.user.prefix()) || same_path(&prefix, self.system.prefix()) {
            return Err(Error::configuration(
                format!(
                    "Cannot create project storage at {}: it is the user or system storage prefix",
                    prefix.display()
                ),
                ["Create the project in a different directory"],
            ));
        }
        let level = Arc::new(StorageLevel::new(LevelName::Project, prefix, self.backend));
        level.connect_filesystem()?;
        level.disconnect_filesystem()?;
        info!(prefix = %level.prefix().display(), "created project storage");
        *self.project_slot()? = Some(Arc::clone(&level));
        Ok(level)
    }

    /// Recursively delete the project level and forget it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectStorage`] if there is no project, or an IO
    /// error if deletion fails.
    pub fn destroy_project(&self) -> Result<()> {
        let level = self.project()?;
        level.destroy()?;
        *self.project_slot()? = None;
        Ok(())
    }

    /// Every level that currently resolves, least specific first.
    #[must_use]
    pub fn levels(&self) -> Vec<Arc<StorageLevel>> {
        let mut levels = vec![self.system(), self.user()];
        if let Ok(project) = self.project() {
            levels.push(project);
        }
        levels
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// True if `marker` holds a user- or system-level store file.
fn holds_foreign_store(marker: &Path) -> bool {
    [LevelName::User, LevelName::System].iter().any(|level| {
        [BackendKind::Document, BackendKind::Sqlite]
            .iter()
            .any(|kind| BackendDispatcher::store_path(marker, *level, *kind).exists())
    })
}

/// Walk upward from `start` to find the project storage prefix.
///
/// A candidate `<dir>/.perfcfg` must be a directory, must not hold user or
/// system store files, and must differ from both configured prefixes.
///
/// # Errors
///
/// Returns [`Error::ProjectStorage`] if the walk reaches the filesystem root.
pub fn discover_project_prefix(
    start: &Path,
    user_prefix: &Path,
    system_prefix: &Path,
) -> Result<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    for dir in start.ancestors() {
        let candidate = dir.join(PROJECT_MARKER);
        if !candidate.is_dir() {
            continue;
        }
        if holds_foreign_store(&candidate)
            || same_path(&candidate, user_prefix)
            || same_path(&candidate, system_prefix)
        {
            debug!(candidate = %candidate.display(), "skipping non-project marker");
            continue;
        }
        debug!(prefix = %candidate.display(), "discovered project storage");
        return Ok(candidate);
    }
    Err(Error::ProjectStorage {
        searched_from: start,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discovery_skips_user_marker() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let marker = home.join(PROJECT_MARKER);
        fs::create_dir_all(&marker).unwrap();
        fs::write(marker.join("user.json"), b"{}").unwrap();
        let work = home.join("work");
        fs::create_dir_all(&work).unwrap();

        let err = discover_project_prefix(&work, Path::new("/nonexistent/u"), Path::new("/nonexistent/s"))
            .unwrap_err();
        assert!(matches!(err, Error::ProjectStorage { .. }));
    }

    #[test]
    fn test_discovery_skips_configured_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join(PROJECT_MARKER);
        fs::create_dir_all(&marker).unwrap();
        let err = discover_project_prefix(dir.path(), &marker, Path::new("/nonexistent/s"))
            .unwrap_err();
        assert!(err.is_not_initialized());
    }

    #[test]
    fn test_create_and_destroy_project() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder()
            .system_prefix(dir.path().join("sys"))
            .user_prefix(dir.path().join("usr"))
            .cwd(dir.path())
            .build()
            .unwrap();
        let registry = StorageRegistry::new(&config);
        assert!(registry.project().is_err());

        let level = registry.create_project(dir.path()).unwrap();
        assert!(level.is_initialized());
        assert_eq!(registry.levels().len(), 3);

        registry.destroy_project().unwrap();
        assert!(!dir.path().join(PROJECT_MARKER).exists());
        assert!(registry.project().is_err());
    }
}
