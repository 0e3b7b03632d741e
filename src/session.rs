//! Per-process session
//!
//! A [`Session`] is constructed once per invocation and passed explicitly to
//! everything that touches the model: it owns the configuration, the storage
//! levels, the validated model registry, the record cache, and the rebuild
//! topic. There is no global state.
//!
//! ```rust,no_run
//! use perfcfg::{Config, Session};
//! use perfcfg::storage::Document;
//! use serde_json::json;
//!
//! # fn main() -> perfcfg::Result<()> {
//! let session = Session::new(Config::builder().cwd("/work/app").build()?)?;
//! session.create_project_storage("/work/app".as_ref())?;
//!
//! let mut project = Document::new();
//! project.insert("name".into(), json!("proj1"));
//! session.controller("project")?.create(project)?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::entities;
use crate::model::{Controller, ModelRegistry, Record, RecordCache};
use crate::notify::{RebuildRequired, Topic, REBUILD_REQUIRED};
use crate::storage::level::{LevelName, StorageLevel};
use crate::storage::registry::StorageRegistry;
use crate::Result;

/// Explicit context threaded through every model operation.
#[derive(Debug)]
pub struct Session {
    config: Config,
    storage: StorageRegistry,
    models: ModelRegistry,
    cache: RecordCache,
    rebuild: Topic<RebuildRequired>,
}

impl Session {
    /// Session with the built-in entity models.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Internal`] if the entity schemas fail validation.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self::with_models(config, entities::registry()?))
    }

    /// Session with a custom model registry.
    #[must_use]
    pub fn with_models(config: Config, models: ModelRegistry) -> Self {
        let storage = StorageRegistry::new(&config);
        info!(
            backend = %config.backend(),
            cwd = %config.cwd().display(),
            models = ?models.names(),
            "session started"
        );
        Self {
            config,
            storage,
            models,
            cache: RecordCache::new(),
            rebuild: Topic::new(REBUILD_REQUIRED),
        }
    }

    /// Session configured from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid backend setting.
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env()?)
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Storage levels
    #[must_use]
    pub const fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    /// Model registry
    #[must_use]
    pub const fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Record cache
    #[must_use]
    pub const fn cache(&self) -> &RecordCache {
        &self.cache
    }

    /// Rebuild-required topic
    #[must_use]
    pub const fn rebuild_topic(&self) -> &Topic<RebuildRequired> {
        &self.rebuild
    }

    /// Controller for `model` on the project level.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProjectStorage`] when no project exists, or
    /// [`crate::Error::Internal`] for an unknown model.
    pub fn controller(&self, model: &str) -> Result<Controller<'_>> {
        self.controller_at(model, LevelName::Project)
    }

    /// Controller for `model` on `level`.
    ///
    /// # Errors
    ///
    /// Same as [`controller`](Self::controller).
    pub fn controller_at(&self, model: &str, level: LevelName) -> Result<Controller<'_>> {
        let def = self.models.get(model)?;
        Ok(Controller::new(self, self.storage.level(level)?, def))
    }

    /// The project level, if discoverable.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProjectStorage`] when no project exists.
    pub fn project_storage(&self) -> Result<Arc<StorageLevel>> {
        self.storage.project()
    }

    /// Create project storage in `dir`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker directory or store cannot be created.
    pub fn create_project_storage(&self, dir: &Path) -> Result<Arc<StorageLevel>> {
        self.storage.create_project(dir)
    }

    /// Recursively delete the project storage.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ProjectStorage`] when no project exists.
    pub fn destroy_project_storage(&self) -> Result<()> {
        self.storage.destroy_project()?;
        self.cache.clear();
        Ok(())
    }

    /// The experiment `project` has selected, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the project level cannot be read.
    pub fn selected_experiment(&self, project: &Record) -> Result<Option<Record>> {
        match project.id("experiment") {
            Some(eid) => self.controller("experiment")?.get(eid),
            None => Ok(None),
        }
    }
}
