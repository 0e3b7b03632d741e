//! # perfcfg: Performance Experiment Configuration Engine
//!
//! perfcfg keeps the configuration state of a performance-analysis workflow:
//! *targets* (toolchain environments), *applications* (build features),
//! *measurements* (instrumentation settings), the *projects* that group them,
//! the *experiments* composed from one of each, and the numbered *trials*
//! recorded under an experiment.
//!
//! ## Architecture
//!
//! ```text
//! Session ──> Controller<model> ──> StorageLevel (system | user | project)
//!    │             │                      └─> Storage: DocumentStore | SqliteStore
//!    │             └─> Schema + ModelHooks (entities)
//!    ├─> RecordCache (per-level invalidation)
//!    └─> Topic<RebuildRequired>
//! ```
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Poka-Yoke**: schema coercion and pairwise compatibility rules reject
//!   bad combinations before they are stored
//! - **Jidoka**: every multi-record change runs in one backend transaction
//! - **Respect for People**: configuration errors carry remedial hints
//!
//! ## Example
//!
//! ```rust,no_run
//! use perfcfg::experiment::select;
//! use perfcfg::{Config, Session};
//!
//! # fn main() -> perfcfg::Result<()> {
//! let session = Session::new(Config::builder().cwd("/work/app").build()?)?;
//! session.create_project_storage("/work/app".as_ref())?;
//! // ... create a project, a target, an application, a measurement ...
//! let selection = select(&session, "proj1", "targ1", "app1", "meas1")?;
//! println!("selected {}", selection.experiment.label());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod entities;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod model;
pub mod notify;
pub mod schema;
pub mod session;
pub mod storage;

pub use backend::BackendKind;
pub use config::Config;
pub use error::{Error, Result};
pub use model::{Controller, Lookup, Record};
pub use session::Session;
pub use storage::level::LevelName;
pub use storage::{Document, Eid, Query};
