//! Experiment composition and trial lifecycle
//!
//! ## Flow
//!
//! ```text
//! select(project, target, application, measurement)
//!   └─ compose: resolve names → membership → pairwise compatibility
//!        └─ reuse experiment with same identity, or create it
//!
//! TrialManager::managed_run(launcher, command)
//!   allocated ──begin──> running ──complete──> completed
//!                           └────── fail ──────> (record and directory removed)
//! ```

pub mod lifecycle;
pub mod selection;

pub use lifecycle::{Launcher, ProcessLauncher, RunOutcome, TrialManager, TrialPhase};
pub use selection::{check_combination, compose, select, Selection};
