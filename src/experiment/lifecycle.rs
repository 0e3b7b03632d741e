//! Trial lifecycle
//!
//! Trials are numbered densely per experiment: a new trial takes the lowest
//! unused non-negative number. A managed run allocates the trial (record and
//! directory) before the program starts, so a crash leaves a recognizable
//! stale trial: begun, never ended, no data. [`TrialManager::reconcile`]
//! removes those.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tracing::{info, warn};

use crate::entities::{self, EXPERIMENT, PROJECT, TRIAL};
use crate::model::{Controller, Lookup, Record};
use crate::session::Session;
use crate::storage::{Document, Eid, Query};
use crate::{Error, Result};

/// Trial state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    /// Record and directory exist; program not started
    Allocated,
    /// Program launched
    Running,
    /// Data captured
    Completed,
    /// Run failed before data capture
    Failed,
}

impl TrialPhase {
    /// Stored spelling
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allocated => "allocated",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialPhase {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "allocated" => Ok(Self::Allocated),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Internal(format!("unknown trial phase '{other}'"))),
        }
    }
}

/// What a launched program left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Process exit code (`-1` when killed by a signal)
    pub return_code: i32,
    /// Data files to move into the trial directory
    pub data_files: Vec<PathBuf>,
}

/// Runs an instrumented program.
pub trait Launcher {
    /// Run `command` in `cwd` and report its outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the program could not be started.
    fn launch(&self, command: &[String], cwd: &Path) -> Result<RunOutcome>;
}

/// [`Launcher`] that spawns a child process and collects the files in `cwd`
/// whose names match one of its glob patterns (`tautrace.*.*.*.trc`,
/// `profile.[0-9]*`).
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    patterns: GlobSet,
}

impl ProcessLauncher {
    /// Launcher collecting files matching `patterns`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a pattern is not a valid glob.
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| {
                Error::configuration(
                    format!("Invalid data file pattern '{pattern}': {e}"),
                    ["Use shell glob syntax, e.g. 'profile.*'"],
                )
            })?;
            builder.add(glob);
        }
        let patterns = builder.build().map_err(|e| {
            Error::configuration(format!("Invalid data file patterns: {e}"), Vec::<String>::new())
        })?;
        Ok(Self { patterns })
    }

    fn matches(&self, name: &str) -> bool {
        self.patterns.is_match(name)
    }

    fn collect(&self, cwd: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(cwd)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && self.matches(&entry.file_name().to_string_lossy()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, command: &[String], cwd: &Path) -> Result<RunOutcome> {
        let (program, args) = command.split_first().ok_or_else(|| {
            Error::configuration("Empty command line", ["Give the program to run"])
        })?;
        let status = Command::new(program).args(args).current_dir(cwd).status()?;
        Ok(RunOutcome {
            return_code: status.code().unwrap_or(-1),
            data_files: self.collect(cwd)?,
        })
    }
}

fn now() -> Value {
    Value::from(Utc::now().to_rfc3339())
}

fn fields<const N: usize>(pairs: [(&str, Value); N]) -> Document {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn number_of(trial: &Record) -> i64 {
    trial.int("number").unwrap_or_default()
}

fn move_file(from: &Path, to: &Path) -> Result<u64> {
    if let Err(e) = fs::rename(from, to) {
        // rename fails across filesystems
        if e.kind() == ErrorKind::NotFound {
            return Err(e.into());
        }
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(fs::metadata(to)?.len())
}

/// Trial operations for one experiment.
#[derive(Debug, Clone)]
pub struct TrialManager<'s> {
    session: &'s Session,
    experiment: Record,
}

impl<'s> TrialManager<'s> {
    /// Manager for `experiment`.
    #[must_use]
    pub const fn new(session: &'s Session, experiment: Record) -> Self {
        Self {
            session,
            experiment,
        }
    }

    /// Manager for the experiment selected in `project`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the project does not exist or has no
    /// selected experiment.
    pub fn for_selected(session: &'s Session, project: &str) -> Result<Self> {
        let Lookup::Found(record) = session.controller(PROJECT)?.by_name(project)? else {
            return Err(Error::configuration(
                format!("There is no project named '{project}'"),
                ["Create the project first"],
            ));
        };
        let experiment = session.selected_experiment(&record)?.ok_or_else(|| {
            Error::configuration(
                format!("Project '{project}' has no selected experiment"),
                ["Select a target, application, and measurement first"],
            )
        })?;
        Ok(Self::new(session, experiment))
    }

    /// The managed experiment
    #[must_use]
    pub const fn experiment(&self) -> &Record {
        &self.experiment
    }

    fn trials_ctl(&self) -> Result<Controller<'s>> {
        self.session.controller(TRIAL)
    }

    fn key(&self, number: i64) -> Query {
        Query::keys(
            fields([
                (EXPERIMENT, Value::from(self.experiment.eid())),
                ("number", Value::from(number)),
            ]),
            false,
        )
    }

    /// All trials, ordered by number.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the project level cannot be read.
    pub fn trials(&self) -> Result<Vec<Record>> {
        let mut trials = self
            .trials_ctl()?
            .search(&Query::key(EXPERIMENT, self.experiment.eid()))?;
        trials.sort_by_key(number_of);
        Ok(trials)
    }

    /// Trial by number.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the project level cannot be read.
    pub fn get(&self, number: i64) -> Result<Option<Record>> {
        self.trials_ctl()?.one(&self.key(number))
    }

    /// Lowest unused non-negative trial number.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the project level cannot be read.
    pub fn next_number(&self) -> Result<i64> {
        let used: BTreeSet<i64> = self
            .trials()?
            .iter()
            .filter_map(|t| t.int("number"))
            .collect();
        Ok((0..).find(|n| !used.contains(n)).unwrap_or_default())
    }

    /// Data directory of trial `number`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the experiment has no name.
    pub fn data_dir(&self, number: i64) -> Result<PathBuf> {
        entities::trial::data_dir(&self.trials_ctl()?, &self.experiment, number)
    }

    fn refresh(&self, trial: &Record) -> Result<Record> {
        self.trials_ctl()?.get(trial.eid())?.ok_or_else(|| {
            Error::Trial(format!("trial {} disappeared", trial.label()))
        })
    }

    /// Reserve the next number: create the record and its directory.
    ///
    /// # Errors
    ///
    /// Returns a storage or IO error if the record or directory cannot be created.
    pub fn allocate(&self, command: &[String], cwd: &Path) -> Result<Record> {
        let number = self.next_number()?;
        let trial = self.trials_ctl()?.create(fields([
            ("number", Value::from(number)),
            (EXPERIMENT, Value::from(self.experiment.eid())),
            ("command", Value::from(command.join(" "))),
            ("cwd", Value::from(cwd.to_string_lossy().into_owned())),
            ("phase", Value::from(TrialPhase::Allocated.as_str())),
        ]))?;
        info!(experiment = %self.experiment.label(), number, "allocated trial");
        Ok(trial)
    }

    /// Record the launch time.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the update fails.
    pub fn begin(&self, trial: &Record) -> Result<Record> {
        self.trials_ctl()?.update(
            fields([
                ("begin_time", now()),
                ("phase", Value::from(TrialPhase::Running.as_str())),
            ]),
            &Query::Eid(trial.eid()),
        )?;
        self.refresh(trial)
    }

    /// Capture data and finish the trial.
    ///
    /// Data files move into the trial directory; end time, return code, and
    /// total data size are recorded; then a snapshot of the project store is
    /// written next to the data. A nonzero return code is only a warning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Trial`] if no data was produced; the trial is deleted
    /// first.
    pub fn complete(&self, trial: &Record, outcome: &RunOutcome) -> Result<Record> {
        let number = number_of(trial);
        let dir = self.data_dir(number)?;
        fs::create_dir_all(&dir)?;

        let mut size: u64 = 0;
        for file in &outcome.data_files {
            let Some(name) = file.file_name() else { continue };
            size += move_file(file, &dir.join(name))?;
        }

        if size == 0 {
            self.delete(number)?;
            let message = if outcome.return_code == 0 {
                format!("Trial {number} completed but produced no data")
            } else {
                format!(
                    "Trial {number} failed with return code {} and produced no data",
                    outcome.return_code
                )
            };
            warn!(experiment = %self.experiment.label(), number, "{message}");
            return Err(Error::Trial(message));
        }
        if outcome.return_code != 0 {
            warn!(
                experiment = %self.experiment.label(),
                number,
                return_code = outcome.return_code,
                "program exited with nonzero status; data may still be usable"
            );
        }

        self.trials_ctl()?.update(
            fields([
                ("end_time", now()),
                ("return_code", Value::from(outcome.return_code)),
                ("data_size", Value::from(i64::try_from(size).unwrap_or(i64::MAX))),
                ("phase", Value::from(TrialPhase::Completed.as_str())),
            ]),
            &Query::Eid(trial.eid()),
        )?;

        let level = self.session.project_storage()?;
        let store = level.store_path()?;
        if let Some(file_name) = store.file_name() {
            level.snapshot(&dir.join(file_name))?;
        }
        info!(experiment = %self.experiment.label(), number, data_size = size, "completed trial");
        self.refresh(trial)
    }

    /// Mark a trial whose run failed before data capture as `failed`, delete
    /// it, and hand back the triggering error. A trial that is already gone
    /// is left alone; one whose deletion fails stays behind as `failed`
    /// for [`reconcile`](Self::reconcile).
    pub fn fail(&self, trial: &Record, error: Error) -> Error {
        let number = number_of(trial);
        warn!(experiment = %self.experiment.label(), number, %error, "trial failed; cleaning up");
        if let Err(cleanup) = self.discard(trial) {
            warn!(number, error = %cleanup, "trial cleanup failed");
        }
        error
    }

    fn discard(&self, trial: &Record) -> Result<()> {
        let ctl = self.trials_ctl()?;
        let query = Query::Eid(trial.eid());
        if !ctl.exists(&query)? {
            return Ok(());
        }
        ctl.update(fields([("phase", Value::from(TrialPhase::Failed.as_str()))]), &query)?;
        ctl.delete(&query)?;
        Ok(())
    }

    /// Allocate, launch, and complete a trial.
    ///
    /// # Errors
    ///
    /// Returns the launch or capture error after deleting the trial.
    pub fn managed_run(
        &self,
        launcher: &dyn Launcher,
        command: &[String],
        cwd: &Path,
    ) -> Result<Record> {
        let trial = self.allocate(command, cwd)?;
        let trial = match self.begin(&trial) {
            Ok(trial) => trial,
            Err(e) => return Err(self.fail(&trial, e)),
        };
        let outcome = match launcher.launch(command, cwd) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(&trial, e)),
        };
        self.complete(&trial, &outcome)
            .map_err(|e| self.fail(&trial, e))
    }

    /// Delete trial `number` and its data.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if there is no such trial.
    pub fn delete(&self, number: i64) -> Result<()> {
        if self.trials_ctl()?.delete(&self.key(number))? == 0 {
            return Err(Error::configuration(
                format!(
                    "Experiment '{}' has no trial {number}",
                    self.experiment.label()
                ),
                ["List the experiment's trials to see valid numbers"],
            ));
        }
        Ok(())
    }

    /// Reassign trial numbers. `moves` maps old numbers to new ones and may
    /// be a permutation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a source trial is missing, a number
    /// appears twice, or a target number is held by a trial outside `moves`.
    pub fn renumber(&self, moves: &[(i64, i64)]) -> Result<()> {
        let moves: Vec<(i64, i64)> = moves.iter().copied().filter(|(a, b)| a != b).collect();
        if moves.is_empty() {
            return Ok(());
        }
        let sources: BTreeSet<i64> = moves.iter().map(|(from, _)| *from).collect();
        let targets: BTreeSet<i64> = moves.iter().map(|(_, to)| *to).collect();
        if sources.len() != moves.len() || targets.len() != moves.len() {
            return Err(Error::configuration(
                "A trial number appears more than once in the renumbering",
                ["Give each trial exactly one new number"],
            ));
        }
        if let Some(negative) = targets.iter().find(|n| **n < 0) {
            return Err(Error::configuration(
                format!("Invalid trial number {negative}"),
                ["Trial numbers are non-negative"],
            ));
        }

        let trials = self.trials()?;
        let mut plan: Vec<(Eid, i64, i64)> = Vec::with_capacity(moves.len());
        for (from, to) in &moves {
            let trial = trials.iter().find(|t| number_of(t) == *from).ok_or_else(|| {
                Error::configuration(
                    format!("Experiment '{}' has no trial {from}", self.experiment.label()),
                    ["List the experiment's trials to see valid numbers"],
                )
            })?;
            plan.push((trial.eid(), *from, *to));
        }
        for to in &targets {
            if trials.iter().any(|t| number_of(t) == *to) && !sources.contains(to) {
                return Err(Error::configuration(
                    format!("Trial {to} already exists"),
                    [format!("Include trial {to} in the renumbering or delete it first")],
                ));
            }
        }

        // Directories: old -> staging -> new, so permutations never collide.
        let mut staged = Vec::with_capacity(plan.len());
        for (_, from, to) in &plan {
            let old = self.data_dir(*from)?;
            if old.exists() {
                let staging = old.with_file_name(format!(".renumber-{from}"));
                fs::rename(&old, &staging)?;
                staged.push((staging, self.data_dir(*to)?));
            }
        }
        for (staging, new) in &staged {
            fs::rename(staging, new)?;
        }

        let ctl = self.trials_ctl()?;
        let level = ctl.level();
        let result = level.transaction(|| {
            for (eid, _, to) in &plan {
                level.update("trial", &fields([("number", Value::from(*to))]), &Query::Eid(*eid))?;
            }
            Ok(())
        });
        ctl.invalidate();
        if let Err(e) = result {
            for (_, from, to) in &plan {
                let (new, old) = (self.data_dir(*to)?, self.data_dir(*from)?);
                if new.exists() && !old.exists() {
                    if let Err(revert) = fs::rename(&new, &old) {
                        warn!(
                            from = %new.display(),
                            to = %old.display(),
                            error = %revert,
                            "could not restore trial directory"
                        );
                    }
                }
            }
            return Err(e);
        }
        info!(experiment = %self.experiment.label(), moves = ?moves, "renumbered trials");
        Ok(())
    }

    /// Renumber trials to `0..n`, keeping their order.
    ///
    /// # Errors
    ///
    /// Same as [`renumber`](Self::renumber).
    pub fn compact(&self) -> Result<()> {
        let moves: Vec<(i64, i64)> = self
            .trials()?
            .iter()
            .zip(0_i64..)
            .filter_map(|(t, n)| t.int("number").map(|number| (number, n)))
            .collect();
        self.renumber(&moves)
    }

    /// Trials left behind by a killed run (begun, never ended, no data) or
    /// by a failed run whose cleanup did not finish.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the project level cannot be read.
    pub fn stale_trials(&self) -> Result<Vec<Record>> {
        Ok(self
            .trials()?
            .into_iter()
            .filter(|t| {
                t.str("phase") == Some(TrialPhase::Failed.as_str())
                    || (t.get("begin_time").is_some()
                        && t.get("end_time").is_none()
                        && t.int("data_size").unwrap_or(0) == 0)
            })
            .collect())
    }

    /// Delete stale trials, returning their numbers.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a deletion fails.
    pub fn reconcile(&self) -> Result<Vec<i64>> {
        let mut removed = Vec::new();
        for trial in self.stale_trials()? {
            let number = number_of(&trial);
            self.delete(number)?;
            removed.push(number);
        }
        if !removed.is_empty() {
            info!(experiment = %self.experiment.label(), trials = ?removed, "removed stale trials");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        let launcher =
            ProcessLauncher::new(["profile.*", "tautrace.*.*.*.trc", "events.edf"]).unwrap();
        assert!(launcher.matches("profile.0.0.0"));
        assert!(launcher.matches("tautrace.0.0.0.trc"));
        assert!(launcher.matches("events.edf"));
        assert!(!launcher.matches("profile"));
        assert!(!launcher.matches("tautrace.0.trc"));
        assert!(!launcher.matches("notes.txt"));
    }

    #[test]
    fn test_invalid_pattern_is_configuration_error() {
        let err = ProcessLauncher::new(["profile.[0-9"]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in [
            TrialPhase::Allocated,
            TrialPhase::Running,
            TrialPhase::Completed,
            TrialPhase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<TrialPhase>().unwrap(), phase);
        }
        assert_eq!(entities::trial::PHASES.len(), 4);
    }

    #[test]
    fn test_collect_only_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("profile.0.0.0"), b"data").unwrap();
        fs::write(dir.path().join("readme"), b"x").unwrap();
        fs::create_dir(dir.path().join("profile.dir")).unwrap();
        let files = ProcessLauncher::new(["profile.*"]).unwrap().collect(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("profile.0.0.0")]);
    }
}
