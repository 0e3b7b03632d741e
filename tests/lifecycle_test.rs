//! Trial lifecycle: numbering, managed runs, renumbering, reconciliation

mod common;

use std::fs;
use std::path::Path;

use common::Fixture;
use perfcfg::experiment::{select, Launcher, ProcessLauncher, RunOutcome, TrialManager};
use perfcfg::{BackendKind, Error, Query, Record};
use serde_json::json;

fn manager(fx: &Fixture) -> TrialManager<'_> {
    fx.scenario();
    let selection = select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
    TrialManager::new(&fx.session, selection.experiment)
}

fn numbers(trials: &TrialManager<'_>) -> Vec<i64> {
    trials
        .trials()
        .unwrap()
        .iter()
        .map(|t| t.int("number").unwrap())
        .collect()
}

fn allocate(trials: &TrialManager<'_>, fx: &Fixture) -> Record {
    trials.allocate(&["./app".to_string()], &fx.work()).unwrap()
}

struct NoData {
    return_code: i32,
}

impl Launcher for NoData {
    fn launch(&self, _command: &[String], _cwd: &Path) -> perfcfg::Result<RunOutcome> {
        Ok(RunOutcome {
            return_code: self.return_code,
            data_files: Vec::new(),
        })
    }
}

/// Reports a data file that is gone by the time it is captured.
struct Vanished;

impl Launcher for Vanished {
    fn launch(&self, _command: &[String], cwd: &Path) -> perfcfg::Result<RunOutcome> {
        Ok(RunOutcome {
            return_code: 0,
            data_files: vec![cwd.join("profile.vanished")],
        })
    }
}

struct CannotStart;

impl Launcher for CannotStart {
    fn launch(&self, _command: &[String], _cwd: &Path) -> perfcfg::Result<RunOutcome> {
        Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such program",
        )))
    }
}

#[test]
fn test_lowest_unused_number_is_reused() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        let trials = manager(&fx);
        for _ in 0..3 {
            allocate(&trials, &fx);
        }
        assert_eq!(numbers(&trials), vec![0, 1, 2]);

        trials.delete(1).unwrap();
        assert!(!trials.data_dir(1).unwrap().exists());
        let trial = allocate(&trials, &fx);
        assert_eq!(trial.int("number"), Some(1), "{backend}");
        assert!(trials.data_dir(1).unwrap().is_dir());
    }
}

#[test]
fn test_duplicate_number_is_rejected() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    allocate(&trials, &fx);
    let err = fx
        .session
        .controller("trial")
        .unwrap()
        .create(common::doc(json!({"number": 0, "experiment": trials.experiment().eid()})))
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_run_without_data_is_trial_error() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    let command = vec!["./app".to_string()];

    let err = trials
        .managed_run(&NoData { return_code: 0 }, &command, &fx.work())
        .unwrap_err();
    assert!(matches!(&err, Error::Trial(msg) if msg.contains("no data")), "{err}");

    let err = trials
        .managed_run(&NoData { return_code: 3 }, &command, &fx.work())
        .unwrap_err();
    assert!(matches!(&err, Error::Trial(msg) if msg.contains("return code 3")), "{err}");

    assert!(trials.trials().unwrap().is_empty());
    assert!(!trials.data_dir(0).unwrap().exists());
}

#[test]
fn test_launch_failure_cleans_up() {
    let fx = Fixture::new(BackendKind::Sqlite);
    let trials = manager(&fx);
    let err = trials
        .managed_run(&CannotStart, &["./missing".to_string()], &fx.work())
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(trials.trials().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn test_process_launcher_collects_profiles() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    let command: Vec<String> = ["sh", "-c", "printf 0123456789 > profile.0.0.0; exit 2"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let launcher = ProcessLauncher::new(["profile.*"]).unwrap();

    let trial = trials.managed_run(&launcher, &command, &fx.work()).unwrap();
    assert_eq!(trial.int("return_code"), Some(2));
    assert_eq!(trial.int("data_size"), Some(10));
    assert!(trial.get("begin_time").is_some());
    assert!(trial.get("end_time").is_some());
}

#[test]
fn test_capture_failure_cleans_up() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        let trials = manager(&fx);
        let err = trials
            .managed_run(&Vanished, &["./app".to_string()], &fx.work())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{err}");
        assert!(trials.trials().unwrap().is_empty(), "{backend}");
        assert!(!trials.data_dir(0).unwrap().exists());
        assert_eq!(allocate(&trials, &fx).int("number"), Some(0));
    }
}

#[cfg(unix)]
#[test]
fn test_process_launcher_matches_multi_wildcard_pattern() {
    let fx = Fixture::new(BackendKind::Sqlite);
    let trials = manager(&fx);
    let command: Vec<String> = ["sh", "-c", "printf trace > tautrace.0.0.0.trc"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let launcher = ProcessLauncher::new(["tautrace.*.*.*.trc"]).unwrap();

    let trial = trials.managed_run(&launcher, &command, &fx.work()).unwrap();
    assert_eq!(trial.int("data_size"), Some(5));
    assert!(trials.data_dir(0).unwrap().join("tautrace.0.0.0.trc").is_file());
    assert!(!fx.work().join("tautrace.0.0.0.trc").exists());
}

#[test]
fn test_failed_trial_is_stale() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    let failed = allocate(&trials, &fx);
    allocate(&trials, &fx);
    fx.session
        .controller("trial")
        .unwrap()
        .update(
            common::doc(json!({"phase": "failed"})),
            &Query::Eid(failed.eid()),
        )
        .unwrap();

    let found = trials.stale_trials().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].eid(), failed.eid());
    assert_eq!(trials.reconcile().unwrap(), vec![0]);
    assert_eq!(numbers(&trials), vec![1]);
}

#[test]
fn test_trial_number_update_moves_directory() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        let trials = manager(&fx);
        let trial = allocate(&trials, &fx);
        fs::write(trials.data_dir(0).unwrap().join("marker"), b"0").unwrap();

        fx.session
            .controller("trial")
            .unwrap()
            .update(common::doc(json!({"number": 4})), &Query::Eid(trial.eid()))
            .unwrap();
        assert!(trials.data_dir(4).unwrap().join("marker").is_file(), "{backend}");
        assert!(!trials.data_dir(0).unwrap().exists());
    }
}

#[test]
fn test_experiment_directory_follows_committed_rename() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    allocate(&trials, &fx);
    let old = trials.data_dir(0).unwrap().parent().unwrap().to_path_buf();
    let new = old.with_file_name("renamed");
    let app = fx.create("application", json!({"name": "astatic", "linkage": "static"}));
    let meas = fx.create("measurement", json!({"name": "msample", "sample": true}));
    let experiments = fx.session.controller("experiment").unwrap();
    let query = Query::Eid(trials.experiment().eid());

    // sampling excludes static linkage, so the whole update is rejected
    let err = experiments.update(
        common::doc(json!({
            "name": "renamed",
            "application": app.eid(),
            "measurement": meas.eid(),
        })),
        &query,
    );
    assert!(err.is_err());
    assert!(old.join("0").is_dir());
    assert!(!new.exists());

    experiments
        .update(common::doc(json!({"name": "renamed"})), &query)
        .unwrap();
    assert!(new.join("0").is_dir());
    assert!(!old.exists());
}

#[test]
fn test_stale_trials_are_reconciled() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    let stale = allocate(&trials, &fx);
    trials.begin(&stale).unwrap();
    let pending = allocate(&trials, &fx);

    let found = trials.stale_trials().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].eid(), stale.eid());

    assert_eq!(trials.reconcile().unwrap(), vec![0]);
    assert_eq!(numbers(&trials), vec![pending.int("number").unwrap()]);
    assert!(trials.reconcile().unwrap().is_empty());
}

#[test]
fn test_renumber_permutation_moves_directories() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        let trials = manager(&fx);
        let first = allocate(&trials, &fx);
        let second = allocate(&trials, &fx);
        fs::write(trials.data_dir(0).unwrap().join("marker"), b"0").unwrap();

        trials.renumber(&[(0, 1), (1, 0)]).unwrap();

        let ctl = fx.session.controller("trial").unwrap();
        assert_eq!(ctl.get(first.eid()).unwrap().unwrap().int("number"), Some(1));
        assert_eq!(ctl.get(second.eid()).unwrap().unwrap().int("number"), Some(0));
        assert!(trials.data_dir(1).unwrap().join("marker").is_file(), "{backend}");
        assert!(!trials.data_dir(0).unwrap().join("marker").exists());
    }
}

#[test]
fn test_renumber_rejects_collision_outside_moves() {
    let fx = Fixture::new(BackendKind::Document);
    let trials = manager(&fx);
    allocate(&trials, &fx);
    allocate(&trials, &fx);

    let err = trials.renumber(&[(0, 1)]).unwrap_err();
    assert!(err.is_configuration());
    let err = trials.renumber(&[(5, 6)]).unwrap_err();
    assert!(err.is_configuration());
    let err = trials.renumber(&[(0, 3), (1, 3)]).unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(numbers(&trials), vec![0, 1]);
}

#[test]
fn test_compact_closes_gaps() {
    let fx = Fixture::new(BackendKind::Sqlite);
    let trials = manager(&fx);
    for _ in 0..4 {
        allocate(&trials, &fx);
    }
    trials.delete(0).unwrap();
    trials.delete(2).unwrap();

    trials.compact().unwrap();
    assert_eq!(numbers(&trials), vec![0, 1]);
    assert!(trials.data_dir(0).unwrap().is_dir());
    assert!(trials.data_dir(1).unwrap().is_dir());
    assert!(!trials.data_dir(3).unwrap().exists());
}

#[test]
fn test_for_selected_requires_selection() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    let err = TrialManager::for_selected(&fx.session, "proj1").unwrap_err();
    assert!(err.is_configuration());
}
