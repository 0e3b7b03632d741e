//! Experiment composition, compatibility, and immutability
//!
//! Toyota Way: Poka-Yoke (bad combinations never reach storage)

mod common;

use std::fs;
use std::path::Path;

use common::{doc, Fixture};
use perfcfg::experiment::{compose, select, Launcher, RunOutcome, TrialManager};
use perfcfg::{BackendKind, Error, Query};
use serde_json::json;

/// Writes `size` bytes to `profile.0.0.0` and exits with `return_code`.
struct WriteProfile {
    size: usize,
    return_code: i32,
}

impl Launcher for WriteProfile {
    fn launch(&self, _command: &[String], cwd: &Path) -> perfcfg::Result<RunOutcome> {
        let file = cwd.join("profile.0.0.0");
        fs::write(&file, vec![b'x'; self.size])?;
        Ok(RunOutcome {
            return_code: self.return_code,
            data_files: vec![file],
        })
    }
}

#[test]
fn test_scenario_select_and_run() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        fx.scenario();

        let selection = select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
        assert!(selection.created);
        assert_eq!(selection.experiment.name(), Some("targ1-app1-meas1"));

        let trials = TrialManager::for_selected(&fx.session, "proj1").unwrap();
        assert!(trials.trials().unwrap().is_empty());

        let launcher = WriteProfile {
            size: 10,
            return_code: 0,
        };
        let command = vec!["./app".to_string()];
        let trial = trials.managed_run(&launcher, &command, &fx.work()).unwrap();
        assert_eq!(trial.int("number"), Some(0));
        assert_eq!(trial.int("data_size"), Some(10));
        assert_eq!(trial.int("return_code"), Some(0));
        assert_eq!(trial.str("phase"), Some("completed"));

        let dir = trials.data_dir(0).unwrap();
        assert!(dir.join("profile.0.0.0").is_file(), "{backend}");
        assert!(!fx.work().join("profile.0.0.0").exists());
        let snapshot = fx.session.project_storage().unwrap().store_path().unwrap();
        assert!(dir.join(snapshot.file_name().unwrap()).is_file(), "{backend}");
    }
}

#[test]
fn test_composition_is_idempotent() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    let experiments = fx.session.controller("experiment").unwrap();

    let first = compose(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
    let count = experiments.count().unwrap();
    let second = compose(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.experiment.eid(), second.experiment.eid());
    assert_eq!(experiments.count().unwrap(), count);
}

#[test]
fn test_require_rule_blocks_composition() {
    let fx = Fixture::new(BackendKind::Sqlite);
    let t = fx.create("target", json!({"name": "t"}));
    let a = fx.create("application", json!({"name": "a", "mpi": true}));
    let m = fx.create("measurement", json!({"name": "m", "mpi": false}));
    let m2 = fx.create("measurement", json!({"name": "m2", "mpi": true}));
    fx.project("p", &[t.eid()], &[a.eid()], &[m.eid(), m2.eid()]);

    let err = compose(&fx.session, "p", "t", "a", "m").unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }), "{err}");
    assert_eq!(err.hints().len(), 2);

    let selection = compose(&fx.session, "p", "t", "a", "m2").unwrap();
    assert!(selection.created);
    // application.mpi encourages target.mpi_cc, which is unset
    assert_eq!(selection.warnings.len(), 1);
}

#[test]
fn test_exclude_rule_blocks_composition() {
    let fx = Fixture::new(BackendKind::Document);
    let t = fx.create("target", json!({"name": "t"}));
    let a = fx.create("application", json!({"name": "a", "linkage": "static"}));
    let m = fx.create("measurement", json!({"name": "m", "sample": true}));
    fx.project("p", &[t.eid()], &[a.eid()], &[m.eid()]);

    let err = compose(&fx.session, "p", "t", "a", "m").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_component_outside_project_is_rejected() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    fx.create("target", json!({"name": "other"}));
    let err = compose(&fx.session, "proj1", "other", "app1", "meas1").unwrap_err();
    assert!(err.is_configuration());
    assert!(err.hints()[0].contains("Add target 'other'"));
}

#[test]
fn test_unknown_name_is_configuration_error() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    let err = compose(&fx.session, "proj1", "targ1", "nope", "meas1").unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_component_frozen_once_trial_has_data() {
    for backend in [BackendKind::Document, BackendKind::Sqlite] {
        let fx = Fixture::new(backend);
        fx.scenario();
        let selection = select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
        fx.create(
            "trial",
            json!({"number": 0, "experiment": selection.experiment.eid(), "data_size": 42}),
        );

        let applications = fx.session.controller("application").unwrap();
        let change = || doc(json!({"select_file": "select.tau"}));
        let err = applications
            .update(change(), &Query::key("name", "app1"))
            .unwrap_err();
        assert!(matches!(err, Error::ImmutableRecord { .. }), "{backend}: {err}");
        assert_eq!(err.hints().len(), 2);

        let trials = TrialManager::new(&fx.session, selection.experiment.clone());
        trials.delete(0).unwrap();
        applications
            .update(change(), &Query::key("name", "app1"))
            .unwrap();
    }
}

#[test]
fn test_frozen_component_cannot_be_deleted() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    let selection = select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
    fx.create(
        "trial",
        json!({"number": 0, "experiment": selection.experiment.eid(), "data_size": 1}),
    );
    let err = fx
        .session
        .controller("target")
        .unwrap()
        .delete(&Query::key("name", "targ1"))
        .unwrap_err();
    assert!(matches!(err, Error::ImmutableRecord { .. }));
    assert_eq!(fx.session.controller("experiment").unwrap().count().unwrap(), 1);
}

#[test]
fn test_incompatible_update_is_rejected() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();

    let err = fx
        .session
        .controller("application")
        .unwrap()
        .update(doc(json!({"mpi": true})), &Query::key("name", "app1"))
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleRecord { .. }), "{err}");
    assert!(err
        .hints()
        .iter()
        .any(|hint| hint.contains("targ1-app1-meas1")));

    let app = fx
        .session
        .controller("application")
        .unwrap()
        .by_name("app1")
        .unwrap()
        .found()
        .unwrap();
    assert!(!app.flag("mpi"));
}

#[test]
fn test_rebuild_notification_for_selected_target() {
    let fx = Fixture::new(BackendKind::Document);
    fx.scenario();
    let rx = fx.session.rebuild_topic().subscribe();

    let targets = fx.session.controller("target").unwrap();
    targets
        .update(doc(json!({"cc": "clang"})), &Query::key("name", "targ1"))
        .unwrap();
    assert_eq!(fx.session.rebuild_topic().pending(), 0);

    select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
    targets
        .update(doc(json!({"cc": "icc"})), &Query::key("name", "targ1"))
        .unwrap();

    let message = rx.try_recv().unwrap();
    assert_eq!(message.model, "target");
    assert_eq!(message.record, "targ1");
    assert_eq!(message.attribute, "cc");
    assert_eq!(message.value, json!("icc"));
    assert_eq!(fx.session.rebuild_topic().drain().len(), 1);
}

#[test]
fn test_select_updates_project_selection() {
    let fx = Fixture::new(BackendKind::Sqlite);
    fx.scenario();
    let selection = select(&fx.session, "proj1", "targ1", "app1", "meas1").unwrap();
    let project = fx
        .session
        .controller("project")
        .unwrap()
        .by_name("proj1")
        .unwrap()
        .found()
        .unwrap();
    let selected = fx.session.selected_experiment(&project).unwrap().unwrap();
    assert_eq!(selected.eid(), selection.experiment.eid());
    assert_eq!(project.ids("experiments"), vec![selection.experiment.eid()]);
}
