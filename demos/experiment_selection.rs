//! Experiment Selection: end-to-end walk through one project
//!
//! 1. Create project storage in a scratch directory
//! 2. Create a target, an application, a measurement, and a project
//! 3. Select the combination (compatibility rules are checked pairwise)
//! 4. Run one trial that leaves a profile file behind
//! 5. Show that the application is now frozen
//!
//! Run with: `PERFCFG_LOG=info cargo run --example experiment_selection`

use std::fs;
use std::path::Path;

use anyhow::Context;
use perfcfg::experiment::{select, Launcher, RunOutcome, TrialManager};
use perfcfg::storage::Document;
use perfcfg::{Config, Query, Session};
use serde_json::{json, Value};

/// Pretends to run the instrumented program by writing a profile.
struct FakeRun;

impl Launcher for FakeRun {
    fn launch(&self, command: &[String], cwd: &Path) -> perfcfg::Result<RunOutcome> {
        println!("  launching {:?} in {}", command, cwd.display());
        let profile = cwd.join("profile.0.0.0");
        fs::write(&profile, b"0123456789")?;
        Ok(RunOutcome {
            return_code: 0,
            data_files: vec![profile],
        })
    }
}

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn main() -> anyhow::Result<()> {
    perfcfg::logging::init();
    let scratch = tempfile::tempdir().context("creating scratch directory")?;
    let work = scratch.path().join("app");
    fs::create_dir_all(&work)?;

    let config = Config::builder()
        .system_prefix(scratch.path().join("system"))
        .user_prefix(scratch.path().join("user"))
        .cwd(&work)
        .build()?;
    let session = Session::new(config)?;
    session.create_project_storage(&work)?;

    println!("=== Step 1: Components ===");
    let target = session.controller("target")?.create(doc(json!({"name": "targ1"})))?;
    let application = session
        .controller("application")?
        .create(doc(json!({"name": "app1", "openmp": true})))?;
    let measurement = session
        .controller("measurement")?
        .create(doc(json!({"name": "meas1", "openmp": "ompt"})))?;
    session.controller("project")?.create(doc(json!({
        "name": "proj1",
        "targets": [target.eid()],
        "applications": [application.eid()],
        "measurements": [measurement.eid()],
    })))?;
    println!("  target cc = {:?}", target.str("cc"));
    println!("  measurement profile = {:?}\n", measurement.str("profile"));

    println!("=== Step 2: Select ===");
    let selection = select(&session, "proj1", "targ1", "app1", "meas1")
        .context("selecting targ1/app1/meas1")?;
    println!("  experiment: {}", selection.experiment.label());
    for warning in &selection.warnings {
        println!("  warning: {} ({})", warning.message, warning.hint);
    }

    println!("\n=== Step 3: Managed run ===");
    let trials = TrialManager::for_selected(&session, "proj1")?;
    let trial = trials.managed_run(&FakeRun, &["./app1".to_string()], &work)?;
    println!(
        "  trial {} data_size={:?} return_code={:?}",
        trial.int("number").unwrap_or_default(),
        trial.int("data_size"),
        trial.int("return_code")
    );

    println!("\n=== Step 4: Immutability ===");
    let err = session
        .controller("application")?
        .update(doc(json!({"openmp": false})), &Query::key("name", "app1"))
        .expect_err("application has trial data");
    println!("  {err}");
    for hint in err.hints() {
        println!("  hint: {hint}");
    }

    Ok(())
}
