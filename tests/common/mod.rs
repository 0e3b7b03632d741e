//! Shared fixtures: a session rooted in a temporary directory.

#![allow(dead_code)]

use std::path::PathBuf;

use perfcfg::storage::Document;
use perfcfg::{BackendKind, Config, Eid, Record, Session};
use serde_json::{json, Value};
use tempfile::TempDir;

/// A session whose system, user, and project levels live under one tempdir.
pub struct Fixture {
    pub dir: TempDir,
    pub session: Session,
}

impl Fixture {
    pub fn new(backend: BackendKind) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let config = Config::builder()
            .backend(backend)
            .system_prefix(dir.path().join("system"))
            .user_prefix(dir.path().join("user"))
            .cwd(&work)
            .build()
            .unwrap();
        let session = Session::new(config).unwrap();
        session.create_project_storage(&work).unwrap();
        Self { dir, session }
    }

    pub fn work(&self) -> PathBuf {
        self.dir.path().join("work")
    }

    pub fn create(&self, model: &str, data: Value) -> Record {
        self.session
            .controller(model)
            .unwrap()
            .create(doc(data))
            .unwrap()
    }

    /// Project `name` holding the given components.
    pub fn project(&self, name: &str, targets: &[Eid], applications: &[Eid], measurements: &[Eid]) -> Record {
        self.create(
            "project",
            json!({
                "name": name,
                "targets": targets,
                "applications": applications,
                "measurements": measurements,
            }),
        )
    }

    /// proj1 with targ1, app1, meas1 (all defaults).
    pub fn scenario(&self) -> [Record; 4] {
        let target = self.create("target", json!({"name": "targ1", "host_os": "Linux"}));
        let application = self.create("application", json!({"name": "app1", "mpi": false}));
        let measurement = self.create("measurement", json!({"name": "meas1", "mpi": false}));
        let project = self.project(
            "proj1",
            &[target.eid()],
            &[application.eid()],
            &[measurement.eid()],
        );
        [project, target, application, measurement]
    }
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
