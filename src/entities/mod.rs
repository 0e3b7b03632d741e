//! Entity models
//!
//! | Model | Identity | Associations |
//! |---|---|---|
//! | `project` | unique `name` | targets, applications, measurements (many-to-many), experiments, selected experiment |
//! | `target` | unique `name` | projects |
//! | `application` | unique `name` | projects |
//! | `measurement` | unique `name` | projects |
//! | `experiment` | (project, target, application, measurement) | project, trials |
//! | `trial` | `number` within its experiment | experiment |
//!
//! Targets, applications, and measurements share one set of hooks
//! ([`ComponentHooks`]): once an experiment built from a component has trial
//! data, the component is frozen.

pub mod application;
pub mod experiment;
pub mod measurement;
pub mod project;
pub mod target;
pub mod trial;

use serde_json::Value;
use tracing::info;

use crate::experiment::selection::check_combination;
use crate::model::{Changes, Controller, ModelHooks, ModelRegistry, Record};
use crate::notify::RebuildRequired;
use crate::storage::{Document, Query};
use crate::{Error, Result};

/// Project model name
pub const PROJECT: &str = "project";
/// Target model name
pub const TARGET: &str = "target";
/// Application model name
pub const APPLICATION: &str = "application";
/// Measurement model name
pub const MEASUREMENT: &str = "measurement";
/// Experiment model name
pub const EXPERIMENT: &str = "experiment";
/// Trial model name
pub const TRIAL: &str = "trial";

/// Experiment attributes naming its components, in composition order.
pub const COMPONENTS: [&str; 3] = [TARGET, APPLICATION, MEASUREMENT];

/// Validated registry of the built-in models.
///
/// # Errors
///
/// Returns [`Error::Internal`] if the built-in schemas are inconsistent.
pub fn registry() -> Result<ModelRegistry> {
    ModelRegistry::new([
        project::definition(),
        target::definition(),
        application::definition(),
        measurement::definition(),
        experiment::definition(),
        trial::definition(),
    ])
}

/// Names become directory names: non-empty ASCII alphanumerics plus `-`, `_`, `.`
/// and not starting with `.`.
///
/// # Errors
///
/// Returns a configuration error describing the allowed characters.
pub fn validate_name(model: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::configuration(
            format!("Invalid {model} name '{name}'"),
            ["Names may contain only letters, digits, '-', '_' and '.', and may not start with '.'"],
        ))
    }
}

fn validate_name_field(model: &str, data: &Document) -> Result<()> {
    match data.get("name").and_then(Value::as_str) {
        Some(name) => validate_name(model, name),
        None => Ok(()),
    }
}

fn validate_name_change(model: &str, changes: &Changes) -> Result<()> {
    match changes.get("name").and_then(|c| c.new.as_ref()).and_then(Value::as_str) {
        Some(name) => validate_name(model, name),
        None => Ok(()),
    }
}

/// Apply `changes` to a copy of `record`.
pub(crate) fn with_changes(record: &Record, changes: &Changes) -> Record {
    let mut data = record.data().clone();
    for (key, change) in changes {
        match &change.new {
            Some(value) => {
                data.insert(key.clone(), value.clone());
            }
            None => {
                data.remove(key);
            }
        }
    }
    Record::new(record.model(), record.eid(), data)
}

/// True if any trial of `experiment` recorded data.
pub(crate) fn has_trial_data(ctl: &Controller<'_>, experiment: &Record) -> Result<bool> {
    Ok(ctl
        .for_model(TRIAL)?
        .search(&Query::key(EXPERIMENT, experiment.eid()))?
        .iter()
        .any(|trial| trial.int("data_size").unwrap_or(0) > 0))
}

/// Shared hooks of targets, applications, and measurements.
///
/// `role` is the model name, which is also the experiment attribute that
/// references it.
#[derive(Debug, Clone, Copy)]
pub struct ComponentHooks {
    role: &'static str,
}

impl ComponentHooks {
    /// Hooks for the component model `role`
    #[must_use]
    pub const fn new(role: &'static str) -> Self {
        Self { role }
    }

    fn dependents(&self, ctl: &Controller<'_>, record: &Record) -> Result<Vec<Record>> {
        ctl.for_model(EXPERIMENT)?
            .search(&Query::key(self.role, record.eid()))
    }

    fn freeze_check(&self, ctl: &Controller<'_>, record: &Record, dependents: &[Record]) -> Result<()> {
        for experiment in dependents {
            if has_trial_data(ctl, experiment)? {
                return Err(Error::immutable(format!(
                    "{} '{}' is used by experiment '{}', which has trial data",
                    self.role,
                    record.label(),
                    experiment.label()
                )));
            }
        }
        Ok(())
    }
}

impl ModelHooks for ComponentHooks {
    fn on_create(&self, _ctl: &Controller<'_>, data: &mut Document) -> Result<()> {
        validate_name_field(self.role, data)
    }

    fn on_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        validate_name_change(self.role, changes)?;
        let dependents = self.dependents(ctl, record)?;
        if dependents.is_empty() {
            return Ok(());
        }
        self.freeze_check(ctl, record, &dependents)?;

        let updated = with_changes(record, changes);
        for experiment in &dependents {
            let mut components = experiment::components(ctl, experiment)?;
            for component in &mut components {
                if component.model() == self.role {
                    *component = updated.clone();
                }
            }
            if let Err(e) = check_combination(ctl.session(), &components) {
                let mut hints = e.hints().to_vec();
                hints.push(format!(
                    "Delete experiment '{}' before making this change",
                    experiment.label()
                ));
                return Err(Error::IncompatibleRecord {
                    message: format!(
                        "Changing {} '{}' would make experiment '{}' incompatible: {e}",
                        self.role,
                        record.label(),
                        experiment.label()
                    ),
                    hints,
                });
            }
        }
        Ok(())
    }

    fn after_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        let schema = ctl.schema();
        let rebuild: Vec<(&String, Value)> = changes
            .iter()
            .filter(|(key, _)| schema.get(key).is_some_and(|a| a.is_rebuild_required()))
            .map(|(key, change)| (key, change.new.clone().unwrap_or(Value::Null)))
            .collect();
        if rebuild.is_empty() {
            return Ok(());
        }
        let session = ctl.session();
        let mut selected = false;
        for project in ctl.for_model(PROJECT)?.all()? {
            if let Some(experiment) = session.selected_experiment(&project)? {
                selected |= experiment.id(self.role) == Some(record.eid());
            }
        }
        if !selected {
            return Ok(());
        }
        for (attribute, value) in rebuild {
            info!(model = self.role, name = %record.label(), attribute = %attribute, "rebuild required");
            session.rebuild_topic().publish(RebuildRequired {
                model: self.role.to_string(),
                record: record.label(),
                attribute: attribute.clone(),
                value,
            });
        }
        Ok(())
    }

    fn on_delete(&self, ctl: &Controller<'_>, record: &Record) -> Result<()> {
        let dependents = self.dependents(ctl, record)?;
        self.freeze_check(ctl, record, &dependents)?;
        let experiments = ctl.for_model(EXPERIMENT)?;
        for experiment in dependents {
            experiments.delete(&Query::Eid(experiment.eid()))?;
        }
        Ok(())
    }
}
