//! Experiment: the (project, target, application, measurement) composition.
//!
//! Components may not change once trials hold data; the experiment directory
//! `<level prefix>/experiments/<name>` holds one subdirectory per trial.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use super::{
    has_trial_data, validate_name, validate_name_change, with_changes, COMPONENTS, EXPERIMENT,
    PROJECT, TRIAL,
};
use crate::experiment::selection::check_combination;
use crate::model::{Changes, Controller, ModelDef, ModelHooks, Record};
use crate::schema::{coerce_id, Attribute, Schema};
use crate::storage::{Document, Eid, Query};
use crate::{Error, Result};

/// Experiment schema
#[must_use]
pub fn schema() -> Schema {
    let mut schema = Schema::new(EXPERIMENT, "experiment")
        .attribute(Attribute::string("name").unique())
        .attribute(Attribute::model("project", PROJECT).via("experiments").required());
    for role in COMPONENTS {
        schema = schema.attribute(Attribute::model(role, role).required());
    }
    schema.attribute(Attribute::collection("trials", TRIAL).via("experiment"))
}

/// Directory holding the experiment's trial data.
///
/// # Errors
///
/// Returns a configuration error if the experiment has no name.
pub fn data_dir(ctl: &Controller<'_>, experiment: &Record) -> Result<PathBuf> {
    let name = experiment.name().ok_or_else(|| {
        Error::configuration(
            format!("Experiment #{} has no name", experiment.eid()),
            Vec::<String>::new(),
        )
    })?;
    Ok(dir_named(ctl, name))
}

fn dir_named(ctl: &Controller<'_>, name: &str) -> PathBuf {
    ctl.level().prefix().join("experiments").join(name)
}

fn component(ctl: &Controller<'_>, role: &str, eid: Option<Eid>) -> Result<Record> {
    let eid = eid.ok_or_else(|| {
        Error::configuration(
            format!("Experiment {role} is required"),
            [format!("Select a {role}")],
        )
    })?;
    ctl.for_model(role)?.get(eid)?.ok_or_else(|| {
        Error::configuration(
            format!("Experiment references {role} #{eid}, which does not exist"),
            [format!("Create the {role} first")],
        )
    })
}

/// Target, application, and measurement records of `experiment`.
///
/// # Errors
///
/// Returns a configuration error if a component is missing.
pub fn components(ctl: &Controller<'_>, experiment: &Record) -> Result<[Record; 3]> {
    let [t, a, m] = COMPONENTS;
    Ok([
        component(ctl, t, experiment.id(t))?,
        component(ctl, a, experiment.id(a))?,
        component(ctl, m, experiment.id(m))?,
    ])
}

fn components_of(ctl: &Controller<'_>, data: &Document) -> Result<[Record; 3]> {
    let id = |role: &str| data.get(role).and_then(coerce_id);
    let [t, a, m] = COMPONENTS;
    Ok([
        component(ctl, t, id(t))?,
        component(ctl, a, id(a))?,
        component(ctl, m, id(m))?,
    ])
}

fn name_taken(ctl: &Controller<'_>, name: &str) -> Result<bool> {
    ctl.exists(&Query::key("name", name))
}

struct ExperimentHooks;

impl ModelHooks for ExperimentHooks {
    fn on_create(&self, ctl: &Controller<'_>, data: &mut Document) -> Result<()> {
        let components = components_of(ctl, data)?;
        let mut identity = Document::new();
        for role in ["project", COMPONENTS[0], COMPONENTS[1], COMPONENTS[2]] {
            identity.insert(role.to_string(), data.get(role).cloned().unwrap_or(Value::Null));
        }
        if let Some(existing) = ctl.one(&Query::keys(identity, false))? {
            return Err(Error::configuration(
                format!(
                    "Experiment '{}' already combines these components",
                    existing.label()
                ),
                ["Select the existing experiment instead"],
            ));
        }
        check_combination(ctl.session(), &components)?;

        let name = match data.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                let base = components
                    .iter()
                    .map(Record::label)
                    .collect::<Vec<_>>()
                    .join("-");
                if name_taken(ctl, &base)? {
                    let project = data
                        .get("project")
                        .and_then(coerce_id)
                        .map(|eid| ctl.for_model(PROJECT)?.get(eid))
                        .transpose()?
                        .flatten()
                        .map_or_else(|| "project".to_string(), |p| p.label());
                    format!("{project}-{base}")
                } else {
                    base
                }
            }
        };
        validate_name(EXPERIMENT, &name)?;
        if name_taken(ctl, &name)? {
            return Err(Error::UniqueAttribute {
                model: EXPERIMENT.to_string(),
                attribute: "name".to_string(),
                value: name,
            });
        }
        data.insert("name".to_string(), Value::from(name));
        Ok(())
    }

    fn on_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        validate_name_change(EXPERIMENT, changes)?;
        let recomposed = ["project", COMPONENTS[0], COMPONENTS[1], COMPONENTS[2]]
            .iter()
            .any(|role| changes.contains_key(*role));
        if recomposed {
            if has_trial_data(ctl, record)? {
                return Err(Error::immutable(format!(
                    "Experiment '{}' has trial data; its components cannot change",
                    record.label()
                )));
            }
            let updated = with_changes(record, changes);
            check_combination(ctl.session(), &components(ctl, &updated)?)?;
        }
        Ok(())
    }

    fn after_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        let Some(old) = changes
            .get("name")
            .and_then(|c| c.old.as_ref())
            .and_then(Value::as_str)
        else {
            return Ok(());
        };
        let (from, to) = (dir_named(ctl, old), data_dir(ctl, record)?);
        if from.exists() {
            fs::rename(&from, &to)?;
            debug!(from = %from.display(), to = %to.display(), "renamed experiment directory");
        }
        Ok(())
    }

    fn on_delete(&self, ctl: &Controller<'_>, record: &Record) -> Result<()> {
        ctl.for_model(TRIAL)?
            .delete(&Query::key("experiment", record.eid()))?;
        if let Ok(dir) = data_dir(ctl, record) {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        let projects = ctl.for_model(PROJECT)?;
        for project in projects.search(&Query::key("experiment", record.eid()))? {
            let mut fields = Document::new();
            fields.insert("experiment".to_string(), Value::Null);
            projects.update(fields, &Query::Eid(project.eid()))?;
        }
        Ok(())
    }
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), ExperimentHooks)
}
