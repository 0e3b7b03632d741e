//! Trial: one numbered run under an experiment, with its data directory.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;

use super::{experiment, EXPERIMENT, TRIAL};
use crate::model::{Changes, Controller, ModelDef, ModelHooks, Record};
use crate::schema::{Attribute, Schema};
use crate::storage::{Document, Eid, Query};
use crate::{Error, Result};

/// Trial lifecycle phases as stored in the `phase` attribute.
pub const PHASES: [&str; 4] = ["allocated", "running", "completed", "failed"];

/// Trial schema
#[must_use]
pub fn schema() -> Schema {
    Schema::new(TRIAL, "trial")
        .attribute(Attribute::integer("number").required())
        .attribute(Attribute::model("experiment", EXPERIMENT).via("trials").required())
        .attribute(Attribute::string("command"))
        .attribute(Attribute::string("cwd"))
        .attribute(Attribute::datetime("begin_time"))
        .attribute(Attribute::datetime("end_time"))
        .attribute(Attribute::integer("return_code"))
        .attribute(Attribute::integer("data_size").default_value(0))
        .attribute(
            Attribute::string("phase")
                .choices(PHASES)
                .default_value("allocated"),
        )
}

/// Data directory of trial `number` of `experiment`.
///
/// # Errors
///
/// Returns a configuration error if the experiment has no name.
pub fn data_dir(ctl: &Controller<'_>, experiment: &Record, number: i64) -> Result<PathBuf> {
    Ok(experiment::data_dir(ctl, experiment)?.join(number.to_string()))
}

fn parent(ctl: &Controller<'_>, eid: Option<Eid>) -> Result<Record> {
    eid.map(|eid| ctl.for_model(EXPERIMENT)?.get(eid))
        .transpose()?
        .flatten()
        .ok_or_else(|| {
            Error::configuration("Trial has no valid experiment", ["Create trials through an experiment"])
        })
}

fn check_collision(ctl: &Controller<'_>, experiment: Eid, number: i64) -> Result<()> {
    let mut keys = Document::new();
    keys.insert("experiment".into(), Value::from(experiment));
    keys.insert("number".into(), Value::from(number));
    if ctl.exists(&Query::keys(keys, false))? {
        return Err(Error::configuration(
            format!("Trial {number} already exists in this experiment"),
            ["Renumber or delete the existing trial first"],
        ));
    }
    Ok(())
}

struct TrialHooks;

impl ModelHooks for TrialHooks {
    fn on_create(&self, ctl: &Controller<'_>, data: &mut Document) -> Result<()> {
        let experiment = parent(ctl, data.get("experiment").and_then(Value::as_u64))?;
        let number = data.get("number").and_then(Value::as_i64).unwrap_or_default();
        if number < 0 {
            return Err(Error::configuration(
                format!("Invalid trial number {number}"),
                ["Trial numbers are non-negative"],
            ));
        }
        check_collision(ctl, experiment.eid(), number)?;
        let dir = data_dir(ctl, &experiment, number)?;
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "created trial directory");
        Ok(())
    }

    fn on_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        let Some(new) = changes
            .get("number")
            .and_then(|c| c.new.as_ref())
            .and_then(Value::as_i64)
        else {
            return Ok(());
        };
        let experiment = parent(ctl, record.id("experiment"))?;
        check_collision(ctl, experiment.eid(), new)
    }

    // The directory follows the number only once the record has committed.
    fn after_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        let Some(change) = changes.get("number") else {
            return Ok(());
        };
        let (Some(old), Some(new)) = (
            change.old.as_ref().and_then(Value::as_i64),
            change.new.as_ref().and_then(Value::as_i64),
        ) else {
            return Ok(());
        };
        let experiment = parent(ctl, record.id("experiment"))?;
        let (from, to) = (data_dir(ctl, &experiment, old)?, data_dir(ctl, &experiment, new)?);
        if from.exists() {
            fs::rename(&from, &to)?;
            debug!(from = %from.display(), to = %to.display(), "moved trial directory");
        }
        Ok(())
    }

    fn on_delete(&self, ctl: &Controller<'_>, record: &Record) -> Result<()> {
        let Ok(experiment) = parent(ctl, record.id("experiment")) else {
            return Ok(());
        };
        let dir = data_dir(ctl, &experiment, record.int("number").unwrap_or_default())?;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(dir = %dir.display(), "removed trial directory");
        }
        Ok(())
    }
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), TrialHooks)
}
