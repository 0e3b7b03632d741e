//! Project: groups components and experiments, and remembers the selection.

use super::{
    validate_name_change, validate_name_field, APPLICATION, EXPERIMENT, MEASUREMENT, PROJECT,
    TARGET,
};
use crate::model::{Changes, Controller, ModelDef, ModelHooks, Record};
use crate::schema::{ids_of, Attribute, Schema};
use crate::storage::{Document, Query};
use crate::{Error, Result};

/// Project schema
#[must_use]
pub fn schema() -> Schema {
    Schema::new(PROJECT, "project")
        .attribute(Attribute::string("name").required().unique())
        .attribute(Attribute::collection("targets", TARGET).via("projects"))
        .attribute(Attribute::collection("applications", APPLICATION).via("projects"))
        .attribute(Attribute::collection("measurements", MEASUREMENT).via("projects"))
        .attribute(Attribute::collection("experiments", EXPERIMENT).via("project"))
        .attribute(Attribute::model("experiment", EXPERIMENT).description("selected experiment"))
}

struct ProjectHooks;

impl ModelHooks for ProjectHooks {
    fn on_create(&self, _ctl: &Controller<'_>, data: &mut Document) -> Result<()> {
        validate_name_field(PROJECT, data)
    }

    fn on_update(&self, ctl: &Controller<'_>, record: &Record, changes: &Changes) -> Result<()> {
        validate_name_change(PROJECT, changes)?;
        let Some(change) = changes.get("experiment") else {
            return Ok(());
        };
        for eid in ids_of(change.new.as_ref()) {
            let owner = ctl
                .for_model(EXPERIMENT)?
                .get(eid)?
                .and_then(|experiment| experiment.id("project"));
            if owner != Some(record.eid()) {
                return Err(Error::configuration(
                    format!(
                        "Experiment #{eid} does not belong to project '{}'",
                        record.label()
                    ),
                    ["Select one of the project's own experiments"],
                ));
            }
        }
        Ok(())
    }

    fn on_delete(&self, ctl: &Controller<'_>, record: &Record) -> Result<()> {
        ctl.for_model(EXPERIMENT)?
            .delete(&Query::key("project", record.eid()))?;
        Ok(())
    }
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), ProjectHooks)
}
