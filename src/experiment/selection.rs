//! Experiment composition
//!
//! An experiment's identity is its (project, target, application,
//! measurement) tuple. Composing the same tuple twice returns the same
//! record.

use serde_json::Value;
use tracing::{info, warn};

use crate::entities::{APPLICATION, EXPERIMENT, MEASUREMENT, PROJECT, TARGET};
use crate::model::{Controller, Lookup, Record};
use crate::schema::{check_compatibility, CompatWarning};
use crate::session::Session;
use crate::storage::{Document, Query};
use crate::{Error, Result};

/// Result of composing an experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// The experiment record (new or existing)
    pub experiment: Record,
    /// True if this call created it
    pub created: bool,
    /// Failed `Encourage` rules
    pub warnings: Vec<CompatWarning>,
}

/// Check every unordered pair of `components`, in both directions.
///
/// # Errors
///
/// Returns the configuration error of the first failed `Require` or
/// `Exclude` rule.
pub fn check_combination(session: &Session, components: &[Record]) -> Result<Vec<CompatWarning>> {
    let mut warnings: Vec<CompatWarning> = Vec::new();
    for (i, lhs) in components.iter().enumerate() {
        for rhs in &components[i + 1..] {
            for (a, b) in [(lhs, rhs), (rhs, lhs)] {
                let schema = session.models().schema(a.model())?;
                for warning in check_compatibility(schema, a, b)? {
                    if !warnings.contains(&warning) {
                        warnings.push(warning);
                    }
                }
            }
        }
    }
    Ok(warnings)
}

fn resolve(ctl: &Controller<'_>, name: &str) -> Result<Record> {
    match ctl.by_name(name)? {
        Lookup::Found(record) => Ok(record),
        Lookup::NotFound => Err(Error::configuration(
            format!("There is no {} named '{name}'", ctl.model()),
            [format!("Create the {} before selecting it", ctl.model())],
        )),
        Lookup::Ambiguous(all) => Err(Error::Internal(format!(
            "{} {} records are named '{name}'",
            all.len(),
            ctl.model()
        ))),
    }
}

fn membership_attribute(role: &str) -> String {
    format!("{role}s")
}

/// Find or create the experiment for the named records of `project`.
///
/// # Errors
///
/// - [`Error::Configuration`] if a name does not resolve, a component is not
///   part of the project, or a `Require`/`Exclude` rule fails
/// - [`Error::ProjectStorage`] if there is no project storage
pub fn compose(
    session: &Session,
    project: &str,
    target: &str,
    application: &str,
    measurement: &str,
) -> Result<Selection> {
    let projects = session.controller(PROJECT)?;
    let project = resolve(&projects, project)?;

    let mut components = Vec::with_capacity(3);
    for (role, name) in [(TARGET, target), (APPLICATION, application), (MEASUREMENT, measurement)] {
        let record = resolve(&projects.for_model(role)?, name)?;
        if !project.ids(&membership_attribute(role)).contains(&record.eid()) {
            return Err(Error::configuration(
                format!(
                    "{role} '{}' is not part of project '{}'",
                    record.label(),
                    project.label()
                ),
                [format!(
                    "Add {role} '{}' to project '{}' first",
                    record.label(),
                    project.label()
                )],
            ));
        }
        components.push(record);
    }

    let warnings = check_combination(session, &components)?;
    for warning in &warnings {
        warn!(hint = %warning.hint, "{}", warning.message);
    }

    let mut identity = Document::new();
    identity.insert(PROJECT.to_string(), Value::from(project.eid()));
    for component in &components {
        identity.insert(component.model().to_string(), Value::from(component.eid()));
    }

    let experiments = projects.for_model(EXPERIMENT)?;
    if let Some(existing) = experiments.one(&Query::keys(identity.clone(), false))? {
        info!(experiment = %existing.label(), "reusing experiment");
        return Ok(Selection {
            experiment: existing,
            created: false,
            warnings,
        });
    }
    let experiment = experiments.create(identity)?;
    info!(experiment = %experiment.label(), project = %project.label(), "composed experiment");
    Ok(Selection {
        experiment,
        created: true,
        warnings,
    })
}

/// [`compose`], then make the experiment the project's selection.
///
/// # Errors
///
/// Same as [`compose`].
pub fn select(
    session: &Session,
    project: &str,
    target: &str,
    application: &str,
    measurement: &str,
) -> Result<Selection> {
    let selection = compose(session, project, target, application, measurement)?;
    let mut fields = Document::new();
    fields.insert("experiment".to_string(), Value::from(selection.experiment.eid()));
    session
        .controller(PROJECT)?
        .update(fields, &Query::key("name", project))?;
    info!(project, experiment = %selection.experiment.label(), "selected experiment");
    Ok(selection)
}
