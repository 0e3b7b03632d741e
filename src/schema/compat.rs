//! Compatibility rules between records of different models
//!
//! A rule hangs off an attribute value (e.g. Application `mpi = true`) and
//! constrains an attribute of another model:
//!
//! - `Require`: the other record must satisfy the expectation (error otherwise)
//! - `Encourage`: same check, but a failure is only a warning
//! - `Exclude`: the other record must NOT satisfy the expectation
//!
//! A rule is only evaluated against a record of the model it names.

use std::fmt;

use serde_json::Value;

use super::Schema;
use crate::model::Record;
use crate::{Error, Result};

/// What a rule expects of the other record's attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Expect {
    /// Equal to this value
    Value(Value),
    /// Equal to any of these values
    OneOf(Vec<Value>),
    /// Present and not `null`
    Defined,
}

impl Expect {
    /// Evaluate against an attribute value (`None` when absent).
    #[must_use]
    pub fn is_met(&self, actual: Option<&Value>) -> bool {
        let actual = actual.filter(|v| !v.is_null());
        match self {
            Self::Value(expected) => actual == Some(expected),
            Self::OneOf(options) => actual.is_some_and(|v| options.contains(v)),
            Self::Defined => actual.is_some(),
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "= {v}"),
            Self::OneOf(vs) => {
                let listed: Vec<String> = vs.iter().map(ToString::to_string).collect();
                write!(f, "in [{}]", listed.join(", "))
            }
            Self::Defined => f.write_str("set"),
        }
    }
}

impl From<bool> for Expect {
    fn from(v: bool) -> Self {
        Self::Value(Value::Bool(v))
    }
}

impl From<&str> for Expect {
    fn from(v: &str) -> Self {
        Self::Value(Value::from(v))
    }
}

impl From<i64> for Expect {
    fn from(v: i64) -> Self {
        Self::Value(Value::from(v))
    }
}

impl<const N: usize> From<[&str; N]> for Expect {
    fn from(vs: [&str; N]) -> Self {
        Self::OneOf(vs.iter().map(|v| Value::from(*v)).collect())
    }
}

/// Rule strength
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Violation is an error
    Require,
    /// Violation is a warning
    Encourage,
    /// Satisfying the expectation is an error
    Exclude,
}

/// Constraint on an attribute of another model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompatRule {
    kind: RuleKind,
    model: &'static str,
    attribute: &'static str,
    expect: Expect,
}

impl CompatRule {
    /// `model.attribute` must satisfy `expect`
    #[must_use]
    pub fn require(model: &'static str, attribute: &'static str, expect: impl Into<Expect>) -> Self {
        Self {
            kind: RuleKind::Require,
            model,
            attribute,
            expect: expect.into(),
        }
    }

    /// `model.attribute` should satisfy `expect`
    #[must_use]
    pub fn encourage(
        model: &'static str,
        attribute: &'static str,
        expect: impl Into<Expect>,
    ) -> Self {
        Self {
            kind: RuleKind::Encourage,
            model,
            attribute,
            expect: expect.into(),
        }
    }

    /// `model.attribute` must not satisfy `expect`
    #[must_use]
    pub fn exclude(model: &'static str, attribute: &'static str, expect: impl Into<Expect>) -> Self {
        Self {
            kind: RuleKind::Exclude,
            model,
            attribute,
            expect: expect.into(),
        }
    }

    /// Rule strength
    #[must_use]
    pub const fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Constrained model
    #[must_use]
    pub const fn model(&self) -> &'static str {
        self.model
    }

    /// Constrained attribute
    #[must_use]
    pub const fn attribute(&self) -> &'static str {
        self.attribute
    }

    /// Expectation
    #[must_use]
    pub const fn expect(&self) -> &Expect {
        &self.expect
    }

    /// True if `other` violates this rule (never for records of other models).
    #[must_use]
    pub fn is_violated_by(&self, other: &Record) -> bool {
        if other.model() != self.model {
            return false;
        }
        let met = self.expect.is_met(other.get(self.attribute));
        match self.kind {
            RuleKind::Require | RuleKind::Encourage => !met,
            RuleKind::Exclude => met,
        }
    }
}

/// Advisory result of a failed `Encourage` rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatWarning {
    /// Human-readable description
    pub message: String,
    /// Suggested change
    pub hint: String,
}

impl fmt::Display for CompatWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.hint)
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "unset".to_string(),
        Some(v) => v.to_string(),
    }
}

/// Evaluate every rule `lhs` declares (for its current values) against `rhs`.
///
/// `lhs_schema` must be the schema of `lhs`. Returns the warnings of failed
/// `Encourage` rules. Does not log; callers decide how to surface warnings.
///
/// # Errors
///
/// Returns a configuration error for the first failed `Require` or `Exclude`
/// rule, with hints naming both sides.
pub fn check_compatibility(
    lhs_schema: &Schema,
    lhs: &Record,
    rhs: &Record,
) -> Result<Vec<CompatWarning>> {
    let mut warnings = Vec::new();
    for attribute in lhs_schema.attributes() {
        let current = lhs.get(attribute.name());
        for (when, rule) in attribute.compat_rules() {
            if current != Some(when) || !rule.is_violated_by(rhs) {
                continue;
            }
            let actual = render(rhs.get(rule.attribute()));
            let cause = format!(
                "{} '{}' has {} = {when}",
                lhs.model(),
                lhs.label(),
                attribute.name()
            );
            match rule.kind() {
                RuleKind::Require => {
                    return Err(Error::configuration(
                        format!(
                            "{cause}, which requires {}.{} {}, but {} '{}' has {} = {actual}",
                            rule.model(),
                            rule.attribute(),
                            rule.expect(),
                            rhs.model(),
                            rhs.label(),
                            rule.attribute()
                        ),
                        [
                            format!(
                                "Change {} '{}' so that {} {}",
                                rhs.model(),
                                rhs.label(),
                                rule.attribute(),
                                rule.expect()
                            ),
                            format!(
                                "Change {} '{}' so that {} is not {when}",
                                lhs.model(),
                                lhs.label(),
                                attribute.name()
                            ),
                        ],
                    ));
                }
                RuleKind::Exclude => {
                    return Err(Error::configuration(
                        format!(
                            "{cause}, which is incompatible with {} '{}' having {} = {actual}",
                            rhs.model(),
                            rhs.label(),
                            rule.attribute()
                        ),
                        [
                            format!(
                                "Change {} '{}' so that {} is not {actual}",
                                rhs.model(),
                                rhs.label(),
                                rule.attribute()
                            ),
                            format!(
                                "Change {} '{}' so that {} is not {when}",
                                lhs.model(),
                                lhs.label(),
                                attribute.name()
                            ),
                        ],
                    ));
                }
                RuleKind::Encourage => warnings.push(CompatWarning {
                    message: format!(
                        "{cause}, which recommends {}.{} {}, but {} '{}' has {} = {actual}",
                        rule.model(),
                        rule.attribute(),
                        rule.expect(),
                        rhs.model(),
                        rhs.label(),
                        rule.attribute()
                    ),
                    hint: format!(
                        "Consider changing {} '{}' so that {} {}",
                        rhs.model(),
                        rhs.label(),
                        rule.attribute(),
                        rule.expect()
                    ),
                }),
            }
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use crate::storage::Document;
    use serde_json::json;

    fn record(model: &'static str, data: Value) -> Record {
        let data: Document = data.as_object().cloned().unwrap_or_default();
        Record::new(model, 1, data)
    }

    fn app_schema() -> Schema {
        Schema::new("application", "application")
            .attribute(Attribute::string("name"))
            .attribute(
                Attribute::boolean("mpi")
                    .compat(true, CompatRule::require("measurement", "mpi", true))
                    .compat(true, CompatRule::encourage("target", "mpi_cc", Expect::Defined)),
            )
            .attribute(
                Attribute::string("linkage")
                    .compat("static", CompatRule::exclude("measurement", "sample", true)),
            )
    }

    #[test]
    fn test_expect() {
        assert!(Expect::Defined.is_met(Some(&json!("mpicc"))));
        assert!(!Expect::Defined.is_met(Some(&Value::Null)));
        assert!(Expect::from(["ompt", "opari"]).is_met(Some(&json!("ompt"))));
        assert!(!Expect::from(true).is_met(None));
    }

    #[test]
    fn test_require_violation() {
        let app = record("application", json!({"name": "a", "mpi": true}));
        let meas = record("measurement", json!({"name": "m", "mpi": false}));
        let err = check_compatibility(&app_schema(), &app, &meas).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(err.hints().len(), 2);

        let meas = record("measurement", json!({"name": "m", "mpi": true}));
        assert!(check_compatibility(&app_schema(), &app, &meas).unwrap().is_empty());
    }

    #[test]
    fn test_rule_ignores_other_models() {
        let app = record("application", json!({"name": "a", "mpi": true}));
        let target = record("target", json!({"name": "t", "mpi_cc": "mpicc"}));
        assert!(check_compatibility(&app_schema(), &app, &target).unwrap().is_empty());
    }

    #[test]
    fn test_encourage_is_warning() {
        let app = record("application", json!({"name": "a", "mpi": true}));
        let target = record("target", json!({"name": "t"}));
        let warnings = check_compatibility(&app_schema(), &app, &target).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("mpi_cc"));
    }

    #[test]
    fn test_exclude() {
        let app = record("application", json!({"name": "a", "linkage": "static"}));
        let sampling = record("measurement", json!({"name": "m", "sample": true}));
        assert!(check_compatibility(&app_schema(), &app, &sampling).is_err());
        let plain = record("measurement", json!({"name": "m", "sample": false}));
        assert!(check_compatibility(&app_schema(), &app, &plain).is_ok());
    }
}
