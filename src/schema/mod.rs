//! Declarative attribute schemas
//!
//! Every model is described by a [`Schema`]: a table name plus an ordered list
//! of typed [`Attribute`]s. Attributes carry their constraints (required,
//! unique, default, choices), association metadata, compatibility rules, and
//! the rebuild flag.
//!
//! ## Associations
//!
//! ```text
//! Project.experiments ──collection via──> Experiment.project
//! Project.targets     ──collection via──> Target.projects      (many-to-many)
//! Experiment.trials   ──collection via──> Trial.experiment
//! ```
//!
//! Both sides must declare each other. [`validate`] checks this once when the
//! model registry is built.
//!
//! ## Example
//!
//! ```rust
//! use perfcfg::schema::{Attribute, Schema};
//!
//! let schema = Schema::new("widget", "widget")
//!     .attribute(Attribute::string("name").required().unique())
//!     .attribute(Attribute::integer("size").default_value(4));
//!
//! assert!(schema.get("name").is_some_and(|a| a.is_unique()));
//! ```

pub mod compat;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;

pub use compat::{check_compatibility, CompatRule, CompatWarning, Expect, RuleKind};

use crate::storage::{Document, Eid};
use crate::{Error, Result};

/// Target of a reference attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    /// Referenced model name
    pub model: &'static str,
    /// Inverse attribute on the referenced model, if maintained
    pub via: Option<&'static str>,
}

/// Declared attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    /// UTF-8 text
    String,
    /// `true`/`false`
    Boolean,
    /// Signed 64-bit integer
    Integer,
    /// RFC 3339 timestamp, stored normalized to UTC
    Datetime,
    /// Single record id
    Model(Association),
    /// Set of record ids
    Collection(Association),
}

impl AttributeType {
    const fn describe(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Boolean => "a boolean",
            Self::Integer => "an integer",
            Self::Datetime => "an RFC 3339 timestamp",
            Self::Model(_) => "a record id",
            Self::Collection(_) => "a list of record ids",
        }
    }
}

/// One schema entry.
#[derive(Debug, Clone)]
pub struct Attribute {
    name: &'static str,
    kind: AttributeType,
    required: bool,
    unique: bool,
    default: Option<Value>,
    choices: Option<Vec<Value>>,
    compat: Vec<(Value, CompatRule)>,
    rebuild_required: bool,
    description: &'static str,
}

impl Attribute {
    const fn with_kind(name: &'static str, kind: AttributeType) -> Self {
        Self {
            name,
            kind,
            required: false,
            unique: false,
            default: None,
            choices: None,
            compat: Vec::new(),
            rebuild_required: false,
            description: "",
        }
    }

    /// String attribute
    #[must_use]
    pub const fn string(name: &'static str) -> Self {
        Self::with_kind(name, AttributeType::String)
    }

    /// Boolean attribute
    #[must_use]
    pub const fn boolean(name: &'static str) -> Self {
        Self::with_kind(name, AttributeType::Boolean)
    }

    /// Integer attribute
    #[must_use]
    pub const fn integer(name: &'static str) -> Self {
        Self::with_kind(name, AttributeType::Integer)
    }

    /// Timestamp attribute
    #[must_use]
    pub const fn datetime(name: &'static str) -> Self {
        Self::with_kind(name, AttributeType::Datetime)
    }

    /// Reference to one record of `model`
    #[must_use]
    pub const fn model(name: &'static str, model: &'static str) -> Self {
        Self::with_kind(name, AttributeType::Model(Association { model, via: None }))
    }

    /// Reference to a set of records of `model`
    #[must_use]
    pub const fn collection(name: &'static str, model: &'static str) -> Self {
        Self::with_kind(name, AttributeType::Collection(Association { model, via: None }))
    }

    /// Maintain the inverse side through `attr` on the referenced model.
    #[must_use]
    pub fn via(mut self, attr: &'static str) -> Self {
        match &mut self.kind {
            AttributeType::Model(assoc) | AttributeType::Collection(assoc) => {
                assoc.via = Some(attr);
            }
            _ => {}
        }
        self
    }

    /// Must be present at creation
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// At most one record per table may hold a given value
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Value used when the attribute is missing at creation
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restrict values to `choices`
    #[must_use]
    pub fn choices<V: Into<Value>>(mut self, choices: impl IntoIterator<Item = V>) -> Self {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// Attach a compatibility rule that applies while this attribute equals `when`.
    #[must_use]
    pub fn compat(mut self, when: impl Into<Value>, rule: CompatRule) -> Self {
        self.compat.push((when.into(), rule));
        self
    }

    /// Changing this attribute invalidates build artifacts
    #[must_use]
    pub fn rebuild_required(mut self) -> Self {
        self.rebuild_required = true;
        self
    }

    /// Human-readable description
    #[must_use]
    pub fn description(mut self, text: &'static str) -> Self {
        self.description = text;
        self
    }

    /// Attribute name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared type
    #[must_use]
    pub const fn kind(&self) -> AttributeType {
        self.kind
    }

    /// Association metadata for reference attributes
    #[must_use]
    pub const fn association(&self) -> Option<Association> {
        match self.kind {
            AttributeType::Model(assoc) | AttributeType::Collection(assoc) => Some(assoc),
            _ => None,
        }
    }

    /// True for collection references
    #[must_use]
    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, AttributeType::Collection(_))
    }

    /// Required flag
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    /// Unique flag
    #[must_use]
    pub const fn is_unique(&self) -> bool {
        self.unique
    }

    /// Rebuild flag
    #[must_use]
    pub const fn is_rebuild_required(&self) -> bool {
        self.rebuild_required
    }

    /// Default value, if any
    #[must_use]
    pub const fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Allowed values, if restricted
    #[must_use]
    pub fn allowed(&self) -> Option<&[Value]> {
        self.choices.as_deref()
    }

    /// Description text
    #[must_use]
    pub const fn describe(&self) -> &'static str {
        self.description
    }

    /// Compatibility rules keyed by this attribute's value.
    #[must_use]
    pub fn compat_rules(&self) -> &[(Value, CompatRule)] {
        &self.compat
    }

    /// Coerce `value` to the declared type and check choices.
    ///
    /// `null` passes through unchanged (it means "unset").
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value cannot be converted or is
    /// not one of the allowed choices.
    pub fn coerce(&self, model: &str, value: Value) -> Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        let invalid = |value: &Value| {
            Error::configuration(
                format!(
                    "Invalid value {value} for {model} attribute '{}': expected {}",
                    self.name,
                    self.kind.describe()
                ),
                Vec::<String>::new(),
            )
        };
        let coerced = match self.kind {
            AttributeType::String => match value {
                Value::String(_) => value,
                Value::Bool(_) | Value::Number(_) => Value::String(value.to_string()),
                other => return Err(invalid(&other)),
            },
            AttributeType::Boolean => coerce_bool(&value).ok_or_else(|| invalid(&value))?,
            AttributeType::Integer => coerce_int(&value).ok_or_else(|| invalid(&value))?,
            AttributeType::Datetime => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| Value::String(dt.with_timezone(&Utc).to_rfc3339()))
                .ok_or_else(|| invalid(&value))?,
            AttributeType::Model(_) => coerce_id(&value)
                .map(Value::from)
                .ok_or_else(|| invalid(&value))?,
            AttributeType::Collection(_) => {
                let items = match &value {
                    Value::Array(items) => items.clone(),
                    single => vec![single.clone()],
                };
                let mut ids: Vec<Eid> = Vec::with_capacity(items.len());
                for item in &items {
                    let id = coerce_id(item).ok_or_else(|| invalid(&value))?;
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Value::from(ids)
            }
        };
        if let Some(choices) = &self.choices {
            if !choices.contains(&coerced) {
                let listed = choices
                    .iter()
                    .map(|c| c.as_str().map_or_else(|| c.to_string(), str::to_string))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(Error::configuration(
                    format!(
                        "Invalid value {coerced} for {model} attribute '{}'",
                        self.name
                    ),
                    [format!("Valid values are: {listed}")],
                ));
            }
        }
        Ok(coerced)
    }
}

fn coerce_bool(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(_) => Some(value.clone()),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(Value::Bool(false)),
            Some(1) => Some(Value::Bool(true)),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "off" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_int(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) => n.as_i64().map(Value::from),
        Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}

/// Record ids arrive as integers or their string form.
pub(crate) fn coerce_id(value: &Value) -> Option<Eid> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ids held by a reference attribute value (`null`, one id, or a list).
#[must_use]
pub fn ids_of(value: Option<&Value>) -> Vec<Eid> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(coerce_id).collect(),
        Some(other) => coerce_id(other).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Attribute layout of one model.
#[derive(Debug, Clone)]
pub struct Schema {
    model: &'static str,
    table: &'static str,
    attributes: Vec<Attribute>,
}

impl Schema {
    /// Empty schema for `model` stored in `table`.
    #[must_use]
    pub const fn new(model: &'static str, table: &'static str) -> Self {
        Self {
            model,
            table,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Model name
    #[must_use]
    pub const fn model(&self) -> &'static str {
        self.model
    }

    /// Table name
    #[must_use]
    pub const fn table(&self) -> &'static str {
        self.table
    }

    /// Attributes in declaration order
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Attribute by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Reference attributes with their association metadata.
    pub fn associations(&self) -> impl Iterator<Item = (&Attribute, Association)> {
        self.attributes
            .iter()
            .filter_map(|a| a.association().map(|assoc| (a, assoc)))
    }

    /// Coerce every field of `data`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown attributes or invalid values.
    pub fn coerce_document(&self, data: Document) -> Result<Document> {
        let mut out = Document::new();
        for (key, value) in data {
            let attribute = self.get(&key).ok_or_else(|| {
                Error::configuration(
                    format!("{} has no attribute '{key}'", self.model),
                    [format!(
                        "Known attributes: {}",
                        self.attributes
                            .iter()
                            .map(|a| a.name)
                            .collect::<Vec<_>>()
                            .join(", ")
                    )],
                )
            })?;
            out.insert(key, attribute.coerce(self.model, value)?);
        }
        Ok(out)
    }

    /// Fill missing attributes that declare a default.
    pub fn apply_defaults(&self, data: &mut Document) {
        for attribute in &self.attributes {
            if let Some(default) = &attribute.default {
                let missing = data.get(attribute.name).map_or(true, Value::is_null);
                if missing {
                    data.insert(attribute.name.to_string(), default.clone());
                }
            }
        }
    }

    /// Drop `null` fields (stored documents never hold explicit nulls).
    pub fn strip_nulls(data: &mut Document) {
        data.retain(|_, v| !v.is_null());
    }

    /// Check that required attributes are present.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first missing attribute.
    pub fn check_required(&self, data: &Document) -> Result<()> {
        for attribute in self.attributes.iter().filter(|a| a.required) {
            if data.get(attribute.name).map_or(true, Value::is_null) {
                return Err(Error::configuration(
                    format!(
                        "{} attribute '{}' is required",
                        self.model, attribute.name
                    ),
                    [format!("Provide a value for '{}'", attribute.name)],
                ));
            }
        }
        Ok(())
    }
}

/// Check association symmetry and compatibility rule targets across `schemas`.
///
/// # Errors
///
/// Returns [`Error::Internal`] describing the first schema authoring bug found.
pub fn validate<'a>(schemas: impl IntoIterator<Item = &'a Schema>) -> Result<()> {
    let by_model: FxHashMap<&str, &Schema> = schemas.into_iter().map(|s| (s.model, s)).collect();
    for schema in by_model.values() {
        for (attribute, assoc) in schema.associations() {
            let foreign = by_model.get(assoc.model).ok_or_else(|| {
                Error::Internal(format!(
                    "{}.{} references unknown model '{}'",
                    schema.model, attribute.name, assoc.model
                ))
            })?;
            let Some(via) = assoc.via else { continue };
            let inverse = foreign.get(via).and_then(Attribute::association).ok_or_else(|| {
                Error::Internal(format!(
                    "{}.{} is maintained via {}.{}, which is not a reference attribute",
                    schema.model, attribute.name, assoc.model, via
                ))
            })?;
            if inverse.model != schema.model || inverse.via.is_some_and(|v| v != attribute.name) {
                return Err(Error::Internal(format!(
                    "{}.{} and {}.{} do not reference each other",
                    schema.model, attribute.name, assoc.model, via
                )));
            }
        }
        for attribute in &schema.attributes {
            for (_, rule) in &attribute.compat {
                let known = by_model
                    .get(rule.model())
                    .is_some_and(|s| s.get(rule.attribute()).is_some());
                if !known {
                    return Err(Error::Internal(format!(
                        "{}.{} has a compatibility rule on unknown attribute {}.{}",
                        schema.model,
                        attribute.name,
                        rule.model(),
                        rule.attribute()
                    )));
                }
            }
        }
    }
    Ok(())
}
