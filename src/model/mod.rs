//! Generic model engine
//!
//! A model is a [`Schema`] plus [`ModelHooks`]. The [`Controller`] runs CRUD
//! for one model on one storage level and keeps association back-references
//! in step.
//!
//! ## Lookup outcomes
//!
//! Key resolution returns a [`Lookup`] instead of failing, so callers can
//! branch on "not found" versus "ambiguous" explicitly:
//!
//! ```rust
//! use perfcfg::model::{Lookup, Record};
//!
//! fn describe(outcome: &Lookup) -> String {
//!     match outcome {
//!         Lookup::Found(record) => format!("found #{}", record.eid()),
//!         Lookup::NotFound => "missing".to_string(),
//!         Lookup::Ambiguous(all) => format!("{} matches", all.len()),
//!     }
//! }
//! # assert_eq!(describe(&Lookup::NotFound), "missing");
//! ```

mod cache;
mod controller;

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;

pub use cache::{RecordCache, RecordKey};
pub use controller::Controller;

use crate::schema::{self, ids_of, Schema};
use crate::storage::{Document, Eid, StoredDocument};
use crate::{Error, Result};

/// A persisted instance of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    model: &'static str,
    eid: Eid,
    data: Document,
}

impl Record {
    /// Wrap stored data.
    #[must_use]
    pub const fn new(model: &'static str, eid: Eid, data: Document) -> Self {
        Self { model, eid, data }
    }

    pub(crate) fn from_stored(model: &'static str, stored: StoredDocument) -> Self {
        Self::new(model, stored.eid, stored.data)
    }

    /// Model name
    #[must_use]
    pub const fn model(&self) -> &'static str {
        self.model
    }

    /// Record id
    #[must_use]
    pub const fn eid(&self) -> Eid {
        self.eid
    }

    /// All stored attributes
    #[must_use]
    pub const fn data(&self) -> &Document {
        &self.data
    }

    /// Consume into the stored attributes
    #[must_use]
    pub fn into_data(self) -> Document {
        self.data
    }

    /// Attribute value
    #[must_use]
    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.data.get(attr).filter(|v| !v.is_null())
    }

    /// String attribute
    #[must_use]
    pub fn str(&self, attr: &str) -> Option<&str> {
        self.get(attr).and_then(Value::as_str)
    }

    /// Boolean attribute, `false` when unset
    #[must_use]
    pub fn flag(&self, attr: &str) -> bool {
        self.get(attr).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer attribute
    #[must_use]
    pub fn int(&self, attr: &str) -> Option<i64> {
        self.get(attr).and_then(Value::as_i64)
    }

    /// Single reference attribute
    #[must_use]
    pub fn id(&self, attr: &str) -> Option<Eid> {
        ids_of(self.get(attr)).into_iter().next()
    }

    /// Collection reference attribute
    #[must_use]
    pub fn ids(&self, attr: &str) -> Vec<Eid> {
        ids_of(self.get(attr))
    }

    /// `name` attribute
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.str("name")
    }

    /// Human-facing label: the name, or `#eid` for unnamed records.
    #[must_use]
    pub fn label(&self) -> String {
        self.name()
            .map_or_else(|| format!("#{}", self.eid), str::to_string)
    }
}

/// Result of populating one attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Populated {
    /// Plain value (or `null` for an unset reference)
    Scalar(Value),
    /// The referenced record
    One(Record),
    /// The referenced records, in stored order
    Many(Vec<Record>),
}

/// Outcome of resolving a key to a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Exactly one match
    Found(Record),
    /// No match
    NotFound,
    /// More than one match
    Ambiguous(Vec<Record>),
}

impl Lookup {
    pub(crate) fn from_matches(mut matches: Vec<Record>) -> Self {
        match matches.len() {
            0 => Self::NotFound,
            1 => matches.pop().map_or(Self::NotFound, Self::Found),
            _ => Self::Ambiguous(matches),
        }
    }

    /// The record when found.
    #[must_use]
    pub fn found(self) -> Option<Record> {
        match self {
            Self::Found(record) => Some(record),
            _ => None,
        }
    }
}

/// Old and new value of a changed attribute (`None` = unset).
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Value before the update
    pub old: Option<Value>,
    /// Value after the update
    pub new: Option<Value>,
}

/// Changed attributes of one update.
pub type Changes = BTreeMap<String, Change>;

/// Model-specific lifecycle hooks. Every hook defaults to a no-op.
///
/// `on_create`, `on_update`, and `on_delete` run inside the storage
/// transaction of the operation; returning an error rolls it back.
pub trait ModelHooks: Send + Sync {
    /// Before insert. May edit `data` or veto.
    ///
    /// # Errors
    ///
    /// An error aborts the creation.
    fn on_create(&self, _ctl: &Controller<'_>, _data: &mut Document) -> Result<()> {
        Ok(())
    }

    /// Before an update is persisted. May veto.
    ///
    /// # Errors
    ///
    /// An error aborts the update.
    fn on_update(&self, _ctl: &Controller<'_>, _record: &Record, _changes: &Changes) -> Result<()> {
        Ok(())
    }

    /// After an update is committed.
    ///
    /// # Errors
    ///
    /// Errors are returned to the caller; the update stays committed.
    fn after_update(
        &self,
        _ctl: &Controller<'_>,
        _record: &Record,
        _changes: &Changes,
    ) -> Result<()> {
        Ok(())
    }

    /// Before removal; cleans up dependent state.
    ///
    /// # Errors
    ///
    /// An error aborts the deletion.
    fn on_delete(&self, _ctl: &Controller<'_>, _record: &Record) -> Result<()> {
        Ok(())
    }
}

/// Hooks for models without lifecycle behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ModelHooks for NoHooks {}

/// Schema and hooks of one model.
pub struct ModelDef {
    schema: Schema,
    hooks: Box<dyn ModelHooks>,
}

impl ModelDef {
    /// Pair a schema with its hooks.
    pub fn new(schema: Schema, hooks: impl ModelHooks + 'static) -> Self {
        Self {
            schema,
            hooks: Box::new(hooks),
        }
    }

    /// Model schema
    #[must_use]
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    pub(crate) fn hooks(&self) -> &dyn ModelHooks {
        self.hooks.as_ref()
    }
}

impl std::fmt::Debug for ModelDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDef")
            .field("model", &self.schema.model())
            .finish_non_exhaustive()
    }
}

/// Fixed table of models, validated once at construction.
#[derive(Debug)]
pub struct ModelRegistry {
    models: FxHashMap<&'static str, ModelDef>,
}

impl ModelRegistry {
    /// Build and validate a registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] for duplicate models, asymmetric
    /// associations, or compatibility rules naming unknown attributes.
    pub fn new(defs: impl IntoIterator<Item = ModelDef>) -> Result<Self> {
        let mut models = FxHashMap::default();
        for def in defs {
            let model = def.schema.model();
            if models.insert(model, def).is_some() {
                return Err(Error::Internal(format!("model '{model}' registered twice")));
            }
        }
        schema::validate(models.values().map(|def| &def.schema))?;
        Ok(Self { models })
    }

    /// Definition of `model`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] for an unregistered model.
    pub fn get(&self, model: &str) -> Result<&ModelDef> {
        self.models
            .get(model)
            .ok_or_else(|| Error::Internal(format!("unknown model '{model}'")))
    }

    /// Schema of `model`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] for an unregistered model.
    pub fn schema(&self, model: &str) -> Result<&Schema> {
        Ok(self.get(model)?.schema())
    }

    /// Registered model names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.models.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Attribute;
    use serde_json::json;

    #[test]
    fn test_record_accessors() {
        let data = json!({"name": "x", "mpi": true, "trials": [3, 1], "project": 2, "gone": null});
        let record = Record::new("experiment", 9, data.as_object().cloned().unwrap());
        assert_eq!(record.label(), "x");
        assert!(record.flag("mpi"));
        assert_eq!(record.ids("trials"), vec![3, 1]);
        assert_eq!(record.id("project"), Some(2));
        assert!(record.get("gone").is_none());

        let unnamed = Record::new("trial", 4, Document::new());
        assert_eq!(unnamed.label(), "#4");
    }

    #[test]
    fn test_lookup_from_matches() {
        assert_eq!(Lookup::from_matches(Vec::new()), Lookup::NotFound);
        let one = Record::new("t", 1, Document::new());
        assert!(Lookup::from_matches(vec![one.clone()]).found().is_some());
        let both = Lookup::from_matches(vec![one.clone(), one]);
        assert!(matches!(both, Lookup::Ambiguous(ref all) if all.len() == 2));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let a = || ModelDef::new(Schema::new("a", "a").attribute(Attribute::string("name")), NoHooks);
        let err = ModelRegistry::new([a(), a()]).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
