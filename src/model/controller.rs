//! CRUD engine for one model on one storage level.
//!
//! Every mutation runs in a level transaction: the model hook, the record
//! write, and all back-reference maintenance commit together or not at all.
//! Back-reference edits are idempotent: linking twice stores one id and
//! unlinking an id that is not there does nothing.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use super::{Change, Changes, Lookup, ModelDef, Populated, Record, RecordKey};
use crate::schema::{ids_of, Attribute, Schema};
use crate::session::Session;
use crate::storage::level::StorageLevel;
use crate::storage::{merge_fields, Document, Eid, Query};
use crate::{Error, Result};

/// Model operations bound to a session and a storage level.
#[derive(Clone)]
pub struct Controller<'s> {
    session: &'s Session,
    level: Arc<StorageLevel>,
    def: &'s ModelDef,
}

impl std::fmt::Debug for Controller<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("model", &self.model())
            .field("level", &self.level.name())
            .finish_non_exhaustive()
    }
}

fn describe(query: &Query) -> String {
    match query {
        Query::All => "any record".to_string(),
        Query::Eid(eid) => format!("id {eid}"),
        Query::Eids(eids) => format!("ids {eids:?}"),
        Query::Keys { keys, match_any } => {
            let parts: Vec<String> = keys.iter().map(|(k, v)| format!("{k}={v}")).collect();
            parts.join(if *match_any { " or " } else { " and " })
        }
    }
}

fn display_value(value: &Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), str::to_string)
}

impl<'s> Controller<'s> {
    pub(crate) fn new(session: &'s Session, level: Arc<StorageLevel>, def: &'s ModelDef) -> Self {
        Self {
            session,
            level,
            def,
        }
    }

    /// Owning session
    #[must_use]
    pub const fn session(&self) -> &'s Session {
        self.session
    }

    /// Storage level this controller writes to
    #[must_use]
    pub const fn level(&self) -> &Arc<StorageLevel> {
        &self.level
    }

    /// Model schema
    #[must_use]
    pub const fn schema(&self) -> &'s Schema {
        self.def.schema()
    }

    /// Model name
    #[must_use]
    pub const fn model(&self) -> &'static str {
        self.def.schema().model()
    }

    fn table(&self) -> &'static str {
        self.def.schema().table()
    }

    /// Controller for another model on the same level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] for an unregistered model.
    pub fn for_model(&self, model: &str) -> Result<Controller<'s>> {
        Ok(Controller::new(
            self.session,
            Arc::clone(&self.level),
            self.session.models().get(model)?,
        ))
    }

    /// Drop cached records of this level.
    pub(crate) fn invalidate(&self) {
        self.session.cache().invalidate_level(self.level.name());
    }

    fn coerce_query(&self, query: &Query) -> Result<Query> {
        match query {
            Query::Keys { keys, match_any } => {
                let mut coerced = Document::new();
                for (key, value) in keys {
                    let value = match self.schema().get(key) {
                        Some(attribute) => attribute.coerce(self.model(), value.clone())?,
                        None => {
                            return Err(Error::configuration(
                                format!("{} has no attribute '{key}'", self.model()),
                                Vec::<String>::new(),
                            ))
                        }
                    };
                    coerced.insert(key.clone(), value);
                }
                Ok(Query::keys(coerced, *match_any))
            }
            other => Ok(other.clone()),
        }
    }

    fn check_unique(&self, data: &Document, except: Option<Eid>) -> Result<()> {
        for attribute in self.schema().attributes().iter().filter(|a| a.is_unique()) {
            let Some(value) = data.get(attribute.name()).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = self
                .level
                .search(self.table(), &Query::key(attribute.name(), value.clone()))?
                .iter()
                .any(|doc| Some(doc.eid) != except);
            if taken {
                return Err(Error::UniqueAttribute {
                    model: self.model().to_string(),
                    attribute: attribute.name().to_string(),
                    value: display_value(value),
                });
            }
        }
        Ok(())
    }

    fn check_references(&self, data: &Document) -> Result<()> {
        for (attribute, assoc) in self.schema().associations() {
            let ids = ids_of(data.get(attribute.name()));
            if ids.is_empty() {
                continue;
            }
            let foreign = self.for_model(assoc.model)?;
            for id in ids {
                if foreign.get(id)?.is_none() {
                    return Err(Error::configuration(
                        format!(
                            "{} attribute '{}' references {} #{id}, which does not exist",
                            self.model(),
                            attribute.name(),
                            assoc.model
                        ),
                        [format!("Create the {} first", assoc.model)],
                    ));
                }
            }
        }
        Ok(())
    }

    fn attribute(&self, attr: &str) -> Result<&'s Attribute> {
        self.schema().get(attr).ok_or_else(|| {
            Error::Internal(format!("{} has no attribute '{attr}'", self.model()))
        })
    }

    /// Add `id` to reference attribute `attr` of record `eid`.
    ///
    /// A single reference that pointed elsewhere is repointed, and the old
    /// target's inverse collection is cleaned.
    pub(crate) fn link(&self, eid: Eid, attr: &str, id: Eid) -> Result<()> {
        let Some(stored) = self.level.get(self.table(), &Query::Eid(eid))? else {
            return Ok(());
        };
        let attribute = self.attribute(attr)?;
        let current = ids_of(stored.data.get(attr));
        if current.contains(&id) {
            return Ok(());
        }
        let value = if attribute.is_collection() {
            let mut ids = current;
            ids.push(id);
            Value::from(ids)
        } else {
            if let (Some(old), Some(assoc)) = (current.first(), attribute.association()) {
                if let Some(via) = assoc.via {
                    self.for_model(assoc.model)?.unlink(*old, via, eid)?;
                }
            }
            Value::from(id)
        };
        let mut fields = Document::new();
        fields.insert(attr.to_string(), value);
        self.level.update(self.table(), &fields, &Query::Eid(eid))?;
        debug!(model = self.model(), eid, attr, id, "linked");
        Ok(())
    }

    /// Remove `id` from reference attribute `attr` of record `eid`.
    pub(crate) fn unlink(&self, eid: Eid, attr: &str, id: Eid) -> Result<()> {
        let Some(stored) = self.level.get(self.table(), &Query::Eid(eid))? else {
            return Ok(());
        };
        let attribute = self.attribute(attr)?;
        let current = ids_of(stored.data.get(attr));
        if !current.contains(&id) {
            return Ok(());
        }
        let value = if attribute.is_collection() {
            Value::from(current.into_iter().filter(|x| *x != id).collect::<Vec<_>>())
        } else {
            Value::Null
        };
        let mut fields = Document::new();
        fields.insert(attr.to_string(), value);
        self.level.update(self.table(), &fields, &Query::Eid(eid))?;
        debug!(model = self.model(), eid, attr, id, "unlinked");
        Ok(())
    }

    /// Create a record.
    ///
    /// Coerces and validates `data`, applies defaults, checks uniqueness and
    /// referenced records, runs `on_create`, inserts, and adds this record to
    /// the inverse side of every maintained association.
    ///
    /// # Errors
    ///
    /// - [`Error::UniqueAttribute`] when a unique value is taken
    /// - [`Error::Configuration`] for invalid or missing values
    /// - any error raised by the model's `on_create` hook
    pub fn create(&self, data: Document) -> Result<Record> {
        let schema = self.schema();
        let mut data = schema.coerce_document(data)?;
        Schema::strip_nulls(&mut data);
        schema.apply_defaults(&mut data);
        schema.check_required(&data)?;
        self.check_unique(&data, None)?;
        self.check_references(&data)?;

        let result = self.level.transaction(|| {
            let mut data = data.clone();
            self.def.hooks().on_create(self, &mut data)?;
            Schema::strip_nulls(&mut data);
            let eid = self.level.insert(self.table(), data.clone())?;
            for (attribute, assoc) in schema.associations() {
                let Some(via) = assoc.via else { continue };
                let foreign = self.for_model(assoc.model)?;
                for id in ids_of(data.get(attribute.name())) {
                    foreign.link(id, via, eid)?;
                }
            }
            Ok(Record::new(self.model(), eid, data))
        });
        self.invalidate();
        let record = result?;
        info!(model = self.model(), eid = record.eid(), name = %record.label(), "created record");
        Ok(record)
    }

    /// Update the single record matching `query`, returning what changed.
    ///
    /// `null` fields unset the attribute. Unchanged fields are ignored; when
    /// nothing changes no hook runs.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if no record matches or a value is invalid
    /// - [`Error::Internal`] if more than one record matches
    /// - any veto from the model's `on_update` hook
    pub fn update(&self, fields: Document, query: &Query) -> Result<Changes> {
        let record = match self.lookup(query)? {
            Lookup::Found(record) => record,
            Lookup::NotFound => {
                return Err(Error::configuration(
                    format!("No {} matches {}", self.model(), describe(query)),
                    [format!("Check the {} name", self.model())],
                ))
            }
            Lookup::Ambiguous(all) => {
                return Err(Error::Internal(format!(
                    "{} {} records match {}, which should identify one record",
                    all.len(),
                    self.model(),
                    describe(query)
                )))
            }
        };
        let schema = self.schema();
        let fields = schema.coerce_document(fields)?;

        let mut changes = Changes::new();
        for (key, value) in &fields {
            let old = record.get(key).cloned();
            let new = Some(value.clone()).filter(|v| !v.is_null());
            if old != new {
                changes.insert(key.clone(), Change { old, new });
            }
        }
        if changes.is_empty() {
            return Ok(changes);
        }
        for (key, change) in &changes {
            if change.new.is_none() && schema.get(key).is_some_and(Attribute::is_required) {
                return Err(Error::configuration(
                    format!("{} attribute '{key}' is required and cannot be unset", self.model()),
                    [format!("Provide a new value for '{key}'")],
                ));
            }
        }
        let changed: Document = changes
            .iter()
            .map(|(k, c)| (k.clone(), c.new.clone().unwrap_or(Value::Null)))
            .collect();
        self.check_unique(&changed, Some(record.eid()))?;
        self.check_references(&changed)?;

        let result = self.level.transaction(|| {
            self.def.hooks().on_update(self, &record, &changes)?;
            self.level
                .update(self.table(), &changed, &Query::Eid(record.eid()))?;
            for (attribute, assoc) in schema.associations() {
                let (Some(via), Some(change)) = (assoc.via, changes.get(attribute.name())) else {
                    continue;
                };
                let old = ids_of(change.old.as_ref());
                let new = ids_of(change.new.as_ref());
                let foreign = self.for_model(assoc.model)?;
                for id in old.iter().filter(|id| !new.contains(id)) {
                    foreign.unlink(*id, via, record.eid())?;
                }
                for id in new.iter().filter(|id| !old.contains(id)) {
                    foreign.link(*id, via, record.eid())?;
                }
            }
            Ok(())
        });
        self.invalidate();
        result?;

        let mut data = record.data().clone();
        merge_fields(&mut data, &changed);
        let updated = Record::new(self.model(), record.eid(), data);
        info!(
            model = self.model(),
            eid = updated.eid(),
            changed = ?changes.keys().collect::<Vec<_>>(),
            "updated record"
        );
        self.def.hooks().after_update(self, &updated, &changes)?;
        Ok(changes)
    }

    /// Delete every record matching `query`, returning how many were deleted.
    ///
    /// Each record is deleted in its own transaction: `on_delete`, then
    /// back-reference removal, then the record itself.
    ///
    /// # Errors
    ///
    /// Returns the first hook veto or storage error; records deleted before
    /// it stay deleted.
    pub fn delete(&self, query: &Query) -> Result<usize> {
        let records = self.search(query)?;
        for record in &records {
            let result = self.level.transaction(|| {
                self.def.hooks().on_delete(self, record)?;
                for (attribute, assoc) in self.schema().associations() {
                    let Some(via) = assoc.via else { continue };
                    let foreign = self.for_model(assoc.model)?;
                    for id in record.ids(attribute.name()) {
                        foreign.unlink(id, via, record.eid())?;
                    }
                }
                self.level
                    .remove(self.table(), &Query::Eid(record.eid()))?;
                Ok(())
            });
            self.invalidate();
            result?;
            info!(model = self.model(), eid = record.eid(), name = %record.label(), "deleted record");
        }
        Ok(records.len())
    }

    /// Records matching `query`, ordered by id. Key values are coerced to
    /// attribute types first (so `"3"` finds id 3).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown attributes or uncoercible
    /// values, or a storage error.
    pub fn search(&self, query: &Query) -> Result<Vec<Record>> {
        let query = self.coerce_query(query)?;
        Ok(self
            .level
            .search(self.table(), &query)?
            .into_iter()
            .map(|stored| Record::from_stored(self.model(), stored))
            .collect())
    }

    /// First record matching `query`.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub fn one(&self, query: &Query) -> Result<Option<Record>> {
        Ok(self.search(query)?.into_iter().next())
    }

    /// Resolve `query` to one record.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub fn lookup(&self, query: &Query) -> Result<Lookup> {
        Ok(Lookup::from_matches(self.search(query)?))
    }

    /// Resolve a record by its `name` attribute.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub fn by_name(&self, name: &str) -> Result<Lookup> {
        self.lookup(&Query::key("name", name))
    }

    /// Record by id, through the session cache.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level cannot be read.
    pub fn get(&self, eid: Eid) -> Result<Option<Record>> {
        let key = RecordKey {
            level: self.level.name(),
            table: self.table(),
            eid,
        };
        self.session.cache().get_or_load(key, || {
            Ok(self
                .level
                .get(self.table(), &Query::Eid(eid))?
                .map(|stored| Record::from_stored(self.model(), stored)))
        })
    }

    /// Every record of this model.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level cannot be read.
    pub fn all(&self) -> Result<Vec<Record>> {
        self.search(&Query::All)
    }

    /// Number of records.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the level cannot be read.
    pub fn count(&self) -> Result<usize> {
        self.level.count(self.table())
    }

    /// True if any record matches.
    ///
    /// # Errors
    ///
    /// Same as [`search`](Self::search).
    pub fn exists(&self, query: &Query) -> Result<bool> {
        Ok(!self.search(query)?.is_empty())
    }

    /// Resolve attribute `attr` of `record`.
    ///
    /// Plain attributes give [`Populated::Scalar`]. References give the
    /// referenced record(s); with `context`, those records additionally have
    /// their own references replaced by the referenced documents (one level
    /// deep, each carrying an `eid` field).
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] for an unknown attribute
    /// - [`Error::Internal`] for a reference to a missing record
    pub fn populate(&self, record: &Record, attr: &str, context: bool) -> Result<Populated> {
        let attribute = self.schema().get(attr).ok_or_else(|| {
            Error::configuration(
                format!("{} has no attribute '{attr}'", self.model()),
                Vec::<String>::new(),
            )
        })?;
        let Some(assoc) = attribute.association() else {
            return Ok(Populated::Scalar(
                record.get(attr).cloned().unwrap_or(Value::Null),
            ));
        };
        let foreign = self.for_model(assoc.model)?;
        let fetch = |id: Eid| -> Result<Record> {
            let found = foreign.get(id)?.ok_or_else(|| {
                Error::Internal(format!(
                    "{} '{}' attribute '{attr}' references missing {} #{id}",
                    self.model(),
                    record.label(),
                    assoc.model
                ))
            })?;
            if context {
                foreign.embed(&found)
            } else {
                Ok(found)
            }
        };
        if attribute.is_collection() {
            let records = record
                .ids(attr)
                .into_iter()
                .map(fetch)
                .collect::<Result<Vec<_>>>()?;
            Ok(Populated::Many(records))
        } else {
            match record.id(attr) {
                Some(id) => Ok(Populated::One(fetch(id)?)),
                None => Ok(Populated::Scalar(Value::Null)),
            }
        }
    }

    fn embed(&self, record: &Record) -> Result<Record> {
        let mut data = record.data().clone();
        for (attribute, assoc) in self.schema().associations() {
            let ids = record.ids(attribute.name());
            if ids.is_empty() {
                continue;
            }
            let foreign = self.for_model(assoc.model)?;
            let mut docs = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(found) = foreign.get(id)? {
                    let mut doc = found.into_data();
                    doc.insert("eid".to_string(), Value::from(id));
                    docs.push(Value::Object(doc));
                }
            }
            let value = if attribute.is_collection() {
                Value::Array(docs)
            } else {
                docs.into_iter().next().unwrap_or(Value::Null)
            };
            data.insert(attribute.name().to_string(), value);
        }
        Ok(Record::new(record.model(), record.eid(), data))
    }
}
