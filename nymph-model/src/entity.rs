use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::reference::{EntityRef, Reference};
use crate::{Error, Guid};

/// Property names that map onto the entity row itself and can never be
/// stored as data.
pub const RESERVED_NAMES: [&str; 4] = ["guid", "cdate", "mdate", "tags"];

/// A tagged record of named JSON properties.
///
/// `guid`, `cdate` and `mdate` are maintained by the store: `guid` is set
/// exactly when the entity has been persisted. Every write through
/// [`Entity::set`], [`Entity::unset`] or the tag methods records the touched
/// name in the dirty set until the next successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    guid: Option<Guid>,
    cdate: Option<f64>,
    mdate: Option<f64>,
    class: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    #[serde(default)]
    data: BTreeMap<String, Value>,
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl Entity {
    /// Creates an unsaved entity of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            guid: None,
            cdate: None,
            mdate: None,
            class: class.into(),
            tags: BTreeSet::new(),
            data: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Rebuilds a persisted entity from storage. The dirty set starts empty.
    pub fn from_storage(
        class: impl Into<String>,
        guid: Guid,
        cdate: f64,
        mdate: f64,
        tags: BTreeSet<String>,
        data: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            guid: Some(guid),
            cdate: Some(cdate),
            mdate: Some(mdate),
            class: class.into(),
            tags,
            data,
            dirty: BTreeSet::new(),
        }
    }

    pub fn guid(&self) -> Option<Guid> {
        self.guid
    }

    pub fn cdate(&self) -> Option<f64> {
        self.cdate
    }

    pub fn mdate(&self) -> Option<f64> {
        self.mdate
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Records a successful write. Called by the store only.
    pub fn mark_saved(&mut self, guid: Guid, cdate: f64, mdate: f64) {
        self.guid = Some(guid);
        self.cdate = Some(cdate);
        self.mdate = Some(mdate);
        self.dirty.clear();
    }

    /// Forgets the persisted identity after a delete.
    pub fn mark_deleted(&mut self) {
        self.guid = None;
        self.cdate = None;
        self.mdate = None;
    }

    // ── Data ─────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.data.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.data.get(name).and_then(Value::as_bool)
    }

    pub fn has(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Sets a property. Reserved names are rejected.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<(), Error> {
        let name = name.into();
        if RESERVED_NAMES.contains(&name.as_str()) {
            return Err(Error::InvalidParameters(format!(
                "`{name}` is maintained by the store and cannot be set"
            )));
        }
        self.data.insert(name.clone(), value.into());
        self.dirty.insert(name);
        Ok(())
    }

    /// Removes a property, returning its old value.
    pub fn unset(&mut self, name: &str) -> Option<Value> {
        let old = self.data.remove(name);
        if old.is_some() {
            self.dirty.insert(name.to_string());
        }
        old
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    // ── References ───────────────────────────────────────────────

    /// Returns this entity as a reference, if it has been saved.
    pub fn reference(&self) -> Option<Reference> {
        self.guid.map(|guid| Reference::new(guid, self.class.clone()))
    }

    /// Stores a reference to `target` under `name`.
    pub fn set_reference(&mut self, name: impl Into<String>, target: &Entity) -> Result<(), Error> {
        let reference = target.reference().ok_or_else(|| {
            Error::InvalidParameters("cannot reference an entity that was never saved".into())
        })?;
        self.set(name, reference.to_value())
    }

    /// Stores a list of references under `name`.
    pub fn set_references(&mut self, name: impl Into<String>, targets: &[&Entity]) -> Result<(), Error> {
        let mut values = Vec::with_capacity(targets.len());
        for target in targets {
            let reference = target.reference().ok_or_else(|| {
                Error::InvalidParameters("cannot reference an entity that was never saved".into())
            })?;
            values.push(reference.to_value());
        }
        self.set(name, Value::Array(values))
    }

    /// Reads a single reference property as an unresolved handle.
    pub fn reference_of(&self, name: &str) -> Option<EntityRef> {
        self.data
            .get(name)
            .and_then(Reference::from_value)
            .map(EntityRef::Unresolved)
    }

    /// Reads a list-of-references property. Non-reference items are skipped.
    pub fn references_of(&self, name: &str) -> Vec<EntityRef> {
        match self.data.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Reference::from_value)
                .map(EntityRef::Unresolved)
                .collect(),
            _ => Vec::new(),
        }
    }

    // ── Tags ─────────────────────────────────────────────────────

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Adds tags. Tags may not be empty or contain a comma.
    pub fn add_tag(&mut self, tag: impl Into<String>) -> Result<(), Error> {
        let tag = tag.into();
        validate_tag(&tag)?;
        if self.tags.insert(tag) {
            self.dirty.insert("tags".to_string());
        }
        Ok(())
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let removed = self.tags.remove(tag);
        if removed {
            self.dirty.insert("tags".to_string());
        }
        removed
    }

    // ── Dirty tracking ───────────────────────────────────────────

    /// Names written since the last save (`"tags"` for tag changes).
    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Checks the invariants the store relies on before a write.
    pub fn validate_for_save(&self) -> Result<(), Error> {
        if let Some(name) = self.data.keys().find(|n| RESERVED_NAMES.contains(&n.as_str())) {
            return Err(Error::InvalidParameters(format!("reserved property name `{name}`")));
        }
        if let Some(tag) = self.tags.iter().find(|t| t.is_empty() || t.contains(',')) {
            return Err(Error::InvalidParameters(format!("invalid tag `{tag}`")));
        }
        if self.guid.is_some() && self.mdate.is_none() {
            return Err(Error::InvalidParameters("persisted entity without mdate".into()));
        }
        Ok(())
    }
}

/// Tags are stored comma-joined, so a tag can be neither empty nor hold a
/// comma.
pub fn validate_tag(tag: &str) -> Result<(), Error> {
    if tag.is_empty() || tag.contains(',') {
        return Err(Error::InvalidParameters(format!("invalid tag `{tag}`")));
    }
    Ok(())
}
