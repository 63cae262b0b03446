//! Entity references and lazily resolved entity handles.

use serde_json::Value;

use crate::{Entity, Guid};

/// First element of the 3-tuple that stands in for an entity inside data.
pub const REFERENCE_MARKER: &str = "nymph_entity_reference";

/// A pointer to another entity: `["nymph_entity_reference", guid, class]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub guid: Guid,
    pub class: String,
}

impl Reference {
    pub fn new(guid: Guid, class: impl Into<String>) -> Self {
        Self {
            guid,
            class: class.into(),
        }
    }

    /// Encodes the reference as its JSON tuple.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(REFERENCE_MARKER.to_string()),
            Value::String(self.guid.to_hex()),
            Value::String(self.class.clone()),
        ])
    }

    /// Decodes a JSON tuple. Returns `None` for anything that is not a
    /// well-formed reference.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() != 3 || items[0].as_str() != Some(REFERENCE_MARKER) {
            return None;
        }
        let guid = Guid::parse(items[1].as_str()?).ok()?;
        let class = items[2].as_str()?.to_string();
        Some(Self { guid, class })
    }
}

/// Collects the GUIDs of every reference found anywhere inside `value`,
/// in document order and without duplicates.
pub fn collect_references(value: &Value) -> Vec<Guid> {
    let mut out = Vec::new();
    walk_references(value, &mut out);
    out
}

fn walk_references(value: &Value, out: &mut Vec<Guid>) {
    if let Some(reference) = Reference::from_value(value) {
        if !out.contains(&reference.guid) {
            out.push(reference.guid);
        }
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|v| walk_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| walk_references(v, out)),
        _ => {}
    }
}

/// An entity handle that is either loaded or still a bare reference.
///
/// Data is only reachable through [`EntityRef::loaded`]; an unresolved handle
/// has to be resolved against a store first.
#[derive(Debug, Clone)]
pub enum EntityRef {
    Loaded(Box<Entity>),
    Unresolved(Reference),
}

impl EntityRef {
    /// GUID of the target, if known. A loaded entity that was never saved
    /// has none.
    pub fn guid(&self) -> Option<Guid> {
        match self {
            Self::Loaded(entity) => entity.guid(),
            Self::Unresolved(reference) => Some(reference.guid),
        }
    }

    pub fn class(&self) -> &str {
        match self {
            Self::Loaded(entity) => entity.class(),
            Self::Unresolved(reference) => &reference.class,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn loaded(&self) -> Option<&Entity> {
        match self {
            Self::Loaded(entity) => Some(entity),
            Self::Unresolved(_) => None,
        }
    }

    pub fn into_loaded(self) -> Option<Entity> {
        match self {
            Self::Loaded(entity) => Some(*entity),
            Self::Unresolved(_) => None,
        }
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        Self::Loaded(Box::new(entity))
    }
}

impl From<Reference> for EntityRef {
    fn from(reference: Reference) -> Self {
        Self::Unresolved(reference)
    }
}
