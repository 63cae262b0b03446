use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::{Entity, Error};

/// Optional per-class hooks consulted by the store on every save.
///
/// Most classes need none of this: an entity class is just a name and an
/// etype. Implement it for validation or unique constraints.
pub trait EntityHandler: Send + Sync {
    /// Validate an entity before it is persisted.
    /// Return `Err(message)` to reject the write.
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        let _ = entity;
        Ok(())
    }

    /// Strings that must be unique across all entities of this etype.
    fn uniques(&self, entity: &Entity) -> Vec<String> {
        let _ = entity;
        Vec::new()
    }
}

/// A registered entity class.
#[derive(Clone)]
pub struct EntityClass {
    pub name: String,
    pub etype: String,
    handler: Option<Arc<dyn EntityHandler>>,
}

impl EntityClass {
    pub fn handler(&self) -> Option<&dyn EntityHandler> {
        self.handler.as_deref()
    }
}

impl fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityClass")
            .field("name", &self.name)
            .field("etype", &self.etype)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Maps class names to their storage etype and hooks.
///
/// Passed explicitly to the store and publisher; there is no global class
/// table.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<String, EntityClass>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class. Etypes name tables, so they are restricted to
    /// ASCII letters, digits and `_`.
    pub fn register(&mut self, name: impl Into<String>, etype: impl Into<String>) -> Result<(), Error> {
        self.insert(name.into(), etype.into(), None)
    }

    /// Registers a class together with its handler.
    pub fn register_with_handler(
        &mut self,
        name: impl Into<String>,
        etype: impl Into<String>,
        handler: Arc<dyn EntityHandler>,
    ) -> Result<(), Error> {
        self.insert(name.into(), etype.into(), Some(handler))
    }

    fn insert(
        &mut self,
        name: String,
        etype: String,
        handler: Option<Arc<dyn EntityHandler>>,
    ) -> Result<(), Error> {
        validate_etype(&etype)?;
        if name.is_empty() {
            return Err(Error::InvalidParameters("class name is empty".into()));
        }
        self.classes.insert(
            name.clone(),
            EntityClass {
                name,
                etype,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&EntityClass> {
        self.classes.get(name)
    }

    /// Resolves a class name to its etype.
    pub fn etype_of(&self, name: &str) -> Result<&str, Error> {
        self.classes
            .get(name)
            .map(|c| c.etype.as_str())
            .ok_or_else(|| Error::UnknownClass(name.to_string()))
    }

    /// Finds the class registered for an etype.
    pub fn class_for_etype(&self, etype: &str) -> Option<&EntityClass> {
        self.classes.values().find(|c| c.etype == etype)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Checks that an etype is safe to splice into a table name.
pub fn validate_etype(etype: &str) -> Result<(), Error> {
    if !etype.is_empty() && etype.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(())
    } else {
        Err(Error::InvalidParameters(format!("invalid etype `{etype}`")))
    }
}
