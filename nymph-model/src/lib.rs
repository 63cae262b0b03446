//! Core data model for Nymph.
//!
//! Defines the types every other Nymph crate depends on:
//! - [`Guid`]: 12-byte entity identifiers
//! - [`Entity`]: tags plus named JSON properties, with dirty tracking
//! - [`Reference`] / [`EntityRef`]: references to other entities, loaded or not
//! - [`Selector`], [`Options`], [`Query`]: the query algebra and its wire format
//! - [`ClassRegistry`] / [`EntityHandler`]: class name to etype mapping and save hooks

mod class;
mod entity;
mod guid;
mod query;
mod reference;
mod selector;
pub mod timestamp;

pub use class::{validate_etype, ClassRegistry, EntityClass, EntityHandler};
pub use entity::{validate_tag, Entity, RESERVED_NAMES};
pub use guid::{Guid, GUID_BYTES};
pub use query::{Options, Query, ReturnKind, SortBy};
pub use reference::{collect_references, EntityRef, Reference, REFERENCE_MARKER};
pub use selector::{Clause, Predicate, Selector, SelectorType};

use serde_json::Value;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or parsing model values.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid guid: {0}")]
    InvalidGuid(String),

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serialises JSON with object keys sorted at every level, so structurally
/// equal values always produce the same text.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
