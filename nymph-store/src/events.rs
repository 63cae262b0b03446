//! Events published by a [`Nymph`](crate::Nymph) context.
//!
//! Every context handle carries an [`InstanceId`]. Starting a transaction
//! creates a child instance, so a listener can tell which mutations belong
//! to which (possibly nested) transaction and hold them back until the
//! outermost one commits.

use nymph_model::{Entity, Guid};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one context handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// A successful save or delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub guid: Guid,
    pub etype: String,
    /// The entity as stored. `None` for deletes.
    pub entity: Option<Entity>,
}

/// Store lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Mutation {
        instance: InstanceId,
        mutation: Mutation,
    },
    TransactionStarted {
        instance: InstanceId,
        parent: InstanceId,
        name: String,
    },
    TransactionCommitted {
        instance: InstanceId,
        name: String,
    },
    TransactionRolledBack {
        instance: InstanceId,
        name: String,
    },
}

impl StoreEvent {
    /// The context handle that produced the event.
    pub fn instance(&self) -> InstanceId {
        match self {
            Self::Mutation { instance, .. }
            | Self::TransactionStarted { instance, .. }
            | Self::TransactionCommitted { instance, .. }
            | Self::TransactionRolledBack { instance, .. } => *instance,
        }
    }
}
