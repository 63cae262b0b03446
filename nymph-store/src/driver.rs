//! The storage backend seam.

use async_trait::async_trait;
use nymph_model::{ClassRegistry, Entity, Guid, Query};

use crate::error::{StoreError, StoreResult};

/// Result of a query, shaped by its `return` option.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Entities(Vec<Entity>),
    Guids(Vec<Guid>),
    Count(u64),
}

impl QueryOutput {
    /// The GUIDs of the result, in order. Empty for counts.
    pub fn guids(&self) -> Vec<Guid> {
        match self {
            Self::Entities(entities) => entities.iter().filter_map(Entity::guid).collect(),
            Self::Guids(guids) => guids.clone(),
            Self::Count(_) => Vec::new(),
        }
    }

    /// Number of results.
    pub fn len(&self) -> u64 {
        match self {
            Self::Entities(entities) => entities.len() as u64,
            Self::Guids(guids) => guids.len() as u64,
            Self::Count(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_entities(self) -> StoreResult<Vec<Entity>> {
        match self {
            Self::Entities(entities) => Ok(entities),
            _ => Err(StoreError::InvalidParameters(
                "query did not return entities".into(),
            )),
        }
    }
}

/// A storage backend.
///
/// Entities handed to `insert` and `update` already carry their final
/// `guid`, `cdate` and `mdate`. Transactions nest: the first
/// `start_transaction` opens a real transaction and later ones open named
/// savepoints. `commit`/`rollback` address a name and also end every
/// transaction opened after it.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs a query against the stored entities of `query.options.class`.
    async fn query(&self, query: &Query, classes: &ClassRegistry) -> StoreResult<QueryOutput>;

    /// Creates the tables for `etype` if they do not exist.
    async fn create_tables(&self, etype: &str) -> StoreResult<()>;

    /// Stores a new entity and its unique values.
    async fn insert(&self, etype: &str, entity: &Entity, uniques: &[String]) -> StoreResult<()>;

    /// Replaces a stored entity, provided its stored `mdate` is not newer
    /// than `known_mdate`. Returns `false` when the guard fails.
    async fn update(
        &self,
        etype: &str,
        entity: &Entity,
        known_mdate: f64,
        uniques: &[String],
    ) -> StoreResult<bool>;

    /// Removes an entity. Returns `false` when it did not exist.
    async fn delete(&self, etype: &str, guid: Guid) -> StoreResult<bool>;

    async fn start_transaction(&self, name: &str) -> StoreResult<()>;

    async fn commit(&self, name: &str) -> StoreResult<()>;

    async fn rollback(&self, name: &str) -> StoreResult<()>;

    async fn in_transaction(&self) -> bool;
}

/// Open transaction names, outermost first.
#[derive(Debug, Default)]
pub(crate) struct TransactionStack {
    names: Vec<String>,
}

/// What a driver has to do to open or close a transaction level.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TransactionStep {
    /// Depth zero: a real transaction.
    Outer,
    /// Nested: a savepoint with this name.
    Savepoint(String),
}

impl TransactionStack {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.names.len()
    }

    pub fn push(&mut self, name: &str) -> StoreResult<TransactionStep> {
        if name.is_empty() {
            return Err(StoreError::InvalidParameters(
                "transaction name is required".into(),
            ));
        }
        let step = if self.names.is_empty() {
            TransactionStep::Outer
        } else {
            TransactionStep::Savepoint(name.to_string())
        };
        self.names.push(name.to_string());
        Ok(step)
    }

    /// Ends the most recent level named `name` and everything above it.
    /// Returns the level index and what it was opened with.
    pub fn pop(&mut self, name: &str) -> StoreResult<(usize, TransactionStep)> {
        let index = self.names.iter().rposition(|n| n == name).ok_or_else(|| {
            StoreError::InvalidParameters(format!("no open transaction named `{name}`"))
        })?;
        self.names.truncate(index);
        let step = if index == 0 {
            TransactionStep::Outer
        } else {
            TransactionStep::Savepoint(name.to_string())
        };
        Ok((index, step))
    }
}
