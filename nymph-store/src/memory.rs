//! In-memory scan-and-filter driver.
//!
//! Answers queries with the matcher instead of SQL: `qref` clauses are
//! translated by running their nested query first, every stored entity of
//! the etype is matched, and the result is sorted and paged with the same
//! ordering the SQL compiler emits. Transactions keep an undo log of the
//! rows and unique keys they touch.

use async_trait::async_trait;
use nymph_model::{ClassRegistry, Entity, Guid, Query, ReturnKind};
use nymph_query::{matches, sort_entities, translate_qrefs};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::driver::{Driver, QueryOutput, TransactionStack};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct StoredEntity {
    cdate: f64,
    mdate: f64,
    tags: BTreeSet<String>,
    data: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct Table {
    entities: BTreeMap<Guid, StoredEntity>,
    uniques: HashMap<String, Guid>,
}

/// One reversible change made while a transaction was open.
#[derive(Debug)]
enum Undo {
    Table(String),
    Entity {
        etype: String,
        guid: Guid,
        previous: Option<StoredEntity>,
    },
    Unique {
        etype: String,
        unique: String,
        previous: Option<Guid>,
    },
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    transactions: TransactionStack,
    undo: Vec<Undo>,
    /// Undo log length when each open level started, outermost first.
    marks: Vec<usize>,
}

impl State {
    fn record(&mut self, undo: Undo) {
        if !self.marks.is_empty() {
            self.undo.push(undo);
        }
    }

    fn table(&mut self, etype: &str) -> &mut Table {
        if !self.tables.contains_key(etype) {
            self.record(Undo::Table(etype.to_string()));
        }
        self.tables.entry(etype.to_string()).or_default()
    }

    fn put_entity(&mut self, etype: &str, guid: Guid, entity: Option<StoredEntity>) -> bool {
        let table = self.table(etype);
        let previous = match entity {
            Some(entity) => table.entities.insert(guid, entity),
            None => table.entities.remove(&guid),
        };
        let existed = previous.is_some();
        self.record(Undo::Entity {
            etype: etype.to_string(),
            guid,
            previous,
        });
        existed
    }

    fn put_unique(&mut self, etype: &str, unique: &str, owner: Option<Guid>) {
        let table = self.table(etype);
        let previous = match owner {
            Some(owner) => table.uniques.insert(unique.to_string(), owner),
            None => table.uniques.remove(unique),
        };
        self.record(Undo::Unique {
            etype: etype.to_string(),
            unique: unique.to_string(),
            previous,
        });
    }

    /// Replaces the unique keys owned by `guid` with `uniques`.
    fn claim_uniques(&mut self, etype: &str, guid: Guid, uniques: &[String]) {
        let owned: Vec<String> = self
            .tables
            .get(etype)
            .map(|table| {
                table
                    .uniques
                    .iter()
                    .filter(|(_, owner)| **owner == guid)
                    .map(|(unique, _)| unique.clone())
                    .collect()
            })
            .unwrap_or_default();
        for unique in owned.iter().filter(|u| !uniques.contains(u)) {
            self.put_unique(etype, unique, None);
        }
        for unique in uniques.iter().filter(|u| !owned.contains(u)) {
            self.put_unique(etype, unique, Some(guid));
        }
    }

    fn undo_to(&mut self, mark: usize) {
        for undo in self.undo.split_off(mark).into_iter().rev() {
            match undo {
                Undo::Table(etype) => {
                    self.tables.remove(&etype);
                }
                Undo::Entity {
                    etype,
                    guid,
                    previous,
                } => {
                    let table = self.tables.entry(etype).or_default();
                    match previous {
                        Some(entity) => table.entities.insert(guid, entity),
                        None => table.entities.remove(&guid),
                    };
                }
                Undo::Unique {
                    etype,
                    unique,
                    previous,
                } => {
                    let table = self.tables.entry(etype).or_default();
                    match previous {
                        Some(owner) => table.uniques.insert(unique, owner),
                        None => table.uniques.remove(&unique),
                    };
                }
            }
        }
    }
}

/// [`Driver`] keeping everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn select(state: &State, query: &Query, classes: &ClassRegistry) -> StoreResult<Vec<Entity>> {
    let etype = classes.etype_of(&query.options.class)?;
    let selectors = translate_qrefs(&query.selectors, &mut |child: &Query| {
        select(state, child, classes).map(|found| found.iter().filter_map(Entity::guid).collect())
    })?;

    let mut found = Vec::new();
    if let Some(table) = state.tables.get(etype) {
        for (guid, stored) in &table.entities {
            let entity = Entity::from_storage(
                query.options.class.as_str(),
                *guid,
                stored.cdate,
                stored.mdate,
                stored.tags.clone(),
                stored.data.clone(),
            );
            if matches(&entity, &selectors)? {
                found.push(entity);
            }
        }
    }
    sort_entities(&mut found, &query.options.sort, query.options.reverse);

    let offset = query.options.offset.map_or(0, |o| usize::try_from(o).unwrap_or(usize::MAX));
    let limit = query.options.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
    Ok(found.into_iter().skip(offset).take(limit).collect())
}

fn check_uniques(table: &Table, etype: &str, guid: Guid, uniques: &[String]) -> StoreResult<()> {
    for unique in uniques {
        if table.uniques.get(unique).is_some_and(|owner| *owner != guid) {
            return Err(StoreError::EntityUniqueConstraint {
                etype: etype.to_string(),
                unique: unique.clone(),
            });
        }
    }
    Ok(())
}

fn stored(entity: &Entity, cdate: f64, mdate: f64) -> StoredEntity {
    StoredEntity {
        cdate,
        mdate,
        tags: entity.tags().clone(),
        data: entity.data().clone(),
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn query(&self, query: &Query, classes: &ClassRegistry) -> StoreResult<QueryOutput> {
        let state = self.state();
        let found = select(&state, query, classes)?;
        debug!(class = %query.options.class, found = found.len(), "memory query");
        Ok(match query.options.return_kind {
            ReturnKind::Entity => QueryOutput::Entities(found),
            ReturnKind::Guid => QueryOutput::Guids(found.iter().filter_map(Entity::guid).collect()),
            ReturnKind::Count => QueryOutput::Count(found.len() as u64),
        })
    }

    async fn create_tables(&self, etype: &str) -> StoreResult<()> {
        nymph_model::validate_etype(etype)?;
        self.state().table(etype);
        Ok(())
    }

    async fn insert(&self, etype: &str, entity: &Entity, uniques: &[String]) -> StoreResult<()> {
        let (Some(guid), Some(cdate), Some(mdate)) = (entity.guid(), entity.cdate(), entity.mdate())
        else {
            return Err(StoreError::InvalidParameters(
                "entity is missing guid, cdate or mdate".into(),
            ));
        };
        let mut state = self.state();
        if let Some(table) = state.tables.get(etype) {
            check_uniques(table, etype, guid, uniques)?;
        }
        state.claim_uniques(etype, guid, uniques);
        state.put_entity(etype, guid, Some(stored(entity, cdate, mdate)));
        Ok(())
    }

    async fn update(
        &self,
        etype: &str,
        entity: &Entity,
        known_mdate: f64,
        uniques: &[String],
    ) -> StoreResult<bool> {
        let (Some(guid), Some(mdate)) = (entity.guid(), entity.mdate()) else {
            return Err(StoreError::InvalidParameters(
                "entity is missing guid or mdate".into(),
            ));
        };
        let mut state = self.state();
        let Some(table) = state.tables.get(etype) else {
            return Ok(false);
        };
        let Some(current) = table.entities.get(&guid) else {
            return Ok(false);
        };
        if current.mdate > known_mdate {
            return Ok(false);
        }
        let cdate = current.cdate;
        check_uniques(table, etype, guid, uniques)?;
        state.claim_uniques(etype, guid, uniques);
        state.put_entity(etype, guid, Some(stored(entity, cdate, mdate)));
        Ok(true)
    }

    async fn delete(&self, etype: &str, guid: Guid) -> StoreResult<bool> {
        let mut state = self.state();
        let stored = state
            .tables
            .get(etype)
            .is_some_and(|table| table.entities.contains_key(&guid));
        if !stored {
            return Ok(false);
        }
        state.claim_uniques(etype, guid, &[]);
        Ok(state.put_entity(etype, guid, None))
    }

    async fn start_transaction(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state();
        state.transactions.push(name)?;
        let mark = state.undo.len();
        state.marks.push(mark);
        Ok(())
    }

    async fn commit(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state();
        let (index, _) = state.transactions.pop(name)?;
        state.marks.truncate(index);
        if state.marks.is_empty() {
            state.undo.clear();
        }
        Ok(())
    }

    async fn rollback(&self, name: &str) -> StoreResult<()> {
        let mut state = self.state();
        let (index, _) = state.transactions.pop(name)?;
        if let Some(&mark) = state.marks.get(index) {
            state.undo_to(mark);
        }
        state.marks.truncate(index);
        Ok(())
    }

    async fn in_transaction(&self) -> bool {
        !self.state().transactions.is_empty()
    }
}
