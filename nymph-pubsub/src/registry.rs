//! Bookkeeping of live queries: who is subscribed to what, and the cached
//! result of every tracked query.
//!
//! One entry exists per `(etype, query key)` and is shared by every
//! connection subscribed to that query. Entries created for a `qref`
//! sub-query record the entries they back in `qref_parents`; an entry is
//! dropped as soon as it has neither subscribers nor parents, and dropping
//! it releases its own children in turn.

use nymph_model::{Guid, Query};
use std::collections::{BTreeSet, HashMap};

use crate::protocol::ConnectionId;

/// Registry key of a tracked query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    pub etype: String,
    /// Canonical serialisation of the query.
    pub query: String,
}

/// How one connection follows a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Modes {
    pub events: bool,
    pub count: bool,
}

impl Modes {
    fn set(&mut self, count: bool, on: bool) {
        if count {
            self.count = on;
        } else {
            self.events = on;
        }
    }

    fn is_empty(self) -> bool {
        !self.events && !self.count
    }
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub query: Query,
    /// Matching guids, in query order as of the last full run.
    pub current: Vec<Guid>,
    /// Direct subscribers. Only these receive events.
    pub subscribers: HashMap<ConnectionId, Modes>,
    pub qref_parents: BTreeSet<QueryKey>,
    pub children: Vec<QueryKey>,
}

impl Entry {
    pub fn new(query: Query, current: Vec<Guid>, children: Vec<QueryKey>) -> Self {
        Self {
            query,
            current,
            subscribers: HashMap::new(),
            qref_parents: BTreeSet::new(),
            children,
        }
    }

    fn is_orphan(&self) -> bool {
        self.subscribers.is_empty() && self.qref_parents.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: HashMap<String, HashMap<String, Entry>>,
}

impl Registry {
    pub fn get(&self, key: &QueryKey) -> Option<&Entry> {
        self.entries.get(&key.etype)?.get(&key.query)
    }

    pub fn get_mut(&mut self, key: &QueryKey) -> Option<&mut Entry> {
        self.entries.get_mut(&key.etype)?.get_mut(&key.query)
    }

    pub fn insert(&mut self, key: QueryKey, entry: Entry) {
        self.entries
            .entry(key.etype)
            .or_default()
            .insert(key.query, entry);
    }

    pub fn current(&self, key: &QueryKey) -> Option<&[Guid]> {
        self.get(key).map(|e| e.current.as_slice())
    }

    /// Every tracked query, sorted.
    pub fn keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self
            .entries
            .iter()
            .flat_map(|(etype, queries)| {
                queries.keys().map(|query| QueryKey {
                    etype: etype.clone(),
                    query: query.clone(),
                })
            })
            .collect();
        keys.sort();
        keys
    }

    /// Tracked queries over `etype`, children before the queries they back.
    pub fn keys_for_etype(&self, etype: &str) -> Vec<QueryKey> {
        let Some(queries) = self.entries.get(etype) else {
            return Vec::new();
        };
        let mut keys: Vec<(usize, QueryKey)> = queries
            .keys()
            .map(|query| {
                let key = QueryKey {
                    etype: etype.to_string(),
                    query: query.clone(),
                };
                (self.depth(&key), key)
            })
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Nesting depth: zero without `qref` children.
    fn depth(&self, key: &QueryKey) -> usize {
        self.get(key).map_or(0, |entry| {
            entry
                .children
                .iter()
                .map(|child| self.depth(child) + 1)
                .max()
                .unwrap_or(0)
        })
    }

    /// Adds a subscription mode for a connection. Returns `false` when the
    /// query is not tracked.
    pub fn attach(&mut self, key: &QueryKey, connection: ConnectionId, count: bool) -> bool {
        let Some(entry) = self.get_mut(key) else {
            return false;
        };
        entry
            .subscribers
            .entry(connection)
            .or_default()
            .set(count, true);
        true
    }

    /// Removes a subscription mode. Returns the keys that were dropped.
    pub fn detach(&mut self, key: &QueryKey, connection: ConnectionId, count: bool) -> Vec<QueryKey> {
        let Some(entry) = self.get_mut(key) else {
            return Vec::new();
        };
        if let Some(modes) = entry.subscribers.get_mut(&connection) {
            modes.set(count, false);
            if modes.is_empty() {
                entry.subscribers.remove(&connection);
            }
        }
        let mut dropped = Vec::new();
        self.collect(key, &mut dropped);
        dropped
    }

    /// Removes every subscription of a connection.
    pub fn detach_all(&mut self, connection: ConnectionId) -> Vec<QueryKey> {
        let held: Vec<QueryKey> = self
            .keys()
            .into_iter()
            .filter(|key| {
                self.get(key)
                    .is_some_and(|e| e.subscribers.contains_key(&connection))
            })
            .collect();
        let mut dropped = Vec::new();
        for key in held {
            if let Some(entry) = self.get_mut(&key) {
                entry.subscribers.remove(&connection);
            }
            self.collect(&key, &mut dropped);
        }
        dropped
    }

    /// Removes the link from `child` to `parent`, dropping the child if
    /// nothing else holds it.
    pub fn unlink(&mut self, child: &QueryKey, parent: &QueryKey) -> Vec<QueryKey> {
        if let Some(entry) = self.get_mut(child) {
            entry.qref_parents.remove(parent);
        }
        let mut dropped = Vec::new();
        self.collect(child, &mut dropped);
        dropped
    }

    fn collect(&mut self, key: &QueryKey, dropped: &mut Vec<QueryKey>) {
        if !self.get(key).is_some_and(Entry::is_orphan) {
            return;
        }
        let Some(entry) = self.remove(key) else {
            return;
        };
        dropped.push(key.clone());
        for child in &entry.children {
            if let Some(child_entry) = self.get_mut(child) {
                child_entry.qref_parents.remove(key);
            }
            self.collect(child, dropped);
        }
    }

    fn remove(&mut self, key: &QueryKey) -> Option<Entry> {
        let queries = self.entries.get_mut(&key.etype)?;
        let entry = queries.remove(&key.query);
        if queries.is_empty() {
            self.entries.remove(&key.etype);
        }
        entry
    }
}
