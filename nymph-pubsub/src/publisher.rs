//! The publisher: keeps live queries current and tells subscribers what
//! changed.
//!
//! Store events are consumed in order. Mutations made inside a transaction
//! are held back until it commits into a handle that is not itself in a
//! transaction, and dropped if it rolls back. Each dispatched mutation is
//! checked against every tracked query of its etype: the in-memory matcher
//! decides membership when every `qref` child is tracked, otherwise the
//! query is run again and the result diffed.

use futures::future::{BoxFuture, FutureExt};
use nymph_model::{Entity, Guid, Query, ReturnKind};
use nymph_query::{matches, translate_qrefs};
use nymph_store::{InstanceId, Mutation, MutationKind, Nymph, StoreEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{PubSubError, PubSubResult};
use crate::protocol::{
    ClientMessage, ConnectionId, Publication, PublishEvent, ServerMessage, Subscription,
};
use crate::registry::{Entry, Modes, QueryKey, Registry};

#[derive(Default)]
struct State {
    registry: Registry,
    connections: HashMap<ConnectionId, UnboundedSender<ServerMessage>>,
    uids: HashMap<String, HashSet<ConnectionId>>,
    /// Open transaction handles and the handle each was started from.
    open: HashMap<InstanceId, InstanceId>,
    /// Mutations held until their transaction commits.
    pending: HashMap<InstanceId, Vec<Mutation>>,
    /// Connections whose channel was found closed.
    dead: HashSet<ConnectionId>,
}

impl State {
    fn send(&mut self, connection: ConnectionId, message: ServerMessage) {
        let delivered = self
            .connections
            .get(&connection)
            .is_some_and(|tx| tx.send(message).is_ok());
        if !delivered {
            warn!(%connection, "subscriber channel closed");
            self.dead.insert(connection);
        }
    }

    fn remove_connection(&mut self, connection: ConnectionId) -> bool {
        let known = self.connections.remove(&connection).is_some();
        let dropped = self.registry.detach_all(connection);
        self.uids.retain(|_, subscribers| {
            subscribers.remove(&connection);
            !subscribers.is_empty()
        });
        debug!(%connection, dropped = dropped.len(), "connection removed");
        known
    }

    fn reap(&mut self) {
        let dead: Vec<ConnectionId> = self.dead.drain().collect();
        for connection in dead {
            self.remove_connection(connection);
        }
    }

    /// `instance` and every open transaction started beneath it, parents
    /// before children.
    fn descendants(&self, instance: InstanceId) -> Vec<InstanceId> {
        let mut found = vec![instance];
        let mut next = 0;
        while let Some(&current) = found.get(next) {
            let mut children: Vec<InstanceId> = self
                .open
                .iter()
                .filter(|(_, parent)| **parent == current)
                .map(|(child, _)| *child)
                .collect();
            children.sort();
            found.extend(children);
            next += 1;
        }
        found
    }
}

/// Changes to one query's result.
#[derive(Debug, Default)]
struct Diff {
    added: Vec<Entity>,
    updated: Vec<Entity>,
    removed: Vec<Guid>,
    before: usize,
    after: usize,
}

impl Diff {
    fn sized(before: usize) -> Self {
        Self {
            before,
            after: before,
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn membership_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    fn messages(&self, query: &str) -> Vec<ServerMessage> {
        let removed = self.removed.iter().map(|guid| ServerMessage::Removed {
            query: query.to_string(),
            removed: *guid,
        });
        let added = self.added.iter().filter_map(|entity| {
            Some(ServerMessage::Added {
                query: query.to_string(),
                added: entity.guid()?,
                data: entity.clone(),
            })
        });
        let updated = self.updated.iter().filter_map(|entity| {
            Some(ServerMessage::Updated {
                query: query.to_string(),
                updated: entity.guid()?,
                data: entity.clone(),
            })
        });
        removed.chain(added).chain(updated).collect()
    }
}

/// A `qref` child that is not tracked; its result has to come from the store.
struct Untracked;

struct Inner {
    nymph: Nymph,
    state: Mutex<State>,
}

/// Subscription registry and dispatcher for one store.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub fn new(nymph: Nymph) -> Self {
        Self {
            inner: Arc::new(Inner {
                nymph,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn nymph(&self) -> &Nymph {
        &self.inner.nymph
    }

    /// Feeds the store's events into [`Publisher::handle_store_event`] on a
    /// background task. The task runs until the handle is aborted.
    pub fn spawn(&self) -> JoinHandle<()> {
        let mut events = self.inner.nymph.events();
        let publisher = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                publisher.handle_store_event(event).await;
            }
            debug!("store event stream closed");
        })
    }

    // ── Connections ──────────────────────────────────────────────

    /// Registers a subscriber. Messages for it arrive on the receiver.
    pub async fn connect(&self) -> (ConnectionId, UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        self.inner.state.lock().await.connections.insert(connection, tx);
        info!(%connection, "subscriber connected");
        (connection, rx)
    }

    /// Drops a subscriber and everything it was subscribed to.
    pub async fn disconnect(&self, connection: ConnectionId) -> bool {
        let known = self.inner.state.lock().await.remove_connection(connection);
        if known {
            info!(%connection, "subscriber disconnected");
        }
        known
    }

    /// Parses and handles one JSON client message.
    pub async fn handle_text(&self, connection: ConnectionId, text: &str) -> PubSubResult<()> {
        let message = ClientMessage::parse(text)?;
        self.handle_message(connection, message).await
    }

    pub async fn handle_message(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
    ) -> PubSubResult<()> {
        match message {
            ClientMessage::Subscribe(subscription) => self.subscribe(connection, subscription).await,
            ClientMessage::Unsubscribe(subscription) => {
                self.unsubscribe(connection, subscription).await
            }
            ClientMessage::Publish(publication) => self.publish(publication).await,
        }
    }

    // ── Introspection ────────────────────────────────────────────

    /// Registry key for a query.
    pub fn key_for(&self, query: &Query) -> PubSubResult<QueryKey> {
        let etype = self.inner.nymph.classes().etype_of(&query.options.class)?;
        Ok(QueryKey {
            etype: etype.to_string(),
            query: query.key(),
        })
    }

    /// Every query currently tracked, including `qref` children.
    pub async fn tracked_queries(&self) -> Vec<QueryKey> {
        self.inner.state.lock().await.registry.keys()
    }

    /// Cached result of a tracked query.
    pub async fn current(&self, key: &QueryKey) -> Option<Vec<Guid>> {
        self.inner
            .state
            .lock()
            .await
            .registry
            .current(key)
            .map(<[Guid]>::to_vec)
    }

    // ── Subscriptions ────────────────────────────────────────────

    async fn subscribe(&self, connection: ConnectionId, subscription: Subscription) -> PubSubResult<()> {
        let mut state = self.inner.state.lock().await;
        if !state.connections.contains_key(&connection) {
            return Err(PubSubError::UnknownConnection(connection));
        }
        if let Some(uid) = subscription.uid {
            debug!(%connection, uid = %uid, "uid subscribed");
            state.uids.entry(uid).or_default().insert(connection);
            return Ok(());
        }

        let query = parse_query(subscription.query)?;
        let key = self.key_for(&query)?;
        let set = match self.track(&mut state, &key, &query, None).await? {
            Some(seeded) => seeded,
            None => {
                // Already tracked: bring the cached result up to date for the
                // existing subscribers before the new one joins.
                let (diff, fresh) = self.refresh(&mut state, &key, None).await?;
                let mut refreshed = HashSet::from([key.clone()]);
                self.deliver(&mut state, &key, diff, None, &mut refreshed)
                    .await?;
                fresh
            }
        };

        let message = if subscription.count {
            ServerMessage::Count {
                query: key.query.clone(),
                count: set.len() as u64,
            }
        } else {
            ServerMessage::Set {
                query: key.query.clone(),
                set,
            }
        };
        state.registry.attach(&key, connection, subscription.count);
        debug!(%connection, etype = %key.etype, count = subscription.count, "query subscribed");
        state.send(connection, message);
        state.reap();
        Ok(())
    }

    async fn unsubscribe(&self, connection: ConnectionId, subscription: Subscription) -> PubSubResult<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(uid) = subscription.uid {
            if let Some(subscribers) = state.uids.get_mut(&uid) {
                subscribers.remove(&connection);
                if subscribers.is_empty() {
                    state.uids.remove(&uid);
                }
            }
            return Ok(());
        }
        let query = parse_query(subscription.query)?;
        let key = self.key_for(&query)?;
        let dropped = state.registry.detach(&key, connection, subscription.count);
        debug!(%connection, etype = %key.etype, dropped = dropped.len(), "query unsubscribed");
        Ok(())
    }

    /// Starts tracking a query, and first every `qref` query inside it.
    /// An already tracked query only gains the parent link.
    ///
    /// A newly tracked top level query returns the entities its cached
    /// result was built from.
    fn track<'a>(
        &'a self,
        state: &'a mut State,
        key: &'a QueryKey,
        query: &'a Query,
        parent: Option<&'a QueryKey>,
    ) -> BoxFuture<'a, PubSubResult<Option<Vec<Entity>>>> {
        async move {
            if let Some(entry) = state.registry.get_mut(key) {
                if let Some(parent) = parent {
                    entry.qref_parents.insert(parent.clone());
                }
                return Ok(None);
            }
            let mut children = Vec::new();
            match self.seed(state, key, query, parent.is_none(), &mut children).await {
                Ok((current, seeded)) => {
                    let mut entry = Entry::new(query.clone(), current, children);
                    if let Some(parent) = parent {
                        entry.qref_parents.insert(parent.clone());
                    }
                    debug!(etype = %key.etype, query = %key.query, "tracking query");
                    state.registry.insert(key.clone(), entry);
                    Ok(seeded)
                }
                Err(e) => {
                    for child in &children {
                        state.registry.unlink(child, key);
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn seed(
        &self,
        state: &mut State,
        key: &QueryKey,
        query: &Query,
        with_entities: bool,
        children: &mut Vec<QueryKey>,
    ) -> PubSubResult<(Vec<Guid>, Option<Vec<Entity>>)> {
        for (_, child) in query.qrefs() {
            let child_key = self.key_for(child)?;
            self.track(state, &child_key, child, Some(key)).await?;
            children.push(child_key);
        }
        let nymph = &self.inner.nymph;
        if with_entities {
            let entities = nymph
                .get_entities(&query.returning(ReturnKind::Entity))
                .await?
                .into_entities()?;
            let current = entities.iter().filter_map(Entity::guid).collect();
            Ok((current, Some(entities)))
        } else {
            let found = nymph.get_entities(&query.returning(ReturnKind::Guid)).await?;
            Ok((found.guids(), None))
        }
    }

    // ── Publishing ───────────────────────────────────────────────

    /// Applies one store event.
    pub async fn handle_store_event(&self, event: StoreEvent) {
        let mut state = self.inner.state.lock().await;
        match event {
            StoreEvent::TransactionStarted { instance, parent, .. } => {
                state.open.insert(instance, parent);
            }
            StoreEvent::Mutation { instance, mutation } => {
                if state.open.contains_key(&instance) {
                    state.pending.entry(instance).or_default().push(mutation);
                } else {
                    self.dispatch(&mut state, &mutation).await;
                }
            }
            StoreEvent::TransactionCommitted { instance, .. } => {
                // Nested transactions still open are committed with it.
                let parent = state.open.get(&instance).copied();
                let mut queued = Vec::new();
                for committed in state.descendants(instance) {
                    state.open.remove(&committed);
                    queued.extend(state.pending.remove(&committed).unwrap_or_default());
                }
                match parent {
                    Some(parent) if state.open.contains_key(&parent) => {
                        state.pending.entry(parent).or_default().extend(queued);
                    }
                    _ => {
                        debug!(%instance, mutations = queued.len(), "transaction committed, publishing");
                        for mutation in &queued {
                            self.dispatch(&mut state, mutation).await;
                        }
                    }
                }
            }
            StoreEvent::TransactionRolledBack { instance, .. } => {
                let mut discarded = 0;
                for doomed in state.descendants(instance) {
                    state.open.remove(&doomed);
                    discarded += state.pending.remove(&doomed).map_or(0, |m| m.len());
                }
                debug!(%instance, discarded, "transaction rolled back, discarding");
            }
        }
        state.reap();
    }

    async fn publish(&self, publication: Publication) -> PubSubResult<()> {
        let mut state = self.inner.state.lock().await;
        let kind = match publication.event {
            PublishEvent::Create => MutationKind::Create,
            PublishEvent::Update => MutationKind::Update,
            PublishEvent::Delete => MutationKind::Delete,
            _ => {
                relay_uid(&mut state, &publication)?;
                state.reap();
                return Ok(());
            }
        };
        let guid = publication
            .guid
            .ok_or_else(|| PubSubError::Protocol("entity publish needs a guid".into()))?;
        let etype = match (publication.etype, &publication.entity) {
            (Some(etype), _) => etype,
            (None, Some(entity)) => self.inner.nymph.classes().etype_of(entity.class())?.to_string(),
            (None, None) => {
                return Err(PubSubError::Protocol("entity publish needs an etype".into()));
            }
        };
        let mutation = Mutation {
            kind,
            guid,
            etype,
            entity: publication.entity,
        };
        debug!(guid = %mutation.guid, etype = %mutation.etype, ?kind, "remote publish");
        self.dispatch(&mut state, &mutation).await;
        state.reap();
        Ok(())
    }

    async fn dispatch(&self, state: &mut State, mutation: &Mutation) {
        let keys = state.registry.keys_for_etype(&mutation.etype);
        if keys.is_empty() {
            return;
        }
        debug!(
            guid = %mutation.guid,
            etype = %mutation.etype,
            kind = ?mutation.kind,
            queries = keys.len(),
            "dispatching mutation"
        );
        let mut refreshed = HashSet::new();
        for key in keys {
            if refreshed.contains(&key) {
                continue;
            }
            if let Err(e) = self.apply(state, &key, mutation, &mut refreshed).await {
                warn!(error = %e, etype = %key.etype, query = %key.query, "subscription update failed");
            }
        }
    }

    async fn apply(
        &self,
        state: &mut State,
        key: &QueryKey,
        mutation: &Mutation,
        refreshed: &mut HashSet<QueryKey>,
    ) -> PubSubResult<()> {
        let Some(entry) = state.registry.get(key) else {
            return Ok(());
        };
        let guid = mutation.guid;
        let was_member = entry.current.contains(&guid);
        let verdict = match (mutation.kind, &mutation.entity) {
            (MutationKind::Delete, _) => Some(false),
            (_, Some(entity)) if !entry.query.options.is_paged() => {
                self.match_cached(&state.registry, &entry.query, entity)?
            }
            _ => None,
        };

        let diff = match verdict {
            Some(is_member) => {
                let Some(entry) = state.registry.get_mut(key) else {
                    return Ok(());
                };
                let mut diff = Diff::sized(entry.current.len());
                match (was_member, is_member, &mutation.entity) {
                    (false, true, Some(entity)) => {
                        entry.current.push(guid);
                        diff.added.push(entity.clone());
                    }
                    (true, false, _) => {
                        entry.current.retain(|g| *g != guid);
                        diff.removed.push(guid);
                    }
                    (true, true, Some(entity)) => diff.updated.push(entity.clone()),
                    _ => {}
                }
                diff.after = entry.current.len();
                diff
            }
            None => {
                refreshed.insert(key.clone());
                self.refresh(state, key, Some(guid)).await?.0
            }
        };
        let touched = Some((mutation.etype.as_str(), guid));
        self.deliver(state, key, diff, touched, refreshed).await
    }

    /// Membership of `entity` decided from cached `qref` results, or `None`
    /// when a child query is not tracked.
    fn match_cached(
        &self,
        registry: &Registry,
        query: &Query,
        entity: &Entity,
    ) -> PubSubResult<Option<bool>> {
        let classes = self.inner.nymph.classes();
        let translated = translate_qrefs(&query.selectors, &mut |child: &Query| {
            let etype = classes.etype_of(&child.options.class).map_err(|_| Untracked)?;
            let key = QueryKey {
                etype: etype.to_string(),
                query: child.key(),
            };
            registry.current(&key).map(<[Guid]>::to_vec).ok_or(Untracked)
        });
        match translated {
            Ok(selectors) => Ok(Some(matches(entity, &selectors)?)),
            Err(Untracked) => Ok(None),
        }
    }

    /// Runs a tracked query again and diffs it against the cached result.
    /// `touched` is reported as updated when it stays in the result.
    /// Also returns the fresh result.
    async fn refresh(
        &self,
        state: &mut State,
        key: &QueryKey,
        touched: Option<Guid>,
    ) -> PubSubResult<(Diff, Vec<Entity>)> {
        let query = match state.registry.get(key) {
            Some(entry) => entry.query.returning(ReturnKind::Entity),
            None => return Ok((Diff::default(), Vec::new())),
        };
        let fresh = self.inner.nymph.get_entities(&query).await?.into_entities()?;
        let Some(entry) = state.registry.get_mut(key) else {
            return Ok((Diff::default(), fresh));
        };

        let ordered: Vec<Guid> = fresh.iter().filter_map(Entity::guid).collect();
        let before: HashSet<Guid> = entry.current.iter().copied().collect();
        let after: HashSet<Guid> = ordered.iter().copied().collect();
        let mut diff = Diff::sized(entry.current.len());
        diff.removed = entry
            .current
            .iter()
            .filter(|g| !after.contains(g))
            .copied()
            .collect();
        for entity in &fresh {
            match entity.guid() {
                Some(g) if !before.contains(&g) => diff.added.push(entity.clone()),
                Some(g) if Some(g) == touched => diff.updated.push(entity.clone()),
                _ => {}
            }
        }
        entry.current = ordered;
        diff.after = entry.current.len();
        Ok((diff, fresh))
    }

    /// Sends a diff to the query's subscribers, then re-evaluates the
    /// queries that use it through `qref` when its membership changed.
    /// `touched` is the etype and guid of the mutated entity, if any.
    fn deliver<'a>(
        &'a self,
        state: &'a mut State,
        key: &'a QueryKey,
        diff: Diff,
        touched: Option<(&'a str, Guid)>,
        refreshed: &'a mut HashSet<QueryKey>,
    ) -> BoxFuture<'a, PubSubResult<()>> {
        async move {
            if diff.is_empty() {
                return Ok(());
            }
            let Some(entry) = state.registry.get(key) else {
                return Ok(());
            };
            let subscribers: Vec<(ConnectionId, Modes)> =
                entry.subscribers.iter().map(|(c, m)| (*c, *m)).collect();
            let parents: Vec<QueryKey> = if diff.membership_changed() {
                entry.qref_parents.iter().cloned().collect()
            } else {
                Vec::new()
            };

            let messages = diff.messages(&key.query);
            for (connection, modes) in subscribers {
                if modes.events {
                    for message in &messages {
                        state.send(connection, message.clone());
                    }
                }
                if modes.count && diff.before != diff.after {
                    state.send(
                        connection,
                        ServerMessage::Count {
                            query: key.query.clone(),
                            count: diff.after as u64,
                        },
                    );
                }
            }

            for parent in parents {
                if !refreshed.insert(parent.clone()) {
                    continue;
                }
                let parent_touched = touched
                    .filter(|(etype, _)| *etype == parent.etype)
                    .map(|(_, guid)| guid);
                let (parent_diff, _) = self.refresh(state, &parent, parent_touched).await?;
                self.deliver(state, &parent, parent_diff, touched, refreshed)
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }
}

fn parse_query(text: Option<String>) -> PubSubResult<Query> {
    let text = text.ok_or_else(|| {
        PubSubError::Protocol("subscription needs a query or a uid".into())
    })?;
    Ok(Query::parse(&text)?)
}

fn relay_uid(state: &mut State, publication: &Publication) -> PubSubResult<()> {
    let names: Vec<&String> = match publication.event {
        PublishEvent::RenameUid => match (&publication.old_name, &publication.new_name) {
            (Some(old_name), Some(new_name)) => vec![old_name, new_name],
            _ => {
                return Err(PubSubError::Protocol(
                    "renameUID needs oldName and newName".into(),
                ));
            }
        },
        _ => match &publication.name {
            Some(name) => vec![name],
            None => return Err(PubSubError::Protocol("uid publish needs a name".into())),
        },
    };
    for uid in names {
        let targets: Vec<ConnectionId> = state
            .uids
            .get(uid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        debug!(uid = %uid, event = ?publication.event, subscribers = targets.len(), "relaying uid");
        for connection in targets {
            state.send(
                connection,
                ServerMessage::Uid {
                    uid: uid.clone(),
                    event: publication.event,
                    value: publication.value,
                    name: publication.name.clone(),
                    old_name: publication.old_name.clone(),
                    new_name: publication.new_name.clone(),
                },
            );
        }
    }
    Ok(())
}
