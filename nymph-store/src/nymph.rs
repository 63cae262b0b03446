//! The `Nymph` context: the entry point for reading and writing entities.

use nymph_model::{
    timestamp, ClassRegistry, Entity, EntityRef, Guid, Options, Predicate, Query, ReturnKind,
    Selector,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::driver::{Driver, QueryOutput};
use crate::error::{StoreError, StoreResult};
use crate::events::{InstanceId, Mutation, MutationKind, StoreEvent};

/// Savepoint wrapped around every save and delete.
const WRITE_SAVEPOINT: &str = "nymph-write";

/// How long a handle outside a transaction waits for it to finish.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    driver: Arc<dyn Driver>,
    classes: ClassRegistry,
    listeners: Mutex<Vec<UnboundedSender<StoreEvent>>>,
    /// Entities handed out by [`Nymph::resolve`], by guid.
    cache: Mutex<HashMap<Guid, Weak<Entity>>>,
    /// One permit: held for a single operation by a plain handle, or for
    /// the whole life of an outermost transaction.
    gate: Arc<Semaphore>,
    open: Mutex<OpenTransactions>,
}

/// Open transactions, outermost first. Each one was started from the one
/// before it, so they always form a single chain.
#[derive(Default)]
struct OpenTransactions {
    chain: Vec<(InstanceId, String)>,
    permit: Option<OwnedSemaphorePermit>,
}

/// Proof that a handle may touch the driver right now.
enum Access<'a> {
    Plain { _permit: SemaphorePermit<'a> },
    Transaction,
}

#[derive(Debug)]
struct Transaction {
    name: String,
    parent: InstanceId,
}

/// A handle on a store.
///
/// Cloning a handle is cheap and keeps the same [`InstanceId`].
/// [`Nymph::start_transaction`] returns a new handle with its own id whose
/// writes belong to that transaction.
///
/// While a transaction is open only the innermost transaction handle may
/// read or write. Plain handles wait for the outermost transaction to end,
/// up to the lock timeout, and then fail with [`StoreError::Busy`].
#[derive(Clone)]
pub struct Nymph {
    shared: Arc<Shared>,
    instance: InstanceId,
    transaction: Option<Arc<Transaction>>,
    lock_timeout: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Nymph {
    pub fn new(driver: Arc<dyn Driver>, classes: ClassRegistry) -> Self {
        info!(driver = driver.name(), classes = classes.len(), "nymph context created");
        Self {
            shared: Arc::new(Shared {
                driver,
                classes,
                listeners: Mutex::new(Vec::new()),
                cache: Mutex::new(HashMap::new()),
                gate: Arc::new(Semaphore::new(1)),
                open: Mutex::new(OpenTransactions::default()),
            }),
            instance: InstanceId::new(),
            transaction: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long this handle, and handles derived from it, wait for
    /// another handle's transaction before giving up.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.shared.classes
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.shared.driver
    }

    /// Name of the transaction this handle was started for, if any.
    pub fn transaction_name(&self) -> Option<&str> {
        self.transaction.as_deref().map(|t| t.name.as_str())
    }

    // ── Events ───────────────────────────────────────────────────

    /// Subscribes to store events from this handle and every handle
    /// derived from the same store.
    pub fn events(&self) -> UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    fn emit(&self, event: StoreEvent) {
        lock(&self.shared.listeners).retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ── Access ───────────────────────────────────────────────────

    fn busy(&self) -> StoreError {
        StoreError::Busy(format!(
            "a transaction held the store for more than {:?}",
            self.lock_timeout
        ))
    }

    async fn acquire(&self) -> StoreResult<SemaphorePermit<'_>> {
        tokio::time::timeout(self.lock_timeout, self.shared.gate.acquire())
            .await
            .map_err(|_| self.busy())?
            .map_err(|_| StoreError::Busy("store gate closed".into()))
    }

    /// Position of this handle's transaction in the open chain.
    fn open_position(&self, tx: &Transaction) -> StoreResult<usize> {
        let open = lock(&self.shared.open);
        open.chain
            .iter()
            .position(|(instance, _)| *instance == self.instance)
            .ok_or_else(|| {
                StoreError::InvalidParameters(format!("transaction `{}` is no longer open", tx.name))
            })
    }

    /// Checks that this handle may run an operation now, waiting for the
    /// store when this is a plain handle.
    async fn access(&self) -> StoreResult<Access<'_>> {
        let Some(tx) = self.transaction.as_deref() else {
            return Ok(Access::Plain {
                _permit: self.acquire().await?,
            });
        };
        let position = self.open_position(tx)?;
        let open = lock(&self.shared.open);
        match open.chain.get(position + 1) {
            None => Ok(Access::Transaction),
            Some((_, nested)) => Err(StoreError::InvalidParameters(format!(
                "transaction `{}` has an open nested transaction `{nested}`",
                tx.name
            ))),
        }
    }

    /// Closes this handle's transaction and every one nested in it.
    fn close(&self, position: usize) {
        let mut open = lock(&self.shared.open);
        open.chain.truncate(position);
        if position == 0 {
            open.permit = None;
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Runs a query. The output shape follows the query's `return` option.
    pub async fn get_entities(&self, query: &Query) -> StoreResult<QueryOutput> {
        self.shared.classes.etype_of(&query.options.class)?;
        let _access = self.access().await?;
        self.shared.driver.query(query, &self.shared.classes).await
    }

    /// First entity matching the query.
    pub async fn get_entity(&self, query: &Query) -> StoreResult<Option<Entity>> {
        let mut query = query.returning(ReturnKind::Entity);
        query.options.limit = Some(1);
        let entities = self.get_entities(&query).await?.into_entities()?;
        Ok(entities.into_iter().next())
    }

    pub async fn get_entity_by_guid(&self, class: &str, guid: Guid) -> StoreResult<Option<Entity>> {
        let query = Query::new(Options::new(class))
            .select(Selector::and().with(Predicate::Guid(guid)));
        self.get_entity(&query).await
    }

    /// Loads the entity behind a reference.
    ///
    /// Loaded handles are returned as they are. Unresolved ones are looked
    /// up in the instance cache first, then in the store.
    pub async fn resolve(&self, reference: &EntityRef) -> StoreResult<Arc<Entity>> {
        let (guid, class) = match reference {
            EntityRef::Loaded(entity) => return Ok(Arc::new((**entity).clone())),
            EntityRef::Unresolved(r) => (r.guid, r.class.as_str()),
        };
        let cached = lock(&self.shared.cache).get(&guid).and_then(Weak::upgrade);
        if let Some(entity) = cached {
            return Ok(entity);
        }
        let entity = self
            .get_entity_by_guid(class, guid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{class} {guid}")))?;
        let entity = Arc::new(entity);
        lock(&self.shared.cache).insert(guid, Arc::downgrade(&entity));
        Ok(entity)
    }

    fn evict(&self, guid: Guid) {
        let mut cache = lock(&self.shared.cache);
        cache.remove(&guid);
        cache.retain(|_, weak| weak.strong_count() > 0);
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Saves an entity.
    ///
    /// A new entity gets a guid and `cdate = mdate = now`. An existing one is
    /// only written when the stored `mdate` is not newer than the entity's;
    /// otherwise nothing changes and `Ok(false)` is returned. On success the
    /// entity's timestamps are updated and its dirty set cleared.
    pub async fn save(&self, entity: &mut Entity) -> StoreResult<bool> {
        entity.validate_for_save()?;
        let class = self
            .shared
            .classes
            .get(entity.class())
            .ok_or_else(|| nymph_model::Error::UnknownClass(entity.class().to_string()))?;
        let etype = class.etype.clone();
        let uniques = match class.handler() {
            Some(handler) => {
                handler
                    .validate(entity)
                    .map_err(StoreError::InvalidParameters)?;
                handler.uniques(entity)
            }
            None => Vec::new(),
        };

        let _access = self.access().await?;
        let driver = &self.shared.driver;
        let mut staged = entity.clone();
        let (kind, known_mdate) = match entity.guid() {
            None => {
                let now = timestamp::now();
                staged.mark_saved(Guid::new(), now, now);
                (MutationKind::Create, None)
            }
            Some(guid) => {
                let known = entity.mdate().ok_or_else(|| {
                    StoreError::InvalidParameters("persisted entity without mdate".into())
                })?;
                let cdate = entity.cdate().unwrap_or(known);
                staged.mark_saved(guid, cdate, timestamp::after(Some(known)));
                (MutationKind::Update, Some(known))
            }
        };

        driver.start_transaction(WRITE_SAVEPOINT).await?;
        let written = match known_mdate {
            None => driver.insert(&etype, &staged, &uniques).await.map(|()| true),
            Some(known) => driver.update(&etype, &staged, known, &uniques).await,
        };
        match written {
            Ok(true) => driver.commit(WRITE_SAVEPOINT).await?,
            Ok(false) => {
                driver.rollback(WRITE_SAVEPOINT).await?;
                debug!(etype = %etype, guid = ?entity.guid(), "save lost to a newer write");
                return Ok(false);
            }
            Err(e) => {
                if let Err(rollback) = driver.rollback(WRITE_SAVEPOINT).await {
                    warn!(error = %rollback, "rollback after failed save also failed");
                }
                return Err(e);
            }
        }

        let (Some(guid), Some(cdate), Some(mdate)) = (staged.guid(), staged.cdate(), staged.mdate())
        else {
            return Err(StoreError::InvalidParameters("staged entity lost its stamp".into()));
        };
        entity.mark_saved(guid, cdate, mdate);
        self.evict(guid);
        debug!(etype = %etype, guid = %guid, ?kind, "saved entity");
        self.emit(StoreEvent::Mutation {
            instance: self.instance,
            mutation: Mutation {
                kind,
                guid,
                etype,
                entity: Some(staged),
            },
        });
        Ok(true)
    }

    /// Deletes a saved entity. Returns `false` when it was not stored.
    pub async fn delete(&self, entity: &mut Entity) -> StoreResult<bool> {
        let guid = entity
            .guid()
            .ok_or_else(|| StoreError::InvalidParameters("entity has never been saved".into()))?;
        let deleted = self.delete_by_guid(entity.class(), guid).await?;
        if deleted {
            entity.mark_deleted();
        }
        Ok(deleted)
    }

    pub async fn delete_by_guid(&self, class: &str, guid: Guid) -> StoreResult<bool> {
        let etype = self.shared.classes.etype_of(class)?.to_string();
        let _access = self.access().await?;
        let driver = &self.shared.driver;
        driver.start_transaction(WRITE_SAVEPOINT).await?;
        let deleted = match driver.delete(&etype, guid).await {
            Ok(deleted) => {
                driver.commit(WRITE_SAVEPOINT).await?;
                deleted
            }
            Err(e) => {
                if let Err(rollback) = driver.rollback(WRITE_SAVEPOINT).await {
                    warn!(error = %rollback, "rollback after failed delete also failed");
                }
                return Err(e);
            }
        };
        self.evict(guid);
        if deleted {
            debug!(etype = %etype, guid = %guid, "deleted entity");
            self.emit(StoreEvent::Mutation {
                instance: self.instance,
                mutation: Mutation {
                    kind: MutationKind::Delete,
                    guid,
                    etype,
                    entity: None,
                },
            });
        }
        Ok(deleted)
    }

    // ── Transactions ─────────────────────────────────────────────

    /// Opens a named transaction (a savepoint when one is already open) and
    /// returns the handle that owns it.
    ///
    /// From a plain handle this waits until no other transaction is open.
    /// From a transaction handle it nests, and only the innermost open
    /// transaction may do so.
    pub async fn start_transaction(&self, name: &str) -> StoreResult<Nymph> {
        if name.is_empty() {
            return Err(StoreError::InvalidParameters("transaction name is required".into()));
        }
        if name == WRITE_SAVEPOINT {
            return Err(StoreError::InvalidParameters(format!(
                "transaction name `{name}` is reserved"
            )));
        }
        let permit = match self.transaction {
            None => {
                let gate = Arc::clone(&self.shared.gate);
                let permit = tokio::time::timeout(self.lock_timeout, gate.acquire_owned())
                    .await
                    .map_err(|_| self.busy())?
                    .map_err(|_| StoreError::Busy("store gate closed".into()))?;
                Some(permit)
            }
            Some(_) => {
                let _access = self.access().await?;
                let open = lock(&self.shared.open);
                if open.chain.iter().any(|(_, open_name)| open_name == name) {
                    return Err(StoreError::InvalidParameters(format!(
                        "transaction `{name}` is already open"
                    )));
                }
                None
            }
        };
        self.shared.driver.start_transaction(name).await?;
        let handle = Nymph {
            shared: Arc::clone(&self.shared),
            instance: InstanceId::new(),
            transaction: Some(Arc::new(Transaction {
                name: name.to_string(),
                parent: self.instance,
            })),
            lock_timeout: self.lock_timeout,
        };
        {
            let mut open = lock(&self.shared.open);
            open.chain.push((handle.instance, name.to_string()));
            if permit.is_some() {
                open.permit = permit;
            }
        }
        debug!(name, instance = %handle.instance, parent = %self.instance, "transaction started");
        self.emit(StoreEvent::TransactionStarted {
            instance: handle.instance,
            parent: self.instance,
            name: name.to_string(),
        });
        Ok(handle)
    }

    fn own_transaction(&self, name: &str) -> StoreResult<&Transaction> {
        if name.is_empty() {
            return Err(StoreError::InvalidParameters("transaction name is required".into()));
        }
        match self.transaction.as_deref() {
            Some(tx) if tx.name == name => Ok(tx),
            _ => Err(StoreError::InvalidParameters(format!(
                "this handle did not start a transaction named `{name}`"
            ))),
        }
    }

    /// Commits the transaction this handle was started for, together with
    /// any transaction still open inside it.
    pub async fn commit(&self, name: &str) -> StoreResult<()> {
        let tx = self.own_transaction(name)?;
        let position = self.open_position(tx)?;
        let committed = self.shared.driver.commit(name).await;
        self.close(position);
        committed?;
        debug!(name, instance = %self.instance, parent = %tx.parent, "transaction committed");
        self.emit(StoreEvent::TransactionCommitted {
            instance: self.instance,
            name: name.to_string(),
        });
        Ok(())
    }

    /// Rolls back the transaction this handle was started for, together
    /// with any transaction still open inside it.
    pub async fn rollback(&self, name: &str) -> StoreResult<()> {
        let tx = self.own_transaction(name)?;
        let position = self.open_position(tx)?;
        let rolled_back = self.shared.driver.rollback(name).await;
        self.close(position);
        lock(&self.shared.cache).clear();
        rolled_back?;
        debug!(name, instance = %self.instance, parent = %tx.parent, "transaction rolled back");
        self.emit(StoreEvent::TransactionRolledBack {
            instance: self.instance,
            name: name.to_string(),
        });
        Ok(())
    }

    /// True while any transaction is open on the store.
    pub async fn in_transaction(&self) -> bool {
        self.shared.driver.in_transaction().await
    }
}
