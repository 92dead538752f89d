//! Connections, transactions, and the request objects hanging off them.
//!
//! A transaction here carries exactly one request: every request method
//! consumes its [`ObjectStore`] (or [`Index`]), queues behind conflicting
//! transactions, runs on a later event-loop turn, and reports through its
//! callback. Cursors keep their transaction open until they are exhausted
//! or dropped.

use super::scheduler::{Scope, TxTicket};
use super::schema::{Catalog, DatabaseData};
use super::wal::WalOperation;
use super::{Backend, Engine};
use crate::error::{Result, StoreError};
use crate::range::KeyRange;
use crate::types::{IndexSpec, Key, StoreOptions, TransactionMode};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

struct ConnectionInner {
    engine: Engine,
    name: String,
    version: u64,
    closed: AtomicBool,
}

/// An open connection to one database at one version.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(engine: Engine, name: &str, version: u64) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                engine,
                name: name.to_string(),
                version,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u64 {
        self.inner.version
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    /// Committed store names, in order.
    pub fn object_store_names(&self) -> Vec<String> {
        self.inner
            .engine
            .backend()
            .catalog
            .get(&self.inner.name)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stop accepting new transactions. Requests already issued still complete.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "storehouse::engine", database = %self.inner.name, "Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start a transaction over `scope`.
    ///
    /// Every store in the scope must exist. Version-change transactions are
    /// only created by [`Engine::open_database`].
    pub fn transaction(&self, scope: &[&str], mode: TransactionMode) -> Result<Transaction> {
        if self.is_closed() {
            return Err(StoreError::InvalidState("connection is closed".into()));
        }
        if mode == TransactionMode::VersionChange {
            return Err(StoreError::InvalidOperation(
                "version-change transactions are created by opening the database".into(),
            ));
        }
        if scope.is_empty() {
            return Err(StoreError::InvalidOperation("transaction scope is empty".into()));
        }

        {
            let backend = self.inner.engine.backend();
            let db = backend.database(&self.inner.name)?;
            for store in scope {
                db.store(store)?;
            }
        }

        let id = self.inner.engine.next_tx_id();
        debug!(target: "storehouse::txn", tx = id, ?mode, ?scope, "Transaction created");

        Ok(Transaction {
            connection: self.clone(),
            id,
            scope: scope.iter().map(|s| s.to_string()).collect(),
            mode,
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A transaction that has not issued its request yet.
#[derive(Debug)]
pub struct Transaction {
    connection: Connection,
    id: u64,
    scope: Vec<String>,
    mode: TransactionMode,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Target one store of the scope.
    pub fn object_store(self, name: &str) -> Result<ObjectStore> {
        if !self.scope.iter().any(|s| s == name) {
            return Err(StoreError::StoreNotFound(format!(
                "{} (not in transaction scope)",
                name
            )));
        }
        Ok(ObjectStore {
            tx: self,
            name: name.to_string(),
        })
    }

    fn ticket(&self) -> TxTicket {
        TxTicket {
            id: self.id,
            database: self.connection.name().to_string(),
            scope: Scope::Stores(self.scope.clone()),
            mode: self.mode,
        }
    }

    /// Queue `run` against the committed data; `on_done` gets its result
    /// after the transaction has finished.
    fn request<T, R, F>(self, run: R, on_done: F)
    where
        T: Send + 'static,
        R: FnOnce(&mut Backend, &str) -> Result<T> + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let engine = self.connection.engine().clone();
        let ticket = self.ticket();
        let id = self.id;
        let database = self.connection.name().to_string();

        let runner = engine.clone();
        engine.schedule(
            ticket,
            Box::new(move || {
                let result = {
                    let mut backend = runner.backend();
                    run(&mut backend, &database)
                };
                runner.complete(id);
                if let Err(e) = &result {
                    debug!(target: "storehouse::txn", tx = id, error = %e, "Request failed");
                }
                on_done(result);
            }),
        );
    }

    /// Like [`Transaction::request`], but refuses to run in a read-only transaction.
    fn write_request<T, R, F>(self, run: R, on_done: F)
    where
        T: Send + 'static,
        R: FnOnce(&mut Backend, &str) -> Result<T> + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mode = self.mode;
        self.request(
            move |backend, database| {
                if !mode.is_write() {
                    return Err(StoreError::ReadOnly(
                        "write request in a read-only transaction".into(),
                    ));
                }
                run(backend, database)
            },
            on_done,
        );
    }
}

/// One store inside a transaction.
#[derive(Debug)]
pub struct ObjectStore {
    tx: Transaction,
    name: String,
}

impl ObjectStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a record; fails with a constraint error if the key exists.
    pub fn add<F>(self, value: Value, key: Option<Key>, on_done: F)
    where
        F: FnOnce(Result<Key>) + Send + 'static,
    {
        self.write(value, key, false, on_done);
    }

    /// Insert or overwrite a record.
    pub fn put<F>(self, value: Value, key: Option<Key>, on_done: F)
    where
        F: FnOnce(Result<Key>) + Send + 'static,
    {
        self.write(value, key, true, on_done);
    }

    fn write<F>(self, value: Value, key: Option<Key>, overwrite: bool, on_done: F)
    where
        F: FnOnce(Result<Key>) + Send + 'static,
    {
        let store = self.name;
        self.tx.write_request(
            move |backend, database| {
                let planned = backend
                    .database(database)?
                    .store(&store)?
                    .plan_write(value, key, overwrite)?;
                let key = planned.key.clone();
                backend.commit(vec![WalOperation::Put {
                    database: database.to_string(),
                    store,
                    key: planned.key,
                    value: planned.value,
                }])?;
                Ok(key)
            },
            on_done,
        );
    }

    /// First record in `range`, or `None`.
    pub fn get<F>(self, range: KeyRange, on_done: F)
    where
        F: FnOnce(Result<Option<Value>>) + Send + 'static,
    {
        let store = self.name;
        self.tx.request(
            move |backend, database| {
                Ok(backend
                    .database(database)?
                    .store(&store)?
                    .next_record(Some(&range), None)
                    .map(|(_, value)| value.clone()))
            },
            on_done,
        );
    }

    /// Remove every record in `range`.
    pub fn delete<F>(self, range: KeyRange, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let store = self.name;
        self.tx.write_request(
            move |backend, database| {
                backend.database(database)?.store(&store)?;
                backend.commit(vec![WalOperation::Delete {
                    database: database.to_string(),
                    store,
                    range,
                }])
            },
            on_done,
        );
    }

    /// Remove every record.
    pub fn clear<F>(self, on_done: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let store = self.name;
        self.tx.write_request(
            move |backend, database| {
                backend.database(database)?.store(&store)?;
                backend.commit(vec![WalOperation::Clear {
                    database: database.to_string(),
                    store,
                }])
            },
            on_done,
        );
    }

    /// Number of records in `range` (all records when `None`).
    pub fn count<F>(self, range: Option<KeyRange>, on_done: F)
    where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        let store = self.name;
        self.tx.request(
            move |backend, database| Ok(backend.database(database)?.store(&store)?.count(range.as_ref())),
            on_done,
        );
    }

    /// Iterate records in key order.
    ///
    /// `on_step` receives `Ok(Some(cursor))` per record and `Ok(None)` at the
    /// end. Call [`Cursor::advance`] to move on; dropping the cursor ends the
    /// iteration without a final callback.
    pub fn open_cursor<F>(self, range: Option<KeyRange>, on_step: F)
    where
        F: FnMut(Result<Option<Cursor>>) + Send + 'static,
    {
        CursorSource::start(self.tx, self.name, None, range, Box::new(on_step));
    }

    /// Target a secondary index of this store. A missing index is reported
    /// by the first request made through it.
    pub fn index(self, name: &str) -> Index {
        Index {
            store: self,
            name: name.to_string(),
        }
    }
}

/// A secondary index inside a transaction.
#[derive(Debug)]
pub struct Index {
    store: ObjectStore,
    name: String,
}

impl Index {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First record whose index key lies in `range`, or `None`.
    pub fn get<F>(self, range: KeyRange, on_done: F)
    where
        F: FnOnce(Result<Option<Value>>) + Send + 'static,
    {
        let store = self.store.name;
        let index = self.name;
        self.store.tx.request(
            move |backend, database| {
                let data = backend.database(database)?.store(&store)?;
                match data.index(&index)?.next_entry(Some(&range), None) {
                    Some((_, primary)) => Ok(data.records.get(&primary).cloned()),
                    None => Ok(None),
                }
            },
            on_done,
        );
    }

    /// Number of index entries in `range` (all entries when `None`).
    pub fn count<F>(self, range: Option<KeyRange>, on_done: F)
    where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        let store = self.store.name;
        let index = self.name;
        self.store.tx.request(
            move |backend, database| {
                Ok(backend
                    .database(database)?
                    .store(&store)?
                    .index(&index)?
                    .count(range.as_ref()))
            },
            on_done,
        );
    }

    /// Iterate records in index-key order, then primary-key order.
    pub fn open_cursor<F>(self, range: Option<KeyRange>, on_step: F)
    where
        F: FnMut(Result<Option<Cursor>>) + Send + 'static,
    {
        CursorSource::start(
            self.store.tx,
            self.store.name,
            Some(self.name),
            range,
            Box::new(on_step),
        );
    }
}

type StepFn = Box<dyn FnMut(Result<Option<Cursor>>) + Send>;

/// Shared state of one cursor iteration.
struct CursorSource {
    engine: Engine,
    tx_id: u64,
    database: String,
    store: String,
    index: Option<String>,
    range: Option<KeyRange>,
    on_step: Mutex<StepFn>,
    finished: AtomicBool,
}

impl CursorSource {
    fn start(
        tx: Transaction,
        store: String,
        index: Option<String>,
        range: Option<KeyRange>,
        on_step: StepFn,
    ) {
        let engine = tx.connection.engine().clone();
        let ticket = tx.ticket();
        let source = Arc::new(CursorSource {
            engine: engine.clone(),
            tx_id: tx.id,
            database: tx.connection.name().to_string(),
            store,
            index,
            range,
            on_step: Mutex::new(on_step),
            finished: AtomicBool::new(false),
        });
        engine.schedule(ticket, Box::new(move || source.step(None)));
    }

    /// Find the next position after `after` and report it.
    fn step(self: Arc<Self>, after: Option<(Key, Key)>) {
        let found = {
            let backend = self.engine.backend();
            self.find(&backend, after)
        };

        match found {
            Ok(Some((key, primary_key, value))) => {
                let cursor = Cursor {
                    key,
                    primary_key,
                    value,
                    source: Some(Arc::clone(&self)),
                };
                self.emit(Ok(Some(cursor)));
            }
            Ok(None) => {
                self.finish();
                self.emit(Ok(None));
            }
            Err(e) => {
                self.finish();
                debug!(target: "storehouse::txn", tx = self.tx_id, error = %e, "Cursor failed");
                self.emit(Err(e));
            }
        }
    }

    fn find(&self, backend: &Backend, after: Option<(Key, Key)>) -> Result<Option<(Key, Key, Value)>> {
        let store = backend.database(&self.database)?.store(&self.store)?;

        let Some(index) = &self.index else {
            return Ok(store
                .next_record(self.range.as_ref(), after.as_ref().map(|(key, _)| key))
                .map(|(key, value)| (key.clone(), key.clone(), value.clone())));
        };

        let entry = store
            .index(index)?
            .next_entry(self.range.as_ref(), after.as_ref().map(|(i, p)| (i, p)));
        match entry {
            Some((index_key, primary)) => match store.records.get(&primary) {
                Some(value) => Ok(Some((index_key, primary, value.clone()))),
                None => Err(StoreError::Corruption(format!(
                    "index {} points at missing record {}",
                    index, primary
                ))),
            },
            None => Ok(None),
        }
    }

    fn emit(&self, step: Result<Option<Cursor>>) {
        let mut on_step = self.on_step.lock();
        (*on_step)(step);
    }

    fn finish(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            self.engine.complete(self.tx_id);
        }
    }
}

/// A position in a cursor iteration.
pub struct Cursor {
    key: Key,
    primary_key: Key,
    value: Value,
    source: Option<Arc<CursorSource>>,
}

impl Cursor {
    /// Index key for index cursors, primary key otherwise.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn primary_key(&self) -> &Key {
        &self.primary_key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Move to the next record; the callback fires again on a later turn.
    pub fn advance(mut self) {
        if let Some(source) = self.source.take() {
            let after = (self.key.clone(), self.primary_key.clone());
            let engine = source.engine.clone();
            engine.defer(move || source.step(Some(after)));
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            source.finish();
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("primary_key", &self.primary_key)
            .field("value", &self.value)
            .finish()
    }
}

struct UpgradeState {
    old_version: u64,
    new_version: u64,
    /// Working copy holding just the database being upgraded.
    catalog: Catalog,
    operations: Vec<WalOperation>,
    active: bool,
    database: String,
}

impl UpgradeState {
    fn data(&self) -> Result<&DatabaseData> {
        self.catalog
            .get(&self.database)
            .ok_or_else(|| StoreError::InvalidState("upgrade has no database".into()))
    }

    /// Apply to the working copy and remember for the commit.
    fn record(&mut self, operation: WalOperation) -> Result<()> {
        super::schema::apply_operation(&mut self.catalog, operation.clone())?;
        self.operations.push(operation);
        Ok(())
    }
}

/// The version-change transaction handed to an upgrade callback.
///
/// Schema changes are applied to a private copy of the database and
/// committed together once the callback returns `Ok`.
pub struct UpgradeTransaction {
    state: Arc<Mutex<UpgradeState>>,
}

impl UpgradeTransaction {
    pub(crate) fn new(
        database: &str,
        old_version: u64,
        new_version: u64,
        data: DatabaseData,
    ) -> Result<Self> {
        let mut catalog = Catalog::new();
        catalog.insert(database.to_string(), data);

        let mut state = UpgradeState {
            old_version,
            new_version,
            catalog,
            operations: Vec::new(),
            active: true,
            database: database.to_string(),
        };
        state.record(WalOperation::SetVersion {
            database: database.to_string(),
            version: new_version,
        })?;

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    pub fn old_version(&self) -> u64 {
        self.state.lock().old_version
    }

    pub fn new_version(&self) -> u64 {
        self.state.lock().new_version
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Store names as of this point in the upgrade.
    pub fn object_store_names(&self) -> Vec<String> {
        self.state
            .lock()
            .data()
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn create_object_store(&self, name: &str, options: StoreOptions) -> Result<UpgradeStore> {
        let mut state = active(&self.state)?;
        if state.data()?.stores.contains_key(name) {
            return Err(StoreError::StoreAlreadyExists(name.to_string()));
        }
        options.validate()?;

        let database = state.database.clone();
        state.record(WalOperation::CreateStore {
            database,
            store: name.to_string(),
            options,
        })?;
        debug!(target: "storehouse::engine", store = name, "Store created");

        Ok(UpgradeStore {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        })
    }

    pub fn delete_object_store(&self, name: &str) -> Result<()> {
        let mut state = active(&self.state)?;
        state.data()?.store(name)?;

        let database = state.database.clone();
        state.record(WalOperation::DeleteStore {
            database,
            store: name.to_string(),
        })
    }

    /// Handle to an existing store, for adding or removing indexes.
    pub fn object_store(&self, name: &str) -> Result<UpgradeStore> {
        let state = active(&self.state)?;
        state.data()?.store(name)?;
        Ok(UpgradeStore {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        })
    }

    /// End the upgrade: no further changes are accepted. Returns the
    /// upgraded database and the operations that produced it.
    pub(crate) fn finish(&self, database: &str) -> Result<(DatabaseData, Vec<WalOperation>)> {
        let mut state = self.state.lock();
        state.active = false;
        let data = state.catalog.remove(database).ok_or_else(|| {
            StoreError::InvalidState(format!("upgrade of {} lost its database", database))
        })?;
        Ok((data, std::mem::take(&mut state.operations)))
    }
}

fn active(state: &Mutex<UpgradeState>) -> Result<MutexGuard<'_, UpgradeState>> {
    let guard = state.lock();
    if !guard.active {
        return Err(StoreError::InvalidState(
            "the version-change transaction has finished".into(),
        ));
    }
    Ok(guard)
}

impl fmt::Debug for UpgradeTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UpgradeTransaction")
            .field("database", &state.database)
            .field("old_version", &state.old_version)
            .field("new_version", &state.new_version)
            .field("active", &state.active)
            .finish()
    }
}

/// A store as seen from inside an upgrade; the only place indexes change.
#[derive(Clone)]
pub struct UpgradeStore {
    state: Arc<Mutex<UpgradeState>>,
    name: String,
}

impl UpgradeStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_index(&self, spec: IndexSpec) -> Result<()> {
        let mut state = active(&self.state)?;
        state.data()?.store(&self.name)?.plan_create_index(&spec)?;

        let database = state.database.clone();
        debug!(
            target: "storehouse::engine",
            store = %self.name,
            index = %spec.index_name,
            "Index created"
        );
        state.record(WalOperation::CreateIndex {
            database,
            store: self.name.clone(),
            spec,
        })
    }

    pub fn delete_index(&self, name: &str) -> Result<()> {
        let mut state = active(&self.state)?;
        state.data()?.store(&self.name)?.index(name)?;

        let database = state.database.clone();
        state.record(WalOperation::DeleteIndex {
            database,
            store: self.name.clone(),
            index: name.to_string(),
        })
    }

    pub fn index_names(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state.data()?.store(&self.name)?.indexes.keys().cloned().collect())
    }
}

impl fmt::Debug for UpgradeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStore").field("name", &self.name).finish()
    }
}
