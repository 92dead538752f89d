//! The storage engine underneath the database handles.
//!
//! The engine owns every database's data, admits transactions, and
//! delivers each request's completion on a later turn of its event loop.
//! It can run purely in memory or persist to a directory.
//!
//! # Example
//!
//! ```ignore
//! let engine = Engine::in_memory();
//! engine.open_database("app", 1, |_conn, upgrade| {
//!     upgrade.create_object_store("notes", StoreOptions::with_key_path("id"))?;
//!     Ok(())
//! }, |result| {
//!     let connection = result.expect("open failed");
//! });
//! engine.run_until_idle();
//! ```

mod durable;
mod event_loop;
mod scheduler;
pub(crate) mod schema;
mod transaction;
pub(crate) mod wal;

pub use transaction::{
    Connection, Cursor, Index, ObjectStore, Transaction, UpgradeStore, UpgradeTransaction,
};

use crate::error::{Result, StoreError};
use crate::types::TransactionMode;
use durable::Durable;
use event_loop::{EventLoop, Task};
use parking_lot::{Mutex, MutexGuard};
use scheduler::{Scheduler, Scope, TxTicket};
use schema::{apply_operation, Catalog, DatabaseData};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use wal::WalOperation;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Storage directory. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Rewrite the snapshot after this many commits (0 = only on demand).
    pub checkpoint_every: usize,

    /// fsync the WAL on every commit.
    pub sync_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
            checkpoint_every: 1000,
            sync_writes: true,
        }
    }
}

impl EngineConfig {
    /// Durable configuration rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Committed engine state.
pub(crate) struct Backend {
    pub(crate) catalog: Catalog,
    durable: Option<Durable>,
}

impl Backend {
    pub(crate) fn database(&self, name: &str) -> Result<&DatabaseData> {
        self.catalog
            .get(name)
            .ok_or_else(|| StoreError::InvalidState(format!("database {} no longer exists", name)))
    }

    /// Log (if durable) and apply one transaction's operations.
    pub(crate) fn commit(&mut self, operations: Vec<WalOperation>) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }
        if let Some(durable) = self.durable.as_mut() {
            durable.log(&operations)?;
        }
        for operation in operations {
            apply_operation(&mut self.catalog, operation)?;
        }
        if let Some(durable) = self.durable.as_mut() {
            durable.maybe_checkpoint(&self.catalog);
        }
        Ok(())
    }

    /// Commit an upgrade whose effects are already applied to `data`.
    fn commit_upgrade(
        &mut self,
        name: &str,
        data: DatabaseData,
        operations: Vec<WalOperation>,
    ) -> Result<()> {
        if let Some(durable) = self.durable.as_mut() {
            durable.log(&operations)?;
        }
        self.catalog.insert(name.to_string(), data);
        if let Some(durable) = self.durable.as_mut() {
            durable.maybe_checkpoint(&self.catalog);
        }
        Ok(())
    }
}

struct EngineInner {
    backend: Mutex<Backend>,
    scheduler: Mutex<Scheduler>,
    events: EventLoop,
    next_tx: AtomicU64,
}

/// Shared handle to an engine. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// A purely in-memory engine.
    pub fn in_memory() -> Self {
        Self::from_parts(Catalog::new(), None)
    }

    /// Build an engine from configuration, recovering durable state if a
    /// path is configured.
    pub fn new(config: EngineConfig) -> Result<Self> {
        match &config.path {
            None => Ok(Self::in_memory()),
            Some(path) => {
                let (durable, catalog) = Durable::open(
                    path,
                    config.create_if_missing,
                    config.checkpoint_every,
                    config.sync_writes,
                )?;
                Ok(Self::from_parts(catalog, Some(durable)))
            }
        }
    }

    fn from_parts(catalog: Catalog, durable: Option<Durable>) -> Self {
        info!(
            target: "storehouse::engine",
            durable = durable.is_some(),
            databases = catalog.len(),
            "Engine started"
        );
        Self {
            inner: Arc::new(EngineInner {
                backend: Mutex::new(Backend { catalog, durable }),
                scheduler: Mutex::new(Scheduler::new()),
                events: EventLoop::new(),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.backend().durable.is_some()
    }

    /// Open `name` at `version`, upgrading it first if the stored version
    /// is older.
    ///
    /// `on_upgrade` runs synchronously inside the version-change transaction
    /// and is the only place schema changes are possible. Returning an error
    /// from it discards every change it made and fails the open.
    pub fn open_database<U, D>(&self, name: &str, version: u64, on_upgrade: U, on_done: D)
    where
        U: FnOnce(&Connection, &UpgradeTransaction) -> Result<()> + Send + 'static,
        D: FnOnce(Result<Connection>) + Send + 'static,
    {
        if version == 0 {
            self.defer(move || {
                on_done(Err(StoreError::InvalidOperation(
                    "database version must be at least 1".into(),
                )))
            });
            return;
        }

        let engine = self.clone();
        let name = name.to_string();
        let id = self.next_tx_id();
        let ticket = TxTicket {
            id,
            database: name.clone(),
            scope: Scope::All,
            mode: TransactionMode::VersionChange,
        };

        self.schedule(
            ticket,
            Box::new(move || {
                let result = engine.run_open(&name, version, on_upgrade);
                engine.complete(id);
                on_done(result);
            }),
        );
    }

    fn run_open<U>(&self, name: &str, version: u64, on_upgrade: U) -> Result<Connection>
    where
        U: FnOnce(&Connection, &UpgradeTransaction) -> Result<()>,
    {
        let (stored, working) = {
            let backend = self.backend();
            match backend.catalog.get(name) {
                Some(db) if version < db.version => {
                    return Err(StoreError::Version {
                        requested: version,
                        stored: db.version,
                    })
                }
                Some(db) if version == db.version => (db.version, None),
                Some(db) => (db.version, Some(db.clone())),
                None => (0, Some(DatabaseData::default())),
            }
        };

        let connection = Connection::new(self.clone(), name, version);

        let Some(data) = working else {
            debug!(target: "storehouse::engine", database = name, version, "Opened without upgrade");
            return Ok(connection);
        };

        info!(
            target: "storehouse::engine",
            database = name,
            from = stored,
            to = version,
            "Upgrading database"
        );

        let upgrade = UpgradeTransaction::new(name, stored, version, data)?;
        let outcome = on_upgrade(&connection, &upgrade);
        let (data, operations) = upgrade.finish(name)?;

        if let Err(e) = outcome {
            debug!(target: "storehouse::engine", database = name, error = %e, "Upgrade aborted");
            return Err(e);
        }

        self.backend().commit_upgrade(name, data, operations)?;
        Ok(connection)
    }

    /// Delete a database and all its stores. Deleting a missing database succeeds.
    pub fn delete_database<D>(&self, name: &str, on_done: D)
    where
        D: FnOnce(Result<()>) + Send + 'static,
    {
        let engine = self.clone();
        let name = name.to_string();
        let id = self.next_tx_id();
        let ticket = TxTicket {
            id,
            database: name.clone(),
            scope: Scope::All,
            mode: TransactionMode::VersionChange,
        };

        self.schedule(
            ticket,
            Box::new(move || {
                let result = {
                    let mut backend = engine.backend();
                    if backend.catalog.contains_key(&name) {
                        info!(target: "storehouse::engine", database = %name, "Deleting database");
                        backend.commit(vec![WalOperation::DeleteDatabase {
                            database: name.clone(),
                        }])
                    } else {
                        Ok(())
                    }
                };
                engine.complete(id);
                on_done(result);
            }),
        );
    }

    /// Names of all databases, in order.
    pub fn database_names(&self) -> Vec<String> {
        self.backend().catalog.keys().cloned().collect()
    }

    /// Committed version of a database, if it exists.
    pub fn database_version(&self, name: &str) -> Option<u64> {
        self.backend().catalog.get(name).map(|db| db.version)
    }

    /// Write a snapshot and truncate the WAL. No-op for in-memory engines.
    pub fn checkpoint(&self) -> Result<()> {
        let mut guard = self.backend();
        let backend = &mut *guard;
        match backend.durable.as_mut() {
            Some(durable) => durable.checkpoint(&backend.catalog),
            None => Ok(()),
        }
    }

    // --- Event loop ---

    /// Run one queued task. Returns false when nothing was queued.
    pub fn run_once(&self) -> bool {
        self.inner.events.run_once()
    }

    /// Run queued tasks until the queue is empty; returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        self.inner.events.run_until_idle()
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.events.pending()
    }

    /// Run `task` on a later turn.
    pub(crate) fn defer<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.events.post(Box::new(task));
    }

    // --- Transactions ---

    pub(crate) fn next_tx_id(&self) -> u64 {
        self.inner.next_tx.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn backend(&self) -> MutexGuard<'_, Backend> {
        self.inner.backend.lock()
    }

    /// Admit a transaction; its start task runs once nothing conflicts.
    pub(crate) fn schedule(&self, ticket: TxTicket, start: Task) {
        let id = ticket.id;
        let mut scheduler = self.inner.scheduler.lock();
        let ready = scheduler.submit(ticket, start);
        let (running, waiting) = (scheduler.running_count(), scheduler.waiting_count());
        drop(scheduler);
        match ready {
            Some(task) => {
                debug!(target: "storehouse::txn", tx = id, running, "Transaction admitted");
                self.inner.events.post(task);
            }
            None => debug!(target: "storehouse::txn", tx = id, waiting, "Transaction queued"),
        }
    }

    /// Mark a transaction finished and start whatever it was blocking.
    pub(crate) fn complete(&self, id: u64) {
        let ready = self.inner.scheduler.lock().finish(id);
        debug!(
            target: "storehouse::txn",
            tx = id,
            released = ready.len(),
            "Transaction finished"
        );
        for task in ready {
            self.inner.events.post(task);
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("durable", &self.is_durable())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
