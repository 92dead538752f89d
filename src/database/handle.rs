//! Database Handle: owns the connection and the store proxies.

use super::request::Handlers;
use super::store::Store;
use crate::engine::{Connection, Engine, UpgradeStore, UpgradeTransaction};
use crate::error::{Result, StoreError};
use crate::types::StoreOptions;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Where a handle is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Unopened,
    Opening,
    Open,
    Closed,
    /// The last open failed; a new `open` may be issued.
    Failed,
}

pub(crate) struct HandleState {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) version: Option<u64>,
    pub(crate) connection: Option<Connection>,
    stores: BTreeMap<String, Store>,
}

pub(crate) struct DatabaseInner {
    pub(crate) name: String,
    pub(crate) engine: Engine,
    pub(crate) state: Mutex<HandleState>,
}

impl DatabaseInner {
    /// The connection, if the handle is open.
    pub(crate) fn open_connection(&self) -> Result<Connection> {
        let state = self.state.lock();
        match (&state.lifecycle, &state.connection) {
            (Lifecycle::Open, Some(connection)) => Ok(connection.clone()),
            (lifecycle, _) => Err(StoreError::InvalidState(format!(
                "database {} is {:?}, not open",
                self.name, lifecycle
            ))),
        }
    }

    fn finish_open(self: &Arc<Self>, result: Result<Connection>, handlers: Handlers<()>) {
        let result = {
            let mut state = self.state.lock();
            match result {
                Ok(connection) => {
                    let weak = Arc::downgrade(self);
                    state.stores = connection
                        .object_store_names()
                        .into_iter()
                        .map(|name| {
                            let store = Store::rehydrated(&name, weak.clone(), self.engine.clone());
                            (name, store)
                        })
                        .collect();
                    state.version = Some(connection.version());
                    state.connection = Some(connection);
                    state.lifecycle = Lifecycle::Open;
                    info!(
                        target: "storehouse::db",
                        database = %self.name,
                        version = ?state.version,
                        stores = state.stores.len(),
                        "Database open"
                    );
                    Ok(())
                }
                Err(error) => {
                    state.stores.clear();
                    state.connection = None;
                    state.version = None;
                    state.lifecycle = Lifecycle::Failed;
                    debug!(target: "storehouse::db", database = %self.name, error = %error, "Open failed");
                    Err(StoreError::connection(&self.name, error))
                }
            }
        };
        handlers.settle(result);
    }
}

/// Handle to one named database.
///
/// Cloning is cheap; clones share the connection and stores.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// A handle in the `Unopened` state. Nothing touches the engine until
    /// [`Database::open`].
    pub fn new(engine: &Engine, name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                name: name.into(),
                engine: engine.clone(),
                state: Mutex::new(HandleState {
                    lifecycle: Lifecycle::Unopened,
                    version: None,
                    connection: None,
                    stores: BTreeMap::new(),
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Version of the open connection.
    pub fn version(&self) -> Option<u64> {
        self.inner.state.lock().version
    }

    /// Open at `version` without schema changes.
    pub fn open(&self, version: u64, handlers: Handlers<()>) {
        self.open_with_upgrade(version, |_| Ok(()), handlers);
    }

    /// Open at `version`, running `on_upgrade_needed` if the stored version
    /// is older (or the database is new).
    ///
    /// The callback runs once, inside the engine's version-change
    /// transaction; it is the only place stores and indexes can be created.
    /// Store operations are refused until the open has succeeded.
    pub fn open_with_upgrade<U>(&self, version: u64, on_upgrade_needed: U, handlers: Handlers<()>)
    where
        U: FnOnce(&mut Upgrade<'_>) -> Result<()> + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Opening {
                drop(state);
                handlers.fail_later(
                    &self.inner.engine,
                    StoreError::InvalidState(format!("{} is already opening", self.inner.name)),
                );
                return;
            }
            if let Some(previous) = state.connection.take() {
                previous.close();
            }
            state.lifecycle = Lifecycle::Opening;
            state.version = None;
        }
        debug!(target: "storehouse::db", database = %self.inner.name, version, "Opening");

        let upgrading = Arc::clone(&self.inner);
        let finishing = Arc::clone(&self.inner);
        self.inner.engine.open_database(
            &self.inner.name,
            version,
            move |connection, transaction| {
                upgrading.state.lock().connection = Some(connection.clone());
                let mut upgrade = Upgrade {
                    database: &upgrading,
                    transaction,
                };
                on_upgrade_needed(&mut upgrade)
            },
            move |result| finishing.finish_open(result, handlers),
        );
    }

    /// A proxy for the named store.
    pub fn store(&self, name: &str) -> Result<Store> {
        let state = self.inner.state.lock();
        if state.lifecycle != Lifecycle::Open {
            return Err(StoreError::InvalidState(format!(
                "database {} is {:?}, not open",
                self.inner.name, state.lifecycle
            )));
        }
        state
            .stores
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::StoreNotFound(name.to_string()))
    }

    /// Names of the stores as of the last successful open.
    pub fn store_names(&self) -> Vec<String> {
        self.inner.state.lock().stores.keys().cloned().collect()
    }

    /// Close the connection. Requests already issued still complete; new
    /// ones are refused until the next open.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if let Some(connection) = state.connection.take() {
            connection.close();
        }
        if state.lifecycle != Lifecycle::Opening {
            state.lifecycle = Lifecycle::Closed;
        }
        debug!(target: "storehouse::db", database = %self.inner.name, "Closed");
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("lifecycle", &state.lifecycle)
            .field("version", &state.version)
            .field("stores", &state.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The upgrade phase of an open: schema changes happen here.
pub struct Upgrade<'a> {
    database: &'a Arc<DatabaseInner>,
    transaction: &'a UpgradeTransaction,
}

impl Upgrade<'_> {
    /// Stored version before this upgrade (0 for a new database).
    pub fn old_version(&self) -> u64 {
        self.transaction.old_version()
    }

    pub fn new_version(&self) -> u64 {
        self.transaction.new_version()
    }

    pub fn store_names(&self) -> Vec<String> {
        self.transaction.object_store_names()
    }

    /// Create a store. The returned proxy can declare indexes for as long as
    /// the upgrade lasts.
    pub fn create_store(&mut self, name: &str, options: StoreOptions) -> Result<Store> {
        let descriptor = self.transaction.create_object_store(name, options)?;
        let store = self.proxy(descriptor);
        self.database
            .state
            .lock()
            .stores
            .insert(name.to_string(), store.clone());
        Ok(store)
    }

    /// A proxy for an existing store that can declare indexes.
    pub fn store(&mut self, name: &str) -> Result<Store> {
        let descriptor = self.transaction.object_store(name)?;
        Ok(self.proxy(descriptor))
    }

    pub fn delete_store(&mut self, name: &str) -> Result<()> {
        self.transaction.delete_object_store(name)?;
        self.database.state.lock().stores.remove(name);
        Ok(())
    }

    fn proxy(&self, descriptor: UpgradeStore) -> Store {
        let weak: Weak<DatabaseInner> = Arc::downgrade(self.database);
        Store::with_descriptor(descriptor, weak, self.database.engine.clone())
    }
}

impl fmt::Debug for Upgrade<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgrade")
            .field("database", &self.database.name)
            .field("transaction", self.transaction)
            .finish()
    }
}
