//! Store Proxy: the per-store operations of an open database.

use super::collector::collect_values;
use super::dispatch::{Operation, OperationRequest, Outcome};
use super::handle::DatabaseInner;
use super::request::{execute, Handlers};
use crate::engine::{Engine, ObjectStore, UpgradeStore};
use crate::error::{Result, StoreError};
use crate::range::{KeyRange, RangeSpec};
use crate::types::{IndexSpec, Key, TransactionMode};
use serde_json::Value;
use std::fmt;
use std::sync::Weak;

/// Proxy for one named store.
///
/// Every operation runs in its own single-store transaction and reports
/// through its [`Handlers`] on a later turn of the engine's event loop.
/// Proxies made during an upgrade also hold the store's schema descriptor,
/// which is what [`Store::create_index`] needs.
#[derive(Clone)]
pub struct Store {
    name: String,
    database: Weak<DatabaseInner>,
    engine: Engine,
    descriptor: Option<UpgradeStore>,
}

impl Store {
    /// Proxy for a store found when the database opened.
    pub(crate) fn rehydrated(name: &str, database: Weak<DatabaseInner>, engine: Engine) -> Self {
        Self {
            name: name.to_string(),
            database,
            engine,
            descriptor: None,
        }
    }

    /// Proxy created during an upgrade.
    pub(crate) fn with_descriptor(
        descriptor: UpgradeStore,
        database: Weak<DatabaseInner>,
        engine: Engine,
    ) -> Self {
        Self {
            name: descriptor.name().to_string(),
            database,
            engine,
            descriptor: Some(descriptor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this proxy can declare indexes.
    pub fn has_descriptor(&self) -> bool {
        self.descriptor.is_some()
    }

    // --- Schema ---

    /// Declare a secondary index. Only valid on a proxy returned by the
    /// upgrade phase, while that phase lasts.
    pub fn create_index(&self, spec: IndexSpec) -> Result<()> {
        match &self.descriptor {
            Some(descriptor) => descriptor.create_index(spec),
            None => Err(StoreError::InvalidState(format!(
                "store {} was not created in this upgrade; indexes can only be declared there",
                self.name
            ))),
        }
    }

    // --- Writes ---

    /// Insert a record keyed by the store's key path or generator.
    /// Fails with a constraint error if the key is taken.
    pub fn add(&self, data: Value, handlers: Handlers<Key>) {
        self.write(data, None, false, handlers);
    }

    /// Insert a record under an explicit key (out-of-line stores).
    pub fn add_with_key(&self, data: Value, key: impl Into<Key>, handlers: Handlers<Key>) {
        self.write(data, Some(key.into()), false, handlers);
    }

    /// Insert or overwrite.
    pub fn put(&self, data: Value, handlers: Handlers<Key>) {
        self.write(data, None, true, handlers);
    }

    pub fn put_with_key(&self, data: Value, key: impl Into<Key>, handlers: Handlers<Key>) {
        self.write(data, Some(key.into()), true, handlers);
    }

    fn write(&self, data: Value, key: Option<Key>, overwrite: bool, handlers: Handlers<Key>) {
        execute(
            &self.engine,
            self.target(TransactionMode::ReadWrite),
            handlers,
            move |store, handlers| {
                let done = move |result| handlers.settle(result);
                if overwrite {
                    store.put(data, key, done);
                } else {
                    store.add(data, key, done);
                }
            },
        );
    }

    /// Remove the record at `key`; absent keys are not an error.
    pub fn delete(&self, key: impl Into<Key>, handlers: Handlers<()>) {
        let range = KeyRange::only(key);
        execute(
            &self.engine,
            self.target(TransactionMode::ReadWrite),
            handlers,
            move |store, handlers| store.delete(range, move |result| handlers.settle(result)),
        );
    }

    /// Remove every record.
    pub fn clear(&self, handlers: Handlers<()>) {
        execute(
            &self.engine,
            self.target(TransactionMode::ReadWrite),
            handlers,
            |store, handlers| store.clear(move |result| handlers.settle(result)),
        );
    }

    // --- Reads ---

    /// Record at `key`, or `None`.
    pub fn get(&self, key: impl Into<Key>, handlers: Handlers<Option<Value>>) {
        let range = KeyRange::only(key);
        execute(
            &self.engine,
            self.target(TransactionMode::ReadOnly),
            handlers,
            move |store, handlers| store.get(range, move |result| handlers.settle(result)),
        );
    }

    /// First record whose `index` key equals `key`, or `None`.
    pub fn get_from_index(
        &self,
        index: &str,
        key: impl Into<Key>,
        handlers: Handlers<Option<Value>>,
    ) {
        let range = KeyRange::only(key);
        let index = index.to_string();
        execute(
            &self.engine,
            self.target(TransactionMode::ReadOnly),
            handlers,
            move |store, handlers| {
                store
                    .index(&index)
                    .get(range, move |result| handlers.settle(result))
            },
        );
    }

    /// Every record, in primary-key order.
    pub fn get_all(&self, handlers: Handlers<Vec<Value>>) {
        self.scan(None, None, handlers);
    }

    /// Records with keys in `range`, in key order. The range needs at least
    /// one bound.
    pub fn get_range(&self, range: RangeSpec, handlers: Handlers<Vec<Value>>) {
        match range.to_key_range() {
            Ok(range) => self.scan(None, Some(range), handlers),
            Err(error) => handlers.fail_later(&self.engine, error),
        }
    }

    /// Records whose `index` key lies in `range`, in index-key order.
    pub fn get_range_from_index(
        &self,
        index: &str,
        range: RangeSpec,
        handlers: Handlers<Vec<Value>>,
    ) {
        match range.to_key_range() {
            Ok(range) => self.scan(Some(index.to_string()), Some(range), handlers),
            Err(error) => handlers.fail_later(&self.engine, error),
        }
    }

    fn scan(&self, index: Option<String>, range: Option<KeyRange>, handlers: Handlers<Vec<Value>>) {
        execute(
            &self.engine,
            self.target(TransactionMode::ReadOnly),
            handlers,
            move |store, handlers| {
                let collector = collect_values(handlers);
                match index {
                    Some(index) => store.index(&index).open_cursor(range, collector),
                    None => store.open_cursor(range, collector),
                }
            },
        );
    }

    /// Number of records.
    pub fn count(&self, handlers: Handlers<u64>) {
        execute(
            &self.engine,
            self.target(TransactionMode::ReadOnly),
            handlers,
            |store, handlers| store.count(None, move |result| handlers.settle(result)),
        );
    }

    // --- Dispatch ---

    /// Run one operation chosen at runtime.
    pub fn dispatch(&self, operation: Operation, handlers: Handlers<Outcome>) {
        match operation {
            Operation::Add { data, key: None } => self.add(data, handlers.map(Outcome::Key)),
            Operation::Add { data, key: Some(key) } => {
                self.add_with_key(data, key, handlers.map(Outcome::Key))
            }
            Operation::Put { data, key: None } => self.put(data, handlers.map(Outcome::Key)),
            Operation::Put { data, key: Some(key) } => {
                self.put_with_key(data, key, handlers.map(Outcome::Key))
            }
            Operation::Get { key, index: None } => self.get(key, handlers.map(Outcome::Record)),
            Operation::Get {
                key,
                index: Some(index),
            } => self.get_from_index(&index, key, handlers.map(Outcome::Record)),
            Operation::GetAll => self.get_all(handlers.map(Outcome::Records)),
            Operation::GetRange { range, index: None } => {
                self.get_range(range, handlers.map(Outcome::Records))
            }
            Operation::GetRange {
                range,
                index: Some(index),
            } => self.get_range_from_index(&index, range, handlers.map(Outcome::Records)),
            Operation::Delete { key } => self.delete(key, handlers.map(|()| Outcome::Done)),
            Operation::Count => self.count(handlers.map(Outcome::Count)),
            Operation::Clear => self.clear(handlers.map(|()| Outcome::Done)),
        }
    }

    /// Parse a loosely-typed request and dispatch it. Unknown types fail
    /// with `UnsupportedOperation`.
    pub fn operate_store(&self, request: OperationRequest, handlers: Handlers<Outcome>) {
        match Operation::try_from(request) {
            Ok(operation) => self.dispatch(operation, handlers),
            Err(error) => handlers.fail_later(&self.engine, error),
        }
    }

    /// A fresh single-store transaction in `mode`.
    fn target(&self, mode: TransactionMode) -> Result<ObjectStore> {
        let database = self.database.upgrade().ok_or_else(|| {
            StoreError::InvalidState(format!("database handle for {} was dropped", self.name))
        })?;
        database
            .open_connection()?
            .transaction(&[self.name.as_str()], mode)?
            .object_store(&self.name)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("has_descriptor", &self.descriptor.is_some())
            .finish()
    }
}
