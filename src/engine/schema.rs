//! In-memory database contents and the rules for changing them.
//!
//! Writes are split in two steps. `plan_*` validates a request against the
//! current contents without touching them and produces WAL operations;
//! [`apply_operation`] applies those operations. Live commits and WAL replay
//! share the apply step, so recovery reproduces exactly what was committed.

use super::wal::WalOperation;
use crate::error::{Result, StoreError};
use crate::range::{scan_bounds, KeyRange};
use crate::types::{IndexSpec, Key, StoreOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// All databases known to an engine.
pub(crate) type Catalog = BTreeMap<String, DatabaseData>;

/// One named database.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DatabaseData {
    pub version: u64,
    pub stores: BTreeMap<String, ObjectStoreData>,
}

impl DatabaseData {
    pub(crate) fn store(&self, name: &str) -> Result<&ObjectStoreData> {
        self.stores
            .get(name)
            .ok_or_else(|| StoreError::StoreNotFound(name.to_string()))
    }

    pub(crate) fn store_mut(&mut self, name: &str) -> Result<&mut ObjectStoreData> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| StoreError::StoreNotFound(name.to_string()))
    }

    /// Rebuild index entries after loading a snapshot (they are not persisted).
    pub(crate) fn rebuild_indexes(&mut self) {
        for store in self.stores.values_mut() {
            store.rebuild_indexes();
        }
    }
}

/// A secondary index: index key -> primary keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct IndexData {
    pub spec: IndexSpec,
    #[serde(skip)]
    pub entries: BTreeMap<Key, BTreeSet<Key>>,
}

impl IndexData {
    fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    /// Index key for a record; records without a valid key are not indexed.
    fn key_for(&self, record: &Value) -> Option<Key> {
        self.spec.attribute.evaluate(record).ok().flatten()
    }

    fn insert(&mut self, record: &Value, primary: &Key) {
        if let Some(index_key) = self.key_for(record) {
            self.entries
                .entry(index_key)
                .or_default()
                .insert(primary.clone());
        }
    }

    fn remove(&mut self, record: &Value, primary: &Key) {
        if let Some(index_key) = self.key_for(record) {
            if let Some(primaries) = self.entries.get_mut(&index_key) {
                primaries.remove(primary);
                if primaries.is_empty() {
                    self.entries.remove(&index_key);
                }
            }
        }
    }

    /// Whether writing `record` at `primary` would break uniqueness.
    fn violates_unique(&self, record: &Value, primary: &Key) -> bool {
        if !self.spec.unique {
            return false;
        }
        match self.key_for(record) {
            Some(index_key) => self
                .entries
                .get(&index_key)
                .map(|primaries| primaries.iter().any(|p| p != primary))
                .unwrap_or(false),
            None => false,
        }
    }

    /// First (index key, primary key) pair in `range` strictly after `after`.
    pub(crate) fn next_entry(
        &self,
        range: Option<&KeyRange>,
        after: Option<(&Key, &Key)>,
    ) -> Option<(Key, Key)> {
        let lower = match after {
            Some((index_key, _)) => Bound::Included(index_key),
            None => range.map(KeyRange::lower_as_bound).unwrap_or(Bound::Unbounded),
        };
        let upper = range.map(KeyRange::upper_as_bound).unwrap_or(Bound::Unbounded);
        let bounds = scan_bounds(lower, upper)?;

        for (index_key, primaries) in self.entries.range::<Key, _>(bounds) {
            let primary = match after {
                Some((after_index, after_primary)) if after_index == index_key => primaries
                    .range::<Key, _>((Bound::Excluded(after_primary), Bound::Unbounded))
                    .next(),
                _ => primaries.iter().next(),
            };
            if let Some(primary) = primary {
                return Some((index_key.clone(), primary.clone()));
            }
        }
        None
    }

    pub(crate) fn count(&self, range: Option<&KeyRange>) -> u64 {
        let lower = range.map(KeyRange::lower_as_bound).unwrap_or(Bound::Unbounded);
        let upper = range.map(KeyRange::upper_as_bound).unwrap_or(Bound::Unbounded);
        match scan_bounds(lower, upper) {
            Some(bounds) => self
                .entries
                .range::<Key, _>(bounds)
                .map(|(_, primaries)| primaries.len() as u64)
                .sum(),
            None => 0,
        }
    }
}

/// A planned insert: the resolved key and the record to store under it.
#[derive(Debug)]
pub(crate) struct PlannedWrite {
    pub key: Key,
    pub value: Value,
}

/// One object store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ObjectStoreData {
    pub options: StoreOptions,
    pub records: BTreeMap<Key, Value>,
    /// Next generated key.
    pub next_key: u64,
    pub indexes: BTreeMap<String, IndexData>,
}

impl ObjectStoreData {
    pub(crate) fn new(options: StoreOptions) -> Self {
        Self {
            options,
            records: BTreeMap::new(),
            next_key: 1,
            indexes: BTreeMap::new(),
        }
    }

    pub(crate) fn index(&self, name: &str) -> Result<&IndexData> {
        self.indexes
            .get(name)
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))
    }

    /// Validate a write and resolve its key without changing anything.
    ///
    /// `overwrite = false` is `add`: an existing key is a constraint error.
    pub(crate) fn plan_write(
        &self,
        mut value: Value,
        explicit_key: Option<Key>,
        overwrite: bool,
    ) -> Result<PlannedWrite> {
        let key = match (&self.options.key_path, explicit_key) {
            (Some(path), Some(_)) => {
                return Err(StoreError::Data(format!(
                    "store uses in-line keys at {}; an explicit key is not allowed",
                    path
                )))
            }
            (Some(path), None) => match path.evaluate(&value)? {
                Some(key) => key,
                None if self.options.auto_increment => {
                    let key = self.generated_key()?;
                    path.inject(&mut value, &key)?;
                    key
                }
                None => {
                    return Err(StoreError::Data(format!(
                        "record has no key at {}",
                        path
                    )))
                }
            },
            (None, Some(key)) => key,
            (None, None) if self.options.auto_increment => self.generated_key()?,
            (None, None) => {
                return Err(StoreError::Data(
                    "store uses out-of-line keys and no key was provided".into(),
                ))
            }
        };

        if !overwrite && self.records.contains_key(&key) {
            return Err(StoreError::Constraint(format!(
                "key {} already exists",
                key
            )));
        }

        for (name, index) in &self.indexes {
            if index.violates_unique(&value, &key) {
                return Err(StoreError::Constraint(format!(
                    "unique index {} already holds this value",
                    name
                )));
            }
        }

        Ok(PlannedWrite { key, value })
    }

    fn generated_key(&self) -> Result<Key> {
        // Keys stay exactly representable as f64.
        if self.next_key > (1u64 << 53) {
            return Err(StoreError::Constraint("key generator exhausted".into()));
        }
        Ok(Key::from(self.next_key))
    }

    /// Validate a new index against existing records.
    pub(crate) fn plan_create_index(&self, spec: &IndexSpec) -> Result<()> {
        if self.indexes.contains_key(&spec.index_name) {
            return Err(StoreError::IndexAlreadyExists(spec.index_name.clone()));
        }
        if spec.unique {
            let mut seen = BTreeSet::new();
            for record in self.records.values() {
                if let Ok(Some(index_key)) = spec.attribute.evaluate(record) {
                    if !seen.insert(index_key) {
                        return Err(StoreError::Constraint(format!(
                            "existing records violate unique index {}",
                            spec.index_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_put(&mut self, key: Key, value: Value) {
        if self.options.auto_increment {
            if let Some(n) = key.as_number() {
                if n >= self.next_key as f64 {
                    self.next_key = (n.floor() as u64).saturating_add(1);
                }
            }
        }

        if let Some(old) = self.records.get(&key) {
            for index in self.indexes.values_mut() {
                index.remove(old, &key);
            }
        }
        for index in self.indexes.values_mut() {
            index.insert(&value, &key);
        }
        self.records.insert(key, value);
    }

    fn apply_delete(&mut self, range: &KeyRange) {
        let keys: Vec<Key> = match scan_bounds(range.lower_as_bound(), range.upper_as_bound()) {
            Some(bounds) => self
                .records
                .range::<Key, _>(bounds)
                .map(|(k, _)| k.clone())
                .collect(),
            None => Vec::new(),
        };

        for key in keys {
            if let Some(old) = self.records.remove(&key) {
                for index in self.indexes.values_mut() {
                    index.remove(&old, &key);
                }
            }
        }
    }

    fn apply_clear(&mut self) {
        self.records.clear();
        for index in self.indexes.values_mut() {
            index.entries.clear();
        }
    }

    fn apply_create_index(&mut self, spec: IndexSpec) {
        let mut index = IndexData::new(spec);
        for (key, record) in &self.records {
            index.insert(record, key);
        }
        self.indexes.insert(index.spec.index_name.clone(), index);
    }

    fn rebuild_indexes(&mut self) {
        for index in self.indexes.values_mut() {
            index.entries.clear();
            for (key, record) in &self.records {
                index.insert(record, key);
            }
        }
    }

    /// First record in `range` strictly after `after`.
    pub(crate) fn next_record(
        &self,
        range: Option<&KeyRange>,
        after: Option<&Key>,
    ) -> Option<(&Key, &Value)> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => range.map(KeyRange::lower_as_bound).unwrap_or(Bound::Unbounded),
        };
        let upper = range.map(KeyRange::upper_as_bound).unwrap_or(Bound::Unbounded);
        let bounds = scan_bounds(lower, upper)?;
        self.records.range::<Key, _>(bounds).next()
    }

    pub(crate) fn count(&self, range: Option<&KeyRange>) -> u64 {
        match range {
            None => self.records.len() as u64,
            Some(range) => match scan_bounds(range.lower_as_bound(), range.upper_as_bound()) {
                Some(bounds) => self.records.range::<Key, _>(bounds).count() as u64,
                None => 0,
            },
        }
    }
}

fn database_mut<'a>(catalog: &'a mut Catalog, name: &str) -> Result<&'a mut DatabaseData> {
    catalog
        .get_mut(name)
        .ok_or_else(|| StoreError::Corruption(format!("database {} does not exist", name)))
}

/// Apply a committed operation to the catalog.
///
/// Operations were validated when planned; a failure here means the log
/// and the data disagree.
pub(crate) fn apply_operation(catalog: &mut Catalog, operation: WalOperation) -> Result<()> {
    match operation {
        WalOperation::SetVersion { database, version } => {
            catalog.entry(database).or_default().version = version;
        }

        WalOperation::DeleteDatabase { database } => {
            catalog.remove(&database);
        }

        WalOperation::CreateStore {
            database,
            store,
            options,
        } => {
            let db = database_mut(catalog, &database)?;
            if db.stores.contains_key(&store) {
                return Err(StoreError::Corruption(format!(
                    "store {} created twice",
                    store
                )));
            }
            db.stores.insert(store, ObjectStoreData::new(options));
        }

        WalOperation::DeleteStore { database, store } => {
            database_mut(catalog, &database)?.stores.remove(&store);
        }

        WalOperation::CreateIndex {
            database,
            store,
            spec,
        } => {
            database_mut(catalog, &database)?
                .store_mut(&store)?
                .apply_create_index(spec);
        }

        WalOperation::DeleteIndex {
            database,
            store,
            index,
        } => {
            database_mut(catalog, &database)?
                .store_mut(&store)?
                .indexes
                .remove(&index);
        }

        WalOperation::Put {
            database,
            store,
            key,
            value,
        } => {
            database_mut(catalog, &database)?
                .store_mut(&store)?
                .apply_put(key, value);
        }

        WalOperation::Delete {
            database,
            store,
            range,
        } => {
            database_mut(catalog, &database)?
                .store_mut(&store)?
                .apply_delete(&range);
        }

        WalOperation::Clear { database, store } => {
            database_mut(catalog, &database)?
                .store_mut(&store)?
                .apply_clear();
        }
    }

    Ok(())
}
