//! Ledger engine: BTreeMap-backed object stores.
//!
//! - Each object store maps an auto-incremented `u64` key to a JSON object
//! - Inline keys are written into the object at the store's key path
//! - Non-unique secondary indices map a field's sort key to primary keys
//! - Writes are staged on copies of the touched stores and only become
//!   visible after the resulting snapshot has been persisted
//! - Opening with a higher version runs an additive upgrade callback

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Backend;
use crate::error::StoreError;

// ── Key encoding ────────────────────────────────────────────

/// Encode an indexable field into an ordered sort key.
///
/// Unsigned numbers sort before strings; other JSON values are not indexed.
pub fn sort_key(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| format!("N{:020}", n)),
        Value::String(s) => Some(format!("S{}", s)),
        _ => None,
    }
}

/// Extract a field by key path (dot notation: "a.b.c").
fn get_field<'v>(value: &'v Value, key_path: &str) -> Option<&'v Value> {
    key_path
        .split('.')
        .try_fold(value, |current, part| current.get(part))
}

// ── Persisted form ──────────────────────────────────────────

/// Serialized image of a whole database, as written by a [`Backend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub version: u32,
    #[serde(default)]
    pub stores: BTreeMap<String, StoreSnapshot>,
}

/// Serialized image of one object store. Index contents are rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    #[serde(default)]
    pub key_path: Option<String>,
    pub next_key: u64,
    /// index name → key path
    #[serde(default)]
    pub indices: BTreeMap<String, String>,
    #[serde(default)]
    pub records: BTreeMap<u64, Value>,
}

// ── Object store ────────────────────────────────────────────

/// A secondary index.
#[derive(Debug, Clone)]
struct Index {
    key_path: String,
    /// indexed-value sort key → primary keys
    entries: BTreeMap<String, BTreeSet<u64>>,
}

impl Index {
    fn new(key_path: &str) -> Self {
        Self {
            key_path: String::from(key_path),
            entries: BTreeMap::new(),
        }
    }

    fn insert(&mut self, key: u64, value: &Value) {
        if let Some(sort) = get_field(value, &self.key_path).and_then(sort_key) {
            self.entries.entry(sort).or_default().insert(key);
        }
    }

    fn remove(&mut self, key: u64, value: &Value) {
        if let Some(sort) = get_field(value, &self.key_path).and_then(sort_key) {
            if let Some(keys) = self.entries.get_mut(&sort) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.entries.remove(&sort);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct ObjectStore {
    key_path: Option<String>,
    next_key: u64,
    records: BTreeMap<u64, Value>,
    indices: BTreeMap<String, Index>,
}

impl ObjectStore {
    fn new(key_path: Option<&str>) -> Self {
        Self {
            key_path: key_path.map(String::from),
            next_key: 1,
            records: BTreeMap::new(),
            indices: BTreeMap::new(),
        }
    }

    fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut store = Self {
            key_path: snapshot.key_path,
            next_key: snapshot.next_key.max(1),
            records: snapshot.records,
            indices: BTreeMap::new(),
        };
        for (name, key_path) in &snapshot.indices {
            store.build_index(name, key_path);
        }
        store
    }

    fn to_snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            key_path: self.key_path.clone(),
            next_key: self.next_key,
            indices: self
                .indices
                .iter()
                .map(|(name, idx)| (name.clone(), idx.key_path.clone()))
                .collect(),
            records: self.records.clone(),
        }
    }

    fn build_index(&mut self, name: &str, key_path: &str) {
        let mut index = Index::new(key_path);
        for (key, value) in &self.records {
            index.insert(*key, value);
        }
        self.indices.insert(String::from(name), index);
    }

    /// Write `key` into the object at the inline key path, if the store has one.
    fn stamp_key(&self, value: &mut Value, key: u64) -> Result<(), StoreError> {
        if let Some(path) = &self.key_path {
            let object = value
                .as_object_mut()
                .ok_or_else(|| StoreError::Data(String::from("inline keys require an object")))?;
            object.insert(path.clone(), Value::from(key));
        }
        Ok(())
    }

    fn add(&mut self, mut value: Value) -> Result<u64, StoreError> {
        let inline = self
            .key_path
            .as_deref()
            .and_then(|path| get_field(&value, path))
            .and_then(Value::as_u64);

        let key = match inline {
            Some(key) if self.records.contains_key(&key) => {
                return Err(StoreError::Constraint { key });
            }
            Some(key) => key,
            None => self.next_key,
        };

        self.stamp_key(&mut value, key)?;
        self.next_key = self.next_key.max(key.saturating_add(1));
        for index in self.indices.values_mut() {
            index.insert(key, &value);
        }
        self.records.insert(key, value);
        Ok(key)
    }

    fn replace(&mut self, key: u64, mut value: Value) -> Result<bool, StoreError> {
        if !self.records.contains_key(&key) {
            return Ok(false);
        }
        self.stamp_key(&mut value, key)?;
        if let Some(old) = self.records.get(&key) {
            for index in self.indices.values_mut() {
                index.remove(key, old);
                index.insert(key, &value);
            }
        }
        self.records.insert(key, value);
        Ok(true)
    }

    fn delete(&mut self, key: u64) -> Option<Value> {
        let old = self.records.remove(&key)?;
        for index in self.indices.values_mut() {
            index.remove(key, &old);
        }
        Some(old)
    }
}

// ── Transactions ────────────────────────────────────────────

/// Transaction isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// A transaction scoped to a fixed set of object stores.
///
/// Reads see the transaction's own staged writes. Nothing is visible to other
/// transactions until [`Database::write`] has persisted the result.
pub struct Transaction<'a> {
    mode: TransactionMode,
    scope: Vec<String>,
    committed: &'a BTreeMap<String, ObjectStore>,
    staged: BTreeMap<String, ObjectStore>,
}

impl<'a> Transaction<'a> {
    fn new(
        mode: TransactionMode,
        scope: &[&str],
        committed: &'a BTreeMap<String, ObjectStore>,
    ) -> Self {
        Self {
            mode,
            scope: scope.iter().map(|s| String::from(*s)).collect(),
            committed,
            staged: BTreeMap::new(),
        }
    }

    /// Transaction mode.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn check_scope(&self, name: &str) -> Result<(), StoreError> {
        if self.scope.iter().any(|s| s == name) {
            Ok(())
        } else {
            Err(StoreError::OutOfScope {
                name: String::from(name),
            })
        }
    }

    fn store(&self, name: &str) -> Result<&ObjectStore, StoreError> {
        self.check_scope(name)?;
        self.staged
            .get(name)
            .or_else(|| self.committed.get(name))
            .ok_or_else(|| StoreError::NoSuchStore {
                name: String::from(name),
            })
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut ObjectStore, StoreError> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(StoreError::ReadOnly);
        }
        self.check_scope(name)?;
        let committed = self.committed;
        match self.staged.entry(String::from(name)) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let current = committed.get(name).ok_or_else(|| StoreError::NoSuchStore {
                    name: String::from(name),
                })?;
                Ok(entry.insert(current.clone()))
            }
        }
    }

    /// Insert a new record, returning its primary key.
    ///
    /// An inline key already present on the value is used as-is; otherwise the
    /// store's key generator assigns one.
    pub fn add(&mut self, store: &str, value: Value) -> Result<u64, StoreError> {
        self.store_mut(store)?.add(value)
    }

    /// Get a record by key.
    pub fn get(&self, store: &str, key: u64) -> Result<Option<Value>, StoreError> {
        Ok(self.store(store)?.records.get(&key).cloned())
    }

    /// All records in key order.
    pub fn get_all(&self, store: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.store(store)?.records.values().cloned().collect())
    }

    /// Overwrite an existing record. Returns `false` (and writes nothing) when
    /// no record with that key exists.
    pub fn replace(&mut self, store: &str, key: u64, value: Value) -> Result<bool, StoreError> {
        // Avoid staging a copy when the record is already gone.
        if !self.store(store)?.records.contains_key(&key) {
            return Ok(false);
        }
        self.store_mut(store)?.replace(key, value)
    }

    /// Remove a record, returning it if it existed.
    pub fn delete(&mut self, store: &str, key: u64) -> Result<Option<Value>, StoreError> {
        if !self.store(store)?.records.contains_key(&key) {
            return Ok(None);
        }
        Ok(self.store_mut(store)?.delete(key))
    }

    /// Number of records in a store.
    pub fn count(&self, store: &str) -> Result<usize, StoreError> {
        Ok(self.store(store)?.records.len())
    }

    /// All records ordered by a secondary index, then by primary key.
    ///
    /// Records without an indexable value at the index's key path are omitted.
    pub fn index_get_all(&self, store: &str, index: &str) -> Result<Vec<Value>, StoreError> {
        let object_store = self.store(store)?;
        let idx = object_store
            .indices
            .get(index)
            .ok_or_else(|| StoreError::NoSuchIndex {
                store: String::from(store),
                index: String::from(index),
            })?;
        Ok(idx
            .entries
            .values()
            .flatten()
            .filter_map(|key| object_store.records.get(key))
            .cloned()
            .collect())
    }
}

// ── Version change ──────────────────────────────────────────

/// Handle given to the upgrade callback when a database is opened with a
/// higher version than the one persisted.
///
/// Only additive operations are offered, and each is idempotent.
pub struct VersionChange<'a> {
    state: &'a mut State,
}

impl VersionChange<'_> {
    /// Whether a store exists.
    pub fn has_store(&self, name: &str) -> bool {
        self.state.stores.contains_key(name)
    }

    /// Create a store if it is missing. Returns `true` when it was created.
    pub fn ensure_store(&mut self, name: &str, key_path: Option<&str>) -> bool {
        if self.state.stores.contains_key(name) {
            return false;
        }
        self.state
            .stores
            .insert(String::from(name), ObjectStore::new(key_path));
        true
    }

    /// Create an index if it is missing, building it from existing records.
    pub fn ensure_index(
        &mut self,
        store: &str,
        index: &str,
        key_path: &str,
    ) -> Result<bool, StoreError> {
        let object_store =
            self.state
                .stores
                .get_mut(store)
                .ok_or_else(|| StoreError::NoSuchStore {
                    name: String::from(store),
                })?;
        if object_store.indices.contains_key(index) {
            return Ok(false);
        }
        object_store.build_index(index, key_path);
        Ok(true)
    }
}

// ── Database ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct State {
    version: u32,
    stores: BTreeMap<String, ObjectStore>,
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            version: snapshot.version,
            stores: snapshot
                .stores
                .into_iter()
                .map(|(name, store)| (name, ObjectStore::from_snapshot(store)))
                .collect(),
        }
    }

    fn to_snapshot(&self, name: &str) -> Snapshot {
        Snapshot {
            name: String::from(name),
            version: self.version,
            stores: self
                .stores
                .iter()
                .map(|(store_name, store)| (store_name.clone(), store.to_snapshot()))
                .collect(),
        }
    }
}

/// An open, versioned database persisted through a [`Backend`].
///
/// Writers are serialized on `commit`, which is held across the backend
/// save. `state` is only held while a transaction reads or stages, so
/// readers see the last committed state while a save is in progress.
pub struct Database {
    name: String,
    backend: Box<dyn Backend>,
    commit: Mutex<()>,
    state: Mutex<State>,
}

impl Database {
    /// Open a database, upgrading it to `version` if the persisted copy is older.
    ///
    /// `upgrade` receives the previously stored version (0 for a fresh
    /// database). Opening a database whose stored version is higher than
    /// `version` fails with [`StoreError::Version`].
    pub fn open<B, F>(backend: B, name: &str, version: u32, upgrade: F) -> Result<Self, StoreError>
    where
        B: Backend + 'static,
        F: FnOnce(&mut VersionChange<'_>, u32) -> Result<(), StoreError>,
    {
        let mut state = match backend.load()? {
            Some(snapshot) if snapshot.version > version => {
                return Err(StoreError::Version {
                    stored: snapshot.version,
                    requested: version,
                });
            }
            Some(snapshot) => State::from_snapshot(snapshot),
            None => State::default(),
        };

        if state.version < version {
            let old_version = state.version;
            info!(
                "upgrading database {} from version {} to {}",
                name, old_version, version
            );
            upgrade(&mut VersionChange { state: &mut state }, old_version)?;
            state.version = version;
            backend.save(&state.to_snapshot(name))?;
        }

        debug!(
            "opened database {} v{} with stores {:?}",
            name,
            state.version,
            state.stores.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            name: String::from(name),
            backend: Box::new(backend),
            commit: Mutex::new(()),
            state: Mutex::new(state),
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current schema version.
    pub fn version(&self) -> u32 {
        self.state.lock().version
    }

    /// Names of all object stores.
    pub fn store_names(&self) -> Vec<String> {
        self.state.lock().stores.keys().cloned().collect()
    }

    /// Run a read-only transaction over `scope`.
    pub fn read<R>(
        &self,
        scope: &[&str],
        op: impl FnOnce(&Transaction<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let state = self.state.lock();
        let tx = Transaction::new(TransactionMode::ReadOnly, scope, &state.stores);
        op(&tx)
    }

    /// Run a read-write transaction over `scope`.
    ///
    /// The staged stores are persisted before they replace the committed
    /// ones; if `op` or the backend fails, nothing changes.
    pub fn write<R>(
        &self,
        scope: &[&str],
        op: impl FnOnce(&mut Transaction<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let _commit = self.commit.lock();

        let (result, staged, snapshot) = {
            let state = self.state.lock();
            let mut tx = Transaction::new(TransactionMode::ReadWrite, scope, &state.stores);
            let result = op(&mut tx)?;
            let staged = tx.staged;
            if staged.is_empty() {
                return Ok(result);
            }
            let snapshot = Snapshot {
                name: self.name.clone(),
                version: state.version,
                stores: state
                    .stores
                    .iter()
                    .map(|(name, store)| {
                        let store = staged.get(name).unwrap_or(store);
                        (name.clone(), store.to_snapshot())
                    })
                    .collect(),
            };
            (result, staged, snapshot)
        };

        // No other writer can run until `_commit` drops, so the committed
        // stores cannot change between staging and publishing.
        self.backend.save(&snapshot)?;

        self.state.lock().stores.extend(staged);
        Ok(result)
    }
}

// ── Tests ───────────────────────────────────────────────────
