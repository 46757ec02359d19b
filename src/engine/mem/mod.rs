//! In-memory implementation of the engine interface.
//!
//! Ordered maps guarded by read-write locks, a shared per-key lock table,
//! and nested transaction scopes with undo. This engine stands behind the
//! server in the bundled binary and in the end-to-end tests.

mod cursor;
mod lock;
mod txn;

pub use cursor::MemCursor;
pub use lock::{LockKind, LockTable};
pub use txn::MemTxn;

use crate::engine::types::{
    DurabilityMode, IndexStats, KeyOrdering, LockMode, LockResult, Stats,
};
use crate::engine::{
    CompactionEvents, Cursor, Database, Handler, Index, IndexDeletion, Snapshot, Sorter,
    Transaction, VerificationEvents, View,
};
use crate::error::{RemoteError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use txn::UndoEntry;

const PAGE_SIZE: u32 = 4096;

/// Values at or above this length count as large for verification stats.
const LARGE_VALUE_THRESHOLD: usize = 4096;

fn mem_txn<'a>(txn: Option<&'a Arc<dyn Transaction>>) -> Result<Option<&'a MemTxn>> {
    match txn {
        None => Ok(None),
        Some(t) => {
            let mem = t
                .as_any()
                .downcast_ref::<MemTxn>()
                .ok_or_else(|| RemoteError::illegal_state("transaction from another database"))?;
            if mem.is_bogus() || mem.lock_mode() == LockMode::Unsafe {
                Ok(None)
            } else {
                Ok(Some(mem))
            }
        }
    }
}

pub struct MemIndex {
    id: u64,
    name: RwLock<Vec<u8>>,
    tree: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
    temporary: bool,
    unmodifiable: bool,
    locks: Arc<LockTable>,
    db: Weak<DbShared>,
    self_ref: Weak<MemIndex>,
}

impl MemIndex {
    fn create(
        id: u64,
        name: Vec<u8>,
        temporary: bool,
        unmodifiable: bool,
        locks: Arc<LockTable>,
        db: Weak<DbShared>,
    ) -> Arc<MemIndex> {
        Arc::new_cyclic(|self_ref| MemIndex {
            id,
            name: RwLock::new(name),
            tree: RwLock::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
            temporary,
            unmodifiable,
            locks,
            db,
            self_ref: self_ref.clone(),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RemoteError::closed_index())
        } else {
            Ok(())
        }
    }

    fn check_modifiable(&self) -> Result<()> {
        self.check_open()?;
        if self.unmodifiable {
            Err(RemoteError::view_constraint("view is unmodifiable"))
        } else {
            Ok(())
        }
    }

    fn arc(&self) -> Arc<MemIndex> {
        self.self_ref.upgrade().expect("index is alive")
    }

    pub(super) fn with_tree<R>(&self, f: impl FnOnce(&BTreeMap<Vec<u8>, Vec<u8>>) -> R) -> R {
        f(&self.tree.read())
    }

    pub(super) fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.read().get(key).cloned()
    }

    pub(super) fn tree_ordering(&self) -> KeyOrdering {
        KeyOrdering::Ascending
    }

    /// Insert bypassing transactions and the unmodifiable flag; used for the
    /// registry views this database maintains itself.
    fn raw_store(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let mut tree = self.tree.write();
        match value {
            Some(v) => {
                tree.insert(key, v);
            }
            None => {
                tree.remove(&key);
            }
        }
    }

    pub(super) fn apply_undo(&self, key: &[u8], prev: Option<Vec<u8>>) {
        let mut tree = self.tree.write();
        match prev {
            Some(v) => {
                tree.insert(key.to_vec(), v);
            }
            None => {
                tree.remove(key);
            }
        }
    }

    /// Apply read locking for the transaction's lock mode.
    pub(super) fn lock_for_read(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
    ) -> Result<LockResult> {
        let Some(t) = mem_txn(txn)? else {
            return Ok(LockResult::Unowned);
        };
        match t.lock_mode() {
            LockMode::Unsafe | LockMode::ReadUncommitted => Ok(LockResult::Unowned),
            LockMode::ReadCommitted => {
                let result = t.acquire_default(self.id, key, LockKind::Shared)?;
                if result == LockResult::Acquired {
                    t.release_latest(self.id, key, LockKind::Shared);
                    Ok(LockResult::Unowned)
                } else {
                    Ok(result)
                }
            }
            LockMode::RepeatableRead => t.acquire_default(self.id, key, LockKind::Shared),
            LockMode::UpgradableRead => t.acquire_default(self.id, key, LockKind::Upgradable),
        }
    }

    /// Write `new` at `key` under the exclusive lock, returning the previous
    /// value.
    fn transactional_store(
        &self,
        txn: Option<&MemTxn>,
        key: &[u8],
        new: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(t) = txn {
            t.acquire_default(self.id, key, LockKind::Exclusive)?;
        }
        let mut tree = self.tree.write();
        let prev = match &new {
            Some(v) => tree.insert(key.to_vec(), v.clone()),
            None => tree.remove(key),
        };
        drop(tree);
        if let Some(t) = txn {
            t.push_undo(UndoEntry {
                index: self.arc(),
                key: key.to_vec(),
                prev: prev.clone(),
            });
        }
        Ok(prev)
    }

    /// Write `new` only when the predicate holds for the current value.
    fn conditional_store(
        &self,
        txn: Option<&MemTxn>,
        key: &[u8],
        new: Option<&[u8]>,
        pred: impl FnOnce(Option<&[u8]>) -> bool,
    ) -> Result<bool> {
        if let Some(t) = txn {
            t.acquire_default(self.id, key, LockKind::Exclusive)?;
        }
        let mut tree = self.tree.write();
        let current = tree.get(key).map(|v| v.as_slice());
        if !pred(current) {
            return Ok(false);
        }
        let prev = match new {
            Some(v) => tree.insert(key.to_vec(), v.to_vec()),
            None => tree.remove(key),
        };
        drop(tree);
        if let Some(t) = txn {
            t.push_undo(UndoEntry {
                index: self.arc(),
                key: key.to_vec(),
                prev,
            });
        }
        Ok(true)
    }

    /// Mutate the value in place under the exclusive lock, creating an empty
    /// value when the key is absent.
    pub(super) fn value_mutate(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        f: impl FnOnce(&mut Vec<u8>),
    ) -> Result<()> {
        self.check_modifiable()?;
        let t = mem_txn(txn)?;
        if let Some(t) = t {
            t.acquire_default(self.id, key, LockKind::Exclusive)?;
        }
        let mut tree = self.tree.write();
        let prev = tree.get(key).cloned();
        let entry = tree.entry(key.to_vec()).or_default();
        f(entry);
        drop(tree);
        if let Some(t) = t {
            t.push_undo(UndoEntry {
                index: self.arc(),
                key: key.to_vec(),
                prev,
            });
        }
        Ok(())
    }

    fn lock_view(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        kind: LockKind,
        nanos: Option<u64>,
    ) -> Result<LockResult> {
        self.check_open()?;
        let Some(t) = mem_txn(Some(txn))? else {
            return Ok(LockResult::Unowned);
        };
        match nanos {
            Some(nanos) => match t.acquire(self.id, key, kind, nanos) {
                Err(RemoteError::LockTimeout { .. }) => Ok(LockResult::TimedOutLock),
                other => other,
            },
            None => t.acquire_default(self.id, key, kind),
        }
    }

    fn verify_walk(&self, events: &mut dyn VerificationEvents) -> Result<bool> {
        self.check_open()?;
        if !events.begin_index(self.id, &self.name.read()) {
            return Ok(false);
        }
        let entries: Vec<(Vec<u8>, usize)> = self
            .tree
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        for (seq, (_key, value_len)) in entries.iter().enumerate() {
            let large = (*value_len >= LARGE_VALUE_THRESHOLD) as u32;
            if !events.node_passed(seq as u64 + 1, 0, 1, 0, large) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl View for MemIndex {
    fn ordering(&self) -> KeyOrdering {
        self.tree_ordering()
    }

    fn new_cursor(&self, txn: Option<Arc<dyn Transaction>>) -> Result<Box<dyn Cursor>> {
        self.check_open()?;
        let counter = match self.db.upgrade() {
            Some(db) => db.cursor_count.clone(),
            None => Arc::new(AtomicU64::new(0)),
        };
        Ok(Box::new(MemCursor::new(self.arc(), txn, counter)))
    }

    fn new_transaction(&self, durability: DurabilityMode) -> Result<Arc<dyn Transaction>> {
        let db = self
            .db
            .upgrade()
            .ok_or_else(|| RemoteError::closed_database())?;
        Ok(db.new_txn(durability))
    }

    fn is_empty(&self) -> Result<bool> {
        self.check_open()?;
        Ok(self.tree.read().is_empty())
    }

    fn count(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<u64> {
        self.check_open()?;
        let tree = self.tree.read();
        let low_bound = low.map_or(Bound::Unbounded, Bound::Included);
        let high_bound = high.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(tree.range::<[u8], _>((low_bound, high_bound)).count() as u64)
    }

    fn load(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.lock_for_read(txn, key)?;
        Ok(self.get_value(key))
    }

    fn exists(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool> {
        self.check_open()?;
        self.lock_for_read(txn, key)?;
        Ok(self.tree.read().contains_key(key))
    }

    fn touch(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<LockResult> {
        self.check_open()?;
        self.lock_for_read(txn, key)
    }

    fn store(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.check_modifiable()?;
        self.transactional_store(mem_txn(txn)?, key, value.map(|v| v.to_vec()))?;
        Ok(())
    }

    fn exchange(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        self.check_modifiable()?;
        self.transactional_store(mem_txn(txn)?, key, value.map(|v| v.to_vec()))
    }

    fn insert(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.check_modifiable()?;
        match value {
            None => {
                // Inserting no value succeeds exactly when the key is absent.
                self.check_open()?;
                Ok(!self.tree.read().contains_key(key))
            }
            Some(_) => {
                self.conditional_store(mem_txn(txn)?, key, value, |current| current.is_none())
            }
        }
    }

    fn replace(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.check_modifiable()?;
        self.conditional_store(mem_txn(txn)?, key, value, |current| current.is_some())
    }

    fn update(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.check_modifiable()?;
        let new = value.map(|v| v.to_vec());
        self.conditional_store(mem_txn(txn)?, key, new.as_deref(), |current| {
            current.is_some() && current != new.as_deref()
        })
    }

    fn update_with_old(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        old: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.check_modifiable()?;
        self.conditional_store(mem_txn(txn)?, key, value, |current| current == old)
    }

    fn delete(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool> {
        self.check_modifiable()?;
        self.conditional_store(mem_txn(txn)?, key, None, |current| current.is_some())
    }

    fn remove(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        old: Option<&[u8]>,
    ) -> Result<bool> {
        self.check_modifiable()?;
        self.conditional_store(mem_txn(txn)?, key, None, |current| current == old)
    }

    fn lock_shared(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Shared, None)
    }

    fn try_lock_shared(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Shared, Some(nanos))
    }

    fn lock_upgradable(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Upgradable, None)
    }

    fn try_lock_upgradable(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Upgradable, Some(nanos))
    }

    fn lock_exclusive(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Exclusive, None)
    }

    fn try_lock_exclusive(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.lock_view(txn, key, LockKind::Exclusive, Some(nanos))
    }

    fn lock_check(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult> {
        self.check_open()?;
        match mem_txn(Some(txn))? {
            Some(t) => t.lock_check(self.id, key),
            None => Ok(LockResult::Unowned),
        }
    }

    fn is_unmodifiable(&self) -> bool {
        self.unmodifiable
    }

    fn is_modify_atomic(&self) -> bool {
        true
    }
}

impl Index for MemIndex {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> Vec<u8> {
        self.name.read().clone()
    }

    fn name_string(&self) -> String {
        String::from_utf8_lossy(&self.name.read()).into_owned()
    }

    fn analyze(&self) -> Result<IndexStats> {
        self.check_open()?;
        let tree = self.tree.read();
        let mut stats = IndexStats {
            entry_count: tree.len() as u64,
            ..IndexStats::default()
        };
        for (k, v) in tree.iter() {
            stats.key_bytes += k.len() as u64;
            stats.value_bytes += v.len() as u64;
        }
        stats.total_bytes = stats.key_bytes + stats.value_bytes;
        Ok(stats)
    }

    fn evict(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<u64> {
        self.check_modifiable()?;
        let keys: Vec<Vec<u8>> = {
            let tree = self.tree.read();
            let low_bound = low.map_or(Bound::Unbounded, Bound::Included);
            let high_bound = high.map_or(Bound::Unbounded, Bound::Excluded);
            tree.range::<[u8], _>((low_bound, high_bound))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let t = mem_txn(txn)?;
        let mut freed = 0u64;
        for key in keys {
            if let Some(prev) = self.transactional_store(t, &key, None)? {
                freed += key.len() as u64 + prev.len() as u64;
            }
        }
        Ok(freed)
    }

    fn verify(&self, events: &mut dyn VerificationEvents) -> Result<bool> {
        self.verify_walk(events)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn drop_index(&self) -> Result<Arc<dyn IndexDeletion>> {
        self.check_open()?;
        if !self.tree.read().is_empty() {
            return Err(RemoteError::illegal_state("index is not empty"));
        }
        Ok(Arc::new(MemDeletion {
            shared: self.db.clone(),
            index: self.arc(),
        }))
    }

    fn is_temporary(&self) -> bool {
        self.temporary
    }
}

struct MemDeletion {
    shared: Weak<DbShared>,
    index: Arc<MemIndex>,
}

impl IndexDeletion for MemDeletion {
    fn run(&self) -> Result<()> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(RemoteError::closed_database)?;
        shared.remove_index(&self.index);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum HandlerKind {
    Custom,
    Prepare,
}

struct MemHandler {
    kind: HandlerKind,
    log: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl Handler for MemHandler {
    fn write(&self, txn: &Arc<dyn Transaction>, message: &[u8]) -> Result<()> {
        txn.check()?;
        if txn.is_bogus() {
            return Err(RemoteError::illegal_state(
                "handler requires a real transaction",
            ));
        }
        if self.kind == HandlerKind::Prepare {
            if let Some(mem) = txn.as_any().downcast_ref::<MemTxn>() {
                mem.mark_prepared();
            }
        }
        self.log.lock().push((txn.id(), message.to_vec()));
        Ok(())
    }
}

struct MemSorter {
    shared: Weak<DbShared>,
    entries: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    finished: AtomicBool,
}

impl MemSorter {
    fn check_active(&self) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            Err(RemoteError::illegal_state("sorter is finished"))
        } else {
            Ok(())
        }
    }

    fn sorted_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = std::mem::take(&mut *self.entries.lock());
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        // Last write per key wins.
        entries.reverse();
        entries.dedup_by(|a, b| a.0 == b.0);
        entries.reverse();
        entries
    }
}

impl Sorter for MemSorter {
    fn add(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_active()?;
        self.entries.lock().push((key, value));
        Ok(())
    }

    fn finish(&self) -> Result<Arc<dyn Index>> {
        self.check_active()?;
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(RemoteError::closed_database)?;
        let index = shared.new_temporary_index();
        let entries = self.sorted_entries();
        {
            let mut tree = index.tree.write();
            for (k, v) in entries {
                tree.insert(k, v);
            }
        }
        self.finished.store(true, Ordering::Release);
        Ok(index)
    }

    fn finish_scan(&self, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check_active()?;
        let mut entries = self.sorted_entries();
        if reverse {
            entries.reverse();
        }
        self.finished.store(true, Ordering::Release);
        Ok(entries)
    }

    fn progress(&self) -> (u64, Option<u64>) {
        (self.entries.lock().len() as u64, None)
    }

    fn reset(&self) -> Result<()> {
        self.entries.lock().clear();
        self.finished.store(false, Ordering::Release);
        Ok(())
    }
}

struct MemSnapshot {
    data: Vec<u8>,
}

impl Snapshot for MemSnapshot {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn position(&self) -> u64 {
        0
    }

    fn is_compressible(&self) -> bool {
        true
    }

    fn write_to(&self, out: &mut dyn std::io::Write) -> Result<()> {
        out.write_all(&self.data)?;
        Ok(())
    }
}

struct DbShared {
    by_name: RwLock<BTreeMap<Vec<u8>, Arc<MemIndex>>>,
    by_id: RwLock<HashMap<u64, Arc<MemIndex>>>,
    next_index_id: AtomicU64,
    next_txn_id: AtomicU64,
    locks: Arc<LockTable>,
    registry: Arc<MemIndex>,
    registry_key_map: Arc<MemIndex>,
    handlers: Mutex<HashMap<(HandlerKind, String), Arc<MemHandler>>>,
    bogus: Arc<MemTxn>,
    capacity_limit: AtomicI64,
    preallocated: AtomicU64,
    closed: AtomicBool,
    close_cause: Mutex<Option<String>>,
    leader: AtomicBool,
    lost_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    txns_created: AtomicU64,
    cursor_count: Arc<AtomicU64>,
}

impl DbShared {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RemoteError::closed_database())
        } else {
            Ok(())
        }
    }

    fn new_txn(&self, durability: DurabilityMode) -> Arc<dyn Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        self.txns_created.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemTxn::new(id, durability, self.locks.clone()))
    }

    fn register(&self, index: &Arc<MemIndex>) {
        let name = index.name.read().clone();
        self.registry
            .raw_store(index.id.to_be_bytes().to_vec(), Some(name.clone()));
        self.registry_key_map
            .raw_store(name, Some(index.id.to_be_bytes().to_vec()));
    }

    fn new_named_index(self: &Arc<Self>, name: &[u8]) -> Arc<MemIndex> {
        let mut by_name = self.by_name.write();
        if let Some(existing) = by_name.get(name) {
            return existing.clone();
        }
        let id = self.next_index_id.fetch_add(1, Ordering::Relaxed);
        let index = MemIndex::create(
            id,
            name.to_vec(),
            false,
            false,
            self.locks.clone(),
            Arc::downgrade(self),
        );
        by_name.insert(name.to_vec(), index.clone());
        drop(by_name);
        self.by_id.write().insert(id, index.clone());
        self.register(&index);
        index
    }

    fn new_temporary_index(self: &Arc<Self>) -> Arc<MemIndex> {
        let id = self.next_index_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(".temporary.{}", id).into_bytes();
        let index = MemIndex::create(
            id,
            name,
            true,
            false,
            self.locks.clone(),
            Arc::downgrade(self),
        );
        self.by_id.write().insert(id, index.clone());
        index
    }

    fn remove_index(&self, index: &Arc<MemIndex>) {
        let name = index.name.read().clone();
        self.by_name.write().remove(&name);
        self.by_id.write().remove(&index.id);
        self.registry
            .raw_store(index.id.to_be_bytes().to_vec(), None);
        self.registry_key_map.raw_store(name, None);
        index.tree.write().clear();
        index.closed.store(true, Ordering::Release);
    }

    fn user_indexes(&self) -> Vec<Arc<MemIndex>> {
        let mut indexes: Vec<Arc<MemIndex>> = self.by_id.read().values().cloned().collect();
        indexes.sort_by_key(|i| i.id);
        indexes
    }
}

/// The in-memory database.
pub struct MemDatabase {
    shared: Arc<DbShared>,
}

impl MemDatabase {
    pub fn new() -> MemDatabase {
        let locks = Arc::new(LockTable::new());
        let shared = Arc::new_cyclic(|weak: &Weak<DbShared>| {
            let registry = MemIndex::create(
                1,
                b".registry".to_vec(),
                false,
                true,
                locks.clone(),
                weak.clone(),
            );
            let registry_key_map = MemIndex::create(
                2,
                b".registry.key.map".to_vec(),
                false,
                true,
                locks.clone(),
                weak.clone(),
            );
            DbShared {
                by_name: RwLock::new(BTreeMap::new()),
                by_id: RwLock::new(HashMap::new()),
                next_index_id: AtomicU64::new(1000),
                next_txn_id: AtomicU64::new(1),
                locks: locks.clone(),
                registry,
                registry_key_map,
                handlers: Mutex::new(HashMap::new()),
                bogus: Arc::new(MemTxn::new_bogus(locks.clone())),
                capacity_limit: AtomicI64::new(-1),
                preallocated: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                close_cause: Mutex::new(None),
                leader: AtomicBool::new(true),
                lost_hooks: Mutex::new(Vec::new()),
                txns_created: AtomicU64::new(0),
                cursor_count: Arc::new(AtomicU64::new(0)),
            }
        });
        MemDatabase { shared }
    }

    fn handler(&self, kind: HandlerKind, name: &str) -> Result<Arc<dyn Handler>> {
        self.shared.check_open()?;
        let mut handlers = self.shared.handlers.lock();
        let handler = handlers
            .entry((kind, name.to_string()))
            .or_insert_with(|| {
                Arc::new(MemHandler {
                    kind,
                    log: Mutex::new(Vec::new()),
                })
            })
            .clone();
        Ok(handler)
    }
}

impl Default for MemDatabase {
    fn default() -> Self {
        MemDatabase::new()
    }
}

impl Database for MemDatabase {
    fn open_index(&self, name: &[u8]) -> Result<Arc<dyn Index>> {
        self.shared.check_open()?;
        if name.starts_with(b".") {
            return Err(RemoteError::view_constraint("index name is reserved"));
        }
        if let Some(index) = self.shared.by_name.read().get(name) {
            return Ok(index.clone());
        }
        Ok(self.shared.new_named_index(name))
    }

    fn find_index(&self, name: &[u8]) -> Result<Option<Arc<dyn Index>>> {
        self.shared.check_open()?;
        Ok(self
            .shared
            .by_name
            .read()
            .get(name)
            .cloned()
            .map(|i| -> Arc<dyn Index> { i }))
    }

    fn index_by_id(&self, id: u64) -> Result<Option<Arc<dyn Index>>> {
        self.shared.check_open()?;
        Ok(self
            .shared
            .by_id
            .read()
            .get(&id)
            .cloned()
            .map(|i| -> Arc<dyn Index> { i }))
    }

    fn rename_index(&self, index: &dyn Index, new_name: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        if new_name.starts_with(b".") {
            return Err(RemoteError::view_constraint("index name is reserved"));
        }
        let target = self
            .shared
            .by_id
            .read()
            .get(&index.id())
            .cloned()
            .ok_or_else(RemoteError::closed_index)?;
        let mut by_name = self.shared.by_name.write();
        if by_name.contains_key(new_name) {
            return Err(RemoteError::illegal_state("index name already in use"));
        }
        let old_name = target.name.read().clone();
        by_name.remove(&old_name);
        by_name.insert(new_name.to_vec(), target.clone());
        drop(by_name);
        *target.name.write() = new_name.to_vec();
        self.shared.registry_key_map.raw_store(old_name, None);
        self.shared.register(&target);
        Ok(())
    }

    fn delete_index(&self, index: &dyn Index) -> Result<Arc<dyn IndexDeletion>> {
        self.shared.check_open()?;
        let target = self
            .shared
            .by_id
            .read()
            .get(&index.id())
            .cloned()
            .ok_or_else(RemoteError::closed_index)?;
        target.closed.store(true, Ordering::Release);
        Ok(Arc::new(MemDeletion {
            shared: Arc::downgrade(&self.shared),
            index: target,
        }))
    }

    fn temporary_index(&self) -> Result<Arc<dyn Index>> {
        self.shared.check_open()?;
        Ok(self.shared.new_temporary_index())
    }

    fn registry(&self) -> Arc<dyn View> {
        self.shared.registry.clone()
    }

    fn registry_key_map(&self) -> Arc<dyn View> {
        self.shared.registry_key_map.clone()
    }

    fn new_transaction(&self, durability: DurabilityMode) -> Arc<dyn Transaction> {
        self.shared.new_txn(durability)
    }

    fn bogus(&self) -> Arc<dyn Transaction> {
        self.shared.bogus.clone()
    }

    fn custom_writer(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handler(HandlerKind::Custom, name)
    }

    fn prepare_writer(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.handler(HandlerKind::Prepare, name)
    }

    fn new_sorter(&self) -> Arc<dyn Sorter> {
        Arc::new(MemSorter {
            shared: Arc::downgrade(&self.shared),
            entries: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
        })
    }

    fn preallocate(&self, bytes: u64) -> Result<()> {
        self.shared.check_open()?;
        self.shared.preallocated.fetch_add(bytes, Ordering::Relaxed);
        Ok(())
    }

    fn set_capacity_limit(&self, bytes: i64) {
        self.shared.capacity_limit.store(bytes, Ordering::Relaxed);
    }

    fn capacity_limit(&self) -> i64 {
        self.shared.capacity_limit.load(Ordering::Relaxed)
    }

    fn begin_snapshot(&self) -> Result<Box<dyn Snapshot>> {
        self.shared.check_open()?;
        let mut data = Vec::new();
        let indexes = self.shared.user_indexes();
        data.extend_from_slice(&(indexes.len() as u32).to_le_bytes());
        for index in indexes {
            data.extend_from_slice(&index.id.to_le_bytes());
            let name = index.name.read().clone();
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(&name);
            let tree = index.tree.read();
            data.extend_from_slice(&(tree.len() as u64).to_le_bytes());
            for (k, v) in tree.iter() {
                data.extend_from_slice(&(k.len() as u32).to_le_bytes());
                data.extend_from_slice(k);
                data.extend_from_slice(&(v.len() as u32).to_le_bytes());
                data.extend_from_slice(v);
            }
        }
        Ok(Box::new(MemSnapshot { data }))
    }

    fn create_cache_primer(&self) -> Result<Vec<u8>> {
        self.shared.check_open()?;
        let by_name = self.shared.by_name.read();
        let mut data = Vec::new();
        data.extend_from_slice(&(by_name.len() as u32).to_le_bytes());
        for name in by_name.keys() {
            data.extend_from_slice(&(name.len() as u32).to_le_bytes());
            data.extend_from_slice(name);
        }
        Ok(data)
    }

    fn apply_cache_primer(&self, data: &[u8]) -> Result<()> {
        self.shared.check_open()?;
        let mut buf = data;
        if buf.len() < 4 {
            return Err(RemoteError::io("truncated cache primer"));
        }
        let count = u32::from_le_bytes(buf[..4].try_into().unwrap());
        buf = &buf[4..];
        for _ in 0..count {
            if buf.len() < 4 {
                return Err(RemoteError::io("truncated cache primer"));
            }
            let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
            buf = &buf[4..];
            if buf.len() < len {
                return Err(RemoteError::io("truncated cache primer"));
            }
            self.open_index(&buf[..len])?;
            buf = &buf[len..];
        }
        Ok(())
    }

    fn stats(&self) -> Stats {
        let mut total_bytes = 0u64;
        let mut open_indexes = 0u32;
        for index in self.shared.user_indexes() {
            open_indexes += 1;
            for (k, v) in index.tree.read().iter() {
                total_bytes += (k.len() + v.len()) as u64;
            }
        }
        let total_pages = total_bytes.div_ceil(PAGE_SIZE as u64);
        Stats {
            page_size: PAGE_SIZE,
            free_pages: 0,
            total_pages,
            cache_pages: total_pages,
            dirty_pages: 0,
            open_indexes,
            lock_count: self.shared.locks.held_count(),
            cursor_count: self.shared.cursor_count.load(Ordering::Relaxed),
            transaction_count: self.shared.txns_created.load(Ordering::Relaxed),
        }
    }

    fn flush(&self) -> Result<()> {
        self.shared.check_open()
    }

    fn sync(&self) -> Result<()> {
        self.shared.check_open()
    }

    fn checkpoint(&self) -> Result<()> {
        self.shared.check_open()
    }

    fn compact_file(&self, events: Option<&mut dyn CompactionEvents>, target: f64) -> Result<bool> {
        self.shared.check_open()?;
        if !(0.0..=1.0).contains(&target) {
            return Err(RemoteError::illegal_state("compaction target out of range"));
        }
        if let Some(events) = events {
            for index in self.shared.user_indexes() {
                if !events.begin_index(index.id, &index.name.read()) {
                    return Ok(false);
                }
                let count = index.tree.read().len();
                for seq in 0..count {
                    if !events.node_visited(seq as u64 + 1) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn verify(&self, events: Option<&mut dyn VerificationEvents>) -> Result<bool> {
        self.shared.check_open()?;
        let Some(events) = events else {
            return Ok(true);
        };
        for index in self.shared.user_indexes() {
            if !index.verify_walk(events)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_leader(&self) -> bool {
        self.shared.leader.load(Ordering::Acquire)
    }

    fn upon_leader(&self, acquired: Box<dyn FnOnce() + Send>, lost: Box<dyn FnOnce() + Send>) {
        if self.is_leader() {
            acquired();
            self.shared.lost_hooks.lock().push(lost);
        } else {
            // Leadership is never re-acquired by this engine; hold both until
            // failover drops them.
            self.shared.lost_hooks.lock().push(lost);
            drop(acquired);
        }
    }

    fn failover(&self) -> Result<()> {
        self.shared.check_open()?;
        self.shared.leader.store(false, Ordering::Release);
        let hooks = std::mem::take(&mut *self.shared.lost_hooks.lock());
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn close_cause(&self, cause: &str) -> Result<()> {
        *self.shared.close_cause.lock() = Some(cause.to_string());
        self.close()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn shutdown(&self) -> Result<()> {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<MemDatabase> {
        Arc::new(MemDatabase::new())
    }

    #[test]
    fn test_open_and_find() {
        let db = db();
        let a = db.open_index(b"people").unwrap();
        assert!(a.id() >= 1000);
        let b = db.find_index(b"people").unwrap().unwrap();
        assert_eq!(a.id(), b.id());
        assert!(db.find_index(b"missing").unwrap().is_none());
        let c = db.index_by_id(a.id()).unwrap().unwrap();
        assert_eq!(c.name(), b"people");
    }

    #[test]
    fn test_registry_views() {
        let db = db();
        let index = db.open_index(b"reg").unwrap();
        let registry = db.registry();
        let name = registry
            .load(None, &index.id().to_be_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(name, b"reg");
        let id = db.registry_key_map().load(None, b"reg").unwrap().unwrap();
        assert_eq!(id, index.id().to_be_bytes());
        assert!(registry.store(None, b"x", Some(&b"y"[..])).is_err());
    }

    #[test]
    fn test_store_load_round_trip() {
        let db = db();
        let index = db.open_index(b"kv").unwrap();
        index.store(None, b"k1", Some(&b"v1"[..])).unwrap();
        assert_eq!(index.load(None, b"k1").unwrap().unwrap(), b"v1");
        assert!(index.exists(None, b"k1").unwrap());
        index.store(None, b"k1", None).unwrap();
        assert!(index.load(None, b"k1").unwrap().is_none());
    }

    #[test]
    fn test_conditional_ops() {
        let db = db();
        let index = db.open_index(b"cond").unwrap();
        assert!(index.insert(None, b"k", Some(&b"a"[..])).unwrap());
        assert!(!index.insert(None, b"k", Some(&b"b"[..])).unwrap());
        assert!(index.replace(None, b"k", Some(&b"b"[..])).unwrap());
        assert!(index
            .update_with_old(None, b"k", Some(&b"b"[..]), Some(&b"c"[..]))
            .unwrap());
        assert!(!index
            .update_with_old(None, b"k", Some(&b"b"[..]), Some(&b"d"[..]))
            .unwrap());
        assert!(!index.remove(None, b"k", Some(&b"zzz"[..])).unwrap());
        assert!(index.remove(None, b"k", Some(&b"c"[..])).unwrap());
        assert!(!index.replace(None, b"k", Some(&b"x"[..])).unwrap());
    }

    #[test]
    fn test_txn_rollback_restores() {
        let db = db();
        let index = db.open_index(b"undo").unwrap();
        index.store(None, b"k", Some(&b"before"[..])).unwrap();
        let txn = db.new_transaction(DurabilityMode::Sync);
        index.store(Some(&txn), b"k", Some(&b"after"[..])).unwrap();
        assert_eq!(index.load(None, b"k").unwrap().unwrap(), b"after");
        txn.exit().unwrap();
        assert_eq!(index.load(None, b"k").unwrap().unwrap(), b"before");
    }

    #[test]
    fn test_txn_commit_releases_locks() {
        let db = db();
        let index = db.open_index(b"locks").unwrap();
        let txn = db.new_transaction(DurabilityMode::Sync);
        index.store(Some(&txn), b"k", Some(&b"v"[..])).unwrap();
        let other = db.new_transaction(DurabilityMode::Sync);
        other.set_lock_timeout_nanos(2_000_000);
        assert!(index.load(Some(&other), b"k").is_err());
        txn.commit().unwrap();
        assert_eq!(index.load(Some(&other), b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_nested_scopes() {
        let db = db();
        let index = db.open_index(b"nest").unwrap();
        let txn = db.new_transaction(DurabilityMode::Sync);
        index.store(Some(&txn), b"a", Some(&b"1"[..])).unwrap();
        txn.enter().unwrap();
        assert_eq!(txn.nesting_depth(), 1);
        index.store(Some(&txn), b"b", Some(&b"2"[..])).unwrap();
        txn.exit().unwrap();
        assert_eq!(txn.nesting_depth(), 0);
        assert!(index.load(None, b"b").unwrap().is_none());
        assert_eq!(index.load(None, b"a").unwrap().unwrap(), b"1");
        txn.commit().unwrap();
    }

    #[test]
    fn test_bogus_txn() {
        let db = db();
        let bogus = db.bogus();
        assert!(bogus.is_bogus());
        assert!(bogus.enter().is_err());
        let index = db.open_index(b"bog").unwrap();
        index.store(Some(&bogus), b"k", Some(&b"v"[..])).unwrap();
        assert_eq!(index.load(Some(&bogus), b"k").unwrap().unwrap(), b"v");
    }

    #[test]
    fn test_cursor_scan() {
        let db = db();
        let index = db.open_index(b"scan").unwrap();
        index.store(None, b"k1", Some(&b"v1"[..])).unwrap();
        index.store(None, b"k2", Some(&b"v2"[..])).unwrap();
        index.store(None, b"k3", Some(&b"v3"[..])).unwrap();
        let mut cursor = index.new_cursor(None).unwrap();
        cursor.first().unwrap();
        assert_eq!(cursor.key().unwrap(), b"k1");
        cursor.next().unwrap();
        assert_eq!(cursor.key().unwrap(), b"k2");
        cursor.last().unwrap();
        assert_eq!(cursor.key().unwrap(), b"k3");
        assert_eq!(cursor.value(), crate::engine::CursorValue::Bytes(b"v3".to_vec()));
        cursor.previous().unwrap();
        assert_eq!(cursor.key().unwrap(), b"k2");
    }

    #[test]
    fn test_sorter() {
        let db = db();
        let sorter = db.new_sorter();
        sorter.add(b"b".to_vec(), b"2".to_vec()).unwrap();
        sorter.add(b"a".to_vec(), b"1".to_vec()).unwrap();
        sorter.add(b"a".to_vec(), b"9".to_vec()).unwrap();
        let index = sorter.finish().unwrap();
        assert!(index.is_temporary());
        assert_eq!(index.load(None, b"a").unwrap().unwrap(), b"9");
        assert_eq!(index.count(None, None).unwrap(), 2);
        assert!(sorter.add(b"c".to_vec(), b"3".to_vec()).is_err());
    }

    #[test]
    fn test_verify_counts_nodes() {
        let db = db();
        let index = db.open_index(b"nodes").unwrap();
        for i in 0..100u32 {
            index
                .store(None, format!("k{:04}", i).as_bytes(), Some(&b"v"[..]))
                .unwrap();
        }
        struct Counting(u64);
        impl VerificationEvents for Counting {
            fn node_passed(&mut self, _: u64, _: u8, _: u32, _: u32, _: u32) -> bool {
                self.0 += 1;
                true
            }
            fn node_failed(&mut self, _: u64, _: u8, _: &str) -> bool {
                panic!("no failures expected");
            }
        }
        let mut events = Counting(0);
        assert!(index.verify(&mut events).unwrap());
        assert_eq!(events.0, 100);
    }

    #[test]
    fn test_snapshot_bytes() {
        let db = db();
        let index = db.open_index(b"snap").unwrap();
        index.store(None, b"k", Some(&b"v"[..])).unwrap();
        let snapshot = db.begin_snapshot().unwrap();
        assert!(snapshot.length() > 0);
        let mut out = Vec::new();
        snapshot.write_to(&mut out).unwrap();
        assert_eq!(out.len() as u64, snapshot.length());
    }

    #[test]
    fn test_close_rejects_ops() {
        let db = db();
        db.close().unwrap();
        assert!(db.is_closed());
        assert!(db.open_index(b"x").is_err());
    }

    #[test]
    fn test_leader_hooks() {
        let db = db();
        let acquired = Arc::new(AtomicBool::new(false));
        let lost = Arc::new(AtomicBool::new(false));
        let a = acquired.clone();
        let l = lost.clone();
        db.upon_leader(
            Box::new(move || a.store(true, Ordering::Release)),
            Box::new(move || l.store(true, Ordering::Release)),
        );
        assert!(acquired.load(Ordering::Acquire));
        assert!(!lost.load(Ordering::Acquire));
        db.failover().unwrap();
        assert!(lost.load(Ordering::Acquire));
        assert!(!db.is_leader());
    }
}
