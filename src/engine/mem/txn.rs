// In-memory transaction: nested scopes with undo, a lock stack, and the
// three configurable mode fields.

use super::lock::{LockKind, LockTable};
use super::MemIndex;
use crate::engine::types::{DurabilityMode, LockMode, LockResult};
use crate::engine::Transaction;
use crate::error::{RemoteError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default lock timeout: one second, matching the engine default.
pub const DEFAULT_LOCK_TIMEOUT_NANOS: u64 = 1_000_000_000;

pub(super) struct UndoEntry {
    pub index: Arc<MemIndex>,
    pub key: Vec<u8>,
    pub prev: Option<Vec<u8>>,
}

#[derive(Clone)]
pub(super) struct HeldLock {
    pub index_id: u64,
    pub key: Vec<u8>,
    pub kind: LockKind,
}

struct Scope {
    undo: Vec<UndoEntry>,
    lock_mark: usize,
}

struct TxnState {
    lock_mode: LockMode,
    durability: DurabilityMode,
    borked: Option<String>,
    scopes: Vec<Scope>,
    locks: Vec<HeldLock>,
    last_locked: Option<(u64, Vec<u8>)>,
    was_acquired: bool,
    attachment: Option<String>,
    prepared: bool,
}

pub struct MemTxn {
    id: u64,
    bogus: bool,
    table: Arc<LockTable>,
    timeout_nanos: AtomicU64,
    state: Mutex<TxnState>,
}

impl MemTxn {
    pub(super) fn new(id: u64, durability: DurabilityMode, table: Arc<LockTable>) -> Self {
        MemTxn {
            id,
            bogus: false,
            table,
            timeout_nanos: AtomicU64::new(DEFAULT_LOCK_TIMEOUT_NANOS),
            state: Mutex::new(TxnState {
                lock_mode: LockMode::default(),
                durability,
                borked: None,
                scopes: vec![Scope {
                    undo: Vec::new(),
                    lock_mark: 0,
                }],
                locks: Vec::new(),
                last_locked: None,
                was_acquired: false,
                attachment: None,
                prepared: false,
            }),
        }
    }

    pub(super) fn new_bogus(table: Arc<LockTable>) -> Self {
        let mut txn = MemTxn::new(0, DurabilityMode::NoRedo, table);
        txn.bogus = true;
        txn
    }

    pub(super) fn is_prepared(&self) -> bool {
        self.state.lock().prepared
    }

    pub(super) fn mark_prepared(&self) {
        self.state.lock().prepared = true;
    }

    /// Record a write so the enclosing scope can undo it.
    pub(super) fn push_undo(&self, entry: UndoEntry) {
        let mut state = self.state.lock();
        state
            .scopes
            .last_mut()
            .expect("transaction always has a scope")
            .undo
            .push(entry);
    }

    /// Acquire a lock and track it on the current scope's lock stack.
    pub(super) fn acquire(
        &self,
        index_id: u64,
        key: &[u8],
        kind: LockKind,
        nanos: u64,
    ) -> Result<LockResult> {
        if self.bogus {
            return Ok(LockResult::Unowned);
        }
        self.check()?;
        let result = self.table.acquire(self.id, index_id, key, kind, nanos)?;
        let mut state = self.state.lock();
        state.last_locked = Some((index_id, key.to_vec()));
        state.was_acquired = !result.already_owned();
        if !result.already_owned() {
            state.locks.push(HeldLock {
                index_id,
                key: key.to_vec(),
                kind,
            });
        }
        Ok(result)
    }

    pub(super) fn acquire_default(
        &self,
        index_id: u64,
        key: &[u8],
        kind: LockKind,
    ) -> Result<LockResult> {
        let nanos = self.timeout_nanos.load(Ordering::Relaxed);
        self.acquire(index_id, key, kind, nanos)
    }

    /// Release a held shared lock taken for a read-committed read.
    pub(super) fn release_latest(&self, index_id: u64, key: &[u8], kind: LockKind) {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .locks
            .iter()
            .rposition(|l| l.index_id == index_id && l.key == key && l.kind == kind)
        {
            state.locks.remove(pos);
        }
        drop(state);
        self.table.release(self.id, index_id, key, kind);
    }

    fn undo_scope(&self, state: &mut TxnState) {
        let scope = state.scopes.last_mut().expect("scope");
        // Undo in reverse application order.
        while let Some(entry) = scope.undo.pop() {
            entry.index.apply_undo(&entry.key, entry.prev);
        }
        let mark = scope.lock_mark;
        while state.locks.len() > mark {
            if let Some(lock) = state.locks.pop() {
                self.table.release_all(self.id, lock.index_id, &lock.key);
            }
        }
    }

    fn release_scope_locks(&self, state: &mut TxnState, mark: usize) {
        while state.locks.len() > mark {
            if let Some(lock) = state.locks.pop() {
                self.table.release_all(self.id, lock.index_id, &lock.key);
            }
        }
    }
}

impl Transaction for MemTxn {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_bogus(&self) -> bool {
        self.bogus
    }

    fn lock_mode(&self) -> LockMode {
        self.state.lock().lock_mode
    }

    fn set_lock_mode(&self, mode: LockMode) {
        self.state.lock().lock_mode = mode;
    }

    fn lock_timeout_nanos(&self) -> u64 {
        self.timeout_nanos.load(Ordering::Relaxed)
    }

    fn set_lock_timeout_nanos(&self, nanos: u64) {
        self.timeout_nanos.store(nanos, Ordering::Relaxed);
    }

    fn durability_mode(&self) -> DurabilityMode {
        self.state.lock().durability
    }

    fn set_durability_mode(&self, mode: DurabilityMode) {
        self.state.lock().durability = mode;
    }

    fn check(&self) -> Result<()> {
        match &self.state.lock().borked {
            Some(cause) => Err(RemoteError::invalid_transaction(cause.clone())),
            None => Ok(()),
        }
    }

    fn commit(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        self.check()?;
        let mut state = self.state.lock();
        if state.scopes.len() == 1 {
            let scope = state.scopes.last_mut().expect("scope");
            scope.undo.clear();
            self.release_scope_locks(&mut state, 0);
            state.prepared = false;
        } else {
            // Nested commit: the parent scope takes ownership of the undo so
            // an outer rollback still reverts it.
            let scope = state.scopes.pop().expect("scope");
            state
                .scopes
                .last_mut()
                .expect("parent scope")
                .undo
                .extend(scope.undo);
            let mark = state.locks.len();
            state.scopes.push(Scope {
                undo: Vec::new(),
                lock_mark: mark,
            });
        }
        Ok(())
    }

    fn commit_all(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        self.check()?;
        let mut state = self.state.lock();
        state.scopes.clear();
        state.scopes.push(Scope {
            undo: Vec::new(),
            lock_mark: 0,
        });
        self.release_scope_locks(&mut state, 0);
        state.prepared = false;
        Ok(())
    }

    fn enter(&self) -> Result<()> {
        if self.bogus {
            return Err(RemoteError::illegal_state(
                "bogus transaction cannot enter a scope",
            ));
        }
        self.check()?;
        let mut state = self.state.lock();
        let mark = state.locks.len();
        state.scopes.push(Scope {
            undo: Vec::new(),
            lock_mark: mark,
        });
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.undo_scope(&mut state);
        if state.scopes.len() > 1 {
            state.scopes.pop();
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut state = self.state.lock();
        while state.scopes.len() > 1 {
            self.undo_scope(&mut state);
            state.scopes.pop();
        }
        self.undo_scope(&mut state);
        state.prepared = false;
        Ok(())
    }

    fn reset_cause(&self, cause: &str) {
        if self.bogus {
            return;
        }
        let _ = self.reset();
        self.state.lock().borked = Some(cause.to_string());
    }

    fn rollback(&self) -> Result<()> {
        if self.bogus {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.undo_scope(&mut state);
        Ok(())
    }

    fn nesting_depth(&self) -> u32 {
        (self.state.lock().scopes.len() - 1) as u32
    }

    fn lock_shared(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.acquire_default(index_id, key, LockKind::Shared)
    }

    fn try_lock_shared(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult> {
        match self.acquire(index_id, key, LockKind::Shared, nanos) {
            Err(RemoteError::LockTimeout { .. }) => Ok(LockResult::TimedOutLock),
            other => other,
        }
    }

    fn lock_upgradable(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.acquire_default(index_id, key, LockKind::Upgradable)
    }

    fn try_lock_upgradable(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult> {
        match self.acquire(index_id, key, LockKind::Upgradable, nanos) {
            Err(RemoteError::LockTimeout { .. }) => Ok(LockResult::TimedOutLock),
            other => other,
        }
    }

    fn lock_exclusive(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.acquire_default(index_id, key, LockKind::Exclusive)
    }

    fn try_lock_exclusive(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult> {
        match self.acquire(index_id, key, LockKind::Exclusive, nanos) {
            Err(RemoteError::LockTimeout { .. }) => Ok(LockResult::TimedOutLock),
            other => other,
        }
    }

    fn lock_check(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        if self.bogus {
            return Ok(LockResult::Unowned);
        }
        Ok(self.table.check(self.id, index_id, key))
    }

    fn last_locked_index(&self) -> u64 {
        self.state
            .lock()
            .last_locked
            .as_ref()
            .map(|(index, _)| *index)
            .unwrap_or(0)
    }

    fn last_locked_key(&self) -> Option<Vec<u8>> {
        self.state.lock().last_locked.as_ref().map(|(_, k)| k.clone())
    }

    fn was_acquired(&self) -> bool {
        self.state.lock().was_acquired
    }

    fn unlock(&self) -> Result<()> {
        let mut state = self.state.lock();
        let lock = state
            .locks
            .pop()
            .ok_or_else(|| RemoteError::illegal_state("no lock to release"))?;
        drop(state);
        self.table.release_all(self.id, lock.index_id, &lock.key);
        Ok(())
    }

    fn unlock_to_shared(&self) -> Result<()> {
        let mut state = self.state.lock();
        let lock = state
            .locks
            .last_mut()
            .ok_or_else(|| RemoteError::illegal_state("no lock to downgrade"))?;
        let (index_id, key) = (lock.index_id, lock.key.clone());
        lock.kind = LockKind::Shared;
        drop(state);
        self.table.downgrade_to_shared(self.id, index_id, &key);
        Ok(())
    }

    fn unlock_combine(&self) -> Result<()> {
        // Combining merges the two most recent lock scopes so one unlock
        // releases both. The in-memory table releases per key, so the merged
        // pair is modeled by dropping the stack entry of the older lock.
        let mut state = self.state.lock();
        if state.locks.len() < 2 {
            return Err(RemoteError::illegal_state("nothing to combine"));
        }
        let top = state.locks.pop().expect("top lock");
        state.locks.pop();
        state.locks.push(top);
        Ok(())
    }

    fn attach(&self, attachment: &str) {
        self.state.lock().attachment = Some(attachment.to_string());
        self.table.set_attachment(self.id, attachment.to_string());
    }

    fn attachment(&self) -> Option<String> {
        self.state.lock().attachment.clone()
    }

    fn flush(&self) -> Result<()> {
        self.check()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if !self.bogus {
            let _ = self.reset();
            self.table.forget(self.id);
        }
    }
}
