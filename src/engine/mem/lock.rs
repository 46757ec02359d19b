// Per-key lock table shared by every index of one in-memory database.

use crate::engine::types::LockResult;
use crate::error::{RemoteError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Requested strength of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Default)]
struct LockEntry {
    exclusive: Option<u64>,
    upgradable: Option<u64>,
    shared: HashSet<u64>,
}

impl LockEntry {
    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.upgradable.is_none() && self.shared.is_empty()
    }

    fn owned_result(&self, txn: u64) -> LockResult {
        if self.exclusive == Some(txn) {
            LockResult::OwnedExclusive
        } else if self.upgradable == Some(txn) {
            LockResult::OwnedUpgradable
        } else if self.shared.contains(&txn) {
            LockResult::OwnedShared
        } else {
            LockResult::Unowned
        }
    }

    /// A transaction other than `txn` that currently blocks it, if any.
    fn blocker(&self, txn: u64, kind: LockKind) -> Option<u64> {
        if let Some(owner) = self.exclusive {
            if owner != txn {
                return Some(owner);
            }
        }
        match kind {
            LockKind::Shared => None,
            LockKind::Upgradable | LockKind::Exclusive => {
                if let Some(owner) = self.upgradable {
                    if owner != txn {
                        return Some(owner);
                    }
                }
                if kind == LockKind::Exclusive {
                    self.shared.iter().copied().find(|&t| t != txn)
                } else {
                    None
                }
            }
        }
    }
}

pub struct LockTable {
    entries: Mutex<HashMap<(u64, Vec<u8>), LockEntry>>,
    cond: Condvar,
    attachments: Mutex<HashMap<u64, String>>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            entries: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_attachment(&self, txn: u64, attachment: String) {
        self.attachments.lock().insert(txn, attachment);
    }

    pub fn attachment(&self, txn: u64) -> Option<String> {
        self.attachments.lock().get(&txn).cloned()
    }

    /// Number of keys with at least one holder.
    pub fn held_count(&self) -> u64 {
        self.entries.lock().len() as u64
    }

    /// Acquire a lock, waiting up to `timeout_nanos`.
    ///
    /// Already-owned locks report their ownership without waiting. A shared
    /// owner requesting a stronger lock fails with a lock-failure error
    /// instead of deadlocking against itself.
    pub fn acquire(
        &self,
        txn: u64,
        index_id: u64,
        key: &[u8],
        kind: LockKind,
        timeout_nanos: u64,
    ) -> Result<LockResult> {
        let deadline = Instant::now() + Duration::from_nanos(timeout_nanos);
        let map_key = (index_id, key.to_vec());
        let mut entries = self.entries.lock();
        loop {
            let entry = entries.entry(map_key.clone()).or_default();

            let owned = entry.owned_result(txn);
            match (owned, kind) {
                (LockResult::OwnedExclusive, _) => return Ok(LockResult::OwnedExclusive),
                (LockResult::OwnedUpgradable, LockKind::Shared | LockKind::Upgradable) => {
                    return Ok(LockResult::OwnedUpgradable)
                }
                (LockResult::OwnedShared, LockKind::Shared) => return Ok(LockResult::OwnedShared),
                (LockResult::OwnedShared, _) => {
                    return Err(RemoteError::lock_failure(
                        "illegal upgrade from a shared lock",
                    ));
                }
                _ => {}
            }

            match entry.blocker(txn, kind) {
                None => {
                    let upgraded = owned == LockResult::OwnedUpgradable;
                    match kind {
                        LockKind::Shared => {
                            entry.shared.insert(txn);
                        }
                        LockKind::Upgradable => entry.upgradable = Some(txn),
                        LockKind::Exclusive => {
                            entry.upgradable = None;
                            entry.shared.remove(&txn);
                            entry.exclusive = Some(txn);
                        }
                    }
                    return Ok(if upgraded {
                        LockResult::Upgraded
                    } else {
                        LockResult::Acquired
                    });
                }
                Some(blocking_owner) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let attachment = self.attachments.lock().get(&blocking_owner).cloned();
                        return Err(RemoteError::LockTimeout {
                            nanos_timeout: timeout_nanos,
                            attachment,
                            frames: vec![crate::frame!("acquire")],
                        });
                    }
                    let timed_out = self
                        .cond
                        .wait_until(&mut entries, deadline)
                        .timed_out();
                    if timed_out {
                        // Re-check once more under the lock before reporting.
                        continue;
                    }
                }
            }
        }
    }

    /// Release one lock level held by `txn`.
    pub fn release(&self, txn: u64, index_id: u64, key: &[u8], kind: LockKind) {
        let map_key = (index_id, key.to_vec());
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&map_key) {
            match kind {
                LockKind::Shared => {
                    entry.shared.remove(&txn);
                }
                LockKind::Upgradable => {
                    if entry.upgradable == Some(txn) {
                        entry.upgradable = None;
                    }
                }
                LockKind::Exclusive => {
                    if entry.exclusive == Some(txn) {
                        entry.exclusive = None;
                    }
                }
            }
            if entry.is_free() {
                entries.remove(&map_key);
            }
        }
        self.cond.notify_all();
    }

    /// Downgrade the strongest lock held on a key to shared.
    pub fn downgrade_to_shared(&self, txn: u64, index_id: u64, key: &[u8]) {
        let map_key = (index_id, key.to_vec());
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&map_key) {
            if entry.exclusive == Some(txn) {
                entry.exclusive = None;
                entry.shared.insert(txn);
            }
            if entry.upgradable == Some(txn) {
                entry.upgradable = None;
                entry.shared.insert(txn);
            }
        }
        self.cond.notify_all();
    }

    /// Release every lock level `txn` holds on a key.
    pub fn release_all(&self, txn: u64, index_id: u64, key: &[u8]) {
        let map_key = (index_id, key.to_vec());
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&map_key) {
            entry.shared.remove(&txn);
            if entry.upgradable == Some(txn) {
                entry.upgradable = None;
            }
            if entry.exclusive == Some(txn) {
                entry.exclusive = None;
            }
            if entry.is_free() {
                entries.remove(&map_key);
            }
        }
        self.cond.notify_all();
    }

    pub fn check(&self, txn: u64, index_id: u64, key: &[u8]) -> LockResult {
        let entries = self.entries.lock();
        match entries.get(&(index_id, key.to_vec())) {
            Some(entry) => entry.owned_result(txn),
            None => LockResult::Unowned,
        }
    }

    pub fn forget(&self, txn: u64) {
        self.attachments.lock().remove(&txn);
    }
}

impl Default for LockTable {
    fn default() -> Self {
        LockTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_acquire_and_owned() {
        let table = LockTable::new();
        let r = table.acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS).unwrap();
        assert_eq!(r, LockResult::Acquired);
        let r = table.acquire(1, 7, b"k", LockKind::Shared, 10 * MS).unwrap();
        assert_eq!(r, LockResult::OwnedExclusive);
        assert_eq!(table.check(1, 7, b"k"), LockResult::OwnedExclusive);
    }

    #[test]
    fn test_conflict_times_out() {
        let table = LockTable::new();
        table.acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS).unwrap();
        let err = table
            .acquire(2, 7, b"k", LockKind::Shared, 5 * MS)
            .unwrap_err();
        assert!(matches!(err, RemoteError::LockTimeout { .. }));
    }

    #[test]
    fn test_shared_coexists() {
        let table = LockTable::new();
        assert_eq!(
            table.acquire(1, 7, b"k", LockKind::Shared, 10 * MS).unwrap(),
            LockResult::Acquired
        );
        assert_eq!(
            table.acquire(2, 7, b"k", LockKind::Shared, 10 * MS).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn test_upgrade_path() {
        let table = LockTable::new();
        table
            .acquire(1, 7, b"k", LockKind::Upgradable, 10 * MS)
            .unwrap();
        let r = table
            .acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS)
            .unwrap();
        assert_eq!(r, LockResult::Upgraded);
    }

    #[test]
    fn test_illegal_upgrade_from_shared() {
        let table = LockTable::new();
        table.acquire(1, 7, b"k", LockKind::Shared, 10 * MS).unwrap();
        assert!(table
            .acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS)
            .is_err());
    }

    #[test]
    fn test_release_unblocks() {
        let table = LockTable::new();
        table.acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS).unwrap();
        table.release(1, 7, b"k", LockKind::Exclusive);
        assert_eq!(
            table.acquire(2, 7, b"k", LockKind::Exclusive, 10 * MS).unwrap(),
            LockResult::Acquired
        );
    }

    #[test]
    fn test_downgrade() {
        let table = LockTable::new();
        table.acquire(1, 7, b"k", LockKind::Exclusive, 10 * MS).unwrap();
        table.downgrade_to_shared(1, 7, b"k");
        assert_eq!(table.check(1, 7, b"k"), LockResult::OwnedShared);
        assert_eq!(
            table.acquire(2, 7, b"k", LockKind::Shared, 10 * MS).unwrap(),
            LockResult::Acquired
        );
    }
}
