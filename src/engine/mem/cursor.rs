// In-memory cursor over one index tree.
//
// Positions are re-resolved against the tree on every move, so the cursor
// never holds a borrow of the shared map between calls.

use super::MemIndex;
use crate::engine::types::{KeyOrdering, LockResult};
use crate::engine::{Cursor, CursorValue, Transaction, View};
use crate::error::{RemoteError, Result};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct MemCursor {
    index: Arc<MemIndex>,
    txn: Option<Arc<dyn Transaction>>,
    key: Option<Vec<u8>>,
    value: CursorValue,
    autoload: bool,
    counter: Arc<AtomicU64>,
}

impl MemCursor {
    pub(super) fn new(
        index: Arc<MemIndex>,
        txn: Option<Arc<dyn Transaction>>,
        counter: Arc<AtomicU64>,
    ) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        MemCursor {
            index,
            txn,
            key: None,
            value: CursorValue::NotLoaded,
            autoload: true,
            counter,
        }
    }

    fn positioned(&self) -> Result<&[u8]> {
        self.key
            .as_deref()
            .ok_or_else(|| RemoteError::illegal_state("cursor is not positioned"))
    }

    /// Install a new position, apply read locking, and honor autoload.
    fn arrive(&mut self, key: Option<Vec<u8>>) -> Result<LockResult> {
        match key {
            None => {
                self.key = None;
                self.value = CursorValue::Absent;
                Ok(LockResult::Unowned)
            }
            Some(key) => {
                let result = self.index.lock_for_read(self.txn.as_ref(), &key)?;
                if self.autoload {
                    self.value = match self.index.get_value(&key) {
                        Some(v) => CursorValue::Bytes(v),
                        None => CursorValue::Absent,
                    };
                } else {
                    self.value = CursorValue::NotLoaded;
                }
                self.key = Some(key);
                Ok(result)
            }
        }
    }

    fn seek_first(&self) -> Option<Vec<u8>> {
        self.index.with_tree(|tree| tree.keys().next().cloned())
    }

    fn seek_last(&self) -> Option<Vec<u8>> {
        self.index.with_tree(|tree| tree.keys().next_back().cloned())
    }

    fn seek_after(&self, key: &[u8], high: Bound<&[u8]>) -> Option<Vec<u8>> {
        self.index.with_tree(|tree| {
            tree.range::<[u8], _>((Bound::Excluded(key), high))
                .next()
                .map(|(k, _)| k.clone())
        })
    }

    fn seek_before(&self, key: &[u8], low: Bound<&[u8]>) -> Option<Vec<u8>> {
        self.index.with_tree(|tree| {
            tree.range::<[u8], _>((low, Bound::Excluded(key)))
                .next_back()
                .map(|(k, _)| k.clone())
        })
    }
}

impl Cursor for MemCursor {
    fn ordering(&self) -> KeyOrdering {
        self.index.tree_ordering()
    }

    fn link(&mut self, txn: Option<Arc<dyn Transaction>>) {
        self.txn = txn;
    }

    fn linked_txn_id(&self) -> u64 {
        self.txn.as_ref().map(|t| t.id()).unwrap_or(0)
    }

    fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    fn value(&self) -> CursorValue {
        self.value.clone()
    }

    fn set_autoload(&mut self, on: bool) {
        self.autoload = on;
    }

    fn autoload(&self) -> bool {
        self.autoload
    }

    fn first(&mut self) -> Result<LockResult> {
        let key = self.seek_first();
        self.arrive(key)
    }

    fn last(&mut self) -> Result<LockResult> {
        let key = self.seek_last();
        self.arrive(key)
    }

    fn skip(&mut self, amount: i64) -> Result<LockResult> {
        if amount == 0 {
            let key = self.positioned()?.to_vec();
            return self.arrive(Some(key));
        }
        let mut result = LockResult::Unowned;
        for _ in 0..amount.unsigned_abs() {
            result = if amount > 0 { self.next()? } else { self.previous()? };
            if self.key.is_none() {
                break;
            }
        }
        Ok(result)
    }

    fn skip_bounded(
        &mut self,
        amount: i64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult> {
        let Some(limit) = limit else {
            return self.skip(amount);
        };
        if amount == 0 {
            return self.skip(0);
        }
        let mut result = LockResult::Unowned;
        for _ in 0..amount.unsigned_abs() {
            result = if amount > 0 {
                if inclusive {
                    self.next_le(limit)?
                } else {
                    self.next_lt(limit)?
                }
            } else if inclusive {
                self.previous_ge(limit)?
            } else {
                self.previous_gt(limit)?
            };
            if self.key.is_none() {
                break;
            }
        }
        Ok(result)
    }

    fn next(&mut self) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_after(&cur, Bound::Unbounded);
        self.arrive(key)
    }

    fn next_le(&mut self, limit: &[u8]) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_after(&cur, Bound::Included(limit));
        self.arrive(key)
    }

    fn next_lt(&mut self, limit: &[u8]) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_after(&cur, Bound::Excluded(limit));
        self.arrive(key)
    }

    fn previous(&mut self) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_before(&cur, Bound::Unbounded);
        self.arrive(key)
    }

    fn previous_ge(&mut self, limit: &[u8]) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_before(&cur, Bound::Included(limit));
        self.arrive(key)
    }

    fn previous_gt(&mut self, limit: &[u8]) -> Result<LockResult> {
        let cur = self.positioned()?.to_vec();
        let key = self.seek_before(&cur, Bound::Excluded(limit));
        self.arrive(key)
    }

    fn find(&mut self, key: &[u8]) -> Result<LockResult> {
        self.arrive(Some(key.to_vec()))
    }

    fn find_ge(&mut self, key: &[u8]) -> Result<LockResult> {
        let found = self.index.with_tree(|tree| {
            tree.range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
                .next()
                .map(|(k, _)| k.clone())
        });
        self.arrive(found)
    }

    fn find_gt(&mut self, key: &[u8]) -> Result<LockResult> {
        let found = self.seek_after(key, Bound::Unbounded);
        self.arrive(found)
    }

    fn find_le(&mut self, key: &[u8]) -> Result<LockResult> {
        let found = self.index.with_tree(|tree| {
            tree.range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map(|(k, _)| k.clone())
        });
        self.arrive(found)
    }

    fn find_lt(&mut self, key: &[u8]) -> Result<LockResult> {
        let found = self.seek_before(key, Bound::Unbounded);
        self.arrive(found)
    }

    fn find_nearby(&mut self, key: &[u8]) -> Result<LockResult> {
        self.find(key)
    }

    fn random(&mut self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<LockResult> {
        let keys: Vec<Vec<u8>> = self.index.with_tree(|tree| {
            let low_bound = low.map_or(Bound::Unbounded, Bound::Included);
            let high_bound = high.map_or(Bound::Unbounded, Bound::Excluded);
            tree.range::<[u8], _>((low_bound, high_bound))
                .map(|(k, _)| k.clone())
                .collect()
        });
        if keys.is_empty() {
            return self.arrive(None);
        }
        let pick = rand::random_range(0..keys.len());
        self.arrive(Some(keys[pick].clone()))
    }

    fn exists(&mut self) -> Result<bool> {
        let key = self.positioned()?.to_vec();
        Ok(self.index.get_value(&key).is_some())
    }

    fn lock(&mut self) -> Result<LockResult> {
        let key = self.positioned()?.to_vec();
        self.index.lock_for_read(self.txn.as_ref(), &key)
    }

    fn load(&mut self) -> Result<LockResult> {
        let key = self.positioned()?.to_vec();
        let result = self.index.lock_for_read(self.txn.as_ref(), &key)?;
        self.value = match self.index.get_value(&key) {
            Some(v) => CursorValue::Bytes(v),
            None => CursorValue::Absent,
        };
        Ok(result)
    }

    fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        let key = self.positioned()?.to_vec();
        self.index.store(self.txn.as_ref(), &key, value)?;
        self.value = match value {
            Some(v) => CursorValue::Bytes(v.to_vec()),
            None => CursorValue::Absent,
        };
        Ok(())
    }

    fn commit(&mut self, value: Option<&[u8]>) -> Result<()> {
        self.store(value)?;
        if let Some(txn) = &self.txn {
            if !txn.is_bogus() {
                txn.commit()?;
            }
        }
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        self.store(None)
    }

    fn register(&mut self) -> Result<bool> {
        // Redo registration has no meaning for the in-memory engine.
        Ok(false)
    }

    fn unregister(&mut self) {}

    fn value_length(&mut self) -> Result<i64> {
        let key = self.positioned()?.to_vec();
        Ok(self
            .index
            .get_value(&key)
            .map(|v| v.len() as i64)
            .unwrap_or(-1))
    }

    fn set_value_length(&mut self, length: u64) -> Result<()> {
        let key = self.positioned()?.to_vec();
        self.index.value_mutate(self.txn.as_ref(), &key, |value| {
            value.resize(length as usize, 0);
        })?;
        self.value = CursorValue::NotLoaded;
        Ok(())
    }

    fn value_read(&mut self, pos: u64, buf: &mut [u8]) -> Result<i32> {
        let key = self.positioned()?.to_vec();
        let _ = self.index.lock_for_read(self.txn.as_ref(), &key)?;
        match self.index.get_value(&key) {
            None => Ok(-1),
            Some(value) => {
                let pos = pos as usize;
                if pos >= value.len() {
                    return Ok(-1);
                }
                let n = buf.len().min(value.len() - pos);
                buf[..n].copy_from_slice(&value[pos..pos + n]);
                Ok(n as i32)
            }
        }
    }

    fn value_write(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let key = self.positioned()?.to_vec();
        self.index.value_mutate(self.txn.as_ref(), &key, |value| {
            let end = pos as usize + data.len();
            if value.len() < end {
                value.resize(end, 0);
            }
            value[pos as usize..end].copy_from_slice(data);
        })?;
        self.value = CursorValue::NotLoaded;
        Ok(())
    }

    fn value_clear(&mut self, pos: u64, length: u64) -> Result<()> {
        let key = self.positioned()?.to_vec();
        self.index.value_mutate(self.txn.as_ref(), &key, |value| {
            let start = (pos as usize).min(value.len());
            let end = (pos as usize).saturating_add(length as usize).min(value.len());
            value[start..end].fill(0);
        })?;
        self.value = CursorValue::NotLoaded;
        Ok(())
    }

    fn reset(&mut self) {
        self.key = None;
        self.value = CursorValue::NotLoaded;
    }

    fn copy(&self) -> Box<dyn Cursor> {
        self.counter.fetch_add(1, Ordering::Relaxed);
        Box::new(MemCursor {
            index: self.index.clone(),
            txn: self.txn.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            autoload: self.autoload,
            counter: self.counter.clone(),
        })
    }
}

impl Drop for MemCursor {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
