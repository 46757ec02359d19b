//! Consumed interface of the local storage engine.
//!
//! The remote layer treats the engine as a black box: server skeletons call
//! through these traits and never below them. [`mem`] provides the in-memory
//! implementation that stands behind the server in tests and in the bundled
//! server binary.

pub mod mem;
pub mod types;

use crate::error::Result;
use std::any::Any;
use std::sync::Arc;
use types::{DurabilityMode, IndexStats, KeyOrdering, LockMode, LockResult, Stats};

/// Value state observed through a cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    /// Autoload was off and no explicit load has happened.
    NotLoaded,

    /// The key has no associated value.
    Absent,

    /// The loaded value bytes.
    Bytes(Vec<u8>),
}

impl CursorValue {
    pub fn into_option(self) -> Option<Vec<u8>> {
        match self {
            CursorValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// Root engine handle.
pub trait Database: Send + Sync {
    fn open_index(&self, name: &[u8]) -> Result<Arc<dyn Index>>;
    fn find_index(&self, name: &[u8]) -> Result<Option<Arc<dyn Index>>>;
    fn index_by_id(&self, id: u64) -> Result<Option<Arc<dyn Index>>>;
    fn rename_index(&self, index: &dyn Index, new_name: &[u8]) -> Result<()>;

    /// Prepare deletion of an index. The returned handle commits the deletion
    /// when run; dropping it without running leaves the index in place.
    fn delete_index(&self, index: &dyn Index) -> Result<Arc<dyn IndexDeletion>>;

    fn temporary_index(&self) -> Result<Arc<dyn Index>>;

    /// Singleton view mapping index id to index name.
    fn registry(&self) -> Arc<dyn View>;

    /// Singleton view mapping index name to index id.
    fn registry_key_map(&self) -> Arc<dyn View>;

    fn new_transaction(&self, durability: DurabilityMode) -> Arc<dyn Transaction>;

    /// The shared bogus transaction sentinel.
    fn bogus(&self) -> Arc<dyn Transaction>;

    fn custom_writer(&self, name: &str) -> Result<Arc<dyn Handler>>;
    fn prepare_writer(&self, name: &str) -> Result<Arc<dyn Handler>>;

    fn new_sorter(&self) -> Arc<dyn Sorter>;

    fn preallocate(&self, bytes: u64) -> Result<()>;
    fn set_capacity_limit(&self, bytes: i64);
    fn capacity_limit(&self) -> i64;

    fn begin_snapshot(&self) -> Result<Box<dyn Snapshot>>;
    fn create_cache_primer(&self) -> Result<Vec<u8>>;
    fn apply_cache_primer(&self, data: &[u8]) -> Result<()>;

    fn stats(&self) -> Stats;
    fn flush(&self) -> Result<()>;
    fn sync(&self) -> Result<()>;
    fn checkpoint(&self) -> Result<()>;

    fn compact_file(&self, events: Option<&mut dyn CompactionEvents>, target: f64) -> Result<bool>;
    fn verify(&self, events: Option<&mut dyn VerificationEvents>) -> Result<bool>;

    fn is_leader(&self) -> bool;

    /// Invokes `acquired` when leadership is gained (immediately if already
    /// leader) and `lost` once when it is lost.
    fn upon_leader(&self, acquired: Box<dyn FnOnce() + Send>, lost: Box<dyn FnOnce() + Send>);

    fn failover(&self) -> Result<()>;

    fn close(&self) -> Result<()>;
    fn close_cause(&self, cause: &str) -> Result<()>;
    fn is_closed(&self) -> bool;
    fn shutdown(&self) -> Result<()>;
}

/// An ordered mapping from byte-sequence keys to byte-sequence values.
pub trait View: Send + Sync {
    fn ordering(&self) -> KeyOrdering;

    fn new_cursor(&self, txn: Option<Arc<dyn Transaction>>) -> Result<Box<dyn Cursor>>;
    fn new_transaction(&self, durability: DurabilityMode) -> Result<Arc<dyn Transaction>>;

    fn is_empty(&self) -> Result<bool>;
    fn count(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<u64>;

    fn load(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn exists(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool>;

    /// Lock the key for the transaction without loading its value.
    fn touch(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<LockResult>;

    fn store(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()>;
    fn exchange(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>>;
    fn insert(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool>;
    fn replace(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool>;

    /// Store only when the key is already present.
    fn update(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool>;

    /// Store only when the current value equals `old`.
    fn update_with_old(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        old: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool>;

    fn delete(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool>;

    /// Delete only when the current value equals `old`.
    fn remove(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        old: Option<&[u8]>,
    ) -> Result<bool>;

    fn lock_shared(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult>;
    fn try_lock_shared(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult>;
    fn lock_upgradable(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult>;
    fn try_lock_upgradable(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult>;
    fn lock_exclusive(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult>;
    fn try_lock_exclusive(
        &self,
        txn: &Arc<dyn Transaction>,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult>;
    fn lock_check(&self, txn: &Arc<dyn Transaction>, key: &[u8]) -> Result<LockResult>;

    fn is_unmodifiable(&self) -> bool;
    fn is_modify_atomic(&self) -> bool;
}

/// A [`View`] with durable identity and a name.
pub trait Index: View {
    fn id(&self) -> u64;
    fn name(&self) -> Vec<u8>;
    fn name_string(&self) -> String;

    fn analyze(&self) -> Result<IndexStats>;

    /// Evict cached entries in the given range, returning reclaimed bytes.
    fn evict(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<u64>;

    fn verify(&self, events: &mut dyn VerificationEvents) -> Result<bool>;

    fn close(&self) -> Result<()>;
    fn is_closed(&self) -> bool;

    /// Prepare deletion of this index (same contract as
    /// [`Database::delete_index`]).
    fn drop_index(&self) -> Result<Arc<dyn IndexDeletion>>;

    fn is_temporary(&self) -> bool;
}

/// A mutable position over a view, bound to a transaction.
pub trait Cursor: Send {
    fn ordering(&self) -> KeyOrdering;

    fn link(&mut self, txn: Option<Arc<dyn Transaction>>);
    fn linked_txn_id(&self) -> u64;

    fn key(&self) -> Option<&[u8]>;
    fn value(&self) -> CursorValue;
    fn set_autoload(&mut self, on: bool);
    fn autoload(&self) -> bool;

    fn first(&mut self) -> Result<LockResult>;
    fn last(&mut self) -> Result<LockResult>;
    fn skip(&mut self, amount: i64) -> Result<LockResult>;
    fn skip_bounded(
        &mut self,
        amount: i64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult>;
    fn next(&mut self) -> Result<LockResult>;
    fn next_le(&mut self, limit: &[u8]) -> Result<LockResult>;
    fn next_lt(&mut self, limit: &[u8]) -> Result<LockResult>;
    fn previous(&mut self) -> Result<LockResult>;
    fn previous_ge(&mut self, limit: &[u8]) -> Result<LockResult>;
    fn previous_gt(&mut self, limit: &[u8]) -> Result<LockResult>;

    fn find(&mut self, key: &[u8]) -> Result<LockResult>;
    fn find_ge(&mut self, key: &[u8]) -> Result<LockResult>;
    fn find_gt(&mut self, key: &[u8]) -> Result<LockResult>;
    fn find_le(&mut self, key: &[u8]) -> Result<LockResult>;
    fn find_lt(&mut self, key: &[u8]) -> Result<LockResult>;

    /// Hinted find for keys expected to be close to the current position.
    fn find_nearby(&mut self, key: &[u8]) -> Result<LockResult>;

    fn random(&mut self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<LockResult>;

    /// Whether a value exists at the current position.
    fn exists(&mut self) -> Result<bool>;

    fn lock(&mut self) -> Result<LockResult>;
    fn load(&mut self) -> Result<LockResult>;
    fn store(&mut self, value: Option<&[u8]>) -> Result<()>;

    /// Store and commit the linked transaction.
    fn commit(&mut self, value: Option<&[u8]>) -> Result<()>;

    fn delete(&mut self) -> Result<()>;

    fn register(&mut self) -> Result<bool>;
    fn unregister(&mut self);

    fn value_length(&mut self) -> Result<i64>;
    fn set_value_length(&mut self, length: u64) -> Result<()>;
    fn value_read(&mut self, pos: u64, buf: &mut [u8]) -> Result<i32>;
    fn value_write(&mut self, pos: u64, data: &[u8]) -> Result<()>;
    fn value_clear(&mut self, pos: u64, length: u64) -> Result<()>;

    fn reset(&mut self);
    fn copy(&self) -> Box<dyn Cursor>;
}

/// An engine transaction.
pub trait Transaction: Send + Sync {
    fn id(&self) -> u64;
    fn is_bogus(&self) -> bool;

    fn lock_mode(&self) -> LockMode;
    fn set_lock_mode(&self, mode: LockMode);
    fn lock_timeout_nanos(&self) -> u64;
    fn set_lock_timeout_nanos(&self, nanos: u64);
    fn durability_mode(&self) -> DurabilityMode;
    fn set_durability_mode(&self, mode: DurabilityMode);

    /// Fails if the transaction was invalidated by a cause.
    fn check(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;
    fn commit_all(&self) -> Result<()>;
    fn enter(&self) -> Result<()>;
    fn exit(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn reset_cause(&self, cause: &str);
    fn rollback(&self) -> Result<()>;
    fn nesting_depth(&self) -> u32;

    fn lock_shared(&self, index_id: u64, key: &[u8]) -> Result<LockResult>;
    fn try_lock_shared(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult>;
    fn lock_upgradable(&self, index_id: u64, key: &[u8]) -> Result<LockResult>;
    fn try_lock_upgradable(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult>;
    fn lock_exclusive(&self, index_id: u64, key: &[u8]) -> Result<LockResult>;
    fn try_lock_exclusive(&self, index_id: u64, key: &[u8], nanos: u64) -> Result<LockResult>;
    fn lock_check(&self, index_id: u64, key: &[u8]) -> Result<LockResult>;

    fn last_locked_index(&self) -> u64;
    fn last_locked_key(&self) -> Option<Vec<u8>>;

    /// Whether the most recent lock operation acquired a new lock rather
    /// than finding one already owned.
    fn was_acquired(&self) -> bool;

    fn unlock(&self) -> Result<()>;
    fn unlock_to_shared(&self) -> Result<()>;
    fn unlock_combine(&self) -> Result<()>;

    fn attach(&self, attachment: &str);
    fn attachment(&self) -> Option<String>;

    fn flush(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Bulk sorted-ingest pipeline.
pub trait Sorter: Send + Sync {
    fn add(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;
    fn finish(&self) -> Result<Arc<dyn Index>>;

    /// Drain the sorted entries without materializing an index.
    fn finish_scan(&self, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// `(entries added, total expected if known)`.
    fn progress(&self) -> (u64, Option<u64>);

    fn reset(&self) -> Result<()>;
}

/// A point-in-time database snapshot.
pub trait Snapshot: Send + Sync {
    fn length(&self) -> u64;
    fn position(&self) -> u64;
    fn is_compressible(&self) -> bool;
    fn write_to(&self, out: &mut dyn std::io::Write) -> Result<()>;
}

/// A named durability handler (custom redo writer or two-phase prepare
/// writer).
pub trait Handler: Send + Sync {
    fn write(&self, txn: &Arc<dyn Transaction>, message: &[u8]) -> Result<()>;
}

/// One-shot commit of a prepared index deletion.
pub trait IndexDeletion: Send + Sync {
    fn run(&self) -> Result<()>;
}

/// Per-node verification events. Return `false` to stop the walk.
pub trait VerificationEvents: Send {
    fn begin_index(&mut self, id: u64, name: &[u8]) -> bool {
        let _ = (id, name);
        true
    }

    fn node_passed(
        &mut self,
        id: u64,
        level: u8,
        entry_count: u32,
        free_bytes: u32,
        large_value_count: u32,
    ) -> bool;

    fn node_failed(&mut self, id: u64, level: u8, message: &str) -> bool;
}

/// Per-node compaction progress events. Return `false` to stop.
pub trait CompactionEvents: Send {
    fn begin_index(&mut self, id: u64, name: &[u8]) -> bool {
        let _ = (id, name);
        true
    }

    fn node_visited(&mut self, id: u64) -> bool;
}
