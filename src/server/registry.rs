// Per-session directory of exported server objects.
//
// Every remote handle a client can address lives here under a 64-bit
// session-local identity. Identities are meaningless across sessions.

use super::proxy::{RowProxy, ServerTable};
use crate::engine::{
    Cursor, Database, Handler, Index, IndexDeletion, Snapshot, Sorter, Transaction, View,
};
use crate::error::{RemoteError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Identity of the root database handle, fixed for every session.
pub const ROOT_HANDLE: u64 = 1;

/// The server-side object a skeleton dispatches into.
pub(crate) enum Remote {
    Db(Arc<dyn Database>),
    View(Arc<dyn View>),
    Index(Arc<dyn Index>),
    Cursor(Mutex<Box<dyn Cursor>>),
    Txn(Arc<dyn Transaction>),
    Table(Arc<ServerTable>),
    Proxy(Arc<RowProxy>),
    Sorter(Arc<dyn Sorter>),
    Snapshot(Mutex<Option<Box<dyn Snapshot>>>),
    Deletion(Arc<dyn IndexDeletion>),
    Handler(Arc<dyn Handler>),
}

impl Remote {
    fn kind_name(&self) -> &'static str {
        match self {
            Remote::Db(_) => "database",
            Remote::View(_) => "view",
            Remote::Index(_) => "index",
            Remote::Cursor(_) => "cursor",
            Remote::Txn(_) => "transaction",
            Remote::Table(_) => "table",
            Remote::Proxy(_) => "row proxy",
            Remote::Sorter(_) => "sorter",
            Remote::Snapshot(_) => "snapshot",
            Remote::Deletion(_) => "index deletion",
            Remote::Handler(_) => "handler",
        }
    }
}

/// One exported handle: the target object plus any deferred batched failure.
pub(crate) struct Skeleton {
    pub id: u64,
    pub remote: Remote,
    /// Failure of an earlier batched call, surfaced by the next non-batched
    /// call on this handle.
    pub deferred: Mutex<Option<RemoteError>>,
}

impl Skeleton {
    pub fn take_deferred(&self) -> Option<RemoteError> {
        self.deferred.lock().take()
    }

    pub fn defer(&self, error: RemoteError) {
        let mut slot = self.deferred.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

pub(crate) struct Registry {
    handles: DashMap<u64, Arc<Skeleton>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            handles: DashMap::new(),
            next_id: AtomicU64::new(ROOT_HANDLE),
        }
    }

    /// Export an object, allocating its session-local identity.
    pub fn export(&self, remote: Remote) -> Arc<Skeleton> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let skeleton = Arc::new(Skeleton {
            id,
            remote,
            deferred: Mutex::new(None),
        });
        self.handles.insert(id, skeleton.clone());
        skeleton
    }

    pub fn get(&self, id: u64) -> Result<Arc<Skeleton>> {
        self.handles
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RemoteError::illegal_state(format!("handle {} is disposed", id)))
    }

    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    /// Remove a handle, applying the per-kind dispose action.
    pub fn dispose(&self, id: u64) {
        if let Some((_, skeleton)) = self.handles.remove(&id) {
            dispose_action(&skeleton);
        }
    }

    /// Remove a handle without any dispose action (terminal calls that
    /// already consumed the object).
    pub fn remove(&self, id: u64) {
        self.handles.remove(&id);
    }

    /// Session-aware detach: reset live transactions and cursors, schedule
    /// temporary index deletion, drop everything else.
    pub fn detach_all(&self, engine: &Arc<dyn Database>) {
        let ids: Vec<u64> = self.handles.iter().map(|e| *e.key()).collect();
        for id in ids {
            let Some((_, skeleton)) = self.handles.remove(&id) else {
                continue;
            };
            match &skeleton.remote {
                Remote::Txn(txn) => {
                    if !txn.is_bogus() {
                        let _ = txn.reset();
                    }
                }
                Remote::Cursor(cursor) => cursor.lock().reset(),
                Remote::Index(index) if index.is_temporary() => {
                    match engine.delete_index(index.as_ref()) {
                        Ok(deletion) => {
                            if let Err(e) = deletion.run() {
                                debug!(error = %e, "temporary index cleanup failed");
                            }
                        }
                        Err(e) => debug!(error = %e, "temporary index cleanup failed"),
                    }
                }
                _ => {}
            }
        }
    }
}

fn dispose_action(skeleton: &Skeleton) {
    match &skeleton.remote {
        Remote::Txn(txn) => {
            if !txn.is_bogus() {
                let _ = txn.reset();
            }
        }
        Remote::Cursor(cursor) => cursor.lock().reset(),
        _ => {}
    }
    debug!(
        handle = skeleton.id,
        kind = skeleton.remote.kind_name(),
        "handle disposed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mem::MemDatabase;

    #[test]
    fn test_export_assigns_sequential_ids() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let registry = Registry::new();
        let root = registry.export(Remote::Db(db.clone()));
        assert_eq!(root.id, ROOT_HANDLE);
        let txn = registry.export(Remote::Txn(db.new_transaction(Default::default())));
        assert_eq!(txn.id, ROOT_HANDLE + 1);
        assert_eq!(registry.live_handles(), 2);
    }

    #[test]
    fn test_disposed_handle_is_gone() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let registry = Registry::new();
        let skeleton = registry.export(Remote::Db(db));
        registry.dispose(skeleton.id);
        assert!(registry.get(skeleton.id).is_err());
    }

    #[test]
    fn test_deferred_error_is_taken_once() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let registry = Registry::new();
        let skeleton = registry.export(Remote::Db(db));
        skeleton.defer(RemoteError::illegal_state("first"));
        skeleton.defer(RemoteError::illegal_state("second"));
        match skeleton.take_deferred() {
            Some(RemoteError::IllegalState { message, .. }) => assert_eq!(message, "first"),
            other => panic!("unexpected deferred state: {:?}", other.map(|e| e.to_string())),
        }
        assert!(skeleton.take_deferred().is_none());
    }

    #[test]
    fn test_detach_resets_transactions() {
        let db: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let registry = Registry::new();
        let txn = db.new_transaction(Default::default());
        txn.enter().unwrap();
        registry.export(Remote::Txn(txn.clone()));
        registry.detach_all(&db);
        assert_eq!(registry.live_handles(), 0);
        assert_eq!(txn.nesting_depth(), 0);
    }
}
