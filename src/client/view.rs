// Remote view and index proxies.
//
// An index is a view with identity and a name: the index proxy composes the
// view proxy instead of inheriting from it, and the extra selectors share
// the view's opcode space.

use super::cursor::Cursor;
use super::observer::{process_verify_relay, VerificationObserver};
use super::session::{Restore, SessionInner};
use super::stub::Stub;
use super::table::Table;
use super::txn::Transaction;
use crate::engine::types::{DurabilityMode, IndexStats, KeyOrdering, LockResult, RowDescriptor};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_bytes, get_opt_bytes, get_u64, get_u8};
use crate::protocol::{DbOp, DeletionOp, ViewOp};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Resolve a transaction argument to its server handle id; 0 means none.
pub(crate) async fn txn_id(
    session: &Arc<SessionInner>,
    txn: Option<&Transaction>,
) -> Result<u64> {
    match txn {
        None => Ok(0),
        Some(txn) => txn.inner.ensure_id(session).await,
    }
}

/// How a plain view stub was obtained; singleton views restore by replaying
/// their lookup.
pub(crate) enum ViewCapture {
    Plain,
    Registry,
    RegistryKeyMap,
}

pub(crate) struct ViewInner {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) stub: Stub,
    capture: ViewCapture,
    ordering: OnceCell<KeyOrdering>,
    unmodifiable: OnceCell<bool>,
    modify_atomic: OnceCell<bool>,
}

/// A remote ordered view of byte-sequence keys and values.
#[derive(Clone)]
pub struct View {
    pub(crate) inner: Arc<ViewInner>,
}

impl PartialEq for View {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

fn put_key(msg: &mut BytesMut, key: &[u8]) {
    msg.put_u32_le(key.len() as u32);
    msg.put_slice(key);
}

fn put_opt(msg: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            msg.put_u8(1);
            put_key(msg, v);
        }
        None => msg.put_u8(0),
    }
}

impl View {
    pub(crate) fn from_handle(session: Arc<SessionInner>, handle: u64, epoch: u64) -> View {
        View::with_capture(session, handle, epoch, ViewCapture::Plain)
    }

    pub(crate) fn with_capture(
        session: Arc<SessionInner>,
        handle: u64,
        epoch: u64,
        capture: ViewCapture,
    ) -> View {
        View {
            inner: Arc::new(ViewInner {
                stub: Stub::new(session.clone(), handle, epoch),
                session,
                capture,
                ordering: OnceCell::new(),
                unmodifiable: OnceCell::new(),
                modify_atomic: OnceCell::new(),
            }),
        }
    }

    /// Key ordering; fetched once and cached on the stub.
    pub async fn ordering(&self) -> Result<KeyOrdering> {
        if let Some(ordering) = self.inner.ordering.get() {
            return Ok(*ordering);
        }
        let mut reply = self.inner.stub.invoke(ViewOp::Ordering as u8, |_| {}).await?;
        let ordering = KeyOrdering::from_u8(get_u8(&mut reply)?);
        let _ = self.inner.ordering.set(ordering);
        Ok(ordering)
    }

    pub async fn new_cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::NewCursor as u8, |msg| {
                msg.put_u64_le(txn_handle);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        Ok(Cursor::attached(
            self.clone(),
            txn.cloned(),
            handle,
            self.inner.session.epoch(),
            txn_handle,
        ))
    }

    /// A cursor positioned at `key` with autoload off, for value access.
    pub async fn new_accessor(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Cursor> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::NewAccessor as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        Ok(Cursor::accessor(
            self.clone(),
            txn.cloned(),
            handle,
            self.inner.session.epoch(),
            txn_handle,
            key.to_vec(),
        ))
    }

    pub async fn new_transaction(&self, durability: DurabilityMode) -> Result<Transaction> {
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::NewTransaction as u8, |msg| {
                msg.put_u8(durability as u8);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        Ok(Transaction::new(
            self.inner.session.clone(),
            handle,
            self.inner.session.epoch(),
            durability,
        ))
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let mut reply = self.inner.stub.invoke(ViewOp::IsEmpty as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    pub async fn count(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<u64> {
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Count as u8, |msg| {
                put_opt(msg, low);
                put_opt(msg, high);
            })
            .await?;
        get_u64(&mut reply)
    }

    pub async fn load(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Load as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        get_opt_bytes(&mut reply)
    }

    pub async fn exists(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Exists as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn touch(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<LockResult> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Touch as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    pub async fn store(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        self.inner
            .stub
            .invoke(ViewOp::Store as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                put_opt(msg, value);
            })
            .await?;
        Ok(())
    }

    pub async fn exchange(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Exchange as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                put_opt(msg, value);
            })
            .await?;
        get_opt_bytes(&mut reply)
    }

    async fn conditional(
        &self,
        op: ViewOp,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                put_opt(msg, value);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.conditional(ViewOp::Insert, txn, key, value).await
    }

    pub async fn replace(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.conditional(ViewOp::Replace, txn, key, value).await
    }

    pub async fn update(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.conditional(ViewOp::Update, txn, key, value).await
    }

    pub async fn update_with_old(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        old: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::UpdateWithOld as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                put_opt(msg, old);
                put_opt(msg, value);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Delete as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn remove(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        old: Option<&[u8]>,
    ) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::Remove as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                put_opt(msg, old);
            })
            .await?;
        get_bool(&mut reply)
    }

    async fn lock_op(&self, op: ViewOp, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        let txn_handle = txn_id(&self.inner.session, Some(txn)).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
            })
            .await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    async fn try_lock_op(
        &self,
        op: ViewOp,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        let txn_handle = txn_id(&self.inner.session, Some(txn)).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, key);
                msg.put_u64_le(nanos);
            })
            .await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    pub async fn lock_shared(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.lock_op(ViewOp::LockShared, txn, key).await
    }

    pub async fn try_lock_shared(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(ViewOp::TryLockShared, txn, key, nanos).await
    }

    pub async fn lock_upgradable(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.lock_op(ViewOp::LockUpgradable, txn, key).await
    }

    pub async fn try_lock_upgradable(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(ViewOp::TryLockUpgradable, txn, key, nanos)
            .await
    }

    pub async fn lock_exclusive(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.lock_op(ViewOp::LockExclusive, txn, key).await
    }

    pub async fn try_lock_exclusive(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(ViewOp::TryLockExclusive, txn, key, nanos)
            .await
    }

    pub async fn lock_check(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.lock_op(ViewOp::LockCheck, txn, key).await
    }

    pub async fn is_unmodifiable(&self) -> Result<bool> {
        if let Some(value) = self.inner.unmodifiable.get() {
            return Ok(*value);
        }
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::IsUnmodifiable as u8, |_| {})
            .await?;
        let value = get_bool(&mut reply)?;
        let _ = self.inner.unmodifiable.set(value);
        Ok(value)
    }

    pub async fn is_modify_atomic(&self) -> Result<bool> {
        if let Some(value) = self.inner.modify_atomic.get() {
            return Ok(*value);
        }
        let mut reply = self
            .inner
            .stub
            .invoke(ViewOp::IsModifyAtomic as u8, |_| {})
            .await?;
        let value = get_bool(&mut reply)?;
        let _ = self.inner.modify_atomic.set(value);
        Ok(value)
    }
}

impl Drop for ViewInner {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}

#[async_trait]
impl Restore for ViewInner {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        let op = match self.capture {
            ViewCapture::Plain => return Ok(()),
            ViewCapture::Registry => DbOp::Registry,
            ViewCapture::RegistryKeyMap => DbOp::RegistryKeyMap,
        };
        let (stale, _) = self.stub.snapshot().await;
        let epoch = session.epoch();
        match super::database::root_call(session, op as u8, |_| {}).await {
            Ok(mut reply) => {
                let handle = get_u64(&mut reply)?;
                self.stub.install_over(stale, handle, epoch).await;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                self.stub.mark_broken(e.to_string()).await;
                Ok(())
            }
        }
    }
}

/// How an index stub was obtained; replayed to restore it after a reconnect.
pub(crate) enum IndexCapture {
    Open(Vec<u8>),
    Find(Vec<u8>),
    ById(u64),
    /// Temporary and sorter-produced indexes die with their session.
    Unrestorable,
}

pub(crate) struct IndexInner {
    pub(crate) view: View,
    capture: IndexCapture,
    id: AtomicU64,
    name: Mutex<Vec<u8>>,
}

/// A remote index: a view with a durable identity and a name.
#[derive(Clone)]
pub struct Index {
    pub(crate) inner: Arc<IndexInner>,
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl Index {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        handle: u64,
        epoch: u64,
        id: u64,
        name: Vec<u8>,
        capture: IndexCapture,
    ) -> Index {
        Index {
            inner: Arc::new(IndexInner {
                view: View::from_handle(session, handle, epoch),
                capture,
                id: AtomicU64::new(id),
                name: Mutex::new(name),
            }),
        }
    }

    /// The underlying view proxy.
    pub fn as_view(&self) -> &View {
        &self.inner.view
    }

    /// Engine-assigned identity; cached at proxy creation.
    pub fn id(&self) -> u64 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub fn name(&self) -> Vec<u8> {
        self.inner.name.lock().clone()
    }

    pub fn name_string(&self) -> String {
        String::from_utf8_lossy(&self.name()).into_owned()
    }

    /// Interpret this index through a row descriptor.
    pub async fn as_table(&self, descriptor: Arc<RowDescriptor>) -> Result<Table> {
        let descriptor_bytes = descriptor.content_key();
        let mut reply = self
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::AsTable as u8, |msg| {
                put_key(msg, &descriptor_bytes);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        Ok(Table::new(
            self.clone(),
            descriptor,
            handle,
            self.inner.view.inner.session.epoch(),
        ))
    }

    pub async fn evict(
        &self,
        txn: Option<&Transaction>,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
    ) -> Result<u64> {
        let session = &self.inner.view.inner.session;
        let txn_handle = txn_id(session, txn).await?;
        let mut reply = self
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::Evict as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_opt(msg, low);
                put_opt(msg, high);
            })
            .await?;
        get_u64(&mut reply)
    }

    pub async fn analyze(&self) -> Result<IndexStats> {
        let mut reply = self
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::Analyze as u8, |_| {})
            .await?;
        IndexStats::decode(&mut reply)
    }

    /// Verify this index, relaying node events to the local observer.
    pub async fn verify(
        &self,
        observer: Option<&mut dyn VerificationObserver>,
    ) -> Result<bool> {
        let session = self.inner.view.inner.session.clone();
        let wants = observer.as_ref().map_or(false, |o| o.wants_nodes());
        if !wants {
            let mut reply = self
                .inner
                .view
                .inner
                .stub
                .invoke(ViewOp::VerifyIndex as u8, |msg| {
                    msg.put_u8(0);
                    msg.put_u64_le(0);
                })
                .await?;
            return get_bool(&mut reply);
        }

        let observer = observer.expect("wants_nodes implies an observer");
        let (token, rx) = session.register_relay();
        // The server streams the relay, which this task must ack, before it
        // sends the reply; both futures make progress in this select.
        let mut call = std::pin::pin!(self.inner.view.inner.stub.invoke_stream(
            ViewOp::VerifyIndex as u8,
            |msg| {
                msg.put_u8(1);
                msg.put_u64_le(token);
            },
        ));
        tokio::select! {
            result = &mut call => {
                // The reply beat the relay: the call failed before the
                // server opened the relay pipe.
                session.unregister_relay(token);
                let (pipe, mut reply) = result?;
                session.recycle(pipe);
                get_bool(&mut reply)
            }
            relay = rx => {
                let held = match relay {
                    Ok(relay) => process_verify_relay(relay, observer).await,
                    Err(_) => None,
                };
                let (pipe, mut reply) = call.await?;
                session.recycle(pipe);
                let passed = get_bool(&mut reply)?;
                match held {
                    Some(error) => Err(error),
                    None => Ok(passed),
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner
            .view
            .inner
            .stub
            .invoke(ViewOp::CloseIndex as u8, |_| {})
            .await?;
        self.inner.view.inner.stub.clear().await;
        Ok(())
    }

    pub async fn is_closed(&self) -> Result<bool> {
        let mut reply = self
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::IsClosedIndex as u8, |_| {})
            .await?;
        get_bool(&mut reply)
    }

    /// Prepare deletion; the returned handle commits it when run.
    pub async fn drop_index(&self) -> Result<IndexDeletion> {
        let mut reply = self
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::Drop as u8, |_| {})
            .await?;
        let handle = get_u64(&mut reply)?;
        Ok(IndexDeletion {
            session: self.inner.view.inner.session.clone(),
            stub: Stub::new(
                self.inner.view.inner.session.clone(),
                handle,
                self.inner.view.inner.session.epoch(),
            ),
        })
    }

    // View forwarding.

    pub async fn ordering(&self) -> Result<KeyOrdering> {
        self.inner.view.ordering().await
    }

    pub async fn new_cursor(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        self.inner.view.new_cursor(txn).await
    }

    pub async fn new_accessor(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Cursor> {
        self.inner.view.new_accessor(txn, key).await
    }

    pub async fn new_transaction(&self, durability: DurabilityMode) -> Result<Transaction> {
        self.inner.view.new_transaction(durability).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.inner.view.is_empty().await
    }

    pub async fn count(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<u64> {
        self.inner.view.count(low, high).await
    }

    pub async fn load(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.view.load(txn, key).await
    }

    pub async fn exists(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<bool> {
        self.inner.view.exists(txn, key).await
    }

    pub async fn touch(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<LockResult> {
        self.inner.view.touch(txn, key).await
    }

    pub async fn store(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.inner.view.store(txn, key, value).await
    }

    pub async fn exchange(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        self.inner.view.exchange(txn, key, value).await
    }

    pub async fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.inner.view.insert(txn, key, value).await
    }

    pub async fn replace(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.inner.view.replace(txn, key, value).await
    }

    pub async fn update(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.inner.view.update(txn, key, value).await
    }

    pub async fn update_with_old(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        old: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<bool> {
        self.inner.view.update_with_old(txn, key, old, value).await
    }

    pub async fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<bool> {
        self.inner.view.delete(txn, key).await
    }

    pub async fn remove(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        old: Option<&[u8]>,
    ) -> Result<bool> {
        self.inner.view.remove(txn, key, old).await
    }

    pub async fn lock_shared(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.inner.view.lock_shared(txn, key).await
    }

    pub async fn try_lock_shared(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.inner.view.try_lock_shared(txn, key, nanos).await
    }

    pub async fn lock_upgradable(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.inner.view.lock_upgradable(txn, key).await
    }

    pub async fn try_lock_upgradable(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.inner.view.try_lock_upgradable(txn, key, nanos).await
    }

    pub async fn lock_exclusive(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.inner.view.lock_exclusive(txn, key).await
    }

    pub async fn try_lock_exclusive(
        &self,
        txn: &Transaction,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.inner.view.try_lock_exclusive(txn, key, nanos).await
    }

    pub async fn lock_check(&self, txn: &Transaction, key: &[u8]) -> Result<LockResult> {
        self.inner.view.lock_check(txn, key).await
    }

    pub async fn is_unmodifiable(&self) -> Result<bool> {
        self.inner.view.is_unmodifiable().await
    }

    pub async fn is_modify_atomic(&self) -> Result<bool> {
        self.inner.view.is_modify_atomic().await
    }
}

#[async_trait]
impl Restore for IndexInner {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        let stub = &self.view.inner.stub;
        let (stale, _) = stub.snapshot().await;
        let epoch = session.epoch();

        let outcome: Result<Option<(u64, u64, Vec<u8>)>> = async {
            match &self.capture {
                IndexCapture::Open(name) => {
                    let mut reply =
                        super::database::root_call(session, DbOp::OpenIndex as u8, |msg| {
                            put_key(msg, name);
                        })
                        .await?;
                    let handle = get_u64(&mut reply)?;
                    let id = get_u64(&mut reply)?;
                    let name = get_bytes(&mut reply)?;
                    Ok(Some((handle, id, name)))
                }
                IndexCapture::Find(name) => {
                    let mut reply =
                        super::database::root_call(session, DbOp::FindIndex as u8, |msg| {
                            put_key(msg, name);
                        })
                        .await?;
                    decode_optional_index(&mut reply)
                }
                IndexCapture::ById(id) => {
                    let mut reply =
                        super::database::root_call(session, DbOp::IndexById as u8, |msg| {
                            msg.put_u64_le(*id);
                        })
                        .await?;
                    decode_optional_index(&mut reply)
                }
                IndexCapture::Unrestorable => Ok(None),
            }
        }
        .await;

        match outcome {
            Ok(Some((handle, id, name))) => {
                if stub.install_over(stale, handle, epoch).await {
                    self.id.store(id, Ordering::Release);
                    *self.name.lock() = name;
                }
                Ok(())
            }
            Ok(None) => {
                stub.mark_broken("index cannot be restored after reconnect")
                    .await;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                stub.mark_broken(e.to_string()).await;
                Ok(())
            }
        }
    }
}

fn decode_optional_index(reply: &mut bytes::Bytes) -> Result<Option<(u64, u64, Vec<u8>)>> {
    if !get_bool(reply)? {
        return Ok(None);
    }
    let handle = get_u64(reply)?;
    let id = get_u64(reply)?;
    let name = get_bytes(reply)?;
    Ok(Some((handle, id, name)))
}

/// Prepared index deletion: a one-shot handle committing the deletion.
pub struct IndexDeletion {
    session: Arc<SessionInner>,
    stub: Stub,
}

impl IndexDeletion {
    pub(crate) fn new(session: Arc<SessionInner>, handle: u64, epoch: u64) -> IndexDeletion {
        IndexDeletion {
            stub: Stub::new(session.clone(), handle, epoch),
            session,
        }
    }

    /// Commit the deletion and release the handle.
    pub async fn run(self) -> Result<()> {
        self.stub.invoke(DeletionOp::Run as u8, |_| {}).await?;
        self.stub.clear().await;
        Ok(())
    }
}

impl Drop for IndexDeletion {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}

pub(crate) struct HandlerInner {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) stub: Stub,
    /// True for the two-phase prepare writer, false for the custom redo
    /// writer; replayed with the name to restore the lookup.
    pub(crate) prepare: bool,
    pub(crate) name: String,
}

/// Named durability handler proxy (custom redo or two-phase prepare writer).
#[derive(Clone)]
pub struct HandlerProxy {
    pub(crate) inner: Arc<HandlerInner>,
}

impl PartialEq for HandlerProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for HandlerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerProxy")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl HandlerProxy {
    /// Write a handler message under the transaction.
    pub async fn write(&self, txn: &Transaction, message: &[u8]) -> Result<()> {
        let txn_handle = txn_id(&self.inner.session, Some(txn)).await?;
        self.inner
            .stub
            .invoke(crate::protocol::HandlerOp::Write as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_key(msg, message);
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Restore for HandlerInner {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        let op = if self.prepare {
            DbOp::PrepareWriter
        } else {
            DbOp::CustomWriter
        };
        let (stale, _) = self.stub.snapshot().await;
        let epoch = session.epoch();
        match super::database::root_call(session, op as u8, |msg| {
            msg.put_u32_le(self.name.len() as u32);
            msg.put_slice(self.name.as_bytes());
        })
        .await
        {
            Ok(mut reply) => {
                let handle = get_u64(&mut reply)?;
                self.stub.install_over(stale, handle, epoch).await;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                self.stub.mark_broken(e.to_string()).await;
                Ok(())
            }
        }
    }
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}
