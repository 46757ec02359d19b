// Remote cursor proxy.
//
// The client keeps the view, linked transaction, autoload flag, and last
// known position. When the server handle is gone (reset, terminal call, or
// session detach), the next operation that needs one resurrects it from the
// view and replays the autoload flag. Pure data accessors answer from the
// cache without resurrection.

use super::session::SessionInner;
use super::stream::{ValueInputStream, ValueOutputStream};
use super::stub::Stub;
use super::txn::Transaction;
use super::view::View;
use crate::engine::types::{KeyOrdering, LockResult};
use crate::engine::CursorValue;
use crate::error::{RemoteError, Result};
use crate::protocol::codec::decode_cursor_value;
use crate::protocol::wire::{get_bool, get_opt_bytes, get_u32, get_u64, get_u8};
use crate::protocol::{CursorOp, ViewOp};
use bytes::{BufMut, BytesMut};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

struct CursorCache {
    key: Option<Vec<u8>>,
    value: CursorValue,
    autoload: bool,
    /// Server transaction handle last linked on the server side.
    linked_txn: u64,
}

/// A remote cursor over one view, bound to an optional transaction.
pub struct Cursor {
    session: Arc<SessionInner>,
    view: View,
    stub: Stub,
    txn: Mutex<Option<Transaction>>,
    cache: Mutex<CursorCache>,
    ordering: OnceCell<KeyOrdering>,
}

impl Cursor {
    pub(crate) fn attached(
        view: View,
        txn: Option<Transaction>,
        handle: u64,
        epoch: u64,
        linked_txn: u64,
    ) -> Cursor {
        let session = view.inner.session.clone();
        Cursor {
            stub: Stub::new(session.clone(), handle, epoch),
            session,
            view,
            txn: Mutex::new(txn),
            cache: Mutex::new(CursorCache {
                key: None,
                value: CursorValue::NotLoaded,
                autoload: true,
                linked_txn,
            }),
            ordering: OnceCell::new(),
        }
    }

    pub(crate) fn accessor(
        view: View,
        txn: Option<Transaction>,
        handle: u64,
        epoch: u64,
        linked_txn: u64,
        key: Vec<u8>,
    ) -> Cursor {
        let cursor = Cursor::attached(view, txn, handle, epoch, linked_txn);
        {
            let mut cache = cursor.cache.lock();
            cache.key = Some(key);
            cache.autoload = false;
        }
        cursor
    }

    /// Resolve a live server cursor, resurrecting it from the view when it
    /// was torn down, and relink the transaction when its handle moved.
    async fn ensure(&self) -> Result<()> {
        let txn = self.txn.lock().clone();
        let txn_handle = match &txn {
            Some(txn) => txn.inner.ensure_id(&self.session).await?,
            None => 0,
        };

        if self.stub.current().await.is_some() {
            let linked = self.cache.lock().linked_txn;
            if linked != txn_handle {
                self.stub
                    .invoke_batched(CursorOp::Link as u8, |msg| {
                        msg.put_u64_le(txn_handle);
                    })
                    .await?;
                self.cache.lock().linked_txn = txn_handle;
            }
            return Ok(());
        }

        let epoch = self.session.epoch();
        let mut reply = self
            .view
            .inner
            .stub
            .invoke(ViewOp::NewCursor as u8, |msg| {
                msg.put_u64_le(txn_handle);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        self.stub.install(handle, epoch).await;

        let autoload = self.cache.lock().autoload;
        if !autoload {
            self.stub
                .invoke_batched(CursorOp::Autoload as u8, |msg| {
                    msg.put_u8(0);
                })
                .await?;
        }
        let mut cache = self.cache.lock();
        cache.key = None;
        cache.value = CursorValue::NotLoaded;
        cache.linked_txn = txn_handle;
        Ok(())
    }

    async fn position_op(
        &self,
        op: CursorOp,
        args: impl FnOnce(&mut BytesMut),
    ) -> Result<LockResult> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(op as u8, args).await?;
        let lock = LockResult::from_u8(get_u8(&mut reply)?);
        let key = get_opt_bytes(&mut reply)?;
        let value = decode_cursor_value(&mut reply)?;
        let mut cache = self.cache.lock();
        cache.key = key;
        cache.value = value;
        Ok(lock)
    }

    /// Key ordering of the underlying view; fetched once.
    pub async fn ordering(&self) -> Result<KeyOrdering> {
        if let Some(ordering) = self.ordering.get() {
            return Ok(*ordering);
        }
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Ordering as u8, |_| {}).await?;
        let ordering = KeyOrdering::from_u8(get_u8(&mut reply)?);
        let _ = self.ordering.set(ordering);
        Ok(ordering)
    }

    /// Link a different transaction; effective on the server before the
    /// next positional operation returns.
    pub async fn link(&self, txn: Option<Transaction>) -> Result<()> {
        *self.txn.lock() = txn;
        self.ensure().await
    }

    /// The transaction this cursor is linked to.
    pub fn txn(&self) -> Option<Transaction> {
        self.txn.lock().clone()
    }

    /// Last known key, without a server round trip.
    pub fn key(&self) -> Option<Vec<u8>> {
        self.cache.lock().key.clone()
    }

    /// Last known value state, without a server round trip. A
    /// [`CursorValue::NotLoaded`] answer means autoload was off and no load
    /// has happened.
    pub fn value(&self) -> CursorValue {
        self.cache.lock().value.clone()
    }

    /// Compare the cursor's key to another key, locally.
    pub fn compare_key_to(&self, other: &[u8]) -> Result<CmpOrdering> {
        match &self.cache.lock().key {
            Some(key) => Ok(key.as_slice().cmp(other)),
            None => Err(RemoteError::illegal_state("cursor is not positioned")),
        }
    }

    pub fn is_autoload(&self) -> bool {
        self.cache.lock().autoload
    }

    pub async fn set_autoload(&self, on: bool) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke_batched(CursorOp::Autoload as u8, |msg| {
                msg.put_u8(on as u8);
            })
            .await?;
        self.cache.lock().autoload = on;
        Ok(())
    }

    pub async fn first(&self) -> Result<LockResult> {
        self.position_op(CursorOp::First, |_| {}).await
    }

    pub async fn last(&self) -> Result<LockResult> {
        self.position_op(CursorOp::Last, |_| {}).await
    }

    pub async fn skip(&self, amount: i64) -> Result<LockResult> {
        self.position_op(CursorOp::Skip, |msg| {
            msg.put_u64_le(amount as u64);
        })
        .await
    }

    pub async fn skip_bounded(
        &self,
        amount: i64,
        limit: Option<&[u8]>,
        inclusive: bool,
    ) -> Result<LockResult> {
        self.position_op(CursorOp::SkipBounded, |msg| {
            msg.put_u64_le(amount as u64);
            match limit {
                Some(limit) => {
                    msg.put_u8(1);
                    msg.put_u32_le(limit.len() as u32);
                    msg.put_slice(limit);
                }
                None => msg.put_u8(0),
            }
            msg.put_u8(inclusive as u8);
        })
        .await
    }

    pub async fn next(&self) -> Result<LockResult> {
        self.position_op(CursorOp::Next, |_| {}).await
    }

    pub async fn next_le(&self, limit: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::NextLe, limit).await
    }

    pub async fn next_lt(&self, limit: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::NextLt, limit).await
    }

    pub async fn previous(&self) -> Result<LockResult> {
        self.position_op(CursorOp::Previous, |_| {}).await
    }

    pub async fn previous_ge(&self, limit: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::PreviousGe, limit).await
    }

    pub async fn previous_gt(&self, limit: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::PreviousGt, limit).await
    }

    async fn bounded_op(&self, op: CursorOp, limit: &[u8]) -> Result<LockResult> {
        self.position_op(op, |msg| {
            msg.put_u32_le(limit.len() as u32);
            msg.put_slice(limit);
        })
        .await
    }

    pub async fn find(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::Find, key).await
    }

    pub async fn find_ge(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::FindGe, key).await
    }

    pub async fn find_gt(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::FindGt, key).await
    }

    pub async fn find_le(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::FindLe, key).await
    }

    pub async fn find_lt(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::FindLt, key).await
    }

    pub async fn find_nearby(&self, key: &[u8]) -> Result<LockResult> {
        self.bounded_op(CursorOp::FindNearby, key).await
    }

    pub async fn random(&self, low: Option<&[u8]>, high: Option<&[u8]>) -> Result<LockResult> {
        self.position_op(CursorOp::Random, |msg| {
            for bound in [low, high] {
                match bound {
                    Some(bound) => {
                        msg.put_u8(1);
                        msg.put_u32_le(bound.len() as u32);
                        msg.put_slice(bound);
                    }
                    None => msg.put_u8(0),
                }
            }
        })
        .await
    }

    pub async fn exists(&self) -> Result<bool> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Exists as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    pub async fn lock(&self) -> Result<LockResult> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Lock as u8, |_| {}).await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    pub async fn load(&self) -> Result<LockResult> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Load as u8, |_| {}).await?;
        let lock = LockResult::from_u8(get_u8(&mut reply)?);
        let value = decode_cursor_value(&mut reply)?;
        self.cache.lock().value = value;
        Ok(lock)
    }

    pub async fn store(&self, value: Option<&[u8]>) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke(CursorOp::Store as u8, |msg| match value {
                Some(value) => {
                    msg.put_u8(1);
                    msg.put_u32_le(value.len() as u32);
                    msg.put_slice(value);
                }
                None => msg.put_u8(0),
            })
            .await?;
        self.cache.lock().value = match value {
            Some(value) => CursorValue::Bytes(value.to_vec()),
            None => CursorValue::Absent,
        };
        Ok(())
    }

    /// Store and commit the linked transaction.
    pub async fn commit(&self, value: Option<&[u8]>) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke(CursorOp::Commit as u8, |msg| match value {
                Some(value) => {
                    msg.put_u8(1);
                    msg.put_u32_le(value.len() as u32);
                    msg.put_slice(value);
                }
                None => msg.put_u8(0),
            })
            .await?;
        self.cache.lock().value = match value {
            Some(value) => CursorValue::Bytes(value.to_vec()),
            None => CursorValue::Absent,
        };
        // A top-level commit disposed the server transaction.
        let txn = self.txn.lock().clone();
        if let Some(txn) = txn {
            if !txn.is_bogus() && txn.nesting_depth() == 0 {
                txn.inner.stub.clear().await;
            }
        }
        Ok(())
    }

    pub async fn delete(&self) -> Result<()> {
        self.ensure().await?;
        self.stub.invoke(CursorOp::Delete as u8, |_| {}).await?;
        self.cache.lock().value = CursorValue::Absent;
        Ok(())
    }

    pub async fn register(&self) -> Result<bool> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Register as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    pub async fn unregister(&self) -> Result<()> {
        if self.stub.current().await.is_none() {
            return Ok(());
        }
        self.stub
            .invoke_batched(CursorOp::Unregister as u8, |_| {})
            .await
    }

    /// Duplicate this cursor at the same position.
    pub async fn copy(&self) -> Result<Cursor> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::Copy as u8, |_| {}).await?;
        let handle = get_u64(&mut reply)?;
        let (key, value, autoload, linked) = {
            let cache = self.cache.lock();
            (
                cache.key.clone(),
                cache.value.clone(),
                cache.autoload,
                cache.linked_txn,
            )
        };
        let copy = Cursor::attached(
            self.view.clone(),
            self.txn.lock().clone(),
            handle,
            self.session.epoch(),
            linked,
        );
        {
            let mut cache = copy.cache.lock();
            cache.key = key;
            cache.value = value;
            cache.autoload = autoload;
        }
        Ok(copy)
    }

    /// Release the position and the server handle; the next operation
    /// resurrects from the view.
    pub async fn reset(&self) -> Result<()> {
        if self.stub.current().await.is_some() {
            self.stub
                .invoke_batched(CursorOp::Reset as u8, |_| {})
                .await?;
        }
        self.stub.clear().await;
        let mut cache = self.cache.lock();
        cache.key = None;
        cache.value = CursorValue::NotLoaded;
        Ok(())
    }

    pub async fn value_length(&self) -> Result<i64> {
        self.ensure().await?;
        let mut reply = self.stub.invoke(CursorOp::ValueLength as u8, |_| {}).await?;
        Ok(get_u64(&mut reply)? as i64)
    }

    pub async fn set_value_length(&self, length: u64) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke(CursorOp::SetValueLength as u8, |msg| {
                msg.put_u64_le(length);
            })
            .await?;
        self.cache.lock().value = CursorValue::NotLoaded;
        Ok(())
    }

    /// Read part of the value into `buf`; -1 means past the end.
    pub async fn value_read(&self, pos: u64, buf: &mut [u8]) -> Result<i32> {
        self.ensure().await?;
        let len = buf.len() as u32;
        let mut reply = self
            .stub
            .invoke(CursorOp::ValueRead as u8, |msg| {
                msg.put_u64_le(pos);
                msg.put_u32_le(len);
            })
            .await?;
        let n = get_u32(&mut reply)? as i32;
        if n > 0 {
            let take = n as usize;
            if reply.len() < take {
                return Err(RemoteError::io("short value read reply"));
            }
            buf[..take].copy_from_slice(&reply[..take]);
        }
        Ok(n)
    }

    pub async fn value_write(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke(CursorOp::ValueWrite as u8, |msg| {
                msg.put_u64_le(pos);
                msg.put_u32_le(data.len() as u32);
                msg.put_slice(data);
            })
            .await?;
        self.cache.lock().value = CursorValue::NotLoaded;
        Ok(())
    }

    pub async fn value_clear(&self, pos: u64, length: u64) -> Result<()> {
        self.ensure().await?;
        self.stub
            .invoke(CursorOp::ValueClear as u8, |msg| {
                msg.put_u64_le(pos);
                msg.put_u64_le(length);
            })
            .await?;
        self.cache.lock().value = CursorValue::NotLoaded;
        Ok(())
    }

    /// Open a chunked stream reading the value from `pos`.
    pub async fn new_value_input_stream(
        &self,
        pos: u64,
        chunk_len: u32,
    ) -> Result<ValueInputStream> {
        self.ensure().await?;
        let (pipe, _reply) = self
            .stub
            .invoke_stream(CursorOp::ValueInputStream as u8, |msg| {
                msg.put_u64_le(pos);
                msg.put_u32_le(chunk_len);
            })
            .await?;
        Ok(ValueInputStream::new(self.session.clone(), pipe))
    }

    /// Open a chunked stream writing the value from `pos`.
    pub async fn new_value_output_stream(&self, pos: u64) -> Result<ValueOutputStream> {
        self.ensure().await?;
        let (pipe, _reply) = self
            .stub
            .invoke_stream(CursorOp::ValueOutputStream as u8, |msg| {
                msg.put_u64_le(pos);
            })
            .await?;
        self.cache.lock().value = CursorValue::NotLoaded;
        Ok(ValueOutputStream::new(self.session.clone(), pipe))
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}
