// Remote transaction proxy.
//
// The three configurable fields are cached locally and forwarded as batched
// calls; nesting depth is tracked independently of the server. Terminal
// calls dispose the server handle, and the next operation resurrects a new
// server transaction carrying the cached modes.

use super::session::SessionInner;
use super::stub::{RemoteRef, Stub};
use crate::engine::types::{DurabilityMode, LockMode, LockResult, TimeUnit};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_opt_bytes, get_u64, get_u8};
use crate::protocol::{DbOp, TxnOp};
use bytes::BufMut;
use parking_lot::Mutex;
use std::sync::Arc;

struct TxnCache {
    lock_mode: Option<LockMode>,
    timeout_nanos: Option<u64>,
    durability: DurabilityMode,
    depth: u32,
    borked: Option<String>,
}

pub(crate) struct TxnInner {
    session: Arc<SessionInner>,
    pub(crate) stub: Stub,
    bogus: bool,
    cache: Mutex<TxnCache>,
}

/// A remote transaction. Not safe for concurrent use from multiple threads,
/// matching the engine's own contract.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("inner", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        handle: u64,
        epoch: u64,
        durability: DurabilityMode,
    ) -> Transaction {
        Transaction {
            inner: Arc::new(TxnInner {
                stub: Stub::new(session.clone(), handle, epoch),
                session,
                bogus: false,
                cache: Mutex::new(TxnCache {
                    lock_mode: None,
                    timeout_nanos: None,
                    durability,
                    depth: 0,
                    borked: None,
                }),
            }),
        }
    }

    pub(crate) fn new_bogus(session: Arc<SessionInner>, handle: u64, epoch: u64) -> Transaction {
        Transaction {
            inner: Arc::new(TxnInner {
                stub: Stub::new(session.clone(), handle, epoch),
                session,
                bogus: true,
                cache: Mutex::new(TxnCache {
                    lock_mode: None,
                    timeout_nanos: None,
                    durability: DurabilityMode::NoRedo,
                    depth: 0,
                    borked: None,
                }),
            }),
        }
    }

    pub fn is_bogus(&self) -> bool {
        self.inner.bogus
    }

    /// Client-tracked nesting depth.
    pub fn nesting_depth(&self) -> u32 {
        self.inner.cache.lock().depth
    }

    pub async fn lock_mode(&self) -> Result<LockMode> {
        if let Some(mode) = self.inner.cache.lock().lock_mode {
            return Ok(mode);
        }
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self.inner.stub.invoke(TxnOp::LockMode as u8, |_| {}).await?;
        let mode = LockMode::from_u8(get_u8(&mut reply)?);
        self.inner.cache.lock().lock_mode = Some(mode);
        Ok(mode)
    }

    pub async fn set_lock_mode(&self, mode: LockMode) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner
            .stub
            .invoke_batched(TxnOp::SetLockMode as u8, |msg| {
                msg.put_u8(mode as u8);
            })
            .await?;
        self.inner.cache.lock().lock_mode = Some(mode);
        Ok(())
    }

    pub async fn lock_timeout(&self, unit: TimeUnit) -> Result<u64> {
        Ok(unit.from_nanos(self.lock_timeout_nanos().await?))
    }

    pub async fn lock_timeout_nanos(&self) -> Result<u64> {
        if let Some(nanos) = self.inner.cache.lock().timeout_nanos {
            return Ok(nanos);
        }
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TxnOp::LockTimeout as u8, |msg| {
                msg.put_u8(TimeUnit::Nanoseconds as u8);
            })
            .await?;
        let nanos = get_u64(&mut reply)?;
        self.inner.cache.lock().timeout_nanos = Some(nanos);
        Ok(nanos)
    }

    pub async fn set_lock_timeout(&self, amount: u64, unit: TimeUnit) -> Result<()> {
        self.set_lock_timeout_nanos(unit.to_nanos(amount)).await
    }

    pub async fn set_lock_timeout_nanos(&self, nanos: u64) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner
            .stub
            .invoke_batched(TxnOp::SetLockTimeout as u8, |msg| {
                msg.put_u8(TimeUnit::Nanoseconds as u8);
                msg.put_u64_le(nanos);
            })
            .await?;
        self.inner.cache.lock().timeout_nanos = Some(nanos);
        Ok(())
    }

    pub async fn durability_mode(&self) -> Result<DurabilityMode> {
        Ok(self.inner.cache.lock().durability)
    }

    pub async fn set_durability_mode(&self, mode: DurabilityMode) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner
            .stub
            .invoke_batched(TxnOp::SetDurability as u8, |msg| {
                msg.put_u8(mode as u8);
            })
            .await?;
        self.inner.cache.lock().durability = mode;
        Ok(())
    }

    pub async fn check(&self) -> Result<()> {
        self.inner.check_borked()?;
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Check as u8, |_| {}).await?;
        Ok(())
    }

    /// Commit the current scope. At the top level the server handle is
    /// disposed; the next operation resurrects a fresh transaction.
    pub async fn commit(&self) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self.inner.stub.invoke(TxnOp::Commit as u8, |_| {}).await?;
        if get_bool(&mut reply)? {
            self.inner.stub.clear().await;
        }
        Ok(())
    }

    /// Commit every scope; always disposes the server handle.
    pub async fn commit_all(&self) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::CommitAll as u8, |_| {}).await?;
        self.inner.stub.clear().await;
        self.inner.cache.lock().depth = 0;
        Ok(())
    }

    pub async fn enter(&self) -> Result<()> {
        if self.inner.bogus {
            return Err(RemoteError::illegal_state(
                "bogus transaction cannot enter a scope",
            ));
        }
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Enter as u8, |_| {}).await?;
        self.inner.cache.lock().depth += 1;
        Ok(())
    }

    pub async fn exit(&self) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Exit as u8, |_| {}).await?;
        let mut cache = self.inner.cache.lock();
        cache.depth = cache.depth.saturating_sub(1);
        Ok(())
    }

    /// Roll back and dispose the server handle.
    pub async fn reset(&self) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        if self.inner.stub.current().await.is_some() {
            self.inner.stub.invoke(TxnOp::Reset as u8, |_| {}).await?;
        }
        self.inner.stub.clear().await;
        self.inner.cache.lock().depth = 0;
        Ok(())
    }

    /// Roll back with a cause; the transaction is borked and every later
    /// operation fails with an invalid-transaction error.
    pub async fn reset_cause(&self, cause: &str) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        if self.inner.stub.current().await.is_some() {
            self.inner
                .stub
                .invoke_no_reply(TxnOp::ResetCause as u8, |msg| {
                    msg.put_u32_le(cause.len() as u32);
                    msg.put_slice(cause.as_bytes());
                })
                .await?;
        }
        self.inner.stub.clear().await;
        let mut cache = self.inner.cache.lock();
        cache.depth = 0;
        cache.borked = Some(cause.to_string());
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        if self.inner.bogus {
            return Ok(());
        }
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Rollback as u8, |_| {}).await?;
        Ok(())
    }

    async fn lock_op(&self, op: TxnOp, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(index_id);
                msg.put_u32_le(key.len() as u32);
                msg.put_slice(key);
            })
            .await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    async fn try_lock_op(
        &self,
        op: TxnOp,
        index_id: u64,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(index_id);
                msg.put_u32_le(key.len() as u32);
                msg.put_slice(key);
                msg.put_u64_le(nanos);
            })
            .await?;
        Ok(LockResult::from_u8(get_u8(&mut reply)?))
    }

    pub async fn lock_shared(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.lock_op(TxnOp::LockShared, index_id, key).await
    }

    pub async fn try_lock_shared(
        &self,
        index_id: u64,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(TxnOp::TryLockShared, index_id, key, nanos).await
    }

    pub async fn lock_upgradable(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.lock_op(TxnOp::LockUpgradable, index_id, key).await
    }

    pub async fn try_lock_upgradable(
        &self,
        index_id: u64,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(TxnOp::TryLockUpgradable, index_id, key, nanos)
            .await
    }

    pub async fn lock_exclusive(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.lock_op(TxnOp::LockExclusive, index_id, key).await
    }

    pub async fn try_lock_exclusive(
        &self,
        index_id: u64,
        key: &[u8],
        nanos: u64,
    ) -> Result<LockResult> {
        self.try_lock_op(TxnOp::TryLockExclusive, index_id, key, nanos)
            .await
    }

    pub async fn lock_check(&self, index_id: u64, key: &[u8]) -> Result<LockResult> {
        self.lock_op(TxnOp::LockCheck, index_id, key).await
    }

    pub async fn last_locked_index(&self) -> Result<u64> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TxnOp::LastLockedIndex as u8, |_| {})
            .await?;
        get_u64(&mut reply)
    }

    pub async fn last_locked_key(&self) -> Result<Option<Vec<u8>>> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TxnOp::LastLockedKey as u8, |_| {})
            .await?;
        get_opt_bytes(&mut reply)
    }

    pub async fn was_acquired(&self) -> Result<bool> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TxnOp::WasAcquired as u8, |_| {})
            .await?;
        get_bool(&mut reply)
    }

    pub async fn unlock(&self) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Unlock as u8, |_| {}).await?;
        Ok(())
    }

    pub async fn unlock_to_shared(&self) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner
            .stub
            .invoke(TxnOp::UnlockToShared as u8, |_| {})
            .await?;
        Ok(())
    }

    pub async fn unlock_combine(&self) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner
            .stub
            .invoke(TxnOp::UnlockCombine as u8, |_| {})
            .await?;
        Ok(())
    }

    pub async fn id(&self) -> Result<u64> {
        self.inner.ensure(&self.inner.session).await?;
        let mut reply = self.inner.stub.invoke(TxnOp::Id as u8, |_| {}).await?;
        get_u64(&mut reply)
    }

    pub async fn flush(&self) -> Result<()> {
        self.inner.ensure(&self.inner.session).await?;
        self.inner.stub.invoke(TxnOp::Flush as u8, |_| {}).await?;
        Ok(())
    }
}

impl TxnInner {
    fn check_borked(&self) -> Result<()> {
        match &self.cache.lock().borked {
            Some(cause) => Err(RemoteError::invalid_transaction(cause.clone())),
            None => Ok(()),
        }
    }

    /// Resolve the live server handle, resurrecting after a terminal call or
    /// a reconnect: a fresh server transaction is created with the cached
    /// durability mode, then cached lock mode and timeout are replayed.
    pub(crate) async fn ensure(&self, session: &Arc<SessionInner>) -> Result<RemoteRef> {
        self.check_borked()?;
        if let Some(remote) = self.stub.current().await {
            return Ok(remote);
        }

        let epoch = session.epoch();
        let handle = if self.bogus {
            let mut reply = super::database::root_call(session, DbOp::Bogus as u8, |_| {}).await?;
            get_u64(&mut reply)?
        } else {
            let durability = self.cache.lock().durability;
            let mut reply =
                super::database::root_call(session, DbOp::NewTransaction as u8, |msg| {
                    msg.put_u8(durability as u8);
                })
                .await?;
            get_u64(&mut reply)?
        };
        self.stub.install(handle, epoch).await;

        if !self.bogus {
            let (lock_mode, timeout) = {
                let cache = self.cache.lock();
                (cache.lock_mode, cache.timeout_nanos)
            };
            if let Some(mode) = lock_mode {
                self.stub
                    .invoke_batched(TxnOp::SetLockMode as u8, |msg| {
                        msg.put_u8(mode as u8);
                    })
                    .await?;
            }
            if let Some(nanos) = timeout {
                self.stub
                    .invoke_batched(TxnOp::SetLockTimeout as u8, |msg| {
                        msg.put_u8(TimeUnit::Nanoseconds as u8);
                        msg.put_u64_le(nanos);
                    })
                    .await?;
            }
        }
        Ok(RemoteRef { id: handle, epoch })
    }

    /// Current server handle id for use as a call argument, resurrecting
    /// first when needed.
    pub(crate) async fn ensure_id(&self, session: &Arc<SessionInner>) -> Result<u64> {
        Ok(self.ensure(session).await?.id)
    }
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        if !self.bogus {
            self.stub.dispose_from_drop(&self.session);
        }
    }
}
