// Decode-and-dispatch for one request pipe.
//
// Each pipe carries length-prefixed request messages:
// `handle id (u64) | selector (u8) | typed args`. Replies start with a
// status byte; errors are serialized with their trace frames. Batched and
// no-reply selectors produce no reply; their failures are parked on the
// skeleton and surface on the next non-batched call on the same handle.
//
// Bulk operations (value streams, row streams, sorter ingest, snapshot
// transfer) take over the pipe after the initial reply and speak the raw
// chunk protocols described inline.

use super::proxy::{RowProxy, ServerTable};
use super::query::{decode_args, PreparedQuery};
use super::registry::{Remote, Skeleton};
use super::relay::{
    stream_relay, CollectingCompact, CollectingVerify, RELAY_KIND_COMPACT, RELAY_KIND_VERIFY,
};
use super::ServerSession;
use crate::engine::types::{DurabilityMode, LockMode, RowDescriptor, TimeUnit};
use crate::engine::{Cursor, Database, Handler, Index, Sorter, Transaction, View};
use crate::error::{RemoteError, Result};
use crate::protocol::codec::{encode_cursor_value, encode_error};
use crate::protocol::wire::{
    get_bool, get_bytes, get_opt_bytes, get_str, get_u32, get_u64, get_u8, put_bytes,
    put_opt_bytes,
};
use crate::protocol::{
    Contract, CursorOp, DbOp, DeletionOp, HandlerOp, ProxyOp, SnapshotOp, SorterOp, TableOp,
    TxnOp, ViewOp, CHANNEL_CALLBACK, CHUNK_END_FLAG, CHUNK_EXCEPTION, CHUNK_LEN_MASK, MAX_CHUNK,
    RELAY_ACK, ROW_BATCH_BYTES, ROW_STREAM_END, SCAN_ORDERED, STATUS_ERR, STATUS_OK,
    UPDATER_CLOSE, UPDATER_DELETE, UPDATER_STEP, UPDATER_UPDATE,
};
use crate::transport::{Conn, Pipe};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::debug;

type Outcome = Result<Option<BytesMut>>;

fn ok_reply() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u8(STATUS_OK);
    buf
}

async fn send_err(pipe: &mut Pipe, error: &RemoteError) -> Result<()> {
    let mut reply = BytesMut::new();
    reply.put_u8(STATUS_ERR);
    encode_error(error, &mut reply);
    pipe.send_message(&reply).await
}

/// Surface a deferred batched failure before a non-batched call runs.
/// Returns `false` when the call was answered with the deferred error.
async fn predeliver(pipe: &mut Pipe, skeleton: &Skeleton, contract: Contract) -> Result<bool> {
    if contract.batched || contract.no_reply {
        return Ok(true);
    }
    match skeleton.take_deferred() {
        Some(error) => {
            send_err(pipe, &error).await?;
            Ok(false)
        }
        None => Ok(true),
    }
}

async fn deliver(
    pipe: &mut Pipe,
    skeleton: &Skeleton,
    contract: Contract,
    outcome: Outcome,
) -> Result<()> {
    match outcome {
        Ok(Some(reply)) => pipe.send_message(&reply).await,
        Ok(None) => Ok(()),
        Err(error) => {
            if contract.batched || contract.no_reply {
                skeleton.defer(error);
                Ok(())
            } else {
                send_err(pipe, &error).await
            }
        }
    }
}

/// Serve requests on one pipe until the client closes or the session dies.
pub(crate) async fn dispatch_pipe(session: Arc<ServerSession>, mut pipe: Pipe) {
    loop {
        let request = match pipe.read_message_opt().await {
            Ok(Some(request)) => request,
            Ok(None) | Err(_) => break,
        };
        if let Err(e) = handle_request(&session, request, &mut pipe).await {
            debug!(error = %e, "request pipe failed");
            break;
        }
    }
    pipe.close().await;
}

async fn handle_request(
    session: &Arc<ServerSession>,
    request: Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let mut buf = request;
    let id = get_u64(&mut buf)?;
    let sel = get_u8(&mut buf)?;
    let skeleton = match session.registry.get(id) {
        Ok(skeleton) => skeleton,
        Err(error) => {
            // A batched dispose of an already-gone handle needs no answer.
            if sel == 0 {
                return Ok(());
            }
            return send_err(pipe, &error).await;
        }
    };
    if sel == 0 {
        session.registry.dispose(id);
        return Ok(());
    }
    match &skeleton.remote {
        Remote::Db(db) => db_op(session, &skeleton, db, sel, &mut buf, pipe).await,
        Remote::View(view) => {
            view_op(session, &skeleton, view.as_ref(), None, sel, &mut buf, pipe).await
        }
        Remote::Index(index) => {
            view_op(
                session,
                &skeleton,
                index.as_ref(),
                Some(index),
                sel,
                &mut buf,
                pipe,
            )
            .await
        }
        Remote::Cursor(_) => cursor_op(session, &skeleton, sel, &mut buf, pipe).await,
        Remote::Txn(txn) => txn_op(session, &skeleton, txn, sel, &mut buf, pipe).await,
        Remote::Table(table) => table_op(session, &skeleton, table, sel, &mut buf, pipe).await,
        Remote::Proxy(proxy) => proxy_op(session, &skeleton, proxy, sel, &mut buf, pipe).await,
        Remote::Sorter(sorter) => sorter_op(session, &skeleton, sorter, sel, &mut buf, pipe).await,
        Remote::Snapshot(_) => snapshot_op(session, &skeleton, sel, &mut buf, pipe).await,
        Remote::Deletion(deletion) => {
            let deletion = deletion.clone();
            let op = match DeletionOp::from_u8(sel) {
                Ok(op) => op,
                Err(e) => return send_err(pipe, &e).await,
            };
            let contract = op.contract();
            if !predeliver(pipe, &skeleton, contract).await? {
                return Ok(());
            }
            let outcome = match op {
                DeletionOp::Dispose => unreachable!("dispose handled above"),
                DeletionOp::Run => deletion.run().map(|()| {
                    session.registry.remove(skeleton.id);
                    Some(ok_reply())
                }),
            };
            deliver(pipe, &skeleton, contract, outcome).await
        }
        Remote::Handler(handler) => {
            let handler = handler.clone();
            let op = match HandlerOp::from_u8(sel) {
                Ok(op) => op,
                Err(e) => return send_err(pipe, &e).await,
            };
            let contract = op.contract();
            if !predeliver(pipe, &skeleton, contract).await? {
                return Ok(());
            }
            let outcome: Outcome = match op {
                HandlerOp::Dispose => unreachable!("dispose handled above"),
                HandlerOp::Write => (|| {
                    let txn = session.txn_arg(get_u64(&mut buf)?)?.ok_or_else(|| {
                        RemoteError::illegal_state("handler requires a transaction")
                    })?;
                    let message = get_bytes(&mut buf)?;
                    handler.write(&txn, &message)?;
                    Ok(Some(ok_reply()))
                })(),
            };
            deliver(pipe, &skeleton, contract, outcome).await
        }
    }
}

impl ServerSession {
    /// Resolve a transaction argument; 0 means "no transaction".
    pub(crate) fn txn_arg(&self, id: u64) -> Result<Option<Arc<dyn Transaction>>> {
        if id == 0 {
            return Ok(None);
        }
        match &self.registry.get(id)?.remote {
            Remote::Txn(txn) => Ok(Some(txn.clone())),
            _ => Err(RemoteError::illegal_state("handle is not a transaction")),
        }
    }

    fn index_arg(&self, id: u64) -> Result<Arc<dyn Index>> {
        match &self.registry.get(id)?.remote {
            Remote::Index(index) => Ok(index.clone()),
            _ => Err(RemoteError::illegal_state("handle is not an index")),
        }
    }
}

/// Export an index and reply `handle | id | name`.
fn index_reply(session: &ServerSession, index: Arc<dyn Index>) -> BytesMut {
    let id = index.id();
    let name = index.name();
    let skeleton = session.registry.export(Remote::Index(index));
    let mut reply = ok_reply();
    reply.put_u64_le(skeleton.id);
    reply.put_u64_le(id);
    put_bytes(&mut reply, &name);
    reply
}

/// Reply `present | handle | id | name` for lookups that may miss.
fn optional_index_reply(session: &ServerSession, found: Option<Arc<dyn Index>>) -> BytesMut {
    let mut reply = ok_reply();
    match found {
        Some(index) => {
            reply.put_u8(1);
            let inner = index_reply(session, index);
            reply.extend_from_slice(&inner[1..]);
        }
        None => reply.put_u8(0),
    }
    reply
}

async fn db_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    db: &Arc<dyn Database>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match DbOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let outcome: Outcome = match op {
        DbOp::Dispose => unreachable!("dispose handled above"),
        DbOp::OpenIndex => {
            let name = get_bytes(buf)?;
            db.open_index(&name).map(|ix| Some(index_reply(session, ix)))
        }
        DbOp::FindIndex => (|| {
            let name = get_bytes(buf)?;
            let found = db.find_index(&name)?;
            Ok(Some(optional_index_reply(session, found)))
        })(),
        DbOp::IndexById => (|| {
            let id = get_u64(buf)?;
            let found = db.index_by_id(id)?;
            Ok(Some(optional_index_reply(session, found)))
        })(),
        DbOp::RenameIndex => (|| {
            let index = session.index_arg(get_u64(buf)?)?;
            let new_name = get_bytes(buf)?;
            db.rename_index(index.as_ref(), &new_name)?;
            Ok(Some(ok_reply()))
        })(),
        DbOp::DeleteIndex => (|| {
            let index = session.index_arg(get_u64(buf)?)?;
            let deletion = db.delete_index(index.as_ref())?;
            let exported = session.registry.export(Remote::Deletion(deletion));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        DbOp::TemporaryIndex => db
            .temporary_index()
            .map(|ix| Some(index_reply(session, ix))),
        DbOp::Registry => {
            let exported = session.registry.export(Remote::View(db.registry()));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        }
        DbOp::RegistryKeyMap => {
            let exported = session
                .registry
                .export(Remote::View(db.registry_key_map()));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        }
        DbOp::NewTransaction => (|| {
            let durability = DurabilityMode::from_u8(get_u8(buf)?);
            let txn = db.new_transaction(durability);
            let exported = session.registry.export(Remote::Txn(txn));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        DbOp::Bogus => {
            let id = session.bogus_handle(db);
            let mut reply = ok_reply();
            reply.put_u64_le(id);
            Ok(Some(reply))
        }
        DbOp::CustomWriter => (|| {
            let name = get_str(buf)?;
            let handler = db.custom_writer(&name)?;
            let exported = session.registry.export(Remote::Handler(handler));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        DbOp::PrepareWriter => (|| {
            let name = get_str(buf)?;
            let handler = db.prepare_writer(&name)?;
            let exported = session.registry.export(Remote::Handler(handler));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        DbOp::NewSorter => {
            let exported = session.registry.export(Remote::Sorter(db.new_sorter()));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        }
        DbOp::Preallocate => (|| {
            db.preallocate(get_u64(buf)?)?;
            Ok(Some(ok_reply()))
        })(),
        DbOp::SetCapacityLimit => (|| {
            db.set_capacity_limit(get_u64(buf)? as i64);
            Ok(None)
        })(),
        DbOp::CapacityLimit => {
            let mut reply = ok_reply();
            reply.put_u64_le(db.capacity_limit() as u64);
            Ok(Some(reply))
        }
        DbOp::BeginSnapshot => db.begin_snapshot().map(|snapshot| {
            let length = snapshot.length();
            let position = snapshot.position();
            let compressible = snapshot.is_compressible();
            let exported = session
                .registry
                .export(Remote::Snapshot(parking_lot::Mutex::new(Some(snapshot))));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            // Versioned snapshot metadata record.
            reply.put_u8(1);
            reply.put_u64_le(length);
            reply.put_u64_le(position);
            reply.put_u8(compressible as u8);
            Some(reply)
        }),
        DbOp::CreateCachePrimer => db.create_cache_primer().map(|data| {
            let mut reply = ok_reply();
            put_bytes(&mut reply, &data);
            Some(reply)
        }),
        DbOp::ApplyCachePrimer => (|| {
            let data = get_bytes(buf)?;
            db.apply_cache_primer(&data)?;
            Ok(Some(ok_reply()))
        })(),
        DbOp::Stats => {
            let mut reply = ok_reply();
            db.stats().encode(&mut reply);
            Ok(Some(reply))
        }
        DbOp::Flush => db.flush().map(|()| Some(ok_reply())),
        DbOp::Sync => db.sync().map(|()| Some(ok_reply())),
        DbOp::Checkpoint => db.checkpoint().map(|()| Some(ok_reply())),
        DbOp::CompactFile => {
            return compact_file(session, skeleton, db, buf, pipe).await;
        }
        DbOp::Verify => {
            return verify_db(session, skeleton, db, buf, pipe).await;
        }
        DbOp::IsLeader => {
            let mut reply = ok_reply();
            reply.put_u8(db.is_leader() as u8);
            Ok(Some(reply))
        }
        DbOp::UponLeader => (|| {
            let acquired_id = get_u64(buf)?;
            let lost_id = get_u64(buf)?;
            let conn_a = session.conn.clone();
            let conn_l = session.conn.clone();
            let handle = tokio::runtime::Handle::current();
            let handle_l = handle.clone();
            db.upon_leader(
                Box::new(move || {
                    handle.spawn(invoke_callback(conn_a, acquired_id));
                }),
                Box::new(move || {
                    handle_l.spawn(invoke_callback(conn_l, lost_id));
                }),
            );
            Ok(Some(ok_reply()))
        })(),
        DbOp::Failover => db.failover().map(|()| Some(ok_reply())),
        DbOp::Close => db.close().map(|()| Some(ok_reply())),
        DbOp::CloseCause => (|| {
            let cause = get_str(buf)?;
            db.close_cause(&cause)?;
            Ok(Some(ok_reply()))
        })(),
        DbOp::IsClosed => {
            let mut reply = ok_reply();
            reply.put_u8(db.is_closed() as u8);
            Ok(Some(reply))
        }
        DbOp::Shutdown => db.shutdown().map(|()| Some(ok_reply())),
    };
    deliver(pipe, skeleton, contract, outcome).await
}

/// Invoke a client-exported one-shot callback over a dedicated pipe.
async fn invoke_callback(conn: Arc<Conn>, callback_id: u64) {
    if let Ok(mut pipe) = conn.open_pipe().await {
        let mut head = BytesMut::with_capacity(9);
        head.put_u8(CHANNEL_CALLBACK);
        head.put_u64_le(callback_id);
        let _ = pipe.send_raw(head.freeze()).await;
        pipe.close().await;
    }
}

async fn verify_db(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    db: &Arc<dyn Database>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let contract = DbOp::Verify.contract();
    let outcome: Outcome = async {
        let flags = get_u8(buf)?;
        let token = get_u64(buf)?;
        let result = if flags & 1 != 0 {
            let mut events = CollectingVerify::default();
            let result = db.verify(Some(&mut events))?;
            stream_relay(&session.conn, token, RELAY_KIND_VERIFY, events.events).await?;
            result
        } else {
            db.verify(None)?
        };
        let mut reply = ok_reply();
        reply.put_u8(result as u8);
        Ok(Some(reply))
    }
    .await;
    deliver(pipe, skeleton, contract, outcome).await
}

async fn compact_file(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    db: &Arc<dyn Database>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let contract = DbOp::CompactFile.contract();
    let outcome: Outcome = async {
        let target = f64::from_bits(get_u64(buf)?);
        let flags = get_u8(buf)?;
        let token = get_u64(buf)?;
        let result = if flags & 1 != 0 {
            let mut events = CollectingCompact::default();
            let result = db.compact_file(Some(&mut events), target)?;
            stream_relay(&session.conn, token, RELAY_KIND_COMPACT, events.events).await?;
            result
        } else {
            db.compact_file(None, target)?
        };
        let mut reply = ok_reply();
        reply.put_u8(result as u8);
        Ok(Some(reply))
    }
    .await;
    deliver(pipe, skeleton, contract, outcome).await
}

async fn view_op<V: View + ?Sized>(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    view: &V,
    index: Option<&Arc<dyn Index>>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match ViewOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let require_index = |index: Option<&Arc<dyn Index>>| -> Result<Arc<dyn Index>> {
        index.cloned().ok_or_else(|| {
            RemoteError::unsupported("operation requires an index, not a plain view")
        })
    };

    let outcome: Outcome = match op {
        ViewOp::Dispose => unreachable!("dispose handled above"),
        ViewOp::Ordering => {
            let mut reply = ok_reply();
            reply.put_u8(view.ordering() as u8);
            Ok(Some(reply))
        }
        ViewOp::NewCursor => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let cursor = view.new_cursor(txn)?;
            let exported = session
                .registry
                .export(Remote::Cursor(parking_lot::Mutex::new(cursor)));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        ViewOp::NewAccessor => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let mut cursor = view.new_cursor(txn)?;
            cursor.set_autoload(false);
            cursor.find(&key)?;
            let exported = session
                .registry
                .export(Remote::Cursor(parking_lot::Mutex::new(cursor)));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        ViewOp::NewTransaction => (|| {
            let durability = DurabilityMode::from_u8(get_u8(buf)?);
            let txn = view.new_transaction(durability)?;
            let exported = session.registry.export(Remote::Txn(txn));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        ViewOp::IsEmpty => view.is_empty().map(|empty| {
            let mut reply = ok_reply();
            reply.put_u8(empty as u8);
            Some(reply)
        }),
        ViewOp::Count => (|| {
            let low = get_opt_bytes(buf)?;
            let high = get_opt_bytes(buf)?;
            let count = view.count(low.as_deref(), high.as_deref())?;
            let mut reply = ok_reply();
            reply.put_u64_le(count);
            Ok(Some(reply))
        })(),
        ViewOp::Load => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let value = view.load(txn.as_ref(), &key)?;
            let mut reply = ok_reply();
            put_opt_bytes(&mut reply, value.as_deref());
            Ok(Some(reply))
        })(),
        ViewOp::Exists => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let exists = view.exists(txn.as_ref(), &key)?;
            let mut reply = ok_reply();
            reply.put_u8(exists as u8);
            Ok(Some(reply))
        })(),
        ViewOp::Touch => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let result = view.touch(txn.as_ref(), &key)?;
            let mut reply = ok_reply();
            reply.put_u8(result as u8);
            Ok(Some(reply))
        })(),
        ViewOp::Store => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let value = get_opt_bytes(buf)?;
            view.store(txn.as_ref(), &key, value.as_deref())?;
            Ok(Some(ok_reply()))
        })(),
        ViewOp::Exchange => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let value = get_opt_bytes(buf)?;
            let old = view.exchange(txn.as_ref(), &key, value.as_deref())?;
            let mut reply = ok_reply();
            put_opt_bytes(&mut reply, old.as_deref());
            Ok(Some(reply))
        })(),
        ViewOp::Insert | ViewOp::Replace | ViewOp::Update | ViewOp::Delete => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let changed = match op {
                ViewOp::Insert => {
                    let value = get_opt_bytes(buf)?;
                    view.insert(txn.as_ref(), &key, value.as_deref())?
                }
                ViewOp::Replace => {
                    let value = get_opt_bytes(buf)?;
                    view.replace(txn.as_ref(), &key, value.as_deref())?
                }
                ViewOp::Update => {
                    let value = get_opt_bytes(buf)?;
                    view.update(txn.as_ref(), &key, value.as_deref())?
                }
                _ => view.delete(txn.as_ref(), &key)?,
            };
            let mut reply = ok_reply();
            reply.put_u8(changed as u8);
            Ok(Some(reply))
        })(),
        ViewOp::UpdateWithOld => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let old = get_opt_bytes(buf)?;
            let value = get_opt_bytes(buf)?;
            let changed = view.update_with_old(txn.as_ref(), &key, old.as_deref(), value.as_deref())?;
            let mut reply = ok_reply();
            reply.put_u8(changed as u8);
            Ok(Some(reply))
        })(),
        ViewOp::Remove => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let key = get_bytes(buf)?;
            let old = get_opt_bytes(buf)?;
            let changed = view.remove(txn.as_ref(), &key, old.as_deref())?;
            let mut reply = ok_reply();
            reply.put_u8(changed as u8);
            Ok(Some(reply))
        })(),
        ViewOp::LockShared
        | ViewOp::LockUpgradable
        | ViewOp::LockExclusive
        | ViewOp::TryLockShared
        | ViewOp::TryLockUpgradable
        | ViewOp::TryLockExclusive => (|| {
            let txn = session
                .txn_arg(get_u64(buf)?)?
                .ok_or_else(|| RemoteError::illegal_state("lock requires a transaction"))?;
            let key = get_bytes(buf)?;
            let result = match op {
                ViewOp::LockShared => view.lock_shared(&txn, &key)?,
                ViewOp::LockUpgradable => view.lock_upgradable(&txn, &key)?,
                ViewOp::LockExclusive => view.lock_exclusive(&txn, &key)?,
                ViewOp::TryLockShared => view.try_lock_shared(&txn, &key, get_u64(buf)?)?,
                ViewOp::TryLockUpgradable => {
                    view.try_lock_upgradable(&txn, &key, get_u64(buf)?)?
                }
                _ => view.try_lock_exclusive(&txn, &key, get_u64(buf)?)?,
            };
            let mut reply = ok_reply();
            reply.put_u8(result as u8);
            Ok(Some(reply))
        })(),
        ViewOp::LockCheck => (|| {
            let txn = session
                .txn_arg(get_u64(buf)?)?
                .ok_or_else(|| RemoteError::illegal_state("lock check requires a transaction"))?;
            let key = get_bytes(buf)?;
            let result = view.lock_check(&txn, &key)?;
            let mut reply = ok_reply();
            reply.put_u8(result as u8);
            Ok(Some(reply))
        })(),
        ViewOp::IsUnmodifiable => {
            let mut reply = ok_reply();
            reply.put_u8(view.is_unmodifiable() as u8);
            Ok(Some(reply))
        }
        ViewOp::IsModifyAtomic => {
            let mut reply = ok_reply();
            reply.put_u8(view.is_modify_atomic() as u8);
            Ok(Some(reply))
        }
        ViewOp::Id => require_index(index).map(|ix| {
            let mut reply = ok_reply();
            reply.put_u64_le(ix.id());
            Some(reply)
        }),
        ViewOp::Name => require_index(index).map(|ix| {
            let mut reply = ok_reply();
            put_bytes(&mut reply, &ix.name());
            Some(reply)
        }),
        ViewOp::AsTable => (|| {
            let ix = require_index(index)?;
            let mut descriptor_bytes = get_bytes(buf)?;
            let descriptor =
                Arc::new(RowDescriptor::decode(&mut descriptor_bytes.as_slice())?);
            let table = Arc::new(ServerTable::base(ix, descriptor));
            let exported = session.registry.export(Remote::Table(table));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        ViewOp::Evict => (|| {
            let ix = require_index(index)?;
            let txn = session.txn_arg(get_u64(buf)?)?;
            let low = get_opt_bytes(buf)?;
            let high = get_opt_bytes(buf)?;
            let freed = ix.evict(txn.as_ref(), low.as_deref(), high.as_deref())?;
            let mut reply = ok_reply();
            reply.put_u64_le(freed);
            Ok(Some(reply))
        })(),
        ViewOp::Analyze => require_index(index).and_then(|ix| {
            let stats = ix.analyze()?;
            let mut reply = ok_reply();
            stats.encode(&mut reply);
            Ok(Some(reply))
        }),
        ViewOp::VerifyIndex => {
            let ix = match require_index(index) {
                Ok(ix) => ix,
                Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
            };
            let outcome: Outcome = async {
                let flags = get_u8(buf)?;
                let token = get_u64(buf)?;
                let result = if flags & 1 != 0 {
                    let mut events = CollectingVerify::default();
                    let result = ix.verify(&mut events)?;
                    stream_relay(&session.conn, token, RELAY_KIND_VERIFY, events.events)
                        .await?;
                    result
                } else {
                    let mut sink = CountingSink;
                    ix.verify(&mut sink)?
                };
                let mut reply = ok_reply();
                reply.put_u8(result as u8);
                Ok(Some(reply))
            }
            .await;
            return deliver(pipe, skeleton, contract, outcome).await;
        }
        ViewOp::CloseIndex => require_index(index).and_then(|ix| {
            ix.close()?;
            session.registry.remove(skeleton.id);
            Ok(Some(ok_reply()))
        }),
        ViewOp::Drop => require_index(index).and_then(|ix| {
            let deletion = ix.drop_index()?;
            let exported = session.registry.export(Remote::Deletion(deletion));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        }),
        ViewOp::IsClosedIndex => require_index(index).map(|ix| {
            let mut reply = ok_reply();
            reply.put_u8(ix.is_closed() as u8);
            Some(reply)
        }),
    };
    deliver(pipe, skeleton, contract, outcome).await
}

/// Verification sink for callers that asked for no observer traffic.
struct CountingSink;

impl crate::engine::VerificationEvents for CountingSink {
    fn node_passed(&mut self, _: u64, _: u8, _: u32, _: u32, _: u32) -> bool {
        true
    }

    fn node_failed(&mut self, _: u64, _: u8, _: &str) -> bool {
        true
    }
}

/// Reply for a positional cursor operation: lock result, key, value state.
fn position_reply(cursor: &dyn Cursor, lock: crate::engine::types::LockResult) -> BytesMut {
    let mut reply = ok_reply();
    reply.put_u8(lock as u8);
    put_opt_bytes(&mut reply, cursor.key());
    encode_cursor_value(&cursor.value(), &mut reply);
    reply
}

async fn cursor_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match CursorOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let Remote::Cursor(cursor_slot) = &skeleton.remote else {
        unreachable!("cursor_op is only dispatched for cursor handles");
    };

    // Value streams take the pipe over; everything else replies in place.
    match op {
        CursorOp::ValueInputStream => {
            let outcome = value_input_stream(cursor_slot, buf, pipe).await;
            return match outcome {
                Ok(()) => Ok(()),
                Err(e) => deliver(pipe, skeleton, contract, Err(e)).await,
            };
        }
        CursorOp::ValueOutputStream => {
            let outcome = value_output_stream(cursor_slot, buf, pipe).await;
            return match outcome {
                Ok(()) => Ok(()),
                Err(e) => deliver(pipe, skeleton, contract, Err(e)).await,
            };
        }
        _ => {}
    }

    let outcome: Outcome = {
    let mut cursor = cursor_slot.lock();
    match op {
        CursorOp::Dispose | CursorOp::ValueInputStream | CursorOp::ValueOutputStream => {
            unreachable!("handled above")
        }
        CursorOp::Ordering => {
            let mut reply = ok_reply();
            reply.put_u8(cursor.ordering() as u8);
            Ok(Some(reply))
        }
        CursorOp::Link => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            cursor.link(txn);
            Ok(None)
        })(),
        CursorOp::Key => {
            let mut reply = ok_reply();
            put_opt_bytes(&mut reply, cursor.key());
            Ok(Some(reply))
        }
        CursorOp::Value => {
            let mut reply = ok_reply();
            encode_cursor_value(&cursor.value(), &mut reply);
            Ok(Some(reply))
        }
        CursorOp::Autoload => (|| {
            cursor.set_autoload(get_bool(buf)?);
            Ok(None)
        })(),
        CursorOp::First => cursor.first().map(|lock| Some(position_reply(&**cursor, lock))),
        CursorOp::Last => cursor.last().map(|lock| Some(position_reply(&**cursor, lock))),
        CursorOp::Skip => (|| {
            let amount = get_u64(buf)? as i64;
            let lock = cursor.skip(amount)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::SkipBounded => (|| {
            let amount = get_u64(buf)? as i64;
            let limit = get_opt_bytes(buf)?;
            let inclusive = get_bool(buf)?;
            let lock = cursor.skip_bounded(amount, limit.as_deref(), inclusive)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::Next => cursor.next().map(|lock| Some(position_reply(&**cursor, lock))),
        CursorOp::NextLe => (|| {
            let limit = get_bytes(buf)?;
            let lock = cursor.next_le(&limit)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::NextLt => (|| {
            let limit = get_bytes(buf)?;
            let lock = cursor.next_lt(&limit)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::Previous => cursor
            .previous()
            .map(|lock| Some(position_reply(&**cursor, lock))),
        CursorOp::PreviousGe => (|| {
            let limit = get_bytes(buf)?;
            let lock = cursor.previous_ge(&limit)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::PreviousGt => (|| {
            let limit = get_bytes(buf)?;
            let lock = cursor.previous_gt(&limit)?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::Find
        | CursorOp::FindGe
        | CursorOp::FindGt
        | CursorOp::FindLe
        | CursorOp::FindLt
        | CursorOp::FindNearby => (|| {
            let key = get_bytes(buf)?;
            let lock = match op {
                CursorOp::Find => cursor.find(&key)?,
                CursorOp::FindGe => cursor.find_ge(&key)?,
                CursorOp::FindGt => cursor.find_gt(&key)?,
                CursorOp::FindLe => cursor.find_le(&key)?,
                CursorOp::FindLt => cursor.find_lt(&key)?,
                _ => cursor.find_nearby(&key)?,
            };
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::Random => (|| {
            let low = get_opt_bytes(buf)?;
            let high = get_opt_bytes(buf)?;
            let lock = cursor.random(low.as_deref(), high.as_deref())?;
            Ok(Some(position_reply(&**cursor, lock)))
        })(),
        CursorOp::Exists => cursor.exists().map(|exists| {
            let mut reply = ok_reply();
            reply.put_u8(exists as u8);
            Some(reply)
        }),
        CursorOp::Lock => cursor.lock().map(|lock| {
            let mut reply = ok_reply();
            reply.put_u8(lock as u8);
            Some(reply)
        }),
        CursorOp::Load => cursor.load().map(|lock| {
            let mut reply = ok_reply();
            reply.put_u8(lock as u8);
            encode_cursor_value(&cursor.value(), &mut reply);
            Some(reply)
        }),
        CursorOp::Store => (|| {
            let value = get_opt_bytes(buf)?;
            cursor.store(value.as_deref())?;
            Ok(Some(ok_reply()))
        })(),
        CursorOp::Commit => (|| {
            let value = get_opt_bytes(buf)?;
            cursor.commit(value.as_deref())?;
            Ok(Some(ok_reply()))
        })(),
        CursorOp::Delete => cursor.delete().map(|()| Some(ok_reply())),
        CursorOp::Register => cursor.register().map(|registered| {
            let mut reply = ok_reply();
            reply.put_u8(registered as u8);
            Some(reply)
        }),
        CursorOp::Unregister => {
            cursor.unregister();
            Ok(None)
        }
        CursorOp::Copy => {
            let copy = cursor.copy();
            let exported = session
                .registry
                .export(Remote::Cursor(parking_lot::Mutex::new(copy)));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        }
        CursorOp::Reset => {
            cursor.reset();
            drop(cursor);
            session.registry.remove(skeleton.id);
            return Ok(());
        }
        CursorOp::ValueLength => cursor.value_length().map(|length| {
            let mut reply = ok_reply();
            reply.put_u64_le(length as u64);
            Some(reply)
        }),
        CursorOp::SetValueLength => (|| {
            cursor.set_value_length(get_u64(buf)?)?;
            Ok(Some(ok_reply()))
        })(),
        CursorOp::ValueRead => (|| {
            let pos = get_u64(buf)?;
            let len = get_u32(buf)? as usize;
            let mut data = vec![0u8; len.min(MAX_CHUNK)];
            let n = cursor.value_read(pos, &mut data)?;
            let mut reply = ok_reply();
            reply.put_u32_le(n as u32);
            if n > 0 {
                reply.put_slice(&data[..n as usize]);
            }
            Ok(Some(reply))
        })(),
        CursorOp::ValueWrite => (|| {
            let pos = get_u64(buf)?;
            let data = get_bytes(buf)?;
            cursor.value_write(pos, &data)?;
            Ok(Some(ok_reply()))
        })(),
        CursorOp::ValueClear => (|| {
            let pos = get_u64(buf)?;
            let length = get_u64(buf)?;
            cursor.value_clear(pos, length)?;
            Ok(Some(ok_reply()))
        })(),
    }
    };
    deliver(pipe, skeleton, contract, outcome).await
}

/// Stream the value at the cursor position to the client in 15-bit chunks.
async fn value_input_stream(
    cursor_slot: &parking_lot::Mutex<Box<dyn Cursor>>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let mut pos = get_u64(buf)?;
    let chunk_len = (get_u32(buf)? as usize).clamp(1, MAX_CHUNK);
    pipe.send_message(&ok_reply()).await?;

    let mut data = vec![0u8; chunk_len];
    loop {
        let read = {
            let mut cursor = cursor_slot.lock();
            cursor.value_read(pos, &mut data)
        };
        match read {
            Ok(n) if n > 0 => {
                pos += n as u64;
                let mut chunk = BytesMut::with_capacity(2 + n as usize);
                chunk.put_u16_le(n as u16 & CHUNK_LEN_MASK);
                chunk.put_slice(&data[..n as usize]);
                pipe.send_raw(chunk.freeze()).await?;
            }
            Ok(_) => {
                let mut chunk = BytesMut::with_capacity(2);
                chunk.put_u16_le(CHUNK_END_FLAG);
                pipe.send_raw(chunk.freeze()).await?;
                break;
            }
            Err(e) => {
                let mut chunk = BytesMut::new();
                chunk.put_u16_le(CHUNK_EXCEPTION);
                let mut encoded = BytesMut::new();
                encode_error(&e, &mut encoded);
                chunk.put_u32_le(encoded.len() as u32);
                chunk.extend_from_slice(&encoded);
                pipe.send_raw(chunk.freeze()).await?;
                break;
            }
        }
    }
    // Completion ack from the client lets it recycle the pipe.
    let _ = pipe.read_u8().await?;
    Ok(())
}

/// Receive a client value stream, applying chunks at advancing positions.
async fn value_output_stream(
    cursor_slot: &parking_lot::Mutex<Box<dyn Cursor>>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let mut pos = get_u64(buf)?;
    pipe.send_message(&ok_reply()).await?;

    let mut pending: Option<RemoteError> = None;
    loop {
        let header = pipe.read_u16_le().await?;
        if header == CHUNK_EXCEPTION {
            // The client abandoned the stream.
            return Ok(());
        }
        let len = (header & CHUNK_LEN_MASK) as usize;
        let end = header & CHUNK_END_FLAG != 0;
        if len > 0 {
            let data = pipe.read_exact(len).await?;
            if pending.is_none() {
                let write = {
                    let mut cursor = cursor_slot.lock();
                    cursor.value_write(pos, &data)
                };
                if let Err(e) = write {
                    pending = Some(e);
                }
            }
            pos += len as u64;
        }
        if end || len == 0 {
            // Flush-ack request, or close when the end flag is set.
            let mut ack = BytesMut::new();
            match pending.take() {
                None => ack.put_u8(STATUS_OK),
                Some(e) => {
                    ack.put_u8(STATUS_ERR);
                    let mut encoded = BytesMut::new();
                    encode_error(&e, &mut encoded);
                    ack.put_u32_le(encoded.len() as u32);
                    ack.extend_from_slice(&encoded);
                }
            }
            pipe.send_raw(ack.freeze()).await?;
            if end {
                return Ok(());
            }
        }
    }
}

async fn txn_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    txn: &Arc<dyn Transaction>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match TxnOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let outcome: Outcome = match op {
        TxnOp::Dispose => unreachable!("dispose handled above"),
        TxnOp::LockMode => {
            let mut reply = ok_reply();
            reply.put_u8(txn.lock_mode() as u8);
            Ok(Some(reply))
        }
        TxnOp::SetLockMode => (|| {
            txn.set_lock_mode(LockMode::from_u8(get_u8(buf)?));
            Ok(None)
        })(),
        TxnOp::LockTimeout => {
            let unit = TimeUnit::from_u8(get_u8(buf).unwrap_or(0));
            let mut reply = ok_reply();
            reply.put_u64_le(unit.from_nanos(txn.lock_timeout_nanos()));
            Ok(Some(reply))
        }
        TxnOp::SetLockTimeout => (|| {
            let unit = TimeUnit::from_u8(get_u8(buf)?);
            let amount = get_u64(buf)?;
            txn.set_lock_timeout_nanos(unit.to_nanos(amount));
            Ok(None)
        })(),
        TxnOp::Durability => {
            let mut reply = ok_reply();
            reply.put_u8(txn.durability_mode() as u8);
            Ok(Some(reply))
        }
        TxnOp::SetDurability => (|| {
            txn.set_durability_mode(DurabilityMode::from_u8(get_u8(buf)?));
            Ok(None)
        })(),
        TxnOp::Check => txn.check().map(|()| Some(ok_reply())),
        TxnOp::IsBogus => {
            let mut reply = ok_reply();
            reply.put_u8(txn.is_bogus() as u8);
            Ok(Some(reply))
        }
        TxnOp::Commit => txn.commit().map(|()| {
            let disposed = txn.nesting_depth() == 0 && !txn.is_bogus();
            if disposed {
                session.registry.remove(skeleton.id);
            }
            let mut reply = ok_reply();
            reply.put_u8(disposed as u8);
            Some(reply)
        }),
        TxnOp::CommitAll => txn.commit_all().map(|()| {
            if !txn.is_bogus() {
                session.registry.remove(skeleton.id);
            }
            Some(ok_reply())
        }),
        TxnOp::Enter => txn.enter().map(|()| Some(ok_reply())),
        TxnOp::Exit => txn.exit().map(|()| Some(ok_reply())),
        TxnOp::Reset => txn.reset().map(|()| {
            if !txn.is_bogus() {
                session.registry.remove(skeleton.id);
            }
            Some(ok_reply())
        }),
        TxnOp::ResetCause => (|| {
            let cause = get_str(buf)?;
            txn.reset_cause(&cause);
            session.registry.remove(skeleton.id);
            Ok(None)
        })(),
        TxnOp::Rollback => txn.rollback().map(|()| Some(ok_reply())),
        TxnOp::LockShared
        | TxnOp::LockUpgradable
        | TxnOp::LockExclusive
        | TxnOp::TryLockShared
        | TxnOp::TryLockUpgradable
        | TxnOp::TryLockExclusive => (|| {
            let index_id = get_u64(buf)?;
            let key = get_bytes(buf)?;
            let result = match op {
                TxnOp::LockShared => txn.lock_shared(index_id, &key)?,
                TxnOp::LockUpgradable => txn.lock_upgradable(index_id, &key)?,
                TxnOp::LockExclusive => txn.lock_exclusive(index_id, &key)?,
                TxnOp::TryLockShared => txn.try_lock_shared(index_id, &key, get_u64(buf)?)?,
                TxnOp::TryLockUpgradable => {
                    txn.try_lock_upgradable(index_id, &key, get_u64(buf)?)?
                }
                _ => txn.try_lock_exclusive(index_id, &key, get_u64(buf)?)?,
            };
            let mut reply = ok_reply();
            reply.put_u8(result as u8);
            Ok(Some(reply))
        })(),
        TxnOp::LockCheck => (|| {
            let index_id = get_u64(buf)?;
            let key = get_bytes(buf)?;
            let result = txn.lock_check(index_id, &key)?;
            let mut reply = ok_reply();
            reply.put_u8(result as u8);
            Ok(Some(reply))
        })(),
        TxnOp::LastLockedIndex => {
            let mut reply = ok_reply();
            reply.put_u64_le(txn.last_locked_index());
            Ok(Some(reply))
        }
        TxnOp::LastLockedKey => {
            let mut reply = ok_reply();
            put_opt_bytes(&mut reply, txn.last_locked_key().as_deref());
            Ok(Some(reply))
        }
        TxnOp::WasAcquired => {
            let mut reply = ok_reply();
            reply.put_u8(txn.was_acquired() as u8);
            Ok(Some(reply))
        }
        TxnOp::Unlock => txn.unlock().map(|()| Some(ok_reply())),
        TxnOp::UnlockToShared => txn.unlock_to_shared().map(|()| Some(ok_reply())),
        TxnOp::UnlockCombine => txn.unlock_combine().map(|()| Some(ok_reply())),
        TxnOp::Id => {
            let mut reply = ok_reply();
            reply.put_u64_le(txn.id());
            Ok(Some(reply))
        }
        TxnOp::Flush => txn.flush().map(|()| Some(ok_reply())),
    };
    deliver(pipe, skeleton, contract, outcome).await
}

async fn table_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    table: &Arc<ServerTable>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match TableOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    match op {
        TableOp::NewScanner => {
            return scanner_stream(session, skeleton, table, buf, pipe).await;
        }
        TableOp::NewUpdater => {
            return updater_stream(session, skeleton, table, buf, pipe).await;
        }
        _ => {}
    }

    let outcome: Outcome = match op {
        TableOp::Dispose | TableOp::NewScanner | TableOp::NewUpdater => {
            unreachable!("handled above")
        }
        TableOp::Proxy => (|| {
            let mut descriptor_bytes = get_bytes(buf)?;
            let descriptor = Arc::new(RowDescriptor::decode(&mut descriptor_bytes.as_slice())?);
            if descriptor != table.descriptor {
                return Err(RemoteError::illegal_state(
                    "proxy descriptor does not match the table",
                ));
            }
            let proxy = Arc::new(RowProxy::new(table.index.clone(), descriptor));
            let exported = session.registry.export(Remote::Proxy(proxy));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            Ok(Some(reply))
        })(),
        TableOp::Derive => (|| {
            let text = get_str(buf)?;
            let args = decode_args(buf)?;
            let query = PreparedQuery::parse(&table.descriptor, &text)?;
            let derived = Arc::new(table.derive(query, args)?);
            let descriptor_bytes = derived.descriptor.content_key();
            let exported = session.registry.export(Remote::Table(derived));
            let mut reply = ok_reply();
            reply.put_u64_le(exported.id);
            put_bytes(&mut reply, &descriptor_bytes);
            Ok(Some(reply))
        })(),
        TableOp::Validate => (|| {
            let text = get_str(buf)?;
            let query = PreparedQuery::parse(&table.descriptor, &text)?;
            let mut reply = ok_reply();
            reply.put_u16_le(query.arg_count as u16);
            Ok(Some(reply))
        })(),
        TableOp::ScannerPlan | TableOp::UpdaterPlan | TableOp::StreamPlan => (|| {
            let text = get_str(buf)?;
            let reverse = get_bool(buf)?;
            let query = PreparedQuery::parse(&table.descriptor, &text)?;
            let plan = query.plan(&table.index.name_string(), reverse);
            let mut reply = ok_reply();
            plan.encode(&mut reply);
            Ok(Some(reply))
        })(),
        TableOp::DeleteAll => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let rows = table.scan_rows(txn.as_ref(), None)?;
            let mut deleted = 0u64;
            for (key, _) in rows {
                if table.index.delete(txn.as_ref(), &key)? {
                    deleted += 1;
                }
            }
            let mut reply = ok_reply();
            reply.put_u64_le(deleted);
            Ok(Some(reply))
        })(),
        TableOp::AnyRows => (|| {
            let txn = session.txn_arg(get_u64(buf)?)?;
            let text = get_str(buf)?;
            let args = decode_args(buf)?;
            let query = PreparedQuery::parse(&table.descriptor, &text)?;
            let rows = table.scan_rows(txn.as_ref(), Some((&query, &args)))?;
            let mut reply = ok_reply();
            reply.put_u8(!rows.is_empty() as u8);
            Ok(Some(reply))
        })(),
        TableOp::IsEmpty => (|| {
            let rows = table.scan_rows(None, None)?;
            let mut reply = ok_reply();
            reply.put_u8(rows.is_empty() as u8);
            Ok(Some(reply))
        })(),
    };
    deliver(pipe, skeleton, contract, outcome).await
}

/// Stream rows: characteristics, acknowledged batches, end marker, status.
async fn scanner_stream(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    table: &Arc<ServerTable>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let contract = TableOp::NewScanner.contract();
    let setup: Result<Vec<(Vec<u8>, Vec<u8>)>> = (|| {
        let txn = session.txn_arg(get_u64(buf)?)?;
        let text = get_str(buf)?;
        let args = decode_args(buf)?;
        let query = PreparedQuery::parse(&table.descriptor, &text)?;
        table.scan_rows(txn.as_ref(), Some((&query, &args)))
    })();
    let rows = match setup {
        Ok(rows) => rows,
        Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
    };

    let mut reply = ok_reply();
    reply.put_u8(SCAN_ORDERED);
    pipe.send_message(&reply).await?;

    stream_rows(pipe, rows).await
}

/// Shared row-batch streaming with per-batch acknowledgements.
async fn stream_rows(pipe: &mut Pipe, rows: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
    let mut batch = BytesMut::new();
    for (key, value) in rows {
        batch.put_u32_le(key.len() as u32);
        batch.put_slice(&key);
        batch.put_u32_le(value.len() as u32);
        batch.put_slice(&value);
        if batch.len() >= ROW_BATCH_BYTES {
            if !flush_batch(pipe, &mut batch).await? {
                return Ok(());
            }
        }
    }
    if !batch.is_empty() && !flush_batch(pipe, &mut batch).await? {
        return Ok(());
    }
    let mut end = BytesMut::new();
    end.put_u32_le(ROW_STREAM_END);
    end.put_u8(STATUS_OK);
    pipe.send_raw(end.freeze()).await?;
    Ok(())
}

async fn flush_batch(pipe: &mut Pipe, batch: &mut BytesMut) -> Result<bool> {
    let payload = batch.split();
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32_le(payload.len() as u32);
    framed.extend_from_slice(&payload);
    pipe.send_raw(framed.freeze()).await?;
    Ok(pipe.read_u8().await? == RELAY_ACK)
}

/// Interactive updater stream over the matching rows.
async fn updater_stream(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    table: &Arc<ServerTable>,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let contract = TableOp::NewUpdater.contract();
    let setup: Result<(Option<Arc<dyn Transaction>>, Vec<(Vec<u8>, Vec<u8>)>)> = (|| {
        if table.derived.is_some() {
            return Err(RemoteError::unsupported(
                "updaters require a base table, not a derived table",
            ));
        }
        let txn = session.txn_arg(get_u64(buf)?)?;
        let text = get_str(buf)?;
        let args = decode_args(buf)?;
        let query = PreparedQuery::parse(&table.descriptor, &text)?;
        let rows = table.scan_rows(txn.as_ref(), Some((&query, &args)))?;
        Ok((txn, rows))
    })();
    let (txn, rows) = match setup {
        Ok(setup) => setup,
        Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
    };

    pipe.send_message(&ok_reply()).await?;

    let proxy = RowProxy::new(table.index.clone(), table.descriptor.clone());
    let mut position = 0usize;
    send_updater_row(pipe, rows.get(position)).await?;

    loop {
        let command = match pipe.read_u8().await {
            Ok(command) => command,
            Err(_) => return Ok(()),
        };
        match command {
            UPDATER_CLOSE => return Ok(()),
            UPDATER_STEP => {
                position += 1;
                send_updater_row(pipe, rows.get(position)).await?;
            }
            UPDATER_UPDATE => {
                let len = pipe.read_u32_le().await? as usize;
                let partial = pipe.read_exact(len).await?;
                let outcome = match rows.get(position) {
                    Some((key, _)) => proxy.update(txn.as_ref(), key, &partial).map(|_| ()),
                    None => Err(RemoteError::illegal_state("updater has no current row")),
                };
                match outcome {
                    Ok(()) => {
                        position += 1;
                        send_updater_row(pipe, rows.get(position)).await?;
                    }
                    Err(e) => send_updater_err(pipe, &e).await?,
                }
            }
            UPDATER_DELETE => {
                let outcome = match rows.get(position) {
                    Some((key, _)) => table.index.delete(txn.as_ref(), key).map(|_| ()),
                    None => Err(RemoteError::illegal_state("updater has no current row")),
                };
                match outcome {
                    Ok(()) => {
                        position += 1;
                        send_updater_row(pipe, rows.get(position)).await?;
                    }
                    Err(e) => send_updater_err(pipe, &e).await?,
                }
            }
            other => {
                let e = RemoteError::io(format!("unknown updater command {}", other));
                send_updater_err(pipe, &e).await?;
                return Ok(());
            }
        }
    }
}

async fn send_updater_row(pipe: &mut Pipe, row: Option<&(Vec<u8>, Vec<u8>)>) -> Result<()> {
    let mut out = BytesMut::new();
    out.put_u8(STATUS_OK);
    match row {
        Some((key, value)) => {
            out.put_u8(1);
            out.put_u32_le(key.len() as u32);
            out.put_slice(key);
            out.put_u32_le(value.len() as u32);
            out.put_slice(value);
        }
        None => out.put_u8(0),
    }
    pipe.send_raw(out.freeze()).await
}

async fn send_updater_err(pipe: &mut Pipe, error: &RemoteError) -> Result<()> {
    let mut out = BytesMut::new();
    out.put_u8(STATUS_ERR);
    let mut encoded = BytesMut::new();
    encode_error(error, &mut encoded);
    out.put_u32_le(encoded.len() as u32);
    out.extend_from_slice(&encoded);
    pipe.send_raw(out.freeze()).await
}

async fn proxy_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    proxy: &Arc<RowProxy>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match ProxyOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let outcome: Outcome = (|| {
        let txn = session.txn_arg(get_u64(buf)?)?;
        let key = get_bytes(buf)?;
        Ok(Some(match op {
            ProxyOp::Dispose => unreachable!("dispose handled above"),
            ProxyOp::Load => {
                let value = proxy.load(txn.as_ref(), &key)?;
                let mut reply = ok_reply();
                put_opt_bytes(&mut reply, value.as_deref());
                reply
            }
            ProxyOp::Exists => {
                let exists = proxy.exists(txn.as_ref(), &key)?;
                let mut reply = ok_reply();
                reply.put_u8(exists as u8);
                reply
            }
            ProxyOp::Store => {
                let value = get_bytes(buf)?;
                proxy.store(txn.as_ref(), &key, &value)?;
                ok_reply()
            }
            ProxyOp::Exchange => {
                let value = get_bytes(buf)?;
                let old = proxy.exchange(txn.as_ref(), &key, &value)?;
                let mut reply = ok_reply();
                put_opt_bytes(&mut reply, old.as_deref());
                reply
            }
            ProxyOp::Insert => {
                let value = get_bytes(buf)?;
                let inserted = proxy.insert(txn.as_ref(), &key, &value)?;
                let mut reply = ok_reply();
                reply.put_u8(inserted as u8);
                reply
            }
            ProxyOp::Replace => {
                let value = get_bytes(buf)?;
                let replaced = proxy.replace(txn.as_ref(), &key, &value)?;
                let mut reply = ok_reply();
                reply.put_u8(replaced as u8);
                reply
            }
            ProxyOp::Update => {
                let partial = get_bytes(buf)?;
                let updated = proxy.update(txn.as_ref(), &key, &partial)?;
                let mut reply = ok_reply();
                reply.put_u8(updated as u8);
                reply
            }
            ProxyOp::Merge => {
                let partial = get_bytes(buf)?;
                let merged = proxy.merge(txn.as_ref(), &key, &partial)?;
                let mut reply = ok_reply();
                put_opt_bytes(&mut reply, merged.as_deref());
                reply
            }
            ProxyOp::Delete => {
                let deleted = proxy.delete(txn.as_ref(), &key)?;
                let mut reply = ok_reply();
                reply.put_u8(deleted as u8);
                reply
            }
        }))
    })();
    deliver(pipe, skeleton, contract, outcome).await
}

async fn sorter_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    sorter: &Arc<dyn Sorter>,
    sel: u8,
    buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match SorterOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    match op {
        SorterOp::AddBatch => {
            // `n` pairs follow as raw length-prefixed byte arrays; the reply
            // carries the first ingest failure, if any.
            let count = match get_u32(buf) {
                Ok(count) => count,
                Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
            };
            let mut failure: Option<RemoteError> = None;
            for _ in 0..count {
                let klen = pipe.read_u32_le().await? as usize;
                let key = pipe.read_exact(klen).await?;
                let vlen = pipe.read_u32_le().await? as usize;
                let value = pipe.read_exact(vlen).await?;
                if failure.is_none() {
                    if let Err(e) = sorter.add(key.to_vec(), value.to_vec()) {
                        failure = Some(e);
                    }
                }
            }
            let outcome = match failure {
                None => Ok(Some(ok_reply())),
                Some(e) => Err(e),
            };
            return deliver(pipe, skeleton, contract, outcome).await;
        }
        SorterOp::AddAll => {
            // Pairs stream until the end marker in place of a key length.
            let mut failure: Option<RemoteError> = None;
            loop {
                let klen = pipe.read_u32_le().await?;
                if klen == ROW_STREAM_END {
                    break;
                }
                let key = pipe.read_exact(klen as usize).await?;
                let vlen = pipe.read_u32_le().await? as usize;
                let value = pipe.read_exact(vlen).await?;
                if failure.is_none() {
                    if let Err(e) = sorter.add(key.to_vec(), value.to_vec()) {
                        failure = Some(e);
                    }
                }
            }
            let outcome = match failure {
                None => Ok(Some(ok_reply())),
                Some(e) => Err(e),
            };
            return deliver(pipe, skeleton, contract, outcome).await;
        }
        SorterOp::FinishScan => {
            let reverse = match get_bool(buf) {
                Ok(reverse) => reverse,
                Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
            };
            let rows = match sorter.finish_scan(reverse) {
                Ok(rows) => rows,
                Err(e) => return deliver(pipe, skeleton, contract, Err(e)).await,
            };
            pipe.send_message(&ok_reply()).await?;
            return stream_rows(pipe, rows).await;
        }
        _ => {}
    }

    let outcome: Outcome = match op {
        SorterOp::Dispose
        | SorterOp::AddBatch
        | SorterOp::AddAll
        | SorterOp::FinishScan => unreachable!("handled above"),
        SorterOp::Add => (|| {
            let key = get_bytes(buf)?;
            let value = get_bytes(buf)?;
            sorter.add(key, value)?;
            Ok(Some(ok_reply()))
        })(),
        SorterOp::Finish => sorter.finish().map(|ix| Some(index_reply(session, ix))),
        SorterOp::Progress => {
            let (added, total) = sorter.progress();
            let mut reply = ok_reply();
            reply.put_u64_le(added);
            match total {
                Some(total) => {
                    reply.put_u8(1);
                    reply.put_u64_le(total);
                }
                None => reply.put_u8(0),
            }
            Ok(Some(reply))
        }
        SorterOp::Reset => sorter.reset().map(|()| Some(ok_reply())),
    };
    deliver(pipe, skeleton, contract, outcome).await
}

async fn snapshot_op(
    session: &Arc<ServerSession>,
    skeleton: &Arc<Skeleton>,
    sel: u8,
    _buf: &mut Bytes,
    pipe: &mut Pipe,
) -> Result<()> {
    let op = match SnapshotOp::from_u8(sel) {
        Ok(op) => op,
        Err(e) => return send_err(pipe, &e).await,
    };
    let contract = op.contract();
    if !predeliver(pipe, skeleton, contract).await? {
        return Ok(());
    }

    let Remote::Snapshot(slot) = &skeleton.remote else {
        unreachable!("snapshot_op is only dispatched for snapshot handles");
    };

    match op {
        SnapshotOp::Dispose => unreachable!("dispose handled above"),
        SnapshotOp::WriteTo => {
            let snapshot = slot.lock().take();
            let Some(snapshot) = snapshot else {
                let e = RemoteError::illegal_state("snapshot was already written");
                return deliver(pipe, skeleton, contract, Err(e)).await;
            };
            let mut data = Vec::new();
            if let Err(e) = snapshot.write_to(&mut data) {
                return deliver(pipe, skeleton, contract, Err(e)).await;
            }
            session.registry.remove(skeleton.id);
            pipe.send_message(&ok_reply()).await?;
            // Byte chunks, a zero length end marker, then the stream CRC.
            let mut hasher = crc32fast::Hasher::new();
            for chunk in data.chunks(ROW_BATCH_BYTES) {
                hasher.update(chunk);
                let mut framed = BytesMut::with_capacity(4 + chunk.len());
                framed.put_u32_le(chunk.len() as u32);
                framed.put_slice(chunk);
                pipe.send_raw(framed.freeze()).await?;
            }
            let mut tail = BytesMut::new();
            tail.put_u32_le(0);
            tail.put_u32_le(hasher.finalize());
            pipe.send_raw(tail.freeze()).await?;
            Ok(())
        }
    }
}
