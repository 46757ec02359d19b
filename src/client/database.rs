// Root database proxy: the origin of every other remote handle.
//
// Canonical-instance caching guarantees that repeated lookups with equal
// parameters return reference-equal stubs. Operations that cannot be safely
// mediated remotely fail with an unsupported error carrying the rationale.

use super::cursor::Cursor;
use super::observer::{
    process_compact_relay, process_verify_relay, CompactionObserver, VerificationObserver,
};
use super::session::{open_session, Connector, Restore, SessionInner, SessionStatus, TcpConnector};
use super::snapshot::Snapshot;
use super::sorter::Sorter;
use super::stub::Stub;
use super::txn::Transaction;
use super::view::{HandlerInner, HandlerProxy, Index, IndexCapture, IndexDeletion, View, ViewCapture};
use crate::config::ClientConfig;
use crate::engine::types::{DurabilityMode, Stats};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_bytes, get_u64, get_u8};
use crate::protocol::DbOp;
use crate::server::registry::ROOT_HANDLE;
use crate::transport::WireStats;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{Arc, Weak};

/// One-shot request against the root database handle, outside any stub.
/// Used by restorable replay and by handle resurrection.
pub(crate) async fn root_call(
    session: &Arc<SessionInner>,
    op: u8,
    args: impl FnOnce(&mut BytesMut),
) -> Result<Bytes> {
    let mut pipe = session.pipe().await?;
    let mut msg = BytesMut::with_capacity(32);
    msg.put_u64_le(ROOT_HANDLE);
    msg.put_u8(op);
    args(&mut msg);
    if let Err(e) = pipe.send_message(&msg).await {
        tokio::spawn(pipe.close());
        return Err(e);
    }
    match pipe.read_message().await {
        Ok(reply) => {
            session.recycle(pipe);
            Stub::parse_reply(reply)
        }
        Err(e) => {
            tokio::spawn(pipe.close());
            Err(e)
        }
    }
}

struct LeaderWatch {
    acquired_id: u64,
    lost_id: u64,
}

#[async_trait]
impl Restore for LeaderWatch {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        // Re-arm only while a callback is still waiting to fire.
        if session.callback_registered(self.acquired_id)
            || session.callback_registered(self.lost_id)
        {
            root_call(session, DbOp::UponLeader as u8, |msg| {
                msg.put_u64_le(self.acquired_id);
                msg.put_u64_le(self.lost_id);
            })
            .await?;
        }
        Ok(())
    }
}

struct DbInner {
    session: Arc<SessionInner>,
    stub: Stub,
    leader_watches: Mutex<Vec<Arc<LeaderWatch>>>,
}

/// The remote database: root of all remote handles for one session.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn put_name(msg: &mut BytesMut, name: &[u8]) {
    msg.put_u32_le(name.len() as u32);
    msg.put_slice(name);
}

fn canonical_hit<T: Send + Sync + 'static>(
    weak: Option<&Weak<dyn Any + Send + Sync>>,
) -> Option<Arc<T>> {
    weak.and_then(|w| w.upgrade())
        .and_then(|any| any.downcast::<T>().ok())
}

fn erase<T: Send + Sync + 'static>(strong: &Arc<T>) -> Weak<dyn Any + Send + Sync> {
    let any: Arc<dyn Any + Send + Sync> = strong.clone();
    Arc::downgrade(&any)
}

impl Database {
    /// Connect over TCP with the configured tokens.
    pub async fn connect(config: ClientConfig) -> Result<Database> {
        let connector = Box::new(TcpConnector::new(config.connect_addr.clone()));
        Database::connect_with(config, connector).await
    }

    /// Connect over an injected transport.
    pub async fn connect_with(
        config: ClientConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Database> {
        let session = open_session(config, connector).await?;
        let epoch = session.epoch();
        Ok(Database {
            inner: Arc::new(DbInner {
                stub: Stub::new(session.clone(), ROOT_HANDLE, epoch),
                session,
                leader_watches: Mutex::new(Vec::new()),
            }),
        })
    }

    pub(crate) fn session(&self) -> &Arc<SessionInner> {
        &self.inner.session
    }

    /// The root stub, re-pointed at the fixed root identity after any
    /// reconnect.
    async fn root(&self) -> &Stub {
        if self.inner.stub.current().await.is_none() {
            self.inner
                .stub
                .install(ROOT_HANDLE, self.inner.session.epoch())
                .await;
        }
        &self.inner.stub
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.session.status()
    }

    /// Wire counters of the live connection, when one exists.
    pub fn wire_stats(&self) -> Option<Arc<WireStats>> {
        self.inner.session.wire_stats()
    }

    fn make_index(
        &self,
        handle: u64,
        id: u64,
        name: Vec<u8>,
        capture: IndexCapture,
    ) -> Index {
        Index::new(
            self.inner.session.clone(),
            handle,
            self.inner.session.epoch(),
            id,
            name,
            capture,
        )
    }

    /// Open (creating if absent) the index with the given name. Repeated
    /// calls return the canonical reference-equal proxy.
    pub async fn open_index(&self, name: &[u8]) -> Result<Index> {
        let session = &self.inner.session;
        if let Some(inner) =
            canonical_hit(session.canonical.by_name.lock().get(name))
        {
            return Ok(Index { inner });
        }

        let mut reply = root_call(session, DbOp::OpenIndex as u8, |msg| {
            put_name(msg, name);
        })
        .await?;
        let handle = get_u64(&mut reply)?;
        let id = get_u64(&mut reply)?;
        let echoed = get_bytes(&mut reply)?;
        let index = self.make_index(handle, id, echoed, IndexCapture::Open(name.to_vec()));

        let mut by_name = session.canonical.by_name.lock();
        if let Some(existing) = canonical_hit::<super::view::IndexInner>(by_name.get(name)) {
            // Lost the canonical race; release the surplus server handle.
            session.spawn_dispose(handle, session.epoch());
            return Ok(Index { inner: existing });
        }
        by_name.insert(name.to_vec(), erase(&index.inner));
        drop(by_name);
        session
            .canonical
            .by_id
            .lock()
            .insert(id, erase(&index.inner));
        let restore_arc: Arc<dyn Restore> = index.inner.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Ok(index)
    }

    /// Find an existing index by name.
    pub async fn find_index(&self, name: &[u8]) -> Result<Option<Index>> {
        let session = &self.inner.session;
        if let Some(inner) =
            canonical_hit(session.canonical.by_name.lock().get(name))
        {
            return Ok(Some(Index { inner }));
        }

        let mut reply = root_call(session, DbOp::FindIndex as u8, |msg| {
            put_name(msg, name);
        })
        .await?;
        if !get_bool(&mut reply)? {
            return Ok(None);
        }
        let handle = get_u64(&mut reply)?;
        let id = get_u64(&mut reply)?;
        let echoed = get_bytes(&mut reply)?;
        let index = self.make_index(handle, id, echoed, IndexCapture::Find(name.to_vec()));

        let mut by_name = session.canonical.by_name.lock();
        if let Some(existing) = canonical_hit::<super::view::IndexInner>(by_name.get(name)) {
            session.spawn_dispose(handle, session.epoch());
            return Ok(Some(Index { inner: existing }));
        }
        by_name.insert(name.to_vec(), erase(&index.inner));
        drop(by_name);
        session
            .canonical
            .by_id
            .lock()
            .insert(id, erase(&index.inner));
        let restore_arc: Arc<dyn Restore> = index.inner.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Ok(Some(index))
    }

    /// Find an existing index by its engine-assigned id.
    pub async fn index_by_id(&self, id: u64) -> Result<Option<Index>> {
        let session = &self.inner.session;
        if let Some(inner) = canonical_hit(session.canonical.by_id.lock().get(&id)) {
            return Ok(Some(Index { inner }));
        }

        let mut reply = root_call(session, DbOp::IndexById as u8, |msg| {
            msg.put_u64_le(id);
        })
        .await?;
        if !get_bool(&mut reply)? {
            return Ok(None);
        }
        let handle = get_u64(&mut reply)?;
        let id_echo = get_u64(&mut reply)?;
        let name = get_bytes(&mut reply)?;
        let index = self.make_index(handle, id_echo, name.clone(), IndexCapture::ById(id));

        let mut by_id = session.canonical.by_id.lock();
        if let Some(existing) = canonical_hit::<super::view::IndexInner>(by_id.get(&id)) {
            session.spawn_dispose(handle, session.epoch());
            return Ok(Some(Index { inner: existing }));
        }
        by_id.insert(id, erase(&index.inner));
        drop(by_id);
        session
            .canonical
            .by_name
            .lock()
            .insert(name, erase(&index.inner));
        let restore_arc: Arc<dyn Restore> = index.inner.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Ok(Some(index))
    }

    pub async fn rename_index(&self, index: &Index, new_name: &[u8]) -> Result<()> {
        let handle = index
            .inner
            .view
            .inner
            .stub
            .current()
            .await
            .ok_or_else(|| RemoteError::illegal_state("index handle is disposed"))?;
        self.root()
            .await
            .invoke(DbOp::RenameIndex as u8, |msg| {
                msg.put_u64_le(handle.id);
                put_name(msg, new_name);
            })
            .await?;
        let old_name = index.name();
        let session = &self.inner.session;
        let mut by_name = session.canonical.by_name.lock();
        if let Some(entry) = by_name.remove(&old_name) {
            by_name.insert(new_name.to_vec(), entry);
        }
        Ok(())
    }

    /// Prepare deletion of an index; running the returned handle commits it.
    pub async fn delete_index(&self, index: &Index) -> Result<IndexDeletion> {
        let handle = index
            .inner
            .view
            .inner
            .stub
            .current()
            .await
            .ok_or_else(|| RemoteError::illegal_state("index handle is disposed"))?;
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::DeleteIndex as u8, |msg| {
                msg.put_u64_le(handle.id);
            })
            .await?;
        let deletion_handle = get_u64(&mut reply)?;
        let session = &self.inner.session;
        session.canonical.by_name.lock().remove(&index.name());
        session.canonical.by_id.lock().remove(&index.id());
        Ok(IndexDeletion::new(
            session.clone(),
            deletion_handle,
            session.epoch(),
        ))
    }

    /// A fresh temporary index, deleted when the session detaches.
    pub async fn temporary_index(&self) -> Result<Index> {
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::TemporaryIndex as u8, |_| {})
            .await?;
        let handle = get_u64(&mut reply)?;
        let id = get_u64(&mut reply)?;
        let name = get_bytes(&mut reply)?;
        Ok(self.make_index(handle, id, name, IndexCapture::Unrestorable))
    }

    async fn singleton_view(&self, key: &str, op: DbOp, capture: ViewCapture) -> Result<View> {
        let session = &self.inner.session;
        if let Some(inner) =
            canonical_hit(session.canonical.singletons.lock().get(key))
        {
            return Ok(View { inner });
        }
        let mut reply = root_call(session, op as u8, |_| {}).await?;
        let handle = get_u64(&mut reply)?;
        let view = View::with_capture(session.clone(), handle, session.epoch(), capture);

        let mut singletons = session.canonical.singletons.lock();
        if let Some(existing) = canonical_hit::<super::view::ViewInner>(singletons.get(key)) {
            session.spawn_dispose(handle, session.epoch());
            return Ok(View { inner: existing });
        }
        singletons.insert(key.to_string(), erase(&view.inner));
        drop(singletons);
        let restore_arc: Arc<dyn Restore> = view.inner.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Ok(view)
    }

    /// Singleton view mapping index id to index name.
    pub async fn registry(&self) -> Result<View> {
        self.singleton_view("registry", DbOp::Registry, ViewCapture::Registry)
            .await
    }

    /// Singleton view mapping index name to index id.
    pub async fn registry_key_map(&self) -> Result<View> {
        self.singleton_view(
            "registry.key.map",
            DbOp::RegistryKeyMap,
            ViewCapture::RegistryKeyMap,
        )
        .await
    }

    pub async fn new_transaction(&self, durability: DurabilityMode) -> Result<Transaction> {
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::NewTransaction as u8, |msg| {
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

    /// The per-database bogus transaction sentinel; a session-wide
    /// singleton that is never disposed until the database is.
    pub async fn bogus(&self) -> Result<Transaction> {
        let session = &self.inner.session;
        if let Some(inner) =
            canonical_hit(session.canonical.singletons.lock().get("bogus"))
        {
            return Ok(Transaction { inner });
        }
        let mut reply = root_call(session, DbOp::Bogus as u8, |_| {}).await?;
        let handle = get_u64(&mut reply)?;
        let txn = Transaction::new_bogus(session.clone(), handle, session.epoch());

        let mut singletons = session.canonical.singletons.lock();
        if let Some(existing) = canonical_hit::<super::txn::TxnInner>(singletons.get("bogus")) {
            return Ok(Transaction { inner: existing });
        }
        singletons.insert("bogus".to_string(), erase(&txn.inner));
        Ok(txn)
    }

    async fn handler(&self, name: &str, prepare: bool, op: DbOp) -> Result<HandlerProxy> {
        let session = &self.inner.session;
        let key = format!("handler.{}.{}", if prepare { "prepare" } else { "custom" }, name);
        if let Some(inner) =
            canonical_hit(session.canonical.singletons.lock().get(&key))
        {
            return Ok(HandlerProxy { inner });
        }
        let mut reply = root_call(session, op as u8, |msg| {
            put_name(msg, name.as_bytes());
        })
        .await?;
        let handle = get_u64(&mut reply)?;
        let inner = Arc::new(HandlerInner {
            session: session.clone(),
            stub: Stub::new(session.clone(), handle, session.epoch()),
            prepare,
            name: name.to_string(),
        });

        let mut singletons = session.canonical.singletons.lock();
        if let Some(existing) = canonical_hit::<HandlerInner>(singletons.get(&key)) {
            session.spawn_dispose(handle, session.epoch());
            return Ok(HandlerProxy { inner: existing });
        }
        singletons.insert(key, erase(&inner));
        drop(singletons);
        let restore_arc: Arc<dyn Restore> = inner.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Ok(HandlerProxy { inner })
    }

    /// Look up the named custom redo writer.
    pub async fn custom_writer(&self, name: &str) -> Result<HandlerProxy> {
        self.handler(name, false, DbOp::CustomWriter).await
    }

    /// Look up the named two-phase prepare writer.
    pub async fn prepare_writer(&self, name: &str) -> Result<HandlerProxy> {
        self.handler(name, true, DbOp::PrepareWriter).await
    }

    pub async fn new_sorter(&self) -> Result<Sorter> {
        let mut reply = self.root().await.invoke(DbOp::NewSorter as u8, |_| {}).await?;
        let handle = get_u64(&mut reply)?;
        Ok(Sorter::new(
            self.inner.session.clone(),
            handle,
            self.inner.session.epoch(),
        ))
    }

    pub async fn preallocate(&self, bytes: u64) -> Result<()> {
        self.root()
            .await
            .invoke(DbOp::Preallocate as u8, |msg| {
                msg.put_u64_le(bytes);
            })
            .await?;
        Ok(())
    }

    pub async fn set_capacity_limit(&self, bytes: i64) -> Result<()> {
        self.root()
            .await
            .invoke_batched(DbOp::SetCapacityLimit as u8, |msg| {
                msg.put_u64_le(bytes as u64);
            })
            .await
    }

    pub async fn capacity_limit(&self) -> Result<i64> {
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::CapacityLimit as u8, |_| {})
            .await?;
        Ok(get_u64(&mut reply)? as i64)
    }

    /// Begin a snapshot; metadata travels with the handle.
    pub async fn begin_snapshot(&self) -> Result<Snapshot> {
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::BeginSnapshot as u8, |_| {})
            .await?;
        let handle = get_u64(&mut reply)?;
        let version = get_u8(&mut reply)?;
        if version != 1 {
            return Err(RemoteError::io(format!(
                "unknown snapshot metadata version {}",
                version
            )));
        }
        let length = get_u64(&mut reply)?;
        let position = get_u64(&mut reply)?;
        let compressible = get_bool(&mut reply)?;
        Ok(Snapshot::new(
            self.inner.session.clone(),
            handle,
            self.inner.session.epoch(),
            length,
            position,
            compressible,
        ))
    }

    pub async fn create_cache_primer(&self) -> Result<Vec<u8>> {
        let mut reply = self
            .root()
            .await
            .invoke(DbOp::CreateCachePrimer as u8, |_| {})
            .await?;
        get_bytes(&mut reply)
    }

    pub async fn apply_cache_primer(&self, data: &[u8]) -> Result<()> {
        self.root()
            .await
            .invoke(DbOp::ApplyCachePrimer as u8, |msg| {
                put_name(msg, data);
            })
            .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats> {
        let mut reply = self.root().await.invoke(DbOp::Stats as u8, |_| {}).await?;
        Stats::decode(&mut reply)
    }

    pub async fn flush(&self) -> Result<()> {
        self.root().await.invoke(DbOp::Flush as u8, |_| {}).await?;
        Ok(())
    }

    pub async fn sync(&self) -> Result<()> {
        self.root().await.invoke(DbOp::Sync as u8, |_| {}).await?;
        Ok(())
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.root().await.invoke(DbOp::Checkpoint as u8, |_| {}).await?;
        Ok(())
    }

    /// Compact the database file toward `target` utilization, relaying node
    /// visits to the local observer.
    pub async fn compact_file(
        &self,
        observer: Option<&mut dyn CompactionObserver>,
        target: f64,
    ) -> Result<bool> {
        let session = self.inner.session.clone();
        let wants = observer.as_ref().map_or(false, |o| o.wants_nodes());
        let root = self.root().await;
        if !wants {
            let mut reply = root
                .invoke(DbOp::CompactFile as u8, |msg| {
                    msg.put_u64_le(target.to_bits());
                    msg.put_u8(0);
                    msg.put_u64_le(0);
                })
                .await?;
            return get_bool(&mut reply);
        }

        let observer = observer.expect("wants_nodes implies an observer");
        let (token, rx) = session.register_relay();
        let mut call = std::pin::pin!(root.invoke_stream(DbOp::CompactFile as u8, |msg| {
            msg.put_u64_le(target.to_bits());
            msg.put_u8(1);
            msg.put_u64_le(token);
        }));
        tokio::select! {
            result = &mut call => {
                session.unregister_relay(token);
                let (pipe, mut reply) = result?;
                session.recycle(pipe);
                get_bool(&mut reply)
            }
            relay = rx => {
                let held = match relay {
                    Ok(relay) => process_compact_relay(relay, observer).await,
                    Err(_) => None,
                };
                let (pipe, mut reply) = call.await?;
                session.recycle(pipe);
                let compacted = get_bool(&mut reply)?;
                match held {
                    Some(error) => Err(error),
                    None => Ok(compacted),
                }
            }
        }
    }

    /// Verify the whole database, relaying node events to the observer.
    pub async fn verify(
        &self,
        observer: Option<&mut dyn VerificationObserver>,
    ) -> Result<bool> {
        let session = self.inner.session.clone();
        let wants = observer.as_ref().map_or(false, |o| o.wants_nodes());
        let root = self.root().await;
        if !wants {
            let mut reply = root
                .invoke(DbOp::Verify as u8, |msg| {
                    msg.put_u8(0);
                    msg.put_u64_le(0);
                })
                .await?;
            return get_bool(&mut reply);
        }

        let observer = observer.expect("wants_nodes implies an observer");
        let (token, rx) = session.register_relay();
        let mut call = std::pin::pin!(root.invoke_stream(DbOp::Verify as u8, |msg| {
            msg.put_u8(1);
            msg.put_u64_le(token);
        }));
        tokio::select! {
            result = &mut call => {
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

    pub async fn is_leader(&self) -> Result<bool> {
        let mut reply = self.root().await.invoke(DbOp::IsLeader as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    /// Register leadership callbacks: `acquired` fires immediately if this
    /// member already leads, `lost` fires once when leadership is lost.
    pub async fn upon_leader(
        &self,
        acquired: impl FnOnce() + Send + 'static,
        lost: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let session = &self.inner.session;
        let acquired_id = session.register_callback(Box::new(acquired));
        let lost_id = session.register_callback(Box::new(lost));
        self.root()
            .await
            .invoke(DbOp::UponLeader as u8, |msg| {
                msg.put_u64_le(acquired_id);
                msg.put_u64_le(lost_id);
            })
            .await?;
        let watch = Arc::new(LeaderWatch {
            acquired_id,
            lost_id,
        });
        let restore_arc: Arc<dyn Restore> = watch.clone();
        let weak: Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        self.inner.leader_watches.lock().push(watch);
        Ok(())
    }

    pub async fn failover(&self) -> Result<()> {
        self.root().await.invoke(DbOp::Failover as u8, |_| {}).await?;
        Ok(())
    }

    /// Close the remote database and this session.
    pub async fn close(&self) -> Result<()> {
        let result = self.root().await.invoke(DbOp::Close as u8, |_| {}).await;
        self.inner.session.shutdown();
        result.map(|_| ())
    }

    pub async fn close_cause(&self, cause: &str) -> Result<()> {
        let result = self
            .root()
            .await
            .invoke(DbOp::CloseCause as u8, |msg| {
                put_name(msg, cause.as_bytes());
            })
            .await;
        self.inner.session.shutdown();
        result.map(|_| ())
    }

    pub async fn is_closed(&self) -> Result<bool> {
        let mut reply = self.root().await.invoke(DbOp::IsClosed as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let result = self.root().await.invoke(DbOp::Shutdown as u8, |_| {}).await;
        self.inner.session.shutdown();
        result.map(|_| ())
    }

    /// A cursor accessor over an index (see [`Index::new_accessor`]).
    pub async fn new_accessor(
        &self,
        index: &Index,
        txn: Option<&Transaction>,
        key: &[u8],
    ) -> Result<Cursor> {
        index.new_accessor(txn, key).await
    }

    /// Checkpoint suspension cannot be mediated remotely: a dropped
    /// connection would silently resume checkpoints while the caller still
    /// believes they are suspended.
    pub fn suspend_checkpoints(&self) -> Result<()> {
        Err(RemoteError::unsupported(
            "checkpoint suspension is not supported remotely: a connection \
             loss would silently resume checkpoints mid-critical-section",
        ))
    }

    pub fn resume_checkpoints(&self) -> Result<()> {
        Err(RemoteError::unsupported(
            "checkpoint suspension is not supported remotely: a connection \
             loss would silently resume checkpoints mid-critical-section",
        ))
    }

    /// The long-lived commit lock cannot be mediated remotely: a dropped
    /// connection would silently release it mid-critical-section.
    pub fn acquire_commit_lock(&self) -> Result<()> {
        Err(RemoteError::unsupported(
            "the commit lock is not supported remotely: a connection loss \
             would silently release it mid-critical-section",
        ))
    }

    /// In-process handler implementations cannot be installed remotely:
    /// safe unregistration on disconnect is not guaranteed.
    pub fn register_custom_handler(&self, _name: &str) -> Result<()> {
        Err(RemoteError::unsupported(
            "custom handler registration is not supported remotely: safe \
             unregistration on disconnect is not guaranteed",
        ))
    }

    pub fn register_prepare_handler(&self, _name: &str) -> Result<()> {
        Err(RemoteError::unsupported(
            "prepare handler registration is not supported remotely: safe \
             unregistration on disconnect is not guaranteed",
        ))
    }
}
