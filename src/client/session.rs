// Client session: transport ownership, reconnect, and the shared
// per-session directories (pipe pool, canonical stubs, callbacks, relays,
// restorable references).

use crate::config::ClientConfig;
use crate::error::{RemoteError, Result};
use crate::protocol::handshake::{ConnectHeader, HEADER_LEN};
use crate::protocol::{CHANNEL_CALLBACK, CHANNEL_RELAY, CHANNEL_REQUEST};
use crate::transport::{BoxedStream, Conn, Pipe, WireStats};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Session lifecycle as observed by stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// Supplies the transport byte stream; injectable for tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// Default TCP connector.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> TcpConnector {
        TcpConnector { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// A restorable reference: replays its capturing call after a reconnect.
#[async_trait]
pub(crate) trait Restore: Send + Sync {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()>;
}

/// One-shot client-exported callback invoked by the server.
type Callback = Box<dyn FnOnce() + Send>;

pub(crate) struct SessionInner {
    pub config: ClientConfig,
    connector: Box<dyn Connector>,
    conn: Mutex<Option<Arc<Conn>>>,
    epoch: AtomicU64,
    status_tx: watch::Sender<SessionStatus>,
    status_rx: watch::Receiver<SessionStatus>,
    user_closed: AtomicBool,
    pool: Mutex<Vec<Pipe>>,
    pub(crate) restorables: Mutex<Vec<Weak<dyn Restore>>>,
    callbacks: Mutex<HashMap<u64, Callback>>,
    next_callback: AtomicU64,
    relays: Mutex<HashMap<u64, oneshot::Sender<Pipe>>>,
    next_relay: AtomicU64,
    /// Canonical index stubs by name, id, and singleton key so repeated
    /// lookups return reference-equal proxies.
    pub(crate) canonical: Canonical,
}

/// Weak canonical-instance maps. Values are type-erased; each lookup site
/// downcasts to its own proxy inner type.
#[derive(Default)]
pub(crate) struct Canonical {
    pub by_name: Mutex<HashMap<Vec<u8>, Weak<dyn std::any::Any + Send + Sync>>>,
    pub by_id: Mutex<HashMap<u64, Weak<dyn std::any::Any + Send + Sync>>>,
    pub singletons: Mutex<HashMap<String, Weak<dyn std::any::Any + Send + Sync>>>,
}

impl SessionInner {
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Wire counters of the live connection.
    pub fn wire_stats(&self) -> Option<Arc<WireStats>> {
        self.conn.lock().as_ref().map(|c| c.stats())
    }

    /// Hand out a request pipe on the live connection.
    ///
    /// Never waits for a reconnect in flight: operations racing a dropped
    /// transport fail fast with a transient error and are retried by the
    /// caller once the session reports connected again. Restorable replay
    /// depends on this, since it acquires pipes before the session flips
    /// back to connected.
    pub async fn pipe(&self) -> Result<Pipe> {
        if self.status() == SessionStatus::Closed {
            return Err(RemoteError::disconnected());
        }

        let epoch = self.epoch();
        if let Some(pipe) = self.pool.lock().pop() {
            if pipe.epoch() == epoch {
                return Ok(pipe);
            }
            // Stale pipe from a previous connection.
            tokio::spawn(pipe.close());
        }
        let conn = self
            .conn
            .lock()
            .clone()
            .ok_or_else(RemoteError::disconnected)?;
        let mut pipe = conn.open_pipe().await?;
        pipe.set_epoch(epoch);
        pipe.send_raw(Bytes::from_static(&[CHANNEL_REQUEST])).await?;
        Ok(pipe)
    }

    /// Return a request pipe to the pool, or close it when unfit for reuse.
    pub fn recycle(&self, pipe: Pipe) {
        if pipe.epoch() == self.epoch() && pipe.is_clean() {
            let mut pool = self.pool.lock();
            if pool.len() < self.config.pipe_pool_limit {
                pool.push(pipe);
                return;
            }
        }
        tokio::spawn(pipe.close());
    }

    /// Register a one-shot callback; the returned id travels to the server.
    pub fn register_callback(&self, callback: Callback) -> u64 {
        let id = self.next_callback.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, callback);
        id
    }

    pub fn callback_registered(&self, id: u64) -> bool {
        self.callbacks.lock().contains_key(&id)
    }

    /// Register a pending relay; the token correlates the server-opened pipe.
    pub fn register_relay(&self) -> (u64, oneshot::Receiver<Pipe>) {
        let token = self.next_relay.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.relays.lock().insert(token, tx);
        (token, rx)
    }

    pub fn unregister_relay(&self, token: u64) {
        self.relays.lock().remove(&token);
    }

    /// Track a restorable reference through a weak relation.
    pub fn track_restorable(&self, restorable: Weak<dyn Restore>) {
        let mut list = self.restorables.lock();
        list.retain(|w| w.strong_count() > 0);
        list.push(restorable);
    }

    /// Fire-and-forget batched dispose of a remote handle.
    pub fn spawn_dispose(self: &Arc<Self>, id: u64, epoch: u64) {
        if self.epoch() != epoch || self.status() == SessionStatus::Closed {
            return;
        }
        let session = self.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Ok(mut pipe) = session.pipe().await {
                let mut msg = bytes::BytesMut::with_capacity(9);
                use bytes::BufMut;
                msg.put_u64_le(id);
                msg.put_u8(0);
                if pipe.send_message(&msg).await.is_ok() {
                    session.recycle(pipe);
                }
            }
        });
    }

    /// Tear the session down for good.
    pub fn shutdown(&self) {
        self.user_closed.store(true, Ordering::Release);
        let _ = self.status_tx.send(SessionStatus::Closed);
        if let Some(conn) = self.conn.lock().take() {
            conn.shutdown();
        }
        self.pool.lock().clear();
    }
}

/// Establish the transport and exchange connect headers.
async fn establish(
    connector: &dyn Connector,
    config: &ClientConfig,
) -> Result<(Arc<Conn>, mpsc::Receiver<Pipe>)> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = connector.connect().await?;
    let header = ConnectHeader::new(&config.tokens);
    stream.write_all(&header.encode()).await?;
    stream.flush().await?;
    let mut echo = [0u8; HEADER_LEN];
    stream.read_exact(&mut echo).await?;
    ConnectHeader::check_echo(&ConnectHeader::decode(&echo))?;
    let (conn, incoming) = Conn::start(stream, true);
    Ok((Arc::new(conn), incoming))
}

/// Route pipes the server opened toward us: relays and callbacks.
async fn run_acceptor(session: Arc<SessionInner>, mut incoming: mpsc::Receiver<Pipe>) {
    while let Some(mut pipe) = incoming.recv().await {
        let session = session.clone();
        tokio::spawn(async move {
            match pipe.read_u8().await {
                Ok(CHANNEL_RELAY) => {
                    let Ok(token) = pipe.read_u64_le().await else {
                        pipe.close().await;
                        return;
                    };
                    let waiter = session.relays.lock().remove(&token);
                    match waiter {
                        Some(tx) => {
                            if let Err(pipe) = tx.send(pipe) {
                                pipe.close().await;
                            }
                        }
                        None => {
                            debug!(token, "relay pipe with no waiter");
                            pipe.close().await;
                        }
                    }
                }
                Ok(CHANNEL_CALLBACK) => {
                    let Ok(id) = pipe.read_u64_le().await else {
                        pipe.close().await;
                        return;
                    };
                    pipe.close().await;
                    let callback = session.callbacks.lock().remove(&id);
                    match callback {
                        Some(callback) => callback(),
                        None => debug!(id, "callback invoked twice or unknown"),
                    }
                }
                Ok(other) => {
                    debug!(channel = other, "unexpected channel kind from server");
                    pipe.close().await;
                }
                Err(_) => {}
            }
        });
    }
}

/// Watch the connection; on loss, re-establish and replay restorables.
async fn run_monitor(session: Arc<SessionInner>) {
    loop {
        let Some(conn) = session.conn.lock().clone() else {
            return;
        };
        let mut closed = conn.closed_watch();
        drop(conn);
        if closed.wait_for(|c| *c).await.is_err() {
            // Watch sender gone with the connection.
        }
        if session.user_closed.load(Ordering::Acquire) {
            return;
        }
        if !session.config.reconnect {
            let _ = session.status_tx.send(SessionStatus::Closed);
            return;
        }

        warn!("session transport dropped, reconnecting");
        let _ = session.status_tx.send(SessionStatus::Reconnecting);
        session.pool.lock().clear();

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            tokio::time::sleep(session.config.reconnect_delay()).await;
            if session.user_closed.load(Ordering::Acquire) {
                return;
            }
            match establish(session.connector.as_ref(), &session.config).await {
                Ok((conn, incoming)) => {
                    *session.conn.lock() = Some(conn);
                    session.epoch.fetch_add(1, Ordering::AcqRel);
                    tokio::spawn(run_acceptor(session.clone(), incoming));
                    replay_restorables(&session).await;
                    let _ = session.status_tx.send(SessionStatus::Connected);
                    info!(attempts, "session reconnected");
                    break;
                }
                Err(e) if attempts < session.config.max_reconnect_attempts => {
                    debug!(error = %e, attempts, "reconnect attempt failed");
                }
                Err(e) => {
                    warn!(error = %e, "reconnect abandoned");
                    let _ = session.status_tx.send(SessionStatus::Closed);
                    return;
                }
            }
        }
    }
}

/// Replay every live restorable's capturing call against the new connection.
async fn replay_restorables(session: &Arc<SessionInner>) {
    let targets: Vec<Arc<dyn Restore>> = {
        let mut list = session.restorables.lock();
        list.retain(|w| w.strong_count() > 0);
        list.iter().filter_map(|w| w.upgrade()).collect()
    };
    for target in targets {
        if let Err(e) = target.restore(session).await {
            // Non-transient failures mark the proxy broken inside restore;
            // anything surfacing here is logged and the proxy stays stale.
            debug!(error = %e, "restorable replay failed");
        }
    }
}

/// Open a session and return its shared inner state.
pub(crate) async fn open_session(
    config: ClientConfig,
    connector: Box<dyn Connector>,
) -> Result<Arc<SessionInner>> {
    let (status_tx, status_rx) = watch::channel(SessionStatus::Connected);
    let (conn, incoming) = establish(connector.as_ref(), &config).await?;
    let session = Arc::new(SessionInner {
        config,
        connector,
        conn: Mutex::new(Some(conn)),
        epoch: AtomicU64::new(1),
        status_tx,
        status_rx,
        user_closed: AtomicBool::new(false),
        pool: Mutex::new(Vec::new()),
        restorables: Mutex::new(Vec::new()),
        callbacks: Mutex::new(HashMap::new()),
        next_callback: AtomicU64::new(1),
        relays: Mutex::new(HashMap::new()),
        next_relay: AtomicU64::new(1),
        canonical: Canonical::default(),
    });
    tokio::spawn(run_acceptor(session.clone(), incoming));
    tokio::spawn(run_monitor(session.clone()));
    Ok(session)
}
