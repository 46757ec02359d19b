//! Server side of the remote layer: accept loop, handshake verification,
//! per-session handle registry, and the skeleton dispatcher.

mod dispatch;
pub(crate) mod proxy;
pub(crate) mod query;
pub(crate) mod registry;
mod relay;

use crate::config::ServerConfig;
use crate::engine::Database;
use crate::error::Result;
use crate::protocol::handshake::{ConnectHeader, HEADER_LEN};
use crate::protocol::CHANNEL_REQUEST;
use crate::transport::Conn;
use parking_lot::Mutex;
use registry::{Registry, Remote};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// State shared by every pipe worker of one client session.
pub(crate) struct ServerSession {
    pub engine: Arc<dyn Database>,
    pub registry: Registry,
    pub conn: Arc<Conn>,
    bogus: Mutex<Option<u64>>,
}

impl ServerSession {
    fn new(engine: Arc<dyn Database>, conn: Arc<Conn>) -> Arc<ServerSession> {
        let session = Arc::new(ServerSession {
            engine,
            registry: Registry::new(),
            conn,
            bogus: Mutex::new(None),
        });
        // The root database handle always occupies identity 1.
        session
            .registry
            .export(Remote::Db(session.engine.clone()));
        session
    }

    /// The session-shared bogus transaction handle, exported on first use.
    pub(crate) fn bogus_handle(&self, db: &Arc<dyn Database>) -> u64 {
        let mut slot = self.bogus.lock();
        match *slot {
            Some(id) => id,
            None => {
                let skeleton = self.registry.export(Remote::Txn(db.bogus()));
                *slot = Some(skeleton.id);
                skeleton.id
            }
        }
    }
}

/// A running remote-access server.
pub struct Server {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start accepting sessions for `engine`.
    pub async fn bind(engine: Arc<dyn Database>, config: ServerConfig) -> Result<Server> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(addr = %local_addr, "remote server listening");
        let accept_task = tokio::spawn(accept_loop(listener, engine, config, shutdown_rx));
        Ok(Server {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting sessions and cancel the accept loop. Established
    /// sessions end when their connections drop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    engine: Arc<dyn Database>,
    config: ServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let active = Arc::new(AtomicUsize::new(0));
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown_rx.changed() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if active.load(Ordering::Relaxed) >= config.max_connections {
            warn!(%peer, "connection limit reached, dropping session");
            continue;
        }
        active.fetch_add(1, Ordering::Relaxed);
        let engine = engine.clone();
        let tokens = config.tokens.clone();
        let active = active.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_session(stream, peer, engine, tokens).await {
                debug!(%peer, error = %e, "session ended with error");
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn serve_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<dyn Database>,
    tokens: Vec<u64>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    let header = ConnectHeader::decode(&raw);
    if !header.accepts(&tokens) {
        warn!(%peer, "handshake rejected");
        stream.write_all(&header.rejection().encode()).await?;
        stream.shutdown().await?;
        return Ok(());
    }
    stream.write_all(&header.encode()).await?;
    stream.flush().await?;
    info!(%peer, "session established");

    let (conn, mut incoming) = Conn::start(Box::new(stream), false);
    let conn = Arc::new(conn);
    let session = ServerSession::new(engine, conn.clone());
    let mut closed = conn.closed_watch();

    loop {
        let pipe = tokio::select! {
            pipe = incoming.recv() => pipe,
            _ = closed.wait_for(|c| *c) => None,
        };
        let Some(mut pipe) = pipe else { break };
        let session = session.clone();
        tokio::spawn(async move {
            // The opener identifies the channel use with one byte.
            match pipe.read_u8().await {
                Ok(CHANNEL_REQUEST) => dispatch::dispatch_pipe(session, pipe).await,
                Ok(other) => {
                    debug!(channel = other, "unexpected channel kind from client");
                    pipe.close().await;
                }
                Err(_) => {}
            }
        });
    }

    // Session-aware detach: reset transactions and cursors, delete
    // temporary indexes, drop the rest.
    let live = session.registry.live_handles();
    session.registry.detach_all(&session.engine);
    info!(%peer, handles = live, "session detached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mem::MemDatabase;

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let engine: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let server = Server::bind(engine, ServerConfig::default()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let engine: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let config = ServerConfig::default().with_tokens(&[42]);
        let server = Server::bind(engine, config).await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let header = ConnectHeader::new(&[7]);
        stream.write_all(&header.encode()).await.unwrap();
        let mut echo = [0u8; HEADER_LEN];
        stream.read_exact(&mut echo).await.unwrap();
        let echo = ConnectHeader::decode(&echo);
        assert_eq!(echo.group_id, 0);
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_accepts_matching_token() {
        let engine: Arc<dyn Database> = Arc::new(MemDatabase::new());
        let config = ServerConfig::default().with_tokens(&[42, 43]);
        let server = Server::bind(engine, config).await.unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let header = ConnectHeader::new(&[99, 43]);
        stream.write_all(&header.encode()).await.unwrap();
        let mut echo = [0u8; HEADER_LEN];
        stream.read_exact(&mut echo).await.unwrap();
        let echo = ConnectHeader::decode(&echo);
        assert!(ConnectHeader::check_echo(&echo).is_ok());
        server.shutdown().await;
    }
}
