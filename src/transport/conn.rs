// One physical connection carrying many logical pipes.
//
// A reader task routes inbound frames to per-pipe channels; a writer task
// drains an outbound channel onto the socket. Pipe ids are allocated with
// side parity so both peers can open pipes without coordination: the
// initiator uses odd ids, the acceptor even ids.

use super::frame::{FrameHeader, FrameKind, FRAME_HEADER_LEN};
use super::pipe::Pipe;
use crate::error::{RemoteError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Any bidirectional byte stream usable as the session transport.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

/// Inbound buffer depth per pipe, in frames. Bulk streams ack at chunk
/// boundaries, which bounds how far a sender can run ahead of a reader.
const PIPE_BUFFER_FRAMES: usize = 64;

const OUTBOUND_BUFFER_FRAMES: usize = 256;

pub(crate) enum Outbound {
    Frame { pipe: u32, kind: FrameKind, payload: Bytes },
    /// Ends the writer task, closing the underlying stream.
    Goodbye,
}

/// Wire-level counters for one connection.
#[derive(Debug, Default)]
pub struct WireStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub pipes_opened: AtomicU64,
    pub pipes_closed: AtomicU64,
}

pub(crate) struct ConnShared {
    pub(crate) out_tx: mpsc::Sender<Outbound>,
    routes: DashMap<u32, mpsc::Sender<Bytes>>,
    next_pipe: AtomicU32,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    pub(crate) stats: Arc<WireStats>,
}

impl ConnShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.routes.clear();
            let _ = self.closed_tx.send(true);
            let _ = self.out_tx.try_send(Outbound::Goodbye);
        }
    }

    pub(crate) fn drop_route(&self, pipe: u32) {
        self.routes.remove(&pipe);
    }

    pub(crate) async fn send_frame(
        &self,
        pipe: u32,
        kind: FrameKind,
        payload: Bytes,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(RemoteError::disconnected());
        }
        self.out_tx
            .send(Outbound::Frame { pipe, kind, payload })
            .await
            .map_err(|_| RemoteError::disconnected())
    }
}

/// Handle to a running multiplexed connection.
pub struct Conn {
    shared: Arc<ConnShared>,
    closed_rx: watch::Receiver<bool>,
}

impl Conn {
    /// Start the reader and writer tasks over `stream`.
    ///
    /// Returns the connection handle and the stream of pipes opened by the
    /// peer.
    pub fn start(stream: BoxedStream, initiator: bool) -> (Conn, mpsc::Receiver<Pipe>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER_FRAMES);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (closed_tx, closed_rx) = watch::channel(false);

        let shared = Arc::new(ConnShared {
            out_tx,
            routes: DashMap::new(),
            next_pipe: AtomicU32::new(if initiator { 1 } else { 2 }),
            closed: AtomicBool::new(false),
            closed_tx,
            stats: Arc::new(WireStats::default()),
        });

        tokio::spawn(run_writer(write_half, out_rx, shared.clone()));
        tokio::spawn(run_reader(read_half, incoming_tx, shared.clone()));

        (
            Conn {
                shared,
                closed_rx,
            },
            incoming_rx,
        )
    }

    /// Open a new pipe toward the peer.
    pub async fn open_pipe(&self) -> Result<Pipe> {
        if self.shared.is_closed() {
            return Err(RemoteError::disconnected());
        }
        let id = self.shared.next_pipe.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(PIPE_BUFFER_FRAMES);
        self.shared.routes.insert(id, tx);
        self.shared.stats.pipes_opened.fetch_add(1, Ordering::Relaxed);
        self.shared
            .send_frame(id, FrameKind::Open, Bytes::new())
            .await?;
        Ok(Pipe::new(id, self.shared.clone(), rx))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// A watch that flips to `true` when the connection dies.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    pub fn stats(&self) -> Arc<WireStats> {
        self.shared.stats.clone()
    }

    /// Tear the connection down, cancelling all pipes.
    pub fn shutdown(&self) {
        self.shared.mark_closed();
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        self.shared.mark_closed();
    }
}

async fn run_writer(
    mut write_half: tokio::io::WriteHalf<BoxedStream>,
    mut out_rx: mpsc::Receiver<Outbound>,
    shared: Arc<ConnShared>,
) {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Goodbye => break,
            Outbound::Frame { pipe, kind, payload } => {
                let header = FrameHeader {
                    pipe,
                    kind,
                    len: payload.len() as u32,
                };
                if write_half.write_all(&header.encode()).await.is_err() {
                    break;
                }
                if !payload.is_empty() && write_half.write_all(&payload).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
                shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .bytes_sent
                    .fetch_add((FRAME_HEADER_LEN + payload.len()) as u64, Ordering::Relaxed);
            }
        }
    }
    let _ = write_half.shutdown().await;
    shared.mark_closed();
}

async fn run_reader(
    mut read_half: tokio::io::ReadHalf<BoxedStream>,
    incoming_tx: mpsc::Sender<Pipe>,
    shared: Arc<ConnShared>,
) {
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    loop {
        if read_half.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let header = match FrameHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!(error = %e, "dropping connection on malformed frame");
                break;
            }
        };
        let mut payload = vec![0u8; header.len as usize];
        if header.len > 0 && read_half.read_exact(&mut payload).await.is_err() {
            break;
        }
        shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        shared.stats.bytes_received.fetch_add(
            (FRAME_HEADER_LEN + payload.len()) as u64,
            Ordering::Relaxed,
        );

        match header.kind {
            FrameKind::Open => {
                let (tx, rx) = mpsc::channel(PIPE_BUFFER_FRAMES);
                shared.routes.insert(header.pipe, tx);
                shared.stats.pipes_opened.fetch_add(1, Ordering::Relaxed);
                let pipe = Pipe::new(header.pipe, shared.clone(), rx);
                if incoming_tx.send(pipe).await.is_err() {
                    break;
                }
            }
            FrameKind::Data => {
                let sender = shared.routes.get(&header.pipe).map(|r| r.value().clone());
                if let Some(sender) = sender {
                    // A dropped receiver means the pipe owner went away;
                    // the payload is discarded.
                    let _ = sender.send(Bytes::from(payload)).await;
                }
            }
            FrameKind::Close => {
                shared.routes.remove(&header.pipe);
                shared.stats.pipes_closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    shared.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Conn, mpsc::Receiver<Pipe>, Conn, mpsc::Receiver<Pipe>) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (client, client_in) = Conn::start(Box::new(a), true);
        let (server, server_in) = Conn::start(Box::new(b), false);
        (client, client_in, server, server_in)
    }

    #[tokio::test]
    async fn test_open_pipe_and_exchange() {
        let (client, _client_in, _server, mut server_in) = pair();
        let mut pipe = client.open_pipe().await.unwrap();
        assert_eq!(pipe.id() % 2, 1);
        pipe.send_message(b"ping").await.unwrap();

        let mut accepted = server_in.recv().await.unwrap();
        assert_eq!(accepted.id(), pipe.id());
        let msg = accepted.read_message().await.unwrap();
        assert_eq!(&msg[..], b"ping");

        accepted.send_message(b"pong").await.unwrap();
        let reply = pipe.read_message().await.unwrap();
        assert_eq!(&reply[..], b"pong");
    }

    #[tokio::test]
    async fn test_peer_can_open_pipes_too() {
        let (_client, mut client_in, server, _server_in) = pair();
        let mut pipe = server.open_pipe().await.unwrap();
        assert_eq!(pipe.id() % 2, 0);
        pipe.send_message(b"event").await.unwrap();
        let mut accepted = client_in.recv().await.unwrap();
        assert_eq!(&accepted.read_message().await.unwrap()[..], b"event");
    }

    #[tokio::test]
    async fn test_shutdown_fails_pipes() {
        let (client, _client_in, server, mut server_in) = pair();
        let mut pipe = client.open_pipe().await.unwrap();
        pipe.send_message(b"x").await.unwrap();
        let _accepted = server_in.recv().await.unwrap();
        server.shutdown();
        client.closed_watch().wait_for(|closed| *closed).await.unwrap();
        assert!(client.is_closed());
        assert!(pipe.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_close_frame_ends_reads() {
        let (client, _client_in, _server, mut server_in) = pair();
        let mut pipe = client.open_pipe().await.unwrap();
        pipe.send_message(b"x").await.unwrap();
        let mut accepted = server_in.recv().await.unwrap();
        let _ = accepted.read_message().await.unwrap();
        pipe.close().await;
        assert!(accepted.read_message_opt().await.unwrap().is_none());
    }
}
