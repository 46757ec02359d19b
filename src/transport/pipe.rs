// A logical bidirectional byte stream multiplexed on one connection.
//
// Writes become data frames; reads drain per-pipe buffered frames, crossing
// chunk boundaries transparently. Request/reply traffic uses the
// length-prefixed message helpers; bulk streams read and write raw bytes.

use super::conn::ConnShared;
use super::frame::FrameKind;
use crate::error::{RemoteError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Pipe {
    id: u32,
    shared: Arc<ConnShared>,
    rx: mpsc::Receiver<Bytes>,
    rbuf: Bytes,
    open: bool,
    epoch: u64,
}

impl Pipe {
    pub(crate) fn new(id: u32, shared: Arc<ConnShared>, rx: mpsc::Receiver<Bytes>) -> Pipe {
        Pipe {
            id,
            shared,
            rx,
            rbuf: Bytes::new(),
            open: true,
            epoch: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Session epoch the pipe was acquired under; stale pipes are discarded
    /// instead of recycled.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Whether all received bytes were consumed, making the pipe safe to
    /// recycle.
    pub fn is_clean(&self) -> bool {
        self.rbuf.is_empty()
    }

    /// Send one length-prefixed message as a single frame.
    pub async fn send_message(&mut self, msg: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4 + msg.len());
        buf.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        buf.extend_from_slice(msg);
        self.shared
            .send_frame(self.id, FrameKind::Data, buf.freeze())
            .await
    }

    /// Send raw bytes without message framing (bulk stream chunks).
    pub async fn send_raw(&mut self, bytes: Bytes) -> Result<()> {
        self.shared
            .send_frame(self.id, FrameKind::Data, bytes)
            .await
    }

    async fn fill(&mut self) -> Result<()> {
        while self.rbuf.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.rbuf = chunk,
                None => return Err(RemoteError::disconnected()),
            }
        }
        Ok(())
    }

    /// Read exactly `n` bytes, crossing frame boundaries as needed.
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        if self.rbuf.len() >= n {
            return Ok(self.rbuf.split_to(n));
        }
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            self.fill().await?;
            let take = (n - out.len()).min(self.rbuf.len());
            out.extend_from_slice(&self.rbuf.split_to(take));
        }
        Ok(out.freeze())
    }

    pub async fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    pub async fn read_u16_le(&mut self) -> Result<u16> {
        let mut bytes = self.read_exact(2).await?;
        Ok(bytes.get_u16_le())
    }

    pub async fn read_u32_le(&mut self) -> Result<u32> {
        let mut bytes = self.read_exact(4).await?;
        Ok(bytes.get_u32_le())
    }

    pub async fn read_u64_le(&mut self) -> Result<u64> {
        let mut bytes = self.read_exact(8).await?;
        Ok(bytes.get_u64_le())
    }

    /// Read one length-prefixed message; `None` when the peer closed the
    /// pipe at a message boundary.
    pub async fn read_message_opt(&mut self) -> Result<Option<Bytes>> {
        while self.rbuf.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.rbuf = chunk,
                None => return Ok(None),
            }
        }
        let len = self.read_u32_le().await? as usize;
        Ok(Some(self.read_exact(len).await?))
    }

    /// Read one length-prefixed message, failing if the pipe is gone.
    pub async fn read_message(&mut self) -> Result<Bytes> {
        self.read_message_opt()
            .await?
            .ok_or_else(RemoteError::disconnected)
    }

    /// Close the pipe, notifying the peer. A pipe whose peer may be mid
    /// transfer must be closed, never recycled.
    pub async fn close(mut self) {
        if self.open {
            self.open = false;
            self.shared.drop_route(self.id);
            self.shared.stats.pipes_closed.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .shared
                .send_frame(self.id, FrameKind::Close, Bytes::new())
                .await;
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        if self.open {
            self.shared.drop_route(self.id);
            self.shared.stats.pipes_closed.fetch_add(1, Ordering::Relaxed);
            let _ = self.shared.out_tx.try_send(super::conn::Outbound::Frame {
                pipe: self.id,
                kind: FrameKind::Close,
                payload: Bytes::new(),
            });
        }
    }
}
