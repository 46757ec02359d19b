// Client-side stub core.
//
// A stub holds a remote identity tagged with the session epoch it was
// exported under, plus the pipe pinned by an outstanding batched call.
// Batched requests keep their pipe attached to the stub so the next call on
// the same handle flushes through the same server worker, which preserves
// per-handle ordering.

use super::session::SessionInner;
use crate::error::{RemoteError, Result};
use crate::protocol::codec::decode_error;
use crate::protocol::wire::get_u8;
use crate::protocol::{STATUS_ERR, STATUS_OK};
use crate::transport::Pipe;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemoteRef {
    pub id: u64,
    pub epoch: u64,
}

pub(crate) struct StubState {
    pub remote: Option<RemoteRef>,
    pending: Option<Pipe>,
    broken: Option<String>,
}

pub(crate) struct Stub {
    session: Arc<SessionInner>,
    state: Mutex<StubState>,
}

impl Stub {
    pub fn new(session: Arc<SessionInner>, id: u64, epoch: u64) -> Stub {
        Stub {
            session,
            state: Mutex::new(StubState {
                remote: Some(RemoteRef { id, epoch }),
                pending: None,
                broken: None,
            }),
        }
    }

    /// The remote reference if it is live under the current epoch.
    pub async fn current(&self) -> Option<RemoteRef> {
        let state = self.state.lock().await;
        state
            .remote
            .filter(|r| r.epoch == self.session.epoch())
    }

    /// Install a freshly established remote identity, discarding the stale
    /// one. Used by restorable replay and by resurrection.
    pub async fn install(&self, id: u64, epoch: u64) {
        let mut state = self.state.lock().await;
        state.remote = Some(RemoteRef { id, epoch });
        state.pending = None;
        state.broken = None;
    }

    /// Compare-and-swap for restorable replay: only replaces the given
    /// stale reference so a concurrent installer wins.
    pub async fn install_over(&self, stale: Option<RemoteRef>, id: u64, epoch: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.remote != stale && state.remote.map(|r| r.epoch) == Some(epoch) {
            return false;
        }
        state.remote = Some(RemoteRef { id, epoch });
        state.pending = None;
        state.broken = None;
        true
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.remote = None;
        if let Some(pipe) = state.pending.take() {
            self.session.recycle(pipe);
        }
    }

    pub async fn mark_broken(&self, cause: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.broken = Some(cause.into());
        state.remote = None;
        state.pending = None;
    }

    pub async fn snapshot(&self) -> (Option<RemoteRef>, Option<String>) {
        let state = self.state.lock().await;
        (state.remote, state.broken.clone())
    }

    fn check_broken(state: &StubState) -> Result<()> {
        match &state.broken {
            Some(cause) => Err(RemoteError::illegal_state(format!(
                "unable to restore: {}",
                cause
            ))),
            None => Ok(()),
        }
    }

    fn live_ref(&self, state: &StubState) -> Result<RemoteRef> {
        Self::check_broken(state)?;
        let remote = state
            .remote
            .ok_or_else(|| RemoteError::illegal_state("handle is disposed"))?;
        if remote.epoch != self.session.epoch() {
            return Err(RemoteError::disconnected());
        }
        Ok(remote)
    }

    async fn acquire_pipe(&self, state: &mut StubState) -> Result<Pipe> {
        if let Some(pipe) = state.pending.take() {
            if pipe.epoch() == self.session.epoch() {
                return Ok(pipe);
            }
            tokio::spawn(pipe.close());
        }
        self.session.pipe().await
    }

    fn build(remote: RemoteRef, op: u8, args: impl FnOnce(&mut BytesMut)) -> BytesMut {
        let mut msg = BytesMut::with_capacity(32);
        msg.put_u64_le(remote.id);
        msg.put_u8(op);
        args(&mut msg);
        msg
    }

    pub(crate) fn parse_reply(mut reply: Bytes) -> Result<Bytes> {
        match get_u8(&mut reply)? {
            STATUS_OK => Ok(reply),
            STATUS_ERR => Err(decode_error(&mut reply)?),
            other => Err(RemoteError::io(format!("unknown reply status {}", other))),
        }
    }

    /// Invoke a non-batched operation and return the reply payload.
    pub async fn invoke(&self, op: u8, args: impl FnOnce(&mut BytesMut)) -> Result<Bytes> {
        let mut state = self.state.lock().await;
        let remote = self.live_ref(&state)?;
        let mut pipe = self.acquire_pipe(&mut state).await?;
        let msg = Self::build(remote, op, args);
        if let Err(e) = pipe.send_message(&msg).await {
            tokio::spawn(pipe.close());
            return Err(e);
        }
        match pipe.read_message().await {
            Ok(reply) => {
                self.session.recycle(pipe);
                Self::parse_reply(reply)
            }
            Err(e) => {
                tokio::spawn(pipe.close());
                Err(e)
            }
        }
    }

    /// Invoke a batched operation: no reply is read and the pipe stays
    /// pinned to this stub until the next non-batched call flushes it.
    pub async fn invoke_batched(&self, op: u8, args: impl FnOnce(&mut BytesMut)) -> Result<()> {
        let mut state = self.state.lock().await;
        let remote = self.live_ref(&state)?;
        let mut pipe = self.acquire_pipe(&mut state).await?;
        let msg = Self::build(remote, op, args);
        if let Err(e) = pipe.send_message(&msg).await {
            tokio::spawn(pipe.close());
            return Err(e);
        }
        state.pending = Some(pipe);
        Ok(())
    }

    /// Invoke a no-reply operation: flushed, never answered.
    pub async fn invoke_no_reply(&self, op: u8, args: impl FnOnce(&mut BytesMut)) -> Result<()> {
        let mut state = self.state.lock().await;
        let remote = self.live_ref(&state)?;
        let mut pipe = self.acquire_pipe(&mut state).await?;
        let msg = Self::build(remote, op, args);
        if let Err(e) = pipe.send_message(&msg).await {
            tokio::spawn(pipe.close());
            return Err(e);
        }
        self.session.recycle(pipe);
        Ok(())
    }

    /// Invoke an operation whose reply is followed by a bulk stream. The
    /// caller takes the pipe and must recycle or close it per the stream's
    /// contract.
    pub async fn invoke_stream(
        &self,
        op: u8,
        args: impl FnOnce(&mut BytesMut),
    ) -> Result<(Pipe, Bytes)> {
        let mut state = self.state.lock().await;
        let remote = self.live_ref(&state)?;
        let mut pipe = self.acquire_pipe(&mut state).await?;
        let msg = Self::build(remote, op, args);
        if let Err(e) = pipe.send_message(&msg).await {
            tokio::spawn(pipe.close());
            return Err(e);
        }
        drop(state);
        match pipe.read_message().await {
            Ok(reply) => match Self::parse_reply(reply) {
                Ok(payload) => Ok((pipe, payload)),
                Err(e) => {
                    self.session.recycle(pipe);
                    Err(e)
                }
            },
            Err(e) => {
                tokio::spawn(pipe.close());
                Err(e)
            }
        }
    }

    /// Send a request whose arguments continue as raw streamed bytes. The
    /// caller writes the stream on the returned pipe, reads the reply
    /// message itself, and recycles or closes the pipe.
    pub async fn invoke_deferred(
        &self,
        op: u8,
        args: impl FnOnce(&mut BytesMut),
    ) -> Result<Pipe> {
        let mut state = self.state.lock().await;
        let remote = self.live_ref(&state)?;
        let mut pipe = self.acquire_pipe(&mut state).await?;
        let msg = Self::build(remote, op, args);
        if let Err(e) = pipe.send_message(&msg).await {
            tokio::spawn(pipe.close());
            return Err(e);
        }
        Ok(pipe)
    }

    /// Send the batched dispose for this stub's remote, if still live.
    pub fn dispose_from_drop(&self, session: &Arc<SessionInner>) {
        if let Ok(state) = self.state.try_lock() {
            if let Some(remote) = state.remote {
                session.spawn_dispose(remote.id, remote.epoch);
            }
        }
    }
}
