// Remote sorter proxy: point adds, bulk streaming ingest, and sorted drain.

use super::session::SessionInner;
use super::stub::Stub;
use super::view::{Index, IndexCapture};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_bytes, get_u64};
use crate::protocol::{SorterOp, RELAY_ACK, ROW_STREAM_END, STATUS_OK};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// A remote bulk-ingest sorter.
pub struct Sorter {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) stub: Stub,
}

impl Sorter {
    pub(crate) fn new(session: Arc<SessionInner>, handle: u64, epoch: u64) -> Sorter {
        Sorter {
            stub: Stub::new(session.clone(), handle, epoch),
            session,
        }
    }

    pub async fn add(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.stub
            .invoke(SorterOp::Add as u8, |msg| {
                msg.put_u32_le(key.len() as u32);
                msg.put_slice(key);
                msg.put_u32_le(value.len() as u32);
                msg.put_slice(value);
            })
            .await?;
        Ok(())
    }

    /// Stream a batch of entries on the pipe: the count travels in the
    /// request, the pairs follow raw, and a single reply carries the first
    /// ingest failure if any.
    pub async fn add_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let count = entries.len() as u32;
        let mut pipe = self
            .stub
            .invoke_deferred(SorterOp::AddBatch as u8, |msg| {
                msg.put_u32_le(count);
            })
            .await?;
        let mut buf = BytesMut::new();
        for (key, value) in entries {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(&key);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(&value);
            if buf.len() >= 64 * 1024 {
                pipe.send_raw(buf.split().freeze()).await?;
            }
        }
        if !buf.is_empty() {
            pipe.send_raw(buf.freeze()).await?;
        }
        match pipe.read_message().await {
            Ok(reply) => {
                let outcome = Stub::parse_reply(reply).map(|_| ());
                if outcome.is_ok() && pipe.is_clean() {
                    self.session.recycle(pipe);
                } else {
                    pipe.close().await;
                }
                outcome
            }
            Err(e) => {
                pipe.close().await;
                Err(e)
            }
        }
    }

    /// Drive an iterator of entries over the pipe until exhausted.
    pub async fn add_all(
        &self,
        entries: impl Iterator<Item = (Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let mut pipe = self
            .stub
            .invoke_deferred(SorterOp::AddAll as u8, |_| {})
            .await?;
        let mut buf = BytesMut::new();
        for (key, value) in entries {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(&key);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(&value);
            if buf.len() >= 64 * 1024 {
                pipe.send_raw(buf.split().freeze()).await?;
            }
        }
        buf.put_u32_le(ROW_STREAM_END);
        pipe.send_raw(buf.freeze()).await?;
        match pipe.read_message().await {
            Ok(reply) => {
                let outcome = Stub::parse_reply(reply).map(|_| ());
                if outcome.is_ok() && pipe.is_clean() {
                    self.session.recycle(pipe);
                } else {
                    pipe.close().await;
                }
                outcome
            }
            Err(e) => {
                pipe.close().await;
                Err(e)
            }
        }
    }

    /// Materialize the sorted entries as a temporary index. The index is
    /// deleted when the session detaches.
    pub async fn finish(&self) -> Result<Index> {
        let mut reply = self.stub.invoke(SorterOp::Finish as u8, |_| {}).await?;
        let handle = get_u64(&mut reply)?;
        let id = get_u64(&mut reply)?;
        let name = get_bytes(&mut reply)?;
        Ok(Index::new(
            self.session.clone(),
            handle,
            self.session.epoch(),
            id,
            name,
            IndexCapture::Unrestorable,
        ))
    }

    /// Drain the sorted entries back to the caller.
    pub async fn finish_scan(&self, reverse: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (mut pipe, _reply) = self
            .stub
            .invoke_stream(SorterOp::FinishScan as u8, |msg| {
                msg.put_u8(reverse as u8);
            })
            .await?;
        let mut out = Vec::new();
        loop {
            let len = pipe.read_u32_le().await?;
            if len == ROW_STREAM_END {
                let status = pipe.read_u8().await?;
                if status == STATUS_OK && pipe.is_clean() {
                    self.session.recycle(pipe);
                } else {
                    pipe.close().await;
                }
                return Ok(out);
            }
            let mut batch = pipe.read_exact(len as usize).await?;
            while !batch.is_empty() {
                let key = read_pair(&mut batch)?;
                let value = read_pair(&mut batch)?;
                out.push((key, value));
            }
            pipe.send_raw(Bytes::from_static(&[RELAY_ACK])).await?;
        }
    }

    /// `(entries added, total expected if known)`.
    pub async fn progress(&self) -> Result<(u64, Option<u64>)> {
        let mut reply = self.stub.invoke(SorterOp::Progress as u8, |_| {}).await?;
        let added = get_u64(&mut reply)?;
        let total = if get_bool(&mut reply)? {
            Some(get_u64(&mut reply)?)
        } else {
            None
        };
        Ok((added, total))
    }

    pub async fn reset(&self) -> Result<()> {
        self.stub.invoke(SorterOp::Reset as u8, |_| {}).await?;
        Ok(())
    }
}

fn read_pair(batch: &mut Bytes) -> Result<Vec<u8>> {
    use bytes::Buf;
    if batch.remaining() < 4 {
        return Err(RemoteError::io("truncated sorter batch"));
    }
    let len = batch.get_u32_le() as usize;
    if batch.remaining() < len {
        return Err(RemoteError::io("truncated sorter batch"));
    }
    let mut out = vec![0u8; len];
    batch.copy_to_slice(&mut out);
    Ok(out)
}

impl Drop for Sorter {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}
