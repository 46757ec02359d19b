// Chunked value streams over a dedicated pipe.
//
// Each chunk carries a 15-bit length and a 1-bit end flag; the reserved
// header 0xFFFF announces a trailing encoded exception. A fully drained
// input stream is acked with one byte so its pipe can be recycled; a stream
// abandoned mid-transfer always closes its pipe.

use super::session::SessionInner;
use crate::error::{RemoteError, Result};
use crate::protocol::codec::decode_error;
use crate::protocol::{
    CHUNK_END_FLAG, CHUNK_EXCEPTION, CHUNK_LEN_MASK, MAX_CHUNK, STATUS_OK,
};
use crate::transport::Pipe;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Reads a remote value as a byte stream.
pub struct ValueInputStream {
    session: Arc<SessionInner>,
    pipe: Option<Pipe>,
    buffer: Bytes,
    finished: bool,
}

impl ValueInputStream {
    pub(crate) fn new(session: Arc<SessionInner>, pipe: Pipe) -> ValueInputStream {
        ValueInputStream {
            session,
            pipe: Some(pipe),
            buffer: Bytes::new(),
            finished: false,
        }
    }

    /// Read up to `buf.len()` bytes; `Ok(0)` signals the end of the value.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer.is_empty() && !self.fill().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.buffer.len());
        buf[..n].copy_from_slice(&self.buffer[..n]);
        self.buffer = self.buffer.slice(n..);
        Ok(n)
    }

    /// Drain the remaining bytes.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        loop {
            if self.buffer.is_empty() && !self.fill().await? {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&self.buffer);
            self.buffer = Bytes::new();
        }
    }

    async fn fill(&mut self) -> Result<bool> {
        if self.finished {
            return Ok(false);
        }
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(RemoteError::closed_stream)?;
        let header = pipe.read_u16_le().await?;
        if header == CHUNK_EXCEPTION {
            let len = pipe.read_u32_le().await? as usize;
            let encoded = pipe.read_exact(len).await?;
            self.finished = true;
            self.finish_pipe(true).await;
            let mut cursor = encoded;
            return Err(decode_error(&mut cursor)?);
        }
        let len = (header & CHUNK_LEN_MASK) as usize;
        let end = header & CHUNK_END_FLAG != 0;
        if len > 0 {
            self.buffer = pipe.read_exact(len).await?;
        }
        if end {
            self.finished = true;
            self.finish_pipe(false).await;
        }
        Ok(len > 0)
    }

    /// Ack completion so the pipe can be recycled; error paths close it.
    async fn finish_pipe(&mut self, broken: bool) {
        if let Some(mut pipe) = self.pipe.take() {
            if broken {
                pipe.close().await;
            } else if pipe.send_raw(Bytes::from_static(&[1])).await.is_ok() {
                self.session.recycle(pipe);
            } else {
                pipe.close().await;
            }
        }
    }

    /// Abandon the stream; the pipe is closed, never recycled.
    pub async fn close(mut self) {
        if let Some(pipe) = self.pipe.take() {
            pipe.close().await;
        }
    }
}

impl Drop for ValueInputStream {
    fn drop(&mut self) {
        // A pipe still present means the stream was abandoned mid-transfer.
        drop(self.pipe.take());
    }
}

/// Writes a remote value as a byte stream.
pub struct ValueOutputStream {
    session: Arc<SessionInner>,
    pipe: Option<Pipe>,
    buffer: BytesMut,
}

impl ValueOutputStream {
    pub(crate) fn new(session: Arc<SessionInner>, pipe: Pipe) -> ValueOutputStream {
        ValueOutputStream {
            session,
            pipe: Some(pipe),
            buffer: BytesMut::new(),
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(data);
        while self.buffer.len() >= MAX_CHUNK {
            let chunk = self.buffer.split_to(MAX_CHUNK);
            self.send_chunk(&chunk, false).await?;
        }
        Ok(())
    }

    /// Flush buffered bytes and wait for the server's ack, surfacing any
    /// asynchronous store failure.
    pub async fn flush(&mut self) -> Result<()> {
        let chunk = self.buffer.split();
        if !chunk.is_empty() {
            self.send_chunk(&chunk, false).await?;
        }
        // An empty chunk requests a flush ack.
        self.send_header(0, false).await?;
        self.read_ack().await
    }

    /// Close the stream: the end flag travels with the final chunk and the
    /// final ack carries any pending failure. The pipe is recycled on
    /// success.
    pub async fn close(mut self) -> Result<()> {
        let chunk = self.buffer.split();
        self.send_chunk(&chunk, true).await?;
        let result = self.read_ack().await;
        if let Some(pipe) = self.pipe.take() {
            match &result {
                Ok(()) if pipe.is_clean() => self.session.recycle(pipe),
                _ => pipe.close().await,
            }
        }
        result
    }

    async fn send_chunk(&mut self, chunk: &[u8], end: bool) -> Result<()> {
        debug_assert!(chunk.len() <= MAX_CHUNK);
        self.send_header_with(chunk, chunk.len() as u16, end).await
    }

    async fn send_header(&mut self, len: u16, end: bool) -> Result<()> {
        self.send_header_with(&[], len, end).await
    }

    async fn send_header_with(&mut self, payload: &[u8], len: u16, end: bool) -> Result<()> {
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(RemoteError::closed_stream)?;
        let mut framed = BytesMut::with_capacity(2 + payload.len());
        let mut header = len & CHUNK_LEN_MASK;
        if end {
            header |= CHUNK_END_FLAG;
        }
        framed.put_u16_le(header);
        framed.put_slice(payload);
        pipe.send_raw(framed.freeze()).await
    }

    async fn read_ack(&mut self) -> Result<()> {
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(RemoteError::closed_stream)?;
        let status = pipe.read_u8().await?;
        if status == STATUS_OK {
            return Ok(());
        }
        let len = pipe.read_u32_le().await? as usize;
        let encoded = pipe.read_exact(len).await?;
        let mut cursor = encoded;
        Err(decode_error(&mut cursor)?)
    }
}

impl Drop for ValueOutputStream {
    fn drop(&mut self) {
        // Abandoned without close: drop the pipe so the server sees it end.
        drop(self.pipe.take());
    }
}
