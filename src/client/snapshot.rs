// Remote snapshot proxy: versioned metadata plus a one-shot byte transfer.

use super::session::SessionInner;
use super::stub::Stub;
use crate::error::{RemoteError, Result};
use crate::protocol::SnapshotOp;
use std::sync::Arc;

/// A server-side snapshot pending transfer.
pub struct Snapshot {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) stub: Stub,
    length: u64,
    position: u64,
    compressible: bool,
}

impl Snapshot {
    pub(crate) fn new(
        session: Arc<SessionInner>,
        handle: u64,
        epoch: u64,
        length: u64,
        position: u64,
        compressible: bool,
    ) -> Snapshot {
        Snapshot {
            stub: Stub::new(session.clone(), handle, epoch),
            session,
            length,
            position,
            compressible,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_compressible(&self) -> bool {
        self.compressible
    }

    /// Transfer the snapshot bytes into `out`. The server streams chunks
    /// followed by a CRC of the whole stream; the handle is consumed.
    pub async fn write_to<W: std::io::Write>(self, out: &mut W) -> Result<u64> {
        let (mut pipe, _reply) = self
            .stub
            .invoke_stream(SnapshotOp::WriteTo as u8, |_| {})
            .await?;
        let mut hasher = crc32fast::Hasher::new();
        let mut total = 0u64;
        loop {
            let len = pipe.read_u32_le().await?;
            if len == 0 {
                break;
            }
            let chunk = pipe.read_exact(len as usize).await?;
            hasher.update(&chunk);
            total += chunk.len() as u64;
            out.write_all(&chunk)?;
        }
        let expected = pipe.read_u32_le().await?;
        let actual = hasher.finalize();
        if expected != actual {
            pipe.close().await;
            return Err(RemoteError::io(format!(
                "snapshot stream checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }
        if pipe.is_clean() {
            self.session.recycle(pipe);
        } else {
            pipe.close().await;
        }
        self.stub.clear().await;
        Ok(total)
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}
