// Local observers and the client side of the node-event relays.
//
// Observer callbacks return `Ok(true)` to continue, `Ok(false)` to stop the
// walk, and `Err(..)` to stop with a held error that is re-thrown after the
// overall call returns.

use crate::error::{RemoteError, Result};
use crate::protocol::{RELAY_ACK, RELAY_INDEX_BOUNDARY, RELAY_START, RELAY_STOP};
use crate::transport::Pipe;
use bytes::Bytes;

/// Receives verification progress for `verify` calls.
pub trait VerificationObserver: Send {
    /// Whether node-level events should travel over the relay at all. The
    /// request sets its observer flag from this.
    fn wants_nodes(&self) -> bool {
        false
    }

    fn begin_index(&mut self, id: u64, name: &[u8]) -> Result<bool> {
        let _ = (id, name);
        Ok(true)
    }

    fn node_passed(
        &mut self,
        id: u64,
        level: u8,
        entry_count: u32,
        free_bytes: u32,
        large_value_count: u32,
    ) -> Result<bool> {
        let _ = (id, level, entry_count, free_bytes, large_value_count);
        Ok(true)
    }

    fn node_failed(&mut self, id: u64, level: u8, message: &str) -> Result<bool> {
        let _ = (id, level, message);
        Ok(true)
    }
}

/// Receives compaction progress for `compact_file` calls.
pub trait CompactionObserver: Send {
    fn wants_nodes(&self) -> bool {
        false
    }

    fn begin_index(&mut self, id: u64, name: &[u8]) -> Result<bool> {
        let _ = (id, name);
        Ok(true)
    }

    fn node_visited(&mut self, id: u64) -> Result<bool> {
        let _ = id;
        Ok(true)
    }
}

/// End-of-relay sentinel; mirrors the server's writer.
const RELAY_END: u64 = u64::MAX;

async fn read_name(pipe: &mut Pipe) -> Result<Bytes> {
    let len = pipe.read_u32_le().await? as usize;
    pipe.read_exact(len).await
}

/// Drive a verification relay pipe, merging events into the observer.
/// Returns the held observer error, if any. The pipe is always closed.
pub(crate) async fn process_verify_relay(
    mut pipe: Pipe,
    observer: &mut dyn VerificationObserver,
) -> Option<RemoteError> {
    let held = process_verify_inner(&mut pipe, observer).await;
    pipe.close().await;
    held.unwrap_or_default()
}

async fn process_verify_inner(
    pipe: &mut Pipe,
    observer: &mut dyn VerificationObserver,
) -> Result<Option<RemoteError>> {
    // Kind byte, then the start byte; ack readiness.
    let _kind = pipe.read_u8().await?;
    if pipe.read_u8().await? != RELAY_START {
        return Ok(None);
    }
    pipe.send_raw(Bytes::from_static(&[RELAY_ACK])).await?;

    let mut held: Option<RemoteError> = None;
    let mut stopping = false;
    loop {
        let index_id = pipe.read_u64_le().await?;
        if index_id == RELAY_END {
            break;
        }
        let name = read_name(pipe).await?;
        if !stopping {
            match observer.begin_index(index_id, &name) {
                Ok(true) => {}
                Ok(false) => stopping = true,
                Err(e) => {
                    held.get_or_insert(e);
                    stopping = true;
                }
            }
        }
        loop {
            let node_id = pipe.read_u64_le().await?;
            if node_id == RELAY_INDEX_BOUNDARY {
                pipe.send_raw(Bytes::from_static(if stopping {
                    &[RELAY_STOP]
                } else {
                    &[RELAY_ACK]
                }))
                .await?;
                break;
            }
            let failed = pipe.read_u8().await? != 0;
            let level = pipe.read_u8().await?;
            let outcome = if failed {
                let len = pipe.read_u32_le().await? as usize;
                let message = pipe.read_exact(len).await?;
                if stopping {
                    Ok(true)
                } else {
                    observer.node_failed(
                        node_id,
                        level,
                        &String::from_utf8_lossy(&message),
                    )
                }
            } else {
                let entry_count = pipe.read_u32_le().await?;
                let free_bytes = pipe.read_u32_le().await?;
                let large = pipe.read_u32_le().await?;
                if stopping {
                    Ok(true)
                } else {
                    observer.node_passed(node_id, level, entry_count, free_bytes, large)
                }
            };
            match outcome {
                Ok(true) => {}
                Ok(false) => stopping = true,
                Err(e) => {
                    held.get_or_insert(e);
                    stopping = true;
                }
            }
        }
        if stopping {
            // The server ends the stream after a stop reply.
            break;
        }
    }
    Ok(held)
}

/// Drive a compaction relay pipe. Returns the held observer error, if any.
pub(crate) async fn process_compact_relay(
    mut pipe: Pipe,
    observer: &mut dyn CompactionObserver,
) -> Option<RemoteError> {
    let held = process_compact_inner(&mut pipe, observer).await;
    pipe.close().await;
    held.unwrap_or_default()
}

async fn process_compact_inner(
    pipe: &mut Pipe,
    observer: &mut dyn CompactionObserver,
) -> Result<Option<RemoteError>> {
    let _kind = pipe.read_u8().await?;
    if pipe.read_u8().await? != RELAY_START {
        return Ok(None);
    }
    pipe.send_raw(Bytes::from_static(&[RELAY_ACK])).await?;

    let mut held: Option<RemoteError> = None;
    let mut stopping = false;
    loop {
        let index_id = pipe.read_u64_le().await?;
        if index_id == RELAY_END {
            break;
        }
        let name = read_name(pipe).await?;
        if !stopping {
            match observer.begin_index(index_id, &name) {
                Ok(true) => {}
                Ok(false) => stopping = true,
                Err(e) => {
                    held.get_or_insert(e);
                    stopping = true;
                }
            }
        }
        loop {
            let node_id = pipe.read_u64_le().await?;
            if node_id == RELAY_INDEX_BOUNDARY {
                pipe.send_raw(Bytes::from_static(if stopping {
                    &[RELAY_STOP]
                } else {
                    &[RELAY_ACK]
                }))
                .await?;
                break;
            }
            if !stopping {
                match observer.node_visited(node_id) {
                    Ok(true) => {}
                    Ok(false) => stopping = true,
                    Err(e) => {
                        held.get_or_insert(e);
                        stopping = true;
                    }
                }
            }
        }
        if stopping {
            break;
        }
    }
    Ok(held)
}
