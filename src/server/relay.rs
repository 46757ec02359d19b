// Observer relays: translate engine callback floods into chunked,
// acknowledged streams on dedicated pipes.
//
// Stream layout, written by the server after opening the pipe:
//
// ```text
// CHANNEL_RELAY | token u64 | relay kind u8 | RELAY_START   -> client ack
// per index:
//   index id u64 | name bytes
//   per node: fixed record (kind-specific)
//   id 0 terminator                                         -> client ack
// end sentinel u64::MAX
// ```
//
// The pipe is always closed afterwards, never recycled: the reader may be
// stalled mid-transfer.

use crate::engine::{CompactionEvents, VerificationEvents};
use crate::error::Result;
use crate::protocol::{CHANNEL_RELAY, RELAY_ACK, RELAY_INDEX_BOUNDARY, RELAY_START};
use crate::transport::{Conn, Pipe};
use bytes::{BufMut, BytesMut};
use tracing::debug;

pub(crate) const RELAY_KIND_VERIFY: u8 = 1;
pub(crate) const RELAY_KIND_COMPACT: u8 = 2;

/// End-of-relay sentinel in place of an index id.
pub(crate) const RELAY_END: u64 = u64::MAX;

/// Flush the record buffer once it grows past this.
const RELAY_BUFFER_LIMIT: usize = 32 * 1024;

/// One buffered engine event.
pub(crate) enum RelayEvent {
    BeginIndex {
        id: u64,
        name: Vec<u8>,
    },
    VerifyNode {
        id: u64,
        level: u8,
        entry_count: u32,
        free_bytes: u32,
        large_value_count: u32,
    },
    VerifyFailed {
        id: u64,
        level: u8,
        message: String,
    },
    CompactNode {
        id: u64,
    },
}

/// Collects verification events for relaying after the engine walk.
#[derive(Default)]
pub(crate) struct CollectingVerify {
    pub events: Vec<RelayEvent>,
}

impl VerificationEvents for CollectingVerify {
    fn begin_index(&mut self, id: u64, name: &[u8]) -> bool {
        self.events.push(RelayEvent::BeginIndex {
            id,
            name: name.to_vec(),
        });
        true
    }

    fn node_passed(
        &mut self,
        id: u64,
        level: u8,
        entry_count: u32,
        free_bytes: u32,
        large_value_count: u32,
    ) -> bool {
        self.events.push(RelayEvent::VerifyNode {
            id,
            level,
            entry_count,
            free_bytes,
            large_value_count,
        });
        true
    }

    fn node_failed(&mut self, id: u64, level: u8, message: &str) -> bool {
        self.events.push(RelayEvent::VerifyFailed {
            id,
            level,
            message: message.to_string(),
        });
        true
    }
}

/// Collects compaction events for relaying after the engine walk.
#[derive(Default)]
pub(crate) struct CollectingCompact {
    pub events: Vec<RelayEvent>,
}

impl CompactionEvents for CollectingCompact {
    fn begin_index(&mut self, id: u64, name: &[u8]) -> bool {
        self.events.push(RelayEvent::BeginIndex {
            id,
            name: name.to_vec(),
        });
        true
    }

    fn node_visited(&mut self, id: u64) -> bool {
        self.events.push(RelayEvent::CompactNode { id });
        true
    }
}

/// Stream the collected events to the client relay identified by `token`.
pub(crate) async fn stream_relay(
    conn: &Conn,
    token: u64,
    kind: u8,
    events: Vec<RelayEvent>,
) -> Result<()> {
    let mut pipe = conn.open_pipe().await?;
    let result = stream_relay_inner(&mut pipe, token, kind, events).await;
    if let Err(e) = &result {
        debug!(error = %e, "relay stream ended early");
    }
    pipe.close().await;
    result
}

async fn stream_relay_inner(
    pipe: &mut Pipe,
    token: u64,
    kind: u8,
    events: Vec<RelayEvent>,
) -> Result<()> {
    let mut head = BytesMut::with_capacity(11);
    head.put_u8(CHANNEL_RELAY);
    head.put_u64_le(token);
    head.put_u8(kind);
    head.put_u8(RELAY_START);
    pipe.send_raw(head.freeze()).await?;

    if pipe.read_u8().await? != RELAY_ACK {
        return Ok(());
    }

    let mut buf = BytesMut::new();
    let mut in_index = false;
    for event in events {
        match event {
            RelayEvent::BeginIndex { id, name } => {
                if in_index {
                    if !end_index(pipe, &mut buf).await? {
                        return Ok(());
                    }
                }
                in_index = true;
                buf.put_u64_le(id);
                buf.put_u32_le(name.len() as u32);
                buf.put_slice(&name);
            }
            RelayEvent::VerifyNode {
                id,
                level,
                entry_count,
                free_bytes,
                large_value_count,
            } => {
                buf.put_u64_le(id);
                buf.put_u8(0);
                buf.put_u8(level);
                buf.put_u32_le(entry_count);
                buf.put_u32_le(free_bytes);
                buf.put_u32_le(large_value_count);
            }
            RelayEvent::VerifyFailed { id, level, message } => {
                buf.put_u64_le(id);
                buf.put_u8(1);
                buf.put_u8(level);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
            RelayEvent::CompactNode { id } => {
                buf.put_u64_le(id);
            }
        }
        if buf.len() >= RELAY_BUFFER_LIMIT {
            pipe.send_raw(buf.split().freeze()).await?;
        }
    }
    if in_index && !end_index(pipe, &mut buf).await? {
        return Ok(());
    }
    buf.put_u64_le(RELAY_END);
    pipe.send_raw(buf.freeze()).await?;
    Ok(())
}

/// Write the index boundary terminator and synchronously wait for the
/// client's completion reply. Returns `false` when the client stops the walk.
async fn end_index(pipe: &mut Pipe, buf: &mut BytesMut) -> Result<bool> {
    buf.put_u64_le(RELAY_INDEX_BOUNDARY);
    pipe.send_raw(buf.split().freeze()).await?;
    Ok(pipe.read_u8().await? == RELAY_ACK)
}
