// Typed wire codecs for composite records: errors with their trace frames
// and cursor value states. Single-byte enum codecs live on the enums
// themselves; the stats and plan records encode next to their types.

use super::wire::{
    get_bool, get_bytes, get_opt_bytes, get_opt_str, get_str, get_u16, get_u32, get_u64, get_u8,
    put_bytes, put_opt_bytes, put_opt_str, put_str,
};
use crate::engine::CursorValue;
use crate::error::{DeadlockInfo, RemoteError, Result, TraceFrame};
use bytes::{Buf, BufMut, BytesMut};

const KIND_CLOSED_DATABASE: u8 = 1;
const KIND_CLOSED_INDEX: u8 = 2;
const KIND_CLOSED_VIEW: u8 = 3;
const KIND_DEADLOCK: u8 = 4;
const KIND_LOCK_TIMEOUT: u8 = 5;
const KIND_LOCK_FAILURE: u8 = 6;
const KIND_VIEW_CONSTRAINT: u8 = 7;
const KIND_QUERY: u8 = 8;
const KIND_INVALID_TRANSACTION: u8 = 9;
const KIND_UNSUPPORTED: u8 = 10;
const KIND_ILLEGAL_STATE: u8 = 11;
const KIND_IO: u8 = 12;

fn put_frames(buf: &mut BytesMut, frames: &[TraceFrame]) {
    buf.put_u16_le(frames.len() as u16);
    for frame in frames {
        put_str(buf, &frame.module);
        put_str(buf, &frame.function);
        buf.put_u32_le(frame.line);
    }
}

fn get_frames(buf: &mut impl Buf) -> Result<Vec<TraceFrame>> {
    let count = get_u16(buf)? as usize;
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        frames.push(TraceFrame {
            module: get_str(buf)?,
            function: get_str(buf)?,
            line: get_u32(buf)?,
        });
    }
    Ok(frames)
}

/// Encode an error with its kind-specific fields and trace frames.
pub fn encode_error(error: &RemoteError, buf: &mut BytesMut) {
    match error {
        RemoteError::ClosedDatabase { frames } => {
            buf.put_u8(KIND_CLOSED_DATABASE);
            put_frames(buf, frames);
        }
        RemoteError::ClosedIndex { frames } => {
            buf.put_u8(KIND_CLOSED_INDEX);
            put_frames(buf, frames);
        }
        RemoteError::ClosedView { frames } => {
            buf.put_u8(KIND_CLOSED_VIEW);
            put_frames(buf, frames);
        }
        RemoteError::Deadlock {
            nanos_timeout,
            attachment,
            guilty,
            participants,
            frames,
        } => {
            buf.put_u8(KIND_DEADLOCK);
            put_frames(buf, frames);
            buf.put_u64_le(*nanos_timeout);
            put_str(buf, attachment);
            buf.put_u8(*guilty as u8);
            buf.put_u16_le(participants.len() as u16);
            for p in participants {
                buf.put_u64_le(p.index_id);
                put_opt_bytes(buf, p.index_name.as_deref());
                put_bytes(buf, &p.key);
                put_opt_str(buf, p.owner_attachment.as_deref());
            }
        }
        RemoteError::LockTimeout {
            nanos_timeout,
            attachment,
            frames,
        } => {
            buf.put_u8(KIND_LOCK_TIMEOUT);
            put_frames(buf, frames);
            buf.put_u64_le(*nanos_timeout);
            put_opt_str(buf, attachment.as_deref());
        }
        RemoteError::LockFailure { message, frames } => {
            buf.put_u8(KIND_LOCK_FAILURE);
            put_frames(buf, frames);
            put_str(buf, message);
        }
        RemoteError::ViewConstraint { message, frames } => {
            buf.put_u8(KIND_VIEW_CONSTRAINT);
            put_frames(buf, frames);
            put_str(buf, message);
        }
        RemoteError::Query {
            message,
            start,
            end,
            frames,
        } => {
            buf.put_u8(KIND_QUERY);
            put_frames(buf, frames);
            put_str(buf, message);
            buf.put_u32_le(*start);
            buf.put_u32_le(*end);
        }
        RemoteError::InvalidTransaction { message, frames } => {
            buf.put_u8(KIND_INVALID_TRANSACTION);
            put_frames(buf, frames);
            put_str(buf, message);
        }
        RemoteError::Unsupported { message, frames } => {
            buf.put_u8(KIND_UNSUPPORTED);
            put_frames(buf, frames);
            put_str(buf, message);
        }
        RemoteError::IllegalState { message, frames } => {
            buf.put_u8(KIND_ILLEGAL_STATE);
            put_frames(buf, frames);
            put_str(buf, message);
        }
        RemoteError::Io { message, frames } => {
            buf.put_u8(KIND_IO);
            put_frames(buf, frames);
            put_str(buf, message);
        }
    }
}

/// Decode an error encoded by [`encode_error`].
pub fn decode_error(buf: &mut impl Buf) -> Result<RemoteError> {
    let kind = get_u8(buf)?;
    let frames = get_frames(buf)?;
    Ok(match kind {
        KIND_CLOSED_DATABASE => RemoteError::ClosedDatabase { frames },
        KIND_CLOSED_INDEX => RemoteError::ClosedIndex { frames },
        KIND_CLOSED_VIEW => RemoteError::ClosedView { frames },
        KIND_DEADLOCK => {
            let nanos_timeout = get_u64(buf)?;
            let attachment = get_str(buf)?;
            let guilty = get_bool(buf)?;
            let count = get_u16(buf)? as usize;
            let mut participants = Vec::with_capacity(count);
            for _ in 0..count {
                participants.push(DeadlockInfo {
                    index_id: get_u64(buf)?,
                    index_name: get_opt_bytes(buf)?,
                    key: get_bytes(buf)?,
                    owner_attachment: get_opt_str(buf)?,
                });
            }
            RemoteError::Deadlock {
                nanos_timeout,
                attachment,
                guilty,
                participants,
                frames,
            }
        }
        KIND_LOCK_TIMEOUT => RemoteError::LockTimeout {
            nanos_timeout: get_u64(buf)?,
            attachment: get_opt_str(buf)?,
            frames,
        },
        KIND_LOCK_FAILURE => RemoteError::LockFailure {
            message: get_str(buf)?,
            frames,
        },
        KIND_VIEW_CONSTRAINT => RemoteError::ViewConstraint {
            message: get_str(buf)?,
            frames,
        },
        KIND_QUERY => RemoteError::Query {
            message: get_str(buf)?,
            start: get_u32(buf)?,
            end: get_u32(buf)?,
            frames,
        },
        KIND_INVALID_TRANSACTION => RemoteError::InvalidTransaction {
            message: get_str(buf)?,
            frames,
        },
        KIND_UNSUPPORTED => RemoteError::Unsupported {
            message: get_str(buf)?,
            frames,
        },
        KIND_ILLEGAL_STATE => RemoteError::IllegalState {
            message: get_str(buf)?,
            frames,
        },
        KIND_IO => RemoteError::Io {
            message: get_str(buf)?,
            frames,
        },
        other => RemoteError::io(format!("unknown error kind {}", other)),
    })
}

const VALUE_NOT_LOADED: u8 = 0;
const VALUE_ABSENT: u8 = 1;
const VALUE_BYTES: u8 = 2;

/// Encode a cursor value state, including the not-loaded sentinel.
pub fn encode_cursor_value(value: &CursorValue, buf: &mut BytesMut) {
    match value {
        CursorValue::NotLoaded => buf.put_u8(VALUE_NOT_LOADED),
        CursorValue::Absent => buf.put_u8(VALUE_ABSENT),
        CursorValue::Bytes(v) => {
            buf.put_u8(VALUE_BYTES);
            put_bytes(buf, v);
        }
    }
}

pub fn decode_cursor_value(buf: &mut impl Buf) -> Result<CursorValue> {
    Ok(match get_u8(buf)? {
        VALUE_NOT_LOADED => CursorValue::NotLoaded,
        VALUE_ABSENT => CursorValue::Absent,
        VALUE_BYTES => CursorValue::Bytes(get_bytes(buf)?),
        other => {
            return Err(RemoteError::io(format!(
                "unknown cursor value discriminator {}",
                other
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    #[test]
    fn test_error_round_trip_preserves_frames() {
        let error = RemoteError::lock_timeout(1_000_000)
            .with_frame(frame!("dispatch"))
            .with_frame(frame!("reply"));
        let mut buf = BytesMut::new();
        encode_error(&error, &mut buf);
        let mut bytes = buf.freeze();
        let decoded = decode_error(&mut bytes).unwrap();
        assert_eq!(decoded.frames().len(), error.frames().len());
        for (a, b) in decoded.frames().iter().zip(error.frames()) {
            assert_eq!(a.module, b.module);
            assert_eq!(a.function, b.function);
            assert_eq!(a.line, b.line);
        }
    }

    #[test]
    fn test_deadlock_round_trip() {
        let error = RemoteError::Deadlock {
            nanos_timeout: 77,
            attachment: "batch-writer".to_string(),
            guilty: true,
            participants: vec![DeadlockInfo {
                index_id: 9,
                index_name: Some(b"people".to_vec()),
                key: b"k1".to_vec(),
                owner_attachment: None,
            }],
            frames: vec![frame!("lock_exclusive")],
        };
        let mut buf = BytesMut::new();
        encode_error(&error, &mut buf);
        let mut bytes = buf.freeze();
        match decode_error(&mut bytes).unwrap() {
            RemoteError::Deadlock {
                nanos_timeout,
                attachment,
                guilty,
                participants,
                frames,
            } => {
                assert_eq!(nanos_timeout, 77);
                assert_eq!(attachment, "batch-writer");
                assert!(guilty);
                assert_eq!(participants.len(), 1);
                assert_eq!(participants[0].index_name, Some(b"people".to_vec()));
                assert_eq!(frames.len(), 1);
            }
            other => panic!("wrong kind decoded: {:?}", other),
        }
    }

    #[test]
    fn test_query_error_round_trip() {
        let error = RemoteError::query("unexpected token", 3, 8);
        let mut buf = BytesMut::new();
        encode_error(&error, &mut buf);
        let mut bytes = buf.freeze();
        match decode_error(&mut bytes).unwrap() {
            RemoteError::Query {
                message,
                start,
                end,
                ..
            } => {
                assert_eq!(message, "unexpected token");
                assert_eq!(start, 3);
                assert_eq!(end, 8);
            }
            other => panic!("wrong kind decoded: {:?}", other),
        }
    }

    #[test]
    fn test_cursor_value_round_trip() {
        for value in [
            CursorValue::NotLoaded,
            CursorValue::Absent,
            CursorValue::Bytes(b"payload".to_vec()),
        ] {
            let mut buf = BytesMut::new();
            encode_cursor_value(&value, &mut buf);
            let mut bytes = buf.freeze();
            assert_eq!(decode_cursor_value(&mut bytes).unwrap(), value);
        }
    }
}
