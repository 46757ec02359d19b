// Frame header for logical pipes multiplexed on one connection.
//
// ```text
// +---------+--------+--------+
// | Pipe ID | Kind   | Length |
// | 4 bytes | 1 byte | 4 bytes|
// +---------+--------+--------+
// ```
//
// All fields little-endian. Length counts only the payload that follows.

use crate::error::{RemoteError, Result};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 9;

/// Maximum payload of one frame (16 MB).
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// The sender opened a new pipe with this id.
    Open = 1,

    /// Payload bytes for an open pipe.
    Data = 2,

    /// The sender closed the pipe.
    Close = 3,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Open),
            2 => Ok(FrameKind::Data),
            3 => Ok(FrameKind::Close),
            other => Err(RemoteError::io(format!("unknown frame kind {}", other))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub pipe: u32,
    pub kind: FrameKind,
    pub len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.pipe.to_le_bytes());
        buf[4] = self.kind as u8;
        buf[5..9].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        let header = FrameHeader {
            pipe: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            kind: FrameKind::from_u8(buf[4])?,
            len: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
        };
        if header.len as usize > MAX_FRAME_PAYLOAD {
            return Err(RemoteError::io(format!(
                "frame payload of {} bytes exceeds the {} byte cap",
                header.len, MAX_FRAME_PAYLOAD
            )));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = FrameHeader {
            pipe: 7,
            kind: FrameKind::Data,
            len: 1024,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut raw = FrameHeader {
            pipe: 1,
            kind: FrameKind::Open,
            len: 0,
        }
        .encode();
        raw[4] = 9;
        assert!(FrameHeader::decode(&raw).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut raw = FrameHeader {
            pipe: 1,
            kind: FrameKind::Data,
            len: 0,
        }
        .encode();
        raw[5..9].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(FrameHeader::decode(&raw).is_err());
    }
}
