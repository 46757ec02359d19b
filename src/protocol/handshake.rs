// Connection establishment header.
//
// Before any request traffic, the client writes a fixed 44-byte header and
// the server echoes it back. A rejected connection is signaled by echoing
// the header with the group id zeroed, then closing.

use crate::error::{RemoteError, Result};

/// Protocol magic, little-endian at bytes 0..8.
pub const CONNECT_MAGIC: u64 = 2825672906279293275;

/// Synthetic group id, little-endian at bytes 8..16.
pub const GROUP_ID: u64 = 5156919750013540996;

/// Total header size: magic, group, 12 reserved bytes, two token slots.
pub const HEADER_LEN: usize = 44;

/// The fixed-width connect header exchanged by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectHeader {
    pub magic: u64,
    pub group_id: u64,
    pub tokens: [u64; 2],
}

impl ConnectHeader {
    /// Build a client header carrying up to two authentication tokens.
    ///
    /// An unused slot stays zero, which the server treats as absent.
    pub fn new(tokens: &[u64]) -> Self {
        let mut slots = [0u64; 2];
        for (slot, token) in slots.iter_mut().zip(tokens.iter()) {
            *slot = *token;
        }
        ConnectHeader {
            magic: CONNECT_MAGIC,
            group_id: GROUP_ID,
            tokens: slots,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.magic.to_le_bytes());
        buf[8..16].copy_from_slice(&self.group_id.to_le_bytes());
        // Bytes 16..28 are reserved and stay zero.
        buf[28..36].copy_from_slice(&self.tokens[0].to_le_bytes());
        buf[36..44].copy_from_slice(&self.tokens[1].to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        ConnectHeader {
            magic: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            group_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            tokens: [
                u64::from_le_bytes(buf[28..36].try_into().unwrap()),
                u64::from_le_bytes(buf[36..44].try_into().unwrap()),
            ],
        }
    }

    /// Whether a server configured with `accepted` tokens admits this header.
    ///
    /// An empty token configuration means unauthenticated accept. Zero slots
    /// are never matched, so an unauthenticated client cannot satisfy a
    /// token-protected server.
    pub fn accepts(&self, accepted: &[u64]) -> bool {
        if self.magic != CONNECT_MAGIC {
            return false;
        }
        if accepted.is_empty() {
            return true;
        }
        self.tokens
            .iter()
            .any(|&slot| slot != 0 && accepted.contains(&slot))
    }

    /// The rejection echo: same header with the group id zeroed.
    pub fn rejection(&self) -> ConnectHeader {
        ConnectHeader {
            group_id: 0,
            ..*self
        }
    }

    /// Interpret the server's echo on the client side.
    pub fn check_echo(echo: &ConnectHeader) -> Result<()> {
        if echo.magic != CONNECT_MAGIC {
            return Err(RemoteError::io("connect echo carries a foreign magic"));
        }
        if echo.group_id == 0 {
            return Err(RemoteError::io("connection rejected by peer"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = ConnectHeader::new(&[11, 22]);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = ConnectHeader::decode(&encoded);
        assert_eq!(decoded, header);
        assert_eq!(decoded.tokens, [11, 22]);
    }

    #[test]
    fn test_reserved_bytes_zero() {
        let encoded = ConnectHeader::new(&[1]).encode();
        assert!(encoded[16..28].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_accept_requires_matching_token() {
        let header = ConnectHeader::new(&[10, 20]);
        assert!(header.accepts(&[20, 30]));
        assert!(header.accepts(&[]));
        assert!(!header.accepts(&[30, 40]));
    }

    #[test]
    fn test_zero_slot_never_matches() {
        let header = ConnectHeader::new(&[]);
        assert!(!header.accepts(&[0, 5]));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = ConnectHeader::new(&[5]);
        header.magic = 123;
        assert!(!header.accepts(&[5]));
    }

    #[test]
    fn test_rejection_echo() {
        let header = ConnectHeader::new(&[5]);
        let reject = header.rejection();
        assert_eq!(reject.group_id, 0);
        assert!(ConnectHeader::check_echo(&reject).is_err());
        assert!(ConnectHeader::check_echo(&header).is_ok());
    }
}
