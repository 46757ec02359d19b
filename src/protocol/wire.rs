// Little-endian primitive and length-prefixed helpers shared by every codec.
//
// Decoders check remaining length before touching the buffer; the raw `Buf`
// accessors panic on underflow and must never be reached with short input.

use crate::error::{RemoteError, Result};
use bytes::{Buf, BufMut, BytesMut};

pub fn get_u8(buf: &mut impl Buf) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(RemoteError::io("truncated message"));
    }
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut impl Buf) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_u16(buf: &mut impl Buf) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(RemoteError::io("truncated message"));
    }
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut impl Buf) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(RemoteError::io("truncated message"));
    }
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut impl Buf) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(RemoteError::io("truncated message"));
    }
    Ok(buf.get_u64_le())
}

pub fn get_i64(buf: &mut impl Buf) -> Result<i64> {
    Ok(get_u64(buf)? as i64)
}

pub fn get_f64(buf: &mut impl Buf) -> Result<f64> {
    Ok(f64::from_bits(get_u64(buf)?))
}

pub fn get_bytes(buf: &mut impl Buf) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(RemoteError::io("truncated message"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn get_opt_bytes(buf: &mut impl Buf) -> Result<Option<Vec<u8>>> {
    if get_bool(buf)? {
        Ok(Some(get_bytes(buf)?))
    } else {
        Ok(None)
    }
}

pub fn get_str(buf: &mut impl Buf) -> Result<String> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| RemoteError::io("string is not UTF-8"))
}

pub fn get_opt_str(buf: &mut impl Buf) -> Result<Option<String>> {
    if get_bool(buf)? {
        Ok(Some(get_str(buf)?))
    } else {
        Ok(None)
    }
}

pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub fn put_opt_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_bytes(buf, v);
        }
        None => buf.put_u8(0),
    }
}

pub fn put_str(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_str(buf, v);
        }
        None => buf.put_u8(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, b"hello");
        put_opt_bytes(&mut buf, None);
        put_opt_bytes(&mut buf, Some(&b"there"[..]));
        put_str(&mut buf, "general");
        let mut bytes = buf.freeze();
        assert_eq!(get_bytes(&mut bytes).unwrap(), b"hello");
        assert_eq!(get_opt_bytes(&mut bytes).unwrap(), None);
        assert_eq!(get_opt_bytes(&mut bytes).unwrap(), Some(b"there".to_vec()));
        assert_eq!(get_str(&mut bytes).unwrap(), "general");
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn test_truncation_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(100);
        buf.put_slice(b"short");
        let mut bytes = buf.freeze();
        assert!(get_bytes(&mut bytes).is_err());
        let mut empty = BytesMut::new().freeze();
        assert!(get_u64(&mut empty).is_err());
    }
}
