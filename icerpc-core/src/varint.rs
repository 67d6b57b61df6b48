//! Minimal varuint encoding shared by both wire protocols: ice's
//! size-prefixed strings (spec §6.1) and icerpc's Slic frame sizes/stream ids
//! (spec §6.2). LEB128-style, little-endian base-128.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::IceRpcError;

/// Appends `value` to `buf` as a LEB128 varuint.
pub fn write_varuint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads a LEB128 varuint, advancing `buf`.
pub fn read_varuint(buf: &mut Bytes) -> Result<u64, IceRpcError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(IceRpcError::ProtocolFailure("truncated varuint".into()));
        }
        if shift >= 64 {
            return Err(IceRpcError::ProtocolFailure("varuint overflow".into()));
        }
        let byte = buf.get_u8();
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Writes a length-prefixed UTF-8 string (size as varuint, then bytes).
pub fn write_string(buf: &mut BytesMut, s: &str) {
    write_varuint(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string(buf: &mut Bytes) -> Result<String, IceRpcError> {
    let len = read_varuint(buf)? as usize;
    if buf.remaining() < len {
        return Err(IceRpcError::ProtocolFailure("truncated string".into()));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| IceRpcError::ProtocolFailure(format!("invalid utf-8 in string: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_round_trips() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            write_varuint(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(read_varuint(&mut bytes).unwrap(), value);
        }
    }

    #[test]
    fn string_round_trips() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "/greeter");
        let mut bytes = buf.freeze();
        assert_eq!(read_string(&mut bytes).unwrap(), "/greeter");
    }
}
