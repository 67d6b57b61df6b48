//! Wire format for the legacy single-stream framed protocol (spec §6.1).
//!
//! Frame: 14-byte header = magic(4) + protocol major/minor(2) +
//! protocol-encoding major/minor(2) + frame-type(1) + compression-status(1)
//! + size(4 LE), then body. All integers little-endian; strings are
//! size-prefixed UTF-8.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use icerpc_core::error::DispatchErrorCode;
use icerpc_core::varint::{read_string, write_string};
use icerpc_core::IceRpcError;

const MAGIC: [u8; 4] = *b"ICPC";
const PROTOCOL_VERSION: (u8, u8) = (1, 0);
const ENCODING_VERSION: (u8, u8) = (1, 1);
pub(crate) const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Request,
    RequestBatch,
    Reply,
    ValidateConnection,
    CloseConnection,
}

impl FrameType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::RequestBatch => 1,
            Self::Reply => 2,
            Self::ValidateConnection => 3,
            Self::CloseConnection => 4,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, IceRpcError> {
        match byte {
            0 => Ok(Self::Request),
            1 => Ok(Self::RequestBatch),
            2 => Ok(Self::Reply),
            3 => Ok(Self::ValidateConnection),
            4 => Ok(Self::CloseConnection),
            other => Err(IceRpcError::ProtocolFailure(format!("unknown ice frame type {other}"))),
        }
    }
}

/// A decoded frame header plus its raw body bytes.
#[derive(Debug)]
pub(crate) struct RawFrame {
    pub frame_type: FrameType,
    pub body: Bytes,
}

/// Encodes `body` with a 14-byte frame header around it.
pub(crate) fn encode_frame(frame_type: FrameType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION.0);
    buf.put_u8(PROTOCOL_VERSION.1);
    buf.put_u8(ENCODING_VERSION.0);
    buf.put_u8(ENCODING_VERSION.1);
    buf.put_u8(frame_type.to_byte());
    buf.put_u8(0); // compression-status: never compressed (compression is a hook, not a codec)
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Decodes a 14-byte frame header from `header`.
pub(crate) fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(FrameType, u32), IceRpcError> {
    if header[0..4] != MAGIC {
        return Err(IceRpcError::ProtocolFailure("bad ice magic".into()));
    }
    let frame_type = FrameType::from_byte(header[8])?;
    let size = u32::from_le_bytes([header[10], header[11], header[12], header[13]]);
    Ok((frame_type, size))
}

/// Request body: request-id + identity + facet-path + operation + mode +
/// context + encapsulation.
#[derive(Debug, Clone)]
pub(crate) struct RequestHeader {
    pub request_id: i32,
    pub path: String,
    pub operation: String,
    pub idempotent: bool,
    pub context: Vec<(String, String)>,
}

pub(crate) fn encode_request(header: &RequestHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32_le(header.request_id);
    write_string(&mut buf, &header.path); // identity name; category/facet left empty
    write_string(&mut buf, "");
    write_varuint_seq_len(&mut buf, 0); // facet-path: empty string-seq
    write_string(&mut buf, &header.operation);
    buf.put_u8(if header.idempotent { 2 } else { 0 });
    write_varuint_seq_len(&mut buf, header.context.len() as u64);
    for (key, value) in &header.context {
        write_string(&mut buf, key);
        write_string(&mut buf, value);
    }
    encode_encapsulation(&mut buf, payload);
    buf.freeze()
}

pub(crate) fn decode_request(mut body: Bytes) -> Result<(RequestHeader, Bytes), IceRpcError> {
    let request_id = read_i32(&mut body)?;
    let path = read_string(&mut body)?;
    let _category = read_string(&mut body)?;
    let facet_count = read_varuint_seq_len(&mut body)?;
    for _ in 0..facet_count {
        read_string(&mut body)?;
    }
    let operation = read_string(&mut body)?;
    let mode = read_u8(&mut body)?;
    let context_count = read_varuint_seq_len(&mut body)?;
    let mut context = Vec::with_capacity(context_count as usize);
    for _ in 0..context_count {
        let key = read_string(&mut body)?;
        let value = read_string(&mut body)?;
        context.push((key, value));
    }
    let payload = decode_encapsulation(&mut body)?;
    Ok((
        RequestHeader { request_id, path, operation, idempotent: mode == 2, context },
        payload,
    ))
}

/// Reply body: request-id + reply-status + encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyStatus {
    Success,
    Failure(DispatchErrorCode),
}

impl ReplyStatus {
    fn to_byte(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure(DispatchErrorCode::ServiceNotFound) => 1,
            Self::Failure(DispatchErrorCode::OperationNotFound) => 2,
            Self::Failure(DispatchErrorCode::InvalidData) => 3,
            Self::Failure(DispatchErrorCode::Canceled) => 4,
            Self::Failure(DispatchErrorCode::UnhandledException) => 5,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, IceRpcError> {
        match byte {
            0 => Ok(Self::Success),
            1 => Ok(Self::Failure(DispatchErrorCode::ServiceNotFound)),
            2 => Ok(Self::Failure(DispatchErrorCode::OperationNotFound)),
            3 => Ok(Self::Failure(DispatchErrorCode::InvalidData)),
            4 => Ok(Self::Failure(DispatchErrorCode::Canceled)),
            5 => Ok(Self::Failure(DispatchErrorCode::UnhandledException)),
            other => Err(IceRpcError::ProtocolFailure(format!("unknown ice reply status {other}"))),
        }
    }
}

pub(crate) fn encode_reply(request_id: i32, status: ReplyStatus, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32_le(request_id);
    buf.put_u8(status.to_byte());
    encode_encapsulation(&mut buf, payload);
    buf.freeze()
}

pub(crate) fn decode_reply(mut body: Bytes) -> Result<(i32, ReplyStatus, Bytes), IceRpcError> {
    let request_id = read_i32(&mut body)?;
    let status = ReplyStatus::from_byte(read_u8(&mut body)?)?;
    let payload = decode_encapsulation(&mut body)?;
    Ok((request_id, status, payload))
}

fn encode_encapsulation(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u32_le(payload.len() as u32);
    buf.put_u8(ENCODING_VERSION.0);
    buf.put_u8(ENCODING_VERSION.1);
    buf.put_slice(payload);
}

fn decode_encapsulation(body: &mut Bytes) -> Result<Bytes, IceRpcError> {
    if body.remaining() < 6 {
        return Err(IceRpcError::ProtocolFailure("truncated encapsulation".into()));
    }
    let size = body.get_u32_le() as usize;
    let _major = body.get_u8();
    let _minor = body.get_u8();
    if body.remaining() < size {
        return Err(IceRpcError::ProtocolFailure("truncated encapsulation body".into()));
    }
    Ok(body.split_to(size))
}

fn write_varuint_seq_len(buf: &mut BytesMut, len: u64) {
    icerpc_core::varint::write_varuint(buf, len);
}

fn read_varuint_seq_len(buf: &mut Bytes) -> Result<u64, IceRpcError> {
    icerpc_core::varint::read_varuint(buf)
}

fn read_i32(buf: &mut Bytes) -> Result<i32, IceRpcError> {
    if buf.remaining() < 4 {
        return Err(IceRpcError::ProtocolFailure("truncated i32".into()));
    }
    Ok(buf.get_i32_le())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, IceRpcError> {
    if !buf.has_remaining() {
        return Err(IceRpcError::ProtocolFailure("truncated byte".into()));
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let header = RequestHeader {
            request_id: 7,
            path: "/greeter".into(),
            operation: "sayHello".into(),
            idempotent: true,
            context: vec![("lang".into(), "en".into())],
        };
        let encoded = encode_request(&header, b"payload");
        let (decoded, payload) = decode_request(encoded).unwrap();
        assert_eq!(decoded.request_id, 7);
        assert_eq!(decoded.path, "/greeter");
        assert_eq!(decoded.operation, "sayHello");
        assert!(decoded.idempotent);
        assert_eq!(decoded.context, vec![("lang".to_string(), "en".to_string())]);
        assert_eq!(payload.as_ref(), b"payload");
    }

    #[test]
    fn reply_round_trips() {
        let encoded = encode_reply(7, ReplyStatus::Success, b"ok");
        let (id, status, payload) = decode_reply(encoded).unwrap();
        assert_eq!(id, 7);
        assert_eq!(status, ReplyStatus::Success);
        assert_eq!(payload.as_ref(), b"ok");
    }

    #[test]
    fn frame_header_round_trips() {
        let frame = encode_frame(FrameType::ValidateConnection, &[]);
        let header: [u8; HEADER_LEN] = frame[..HEADER_LEN].try_into().unwrap();
        let (frame_type, size) = decode_header(&header).unwrap();
        assert_eq!(frame_type, FrameType::ValidateConnection);
        assert_eq!(size, 0);
    }
}
