//! Wire format for the multiplexed stream-per-request protocol (spec §6.2).
//!
//! Every stream carries a single varuint-prefixed frame before its payload
//! bytes: frame-type(1) + header-size(varuint) + header, followed by the raw
//! payload for the rest of the stream's lifetime. `Initialize`/
//! `InitializeAck` are exchanged once, on the connection's first
//! bidirectional stream, before any request stream opens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use icerpc_core::fields::FieldsCodec;
use icerpc_core::varint::{read_string, read_varuint, write_string, write_varuint};
use icerpc_core::{Fields, IceRpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameType {
    Initialize,
    InitializeAck,
    Request,
    Response,
}

impl FrameType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Self::Initialize => 0,
            Self::InitializeAck => 1,
            Self::Request => 2,
            Self::Response => 3,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Result<Self, IceRpcError> {
        match byte {
            0 => Ok(Self::Initialize),
            1 => Ok(Self::InitializeAck),
            2 => Ok(Self::Request),
            3 => Ok(Self::Response),
            other => Err(IceRpcError::ProtocolFailure(format!("unknown icerpc frame type {other}"))),
        }
    }
}

/// Writes `frame_type` + varuint-size-prefixed `header` as the frame a stream
/// opens with. The payload that follows is written directly to the stream,
/// outside of this framing.
pub(crate) fn encode_frame(frame_type: FrameType, header: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(header.len() + 6);
    buf.put_u8(frame_type.to_byte());
    write_varuint(&mut buf, header.len() as u64);
    buf.put_slice(header);
    buf.freeze()
}

/// Reads a frame type + varuint size from the front of `buf`, returning the
/// header bytes split off and leaving the remainder (the payload) in `buf`.
pub(crate) fn decode_frame_header(buf: &mut Bytes) -> Result<(FrameType, Bytes), IceRpcError> {
    if !buf.has_remaining() {
        return Err(IceRpcError::ProtocolFailure("truncated icerpc frame".into()));
    }
    let frame_type = FrameType::from_byte(buf.get_u8())?;
    let size = read_varuint(buf)? as usize;
    if buf.remaining() < size {
        return Err(IceRpcError::ProtocolFailure("truncated icerpc frame header".into()));
    }
    Ok((frame_type, buf.split_to(size)))
}

/// The fields exchanged once per connection (spec §4.3 Initialize step 1-2).
pub(crate) fn encode_initialize(fields: &Fields) -> Bytes {
    FieldsCodec.encode(fields)
}

pub(crate) fn decode_initialize(body: Bytes) -> Result<Fields, IceRpcError> {
    FieldsCodec.decode(body)
}

/// Per-stream request header: path + operation + idempotent + oneway +
/// deadline (ms since epoch, -1 = never) + fields. `oneway` is carried
/// in-band rather than inferred from the stream kind, since a unidirectional
/// and a bidirectional stream are the same [`crate::transport::MultiplexedStream`]
/// type once opened.
#[derive(Debug, Clone)]
pub(crate) struct RequestHeader {
    pub path: String,
    pub operation: String,
    pub idempotent: bool,
    pub oneway: bool,
    pub deadline_millis: i64,
    pub fields: Fields,
}

pub(crate) fn encode_request_header(header: &RequestHeader) -> Bytes {
    let mut buf = BytesMut::new();
    write_string(&mut buf, &header.path);
    write_string(&mut buf, &header.operation);
    let mut mode = 0u8;
    if header.idempotent {
        mode |= 0b01;
    }
    if header.oneway {
        mode |= 0b10;
    }
    buf.put_u8(mode);
    buf.put_i64_le(header.deadline_millis);
    buf.extend_from_slice(&FieldsCodec.encode(&header.fields));
    buf.freeze()
}

pub(crate) fn decode_request_header(mut body: Bytes) -> Result<RequestHeader, IceRpcError> {
    let path = read_string(&mut body)?;
    let operation = read_string(&mut body)?;
    if !body.has_remaining() {
        return Err(IceRpcError::ProtocolFailure("truncated icerpc request header".into()));
    }
    let mode = body.get_u8();
    if body.remaining() < 8 {
        return Err(IceRpcError::ProtocolFailure("truncated icerpc deadline".into()));
    }
    let deadline_millis = body.get_i64_le();
    let fields = FieldsCodec.decode(body)?;
    Ok(RequestHeader {
        path,
        operation,
        idempotent: mode & 0b01 != 0,
        oneway: mode & 0b10 != 0,
        deadline_millis,
        fields,
    })
}

/// Which branch of a response arrived, wire-encoded as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireResultType {
    Success,
    Failure,
}

impl WireResultType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, IceRpcError> {
        match byte {
            0 => Ok(Self::Success),
            1 => Ok(Self::Failure),
            other => Err(IceRpcError::ProtocolFailure(format!("unknown icerpc result type {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHeader {
    pub result_type: WireResultType,
    pub payload_encoding: String,
    pub fields: Fields,
}

pub(crate) fn encode_response_header(header: &ResponseHeader) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(header.result_type.to_byte());
    write_string(&mut buf, &header.payload_encoding);
    buf.extend_from_slice(&FieldsCodec.encode(&header.fields));
    buf.freeze()
}

pub(crate) fn decode_response_header(mut body: Bytes) -> Result<ResponseHeader, IceRpcError> {
    if !body.has_remaining() {
        return Err(IceRpcError::ProtocolFailure("truncated icerpc response header".into()));
    }
    let result_type = WireResultType::from_byte(body.get_u8())?;
    let payload_encoding = read_string(&mut body)?;
    let fields = FieldsCodec.decode(body)?;
    Ok(ResponseHeader { result_type, payload_encoding, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips() {
        let frame = encode_frame(FrameType::Request, b"hdr");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(b"payload-tail");
        let mut bytes = buf.freeze();
        let (frame_type, header) = decode_frame_header(&mut bytes).unwrap();
        assert_eq!(frame_type, FrameType::Request);
        assert_eq!(header.as_ref(), b"hdr");
        assert_eq!(bytes.as_ref(), b"payload-tail");
    }

    #[test]
    fn request_header_round_trips() {
        let mut fields = Fields::new();
        fields.insert(icerpc_core::FieldKey::IDEMPOTENT, Bytes::new());
        let header = RequestHeader {
            path: "/greeter".into(),
            operation: "sayHello".into(),
            idempotent: true,
            oneway: true,
            deadline_millis: -1,
            fields,
        };
        let encoded = encode_request_header(&header);
        let decoded = decode_request_header(encoded).unwrap();
        assert_eq!(decoded.path, "/greeter");
        assert_eq!(decoded.operation, "sayHello");
        assert!(decoded.idempotent);
        assert!(decoded.oneway);
        assert_eq!(decoded.deadline_millis, -1);
        assert_eq!(decoded.fields.len(), 1);
    }

    #[test]
    fn response_header_round_trips() {
        let header = ResponseHeader {
            result_type: WireResultType::Failure,
            payload_encoding: "slice2".into(),
            fields: Fields::new(),
        };
        let encoded = encode_response_header(&header);
        let decoded = decode_response_header(encoded).unwrap();
        assert_eq!(decoded.result_type, WireResultType::Failure);
        assert_eq!(decoded.payload_encoding, "slice2");
    }

    #[test]
    fn initialize_fields_round_trip() {
        let mut fields = Fields::new();
        fields.insert(icerpc_core::FieldKey::MAX_HEADER_SIZE, Bytes::from_static(&[32]));
        let encoded = encode_initialize(&fields);
        let decoded = decode_initialize(encoded).unwrap();
        assert_eq!(decoded.get(&icerpc_core::FieldKey::MAX_HEADER_SIZE).unwrap().as_ref(), &[32]);
    }
}
