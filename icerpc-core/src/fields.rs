//! Integer-keyed field maps: `dict<int32, bytes>` headers for context,
//! idempotency, deadline, compression, and max-header-size (spec §4, §6.2).

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

use crate::error::IceRpcError;
use crate::varint::{read_varuint, write_varuint};

/// Well-known field keys recognized by the core (spec §6.2). Unknown keys
/// are preserved and forwarded, never rejected (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldKey(pub i64);

impl FieldKey {
    /// The request's context map, encoded by the caller.
    pub const CONTEXT: FieldKey = FieldKey(0);
    /// Marks a request as idempotent.
    pub const IDEMPOTENT: FieldKey = FieldKey(1);
    /// The payload's compression format, if compressed.
    pub const COMPRESSION_FORMAT: FieldKey = FieldKey(2);
    /// Advertised during `icerpc` Initialize exchange (spec §4.3).
    pub const MAX_HEADER_SIZE: FieldKey = FieldKey(3);
}

/// An integer-keyed header side-channel: `dict<int32, bytes>`.
pub type Fields = BTreeMap<FieldKey, Bytes>;

/// Encodes and decodes [`Fields`] maps for both protocols' headers.
#[derive(Debug, Default, Clone, Copy)]
pub struct FieldsCodec;

impl FieldsCodec {
    /// Encodes `fields` as count + repeated (key, size, bytes).
    pub fn encode(&self, fields: &Fields) -> Bytes {
        let mut buf = BytesMut::new();
        write_varuint(&mut buf, fields.len() as u64);
        for (key, value) in fields {
            write_varuint(&mut buf, zigzag_encode(key.0));
            write_varuint(&mut buf, value.len() as u64);
            buf.extend_from_slice(value);
        }
        buf.freeze()
    }

    /// Decodes a field map previously produced by [`FieldsCodec::encode`].
    /// Unknown keys are preserved verbatim in the returned map (spec §4.3:
    /// "the receiver may not reject on unknown").
    pub fn decode(&self, mut bytes: Bytes) -> Result<Fields, IceRpcError> {
        let count = read_varuint(&mut bytes)?;
        let mut fields = Fields::new();
        for _ in 0..count {
            let key = FieldKey(zigzag_decode(read_varuint(&mut bytes)?));
            let len = read_varuint(&mut bytes)? as usize;
            if bytes.len() < len {
                return Err(IceRpcError::ProtocolFailure("truncated field value".into()));
            }
            let value = bytes.split_to(len);
            fields.insert(key, value);
        }
        Ok(fields)
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
