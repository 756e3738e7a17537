//! Frame layout and the compact length prefix.
//!
//! ```text
//! +----------------+-------------------------------+-----------------+
//! | length prefix  | header map                    | body            |
//! | 1/2/3/5 bytes  | {code, sync, [replica, lsn]}  | command-defined |
//! +----------------+-------------------------------+-----------------+
//! ```
//!
//! The prefix is a msgpack unsigned integer counting header and body bytes.
//! Its first byte selects the width: a positive fixint is the value itself,
//! `0xcc`, `0xcd` and `0xce` are followed by 1, 2 and 4 big-endian bytes.

use crate::error::ProtocolError;
use crate::keys::{code, header};
use crate::query::Query;
use crate::value;
use crate::MAX_FRAME_SIZE;
use bytes::{BufMut, BytesMut};
use rmp::encode;
use rmpv::Value;
use std::io::Cursor;

const MARKER_U8: u8 = 0xcc;
const MARKER_U16: u8 = 0xcd;
const MARKER_U32: u8 = 0xce;

/// Width of the length prefix written by this implementation.
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Returns the total width of a length prefix starting with `marker`.
pub fn prefix_width(marker: u8) -> Result<usize, ProtocolError> {
    match marker {
        0x00..=0x7f => Ok(1),
        MARKER_U8 => Ok(2),
        MARKER_U16 => Ok(3),
        MARKER_U32 => Ok(5),
        other => Err(ProtocolError::InvalidLengthPrefix(other)),
    }
}

/// Decodes a complete length prefix (as sized by [`prefix_width`]).
pub fn decode_length(prefix: &[u8]) -> Result<u32, ProtocolError> {
    let marker = *prefix.first().ok_or(ProtocolError::InvalidLengthPrefix(0))?;
    let width = prefix_width(marker)?;
    if prefix.len() != width {
        return Err(ProtocolError::InvalidLengthPrefix(marker));
    }
    Ok(match width {
        1 => u32::from(marker),
        2 => u32::from(prefix[1]),
        3 => u32::from(u16::from_be_bytes([prefix[1], prefix[2]])),
        _ => u32::from_be_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]),
    })
}

/// Writes `len` as a fixed-width (5 byte) length prefix.
pub fn put_length(buf: &mut BytesMut, len: u32) {
    buf.put_u8(MARKER_U32);
    buf.put_u32(len);
}

fn encode_error(e: encode::ValueWriteError) -> ProtocolError {
    ProtocolError::Io(e.into())
}

/// Frame header fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    /// Request type, or response status (`OK` / error flag | errcode).
    pub code: u32,
    /// Correlation id linking a response to its request.
    pub sync: u32,
    /// Originating instance of a replicated row.
    pub replica_id: Option<u32>,
    /// Log sequence number of a replicated row.
    pub lsn: Option<u64>,
    /// Row timestamp (seconds since the epoch).
    pub timestamp: Option<f64>,
    pub schema_version: Option<u64>,
}

impl Header {
    pub fn new(code: u32, sync: u32) -> Self {
        Self {
            code,
            sync,
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        code::is_error(self.code)
    }

    /// Returns the server error code if this is an error response.
    pub fn error_code(&self) -> Option<u32> {
        self.is_error().then_some(self.code & code::ERROR_CODE_MASK)
    }

    /// Number of entries in the encoded header map.
    fn field_count(&self) -> u32 {
        2 + u32::from(self.replica_id.is_some())
            + u32::from(self.lsn.is_some())
            + u32::from(self.timestamp.is_some())
            + u32::from(self.schema_version.is_some())
    }

    /// Encodes the header map straight into `out`.
    fn encode_into(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut wr = out.writer();
        encode::write_map_len(&mut wr, self.field_count()).map_err(encode_error)?;
        let mut uint = |key: u64, val: u64| -> Result<(), ProtocolError> {
            encode::write_uint(&mut wr, key).map_err(encode_error)?;
            encode::write_uint(&mut wr, val).map_err(encode_error)?;
            Ok(())
        };
        uint(header::REQUEST_TYPE, u64::from(self.code))?;
        uint(header::SYNC, u64::from(self.sync))?;
        if let Some(replica_id) = self.replica_id {
            uint(header::REPLICA_ID, u64::from(replica_id))?;
        }
        if let Some(lsn) = self.lsn {
            uint(header::LSN, lsn)?;
        }
        if let Some(schema_version) = self.schema_version {
            uint(header::SCHEMA_VERSION, schema_version)?;
        }
        if let Some(timestamp) = self.timestamp {
            encode::write_uint(&mut wr, header::TIMESTAMP).map_err(encode_error)?;
            encode::write_f64(&mut wr, timestamp).map_err(encode_error)?;
        }
        Ok(())
    }

    fn from_map(map: &[(Value, Value)]) -> Result<Self, ProtocolError> {
        let code = value::get_u32(map, header::REQUEST_TYPE)
            .map_err(|_| ProtocolError::MalformedHeader("missing or invalid request type"))?;
        let sync = value::opt_u64(map, header::SYNC)?.unwrap_or(0);
        let sync =
            u32::try_from(sync).map_err(|_| ProtocolError::MalformedHeader("sync out of range"))?;
        Ok(Self {
            code,
            sync,
            replica_id: value::opt_u32(map, header::REPLICA_ID)?,
            lsn: value::opt_u64(map, header::LSN)?,
            timestamp: value::opt_f64(map, header::TIMESTAMP)?,
            schema_version: value::opt_u64(map, header::SCHEMA_VERSION)?,
        })
    }
}

/// A single protocol message.
///
/// A frame owns one growable buffer that holds the encoded header and body
/// after a read, or just the encoded body before a write. Frames are recycled
/// through [`crate::FramePool`]; since release takes the frame by value, a
/// released frame can no longer be touched by its former holder.
#[derive(Debug, Default)]
pub struct Frame {
    pub header: Header,
    buf: BytesMut,
    body_start: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty frame with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            header: Header::default(),
            buf: BytesMut::with_capacity(capacity),
            body_start: 0,
        }
    }

    /// Builds a request frame for `query`.
    pub fn from_query(sync: u32, query: &Query) -> Result<Self, ProtocolError> {
        let mut frame = Self::new();
        frame.encode_query(sync, query)?;
        Ok(frame)
    }

    /// Clears header and contents while keeping the allocation.
    pub fn reset(&mut self) {
        self.header = Header::default();
        self.buf.clear();
        self.body_start = 0;
    }

    /// Replaces the contents with the encoding of `query`.
    pub fn encode_query(&mut self, sync: u32, query: &Query) -> Result<(), ProtocolError> {
        self.reset();
        self.header = Header::new(query.code(), sync);
        let mut writer = (&mut self.buf).writer();
        query.encode_body(&mut writer)
    }

    /// Replaces the body with a pre-encoded value.
    pub fn set_body_value(&mut self, body: &Value) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.body_start = 0;
        let mut writer = (&mut self.buf).writer();
        value::encode_value(&mut writer, body)
    }

    /// Returns the encoded body.
    pub fn body(&self) -> &[u8] {
        &self.buf[self.body_start..]
    }

    /// Decodes the body as an integer-keyed map.
    pub fn body_map(&self) -> Result<value::Map, ProtocolError> {
        value::decode_map(self.body())
    }

    /// Returns the allocated buffer size.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Encodes the whole frame (prefix, header, body) into `out`.
    ///
    /// The prefix is reserved first and patched once the header has been
    /// encoded in place. On error `out` is left as it was.
    pub fn write_to(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = out.len();
        out.reserve(LENGTH_PREFIX_SIZE + 32 + self.body().len());
        put_length(out, 0);
        if let Err(e) = self.header.encode_into(out) {
            out.truncate(start);
            return Err(e);
        }
        out.put_slice(self.body());

        let total = out.len() - start - LENGTH_PREFIX_SIZE;
        let total = match u32::try_from(total).ok().filter(|len| *len <= MAX_FRAME_SIZE) {
            Some(total) => total,
            None => {
                out.truncate(start);
                return Err(ProtocolError::FrameTooLarge {
                    size: u32::try_from(total).unwrap_or(u32::MAX),
                    max: MAX_FRAME_SIZE,
                });
            }
        };
        out[start + 1..start + LENGTH_PREFIX_SIZE].copy_from_slice(&total.to_be_bytes());
        Ok(())
    }

    /// Returns the whole encoded frame as a byte vector.
    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = BytesMut::new();
        self.write_to(&mut out)?;
        Ok(out.to_vec())
    }

    /// Prepares the buffer to receive exactly `len` bytes, growing it by at
    /// least half its current capacity when undersized.
    pub(crate) fn fill_slot(&mut self, len: usize) -> &mut [u8] {
        self.buf.clear();
        self.body_start = 0;
        let capacity = self.buf.capacity();
        if capacity < len {
            self.buf.reserve(len.max(capacity + capacity / 2));
        }
        self.buf.resize(len, 0);
        &mut self.buf[..]
    }

    /// Decodes the header from the front of a freshly filled buffer.
    pub(crate) fn parse_header(&mut self) -> Result<(), ProtocolError> {
        let mut cursor = Cursor::new(&self.buf[..]);
        let map = match rmpv::decode::read_value(&mut cursor)? {
            Value::Map(map) => map,
            _ => return Err(ProtocolError::MalformedHeader("header is not a map")),
        };
        self.header = Header::from_map(&map)?;
        self.body_start = cursor.position() as usize;
        Ok(())
    }

    /// Decodes a complete frame from `src` (without the length prefix).
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let mut frame = Self::with_capacity(src.len());
        frame.fill_slot(src.len()).copy_from_slice(src);
        frame.parse_header()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::map_value;
    use proptest::prelude::*;

    #[test]
    fn test_prefix_widths() {
        assert_eq!(prefix_width(0x00).unwrap(), 1);
        assert_eq!(prefix_width(0x7f).unwrap(), 1);
        assert_eq!(prefix_width(0xcc).unwrap(), 2);
        assert_eq!(prefix_width(0xcd).unwrap(), 3);
        assert_eq!(prefix_width(0xce).unwrap(), 5);
        assert!(matches!(
            prefix_width(0xcf),
            Err(ProtocolError::InvalidLengthPrefix(0xcf))
        ));
        assert!(matches!(
            prefix_width(0x90),
            Err(ProtocolError::InvalidLengthPrefix(0x90))
        ));
    }

    #[test]
    fn test_decode_each_prefix_form() {
        assert_eq!(decode_length(&[0x05]).unwrap(), 5);
        assert_eq!(decode_length(&[0xcc, 0xc8]).unwrap(), 200);
        assert_eq!(decode_length(&[0xcd, 0x01, 0x00]).unwrap(), 256);
        assert_eq!(decode_length(&[0xce, 0x00, 0x01, 0x00, 0x00]).unwrap(), 65536);
        assert!(decode_length(&[0xcd, 0x01]).is_err());
    }

    proptest! {
        #[test]
        fn prop_fixed_prefix_roundtrip(len in any::<u32>()) {
            let mut buf = BytesMut::new();
            put_length(&mut buf, len);
            prop_assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);
            prop_assert_eq!(prefix_width(buf[0]).unwrap(), LENGTH_PREFIX_SIZE);
            prop_assert_eq!(decode_length(&buf).unwrap(), len);
        }
    }

    #[test]
    fn test_frame_roundtrip_with_replication_header() {
        let mut frame = Frame::from_query(
            0,
            &Query::Insert {
                space: 512,
                tuple: vec![Value::from(1u64), Value::from("a")],
            },
        )
        .unwrap();
        frame.header.replica_id = Some(2);
        frame.header.lsn = Some(42);
        frame.header.timestamp = Some(1_700_000_000.5);

        let mut out = BytesMut::new();
        frame.write_to(&mut out).unwrap();
        let len = decode_length(&out[..LENGTH_PREFIX_SIZE]).unwrap() as usize;
        assert_eq!(len, out.len() - LENGTH_PREFIX_SIZE);

        let decoded = Frame::decode(&out[LENGTH_PREFIX_SIZE..]).unwrap();
        assert_eq!(decoded.header, frame.header);
        assert_eq!(decoded.body(), frame.body());
    }

    #[test]
    fn test_header_encoding_matches_value_encoding() {
        let header = Header {
            code: code::OK,
            sync: 77,
            replica_id: Some(3),
            lsn: Some(1 << 40),
            timestamp: Some(12.25),
            schema_version: Some(80),
        };
        let expected = map_value(vec![
            (header::REQUEST_TYPE, Value::from(code::OK)),
            (header::SYNC, Value::from(77u32)),
            (header::REPLICA_ID, Value::from(3u32)),
            (header::LSN, Value::from(1u64 << 40)),
            (header::SCHEMA_VERSION, Value::from(80u64)),
            (header::TIMESTAMP, Value::from(12.25f64)),
        ]);
        let mut head = Vec::new();
        value::encode_value(&mut head, &expected).unwrap();

        let mut frame = Frame::new();
        frame.header = header.clone();
        let mut out = BytesMut::from(&b"xy"[..]);
        frame.write_to(&mut out).unwrap();

        assert_eq!(&out[..2], b"xy");
        assert_eq!(decode_length(&out[2..2 + LENGTH_PREFIX_SIZE]).unwrap() as usize, head.len());
        assert_eq!(&out[2 + LENGTH_PREFIX_SIZE..], &head[..]);
        assert_eq!(Frame::decode(&out[2 + LENGTH_PREFIX_SIZE..]).unwrap().header, header);
    }

    #[test]
    fn test_error_header() {
        let header = Header::new(code::ERROR_FLAG | 3, 9);
        assert!(header.is_error());
        assert_eq!(header.error_code(), Some(3));
        assert_eq!(Header::new(code::OK, 9).error_code(), None);
    }

    #[test]
    fn test_empty_and_malformed_frames() {
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::EmptyFrame)));

        // A header that is a positive fixint rather than a map.
        assert!(matches!(
            Frame::decode(&[0x01]),
            Err(ProtocolError::MalformedHeader(_))
        ));

        // A map without a request type.
        let mut head = Vec::new();
        value::encode_value(&mut head, &map_value(vec![(header::SYNC, Value::from(1u64))]))
            .unwrap();
        assert!(matches!(
            Frame::decode(&head),
            Err(ProtocolError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_fill_slot_grows_geometrically() {
        let mut frame = Frame::with_capacity(100);
        frame.fill_slot(101);
        assert!(frame.capacity() >= 150);

        let before = frame.capacity();
        frame.fill_slot(10);
        assert_eq!(frame.capacity(), before);
    }
}
