//! Record types and the record-frame wire/disk format
//!
//! A record is an opaque payload plus a one-byte attribute field; bits 0-2
//! of the attribute byte carry the producer-assigned compression flag. The
//! engine never interprets or re-encodes payloads.
//!
//! Records travel (and are stored) as frames, identical on the wire and on
//! disk:
//!
//! ```text
//! +-------------------+------------------+----------------------+
//! | offset: i64 (BE)  | length: i32 (BE) | body: length bytes   |
//! +-------------------+------------------+----------------------+
//! ```
//!
//! The body is the attribute byte followed by the payload, so
//! `length == 1 + payload.len()`. The offset is absolute and assigned by
//! the chain head at append time.

use crate::error::{Result, VgError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the frame header (offset + length)
pub const FRAME_HEADER_SIZE: usize = 12;

/// Compression flag mask within the attribute byte (bits 0-2)
pub const COMPRESSION_MASK: u8 = 0x07;

/// Largest body the frame decoder will accept; anything bigger is treated
/// as corruption during recovery scans.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

/// Compression flag carried in a record's attribute byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Lz4 = 3,
}

impl Compression {
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & COMPRESSION_MASK {
            1 => Compression::Gzip,
            2 => Compression::Snappy,
            3 => Compression::Lz4,
            _ => Compression::None,
        }
    }
}

/// A single record in a topic partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Absolute offset within the partition; assigned by the head at
    /// append time (-1 before assignment)
    pub offset: i64,

    /// Attribute byte; bits 0-2 are the compression flag
    pub attributes: u8,

    /// Opaque payload
    pub value: Bytes,
}

impl Record {
    /// Create an unassigned record (offset -1) with no compression
    pub fn new(value: Bytes) -> Self {
        Self {
            offset: -1,
            attributes: 0,
            value,
        }
    }

    /// Create an unassigned record carrying a compression flag
    pub fn with_compression(value: Bytes, compression: Compression) -> Self {
        Self {
            offset: -1,
            attributes: compression as u8,
            value,
        }
    }

    pub fn compression(&self) -> Compression {
        Compression::from_attributes(self.attributes)
    }

    /// Size of this record's frame on disk and on the wire
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + 1 + self.value.len()
    }

    /// Append this record's frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64(self.offset);
        buf.put_i32(1 + self.value.len() as i32);
        buf.put_u8(self.attributes);
        buf.put_slice(&self.value);
    }
}

/// Encode a slice of records as one contiguous frame sequence
pub fn encode_records(records: &[Record]) -> BytesMut {
    let total: usize = records.iter().map(|r| r.frame_len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for record in records {
        record.encode(&mut buf);
    }
    buf
}

/// Total encoded size of a slice of records
pub fn encoded_len(records: &[Record]) -> usize {
    records.iter().map(|r| r.frame_len()).sum()
}

/// Decode as many complete frames as `data` contains.
///
/// A trailing partial frame is not an error: fetch responses bounded by
/// `max_bytes` may cut the final frame mid-body, and the consumer drops it.
/// A frame with an insane length is an error; that only happens on
/// corruption, never on a clean byte-range cut taken from a frame start.
pub fn decode_records(data: &[u8]) -> Result<Vec<Record>> {
    let mut buf = data;
    let mut records = Vec::new();
    while buf.remaining() >= FRAME_HEADER_SIZE {
        let offset = (&buf[0..8]).get_i64();
        let length = (&buf[8..12]).get_i32();
        if length < 1 || length as usize > MAX_FRAME_BODY {
            return Err(VgError::Corrupt(format!(
                "record frame at offset {offset} has length {length}"
            )));
        }
        let length = length as usize;
        if buf.remaining() < FRAME_HEADER_SIZE + length {
            break;
        }
        buf.advance(FRAME_HEADER_SIZE);
        let attributes = buf.get_u8();
        let value = Bytes::copy_from_slice(&buf[..length - 1]);
        buf.advance(length - 1);
        records.push(Record {
            offset,
            attributes,
            value,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(offset: i64, value: &str) -> Record {
        Record {
            offset,
            attributes: 0,
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let records = vec![record(5, "hello"), record(6, "world")];
        let encoded = encode_records(&records);
        assert_eq!(encoded.len(), encoded_len(&records));

        let decoded = decode_records(&encoded).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_frame_len() {
        let r = record(0, "123456789abcdef");
        // 12-byte header + attribute byte + 15 payload bytes
        assert_eq!(r.frame_len(), 28);
    }

    #[test]
    fn test_partial_trailing_frame_is_dropped() {
        let records = vec![record(0, "first"), record(1, "second")];
        let encoded = encode_records(&records);

        // Cut mid-way through the second frame's body
        let cut = &encoded[..encoded.len() - 3];
        let decoded = decode_records(cut).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], records[0]);
    }

    #[test]
    fn test_insane_length_is_corruption() {
        let mut buf = BytesMut::new();
        buf.put_i64(0);
        buf.put_i32(-5);
        buf.put_slice(b"junk");
        assert!(decode_records(&buf).is_err());
    }

    #[test]
    fn test_compression_flag() {
        let r = Record::with_compression(Bytes::from_static(b"x"), Compression::Lz4);
        assert_eq!(r.compression(), Compression::Lz4);
        assert_eq!(r.attributes & COMPRESSION_MASK, 3);

        // Bits above the mask do not disturb the flag
        let mut r = record(0, "x");
        r.attributes = 0x08 | 2;
        assert_eq!(r.compression(), Compression::Snappy);
    }
}
