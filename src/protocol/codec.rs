//! Wire primitives and length-prefixed framing
//!
//! Every request and response is a 4-byte signed big-endian length followed
//! by that many payload bytes. Inside a frame, integers are big-endian
//! two's complement, strings are i16-length-prefixed UTF-8 (-1 encodes
//! null), arrays are i32-count-prefixed, and byte blocks are
//! i32-length-prefixed.
//!
//! ```text
//! +------------------+------------------+
//! | Length (4 bytes) | Payload          |
//! +------------------+------------------+
//! ```

use crate::error::{Result, VgError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size accepted off the wire (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Extract one complete frame from `src`, leaving partial bytes in place.
///
/// Returns `Ok(None)` until a full frame has arrived. Oversized frames are
/// a protocol error.
pub fn extract_frame(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let length = (&src[..4]).get_i32();
    if length < 0 || length as usize > MAX_FRAME_SIZE {
        return Err(VgError::Protocol(format!(
            "frame length {length} outside 0..={MAX_FRAME_SIZE}"
        )));
    }
    let total = 4 + length as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(length as usize)))
}

/// Request envelope header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn parse(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 8 {
            return Err(VgError::Protocol("request header too short".to_string()));
        }
        let api_key = buf.get_i16();
        let api_version = buf.get_i16();
        let correlation_id = buf.get_i32();
        let client_id = read_nullable_string(buf)?;
        Ok(Self {
            api_key,
            api_version,
            correlation_id,
            client_id,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i16(self.api_key);
        buf.put_i16(self.api_version);
        buf.put_i32(self.correlation_id);
        write_nullable_string(buf, self.client_id.as_deref());
    }
}

/// Wrap an encoded response body in its length prefix and envelope
pub fn frame_response(correlation_id: i32, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(8 + body.len());
    out.put_i32(4 + body.len() as i32);
    out.put_i32(correlation_id);
    out.put_slice(body);
    out
}

/// Wrap an encoded request body in its length prefix and envelope
pub fn frame_request(header: &RequestHeader, body: &[u8]) -> BytesMut {
    let mut envelope = BytesMut::new();
    header.encode(&mut envelope);
    let mut out = BytesMut::with_capacity(4 + envelope.len() + body.len());
    out.put_i32((envelope.len() + body.len()) as i32);
    out.put_slice(&envelope);
    out.put_slice(body);
    out
}

fn check_remaining(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(VgError::Protocol(format!(
            "truncated frame: {what} needs {needed} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn read_i16(buf: &mut impl Buf) -> Result<i16> {
    check_remaining(buf, 2, "i16")?;
    Ok(buf.get_i16())
}

pub fn read_i32(buf: &mut impl Buf) -> Result<i32> {
    check_remaining(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

pub fn read_i64(buf: &mut impl Buf) -> Result<i64> {
    check_remaining(buf, 8, "i64")?;
    Ok(buf.get_i64())
}

/// Read an i16-length-prefixed string; -1 is a protocol error here
pub fn read_string(buf: &mut impl Buf) -> Result<String> {
    read_nullable_string(buf)?
        .ok_or_else(|| VgError::Protocol("unexpected null string".to_string()))
}

/// Read an i16-length-prefixed string, -1 meaning null
pub fn read_nullable_string(buf: &mut impl Buf) -> Result<Option<String>> {
    let len = read_i16(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    check_remaining(buf, len, "string body")?;
    let raw = buf.copy_to_bytes(len);
    let s = std::str::from_utf8(&raw)
        .map_err(|_| VgError::Protocol("string is not UTF-8".to_string()))?;
    Ok(Some(s.to_string()))
}

pub fn write_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

pub fn write_nullable_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => write_string(buf, s),
        None => buf.put_i16(-1),
    }
}

/// Read an i32-length-prefixed byte block
pub fn read_bytes32(buf: &mut impl Buf) -> Result<Bytes> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Ok(Bytes::new());
    }
    let len = len as usize;
    check_remaining(buf, len, "byte block")?;
    Ok(buf.copy_to_bytes(len))
}

pub fn write_bytes32(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

/// Read an i32 array count, rejecting nonsense values
pub fn read_array_len(buf: &mut impl Buf) -> Result<usize> {
    let count = read_i32(buf)?;
    if count < 0 {
        return Ok(0);
    }
    if count as usize > buf.remaining() {
        return Err(VgError::Protocol(format!(
            "array count {count} exceeds frame size"
        )));
    }
    Ok(count as usize)
}
