//! HTTP/2 frame wire format (RFC 9113 Section 4).
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Frames are kept as raw `(kind, flags, stream, payload)` tuples; the
//! connection's per-type handlers interpret the payloads. Splitting oversized
//! frames on the write side lives in the connection, next to the peer's
//! `max_frame_size`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ErrorCode;

/// Frame header size in bytes.
pub const FRAME_HEADER_LEN: usize = 9;

// Frame types (RFC 9113 Section 6). Types above CONTINUATION are ignored.
pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

// Flags.
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// A raw HTTP/2 frame. `payload` is the on-wire payload, padding included.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream: u32,
    pub payload: Bytes,
}

/// A decoded 9-byte frame header.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream: u32,
}

/// Peek at the frame header at the start of `buf`; `None` if under 9 bytes.
/// The reserved bit of the stream identifier is cleared.
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let length = (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]);
    let stream = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    Some(FrameHeader {
        length,
        kind: buf[3],
        flags: buf[4],
        stream,
    })
}

/// Append a 9-byte frame header.
pub(crate) fn put_header(out: &mut BytesMut, length: usize, kind: u8, flags: u8, stream: u32) {
    out.put_u8((length >> 16) as u8);
    out.put_u8((length >> 8) as u8);
    out.put_u8(length as u8);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(stream & 0x7fff_ffff);
}

/// Strip padding from a DATA/HEADERS/PUSH_PROMISE payload.
///
/// On violation, returns the GOAWAY code the connection should die with.
pub(crate) fn strip_padding(
    payload: Bytes,
    flags: u8,
) -> Result<Bytes, (ErrorCode, &'static str)> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err((ErrorCode::FrameSizeError, "no padding found"));
    }
    // The pad-length octet counts as padding too.
    let padding = payload[0] as usize + 1;
    if padding > payload.len() {
        return Err((ErrorCode::ProtocolError, "more padding than data"));
    }
    Ok(payload.slice(1..payload.len() - (padding - 1)))
}

pub(crate) fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}
