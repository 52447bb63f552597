//! HTTP/2 SETTINGS parameters (RFC 9113 Section 6.5).
//!
//! The six defined parameters map positionally to identifiers 1..6. A value
//! of [`UNLIMITED`] stands for "no limit" for the two parameters that allow
//! it; those are simply never emitted on the wire when unlimited.

use crate::error::ErrorCode;

/// Sentinel for "no limit" (`max_concurrent_streams`, `max_header_list_size`).
pub const UNLIMITED: u32 = u32::MAX;

// Parameter identifiers.
pub(crate) const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub(crate) const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

/// HTTP/2 SETTINGS, one field per defined parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1).
    pub header_table_size: u32,
    /// SETTINGS_ENABLE_PUSH (0x2). Must be 0 or 1.
    pub enable_push: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3).
    pub max_concurrent_streams: u32,
    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4). At most 2^31 - 1.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE (0x5). 16384 ..= 16777215.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6).
    pub max_header_list_size: u32,
}

impl Settings {
    /// Protocol defaults: what both sides assume before any SETTINGS frame.
    pub const STANDARD: Settings = Settings {
        header_table_size: 4096,
        enable_push: 1,
        max_concurrent_streams: UNLIMITED,
        initial_window_size: 65535,
        max_frame_size: 16384,
        max_header_list_size: UNLIMITED,
    };

    /// What the peer is assumed to want before its first SETTINGS arrives.
    pub const CONSERVATIVE: Settings = Settings {
        header_table_size: 4096,
        enable_push: 1,
        max_concurrent_streams: 100,
        initial_window_size: 65535,
        max_frame_size: 16384,
        max_header_list_size: UNLIMITED,
    };

    /// What this endpoint advertises in its first SETTINGS frame.
    pub const INITIAL: Settings = Settings {
        header_table_size: 4096,
        enable_push: 1,
        max_concurrent_streams: 1024,
        initial_window_size: 65535,
        max_frame_size: 16384,
        max_header_list_size: UNLIMITED,
    };

    /// The six values in identifier order (index 0 is parameter 0x1).
    pub(crate) fn as_array(&self) -> [u32; 6] {
        [
            self.header_table_size,
            self.enable_push,
            self.max_concurrent_streams,
            self.initial_window_size,
            self.max_frame_size,
            self.max_header_list_size,
        ]
    }

    /// Apply one wire parameter. Unknown identifiers are ignored, as the
    /// RFC requires; range checking happens separately in [`validate`].
    ///
    /// [`validate`]: Settings::validate
    pub(crate) fn apply(&mut self, id: u16, value: u32) {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => self.enable_push = value,
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = value,
            SETTINGS_INITIAL_WINDOW_SIZE => self.initial_window_size = value,
            SETTINGS_MAX_FRAME_SIZE => self.max_frame_size = value,
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = value,
            _ => {}
        }
    }

    /// Range-check the current values. On violation, returns the GOAWAY
    /// error code a receiver should use plus a description.
    pub(crate) fn validate(&self) -> Result<(), (ErrorCode, &'static str)> {
        if self.enable_push > 1 {
            return Err((ErrorCode::ProtocolError, "enable_push out of bounds"));
        }
        if self.initial_window_size > 0x7fff_ffff {
            return Err((ErrorCode::FlowControlError, "initial_window_size out of bounds"));
        }
        if !(16384..=16_777_215).contains(&self.max_frame_size) {
            return Err((ErrorCode::ProtocolError, "max_frame_size out of bounds"));
        }
        Ok(())
    }

    /// Encode the fields where `self` differs from `previous` as a SETTINGS
    /// payload (6-byte id/value entries, identifier order).
    pub(crate) fn encode_delta(&self, previous: &Settings, buf: &mut Vec<u8>) {
        let old = previous.as_array();
        let new = self.as_array();
        for i in 0..6 {
            if old[i] != new[i] {
                encode_entry(buf, (i + 1) as u16, new[i]);
            }
        }
    }
}

pub(crate) fn encode_entry(buf: &mut Vec<u8>, id: u16, value: u32) {
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&value.to_be_bytes());
}
