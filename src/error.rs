//! Error types for the protocol engine.
//!
//! `Error` tags every failure with a kind that tells the caller whose fault
//! it is and whether the connection survives: `Assertion`, `InvalidStream`
//! and `WouldBlock` are local and recoverable, `Transport` and `Disconnect`
//! mean the connection is done.

use thiserror::Error;

/// HTTP/2 error codes (RFC 9113 Section 7), used in RST_STREAM and GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }
}

/// Errors produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The caller violated an API contract (e.g. sent a 1xx response with
    /// `fin`, or pinged an HTTP/1.x peer).
    #[error("api misuse: {0}")]
    Assertion(&'static str),

    /// The stream id passed to a write call is unusable: wrong parity,
    /// nonexistent, or not writable in its current state.
    #[error("invalid stream: {0}")]
    InvalidStream(&'static str),

    /// A resource is temporarily exhausted; retry after the relevant event
    /// (stream concurrency cap, or an HTTP/1.x exchange still in flight).
    #[error("would block: {0}")]
    WouldBlock(&'static str),

    /// The peer violated the protocol. A GOAWAY has been queued where
    /// feasible; tear the transport down after flushing pending sends.
    #[error("transport error: {0}")]
    Transport(&'static str),

    /// The peer ended the connection cleanly, or asked us to.
    #[error("disconnected")]
    Disconnect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_round_trip() {
        for v in 0x0..=0xd {
            assert_eq!(ErrorCode::from_u32(v) as u32, v);
        }
    }

    #[test]
    fn unknown_error_code_maps_to_internal() {
        assert_eq!(ErrorCode::from_u32(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::Transport("bad SETTINGS");
        assert_eq!(e.to_string(), "transport error: bad SETTINGS");
    }
}
