//! The dual-mode connection state machine.
//!
//! A [`Connection`] is a pure sans-IO engine for one transport connection.
//! Feed inbound bytes with [`recv`], pull outbound wire bytes with
//! [`take_pending_send`], and drain decoded protocol activity with
//! [`poll_event`]. It speaks HTTP/1.0, HTTP/1.1 and HTTP/2 from either role,
//! including h2c upgrade and prior-knowledge negotiation, and owns no
//! sockets, threads or timers.
//!
//! When a call returns [`Error::Transport`] or [`Error::Disconnect`], flush
//! any pending send bytes (a GOAWAY may be queued there) and drop the
//! transport.
//!
//! [`recv`]: Connection::recv
//! [`take_pending_send`]: Connection::take_pending_send
//! [`poll_event`]: Connection::poll_event

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::buffer::Accumulator;
use crate::error::{Error, ErrorCode};
use crate::frame::{
    self, Frame, FLAG_ACK, FLAG_END_HEADERS, FLAG_END_STREAM, FLAG_PADDED, FLAG_PRIORITY,
    FRAME_CONTINUATION, FRAME_DATA, FRAME_GOAWAY, FRAME_HEADERS, FRAME_HEADER_LEN, FRAME_PING,
    FRAME_PRIORITY, FRAME_PUSH_PROMISE, FRAME_RST_STREAM, FRAME_SETTINGS, FRAME_WINDOW_UPDATE,
};
use crate::h1::{self, H1Parse};
use crate::hpack::{Decoder, Encoder};
use crate::message::{self, BlockKind, Header, Message, MAX_HEADERS};
use crate::metrics;
use crate::settings::Settings;
use crate::stream::{
    StreamMap, ACCEPT_DATA, ACCEPT_HEADERS, ACCEPT_INBOUND, ACCEPT_NOP_HEADERS, ACCEPT_OUTBOUND,
    ACCEPT_PUSH, ACCEPT_TRAILERS, ACCEPT_WRITE_DATA, ACCEPT_WRITE_HEADERS, ACCEPT_WRITE_PUSH,
};

/// The 24 bytes a client sends to open an HTTP/2 connection (RFC 9113
/// Section 3.4).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// How many CONTINUATION frames may follow a HEADERS/PUSH_PROMISE before the
/// sequence is cut off with ENHANCE_YOUR_CALM.
pub const MAX_CONTINUATIONS: usize = 3;

/// Longest single head line or header line emitted in HTTP/1.x mode.
pub const MAX_HTTP1_HEADER_SIZE: usize = 2048;

/// Which end of the connection this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Negotiated HTTP major version for [`Connection::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http1,
    Http2,
}

// Indices into per-side arrays (settings, stream counters).
const REMOTE: usize = 0;
const LOCAL: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not started, or the transport is gone.
    Undefined,
    /// Negotiated HTTP/2; the local preface and SETTINGS are still owed.
    Init,
    /// Local preface sent; a server still has to read the client's.
    Preface,
    /// Preface done; the first inbound frame must be SETTINGS.
    ReadyNoSettings,
    /// Normal HTTP/2 operation.
    Ready,
    /// HTTP/1.x, between messages.
    Http1Ready,
    /// HTTP/1.x, reading a message body.
    Http1Reading,
    /// Sent `101` switching to h2c; the rest of the request body is still
    /// HTTP/1.x, everything after it is HTTP/2 frames.
    Http1ReadingUpgrade,
    /// The peer offered an upgrade to a protocol we do not handle ourselves;
    /// the application decides via [`Event::UpgradeOffered`].
    UnknownProtocolUpgrade,
    /// The application answered 101; bytes flow opaquely through stream 1.
    UnknownProtocol,
}

/// Decoded protocol activity, in the exact order it happened.
#[derive(Debug)]
pub enum Event {
    /// A stream came into existence.
    StreamStart { stream: u32 },
    /// A stream was released; its id is dead.
    StreamEnd { stream: u32 },
    /// A complete request or response head arrived.
    MessageStart { stream: u32, message: Message },
    /// A chunk of message body.
    MessageData { stream: u32, data: Bytes },
    /// Trailing headers; the message ends right after.
    MessageTrail { stream: u32, trailers: Vec<Header> },
    /// The inbound half of the message is complete.
    MessageEnd { stream: u32 },
    /// The peer promised a pushed request on `promised`, parented to
    /// `stream`. Delivered before any event of the promised stream.
    MessagePush {
        stream: u32,
        message: Message,
        promised: u32,
    },
    /// An inbound frame, before its handler ran.
    FrameReceived(Frame),
    /// An outbound frame was serialized into the send buffer.
    FrameSent {
        kind: u8,
        flags: u8,
        stream: u32,
        length: u32,
    },
    /// The peer's SETTINGS were applied (and acknowledged).
    SettingsChanged,
    /// A WINDOW_UPDATE for `stream` (0 = the connection) was applied;
    /// blocked writers may retry.
    FlowIncrease { stream: u32 },
    /// The peer answered a ping.
    Pong([u8; 8]),
    /// The peer asked to switch protocols. Answer with a 101 response via
    /// `send_message` before the next `recv`, or ignore it to keep reading
    /// the message as plain HTTP/1.x.
    UpgradeOffered,
}

/// A sans-IO HTTP/1.x + HTTP/2 connection for one transport.
pub struct Connection {
    role: Role,
    state: State,
    buffer: Accumulator,
    send_buf: BytesMut,
    events: VecDeque<Event>,

    /// `[REMOTE]` is what the peer declared (assumed conservative until its
    /// first SETTINGS), `[LOCAL]` what we advertise.
    settings: [Settings; 2],
    encoder: Encoder,
    decoder: Decoder,
    streams: StreamMap,

    /// Connection-level flow control, signed: SETTINGS shrinks can drive
    /// windows negative.
    window_send: i32,
    window_recv: i32,

    /// Highest remote stream id at the moment we first sent GOAWAY; inbound
    /// frames on higher streams are dropped afterwards.
    goaway_sent: Option<u32>,

    /// HTTP/1.x body accounting: 0 none, `u32::MAX` chunked, else the
    /// remaining content-length.
    http1_remaining: u32,

    /// In-flight HEADERS/PUSH_PROMISE + CONTINUATION concatenation.
    continued: Vec<u8>,
    continued_stream: u32,
    continued_promise: u32,
    continued_flags: u8,

    manual_stream_flow: bool,
    disallow_h2_upgrade: bool,
    disallow_h2_prior_knowledge: bool,
    accept_upgrades: bool,
    writing_chunked: bool,
    upgrade_offered: bool,
}

impl Connection {
    pub fn new(role: Role) -> Connection {
        Connection {
            role,
            state: State::Undefined,
            buffer: Accumulator::new(),
            send_buf: BytesMut::new(),
            events: VecDeque::new(),
            settings: [Settings::CONSERVATIVE, Settings::INITIAL],
            encoder: Encoder::new(Settings::STANDARD.header_table_size as usize),
            decoder: Decoder::new(Settings::INITIAL.header_table_size as usize),
            streams: StreamMap::new(role == Role::Client),
            window_send: Settings::STANDARD.initial_window_size as i32,
            window_recv: Settings::STANDARD.initial_window_size as i32,
            goaway_sent: None,
            http1_remaining: 0,
            continued: Vec::new(),
            continued_stream: 0,
            continued_promise: 0,
            continued_flags: 0,
            manual_stream_flow: false,
            disallow_h2_upgrade: false,
            disallow_h2_prior_knowledge: false,
            accept_upgrades: false,
            writing_chunked: false,
            upgrade_offered: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Stream-level WINDOW_UPDATEs are no longer sent automatically; the
    /// application acknowledges consumed data via [`increase_window`].
    ///
    /// [`increase_window`]: Connection::increase_window
    pub fn set_manual_stream_flow(&mut self, on: bool) {
        self.manual_stream_flow = on;
    }

    /// Refuse `upgrade: h2c` offers (server only).
    pub fn set_disallow_h2_upgrade(&mut self, on: bool) {
        self.disallow_h2_upgrade = on;
    }

    /// Refuse prior-knowledge HTTP/2 prefaces on an HTTP/1.x port.
    pub fn set_disallow_h2_prior_knowledge(&mut self, on: bool) {
        self.disallow_h2_prior_knowledge = on;
    }

    /// Surface [`Event::UpgradeOffered`] for upgrades to protocols other
    /// than h2c instead of ignoring them.
    pub fn set_accept_protocol_upgrades(&mut self, on: bool) {
        self.accept_upgrades = on;
    }

    /// Update the locally advertised configuration. In HTTP/2 mode the
    /// changed fields are sent to the peer as a SETTINGS frame.
    pub fn set_config(&mut self, settings: &Settings) -> Result<(), Error> {
        if settings.enable_push > 1 {
            return Err(Error::Assertion("enable_push must be 0 or 1"));
        }
        if !(16384..=16_777_215).contains(&settings.max_frame_size) {
            return Err(Error::Assertion("max_frame_size out of bounds (2^14..2^24-1)"));
        }
        // In INIT the full SETTINGS frame has not gone out yet and will pick
        // up these values by itself.
        if self.state != State::Init && self.is_http2() {
            self.write_settings_delta(self.settings[LOCAL], *settings)?;
        }
        self.settings[LOCAL] = *settings;
        self.decoder.set_limit_upper(settings.header_table_size as usize);
        Ok(())
    }

    /// Tell the engine the transport is up and which protocol was
    /// negotiated (e.g. via ALPN). Call exactly once.
    pub fn start(&mut self, version: Version) -> Result<(), Error> {
        if self.state != State::Undefined {
            return Err(Error::Assertion("connection already started"));
        }
        self.state = match version {
            Version::Http2 => State::Init,
            Version::Http1 => State::Http1Ready,
        };
        self.proceed()
    }

    /// Feed bytes read from the transport. Chunking is arbitrary.
    pub fn recv(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == State::Undefined {
            return Err(Error::Disconnect);
        }
        self.buffer.append(data);
        self.proceed()
    }

    /// Tell the engine the transport is gone (EOF or error).
    ///
    /// In HTTP/1.x mode the local half may still be written afterwards: the
    /// peer can half-close after finishing its message.
    pub fn lost(&mut self) -> Result<(), Error> {
        if !self.is_http2() {
            if let Some(accept) = self.streams.find(1).map(|s| s.accept) {
                if self.state == State::UnknownProtocol {
                    self.events.push_back(Event::MessageEnd { stream: 1 });
                } else if accept & ACCEPT_DATA != 0 {
                    return Err(Error::Transport("unclean HTTP/1.x termination"));
                }
                let mut empty = false;
                if let Some(stream) = self.streams.find_mut(1) {
                    stream.accept &= !(ACCEPT_INBOUND | ACCEPT_PUSH);
                    empty = stream.accept == 0;
                }
                if empty {
                    self.stream_destroy(1);
                }
            }
            return Ok(());
        }

        self.state = State::Undefined;
        for id in self.streams.ids() {
            self.stream_destroy(id);
        }
        self.buffer.reset();
        self.continued.clear();
        self.encoder.clear();
        self.decoder.clear();
        Ok(())
    }

    /// Ask the peer to wind the connection down: GOAWAY(NO_ERROR) in HTTP/2
    /// mode, a no-op in HTTP/1.x.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.send_reset(0, ErrorCode::NoError)
    }

    /// Next event, if any. Events come out in protocol order.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Take all bytes owed to the transport, in wire order.
    pub fn take_pending_send(&mut self) -> Bytes {
        self.send_buf.split().freeze()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.send_buf.is_empty()
    }

    /// Whether the connection currently speaks HTTP/2 framing.
    pub fn is_http2(&self) -> bool {
        matches!(
            self.state,
            State::Init
                | State::Preface
                | State::ReadyNoSettings
                | State::Ready
                | State::Http1ReadingUpgrade
        )
    }

    /// The id `send_message` should use for a fresh locally-initiated
    /// stream. Always 1 in HTTP/1.x mode.
    pub fn next_stream_id(&self) -> u32 {
        if !self.is_http2() {
            return 1;
        }
        let last = self.streams.last_id[LOCAL];
        if self.role == Role::Client && last == 0 {
            1
        } else {
            last.saturating_add(2)
        }
    }

    // -- Write-side API --

    /// Send a request (client) or response (server) head on `stream`.
    ///
    /// A client may pass a fresh id (see [`next_stream_id`]) to open the
    /// stream. `fin` ends the local half; informational responses
    /// (1xx) may not set it.
    ///
    /// [`next_stream_id`]: Connection::next_stream_id
    pub fn send_message(&mut self, stream: u32, message: &Message, fin: bool) -> Result<(), Error> {
        if self.state == State::Undefined {
            return Err(Error::Disconnect);
        }
        let mut informational = (100..200).contains(&message.code);
        if informational && fin {
            return Err(Error::Assertion("informational messages cannot end the stream"));
        }

        if self.role == Role::Client && self.streams.find(stream).is_none() {
            self.stream_open(stream, true)?;
            if let Some(s) = self.streams.find_mut(stream) {
                s.accept = ACCEPT_HEADERS | ACCEPT_PUSH | ACCEPT_WRITE_HEADERS;
            }
        }
        let accept = self.streams.find(stream).map_or(0, |s| s.accept);
        if accept & ACCEPT_WRITE_HEADERS == 0 {
            return Err(if self.role == Role::Client && !self.is_http2() {
                Error::WouldBlock("an HTTP/1.x exchange is already in progress")
            } else {
                Error::InvalidStream("stream is not writable")
            });
        }

        if self.is_http2() {
            let mut block = Vec::new();
            if self.role == Role::Client {
                let pseudo = [
                    Header::new(":method", message.method.clone()),
                    Header::new(":path", message.path.clone()),
                ];
                self.encoder.encode(&pseudo, &mut block);
            } else {
                let status = [Header::new(":status", message.code.to_string())];
                self.encoder.encode(&status, &mut block);
            }
            self.encoder.encode(&message.headers, &mut block);

            let mut flags = FLAG_END_HEADERS;
            if fin {
                flags |= FLAG_END_STREAM;
            }
            self.write_frame(FRAME_HEADERS, flags, stream, &block)?;
        } else {
            self.write_h1_head(message, informational, fin)?;
            if message.code == 101 && self.state == State::UnknownProtocolUpgrade {
                self.state = State::UnknownProtocol;
                self.upgrade_offered = false;
                informational = false;
            }
        }

        if fin {
            return self.discard_remaining_payload(stream);
        }
        if !informational {
            if let Some(s) = self.streams.find_mut(stream) {
                s.accept &= !ACCEPT_WRITE_HEADERS;
                s.accept |= ACCEPT_WRITE_DATA;
            }
        }
        Ok(())
    }

    /// Send body bytes on `stream`. Returns how many bytes were actually
    /// consumed: in HTTP/2 mode the write is clamped to the connection and
    /// stream send windows, and `fin` only takes effect when nothing was
    /// cut off. A return of 0 means "wait for [`Event::FlowIncrease`]".
    pub fn send_data(&mut self, stream: u32, data: &[u8], fin: bool) -> Result<usize, Error> {
        if self.state == State::Undefined {
            return Err(Error::Disconnect);
        }
        let accept = match self.streams.find(stream) {
            Some(s) => s.accept,
            None => return Err(Error::InvalidStream("stream does not exist")),
        };
        if accept & ACCEPT_WRITE_DATA == 0 {
            return Err(Error::InvalidStream("stream is not writable"));
        }

        if self.state == State::UnknownProtocol {
            self.send_buf.extend_from_slice(data);
            if fin {
                let mut empty = false;
                if let Some(s) = self.streams.find_mut(stream) {
                    s.accept &= !ACCEPT_WRITE_DATA;
                    empty = s.accept == 0;
                }
                if empty {
                    self.stream_destroy(stream);
                }
                // The switched protocol has no framing; only closing the
                // transport can signal the end.
                return Err(Error::Disconnect);
            }
            return Ok(data.len());
        }

        if !self.is_http2() {
            let chunked = self.writing_chunked;
            if !data.is_empty() {
                if chunked {
                    self.send_buf
                        .extend_from_slice(format!("{:X}\r\n", data.len()).as_bytes());
                }
                self.send_buf.extend_from_slice(data);
                if chunked {
                    self.send_buf.extend_from_slice(b"\r\n");
                }
            }
            if fin && chunked {
                self.send_buf.extend_from_slice(b"0\r\n\r\n");
            }
            if fin {
                self.discard_remaining_payload(stream)?;
            }
            return Ok(data.len());
        }

        let stream_window = self.streams.find(stream).map_or(0, |s| s.window_send);
        if self.window_send < 0 || stream_window < 0 {
            return Ok(0);
        }
        let mut len = data.len();
        let mut fin = fin;
        if len > self.window_send as usize {
            len = self.window_send as usize;
            fin = false;
        }
        if len > stream_window as usize {
            len = stream_window as usize;
            fin = false;
        }
        if len == 0 && !fin {
            return Ok(0);
        }

        let flags = if fin { FLAG_END_STREAM } else { 0 };
        self.write_frame(FRAME_DATA, flags, stream, &data[..len])?;
        self.window_send -= len as i32;
        if let Some(s) = self.streams.find_mut(stream) {
            s.window_send -= len as i32;
        }

        if fin {
            self.discard_remaining_payload(stream)?;
        }
        Ok(len)
    }

    /// Promise a pushed request on a fresh stream parented to `stream`.
    ///
    /// Servers only. Quietly does nothing when the peer disabled push or
    /// the parent cannot carry promises anymore; pushes are optional.
    pub fn send_push(&mut self, stream: u32, message: &Message) -> Result<(), Error> {
        if self.state == State::Undefined {
            return Err(Error::Disconnect);
        }
        if self.role == Role::Client {
            return Err(Error::Assertion("clients cannot push"));
        }
        if !self.is_http2() || self.settings[REMOTE].enable_push != 1 {
            return Ok(());
        }

        let accept = match self.streams.find(stream) {
            Some(s) => s.accept,
            None => return Err(Error::InvalidStream("push on a nonexistent stream")),
        };
        if accept & ACCEPT_WRITE_PUSH == 0 {
            return Ok(());
        }

        let child = self.next_stream_id();
        self.stream_open(child, true)?;
        if let Some(s) = self.streams.find_mut(child) {
            s.accept = ACCEPT_WRITE_HEADERS;
        }

        let mut payload = Vec::new();
        payload.extend_from_slice(&child.to_be_bytes());
        let pseudo = [
            Header::new(":method", message.method.clone()),
            Header::new(":path", message.path.clone()),
        ];
        self.encoder.encode(&pseudo, &mut payload);
        self.encoder.encode(&message.headers, &mut payload);
        self.write_frame(FRAME_PUSH_PROMISE, FLAG_END_HEADERS, stream, &payload)?;

        metrics::MESSAGES_STARTED.increment();
        self.events.push_back(Event::MessageStart {
            stream: child,
            message: message.clone(),
        });
        self.events.push_back(Event::MessageEnd { stream: child });
        Ok(())
    }

    /// Reset `stream`, or the whole connection when `stream` is 0 (GOAWAY).
    ///
    /// Resetting an idle or unknown stream is a no-op. In HTTP/1.x mode a
    /// nonzero reset tears the exchange down and reports `Disconnect`.
    pub fn send_reset(&mut self, stream: u32, code: ErrorCode) -> Result<(), Error> {
        if !self.is_http2() {
            if stream == 0 && code == ErrorCode::NoError {
                return Ok(());
            }
            if self.streams.find(1).is_some() {
                self.stream_destroy(1);
            }
            return Err(Error::Disconnect);
        }
        if stream == 0 {
            return self.write_goaway(code);
        }
        if self.streams.find(stream).is_some() {
            return self.write_reset_stream(stream, code);
        }
        Ok(())
    }

    /// Send a PING with 8 bytes of opaque data; the answer arrives as
    /// [`Event::Pong`]. HTTP/2 only.
    pub fn send_ping(&mut self, data: [u8; 8]) -> Result<(), Error> {
        if !self.is_http2() {
            return Err(Error::Assertion("cannot ping an HTTP/1.x peer"));
        }
        self.write_frame(FRAME_PING, 0, 0, &data)
    }

    /// Send a raw frame. HTTP/2 only; oversized DATA/HEADERS are split per
    /// the peer's `max_frame_size`.
    pub fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        if !self.is_http2() {
            return Err(Error::Assertion("cannot send frames to an HTTP/1.x peer"));
        }
        self.write_frame(frame.kind, frame.flags, frame.stream, &frame.payload)
    }

    /// Grant the peer `increment` more bytes of stream-level flow window.
    /// Only meaningful with manual stream flow control; no-op for stream 0,
    /// unknown streams or HTTP/1.x mode.
    pub fn increase_window(&mut self, stream: u32, increment: u32) -> Result<(), Error> {
        if increment == 0 || stream == 0 || !self.is_http2() || self.streams.find(stream).is_none()
        {
            return Ok(());
        }
        self.write_frame(FRAME_WINDOW_UPDATE, 0, stream, &increment.to_be_bytes())?;
        if let Some(s) = self.streams.find_mut(stream) {
            s.window_recv = s.window_recv.saturating_add(increment as i32);
        }
        Ok(())
    }

    // -- The drive loop --

    fn proceed(&mut self) -> Result<(), Error> {
        loop {
            match self.state {
                State::Undefined => return Ok(()),

                State::Init => {
                    self.state = State::Preface;
                    if self.role == Role::Client {
                        self.send_buf.extend_from_slice(PREFACE);
                    }
                    self.write_settings_delta(Settings::STANDARD, self.settings[LOCAL])?;
                }

                State::Preface => {
                    if self.role == Role::Server {
                        if self.buffer.len() < PREFACE.len() {
                            return Ok(());
                        }
                        if &self.buffer.data()[..PREFACE.len()] != PREFACE {
                            return Err(Error::Transport("invalid HTTP/2 client preface"));
                        }
                        self.buffer.consume(PREFACE.len());
                    }
                    self.state = State::ReadyNoSettings;
                }

                State::ReadyNoSettings | State::Ready => {
                    let Some(header) = frame::peek_header(self.buffer.data()) else {
                        return Ok(());
                    };
                    if header.length > self.settings[LOCAL].max_frame_size {
                        return Err(self.fail(ErrorCode::FrameSizeError, "frame too big"));
                    }
                    let total = FRAME_HEADER_LEN + header.length as usize;
                    if self.buffer.len() < total {
                        return Ok(());
                    }
                    if self.state == State::ReadyNoSettings && header.kind != FRAME_SETTINGS {
                        return Err(Error::Transport("no initial SETTINGS"));
                    }
                    self.state = State::Ready;

                    let payload =
                        Bytes::copy_from_slice(&self.buffer.data()[FRAME_HEADER_LEN..total]);
                    self.buffer.consume(total);
                    let frame = Frame {
                        kind: header.kind,
                        flags: header.flags,
                        stream: header.stream,
                        payload,
                    };

                    let dropped =
                        matches!(self.goaway_sent, Some(last) if frame.stream > last);
                    if !dropped {
                        metrics::FRAMES_RECEIVED.increment();
                        self.events.push_back(Event::FrameReceived(frame.clone()));
                        self.handle_frame(frame)?;
                    }
                }

                State::Http1Ready => {
                    if !self.proceed_h1_head()? {
                        return Ok(());
                    }
                }

                State::Http1Reading | State::Http1ReadingUpgrade => {
                    if !self.proceed_h1_body()? {
                        return Ok(());
                    }
                }

                State::UnknownProtocolUpgrade => {
                    if !self.upgrade_offered {
                        // Pause so the application can answer with a 101
                        // before more bytes are interpreted.
                        self.upgrade_offered = true;
                        self.events.push_back(Event::UpgradeOffered);
                        return Ok(());
                    }
                    self.upgrade_offered = false;
                    self.state = State::Http1Reading;
                }

                State::UnknownProtocol => {
                    if self.buffer.is_empty() {
                        return Ok(());
                    }
                    let data = Bytes::copy_from_slice(self.buffer.data());
                    self.buffer.consume(data.len());
                    self.events.push_back(Event::MessageData { stream: 1, data });
                }
            }
        }
    }

    // -- HTTP/1.x states --

    /// Returns false when more input is needed.
    fn proceed_h1_head(&mut self) -> Result<bool, Error> {
        let lead = self
            .buffer
            .data()
            .iter()
            .take_while(|&&b| b == b'\r' || b == b'\n')
            .count();
        self.buffer.consume(lead);
        if self.buffer.is_empty() {
            return Ok(false);
        }

        // Every HTTP/1.x exchange lives on stream 1.
        match self.role {
            Role::Client => match self.streams.find(1) {
                Some(s) if s.accept & ACCEPT_HEADERS != 0 => {}
                _ => return Err(Error::Transport("HTTP/1.x response without a request")),
            },
            Role::Server => match self.streams.find(1).map(|s| s.accept) {
                None => {
                    self.stream_open(1, false)?;
                    if let Some(s) = self.streams.find_mut(1) {
                        s.accept = ACCEPT_HEADERS;
                    }
                }
                Some(a) if a & ACCEPT_HEADERS == 0 => {
                    return Err(Error::WouldBlock("already handling an HTTP/1.x message"));
                }
                Some(_) => {}
            },
        }

        // The HTTP/2 client preface looks like an HTTP/1 request, but is not.
        if self.role == Role::Server && !self.disallow_h2_prior_knowledge {
            let n = self.buffer.len().min(PREFACE.len());
            if self.buffer.data()[..n] == PREFACE[..n] {
                if self.buffer.len() < PREFACE.len() {
                    return Ok(false);
                }
                self.state = State::Init;
                self.streams.last_id = [0, 0];
                self.stream_destroy(1);
                return Ok(true);
            }
        }

        let parsed = match self.role {
            Role::Client => h1::parse_response(self.buffer.data())?,
            Role::Server => h1::parse_request(self.buffer.data())?,
        };
        let (head, consumed) = match parsed {
            H1Parse::NeedMore => {
                let cap = MAX_CONTINUATIONS * self.settings[LOCAL].max_frame_size as usize;
                if self.buffer.len() > cap {
                    return Err(Error::Transport("HTTP/1.x message too big"));
                }
                return Ok(false);
            }
            H1Parse::Head(head, consumed) => (head, consumed),
        };

        let mut msg = Message {
            code: head.code,
            method: head.method,
            path: head.path,
            headers: Vec::with_capacity(head.headers.len() + 1),
        };
        if self.role == Role::Server {
            msg.headers.push(Header::new(":scheme", "unknown"));
        }

        self.http1_remaining = 0;
        // HEAD, 1xx, 204 and 304 responses never carry bodies; for the rest,
        // a body exists iff content-length or transfer-encoding says so.
        let no_body = self.role == Role::Client
            && ((100..200).contains(&msg.code) || msg.code == 204 || msg.code == 304);
        let mut h2c_upgrade = false;
        let mut has_content_length = false;

        for mut header in head.headers {
            if header.name == b"upgrade" && self.state == State::Http1Ready && !h2c_upgrade {
                if header.value == b"h2c" {
                    if self.role == Role::Server && !self.disallow_h2_upgrade {
                        h2c_upgrade = true;
                    }
                } else if self.role == Role::Client {
                    if msg.code == 101 {
                        self.state = State::UnknownProtocol;
                    }
                } else if self.accept_upgrades {
                    self.state = State::UnknownProtocolUpgrade;
                }
            } else if no_body {
                // keep the header, ignore any body framing it implies
            } else if header.name == b"content-length" {
                // content-length is unique; a conflicting pair is a classic
                // request-smuggling vector.
                if has_content_length {
                    return Err(Error::Transport("multiple content-length headers"));
                }
                has_content_length = true;
                self.http1_remaining = parse_content_length(&header.value)?;
            } else if header.name == b"transfer-encoding" {
                if header.value != b"identity" {
                    self.http1_remaining = u32::MAX;
                }
            } else if header.name == b"host" {
                header.name = b":authority".to_vec();
            }
            msg.headers.push(header);
        }

        // Even with no payload, the body state switches right back.
        if let Some(s) = self.streams.find_mut(1) {
            s.accept &= !ACCEPT_HEADERS;
            s.accept |= ACCEPT_DATA;
            if self.role == Role::Server {
                s.accept |= ACCEPT_WRITE_HEADERS;
            }
        }

        self.buffer.consume(consumed);

        if h2c_upgrade {
            // 101 first, then the preface and our SETTINGS: stream 1 can
            // carry HTTP/2 frames while the request body is still draining.
            let switch = Message::response(
                101,
                vec![
                    Header::new("connection", "upgrade"),
                    Header::new("upgrade", "h2c"),
                ],
            );
            self.send_message(1, &switch, false)?;
            self.send_buf.extend_from_slice(PREFACE);
            self.write_settings_delta(Settings::STANDARD, self.settings[LOCAL])?;
            self.state = State::Http1ReadingUpgrade;
        } else if self.state == State::Http1Ready {
            self.state = State::Http1Reading;
        }

        metrics::MESSAGES_STARTED.increment();
        self.events.push_back(Event::MessageStart {
            stream: 1,
            message: msg,
        });
        Ok(true)
    }

    /// Returns false when more input is needed.
    fn proceed_h1_body(&mut self) -> Result<bool, Error> {
        let accept = match self.streams.find(1) {
            Some(s) => s.accept,
            None => return Err(Error::Assertion("HTTP/1.x body without stream 1")),
        };
        if accept & ACCEPT_DATA == 0 {
            return Err(Error::Assertion("HTTP/1.x body without a message"));
        }

        if self.http1_remaining == 0 {
            self.state = if self.state == State::Http1ReadingUpgrade {
                State::Preface
            } else {
                State::Http1Ready
            };
            self.events.push_back(Event::MessageEnd { stream: 1 });
            let mut empty = false;
            if let Some(stream) = self.streams.find_mut(1) {
                stream.accept &= !(ACCEPT_INBOUND | ACCEPT_PUSH);
                empty = stream.accept == 0;
            }
            if empty {
                self.stream_destroy(1);
            }
            return Ok(true);
        }

        if self.buffer.is_empty() {
            return Ok(false);
        }

        if self.http1_remaining == u32::MAX {
            let Some((size, line)) = h1::parse_chunk_size(self.buffer.data())? else {
                return Ok(false);
            };
            let total = line + size + 2;
            if self.buffer.len() < total {
                return Ok(false);
            }
            if &self.buffer.data()[total - 2..total] != b"\r\n" {
                return Err(Error::Transport("chunked encoding parse error"));
            }
            let data = Bytes::copy_from_slice(&self.buffer.data()[line..line + size]);
            self.buffer.consume(total);
            if size == 0 {
                self.http1_remaining = 0;
            } else {
                self.events.push_back(Event::MessageData { stream: 1, data });
            }
            return Ok(true);
        }

        let take = (self.buffer.len() as u64).min(u64::from(self.http1_remaining)) as usize;
        let data = Bytes::copy_from_slice(&self.buffer.data()[..take]);
        self.http1_remaining -= take as u32;
        self.buffer.consume(take);
        self.events.push_back(Event::MessageData { stream: 1, data });
        Ok(true)
    }

    // -- HTTP/2 frame handlers --

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        // A started header block must finish before anything else happens.
        if self.continued_stream != 0
            && (frame.kind != FRAME_CONTINUATION || frame.stream != self.continued_stream)
        {
            return Err(self.fail(ErrorCode::ProtocolError, "expected a CONTINUATION"));
        }
        match frame.kind {
            FRAME_DATA => self.handle_data(frame),
            FRAME_HEADERS => self.handle_headers(frame),
            FRAME_PRIORITY => self.handle_priority(frame),
            FRAME_RST_STREAM => self.handle_rst_stream(frame),
            FRAME_SETTINGS => self.handle_settings(frame),
            FRAME_PUSH_PROMISE => self.handle_push_promise(frame),
            FRAME_PING => self.handle_ping(frame),
            FRAME_GOAWAY => self.handle_goaway(frame),
            FRAME_WINDOW_UPDATE => self.handle_window_update(frame),
            FRAME_CONTINUATION => self.handle_continuation(frame),
            _ => Ok(()), // unknown frame types are ignored
        }
    }

    fn handle_data(&mut self, frame: Frame) -> Result<(), Error> {
        let length = frame.payload.len() as u32;
        let payload = match frame::strip_padding(frame.payload.clone(), frame.flags) {
            Ok(p) => p,
            Err((code, msg)) => return Err(self.fail(code, msg)),
        };

        if length > 0 {
            // Acknowledge at the connection level right away, padding
            // included; connection flow control is not the caller's problem.
            self.window_recv -= length as i32;
            self.write_frame(FRAME_WINDOW_UPDATE, 0, 0, &length.to_be_bytes())?;
            self.window_recv += length as i32;
        }

        let accept = match self.streams.find(frame.stream) {
            Some(s) => s.accept,
            None => return self.tolerate_invalid_stream(&frame),
        };
        if accept & ACCEPT_DATA == 0 {
            return self.write_reset_stream(frame.stream, ErrorCode::StreamClosed);
        }

        if let Some(s) = self.streams.find_mut(frame.stream) {
            s.window_recv -= length as i32;
        }
        self.events.push_back(Event::MessageData {
            stream: frame.stream,
            data: payload,
        });

        if frame.flags & FLAG_END_STREAM != 0 {
            return self.finish_inbound(frame.stream);
        }
        if length > 0 && !self.manual_stream_flow {
            self.write_frame(FRAME_WINDOW_UPDATE, 0, frame.stream, &length.to_be_bytes())?;
            if let Some(s) = self.streams.find_mut(frame.stream) {
                s.window_recv += length as i32;
            }
        }
        Ok(())
    }

    fn handle_headers(&mut self, frame: Frame) -> Result<(), Error> {
        let mut payload = match frame::strip_padding(frame.payload.clone(), frame.flags) {
            Ok(p) => p,
            Err((code, msg)) => return Err(self.fail(code, msg)),
        };

        let accept = match self.streams.find(frame.stream).map(|s| s.accept) {
            Some(a) => a,
            None => {
                if self.role == Role::Client {
                    // Servers cannot initiate streams.
                    return Err(self.fail(ErrorCode::ProtocolError, "unexpected HEADERS"));
                }
                self.stream_open(frame.stream, false)?;
                let a = ACCEPT_HEADERS | ACCEPT_WRITE_HEADERS | ACCEPT_WRITE_PUSH;
                if let Some(s) = self.streams.find_mut(frame.stream) {
                    s.accept = a;
                }
                a
            }
        };

        if accept & ACCEPT_TRAILERS != 0 {
            if let Some(s) = self.streams.find_mut(frame.stream) {
                s.accept &= !ACCEPT_DATA;
            }
            if frame.flags & FLAG_END_STREAM == 0 {
                // There is no data after trailers.
                return Err(self.fail(ErrorCode::ProtocolError, "trailers without END_STREAM"));
            }
        } else if accept & ACCEPT_HEADERS == 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "unexpected HEADERS"));
        }

        if frame.flags & FLAG_PRIORITY != 0 {
            if payload.len() < 5 {
                return Err(self.fail(ErrorCode::FrameSizeError, "no priority spec"));
            }
            if !self.check_priority_dependency(frame.stream, &payload)? {
                return Ok(());
            }
            payload = payload.slice(5..);
        }

        self.continued_flags = frame.flags & FLAG_END_STREAM;
        self.continued_stream = frame.stream;
        self.continued.extend_from_slice(&payload);

        if frame.flags & FLAG_END_HEADERS != 0 {
            return self.finish_header_block();
        }
        Ok(())
    }

    fn handle_push_promise(&mut self, frame: Frame) -> Result<(), Error> {
        let payload = match frame::strip_padding(frame.payload.clone(), frame.flags) {
            Ok(p) => p,
            Err((code, msg)) => return Err(self.fail(code, msg)),
        };

        let parent_accept = self.streams.find(frame.stream).map_or(0, |s| s.accept);
        if self.settings[LOCAL].enable_push != 1 || parent_accept & ACCEPT_PUSH == 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "unexpected PUSH_PROMISE"));
        }
        if payload.len() < 4 {
            return Err(self.fail(ErrorCode::FrameSizeError, "PUSH_PROMISE too short"));
        }

        let promised = frame::read_u32(&payload) & 0x7fff_ffff;
        self.stream_open(promised, false)?;
        if let Some(s) = self.streams.find_mut(promised) {
            s.accept = ACCEPT_HEADERS;
        }

        self.continued_flags = 0; // PUSH_PROMISE cannot carry END_STREAM
        self.continued_stream = frame.stream;
        self.continued_promise = promised;
        self.continued.extend_from_slice(&payload[4..]);

        if frame.flags & FLAG_END_HEADERS != 0 {
            return self.finish_header_block();
        }
        Ok(())
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<(), Error> {
        if self.continued_stream == 0 || self.streams.find(frame.stream).is_none() {
            return Err(self.fail(ErrorCode::ProtocolError, "unexpected CONTINUATION"));
        }
        // CONTINUATIONs are not counted individually; the total is capped.
        let cap = (MAX_CONTINUATIONS + 1) * self.settings[LOCAL].max_frame_size as usize;
        if self.continued.len() + frame.payload.len() > cap {
            return Err(self.fail(ErrorCode::EnhanceYourCalm, "too many HEADERS"));
        }
        self.continued.extend_from_slice(&frame.payload);

        if frame.flags & FLAG_END_HEADERS != 0 {
            return self.finish_header_block();
        }
        Ok(())
    }

    /// A HEADERS or PUSH_PROMISE sequence is complete: run it through HPACK,
    /// validate, and route the result.
    fn finish_header_block(&mut self) -> Result<(), Error> {
        let block = std::mem::take(&mut self.continued);
        let parent = self.continued_stream;
        let promised = self.continued_promise;
        let end_stream = self.continued_flags & FLAG_END_STREAM != 0;
        self.continued_stream = 0;
        self.continued_promise = 0;
        self.continued_flags = 0;

        let headers = match self.decoder.decode(&block, MAX_HEADERS) {
            Ok(headers) => headers,
            Err(e) => {
                // Shared compression state is corrupt; nothing to salvage.
                let _ = self.write_goaway(ErrorCode::CompressionError);
                return Err(e);
            }
        };

        let target = if promised != 0 { promised } else { parent };
        let accept = self.streams.find(target).map_or(0, |s| s.accept);
        let trailers = promised == 0 && accept & ACCEPT_TRAILERS != 0;
        let kind = if trailers {
            BlockKind::Trailers
        } else if self.role == Role::Client && promised == 0 {
            BlockKind::Response
        } else {
            BlockKind::Request
        };

        let msg = match message::interpret(headers, kind) {
            Ok(msg) if !(trailers && !end_stream) => msg,
            _ => {
                // The compression state is synchronized by now, so the
                // stream can go away immediately.
                self.write_frame(
                    FRAME_RST_STREAM,
                    0,
                    target,
                    &(ErrorCode::ProtocolError as u32).to_be_bytes(),
                )?;
                metrics::RESETS_SENT.increment();
                self.stream_reset_local(target);
                return Ok(());
            }
        };

        if promised != 0 {
            // Pushes are accepted even on streams we reset locally.
            self.events.push_back(Event::MessagePush {
                stream: parent,
                message: msg,
                promised,
            });
            return Ok(());
        }

        if trailers {
            if let Some(s) = self.streams.find_mut(target) {
                s.accept &= !ACCEPT_INBOUND;
            }
            self.events.push_back(Event::MessageTrail {
                stream: target,
                trailers: msg.headers,
            });
            return self.finish_inbound(target);
        }

        let nop = accept & ACCEPT_NOP_HEADERS != 0;
        if let Some(s) = self.streams.find_mut(target) {
            s.accept &= !ACCEPT_HEADERS;
            s.accept |= ACCEPT_TRAILERS | ACCEPT_DATA;
        }
        if nop {
            // Compression state is back in sync; the stream itself was
            // already given up on.
            self.stream_reset_local(target);
            return Ok(());
        }

        metrics::MESSAGES_STARTED.increment();
        self.events.push_back(Event::MessageStart {
            stream: target,
            message: msg,
        });
        if end_stream {
            return self.finish_inbound(target);
        }
        Ok(())
    }

    fn handle_settings(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.stream != 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "SETTINGS on a stream"));
        }
        if frame.flags & FLAG_ACK != 0 {
            if !frame.payload.is_empty() {
                return Err(self.fail(ErrorCode::FrameSizeError, "bad SETTINGS ack"));
            }
            return Ok(());
        }
        if frame.payload.len() % 6 != 0 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad SETTINGS"));
        }

        for entry in frame.payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            self.settings[REMOTE].apply(id, frame::read_u32(&entry[2..]));
        }
        if let Err((code, msg)) = self.settings[REMOTE].validate() {
            return Err(self.fail(code, msg));
        }

        self.encoder
            .set_limit_upper(self.settings[REMOTE].header_table_size as usize);
        self.write_frame(FRAME_SETTINGS, FLAG_ACK, 0, &[])?;
        self.events.push_back(Event::SettingsChanged);
        Ok(())
    }

    fn handle_ping(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.stream != 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "PING on a stream"));
        }
        if frame.payload.len() != 8 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad PING"));
        }
        if frame.flags & FLAG_ACK != 0 {
            let mut data = [0u8; 8];
            data.copy_from_slice(&frame.payload);
            self.events.push_back(Event::Pong(data));
            return Ok(());
        }
        self.write_frame(FRAME_PING, FLAG_ACK, 0, &frame.payload)
    }

    fn handle_goaway(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.stream != 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "GOAWAY on a stream"));
        }
        if frame.payload.len() < 8 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad GOAWAY"));
        }
        // The last-stream-id in bytes 0..4 is reserved for clean-shutdown
        // support.
        if frame::read_u32(&frame.payload[4..]) != 0 {
            return Err(Error::Transport("peer reported a connection error"));
        }
        Err(Error::Disconnect)
    }

    fn handle_rst_stream(&mut self, frame: Frame) -> Result<(), Error> {
        if self.streams.find(frame.stream).is_none() {
            return self.tolerate_invalid_stream(&frame);
        }
        if frame.payload.len() != 4 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad RST_STREAM"));
        }
        metrics::RESETS_RECEIVED.increment();
        self.stream_destroy(frame.stream);
        Ok(())
    }

    fn handle_priority(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.stream == 0 {
            return Err(self.fail(ErrorCode::ProtocolError, "PRIORITY on stream 0"));
        }
        if frame.payload.len() != 5 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad PRIORITY"));
        }
        // Dependency hints are validated, then ignored.
        self.check_priority_dependency(frame.stream, &frame.payload)?;
        Ok(())
    }

    fn handle_window_update(&mut self, frame: Frame) -> Result<(), Error> {
        if frame.payload.len() != 4 {
            return Err(self.fail(ErrorCode::FrameSizeError, "bad WINDOW_UPDATE"));
        }
        let increment = frame::read_u32(&frame.payload);
        if increment == 0 || increment > 0x7fff_ffff {
            return Err(self.fail(ErrorCode::ProtocolError, "window increment out of bounds"));
        }

        if frame.stream == 0 {
            if self.window_send > 0x7fff_ffff - increment as i32 {
                return Err(self.fail(ErrorCode::FlowControlError, "window increment too big"));
            }
            self.window_send += increment as i32;
        } else {
            match self.streams.find(frame.stream).map(|s| s.window_send) {
                None => return self.tolerate_invalid_stream(&frame),
                Some(window) if window > 0x7fff_ffff - increment as i32 => {
                    return self.write_reset_stream(frame.stream, ErrorCode::FlowControlError);
                }
                Some(_) => {
                    if let Some(s) = self.streams.find_mut(frame.stream) {
                        s.window_send += increment as i32;
                    }
                }
            }
        }

        self.events.push_back(Event::FlowIncrease {
            stream: frame.stream,
        });
        Ok(())
    }

    /// Validate the 5-byte priority spec at the front of `payload`.
    /// Returns false when the frame was answered with RST_STREAM.
    fn check_priority_dependency(&mut self, stream: u32, payload: &[u8]) -> Result<bool, Error> {
        let target = frame::read_u32(payload) & 0x7fff_ffff;
        if target != stream {
            return Ok(true);
        }
        if self.streams.find(stream).is_some() {
            self.write_reset_stream(stream, ErrorCode::ProtocolError)?;
            return Ok(false);
        }
        Err(self.fail(ErrorCode::ProtocolError, "stream depends on itself"))
    }

    /// Non-HEADERS frames on unknown streams are tolerated if the id was
    /// recently reset locally (the peer may not have seen the reset yet).
    fn tolerate_invalid_stream(&mut self, frame: &Frame) -> Result<(), Error> {
        if self.streams.recently_reset(frame.stream) {
            return Ok(());
        }
        Err(self.fail(ErrorCode::ProtocolError, "invalid stream"))
    }

    // -- Stream bookkeeping --

    fn stream_open(&mut self, id: u32, local: bool) -> Result<(), Error> {
        let limit = self.settings[if local { REMOTE } else { LOCAL }].max_concurrent_streams;
        let window_recv = self.settings[LOCAL].initial_window_size as i32;
        let window_send = self.settings[REMOTE].initial_window_size as i32;
        self.streams
            .open(id, local, self.is_http2(), limit, window_recv, window_send)?;
        metrics::STREAMS_OPENED.increment();
        metrics::STREAMS_ACTIVE.increment();
        self.events.push_back(Event::StreamStart { stream: id });
        Ok(())
    }

    fn stream_destroy(&mut self, id: u32) {
        if self.streams.remove(id).is_some() {
            metrics::STREAMS_CLOSED.increment();
            metrics::STREAMS_ACTIVE.decrement();
            self.events.push_back(Event::StreamEnd { stream: id });
        }
    }

    fn stream_reset_local(&mut self, id: u32) {
        self.streams.note_reset(id);
        self.stream_destroy(id);
    }

    /// Send RST_STREAM and release the stream, unless the peer is still
    /// committed to a HEADERS sequence on it: then the stream is parked with
    /// NOP_HEADERS so the block still passes through HPACK.
    fn write_reset_stream(&mut self, id: u32, code: ErrorCode) -> Result<(), Error> {
        self.write_frame(FRAME_RST_STREAM, 0, id, &(code as u32).to_be_bytes())?;
        metrics::RESETS_SENT.increment();
        match self.streams.find_mut(id) {
            Some(s) if s.accept & ACCEPT_HEADERS != 0 => {
                s.accept &= !ACCEPT_OUTBOUND;
                s.accept |= ACCEPT_NOP_HEADERS;
                Ok(())
            }
            _ => {
                self.stream_reset_local(id);
                Ok(())
            }
        }
    }

    /// The inbound half of `id` is done; release the stream if the outbound
    /// half is done too.
    fn finish_inbound(&mut self, id: u32) -> Result<(), Error> {
        let half_open = match self.streams.find_mut(id) {
            Some(s) => {
                s.accept &= !(ACCEPT_INBOUND | ACCEPT_PUSH);
                s.accept != 0
            }
            None => return Ok(()),
        };
        self.events.push_back(Event::MessageEnd { stream: id });
        if !half_open {
            self.stream_destroy(id);
        }
        Ok(())
    }

    /// The local half of `id` is done; cancel whatever the peer still owes.
    fn discard_remaining_payload(&mut self, id: u32) -> Result<(), Error> {
        let accept = match self.streams.find_mut(id) {
            Some(s) => {
                s.accept &= !ACCEPT_OUTBOUND;
                s.accept
            }
            None => return Ok(()),
        };
        if accept == 0 {
            self.stream_reset_local(id);
            return Ok(());
        }
        if self.role == Role::Server && self.is_http2() {
            // The response is complete; tell the client to stop sending.
            return self.write_reset_stream(id, ErrorCode::NoError);
        }
        Ok(())
    }

    // -- Frame writing --

    /// Serialize one frame, splitting DATA/HEADERS/PUSH_PROMISE into
    /// multiple frames (CONTINUATIONs for the header kinds) when the payload
    /// exceeds the peer's `max_frame_size`.
    fn write_frame(&mut self, kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Result<(), Error> {
        let limit = self.settings[REMOTE].max_frame_size as usize;

        if payload.len() <= limit {
            metrics::FRAMES_SENT.increment();
            self.events.push_back(Event::FrameSent {
                kind,
                flags,
                stream,
                length: payload.len() as u32,
            });
            frame::put_header(&mut self.send_buf, payload.len(), kind, flags, stream);
            self.send_buf.extend_from_slice(payload);
            return Ok(());
        }

        if flags & FLAG_PADDED != 0 {
            return Err(Error::Assertion("cannot split a padded frame"));
        }
        let carry = match kind {
            FRAME_DATA => FLAG_END_STREAM,
            FRAME_HEADERS | FRAME_PUSH_PROMISE => FLAG_END_HEADERS,
            _ => return Err(Error::Assertion("control frame too big")),
        };

        let mut part_kind = kind;
        let mut part_flags = flags & !carry;
        let mut rest = payload;
        while rest.len() > limit {
            let (chunk, tail) = rest.split_at(limit);
            self.write_frame(part_kind, part_flags, stream, chunk)?;
            rest = tail;
            part_flags &= !(FLAG_PRIORITY | FLAG_END_STREAM);
            if kind != FRAME_DATA {
                part_kind = FRAME_CONTINUATION;
            }
        }
        self.write_frame(part_kind, part_flags | (flags & carry), stream, rest)
    }

    fn write_settings_delta(&mut self, previous: Settings, current: Settings) -> Result<(), Error> {
        let mut payload = Vec::new();
        current.encode_delta(&previous, &mut payload);
        self.write_frame(FRAME_SETTINGS, 0, 0, &payload)
    }

    fn write_goaway(&mut self, code: ErrorCode) -> Result<(), Error> {
        let last = *self
            .goaway_sent
            .get_or_insert(self.streams.last_id[REMOTE]);
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&last.to_be_bytes());
        payload[4..].copy_from_slice(&(code as u32).to_be_bytes());
        metrics::GOAWAY_SENT.increment();
        self.write_frame(FRAME_GOAWAY, 0, 0, &payload)
    }

    /// Shut the connection down with a GOAWAY, then report the violation.
    fn fail(&mut self, code: ErrorCode, msg: &'static str) -> Error {
        match self.write_goaway(code) {
            Ok(()) => Error::Transport(msg),
            Err(e) => e,
        }
    }

    fn write_h1_head(
        &mut self,
        message: &Message,
        informational: bool,
        fin: bool,
    ) -> Result<(), Error> {
        let mut head = Vec::with_capacity(256);
        if self.role == Role::Client {
            head.extend_from_slice(&message.method);
            head.push(b' ');
            head.extend_from_slice(&message.path);
            head.extend_from_slice(b" HTTP/1.1\r\n");
        } else {
            head.extend_from_slice(
                format!("HTTP/1.1 {} {}\r\n", message.code, reason_phrase(message.code))
                    .as_bytes(),
            );
        }
        if head.len() > MAX_HTTP1_HEADER_SIZE {
            return Err(Error::Assertion("method or path too big"));
        }
        self.send_buf.extend_from_slice(&head);

        self.writing_chunked = !informational && !fin;
        let mut have_connection = false;

        for header in &message.headers {
            let mut name: &[u8] = &header.name;
            let mut value: &[u8] = &header.value;

            if name == b":authority" {
                name = b"host";
            } else if name.first() == Some(&b':') {
                continue;
            } else if name == b"connection" {
                have_connection = true;
            } else if name == b"content-length" || name == b"upgrade" {
                self.writing_chunked = false;
            } else if name == b"transfer-encoding" {
                // chunked can only be the last transfer-encoding listed; it
                // is re-added below iff the body actually needs it.
                if value == b"chunked" {
                    continue;
                }
                if let Some(stripped) = value
                    .strip_suffix(b", chunked".as_slice())
                    .or_else(|| value.strip_suffix(b",chunked".as_slice()))
                {
                    value = stripped;
                }
            }

            if name.len() + value.len() + 4 > MAX_HTTP1_HEADER_SIZE {
                return Err(Error::Assertion("header too big"));
            }
            self.send_buf.extend_from_slice(name);
            self.send_buf.extend_from_slice(b": ");
            self.send_buf.extend_from_slice(value);
            self.send_buf.extend_from_slice(b"\r\n");
        }

        if self.writing_chunked {
            self.send_buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        if !have_connection {
            self.send_buf.extend_from_slice(b"connection: keep-alive\r\n");
        }
        self.send_buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

fn parse_content_length(value: &[u8]) -> Result<u32, Error> {
    if value.is_empty() {
        return Err(Error::Transport("bad content-length"));
    }
    let mut length: u32 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(Error::Transport("bad content-length"));
        }
        length = length
            .checked_mul(10)
            .and_then(|l| l.checked_add(u32::from(b - b'0')))
            .ok_or(Error::Transport("content-length too big"))?;
    }
    if length == u32::MAX {
        return Err(Error::Transport("content-length too big"));
    }
    Ok(length)
}

fn reason_phrase(code: u32) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::peek_header;

    fn frame_bytes(kind: u8, flags: u8, stream: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame::put_header(&mut buf, payload.len(), kind, flags, stream);
        buf.extend_from_slice(payload);
        buf.to_vec()
    }

    fn parse_frames(mut bytes: &[u8]) -> Vec<(u8, u8, u32, Vec<u8>)> {
        let mut frames = Vec::new();
        while let Some(h) = peek_header(bytes) {
            let total = FRAME_HEADER_LEN + h.length as usize;
            frames.push((h.kind, h.flags, h.stream, bytes[FRAME_HEADER_LEN..total].to_vec()));
            bytes = &bytes[total..];
        }
        assert!(bytes.is_empty(), "trailing partial frame");
        frames
    }

    fn drain(conn: &mut Connection) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(e) = conn.poll_event() {
            events.push(e);
        }
        events
    }

    /// Shuttle bytes between the two peers until both go quiet.
    fn pump(client: &mut Connection, server: &mut Connection) {
        loop {
            let c = client.take_pending_send();
            if !c.is_empty() {
                server.recv(&c).unwrap();
                continue;
            }
            let s = server.take_pending_send();
            if !s.is_empty() {
                client.recv(&s).unwrap();
                continue;
            }
            return;
        }
    }

    fn h2_pair() -> (Connection, Connection) {
        let mut client = Connection::new(Role::Client);
        let mut server = Connection::new(Role::Server);
        client.start(Version::Http2).unwrap();
        server.start(Version::Http2).unwrap();
        pump(&mut client, &mut server);
        drain(&mut client);
        drain(&mut server);
        (client, server)
    }

    /// A server already past the preface and initial SETTINGS exchange.
    fn h2_server() -> Connection {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http2).unwrap();
        server.take_pending_send();
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&frame_bytes(FRAME_SETTINGS, 0, 0, &[]));
        server.recv(&bytes).unwrap();
        server.take_pending_send();
        drain(&mut server);
        server
    }

    fn get_request() -> Message {
        Message::request(
            "GET",
            "/",
            vec![
                Header::new(":scheme", "http"),
                Header::new(":authority", "localhost"),
            ],
        )
    }

    fn encode_request_block(enc: &mut Encoder) -> Vec<u8> {
        let mut block = Vec::new();
        enc.encode(
            &[
                Header::new(":method", "GET"),
                Header::new(":path", "/"),
                Header::new(":scheme", "http"),
            ],
            &mut block,
        );
        block
    }

    #[test]
    fn client_start_writes_preface_then_settings() {
        let mut client = Connection::new(Role::Client);
        client.start(Version::Http2).unwrap();
        let sent = client.take_pending_send();
        assert!(sent.starts_with(PREFACE));
        let frames = parse_frames(&sent[PREFACE.len()..]);
        assert_eq!(frames[0].0, FRAME_SETTINGS);
        // Only max_concurrent_streams differs from the protocol defaults.
        assert_eq!(frames[0].3.len(), 6);
        assert_eq!(&frames[0].3[..2], &[0x0, 0x3]);
    }

    #[test]
    fn server_requires_the_client_preface() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http2).unwrap();
        let err = server.recv(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn first_frame_must_be_settings() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http2).unwrap();
        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&frame_bytes(FRAME_PING, 0, 0, &[0; 8]));
        assert!(matches!(server.recv(&bytes), Err(Error::Transport(_))));
    }

    #[test]
    fn oversized_frame_dies_with_goaway() {
        let mut server = h2_server();
        let mut header = BytesMut::new();
        frame::put_header(&mut header, 16385, FRAME_DATA, 0, 1);
        let err = server.recv(&header).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let frames = parse_frames(&server.take_pending_send());
        let goaway = frames.iter().find(|f| f.0 == FRAME_GOAWAY).unwrap();
        assert_eq!(frame::read_u32(&goaway.3[4..]), ErrorCode::FrameSizeError as u32);
        // The bad frame never surfaced.
        assert!(!drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::FrameReceived(f) if f.kind == FRAME_DATA)));
    }

    #[test]
    fn ping_is_echoed_with_ack() {
        let mut server = h2_server();
        server
            .recv(&frame_bytes(FRAME_PING, 0, 0, &[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let frames = parse_frames(&server.take_pending_send());
        assert_eq!(frames[0].0, FRAME_PING);
        assert_eq!(frames[0].1, FLAG_ACK);
        assert_eq!(frames[0].3, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn pong_surfaces_as_event() {
        let (mut client, mut server) = h2_pair();
        client.send_ping(*b"opaque!!").unwrap();
        pump(&mut client, &mut server);
        assert!(drain(&mut client)
            .iter()
            .any(|e| matches!(e, Event::Pong(d) if d == b"opaque!!")));
    }

    #[test]
    fn padded_data_acks_full_length_and_delivers_content() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        server
            .recv(&frame_bytes(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block))
            .unwrap();
        server.take_pending_send();
        drain(&mut server);

        // Wire payload: pad length 4, five content bytes, four pad bytes.
        let payload = [4, b'h', b'e', b'l', b'l', b'o', 0, 0, 0, 0];
        server
            .recv(&frame_bytes(FRAME_DATA, FLAG_PADDED, 1, &payload))
            .unwrap();

        let events = drain(&mut server);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageData { stream: 1, data } if &data[..] == b"hello")));

        let frames = parse_frames(&server.take_pending_send());
        let updates: Vec<_> = frames.iter().filter(|f| f.0 == FRAME_WINDOW_UPDATE).collect();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].2, 0);
        assert_eq!(frame::read_u32(&updates[0].3), 10);
        assert_eq!(updates[1].2, 1);
        assert_eq!(frame::read_u32(&updates[1].3), 10);
    }

    #[test]
    fn manual_flow_control_suppresses_stream_updates() {
        let mut server = h2_server();
        server.set_manual_stream_flow(true);
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        server
            .recv(&frame_bytes(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block))
            .unwrap();
        server.take_pending_send();
        server.recv(&frame_bytes(FRAME_DATA, 0, 1, b"hello")).unwrap();

        let frames = parse_frames(&server.take_pending_send());
        let updates: Vec<_> = frames.iter().filter(|f| f.0 == FRAME_WINDOW_UPDATE).collect();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].2, 0);

        // The application acknowledges by hand.
        server.increase_window(1, 5).unwrap();
        let frames = parse_frames(&server.take_pending_send());
        assert_eq!(frames[0].0, FRAME_WINDOW_UPDATE);
        assert_eq!(frames[0].2, 1);
        assert_eq!(frame::read_u32(&frames[0].3), 5);
    }

    #[test]
    fn misordered_pseudo_header_resets_stream_but_not_connection() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let mut block = Vec::new();
        enc.encode(
            &[
                Header::new(":method", "GET"),
                Header::new("cookie", "x"),
                Header::new(":path", "/"),
            ],
            &mut block,
        );
        server
            .recv(&frame_bytes(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block))
            .unwrap();

        let frames = parse_frames(&server.take_pending_send());
        let rst = frames.iter().find(|f| f.0 == FRAME_RST_STREAM).unwrap();
        assert_eq!(rst.2, 1);
        assert_eq!(frame::read_u32(&rst.3), ErrorCode::ProtocolError as u32);
        let events = drain(&mut server);
        assert!(events.iter().any(|e| matches!(e, Event::StreamEnd { stream: 1 })));
        assert!(!events.iter().any(|e| matches!(e, Event::MessageStart { .. })));

        // The connection is still usable.
        server
            .recv(&frame_bytes(FRAME_PING, 0, 0, &[0; 8]))
            .unwrap();
    }

    #[test]
    fn connection_window_overflow_is_fatal() {
        let mut server = h2_server();
        let err = server
            .recv(&frame_bytes(
                FRAME_WINDOW_UPDATE,
                0,
                0,
                &0x7fff_ffffu32.to_be_bytes(),
            ))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        let frames = parse_frames(&server.take_pending_send());
        let goaway = frames.iter().find(|f| f.0 == FRAME_GOAWAY).unwrap();
        assert_eq!(frame::read_u32(&goaway.3[4..]), ErrorCode::FlowControlError as u32);
    }

    #[test]
    fn zero_window_increment_is_a_protocol_error() {
        let mut server = h2_server();
        assert!(server
            .recv(&frame_bytes(FRAME_WINDOW_UPDATE, 0, 0, &[0; 4]))
            .is_err());
    }

    #[test]
    fn goaway_no_error_reports_disconnect() {
        let mut server = h2_server();
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&0u32.to_be_bytes());
        let err = server.recv(&frame_bytes(FRAME_GOAWAY, 0, 0, &payload)).unwrap_err();
        assert_eq!(err, Error::Disconnect);

        let mut server = h2_server();
        payload[4..].copy_from_slice(&(ErrorCode::InternalError as u32).to_be_bytes());
        let err = server.recv(&frame_bytes(FRAME_GOAWAY, 0, 0, &payload)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn continuation_interleaving_is_fatal() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        // HEADERS without END_HEADERS, then a PING in the middle.
        server.recv(&frame_bytes(FRAME_HEADERS, 0, 1, &block)).unwrap();
        let err = server
            .recv(&frame_bytes(FRAME_PING, 0, 0, &[0; 8]))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn split_header_block_reassembles() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        let (a, b) = block.split_at(block.len() / 2);
        server.recv(&frame_bytes(FRAME_HEADERS, FLAG_END_STREAM, 1, a)).unwrap();
        server
            .recv(&frame_bytes(FRAME_CONTINUATION, FLAG_END_HEADERS, 1, b))
            .unwrap();
        let events = drain(&mut server);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageStart { stream: 1, message } if message.method == b"GET")));
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));
    }

    #[test]
    fn headers_with_priority_prefix_are_accepted() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        let mut payload = vec![0, 0, 0, 0, 16]; // depends on stream 0, weight 16
        payload.extend_from_slice(&block);
        server
            .recv(&frame_bytes(
                FRAME_HEADERS,
                FLAG_END_HEADERS | FLAG_END_STREAM | FLAG_PRIORITY,
                1,
                &payload,
            ))
            .unwrap();
        assert!(drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::MessageStart { stream: 1, .. })));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let mut server = h2_server();
        let mut payload = 1u32.to_be_bytes().to_vec();
        payload.push(16);
        let err = server
            .recv(&frame_bytes(FRAME_PRIORITY, 0, 1, &payload))
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn send_data_clamps_to_windows() {
        let (mut client, mut server) = h2_pair();
        let stream = client.next_stream_id();
        client.send_message(stream, &get_request(), false).unwrap();

        // Both windows start at 65535; a bigger write is cut short and loses
        // its fin.
        let body = vec![0x2a; 100_000];
        let sent = client.send_data(stream, &body, true).unwrap();
        assert_eq!(sent, 65535);
        // Both windows are exhausted now.
        assert_eq!(client.send_data(stream, &body[sent..], true).unwrap(), 0);

        pump(&mut client, &mut server);
        drain(&mut server);
        // The peer's automatic WINDOW_UPDATEs reopened both windows.
        assert!(drain(&mut client)
            .iter()
            .any(|e| matches!(e, Event::FlowIncrease { .. })));
        let rest = client.send_data(stream, &body[sent..], true).unwrap();
        assert_eq!(rest, 100_000 - 65535);
    }

    #[test]
    fn oversized_data_is_split_at_max_frame_size() {
        let (mut client, _server) = h2_pair();
        let stream = client.next_stream_id();
        client.send_message(stream, &get_request(), false).unwrap();
        client.take_pending_send();

        let body = vec![1u8; 40_000];
        assert_eq!(client.send_data(stream, &body, true).unwrap(), 40_000);
        let frames = parse_frames(&client.take_pending_send());
        let data: Vec<_> = frames.iter().filter(|f| f.0 == FRAME_DATA).collect();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0].3.len(), 16384);
        assert_eq!(data[1].3.len(), 16384);
        assert_eq!(data[2].3.len(), 40_000 - 2 * 16384);
        // END_STREAM rides on the last part only.
        assert_eq!(data[0].1 & FLAG_END_STREAM, 0);
        assert_eq!(data[1].1 & FLAG_END_STREAM, 0);
        assert_ne!(data[2].1 & FLAG_END_STREAM, 0);
    }

    #[test]
    fn set_config_emits_only_the_delta() {
        let (mut client, _server) = h2_pair();
        let mut settings = Settings::INITIAL;
        settings.header_table_size = 8192;
        client.set_config(&settings).unwrap();
        let frames = parse_frames(&client.take_pending_send());
        assert_eq!(frames[0].0, FRAME_SETTINGS);
        assert_eq!(frames[0].3.len(), 6);
        assert_eq!(&frames[0].3[..2], &[0x0, 0x1]);
        assert_eq!(frame::read_u32(&frames[0].3[2..]), 8192);
    }

    #[test]
    fn set_config_validates_inputs() {
        let mut conn = Connection::new(Role::Client);
        let mut bad = Settings::INITIAL;
        bad.enable_push = 2;
        assert!(matches!(conn.set_config(&bad), Err(Error::Assertion(_))));
        let mut bad = Settings::INITIAL;
        bad.max_frame_size = 1000;
        assert!(matches!(conn.set_config(&bad), Err(Error::Assertion(_))));
    }

    #[test]
    fn informational_response_cannot_be_final() {
        let mut server = h2_server();
        let err = server
            .send_message(1, &Message::response(100, Vec::new()), true)
            .unwrap_err();
        assert!(matches!(err, Error::Assertion(_)));
    }

    #[test]
    fn reset_before_response_headers_keeps_hpack_in_sync() {
        let (mut client, mut server) = h2_pair();
        let stream = client.next_stream_id();
        client.send_message(stream, &get_request(), true).unwrap();
        let request = client.take_pending_send();
        server.recv(&request).unwrap();
        drain(&mut server);

        // The response is queued but not delivered yet when the client
        // gives up on the stream.
        server
            .send_message(1, &Message::response(200, vec![Header::new("x-a", "b")]), true)
            .unwrap();
        client.send_reset(stream, ErrorCode::Cancel).unwrap();
        drain(&mut client);

        // The late response headers are consumed for table parity and
        // dropped; the stream dies without a MessageStart.
        client.recv(&server.take_pending_send()).unwrap();
        let events = drain(&mut client);
        assert!(!events.iter().any(|e| matches!(e, Event::MessageStart { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::StreamEnd { stream: s } if *s == stream)));

        // Both sides are still healthy.
        client.send_ping([0; 8]).unwrap();
        server.recv(&client.take_pending_send()).unwrap();
    }

    #[test]
    fn resetting_stream_zero_sends_goaway() {
        let mut server = h2_server();
        server.send_reset(0, ErrorCode::NoError).unwrap();
        let frames = parse_frames(&server.take_pending_send());
        assert_eq!(frames[0].0, FRAME_GOAWAY);
        assert_eq!(frame::read_u32(&frames[0].3[4..]), 0);
    }

    #[test]
    fn push_disabled_by_peer_is_a_quiet_noop() {
        let mut server = h2_server();
        let mut enc = Encoder::new(4096);
        let block = encode_request_block(&mut enc);
        server
            .recv(&frame_bytes(FRAME_HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 1, &block))
            .unwrap();
        server.take_pending_send();
        drain(&mut server);

        // Peer announces ENABLE_PUSH = 0.
        let mut payload = Vec::new();
        crate::settings::encode_entry(&mut payload, 0x2, 0);
        server.recv(&frame_bytes(FRAME_SETTINGS, 0, 0, &payload)).unwrap();
        server.take_pending_send();
        drain(&mut server);

        server.send_push(1, &get_request()).unwrap();
        assert!(!server.has_pending_send());
        assert!(drain(&mut server).is_empty());
    }

    // -- HTTP/1.x --

    #[test]
    fn h1_request_response_cycle() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        let events = drain(&mut server);
        let message = events
            .iter()
            .find_map(|e| match e {
                Event::MessageStart { stream: 1, message } => Some(message),
                _ => None,
            })
            .unwrap();
        assert_eq!(message.method, b"POST");
        assert_eq!(message.path, b"/submit");
        // host became :authority, and a synthetic :scheme leads the list.
        assert_eq!(message.headers[0], Header::new(":scheme", "unknown"));
        assert!(message
            .headers
            .iter()
            .any(|h| h.name == b":authority" && h.value == b"example.com"));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageData { stream: 1, data } if &data[..] == b"hello")));
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));

        server
            .send_message(
                1,
                &Message::response(200, vec![Header::new("content-length", "2")]),
                false,
            )
            .unwrap();
        server.send_data(1, b"ok", true).unwrap();
        let sent = server.take_pending_send();
        let text = std::str::from_utf8(&sent).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
        // content-length framing, not chunked.
        assert!(!text.contains("chunked"));

        // Keep-alive: the next request starts a fresh exchange.
        server.recv(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n").unwrap();
        assert!(drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::MessageStart { stream: 1, .. })));
    }

    #[test]
    fn h1_duplicate_content_length_is_fatal() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        // Even a first value of 0 marks the header as present; the second
        // one must kill the connection.
        let err = server
            .recv(b"POST / HTTP/1.1\r\nhost: x\r\nContent-Length: 0\r\nContent-Length: 999\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn h1_chunked_request_body() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"POST / HTTP/1.1\r\nhost: x\r\ntransfer-encoding: chunked\r\n\r\n")
            .unwrap();
        server.recv(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();

        let events = drain(&mut server);
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                Event::MessageData { stream: 1, data } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"hello world");
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));
    }

    #[test]
    fn h1_chunked_response_write() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        server.recv(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n").unwrap();
        drain(&mut server);
        server.take_pending_send();

        // No content-length and not final: the body goes out chunked.
        server
            .send_message(1, &Message::response(200, Vec::new()), false)
            .unwrap();
        server.send_data(1, b"hello", false).unwrap();
        server.send_data(1, b"", true).unwrap();
        let text = String::from_utf8(server.take_pending_send().to_vec()).unwrap();
        assert!(text.contains("transfer-encoding: chunked\r\n"));
        assert!(text.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
    }

    #[test]
    fn h1_second_request_would_block() {
        let mut client = Connection::new(Role::Client);
        client.start(Version::Http1).unwrap();
        client.send_message(1, &get_request(), true).unwrap();
        let err = client.send_message(1, &get_request(), true).unwrap_err();
        assert!(matches!(err, Error::WouldBlock(_)));
    }

    #[test]
    fn h1_client_parses_response() {
        let mut client = Connection::new(Role::Client);
        client.start(Version::Http1).unwrap();
        client.send_message(1, &get_request(), true).unwrap();
        let sent = client.take_pending_send();
        let text = std::str::from_utf8(&sent).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"));
        // :authority went out as host, :scheme was dropped.
        assert!(text.contains("host: localhost\r\n"));
        assert!(!text.contains(":scheme"));

        client
            .recv(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi")
            .unwrap();
        let events = drain(&mut client);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageStart { stream: 1, message } if message.code == 200)));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageData { stream: 1, data } if &data[..] == b"hi")));
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));
    }

    #[test]
    fn h1_response_without_framing_has_no_body() {
        let mut client = Connection::new(Role::Client);
        client.start(Version::Http1).unwrap();
        client.send_message(1, &get_request(), true).unwrap();
        client.recv(b"HTTP/1.1 304 Not Modified\r\ncontent-length: 999\r\n\r\n").unwrap();
        let events = drain(&mut client);
        // 304 never has a body; the content-length is ignored.
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));
        assert!(!events.iter().any(|e| matches!(e, Event::MessageData { .. })));
    }

    #[test]
    fn h1_upgrade_to_h2c() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: upgrade\r\nUpgrade: h2c\r\n\r\n")
            .unwrap();

        let sent = server.take_pending_send();
        // 101 head first...
        assert!(sent.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        let head_end = sent
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap()
            + 4;
        let text = std::str::from_utf8(&sent[..head_end]).unwrap();
        assert!(text.contains("connection: upgrade\r\n"));
        assert!(text.contains("upgrade: h2c\r\n"));
        // ...then the preface, then our SETTINGS.
        assert_eq!(&sent[head_end..head_end + PREFACE.len()], PREFACE);
        let frames = parse_frames(&sent[head_end + PREFACE.len()..]);
        assert_eq!(frames[0].0, FRAME_SETTINGS);

        // The GET had no body, so the engine is now waiting for the
        // client's HTTP/2 preface; the response goes out as h2 frames.
        assert!(server.is_http2());
        server
            .send_message(1, &Message::response(200, Vec::new()), true)
            .unwrap();
        let frames = parse_frames(&server.take_pending_send());
        assert_eq!(frames[0].0, FRAME_HEADERS);

        let mut bytes = PREFACE.to_vec();
        bytes.extend_from_slice(&frame_bytes(FRAME_SETTINGS, 0, 0, &[]));
        server.recv(&bytes).unwrap();
        let frames = parse_frames(&server.take_pending_send());
        assert!(frames.iter().any(|f| f.0 == FRAME_SETTINGS && f.1 == FLAG_ACK));
    }

    #[test]
    fn h1_upgrade_respects_disallow_flag() {
        let mut server = Connection::new(Role::Server);
        server.set_disallow_h2_upgrade(true);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: h2c\r\n\r\n")
            .unwrap();
        assert!(!server.is_http2());
        assert!(!server.take_pending_send().starts_with(b"HTTP/1.1 101"));
    }

    #[test]
    fn h1_prior_knowledge_preface_switches_to_h2() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        // Arbitrary split inside the preface.
        server.recv(&PREFACE[..10]).unwrap();
        assert!(!server.is_http2());
        let mut rest = PREFACE[10..].to_vec();
        rest.extend_from_slice(&frame_bytes(FRAME_SETTINGS, 0, 0, &[]));
        server.recv(&rest).unwrap();
        assert!(server.is_http2());
        let frames = parse_frames(&server.take_pending_send());
        // Our SETTINGS, then the ack of theirs.
        assert_eq!(frames[0].0, FRAME_SETTINGS);
        assert!(frames.iter().any(|f| f.0 == FRAME_SETTINGS && f.1 == FLAG_ACK));
    }

    #[test]
    fn h1_prior_knowledge_can_be_disallowed() {
        let mut server = Connection::new(Role::Server);
        server.set_disallow_h2_prior_knowledge(true);
        server.start(Version::Http1).unwrap();
        // Now the preface is just a malformed request.
        assert!(server.recv(PREFACE).is_err());
    }

    #[test]
    fn h1_unknown_protocol_upgrade_via_event() {
        let mut server = Connection::new(Role::Server);
        server.set_accept_protocol_upgrades(true);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n")
            .unwrap();
        let events = drain(&mut server);
        assert!(events.iter().any(|e| matches!(e, Event::MessageStart { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::UpgradeOffered)));

        // Answer 101: from here on, bytes tunnel through stream 1.
        server
            .send_message(
                1,
                &Message::response(
                    101,
                    vec![
                        Header::new("connection", "upgrade"),
                        Header::new("upgrade", "websocket"),
                    ],
                ),
                false,
            )
            .unwrap();
        let sent = server.take_pending_send();
        assert!(sent.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
        server.recv(b"\x00\x01\x02").unwrap();
        assert!(drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::MessageData { stream: 1, data } if &data[..] == b"\x00\x01\x02")));
        assert_eq!(server.send_data(1, b"raw", false).unwrap(), 3);
        assert_eq!(&server.take_pending_send()[..], b"raw");
    }

    #[test]
    fn h1_ignored_upgrade_falls_back_to_plain_reading() {
        let mut server = Connection::new(Role::Server);
        server.set_accept_protocol_upgrades(true);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"POST / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nContent-Length: 2\r\n\r\n")
            .unwrap();
        assert!(drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::UpgradeOffered)));
        // The application ignored the offer; the body reads normally.
        server.recv(b"ok").unwrap();
        let events = drain(&mut server);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageData { stream: 1, data } if &data[..] == b"ok")));
        assert!(events.iter().any(|e| matches!(e, Event::MessageEnd { stream: 1 })));
    }

    #[test]
    fn lost_transport_mid_body_is_unclean() {
        let mut server = Connection::new(Role::Server);
        server.start(Version::Http1).unwrap();
        server
            .recv(b"POST / HTTP/1.1\r\nhost: x\r\ncontent-length: 10\r\n\r\nhal")
            .unwrap();
        assert!(matches!(server.lost(), Err(Error::Transport(_))));
    }

    #[test]
    fn lost_transport_releases_h2_streams() {
        let (mut client, mut server) = h2_pair();
        let stream = client.next_stream_id();
        client.send_message(stream, &get_request(), false).unwrap();
        pump(&mut client, &mut server);
        drain(&mut server);
        server.lost().unwrap();
        assert!(drain(&mut server)
            .iter()
            .any(|e| matches!(e, Event::StreamEnd { stream: 1 })));
        assert_eq!(server.recv(b"x"), Err(Error::Disconnect));
    }

    #[test]
    fn started_twice_is_an_assertion() {
        let mut conn = Connection::new(Role::Client);
        conn.start(Version::Http2).unwrap();
        assert!(matches!(conn.start(Version::Http2), Err(Error::Assertion(_))));
    }

    #[test]
    fn ping_in_h1_mode_is_an_assertion() {
        let mut conn = Connection::new(Role::Client);
        conn.start(Version::Http1).unwrap();
        assert!(matches!(conn.send_ping([0; 8]), Err(Error::Assertion(_))));
    }
}
