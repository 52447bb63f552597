//! Sans-IO dual-mode HTTP/1.x + HTTP/2 protocol engine.
//!
//! This crate is a pure protocol state machine usable from both the client
//! and the server role. It has no I/O of its own: the caller feeds bytes in
//! via `recv()`, pulls wire bytes out via `take_pending_send()`, and drains
//! decoded activity with `poll_event()`.
//!
//! # Architecture
//!
//! ```text
//!   transport bytes
//!        |
//!   +----v--------------+
//!   | loomline          |  HTTP/1.x parsing, h2c upgrade, HTTP/2 framing,
//!   | Connection        |  stream multiplexing + flow control, HPACK
//!   +-------------------+
//!        |
//!   Event: MessageStart, MessageData, MessageTrail, MessageEnd, ...
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use loomline::{Connection, Event, Message, Header, Role, Version};
//!
//! let mut conn = Connection::new(Role::Client);
//! conn.start(Version::Http2)?;
//!
//! // Flush the preface + SETTINGS to the transport.
//! transport_send(&conn.take_pending_send());
//!
//! // Send a GET request.
//! let stream = conn.next_stream_id();
//! let request = Message::request("GET", "/", vec![
//!     Header::new(":scheme", "https"),
//!     Header::new(":authority", "example.com"),
//! ]);
//! conn.send_message(stream, &request, true)?;
//! transport_send(&conn.take_pending_send());
//!
//! // Feed received bytes and drain events.
//! conn.recv(&received)?;
//! while let Some(event) = conn.poll_event() {
//!     match event {
//!         Event::MessageStart { stream, message } => { /* ... */ }
//!         Event::MessageData { stream, data } => { /* ... */ }
//!         Event::MessageEnd { stream } => { /* ... */ }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! The same `Connection` type drives HTTP/1.0 and HTTP/1.1 exchanges
//! (`Version::Http1`), including `upgrade: h2c` and prior-knowledge
//! switching to HTTP/2, so a server can sit on one port and take whatever
//! arrives.

mod buffer;
pub mod connection;
pub mod error;
pub mod frame;
mod h1;
pub mod hpack;
mod huffman;
pub mod message;
pub mod metrics;
pub mod settings;
mod stream;

pub use connection::{Connection, Event, Role, Version, MAX_CONTINUATIONS, PREFACE};
pub use error::{Error, ErrorCode};
pub use frame::Frame;
pub use hpack::{Decoder, Encoder};
pub use message::{Header, Message, MAX_HEADERS};
pub use settings::Settings;
