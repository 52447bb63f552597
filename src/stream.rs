//! Per-stream state and the stream table.
//!
//! Every stream carries a single request-response exchange (plus push
//! promises). The `accept` bitmask tracks what may still happen on it; once
//! both the inbound and outbound halves go empty, the stream is released.

use std::collections::HashMap;

use crate::error::Error;

// Inbound half.
pub(crate) const ACCEPT_HEADERS: u8 = 0x01;
pub(crate) const ACCEPT_DATA: u8 = 0x02;
pub(crate) const ACCEPT_TRAILERS: u8 = 0x04;
pub(crate) const ACCEPT_INBOUND: u8 = ACCEPT_HEADERS | ACCEPT_DATA | ACCEPT_TRAILERS;
// Outbound half.
pub(crate) const ACCEPT_WRITE_HEADERS: u8 = 0x08;
pub(crate) const ACCEPT_WRITE_DATA: u8 = 0x10;
pub(crate) const ACCEPT_WRITE_PUSH: u8 = 0x20;
pub(crate) const ACCEPT_OUTBOUND: u8 =
    ACCEPT_WRITE_HEADERS | ACCEPT_WRITE_DATA | ACCEPT_WRITE_PUSH;
/// The peer may PUSH_PROMISE on this stream (client-initiated parent).
pub(crate) const ACCEPT_PUSH: u8 = 0x40;
/// Locally reset while the peer was already committed to a HEADERS sequence:
/// keep feeding the block through HPACK for table parity, then drop it.
pub(crate) const ACCEPT_NOP_HEADERS: u8 = 0x80;

/// How many locally-reset stream ids to remember. Frames on these streams
/// are tolerated under the assumption the peer has not seen the reset yet.
pub(crate) const RESET_HISTORY: usize = 7;

pub(crate) struct Stream {
    pub accept: u8,
    pub window_send: i32,
    pub window_recv: i32,
}

/// Stream table plus the per-side bookkeeping the protocol invariants need.
///
/// Sides are indexed by "was it locally initiated": `[0]` remote, `[1]` local.
pub(crate) struct StreamMap {
    streams: HashMap<u32, Stream>,
    client: bool,
    pub last_id: [u32; 2],
    pub count: [u32; 2],
    recently_reset: [u32; RESET_HISTORY],
    reset_next: usize,
}

impl StreamMap {
    pub fn new(client: bool) -> Self {
        StreamMap {
            streams: HashMap::new(),
            client,
            last_id: [0; 2],
            count: [0; 2],
            recently_reset: [0; RESET_HISTORY],
            reset_next: 0,
        }
    }

    /// Whether `id` has this side's parity (client-initiated ids are odd).
    pub fn is_local(&self, id: u32) -> bool {
        (id % 2 == 1) == self.client
    }

    /// Register a new stream.
    ///
    /// Checks parity, id monotonicity (HTTP/2) or id == 1 (HTTP/1), and the
    /// concurrency cap the *other* side declared for streams we open (and
    /// vice versa). Exceeding the cap is retriable for local streams and a
    /// peer violation for remote ones.
    pub fn open(
        &mut self,
        id: u32,
        local: bool,
        http2: bool,
        limit: u32,
        window_recv: i32,
        window_send: i32,
    ) -> Result<&mut Stream, Error> {
        if self.is_local(id) != local {
            return Err(Error::InvalidStream("incorrect parity"));
        }
        if http2 {
            if id <= self.last_id[local as usize] {
                return Err(Error::InvalidStream("nonmonotonic stream id"));
            }
            if id > 0x7fff_ffff {
                return Err(Error::InvalidStream("stream id space exhausted"));
            }
        } else if id != 1 {
            return Err(Error::InvalidStream("HTTP/1.x has only one stream"));
        }
        if self.count[local as usize] >= limit {
            return Err(if local {
                Error::WouldBlock("wait for a stream to end")
            } else {
                Error::Transport("peer exceeded stream limit")
            });
        }

        self.last_id[local as usize] = id;
        self.count[local as usize] += 1;
        Ok(self.streams.entry(id).or_insert(Stream {
            accept: 0,
            window_send,
            window_recv,
        }))
    }

    pub fn find(&self, id: u32) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Unlink a stream and decrement its side's live count.
    pub fn remove(&mut self, id: u32) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        self.count[self.is_local(id) as usize] -= 1;
        Some(stream)
    }

    /// Record a locally-initiated reset so late frames on `id` are tolerated.
    pub fn note_reset(&mut self, id: u32) {
        self.recently_reset[self.reset_next] = id;
        self.reset_next = (self.reset_next + 1) % RESET_HISTORY;
    }

    /// Whether `id` could plausibly be a stream the peer has not yet seen
    /// our reset for.
    pub fn recently_reset(&self, id: u32) -> bool {
        id != 0
            && id <= self.last_id[self.is_local(id) as usize]
            && self.recently_reset.contains(&id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.streams.keys().copied().collect()
    }
}
