//! Inbound byte accumulator.
//!
//! The drive loop always sees a contiguous `&[u8]` and consumes from the
//! front; unconsumed bytes are retained via O(1) `advance()` instead of
//! shifting.

use bytes::{Buf, BytesMut};

/// Initial capacity for the accumulator.
pub(crate) const BUFFER_ALLOC_MIN: usize = 256;

pub(crate) struct Accumulator {
    buf: BytesMut,
}

impl Accumulator {
    pub fn new() -> Self {
        Accumulator {
            buf: BytesMut::with_capacity(BUFFER_ALLOC_MIN),
        }
    }

    /// Append received bytes. Grows the buffer if necessary.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The accumulated, not-yet-consumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len(), "consume({n}) exceeds {}", self.buf.len());
        self.buf.advance(n.min(self.buf.len()));
    }

    /// Discard everything.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
