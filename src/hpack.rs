//! HPACK header compression (RFC 7541).
//!
//! Both directions share the same dynamic-table machinery; the [`Encoder`]
//! additionally tracks the pending table-limit updates that SETTINGS changes
//! schedule, so a shrink-then-grow sequence costs at most two size-update
//! prefixes in the next header block.

use std::collections::VecDeque;

use crate::error::Error;
use crate::huffman;
use crate::message::Header;

// -- Prefix integers (RFC 7541 Section 5.1) --

pub(crate) fn encode_int(out: &mut Vec<u8>, value: usize, prefix: u8, pattern: u8) {
    let max = (1usize << prefix) - 1;
    if value < max {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

/// Decode an integer with an N-bit prefix. Returns `(value, bytes consumed)`.
///
/// Header blocks are complete by the time they reach the decoder, so a
/// truncated integer is a peer error, not a need-more-data condition.
pub(crate) fn decode_int(buf: &[u8], prefix: u8) -> Result<(usize, usize), Error> {
    let first = *buf.first().ok_or(Error::Transport("truncated header block"))?;
    let max = (1usize << prefix) - 1;
    let head = usize::from(first) & max;
    if head < max {
        return Ok((head, 1));
    }
    let mut value = max;
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        value += (usize::from(b) & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        if shift > usize::BITS - 8 {
            return Err(Error::Transport("header integer overflow"));
        }
    }
    Err(Error::Transport("truncated header integer"))
}

// -- String literals (RFC 7541 Section 5.2) --

fn encode_string(out: &mut Vec<u8>, data: &[u8]) {
    let huffman_len = huffman::encoded_len(data);
    if huffman_len < data.len() {
        encode_int(out, huffman_len, 7, 0x80);
        huffman::encode(data, out);
    } else {
        encode_int(out, data.len(), 7, 0x00);
        out.extend_from_slice(data);
    }
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), Error> {
    let first = *buf.first().ok_or(Error::Transport("truncated header block"))?;
    let (len, consumed) = decode_int(buf, 7)?;
    let total = consumed + len;
    if buf.len() < total {
        return Err(Error::Transport("truncated string literal"));
    }
    let raw = &buf[consumed..total];
    let value = if first & 0x80 != 0 {
        huffman::decode(raw)?
    } else {
        raw.to_vec()
    };
    Ok((value, total))
}

// -- Static table (RFC 7541 Appendix A) --

const STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),                   // 1
    (b":method", b"GET"),                   // 2
    (b":method", b"POST"),                  // 3
    (b":path", b"/"),                       // 4
    (b":path", b"/index.html"),             // 5
    (b":scheme", b"http"),                  // 6
    (b":scheme", b"https"),                 // 7
    (b":status", b"200"),                   // 8
    (b":status", b"204"),                   // 9
    (b":status", b"206"),                   // 10
    (b":status", b"304"),                   // 11
    (b":status", b"400"),                   // 12
    (b":status", b"404"),                   // 13
    (b":status", b"500"),                   // 14
    (b"accept-charset", b""),               // 15
    (b"accept-encoding", b"gzip, deflate"), // 16
    (b"accept-language", b""),              // 17
    (b"accept-ranges", b""),                // 18
    (b"accept", b""),                       // 19
    (b"access-control-allow-origin", b""),  // 20
    (b"age", b""),                          // 21
    (b"allow", b""),                        // 22
    (b"authorization", b""),                // 23
    (b"cache-control", b""),                // 24
    (b"content-disposition", b""),          // 25
    (b"content-encoding", b""),             // 26
    (b"content-language", b""),             // 27
    (b"content-length", b""),               // 28
    (b"content-location", b""),             // 29
    (b"content-range", b""),                // 30
    (b"content-type", b""),                 // 31
    (b"cookie", b""),                       // 32
    (b"date", b""),                         // 33
    (b"etag", b""),                         // 34
    (b"expect", b""),                       // 35
    (b"expires", b""),                      // 36
    (b"from", b""),                         // 37
    (b"host", b""),                         // 38
    (b"if-match", b""),                     // 39
    (b"if-modified-since", b""),            // 40
    (b"if-none-match", b""),                // 41
    (b"if-range", b""),                     // 42
    (b"if-unmodified-since", b""),          // 43
    (b"last-modified", b""),                // 44
    (b"link", b""),                         // 45
    (b"location", b""),                     // 46
    (b"max-forwards", b""),                 // 47
    (b"proxy-authenticate", b""),           // 48
    (b"proxy-authorization", b""),          // 49
    (b"range", b""),                        // 50
    (b"referer", b""),                      // 51
    (b"refresh", b""),                      // 52
    (b"retry-after", b""),                  // 53
    (b"server", b""),                       // 54
    (b"set-cookie", b""),                   // 55
    (b"strict-transport-security", b""),    // 56
    (b"transfer-encoding", b""),            // 57
    (b"user-agent", b""),                   // 58
    (b"vary", b""),                         // 59
    (b"via", b""),                          // 60
    (b"www-authenticate", b""),             // 61
];

// -- Dynamic table --

/// Ordered newest-first; eviction is strictly from the tail.
struct DynamicTable {
    entries: VecDeque<Header>,
    size: usize,
    limit: usize,
}

impl DynamicTable {
    fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            limit,
        }
    }

    fn get(&self, index: usize) -> Option<&Header> {
        self.entries.get(index)
    }

    fn insert(&mut self, header: Header) {
        let cost = header.size();
        while self.size + cost > self.limit {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                // An entry bigger than the whole table empties it (RFC 7541
                // Section 4.4) and is itself not stored.
                None => return,
            }
        }
        self.size += cost;
        self.entries.push_front(header);
    }

    fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        while self.size > self.limit {
            if let Some(evicted) = self.entries.pop_back() {
                self.size -= evicted.size();
            }
        }
    }

    fn clear(&mut self) {
        let limit = self.limit;
        self.set_limit(0);
        self.limit = limit;
    }
}

// -- Decoder --

/// HPACK decoder. `limit_upper` is the cap this side granted the peer's
/// encoder via SETTINGS_HEADER_TABLE_SIZE; size updates above it are fatal.
pub struct Decoder {
    table: DynamicTable,
    limit_upper: usize,
}

impl Decoder {
    pub fn new(limit: usize) -> Self {
        Self {
            table: DynamicTable::new(limit),
            limit_upper: limit,
        }
    }

    pub(crate) fn set_limit_upper(&mut self, limit: usize) {
        self.limit_upper = limit;
    }

    pub(crate) fn clear(&mut self) {
        self.table.clear();
    }

    /// Decode a complete header block, returning at most `max` headers.
    ///
    /// Any error here corrupts the shared compression state and must kill
    /// the connection. Entries past `max` are dropped after decoding so the
    /// dynamic table stays synchronized.
    pub fn decode(&mut self, buf: &[u8], max: usize) -> Result<Vec<Header>, Error> {
        let mut out = Vec::new();
        let mut at = 0usize;

        while at < buf.len() {
            let head = buf[at];

            if head & 0x80 != 0 {
                // Indexed field (Section 6.1).
                let (index, n) = decode_int(&buf[at..], 7)?;
                at += n;
                let header = self.lookup(index)?;
                if out.len() < max {
                    out.push(header);
                }
            } else if head & 0x40 != 0 {
                // Literal with incremental indexing (Section 6.2.1).
                at += self.decode_literal(&buf[at..], 6, true, max, &mut out)?;
            } else if head & 0x20 != 0 {
                // Dynamic table size update (Section 6.3).
                let (size, n) = decode_int(&buf[at..], 5)?;
                at += n;
                if size > self.limit_upper {
                    return Err(Error::Transport("dynamic table size update too big"));
                }
                self.table.set_limit(size);
            } else {
                // Literal without indexing (0000xxxx) or never indexed
                // (0001xxxx); neither touches the dynamic table.
                at += self.decode_literal(&buf[at..], 4, false, max, &mut out)?;
            }
        }

        Ok(out)
    }

    fn decode_literal(
        &mut self,
        buf: &[u8],
        prefix: u8,
        index_it: bool,
        max: usize,
        out: &mut Vec<Header>,
    ) -> Result<usize, Error> {
        let (name_index, mut at) = decode_int(buf, prefix)?;
        let name = if name_index > 0 {
            self.lookup(name_index)?.name
        } else {
            let (name, n) = decode_string(&buf[at..])?;
            at += n;
            name
        };
        let (value, n) = decode_string(&buf[at..])?;
        at += n;

        let header = Header { name, value };
        if index_it {
            self.table.insert(header.clone());
        }
        if out.len() < max {
            out.push(header);
        }
        Ok(at)
    }

    fn lookup(&self, index: usize) -> Result<Header, Error> {
        if index == 0 {
            return Err(Error::Transport("header index 0 is reserved"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok(Header::new(name, value));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(Error::Transport("dynamic table index out of bounds"))
    }
}

// -- Encoder --

/// HPACK encoder. `set_limit` only schedules a table-limit change; the
/// update prefixes are emitted (coalesced) at the start of the next block.
pub struct Encoder {
    table: DynamicTable,
    limit_upper: usize,
    limit_update_min: usize,
    limit_update_end: usize,
}

impl Encoder {
    pub fn new(limit: usize) -> Self {
        Self {
            table: DynamicTable::new(limit),
            limit_upper: limit,
            limit_update_min: limit,
            limit_update_end: limit,
        }
    }

    /// Schedule a table-limit change. Repeated calls between blocks collapse
    /// into at most two updates: the smallest requested limit, then the
    /// final one.
    pub fn set_limit(&mut self, limit: usize) {
        if self.limit_update_min > limit {
            self.limit_update_min = limit;
        }
        self.limit_update_end = limit;
    }

    /// Adopt the peer's SETTINGS_HEADER_TABLE_SIZE.
    pub(crate) fn set_limit_upper(&mut self, limit: usize) {
        self.limit_upper = limit;
        self.set_limit(limit);
    }

    pub(crate) fn clear(&mut self) {
        self.table.clear();
    }

    /// Encode a header list, preceded by any pending size updates.
    pub fn encode(&mut self, headers: &[Header], out: &mut Vec<u8>) {
        if self.table.limit != self.limit_update_min {
            self.table.set_limit(self.limit_update_min);
            encode_int(out, self.limit_update_min, 5, 0x20);
        }
        if self.table.limit != self.limit_update_end {
            self.table.set_limit(self.limit_update_end);
            encode_int(out, self.limit_update_end, 5, 0x20);
            self.limit_update_min = self.limit_update_end;
        }

        for header in headers {
            self.encode_one(header, out);
        }
    }

    fn encode_one(&mut self, header: &Header, out: &mut Vec<u8>) {
        let (full, name_only) = self.find(header);

        if let Some(index) = full {
            encode_int(out, index, 7, 0x80);
        } else if let Some(index) = name_only {
            encode_int(out, index, 6, 0x40);
            encode_string(out, &header.value);
            self.table.insert(header.clone());
        } else {
            encode_int(out, 0, 4, 0x00);
            encode_string(out, &header.name);
            encode_string(out, &header.value);
        }
    }

    /// Best match for `header`: a full (name+value) index if one exists,
    /// and otherwise the first name-only index.
    fn find(&self, header: &Header) -> (Option<usize>, Option<usize>) {
        let mut name_only = None;
        for (i, &(name, value)) in STATIC_TABLE.iter().enumerate() {
            if name == header.name.as_slice() {
                if value == header.value.as_slice() {
                    return (Some(i + 1), name_only);
                }
                if name_only.is_none() {
                    name_only = Some(i + 1);
                }
            }
        }
        for (i, entry) in self.table.entries.iter().enumerate() {
            if entry.name == header.name {
                if entry.value == header.value {
                    return (Some(STATIC_TABLE.len() + 1 + i), name_only);
                }
                if name_only.is_none() {
                    name_only = Some(STATIC_TABLE.len() + 1 + i);
                }
            }
        }
        (None, name_only)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_HEADERS;

    fn h(name: &str, value: &str) -> Header {
        Header::new(name.as_bytes(), value.as_bytes())
    }

    fn round_trip(headers: &[Header]) -> Vec<Header> {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        let mut buf = Vec::new();
        enc.encode(headers, &mut buf);
        dec.decode(&buf, MAX_HEADERS).unwrap()
    }

    #[test]
    fn prefix_int_round_trip() {
        for &(value, prefix, pattern) in &[
            (0usize, 7u8, 0x80u8),
            (5, 7, 0x80),
            (126, 7, 0x80),
            (127, 7, 0x80),
            (128, 7, 0x80),
            (1337, 5, 0x20),
            (0, 5, 0x20),
            (31, 5, 0x20),
            (32, 5, 0x20),
            (4096, 5, 0x20),
            (15, 4, 0x00),
            (16, 4, 0x00),
        ] {
            let mut buf = Vec::new();
            encode_int(&mut buf, value, prefix, pattern);
            let (decoded, len) = decode_int(&buf, prefix).unwrap();
            assert_eq!(decoded, value, "value {value} prefix {prefix}");
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn rfc7541_appendix_c1_examples() {
        let mut buf = Vec::new();
        encode_int(&mut buf, 10, 5, 0x00);
        assert_eq!(buf, [0x0a]);

        let mut buf = Vec::new();
        encode_int(&mut buf, 1337, 5, 0x00);
        assert_eq!(buf, [0x1f, 0x9a, 0x0a]);
    }

    #[test]
    fn truncated_int_rejected() {
        // 5-bit prefix saturated, continuation byte promised but missing.
        assert!(decode_int(&[0x1f, 0x80], 5).is_err());
        assert!(decode_int(&[], 7).is_err());
    }

    #[test]
    fn overflowing_int_rejected() {
        let mut buf = vec![0x7f];
        buf.extend_from_slice(&[0xff; 12]);
        assert!(decode_int(&buf, 7).is_err());
    }

    #[test]
    fn static_table_size() {
        assert_eq!(STATIC_TABLE.len(), 61);
    }

    #[test]
    fn fully_indexed_static_header() {
        let headers = vec![h(":method", "GET")];
        let mut enc = Encoder::new(4096);
        let mut buf = Vec::new();
        enc.encode(&headers, &mut buf);
        assert_eq!(buf, [0x82]); // static index 2
        assert_eq!(round_trip(&headers), headers);
    }

    #[test]
    fn name_match_inserts_into_dynamic_table() {
        let headers = vec![h(":path", "/somewhere")];
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);

        let mut first = Vec::new();
        enc.encode(&headers, &mut first);
        assert_eq!(dec.decode(&first, MAX_HEADERS).unwrap(), headers);

        // Second encoding hits the dynamic table: a single indexed byte.
        let mut second = Vec::new();
        enc.encode(&headers, &mut second);
        assert_eq!(second, [0x80 | 62]);
        assert_eq!(dec.decode(&second, MAX_HEADERS).unwrap(), headers);
    }

    #[test]
    fn fresh_name_is_not_indexed() {
        let headers = vec![h("x-custom", "v1")];
        let mut enc = Encoder::new(4096);
        let mut buf1 = Vec::new();
        enc.encode(&headers, &mut buf1);
        // Literal without indexing: re-encoding produces identical bytes.
        let mut buf2 = Vec::new();
        enc.encode(&headers, &mut buf2);
        assert_eq!(buf1, buf2);
        assert_eq!(buf1[0], 0x00);
        assert_eq!(round_trip(&headers), headers);
    }

    #[test]
    fn mixed_block_round_trip() {
        let headers = vec![
            h(":method", "POST"),
            h(":scheme", "https"),
            h(":path", "/submit"),
            h(":authority", "example.com"),
            h("content-type", "application/json"),
            h("x-request-id", "abc123"),
        ];
        assert_eq!(round_trip(&headers), headers);
    }

    #[test]
    fn decoder_enforces_upper_limit_on_size_update() {
        let mut dec = Decoder::new(4096);
        let mut buf = Vec::new();
        encode_int(&mut buf, 8192, 5, 0x20);
        assert!(dec.decode(&buf, MAX_HEADERS).is_err());
    }

    #[test]
    fn size_update_alone_yields_no_headers() {
        let mut dec = Decoder::new(4096);
        let mut buf = Vec::new();
        encode_int(&mut buf, 128, 5, 0x20);
        assert!(dec.decode(&buf, MAX_HEADERS).unwrap().is_empty());
    }

    #[test]
    fn size_updates_coalesce_to_two() {
        let mut enc = Encoder::new(4096);
        enc.set_limit(1024);
        enc.set_limit(2048);
        let mut buf = Vec::new();
        enc.encode(&[h(":method", "GET")], &mut buf);

        // First update: min requested limit (1024 with 5-bit prefix).
        let (v1, n1) = decode_int(&buf, 5).unwrap();
        assert_eq!(buf[0] & 0xe0, 0x20);
        assert_eq!(v1, 1024);
        // Second update: final limit.
        let (v2, n2) = decode_int(&buf[n1..], 5).unwrap();
        assert_eq!(buf[n1] & 0xe0, 0x20);
        assert_eq!(v2, 2048);
        // Then the header itself.
        assert_eq!(buf[n1 + n2], 0x82);

        // The next block carries no further updates.
        let mut buf2 = Vec::new();
        enc.encode(&[h(":method", "GET")], &mut buf2);
        assert_eq!(buf2, [0x82]);
    }

    #[test]
    fn single_shrink_emits_one_update() {
        let mut enc = Encoder::new(4096);
        enc.set_limit(256);
        let mut buf = Vec::new();
        enc.encode(&[h(":method", "GET")], &mut buf);
        let (v, n) = decode_int(&buf, 5).unwrap();
        assert_eq!(v, 256);
        assert_eq!(&buf[n..], [0x82]);
    }

    #[test]
    fn eviction_keeps_size_within_limit() {
        let mut table = DynamicTable::new(100);
        table.insert(h("aaaa", "bbbb")); // cost 40
        table.insert(h("cccc", "dddd")); // cost 40
        assert_eq!(table.entries.len(), 2);
        table.insert(h("eeee", "ffff")); // evicts the oldest
        assert_eq!(table.entries.len(), 2);
        assert!(table.size <= 100);
        assert_eq!(table.entries.front().unwrap().name, b"eeee");
        assert_eq!(table.entries.back().unwrap().name, b"cccc");
    }

    #[test]
    fn oversized_entry_empties_table() {
        let mut table = DynamicTable::new(64);
        table.insert(h("small", "v"));
        table.insert(Header::new(vec![b'x'; 100], vec![b'y'; 100]));
        assert!(table.entries.is_empty());
        assert_eq!(table.size, 0);
    }

    #[test]
    fn clear_empties_but_keeps_limit() {
        let mut table = DynamicTable::new(4096);
        table.insert(h("a", "b"));
        table.clear();
        assert!(table.entries.is_empty());
        assert_eq!(table.limit, 4096);
    }

    #[test]
    fn index_zero_rejected() {
        let mut dec = Decoder::new(4096);
        assert!(dec.decode(&[0x80], MAX_HEADERS).is_err());
    }

    #[test]
    fn dynamic_index_out_of_bounds_rejected() {
        let mut dec = Decoder::new(4096);
        let mut buf = Vec::new();
        encode_int(&mut buf, 62, 7, 0x80); // dynamic table is empty
        assert!(dec.decode(&buf, MAX_HEADERS).is_err());
    }

    #[test]
    fn decode_cap_drops_excess_headers() {
        let headers: Vec<Header> = (0..10).map(|i| h("x-n", &i.to_string())).collect();
        let mut enc = Encoder::new(4096);
        let mut buf = Vec::new();
        enc.encode(&headers, &mut buf);
        let mut dec = Decoder::new(4096);
        let decoded = dec.decode(&buf, 4).unwrap();
        assert_eq!(decoded.len(), 4);
        assert_eq!(decoded, headers[..4]);
    }

    #[test]
    fn never_indexed_literal_decodes() {
        // 0001 0000, then "a": "b" as plain literals.
        let mut buf = vec![0x10];
        encode_int(&mut buf, 1, 7, 0x00);
        buf.push(b'a');
        encode_int(&mut buf, 1, 7, 0x00);
        buf.push(b'b');
        let mut dec = Decoder::new(4096);
        assert_eq!(dec.decode(&buf, MAX_HEADERS).unwrap(), vec![h("a", "b")]);
    }
}
