//! Message and header types, plus the pseudo-header validation that bridges
//! HTTP/1.x-style messages and HTTP/2 header blocks (RFC 9113 Section 8.3).

/// Maximum number of headers accepted on an inbound message. Applies to
/// both HTTP/1.x heads and decoded HTTP/2 header blocks.
pub const MAX_HEADERS: usize = 64;

/// A single header name-value pair. Names are kept lowercase on both the
/// decode and encode paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl Header {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Dynamic-table cost of this entry (RFC 7541 Section 4.1).
    pub(crate) fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// A request or response head.
///
/// For requests, `method` and `path` are set and `code` is 0; `headers` may
/// begin with `:authority` and `:scheme`. For responses, `code` is set. The
/// same value can be handed back to `send_message` on another connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub code: u32,
    pub method: Vec<u8>,
    pub path: Vec<u8>,
    pub headers: Vec<Header>,
}

impl Message {
    pub fn request(
        method: impl Into<Vec<u8>>,
        path: impl Into<Vec<u8>>,
        headers: Vec<Header>,
    ) -> Self {
        Self {
            code: 0,
            method: method.into(),
            path: path.into(),
            headers,
        }
    }

    pub fn response(code: u32, headers: Vec<Header>) -> Self {
        Self {
            code,
            method: Vec::new(),
            path: Vec::new(),
            headers,
        }
    }
}

/// What a decoded header block is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Request,
    Response,
    Trailers,
}

/// The block violated HTTP semantics; the stream gets RST_STREAM(PROTOCOL_ERROR).
pub(crate) struct InvalidMessage;

/// Validate a decoded header block and fold it into a [`Message`].
///
/// Enforces: pseudo-headers lead the block; names carry no uppercase ASCII;
/// only the defined pseudo-headers appear, each at most once; requests carry
/// exactly one `:method`, non-empty `:path` and `:scheme`; responses carry
/// exactly one all-digits `:status`; trailers carry no pseudo-headers at all.
///
/// `:method`, `:path` and `:status` move into the message fields;
/// `:authority` and `:scheme` stay at the front of the header list.
pub(crate) fn interpret(
    headers: Vec<Header>,
    kind: BlockKind,
) -> Result<Message, InvalidMessage> {
    let mut msg = Message::default();
    msg.headers.reserve(headers.len());

    let mut seen_regular = false;
    let mut has_method = false;
    let mut has_path = false;
    let mut has_scheme = false;
    let mut has_authority = false;

    for header in headers {
        if header.name.first() == Some(&b':') {
            if seen_regular || kind == BlockKind::Trailers {
                return Err(InvalidMessage);
            }
            match (kind, header.name.as_slice()) {
                (BlockKind::Response, b":status") => {
                    if msg.code != 0 {
                        return Err(InvalidMessage);
                    }
                    msg.code = parse_status(&header.value)?;
                }
                (BlockKind::Request, b":method") => {
                    if has_method {
                        return Err(InvalidMessage);
                    }
                    has_method = true;
                    msg.method = header.value;
                }
                (BlockKind::Request, b":path") => {
                    if has_path {
                        return Err(InvalidMessage);
                    }
                    has_path = true;
                    msg.path = header.value;
                }
                (BlockKind::Request, b":authority") => {
                    if has_authority {
                        return Err(InvalidMessage);
                    }
                    has_authority = true;
                    msg.headers.push(header);
                }
                (BlockKind::Request, b":scheme") => {
                    if has_scheme {
                        return Err(InvalidMessage);
                    }
                    has_scheme = true;
                    msg.headers.push(header);
                }
                _ => return Err(InvalidMessage),
            }
        } else {
            seen_regular = true;
            if header.name.iter().any(u8::is_ascii_uppercase) {
                return Err(InvalidMessage);
            }
            msg.headers.push(header);
        }
    }

    match kind {
        BlockKind::Request => {
            if !has_method
                || msg.method.is_empty()
                || !has_path
                || msg.path.is_empty()
                || !has_scheme
            {
                return Err(InvalidMessage);
            }
        }
        BlockKind::Response => {
            if msg.code == 0 {
                return Err(InvalidMessage);
            }
        }
        BlockKind::Trailers => {}
    }

    Ok(msg)
}

fn parse_status(value: &[u8]) -> Result<u32, InvalidMessage> {
    if value.is_empty() {
        return Err(InvalidMessage);
    }
    let mut code: u32 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err(InvalidMessage);
        }
        code = code
            .checked_mul(10)
            .and_then(|c| c.checked_add(u32::from(b - b'0')))
            .ok_or(InvalidMessage)?;
    }
    Ok(code)
}
