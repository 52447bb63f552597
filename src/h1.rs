//! HTTP/1.x head parsing.
//!
//! A deliberately small parser: strict CRLF line endings, versions 1.0 and
//! 1.1 only, header names normalized to lowercase at this boundary (HTTP/2
//! requires lowercase names, and the engine treats both modes uniformly
//! above this layer).

use crate::error::Error;
use crate::message::{Header, MAX_HEADERS};

/// A parsed request or response head. Versions other than 1.0 and 1.1 are
/// rejected before one of these is produced.
pub(crate) struct Http1Head {
    /// Status code; 0 for requests.
    pub code: u32,
    pub method: Vec<u8>,
    pub path: Vec<u8>,
    pub headers: Vec<Header>,
}

pub(crate) enum H1Parse {
    /// The head is not complete yet; feed more bytes.
    NeedMore,
    /// A complete head and the number of bytes it occupied.
    Head(Http1Head, usize),
}

/// Parse a request head (`METHOD SP PATH SP HTTP/1.x CRLF headers CRLF`).
pub(crate) fn parse_request(buf: &[u8]) -> Result<H1Parse, Error> {
    let Some(end) = find_head_end(buf) else {
        return Ok(H1Parse::NeedMore);
    };
    let mut lines = buf[..end].split(|&b| b == b'\n');
    let start = trim_cr(lines.next().unwrap_or(b""));

    let mut parts = start.splitn(3, |&b| b == b' ');
    let method = parts.next().unwrap_or(b"");
    let path = parts.next().unwrap_or(b"");
    let version = parts.next().unwrap_or(b"");
    if method.is_empty() || path.is_empty() {
        return Err(Error::Transport("bad HTTP/1.x request line"));
    }
    parse_version(version)?;

    Ok(H1Parse::Head(
        Http1Head {
            code: 0,
            method: method.to_vec(),
            path: path.to_vec(),
            headers: parse_header_lines(lines)?,
        },
        end + 4,
    ))
}

/// Parse a response head (`HTTP/1.x SP CODE [SP reason] CRLF headers CRLF`).
pub(crate) fn parse_response(buf: &[u8]) -> Result<H1Parse, Error> {
    let Some(end) = find_head_end(buf) else {
        return Ok(H1Parse::NeedMore);
    };
    let mut lines = buf[..end].split(|&b| b == b'\n');
    let start = trim_cr(lines.next().unwrap_or(b""));

    let mut parts = start.splitn(3, |&b| b == b' ');
    parse_version(parts.next().unwrap_or(b""))?;
    let code_bytes = parts.next().unwrap_or(b"");
    if code_bytes.len() != 3 || !code_bytes.iter().all(u8::is_ascii_digit) {
        return Err(Error::Transport("bad HTTP/1.x status line"));
    }
    let code = code_bytes
        .iter()
        .fold(0u32, |c, &b| c * 10 + u32::from(b - b'0'));

    Ok(H1Parse::Head(
        Http1Head {
            code,
            method: Vec::new(),
            path: Vec::new(),
            headers: parse_header_lines(lines)?,
        },
        end + 4,
    ))
}

/// Parse a chunk-size line (`<hex>CRLF`) at the start of `buf`.
///
/// Returns `None` while the line is incomplete, else the chunk size and the
/// line length (CRLF included). The size must be pure hex digits followed
/// immediately by CRLF; chunk extensions are not accepted.
pub(crate) fn parse_chunk_size(buf: &[u8]) -> Result<Option<(usize, usize)>, Error> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    if nl == 0 || buf[nl - 1] != b'\r' {
        return Err(Error::Transport("chunked encoding parse error"));
    }
    let digits = &buf[..nl - 1];
    if digits.is_empty() || digits.len() > 8 || !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::Transport("chunked encoding parse error"));
    }
    let size = digits.iter().fold(0usize, |size, &b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => b - b'A' + 10,
        };
        size * 16 + usize::from(digit)
    });
    Ok(Some((size, nl + 1)))
}

/// Offset of the `\r\n\r\n` terminating the head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_version(token: &[u8]) -> Result<(), Error> {
    match token {
        b"HTTP/1.0" | b"HTTP/1.1" => Ok(()),
        _ => Err(Error::Transport("unsupported HTTP version")),
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a [u8]>,
) -> Result<Vec<Header>, Error> {
    let mut headers = Vec::new();
    for line in lines {
        let line = trim_cr(line);
        if line.is_empty() {
            continue;
        }
        if headers.len() >= MAX_HEADERS {
            return Err(Error::Transport("too many headers"));
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(Error::Transport("bad HTTP/1.x header line"))?;
        let name: Vec<u8> = line[..colon]
            .iter()
            .map(u8::to_ascii_lowercase)
            .collect();
        if name.is_empty() {
            return Err(Error::Transport("bad HTTP/1.x header line"));
        }
        let value = trim_spaces(&line[colon + 1..]);
        headers.push(Header::new(name, value));
    }
    Ok(headers)
}

fn trim_spaces(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_of(result: Result<H1Parse, Error>) -> (Http1Head, usize) {
        match result.unwrap() {
            H1Parse::Head(head, consumed) => (head, consumed),
            H1Parse::NeedMore => panic!("expected a complete head"),
        }
    }

    #[test]
    fn simple_request() {
        let buf = b"GET /path HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\nrest";
        let (head, consumed) = head_of(parse_request(buf));
        assert_eq!(head.method, b"GET");
        assert_eq!(head.path, b"/path");
        assert_eq!(consumed, buf.len() - 4);
        // Names come out lowercased.
        assert_eq!(head.headers[0], Header::new("host", "x"));
        assert_eq!(head.headers[1], Header::new("accept", "*/*"));
    }

    #[test]
    fn simple_response() {
        let buf = b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (head, consumed) = head_of(parse_response(buf));
        assert_eq!(head.code, 404);
        assert_eq!(consumed, buf.len());
        assert_eq!(head.headers[0], Header::new("content-length", "0"));
    }

    #[test]
    fn incomplete_head_needs_more() {
        assert!(matches!(
            parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap(),
            H1Parse::NeedMore
        ));
    }

    #[test]
    fn unsupported_version_rejected() {
        assert!(parse_request(b"GET / HTTP/2.0\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/0.9\r\n\r\n").is_err());
        assert!(parse_response(b"ICY 200 OK\r\n\r\n").is_err());
    }

    #[test]
    fn malformed_lines_rejected() {
        assert!(parse_request(b"GET\r\n\r\n").is_err());
        assert!(parse_request(b"GET / HTTP/1.1\r\nno-colon-here\r\n\r\n").is_err());
        assert!(parse_response(b"HTTP/1.1 20 OK\r\n\r\n").is_err());
        assert!(parse_response(b"HTTP/1.1 2000 OK\r\n\r\n").is_err());
    }

    #[test]
    fn status_without_reason_accepted() {
        let (head, _) = head_of(parse_response(b"HTTP/1.1 204\r\n\r\n"));
        assert_eq!(head.code, 204);
    }

    #[test]
    fn header_value_whitespace_trimmed() {
        let (head, _) = head_of(parse_request(b"GET / HTTP/1.1\r\nkey:  padded \r\n\r\n"));
        assert_eq!(head.headers[0], Header::new("key", "padded"));
    }

    #[test]
    fn chunk_size_line() {
        assert!(parse_chunk_size(b"1a").unwrap().is_none());
        assert_eq!(parse_chunk_size(b"1a\r\ndata").unwrap(), Some((26, 4)));
        assert_eq!(parse_chunk_size(b"0\r\n\r\n").unwrap(), Some((0, 3)));
        assert!(parse_chunk_size(b"zz\r\n").is_err());
        assert!(parse_chunk_size(b"\r\n").is_err());
        assert!(parse_chunk_size(b"5\n").is_err()); // bare LF
        assert!(parse_chunk_size(b"5;ext=1\r\n").is_err()); // no extensions
        assert!(parse_chunk_size(b"123456789\r\n").is_err()); // oversized
    }
}
