//! HTTP/1.1 upgrade handshake for exec sessions.
//!
//! `POST /exec/{id}/start` answers `101 UPGRADED` and then carries the
//! multiplexed exec stream on the same connection. After [`read_head`]
//! the stream is positioned at the first raw byte.

use std::io::{Read, Write};

/// Host header sent on the upgrade request; the Unix socket ignores it.
const HOST: &str = "docker";

/// Upper bound on the size of a response head.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on an error body read after a refused upgrade.
const MAX_ERROR_BODY_BYTES: u64 = 64 * 1024;

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Header pairs with lower-cased names.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Returns the first value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length").and_then(|v| v.trim().parse().ok())
    }
}

/// Writes a JSON `POST` asking the server to hijack the connection into a
/// raw stream.
///
/// # Errors
///
/// Returns the underlying I/O error if writing fails.
pub fn write_upgrade_request(stream: &mut impl Write, path: &str, body: &[u8]) -> std::io::Result<()> {
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {HOST}\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(request.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

/// Reads the status line and headers, stopping right after the blank line.
///
/// Reads one byte at a time so that no stream bytes are consumed.
///
/// # Errors
///
/// Returns `InvalidData` if the head is malformed or too large, and
/// `UnexpectedEof` if the stream closes first.
pub fn read_head(stream: &mut impl Read) -> std::io::Result<ResponseHead> {
    let mut raw = Vec::with_capacity(512);
    let mut byte = [0_u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        if raw.len() >= MAX_HEAD_BYTES {
            return Err(invalid("response head too large"));
        }
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                ));
            }
            Ok(_) => raw.push(byte[0]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    parse_head(&raw[..raw.len() - 4])
}

/// Reads the body of a refused upgrade, best effort.
///
/// Honors `Content-Length` when present and otherwise reads to EOF, both
/// capped. Read errors end the body early.
pub fn read_error_body(stream: &mut impl Read, head: &ResponseHead) -> Vec<u8> {
    let limit = head
        .content_length()
        .map_or(MAX_ERROR_BODY_BYTES, |length| length.min(MAX_ERROR_BODY_BYTES));
    let mut body = Vec::new();
    let _ = stream.take(limit).read_to_end(&mut body);
    body
}

fn parse_head(raw: &[u8]) -> std::io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| invalid("missing status line"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| invalid(format!("invalid status line {status_line:?}")))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    Ok(ResponseHead { status, headers })
}

fn invalid(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}
