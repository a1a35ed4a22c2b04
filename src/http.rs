//! HTTP/1.x message framing and rewriting.
//!
//! Requests and responses share one shape: a start line, a header map and an
//! opaque body. Framing is deliberately minimal: header blocks end at CRLFCRLF
//! and bodies are sized by `Content-Length` only.

use std::collections::BTreeMap;
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::error::{ProxyError, Result};

// ============================================================================
// CONSTANTS
// ============================================================================

pub const HEADER_TERMINATOR: &[u8; 4] = b"\r\n\r\n";
pub const READ_CHUNK: usize = 4096;
pub const MAX_HEADER_BYTES: usize = 64 * 1024;
pub const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

// ============================================================================
// START LINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl StartLine {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let mut parts = line.splitn(3, ' ');

        let first = parts.next().unwrap_or_default();
        let second = parts.next().map(str::trim).unwrap_or_default();
        let rest = parts.next().map(str::trim).unwrap_or_default();

        if first.is_empty() || second.is_empty() {
            return Err(ProxyError::MalformedStartLine(line.to_string()));
        }

        if first.starts_with("HTTP/") {
            let status = second
                .parse::<u16>()
                .map_err(|_| ProxyError::MalformedStartLine(line.to_string()))?;
            Ok(StartLine::Response {
                version: first.to_string(),
                status,
                reason: rest.to_string(),
            })
        } else {
            // Tolerate a missing version, as old clients send `GET /path`.
            let version = if rest.is_empty() { "HTTP/1.0" } else { rest };
            Ok(StartLine::Request {
                method: first.to_string(),
                target: second.to_string(),
                version: version.to_string(),
            })
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request {
                method,
                target,
                version,
            } => write!(f, "{} {} {}", method, target, version),
            StartLine::Response {
                version,
                status,
                reason,
            } if reason.is_empty() => write!(f, "{} {}", version, status),
            StartLine::Response {
                version,
                status,
                reason,
            } => write!(f, "{} {} {}", version, status, reason),
        }
    }
}

// ============================================================================
// HEADERS
// ============================================================================

/// Case-insensitive header map. Names are stored lower-cased; the last write
/// for a name wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<String, String>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .insert(name.trim().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// MESSAGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start: StartLine,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpMessage {
    /// Parses a header block (start line plus header lines, with or without
    /// the trailing blank line). Header lines without a `:` are skipped.
    pub fn parse_head(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.lines();

        let start = StartLine::parse(lines.next().unwrap_or_default())?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    headers.insert(name, value.trim());
                }
                _ => debug!("Ignoring malformed header line: {:?}", line),
            }
        }

        Ok(Self {
            start,
            headers,
            body: Vec::new(),
        })
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// Request target, `None` for responses.
    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// Replaces the request target. Returns false for responses.
    pub fn set_target(&mut self, new_target: impl Into<String>) -> bool {
        match &mut self.start {
            StartLine::Request { target, .. } => {
                *target = new_target.into();
                true
            }
            StartLine::Response { .. } => false,
        }
    }

    /// Inserts or replaces a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Declared body length. Absent or unparsable means zero.
    pub fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.start.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A message read off the wire, keeping the header block exactly as received
/// so it can be relayed without re-serialization.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub raw_head: Vec<u8>,
    pub message: HttpMessage,
}

impl ReceivedMessage {
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn wire_len(&self) -> usize {
        self.raw_head.len() + self.message.body.len()
    }

    /// The header block as received with only the request target replaced.
    /// Responses come back unchanged.
    pub fn retargeted(&self, new_target: &str) -> Vec<u8> {
        let mut message = HttpMessage {
            start: self.message.start.clone(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        if !message.set_target(new_target) {
            return self.raw_head.clone();
        }

        let rest = self
            .raw_head
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.raw_head.len(), |idx| idx + 1);

        let line = message.start.to_string();
        let mut out = Vec::with_capacity(line.len() + 2 + self.raw_head.len() - rest);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.raw_head[rest..]);
        out
    }
}

// ============================================================================
// READER
// ============================================================================

/// Buffered reader that frames messages on a byte stream.
///
/// The terminator search resumes where the previous attempt stopped, so a
/// header block split across any number of reads is found in linear time.
/// Bytes read past the end of one message stay buffered for the next.
pub struct MessageReader<S> {
    stream: S,
    buf: Vec<u8>,
    scanned: usize,
}

impl<S: AsyncRead + Unpin> MessageReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            scanned: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Reads one header block, terminator included.
    ///
    /// Returns `Ok(None)` when the peer closes cleanly between messages.
    pub async fn read_head(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(end) = self.find_terminator() {
                let head: Vec<u8> = self.buf.drain(..end).collect();
                self.scanned = 0;
                return Ok(Some(head));
            }

            if self.buf.len() >= MAX_HEADER_BYTES {
                return Err(ProxyError::HeaderTooLarge(MAX_HEADER_BYTES));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::IncompleteHeaders(self.buf.len()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Reads exactly `len` body bytes. An early close is an error.
    ///
    /// The buffer grows with the bytes actually received, never with the
    /// declared length alone.
    pub async fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > MAX_BODY_BYTES {
            return Err(ProxyError::BodyTooLarge {
                declared: len,
                limit: MAX_BODY_BYTES,
            });
        }

        let buffered = self.buf.len().min(len);
        let mut body: Vec<u8> = self.buf.drain(..buffered).collect();
        self.scanned = 0;

        let remaining = (len - buffered) as u64;
        (&mut self.stream).take(remaining).read_to_end(&mut body).await?;

        if body.len() < len {
            return Err(ProxyError::TruncatedBody {
                expected: len,
                received: body.len(),
            });
        }
        Ok(body)
    }

    /// Reads a request head. Requests are treated as bodiless.
    pub async fn read_request(&mut self) -> Result<Option<ReceivedMessage>> {
        let Some(raw_head) = self.read_head().await? else {
            return Ok(None);
        };
        let message = HttpMessage::parse_head(&raw_head)?;
        Ok(Some(ReceivedMessage { raw_head, message }))
    }

    /// Reads a response head and its `Content-Length` body.
    pub async fn read_response(&mut self) -> Result<ReceivedMessage> {
        let raw_head = match self.read_head().await? {
            Some(head) => head,
            None => return Err(ProxyError::IncompleteHeaders(0)),
        };
        let mut message = HttpMessage::parse_head(&raw_head)?;
        message.body = self.read_body(message.content_length()).await?;
        Ok(ReceivedMessage { raw_head, message })
    }

    fn find_terminator(&mut self) -> Option<usize> {
        let start = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
        let found = self.buf[start..]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
            .map(|pos| start + pos + HEADER_TERMINATOR.len());
        if found.is_none() {
            self.scanned = self.buf.len();
        }
        found
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_request_round_trip() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n";
        let msg = HttpMessage::parse_head(raw).unwrap();
        assert!(msg.is_request());
        assert_eq!(msg.target(), Some("/a"));
        assert_eq!(msg.headers.get("Host"), Some("x"));

        let reparsed = HttpMessage::parse_head(&msg.to_bytes()).unwrap();
        assert_eq!(reparsed, msg);
        assert_eq!(msg.to_bytes(), b"GET /a HTTP/1.1\r\nhost: x\r\n\r\n".to_vec());
    }

    #[test]
    fn test_status_line() {
        let msg = HttpMessage::parse_head(b"HTTP/1.1 404 Not Found\r\n\r\n").unwrap();
        assert_eq!(
            msg.start,
            StartLine::Response {
                version: "HTTP/1.1".into(),
                status: 404,
                reason: "Not Found".into(),
            }
        );
        assert!(!msg.is_request());
        assert_eq!(msg.target(), None);
        assert_eq!(msg.start.to_string(), "HTTP/1.1 404 Not Found");
    }

    #[test]
    fn test_malformed_start_line() {
        assert!(matches!(
            HttpMessage::parse_head(b"\r\n\r\n"),
            Err(ProxyError::MalformedStartLine(_))
        ));
        assert!(matches!(
            HttpMessage::parse_head(b"HTTP/1.1 abc\r\n\r\n"),
            Err(ProxyError::MalformedStartLine(_))
        ));
    }

    #[test]
    fn test_headers_case_insensitive_last_wins() {
        let raw = b"GET / HTTP/1.1\r\nX-Thing: one\r\nbogus line\r\nx-thing:  two \r\n\r\n";
        let msg = HttpMessage::parse_head(raw).unwrap();
        assert_eq!(msg.headers.len(), 1);
        assert_eq!(msg.headers.get("X-THING"), Some("two"));
    }

    #[test]
    fn test_value_may_contain_colons() {
        let msg = HttpMessage::parse_head(b"GET / HTTP/1.1\r\nHost: 10.0.0.1:8080\r\n\r\n").unwrap();
        assert_eq!(msg.headers.get("host"), Some("10.0.0.1:8080"));
    }

    #[test]
    fn test_content_length() {
        let msg = HttpMessage::parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(msg.content_length(), 42);

        let msg = HttpMessage::parse_head(b"HTTP/1.1 200 OK\r\nContent-Length: lots\r\n\r\n").unwrap();
        assert_eq!(msg.content_length(), 0);

        let msg = HttpMessage::parse_head(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(msg.content_length(), 0);
    }

    #[test]
    fn test_rewrite_primitives() {
        let mut msg =
            HttpMessage::parse_head(b"GET /old HTTP/1.1\r\nHost: client.example\r\n\r\n").unwrap();
        assert!(msg.set_target("/new"));
        msg.set_header("Host", "10.0.0.2");
        msg.set_header("Connection", "keep-alive");

        let text = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(text.starts_with("GET /new HTTP/1.1\r\n"));
        assert!(text.contains("host: 10.0.0.2\r\n"));
        assert!(text.contains("connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let mut resp = HttpMessage::parse_head(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(!resp.set_target("/x"));
    }

    #[tokio::test]
    async fn test_head_split_across_reads() {
        let mock = Builder::new()
            .read(b"GET /v/a.mpd HT")
            .read(b"TP/1.1\r\nHost: h\r")
            .read(b"\n\r")
            .read(b"\nGET /next HTTP/1.1\r\n\r\n")
            .build();
        let mut reader = MessageReader::new(mock);

        let first = reader.read_request().await.unwrap().unwrap();
        assert_eq!(first.message.target(), Some("/v/a.mpd"));
        assert_eq!(first.message.headers.get("host"), Some("h"));

        let second = reader.read_request().await.unwrap().unwrap();
        assert_eq!(second.message.target(), Some("/next"));

        assert!(reader.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_mid_header() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\nHo").build();
        let mut reader = MessageReader::new(mock);
        assert!(matches!(
            reader.read_head().await,
            Err(ProxyError::IncompleteHeaders(18))
        ));
    }

    #[tokio::test]
    async fn test_response_body_exact_length() {
        let mock = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123")
            .read(b"456")
            .read(b"789HTTP/1.1 200 OK\r\n\r\n")
            .build();
        let mut reader = MessageReader::new(mock);

        let resp = reader.read_response().await.unwrap();
        assert_eq!(resp.body(), b"0123456789");
        assert_eq!(resp.raw_head, b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec());
        assert_eq!(resp.wire_len(), resp.raw_head.len() + 10);

        let empty = reader.read_response().await.unwrap();
        assert!(empty.body().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mock = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nabc")
            .build();
        let mut reader = MessageReader::new(mock);
        match reader.read_response().await {
            Err(ProxyError::TruncatedBody { expected, received }) => {
                assert_eq!(expected, 8);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.message)),
        }
    }

    #[test]
    fn test_retargeted_keeps_header_bytes() {
        let raw = b"GET /v/vid-500-seg-1.m4s HTTP/1.1\r\nHost: proxy:8080\r\nX-Custom-Thing: A\r\n\r\n";
        let received = ReceivedMessage {
            raw_head: raw.to_vec(),
            message: HttpMessage::parse_head(raw).unwrap(),
        };
        assert_eq!(
            received.retargeted("/v/vid-300-seg-1.m4s"),
            b"GET /v/vid-300-seg-1.m4s HTTP/1.1\r\nHost: proxy:8080\r\nX-Custom-Thing: A\r\n\r\n".to_vec()
        );

        let raw = b"HTTP/1.1 200 OK\r\nServer: Origin\r\n\r\n";
        let response = ReceivedMessage {
            raw_head: raw.to_vec(),
            message: HttpMessage::parse_head(raw).unwrap(),
        };
        assert_eq!(response.retargeted("/x"), raw.to_vec());
    }

    #[tokio::test]
    async fn test_oversized_content_length_rejected() {
        let mock = Builder::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nab")
            .build();
        let mut reader = MessageReader::new(mock);
        match reader.read_response().await {
            Err(ProxyError::BodyTooLarge { declared, limit }) => {
                assert_eq!(declared, usize::MAX);
                assert_eq!(limit, MAX_BODY_BYTES);
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.message)),
        }
    }

    #[tokio::test]
    async fn test_large_declared_body_truncated() {
        let declared = MAX_BODY_BYTES;
        let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", declared);
        let mock = Builder::new().read(head.as_bytes()).read(b"only this").build();
        let mut reader = MessageReader::new(mock);
        match reader.read_response().await {
            Err(ProxyError::TruncatedBody { expected, received }) => {
                assert_eq!(expected, declared);
                assert_eq!(received, 9);
            }
            other => panic!("unexpected result: {:?}", other.map(|m| m.message)),
        }
    }

    #[tokio::test]
    async fn test_header_limit() {
        let junk = vec![b'a'; MAX_HEADER_BYTES + 10];
        let mut reader = MessageReader::new(&junk[..]);
        assert!(matches!(
            reader.read_head().await,
            Err(ProxyError::HeaderTooLarge(_))
        ));
    }
}
