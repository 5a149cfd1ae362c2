use std::io;

use sponge_cache::HeaderMap;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// How the message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
}

/// A byte stream plus whatever was read past the last message boundary.
pub struct BufferedConn<S> {
    pub stream: S,
    read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Bytes already read off the socket but not yet consumed; the tunnel
    /// path forwards these to upstream before bridging.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_buf)
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Reads one head (through the blank-line terminator). `Ok(None)` means
    /// the peer closed cleanly before sending anything.
    pub async fn read_head(&mut self, max_head_bytes: usize) -> io::Result<Option<Vec<u8>>> {
        self.read_until_pattern(b"\r\n\r\n", max_head_bytes).await
    }

    /// Buffers the full body for `mode` into memory.
    pub async fn read_body(&mut self, mode: BodyMode) -> io::Result<Vec<u8>> {
        match mode {
            BodyMode::None => Ok(Vec::new()),
            BodyMode::ContentLength(length) => self.read_exact_buffered(length as usize).await,
            BodyMode::Chunked => self.read_chunked_body().await,
            BodyMode::CloseDelimited => self.read_to_eof().await,
        }
    }

    async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                let bytes = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(bytes));
            }

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "HTTP header exceeded configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary was reached",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    async fn read_exact_buffered(&mut self, exact_len: usize) -> io::Result<Vec<u8>> {
        while self.read_buf.len() < exact_len {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before body completed",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.read_buf.drain(..exact_len).collect::<Vec<_>>())
    }

    async fn read_chunked_body(&mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            let chunk_len = parse_chunk_len(&line)?;
            if chunk_len == 0 {
                // Trailer section runs to the first empty line.
                loop {
                    let trailer = self.read_line().await?;
                    if trailer == b"\r\n" {
                        return Ok(body);
                    }
                }
            }

            let chunk = self.read_exact_buffered(chunk_len as usize).await?;
            body.extend_from_slice(&chunk);

            let terminator = self.read_exact_buffered(2).await?;
            if terminator.as_slice() != b"\r\n" {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid chunk terminator",
                ));
            }
        }
    }

    async fn read_to_eof(&mut self) -> io::Result<Vec<u8>> {
        let mut body = std::mem::take(&mut self.read_buf);
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        loop {
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..read]);
        }
    }

    async fn read_line(&mut self) -> io::Result<Vec<u8>> {
        self.read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before chunk line was read",
                )
            })
    }
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = parse_http_version(version_text)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "response status line is missing")
    })?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_http_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;

    Ok(ResponseHead {
        status,
        reason,
        version,
        headers,
        body_mode,
    })
}

fn parse_http_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported",
        )),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.append(name.trim(), value.trim());
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }
    Ok(BodyMode::None)
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }

    if has_header_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    if let Some(length) = parse_content_length(headers)? {
        return Ok(if length == 0 {
            BodyMode::None
        } else {
            BodyMode::ContentLength(length)
        });
    }

    Ok(BodyMode::CloseDelimited)
}

fn parse_content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let mut value = None;
    for candidate in headers.get_all("content-length") {
        let parsed = candidate.parse::<u64>().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
        })?;
        value = Some(parsed);
    }
    Ok(value)
}

pub fn has_header_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "chunk size line had invalid UTF-8")
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::{
        parse_request_head, parse_response_head, BodyMode, BufferedConn, HttpVersion,
    };

    #[test]
    fn parses_a_proxy_form_get_request() {
        let raw = b"GET http://origin.test/foo HTTP/1.1\r\nHost: origin.test\r\nAccept: */*\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://origin.test/foo");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.headers.get("host"), Some("origin.test"));
        assert_eq!(head.body_mode, BodyMode::None);
    }

    #[test]
    fn request_with_content_length_reports_its_body_mode() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: o\r\nContent-Length: 5\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.body_mode, BodyMode::ContentLength(5));
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_content_length() {
        let raw =
            b"POST / HTTP/1.1\r\nHost: o\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let head = parse_request_head(raw).expect("must parse");
        assert_eq!(head.body_mode, BodyMode::Chunked);
    }

    #[test]
    fn rejects_request_line_with_extra_fields() {
        let raw = b"GET / HTTP/1.1 extra\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }

    #[test]
    fn response_head_keeps_status_and_reason() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\n";
        let head = parse_response_head(raw, "GET").expect("must parse");
        assert_eq!(head.status, 404);
        assert_eq!(head.reason, "Not Found");
        assert_eq!(head.body_mode, BodyMode::ContentLength(9));
    }

    #[test]
    fn head_responses_never_carry_a_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let head = parse_response_head(raw, "HEAD").expect("must parse");
        assert_eq!(head.body_mode, BodyMode::None);
    }

    #[test]
    fn response_without_framing_headers_is_close_delimited() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";
        let head = parse_response_head(raw, "GET").expect("must parse");
        assert_eq!(head.body_mode, BodyMode::CloseDelimited);
    }

    #[tokio::test]
    async fn reads_head_and_leaves_extra_bytes_buffered() {
        let raw: &[u8] = b"CONNECT origin.test:443 HTTP/1.1\r\nHost: origin.test:443\r\n\r\nextra";
        let mut conn = BufferedConn::new(raw);
        let head = conn
            .read_head(64 * 1024)
            .await
            .expect("read head")
            .expect("head present");
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(conn.take_buffered(), b"extra");
    }

    #[tokio::test]
    async fn clean_eof_before_any_bytes_reads_as_none() {
        let raw: &[u8] = b"";
        let mut conn = BufferedConn::new(raw);
        assert!(conn.read_head(64 * 1024).await.expect("read head").is_none());
    }

    #[tokio::test]
    async fn buffers_content_length_body() {
        let raw: &[u8] = b"hello world";
        let mut conn = BufferedConn::new(raw);
        let body = conn
            .read_body(BodyMode::ContentLength(5))
            .await
            .expect("read body");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn decodes_chunked_bodies_and_consumes_trailers() {
        let raw: &[u8] = b"5\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: t\r\n\r\nrest";
        let mut conn = BufferedConn::new(raw);
        let body = conn.read_body(BodyMode::Chunked).await.expect("read body");
        assert_eq!(body, b"hello world");
        assert_eq!(conn.take_buffered(), b"rest");
    }

    #[tokio::test]
    async fn close_delimited_body_runs_to_eof() {
        let raw: &[u8] = b"all of it";
        let mut conn = BufferedConn::new(raw);
        let body = conn
            .read_body(BodyMode::CloseDelimited)
            .await
            .expect("read body");
        assert_eq!(body, b"all of it");
    }

    #[tokio::test]
    async fn truncated_body_is_an_unexpected_eof() {
        let raw: &[u8] = b"hel";
        let mut conn = BufferedConn::new(raw);
        let error = conn
            .read_body(BodyMode::ContentLength(5))
            .await
            .expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let raw = [b'a'; 256];
        let mut conn = BufferedConn::new(&raw[..]);
        let error = conn.read_head(128).await.expect_err("must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }
}
