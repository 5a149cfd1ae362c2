use http::StatusCode;
use thiserror::Error;

use crate::{CachedResponse, HeaderMap};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("cache entry has no blank-line terminator")]
    MissingTerminator,
    #[error("cache entry has no status line")]
    MissingStatusLine,
    #[error("cache entry status line is malformed")]
    InvalidStatusLine,
    #[error("cache entry status code is not a valid HTTP status")]
    InvalidStatusCode,
}

/// Serializes a response in the canonical cache-entry form: an HTTP/1.1
/// message with a full status line.
///
/// The encoding is itself a valid HTTP/1.1 response, so cache hits can be
/// written to a client socket verbatim.
pub fn encode_response(response: &CachedResponse) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + response.body.len());
    match canonical_reason(response.status) {
        Some(reason) => {
            out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", response.status).as_bytes())
        }
        None => out.extend_from_slice(format!("HTTP/1.1 {}\r\n", response.status).as_bytes()),
    }
    for (name, value) in response.headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Parses a cache entry written by either the canonical encoder or the
/// legacy one that omitted the reason phrase.
pub fn decode_response(data: &[u8]) -> Result<CachedResponse, CodecError> {
    let head_len = find_subsequence(data, b"\r\n\r\n").ok_or(CodecError::MissingTerminator)?;
    let head = &data[..head_len];
    let body = data[head_len + 4..].to_vec();

    let head_text = String::from_utf8_lossy(head);
    let (status_line, header_block) = match head_text.split_once("\r\n") {
        Some((line, rest)) => (line, rest),
        None => (head_text.as_ref(), ""),
    };
    if status_line.is_empty() {
        return Err(CodecError::MissingStatusLine);
    }

    let mut fields = status_line.split_whitespace();
    let _version = fields.next().ok_or(CodecError::MissingStatusLine)?;
    let status_text = fields.next().ok_or(CodecError::InvalidStatusLine)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| CodecError::InvalidStatusCode)?;
    if !(100..=599).contains(&status) {
        return Err(CodecError::InvalidStatusCode);
    }

    let mut headers = HeaderMap::new();
    for line in header_block.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        // Lines without a colon are discarded, not fatal.
        if let Some((name, value)) = line.split_once(':') {
            headers.append(name.trim(), value.trim());
        }
    }

    Ok(CachedResponse {
        status,
        headers,
        body,
    })
}

fn canonical_reason(status: u16) -> Option<&'static str> {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
