use std::io;
use std::time::Duration;

use sponge_cache::{CachedResponse, HeaderMap};
use sponge_core::http1::{parse_response_head, BufferedConn};
use sponge_core::Scheme;
use sponge_tls::build_upstream_client_config;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream connect failed: {0}")]
    Connect(#[source] io::Error),
    #[error("upstream TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
    #[error("upstream host is not a valid TLS server name")]
    InvalidServerName,
    #[error("upstream exchange failed: {0}")]
    Io(#[source] io::Error),
    #[error("upstream closed before sending a response head")]
    UpstreamClosed,
}

impl FetchError {
    /// Status the dispatcher reports when this failure reaches the client.
    pub fn client_status(&self) -> u16 {
        match self {
            Self::Connect(_) | Self::Tls(_) | Self::InvalidServerName => 502,
            Self::Io(_) | Self::UpstreamClosed => 503,
        }
    }
}

/// One origin round trip, fully specified by the caller.
#[derive(Debug)]
pub struct FetchRequest<'a> {
    pub scheme: Scheme,
    /// Transport address to connect to.
    pub host: &'a str,
    pub port: u16,
    /// Value for the outgoing `Host` header.
    pub authority: &'a str,
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
}

#[derive(Debug)]
pub struct FetchedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn into_cached(self) -> CachedResponse {
        CachedResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub upstream_tls_insecure: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_head_bytes: usize,
}

/// Performs a single request/response exchange with the origin. The response
/// body is fully buffered and de-framed; no retries are attempted.
pub async fn fetch_upstream(
    request: FetchRequest<'_>,
    options: &FetchOptions,
) -> Result<FetchedResponse, FetchError> {
    let tcp = tokio::time::timeout(
        options.connect_timeout,
        TcpStream::connect((request.host, request.port)),
    )
    .await
    .map_err(|_| {
        FetchError::Connect(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream connect timed out",
        ))
    })?
    .map_err(FetchError::Connect)?;

    match request.scheme {
        Scheme::Http => exchange(tcp, &request, options).await,
        Scheme::Https => {
            let connector =
                TlsConnector::from(build_upstream_client_config(options.upstream_tls_insecure));
            let server_name = ServerName::try_from(request.host.to_string())
                .map_err(|_| FetchError::InvalidServerName)?;
            let tls = tokio::time::timeout(
                options.handshake_timeout,
                connector.connect(server_name, tcp),
            )
            .await
            .map_err(|_| {
                FetchError::Tls(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream TLS handshake timed out",
                ))
            })?
            .map_err(FetchError::Tls)?;
            exchange(tls, &request, options).await
        }
    }
}

async fn exchange<S>(
    stream: S,
    request: &FetchRequest<'_>,
    options: &FetchOptions,
) -> Result<FetchedResponse, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = BufferedConn::new(stream);

    let head = build_request_head(request);
    conn.stream.write_all(&head).await.map_err(FetchError::Io)?;
    if !request.body.is_empty() {
        conn.stream
            .write_all(request.body)
            .await
            .map_err(FetchError::Io)?;
    }
    conn.stream.flush().await.map_err(FetchError::Io)?;

    let head_raw = conn
        .read_head(options.max_head_bytes)
        .await
        .map_err(FetchError::Io)?
        .ok_or(FetchError::UpstreamClosed)?;
    let head = parse_response_head(&head_raw, request.method).map_err(FetchError::Io)?;
    let body = conn.read_body(head.body_mode).await.map_err(FetchError::Io)?;

    // The body is buffered and de-framed here, so wire-framing headers do
    // not survive into the structured response.
    let mut headers = HeaderMap::new();
    for (name, value) in head.headers.iter() {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        headers.append(name, value);
    }
    if response_may_have_body(request.method, head.status) {
        headers.append("Content-Length", body.len().to_string());
    }

    Ok(FetchedResponse {
        status: head.status,
        reason: head.reason,
        headers,
        body,
    })
}

fn build_request_head(request: &FetchRequest<'_>) -> Vec<u8> {
    let mut head = format!(
        "{} {} HTTP/1.1\r\n",
        request.method, request.path_and_query
    );
    head.push_str(&format!("Host: {}\r\n", request.authority));
    for (name, value) in request.headers.iter() {
        if name.eq_ignore_ascii_case("host")
            || name.eq_ignore_ascii_case("content-length")
            || is_hop_by_hop(name)
        {
            continue;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !request.body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", request.body.len()));
    }
    head.push_str("Connection: close\r\n\r\n");
    head.into_bytes()
}

fn response_may_have_body(request_method: &str, status: u16) -> bool {
    !(request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304)
}

fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 8] = [
        "connection",
        "proxy-connection",
        "keep-alive",
        "transfer-encoding",
        "te",
        "trailer",
        "upgrade",
        "proxy-authenticate",
    ];
    HOP_BY_HOP
        .iter()
        .any(|candidate| name.eq_ignore_ascii_case(candidate))
}

#[cfg(test)]
mod tests {
    use super::{build_request_head, is_hop_by_hop, FetchRequest};
    use sponge_cache::HeaderMap;
    use sponge_core::Scheme;

    #[test]
    fn request_head_carries_host_and_closes_the_connection() {
        let mut headers = HeaderMap::new();
        headers.append("Accept", "*/*");
        headers.append("Connection", "keep-alive");
        headers.append("Host", "stale.example");

        let request = FetchRequest {
            scheme: Scheme::Http,
            host: "127.0.0.1",
            port: 80,
            authority: "origin.test:8080",
            method: "GET",
            path_and_query: "/foo?limit=1",
            headers: &headers,
            body: b"",
        };
        let head = String::from_utf8(build_request_head(&request)).expect("utf8 head");
        assert!(head.starts_with("GET /foo?limit=1 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Host: origin.test:8080\r\n"), "{head}");
        assert!(head.contains("Accept: */*\r\n"), "{head}");
        assert!(!head.contains("stale.example"), "{head}");
        assert!(!head.contains("keep-alive"), "{head}");
        assert!(head.ends_with("Connection: close\r\n\r\n"), "{head}");
    }

    #[test]
    fn request_head_frames_the_body_it_sends() {
        let headers = HeaderMap::new();
        let request = FetchRequest {
            scheme: Scheme::Http,
            host: "127.0.0.1",
            port: 80,
            authority: "origin.test",
            method: "POST",
            path_and_query: "/submit",
            headers: &headers,
            body: b"hello",
        };
        let head = String::from_utf8(build_request_head(&request)).expect("utf8 head");
        assert!(head.contains("Content-Length: 5\r\n"), "{head}");
    }

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("CONNECTION"));
        assert!(!is_hop_by_hop("Content-Type"));
    }
}
