use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use sponge_cache::{decode_response, encode_response, fingerprint, CacheStore};
use sponge_core::http1::{parse_request_head, BufferedConn};
use sponge_core::{Authority, ProxyEngine, Scheme};
use sponge_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use crate::{
    emit_stream_closed, fetch_options, fetch_upstream, status_line_for, write_proxy_response,
    CloseReasonCode, FetchRequest,
};

/// MITM interception of one CONNECT: terminate TLS toward the client with a
/// leaf minted from the configured CA, bridge exactly one HTTP exchange, and
/// cache GET responses on the same terms as plain HTTP.
pub(crate) async fn run_intercept<S>(
    engine: &ProxyEngine<S>,
    cert_store: &sponge_tls::LeafCertificateStore,
    cache: &dyn CacheStore,
    context: FlowContext,
    client: TcpStream,
    leftover: Vec<u8>,
    authority: Authority,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let mut client = PrefixedStream::new(leftover, client);

    // S1: acknowledge the tunnel on the raw socket; TLS follows.
    client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

    // S2: client-facing handshake with a leaf for the CONNECT host.
    let issued = match cert_store.server_config_for_host(&authority.host) {
        Ok(issued) => issued,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeFailed, context.clone())
                    .with_attribute("peer", "client")
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::TlsHandshakeFailed,
                Some(format!("leaf issuance failed: {error}")),
                None,
                None,
            );
            return Ok(());
        }
    };
    engine.emit_event(
        Event::new(EventType::TlsHandshakeStarted, context.clone())
            .with_attribute("peer", "client")
            .with_attribute("cert_cache_status", issued.cache_status.as_str()),
    );

    let acceptor = TlsAcceptor::from(issued.server_config);
    let accept = tokio::time::timeout(
        engine.config.tls_handshake_timeout,
        acceptor.accept(client),
    );
    let client_tls = match accept.await {
        Ok(Ok(stream)) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeSucceeded, context.clone())
                    .with_attribute("peer", "client"),
            );
            stream
        }
        Ok(Err(error)) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeFailed, context.clone())
                    .with_attribute("peer", "client")
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::TlsHandshakeFailed,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
        Err(_) => {
            engine.emit_event(
                Event::new(EventType::TlsHandshakeFailed, context.clone())
                    .with_attribute("peer", "client")
                    .with_attribute("detail", "handshake timed out"),
            );
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::TlsHandshakeFailed,
                Some("handshake timed out".to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    let mut conn = BufferedConn::new(client_tls);

    // S3: one decrypted request.
    let request_raw = match conn.read_head(engine.config.max_http_head_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::InterceptCompleted,
                Some("client closed before sending a request".to_string()),
                None,
                None,
            );
            return Ok(());
        }
        Err(error) => {
            let _ = write_proxy_response(
                &mut conn.stream,
                "500 Internal Server Error",
                "failed to read intercepted request",
            )
            .await;
            let _ = conn.stream.shutdown().await;
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::InterceptError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    let request = match parse_request_head(&request_raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::RequestParseFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            let _ = write_proxy_response(
                &mut conn.stream,
                "400 Bad Request",
                "malformed intercepted request",
            )
            .await;
            let _ = conn.stream.shutdown().await;
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::InterceptError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    let body = match conn.read_body(request.body_mode).await {
        Ok(body) => body,
        Err(error) => {
            let _ = write_proxy_response(
                &mut conn.stream,
                "500 Internal Server Error",
                "failed to read intercepted request body",
            )
            .await;
            let _ = conn.stream.shutdown().await;
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::InterceptError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    engine.emit_event(
        Event::new(EventType::RequestReceived, context.clone())
            .with_attribute("method", request.method.as_str())
            .with_attribute("target", request.target.as_str()),
    );

    // The decrypted target is origin-form; the Host header names the
    // authority the client was actually addressing.
    let host_authority = request
        .headers
        .get("host")
        .unwrap_or(&authority.host)
        .to_string();
    let path = match request.target.split_once('?') {
        Some((path, _)) => path,
        None => request.target.as_str(),
    };
    let key = fingerprint(&request.method, &host_authority, path);
    let cacheable = request.method == "GET";

    // S4: lookup. Errors and corrupt entries degrade to the origin fetch.
    if cacheable {
        match cache.get(&key).await {
            Ok(Some(entry)) => match decode_response(&entry) {
                Ok(_) => {
                    engine.emit_event(
                        Event::new(EventType::CacheHit, context.clone())
                            .with_attribute("key", key.as_str()),
                    );
                    // S7: the stored encoding is a complete HTTP/1.1
                    // response; serve it verbatim.
                    conn.stream.write_all(&entry).await?;
                    engine.emit_event(
                        Event::new(EventType::ResponseServed, context.clone())
                            .with_attribute("source", "cache"),
                    );
                    let _ = conn.stream.shutdown().await;
                    emit_stream_closed(
                        engine,
                        context,
                        CloseReasonCode::InterceptCompleted,
                        None,
                        None,
                        None,
                    );
                    return Ok(());
                }
                Err(error) => {
                    engine.emit_event(
                        Event::new(EventType::CacheDecodeFailed, context.clone())
                            .with_attribute("key", key.as_str())
                            .with_attribute("detail", error.to_string()),
                    );
                }
            },
            Ok(None) => {
                engine.emit_event(
                    Event::new(EventType::CacheMiss, context.clone())
                        .with_attribute("key", key.as_str()),
                );
            }
            Err(error) => {
                engine.emit_event(
                    Event::new(EventType::CacheMiss, context.clone())
                        .with_attribute("key", key.as_str())
                        .with_attribute("detail", error.to_string()),
                );
            }
        }
    }

    // S5: re-originate TLS to the requested authority and fetch.
    let fetch_request = FetchRequest {
        scheme: Scheme::Https,
        host: &authority.host,
        port: authority.port,
        authority: &host_authority,
        method: &request.method,
        path_and_query: &request.target,
        headers: &request.headers,
        body: &body,
    };
    let fetched = match fetch_upstream(fetch_request, &fetch_options(&engine.config)).await {
        Ok(fetched) => fetched,
        Err(error) => {
            engine.emit_event(
                Event::new(EventType::UpstreamFetchFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            let _ =
                write_proxy_response(&mut conn.stream, status_line_for(&error), &error.to_string())
                    .await;
            let _ = conn.stream.shutdown().await;
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::InterceptError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    // S6: reply with the canonical encoding, then populate the cache.
    let encoded = encode_response(&fetched.into_cached());
    conn.stream.write_all(&encoded).await?;
    engine.emit_event(
        Event::new(EventType::ResponseServed, context.clone())
            .with_attribute("source", "origin"),
    );

    if cacheable {
        if let Err(error) = cache.set(&key, &encoded, engine.config.cache_ttl).await {
            engine.emit_event(
                Event::new(EventType::CacheStoreFailed, context.clone())
                    .with_attribute("key", key.as_str())
                    .with_attribute("detail", error.to_string()),
            );
        }
    }

    // S8: release the client-facing stream; the upstream socket was dropped
    // by the fetcher.
    let _ = conn.stream.shutdown().await;
    emit_stream_closed(
        engine,
        context,
        CloseReasonCode::InterceptCompleted,
        None,
        None,
        None,
    );
    Ok(())
}

/// Replays bytes read past the CONNECT head before handing reads through to
/// the socket. Writes pass straight through.
struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
