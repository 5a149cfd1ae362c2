use std::io;
use std::sync::Arc;

use sponge_cache::CacheStore;
use sponge_core::http1::{parse_request_head, BufferedConn};
use sponge_core::{parse_connect_authority, parse_plain_target, Discipline, ProxyConfig, ProxyEngine};
use sponge_observe::{Event, EventSink, EventType, FlowContext, FlowProtocol};
use sponge_tls::{LeafCertificateStore, TlsConfigError, DEFAULT_LEAF_CACHE_CAPACITY};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

mod fetch;
mod http_flow;
mod intercept;
mod tunnel;

pub use fetch::{fetch_upstream, FetchError, FetchOptions, FetchRequest, FetchedResponse};

/// The listening proxy: accepts connections, classifies each transaction,
/// and routes it to the tunnel, intercept, or plain-HTTP discipline.
pub struct ProxyServer<S>
where
    S: EventSink + Send + Sync + 'static,
{
    engine: Arc<ProxyEngine<S>>,
    cache: Arc<dyn CacheStore>,
    cert_store: Option<Arc<LeafCertificateStore>>,
}

impl<S> ProxyServer<S>
where
    S: EventSink + Send + Sync + 'static,
{
    /// Loads CA material when MITM is configured; a missing or malformed CA
    /// file is a startup-fatal error.
    pub fn new(
        config: ProxyConfig,
        sink: S,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Self, TlsConfigError> {
        let cert_store = match (&config.ca_cert_pem_path, &config.ca_key_pem_path) {
            (Some(cert_path), Some(key_path)) => Some(Arc::new(
                LeafCertificateStore::from_pem_files(
                    cert_path,
                    key_path,
                    DEFAULT_LEAF_CACHE_CAPACITY,
                )?,
            )),
            _ => None,
        };
        Ok(Self {
            engine: Arc::new(ProxyEngine::new(config, sink)),
            cache,
            cert_store,
        })
    }

    pub async fn bind_listener(&self) -> io::Result<TcpListener> {
        let bind_addr = format!(
            "{}:{}",
            self.engine.config.listen_hostname, self.engine.config.listen_port
        );
        TcpListener::bind(&bind_addr).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind_listener().await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, client_addr) = listener.accept().await?;
            let engine = Arc::clone(&self.engine);
            let cache = Arc::clone(&self.cache);
            let cert_store = self.cert_store.clone();
            tokio::spawn(async move {
                if let Err(error) =
                    handle_client(engine, cache, cert_store, stream, client_addr.to_string()).await
                {
                    eprintln!("connection handling failed: {error}");
                }
            });
        }
    }
}

async fn handle_client<S>(
    engine: Arc<ProxyEngine<S>>,
    cache: Arc<dyn CacheStore>,
    cert_store: Option<Arc<LeafCertificateStore>>,
    stream: TcpStream,
    client_addr: String,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let mut conn = BufferedConn::new(stream);

    let head_raw = match conn.read_head(engine.config.max_http_head_bytes).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Ok(()),
        Err(error) => {
            let context = unknown_context(&engine, client_addr);
            engine.emit_event(
                Event::new(EventType::RequestParseFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                &engine,
                context,
                CloseReasonCode::RequestParseFailed,
                Some(error.to_string()),
                None,
                None,
            );
            if error.kind() != io::ErrorKind::UnexpectedEof {
                write_proxy_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid or incomplete request head",
                )
                .await?;
            }
            return Ok(());
        }
    };

    let request = match parse_request_head(&head_raw) {
        Ok(parsed) => parsed,
        Err(error) => {
            let context = unknown_context(&engine, client_addr);
            engine.emit_event(
                Event::new(EventType::RequestParseFailed, context.clone())
                    .with_attribute("detail", error.to_string()),
            );
            emit_stream_closed(
                &engine,
                context,
                CloseReasonCode::RequestParseFailed,
                Some(error.to_string()),
                None,
                None,
            );
            write_proxy_response(&mut conn.stream, "400 Bad Request", "malformed request head")
                .await?;
            return Ok(());
        }
    };

    if request.method == "CONNECT" {
        let authority = match parse_connect_authority(&request.target) {
            Ok(authority) => authority,
            Err(parse_error) => {
                let context = unknown_context(&engine, client_addr);
                engine.emit_event(
                    Event::new(EventType::RequestParseFailed, context.clone())
                        .with_attribute("detail", parse_error.code()),
                );
                emit_stream_closed(
                    &engine,
                    context,
                    CloseReasonCode::RequestParseFailed,
                    Some(parse_error.code().to_string()),
                    None,
                    None,
                );
                write_proxy_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid CONNECT target",
                )
                .await?;
                return Ok(());
            }
        };

        let context = FlowContext {
            flow_id: engine.allocate_flow_id(),
            client_addr,
            server_host: authority.host.clone(),
            server_port: authority.port,
            protocol: FlowProtocol::Tunnel,
        };
        engine.emit_event(
            Event::new(EventType::RequestReceived, context.clone())
                .with_attribute("method", request.method.as_str())
                .with_attribute("target", request.target.as_str()),
        );

        let discipline = engine.decide_dispatch(&context, &request.method);
        let leftover = conn.take_buffered();
        match (discipline, cert_store) {
            (Discipline::Intercept, Some(store)) => {
                let context = FlowContext {
                    protocol: FlowProtocol::Intercepted,
                    ..context
                };
                intercept::run_intercept(
                    &engine,
                    &store,
                    cache.as_ref(),
                    context,
                    conn.stream,
                    leftover,
                    authority,
                )
                .await
            }
            _ => {
                tunnel::run_tunnel(&engine, context, &mut conn.stream, leftover, &authority).await
            }
        }
    } else {
        let target = match parse_plain_target(&request.target, request.headers.get("host")) {
            Ok(target) => target,
            Err(parse_error) => {
                let context = unknown_context(&engine, client_addr);
                engine.emit_event(
                    Event::new(EventType::RequestParseFailed, context.clone())
                        .with_attribute("detail", parse_error.code()),
                );
                emit_stream_closed(
                    &engine,
                    context,
                    CloseReasonCode::RequestParseFailed,
                    Some(parse_error.code().to_string()),
                    None,
                    None,
                );
                write_proxy_response(
                    &mut conn.stream,
                    "400 Bad Request",
                    "invalid request target",
                )
                .await?;
                return Ok(());
            }
        };

        let context = FlowContext {
            flow_id: engine.allocate_flow_id(),
            client_addr,
            server_host: target.host.clone(),
            server_port: target.port,
            protocol: FlowProtocol::Http1,
        };
        engine.emit_event(
            Event::new(EventType::RequestReceived, context.clone())
                .with_attribute("method", request.method.as_str())
                .with_attribute("target", request.target.as_str()),
        );

        let discipline = engine.decide_dispatch(&context, &request.method);
        http_flow::run_plain_http(
            &engine,
            cache.as_ref(),
            context,
            &mut conn,
            request,
            target,
            discipline,
        )
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReasonCode {
    RequestParseFailed,
    UpstreamConnectFailed,
    RelayEof,
    RelayError,
    TlsHandshakeFailed,
    InterceptCompleted,
    InterceptError,
    HttpCompleted,
    HttpError,
}

impl CloseReasonCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::RequestParseFailed => "request_parse_failed",
            Self::UpstreamConnectFailed => "upstream_connect_failed",
            Self::RelayEof => "relay_eof",
            Self::RelayError => "relay_error",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::InterceptCompleted => "intercept_completed",
            Self::InterceptError => "intercept_error",
            Self::HttpCompleted => "http_completed",
            Self::HttpError => "http_error",
        }
    }
}

pub(crate) fn emit_stream_closed<S>(
    engine: &ProxyEngine<S>,
    context: FlowContext,
    reason_code: CloseReasonCode,
    reason_detail: Option<String>,
    bytes_from_client: Option<u64>,
    bytes_from_server: Option<u64>,
) where
    S: EventSink + Send + Sync + 'static,
{
    let mut event = Event::new(EventType::StreamClosed, context)
        .with_attribute("reason_code", reason_code.as_str());
    if let Some(detail) = reason_detail {
        event = event.with_attribute("reason_detail", detail);
    }
    if let Some(value) = bytes_from_client {
        event = event.with_attribute("bytes_from_client", value.to_string());
    }
    if let Some(value) = bytes_from_server {
        event = event.with_attribute("bytes_from_server", value.to_string());
    }
    engine.emit_event(event);
}

/// Writes a small self-framed plain-text response, used wherever a flow
/// fails before any response bytes have been committed.
pub(crate) async fn write_proxy_response<W>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(128 + body.len());
    message.extend_from_slice(b"HTTP/1.1 ");
    message.extend_from_slice(status.as_bytes());
    message.extend_from_slice(b"\r\nContent-Type: text/plain\r\n");
    message.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    message.extend_from_slice(b"Connection: close\r\n\r\n");
    message.extend_from_slice(body.as_bytes());
    stream.write_all(&message).await
}

pub(crate) fn status_line_for(error: &FetchError) -> &'static str {
    match error.client_status() {
        502 => "502 Bad Gateway",
        _ => "503 Service Unavailable",
    }
}

pub(crate) fn fetch_options(config: &ProxyConfig) -> FetchOptions {
    FetchOptions {
        upstream_tls_insecure: config.upstream_tls_insecure,
        connect_timeout: config.upstream_connect_timeout,
        handshake_timeout: config.tls_handshake_timeout,
        max_head_bytes: config.max_http_head_bytes,
    }
}

fn unknown_context<S>(engine: &ProxyEngine<S>, client_addr: String) -> FlowContext
where
    S: EventSink + Send + Sync + 'static,
{
    FlowContext {
        flow_id: engine.allocate_flow_id(),
        client_addr,
        server_host: "<unknown>".to_string(),
        server_port: 0,
        protocol: FlowProtocol::Http1,
    }
}
