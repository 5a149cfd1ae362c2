use std::io;

use sponge_core::{Authority, ProxyEngine};
use sponge_observe::{EventSink, FlowContext};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::{emit_stream_closed, write_proxy_response, CloseReasonCode};

/// Opaque CONNECT relay: ack the tunnel, then copy bytes both ways until
/// either side closes. Nothing is inspected or cached on this path.
pub(crate) async fn run_tunnel<S>(
    engine: &ProxyEngine<S>,
    context: FlowContext,
    client: &mut TcpStream,
    buffered_client_bytes: Vec<u8>,
    authority: &Authority,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let connect = TcpStream::connect((authority.host.as_str(), authority.port));
    let mut upstream =
        match tokio::time::timeout(engine.config.upstream_connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => {
                write_proxy_response(
                    client,
                    "502 Bad Gateway",
                    &format!("upstream connect failed: {error}"),
                )
                .await?;
                emit_stream_closed(
                    engine,
                    context,
                    CloseReasonCode::UpstreamConnectFailed,
                    Some(error.to_string()),
                    None,
                    None,
                );
                return Ok(());
            }
            Err(_) => {
                write_proxy_response(client, "502 Bad Gateway", "upstream connect timed out")
                    .await?;
                emit_stream_closed(
                    engine,
                    context,
                    CloseReasonCode::UpstreamConnectFailed,
                    Some("connect timed out".to_string()),
                    None,
                    None,
                );
                return Ok(());
            }
        };

    client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;

    // Anything the client pipelined past the CONNECT head belongs upstream.
    if !buffered_client_bytes.is_empty() {
        upstream.write_all(&buffered_client_bytes).await?;
    }

    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((from_client, from_server)) => {
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::RelayEof,
                None,
                Some(from_client),
                Some(from_server),
            );
            Ok(())
        }
        Err(error) => {
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::RelayError,
                Some(error.to_string()),
                None,
                None,
            );
            Err(error)
        }
    }
}
