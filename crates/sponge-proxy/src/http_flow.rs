use std::io;

use sponge_cache::{decode_response, encode_response, fingerprint, CacheStore};
use sponge_core::http1::{BufferedConn, RequestHead};
use sponge_core::{Discipline, PlainTarget, ProxyEngine};
use sponge_observe::{Event, EventSink, EventType, FlowContext};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::{
    emit_stream_closed, fetch_options, fetch_upstream, status_line_for, write_proxy_response,
    CloseReasonCode, FetchRequest,
};

/// Plain-HTTP transaction. `CachedFetch` (GET) consults the cache before
/// going to origin; `ForwardFetch` (everything else) goes straight to origin
/// but still populates the cache afterwards.
pub(crate) async fn run_plain_http<S>(
    engine: &ProxyEngine<S>,
    cache: &dyn CacheStore,
    context: FlowContext,
    conn: &mut BufferedConn<TcpStream>,
    request: RequestHead,
    target: PlainTarget,
    discipline: Discipline,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let body = match conn.read_body(request.body_mode).await {
        Ok(body) => body,
        Err(error) => {
            if error.kind() != io::ErrorKind::UnexpectedEof {
                write_proxy_response(
                    &mut conn.stream,
                    "500 Internal Server Error",
                    "failed to read request body",
                )
                .await?;
            }
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::HttpError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    let key = fingerprint(&request.method, &target.authority, &target.path);

    if discipline == Discipline::CachedFetch {
        match cache.get(&key).await {
            Ok(Some(entry)) => match decode_response(&entry) {
                Ok(_) => {
                    engine.emit_event(
                        Event::new(EventType::CacheHit, context.clone())
                            .with_attribute("key", key.as_str()),
                    );
                    conn.stream.write_all(&entry).await?;
                    engine.emit_event(
                        Event::new(EventType::ResponseServed, context.clone())
                            .with_attribute("source", "cache"),
                    );
                    let _ = conn.stream.shutdown().await;
                    emit_stream_closed(
                        engine,
                        context,
                        CloseReasonCode::HttpCompleted,
                        None,
                        None,
                        None,
                    );
                    return Ok(());
                }
                Err(error) => {
                    // Corrupt entries are refetched and overwritten below.
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
                // Backend failures degrade to a miss, never to a 5xx.
                engine.emit_event(
                    Event::new(EventType::CacheMiss, context.clone())
                        .with_attribute("key", key.as_str())
                        .with_attribute("detail", error.to_string()),
                );
            }
        }
    }

    let fetch_request = FetchRequest {
        scheme: target.scheme,
        host: &target.host,
        port: target.port,
        authority: &target.authority,
        method: &request.method,
        path_and_query: &target.path_and_query,
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
            write_proxy_response(&mut conn.stream, status_line_for(&error), &error.to_string())
                .await?;
            emit_stream_closed(
                engine,
                context,
                CloseReasonCode::HttpError,
                Some(error.to_string()),
                None,
                None,
            );
            return Ok(());
        }
    };

    let encoded = encode_response(&fetched.into_cached());
    conn.stream.write_all(&encoded).await?;
    engine.emit_event(
        Event::new(EventType::ResponseServed, context.clone())
            .with_attribute("source", "origin")
            .with_attribute("key", key.as_str()),
    );

    // Populate after the reply so cache trouble never delays the client.
    // Non-GET responses are stored too, under their own method prefix.
    if let Err(error) = cache.set(&key, &encoded, engine.config.cache_ttl).await {
        engine.emit_event(
            Event::new(EventType::CacheStoreFailed, context.clone())
                .with_attribute("key", key.as_str())
                .with_attribute("detail", error.to_string()),
        );
    }

    let _ = conn.stream.shutdown().await;
    emit_stream_closed(
        engine,
        context,
        CloseReasonCode::HttpCompleted,
        None,
        None,
        None,
    );
    Ok(())
}
