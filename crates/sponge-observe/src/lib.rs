use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RequestReceived,
    RequestParseFailed,
    DispatchDecision,
    TlsHandshakeStarted,
    TlsHandshakeSucceeded,
    TlsHandshakeFailed,
    CacheHit,
    CacheMiss,
    CacheDecodeFailed,
    CacheStoreFailed,
    UpstreamFetchFailed,
    ResponseServed,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestReceived => "request_received",
            Self::RequestParseFailed => "request_parse_failed",
            Self::DispatchDecision => "dispatch_decision",
            Self::TlsHandshakeStarted => "tls_handshake_started",
            Self::TlsHandshakeSucceeded => "tls_handshake_succeeded",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::CacheDecodeFailed => "cache_decode_failed",
            Self::CacheStoreFailed => "cache_store_failed",
            Self::UpstreamFetchFailed => "upstream_fetch_failed",
            Self::ResponseServed => "response_served",
            Self::StreamClosed => "stream_closed",
        }
    }
}

/// Which handling discipline a flow is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProtocol {
    Http1,
    Tunnel,
    Intercepted,
}

impl FlowProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http1 => "http1",
            Self::Tunnel => "tunnel",
            Self::Intercepted => "intercepted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub flow_id: u64,
    pub client_addr: String,
    pub server_host: String,
    pub server_port: u16,
    pub protocol: FlowProtocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Captures events for assertions in tests.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

/// One line per event on stderr; the sink the proxy binary installs.
#[derive(Debug, Default)]
pub struct StderrEventSink;

impl EventSink for StderrEventSink {
    fn emit(&self, event: Event) {
        let mut line = format!(
            "[{}] flow={} client={} server={}:{} protocol={}",
            event.kind.as_str(),
            event.context.flow_id,
            event.context.client_addr,
            event.context.server_host,
            event.context.server_port,
            event.context.protocol.as_str(),
        );
        for (name, value) in &event.attributes {
            line.push_str(&format!(" {name}={value}"));
        }
        eprintln!("{line}");
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
