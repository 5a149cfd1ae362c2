use std::sync::atomic::{AtomicU64, Ordering};

use sponge_observe::{Event, EventSink, EventType, FlowContext};

mod config;
pub mod http1;

pub use config::{ConfigError, ProxyConfig};

/// The three-plus-one handling disciplines a transaction can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Opaque CONNECT relay.
    Tunnel,
    /// CONNECT terminated with a forged leaf and cached like plain HTTP.
    Intercept,
    /// Plain-HTTP GET: cache lookup first, origin on miss.
    CachedFetch,
    /// Any other plain-HTTP method: origin first, stored afterwards.
    ForwardFetch,
}

impl Discipline {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tunnel => "tunnel",
            Self::Intercept => "intercept",
            Self::CachedFetch => "cached_fetch",
            Self::ForwardFetch => "forward_fetch",
        }
    }
}

pub fn classify_method(method: &str, mitm_enabled: bool) -> Discipline {
    match method {
        "CONNECT" if mitm_enabled => Discipline::Intercept,
        "CONNECT" => Discipline::Tunnel,
        "GET" => Discipline::CachedFetch,
        _ => Discipline::ForwardFetch,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetParseError {
    InvalidAuthority,
    MissingPort,
    InvalidPort,
    UnsupportedScheme,
    MissingHostHeader,
}

impl TargetParseError {
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidAuthority => "invalid_authority",
            Self::MissingPort => "missing_port",
            Self::InvalidPort => "invalid_port",
            Self::UnsupportedScheme => "unsupported_scheme",
            Self::MissingHostHeader => "missing_host_header",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

/// Parses the `host:port` target of a CONNECT request. The port is
/// mandatory; IPv6 hosts are bracketed.
pub fn parse_connect_authority(authority: &str) -> Result<Authority, TargetParseError> {
    let (host, port) = split_authority(authority)?;
    let port = port.ok_or(TargetParseError::MissingPort)?;
    Ok(Authority { host, port })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// A plain-path request target resolved far enough to fetch and to derive
/// the cache fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainTarget {
    pub scheme: Scheme,
    /// Authority exactly as the client wrote it; this is the fingerprint
    /// host, so a written port stays and an implied one is not added.
    pub authority: String,
    pub host: String,
    pub port: u16,
    /// Absolute path with the query stripped; the fingerprint path.
    pub path: String,
    /// Path plus query, forwarded to origin untouched.
    pub path_and_query: String,
}

/// Resolves an absolute-form target (`http://host[:port]/path`) or an
/// origin-form target plus `Host` header into a fetchable address.
pub fn parse_plain_target(
    target: &str,
    host_header: Option<&str>,
) -> Result<PlainTarget, TargetParseError> {
    let (scheme, remainder) = if let Some(rest) = target.strip_prefix("http://") {
        (Scheme::Http, rest)
    } else if let Some(rest) = target.strip_prefix("https://") {
        (Scheme::Https, rest)
    } else if target.starts_with('/') {
        let authority = host_header.ok_or(TargetParseError::MissingHostHeader)?;
        return build_plain_target(Scheme::Http, authority, target);
    } else {
        return Err(TargetParseError::UnsupportedScheme);
    };

    let (authority, path_and_query) = match remainder.find('/') {
        Some(index) => (&remainder[..index], &remainder[index..]),
        None => (remainder, "/"),
    };
    build_plain_target(scheme, authority, path_and_query)
}

fn build_plain_target(
    scheme: Scheme,
    authority: &str,
    path_and_query: &str,
) -> Result<PlainTarget, TargetParseError> {
    let (host, port) = split_authority(authority)?;
    let path = match path_and_query.split_once('?') {
        Some((path, _)) => path,
        None => path_and_query,
    };
    let path = if path.is_empty() { "/" } else { path };

    Ok(PlainTarget {
        scheme,
        authority: authority.to_string(),
        host,
        port: port.unwrap_or_else(|| scheme.default_port()),
        path: path.to_string(),
        path_and_query: path_and_query.to_string(),
    })
}

fn split_authority(authority: &str) -> Result<(String, Option<u16>), TargetParseError> {
    if authority.is_empty() {
        return Err(TargetParseError::InvalidAuthority);
    }

    if authority.starts_with('[') {
        let bracket_close = authority
            .find(']')
            .ok_or(TargetParseError::InvalidAuthority)?;
        let host = &authority[1..bracket_close];
        if host.is_empty() {
            return Err(TargetParseError::InvalidAuthority);
        }

        let suffix = &authority[bracket_close + 1..];
        if suffix.is_empty() {
            return Ok((host.to_string(), None));
        }
        let port_text = suffix
            .strip_prefix(':')
            .ok_or(TargetParseError::InvalidAuthority)?;
        if port_text.is_empty() {
            return Err(TargetParseError::MissingPort);
        }
        let port = port_text
            .parse::<u16>()
            .map_err(|_| TargetParseError::InvalidPort)?;
        return Ok((host.to_string(), Some(port)));
    }

    match authority.rsplit_once(':') {
        None => Ok((authority.to_string(), None)),
        Some((host, port_text)) => {
            if host.is_empty() {
                return Err(TargetParseError::InvalidAuthority);
            }
            // A second colon means an unbracketed IPv6 literal.
            if host.contains(':') {
                return Err(TargetParseError::InvalidAuthority);
            }
            if port_text.is_empty() {
                return Err(TargetParseError::MissingPort);
            }
            let port = port_text
                .parse::<u16>()
                .map_err(|_| TargetParseError::InvalidPort)?;
            Ok((host.to_string(), Some(port)))
        }
    }
}

/// Shared per-process state: the configuration snapshot, the event sink, and
/// the flow-id counter. Everything else lives per transaction.
pub struct ProxyEngine<S>
where
    S: EventSink,
{
    pub config: ProxyConfig,
    sink: S,
    next_flow_id: AtomicU64,
}

impl<S> ProxyEngine<S>
where
    S: EventSink,
{
    pub fn new(config: ProxyConfig, sink: S) -> Self {
        Self {
            config,
            sink,
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn emit_event(&self, event: Event) {
        self.sink.emit(event);
    }

    /// Classifies one parsed request and records the decision.
    pub fn decide_dispatch(&self, context: &FlowContext, method: &str) -> Discipline {
        let discipline = classify_method(method, self.config.mitm_enabled());
        self.emit_event(
            Event::new(EventType::DispatchDecision, context.clone())
                .with_attribute("method", method)
                .with_attribute("discipline", discipline.as_str()),
        );
        discipline
    }
}

#[cfg(test)]
mod tests {
    use super::{
        classify_method, parse_connect_authority, parse_plain_target, Discipline, Scheme,
        TargetParseError,
    };

    #[test]
    fn connect_routes_by_mitm_flag() {
        assert_eq!(classify_method("CONNECT", true), Discipline::Intercept);
        assert_eq!(classify_method("CONNECT", false), Discipline::Tunnel);
    }

    #[test]
    fn get_is_cached_and_everything_else_forwards() {
        assert_eq!(classify_method("GET", false), Discipline::CachedFetch);
        assert_eq!(classify_method("POST", false), Discipline::ForwardFetch);
        assert_eq!(classify_method("DELETE", true), Discipline::ForwardFetch);
        // Method names are case-sensitive tokens.
        assert_eq!(classify_method("get", false), Discipline::ForwardFetch);
    }

    #[test]
    fn parses_connect_authority_with_domain() {
        let authority = parse_connect_authority("api.example.com:443").expect("must parse");
        assert_eq!(authority.host, "api.example.com");
        assert_eq!(authority.port, 443);
    }

    #[test]
    fn parses_connect_authority_with_bracketed_ipv6() {
        let authority = parse_connect_authority("[2001:db8::1]:8443").expect("must parse");
        assert_eq!(authority.host, "2001:db8::1");
        assert_eq!(authority.port, 8443);
    }

    #[test]
    fn connect_authority_requires_a_port() {
        let error = parse_connect_authority("api.example.com").expect_err("must fail");
        assert_eq!(error, TargetParseError::MissingPort);
    }

    #[test]
    fn rejects_unbracketed_ipv6_authority() {
        let error = parse_connect_authority("2001:db8::1:443").expect_err("must fail");
        assert_eq!(error, TargetParseError::InvalidAuthority);
    }

    #[test]
    fn parses_absolute_form_target() {
        let target =
            parse_plain_target("http://origin.test/foo?limit=1", None).expect("must parse");
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.authority, "origin.test");
        assert_eq!(target.host, "origin.test");
        assert_eq!(target.port, 80);
        assert_eq!(target.path, "/foo");
        assert_eq!(target.path_and_query, "/foo?limit=1");
    }

    #[test]
    fn explicit_port_stays_in_the_authority() {
        let target = parse_plain_target("http://origin.test:8080/foo", None).expect("must parse");
        assert_eq!(target.authority, "origin.test:8080");
        assert_eq!(target.port, 8080);
    }

    #[test]
    fn https_targets_default_to_port_443() {
        let target = parse_plain_target("https://origin.test/secure", None).expect("must parse");
        assert_eq!(target.scheme, Scheme::Https);
        assert_eq!(target.port, 443);
    }

    #[test]
    fn bare_authority_gets_the_root_path() {
        let target = parse_plain_target("http://origin.test", None).expect("must parse");
        assert_eq!(target.path, "/");
        assert_eq!(target.path_and_query, "/");
    }

    #[test]
    fn origin_form_target_uses_the_host_header() {
        let target =
            parse_plain_target("/bar?x=1", Some("origin.test:8080")).expect("must parse");
        assert_eq!(target.scheme, Scheme::Http);
        assert_eq!(target.authority, "origin.test:8080");
        assert_eq!(target.host, "origin.test");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/bar");
    }

    #[test]
    fn origin_form_target_without_host_header_fails() {
        let error = parse_plain_target("/bar", None).expect_err("must fail");
        assert_eq!(error, TargetParseError::MissingHostHeader);
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let error = parse_plain_target("ftp://origin.test/file", None).expect_err("must fail");
        assert_eq!(error, TargetParseError::UnsupportedScheme);
    }
}
