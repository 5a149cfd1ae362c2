use std::time::Duration;

use sponge_cache::RedisCacheConfig;
use thiserror::Error;

const DEFAULT_EXPIRATION_MINUTES: u64 = 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SP_PORT environment variable is not set")]
    MissingListenPort,
    #[error("{0} is not a valid port number")]
    InvalidPort(&'static str),
    #[error("{0} is not a valid integer")]
    InvalidInteger(&'static str),
    #[error("{0} is not a valid boolean")]
    InvalidBoolean(&'static str),
    #[error("SP_CERT_FILE and SP_KEY_FILE must be provided together")]
    PartialCaMaterial,
}

/// Immutable configuration snapshot, read once from the environment before
/// the listener binds and shared by value with every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_hostname: String,
    pub listen_port: u16,
    pub redis: RedisCacheConfig,
    pub cache_ttl: Duration,
    pub ca_cert_pem_path: Option<String>,
    pub ca_key_pem_path: Option<String>,
    pub upstream_tls_insecure: bool,
    pub max_http_head_bytes: usize,
    pub upstream_connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the `SP_*` variable table through `lookup`; an empty value is
    /// treated the same as an unset one.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        let listen_port = parse_port(
            lookup("SP_PORT").ok_or(ConfigError::MissingListenPort)?,
            "SP_PORT",
        )?;
        let listen_hostname = lookup("SP_HOSTNAME").unwrap_or_else(|| "localhost".to_string());

        let redis = RedisCacheConfig {
            hostname: lookup("SP_REDIS_HOSTNAME").unwrap_or_else(|| "localhost".to_string()),
            port: match lookup("SP_REDIS_PORT") {
                Some(value) => parse_port(value, "SP_REDIS_PORT")?,
                None => 6379,
            },
            username: lookup("SP_REDIS_USERNAME"),
            password: lookup("SP_REDIS_PASSWORD"),
            db: match lookup("SP_REDIS_DB") {
                Some(value) => value
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidInteger("SP_REDIS_DB"))?,
                None => 0,
            },
        };

        let expiration_minutes = match lookup("SP_REDIS_EXPIRATION") {
            Some(value) => value
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidInteger("SP_REDIS_EXPIRATION"))?,
            None => DEFAULT_EXPIRATION_MINUTES,
        };

        let ca_cert_pem_path = lookup("SP_CERT_FILE");
        let ca_key_pem_path = lookup("SP_KEY_FILE");
        if ca_cert_pem_path.is_some() != ca_key_pem_path.is_some() {
            return Err(ConfigError::PartialCaMaterial);
        }

        let upstream_tls_insecure = match lookup("SP_UPSTREAM_TLS_INSECURE") {
            Some(value) => parse_boolean(&value, "SP_UPSTREAM_TLS_INSECURE")?,
            None => false,
        };

        Ok(Self {
            listen_hostname,
            listen_port,
            redis,
            cache_ttl: Duration::from_secs(expiration_minutes * 60),
            ca_cert_pem_path,
            ca_key_pem_path,
            upstream_tls_insecure,
            max_http_head_bytes: 64 * 1024,
            upstream_connect_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
        })
    }

    /// MITM interception is on exactly when CA material was configured.
    pub fn mitm_enabled(&self) -> bool {
        self.ca_cert_pem_path.is_some()
    }
}

fn parse_port(value: String, var: &'static str) -> Result<u16, ConfigError> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(var)),
    }
}

fn parse_boolean(value: &str, var: &'static str) -> Result<bool, ConfigError> {
    if value == "1"
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
    {
        return Ok(true);
    }
    if value == "0"
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
    {
        return Ok(false);
    }
    Err(ConfigError::InvalidBoolean(var))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigError, ProxyConfig};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn minimal_environment_applies_documented_defaults() {
        let config =
            ProxyConfig::from_lookup(lookup_from(&[("SP_PORT", "8080")])).expect("must parse");
        assert_eq!(config.listen_hostname, "localhost");
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.redis.hostname, "localhost");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.redis.db, 0);
        assert_eq!(config.cache_ttl, Duration::from_secs(60 * 60));
        assert!(!config.mitm_enabled());
        assert!(!config.upstream_tls_insecure);
    }

    #[test]
    fn missing_listen_port_is_fatal() {
        let error = ProxyConfig::from_lookup(lookup_from(&[])).expect_err("must fail");
        assert_eq!(error, ConfigError::MissingListenPort);
    }

    #[test]
    fn empty_listen_port_counts_as_unset() {
        let error =
            ProxyConfig::from_lookup(lookup_from(&[("SP_PORT", "")])).expect_err("must fail");
        assert_eq!(error, ConfigError::MissingListenPort);
    }

    #[test]
    fn rejects_out_of_range_and_zero_ports() {
        for bad in ["0", "65536", "http", "-1"] {
            let error = ProxyConfig::from_lookup(lookup_from(&[("SP_PORT", bad)]))
                .expect_err("must fail");
            assert_eq!(error, ConfigError::InvalidPort("SP_PORT"));
        }
    }

    #[test]
    fn rejects_malformed_redis_integers() {
        let error = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_REDIS_DB", "three"),
        ]))
        .expect_err("must fail");
        assert_eq!(error, ConfigError::InvalidInteger("SP_REDIS_DB"));

        let error = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_REDIS_EXPIRATION", "soon"),
        ]))
        .expect_err("must fail");
        assert_eq!(error, ConfigError::InvalidInteger("SP_REDIS_EXPIRATION"));
    }

    #[test]
    fn expiration_minutes_convert_to_ttl() {
        let config = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_REDIS_EXPIRATION", "5"),
        ]))
        .expect("must parse");
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
    }

    #[test]
    fn ca_material_must_be_configured_as_a_pair() {
        let error = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_CERT_FILE", "/etc/sponge/ca.pem"),
        ]))
        .expect_err("must fail");
        assert_eq!(error, ConfigError::PartialCaMaterial);

        let config = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_CERT_FILE", "/etc/sponge/ca.pem"),
            ("SP_KEY_FILE", "/etc/sponge/ca.key"),
        ]))
        .expect("must parse");
        assert!(config.mitm_enabled());
    }

    #[test]
    fn upstream_tls_relaxation_accepts_common_spellings() {
        for (raw, expected) in [("1", true), ("true", true), ("NO", false), ("0", false)] {
            let config = ProxyConfig::from_lookup(lookup_from(&[
                ("SP_PORT", "8080"),
                ("SP_UPSTREAM_TLS_INSECURE", raw),
            ]))
            .expect("must parse");
            assert_eq!(config.upstream_tls_insecure, expected, "{raw}");
        }

        let error = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_UPSTREAM_TLS_INSECURE", "maybe"),
        ]))
        .expect_err("must fail");
        assert_eq!(error, ConfigError::InvalidBoolean("SP_UPSTREAM_TLS_INSECURE"));
    }

    #[test]
    fn redis_credentials_flow_into_the_cache_config() {
        let config = ProxyConfig::from_lookup(lookup_from(&[
            ("SP_PORT", "8080"),
            ("SP_REDIS_HOSTNAME", "cache.internal"),
            ("SP_REDIS_PORT", "6380"),
            ("SP_REDIS_USERNAME", "sponge"),
            ("SP_REDIS_PASSWORD", "hunter2"),
            ("SP_REDIS_DB", "3"),
        ]))
        .expect("must parse");
        assert_eq!(config.redis.hostname, "cache.internal");
        assert_eq!(config.redis.port, 6380);
        assert_eq!(config.redis.username.as_deref(), Some("sponge"));
        assert_eq!(config.redis.password.as_deref(), Some("hunter2"));
        assert_eq!(config.redis.db, 3);
    }
}
