use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use thiserror::Error;

pub const DEFAULT_LEAF_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("invalid CA material: {0}")]
    InvalidCaMaterial(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

impl LeafCacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IssuedServerConfig {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

/// Mints per-host leaf certificates signed by the configured CA and caches
/// them by hostname so repeated interceptions of the same origin reuse one
/// handshake identity.
#[derive(Debug)]
pub struct LeafCertificateStore {
    leaf_cache_capacity: usize,
    ca: CaMaterial,
    cache: Mutex<LeafCache>,
}

#[derive(Debug)]
struct CaMaterial {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// Least-recently-used cache of minted leaves. Each lookup stamps the entry
/// with a logical clock tick; eviction drops the entry with the oldest
/// stamp.
#[derive(Default, Debug)]
struct LeafCache {
    entries: HashMap<String, CachedLeaf>,
    clock: u64,
}

#[derive(Debug)]
struct CachedLeaf {
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
    last_used: u64,
}

impl LeafCertificateStore {
    /// Loads operator-provided CA material. Both files must exist and parse;
    /// any failure here is a startup-fatal error for the proxy.
    pub fn from_pem_files(
        ca_cert_path: &str,
        ca_key_path: &str,
        leaf_cache_capacity: usize,
    ) -> Result<Self, TlsConfigError> {
        let cert_pem = fs::read_to_string(ca_cert_path)?;
        let key_pem = fs::read_to_string(ca_key_path)?;
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
            TlsConfigError::InvalidCaMaterial(format!(
                "failed to parse CA certificate PEM from {ca_cert_path}: {error}"
            ))
        })?;
        let ca_key = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&cert_der, ca_key).map_err(|error| {
            TlsConfigError::InvalidCaMaterial(format!(
                "failed to parse issuer metadata from CA certificate {ca_cert_path}: {error}"
            ))
        })?;

        Ok(Self::from_ca_material(
            CaMaterial {
                issuer,
                cert_pem,
                cert_der,
            },
            leaf_cache_capacity,
        ))
    }

    /// Generates a throwaway CA. Intended for tests and local experiments;
    /// the proxy itself only loads CA material from disk.
    pub fn with_generated_ca(
        common_name: &str,
        organization: &str,
        leaf_cache_capacity: usize,
    ) -> Result<Self, TlsConfigError> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.to_string());
        params
            .distinguished_name
            .push(DnType::OrganizationName, organization.to_string());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;
        let cert_pem = ca_cert.pem();
        let cert_der = ca_cert.der().clone();

        Ok(Self::from_ca_material(
            CaMaterial {
                issuer: Issuer::new(params, ca_key),
                cert_pem,
                cert_der,
            },
            leaf_cache_capacity,
        ))
    }

    fn from_ca_material(ca: CaMaterial, leaf_cache_capacity: usize) -> Self {
        Self {
            leaf_cache_capacity,
            ca,
            cache: Mutex::new(LeafCache::default()),
        }
    }

    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_certificate_der(&self) -> CertificateDer<'static> {
        self.ca.cert_der.clone()
    }

    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedServerConfig, TlsConfigError> {
        // DNS names are case-insensitive; IP literals are kept verbatim.
        let cache_key = if host.parse::<IpAddr>().is_ok() {
            host.to_string()
        } else {
            host.to_ascii_lowercase()
        };

        let mut cache = self.cache.lock().map_err(|_| TlsConfigError::LockPoisoned)?;
        cache.clock += 1;
        let stamp = cache.clock;

        if let Some(cached) = cache.entries.get_mut(&cache_key) {
            cached.last_used = stamp;
            return Ok(IssuedServerConfig {
                server_config: Arc::clone(&cached.server_config),
                cache_status: LeafCacheStatus::Hit,
                leaf_cert_der: cached.leaf_cert_der.clone(),
            });
        }

        let (server_config, leaf_cert_der) = self.mint_leaf(&cache_key)?;

        if self.leaf_cache_capacity > 0 {
            if cache.entries.len() >= self.leaf_cache_capacity {
                let coldest = cache
                    .entries
                    .iter()
                    .min_by_key(|(_, leaf)| leaf.last_used)
                    .map(|(key, _)| key.clone());
                if let Some(key) = coldest {
                    cache.entries.remove(&key);
                }
            }
            cache.entries.insert(
                cache_key,
                CachedLeaf {
                    server_config: Arc::clone(&server_config),
                    leaf_cert_der: leaf_cert_der.clone(),
                    last_used: stamp,
                },
            );
        }

        Ok(IssuedServerConfig {
            server_config,
            cache_status: LeafCacheStatus::Miss,
            leaf_cert_der,
        })
    }

    fn mint_leaf(
        &self,
        host: &str,
    ) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsConfigError> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, host.to_string());
        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(host.try_into()?),
        }];
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca.issuer)?;
        let leaf_cert_der = leaf_cert.der().clone();

        // Clients see the minted leaf first and the CA it chains to second.
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![leaf_cert_der.clone(), self.ca.cert_der.clone()],
                PrivateKeyDer::Pkcs8(leaf_key.serialize_der().into()),
            )?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok((Arc::new(server_config), leaf_cert_der))
    }
}

/// Client-side TLS configuration for origin-facing connections. Strict
/// verification against the webpki root set unless the deployment opted into
/// the relaxed verifier for self-signed origins.
pub fn build_upstream_client_config(insecure_skip_verify: bool) -> Arc<ClientConfig> {
    let builder = ClientConfig::builder();
    let mut config = if insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RelaxedServerCertVerifier::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Accepts any certificate chain and server name, but still verifies
/// handshake signatures through the provider so a mangled handshake fails.
#[derive(Debug)]
struct RelaxedServerCertVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl RelaxedServerCertVerifier {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for RelaxedServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        build_upstream_client_config, LeafCacheStatus, LeafCertificateStore,
        DEFAULT_LEAF_CACHE_CAPACITY,
    };

    fn test_store() -> LeafCertificateStore {
        LeafCertificateStore::with_generated_ca(
            "sponge-proxy test CA",
            "sponge-proxy",
            DEFAULT_LEAF_CACHE_CAPACITY,
        )
        .expect("generate CA")
    }

    #[test]
    fn mints_a_leaf_then_reuses_it_for_the_same_host() {
        let store = test_store();

        let first = store
            .server_config_for_host("origin.test")
            .expect("issue leaf");
        assert_eq!(first.cache_status, LeafCacheStatus::Miss);

        let second = store
            .server_config_for_host("ORIGIN.test")
            .expect("issue leaf");
        assert_eq!(second.cache_status, LeafCacheStatus::Hit);
        assert_eq!(second.leaf_cert_der, first.leaf_cert_der);
    }

    #[test]
    fn distinct_hosts_get_distinct_leaves() {
        let store = test_store();
        let first = store
            .server_config_for_host("one.test")
            .expect("issue leaf");
        let second = store
            .server_config_for_host("two.test")
            .expect("issue leaf");
        assert_eq!(second.cache_status, LeafCacheStatus::Miss);
        assert_ne!(first.leaf_cert_der, second.leaf_cert_der);
    }

    #[test]
    fn evicts_the_least_recently_used_leaf_at_capacity() {
        let store = LeafCertificateStore::with_generated_ca("cap CA", "sponge-proxy", 1)
            .expect("generate CA");
        store.server_config_for_host("a.test").expect("issue leaf");
        store.server_config_for_host("b.test").expect("issue leaf");

        let again = store.server_config_for_host("a.test").expect("issue leaf");
        assert_eq!(again.cache_status, LeafCacheStatus::Miss);
    }

    #[test]
    fn recently_touched_leaves_survive_eviction() {
        let store = LeafCertificateStore::with_generated_ca("cap CA", "sponge-proxy", 2)
            .expect("generate CA");
        store.server_config_for_host("a.test").expect("issue leaf");
        store.server_config_for_host("b.test").expect("issue leaf");
        // Touch "a" so "b" is the coldest entry when "c" arrives.
        store.server_config_for_host("a.test").expect("issue leaf");
        store.server_config_for_host("c.test").expect("issue leaf");

        let a_again = store.server_config_for_host("a.test").expect("issue leaf");
        assert_eq!(a_again.cache_status, LeafCacheStatus::Hit);
        let b_again = store.server_config_for_host("b.test").expect("issue leaf");
        assert_eq!(b_again.cache_status, LeafCacheStatus::Miss);
    }

    #[test]
    fn round_trips_ca_material_through_pem_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("ca.pem");
        let key_path = dir.path().join("ca.key");

        // Persist a generated CA the way an operator would provision one.
        let ca_key = rcgen::KeyPair::generate().expect("generate key");
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = params.self_signed(&ca_key).expect("self sign");
        std::fs::write(&cert_path, cert.pem()).expect("write cert");
        std::fs::write(&key_path, ca_key.serialize_pem()).expect("write key");

        let loaded = LeafCertificateStore::from_pem_files(
            cert_path.to_str().expect("utf8 path"),
            key_path.to_str().expect("utf8 path"),
            DEFAULT_LEAF_CACHE_CAPACITY,
        )
        .expect("load CA material");
        let issued = loaded
            .server_config_for_host("origin.test")
            .expect("issue leaf");
        assert_eq!(issued.cache_status, LeafCacheStatus::Miss);
    }

    #[test]
    fn missing_ca_files_are_an_error() {
        let error = LeafCertificateStore::from_pem_files(
            "/nonexistent/ca.pem",
            "/nonexistent/ca.key",
            DEFAULT_LEAF_CACHE_CAPACITY,
        )
        .expect_err("must fail");
        assert!(error.to_string().contains("I/O error"), "{error}");
    }

    #[test]
    fn upstream_client_configs_negotiate_http1() {
        let strict = build_upstream_client_config(false);
        assert_eq!(strict.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let relaxed = build_upstream_client_config(true);
        assert_eq!(relaxed.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
