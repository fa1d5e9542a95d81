//! TLS interception.
//!
//! [`CertificateManager`] owns the local CA and mints per-host leaf
//! certificates for the client side of an intercepted CONNECT tunnel.
//! [`UpstreamConnector`] opens the server side.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::error::{PermDumpError, Result};

pub const CA_CERT_FILE: &str = "permdump-ca.pem";
pub const CA_KEY_FILE: &str = "permdump-ca-key.pem";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;
/// Backdate leaf certificates to tolerate client clock skew.
const NOT_BEFORE_OFFSET_SECS: i64 = 60;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// The local root CA.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
    cert_path: PathBuf,
}

impl CertificateAuthority {
    /// Load the CA from `confdir`, generating and saving a new one if absent.
    pub fn load_or_create(confdir: &Path) -> Result<Self> {
        let cert_path = confdir.join(CA_CERT_FILE);
        let key_path = confdir.join(CA_KEY_FILE);

        let (cert_pem, key_pem) = if cert_path.exists() && key_path.exists() {
            debug!("Loading CA from {}", cert_path.display());
            (fs::read_to_string(&cert_path)?, fs::read_to_string(&key_path)?)
        } else {
            fs::create_dir_all(confdir)?;
            let (cert_pem, key_pem) = Self::generate()?;
            fs::write(&cert_path, &cert_pem)?;
            fs::write(&key_path, &key_pem)?;
            info!("Generated new CA certificate at {}", cert_path.display());
            (cert_pem, key_pem)
        };

        let key_pair = KeyPair::from_pem(&key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)?;
        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| {
                PermDumpError::Certificate(format!(
                    "No certificate found in {}",
                    cert_path.display()
                ))
            })??;

        Ok(Self {
            issuer,
            cert_pem,
            cert_der,
            cert_path,
        })
    }

    /// Generate a self-signed CA. Returns `(cert_pem, key_pem)`.
    fn generate() -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "permdump CA");
        dn.push(DnType::OrganizationName, "permdump");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert.pem(), key_pair.serialize_pem()))
    }

    /// Issue a leaf certificate for `host`. Returns the chain (leaf, CA) and the leaf key.
    pub fn issue(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();
        params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.try_into()?)],
        };

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET_SECS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate()?;
        let cert = params.signed_by(&key_pair, &self.issuer)?;

        let leaf = CertificateDer::from(cert.der().to_vec());
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((vec![leaf, self.cert_der.clone()], key))
    }
}

/// CA plus a per-host cache of server configurations.
pub struct CertificateManager {
    ca: CertificateAuthority,
    cache: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertificateManager {
    pub fn load_or_create(confdir: &Path) -> Result<Self> {
        Ok(Self {
            ca: CertificateAuthority::load_or_create(confdir)?,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca.cert_pem
    }

    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca.cert_der
    }

    pub fn ca_cert_path(&self) -> &Path {
        &self.ca.cert_path
    }

    /// Server-side TLS configuration impersonating `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.cache.read().get(host) {
            return Ok(config.clone());
        }

        let (chain, key) = self.ca.issue(host)?;
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(chain, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);

        debug!("Issued certificate for {}", host);
        self.cache
            .write()
            .entry(host.to_string())
            .or_insert(config.clone());
        Ok(config)
    }

    pub fn cached_hosts(&self) -> usize {
        self.cache.read().len()
    }
}

/// Opens TLS connections to upstream servers.
#[derive(Clone)]
pub struct UpstreamConnector {
    connector: TlsConnector,
}

impl UpstreamConnector {
    /// `insecure` disables upstream certificate verification.
    pub fn new(insecure: bool) -> Result<Self> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?;
        let mut config = if insecure {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Like [`UpstreamConnector::new`] but trusting only `roots`.
    pub fn with_roots(roots: RootCertStore) -> Result<Self> {
        let mut config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub async fn connect(&self, host: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| PermDumpError::Tls(format!("Invalid server name {}: {}", host, e)))?;
        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| PermDumpError::Tls(format!("Handshake with {} failed: {}", host, e)))
    }
}

/// Accepts any upstream certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
