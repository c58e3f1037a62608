//! # SNI Certificate Selection
//!
//! Picks the server certificate for a TLS handshake from the `https.tls` map:
//! the first hostname glob (in declaration order) matching the SNI server name,
//! then the entry named `default`. With neither, no certificate is offered and the
//! handshake fails.
//!
//! [`ClientCertAcceptor`] wraps the axum-server rustls acceptor and records whether
//! the client presented a certificate that passed `https.clientCa` verification.

use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use futures::future::BoxFuture;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tower_http::add_extension::AddExtension;
use tracing::{debug, info};

use crate::core::config::{HttpsConfig, TlsCertificateConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::matcher::glob_to_regex;

const DEFAULT_ENTRY: &str = "default";

enum ServerNamePattern {
    Exact(String),
    Glob(regex::Regex),
}

impl ServerNamePattern {
    fn parse(pattern: &str) -> GatewayResult<Self> {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern.contains('*') {
            Ok(Self::Glob(glob_to_regex(&pattern, "[^.]+")?))
        } else {
            Ok(Self::Exact(pattern))
        }
    }

    fn matches(&self, server_name: &str) -> bool {
        match self {
            Self::Exact(name) => name.eq_ignore_ascii_case(server_name),
            Self::Glob(regex) => regex.is_match(server_name),
        }
    }
}

struct CertEntry {
    source: String,
    pattern: ServerNamePattern,
    key: Arc<CertifiedKey>,
}

/// Hostname-glob certificate store, usable as a rustls certificate resolver
#[derive(Default)]
pub struct SniCertStore {
    entries: Vec<CertEntry>,
    default: Option<Arc<CertifiedKey>>,
}

impl SniCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every configured certificate; any unreadable file fails the whole store
    pub fn from_config(config: &HttpsConfig) -> GatewayResult<Self> {
        let mut store = Self::new();
        for (pattern, files) in config.tls.iter() {
            let key = load_certified_key(files)?;
            store.insert(pattern, key)?;
        }
        info!(
            certificates = store.entries.len(),
            default = store.default.is_some(),
            "Loaded TLS certificates"
        );
        Ok(store)
    }

    /// Add a certificate; the pattern `default` sets the fallback certificate
    pub fn insert(&mut self, pattern: &str, key: Arc<CertifiedKey>) -> GatewayResult<()> {
        if pattern == DEFAULT_ENTRY {
            self.default = Some(key);
            return Ok(());
        }
        self.entries.push(CertEntry {
            source: pattern.to_string(),
            pattern: ServerNamePattern::parse(pattern)?,
            key,
        });
        Ok(())
    }

    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let matched = server_name.and_then(|name| {
            self.entries
                .iter()
                .find(|entry| entry.pattern.matches(name))
        });

        match matched {
            Some(entry) => {
                debug!(server_name = ?server_name, certificate = %entry.source, "Selected TLS certificate");
                Some(Arc::clone(&entry.key))
            }
            None => {
                if self.default.is_none() {
                    debug!(server_name = ?server_name, "No TLS certificate for server name");
                }
                self.default.clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// rustls server configuration resolving certificates from this store.
    ///
    /// With `client_ca`, client certificates are requested and verified against it;
    /// clients without one are still accepted.
    pub fn into_server_config(self, client_ca: Option<&Path>) -> GatewayResult<rustls::ServerConfig> {
        let provider = crypto_provider();
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::tls(format!("Unsupported TLS protocol versions: {}", e)))?;

        let builder = match client_ca {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| GatewayError::tls(format!("Invalid client CA {}: {}", path.display(), e)))?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| GatewayError::tls(format!("Invalid client CA {}: {}", path.display(), e)))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_cert_resolver(Arc::new(self));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

impl ResolvesServerCert for SniCertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

impl fmt::Debug for SniCertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertStore")
            .field("patterns", &self.entries.iter().map(|e| e.source.as_str()).collect::<Vec<_>>())
            .field("default", &self.default.is_some())
            .finish()
    }
}

/// Read a PEM certificate chain and private key
pub fn load_certified_key(files: &TlsCertificateConfig) -> GatewayResult<Arc<CertifiedKey>> {
    let certs = load_certs(&files.cert)?;

    let mut reader = BufReader::new(open(&files.key)?);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::tls(format!("Failed to read key {}: {}", files.key.display(), e)))?
        .ok_or_else(|| GatewayError::tls(format!("No private key found in {}", files.key.display())))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| GatewayError::tls(format!("Unsupported private key {}: {}", files.key.display(), e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn load_certs(path: &Path) -> GatewayResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::tls(format!("Failed to read certificate {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(GatewayError::tls(format!("No certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn open(path: &Path) -> GatewayResult<File> {
    File::open(path).map_err(|e| GatewayError::tls(format!("Failed to open {}: {}", path.display(), e)))
}

/// Per-connection TLS facts, inserted into every request's extensions
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsClientInfo {
    /// The client presented a certificate that verified against `https.clientCa`
    pub client_cert_verified: bool,
}

/// rustls acceptor that tags each connection's service with [`TlsClientInfo`]
#[derive(Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
}

impl ClientCertAcceptor {
    pub fn new(inner: RustlsAcceptor) -> Self {
        Self { inner }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = <RustlsAcceptor as Accept<I, S>>::Stream;
    type Service = AddExtension<S, TlsClientInfo>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            // rustls only records peer certificates that passed verification
            let client_cert_verified = stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| !certs.is_empty())
                .unwrap_or(false);
            let info = TlsClientInfo { client_cert_verified };
            Ok((stream, AddExtension::new(service, info)))
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rustls::sign::{Signer, SigningKey};
    use rustls::{SignatureAlgorithm, SignatureScheme};

    /// Key that never signs, so handshakes using it cannot complete
    #[derive(Debug)]
    struct NullKey;

    impl SigningKey for NullKey {
        fn choose_scheme(&self, _offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
            None
        }

        fn algorithm(&self) -> SignatureAlgorithm {
            SignatureAlgorithm::ECDSA
        }
    }

    pub fn null_key() -> Arc<CertifiedKey> {
        Arc::new(CertifiedKey::new(vec![CertificateDer::from(vec![0u8])], Arc::new(NullKey)))
    }
}
