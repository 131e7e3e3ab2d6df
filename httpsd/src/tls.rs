//! TLS configuration
//!
//! Turns certificate bundles into a rustls server configuration that picks
//! the certificate by SNI.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::Item;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::acme::{CertBundle, CertManager};
use crate::cache::Context;
use crate::error::{ProxyError, Result};

fn cert_error(domain: &str, message: impl Into<String>) -> ProxyError {
    ProxyError::Certificate {
        domain: domain.to_string(),
        message: message.into(),
    }
}

/// Split a bundle into its certificate chain and private key
pub fn parse_bundle(
    domain: &str,
    bundle: &CertBundle,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(bundle.as_bytes());
    let mut chain = Vec::new();
    let mut key = None;

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| cert_error(domain, format!("Invalid PEM: {}", e)))?;
        match item {
            Item::X509Certificate(cert) => chain.push(cert),
            Item::Pkcs8Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
            Item::Pkcs1Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
            Item::Sec1Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
            _ => {}
        }
    }

    if chain.is_empty() {
        return Err(cert_error(domain, "No certificates found in bundle"));
    }
    let key = key.ok_or_else(|| cert_error(domain, "No private key found in bundle"))?;

    Ok((chain, key))
}

/// Build a rustls signing identity from a bundle
pub fn certified_key(domain: &str, bundle: &CertBundle) -> Result<CertifiedKey> {
    let (chain, key) = parse_bundle(domain, bundle)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| cert_error(domain, format!("Unsupported private key: {}", e)))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Collects one certificate per domain and builds the TLS acceptor
pub struct TlsManager {
    resolver: ResolvesServerCertUsingSni,
    domains: Vec<String>,
}

impl TlsManager {
    pub fn new() -> Self {
        Self {
            resolver: ResolvesServerCertUsingSni::new(),
            domains: Vec::new(),
        }
    }

    /// Obtain certificates for every domain through `manager`
    pub async fn from_cert_manager(
        manager: &CertManager,
        ctx: &Context,
        domains: &[String],
    ) -> Result<Self> {
        let mut tls = Self::new();
        for domain in domains {
            let bundle = manager.certificate(ctx, domain).await?;
            tls.add(domain, &bundle)?;
            info!("Loaded TLS certificate for {}", domain);
        }
        Ok(tls)
    }

    /// Serve `bundle` for SNI name `domain`
    pub fn add(&mut self, domain: &str, bundle: &CertBundle) -> Result<()> {
        let key = certified_key(domain, bundle)?;
        self.resolver
            .add(domain, key)
            .map_err(|e| cert_error(domain, format!("Certificate rejected: {}", e)))?;
        self.domains.push(domain.to_string());
        Ok(())
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Build rustls server config
    pub fn build_server_config(self) -> Result<ServerConfig> {
        if self.domains.is_empty() {
            return Err(ProxyError::Tls("No certificates loaded".to_string()));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("TLS config error: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(self.resolver));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        Ok(config)
    }

    /// Build a TLS acceptor from the collected certificates
    pub fn build_acceptor(self) -> Result<TlsAcceptor> {
        let server_config = self.build_server_config()?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

impl Default for TlsManager {
    fn default() -> Self {
        Self::new()
    }
}
