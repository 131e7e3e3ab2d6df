//! Certificate management
//!
//! Obtains the certificate bundle for each served domain from a
//! [`CertCache`]. On a cache miss a new bundle is requested from an
//! [`Issuer`] and written back to the cache so the next start finds it.
//!
//! The ACME protocol itself lives behind [`Issuer`]. [`SelfSignedIssuer`]
//! is the built-in implementation and produces self-signed certificates,
//! which is enough for development and for fronting clients that pin the
//! certificate.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CertCache, Context};
use crate::error::{ProxyError, Result};

/// PEM private key followed by the PEM certificate chain
#[derive(Clone, PartialEq, Eq)]
pub struct CertBundle {
    pem: Vec<u8>,
}

impl CertBundle {
    pub fn new(key_pem: &str, chain_pem: &str) -> Self {
        let mut pem = Vec::with_capacity(key_pem.len() + chain_pem.len() + 1);
        pem.extend_from_slice(key_pem.as_bytes());
        if !key_pem.ends_with('\n') {
            pem.push(b'\n');
        }
        pem.extend_from_slice(chain_pem.as_bytes());
        Self { pem }
    }

    /// Wrap bytes read back from a cache
    pub fn from_pem(pem: Vec<u8>) -> Self {
        Self { pem }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pem
    }
}

impl std::fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertBundle")
            .field("len", &self.pem.len())
            .finish()
    }
}

/// Source of new certificates
#[async_trait]
pub trait Issuer: Send + Sync {
    async fn issue(&self, domain: &str) -> Result<CertBundle>;
}

/// Issues self-signed certificates
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfSignedIssuer;

#[async_trait]
impl Issuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str) -> Result<CertBundle> {
        warn!("Issuing self-signed certificate for {}", domain);

        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).map_err(|e| {
            ProxyError::Certificate {
                domain: domain.to_string(),
                message: format!("Failed to generate certificate: {}", e),
            }
        })?;

        Ok(CertBundle::new(&cert.key_pair.serialize_pem(), &cert.cert.pem()))
    }
}

/// Fetch-or-issue front end over a certificate cache
pub struct CertManager {
    cache: Arc<dyn CertCache>,
    issuer: Arc<dyn Issuer>,
    lookup_timeout: Duration,
}

impl CertManager {
    pub fn new(cache: Arc<dyn CertCache>, issuer: Arc<dyn Issuer>) -> Self {
        Self {
            cache,
            issuer,
            lookup_timeout: Duration::from_secs(30),
        }
    }

    /// Bound each cache call made by the manager
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Certificate bundle for `domain`, issuing one on a cache miss
    pub async fn certificate(&self, ctx: &Context, domain: &str) -> Result<CertBundle> {
        let lookup = ctx.child_with_timeout(self.lookup_timeout);
        match self.cache.fetch(&lookup, domain).await {
            Ok(pem) => {
                debug!("Loaded cached certificate for {}", domain);
                return Ok(CertBundle::from_pem(pem));
            }
            Err(CacheError::Miss) => {
                info!("No cached certificate for {}, requesting one", domain);
            }
            Err(e) => return Err(e.into()),
        }

        let bundle = self.issuer.issue(domain).await?;

        let store = ctx.child_with_timeout(self.lookup_timeout);
        if let Err(e) = self.cache.store(&store, domain, bundle.as_bytes()).await {
            warn!("Failed to cache certificate for {}: {}", domain, e);
        }

        Ok(bundle)
    }

    /// Drop the cached bundle for `domain` so the next lookup issues anew
    pub async fn forget(&self, ctx: &Context, domain: &str) -> Result<()> {
        let call = ctx.child_with_timeout(self.lookup_timeout);
        self.cache.delete(&call, domain).await?;
        info!("Removed cached certificate for {}", domain);
        Ok(())
    }
}
