//! Configuration for httpsd

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::router::Backends;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpsdConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,
    /// Certificate cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Backend origins
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address for HTTPS (e.g., "0.0.0.0:443")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Plain HTTP listener that redirects to HTTPS (e.g., "0.0.0.0:80")
    #[serde(default)]
    pub http_redirect_addr: Option<String>,
    /// Listener for health and counter endpoints
    #[serde(default)]
    pub admin_addr: Option<String>,
    /// How long in-flight connections may drain on shutdown
    #[serde(default = "default_drain_seconds")]
    pub drain_seconds: u64,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Domains a certificate is served for
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
    /// Time allowed for each certificate cache lookup at startup
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_seconds: u64,
}

/// Certificate cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Bucket certificates are stored in
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Region of the bucket
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix inside the bucket
    #[serde(default)]
    pub prefix: Option<String>,
    /// Store certificates in this directory instead of the bucket
    #[serde(default)]
    pub dir: Option<String>,
}

/// One URL per backend category
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    #[serde(default = "default_cgi_backend")]
    pub cgi: String,
    #[serde(default = "default_plack_backend")]
    pub plack: String,
    #[serde(default = "default_backend")]
    pub default: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_drain_seconds() -> u64 {
    10
}

fn default_domains() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_lookup_timeout() -> u64 {
    30
}

fn default_bucket() -> String {
    "certbucket".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cgi_backend() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_plack_backend() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_backend() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            http_redirect_addr: None,
            admin_addr: None,
            drain_seconds: default_drain_seconds(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            domains: default_domains(),
            lookup_timeout_seconds: default_lookup_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            prefix: None,
            dir: None,
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            cgi: default_cgi_backend(),
            plack: default_plack_backend(),
            default: default_backend(),
        }
    }
}

impl ServerConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_seconds)
    }
}

impl TlsConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.lookup_timeout_seconds)
    }
}

impl HttpsdConfig {
    /// Load configuration from an optional TOML file, then apply
    /// `HTTPSD__SECTION__KEY` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = Config::try_from(&Self::development())
            .map_err(|e| ProxyError::Config(format!("Failed to build defaults: {}", e)))?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(Environment::with_prefix("HTTPSD").separator("__"));

        builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ProxyError::Config(format!("Failed to load config: {}", e)))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            cache: CacheConfig::default(),
            backends: BackendsConfig::default(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        Backends::from_config(&self.backends)?;

        if self.tls.domains.is_empty() {
            return Err(ProxyError::Config("No TLS domains configured".to_string()));
        }

        if self.cache.dir.is_none() && self.cache.bucket.is_empty() {
            return Err(ProxyError::Config(
                "A certificate bucket or cache directory is required".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for HttpsdConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = HttpsdConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:443");
        assert_eq!(config.server.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.cache.bucket, "certbucket");
        assert_eq!(config.cache.region, "us-east-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
listen_addr = "0.0.0.0:8443"
http_redirect_addr = "0.0.0.0:80"

[tls]
domains = ["example.com", "www.example.com"]

[cache]
bucket = "prod-certs"
prefix = "edge/"

[backends]
cgi = "http://10.0.0.1:8001"
plack = "http://10.0.0.2:5000"
default = "http://10.0.0.3/static?site=main"
"#;
        let config = HttpsdConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8443");
        assert_eq!(config.server.http_redirect_addr.as_deref(), Some("0.0.0.0:80"));
        assert_eq!(config.tls.domains.len(), 2);
        assert_eq!(config.cache.prefix.as_deref(), Some("edge/"));
        assert_eq!(config.cache.region, "us-east-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[cache]\nbucket = \"file-bucket\"").unwrap();

        let config = HttpsdConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.bucket, "file-bucket");
        assert_eq!(config.server.listen_addr, "0.0.0.0:443");
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let mut config = HttpsdConfig::default();
        config.backends.plack = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bucket_requires_dir() {
        let mut config = HttpsdConfig::default();
        config.cache.bucket = String::new();
        assert!(config.validate().is_err());

        config.cache.dir = Some("/var/lib/httpsd/certs".to_string());
        assert!(config.validate().is_ok());
    }
}
