//! Error types for httpsd

use thiserror::Error;

use crate::cache::CacheError;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate could not be issued or decoded
    #[error("Certificate error for {domain}: {message}")]
    Certificate { domain: String, message: String },

    /// Certificate cache error
    #[error("Certificate cache error: {0}")]
    Cache(#[from] CacheError),
}
