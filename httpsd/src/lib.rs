//! httpsd: TLS edge proxy
//!
//! Terminates TLS for a set of domains and forwards every request to one
//! of three backends chosen by path prefix:
//!
//! - `/cgi/...` goes to the cgi backend
//! - `/do/...` goes to the plack backend
//! - everything else goes to the default backend
//!
//! Certificates are kept in an object store bucket (or a local directory)
//! through the [`cache::CertCache`] interface.
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:443"
//! http_redirect_addr = "0.0.0.0:80"
//! admin_addr = "127.0.0.1:9090"
//!
//! [tls]
//! domains = ["example.com"]
//!
//! [cache]
//! bucket = "certbucket"
//! region = "us-east-1"
//!
//! [backends]
//! cgi = "http://127.0.0.1:8001"
//! plack = "http://127.0.0.1:5000"
//! default = "http://127.0.0.1:8080"
//! ```

pub mod acme;
pub mod cache;
pub mod config;
pub mod counters;
pub mod error;
pub mod proxy;
pub mod router;
pub mod store;
pub mod tls;

pub use config::HttpsdConfig;
pub use counters::RequestCounters;
pub use error::{ProxyError, Result};
pub use proxy::ProxyServer;
pub use router::{Category, Router};
