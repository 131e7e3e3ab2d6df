//! Request router for httpsd
//!
//! Classifies an incoming request by path prefix and rewrites it into a
//! destination on one of the three configured backends.

use axum::http::Uri;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use url::{Position, Url};

use crate::config::BackendsConfig;
use crate::counters::RequestCounters;
use crate::error::{ProxyError, Result};

/// Paths under this prefix go to the CGI backend
pub const CGI_PREFIX: &str = "/cgi/";
/// Paths under this prefix go to the Plack application backend
pub const PLACK_PREFIX: &str = "/do/";

/// Backend category a request was routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Cgi,
    Plack,
    Default,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::Cgi => "cgi",
            Category::Plack => "plack",
            Category::Default => "default",
        }
    }

    /// Pick the category for a request path. The CGI prefix is checked first.
    pub fn classify(path: &str) -> Self {
        if path.starts_with(CGI_PREFIX) {
            Category::Cgi
        } else if path.starts_with(PLACK_PREFIX) {
            Category::Plack
        } else {
            Category::Default
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Value of `X-Forwarded-Proto` sent to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedProto {
    Http,
    Https,
}

impl ForwardedProto {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardedProto::Http => "http",
            ForwardedProto::Https => "https",
        }
    }
}

/// A statically configured origin
#[derive(Debug, Clone)]
pub struct Backend {
    scheme: String,
    authority: String,
    path: String,
    query: String,
}

impl Backend {
    /// Build a backend from its base URL
    pub fn from_url(url: &Url) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProxyError::Config(format!(
                "Backend URL '{}' must use http or https",
                url
            )));
        }
        if url.host_str().is_none() {
            return Err(ProxyError::Config(format!("Backend URL '{}' has no host", url)));
        }

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority: url[Position::BeforeHost..Position::AfterPort].to_string(),
            path: url.path().to_string(),
            query: url.query().unwrap_or_default().to_string(),
        })
    }

    /// Parse a backend from a URL string
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid backend URL '{}': {}", raw, e)))?;
        Self::from_url(&url)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

/// The three origins, one per category
#[derive(Debug, Clone)]
pub struct Backends {
    pub cgi: Backend,
    pub plack: Backend,
    pub default: Backend,
}

impl Backends {
    pub fn from_config(config: &BackendsConfig) -> Result<Self> {
        Ok(Self {
            cgi: Backend::parse(&config.cgi)?,
            plack: Backend::parse(&config.plack)?,
            default: Backend::parse(&config.default)?,
        })
    }

    pub fn get(&self, category: Category) -> &Backend {
        match category {
            Category::Cgi => &self.cgi,
            Category::Plack => &self.plack,
            Category::Default => &self.default,
        }
    }
}

/// Where a request should be forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub category: Category,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: String,
    pub proto: ForwardedProto,
}

impl RoutingDecision {
    /// Path plus `?query` when the merged query is non-empty
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// Absolute URI for the outbound request
    pub fn uri(&self) -> Result<Uri> {
        Uri::builder()
            .scheme(self.scheme.as_str())
            .authority(self.authority.as_str())
            .path_and_query(self.path_and_query())
            .build()
            .map_err(|e| ProxyError::Http(format!("Invalid forward URI: {}", e)))
    }
}

/// Router for matching requests to backends
pub struct Router {
    backends: Backends,
    counters: Arc<RequestCounters>,
}

impl Router {
    /// Create a new router counting into `counters`
    pub fn new(backends: Backends, counters: Arc<RequestCounters>) -> Self {
        Self { backends, counters }
    }

    /// Resolve the destination for a request and count it.
    ///
    /// `path` is the request path (starting with `/`), `query` the raw query
    /// string without the leading `?` (empty when absent) and `encrypted`
    /// whether the client connection was TLS.
    pub fn route(&self, path: &str, query: &str, encrypted: bool) -> RoutingDecision {
        let category = Category::classify(path);
        let backend = self.backends.get(category);

        let proto = if encrypted {
            ForwardedProto::Https
        } else {
            ForwardedProto::Http
        };

        self.counters.increment(category);

        RoutingDecision {
            category,
            scheme: backend.scheme.clone(),
            authority: backend.authority.clone(),
            path: single_joining_slash(&backend.path, path),
            query: merge_query(&backend.query, query),
            proto,
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }
}

/// Join a base path and a request path with exactly one `/` between them
pub fn single_joining_slash(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Merge the backend's fixed query with the request query
pub fn merge_query(base: &str, query: &str) -> String {
    if base.is_empty() || query.is_empty() {
        format!("{}{}", base, query)
    } else {
        format!("{}&{}", base, query)
    }
}
