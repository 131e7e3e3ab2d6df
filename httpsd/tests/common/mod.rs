// Shared helpers for httpsd integration tests

#![allow(dead_code)]

use axum::http::{header, HeaderMap, Uri};
use axum::Router;
use httpsd::config::BackendsConfig;
use httpsd::{HttpsdConfig, ProxyServer, RequestCounters};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Start a backend answering `{x-forwarded-proto}-{name}`.
///
/// The request URI and User-Agent it saw come back in `x-echo-uri` and
/// `x-echo-ua`. Returns the backend's base URL.
pub async fn spawn_echo_backend(name: &'static str) -> String {
    let app = Router::new().fallback(move |headers: HeaderMap, uri: Uri| async move {
        let text = |name| {
            headers
                .get(name)
                .and_then(|v: &axum::http::HeaderValue| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let proto = text("x-forwarded-proto");
        let ua = text(header::USER_AGENT.as_str());
        let forwarded_for = text("x-forwarded-for");
        (
            [
                ("x-echo-uri", uri.to_string()),
                ("x-echo-ua", ua),
                ("x-echo-forwarded-for", forwarded_for),
            ],
            format!("{}-{}", proto, name),
        )
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

/// Address nothing is listening on
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub async fn echo_backends() -> BackendsConfig {
    BackendsConfig {
        cgi: spawn_echo_backend("cgi").await,
        plack: spawn_echo_backend("plack").await,
        default: spawn_echo_backend("default").await,
    }
}

/// A proxy serving on an ephemeral port
pub struct TestProxy {
    pub addr: SocketAddr,
    pub counters: Arc<RequestCounters>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<httpsd::Result<()>>,
}

impl TestProxy {
    pub async fn start(backends: BackendsConfig, acceptor: Option<TlsAcceptor>) -> Self {
        let mut config = HttpsdConfig::development();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.server.drain_seconds = 1;
        config.backends = backends;

        let counters = Arc::new(RequestCounters::new());
        let server = ProxyServer::new(config, counters.clone(), acceptor).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { server.serve(listener, shutdown).await }
        });

        Self {
            addr,
            counters,
            shutdown,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}
