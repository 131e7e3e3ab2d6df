//! HTTP Reverse Proxy Server

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{self, HeaderName, HeaderValue},
        uri::Authority,
        HeaderMap, Request, Response, StatusCode, Version,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::HttpsdConfig;
use crate::counters::RequestCounters;
use crate::error::{ProxyError, Result};
use crate::router::{Backends, Category, Router as ProxyRouter, RoutingDecision};

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Facts about the client connection, attached to every request
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub encrypted: bool,
}

/// Shared proxy state
pub struct ProxyState {
    /// Request router
    pub router: ProxyRouter,
    /// HTTP client for forwarding
    pub client: HttpClient,
}

/// Proxy server
pub struct ProxyServer {
    config: HttpsdConfig,
    state: Arc<ProxyState>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    /// Create a new proxy server. Without an acceptor the main listener
    /// serves plain HTTP.
    pub fn new(
        config: HttpsdConfig,
        counters: Arc<RequestCounters>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Result<Self> {
        config.validate()?;

        let backends = Backends::from_config(&config.backends)?;
        let router = ProxyRouter::new(backends, counters);

        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|e| ProxyError::Tls(format!("Backend TLS setup failed: {}", e)))?
            .https_or_http()
            .enable_http1()
            .build();

        // Create HTTP client
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        let state = Arc::new(ProxyState { router, client });

        Ok(Self {
            config,
            state,
            tls_acceptor,
        })
    }

    pub fn counters(&self) -> Arc<RequestCounters> {
        self.state.router.counters().clone()
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind all configured listeners and serve until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if let Some(addr) = &self.config.server.http_redirect_addr {
            let listener = TcpListener::bind(addr).await?;
            info!("Starting HTTP redirect server on {}", addr);
            let router = redirect_router(https_port(&self.config.server.listen_addr));
            tokio::spawn(serve_plain(listener, router, shutdown.clone(), "redirect"));
        }

        if let Some(addr) = &self.config.server.admin_addr {
            let listener = TcpListener::bind(addr).await?;
            info!("Starting admin server on {}", addr);
            let router = admin_router(self.counters());
            tokio::spawn(serve_plain(listener, router, shutdown.clone(), "admin"));
        }

        let addr = &self.config.server.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!("Starting proxy server on {}", addr);

        let backends = self.state.router.backends();
        info!("Configured backends:");
        for category in [Category::Cgi, Category::Plack, Category::Default] {
            let backend = backends.get(category);
            info!(
                "  {:<7} -> {}://{}{}",
                category.label(),
                backend.scheme(),
                backend.authority(),
                backend.path()
            );
        }

        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then drain
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        if self.tls_acceptor.is_some() {
            info!("TLS: enabled");
        } else {
            info!("TLS: disabled (HTTP only)");
        }

        let router = self.router();
        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted_or_backoff(accepted).await {
                    Some(accepted) => accepted,
                    None => continue,
                },
                _ = shutdown.cancelled() => break,
            };

            let router = router.clone();
            let acceptor = self.tls_acceptor.clone();
            let shutdown = shutdown.clone();

            tracker.spawn(async move {
                match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let info = ConnectionInfo { peer, encrypted: true };
                            serve_connection(tls_stream, router, info, shutdown).await;
                        }
                        Err(e) => {
                            debug!("TLS handshake failed from {}: {}", peer, e);
                        }
                    },
                    None => {
                        let info = ConnectionInfo { peer, encrypted: false };
                        serve_connection(stream, router, info, shutdown).await;
                    }
                }
            });
        }

        drop(listener);
        tracker.close();

        let drain = self.config.server.drain_timeout();
        info!("Draining {} connections (up to {:?})", tracker.len(), drain);
        if tokio::time::timeout(drain, tracker.wait()).await.is_err() {
            warn!("Drain deadline passed with {} connections open", tracker.len());
        }

        Ok(())
    }
}

/// Pass an accepted connection through, or log the error and pause.
///
/// Accept errors such as fd exhaustion tend to repeat immediately.
async fn accepted_or_backoff<T>(accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            warn!("Failed to accept connection: {}", e);
            tokio::time::sleep(ACCEPT_BACKOFF).await;
            None
        }
    }
}

/// Serve one client connection, finishing in-flight requests on shutdown
async fn serve_connection<IO>(
    io: IO,
    router: Router,
    info: ConnectionInfo,
    shutdown: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(info);
        router.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!("Error serving connection from {}: {}", info.peer, e);
    }
}

/// Serve a plain HTTP axum router with graceful shutdown
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
    name: &'static str,
) {
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!("{} server error: {}", name, e);
    }
}

/// Port part of the HTTPS listen address, unless it is the default
fn https_port(listen_addr: &str) -> Option<String> {
    listen_addr
        .rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .filter(|port| port != "443")
}

/// Router that sends every request to the HTTPS equivalent URL
pub fn redirect_router(https_port: Option<String>) -> Router {
    Router::new().fallback(move |req: Request<Body>| {
        let https_port = https_port.clone();
        async move {
            let authority = req
                .headers()
                .get(header::HOST)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.parse::<Authority>().ok())
                .or_else(|| req.uri().authority().cloned());
            let host = authority.as_ref().map_or("localhost", |a| a.host());

            let path = req
                .uri()
                .path_and_query()
                .map(|p| p.as_str())
                .unwrap_or("/");
            let redirect_url = match https_port {
                Some(port) => format!("https://{}:{}{}", host, port, path),
                None => format!("https://{}{}", host, path),
            };

            match HeaderValue::from_str(&redirect_url) {
                Ok(location) => {
                    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
                }
                Err(_) => (StatusCode::BAD_REQUEST, "Bad Request").into_response(),
            }
        }
    })
}

/// Router exposing liveness and the request counters
pub fn admin_router(counters: Arc<RequestCounters>) -> Router {
    Router::new()
        .route("/healthz", get(health_endpoint))
        .route("/debug/vars", get(counters_endpoint))
        .with_state(counters)
}

/// Health check endpoint
async fn health_endpoint() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Request counters per backend
async fn counters_endpoint(State(counters): State<Arc<RequestCounters>>) -> impl IntoResponse {
    Json(serde_json::json!({ "backend_counter": counters.snapshot() }))
}

/// Remove hop-by-hop headers, including any named by `Connection`
fn remove_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Rewrite request headers for the backend.
///
/// `User-Agent` is left exactly as the client sent it; the forwarding
/// client never adds one of its own.
fn prepare_forward_headers(
    headers: &mut HeaderMap,
    decision: &RoutingDecision,
    client_ip: Option<IpAddr>,
) {
    remove_hop_headers(headers);

    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(decision.proto.as_str()),
    );

    if let Some(ip) = client_ip {
        let prior: Vec<&str> = headers
            .get_all(&X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        let value = if prior.is_empty() {
            ip.to_string()
        } else {
            format!("{}, {}", prior.join(", "), ip)
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
}

/// Main proxy handler - forwards requests to backends
async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request<Body>) -> Response<Body> {
    let info = req.extensions().get::<ConnectionInfo>().copied();
    let encrypted = info.map_or(false, |info| info.encrypted);

    let decision = state.router.route(
        req.uri().path(),
        req.uri().query().unwrap_or_default(),
        encrypted,
    );

    debug!(
        "Proxying {} {} to {} backend",
        req.method(),
        req.uri(),
        decision.category
    );

    let uri = match decision.uri() {
        Ok(uri) => uri,
        Err(e) => {
            error!("{}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
        }
    };

    let (mut parts, body) = req.into_parts();

    // HTTP/2 clients carry the host in the URI only
    if !parts.headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(header::HOST, host);
            }
        }
    }

    parts.uri = uri;
    parts.version = Version::HTTP_11;
    let client_ip = info.map(|info| info.peer.ip());
    prepare_forward_headers(&mut parts.headers, &decision, client_ip);

    let forward_req = Request::from_parts(parts, body);

    // Send request to backend
    match state.client.request(forward_req).await {
        Ok(response) => {
            let (mut parts, body) = response.into_parts();
            remove_hop_headers(&mut parts.headers);
            Response::from_parts(parts, Body::new(body))
        }
        Err(e) => {
            error!("Backend error for {} backend: {}", decision.category, e);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}
