//! httpsd: TLS edge proxy

use anyhow::Context as _;
use clap::Parser;
use httpsd::acme::{CertManager, SelfSignedIssuer};
use httpsd::cache::{CertCache, Context, DirCache, ObjectCache};
use httpsd::store::S3ObjectStore;
use httpsd::tls::TlsManager;
use httpsd::{HttpsdConfig, ProxyServer, RequestCounters};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "httpsd", version, about = "TLS edge proxy")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TLS listen address
    #[arg(long)]
    addr_tls: Option<String>,

    /// Bucket holding certificates
    #[arg(long)]
    bucket: Option<String>,

    /// Region of the bucket
    #[arg(long)]
    region: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long)]
    prefix: Option<String>,

    /// Keep certificates in this directory instead of the bucket
    #[arg(long)]
    cache_dir: Option<String>,

    /// Plain HTTP listener redirecting to HTTPS
    #[arg(long)]
    redirect_addr: Option<String>,

    /// Listener for /healthz and /debug/vars
    #[arg(long)]
    admin_addr: Option<String>,

    /// Domain to serve (repeatable)
    #[arg(long = "domain")]
    domains: Vec<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(self, config: &mut HttpsdConfig) {
        if let Some(addr) = self.addr_tls {
            config.server.listen_addr = addr;
        }
        if let Some(bucket) = self.bucket {
            config.cache.bucket = bucket;
        }
        if let Some(region) = self.region {
            config.cache.region = region;
        }
        if self.prefix.is_some() {
            config.cache.prefix = self.prefix;
        }
        if self.cache_dir.is_some() {
            config.cache.dir = self.cache_dir;
        }
        if self.redirect_addr.is_some() {
            config.server.http_redirect_addr = self.redirect_addr;
        }
        if self.admin_addr.is_some() {
            config.server.admin_addr = self.admin_addr;
        }
        if !self.domains.is_empty() {
            config.tls.domains = self.domains;
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "httpsd=debug,tower_http=debug"
    } else {
        "httpsd=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_cache(config: &HttpsdConfig) -> anyhow::Result<Arc<dyn CertCache>> {
    if let Some(dir) = &config.cache.dir {
        info!("Certificate cache: directory {}", dir);
        return Ok(Arc::new(DirCache::new(dir)));
    }

    info!(
        "Certificate cache: bucket {} in {}",
        config.cache.bucket, config.cache.region
    );
    let store = S3ObjectStore::from_env(&config.cache.region).await;
    let cache = ObjectCache::new(store, &config.cache.bucket, config.cache.prefix.as_deref())
        .context("Invalid certificate cache configuration")?;
    Ok(Arc::new(cache))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    info!(
        "Starting httpsd v{} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("HTTPSD_GIT_HASH").unwrap_or("unknown")
    );

    let config_path = cli.config.clone();
    if let Some(path) = &config_path {
        info!("Loading configuration from {}", path.display());
    }
    let mut config = HttpsdConfig::load(config_path.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let cache = build_cache(&config).await?;
    let manager = CertManager::new(cache, Arc::new(SelfSignedIssuer))
        .with_lookup_timeout(config.tls.lookup_timeout());

    let ctx = Context::from_token(shutdown.child_token());
    let tls = TlsManager::from_cert_manager(&manager, &ctx, &config.tls.domains).await?;
    let acceptor = tls.build_acceptor()?;

    let counters = Arc::new(RequestCounters::new());
    let server = ProxyServer::new(config, counters, Some(acceptor))?;
    server.run(shutdown).await?;

    info!("Shut down cleanly");
    Ok(())
}
