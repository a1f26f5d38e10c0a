use arc_swap::ArcSwap;
use hostgate::certs::{self, CertificateStore, SniResolver};
use hostgate::config::Config;
use hostgate::error::{PKG_NAME, VERSION};
use hostgate::proxy::ProxyServer;
use hostgate::router::RouteTable;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let routes = Arc::new(ArcSwap::from_pointee(RouteTable::from_config(&config)));
    // One limiter across both listeners: max_connections is a process cap
    let limiter = Arc::new(Semaphore::new(config.server.max_connections));
    let idle_timeout = config.server.idle_timeout();

    // Provision certificate material before the TLS listener binds; a TLS
    // site without material would be unreachable, so this is fatal.
    let tls = if config.has_tls_sites() {
        let store = Arc::new(CertificateStore::new(&config.server.cert_dir)?);
        for domain in config.tls_domains() {
            store.context_for(&domain).await.map_err(|e| {
                error!(host = %domain, error = %e, "Failed to provision certificate");
                e
            })?;
        }

        let fallback = routes.load().default_tls_host().map(String::from);
        let resolver = Arc::new(SniResolver::new(Arc::clone(&store), fallback));
        let tls_config = certs::tls_server_config(resolver);
        Some((TlsAcceptor::from(Arc::new(tls_config)), store))
    } else {
        None
    };

    // Plaintext listener
    let http_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid HTTP bind address: {}", e))?;

    let http_server = ProxyServer::bind(
        http_addr,
        Arc::clone(&routes),
        idle_timeout,
        Arc::clone(&limiter),
        shutdown_rx.clone(),
    )
    .await?;

    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!(error = %e, "HTTP proxy server error");
        }
    });

    // TLS listener, only when at least one site requires it
    let (https_handle, cert_store) = if let Some((acceptor, store)) = tls {
        let https_addr: SocketAddr =
            format!("{}:{}", config.server.bind, config.server.https_port())
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid HTTPS bind address: {}", e))?;

        let https_server = ProxyServer::bind(
            https_addr,
            Arc::clone(&routes),
            idle_timeout,
            Arc::clone(&limiter),
            shutdown_rx.clone(),
        )
        .await?
        .with_tls(acceptor);

        let handle = tokio::spawn(async move {
            if let Err(e) = https_server.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        });

        (Some(handle), Some(store))
    } else {
        (None, None)
    };

    // Wait for shutdown (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    if let Err(e) = reload(&config_path, &routes, cert_store.as_ref()).await {
                        error!(error = %e, "Failed to reload configuration");
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Accept loops stop first, then connection tasks observe the signal
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_handle.await;
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Reload configuration and swap the route table atomically
///
/// In-flight connections keep the snapshot they started with; new TLS sites
/// get material provisioned before the swap so the SNI resolver can serve
/// them immediately.
async fn reload(
    path: &Path,
    routes: &ArcSwap<RouteTable>,
    cert_store: Option<&Arc<CertificateStore>>,
) -> anyhow::Result<()> {
    let config = Config::load(path)?;

    if let Some(store) = cert_store {
        for domain in config.tls_domains() {
            store.context_for(&domain).await?;
        }
    } else if config.has_tls_sites() {
        warn!("Configuration adds TLS sites but no TLS listener is running; restart required");
    }

    let table = RouteTable::from_config(&config);
    info!(sites = table.len(), "Configuration reloaded, route table swapped");
    routes.store(Arc::new(table));

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        http_port = config.server.http_port,
        tls_port = if config.has_tls_sites() { Some(config.server.https_port()) } else { None },
        timeout_secs = config.server.timeout_secs,
        max_connections = config.server.max_connections,
        cert_dir = %config.server.cert_dir,
        "Server configuration"
    );
    info!(
        site_count = config.sites.len(),
        sites = ?config.sites.iter().map(|s| s.domain.as_str()).collect::<Vec<_>>(),
        "Configured sites"
    );
}
