//! bridgestrap CLI entry point.
//!
//! Wires everything together: flags, logging, the result cache, the shared
//! tor process and the HTTP server, then waits for SIGINT or SIGTERM and
//! unwinds in reverse order. The cache is flushed to disk on the way out so
//! test results survive restarts.

use std::fs::File;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use bridgestrap::error::{Error, Result};
use bridgestrap::handlers::{self, AppState, Templates};
use bridgestrap::ratelimit::TokenBucket;
use bridgestrap::{CliArgs, Metrics, TestCache, TorContext, VERSION};

/// The web route's rate: one request per second with bursts of up to five.
const WEB_RATE: f64 = 1.0;
const WEB_BURST: f64 = 5.0;

/// How long the web server gets to finish open connections at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    if args.version {
        println!("bridgestrap version {}", VERSION);
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new(args.test_timeout as f64)?);
    let cache = Arc::new(TestCache::new(
        chrono::Duration::hours(args.cache_timeout),
        metrics.clone(),
    ));

    if args.print_cache {
        cache.read_from_disk(&args.cache_file)?;
        print_pretty_cache(&cache);
        return Ok(());
    }

    bridgestrap::logger::init(args.log_file.as_deref(), args.unsafe_logging)?;
    info!("Set cache timeout to {} hours.", args.cache_timeout);
    if let Err(e) = cache.read_from_disk(&args.cache_file) {
        info!("Could not read cache: {}", e);
    }

    info!("Setting tor test timeout to {}s.", args.test_timeout);
    let tor = Arc::new(
        TorContext::start(
            &args.tor_binary,
            Duration::from_secs(args.test_timeout),
            metrics.clone(),
        )
        .await?,
    );

    let templates = if args.web {
        info!("Enabling web interface.");
        Some(Arc::new(Templates::load(&args.templates_dir)?))
    } else {
        None
    };

    let state = AppState {
        cache: cache.clone(),
        tor: tor.clone(),
        metrics: metrics.clone(),
        limiter: Arc::new(TokenBucket::new(WEB_RATE, WEB_BURST)),
        templates,
    };
    let app = handlers::router(state);

    let addr = args.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Starting service on {}.", addr);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            let acceptor = build_tls_acceptor(cert, key)?;
            tokio::spawn(serve_tls(listener, acceptor, app, shutdown_rx))
        }
        _ => {
            let mut shutdown_rx = shutdown_rx;
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.changed().await;
                    })
                    .await
                    .map_err(Error::from)
            })
        }
    };

    info!("Waiting for signal to shut down.");
    wait_for_signal().await?;
    info!("Received signal to shut down.");

    if let Err(e) = tor.stop().await {
        error!("Failed to clean up after tor: {}", e);
    }

    let _ = shutdown_tx.send(true);
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Failed to shut down web server: {}", e),
        Ok(Err(e)) => error!("Web server task panicked: {}", e),
        Err(_) => error!("Web server did not shut down within the grace period."),
    }

    if let Err(e) = cache.write_to_disk(&args.cache_file) {
        error!("Failed to write cache to disk: {}", e);
    }

    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Prints the cache in a human-readable table, for `--print-cache`.
fn print_pretty_cache(cache: &TestCache) {
    let snapshot = cache.snapshot();
    let mut num_functional = 0;
    for (addr_port, entry) in &snapshot {
        if entry.error.is_empty() {
            num_functional += 1;
        }
        let short_error: String = entry.error.chars().take(50).collect();
        println!("{:<22} {:<50} {}", addr_port, short_error, entry.time);
    }
    if !snapshot.is_empty() {
        println!(
            "Found {} ({:.2}%) out of {} functional.",
            num_functional,
            num_functional as f64 / snapshot.len() as f64 * 100.0,
            snapshot.len()
        );
    }
}

/// Builds a TLS acceptor from PEM-encoded certificate and key files.
fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use tokio_rustls::rustls::ServerConfig;

    let mut cert_reader = std::io::BufReader::new(File::open(cert_path)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<std::io::Result<Vec<_>>>()?;

    let mut key_reader = std::io::BufReader::new(File::open(key_path)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| Error::Config(format!("no private key found in {:?}", key_path)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("invalid TLS certificate or key: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept loop serving the router over TLS.
///
/// Connection tasks are tracked so that shutdown gives in-flight requests
/// the same grace window the plain-HTTP path gets from axum's graceful
/// shutdown.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            // Reap finished connection tasks as we go.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, _peer) = accepted?;
                let acceptor = acceptor.clone();
                let app = app.clone();
                connections.spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!("TLS handshake failed: {}", e);
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(app);
                    if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        debug!("Error serving TLS connection: {}", e);
                    }
                });
            }
        }
    }

    // Stop accepting, then wait for in-flight connections to finish.
    info!(
        "Waiting for {} open TLS connections to finish.",
        connections.len()
    );
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        debug!("Aborting TLS connections that outlived the grace period.");
        connections.abort_all();
    }
    Ok(())
}
