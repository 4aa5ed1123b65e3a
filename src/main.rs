//! gatehouse server binary.
//!
//! Accepts TCP connections, runs them through the configured middleware chain
//! (admission, optional traffic logging, TLS sniffing, TLS termination) and
//! serves HTTP/1.1 and HTTP/2 with an echo handler at the end of it.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::future::BoxFuture;
use http::{HeaderValue, Request, Response};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::crypto::CryptoProvider;

use gatehouse::config::{load_config, ServerConfig};
use gatehouse::config::watcher::ConfigWatcher;
use gatehouse::lifecycle::{wait_for_signal, Shutdown};
use gatehouse::middleware::{handler_fn, ConnectionBuilder};
use gatehouse::net::{ConnectionContext, Listener};
use gatehouse::observability::{logging, metrics};
use gatehouse::tls::CertificateStore;

#[derive(Debug, Parser)]
#[command(name = "gatehouse", version, about = "Connection-level TLS and admission server")]
struct Cli {
    /// Path to the TOML configuration file. Built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(long)]
    bind: Option<String>,
}

/// Terminal handler: HTTP echo of the request body.
fn serve_http(conn: &mut ConnectionContext) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        let connection_id = conn.id();
        let abort = conn.abort_token();
        let io = TokioIo::new(conn.take_transport());

        let service = service_fn(move |request: Request<Incoming>| async move {
            let mut response = Response::new(request.into_body());
            response
                .headers_mut()
                .insert("x-connection-id", HeaderValue::from(connection_id.as_u64()));
            Ok::<_, Infallible>(response)
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        tokio::select! {
            _ = abort.cancelled() => {
                tracing::debug!(connection_id = %connection_id, "Connection aborted");
            }
            result = builder.serve_connection(io, service) => {
                if let Err(e) = result {
                    tracing::debug!(connection_id = %connection_id, error = %e, "HTTP connection error");
                }
            }
        }
    })
}

/// Apply reloaded configuration. Only certificates change while running.
async fn reload_certificates(
    mut updates: tokio::sync::mpsc::UnboundedReceiver<ServerConfig>,
    store: Arc<CertificateStore>,
    provider: Arc<CryptoProvider>,
) {
    while let Some(config) = updates.recv().await {
        let Some(tls) = config.tls else {
            tracing::warn!("Reloaded configuration has no TLS section; keeping current certificates");
            continue;
        };
        match store.reload(&tls, &provider) {
            Ok(()) => tracing::info!(certificates = store.len(), "Certificates reloaded"),
            Err(e) => tracing::error!(error = %e, "Certificate reload failed; keeping current set"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatehouse starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let certificates = match &config.tls {
        Some(tls) => Some(Arc::new(CertificateStore::from_config(tls, &provider)?)),
        None => None,
    };

    let chain = ConnectionBuilder::from_config(&config, certificates.clone())?;
    tracing::info!(
        stages = chain.len(),
        tls = config.tls.is_some(),
        sniff_tls = config.middleware.sniff_tls,
        connection_logging = config.middleware.connection_logging,
        "Middleware chain built"
    );
    let delegate = chain.run(handler_fn(serve_http));

    // The watcher stops when dropped, so it lives until main returns.
    let _watcher = match (&cli.config, &certificates) {
        (Some(path), Some(store)) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            match watcher.run() {
                Ok(watcher) => {
                    tokio::spawn(reload_certificates(
                        updates,
                        Arc::clone(store),
                        Arc::clone(&provider),
                    ));
                    Some(watcher)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Config watcher unavailable; hot reload disabled");
                    None
                }
            }
        }
        _ => None,
    };

    let listener = Listener::bind(&config.listener).await?;
    let shutdown = Shutdown::new();
    let stop = shutdown.subscribe();

    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        tracing::info!(signal = ?signal, "Shutdown requested");
        shutdown.trigger();
    });

    listener.serve(delegate, stop).await?;
    tracing::info!("gatehouse stopped");
    Ok(())
}
