//! TCP listener and accept loop.
//!
//! # Responsibilities
//! - Bind to the configured address with the configured listen backlog
//! - Accept incoming TCP connections
//! - Run each connection through the composed middleware chain on its own task
//! - Stop accepting on shutdown and drain in-flight connections
//!
//! # Design Decisions
//! - Admission is not enforced here: the connection-limit middleware rejects
//!   over-quota connections so the decision is visible in the chain
//! - Per-connection accept errors (reset before accept) are not fatal

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::broadcast;

use crate::config::ListenerConfig;
use crate::middleware::ConnectionDelegate;
use crate::net::connection::{ConnectionContext, ConnectionTracker};
use crate::observability::metrics;

/// How long shutdown waits for in-flight connections before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The bind address could not be parsed.
    #[error("invalid bind address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        source: std::net::AddrParseError,
    },
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    Bind(#[source] io::Error),
    /// Failed to accept connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),
}

/// A bound TCP listener feeding accepted connections into a middleware chain.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Connections currently being processed.
    tracker: ConnectionTracker,
}

impl Listener {
    /// Bind to the configured address.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr =
            config
                .bind_address
                .parse()
                .map_err(|source| ListenerError::InvalidAddress {
                    address: config.bind_address.clone(),
                    source,
                })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(ListenerError::Bind)?;
        socket.set_reuseaddr(true).map_err(ListenerError::Bind)?;
        socket.bind(addr).map_err(ListenerError::Bind)?;
        let inner = socket.listen(config.backlog).map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %inner.local_addr().map_err(ListenerError::Bind)?,
            backlog = config.backlog,
            max_connections = ?config.max_connections,
            "Listener bound"
        );

        Ok(Self::from_tokio(inner))
    }

    /// Wrap an already bound listener.
    pub fn from_tokio(inner: TcpListener) -> Self {
        Self {
            inner,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.local_addr()
    }

    /// Tracker of connections currently in the chain.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn serve(
        self,
        delegate: ConnectionDelegate,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let local_addr = self.inner.local_addr().map_err(ListenerError::Accept)?;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(address = %local_addr, "Listener stopping");
                    break;
                }
                accepted = self.inner.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    tracing::debug!(error = %e, "Connection reset before accept");
                    continue;
                }
                Err(e) => {
                    // Typically descriptor exhaustion; back off instead of spinning.
                    tracing::error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
            }

            let mut ctx = ConnectionContext::new(stream).with_addresses(local_addr, peer_addr);
            let guard = self.tracker.track(ctx.id());
            let delegate = delegate.clone();
            metrics::record_connection_accepted();

            tracing::debug!(
                connection_id = %ctx.id(),
                peer_addr = %peer_addr,
                "Connection accepted"
            );

            tokio::spawn(async move {
                let _guard = guard;
                delegate.handle(&mut ctx).await;
            });
        }

        if !self.tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Shutdown deadline reached with connections still open"
            );
        }
        Ok(())
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
