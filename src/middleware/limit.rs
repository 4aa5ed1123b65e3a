//! Admission control middleware.
//!
//! # Responsibilities
//! - Take an admission ticket for every connection entering the chain
//! - Close over-quota connections without running downstream
//! - Publish a [`ConnectionReleaser`] so upgraded protocols can free their slot early
//!
//! # Design Decisions
//! - Placed first in the chain so rejected connections cost nothing else
//! - The ticket is released when downstream returns; dropping the ticket
//!   covers the panic and cancellation paths

use futures_util::future::BoxFuture;
use tokio::io::AsyncWriteExt;

use crate::middleware::{ConnectionHandler, ConnectionMiddleware};
use crate::net::ConnectionContext;
use crate::observability::metrics;
use crate::security::limits::{ConnectionLimiter, ConnectionReleaser};

/// Rejects connections beyond the configured concurrency quota.
#[derive(Debug, Clone)]
pub struct ConnectionLimitMiddleware {
    limiter: ConnectionLimiter,
}

impl ConnectionLimitMiddleware {
    pub fn new(limiter: ConnectionLimiter) -> Self {
        Self { limiter }
    }

    /// `None` means unlimited.
    pub fn with_limit(max_connections: Option<usize>) -> Self {
        Self::new(ConnectionLimiter::new(max_connections))
    }

    pub fn limiter(&self) -> &ConnectionLimiter {
        &self.limiter
    }
}

impl ConnectionMiddleware for ConnectionLimitMiddleware {
    fn on_connection<'a>(
        &'a self,
        conn: &'a mut ConnectionContext,
        next: &'a dyn ConnectionHandler,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Some(ticket) = self.limiter.try_admit() else {
                tracing::warn!(
                    connection_id = %conn.id(),
                    limit = ?self.limiter.limit(),
                    "connection rejected"
                );
                metrics::record_connection_rejected();
                if let Err(e) = conn.transport_mut().shutdown().await {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Shutdown after rejection failed");
                }
                return;
            };

            conn.features_mut().insert(ticket.releaser());
            next.handle(conn).await;
            conn.features_mut().remove::<ConnectionReleaser>();
            ticket.release();
        })
    }
}
