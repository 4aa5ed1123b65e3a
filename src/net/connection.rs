//! Connection context and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Own the connection's byte transport, feature bag and abort signal
//! - Track active connections for graceful shutdown

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Extensions;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A bidirectional byte transport a connection can run over.
///
/// Implemented for every `AsyncRead + AsyncWrite` type, so TCP streams, TLS
/// streams, in-memory duplex pipes and multiplexed streams all qualify.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Borrow as `Any` to test the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Convert into `Any` to recover the concrete type.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> Transport for T
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Type-erased transport owned by a [`ConnectionContext`].
pub type BoxedTransport = Box<dyn Transport>;

/// Placeholder left behind when a middleware takes the transport out.
///
/// Reads see end-of-stream and writes fail.
#[derive(Debug, Default)]
pub struct Detached;

impl AsyncRead for Detached {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Detached {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "transport detached from connection",
        )))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Per-connection state handed through the middleware chain.
///
/// Owned by the task processing the connection. Middleware get `&mut` access,
/// so a layer can swap the transport for the duration of its downstream call
/// and put the original back afterwards.
pub struct ConnectionContext {
    id: ConnectionId,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    transport: BoxedTransport,
    features: Extensions,
    aborted: CancellationToken,
}

impl ConnectionContext {
    /// Create a context around an accepted transport.
    pub fn new(transport: impl Transport) -> Self {
        Self {
            id: ConnectionId::new(),
            local_addr: None,
            remote_addr: None,
            transport: Box::new(transport),
            features: Extensions::new(),
            aborted: CancellationToken::new(),
        }
    }

    /// Attach endpoint addresses.
    pub fn with_addresses(mut self, local: SocketAddr, remote: SocketAddr) -> Self {
        self.local_addr = Some(local);
        self.remote_addr = Some(remote);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The current transport.
    pub fn transport_mut(&mut self) -> &mut BoxedTransport {
        &mut self.transport
    }

    /// Take the transport out, leaving a [`Detached`] placeholder.
    pub fn take_transport(&mut self) -> BoxedTransport {
        std::mem::replace(&mut self.transport, Box::new(Detached))
    }

    /// Install a transport, returning the previous one.
    pub fn set_transport(&mut self, transport: BoxedTransport) -> BoxedTransport {
        std::mem::replace(&mut self.transport, transport)
    }

    /// Whether the current transport is a `T`.
    pub fn transport_is<T: Transport>(&mut self) -> bool {
        (*self.transport).as_any_mut().is::<T>()
    }

    /// Take the transport out as a concrete `T`.
    ///
    /// Returns `None` and leaves the transport in place if it is not a `T`.
    pub fn downcast_transport<T: Transport>(&mut self) -> Option<T> {
        if !self.transport_is::<T>() {
            return None;
        }
        self.take_transport().into_any().downcast::<T>().ok().map(|t| *t)
    }

    pub fn features(&self) -> &Extensions {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut Extensions {
        &mut self.features
    }

    /// Fire the connection's abort signal.
    pub fn abort(&self, reason: &str) {
        if !self.aborted.is_cancelled() {
            tracing::debug!(connection_id = %self.id, reason, "Connection aborted");
            self.aborted.cancel();
        }
    }

    /// A handle to the abort signal, for racing against long waits.
    pub fn abort_token(&self) -> CancellationToken {
        self.aborted.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("aborted", &self.aborted.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    /// Current count of active connections.
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self, id: ConnectionId) -> ConnectionGuard {
        let active = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_active_connections(active);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id,
        }
    }

    /// Get current active connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or the timeout elapses.
    ///
    /// Returns `true` if every connection drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_count.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let active = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_active_connections(active);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 1);

        let guard2 = tracker.track(ConnectionId::new());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn transport_can_be_swapped_and_recovered() {
        let (server, mut client) = duplex(64);
        let mut ctx = ConnectionContext::new(server);

        assert!(ctx.transport_is::<DuplexStream>());
        let raw = ctx.take_transport();
        assert!(ctx.transport_is::<Detached>());

        ctx.set_transport(raw);
        let mut recovered = ctx.downcast_transport::<DuplexStream>().expect("duplex transport");
        recovered.write_all(b"hi").await.unwrap();

        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn downcast_to_wrong_type_leaves_transport() {
        let (server, _client) = duplex(64);
        let mut ctx = ConnectionContext::new(server);
        assert!(ctx.downcast_transport::<Detached>().is_none());
        assert!(ctx.transport_is::<DuplexStream>());
    }

    #[test]
    fn abort_fires_token_once() {
        let (server, _client) = duplex(8);
        let ctx = ConnectionContext::new(server);
        let token = ctx.abort_token();
        assert!(!token.is_cancelled());
        ctx.abort("test");
        ctx.abort("again");
        assert!(token.is_cancelled());
        assert!(ctx.is_aborted());
    }
}
