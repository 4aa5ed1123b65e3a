//! Multiplexed connection over a native connection handle.
//!
//! # Responsibilities
//! - Track the connection state from native events
//! - Queue peer-started streams for `accept_stream`
//! - Open local streams once connected
//! - Close gracefully (`close`) or abortively (`dispose`)
//!
//! # Design Decisions
//! - The state is published on a `watch` channel; connect and close wait on it
//! - The inbound queue's sender is dropped on shutdown so `accept_stream` ends,
//!   while streams already queued stay consumable
//! - Whether the peer aborted or we closed is recorded so accepts report the
//!   right error

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, watch};

use crate::quic::error::{QuicError, TransportStatus};
use crate::quic::native::{
    ConnectionEvent, ConnectionEventHandler, NativeApi, NativeConnection, StreamKind,
};
use crate::quic::options::QuicConnectionOptions;
use crate::quic::stream::{QuicStream, StreamShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connected,
    ShutdownInitiatedByTransport,
    ShutdownInitiatedByPeer,
    ShutdownComplete,
}

impl ConnectionState {
    fn is_shutting_down(self) -> bool {
        !matches!(self, ConnectionState::NotConnected | ConnectionState::Connected)
    }
}

struct Inner {
    was_connected: bool,
    /// Why a connect attempt failed.
    connect_error: Option<QuicError>,
    peer_error_code: Option<u64>,
    transport_status: Option<TransportStatus>,
    negotiated_alpn: Option<Vec<u8>>,
    bidirectional_available: u64,
    unidirectional_available: u64,
    inbound_tx: Option<mpsc::UnboundedSender<QuicStream>>,
    streams: Vec<Weak<StreamShared>>,
}

struct ConnectionShared {
    native: Arc<dyn NativeConnection>,
    phase: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QuicStream>>,
    disposed: AtomicBool,
}

impl ConnectionShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("connection state mutex poisoned")
    }

    fn set_phase(&self, phase: ConnectionState) {
        self.phase.send_if_modified(|current| {
            // Never leave ShutdownComplete.
            if *current == phase || *current == ConnectionState::ShutdownComplete {
                return false;
            }
            *current = phase;
            true
        });
    }

    /// The error reported once the connection is going away.
    fn closed_error(&self) -> QuicError {
        let inner = self.lock();
        if let Some(error_code) = inner.peer_error_code {
            return QuicError::ConnectionAborted { error_code };
        }
        match inner.transport_status {
            Some(status) => QuicError::from_status(status),
            None => QuicError::OperationAborted,
        }
    }

    fn track(&self, stream: &QuicStream) {
        let mut inner = self.lock();
        inner
            .streams
            .retain(|s| s.upgrade().is_some_and(|s| !s.is_disposed()));
        inner.streams.push(stream.downgrade());
    }
}

impl ConnectionEventHandler for ConnectionShared {
    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { negotiated_alpn } => {
                {
                    let mut inner = self.lock();
                    inner.was_connected = true;
                    if negotiated_alpn.is_some() {
                        inner.negotiated_alpn = negotiated_alpn;
                    }
                }
                tracing::debug!(remote = ?self.native.remote_address(), "Connection established");
                self.set_phase(ConnectionState::Connected);
            }
            ConnectionEvent::ShutdownInitiatedByTransport { status } => {
                {
                    let mut inner = self.lock();
                    inner.transport_status = Some(status);
                    if !inner.was_connected {
                        inner.connect_error = Some(QuicError::from_status(status));
                    }
                    inner.inbound_tx = None;
                }
                tracing::debug!(%status, "Connection shut down by transport");
                self.set_phase(ConnectionState::ShutdownInitiatedByTransport);
            }
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => {
                {
                    let mut inner = self.lock();
                    inner.peer_error_code = Some(error_code);
                    if !inner.was_connected {
                        inner.connect_error = Some(QuicError::ConnectionAborted { error_code });
                    }
                    inner.inbound_tx = None;
                }
                tracing::debug!(error_code, "Connection shut down by peer");
                self.set_phase(ConnectionState::ShutdownInitiatedByPeer);
            }
            ConnectionEvent::ShutdownComplete => {
                {
                    let mut inner = self.lock();
                    if !inner.was_connected && inner.connect_error.is_none() {
                        inner.connect_error = Some(QuicError::OperationAborted);
                    }
                    inner.inbound_tx = None;
                }
                self.set_phase(ConnectionState::ShutdownComplete);
            }
            ConnectionEvent::PeerStreamStarted { stream, kind } => {
                let stream = QuicStream::inbound(stream, kind);
                let tx = self.lock().inbound_tx.clone();
                match tx {
                    Some(tx) => {
                        self.track(&stream);
                        tracing::trace!(stream_id = ?stream.id(), ?kind, "Peer started stream");
                        // A closed receiver means the connection is disposed;
                        // the stream is dropped and disposes itself.
                        let _ = tx.send(stream);
                    }
                    None => drop(stream),
                }
            }
            ConnectionEvent::StreamsAvailable {
                bidirectional,
                unidirectional,
            } => {
                let mut inner = self.lock();
                inner.bidirectional_available = bidirectional;
                inner.unidirectional_available = unidirectional;
            }
        }
    }
}

/// A multiplexed connection. Owns its native handle; dropping it disposes it.
pub struct QuicConnection {
    shared: Arc<ConnectionShared>,
}

impl QuicConnection {
    fn from_native(native: Arc<dyn NativeConnection>, negotiated_alpn: Option<Vec<u8>>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(ConnectionState::NotConnected);
        let shared = Arc::new(ConnectionShared {
            native,
            phase,
            inner: Mutex::new(Inner {
                was_connected: false,
                connect_error: None,
                peer_error_code: None,
                transport_status: None,
                negotiated_alpn,
                bidirectional_available: 0,
                unidirectional_available: 0,
                inbound_tx: Some(inbound_tx),
                streams: Vec::new(),
            }),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            disposed: AtomicBool::new(false),
        });
        let handler = Arc::downgrade(&shared) as Weak<dyn ConnectionEventHandler>;
        shared.native.set_handler(handler);
        Self { shared }
    }

    /// Server side of a handshake the listener accepted.
    pub(crate) fn accepted(native: Arc<dyn NativeConnection>, negotiated_alpn: Vec<u8>) -> Self {
        Self::from_native(native, Some(negotiated_alpn))
    }

    /// Connect to a listener and wait until the handshake completes.
    pub async fn connect(
        api: &dyn NativeApi,
        options: QuicConnectionOptions,
    ) -> Result<Self, QuicError> {
        let native = api.connection_open()?;
        let connection = Self::from_native(native, None);
        connection.shared.native.start(&options)?;

        let mut phase = connection.shared.phase.subscribe();
        phase
            .wait_for(|p| *p != ConnectionState::NotConnected)
            .await
            .map_err(|_| QuicError::OperationAborted)?;

        let connect_error = connection.shared.lock().connect_error;
        if let Some(error) = connect_error {
            tracing::debug!(remote = %options.remote_address, error = %error, "Connect failed");
            return Err(error);
        }
        Ok(connection)
    }

    async fn wait_connected(&self) -> Result<(), QuicError> {
        let mut phase = self.shared.phase.subscribe();
        let state = *phase
            .wait_for(|p| *p != ConnectionState::NotConnected)
            .await
            .map_err(|_| QuicError::OperationAborted)?;
        if state == ConnectionState::Connected {
            return Ok(());
        }
        let connect_error = self.shared.lock().connect_error;
        Err(connect_error.unwrap_or_else(|| self.shared.closed_error()))
    }

    /// Next stream started by the peer.
    ///
    /// Streams queued before shutdown are still returned. After that, fails
    /// with [`QuicError::ConnectionAborted`] if the peer closed the connection,
    /// or [`QuicError::OperationAborted`] if we did.
    pub async fn accept_stream(&self) -> Result<QuicStream, QuicError> {
        let mut rx = self.shared.inbound_rx.lock().await;
        match rx.recv().await {
            Some(stream) => Ok(stream),
            None => Err(self.shared.closed_error()),
        }
    }

    pub async fn open_bidirectional_stream(&self) -> Result<QuicStream, QuicError> {
        self.open_stream(StreamKind::Bidirectional).await
    }

    pub async fn open_unidirectional_stream(&self) -> Result<QuicStream, QuicError> {
        self.open_stream(StreamKind::Unidirectional).await
    }

    async fn open_stream(&self, kind: StreamKind) -> Result<QuicStream, QuicError> {
        self.wait_connected().await?;
        let native = self.shared.native.stream_open(kind)?;
        let stream = QuicStream::open(native, kind)?;
        self.shared.track(&stream);
        tracing::trace!(stream_id = ?stream.id(), ?kind, "Opened stream");
        Ok(stream)
    }

    /// Bidirectional streams the peer currently lets us open.
    pub fn remote_available_bidirectional_stream_count(&self) -> u64 {
        self.shared.lock().bidirectional_available
    }

    pub fn remote_available_unidirectional_stream_count(&self) -> u64 {
        self.shared.lock().unidirectional_available
    }

    /// Streams of this connection that have not been disposed.
    pub fn live_stream_count(&self) -> usize {
        let mut inner = self.shared.lock();
        inner
            .streams
            .retain(|s| s.upgrade().is_some_and(|s| !s.is_disposed()));
        inner.streams.len()
    }

    /// Shut the connection down with `error_code` and wait until it is gone.
    pub async fn close(&self, error_code: u64) {
        let mut phase = self.shared.phase.subscribe();
        if *phase.borrow() == ConnectionState::ShutdownComplete {
            return;
        }
        self.shared.native.shutdown(error_code);
        let _ = phase
            .wait_for(|p| *p == ConnectionState::ShutdownComplete)
            .await;
    }

    /// Abortively release the connection. Safe to call more than once.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.lock().inbound_tx = None;
        self.shared.native.close();
        tracing::trace!(remote = ?self.remote_address(), "Connection disposed");
    }

    pub fn negotiated_application_protocol(&self) -> Option<Vec<u8>> {
        self.shared.lock().negotiated_alpn.clone()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.native.remote_address()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.shared.native.local_address()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.phase.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }
}

impl Drop for QuicConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for QuicConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicConnection")
            .field("state", &self.state())
            .field("local", &self.local_address())
            .field("remote", &self.remote_address())
            .finish()
    }
}
