//! Accepts multiplexed connections from a native listener.
//!
//! Handshaked connections are handed over through a bounded queue of
//! `backlog` entries. The native listener's thread blocks while the queue is
//! full, so the transport stops completing handshakes until the application
//! catches up.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::quic::connection::QuicConnection;
use crate::quic::error::QuicError;
use crate::quic::native::{ListenerEvent, ListenerEventHandler, NativeApi, NativeListener};
use crate::quic::options::QuicListenerOptions;

struct ListenerShared {
    tx: mpsc::Sender<QuicConnection>,
}

impl ListenerEventHandler for ListenerShared {
    fn on_listener_event(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::NewConnection {
                connection,
                negotiated_alpn,
            } => {
                let connection = QuicConnection::accepted(connection, negotiated_alpn);
                tracing::debug!(remote = ?connection.remote_address(), "Accepted connection");
                // Runs on a native thread, never inside the runtime.
                if self.tx.blocking_send(connection).is_err() {
                    tracing::debug!("Listener closed; dropping accepted connection");
                }
            }
        }
    }
}

pub struct QuicListener {
    native: Arc<dyn NativeListener>,
    // Keeps the event handler alive.
    _shared: Arc<ListenerShared>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QuicConnection>>,
    local_address: SocketAddr,
    // Wakes accepts parked on `rx` when the listener is disposed.
    closed: CancellationToken,
    disposed: AtomicBool,
}

impl QuicListener {
    /// Open a native listener and start accepting on `options.address`.
    pub fn bind(api: &dyn NativeApi, options: QuicListenerOptions) -> Result<Self, QuicError> {
        let (tx, rx) = mpsc::channel(options.backlog.max(1));
        let shared = Arc::new(ListenerShared { tx });
        let handler = Arc::downgrade(&shared) as Weak<dyn ListenerEventHandler>;
        let native = api.listener_open(handler)?;

        let local_address = match native.start(&options) {
            Ok(address) => address,
            Err(status) => {
                native.close();
                return Err(status.into());
            }
        };

        tracing::info!(
            address = %local_address,
            backlog = options.backlog,
            alpn = ?options
                .application_protocols
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect::<Vec<_>>(),
            "QUIC listener started"
        );

        Ok(Self {
            native,
            _shared: shared,
            rx: tokio::sync::Mutex::new(rx),
            local_address,
            closed: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        })
    }

    /// Next handshaked connection, in the order handshakes completed.
    pub async fn accept_connection(&self) -> Result<QuicConnection, QuicError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(QuicError::OperationAborted);
        }
        let mut rx = self.rx.lock().await;
        let received = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            connection = rx.recv() => Some(connection),
        };
        match received {
            Some(connection) => connection.ok_or(QuicError::OperationAborted),
            None => {
                // dispose could not take the lock while we held it.
                rx.close();
                Err(QuicError::OperationAborted)
            }
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Stop accepting and release the native listener. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.native.stop();
        self.closed.cancel();
        // Unblocks a native thread waiting on a full backlog. A pending accept
        // holds the lock and closes the queue itself.
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
        self.native.close();
        tracing::debug!(address = %self.local_address, "QUIC listener disposed");
    }
}

impl Drop for QuicListener {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for QuicListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicListener")
            .field("local_address", &self.local_address)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
