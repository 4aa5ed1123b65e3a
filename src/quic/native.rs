//! The native transport surface.
//!
//! A native transport owns the wire protocol and its own threads. The engine
//! drives it through the handle traits below and receives completion events on
//! the handler it registers for each handle.
//!
//! # Contract
//! - Handlers are registered as `Weak` pointers. An event whose handler has
//!   been dropped is discarded.
//! - Events are delivered on transport-owned threads, never synchronously from
//!   inside a handle call, and in order per connection.
//! - A `Receive` event is not followed by another until the engine calls
//!   `receive_complete` and re-enables receive.
//! - Buffers passed to `send` stay owned by the engine until `SendComplete`.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::quic::error::TransportStatus;
use crate::quic::options::{QuicConnectionOptions, QuicListenerOptions};

pub type NativeResult<T> = Result<T, TransportStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Bidirectional,
    Unidirectional,
}

/// Which directions a stream shutdown affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamShutdown {
    /// Send FIN after any queued data.
    Graceful,
    AbortSend,
    AbortReceive,
    /// Both `AbortSend` and `AbortReceive`.
    Abort,
}

/// Entry point of a native transport.
pub trait NativeApi: Send + Sync {
    fn listener_open(
        &self,
        handler: Weak<dyn ListenerEventHandler>,
    ) -> NativeResult<Arc<dyn NativeListener>>;

    /// Client connection handle. The handler is registered before `start`.
    fn connection_open(&self) -> NativeResult<Arc<dyn NativeConnection>>;
}

pub trait NativeListener: Send + Sync {
    /// Start accepting. Returns the bound address.
    fn start(&self, options: &QuicListenerOptions) -> NativeResult<SocketAddr>;
    fn stop(&self);
    fn close(&self);
}

pub trait NativeConnection: Send + Sync {
    fn set_handler(&self, handler: Weak<dyn ConnectionEventHandler>);
    /// Begin the client handshake. Failures arrive as shutdown events.
    fn start(&self, options: &QuicConnectionOptions) -> NativeResult<()>;
    /// The stream is not visible to the peer until `NativeStream::start`.
    fn stream_open(&self, kind: StreamKind) -> NativeResult<Arc<dyn NativeStream>>;
    fn shutdown(&self, error_code: u64);
    fn close(&self);
    fn local_address(&self) -> Option<SocketAddr>;
    fn remote_address(&self) -> Option<SocketAddr>;
}

pub trait NativeStream: Send + Sync {
    fn set_handler(&self, handler: Weak<dyn StreamEventHandler>);
    /// Completion arrives as `StreamEvent::StartComplete`.
    fn start(&self) -> NativeResult<()>;
    fn send(&self, buffers: &[Bytes], fin: bool) -> NativeResult<()>;
    /// Acknowledge `len` bytes of the last `Receive`.
    fn receive_complete(&self, len: usize);
    fn receive_set_enabled(&self, enabled: bool);
    fn shutdown(&self, how: StreamShutdown, error_code: u64);
    fn close(&self);
    /// Known once the stream has started.
    fn id(&self) -> Option<u64>;
}

pub enum ListenerEvent {
    NewConnection {
        connection: Arc<dyn NativeConnection>,
        negotiated_alpn: Vec<u8>,
    },
}

pub enum ConnectionEvent {
    Connected {
        negotiated_alpn: Option<Vec<u8>>,
    },
    ShutdownInitiatedByTransport {
        status: TransportStatus,
    },
    ShutdownInitiatedByPeer {
        error_code: u64,
    },
    ShutdownComplete,
    PeerStreamStarted {
        stream: Arc<dyn NativeStream>,
        kind: StreamKind,
    },
    /// Streams the peer currently allows us to open.
    StreamsAvailable {
        bidirectional: u64,
        unidirectional: u64,
    },
}

#[derive(Debug)]
pub enum StreamEvent {
    StartComplete {
        result: NativeResult<u64>,
    },
    Receive {
        buffers: Vec<Bytes>,
    },
    SendComplete {
        canceled: bool,
    },
    PeerSendShutdown,
    PeerSendAborted {
        error_code: u64,
    },
    PeerReceiveAborted {
        error_code: u64,
    },
    SendShutdownComplete,
    ShutdownComplete {
        connection_shutdown: bool,
    },
}

pub trait ListenerEventHandler: Send + Sync {
    fn on_listener_event(&self, event: ListenerEvent);
}

pub trait ConnectionEventHandler: Send + Sync {
    fn on_connection_event(&self, event: ConnectionEvent);
}

pub trait StreamEventHandler: Send + Sync {
    fn on_stream_event(&self, event: StreamEvent);
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Connected { negotiated_alpn } => f
                .debug_struct("Connected")
                .field("negotiated_alpn", negotiated_alpn)
                .finish(),
            ConnectionEvent::ShutdownInitiatedByTransport { status } => f
                .debug_struct("ShutdownInitiatedByTransport")
                .field("status", status)
                .finish(),
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => f
                .debug_struct("ShutdownInitiatedByPeer")
                .field("error_code", error_code)
                .finish(),
            ConnectionEvent::ShutdownComplete => f.write_str("ShutdownComplete"),
            ConnectionEvent::PeerStreamStarted { stream, kind } => f
                .debug_struct("PeerStreamStarted")
                .field("stream_id", &stream.id())
                .field("kind", kind)
                .finish(),
            ConnectionEvent::StreamsAvailable {
                bidirectional,
                unidirectional,
            } => f
                .debug_struct("StreamsAvailable")
                .field("bidirectional", bidirectional)
                .field("unidirectional", unidirectional)
                .finish(),
        }
    }
}
