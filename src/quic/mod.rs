//! Multiplexed stream transport.
//!
//! # Responsibilities
//! - Bridge native transport events into async connections and streams
//! - Deliver every completion exactly once, reusing one waiter per operation kind
//! - Release native handles deterministically on dispose
//!
//! # Design Decisions
//! - The wire protocol lives behind the [`native`] traits. [`loopback`] is an
//!   in-process implementation of them.
//! - Native handles refer back to the engine through `Weak` handlers; an event
//!   for an object that is gone is dropped
//!
//! # Data Flow
//! ```text
//! QuicListener::bind ──► NativeListener ──► NewConnection ──► backlog queue ──► accept_connection
//! QuicConnection::connect ──► NativeConnection::start ──► Connected
//! QuicConnection ──► open_*_stream / accept_stream ──► QuicStream (AsyncRead + AsyncWrite)
//! ```

pub mod connection;
pub mod error;
pub mod listener;
pub mod loopback;
pub mod native;
pub mod options;
pub mod stream;

pub use connection::{ConnectionState, QuicConnection};
pub use error::{QuicError, TransportStatus};
pub use listener::QuicListener;
pub use loopback::LoopbackFabric;
pub use native::{NativeApi, StreamKind};
pub use options::{QuicConnectionOptions, QuicListenerOptions};
pub use stream::{QuicStream, ReadState, SendState, StreamAbortHandle};
