//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, backlog, drain on shutdown)
//!     → connection.rs (context: id, transport, features, abort signal)
//!     → middleware chain (admission, logging, sniffing, TLS)
//!     → Hand off to protocol handler
//! ```
//!
//! # Design Decisions
//! - The transport is type-erased so layers can wrap it in place
//! - rewind.rs lets a probe read ahead without consuming bytes
//! - Each connection tracked for graceful shutdown

pub mod connection;
pub mod listener;
pub mod rewind;

pub use connection::{BoxedTransport, ConnectionContext, ConnectionId, Transport};
pub use listener::{Listener, ListenerError};
pub use rewind::Rewind;
