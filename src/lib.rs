//! gatehouse: connection-level server plumbing.
//!
//! # Architecture Overview
//!
//! ```text
//!   TCP client                                          loopback peer
//!       │                                                     │
//!       ▼                                                     ▼
//!  ┌─────────┐   ┌───────────────────────────────────┐   ┌──────────────┐
//!  │   net   │──▶│            middleware             │   │     quic     │
//!  │listener │   │ limit → logging → sniff → https   │   │ listener     │
//!  └─────────┘   └────────────────┬──────────────────┘   │ connection   │
//!                                 ▼                      │ stream       │
//!                        protocol handler                └──────┬───────┘
//!                                                               ▼
//!                                                        native fabric
//!
//!  Cross-cutting: config, lifecycle, observability, security (admission), sync, tls
//! ```

// Core subsystems
pub mod config;
pub mod middleware;
pub mod net;
pub mod quic;
pub mod tls;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod security;
pub mod sync;

pub use config::ServerConfig;
pub use lifecycle::Shutdown;
pub use middleware::{ConnectionBuilder, ConnectionDelegate, ConnectionHandler, ConnectionMiddleware};
pub use net::{ConnectionContext, Listener};
