//! TLS subsystem.
//!
//! # Data Flow
//! ```text
//! Raw bytes
//!     → client_hello.rs (is this a ClientHello? how long is the record?)
//!     → options.rs      (versions, client auth, ALPN → rustls::ServerConfig)
//!     → certs.rs        (certificate per SNI host name)
//!     → verifier.rs     (pluggable client certificate validation)
//!     → session.rs      (negotiated parameters published to the chain)
//! ```
//!
//! # Design Decisions
//! - rustls with the ring provider; no OpenSSL
//! - Static and per-connection configurations share one builder path
//! - Certificate sets reload atomically without dropping connections

pub mod alpn;
pub mod certs;
pub mod client_hello;
pub mod error;
pub mod options;
pub mod session;
pub mod verifier;

pub use alpn::HttpProtocols;
pub use certs::{CertificateSelector, CertificateStore, FixedCertificate};
pub use client_hello::{ClientHelloParser, ParseOutcome};
pub use error::{HandshakeError, TlsConfigError};
pub use options::{
    ClientCertificateMode, HttpsConnectionOptions, TlsHandshakeCallback,
    TlsHandshakeCallbackContext, TlsHandshakeCallbackOptions, TlsVersion,
};
pub use session::TlsSession;
pub use verifier::{ClientCertificateValidator, WebPkiValidator};
