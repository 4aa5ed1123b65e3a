//! Negotiated TLS session details, published as a connection feature.

use std::time::Duration;

use rustls::pki_types::CertificateDer;
use rustls::{CipherSuite, ProtocolVersion, ServerConnection};

/// What the handshake settled on. Immutable once inserted into the feature bag.
#[derive(Debug, Clone)]
pub struct TlsSession {
    protocol_version: Option<ProtocolVersion>,
    cipher_suite: Option<CipherSuite>,
    alpn_protocol: Option<Vec<u8>>,
    server_name: Option<String>,
    peer_certificates: Vec<CertificateDer<'static>>,
    client_certificate_deferred: bool,
    handshake_duration: Duration,
}

impl TlsSession {
    pub(crate) fn from_connection(
        conn: &ServerConnection,
        client_certificate_deferred: bool,
        handshake_duration: Duration,
    ) -> Self {
        Self {
            protocol_version: conn.protocol_version(),
            cipher_suite: conn.negotiated_cipher_suite().map(|suite| suite.suite()),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name: conn.server_name().map(str::to_owned),
            peer_certificates: conn
                .peer_certificates()
                .map(<[CertificateDer<'static>]>::to_vec)
                .unwrap_or_default(),
            client_certificate_deferred,
            handshake_duration,
        }
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.cipher_suite
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    /// SNI host name sent by the client.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Client certificate chain, end entity first. Empty when none was presented.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certificates
    }

    /// The endpoint asked for a client certificate after the handshake,
    /// instead of during it.
    pub fn client_certificate_deferred(&self) -> bool {
        self.client_certificate_deferred
    }

    pub fn handshake_duration(&self) -> Duration {
        self.handshake_duration
    }

    /// Whether the negotiated application protocol is HTTP/2.
    pub fn is_http2(&self) -> bool {
        self.alpn_protocol() == Some(crate::tls::alpn::H2)
    }
}
