//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::tls::alpn::HttpProtocols;
use crate::tls::options::{ClientCertificateMode, TlsVersion};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listener (bind address, backlog, connection budget).
    pub listener: ListenerConfig,

    /// TLS termination. Absent means plaintext only.
    pub tls: Option<TlsConfig>,

    /// Which connection middleware run, in front of the protocol stage.
    pub middleware: MiddlewareConfig,

    /// Multiplexed transport defaults.
    pub quic: QuicConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Maximum concurrent connections. `None` means unlimited.
    pub max_connections: Option<usize>,

    /// Kernel listen backlog.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8443".to_string(),
            max_connections: Some(10_000),
            backlog: 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Default certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Private key for the default certificate (PEM).
    pub key_path: PathBuf,

    /// Per host name certificates, chosen by SNI.
    #[serde(default)]
    pub sni: Vec<SniCertificateConfig>,

    #[serde(default)]
    pub client_certificate_mode: ClientCertificateMode,

    /// Trust anchors for client certificates (PEM).
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,

    #[serde(default = "default_protocols")]
    pub protocols: Vec<TlsVersion>,

    #[serde(default = "default_true")]
    pub check_certificate_revocation: bool,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    #[serde(default)]
    pub http_protocols: HttpProtocols,
}

/// Certificate for one host name (`example.com` or `*.example.com`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SniCertificateConfig {
    pub host: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn default_protocols() -> Vec<TlsVersion> {
    vec![TlsVersion::Tls12, TlsVersion::Tls13]
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// Connection middleware switches.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Trace-level hex dumps of connection traffic.
    pub connection_logging: bool,

    /// Detect TLS before handshaking so plaintext clients can share the port.
    pub sniff_tls: bool,

    /// How long to wait for a TLS record header when sniffing.
    pub sniff_timeout_ms: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            connection_logging: false,
            sniff_tls: true,
            sniff_timeout_ms: 5_000,
        }
    }
}

/// Multiplexed transport defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuicConfig {
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: u64,

    /// Handshaked connections waiting to be accepted.
    pub backlog: usize,

    pub max_bidirectional_streams: u64,

    pub max_unidirectional_streams: u64,

    /// ALPN identifiers, in preference order.
    pub application_protocols: Vec<String>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            backlog: 512,
            max_bidirectional_streams: 100,
            max_unidirectional_streams: 10,
            application_protocols: vec!["h3".to_string()],
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8443");
        assert_eq!(config.listener.max_connections, Some(10_000));
        assert!(config.tls.is_none());
        assert!(config.middleware.sniff_tls);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn parses_tls_section() {
        let config: ServerConfig = toml::from_str(
            r#"
            [listener]
            bind_address = "127.0.0.1:9443"

            [tls]
            cert_path = "certs/default.pem"
            key_path = "certs/default.key"
            client_certificate_mode = "delay_certificate"
            protocols = ["tls13"]
            http_protocols = "http1"

            [[tls.sni]]
            host = "*.example.com"
            cert_path = "certs/example.pem"
            key_path = "certs/example.key"

            [observability]
            log_format = "json"
            "#,
        )
        .unwrap();

        let tls = config.tls.unwrap();
        assert_eq!(tls.client_certificate_mode, ClientCertificateMode::DelayCertificate);
        assert_eq!(tls.protocols, vec![TlsVersion::Tls13]);
        assert_eq!(tls.http_protocols, HttpProtocols::Http1);
        assert_eq!(tls.handshake_timeout_secs, 10);
        assert!(tls.check_certificate_revocation);
        assert_eq!(tls.sni.len(), 1);
        assert_eq!(tls.sni[0].host, "*.example.com");
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }
}
