//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (budgets > 0, addresses parse, timeouts > 0)
//! - Check that TLS settings are internally consistent
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::tls::options::ClientCertificateMode;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == Some(0) {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than zero; omit it for unlimited",
        ));
    }

    if config.middleware.sniff_tls && config.middleware.sniff_timeout_ms == 0 {
        errors.push(ValidationError::new(
            "middleware.sniff_timeout_ms",
            "must be greater than zero",
        ));
    }

    if let Some(tls) = &config.tls {
        if tls.protocols.is_empty() {
            errors.push(ValidationError::new(
                "tls.protocols",
                "at least one protocol version is required",
            ));
        }
        if tls.handshake_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "tls.handshake_timeout_secs",
                "must be greater than zero",
            ));
        }
        let wants_client_certs = matches!(
            tls.client_certificate_mode,
            ClientCertificateMode::AllowCertificate | ClientCertificateMode::RequireCertificate
        );
        if wants_client_certs && tls.client_ca_path.is_none() {
            errors.push(ValidationError::new(
                "tls.client_ca_path",
                "required when client certificates are requested",
            ));
        }
        for entry in &tls.sni {
            if entry.host.trim().is_empty() {
                errors.push(ValidationError::new("tls.sni.host", "must not be empty"));
            }
        }
    }

    if config.quic.application_protocols.is_empty() {
        errors.push(ValidationError::new(
            "quic.application_protocols",
            "at least one protocol is required",
        ));
    }
    if config.quic.application_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
        errors.push(ValidationError::new(
            "quic.application_protocols",
            "each protocol must be 1 to 255 bytes",
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::TlsConfig;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn client_certificates_need_trust_anchors() {
        let mut config = ServerConfig::default();
        config.tls = Some(
            toml::from_str::<TlsConfig>(
                r#"
                cert_path = "a.pem"
                key_path = "a.key"
                client_certificate_mode = "require_certificate"
                "#,
            )
            .unwrap(),
        );

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "tls.client_ca_path");
    }

    #[test]
    fn delayed_client_certificates_do_not_need_anchors_up_front() {
        let mut config = ServerConfig::default();
        config.tls = Some(
            toml::from_str::<TlsConfig>(
                r#"
                cert_path = "a.pem"
                key_path = "a.key"
                client_certificate_mode = "delay_certificate"
                "#,
            )
            .unwrap(),
        );
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_empty_alpn_list() {
        let mut config = ServerConfig::default();
        config.quic.application_protocols.clear();
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "quic.application_protocols");
    }
}
