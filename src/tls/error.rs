//! TLS error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors building a TLS server configuration or loading its material.
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("a certificate and a certificate selector are mutually exclusive")]
    CertificateSourceConflict,

    #[error("no certificate or certificate selector configured")]
    MissingCertificateSource,

    #[error("no TLS protocol versions enabled")]
    NoProtocolVersions,

    #[error("client certificate mode {0:?} requires a client certificate validator")]
    MissingClientCertificateValidator(crate::tls::ClientCertificateMode),

    #[error("failed to build client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),

    /// Raised by a per-connection configuration callback.
    #[error("{0}")]
    Callback(String),
}

/// Why a TLS handshake did not complete.
///
/// Internal to the HTTPS middleware: failures are logged and counted, never
/// propagated to the protocol handler.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,

    #[error("connection aborted during handshake")]
    Aborted,

    #[error("I/O error during handshake: {0}")]
    Io(#[source] io::Error),

    #[error("authentication failed: {0}")]
    Authentication(#[source] rustls::Error),

    #[error("no usable configuration: {0}")]
    Configuration(#[source] TlsConfigError),
}

impl HandshakeError {
    /// Classify an I/O error from the TLS stream.
    ///
    /// tokio-rustls surfaces protocol failures as `InvalidData` I/O errors
    /// carrying the `rustls::Error`.
    pub fn from_io(e: io::Error) -> Self {
        let is_rustls = e
            .get_ref()
            .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some());
        if !is_rustls {
            return HandshakeError::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<rustls::Error>()) {
            Some(Ok(rustls_error)) => HandshakeError::Authentication(*rustls_error),
            _ => HandshakeError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "TLS protocol error",
            )),
        }
    }

    /// Metric label for this failure.
    pub fn outcome(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::Aborted => "aborted",
            HandshakeError::Io(_) => "io",
            HandshakeError::Authentication(_) => "authentication",
            HandshakeError::Configuration(_) => "configuration",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rustls_errors_are_authentication_failures() {
        let io_error = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::NoCertificatesPresented,
        );
        let classified = HandshakeError::from_io(io_error);
        assert!(matches!(
            classified,
            HandshakeError::Authentication(rustls::Error::NoCertificatesPresented)
        ));
        assert_eq!(classified.outcome(), "authentication");
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let classified = HandshakeError::from_io(io::ErrorKind::UnexpectedEof.into());
        assert!(matches!(classified, HandshakeError::Io(_)));
        assert_eq!(classified.outcome(), "io");
    }
}
