//! HTTPS endpoint options and server configuration assembly.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use serde::{Deserialize, Serialize};

use crate::config::TlsConfig;
use crate::net::ConnectionId;
use crate::tls::alpn::{self, HttpProtocols};
use crate::tls::certs::{
    load_root_store, CertificateSelector, CertificateStore, FixedCertificate, SelectorResolver,
};
use crate::tls::error::TlsConfigError;
use crate::tls::verifier::{
    ClientCertificateValidator, ValidatorClientCertVerifier, WebPkiValidator,
};

/// Default bound on a TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// When and whether the server asks for a client certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientCertificateMode {
    #[default]
    NoCertificate,
    /// Requested during the handshake; the client may decline.
    AllowCertificate,
    /// Requested during the handshake; the handshake fails without one.
    RequireCertificate,
    /// Not requested during the handshake. The application asks for it later.
    DelayCertificate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn rustls_version(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &rustls::version::TLS12,
            TlsVersion::Tls13 => &rustls::version::TLS13,
        }
    }
}

/// Static options for an HTTPS endpoint.
#[derive(Clone)]
pub struct HttpsConnectionOptions {
    /// Served for every handshake. Mutually exclusive with `certificate_selector`.
    pub certificate: Option<Arc<CertifiedKey>>,
    /// Chooses a certificate per handshake. Mutually exclusive with `certificate`.
    pub certificate_selector: Option<Arc<dyn CertificateSelector>>,
    pub client_certificate_mode: ClientCertificateMode,
    /// Required when client certificates are requested during the handshake.
    pub client_certificate_validator: Option<Arc<dyn ClientCertificateValidator>>,
    pub tls_versions: Vec<TlsVersion>,
    pub check_certificate_revocation: bool,
    pub handshake_timeout: Duration,
    pub http_protocols: HttpProtocols,
    /// Restrict the cipher suites offered. `None` keeps the provider defaults.
    pub cipher_suites: Option<Vec<SupportedCipherSuite>>,
}

impl Default for HttpsConnectionOptions {
    fn default() -> Self {
        Self {
            certificate: None,
            certificate_selector: None,
            client_certificate_mode: ClientCertificateMode::default(),
            client_certificate_validator: None,
            tls_versions: vec![TlsVersion::Tls12, TlsVersion::Tls13],
            check_certificate_revocation: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            http_protocols: HttpProtocols::default(),
            cipher_suites: None,
        }
    }
}

impl fmt::Debug for HttpsConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsConnectionOptions")
            .field("certificate", &self.certificate.is_some())
            .field("certificate_selector", &self.certificate_selector)
            .field("client_certificate_mode", &self.client_certificate_mode)
            .field("tls_versions", &self.tls_versions)
            .field("check_certificate_revocation", &self.check_certificate_revocation)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("http_protocols", &self.http_protocols)
            .finish_non_exhaustive()
    }
}

impl HttpsConnectionOptions {
    pub fn with_certificate(certificate: Arc<CertifiedKey>) -> Self {
        Self {
            certificate: Some(certificate),
            ..Self::default()
        }
    }

    pub fn with_selector(selector: Arc<dyn CertificateSelector>) -> Self {
        Self {
            certificate_selector: Some(selector),
            ..Self::default()
        }
    }

    /// Options for a configured endpoint serving certificates from `store`.
    pub fn from_config(
        config: &TlsConfig,
        store: Arc<CertificateStore>,
    ) -> Result<Self, TlsConfigError> {
        let client_certificate_validator = match &config.client_ca_path {
            Some(path) => {
                let validator: Arc<dyn ClientCertificateValidator> =
                    Arc::new(WebPkiValidator::new(load_root_store(path)?)?);
                Some(validator)
            }
            None => None,
        };

        let selector: Arc<dyn CertificateSelector> = store;
        Ok(Self {
            client_certificate_mode: config.client_certificate_mode,
            client_certificate_validator,
            tls_versions: config.protocols.clone(),
            check_certificate_revocation: config.check_certificate_revocation,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            http_protocols: config.http_protocols,
            ..Self::with_selector(selector)
        })
    }

    /// Assemble the rustls configuration these options describe.
    pub fn build_server_config(&self) -> Result<Arc<ServerConfig>, TlsConfigError> {
        let selector: Arc<dyn CertificateSelector> =
            match (&self.certificate, &self.certificate_selector) {
                (Some(_), Some(_)) => return Err(TlsConfigError::CertificateSourceConflict),
                (None, None) => return Err(TlsConfigError::MissingCertificateSource),
                (Some(certificate), None) => Arc::new(FixedCertificate(Arc::clone(certificate))),
                (None, Some(selector)) => Arc::clone(selector),
            };

        let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
        for version in &self.tls_versions {
            let version = version.rustls_version();
            if !versions.iter().any(|v| v.version == version.version) {
                versions.push(version);
            }
        }
        if versions.is_empty() {
            return Err(TlsConfigError::NoProtocolVersions);
        }

        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(suites) = &self.cipher_suites {
            provider.cipher_suites = suites.clone();
        }
        let provider = Arc::new(provider);

        let usable_suites: Vec<_> = provider
            .cipher_suites
            .iter()
            .filter(|suite| versions.iter().any(|v| v.version == suite.version().version))
            .map(|suite| suite.suite())
            .collect();

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)?;

        let builder = match self.client_certificate_mode {
            ClientCertificateMode::NoCertificate | ClientCertificateMode::DelayCertificate => {
                builder.with_no_client_auth()
            }
            mode => {
                let validator = self
                    .client_certificate_validator
                    .clone()
                    .ok_or(TlsConfigError::MissingClientCertificateValidator(mode))?;
                builder.with_client_cert_verifier(Arc::new(ValidatorClientCertVerifier::new(
                    validator,
                    mode,
                    self.check_certificate_revocation,
                    Arc::clone(&provider),
                )))
            }
        };

        let mut config = builder.with_cert_resolver(Arc::new(SelectorResolver(selector)));
        config.alpn_protocols = alpn::advertised_protocols(self.http_protocols, &usable_suites);
        Ok(Arc::new(config))
    }
}

/// What a per-connection configuration callback knows about the handshake.
#[derive(Clone)]
pub struct TlsHandshakeCallbackContext {
    pub connection_id: ConnectionId,
    pub server_name: Option<String>,
    /// ALPN protocols offered by the client, in client order.
    pub application_protocols: Vec<Vec<u8>>,
    pub remote_addr: Option<SocketAddr>,
    pub state: Option<Arc<dyn Any + Send + Sync>>,
}

impl TlsHandshakeCallbackContext {
    pub(crate) fn from_client_hello(
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        hello: &ClientHello<'_>,
        state: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            connection_id,
            server_name: hello.server_name().map(str::to_owned),
            application_protocols: hello
                .alpn()
                .map(|protocols| protocols.map(<[u8]>::to_vec).collect())
                .unwrap_or_default(),
            remote_addr,
            state,
        }
    }

    /// Downcast the user state.
    pub fn state<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.state.as_deref().and_then(|s| s.downcast_ref::<T>())
    }
}

impl fmt::Debug for TlsHandshakeCallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandshakeCallbackContext")
            .field("connection_id", &self.connection_id)
            .field("server_name", &self.server_name)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Async callback choosing the server configuration for one handshake.
pub type TlsHandshakeCallback = Arc<
    dyn Fn(TlsHandshakeCallbackContext) -> BoxFuture<'static, Result<Arc<ServerConfig>, TlsConfigError>>
        + Send
        + Sync,
>;

/// Options for an endpoint whose TLS configuration is chosen per connection.
#[derive(Clone)]
pub struct TlsHandshakeCallbackOptions {
    pub on_connection: TlsHandshakeCallback,
    pub state: Option<Arc<dyn Any + Send + Sync>>,
    pub handshake_timeout: Duration,
    /// Recorded on the session. The callback's configuration decides what is
    /// actually requested from the client.
    pub client_certificate_mode: ClientCertificateMode,
}

impl TlsHandshakeCallbackOptions {
    pub fn new<F>(on_connection: F) -> Self
    where
        F: Fn(TlsHandshakeCallbackContext) -> BoxFuture<'static, Result<Arc<ServerConfig>, TlsConfigError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            on_connection: Arc::new(on_connection),
            state: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            client_certificate_mode: ClientCertificateMode::default(),
        }
    }

    pub fn with_client_certificate_mode(mut self, mode: ClientCertificateMode) -> Self {
        self.client_certificate_mode = mode;
        self
    }

    pub fn with_state<T: Any + Send + Sync>(mut self, state: T) -> Self {
        self.state = Some(Arc::new(state));
        self
    }
}

impl fmt::Debug for TlsHandshakeCallbackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsHandshakeCallbackOptions")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("client_certificate_mode", &self.client_certificate_mode)
            .finish_non_exhaustive()
    }
}
