//! Client certificate validation.
//!
//! Trust policy is pluggable: the handshake calls a [`ClientCertificateValidator`]
//! with the presented chain. [`WebPkiValidator`] is the stock implementation,
//! checking the chain against configured roots (and CRLs when revocation
//! checking is on).

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, RootCertStore,
    SignatureScheme,
};

use crate::tls::error::TlsConfigError;
use crate::tls::options::ClientCertificateMode;

/// Decides whether a presented client certificate chain is acceptable.
pub trait ClientCertificateValidator: std::fmt::Debug + Send + Sync + 'static {
    /// `intermediates` excludes the end entity. `check_revocation` mirrors the
    /// endpoint's revocation setting.
    fn validate(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        check_revocation: bool,
    ) -> Result<(), rustls::Error>;
}

/// Chain validation against a fixed set of trust anchors.
#[derive(Debug)]
pub struct WebPkiValidator {
    without_revocation: Arc<dyn ClientCertVerifier>,
    with_revocation: Arc<dyn ClientCertVerifier>,
}

impl WebPkiValidator {
    pub fn new(roots: RootCertStore) -> Result<Self, TlsConfigError> {
        Self::with_crls(roots, Vec::new())
    }

    /// `crls` are consulted only when revocation checking is requested.
    pub fn with_crls(
        roots: RootCertStore,
        crls: Vec<CertificateRevocationListDer<'static>>,
    ) -> Result<Self, TlsConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let roots = Arc::new(roots);

        let without_revocation =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(&provider))
                .build()?;
        let with_revocation =
            WebPkiClientVerifier::builder_with_provider(roots, provider)
                .with_crls(crls)
                .build()?;

        Ok(Self {
            without_revocation,
            with_revocation,
        })
    }
}

impl ClientCertificateValidator for WebPkiValidator {
    fn validate(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        check_revocation: bool,
    ) -> Result<(), rustls::Error> {
        let verifier = if check_revocation {
            &self.with_revocation
        } else {
            &self.without_revocation
        };
        verifier
            .verify_client_cert(end_entity, intermediates, UnixTime::now())
            .map(|_| ())
    }
}

/// Bridges a [`ClientCertificateValidator`] into rustls' handshake.
#[derive(Debug)]
pub(crate) struct ValidatorClientCertVerifier {
    validator: Arc<dyn ClientCertificateValidator>,
    mode: ClientCertificateMode,
    check_revocation: bool,
    provider: Arc<CryptoProvider>,
}

impl ValidatorClientCertVerifier {
    pub(crate) fn new(
        validator: Arc<dyn ClientCertificateValidator>,
        mode: ClientCertificateMode,
        check_revocation: bool,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            validator,
            mode,
            check_revocation,
            provider,
        }
    }
}

impl ClientCertVerifier for ValidatorClientCertVerifier {
    fn offer_client_auth(&self) -> bool {
        matches!(
            self.mode,
            ClientCertificateMode::AllowCertificate | ClientCertificateMode::RequireCertificate
        )
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mode == ClientCertificateMode::RequireCertificate
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.validator
            .validate(end_entity, intermediates, self.check_revocation)
            .map_err(|e| match e {
                rustls::Error::InvalidCertificate(_) => e,
                other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                    Arc::new(other),
                ))),
            })?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
