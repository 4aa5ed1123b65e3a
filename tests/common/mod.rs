//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use gatehouse::middleware::ConnectionDelegate;
use gatehouse::net::ConnectionContext;
use gatehouse::tls::certs::certified_key;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// A throwaway CA with one server and one client certificate.
pub struct TestPki {
    pub ca_cert: CertificateDer<'static>,
    pub server_cert: CertificateDer<'static>,
    server_key: Vec<u8>,
    pub client_cert: CertificateDer<'static>,
    client_key: Vec<u8>,
}

fn named(common_name: &str, alt_names: &[&str]) -> CertificateParams {
    let mut params =
        CertificateParams::new(alt_names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = named("gatehouse test ca", &[]);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = named("localhost", &["localhost"]);
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = named("test client", &[]);
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client = client_params.signed_by(&client_key, &ca, &ca_key).unwrap();

        Self {
            ca_cert: ca.der().clone(),
            server_cert: server.der().clone(),
            server_key: server_key.serialize_der(),
            client_cert: client.der().clone(),
            client_key: client_key.serialize_der(),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.ca_cert.clone()).unwrap();
        roots
    }

    /// The server certificate, ready to serve.
    pub fn server_key(&self) -> Arc<CertifiedKey> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.server_key.clone()));
        certified_key(
            vec![self.server_cert.clone()],
            key,
            &rustls::crypto::ring::default_provider(),
        )
        .unwrap()
    }

    /// Client configuration trusting the test CA.
    pub fn client_config(&self, alpn: &[&[u8]], present_certificate: bool) -> Arc<ClientConfig> {
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(self.roots());

        let mut config = if present_certificate {
            let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.client_key.clone()));
            builder
                .with_client_auth_cert(vec![self.client_cert.clone()], key)
                .unwrap()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Arc::new(config)
    }
}

/// The first flight a real TLS client sends: one ClientHello record.
pub fn client_hello_bytes() -> Vec<u8> {
    let config = TestPki::new().client_config(&[&b"h2"[..], &b"http/1.1"[..]], false);
    let name = ServerName::try_from("localhost").unwrap();
    let mut client = rustls::ClientConnection::new(config, name).unwrap();
    let mut out = Vec::new();
    client.write_tls(&mut out).unwrap();
    out
}

/// Run `delegate` over an in-memory connection. Returns the client end and
/// the task driving the chain.
pub fn run_chain(delegate: &ConnectionDelegate) -> (DuplexStream, JoinHandle<ConnectionContext>) {
    let (server, client) = tokio::io::duplex(64 * 1024);
    let delegate = Arc::clone(delegate);
    let task = tokio::spawn(async move {
        let mut ctx = ConnectionContext::new(server);
        delegate.handle(&mut ctx).await;
        ctx
    });
    (client, task)
}
