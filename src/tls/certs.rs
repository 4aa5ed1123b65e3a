//! Server certificate loading and selection.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys into `CertifiedKey`s
//! - Pick a certificate per handshake from the client's SNI host name
//! - Swap the whole certificate set atomically on reload
//!
//! # Design Decisions
//! - Lookups are lock-free (`ArcSwap`), reloads build a new map off to the side
//! - Matching order: exact host, then `*.parent` wildcard, then the default

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;

use crate::config::TlsConfig;
use crate::tls::error::TlsConfigError;

/// Chooses the server certificate for a handshake.
pub trait CertificateSelector: std::fmt::Debug + Send + Sync + 'static {
    /// `server_name` is the SNI host name, if the client sent one.
    fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>>;
}

/// The same certificate for every handshake.
#[derive(Debug, Clone)]
pub struct FixedCertificate(pub Arc<CertifiedKey>);

impl CertificateSelector for FixedCertificate {
    fn select(&self, _server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Adapts a [`CertificateSelector`] to rustls.
#[derive(Debug)]
pub(crate) struct SelectorResolver(pub Arc<dyn CertificateSelector>);

impl ResolvesServerCert for SelectorResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        let selected = self.0.select(server_name);
        if selected.is_none() {
            tracing::debug!(server_name = ?server_name, "No certificate for server name");
        }
        selected
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every certificate from a PEM file.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Load a chain and key into a signing-ready `CertifiedKey`.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, TlsConfigError> {
    let chain = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;
    certified_key(chain, key, provider)
}

/// Pair an in-memory chain and key.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    provider: &CryptoProvider,
) -> Result<Arc<CertifiedKey>, TlsConfigError> {
    let signing_key = provider.key_provider.load_private_key(key)?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Trust anchors for client certificate validation.
pub fn load_root_store(path: &Path) -> Result<RootCertStore, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

#[derive(Debug, Default)]
struct CertificateMap {
    default: Option<Arc<CertifiedKey>>,
    by_name: HashMap<String, Arc<CertifiedKey>>,
}

impl CertificateMap {
    fn lookup(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = server_name else {
            return self.default.clone();
        };
        let name = name.to_ascii_lowercase();
        if let Some(key) = self.by_name.get(&name) {
            return Some(Arc::clone(key));
        }
        if let Some((_, parent)) = name.split_once('.') {
            if let Some(key) = self.by_name.get(&format!("*.{parent}")) {
                return Some(Arc::clone(key));
            }
        }
        self.default.clone()
    }
}

/// SNI-keyed certificate set with a default, reloadable while serving.
#[derive(Debug, Default)]
pub struct CertificateStore {
    current: ArcSwap<CertificateMap>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every certificate named in the `[tls]` section.
    pub fn from_config(config: &TlsConfig, provider: &CryptoProvider) -> Result<Self, TlsConfigError> {
        let store = Self::new();
        store.reload(config, provider)?;
        Ok(store)
    }

    /// Replace the whole set from config. On error the current set is kept.
    pub fn reload(&self, config: &TlsConfig, provider: &CryptoProvider) -> Result<(), TlsConfigError> {
        let mut map = CertificateMap {
            default: Some(load_certified_key(&config.cert_path, &config.key_path, provider)?),
            by_name: HashMap::with_capacity(config.sni.len()),
        };
        for entry in &config.sni {
            let key = load_certified_key(&entry.cert_path, &entry.key_path, provider)?;
            map.by_name.insert(entry.host.to_ascii_lowercase(), key);
        }

        tracing::info!(
            sni_hosts = map.by_name.len(),
            "Certificates loaded"
        );
        self.current.store(Arc::new(map));
        Ok(())
    }

    pub fn set_default(&self, key: Arc<CertifiedKey>) {
        self.current.rcu(|current| {
            Arc::new(CertificateMap {
                default: Some(Arc::clone(&key)),
                by_name: current.by_name.clone(),
            })
        });
    }

    /// Add or replace the certificate for `host` (`example.com` or `*.example.com`).
    pub fn insert(&self, host: &str, key: Arc<CertifiedKey>) {
        let host = host.to_ascii_lowercase();
        self.current.rcu(|current| {
            let mut by_name = current.by_name.clone();
            by_name.insert(host.clone(), Arc::clone(&key));
            Arc::new(CertificateMap {
                default: current.default.clone(),
                by_name,
            })
        });
    }

    pub fn len(&self) -> usize {
        let current = self.current.load();
        current.by_name.len() + usize::from(current.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CertificateSelector for CertificateStore {
    fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        self.current.load().lookup(server_name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A self-signed certificate for `names` as a `CertifiedKey`.
    pub(crate) fn self_signed(names: &[&str]) -> Arc<CertifiedKey> {
        let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        let cert = rcgen::generate_simple_self_signed(names).unwrap();
        let chain = vec![cert.cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
        certified_key(chain, key, &rustls::crypto::ring::default_provider()).unwrap()
    }

    #[test]
    fn selects_exact_then_wildcard_then_default() {
        let default = self_signed(&["default.test"]);
        let exact = self_signed(&["api.example.com"]);
        let wildcard = self_signed(&["*.example.com"]);

        let store = CertificateStore::new();
        assert!(store.is_empty());
        store.set_default(Arc::clone(&default));
        store.insert("API.example.com", Arc::clone(&exact));
        store.insert("*.example.com", Arc::clone(&wildcard));
        assert_eq!(store.len(), 3);

        let pick = |name| store.select(name).unwrap();
        assert!(Arc::ptr_eq(&pick(Some("api.example.com")), &exact));
        assert!(Arc::ptr_eq(&pick(Some("www.example.com")), &wildcard));
        assert!(Arc::ptr_eq(&pick(Some("a.b.example.com")), &default));
        assert!(Arc::ptr_eq(&pick(Some("other.test")), &default));
        assert!(Arc::ptr_eq(&pick(None), &default));
    }

    #[test]
    fn empty_store_selects_nothing() {
        assert!(CertificateStore::new().select(Some("example.com")).is_none());
    }

    #[test]
    fn missing_files_are_reported_with_path() {
        let err = load_certificates(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, TlsConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/cert.pem"));
    }
}
