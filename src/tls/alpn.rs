//! Application protocol negotiation.
//!
//! The server's list is ordered by preference (h2 before http/1.1) and the
//! first server protocol the client also offered wins.

use rustls::CipherSuite;
use serde::{Deserialize, Serialize};

pub const H2: &[u8] = b"h2";
pub const HTTP_1_1: &[u8] = b"http/1.1";

/// HTTP versions an endpoint speaks over TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpProtocols {
    Http1,
    Http2,
    #[default]
    Http1AndHttp2,
}

impl HttpProtocols {
    /// ALPN identifiers in server preference order.
    pub fn alpn_protocols(self) -> Vec<Vec<u8>> {
        match self {
            HttpProtocols::Http1 => vec![HTTP_1_1.to_vec()],
            HttpProtocols::Http2 => vec![H2.to_vec()],
            HttpProtocols::Http1AndHttp2 => vec![H2.to_vec(), HTTP_1_1.to_vec()],
        }
    }

    pub fn includes_http2(self) -> bool {
        !matches!(self, HttpProtocols::Http1)
    }
}

/// Pick the first server protocol also offered by the client.
pub fn select_protocol<'a, C>(server: &'a [Vec<u8>], client: &[C]) -> Option<&'a [u8]>
where
    C: AsRef<[u8]>,
{
    server
        .iter()
        .find(|ours| client.iter().any(|theirs| theirs.as_ref() == ours.as_slice()))
        .map(Vec::as_slice)
}

/// Whether `suite` is acceptable for HTTP/2 over TLS (RFC 9113 section 9.2).
///
/// Every TLS 1.3 suite qualifies; TLS 1.2 needs ephemeral key exchange with an
/// AEAD cipher.
pub fn is_http2_suite(suite: CipherSuite) -> bool {
    matches!(
        suite,
        CipherSuite::TLS13_AES_128_GCM_SHA256
            | CipherSuite::TLS13_AES_256_GCM_SHA384
            | CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
            | CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
            | CipherSuite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    )
}

/// The ALPN list to advertise given the enabled cipher suites.
///
/// HTTP/2 is dropped, with a warning, when none of the suites can carry it.
pub fn advertised_protocols(protocols: HttpProtocols, suites: &[CipherSuite]) -> Vec<Vec<u8>> {
    if protocols.includes_http2() && !suites.iter().copied().any(is_http2_suite) {
        tracing::warn!(
            configured = ?protocols,
            "HTTP/2 over TLS is not supported by the enabled cipher suites; using HTTP/1.1"
        );
        return HttpProtocols::Http1.alpn_protocols();
    }
    protocols.alpn_protocols()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2_is_preferred_over_http1() {
        let server = HttpProtocols::Http1AndHttp2.alpn_protocols();
        assert_eq!(server, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let client: [&[u8]; 2] = [HTTP_1_1, H2];
        assert_eq!(select_protocol(&server, &client), Some(H2));
    }

    #[test]
    fn no_overlap_selects_nothing() {
        let server = HttpProtocols::Http2.alpn_protocols();
        let client: [&[u8]; 1] = [HTTP_1_1];
        assert_eq!(select_protocol(&server, &client), None);
        assert_eq!(select_protocol::<&[u8]>(&server, &[]), None);
    }

    #[test]
    fn http2_downgrades_without_usable_suites() {
        let weak = [CipherSuite::TLS_RSA_WITH_AES_128_GCM_SHA256];
        assert_eq!(
            advertised_protocols(HttpProtocols::Http2, &weak),
            vec![HTTP_1_1.to_vec()]
        );
        assert_eq!(
            advertised_protocols(HttpProtocols::Http1AndHttp2, &weak),
            vec![HTTP_1_1.to_vec()]
        );

        let strong = [CipherSuite::TLS13_AES_128_GCM_SHA256];
        assert_eq!(
            advertised_protocols(HttpProtocols::Http1AndHttp2, &strong),
            vec![H2.to_vec(), HTTP_1_1.to_vec()]
        );
    }
}
