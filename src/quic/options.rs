//! Listener and connection options.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::config::QuicConfig;

pub const DEFAULT_BACKLOG: usize = 512;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BIDIRECTIONAL_STREAMS: u64 = 100;
pub const DEFAULT_MAX_UNIDIRECTIONAL_STREAMS: u64 = 10;

#[derive(Debug, Clone)]
pub struct QuicListenerOptions {
    /// Port 0 picks a free port.
    pub address: SocketAddr,
    /// Server preference order.
    pub application_protocols: Vec<Vec<u8>>,
    /// Handshaked connections waiting for `accept_connection`.
    pub backlog: usize,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Streams each accepted peer may have open at once.
    pub max_bidirectional_streams: u64,
    pub max_unidirectional_streams: u64,
}

impl Default for QuicListenerOptions {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            application_protocols: vec![b"h3".to_vec()],
            backlog: DEFAULT_BACKLOG,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_bidirectional_streams: DEFAULT_MAX_BIDIRECTIONAL_STREAMS,
            max_unidirectional_streams: DEFAULT_MAX_UNIDIRECTIONAL_STREAMS,
        }
    }
}

impl QuicListenerOptions {
    /// Options for `address` with limits taken from the `[quic]` section.
    pub fn from_config(config: &QuicConfig, address: SocketAddr) -> Self {
        Self {
            address,
            application_protocols: config
                .application_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect(),
            backlog: config.backlog,
            idle_timeout: idle_timeout(config.idle_timeout_secs),
            max_bidirectional_streams: config.max_bidirectional_streams,
            max_unidirectional_streams: config.max_unidirectional_streams,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuicConnectionOptions {
    pub remote_address: SocketAddr,
    /// Client preference order.
    pub application_protocols: Vec<Vec<u8>>,
    pub idle_timeout: Option<Duration>,
    /// Streams the server may open towards this client.
    pub max_bidirectional_streams: u64,
    pub max_unidirectional_streams: u64,
}

impl QuicConnectionOptions {
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            application_protocols: vec![b"h3".to_vec()],
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_bidirectional_streams: DEFAULT_MAX_BIDIRECTIONAL_STREAMS,
            max_unidirectional_streams: DEFAULT_MAX_UNIDIRECTIONAL_STREAMS,
        }
    }

    pub fn with_application_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.application_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

fn idle_timeout(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
