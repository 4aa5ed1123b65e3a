//! TLS termination middleware.
//!
//! # Responsibilities
//! - Read the ClientHello and pick the server configuration for it
//! - Run the handshake under a deadline and the connection's abort signal
//! - Publish [`TlsSession`] and swap the transport for the decrypted stream
//! - Put the raw transport back once the downstream chain returns
//!
//! # Design Decisions
//! - Handshake failures end the connection quietly: logged at debug, counted,
//!   never surfaced to the protocol handler
//! - Deadlines come from a shared timer pool instead of one timer per handshake
//! - Connections already carrying a session, or sniffed as plaintext, pass through
//!
//! # Data Flow
//! ```text
//! raw transport
//!     → LazyConfigAcceptor (ClientHello)
//!     → static config | per-connection callback
//!     → handshake (bounded by pooled timer + abort token)
//!     → TlsStream<BoxedTransport> installed, TlsSession inserted
//!     → downstream
//!     → raw transport restored
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;

use crate::middleware::sniff::SniffOutcome;
use crate::middleware::{ConnectionHandler, ConnectionMiddleware};
use crate::net::{BoxedTransport, ConnectionContext, ConnectionId};
use crate::observability::metrics;
use crate::sync::TimerPool;
use crate::tls::error::{HandshakeError, TlsConfigError};
use crate::tls::options::{
    ClientCertificateMode, HttpsConnectionOptions, TlsHandshakeCallbackContext,
    TlsHandshakeCallbackOptions,
};
use crate::tls::session::TlsSession;

enum ConfigSource {
    Static {
        config: Arc<ServerConfig>,
        client_certificate_deferred: bool,
    },
    Callback(TlsHandshakeCallbackOptions),
}

/// Terminates TLS for the rest of the chain.
pub struct HttpsConnectionMiddleware {
    source: ConfigSource,
    handshake_timeout: Duration,
    timers: Arc<TimerPool>,
}

impl HttpsConnectionMiddleware {
    /// Endpoint with a fixed configuration built from `options`.
    pub fn new(options: HttpsConnectionOptions) -> Result<Self, TlsConfigError> {
        let config = options.build_server_config()?;
        Ok(Self {
            source: ConfigSource::Static {
                config,
                client_certificate_deferred: options.client_certificate_mode
                    == ClientCertificateMode::DelayCertificate,
            },
            handshake_timeout: options.handshake_timeout,
            timers: Arc::new(TimerPool::new()),
        })
    }

    /// Endpoint whose configuration is chosen per connection by a callback.
    pub fn with_callback(options: TlsHandshakeCallbackOptions) -> Self {
        Self {
            handshake_timeout: options.handshake_timeout,
            source: ConfigSource::Callback(options),
            timers: Arc::new(TimerPool::new()),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    async fn handshake(
        &self,
        connection_id: ConnectionId,
        remote_addr: Option<SocketAddr>,
        raw: BoxedTransport,
    ) -> Result<(TlsStream<BoxedTransport>, bool), HandshakeError> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), raw)
            .await
            .map_err(HandshakeError::from_io)?;

        let (config, deferred) = match &self.source {
            ConfigSource::Static {
                config,
                client_certificate_deferred,
            } => (Arc::clone(config), *client_certificate_deferred),
            ConfigSource::Callback(options) => {
                let context = TlsHandshakeCallbackContext::from_client_hello(
                    connection_id,
                    remote_addr,
                    &start.client_hello(),
                    options.state.clone(),
                );
                let config = (options.on_connection)(context)
                    .await
                    .map_err(HandshakeError::Configuration)?;
                let deferred =
                    options.client_certificate_mode == ClientCertificateMode::DelayCertificate;
                (config, deferred)
            }
        };

        let stream = start
            .into_stream(config)
            .await
            .map_err(HandshakeError::from_io)?;
        Ok((stream, deferred))
    }
}

impl std::fmt::Debug for HttpsConnectionMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            ConfigSource::Static { .. } => "static",
            ConfigSource::Callback(_) => "callback",
        };
        f.debug_struct("HttpsConnectionMiddleware")
            .field("source", &source)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionMiddleware for HttpsConnectionMiddleware {
    fn on_connection<'a>(
        &'a self,
        conn: &'a mut ConnectionContext,
        next: &'a dyn ConnectionHandler,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let already_secure = conn.features().get::<TlsSession>().is_some();
            let plaintext = conn.features().get::<SniffOutcome>() == Some(&SniffOutcome::Plaintext);
            if already_secure || plaintext {
                next.handle(conn).await;
                return;
            }

            let started = Instant::now();
            let raw = conn.take_transport();
            let abort = conn.abort_token();

            let result = {
                let timer = self.timers.rent(self.handshake_timeout);
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => Err(HandshakeError::Aborted),
                    _ = timer => Err(HandshakeError::TimedOut),
                    result = self.handshake(conn.id(), conn.remote_addr(), raw) => result,
                }
            };

            let (stream, deferred) = match result {
                Ok(established) => established,
                Err(e) => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "TLS handshake failed"
                    );
                    metrics::record_tls_handshake(e.outcome());
                    return;
                }
            };

            let elapsed = started.elapsed();
            let session = TlsSession::from_connection(stream.get_ref().1, deferred, elapsed);
            metrics::record_tls_handshake("success");
            metrics::record_tls_handshake_duration(elapsed);
            tracing::debug!(
                connection_id = %conn.id(),
                protocol = ?session.protocol_version(),
                cipher_suite = ?session.cipher_suite(),
                alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
                server_name = ?session.server_name(),
                client_certificate_deferred = deferred,
                "TLS handshake completed"
            );

            conn.features_mut().insert(session);
            conn.set_transport(Box::new(stream));

            next.handle(conn).await;

            if let Some(stream) = conn.downcast_transport::<TlsStream<BoxedTransport>>() {
                let (raw, _) = stream.into_inner();
                conn.set_transport(raw);
            }
        })
    }
}
