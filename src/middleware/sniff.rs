//! TLS sniffing middleware.
//!
//! # Responsibilities
//! - Read just enough of the stream to tell a TLS ClientHello from plaintext
//! - Hand the raw ClientHello record to an optional observer
//! - Replay every probed byte to the next stage
//! - Refuse TLS on endpoints configured as plaintext-only
//!
//! # Design Decisions
//! - Reads accumulate in one buffer that always starts at byte 0 of the stream
//! - A stream that ends (or stalls past the sniff timeout) before a decision
//!   is treated as plaintext; the downstream stage sees the short stream as-is
//! - The sniff timeout only covers the record header. Once a valid header is
//!   in, the probe waits for the whole record
//! - The probe is bounded: records above 2^14 bytes are classified as plaintext

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::middleware::{ConnectionHandler, ConnectionMiddleware};
use crate::net::{BoxedTransport, ConnectionContext, ConnectionId, Rewind};
use crate::tls::client_hello::{ClientHelloParser, ParseOutcome, RECORD_HEADER_LEN};

const INITIAL_PROBE_CAPACITY: usize = 1024;

/// Connection feature recording how the sniffer classified the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffOutcome {
    Tls,
    Plaintext,
}

/// What to do with each classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SniffPolicy {
    /// Classify and continue either way.
    #[default]
    Detect,
    /// Close connections that open with a TLS ClientHello.
    PlaintextOnly,
}

/// Observer invoked with exactly the bytes of the ClientHello record.
pub type ClientHelloCallback = Arc<dyn Fn(&ConnectionContext, &[u8]) + Send + Sync>;

/// Detects TLS without consuming the stream.
#[derive(Clone, Default)]
pub struct TlsSniffMiddleware {
    policy: SniffPolicy,
    timeout: Option<Duration>,
    on_client_hello: Option<ClientHelloCallback>,
}

impl TlsSniffMiddleware {
    pub fn new(policy: SniffPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Bound how long the probe waits for a record header.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_client_hello<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ConnectionContext, &[u8]) + Send + Sync + 'static,
    {
        self.on_client_hello = Some(Arc::new(callback));
        self
    }

    /// Read until the parser decides. Returns the probed bytes and the classification.
    async fn probe(
        &self,
        connection_id: ConnectionId,
        abort: CancellationToken,
        transport: &mut BoxedTransport,
    ) -> std::io::Result<(BytesMut, Probe)> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut parser = ClientHelloParser::new();
        let mut buf = BytesMut::with_capacity(INITIAL_PROBE_CAPACITY);

        loop {
            match parser.parse(&buf) {
                ParseOutcome::NotEnoughData => {}
                ParseOutcome::ValidTlsClientHello { record_len } => {
                    return Ok((buf, Probe::ClientHello { record_len }))
                }
                ParseOutcome::NotTlsClientHello => return Ok((buf, Probe::Plaintext)),
            }
            if let Some(size) = parser.record_size() {
                buf.reserve(size.saturating_sub(buf.len()));
            }

            // The deadline only bounds the wait for a header.
            let deadline = deadline.filter(|_| parser.record_size().is_none());
            let read = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, transport.read_buf(&mut buf))
                        .await
                        .map_err(|_| ProbeStop::TimedOut),
                    None => Ok(transport.read_buf(&mut buf).await),
                }
            };
            let n = tokio::select! {
                _ = abort.cancelled() => Err(ProbeStop::Aborted),
                read = read => read,
            };

            match n {
                Ok(Ok(0)) => {
                    tracing::trace!(
                        connection_id = %connection_id,
                        buffered = buf.len(),
                        "Stream ended before sniffing decided"
                    );
                    return Ok((buf, Probe::Plaintext));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(stop) => {
                    tracing::debug!(
                        connection_id = %connection_id,
                        buffered = buf.len(),
                        ?stop,
                        "Sniffing stopped early, treating as plaintext"
                    );
                    return Ok((buf, Probe::Plaintext));
                }
            }
        }
    }
}

/// Classification reached by [`TlsSniffMiddleware::probe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    ClientHello { record_len: usize },
    Plaintext,
}

#[derive(Debug, Clone, Copy)]
enum ProbeStop {
    TimedOut,
    Aborted,
}

impl std::fmt::Debug for TlsSniffMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSniffMiddleware")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .field("on_client_hello", &self.on_client_hello.is_some())
            .finish()
    }
}

impl ConnectionMiddleware for TlsSniffMiddleware {
    fn on_connection<'a>(
        &'a self,
        conn: &'a mut ConnectionContext,
        next: &'a dyn ConnectionHandler,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut transport = conn.take_transport();
            let probed = self.probe(conn.id(), conn.abort_token(), &mut transport).await;

            let (buf, outcome) = match probed {
                Ok(probed) => probed,
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Read failed while sniffing");
                    conn.set_transport(transport);
                    return;
                }
            };

            let bytes = buf.freeze();
            let rewind: BoxedTransport = Box::new(Rewind::new(transport, bytes.clone()));
            conn.set_transport(rewind);

            let sniffed = match outcome {
                Probe::ClientHello { record_len } => {
                    if let Some(callback) = &self.on_client_hello {
                        callback(conn, &bytes[..RECORD_HEADER_LEN + record_len]);
                    }
                    SniffOutcome::Tls
                }
                Probe::Plaintext => SniffOutcome::Plaintext,
            };
            conn.features_mut().insert(sniffed);

            tracing::trace!(connection_id = %conn.id(), outcome = ?sniffed, "Stream sniffed");

            if sniffed == SniffOutcome::Tls && self.policy == SniffPolicy::PlaintextOnly {
                tracing::debug!(
                    connection_id = %conn.id(),
                    "TLS handshake received on plaintext endpoint"
                );
                let _ = conn.transport_mut().shutdown().await;
                return;
            }

            next.handle(conn).await;
        })
    }
}
