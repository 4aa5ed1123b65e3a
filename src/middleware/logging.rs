//! Connection byte logging.
//!
//! Wraps the transport so every read and write is emitted as a trace-level
//! hex dump tagged with the connection id. Meant for debugging protocol
//! issues; the cost is one formatting pass per I/O call when trace is enabled
//! and a level check otherwise.

use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::middleware::{ConnectionHandler, ConnectionMiddleware};
use crate::net::{BoxedTransport, ConnectionContext, ConnectionId};

/// Bytes per line of hex dump output.
const HEX_LINE_WIDTH: usize = 16;

/// Transport wrapper that logs traffic.
#[derive(Debug)]
pub struct LoggingStream<T> {
    inner: T,
    connection_id: ConnectionId,
}

impl<T> LoggingStream<T> {
    pub fn new(inner: T, connection_id: ConnectionId) -> Self {
        Self {
            inner,
            connection_id,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn log(&self, direction: &'static str, data: &[u8]) {
        if data.is_empty() || !tracing::enabled!(tracing::Level::TRACE) {
            return;
        }
        tracing::trace!(
            connection_id = %self.connection_id,
            direction,
            len = data.len(),
            "\n{}",
            hex_dump(data)
        );
    }
}

/// Format `data` as offset, hex bytes and printable ASCII, one line per 16 bytes.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 4 + 16);
    for (line, chunk) in data.chunks(HEX_LINE_WIDTH).enumerate() {
        if line > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:08x} ", line * HEX_LINE_WIDTH);
        for i in 0..HEX_LINE_WIDTH {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, " {b:02x}");
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
    }
    out
}

impl<T: AsyncRead + Unpin> AsyncRead for LoggingStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            self.log("read", &buf.filled()[before..]);
        }
        result
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for LoggingStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            self.log("write", &buf[..n]);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Installs a [`LoggingStream`] around the transport for the downstream chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingConnectionMiddleware;

impl LoggingConnectionMiddleware {
    pub fn new() -> Self {
        Self
    }
}

impl ConnectionMiddleware for LoggingConnectionMiddleware {
    fn on_connection<'a>(
        &'a self,
        conn: &'a mut ConnectionContext,
        next: &'a dyn ConnectionHandler,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let raw = conn.take_transport();
            let logged: BoxedTransport = Box::new(LoggingStream::new(raw, conn.id()));
            conn.set_transport(logged);

            next.handle(conn).await;

            if let Some(logged) = conn.downcast_transport::<LoggingStream<BoxedTransport>>() {
                conn.set_transport(logged.into_inner());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, ConnectionBuilder};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    #[test]
    fn hex_dump_layout() {
        let dump = hex_dump(b"GET / HTTP/1.1\r\nHost");
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000  47 45 54 20"));
        assert!(lines[0].ends_with("GET / HTTP/1.1.."));
        assert!(lines[1].starts_with("00000010  48 6f 73 74"));
        assert!(lines[1].ends_with("Host"));
    }

    #[tokio::test]
    async fn traffic_passes_through_and_transport_is_restored() {
        let delegate = ConnectionBuilder::new()
            .use_middleware(LoggingConnectionMiddleware)
            .run(handler_fn(|conn| {
                Box::pin(async move {
                    let mut buf = [0u8; 4];
                    conn.transport_mut().read_exact(&mut buf).await.unwrap();
                    conn.transport_mut().write_all(&buf).await.unwrap();
                })
            }));

        let (server, mut client) = duplex(64);
        let mut ctx = ConnectionContext::new(server);
        client.write_all(b"ping").await.unwrap();
        delegate.handle(&mut ctx).await;

        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        assert!(ctx.transport_is::<DuplexStream>());
    }
}
