//! Connection middleware chain.
//!
//! # Data Flow
//! ```text
//! Accepted connection
//!     → limit.rs    (admission against the global connection quota)
//!     → logging.rs  (optional: trace every byte read/written)
//!     → sniff.rs    (optional: classify TLS vs plaintext without consuming)
//!     → https.rs    (optional: TLS handshake, session features)
//!     → protocol handler (terminal ConnectionHandler)
//! ```
//!
//! # Design Decisions
//! - A chain is plain function composition over `ConnectionDelegate`
//! - The first middleware registered is the outermost; the terminal handler runs last
//! - Middleware get `&mut ConnectionContext`, so they can scope changes to
//!   their downstream call and undo them afterwards

pub mod https;
pub mod limit;
pub mod logging;
pub mod sniff;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::config::ServerConfig;
use crate::net::ConnectionContext;
use crate::tls::{CertificateStore, HttpsConnectionOptions, TlsConfigError};

pub use https::HttpsConnectionMiddleware;
pub use limit::ConnectionLimitMiddleware;
pub use logging::LoggingConnectionMiddleware;
pub use sniff::{SniffOutcome, SniffPolicy, TlsSniffMiddleware};

/// Something that processes a connection to completion.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, conn: &'a mut ConnectionContext) -> BoxFuture<'a, ()>;
}

/// A shared, composed connection handler.
pub type ConnectionDelegate = Arc<dyn ConnectionHandler>;

/// A layer in the chain. Decides whether and how to call `next`.
pub trait ConnectionMiddleware: Send + Sync + 'static {
    fn on_connection<'a>(
        &'a self,
        conn: &'a mut ConnectionContext,
        next: &'a dyn ConnectionHandler,
    ) -> BoxFuture<'a, ()>;
}

/// Adapter turning a closure into a [`ConnectionHandler`].
pub struct HandlerFn<F>(F);

/// Build a handler from a closure returning a boxed future.
///
/// ```ignore
/// let handler = handler_fn(|conn| Box::pin(async move {
///     tracing::info!(connection_id = %conn.id(), "handled");
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ConnectionContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    HandlerFn(f)
}

impl<F> ConnectionHandler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut ConnectionContext) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, conn: &'a mut ConnectionContext) -> BoxFuture<'a, ()> {
        (self.0)(conn)
    }
}

/// A middleware bound to the rest of the chain.
struct Chained<M> {
    middleware: M,
    next: ConnectionDelegate,
}

impl<M: ConnectionMiddleware> ConnectionHandler for Chained<M> {
    fn handle<'a>(&'a self, conn: &'a mut ConnectionContext) -> BoxFuture<'a, ()> {
        self.middleware.on_connection(conn, &*self.next)
    }
}

type Component = Box<dyn FnOnce(ConnectionDelegate) -> ConnectionDelegate + Send>;

/// Composes middleware into a single [`ConnectionDelegate`].
#[derive(Default)]
pub struct ConnectionBuilder {
    components: Vec<Component>,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain for a configured endpoint: admission, traffic
    /// logging, TLS sniffing, then TLS termination when `certificates` is set.
    pub fn from_config(
        config: &ServerConfig,
        certificates: Option<Arc<CertificateStore>>,
    ) -> Result<Self, TlsConfigError> {
        let https = match (&config.tls, certificates) {
            (Some(tls), Some(store)) => Some(HttpsConnectionMiddleware::new(
                HttpsConnectionOptions::from_config(tls, store)?,
            )?),
            _ => None,
        };
        // A plaintext endpoint refuses clients that open with a handshake.
        let policy = if https.is_some() {
            SniffPolicy::Detect
        } else {
            SniffPolicy::PlaintextOnly
        };

        let mut builder = Self::new()
            .use_middleware(ConnectionLimitMiddleware::with_limit(
                config.listener.max_connections,
            ))
            .use_middleware_if(
                config.middleware.connection_logging,
                LoggingConnectionMiddleware::new(),
            )
            .use_middleware_if(
                config.middleware.sniff_tls,
                TlsSniffMiddleware::new(policy)
                    .with_timeout(Duration::from_millis(config.middleware.sniff_timeout_ms)),
            );
        if let Some(https) = https {
            builder = builder.use_middleware(https);
        }

        Ok(builder)
    }

    /// Register a raw component: a function from the next delegate to a new one.
    pub fn use_fn<F>(mut self, component: F) -> Self
    where
        F: FnOnce(ConnectionDelegate) -> ConnectionDelegate + Send + 'static,
    {
        self.components.push(Box::new(component));
        self
    }

    /// Register a middleware.
    pub fn use_middleware<M: ConnectionMiddleware>(self, middleware: M) -> Self {
        self.use_fn(move |next| Arc::new(Chained { middleware, next }))
    }

    /// Register a middleware only when `enabled`.
    pub fn use_middleware_if<M: ConnectionMiddleware>(self, enabled: bool, middleware: M) -> Self {
        if enabled {
            self.use_middleware(middleware)
        } else {
            self
        }
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Compose the chain around `terminal`.
    pub fn run<H: ConnectionHandler>(self, terminal: H) -> ConnectionDelegate {
        self.build(Arc::new(terminal))
    }

    /// Compose the chain around an already shared terminal delegate.
    pub fn build(self, terminal: ConnectionDelegate) -> ConnectionDelegate {
        self.components
            .into_iter()
            .rev()
            .fold(terminal, |next, component| component(next))
    }
}
