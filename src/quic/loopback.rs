//! In-process native transport.
//!
//! # Responsibilities
//! - Register listeners by address and pair client and server connection ends
//! - Number streams the way QUIC does and tell the peer when a stream starts
//! - Deliver received data one batch at a time, gated on `receive_complete`
//! - Propagate FIN, aborts, connection shutdown and idle timeouts to both ends
//! - Negotiate ALPN with server preference
//! - Count opened and closed handles so tests can check release
//!
//! # Design Decisions
//! - Every endpoint (listener or connection end) owns one worker thread. All
//!   events for a connection and its streams are posted to that thread, so
//!   they arrive in order and never re-enter the caller.
//! - The idle timeout is the worker's receive timeout: an endpoint with no
//!   posted work for the whole interval shuts the connection down.
//! - A listener dispatches `NewConnection` on its own worker and only then
//!   marks both ends connected. A handler that blocks holds the handshake back.
//!
//! # Data Flow
//! ```text
//! client.start ──► listener.offer ──► [listener worker] NewConnection
//!                                        └─► Connected (both ends)
//! stream.send ──► peer.enqueue ──► [peer worker] Receive ─► receive_complete
//!                                                  └─► receive_set_enabled(true) ─► next Receive
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::quic::error::TransportStatus;
use crate::quic::native::{
    ConnectionEvent, ConnectionEventHandler, ListenerEvent, ListenerEventHandler, NativeApi,
    NativeConnection, NativeListener, NativeResult, NativeStream, StreamEvent,
    StreamEventHandler, StreamKind, StreamShutdown,
};
use crate::quic::options::{QuicConnectionOptions, QuicListenerOptions};
use crate::tls::alpn::select_protocol;

const FIRST_EPHEMERAL_PORT: u16 = 49152;
const EPHEMERAL_PORTS: u64 = (u16::MAX - FIRST_EPHEMERAL_PORT) as u64;
const PORT_ATTEMPTS: usize = 64;

/// An in-process network. Listeners are visible only within the same fabric.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    shared: Arc<FabricShared>,
}

#[derive(Default)]
struct FabricShared {
    listeners: DashMap<SocketAddr, Arc<LoopbackListener>>,
    next_port: AtomicU64,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl FabricShared {
    fn ephemeral(&self, ip: IpAddr) -> SocketAddr {
        let n = self.next_port.fetch_add(1, Ordering::Relaxed) % EPHEMERAL_PORTS;
        SocketAddr::new(ip, FIRST_EPHEMERAL_PORT + n as u16)
    }

    fn register(
        &self,
        address: SocketAddr,
        listener: &Arc<LoopbackListener>,
    ) -> NativeResult<SocketAddr> {
        match self.listeners.entry(address) {
            Entry::Occupied(_) => Err(TransportStatus::AddressInUse),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(listener));
                Ok(address)
            }
        }
    }

    fn register_ephemeral(
        &self,
        ip: IpAddr,
        listener: &Arc<LoopbackListener>,
    ) -> NativeResult<SocketAddr> {
        for _ in 0..PORT_ATTEMPTS {
            if let Ok(address) = self.register(self.ephemeral(ip), listener) {
                return Ok(address);
            }
        }
        Err(TransportStatus::AddressInUse)
    }

    fn handle_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles (listeners, connections, streams) opened so far.
    pub fn opened_handle_count(&self) -> usize {
        self.shared.opened.load(Ordering::Relaxed)
    }

    /// Handles closed so far. Each handle counts once however often it is closed.
    pub fn closed_handle_count(&self) -> usize {
        self.shared.closed.load(Ordering::Relaxed)
    }

    pub fn open_handle_count(&self) -> usize {
        self.opened_handle_count()
            .saturating_sub(self.closed_handle_count())
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.len()
    }
}

impl std::fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFabric")
            .field("listeners", &self.listener_count())
            .field("open_handles", &self.open_handle_count())
            .finish()
    }
}

impl NativeApi for LoopbackFabric {
    fn listener_open(
        &self,
        handler: Weak<dyn ListenerEventHandler>,
    ) -> NativeResult<Arc<dyn NativeListener>> {
        let listener = LoopbackListener::new(&self.shared, handler)?;
        Ok(listener)
    }

    fn connection_open(&self) -> NativeResult<Arc<dyn NativeConnection>> {
        let connection = LoopbackConnection::new(&self.shared, false)?;
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// Worker threads
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send>;

enum Message {
    Run(Job),
    Stop,
}

#[derive(Clone)]
struct Worker {
    tx: mpsc::Sender<Message>,
    idle_ms: Arc<AtomicU64>,
}

impl Worker {
    fn spawn<F>(name: &str, on_idle: F) -> NativeResult<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let idle_ms = Arc::new(AtomicU64::new(0));
        let idle = Arc::clone(&idle_ms);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(rx, idle, on_idle))
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to spawn loopback worker");
                TransportStatus::InternalError
            })?;
        Ok(Self { tx, idle_ms })
    }

    fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // A stopped worker drops late events.
        let _ = self.tx.send(Message::Run(Box::new(job)));
    }

    fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |t| t.as_millis().max(1) as u64);
        self.idle_ms.store(ms, Ordering::Relaxed);
    }
}

fn run_worker<F: Fn()>(rx: mpsc::Receiver<Message>, idle_ms: Arc<AtomicU64>, on_idle: F) {
    loop {
        let message = match idle_ms.load(Ordering::Relaxed) {
            0 => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            ms => rx.recv_timeout(Duration::from_millis(ms)),
        };
        match message {
            Ok(Message::Run(job)) => job(),
            Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => on_idle(),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ListenerState {
    address: Option<SocketAddr>,
    options: Option<QuicListenerOptions>,
}

struct LoopbackListener {
    this: Weak<LoopbackListener>,
    fabric: Arc<FabricShared>,
    worker: Worker,
    handler: Weak<dyn ListenerEventHandler>,
    state: Mutex<ListenerState>,
    closed: AtomicBool,
}

impl LoopbackListener {
    fn new(
        fabric: &Arc<FabricShared>,
        handler: Weak<dyn ListenerEventHandler>,
    ) -> NativeResult<Arc<Self>> {
        let worker = Worker::spawn("gatehouse-loopback-listener", || {})?;
        fabric.handle_opened();
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            fabric: Arc::clone(fabric),
            worker,
            handler,
            state: Mutex::new(ListenerState::default()),
            closed: AtomicBool::new(false),
        }))
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().expect("loopback listener mutex poisoned")
    }

    /// Handshake with `client` on behalf of this listener.
    fn offer(&self, client: Arc<LoopbackConnection>, options: &QuicConnectionOptions) {
        let (listener_options, local) = {
            let state = self.state();
            match (&state.options, state.address) {
                (Some(o), Some(a)) => (o.clone(), a),
                _ => {
                    drop(state);
                    client.transport_shutdown(TransportStatus::ConnectionRefused);
                    return;
                }
            }
        };

        let Some(alpn) = select_protocol(
            &listener_options.application_protocols,
            &options.application_protocols,
        )
        .map(<[u8]>::to_vec) else {
            tracing::debug!(listener = %local, "No common application protocol");
            client.transport_shutdown(TransportStatus::AlpnNegotiationFailure);
            return;
        };

        let server = match LoopbackConnection::new(&self.fabric, true) {
            Ok(server) => server,
            Err(status) => {
                client.transport_shutdown(status);
                return;
            }
        };
        server.worker.set_idle_timeout(listener_options.idle_timeout);

        let client_addr = self.fabric.ephemeral(local.ip());
        {
            let mut state = client.state();
            state.peer = Arc::downgrade(&server);
            state.local = Some(client_addr);
            state.remote = Some(local);
            state.peer_limits = [
                listener_options.max_bidirectional_streams,
                listener_options.max_unidirectional_streams,
            ];
        }
        {
            let mut state = server.state();
            state.started = true;
            state.peer = Arc::downgrade(&client);
            state.local = Some(local);
            state.remote = Some(client_addr);
            state.peer_limits = [
                options.max_bidirectional_streams,
                options.max_unidirectional_streams,
            ];
        }

        let handler = self.handler.clone();
        self.worker.post(move || {
            match handler.upgrade() {
                Some(handler) => handler.on_listener_event(ListenerEvent::NewConnection {
                    connection: Arc::clone(&server) as Arc<dyn NativeConnection>,
                    negotiated_alpn: alpn.clone(),
                }),
                None => {
                    server.transport_shutdown(TransportStatus::ConnectionRefused);
                    server.close();
                    return;
                }
            }
            server.mark_connected(alpn.clone());
            client.mark_connected(alpn);
        });
    }
}

impl NativeListener for LoopbackListener {
    fn start(&self, options: &QuicListenerOptions) -> NativeResult<SocketAddr> {
        let this = self.this.upgrade().ok_or(TransportStatus::InvalidState)?;
        if self.closed.load(Ordering::Acquire) || self.state().address.is_some() {
            return Err(TransportStatus::InvalidState);
        }

        let address = if options.address.port() == 0 {
            self.fabric.register_ephemeral(options.address.ip(), &this)?
        } else {
            self.fabric.register(options.address, &this)?
        };

        let mut state = self.state();
        state.address = Some(address);
        state.options = Some(options.clone());
        tracing::debug!(address = %address, "Loopback listener started");
        Ok(address)
    }

    fn stop(&self) {
        let Some(address) = self.state().address else {
            return;
        };
        self.fabric
            .listeners
            .remove_if(&address, |_, l| std::ptr::eq(Arc::as_ptr(l), self));
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.fabric.handle_closed();
        self.worker.stop();
    }
}

// ---------------------------------------------------------------------------
// Connection ends
// ---------------------------------------------------------------------------

fn kind_slot(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Bidirectional => 0,
        StreamKind::Unidirectional => 1,
    }
}

#[derive(Default)]
struct ConnectionState {
    peer: Weak<LoopbackConnection>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    started: bool,
    connected: bool,
    shut_down: bool,
    /// Per kind: next stream index, streams the peer allows, streams we have open.
    next_index: [u64; 2],
    peer_limits: [u64; 2],
    opened: [u64; 2],
    streams: HashMap<u64, Arc<LoopbackStream>>,
}

struct LoopbackConnection {
    this: Weak<LoopbackConnection>,
    fabric: Arc<FabricShared>,
    worker: Worker,
    is_server: bool,
    handler: Mutex<Option<Weak<dyn ConnectionEventHandler>>>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
}

type ShutdownWork = (Option<Arc<LoopbackConnection>>, Vec<Arc<LoopbackStream>>);

impl LoopbackConnection {
    fn new(fabric: &Arc<FabricShared>, is_server: bool) -> NativeResult<Arc<Self>> {
        let slot: Arc<OnceLock<Weak<LoopbackConnection>>> = Arc::default();
        let idle_slot = Arc::clone(&slot);
        let name = if is_server {
            "gatehouse-loopback-server"
        } else {
            "gatehouse-loopback-client"
        };
        let worker = Worker::spawn(name, move || {
            if let Some(connection) = idle_slot.get().and_then(Weak::upgrade) {
                tracing::debug!(server = connection.is_server, "Loopback connection idle");
                connection.transport_shutdown(TransportStatus::ConnectionIdle);
            }
        })?;

        let connection = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            fabric: Arc::clone(fabric),
            worker,
            is_server,
            handler: Mutex::new(None),
            state: Mutex::new(ConnectionState::default()),
            closed: AtomicBool::new(false),
        });
        let _ = slot.set(Arc::downgrade(&connection));
        fabric.handle_opened();
        Ok(connection)
    }

    fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().expect("loopback connection mutex poisoned")
    }

    fn emit(&self, event: ConnectionEvent) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.worker.post(move || this.dispatch(event));
    }

    fn dispatch(&self, event: ConnectionEvent) {
        let handler = self
            .handler
            .lock()
            .expect("loopback handler mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_connection_event(event),
            None => tracing::trace!(?event, "Connection event without handler"),
        }
    }

    fn mark_connected(&self, alpn: Vec<u8>) {
        let available = {
            let mut state = self.state();
            if state.shut_down || state.connected {
                return;
            }
            state.connected = true;
            state.peer_limits
        };
        self.emit(ConnectionEvent::Connected {
            negotiated_alpn: Some(alpn),
        });
        self.emit(ConnectionEvent::StreamsAvailable {
            bidirectional: available[0],
            unidirectional: available[1],
        });
    }

    fn emit_available(&self) {
        let (bidirectional, unidirectional) = {
            let state = self.state();
            (
                state.peer_limits[0].saturating_sub(state.opened[0]),
                state.peer_limits[1].saturating_sub(state.opened[1]),
            )
        };
        self.emit(ConnectionEvent::StreamsAvailable {
            bidirectional,
            unidirectional,
        });
    }

    /// Assign a stream id for a locally started stream.
    fn allocate_stream(
        &self,
        kind: StreamKind,
        stream: &Arc<LoopbackStream>,
    ) -> NativeResult<(u64, Arc<LoopbackConnection>)> {
        let (id, peer) = {
            let mut state = self.state();
            if !state.connected || state.shut_down {
                return Err(TransportStatus::InvalidState);
            }
            let peer = state.peer.upgrade().ok_or(TransportStatus::InvalidState)?;
            let slot = kind_slot(kind);
            if state.opened[slot] >= state.peer_limits[slot] {
                return Err(TransportStatus::StreamLimitReached);
            }

            // Low bits: initiator (0 client, 1 server), then direction (0 bidi, 2 uni).
            let id = state.next_index[slot] * 4
                + u64::from(self.is_server)
                + if kind == StreamKind::Unidirectional { 2 } else { 0 };
            state.next_index[slot] += 1;
            state.opened[slot] += 1;
            state.streams.insert(id, Arc::clone(stream));
            (id, peer)
        };
        self.emit_available();
        Ok((id, peer))
    }

    fn register_peer_stream(&self, id: u64, stream: &Arc<LoopbackStream>) -> bool {
        let mut state = self.state();
        if state.shut_down {
            return false;
        }
        state.streams.insert(id, Arc::clone(stream));
        true
    }

    fn release_stream(&self, id: u64, kind: StreamKind, locally_opened: bool) {
        let notify = {
            let mut state = self.state();
            state.streams.remove(&id);
            if locally_opened {
                let slot = kind_slot(kind);
                state.opened[slot] = state.opened[slot].saturating_sub(1);
            }
            locally_opened && !state.shut_down
        };
        if notify {
            self.emit_available();
        }
    }

    fn begin_shutdown(&self) -> Option<ShutdownWork> {
        let mut state = self.state();
        if state.shut_down {
            return None;
        }
        state.shut_down = true;
        let streams = state.streams.drain().map(|(_, s)| s).collect();
        Some((state.peer.upgrade(), streams))
    }

    fn finish_shutdown(&self, streams: Vec<Arc<LoopbackStream>>) {
        for stream in streams {
            stream.on_connection_shutdown();
        }
        self.emit(ConnectionEvent::ShutdownComplete);
        self.worker.stop();
    }

    fn on_peer_shutdown(&self, error_code: u64) {
        let Some((_, streams)) = self.begin_shutdown() else {
            return;
        };
        self.emit(ConnectionEvent::ShutdownInitiatedByPeer { error_code });
        self.finish_shutdown(streams);
    }

    fn transport_shutdown(&self, status: TransportStatus) {
        let Some((peer, streams)) = self.begin_shutdown() else {
            return;
        };
        self.emit(ConnectionEvent::ShutdownInitiatedByTransport { status });
        self.finish_shutdown(streams);
        if let Some(peer) = peer {
            peer.transport_shutdown(status);
        }
    }
}

impl NativeConnection for LoopbackConnection {
    fn set_handler(&self, handler: Weak<dyn ConnectionEventHandler>) {
        *self.handler.lock().expect("loopback handler mutex poisoned") = Some(handler);
    }

    fn start(&self, options: &QuicConnectionOptions) -> NativeResult<()> {
        {
            let mut state = self.state();
            if state.started || state.shut_down {
                return Err(TransportStatus::InvalidState);
            }
            state.started = true;
        }
        let this = self.this.upgrade().ok_or(TransportStatus::InvalidState)?;
        self.worker.set_idle_timeout(options.idle_timeout);

        let listener = self
            .fabric
            .listeners
            .get(&options.remote_address)
            .map(|entry| Arc::clone(entry.value()));
        match listener {
            Some(listener) => listener.offer(this, options),
            None => {
                tracing::debug!(remote = %options.remote_address, "No loopback listener at address");
                self.transport_shutdown(TransportStatus::ConnectionRefused);
            }
        }
        Ok(())
    }

    fn stream_open(&self, kind: StreamKind) -> NativeResult<Arc<dyn NativeStream>> {
        if self.state().shut_down {
            return Err(TransportStatus::InvalidState);
        }
        let stream = LoopbackStream::new(self, kind, true, None);
        Ok(stream)
    }

    fn shutdown(&self, error_code: u64) {
        let Some((peer, streams)) = self.begin_shutdown() else {
            return;
        };
        tracing::trace!(server = self.is_server, error_code, "Loopback connection shutdown");
        self.finish_shutdown(streams);
        if let Some(peer) = peer {
            peer.on_peer_shutdown(error_code);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fabric.handle_closed();
        self.shutdown(0);
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.state().local
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.state().remote
    }
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

struct StreamState {
    id: Option<u64>,
    peer: Weak<LoopbackStream>,
    queue: VecDeque<Bytes>,
    fin_received: bool,
    receive_enabled: bool,
    receive_closed: bool,
    send_closed: bool,
    shutdown_reported: bool,
}

/// One end of a stream. The peer end lives on the other connection.
struct LoopbackStream {
    this: Weak<LoopbackStream>,
    connection: Weak<LoopbackConnection>,
    fabric: Arc<FabricShared>,
    worker: Worker,
    kind: StreamKind,
    locally_opened: bool,
    handler: Mutex<Option<Weak<dyn StreamEventHandler>>>,
    state: Mutex<StreamState>,
    closed: AtomicBool,
}

impl LoopbackStream {
    fn new(
        connection: &LoopbackConnection,
        kind: StreamKind,
        locally_opened: bool,
        id: Option<u64>,
    ) -> Arc<Self> {
        let unidirectional = kind == StreamKind::Unidirectional;
        connection.fabric.handle_opened();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            connection: connection.this.clone(),
            fabric: Arc::clone(&connection.fabric),
            worker: connection.worker.clone(),
            kind,
            locally_opened,
            handler: Mutex::new(None),
            state: Mutex::new(StreamState {
                id,
                peer: Weak::new(),
                queue: VecDeque::new(),
                fin_received: false,
                receive_enabled: true,
                receive_closed: unidirectional && locally_opened,
                send_closed: unidirectional && !locally_opened,
                shutdown_reported: false,
            }),
            closed: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("loopback stream mutex poisoned")
    }

    fn emit(&self, event: StreamEvent) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.worker.post(move || this.dispatch(event));
    }

    fn dispatch(&self, event: StreamEvent) {
        let handler = self
            .handler
            .lock()
            .expect("loopback handler mutex poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        match handler {
            Some(handler) => handler.on_stream_event(event),
            None => tracing::trace!(?event, "Stream event without handler"),
        }
    }

    fn schedule_delivery(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.worker.post(move || this.deliver());
    }

    /// Runs on the worker. Hands everything queued to the handler as one batch.
    fn deliver(&self) {
        let event = {
            let mut state = self.state();
            if state.receive_closed || !state.receive_enabled {
                return;
            }
            if !state.queue.is_empty() {
                state.receive_enabled = false;
                StreamEvent::Receive {
                    buffers: state.queue.drain(..).collect(),
                }
            } else if state.fin_received {
                state.receive_closed = true;
                StreamEvent::PeerSendShutdown
            } else {
                return;
            }
        };
        let finished = matches!(event, StreamEvent::PeerSendShutdown);
        self.dispatch(event);
        if finished {
            self.maybe_complete();
        }
    }

    fn enqueue(&self, data: Vec<Bytes>, fin: bool) {
        {
            let mut state = self.state();
            if state.receive_closed {
                return;
            }
            state.queue.extend(data);
            state.fin_received |= fin;
        }
        self.schedule_delivery();
    }

    fn abort_send(&self, error_code: u64) {
        let peer = {
            let mut state = self.state();
            if state.send_closed {
                return;
            }
            state.send_closed = true;
            state.peer.upgrade()
        };
        if let Some(peer) = peer {
            peer.on_peer_send_aborted(error_code);
        }
        self.emit(StreamEvent::SendShutdownComplete);
    }

    fn abort_receive(&self, error_code: u64) {
        let peer = {
            let mut state = self.state();
            if state.receive_closed {
                return;
            }
            state.receive_closed = true;
            state.queue.clear();
            state.peer.upgrade()
        };
        if let Some(peer) = peer {
            peer.on_peer_receive_aborted(error_code);
        }
    }

    fn on_peer_send_aborted(&self, error_code: u64) {
        {
            let mut state = self.state();
            if state.receive_closed {
                return;
            }
            state.receive_closed = true;
            state.queue.clear();
        }
        self.emit(StreamEvent::PeerSendAborted { error_code });
        self.maybe_complete();
    }

    fn on_peer_receive_aborted(&self, error_code: u64) {
        {
            let mut state = self.state();
            if state.send_closed {
                return;
            }
            state.send_closed = true;
        }
        self.emit(StreamEvent::PeerReceiveAborted { error_code });
        self.emit(StreamEvent::SendShutdownComplete);
        self.maybe_complete();
    }

    fn on_connection_shutdown(&self) {
        {
            let mut state = self.state();
            state.send_closed = true;
            state.receive_closed = true;
            state.queue.clear();
            if state.shutdown_reported {
                return;
            }
            state.shutdown_reported = true;
        }
        self.emit(StreamEvent::ShutdownComplete {
            connection_shutdown: true,
        });
    }

    fn maybe_complete(&self) {
        {
            let mut state = self.state();
            if !(state.send_closed && state.receive_closed) || state.shutdown_reported {
                return;
            }
            state.shutdown_reported = true;
        }
        self.emit(StreamEvent::ShutdownComplete {
            connection_shutdown: false,
        });
    }
}

impl NativeStream for LoopbackStream {
    fn set_handler(&self, handler: Weak<dyn StreamEventHandler>) {
        *self.handler.lock().expect("loopback handler mutex poisoned") = Some(handler);
    }

    fn start(&self) -> NativeResult<()> {
        if !self.locally_opened || self.state().id.is_some() {
            return Err(TransportStatus::InvalidState);
        }
        let connection = self.connection.upgrade().ok_or(TransportStatus::InvalidState)?;
        let this = self.this.upgrade().ok_or(TransportStatus::InvalidState)?;
        let (id, peer_connection) = connection.allocate_stream(self.kind, &this)?;

        let peer = LoopbackStream::new(&peer_connection, self.kind, false, Some(id));
        peer.state().peer = Arc::downgrade(&this);
        {
            let mut state = self.state();
            state.id = Some(id);
            state.peer = Arc::downgrade(&peer);
        }

        if !peer_connection.register_peer_stream(id, &peer) {
            peer.close();
            self.emit(StreamEvent::StartComplete {
                result: Err(TransportStatus::Aborted),
            });
            return Ok(());
        }

        self.emit(StreamEvent::StartComplete { result: Ok(id) });
        peer_connection.emit(ConnectionEvent::PeerStreamStarted {
            stream: peer,
            kind: self.kind,
        });
        Ok(())
    }

    fn send(&self, buffers: &[Bytes], fin: bool) -> NativeResult<()> {
        let peer = {
            let mut state = self.state();
            if state.send_closed || state.id.is_none() {
                return Err(TransportStatus::InvalidState);
            }
            if fin {
                state.send_closed = true;
            }
            state.peer.upgrade()
        };

        let data: Vec<Bytes> = buffers.iter().filter(|b| !b.is_empty()).cloned().collect();
        if let Some(peer) = peer {
            peer.enqueue(data, fin);
        }
        self.emit(StreamEvent::SendComplete { canceled: false });
        if fin {
            self.emit(StreamEvent::SendShutdownComplete);
            self.maybe_complete();
        }
        Ok(())
    }

    fn receive_complete(&self, len: usize) {
        tracing::trace!(stream_id = ?self.state().id, len, "Receive acknowledged");
    }

    fn receive_set_enabled(&self, enabled: bool) {
        self.state().receive_enabled = enabled;
        if enabled {
            self.schedule_delivery();
        }
    }

    fn shutdown(&self, how: StreamShutdown, error_code: u64) {
        match how {
            StreamShutdown::Graceful => {
                if let Err(status) = self.send(&[], true) {
                    tracing::trace!(%status, "Graceful shutdown on closed send direction");
                }
            }
            StreamShutdown::AbortSend => self.abort_send(error_code),
            StreamShutdown::AbortReceive => self.abort_receive(error_code),
            StreamShutdown::Abort => {
                self.abort_send(error_code);
                self.abort_receive(error_code);
            }
        }
        self.maybe_complete();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fabric.handle_closed();
        self.shutdown(StreamShutdown::Abort, 0);
        let id = self.state().id;
        if let (Some(connection), Some(id)) = (self.connection.upgrade(), id) {
            connection.release_stream(id, self.kind, self.locally_opened);
        }
    }

    fn id(&self) -> Option<u64> {
        self.state().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Forwards every event to a channel as its debug form.
    struct Recorder {
        events: Mutex<mpsc::Sender<String>>,
        accepted: Mutex<Vec<Arc<dyn NativeConnection>>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::Receiver<String>) {
            let (tx, rx) = mpsc::channel();
            let recorder = Self {
                events: Mutex::new(tx),
                accepted: Mutex::new(Vec::new()),
            };
            (Arc::new(recorder), rx)
        }

        fn record(&self, event: String) {
            let _ = self.events.lock().unwrap().send(event);
        }
    }

    impl ConnectionEventHandler for Recorder {
        fn on_connection_event(&self, event: ConnectionEvent) {
            self.record(format!("{event:?}"));
        }
    }

    impl ListenerEventHandler for Recorder {
        fn on_listener_event(&self, event: ListenerEvent) {
            let ListenerEvent::NewConnection { connection, .. } = event;
            connection.set_handler(Weak::<Recorder>::new());
            self.accepted.lock().unwrap().push(connection);
            self.record("NewConnection".into());
        }
    }

    fn next(rx: &mpsc::Receiver<String>) -> String {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let fabric = LoopbackFabric::new();
        let (recorder, events) = Recorder::new();
        let connection = fabric.connection_open().unwrap();
        connection.set_handler(Arc::downgrade(&recorder) as Weak<dyn ConnectionEventHandler>);

        let options = QuicConnectionOptions::new("127.0.0.1:9".parse().unwrap());
        connection.start(&options).unwrap();

        assert_eq!(
            next(&events),
            "ShutdownInitiatedByTransport { status: ConnectionRefused }"
        );
        assert_eq!(next(&events), "ShutdownComplete");
        connection.close();
        assert_eq!(fabric.open_handle_count(), 0);
    }

    #[test]
    fn listener_address_is_exclusive() {
        let fabric = LoopbackFabric::new();
        let (recorder, _events) = Recorder::new();
        let handler = Arc::downgrade(&recorder) as Weak<dyn ListenerEventHandler>;

        let first = fabric.listener_open(handler.clone()).unwrap();
        let address = first.start(&QuicListenerOptions::default()).unwrap();
        assert_ne!(address.port(), 0);

        let second = fabric.listener_open(handler).unwrap();
        let options = QuicListenerOptions {
            address,
            ..QuicListenerOptions::default()
        };
        assert_eq!(second.start(&options), Err(TransportStatus::AddressInUse));

        first.close();
        first.close();
        assert_eq!(fabric.listener_count(), 0);
        assert!(second.start(&options).is_ok());
        second.close();
        assert_eq!(fabric.open_handle_count(), 0);
    }

    #[test]
    fn alpn_mismatch_fails_the_handshake() {
        let fabric = LoopbackFabric::new();
        let (listener_recorder, listener_events) = Recorder::new();
        let listener = fabric
            .listener_open(Arc::downgrade(&listener_recorder) as Weak<dyn ListenerEventHandler>)
            .unwrap();
        let address = listener.start(&QuicListenerOptions::default()).unwrap();

        let (recorder, events) = Recorder::new();
        let connection = fabric.connection_open().unwrap();
        connection.set_handler(Arc::downgrade(&recorder) as Weak<dyn ConnectionEventHandler>);
        let options = QuicConnectionOptions::new(address).with_application_protocols(["hq-29"]);
        connection.start(&options).unwrap();

        assert_eq!(
            next(&events),
            "ShutdownInitiatedByTransport { status: AlpnNegotiationFailure }"
        );
        assert!(listener_events.try_recv().is_err());
        connection.close();
        listener.close();
    }

    #[test]
    fn stream_ids_follow_initiator_and_direction() {
        let fabric = LoopbackFabric::new();
        let (listener_recorder, listener_events) = Recorder::new();
        let listener = fabric
            .listener_open(Arc::downgrade(&listener_recorder) as Weak<dyn ListenerEventHandler>)
            .unwrap();
        let address = listener.start(&QuicListenerOptions::default()).unwrap();

        let (recorder, events) = Recorder::new();
        let connection = fabric.connection_open().unwrap();
        connection.set_handler(Arc::downgrade(&recorder) as Weak<dyn ConnectionEventHandler>);
        connection.start(&QuicConnectionOptions::new(address)).unwrap();

        assert_eq!(next(&listener_events), "NewConnection");
        assert_eq!(next(&events), "Connected { negotiated_alpn: Some([104, 51]) }");

        let ids: Vec<_> = [
            StreamKind::Bidirectional,
            StreamKind::Unidirectional,
            StreamKind::Bidirectional,
        ]
        .into_iter()
        .map(|kind| {
            let stream = connection.stream_open(kind).unwrap();
            assert_eq!(stream.id(), None);
            stream.start().unwrap();
            stream.id().unwrap()
        })
        .collect();
        assert_eq!(ids, vec![0, 2, 4]);
        connection.close();
        listener.close();
    }
}
