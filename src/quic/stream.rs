//! Async stream over a native stream handle.
//!
//! # Responsibilities
//! - Turn native receive/send/shutdown events into awaitable reads and writes
//! - Keep at most one send in flight and pin its buffers until it completes
//! - Apply aborts from either side exactly once and report them with their code
//! - Release everything on dispose: abort unfinished directions, drop pinned
//!   buffers, close the native handle
//!
//! # Design Decisions
//! - Read and send state share one mutex. Native events mutate the state, drop
//!   the lock, then signal a reusable completion source. Pollers check the state
//!   and poll the source while holding the lock, so a signal is never lost.
//! - A completion that nobody consumed is harmless: pollers loop and re-check.
//! - Cancellation is a guarded transition from a pending state to `Aborted`. If
//!   the operation already committed, cancelling does nothing.
//!
//! # Data Flow
//! ```text
//! native Receive ─► receive_buffers ─► read() copies out ─► drained?
//!                                                            └─► receive_complete + receive_set_enabled(true)
//! write() ─► pinned buffers ─► native send ─► SendComplete ─► Finished ─► write() returns
//! ```

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::quic::error::QuicError;
use crate::quic::native::{
    NativeStream, StreamEvent, StreamEventHandler, StreamKind, StreamShutdown,
};
use crate::sync::ResettableCompletionSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Nothing buffered.
    None,
    /// A native receive is buffered and being drained.
    IndividualReadComplete,
    /// The peer finished sending, or the connection shut down.
    ReadsCompleted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    None,
    Pending,
    Aborted,
    /// The last send completed and has not been observed yet.
    Finished,
}

#[derive(Debug, Clone, Copy)]
enum StartState {
    Pending,
    Started,
    Failed(QuicError),
}

struct StreamState {
    read: ReadState,
    send: SendState,
    start: StartState,
    receive_buffers: VecDeque<Bytes>,
    /// Bytes of the native receive currently being drained.
    receive_len: usize,
    fin_received: bool,
    read_error: Option<QuicError>,
    send_error: Option<QuicError>,
    /// Buffers of the send in flight. Native owns a view of them until SendComplete.
    pinned: Vec<Bytes>,
    fin_sent: bool,
    send_shutdown_complete: bool,
    shutdown_complete: bool,
}

pub(crate) struct StreamShared {
    native: Arc<dyn NativeStream>,
    kind: StreamKind,
    inbound: bool,
    id: OnceLock<u64>,
    state: Mutex<StreamState>,
    receive: ResettableCompletionSource<(), QuicError>,
    send: ResettableCompletionSource<(), QuicError>,
    start: ResettableCompletionSource<(), QuicError>,
    send_shutdown: ResettableCompletionSource<(), QuicError>,
    shutdown: ResettableCompletionSource<(), QuicError>,
    disposed: AtomicBool,
}

/// One multiplexed stream of a [`QuicConnection`](crate::quic::QuicConnection).
///
/// Reads and writes take `&mut self`, so each direction has at most one
/// operation outstanding. Use [`abort_handle`](Self::abort_handle) to abort
/// a direction from another task while an operation is in flight.
pub struct QuicStream {
    shared: Arc<StreamShared>,
}

/// Aborts either direction of a stream without owning it.
#[derive(Clone)]
pub struct StreamAbortHandle {
    shared: Arc<StreamShared>,
}

fn copy_out(buffers: &mut VecDeque<Bytes>, dst: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < dst.len() {
        let Some(front) = buffers.front_mut() else {
            break;
        };
        let n = front.len().min(dst.len() - copied);
        dst[copied..copied + n].copy_from_slice(&front[..n]);
        front.advance(n);
        copied += n;
        if front.is_empty() {
            buffers.pop_front();
        }
    }
    copied
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().expect("stream state mutex poisoned")
    }

    fn can_read(&self) -> bool {
        self.kind == StreamKind::Bidirectional || self.inbound
    }

    fn can_write(&self) -> bool {
        self.kind == StreamKind::Bidirectional || !self.inbound
    }

    fn id(&self) -> Option<u64> {
        if let Some(id) = self.id.get() {
            return Some(*id);
        }
        let id = self.native.id()?;
        let _ = self.id.set(id);
        Some(id)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Wait until `flag` holds, woken by `source`.
    fn poll_flag(
        &self,
        cx: &mut Context<'_>,
        source: &ResettableCompletionSource<(), QuicError>,
        flag: fn(&StreamState) -> bool,
    ) -> Poll<()> {
        loop {
            let state = self.lock();
            if flag(&state) {
                return Poll::Ready(());
            }
            if source.poll_wait(cx).is_pending() {
                return Poll::Pending;
            }
        }
    }

    fn poll_started(&self, cx: &mut Context<'_>) -> Poll<Result<(), QuicError>> {
        loop {
            let state = self.lock();
            match state.start {
                StartState::Started => return Poll::Ready(Ok(())),
                StartState::Failed(e) => return Poll::Ready(Err(e)),
                StartState::Pending => {
                    if self.start.poll_wait(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
            }
        }
    }

    fn poll_read(&self, cx: &mut Context<'_>, dst: &mut [u8]) -> Poll<Result<usize, QuicError>> {
        if !self.can_read() {
            return Poll::Ready(Err(QuicError::InvalidOperation("stream is not readable")));
        }
        loop {
            let mut state = self.lock();
            match state.read {
                ReadState::IndividualReadComplete => {
                    let n = copy_out(&mut state.receive_buffers, dst);
                    if !state.receive_buffers.is_empty() {
                        return Poll::Ready(Ok(n));
                    }

                    let len = std::mem::take(&mut state.receive_len);
                    state.read = if state.fin_received {
                        ReadState::ReadsCompleted
                    } else {
                        ReadState::None
                    };
                    drop(state);
                    self.native.receive_complete(len);
                    self.native.receive_set_enabled(true);

                    // An empty batch must not read as end of stream.
                    if n == 0 && !dst.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Ok(n));
                }
                ReadState::ReadsCompleted => return Poll::Ready(Ok(0)),
                ReadState::Aborted => {
                    let error = state
                        .read_error
                        .unwrap_or(QuicError::StreamAborted { error_code: None });
                    return Poll::Ready(Err(error));
                }
                ReadState::None => {
                    if self.receive.poll_wait(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
            }
        }
    }

    fn begin_send(&self, buffers: &[Bytes], fin: bool) -> Result<(), QuicError> {
        {
            let mut state = self.lock();
            match state.send {
                SendState::Aborted => {
                    return Err(state
                        .send_error
                        .unwrap_or(QuicError::StreamAborted { error_code: None }))
                }
                SendState::Pending => {
                    return Err(QuicError::InvalidOperation(
                        "a send is already in flight on this stream",
                    ))
                }
                SendState::None | SendState::Finished => {}
            }
            if state.fin_sent {
                return Err(QuicError::InvalidOperation("stream has already been finished"));
            }
            state.send = SendState::Pending;
            state.pinned.extend(buffers.iter().cloned());
            state.fin_sent = fin;
        }

        if let Err(status) = self.native.send(buffers, fin) {
            let mut state = self.lock();
            state.pinned.clear();
            if state.send == SendState::Pending {
                state.send = SendState::None;
            }
            if fin {
                state.fin_sent = false;
            }
            return Err(state.send_error.unwrap_or(QuicError::from_status(status)));
        }
        Ok(())
    }

    fn poll_send_complete(&self, cx: &mut Context<'_>) -> Poll<Result<(), QuicError>> {
        loop {
            let mut state = self.lock();
            match state.send {
                SendState::Finished => {
                    state.send = SendState::None;
                    return Poll::Ready(Ok(()));
                }
                SendState::None => return Poll::Ready(Ok(())),
                SendState::Aborted => {
                    let error = state
                        .send_error
                        .unwrap_or(QuicError::StreamAborted { error_code: None });
                    return Poll::Ready(Err(error));
                }
                SendState::Pending => {
                    if self.send.poll_wait(cx).is_pending() {
                        return Poll::Pending;
                    }
                }
            }
        }
    }

    /// Queue a FIN unless one was sent already.
    fn begin_finish(&self) -> Result<(), QuicError> {
        {
            let mut state = self.lock();
            if state.send == SendState::Aborted {
                return Err(state
                    .send_error
                    .unwrap_or(QuicError::StreamAborted { error_code: None }));
            }
            if state.fin_sent {
                return Ok(());
            }
            state.fin_sent = true;
        }
        self.native.shutdown(StreamShutdown::Graceful, 0);
        Ok(())
    }

    fn poll_finished(&self, cx: &mut Context<'_>) -> Poll<Result<(), QuicError>> {
        ready!(self.poll_flag(cx, &self.send_shutdown, |s| s.send_shutdown_complete));
        let state = self.lock();
        Poll::Ready(match state.send {
            SendState::Aborted => Err(state
                .send_error
                .unwrap_or(QuicError::StreamAborted { error_code: None })),
            _ => Ok(()),
        })
    }

    fn cancel_read(&self) -> Result<(), QuicError> {
        {
            let mut state = self.lock();
            if state.read != ReadState::None {
                return Ok(());
            }
            state.read = ReadState::Aborted;
            state.read_error = Some(QuicError::OperationCanceled);
        }
        tracing::debug!(stream_id = ?self.id(), "Read cancelled");
        metrics::record_stream_aborted("read");
        self.native.shutdown(StreamShutdown::AbortReceive, 0);
        Err(QuicError::OperationCanceled)
    }

    fn cancel_send(&self) -> Result<(), QuicError> {
        {
            let mut state = self.lock();
            match state.send {
                SendState::Finished => {
                    state.send = SendState::None;
                    return Ok(());
                }
                SendState::Aborted => {
                    return Err(state
                        .send_error
                        .unwrap_or(QuicError::StreamAborted { error_code: None }))
                }
                SendState::None => return Err(QuicError::OperationCanceled),
                SendState::Pending => {
                    state.send = SendState::Aborted;
                    state.send_error = Some(QuicError::OperationCanceled);
                }
            }
        }
        tracing::debug!(stream_id = ?self.id(), "Write cancelled");
        metrics::record_stream_aborted("write");
        self.native.shutdown(StreamShutdown::AbortSend, 0);
        Err(QuicError::OperationCanceled)
    }

    fn abort_send(&self, error_code: u64) {
        {
            let mut state = self.lock();
            if state.send == SendState::Aborted || state.send_shutdown_complete {
                return;
            }
            state.send = SendState::Aborted;
            state.send_error = Some(QuicError::StreamAborted { error_code: None });
        }
        tracing::debug!(stream_id = ?self.id(), error_code, "Aborting stream send");
        metrics::record_stream_aborted("write");
        self.native.shutdown(StreamShutdown::AbortSend, error_code);
        self.send.complete(());
    }

    fn abort_receive(&self, error_code: u64) {
        {
            let mut state = self.lock();
            if matches!(state.read, ReadState::ReadsCompleted | ReadState::Aborted) {
                return;
            }
            state.read = ReadState::Aborted;
            state.read_error = Some(QuicError::StreamAborted { error_code: None });
            state.receive_buffers.clear();
        }
        tracing::debug!(stream_id = ?self.id(), error_code, "Aborting stream receive");
        metrics::record_stream_aborted("read");
        self.native.shutdown(StreamShutdown::AbortReceive, error_code);
        self.receive.complete(());
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (abort_send, abort_receive) = {
            let mut state = self.lock();
            let abort_send = self.can_write()
                && !state.shutdown_complete
                && !state.fin_sent
                && state.send != SendState::Aborted;
            let abort_receive = self.can_read()
                && !state.shutdown_complete
                && !matches!(state.read, ReadState::ReadsCompleted | ReadState::Aborted);
            if abort_send {
                state.send = SendState::Aborted;
                state.send_error = Some(QuicError::OperationAborted);
            }
            if abort_receive {
                state.read = ReadState::Aborted;
                state.read_error = Some(QuicError::OperationAborted);
            }
            state.pinned.clear();
            state.receive_buffers.clear();
            (abort_send, abort_receive)
        };

        match (abort_send, abort_receive) {
            (true, true) => self.native.shutdown(StreamShutdown::Abort, 0),
            (true, false) => self.native.shutdown(StreamShutdown::AbortSend, 0),
            (false, true) => self.native.shutdown(StreamShutdown::AbortReceive, 0),
            (false, false) => {}
        }
        self.native.close();
        tracing::trace!(stream_id = ?self.id(), abort_send, abort_receive, "Stream disposed");
    }
}

impl StreamEventHandler for StreamShared {
    fn on_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::StartComplete { result } => {
                {
                    let mut state = self.lock();
                    state.start = match result {
                        Ok(id) => {
                            let _ = self.id.set(id);
                            StartState::Started
                        }
                        Err(status) => StartState::Failed(QuicError::from_status(status)),
                    };
                }
                self.start.complete(());
            }
            StreamEvent::Receive { buffers } => {
                {
                    let mut state = self.lock();
                    if matches!(state.read, ReadState::Aborted | ReadState::ReadsCompleted) {
                        return;
                    }
                    state.receive_len += buffers.iter().map(Bytes::len).sum::<usize>();
                    state
                        .receive_buffers
                        .extend(buffers.into_iter().filter(|b| !b.is_empty()));
                    state.read = ReadState::IndividualReadComplete;
                }
                self.receive.complete(());
            }
            StreamEvent::SendComplete { canceled } => {
                {
                    let mut state = self.lock();
                    state.pinned.clear();
                    if state.send == SendState::Pending {
                        if canceled {
                            state.send = SendState::Aborted;
                            state
                                .send_error
                                .get_or_insert(QuicError::StreamAborted { error_code: None });
                        } else {
                            state.send = SendState::Finished;
                        }
                    }
                }
                self.send.complete(());
            }
            StreamEvent::PeerSendShutdown => {
                {
                    let mut state = self.lock();
                    state.fin_received = true;
                    if state.read == ReadState::None {
                        state.read = ReadState::ReadsCompleted;
                    }
                }
                self.receive.complete(());
            }
            StreamEvent::PeerSendAborted { error_code } => {
                {
                    let mut state = self.lock();
                    if matches!(state.read, ReadState::ReadsCompleted | ReadState::Aborted) {
                        return;
                    }
                    state.read = ReadState::Aborted;
                    state.read_error = Some(QuicError::StreamAborted {
                        error_code: Some(error_code),
                    });
                    state.receive_buffers.clear();
                }
                tracing::debug!(stream_id = ?self.id(), error_code, "Peer aborted sending");
                metrics::record_stream_aborted("read");
                self.receive.complete(());
            }
            StreamEvent::PeerReceiveAborted { error_code } => {
                {
                    let mut state = self.lock();
                    if state.send == SendState::Aborted || state.send_shutdown_complete {
                        return;
                    }
                    state.send = SendState::Aborted;
                    state.send_error = Some(QuicError::StreamAborted {
                        error_code: Some(error_code),
                    });
                }
                tracing::debug!(stream_id = ?self.id(), error_code, "Peer aborted receiving");
                metrics::record_stream_aborted("write");
                self.send.complete(());
            }
            StreamEvent::SendShutdownComplete => {
                self.lock().send_shutdown_complete = true;
                self.send_shutdown.complete(());
            }
            StreamEvent::ShutdownComplete {
                connection_shutdown,
            } => {
                {
                    let mut state = self.lock();
                    state.shutdown_complete = true;
                    state.send_shutdown_complete = true;
                    state.fin_received = true;
                    if state.read == ReadState::None {
                        state.read = ReadState::ReadsCompleted;
                    }
                    if state.send == SendState::Pending {
                        state.send = SendState::Aborted;
                        state.send_error = Some(QuicError::OperationAborted);
                    }
                    if matches!(state.start, StartState::Pending) {
                        state.start = StartState::Failed(QuicError::OperationAborted);
                    }
                }
                tracing::trace!(stream_id = ?self.id(), connection_shutdown, "Stream shutdown complete");
                self.receive.complete(());
                self.send.complete(());
                self.start.complete(());
                self.send_shutdown.complete(());
                self.shutdown.complete(());
            }
        }
    }
}

impl QuicStream {
    fn new(native: Arc<dyn NativeStream>, kind: StreamKind, inbound: bool) -> Self {
        let shared = Arc::new(StreamShared {
            native,
            kind,
            inbound,
            id: OnceLock::new(),
            state: Mutex::new(StreamState {
                read: ReadState::None,
                send: SendState::None,
                start: if inbound {
                    StartState::Started
                } else {
                    StartState::Pending
                },
                receive_buffers: VecDeque::new(),
                receive_len: 0,
                fin_received: false,
                read_error: None,
                send_error: None,
                pinned: Vec::new(),
                fin_sent: false,
                send_shutdown_complete: false,
                shutdown_complete: false,
            }),
            receive: ResettableCompletionSource::new(),
            send: ResettableCompletionSource::new(),
            start: ResettableCompletionSource::new(),
            send_shutdown: ResettableCompletionSource::new(),
            shutdown: ResettableCompletionSource::new(),
            disposed: AtomicBool::new(false),
        });
        let handler = Arc::downgrade(&shared) as Weak<dyn StreamEventHandler>;
        shared.native.set_handler(handler);
        Self { shared }
    }

    /// A stream the peer started.
    pub(crate) fn inbound(native: Arc<dyn NativeStream>, kind: StreamKind) -> Self {
        Self::new(native, kind, true)
    }

    /// Open and start a local stream. Writes wait for the start to complete.
    pub(crate) fn open(native: Arc<dyn NativeStream>, kind: StreamKind) -> Result<Self, QuicError> {
        let stream = Self::new(native, kind, false);
        stream.shared.native.start().map_err(QuicError::from_status)?;
        Ok(stream)
    }

    pub(crate) fn downgrade(&self) -> Weak<StreamShared> {
        Arc::downgrade(&self.shared)
    }

    /// `None` until a locally opened stream has started.
    pub fn id(&self) -> Option<u64> {
        self.shared.id()
    }

    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    pub fn can_read(&self) -> bool {
        self.shared.can_read()
    }

    pub fn can_write(&self) -> bool {
        self.shared.can_write()
    }

    pub fn read_state(&self) -> ReadState {
        self.shared.lock().read
    }

    pub fn send_state(&self) -> SendState {
        self.shared.lock().send
    }

    /// Read into `buf`. `Ok(0)` means the peer finished sending.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, QuicError> {
        poll_fn(|cx| self.shared.poll_read(cx, buf)).await
    }

    /// Read, giving up with [`QuicError::OperationCanceled`] when `token` fires
    /// before data arrives. Cancelling aborts the receive direction.
    pub async fn read_cancellable(
        &mut self,
        buf: &mut [u8],
        token: &CancellationToken,
    ) -> Result<usize, QuicError> {
        let outcome = tokio::select! {
            biased;
            result = self.read(buf) => Some(result),
            _ = token.cancelled() => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                self.shared.cancel_read()?;
                // Data landed between the wakeup and the cancel.
                self.read(buf).await
            }
        }
    }

    pub async fn write(&mut self, data: Bytes, fin: bool) -> Result<(), QuicError> {
        self.write_gather(std::slice::from_ref(&data), fin).await
    }

    /// Send several buffers as one operation; `fin` finishes the stream after them.
    pub async fn write_gather(&mut self, buffers: &[Bytes], fin: bool) -> Result<(), QuicError> {
        if !self.can_write() {
            return Err(QuicError::InvalidOperation("stream is not writable"));
        }
        if !fin && buffers.iter().all(Bytes::is_empty) {
            return Ok(());
        }
        poll_fn(|cx| self.shared.poll_started(cx)).await?;
        self.shared.begin_send(buffers, fin)?;
        poll_fn(|cx| self.shared.poll_send_complete(cx)).await
    }

    /// Write, giving up with [`QuicError::OperationCanceled`] when `token` fires
    /// before the send completes. Cancelling aborts the send direction.
    pub async fn write_cancellable(
        &mut self,
        data: Bytes,
        fin: bool,
        token: &CancellationToken,
    ) -> Result<(), QuicError> {
        let outcome = tokio::select! {
            biased;
            result = self.write(data, fin) => Some(result),
            _ = token.cancelled() => None,
        };
        match outcome {
            Some(result) => result,
            None => self.shared.cancel_send(),
        }
    }

    /// Abort the send direction. The peer sees `error_code`.
    pub fn shutdown_write(&self, error_code: u64) -> Result<(), QuicError> {
        if !self.can_write() {
            return Err(QuicError::InvalidOperation("stream is not writable"));
        }
        self.shared.abort_send(error_code);
        Ok(())
    }

    /// Abort the receive direction. The peer sees `error_code`.
    pub fn shutdown_read(&self, error_code: u64) -> Result<(), QuicError> {
        if !self.can_read() {
            return Err(QuicError::InvalidOperation("stream is not readable"));
        }
        self.shared.abort_receive(error_code);
        Ok(())
    }

    /// Finish the send direction and wait until the transport confirms it.
    pub async fn shutdown_write_completed(&mut self) -> Result<(), QuicError> {
        if !self.can_write() {
            return Err(QuicError::InvalidOperation("stream is not writable"));
        }
        poll_fn(|cx| self.shared.poll_started(cx)).await?;
        poll_fn(|cx| self.shared.poll_send_complete(cx)).await?;
        self.shared.begin_finish()?;
        poll_fn(|cx| self.shared.poll_finished(cx)).await
    }

    /// Wait until both directions are closed.
    pub async fn shutdown_completed(&mut self) -> Result<(), QuicError> {
        poll_fn(|cx| {
            self.shared
                .poll_flag(cx, &self.shared.shutdown, |s| s.shutdown_complete)
        })
        .await;
        Ok(())
    }

    pub fn abort_handle(&self) -> StreamAbortHandle {
        StreamAbortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Release the stream. Safe to call more than once.
    pub fn dispose(&self) {
        self.shared.dispose();
    }
}

impl StreamAbortHandle {
    pub fn shutdown_write(&self, error_code: u64) {
        if self.shared.can_write() {
            self.shared.abort_send(error_code);
        }
    }

    pub fn shutdown_read(&self, error_code: u64) {
        if self.shared.can_read() {
            self.shared.abort_receive(error_code);
        }
    }
}

impl Drop for QuicStream {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("QuicStream")
            .field("id", &self.shared.id.get())
            .field("kind", &self.shared.kind)
            .field("inbound", &self.shared.inbound)
            .field("read", &state.read)
            .field("send", &state.send)
            .finish()
    }
}

impl std::fmt::Debug for StreamAbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAbortHandle")
            .field("id", &self.shared.id.get())
            .finish()
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = ready!(self.shared.poll_read(cx, buf.initialize_unfilled()))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if !self.can_write() {
            return Poll::Ready(Err(
                QuicError::InvalidOperation("stream is not writable").into()
            ));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(self.shared.poll_started(cx))?;
        // One send in flight: the previous write must complete first.
        ready!(self.shared.poll_send_complete(cx))?;
        self.shared
            .begin_send(&[Bytes::copy_from_slice(buf)], false)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.shared.poll_send_complete(cx))?;
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.shared.poll_send_complete(cx))?;
        self.shared.begin_finish()?;
        ready!(self.shared.poll_finished(cx))?;
        Poll::Ready(Ok(()))
    }
}
