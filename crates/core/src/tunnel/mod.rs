//! Agent tunnel
//!
//! Bidirectional, framed RPC over an arbitrary duplex byte stream: the
//! stdio of a spawned remote process, an SSH channel, or an in-memory pipe
//! in tests. Both endpoints are symmetric: each can issue unary and
//! server-streaming requests and each serves the other's requests through a
//! [`RequestHandler`].
//!
//! ## Ownership
//!
//! Exactly one writer task owns the write half (fed through a bounded
//! queue); exactly one reader task owns the read half and the request-id →
//! oneshot map. Per-RPC futures wait on their oneshot. Server-side requests
//! run on their own tasks and share the writer queue.
//!
//! ## Guarantees
//!
//! - For one request id, the response follows the request; nothing is
//!   ordered across distinct ids.
//! - Stream chunks for one stream arrive in order; streams are independent.
//! - Transport close fails every in-flight RPC with `Disconnected`; the
//!   tunnel is one-shot and must be re-established after close.
//! - Server-streaming honors a credit window: the receiver grants credit as
//!   chunks are consumed and the sender blocks cooperatively at zero.

pub mod frame;
pub mod http;
pub mod messages;

pub use frame::{Frame, FrameKind};
pub use messages::{
    DockerCredentialsRequest, DockerCredentialsResponse, Envelope, ForwardPortRequest,
    GitCredentialsRequest, GitCredentialsResponse, GitUser, LogEntry, LogLevel, RequestKind,
    StopForwardPortRequest, StreamRequest,
};

use crate::errors::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Initial credit window for server-streaming RPCs.
pub const DEFAULT_STREAM_WINDOW: usize = 8;
/// Capacity of the in-container log queue.
pub const LOG_QUEUE_CAPACITY: usize = 1000;
/// Per-message deadline for the log drain task.
pub const LOG_SEND_DEADLINE: Duration = Duration::from_secs(5);
/// Default deadline for ping probes.
pub const DEFAULT_PING_DEADLINE: Duration = Duration::from_secs(10);

/// Serves the peer's requests.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a unary request, returning the response payload.
    async fn handle_unary(&self, kind: RequestKind, envelope: Envelope) -> Result<Bytes>;

    /// Handle a server-streaming request by pushing chunks into `stream`.
    /// Returning `Ok` ends the stream normally.
    async fn handle_stream(
        &self,
        kind: RequestKind,
        envelope: Envelope,
        stream: StreamSender,
    ) -> Result<()>;

    /// Handle a fire-and-forget log entry.
    async fn handle_log(&self, entry: LogEntry) {
        debug!(level = ?entry.level, message = %entry.message, "peer log");
    }
}

/// Handler that rejects everything; endpoints that only issue requests.
pub struct RejectingHandler;

#[async_trait]
impl RequestHandler for RejectingHandler {
    async fn handle_unary(&self, kind: RequestKind, _envelope: Envelope) -> Result<Bytes> {
        Err(TunnelError::Protocol {
            message: format!("operation {:?} not served by this endpoint", kind),
        }
        .into())
    }

    async fn handle_stream(
        &self,
        kind: RequestKind,
        _envelope: Envelope,
        _stream: StreamSender,
    ) -> Result<()> {
        Err(TunnelError::Protocol {
            message: format!("stream {:?} not served by this endpoint", kind),
        }
        .into())
    }
}

enum StreamEvent {
    Chunk(Bytes),
    End,
    Failed(TunnelError),
}

#[derive(Default)]
struct MuxState {
    /// Our outgoing unary requests awaiting a response
    pending: HashMap<u64, oneshot::Sender<std::result::Result<Frame, TunnelError>>>,
    /// Streams we requested, receiving chunks
    incoming_streams: HashMap<u64, mpsc::Sender<StreamEvent>>,
    /// Streams we serve: credit semaphores refilled by credit frames
    outgoing_credit: HashMap<u64, Arc<Semaphore>>,
    /// Requests we are serving: cancel handles for cancel frames
    serving: HashMap<u64, CancellationToken>,
}

/// One bidirectional tunnel session.
pub struct Tunnel {
    writer_tx: mpsc::Sender<Frame>,
    state: Arc<Mutex<MuxState>>,
    next_id: AtomicU64,
    /// Set when the transport is gone
    closed: CancellationToken,
    /// Root cancellation flowing into every RPC
    root: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Tunnel {
    /// Start a tunnel over separate read/write halves.
    pub fn start<R, W>(
        read: R,
        write: W,
        handler: Arc<dyn RequestHandler>,
        root: CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel::<Frame>(64);
        let state = Arc::new(Mutex::new(MuxState::default()));
        let closed = CancellationToken::new();

        let tunnel = Arc::new(Self {
            writer_tx: writer_tx.clone(),
            state: state.clone(),
            next_id: AtomicU64::new(1),
            closed: closed.clone(),
            root: root.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(writer_loop(write, writer_rx, closed.clone()));
        let reader_task = tokio::spawn(reader_loop(
            read,
            writer_tx,
            state,
            handler,
            closed,
            root,
        ));
        tunnel
            .tasks
            .lock()
            .expect("tunnel task list poisoned")
            .extend([writer_task, reader_task]);

        tunnel
    }

    /// Start over a single duplex stream.
    pub fn over_duplex<S>(
        stream: S,
        handler: Arc<dyn RequestHandler>,
        root: CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self::start(read, write, handler, root)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether the transport is still up.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Issue a unary request and wait for its response payload.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn call<T: Serialize>(&self, kind: RequestKind, data: &T) -> Result<Bytes> {
        let envelope = Envelope::new(kind, data)?;
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .expect("tunnel state poisoned")
            .pending
            .insert(id, tx);

        let frame = Frame::new(id, FrameKind::UnaryRequest, 0, envelope.encode()?);
        if self.writer_tx.send(frame).await.is_err() {
            self.state
                .lock()
                .expect("tunnel state poisoned")
                .pending
                .remove(&id);
            return Err(TunnelError::Disconnected.into());
        }

        // Cancellation wins over a racing response or teardown so callers
        // observe `Cancelled` deterministically.
        tokio::select! {
            biased;
            _ = self.root.cancelled() => {
                self.state.lock().expect("tunnel state poisoned").pending.remove(&id);
                let _ = self
                    .writer_tx
                    .send(Frame::control(id, FrameKind::Cancel, 0))
                    .await;
                Err(TunnelError::Cancelled.into())
            }
            response = rx => match response {
                Ok(Ok(frame)) => Ok(frame.payload),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(TunnelError::Disconnected.into()),
            },
        }
    }

    /// Unary request with decoded request/response types.
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        kind: RequestKind,
        data: &Req,
    ) -> Result<Resp> {
        let payload = self.call(kind, data).await?;
        messages::decode_message(&payload)
    }

    /// Unary request bounded by a deadline; the remote task is cancelled on
    /// expiry.
    pub async fn call_with_deadline<T: Serialize>(
        &self,
        kind: RequestKind,
        data: &T,
        deadline: Duration,
    ) -> Result<Bytes> {
        match tokio::time::timeout(deadline, self.call(kind, data)).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::DeadlineExceeded {
                operation: format!("{:?}", kind),
            }
            .into()),
        }
    }

    /// Health probe: a pong must arrive within `deadline`.
    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .expect("tunnel state poisoned")
            .pending
            .insert(id, tx);

        if self
            .writer_tx
            .send(Frame::control(id, FrameKind::Ping, 0))
            .await
            .is_err()
        {
            return Err(TunnelError::Disconnected.into());
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(_))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(_)) => Err(TunnelError::Disconnected.into()),
            Err(_) => {
                self.state
                    .lock()
                    .expect("tunnel state poisoned")
                    .pending
                    .remove(&id);
                Err(TunnelError::DeadlineExceeded {
                    operation: "Ping".to_string(),
                }
                .into())
            }
        }
    }

    /// Enqueue a fire-and-forget log frame, bounded by `deadline`.
    pub async fn send_log(&self, entry: &LogEntry, deadline: Duration) -> Result<()> {
        let frame = Frame::new(
            self.allocate_id(),
            FrameKind::Log,
            0,
            messages::encode_message(entry)?,
        );
        match tokio::time::timeout(deadline, self.writer_tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TunnelError::Disconnected.into()),
            Err(_) => Err(TunnelError::DeadlineExceeded {
                operation: "Log".to_string(),
            }
            .into()),
        }
    }

    /// Open a server-streaming RPC; chunks arrive through the returned
    /// receiver, which grants credit as they are consumed.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn open_stream<T: Serialize>(
        self: &Arc<Self>,
        kind: RequestKind,
        data: &T,
    ) -> Result<StreamReceiver> {
        let envelope = Envelope::new(kind, data)?;
        let id = self.allocate_id();
        let (tx, rx) = mpsc::channel(DEFAULT_STREAM_WINDOW);
        self.state
            .lock()
            .expect("tunnel state poisoned")
            .incoming_streams
            .insert(id, tx);

        let frame = Frame::new(id, FrameKind::StreamRequest, 0, envelope.encode()?);
        if self.writer_tx.send(frame).await.is_err() {
            self.state
                .lock()
                .expect("tunnel state poisoned")
                .incoming_streams
                .remove(&id);
            return Err(TunnelError::Disconnected.into());
        }

        Ok(StreamReceiver {
            id,
            rx,
            writer_tx: self.writer_tx.clone(),
            root: self.root.clone(),
            tunnel: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Shut the tunnel down: cancel every task and fail in-flight RPCs.
    pub async fn shutdown(&self) {
        self.closed.cancel();
        fail_all(&self.state, TunnelError::Disconnected);
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().expect("tunnel task list poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    /// Wait until the transport closes.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Receiving side of a server-streaming RPC.
pub struct StreamReceiver {
    id: u64,
    rx: mpsc::Receiver<StreamEvent>,
    writer_tx: mpsc::Sender<Frame>,
    root: CancellationToken,
    tunnel: std::sync::Weak<Tunnel>,
    finished: bool,
}

impl StreamReceiver {
    /// Next chunk; `Ok(None)` is a clean end of stream. Consuming a chunk
    /// grants the sender one credit.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = self.root.cancelled() => {
                self.finished = true;
                let _ = self
                    .writer_tx
                    .send(Frame::control(self.id, FrameKind::Cancel, 0))
                    .await;
                Err(TunnelError::Cancelled.into())
            }
            event = self.rx.recv() => match event {
                Some(StreamEvent::Chunk(bytes)) => {
                    let _ = self
                        .writer_tx
                        .send(Frame::control(self.id, FrameKind::Credit, 1))
                        .await;
                    Ok(Some(bytes))
                }
                Some(StreamEvent::End) => {
                    self.finished = true;
                    Ok(None)
                }
                Some(StreamEvent::Failed(e)) => {
                    self.finished = true;
                    Err(e.into())
                }
                None => {
                    self.finished = true;
                    Err(TunnelError::Disconnected.into())
                }
            },
        }
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        if let Some(tunnel) = self.tunnel.upgrade() {
            tunnel
                .state
                .lock()
                .expect("tunnel state poisoned")
                .incoming_streams
                .remove(&self.id);
        }
    }
}

/// Sending side of a served stream. Each chunk consumes one credit; the
/// sender blocks cooperatively when the window is exhausted.
pub struct StreamSender {
    id: u64,
    writer_tx: mpsc::Sender<Frame>,
    credit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl StreamSender {
    /// Send one chunk, waiting for credit first.
    pub async fn send(&self, chunk: Bytes) -> Result<()> {
        tokio::select! {
            permit = self.credit.acquire() => {
                permit
                    .map_err(|_| TunnelError::Disconnected)?
                    .forget();
            }
            _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled.into()),
        }
        self.writer_tx
            .send(Frame::new(self.id, FrameKind::StreamChunk, 0, chunk))
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        Ok(())
    }

    /// Whether the peer cancelled this stream.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

async fn writer_loop<W>(
    write: W,
    mut writer_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = FramedWrite::new(write, LengthDelimitedCodec::new());
    loop {
        tokio::select! {
            frame = writer_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = framed.send(frame.encode()).await {
                    warn!(error = %e, "tunnel write failed");
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
}

async fn reader_loop<R>(
    read: R,
    writer_tx: mpsc::Sender<Frame>,
    state: Arc<Mutex<MuxState>>,
    handler: Arc<dyn RequestHandler>,
    closed: CancellationToken,
    root: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(read, LengthDelimitedCodec::new());
    loop {
        let body = tokio::select! {
            body = framed.next() => body,
            _ = closed.cancelled() => break,
            _ = root.cancelled() => break,
        };
        let Some(body) = body else { break };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "tunnel read failed");
                break;
            }
        };
        let frame = match Frame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };
        dispatch_frame(frame, &writer_tx, &state, &handler, &root).await;
    }

    closed.cancel();
    fail_all(&state, TunnelError::Disconnected);
}

async fn dispatch_frame(
    frame: Frame,
    writer_tx: &mpsc::Sender<Frame>,
    state: &Arc<Mutex<MuxState>>,
    handler: &Arc<dyn RequestHandler>,
    root: &CancellationToken,
) {
    match frame.kind {
        FrameKind::UnaryResponse | FrameKind::Pong => {
            let waiter = state
                .lock()
                .expect("tunnel state poisoned")
                .pending
                .remove(&frame.id);
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(frame));
            }
        }
        FrameKind::Error => {
            let error = if frame.status == frame::status::CANCELLED {
                TunnelError::Cancelled
            } else {
                TunnelError::Remote {
                    message: String::from_utf8_lossy(&frame.payload).to_string(),
                }
            };
            let (waiter, stream) = {
                let mut guard = state.lock().expect("tunnel state poisoned");
                (
                    guard.pending.remove(&frame.id),
                    guard.incoming_streams.remove(&frame.id),
                )
            };
            if let Some(tx) = waiter {
                let _ = tx.send(Err(error));
            } else if let Some(tx) = stream {
                let _ = tx.send(StreamEvent::Failed(error)).await;
            }
        }
        FrameKind::StreamChunk => {
            let stream = state
                .lock()
                .expect("tunnel state poisoned")
                .incoming_streams
                .get(&frame.id)
                .cloned();
            if let Some(tx) = stream {
                let _ = tx.send(StreamEvent::Chunk(frame.payload)).await;
            }
        }
        FrameKind::StreamEnd => {
            let stream = state
                .lock()
                .expect("tunnel state poisoned")
                .incoming_streams
                .remove(&frame.id);
            if let Some(tx) = stream {
                let _ = tx.send(StreamEvent::End).await;
            }
        }
        FrameKind::Ping => {
            let _ = writer_tx
                .send(Frame::control(frame.id, FrameKind::Pong, 0))
                .await;
        }
        FrameKind::Log => {
            if let Ok(entry) = messages::decode_message::<LogEntry>(&frame.payload) {
                handler.handle_log(entry).await;
            }
        }
        FrameKind::Cancel => {
            let serving = state
                .lock()
                .expect("tunnel state poisoned")
                .serving
                .get(&frame.id)
                .cloned();
            if let Some(token) = serving {
                token.cancel();
            }
        }
        FrameKind::Credit => {
            let credit = state
                .lock()
                .expect("tunnel state poisoned")
                .outgoing_credit
                .get(&frame.id)
                .cloned();
            if let Some(semaphore) = credit {
                semaphore.add_permits(frame.status as usize);
            }
        }
        FrameKind::UnaryRequest => {
            serve_unary(frame, writer_tx.clone(), state.clone(), handler.clone(), root.clone());
        }
        FrameKind::StreamRequest => {
            serve_stream(frame, writer_tx.clone(), state.clone(), handler.clone(), root.clone());
        }
    }
}

fn serve_unary(
    frame: Frame,
    writer_tx: mpsc::Sender<Frame>,
    state: Arc<Mutex<MuxState>>,
    handler: Arc<dyn RequestHandler>,
    root: CancellationToken,
) {
    let cancel = root.child_token();
    state
        .lock()
        .expect("tunnel state poisoned")
        .serving
        .insert(frame.id, cancel.clone());

    tokio::spawn(async move {
        let id = frame.id;
        let response = match Envelope::decode(&frame.payload) {
            Ok(envelope) => {
                let kind = envelope.kind;
                tokio::select! {
                    result = handler.handle_unary(kind, envelope) => result,
                    _ = cancel.cancelled() => Err(TunnelError::Cancelled.into()),
                }
            }
            Err(e) => Err(e),
        };

        state
            .lock()
            .expect("tunnel state poisoned")
            .serving
            .remove(&id);

        let reply = match response {
            Ok(payload) => Frame::new(id, FrameKind::UnaryResponse, frame::status::OK, payload),
            Err(e) => {
                let status = if matches!(
                    e,
                    crate::errors::GantryError::Tunnel(TunnelError::Cancelled)
                ) {
                    frame::status::CANCELLED
                } else {
                    frame::status::ERROR
                };
                Frame::new(id, FrameKind::Error, status, Bytes::from(e.to_string()))
            }
        };
        let _ = writer_tx.send(reply).await;
    });
}

fn serve_stream(
    frame: Frame,
    writer_tx: mpsc::Sender<Frame>,
    state: Arc<Mutex<MuxState>>,
    handler: Arc<dyn RequestHandler>,
    root: CancellationToken,
) {
    let cancel = root.child_token();
    let credit = Arc::new(Semaphore::new(DEFAULT_STREAM_WINDOW));
    {
        let mut guard = state.lock().expect("tunnel state poisoned");
        guard.serving.insert(frame.id, cancel.clone());
        guard.outgoing_credit.insert(frame.id, credit.clone());
    }

    tokio::spawn(async move {
        let id = frame.id;
        let result = match Envelope::decode(&frame.payload) {
            Ok(envelope) => {
                let kind = envelope.kind;
                let sender = StreamSender {
                    id,
                    writer_tx: writer_tx.clone(),
                    credit,
                    cancel: cancel.clone(),
                };
                tokio::select! {
                    result = handler.handle_stream(kind, envelope, sender) => result,
                    _ = cancel.cancelled() => Err(TunnelError::Cancelled.into()),
                }
            }
            Err(e) => Err(e),
        };

        {
            let mut guard = state.lock().expect("tunnel state poisoned");
            guard.serving.remove(&id);
            guard.outgoing_credit.remove(&id);
        }

        let closing = match result {
            Ok(()) => Frame::control(id, FrameKind::StreamEnd, frame::status::OK),
            Err(e) => {
                let status = if matches!(
                    e,
                    crate::errors::GantryError::Tunnel(TunnelError::Cancelled)
                ) {
                    frame::status::CANCELLED
                } else {
                    frame::status::ERROR
                };
                Frame::new(id, FrameKind::Error, status, Bytes::from(e.to_string()))
            }
        };
        let _ = writer_tx.send(closing).await;
    });
}

fn fail_all(state: &Arc<Mutex<MuxState>>, error: TunnelError) {
    let (pending, streams, serving) = {
        let mut guard = state.lock().expect("tunnel state poisoned");
        (
            guard.pending.drain().collect::<Vec<_>>(),
            guard.incoming_streams.drain().collect::<Vec<_>>(),
            guard.serving.drain().collect::<Vec<_>>(),
        )
    };
    for (_, tx) in pending {
        let _ = tx.send(Err(error.clone()));
    }
    for (_, tx) in streams {
        let _ = tx.try_send(StreamEvent::Failed(error.clone()));
    }
    for (_, token) in serving {
        token.cancel();
    }
}

/// Default keepalive probe interval; zero disables the worker.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(55);

/// Background keepalive: ping the peer on a fixed interval until the
/// session or the root context ends. A missed ping deadline closes the
/// session so in-flight RPCs fail fast instead of hanging.
pub fn spawn_keepalive(
    tunnel: Arc<Tunnel>,
    interval: Duration,
    root: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = root.cancelled() => break,
                _ = tunnel.closed() => break,
            }
            if let Err(e) = tunnel.ping(DEFAULT_PING_DEADLINE).await {
                warn!(error = %e, "keepalive ping failed, closing session");
                tunnel.shutdown().await;
                break;
            }
        }
    }))
}

/// Bounded in-container logger.
///
/// Pushes entries into a queue of [`LOG_QUEUE_CAPACITY`]; when full, the
/// oldest entry is dropped and counted. A single drain task forwards entries
/// with a per-message deadline; accumulated drops are surfaced as a warning
/// on the next successful send.
pub struct RemoteLogger {
    queue: Arc<Mutex<VecDeque<LogEntry>>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl RemoteLogger {
    /// Create the logger and spawn its drain task.
    pub fn start(tunnel: Arc<Tunnel>, root: CancellationToken) -> (Arc<Self>, JoinHandle<()>) {
        let logger = Arc::new(Self {
            queue: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_QUEUE_CAPACITY))),
            notify: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        });

        let drain = {
            let logger = logger.clone();
            tokio::spawn(async move {
                loop {
                    let entry = {
                        let mut queue = logger.queue.lock().expect("log queue poisoned");
                        queue.pop_front()
                    };
                    let Some(entry) = entry else {
                        tokio::select! {
                            _ = logger.notify.notified() => continue,
                            _ = root.cancelled() => break,
                        }
                    };

                    let drops = logger.dropped.swap(0, Ordering::Relaxed);
                    if drops > 0 {
                        let warning = LogEntry {
                            level: LogLevel::Warn,
                            message: format!("{} log entries dropped under load", drops),
                        };
                        if tunnel.send_log(&warning, LOG_SEND_DEADLINE).await.is_err() {
                            // Transport is gone; put the count back and stop.
                            logger.dropped.fetch_add(drops, Ordering::Relaxed);
                            break;
                        }
                    }

                    if tunnel.send_log(&entry, LOG_SEND_DEADLINE).await.is_err() {
                        break;
                    }
                }
            })
        };

        (logger, drain)
    }

    /// Enqueue a log entry; never blocks. When the queue is full the oldest
    /// entry is dropped and counted.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        {
            let mut queue = self.queue.lock().expect("log queue poisoned");
            if queue.len() >= LOG_QUEUE_CAPACITY {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(LogEntry {
                level,
                message: message.into(),
            });
        }
        self.notify.notify_one();
    }

    /// Entries dropped and not yet surfaced.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Entries currently queued.
    pub fn queued_count(&self) -> usize {
        self.queue.lock().expect("log queue poisoned").len()
    }
}
