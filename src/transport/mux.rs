//! Stream multiplexer: many logical streams over one connection.
//!
//! Each [`Connection`] owns three tasks:
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//!   socket read → │ reader: decode → route by stream id      │ → stream consumers
//!                 │          (ping/ack/go-away handled here) │ → server dispatcher
//!                 ├──────────────────────────────────────────┤
//!   socket write ←│ writer: control queue first, then data   │ ← streams, handlers
//!                 ├──────────────────────────────────────────┤
//!                 │ keepalive monitor (optional)             │
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! Only the reader touches the read half. Delivery to consumers never waits,
//! so one slow stream cannot stall another. The stream table and the slot
//! pool are updated together under the table lock.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::transport::codec::{
    decode_error, decode_request, encode_error, encode_request, CallKind, Decoded, Frame,
    FrameCodec, FrameKind, RequestHead,
};
use crate::transport::keepalive::{spawn_monitor, KeepaliveState, Monitored, PingEnforcer, ProbeState};
use crate::types::{
    ClientConfig, ConnectionId, EnforcementPolicy, Error, FrameError, KeepaliveConfig, Result,
    ServerConfig, StreamId, StreamOverflow,
};

/// Connection health as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Probing,
    Dead,
}

/// Lifecycle of a logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// Request sent; only the response direction remains.
    HalfClosed,
    Closed,
    Failed,
}

/// What a client-side stream consumer receives, in order.
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(Bytes),
    End,
    Failed(Error),
}

/// Per-connection limits, derived from the client or server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub max_concurrent_streams: usize,
    pub overflow: StreamOverflow,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub keepalive: Option<KeepaliveConfig>,
    /// Bounded queue of outbound data frames.
    pub write_queue: usize,
}

impl From<&ClientConfig> for ConnectionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_concurrent_streams: config.max_concurrent_streams,
            overflow: config.stream_overflow,
            max_recv_msg_size: config.max_recv_msg_size,
            max_send_msg_size: config.max_send_msg_size,
            keepalive: Some(config.keepalive.clone()),
            write_queue: 1024,
        }
    }
}

impl From<&ServerConfig> for ConnectionConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_concurrent_streams: config.max_concurrent_streams,
            overflow: config.stream_overflow,
            max_recv_msg_size: config.max_recv_msg_size,
            max_send_msg_size: config.max_send_msg_size,
            keepalive: Some(config.keepalive.clone()),
            write_queue: 1024,
        }
    }
}

// =============================================================================
// Capacity slots
// =============================================================================

/// FIFO pool of stream slots with a bounded wait queue.
#[derive(Debug, Clone)]
pub struct StreamSlots {
    semaphore: Arc<Semaphore>,
    limit: usize,
    overflow: StreamOverflow,
    queued: Arc<AtomicUsize>,
}

/// Result of asking for a slot without waiting.
#[derive(Debug)]
pub(crate) enum Admission {
    Ready(OwnedSemaphorePermit),
    Queued(QueueTicket),
}

/// A reserved place in the wait queue.
#[derive(Debug)]
pub(crate) struct QueueTicket {
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl QueueTicket {
    pub(crate) async fn wait(self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::connection_lost("connection closed while queued"))
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub(crate) async fn into_permit(self) -> Result<OwnedSemaphorePermit> {
        match self {
            Admission::Ready(permit) => Ok(permit),
            Admission::Queued(ticket) => ticket.wait().await,
        }
    }
}

impl StreamSlots {
    pub fn new(limit: usize, overflow: StreamOverflow) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            overflow,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Take a free slot, or a queue position, or fail with `CapacityExceeded`.
    pub(crate) fn admit(&self) -> Result<Admission> {
        if self.semaphore.is_closed() {
            return Err(Error::connection_lost("connection closed"));
        }
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(Admission::Ready(permit));
        }
        match self.overflow {
            StreamOverflow::Reject => Err(Error::CapacityExceeded { limit: self.limit }),
            StreamOverflow::Queue { depth } => {
                let ahead = self.queued.fetch_add(1, Ordering::SeqCst);
                let ticket = QueueTicket {
                    semaphore: self.semaphore.clone(),
                    queued: self.queued.clone(),
                };
                if ahead >= depth {
                    drop(ticket);
                    return Err(Error::CapacityExceeded { limit: self.limit });
                }
                Ok(Admission::Queued(ticket))
            }
        }
    }

    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.admit()?.into_permit().await
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

// =============================================================================
// Connection
// =============================================================================

/// Server-side hook invoked by the reader for every admitted request.
/// Implementations must not block; they spawn the call.
pub(crate) type Dispatcher = Arc<dyn Fn(Arc<Connection>, IncomingCall) + Send + Sync>;

pub(crate) enum Role {
    Client,
    Server {
        dispatcher: Dispatcher,
        enforcement: EnforcementPolicy,
    },
}

/// A request handed to the server dispatcher.
#[derive(Debug)]
pub(crate) struct IncomingCall {
    pub stream_id: StreamId,
    pub head: RequestHead,
    pub body: Bytes,
    pub admission: Admission,
    pub cancel: CancellationToken,
}

enum Entry {
    /// Client call awaiting responses.
    Pending(mpsc::UnboundedSender<Delivery>),
    /// Server call being handled.
    Serving(CancellationToken),
}

struct StreamTable {
    next_id: u32,
    entries: HashMap<StreamId, Entry>,
    idle_since: Option<Instant>,
    idle: Arc<Notify>,
}

impl StreamTable {
    fn remove(&mut self, id: StreamId) -> Option<Entry> {
        let entry = self.entries.remove(&id);
        if self.entries.is_empty() && self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
            self.idle.notify_waiters();
        }
        entry
    }

    fn insert(&mut self, id: StreamId, entry: Entry) {
        self.entries.insert(id, entry);
        self.idle_since = None;
    }
}

/// One transport session carrying many logical streams.
pub struct Connection {
    id: ConnectionId,
    address: String,
    config: ConnectionConfig,
    data_tx: mpsc::Sender<Frame>,
    control_tx: mpsc::UnboundedSender<Frame>,
    table: Mutex<StreamTable>,
    slots: StreamSlots,
    keepalive: Arc<KeepaliveState>,
    dead: AtomicBool,
    draining: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("liveness", &self.liveness())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}

impl Connection {
    /// Wrap an established byte stream and start the reader, writer and keepalive tasks.
    pub(crate) fn establish<IO>(
        io: IO,
        address: impl Into<String>,
        config: ConnectionConfig,
        role: Role,
    ) -> Arc<Self>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (data_tx, data_rx) = mpsc::channel(config.write_queue.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let codec = FrameCodec::new(config.max_recv_msg_size, config.max_send_msg_size);

        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            address: address.into(),
            slots: StreamSlots::new(config.max_concurrent_streams, config.overflow),
            config,
            data_tx,
            control_tx,
            table: Mutex::new(StreamTable {
                next_id: 1,
                entries: HashMap::new(),
                idle_since: Some(Instant::now()),
                idle: Arc::new(Notify::new()),
            }),
            keepalive: Arc::new(KeepaliveState::new()),
            dead: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tracing::debug!(conn = %conn.id, "connection_established: {}", conn.address);

        tokio::spawn(write_loop(
            Arc::downgrade(&conn),
            FramedWrite::new(write_half, codec.clone()),
            control_rx,
            data_rx,
            conn.cancel.clone(),
        ));
        tokio::spawn(read_loop(conn.clone(), FramedRead::new(read_half, codec), role));
        if let Some(keepalive) = conn.config.keepalive.clone() {
            spawn_monitor(
                keepalive,
                conn.keepalive.clone(),
                Arc::downgrade(&conn),
                conn.cancel.clone(),
            );
        }
        conn
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn liveness(&self) -> Liveness {
        if self.dead.load(Ordering::SeqCst) {
            return Liveness::Dead;
        }
        match self.keepalive.probe_state() {
            ProbeState::Idle => Liveness::Healthy,
            ProbeState::ProbeSent => Liveness::Probing,
            ProbeState::Dead => Liveness::Dead,
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.keepalive.last_activity()
    }

    pub fn open_streams(&self) -> usize {
        self.table.lock().entries.len()
    }

    /// When the last stream closed, or `None` while streams are open.
    pub fn idle_since(&self) -> Option<Instant> {
        self.table.lock().idle_since
    }

    /// Completes once no streams are open.
    pub async fn wait_idle(&self) {
        loop {
            let notify = self.table.lock().idle.clone();
            let idle = notify.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.open_streams() == 0 {
                return;
            }
            idle.await;
        }
    }

    pub fn slots(&self) -> &StreamSlots {
        &self.slots
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Whether a new call may start on this connection.
    pub fn is_usable(&self) -> bool {
        !self.dead.load(Ordering::SeqCst) && !self.is_draining()
    }

    /// Completes once the connection has been torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Tell the peer no new streams will be accepted here.
    pub fn go_away(&self, reason: &str) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tracing::debug!(conn = %self.id, "go_away_sent: {}", reason);
            let _ = self.control_tx.send(Frame::new(
                FrameKind::GoAway,
                StreamId::CONNECTION,
                Bytes::copy_from_slice(reason.as_bytes()),
            ));
        }
    }

    /// Close the connection, failing every open stream with `ConnectionLost`.
    pub fn close(&self) {
        self.fail_all("connection closed");
    }

    /// Tear down: mark dead, fail every stream, stop all tasks.
    pub(crate) fn fail_all(&self, reason: &str) {
        let entries: Vec<(StreamId, Entry)> = {
            let mut table = self.table.lock();
            if self.dead.swap(true, Ordering::SeqCst) {
                return;
            }
            table.idle_since = Some(Instant::now());
            table.idle.notify_waiters();
            table.entries.drain().collect()
        };

        tracing::info!(
            conn = %self.id,
            streams = entries.len(),
            "connection_closed: {}",
            reason
        );

        for (_, entry) in entries {
            match entry {
                Entry::Pending(tx) => {
                    let _ = tx.send(Delivery::Failed(Error::connection_lost(reason)));
                }
                Entry::Serving(token) => token.cancel(),
            }
        }
        self.slots.close();
        self.cancel.cancel();
    }

    /// Queue a frame on the bounded data path.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        let size = frame.payload.len();
        if size > self.config.max_send_msg_size {
            return Err(FrameError::TooLarge {
                size,
                limit: self.config.max_send_msg_size,
            }
            .into());
        }
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("connection closed"));
        }
        self.data_tx
            .send(frame)
            .await
            .map_err(|_| Error::connection_lost("connection writer stopped"))
    }

    /// Queue a request frame behind earlier control frames. Requests share
    /// the unbounded queue with `Cancel` so a cancel never overtakes its
    /// request; the stream slot held by the caller bounds how many wait here.
    fn send_request_frame(&self, frame: Frame) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("connection closed"));
        }
        self.control_tx
            .send(frame)
            .map_err(|_| Error::connection_lost("connection writer stopped"))
    }

    fn send_control(&self, frame: Frame) {
        let _ = self.control_tx.send(frame);
    }

    fn send_error_control(&self, stream_id: StreamId, err: &Error) {
        self.send_control(Frame::new(FrameKind::Error, stream_id, encode_error(err)));
    }

    // -------------------------------------------------------------------------
    // Client side
    // -------------------------------------------------------------------------

    /// Open a new logical stream, waiting for a slot if the overflow mode allows it.
    pub(crate) async fn open_stream(self: &Arc<Self>, kind: CallKind) -> Result<LogicalStream> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection_lost("connection closed"));
        }
        if self.is_draining() {
            return Err(Error::unavailable("connection is draining"));
        }

        let permit = self.slots.acquire().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut table = self.table.lock();
            if self.dead.load(Ordering::SeqCst) {
                return Err(Error::connection_lost("connection closed"));
            }
            let raw = table.next_id;
            if raw > i32::MAX as u32 {
                self.draining.store(true, Ordering::SeqCst);
                return Err(Error::unavailable("stream ids exhausted"));
            }
            table.next_id = raw + 2;
            let id = StreamId::new(raw);
            table.insert(id, Entry::Pending(tx));
            id
        };
        self.keepalive.notify_stream_opened();

        tracing::trace!(conn = %self.id, stream = %id, "stream_opened: {:?}", kind);
        Ok(LogicalStream {
            id,
            kind,
            conn: self.clone(),
            rx,
            state: StreamState::Open,
            permit: Some(permit),
        })
    }

    fn deliver(&self, id: StreamId, deliveries: Vec<Delivery>, closes: bool) {
        let mut table = self.table.lock();
        let Some(Entry::Pending(tx)) = table.entries.get(&id) else {
            tracing::trace!(conn = %self.id, stream = %id, "frame_for_unknown_stream");
            return;
        };
        let mut consumer_gone = false;
        for delivery in deliveries {
            if tx.send(delivery).is_err() {
                consumer_gone = true;
                break;
            }
        }
        if closes || consumer_gone {
            table.remove(id);
        }
    }

    /// Abandon a stream: forget it and tell the peer.
    fn cancel_stream(&self, id: StreamId) {
        let removed = self.table.lock().remove(id).is_some();
        if removed && !self.dead.load(Ordering::SeqCst) {
            self.send_control(Frame::empty(FrameKind::Cancel, id));
        }
    }

    fn forget_stream(&self, id: StreamId) {
        self.table.lock().remove(id);
    }

    // -------------------------------------------------------------------------
    // Server side
    // -------------------------------------------------------------------------

    fn accept_call(self: &Arc<Self>, frame: Frame, dispatcher: &Dispatcher) {
        let stream_id = frame.stream_id;
        let (head, body) = match decode_request(frame.payload) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(conn = %self.id, stream = %stream_id, "bad_request: {}", e);
                self.send_error_control(stream_id, &e.into());
                return;
            }
        };
        if body.len() > self.config.max_recv_msg_size {
            let err = FrameError::TooLarge {
                size: body.len(),
                limit: self.config.max_recv_msg_size,
            };
            tracing::warn!(conn = %self.id, stream = %stream_id, method = %head.method, "bad_request: {}", err);
            self.send_error_control(stream_id, &err.into());
            return;
        }
        if self.is_draining() {
            self.send_error_control(stream_id, &Error::unavailable("connection is draining"));
            return;
        }

        let admission = match self.slots.admit() {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!(
                    conn = %self.id,
                    stream = %stream_id,
                    method = %head.method,
                    "stream_rejected: {}",
                    e
                );
                self.send_error_control(stream_id, &e);
                return;
            }
        };

        let cancel = self.cancel.child_token();
        {
            let mut table = self.table.lock();
            if table.entries.contains_key(&stream_id) {
                drop(table);
                self.send_error_control(
                    stream_id,
                    &FrameError::Malformed(format!("stream {} already open", stream_id)).into(),
                );
                return;
            }
            table.insert(stream_id, Entry::Serving(cancel.clone()));
        }
        self.keepalive.notify_stream_opened();

        dispatcher(
            self.clone(),
            IncomingCall {
                stream_id,
                head,
                body,
                admission,
                cancel,
            },
        );
    }

    /// Server call finished: release its table entry.
    pub(crate) fn finish_serving(&self, id: StreamId) {
        self.table.lock().remove(id);
    }

    fn cancel_serving(&self, id: StreamId) {
        if let Some(Entry::Serving(token)) = self.table.lock().remove(id) {
            tracing::debug!(conn = %self.id, stream = %id, "call_cancelled_by_peer");
            token.cancel();
        }
    }

    // -------------------------------------------------------------------------
    // Reader
    // -------------------------------------------------------------------------

    /// Route one inbound frame. `Err` terminates the connection.
    fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        role: &Role,
        enforcer: &mut Option<PingEnforcer>,
    ) -> std::result::Result<(), String> {
        let id = frame.stream_id;
        match frame.kind {
            FrameKind::Ping => {
                if let Some(enforcer) = enforcer.as_mut() {
                    if let Err(violation) = enforcer.on_ping(Instant::now(), self.open_streams()) {
                        tracing::warn!(conn = %self.id, "ping_policy_violation: {}", violation);
                        self.go_away("too_many_pings");
                        return Err(violation.to_string());
                    }
                }
                self.send_control(Frame::new(FrameKind::PingAck, StreamId::CONNECTION, frame.payload));
            }
            FrameKind::PingAck => {}
            FrameKind::GoAway => {
                tracing::info!(
                    conn = %self.id,
                    "go_away_received: {}",
                    String::from_utf8_lossy(&frame.payload)
                );
                self.draining.store(true, Ordering::SeqCst);
            }
            FrameKind::Request => match role {
                Role::Server { dispatcher, .. } => self.accept_call(frame, dispatcher),
                Role::Client => {
                    self.send_error_control(id, &Error::unimplemented("client does not serve calls"));
                }
            },
            FrameKind::Cancel => self.cancel_serving(id),
            FrameKind::Response => self.deliver(
                id,
                vec![Delivery::Message(frame.payload), Delivery::End],
                true,
            ),
            FrameKind::StreamChunk => self.deliver(id, vec![Delivery::Message(frame.payload)], false),
            FrameKind::StreamEnd => self.deliver(id, vec![Delivery::End], true),
            FrameKind::Error => {
                let err = decode_error(&frame.payload);
                self.deliver(id, vec![Delivery::Failed(err)], true);
            }
        }
        Ok(())
    }

    fn reject(&self, id: StreamId, error: FrameError, role: &Role) {
        tracing::warn!(conn = %self.id, stream = %id, "frame_rejected: {}", error);
        match role {
            Role::Client => self.deliver(id, vec![Delivery::Failed(error.into())], true),
            Role::Server { .. } => {
                self.cancel_serving(id);
                self.send_error_control(id, &error.into());
            }
        }
    }
}

impl Monitored for Connection {
    fn open_streams(&self) -> usize {
        Connection::open_streams(self)
    }

    fn send_probe(&self) -> bool {
        if self.dead.load(Ordering::SeqCst) {
            return false;
        }
        self.control_tx
            .send(Frame::empty(FrameKind::Ping, StreamId::CONNECTION))
            .is_ok()
    }

    fn declare_dead(&self, reason: &str) {
        self.fail_all(reason);
    }
}

async fn read_loop<R>(conn: Arc<Connection>, mut frames: FramedRead<R, FrameCodec>, role: Role)
where
    R: AsyncRead + Unpin,
{
    let mut enforcer = match &role {
        Role::Server { enforcement, .. } => Some(PingEnforcer::new(enforcement.clone())),
        Role::Client => None,
    };

    let reason = loop {
        let item = tokio::select! {
            _ = conn.cancel.cancelled() => break "connection closed".to_string(),
            item = frames.next() => item,
        };
        match item {
            None => break "peer closed the connection".to_string(),
            Some(Err(e)) => break format!("read failed: {}", e),
            Some(Ok(Decoded::Rejected { stream_id, error })) => {
                conn.keepalive.record_activity();
                conn.reject(stream_id, error, &role);
            }
            Some(Ok(Decoded::Frame(frame))) => {
                conn.keepalive.record_activity();
                if let Err(reason) = conn.handle_frame(frame, &role, &mut enforcer) {
                    break reason;
                }
            }
        }
    };
    conn.fail_all(&reason);
}

async fn write_loop<W>(
    conn: Weak<Connection>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut control_rx: mpsc::UnboundedReceiver<Frame>,
    mut data_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control_rx.recv() => frame,
            Some(frame) = data_rx.recv() => frame,
            _ = cancel.cancelled() => break,
            else => break,
        };
        if let Err(e) = sink.send(frame).await {
            tracing::warn!("write failed: {}", e);
            if let Some(conn) = conn.upgrade() {
                conn.fail_all(&format!("write failed: {}", e));
            }
            return;
        }
    }

    // Flush pending control frames (go-away) before closing the write half.
    while let Ok(frame) = control_rx.try_recv() {
        if sink.feed(frame).await.is_err() {
            return;
        }
    }
    let _ = sink.flush().await;
    let _ = sink.get_mut().shutdown().await;
}

// =============================================================================
// Logical stream (client side)
// =============================================================================

/// One in-flight call on a connection. Dropping it before the call finished
/// cancels the call on the peer and releases its slot.
pub struct LogicalStream {
    id: StreamId,
    kind: CallKind,
    conn: Arc<Connection>,
    rx: mpsc::UnboundedReceiver<Delivery>,
    state: StreamState,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for LogicalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("conn", &self.conn.id)
            .finish()
    }
}

impl LogicalStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Send the single request and half-close.
    pub(crate) fn send_request(&mut self, head: &RequestHead, body: &[u8]) -> Result<()> {
        let limit = self.conn.config.max_send_msg_size;
        let sent = if body.len() > limit {
            Err(FrameError::TooLarge {
                size: body.len(),
                limit,
            }
            .into())
        } else {
            encode_request(head, body)
        };
        let sent = sent.and_then(|payload| {
            self.conn
                .send_request_frame(Frame::new(FrameKind::Request, self.id, payload))
        });
        match sent {
            Ok(()) => {
                self.state = StreamState::HalfClosed;
                Ok(())
            }
            Err(e) => {
                self.finish(StreamState::Failed);
                Err(e)
            }
        }
    }

    /// Next delivery; after `End` or `Failed` the stream is released.
    pub(crate) async fn recv(&mut self) -> Delivery {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Delivery> {
        if matches!(self.state, StreamState::Closed | StreamState::Failed) {
            return Poll::Ready(Delivery::End);
        }
        let delivery = match self.rx.poll_recv(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Some(delivery)) => delivery,
            Poll::Ready(None) => {
                Delivery::Failed(Error::connection_lost("stream dropped by connection"))
            }
        };
        match &delivery {
            Delivery::Message(_) => {}
            Delivery::End => self.finish(StreamState::Closed),
            Delivery::Failed(_) => self.finish(StreamState::Failed),
        }
        Poll::Ready(delivery)
    }

    fn finish(&mut self, state: StreamState) {
        self.state = state;
        self.permit.take();
        self.conn.forget_stream(self.id);
    }
}

impl Drop for LogicalStream {
    fn drop(&mut self) {
        if matches!(self.state, StreamState::Open | StreamState::HalfClosed) {
            tracing::trace!(conn = %self.conn.id, stream = %self.id, "stream_abandoned");
            self.conn.cancel_stream(self.id);
        }
    }
}
