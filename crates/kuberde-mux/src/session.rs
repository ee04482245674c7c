//! Multiplexed sessions
//!
//! A session owns three tasks over one transport:
//! - the writer drains a bounded outbound queue into the sink
//! - the reader decodes frames and dispatches them to per-stream channels
//! - the heartbeat sends Pings and closes the session when the peer is silent
//!
//! All three share one [`CancellationToken`]; each stream's token is a child
//! of it, so closing the session cancels every stream while closing a stream
//! never touches its siblings.
//!
//! # Backpressure
//!
//! Per-stream channels are bounded and the reader never waits on them. A
//! stream whose consumer has fallen a full buffer behind is reset on the
//! next payload; its siblings keep flowing.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FrameKind, SESSION_STREAM_ID};
use crate::stream::{MuxStream, StreamSlot};
use crate::MuxError;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of the tunnel this session is
///
/// The relay (server) opens even-numbered streams and the agent (client)
/// odd-numbered ones, so ids never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Relay side
    Server,
    /// Agent side
    Client,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Server => 2,
            Role::Client => 1,
        }
    }

    fn opened_by_us(self, stream_id: u32) -> bool {
        match self {
            Role::Server => stream_id % 2 == 0,
            Role::Client => stream_id % 2 == 1,
        }
    }
}

/// Session tuning
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Interval between Pings
    pub heartbeat_interval: Duration,
    /// Close the session when nothing arrives for this long
    pub idle_timeout: Duration,
    /// Payloads buffered per stream before it counts as stalled
    pub stream_buffer: usize,
    /// Peer-opened streams waiting to be accepted
    pub accept_backlog: usize,
    /// Frames waiting for the transport
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            stream_buffer: 64,
            accept_backlog: 128,
            outbound_buffer: 1024,
        }
    }
}

/// Something the peer initiated
pub enum SessionEvent {
    /// The peer opened a stream
    Stream(MuxStream),
    /// The peer presented a refreshed credential
    Credential(String),
}

/// Receiver for peer-initiated events
pub struct Incoming {
    rx: mpsc::Receiver<SessionEvent>,
}

impl Incoming {
    /// Next event; `None` once the session has closed
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next peer-opened stream, skipping other events
    pub async fn accept(&mut self) -> Option<MuxStream> {
        loop {
            match self.rx.recv().await? {
                SessionEvent::Stream(stream) => return Some(stream),
                SessionEvent::Credential(_) => continue,
            }
        }
    }
}

pub(crate) struct SessionShared {
    id: u64,
    role: Role,
    config: SessionConfig,
    pub(crate) streams: DashMap<u32, StreamSlot>,
    pub(crate) outbound: mpsc::Sender<Frame>,
    next_stream_id: AtomicU32,
    cancel: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl SessionShared {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn register_stream(self: &Arc<Self>, id: u32) -> MuxStream {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer);
        let cancel = self.cancel.child_token();
        self.streams.insert(
            id,
            StreamSlot {
                tx,
                cancel: cancel.clone(),
            },
        );
        MuxStream::new(id, self.clone(), rx, cancel)
    }

    fn reset_stream(&self, id: u32) {
        if let Some((_, slot)) = self.streams.remove(&id) {
            slot.cancel.cancel();
        }
        let _ = self.outbound.try_send(Frame::reset(id));
    }

    fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            debug!(session = self.id, streams = self.streams.len(), "Session closing");
        }
        self.cancel.cancel();
        self.streams.clear();
    }
}

/// Handle to a running session
#[derive(Clone)]
pub struct MuxSession {
    shared: Arc<SessionShared>,
}

impl MuxSession {
    /// Start a session over a message transport
    ///
    /// Must be called inside a tokio runtime. Returns the handle used to open
    /// streams and the receiver for peer-initiated events.
    pub fn spawn<Si, St, E>(sink: Si, stream: St, role: Role, config: SessionConfig) -> (Self, Incoming)
    where
        Si: Sink<Bytes> + Send + Unpin + 'static,
        Si::Error: Display,
        St: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: Display + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.accept_backlog);

        let shared = Arc::new(SessionShared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            config,
            streams: DashMap::new(),
            outbound: outbound_tx,
            cancel: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });

        tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
        tokio::spawn(read_loop(stream, shared.clone(), events_tx));
        tokio::spawn(heartbeat_loop(shared.clone()));

        (Self { shared }, Incoming { rx: events_rx })
    }

    /// Two sessions connected back to back in memory: `(server, client)`
    pub fn pair(config: SessionConfig) -> ((Self, Incoming), (Self, Incoming)) {
        let (to_client, from_server) = mpsc::channel::<Bytes>(config.outbound_buffer);
        let (to_server, from_client) = mpsc::channel::<Bytes>(config.outbound_buffer);

        let server = Self::spawn(
            PollSender::new(to_client),
            ReceiverStream::new(from_client).map(Ok::<_, Infallible>),
            Role::Server,
            config.clone(),
        );
        let client = Self::spawn(
            PollSender::new(to_server),
            ReceiverStream::new(from_server).map(Ok::<_, Infallible>),
            Role::Client,
            config,
        );
        (server, client)
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Open a new stream to the peer
    pub async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let id = self.shared.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register_stream(id);
        self.shared
            .outbound
            .send(Frame::open(id))
            .await
            .map_err(|_| MuxError::SessionClosed)?;
        trace!(session = self.shared.id, stream = id, "Stream opened");
        Ok(stream)
    }

    /// Present a refreshed credential to the peer
    pub async fn send_credential(&self, token: &str) -> Result<(), MuxError> {
        self.shared
            .outbound
            .send(Frame::credential(token))
            .await
            .map_err(|_| MuxError::SessionClosed)
    }

    /// Close the session and every stream in it
    pub fn close(&self) {
        self.shared.shutdown();
    }

    /// Whether the session has closed
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the session has closed
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Token cancelled when the session closes
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// When the last frame arrived from the peer
    pub fn last_seen(&self) -> Instant {
        *self.shared.last_seen.lock()
    }

    /// Number of open streams
    pub fn active_streams(&self) -> usize {
        self.shared.streams.len()
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("streams", &self.shared.streams.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop<Si>(mut sink: Si, mut rx: mpsc::Receiver<Frame>, shared: Arc<SessionShared>)
where
    Si: Sink<Bytes> + Unpin,
    Si::Error: Display,
{
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = sink.send(frame.encode()).await {
            debug!(session = shared.id, error = %e, "Transport write failed");
            break;
        }
    }
    shared.shutdown();
    let _ = sink.close().await;
}

async fn read_loop<St, E>(
    mut stream: St,
    shared: Arc<SessionShared>,
    events: mpsc::Sender<SessionEvent>,
) where
    St: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    loop {
        let message = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let bytes = match message {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(session = shared.id, error = %e, "Transport read failed");
                break;
            }
            None => {
                debug!(session = shared.id, "Transport closed by peer");
                break;
            }
        };
        shared.touch();

        match Frame::decode(bytes) {
            Ok(frame) => dispatch(&shared, &events, frame),
            Err(e) => {
                warn!(session = shared.id, error = %e, "Protocol violation, closing session");
                break;
            }
        }
    }
    shared.shutdown();
}

fn dispatch(shared: &Arc<SessionShared>, events: &mpsc::Sender<SessionEvent>, frame: Frame) {
    let id = frame.stream_id;
    match frame.kind {
        FrameKind::Open => {
            if id == SESSION_STREAM_ID
                || shared.role.opened_by_us(id)
                || shared.streams.contains_key(&id)
            {
                warn!(session = shared.id, stream = id, "Rejecting invalid stream open");
                let _ = shared.outbound.try_send(Frame::reset(id));
                return;
            }
            let stream = shared.register_stream(id);
            if events.try_send(SessionEvent::Stream(stream)).is_err() {
                // Dropping the stream releases its slot and sends Close
                warn!(session = shared.id, stream = id, "Accept backlog full, refusing stream");
            }
        }
        FrameKind::Data => {
            let delivered = shared
                .streams
                .get(&id)
                .map(|slot| slot.tx.try_send(frame.payload));
            match delivered {
                None => {
                    trace!(session = shared.id, stream = id, "Data for unknown stream");
                    let _ = shared.outbound.try_send(Frame::reset(id));
                }
                Some(Ok(())) => {}
                Some(Err(TrySendError::Full(_))) => {
                    warn!(session = shared.id, stream = id, "Slow consumer, resetting stream");
                    shared.reset_stream(id);
                }
                Some(Err(TrySendError::Closed(_))) => shared.reset_stream(id),
            }
        }
        FrameKind::Close => {
            // Dropping the sender lets the reader drain what is buffered
            shared.streams.remove(&id);
        }
        FrameKind::Reset => {
            if let Some((_, slot)) = shared.streams.remove(&id) {
                slot.cancel.cancel();
            }
        }
        FrameKind::Ping => match frame.nonce() {
            Ok(nonce) => {
                let _ = shared.outbound.try_send(Frame::pong(nonce));
            }
            Err(e) => debug!(session = shared.id, error = %e, "Ignoring malformed ping"),
        },
        FrameKind::Pong => trace!(session = shared.id, "Heartbeat acknowledged"),
        FrameKind::Credential => match frame.token() {
            Ok(token) => {
                if events.try_send(SessionEvent::Credential(token)).is_err() {
                    warn!(session = shared.id, "Dropping credential refresh, backlog full");
                }
            }
            Err(e) => warn!(session = shared.id, error = %e, "Ignoring malformed credential"),
        },
    }
}

async fn heartbeat_loop(shared: Arc<SessionShared>) {
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let silent_for = shared.last_seen.lock().elapsed();
        if silent_for > shared.config.idle_timeout {
            warn!(
                session = shared.id,
                silent_ms = silent_for.as_millis(),
                "Heartbeat timeout, closing session"
            );
            shared.shutdown();
            break;
        }

        nonce = nonce.wrapping_add(1);
        if shared.outbound.try_send(Frame::ping(nonce)).is_err() {
            debug!(session = shared.id, "Outbound queue full, skipping ping");
        }
    }
}
