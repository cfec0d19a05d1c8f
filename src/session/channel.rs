//! Persistent, bidirectional WebSocket channel to the agent backend.
//!
//! A channel owns at most one live connection. Concurrent `connect` calls
//! share a single dial; `close` is synchronous and, once it returns, no
//! further events from the closed connection reach subscribers.
//!
//! Each connection runs two tasks: a writer draining an unbounded queue into
//! the socket, and a reader decoding text frames into [`Envelope`]s and
//! dispatching them in arrival order.

use crate::defaults;
use crate::error::{Result, VoxliveError};
use crate::session::envelope::Envelope;
use crate::session::sink::EnvelopeSink;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Dial = Shared<BoxFuture<'static, std::result::Result<ConnectionHandle, String>>>;
type Subscriber = Arc<dyn Fn(ConnectionHandle, &ChannelEvent) + Send + Sync>;

/// Identifies one established connection. Later connections compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionHandle {
    id: u64,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// How and why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub code: u16,
    pub reason: String,
    /// True only for a normal (1000) closure.
    pub clean: bool,
}

impl CloseReport {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            clean: code == defaults::NORMAL_CLOSE_CODE,
        }
    }

    /// Transport ended without a closing handshake.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(defaults::ABNORMAL_CLOSE_CODE, reason)
    }

    fn from_frame(frame: Option<CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self::new(u16::from(frame.code), frame.reason.to_string()),
            None => Self::new(defaults::NO_STATUS_CLOSE_CODE, ""),
        }
    }

    /// Reason for display, never empty.
    pub fn reason_or_unknown(&self) -> &str {
        if self.reason.is_empty() {
            "unknown reason"
        } else {
            &self.reason
        }
    }

    /// The close as a notice envelope: status when clean, error otherwise.
    pub fn notice(&self) -> Envelope {
        if self.clean {
            Envelope::StatusNotice {
                message: format!("connection closed: {}", self.reason_or_unknown()),
            }
        } else {
            Envelope::ErrorNotice {
                message: format!(
                    "connection closed (code {}): {}",
                    self.code,
                    self.reason_or_unknown()
                ),
            }
        }
    }

    pub fn to_error(&self) -> VoxliveError {
        VoxliveError::Connection {
            message: format!(
                "closed abnormally (code {}): {}",
                self.code,
                self.reason_or_unknown()
            ),
        }
    }
}

/// Events delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Inbound(Envelope),
    /// A frame that could not be decoded into an envelope.
    Malformed { reason: String },
    Closed(CloseReport),
}

struct ActiveLink {
    handle: ConnectionHandle,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

enum LinkState {
    Idle,
    Connecting(Dial),
    Open(ActiveLink),
}

#[derive(Default)]
struct Dispatcher {
    subscribers: Vec<Subscriber>,
    /// Connection whose events may still be delivered.
    live: Option<u64>,
}

struct ChannelInner {
    connect_timeout: Duration,
    next_id: AtomicU64,
    /// Bumped by every `close`; a dial started under an older epoch is stale.
    epoch: AtomicU64,
    link: Mutex<LinkState>,
    dispatcher: Mutex<Dispatcher>,
}

/// Handle to the session's WebSocket channel. Cheap to clone.
#[derive(Clone)]
pub struct SessionChannel {
    inner: Arc<ChannelInner>,
}

impl SessionChannel {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                connect_timeout,
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                link: Mutex::new(LinkState::Idle),
                dispatcher: Mutex::new(Dispatcher::default()),
            }),
        }
    }

    /// Establish the connection, or join one already in progress.
    ///
    /// Returns the existing handle when already open. Fails with a
    /// connection error on timeout, handshake rejection or when `close`
    /// runs before the dial completes.
    pub async fn connect(&self, endpoint: &str) -> Result<ConnectionHandle> {
        let dial = {
            let mut link = self.inner.link();
            match &*link {
                LinkState::Open(active) => return Ok(active.handle),
                LinkState::Connecting(dial) => dial.clone(),
                LinkState::Idle => {
                    let epoch = self.inner.epoch.load(Ordering::SeqCst);
                    let dial = dial_endpoint(Arc::clone(&self.inner), endpoint.to_string(), epoch)
                        .boxed()
                        .shared();
                    *link = LinkState::Connecting(dial.clone());
                    dial
                }
            }
        };

        dial.await
            .map_err(|message| VoxliveError::Connection { message })
    }

    /// Queue an envelope for transmission.
    ///
    /// Never blocks. Fails with a send error when no connection is open.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let text = envelope.to_json()?;
        let link = self.inner.link();
        let LinkState::Open(active) = &*link else {
            return Err(VoxliveError::Send {
                message: format!("cannot send {}: not connected", envelope.kind()),
            });
        };
        active
            .outbound
            .send(Message::Text(text))
            .map_err(|_| VoxliveError::Send {
                message: format!("cannot send {}: connection is closing", envelope.kind()),
            })
    }

    /// Register a handler for inbound envelopes and close events.
    ///
    /// Handlers run on the reader task in arrival order and must not call
    /// back into [`SessionChannel::close`].
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.subscribe_tagged(move |_, event| handler(event));
    }

    /// Like [`SessionChannel::subscribe`], also passing the connection the
    /// event came from.
    pub fn subscribe_tagged<F>(&self, handler: F)
    where
        F: Fn(ConnectionHandle, &ChannelEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher().subscribers.push(Arc::new(handler));
    }

    /// Handle the next established connection will get.
    pub fn next_handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            id: self.inner.next_id.load(Ordering::SeqCst),
        }
    }

    /// Close the connection with a normal close code.
    ///
    /// Idempotent. Also abandons a dial in progress.
    pub fn close(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.dispatcher().live = None;

        let previous = std::mem::replace(&mut *self.inner.link(), LinkState::Idle);
        match previous {
            LinkState::Open(active) => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closed".into(),
                };
                active.outbound.send(Message::Close(Some(frame))).ok();
                active.reader.abort();
                info!(connection = active.handle.id, "connection closed by client");
            }
            LinkState::Connecting(_) => debug!("abandoned dial in progress"),
            LinkState::Idle => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.link(), LinkState::Open(_))
    }
}

impl EnvelopeSink for SessionChannel {
    fn send(&self, envelope: Envelope) -> Result<()> {
        SessionChannel::send(self, envelope)
    }
}

impl ChannelInner {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Deliver an event if `id` is still the live connection.
    fn dispatch(&self, id: u64, event: &ChannelEvent) {
        let dispatcher = self.dispatcher();
        if dispatcher.live != Some(id) {
            return;
        }
        let handle = ConnectionHandle { id };
        for subscriber in &dispatcher.subscribers {
            subscriber(handle, event);
        }
    }

    fn abandon(&self, epoch: u64) {
        let mut link = self.link();
        if self.is_current(epoch) && matches!(&*link, LinkState::Connecting(_)) {
            *link = LinkState::Idle;
        }
    }

    /// Promote a freshly dialled stream to the open link.
    fn install(
        self: &Arc<Self>,
        stream: WsStream,
        epoch: u64,
    ) -> std::result::Result<ConnectionHandle, String> {
        let mut link = self.link();
        if !self.is_current(epoch) {
            drop(link);
            tokio::spawn(async move {
                let mut stream = stream;
                stream.close(None).await.ok();
            });
            return Err("connection closed while connecting".to_string());
        }

        let handle = ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        let (mut sink, source) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "writer stopped");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        self.dispatcher().live = Some(handle.id);
        let reader = tokio::spawn(read_loop(Arc::clone(self), handle.id, source));

        *link = LinkState::Open(ActiveLink {
            handle,
            outbound,
            reader,
        });
        Ok(handle)
    }

    /// The reader for `id` ended: drop the link and emit the close event.
    fn finish(&self, id: u64, report: CloseReport) {
        {
            let mut link = self.link();
            if matches!(&*link, LinkState::Open(active) if active.handle.id == id) {
                *link = LinkState::Idle;
            }
        }

        if report.clean {
            info!(connection = id, code = report.code, "connection closed");
        } else {
            warn!(
                connection = id,
                code = report.code,
                reason = report.reason_or_unknown(),
                "connection closed abnormally"
            );
        }

        self.dispatch(id, &ChannelEvent::Closed(report));
        let mut dispatcher = self.dispatcher();
        if dispatcher.live == Some(id) {
            dispatcher.live = None;
        }
    }
}

async fn dial_endpoint(
    inner: Arc<ChannelInner>,
    endpoint: String,
    epoch: u64,
) -> std::result::Result<ConnectionHandle, String> {
    debug!(endpoint = %endpoint, "connecting");
    let attempt = tokio::time::timeout(inner.connect_timeout, connect_async(endpoint.as_str())).await;

    let failure = match attempt {
        Ok(Ok((stream, _response))) => {
            let handle = inner.install(stream, epoch)?;
            info!(endpoint = %endpoint, connection = handle.id, "connected");
            return Ok(handle);
        }
        Ok(Err(e)) => describe_failure(&endpoint, e),
        Err(_) => format!(
            "timed out after {}ms connecting to {}",
            inner.connect_timeout.as_millis(),
            endpoint
        ),
    };

    inner.abandon(epoch);
    warn!(endpoint = %endpoint, error = %failure, "connect failed");
    Err(failure)
}

fn describe_failure(endpoint: &str, error: tungstenite::Error) -> String {
    match error {
        tungstenite::Error::Http(response) => format!(
            "handshake with {} rejected with HTTP {}",
            endpoint,
            response.status()
        ),
        tungstenite::Error::Url(e) => format!("invalid endpoint {}: {}", endpoint, e),
        tungstenite::Error::Io(e) => format!("cannot reach {}: {}", endpoint, e),
        other => format!("handshake with {} failed: {}", endpoint, other),
    }
}

async fn read_loop(inner: Arc<ChannelInner>, id: u64, mut source: SplitStream<WsStream>) {
    let report = loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => match Envelope::from_json(&text) {
                Ok(envelope) => inner.dispatch(id, &ChannelEvent::Inbound(envelope)),
                Err(e) => inner.dispatch(
                    id,
                    &ChannelEvent::Malformed {
                        reason: e.to_string(),
                    },
                ),
            },
            Some(Ok(Message::Binary(bytes))) => inner.dispatch(
                id,
                &ChannelEvent::Malformed {
                    reason: format!("unexpected binary frame ({} bytes)", bytes.len()),
                },
            ),
            Some(Ok(Message::Close(frame))) => break CloseReport::from_frame(frame),
            // Ping and pong are answered by the protocol layer.
            Some(Ok(_)) => {}
            Some(Err(e)) => break CloseReport::abnormal(e.to_string()),
            None => break CloseReport::abnormal("connection ended without close frame"),
        }
    };
    inner.finish(id, report);
}
