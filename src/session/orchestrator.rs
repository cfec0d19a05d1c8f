//! Session composition root.
//!
//! Owns the channel, the capture and playback controllers and the
//! observable session state. Inbound envelopes are routed here; capture
//! writes straight into the channel.

use crate::audio::codec::AudioFormat;
use crate::audio::device::DeviceProvider;
use crate::config::Config;
use crate::defaults;
use crate::error::{LastError, Result, VoxliveError};
use crate::session::capture::{CaptureController, CaptureSettings, RecordingState};
use crate::session::channel::{ChannelEvent, CloseReport, ConnectionHandle, SessionChannel};
use crate::session::envelope::{ContextSummary, Envelope};
use crate::session::playback::PlaybackController;
use crate::session::report::{SessionReporter, StatusReporter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMPONENT: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// User-initiated close in progress.
    Closing,
}

/// A live voice session with the agent backend.
///
/// Requires a Tokio runtime at construction. Dropping the orchestrator
/// closes the session.
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    config: Config,
    channel: SessionChannel,
    capture: CaptureController,
    playback: PlaybackController,
    reporter: Arc<SessionReporter>,
    state: watch::Sender<SessionState>,
    last_error: Arc<watch::Sender<Option<LastError>>>,
    last_status: Mutex<Option<String>>,
    context: Mutex<Option<ContextSummary>>,
    user_closed: AtomicBool,
    /// Events from connections older than this were closed by the user.
    accept_from: Mutex<ConnectionHandle>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(config: Config, provider: Arc<dyn DeviceProvider>) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            VoxliveError::Other("a live session must be created inside a Tokio runtime".to_string())
        })?;

        let last_error = Arc::new(watch::Sender::new(None));
        let reporter = Arc::new(SessionReporter::new(Arc::clone(&last_error)));
        let channel = SessionChannel::new(config.session.connect_timeout());
        let capture = CaptureController::new(
            Arc::clone(&provider),
            Arc::new(channel.clone()),
            reporter.clone(),
            CaptureSettings::from(&config.capture),
        );
        let playback = PlaybackController::new(provider, reporter.clone(), &config.playback)?;

        let (events_tx, mut events_rx) =
            mpsc::unbounded_channel::<(ConnectionHandle, ChannelEvent)>();
        channel.subscribe_tagged(move |handle, event| {
            events_tx.send((handle, event.clone())).ok();
        });
        let accept_from = Mutex::new(channel.next_handle());

        let inner = Arc::new(OrchestratorInner {
            config,
            channel,
            capture,
            playback,
            reporter,
            state: watch::Sender::new(SessionState::Disconnected),
            last_error,
            last_status: Mutex::new(None),
            context: Mutex::new(None),
            user_closed: AtomicBool::new(false),
            accept_from,
            reconnect: Mutex::new(None),
            events: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let events = runtime.spawn(async move {
            while let Some((handle, event)) = events_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle_event(handle, event);
            }
        });
        *lock(&inner.events) = Some(events);

        Ok(Self { inner })
    }

    /// Connect to the configured endpoint.
    ///
    /// Resolves once the handshake completes; the context primer, if any,
    /// is sent right after. Calling while connected is a no-op.
    pub async fn connect(&self) -> Result<()> {
        self.inner.user_closed.store(false, Ordering::SeqCst);
        self.inner.establish().await
    }

    /// Close the session. Idempotent; never fails.
    ///
    /// Cancels any recording without a turn end, drops queued playback and
    /// disables automatic reconnection until the next `connect`.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Begin streaming microphone audio. Requires an open session.
    pub fn start_recording(&self) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(VoxliveError::NotConnected);
        }
        self.inner.capture.start()
    }

    /// End the user's turn.
    pub fn stop_recording(&self) -> Result<()> {
        self.inner.capture.stop()
    }

    /// Start when idle, stop when recording. Returns the state after the call.
    pub fn toggle_recording(&self) -> Result<RecordingState> {
        match self.inner.capture.state() {
            RecordingState::Idle => self.start_recording()?,
            RecordingState::Recording | RecordingState::Stopping => self.stop_recording()?,
        }
        Ok(self.inner.capture.state())
    }

    /// Set the context primer. Sent on every (re)connect, and immediately
    /// when the session is already open.
    pub fn set_context(&self, summary: ContextSummary) {
        *lock(&self.inner.context) = Some(summary);
        if self.connected() {
            self.inner.send_primer();
        }
    }

    pub fn clear_context(&self) {
        *lock(&self.inner.context) = None;
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn recording(&self) -> bool {
        self.inner.capture.is_recording()
    }

    pub fn recording_state(&self) -> RecordingState {
        self.inner.capture.state()
    }

    pub fn speaking(&self) -> bool {
        self.inner.playback.is_speaking()
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.inner.last_error.borrow().clone()
    }

    /// Most recent status notice from the server.
    pub fn last_status(&self) -> Option<String> {
        lock(&self.inner.last_status).clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn watch_recording(&self) -> watch::Receiver<RecordingState> {
        self.inner.capture.watch()
    }

    pub fn watch_speaking(&self) -> watch::Receiver<bool> {
        self.inner.playback.watch()
    }

    pub fn watch_last_error(&self) -> watch::Receiver<Option<LastError>> {
        self.inner.last_error.subscribe()
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.inner.close();
        if let Some(events) = lock(&self.inner.events).take() {
            events.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OrchestratorInner {
    async fn establish(&self) -> Result<()> {
        let mut previous = SessionState::Disconnected;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        match previous {
            SessionState::Connected => return Ok(()),
            SessionState::Closing => {
                return Err(VoxliveError::Connection {
                    message: "session is closing".to_string(),
                });
            }
            SessionState::Disconnected | SessionState::Connecting => {}
        }

        let endpoint = &self.config.session.endpoint;
        if let Err(e) = self.channel.connect(endpoint).await {
            self.state.send_if_modified(|state| {
                if *state == SessionState::Connecting {
                    *state = SessionState::Disconnected;
                    true
                } else {
                    false
                }
            });
            self.reporter.report(COMPONENT, &e);
            return Err(e);
        }

        // The link may already be gone if the server closed right after the
        // handshake or the user closed the session meanwhile.
        let promoted = self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting && self.channel.is_connected() {
                *state = SessionState::Connected;
                true
            } else {
                false
            }
        });

        if promoted {
            info!(endpoint = %endpoint, "session connected");
            self.send_primer();
            return Ok(());
        }

        let mut current = SessionState::Disconnected;
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Disconnected;
                true
            } else {
                current = *state;
                false
            }
        });
        if current == SessionState::Connected {
            return Ok(());
        }
        Err(VoxliveError::Connection {
            message: "connection closed during handshake".to_string(),
        })
    }

    fn close(&self) {
        self.user_closed.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.reconnect).take() {
            task.abort();
        }

        let was_open = self.state.send_if_modified(|state| {
            if *state == SessionState::Disconnected {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });

        self.capture.cancel();
        self.channel.close();
        *lock(&self.accept_from) = self.channel.next_handle();
        self.playback.clear();

        if was_open {
            self.state.send_replace(SessionState::Disconnected);
            info!("session closed");
        }
    }

    fn send_primer(&self) {
        let Some(summary) = lock(&self.context).clone() else {
            return;
        };
        let violations = summary.top_violations.len();
        match self.channel.send(summary.into_envelope()) {
            Ok(()) => info!(violations, "sent context primer"),
            Err(e) => self.reporter.report(COMPONENT, &e),
        }
    }

    fn handle_event(self: &Arc<Self>, handle: ConnectionHandle, event: ChannelEvent) {
        if handle < *lock(&self.accept_from) {
            debug!(connection = handle.id(), "dropping event from a closed connection");
            return;
        }
        match event {
            ChannelEvent::Inbound(envelope) => self.handle_inbound(envelope),
            ChannelEvent::Malformed { reason } => self
                .reporter
                .report(COMPONENT, &VoxliveError::Protocol { message: reason }),
            ChannelEvent::Closed(report) => self.handle_closed(report),
        }
    }

    fn handle_inbound(&self, envelope: Envelope) {
        // Holding the state read guard keeps `close` from slipping between
        // the check and the enqueue below.
        let state = self.state.borrow();
        if !matches!(*state, SessionState::Connected | SessionState::Connecting) {
            debug!(kind = envelope.kind(), "dropping envelope received after close");
            return;
        }

        match envelope {
            Envelope::AudioChunk { data, format, .. } => {
                let format = self.resolve_format(format.as_deref());
                self.playback.enqueue(data, format);
            }
            Envelope::StatusNotice { message } => {
                info!(status = %message, "server status");
                *lock(&self.last_status) = Some(message);
            }
            Envelope::LogNotice { message } => debug!(message = %message, "server log"),
            Envelope::ErrorNotice { message } => self
                .reporter
                .report(COMPONENT, &VoxliveError::Remote { message }),
            other => self.reporter.report(
                COMPONENT,
                &VoxliveError::Protocol {
                    message: format!("unexpected inbound {} envelope", other.kind()),
                },
            ),
        }
    }

    /// Inbound format descriptor, falling back to the default on absence or error.
    fn resolve_format(&self, descriptor: Option<&str>) -> AudioFormat {
        let Some(descriptor) = descriptor else {
            return AudioFormat::default();
        };
        match descriptor.parse::<AudioFormat>() {
            Ok(format) => format,
            Err(e) => {
                self.reporter.report(COMPONENT, &e);
                AudioFormat::default()
            }
        }
    }

    fn handle_closed(self: &Arc<Self>, report: CloseReport) {
        let dropped = self.state.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = SessionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !dropped {
            return;
        }

        // A recording cannot outlive its connection; no turn end is sent.
        self.capture.cancel();

        if report.clean {
            info!(reason = report.reason_or_unknown(), "server closed the session");
            if let Envelope::StatusNotice { message } = report.notice() {
                *lock(&self.last_status) = Some(message);
            }
            return;
        }

        self.reporter.report(COMPONENT, &report.to_error());
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.config.session.reconnect_attempts;
        if attempts == 0 || self.user_closed.load(Ordering::SeqCst) {
            return;
        }

        let base_ms = self.config.session.reconnect_backoff_ms;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            for attempt in 1..=attempts {
                let delay = defaults::reconnect_delay_ms(base_ms, attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.user_closed.load(Ordering::SeqCst) {
                    return;
                }
                info!(attempt, attempts, delay_ms = delay, "reconnecting");
                if inner.establish().await.is_ok() {
                    return;
                }
            }
            warn!(attempts, "giving up on reconnecting");
        });

        if let Some(previous) = lock(&self.reconnect).replace(task) {
            previous.abort();
        }
    }
}
