//! Capture session controller
//!
//! A [`CaptureController`] owns at most one session at a time. A session moves
//! through `Idle -> Capturing -> Streaming`, drops into `Reconnecting` when the
//! connection ends unexpectedly and always returns to `Idle` through
//! [`CaptureController::stop`].
//!
//! Every timer, the reconnect task and the per-connection dispatch task hold a
//! weak reference to the controller and check the session id before touching
//! it, so a task that outlives its session finds nothing to act on. Operations
//! that await (opening the camera, dialing the peer) re-check a stop epoch
//! after the await and undo their own work if a stop happened in between.

use crate::config::SessionConfig;
use crate::dispatch::{Inbound, MessageDispatcher};
use crate::event::{SessionEvent, SessionState, TeardownReport, TeardownStep};
use crate::results::{AnalysisResult, ResultLog};
use chrono::{DateTime, Utc};
use framelink_core::{
    CloseCode, Connection, Connector, Established, FramelinkError, FramelinkResult, MessageKind,
    OutboundMessage, TransportEvent, WebSocketConnector,
};
use framelink_diagnostics::{DiagnosticCategory, DiagnosticLog, DEFAULT_DIAGNOSTIC_CAPACITY};
use framelink_media::{
    platform_device_factory, CaptureDevice, DeviceFactory, FrameEncoder, RawFrame,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};
use uuid::Uuid;

/// Close reason sent when the local side ends the session
const STOP_REASON: &str = "session stopped";

/// Point-in-time view of the running session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    /// Session identifier
    pub session_id: Uuid,
    /// Current state
    pub state: SessionState,
    /// Wall-clock start time
    pub started_at: DateTime<Utc>,
    /// Time since the camera was opened
    pub elapsed: Duration,
    /// Sequence number of the last frame sent
    pub frame_sequence: u64,
    /// Frames handed to the connection
    pub frames_sent: u64,
    /// Ticks that found no open connection
    pub frames_skipped: u64,
    /// Ticks that failed to capture, encode or send
    pub frames_failed: u64,
    /// Frames sent per second over the whole session
    pub average_fps: f64,
    /// When the last result arrived
    pub last_result_at: Option<DateTime<Utc>>,
    /// Reconnect attempts since the connection was last healthy
    pub reconnect_attempts: u32,
    /// Peer the session streams to
    pub endpoint: Option<String>,
    /// Whether a connection is currently installed
    pub connected: bool,
}

struct Link {
    id: u64,
    connection: Arc<dyn Connection>,
    dispatch: JoinHandle<()>,
}

struct Session {
    id: Uuid,
    span: Span,
    device: Arc<dyn CaptureDevice>,
    link: Option<Link>,
    endpoint: Option<String>,
    frame_timer: Option<JoinHandle<()>>,
    keep_alive_timer: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    frame_sequence: u64,
    started_at: DateTime<Utc>,
    started: Instant,
    last_result_at: Option<DateTime<Utc>>,
    frames_sent: u64,
    frames_skipped: u64,
    frames_failed: u64,
    reconnect_attempts: u32,
    next_link_id: u64,
}

impl Session {
    fn new(device: Arc<dyn CaptureDevice>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            span: info_span!("session", id = %id),
            device,
            link: None,
            endpoint: None,
            frame_timer: None,
            keep_alive_timer: None,
            reconnect_timer: None,
            frame_sequence: 0,
            started_at: Utc::now(),
            started: Instant::now(),
            last_result_at: None,
            frames_sent: 0,
            frames_skipped: 0,
            frames_failed: 0,
            reconnect_attempts: 0,
            next_link_id: 0,
        }
    }

    fn open_connection(&self) -> Option<Arc<dyn Connection>> {
        self.link
            .as_ref()
            .filter(|link| link.connection.is_open())
            .map(|link| link.connection.clone())
    }

    fn stats(&self, state: SessionState) -> SessionStats {
        let elapsed = self.started.elapsed();
        let seconds = elapsed.as_secs_f64();
        SessionStats {
            session_id: self.id,
            state,
            started_at: self.started_at,
            elapsed,
            frame_sequence: self.frame_sequence,
            frames_sent: self.frames_sent,
            frames_skipped: self.frames_skipped,
            frames_failed: self.frames_failed,
            average_fps: if seconds > 0.0 {
                self.frames_sent as f64 / seconds
            } else {
                0.0
            },
            last_result_at: self.last_result_at,
            reconnect_attempts: self.reconnect_attempts,
            endpoint: self.endpoint.clone(),
            connected: self.link.is_some(),
        }
    }
}

#[derive(Default)]
struct Slot {
    state: SessionState,
    session: Option<Session>,
}

struct Inner {
    config: SessionConfig,
    devices: Arc<dyn DeviceFactory>,
    connector: Arc<dyn Connector>,
    encoder: FrameEncoder,
    /// Bumped by every teardown
    epoch: AtomicU64,
    /// Serializes start, connect and reconnect; stop never waits on it
    op_lock: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    dispatcher: MessageDispatcher,
    results: ResultLog,
    diagnostics: DiagnosticLog,
    events: broadcast::Sender<SessionEvent>,
}

/// Drives one camera-to-peer streaming session at a time
///
/// Cloning is cheap and every clone controls the same session.
///
/// # Example
///
/// ```no_run
/// use framelink::{CaptureController, SessionConfig};
///
/// # async fn example() -> framelink::FramelinkResult<()> {
/// let controller = CaptureController::with_defaults(SessionConfig::default())?;
/// controller.start().await?;
/// controller.connect("ws://localhost:8000/ws").await?;
///
/// tokio::time::sleep(std::time::Duration::from_secs(10)).await;
/// if let Some(result) = controller.results().latest() {
///     println!("{:?}", result.message);
/// }
///
/// controller.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CaptureController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CaptureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("CaptureController")
            .field("state", &slot.state)
            .field("session_id", &slot.session.as_ref().map(|s| s.id))
            .field("endpoint", &self.inner.config.endpoint)
            .finish()
    }
}

impl CaptureController {
    /// Create a controller over the given camera backend and transport
    pub fn new(
        config: SessionConfig,
        devices: Arc<dyn DeviceFactory>,
        connector: Arc<dyn Connector>,
    ) -> FramelinkResult<Self> {
        config.validate()?;
        let encoder = FrameEncoder::new(config.jpeg_quality)?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            inner: Arc::new(Inner {
                results: ResultLog::new(config.result_history),
                diagnostics: DiagnosticLog::new(DEFAULT_DIAGNOSTIC_CAPACITY),
                dispatcher: MessageDispatcher::new(),
                epoch: AtomicU64::new(0),
                op_lock: tokio::sync::Mutex::new(()),
                slot: Mutex::new(Slot::default()),
                config,
                devices,
                connector,
                encoder,
                events,
            }),
        })
    }

    /// Create a controller with the platform camera backend and WebSocket transport
    pub fn with_defaults(config: SessionConfig) -> FramelinkResult<Self> {
        Self::new(
            config,
            platform_device_factory(),
            Arc::new(WebSocketConnector::new()),
        )
    }

    /// Configuration the controller was built with
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.inner.slot.lock().state
    }

    /// Whether a session exists
    pub fn is_active(&self) -> bool {
        self.inner.slot.lock().session.is_some()
    }

    /// Identifier of the running session
    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.slot.lock().session.as_ref().map(|s| s.id)
    }

    /// Sequence number of the last frame sent, zero before the first
    pub fn frame_sequence(&self) -> u64 {
        self.inner
            .slot
            .lock()
            .session
            .as_ref()
            .map_or(0, |s| s.frame_sequence)
    }

    /// Counters for the running session
    pub fn stats(&self) -> Option<SessionStats> {
        let slot = self.inner.slot.lock();
        slot.session.as_ref().map(|s| s.stats(slot.state))
    }

    /// Results received from the peer, newest first
    ///
    /// The log outlives sessions; call [`ResultLog::clear`] to reset it.
    pub fn results(&self) -> &ResultLog {
        &self.inner.results
    }

    /// Non-fatal problems seen so far
    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.inner.diagnostics
    }

    /// Subscribe to session events
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Run `handler` for every result of `kind`
    pub fn on_message<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&AnalysisResult) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(kind, handler);
    }

    /// Open the camera and create a session
    ///
    /// Fails with `InvalidState` unless idle. If [`stop`](Self::stop) runs
    /// while the camera is being opened, the camera is released again and
    /// `Cancelled` is returned.
    pub async fn start(&self) -> FramelinkResult<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let epoch = inner.epoch.load(Ordering::SeqCst);
        {
            let state = inner.slot.lock().state;
            if state != SessionState::Idle {
                return Err(invalid_state("idle", state));
            }
        }

        let device = match inner.devices.open(&inner.config.constraints).await {
            Ok(device) => device,
            Err(e) => {
                let error = FramelinkError::from(e);
                warn!(error = %error, "failed to open capture device");
                inner.diagnostics.record_error(&error);
                return Err(error);
            }
        };

        let started = {
            let mut slot = inner.slot.lock();
            if inner.epoch.load(Ordering::SeqCst) == epoch && slot.state == SessionState::Idle {
                let session = Session::new(device.clone());
                let session_id = session.id;
                info!(
                    parent: &session.span,
                    device = %device.info().name,
                    resolution = %device.resolution(),
                    "capture started"
                );
                slot.session = Some(session);
                inner.emit(SessionEvent::Started { session_id });
                inner.transition(&mut slot.state, SessionState::Capturing);
                true
            } else {
                false
            }
        };

        if started {
            Ok(())
        } else {
            debug!("session stopped while the camera was opening");
            if let Err(e) = device.stop().await {
                warn!(error = %e, "failed to release camera after cancelled start");
            }
            Err(FramelinkError::Cancelled)
        }
    }

    /// Connect the running session to an analysis peer and start streaming
    ///
    /// On failure the session stays `Capturing` with no timers running.
    pub async fn connect(&self, endpoint: &str) -> FramelinkResult<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let epoch = inner.epoch.load(Ordering::SeqCst);
        let span = {
            let slot = inner.slot.lock();
            match (&slot.session, slot.state) {
                (Some(session), SessionState::Capturing) => session.span.clone(),
                (_, state) => return Err(invalid_state("capturing", state)),
            }
        };

        info!(parent: &span, endpoint, "connecting to analysis peer");
        let established = match inner.open_link(endpoint).await {
            Ok(established) => established,
            Err(error) => {
                warn!(parent: &span, error = %error, "connection failed");
                inner.diagnostics.record_error(&error);
                return Err(error);
            }
        };

        let stale = {
            let mut slot = inner.slot.lock();
            let Slot { state, session } = &mut *slot;
            match session.as_mut() {
                Some(session)
                    if *state == SessionState::Capturing
                        && inner.epoch.load(Ordering::SeqCst) == epoch =>
                {
                    inner.install_link(session, established);
                    session.endpoint = Some(endpoint.to_string());
                    session.reconnect_attempts = 0;
                    inner.start_timers(session);
                    info!(parent: &session.span, endpoint, "streaming started");
                    inner.emit(SessionEvent::Connected {
                        endpoint: endpoint.to_string(),
                    });
                    inner.transition(state, SessionState::Streaming);
                    None
                }
                _ => Some(established.connection),
            }
        };

        match stale {
            None => Ok(()),
            Some(connection) => {
                debug!(parent: &span, "session stopped while connecting");
                let _ = connection.close(CloseCode::NORMAL, STOP_REASON).await;
                Err(FramelinkError::Cancelled)
            }
        }
    }

    /// Sample the live camera for local display
    ///
    /// Available whenever a session exists; the frame is not sent and does
    /// not count towards the frame sequence.
    pub async fn preview_frame(&self) -> FramelinkResult<RawFrame> {
        let device = {
            let slot = self.inner.slot.lock();
            match &slot.session {
                Some(session) => session.device.clone(),
                None => return Err(invalid_state("capturing or streaming", slot.state)),
            }
        };
        Ok(device.grab_frame().await?)
    }

    /// Start or restart the frame loop at a new cadence
    pub fn begin_frame_loop(&self, interval: Duration) -> FramelinkResult<()> {
        if interval.is_zero() {
            return Err(FramelinkError::InvalidConfiguration {
                message: "frame interval must be greater than zero".to_string(),
            });
        }
        let mut slot = self.inner.slot.lock();
        let state = slot.state;
        let session = slot
            .session
            .as_mut()
            .ok_or_else(|| invalid_state("capturing or streaming", state))?;
        let timer = self.inner.spawn_frame_timer(session, interval);
        replace_timer(&mut session.frame_timer, timer);
        debug!(parent: &session.span, interval = ?interval, "frame loop started");
        Ok(())
    }

    /// Start or restart the keep-alive loop at a new cadence
    pub fn begin_keep_alive(&self, interval: Duration) -> FramelinkResult<()> {
        if interval.is_zero() {
            return Err(FramelinkError::InvalidConfiguration {
                message: "keep-alive interval must be greater than zero".to_string(),
            });
        }
        let mut slot = self.inner.slot.lock();
        let state = slot.state;
        let session = slot
            .session
            .as_mut()
            .ok_or_else(|| invalid_state("capturing or streaming", state))?;
        let timer = self.inner.spawn_keep_alive(session, interval);
        replace_timer(&mut session.keep_alive_timer, timer);
        debug!(parent: &session.span, interval = ?interval, "keep-alive started");
        Ok(())
    }

    /// Tear the session down and return to `Idle`
    ///
    /// Stops the frame timer, the keep-alive timer and any pending reconnect,
    /// closes the connection with the normal closure code and releases the
    /// camera, in that order. Calling it with no session does nothing.
    pub async fn stop(&self) -> TeardownReport {
        self.inner.shutdown().await
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn transition(&self, state: &mut SessionState, to: SessionState) {
        let from = std::mem::replace(state, to);
        if from != to {
            debug!(%from, %to, "session state changed");
            self.emit(SessionEvent::StateChanged { from, to });
        }
    }

    async fn open_link(&self, endpoint: &str) -> FramelinkResult<Established> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.connector.connect(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(FramelinkError::ConnectionTimeout {
                endpoint: endpoint.to_string(),
                duration: timeout,
            }),
        }
    }

    fn install_link(self: &Arc<Self>, session: &mut Session, established: Established) {
        session.next_link_id += 1;
        let link_id = session.next_link_id;
        let dispatch = self.spawn_dispatch(session, link_id, established.events);
        let link = Link {
            id: link_id,
            connection: established.connection,
            dispatch,
        };
        if let Some(old) = session.link.replace(link) {
            old.dispatch.abort();
        }
    }

    fn start_timers(self: &Arc<Self>, session: &mut Session) {
        if session.frame_timer.is_none() {
            let timer = self.spawn_frame_timer(session, self.config.frame_interval);
            session.frame_timer = Some(timer);
        }
        if session.keep_alive_timer.is_none() {
            let timer = self.spawn_keep_alive(session, self.config.keep_alive_interval);
            session.keep_alive_timer = Some(timer);
        }
    }

    fn spawn_frame_timer(self: &Arc<Self>, session: &Session, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let session_id = session.id;
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(inner) => inner.emit_frame(session_id).await,
                        None => break,
                    }
                }
            }
            .instrument(session.span.clone()),
        )
    }

    fn spawn_keep_alive(self: &Arc<Self>, session: &Session, period: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let session_id = session.id;
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(inner) => inner.send_keep_alive(session_id).await,
                        None => break,
                    }
                }
            }
            .instrument(session.span.clone()),
        )
    }

    /// One frame tick: capture, encode and send if the connection is open
    async fn emit_frame(&self, session_id: Uuid) {
        let (device, connection) = {
            let mut slot = self.slot.lock();
            let Some(session) = slot.session.as_mut().filter(|s| s.id == session_id) else {
                return;
            };
            match session.open_connection() {
                Some(connection) => (session.device.clone(), connection),
                None => {
                    session.frames_skipped += 1;
                    trace!("no open connection, frame skipped");
                    return;
                }
            }
        };

        match self.transmit_frame(device.as_ref(), connection.as_ref()).await {
            Ok(Some(bytes)) => {
                let mut slot = self.slot.lock();
                if let Some(session) = slot.session.as_mut().filter(|s| s.id == session_id) {
                    session.frame_sequence += 1;
                    session.frames_sent += 1;
                    let sequence = session.frame_sequence;
                    trace!(sequence, bytes, "frame sent");
                    self.emit(SessionEvent::FrameSent { sequence, bytes });
                }
            }
            Ok(None) => {
                let mut slot = self.slot.lock();
                if let Some(session) = slot.session.as_mut().filter(|s| s.id == session_id) {
                    session.frames_skipped += 1;
                }
                trace!("connection closed during capture, frame skipped");
            }
            Err(error) => {
                warn!(error = %error, "frame transmission failed");
                self.diagnostics.record_error(&error);
                {
                    let mut slot = self.slot.lock();
                    if let Some(session) = slot.session.as_mut().filter(|s| s.id == session_id) {
                        session.frames_failed += 1;
                    }
                }
                self.emit(SessionEvent::FrameFailed {
                    reason: error.to_string(),
                });
            }
        }
    }

    /// Returns the encoded size, or `None` if the connection closed meanwhile
    async fn transmit_frame(
        &self,
        device: &dyn CaptureDevice,
        connection: &dyn Connection,
    ) -> FramelinkResult<Option<usize>> {
        let frame = device.grab_frame().await?;
        let encoded = self.encoder.encode(&frame)?;
        if !connection.is_open() {
            return Ok(None);
        }

        let message = OutboundMessage::Frame {
            data_url: encoded.to_data_url(),
        };
        connection
            .send_text(message.to_text(self.config.frame_envelope))
            .await?;
        Ok(Some(encoded.len()))
    }

    async fn send_keep_alive(&self, session_id: Uuid) {
        let connection = {
            let slot = self.slot.lock();
            slot.session
                .as_ref()
                .filter(|s| s.id == session_id)
                .and_then(Session::open_connection)
        };
        let Some(connection) = connection else {
            return;
        };

        let ping = OutboundMessage::Ping.to_text(self.config.frame_envelope);
        match connection.send_text(ping).await {
            Ok(()) => trace!("keep-alive ping sent"),
            Err(error) => {
                warn!(error = %error, "keep-alive ping failed");
                self.diagnostics.record_error(&error);
            }
        }
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        session: &Session,
        link_id: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let session_id = session.id;
        tokio::spawn(
            async move {
                let (code, reason) = loop {
                    let Some(event) = events.recv().await else {
                        break (CloseCode::ABNORMAL, "transport ended without a close".to_string());
                    };
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match event {
                        TransportEvent::Text(text) => {
                            inner.handle_text(session_id, link_id, &text).await
                        }
                        TransportEvent::Binary(data) => {
                            debug!(bytes = data.len(), "ignoring binary message");
                            inner.diagnostics.record(
                                DiagnosticCategory::MalformedMessage,
                                format!("unexpected binary message of {} bytes", data.len()),
                            );
                        }
                        TransportEvent::Closed { code, reason } => break (code, reason),
                    }
                };
                if let Some(inner) = weak.upgrade() {
                    inner.handle_closed(session_id, link_id, code, reason).await;
                }
            }
            .instrument(session.span.clone()),
        )
    }

    async fn handle_text(&self, session_id: Uuid, link_id: u64, text: &str) {
        match Inbound::classify(text) {
            Inbound::Result(result) => self.record_result(session_id, link_id, result),
            Inbound::Ping => {
                let connection = {
                    let slot = self.slot.lock();
                    slot.session
                        .as_ref()
                        .filter(|s| s.id == session_id)
                        .and_then(|s| s.link.as_ref())
                        .filter(|link| link.id == link_id)
                        .map(|link| link.connection.clone())
                };
                if let Some(connection) = connection {
                    let pong = OutboundMessage::Pong.to_text(self.config.frame_envelope);
                    match connection.send_text(pong).await {
                        Ok(()) => trace!("answered peer ping"),
                        Err(error) => {
                            warn!(error = %error, "failed to answer peer ping");
                            self.diagnostics.record_error(&error);
                        }
                    }
                }
            }
            Inbound::Unknown { kind } => {
                warn!(kind = %kind, "ignoring message of unknown kind");
                self.diagnostics.record(
                    DiagnosticCategory::UnknownMessageKind,
                    format!("unknown message kind {:?}", kind),
                );
            }
            Inbound::Malformed(error) => {
                warn!(error = %error, "ignoring malformed message");
                self.diagnostics
                    .record(DiagnosticCategory::MalformedMessage, error.to_string());
            }
        }
    }

    fn record_result(&self, session_id: Uuid, link_id: u64, result: AnalysisResult) {
        {
            let mut slot = self.slot.lock();
            let current = slot
                .session
                .as_mut()
                .filter(|s| s.id == session_id)
                .filter(|s| s.link.as_ref().map(|link| link.id) == Some(link_id));
            match current {
                Some(session) => {
                    session.last_result_at = Some(result.received_at);
                    // An analysis reply means frames made the round trip
                    if result.kind == MessageKind::Analysis {
                        session.reconnect_attempts = 0;
                    }
                }
                None => return,
            }
        }

        debug!(kind = %result.kind, frame = ?result.frame_number, "result received");
        // Keep-alive replies are not worth displacing real results
        if result.kind != MessageKind::Pong {
            self.results.push(result.clone());
        }
        self.dispatcher.dispatch(&result);
        self.emit(SessionEvent::ResultReceived(result));
    }

    async fn handle_closed(
        self: &Arc<Self>,
        session_id: Uuid,
        link_id: u64,
        code: CloseCode,
        reason: String,
    ) {
        let exhausted = self.on_link_closed(session_id, link_id, code, reason);
        if let Some((attempts, endpoint)) = exhausted {
            self.give_up(attempts, &endpoint).await;
        }
    }

    /// Returns the attempt count and endpoint when the reconnect budget is spent
    fn on_link_closed(
        self: &Arc<Self>,
        session_id: Uuid,
        link_id: u64,
        code: CloseCode,
        reason: String,
    ) -> Option<(u32, String)> {
        let mut slot = self.slot.lock();
        let Slot { state, session } = &mut *slot;
        let session = session.as_mut().filter(|s| s.id == session_id)?;
        if session.link.as_ref().map(|link| link.id) != Some(link_id) {
            return None;
        }
        // This runs on the link's own dispatch task, so the handle is dropped
        // rather than aborted.
        session.link = None;
        self.emit(SessionEvent::Disconnected {
            code: code.0,
            reason: reason.clone(),
        });

        if code.is_normal() {
            info!(%code, reason = %reason, "peer closed the connection");
            for timer in [session.frame_timer.take(), session.keep_alive_timer.take()]
                .into_iter()
                .flatten()
            {
                timer.abort();
            }
            self.transition(state, SessionState::Capturing);
            return None;
        }

        warn!(%code, reason = %reason, "connection lost");
        self.diagnostics.record(
            DiagnosticCategory::ConnectionFailure,
            format!("connection lost ({}): {}", code, reason),
        );
        // Attempts clear only when a link carries an analysis result
        if session.reconnect_attempts >= self.config.reconnect.max_attempts {
            let endpoint = session.endpoint.clone().unwrap_or_default();
            return Some((session.reconnect_attempts, endpoint));
        }
        let attempt = session.reconnect_attempts + 1;
        self.schedule_reconnect(session, attempt);
        self.transition(state, SessionState::Reconnecting);
        None
    }

    fn schedule_reconnect(self: &Arc<Self>, session: &mut Session, attempt: u32) {
        let delay = self.config.reconnect.delay;
        let weak = Arc::downgrade(self);
        let session_id = session.id;
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    inner.reconnect(session_id).await;
                }
            }
            .instrument(session.span.clone()),
        );
        replace_timer(&mut session.reconnect_timer, timer);

        info!(parent: &session.span, attempt, delay = ?delay, "reconnect scheduled");
        self.emit(SessionEvent::ReconnectScheduled { attempt, delay });
    }

    async fn reconnect(self: &Arc<Self>, session_id: Uuid) {
        let _op = self.op_lock.lock().await;
        let epoch = self.epoch.load(Ordering::SeqCst);
        let (endpoint, attempt) = {
            let mut slot = self.slot.lock();
            let Slot { state, session } = &mut *slot;
            let Some(session) = session.as_mut().filter(|s| s.id == session_id) else {
                return;
            };
            // This task is the pending reconnect; stop must not wait on it
            session.reconnect_timer = None;
            if *state != SessionState::Reconnecting {
                return;
            }
            let Some(endpoint) = session.endpoint.clone() else {
                return;
            };
            session.reconnect_attempts += 1;
            (endpoint, session.reconnect_attempts)
        };

        info!(attempt, endpoint = %endpoint, "reconnecting");
        self.emit(SessionEvent::ReconnectAttempt { attempt });
        let outcome = self.open_link(&endpoint).await;

        let mut stale = None;
        let mut exhausted = false;
        {
            let mut slot = self.slot.lock();
            let Slot { state, session } = &mut *slot;
            let live = *state == SessionState::Reconnecting
                && self.epoch.load(Ordering::SeqCst) == epoch;
            let current = session.as_mut().filter(|s| live && s.id == session_id);

            match (outcome, current) {
                (Ok(established), Some(session)) => {
                    self.install_link(session, established);
                    self.start_timers(session);
                    info!(attempts = attempt, "reconnected");
                    self.emit(SessionEvent::Reconnected { attempts: attempt });
                    self.transition(state, SessionState::Streaming);
                }
                (Ok(established), None) => stale = Some(established.connection),
                (Err(error), Some(session)) => {
                    warn!(attempt, error = %error, "reconnect failed");
                    self.diagnostics.record_error(&error);
                    if attempt >= self.config.reconnect.max_attempts {
                        exhausted = true;
                    } else {
                        self.schedule_reconnect(session, attempt + 1);
                    }
                }
                (Err(error), None) => debug!(error = %error, "reconnect outcome discarded"),
            }
        }

        if let Some(connection) = stale {
            let _ = connection.close(CloseCode::NORMAL, STOP_REASON).await;
        }
        if exhausted {
            self.give_up(attempt, &endpoint).await;
        }
    }

    async fn give_up(&self, attempts: u32, endpoint: &str) {
        error!(attempts, endpoint, "giving up on reconnection");
        self.diagnostics.record(
            DiagnosticCategory::ReconnectExhausted,
            format!("gave up after {} attempts to reach {}", attempts, endpoint),
        );
        self.emit(SessionEvent::ReconnectExhausted { attempts });
        self.shutdown().await;
    }

    async fn shutdown(&self) -> TeardownReport {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let (session, from) = {
            let mut slot = self.slot.lock();
            let from = std::mem::replace(&mut slot.state, SessionState::Idle);
            (slot.session.take(), from)
        };
        let Some(mut session) = session else {
            return TeardownReport::default();
        };

        let span = session.span.clone();
        async move {
            let mut report = TeardownReport::for_session(session.id);

            if let Some(timer) = session.frame_timer.take() {
                timer.abort();
                let _ = timer.await;
                report.push(TeardownStep::FrameTimerStopped);
            }
            if let Some(timer) = session.keep_alive_timer.take() {
                timer.abort();
                let _ = timer.await;
                report.push(TeardownStep::KeepAliveStopped);
            }
            if let Some(timer) = session.reconnect_timer.take() {
                timer.abort();
                report.push(TeardownStep::ReconnectCancelled);
            }
            if let Some(link) = session.link.take() {
                // The dispatch task may be mid-send and holding the connection
                link.dispatch.abort();
                let _ = link.dispatch.await;
                let close = link.connection.close(CloseCode::NORMAL, STOP_REASON);
                match tokio::time::timeout(self.config.connect_timeout, close).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
                    Err(_) => warn!(
                        timeout = ?self.config.connect_timeout,
                        "close handshake timed out, abandoning connection"
                    ),
                }
                report.push(TeardownStep::ConnectionClosed);
            }
            match session.device.stop().await {
                Ok(()) => report.push(TeardownStep::DeviceReleased),
                Err(e) => {
                    let error = FramelinkError::from(e);
                    warn!(error = %error, "failed to release camera");
                    self.diagnostics.record_error(&error);
                }
            }

            info!(
                frames_sent = session.frames_sent,
                steps = report.steps.len(),
                "session stopped"
            );
            if from != SessionState::Idle {
                self.emit(SessionEvent::StateChanged {
                    from,
                    to: SessionState::Idle,
                });
            }
            self.emit(SessionEvent::Stopped(report.clone()));
            report
        }
        .instrument(span)
        .await
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let Some(mut session) = self.slot.get_mut().session.take() else {
            return;
        };
        for timer in [
            session.frame_timer.take(),
            session.keep_alive_timer.take(),
            session.reconnect_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.abort();
        }
        let connection = session.link.take().map(|link| {
            link.dispatch.abort();
            link.connection
        });
        let device = session.device.clone();

        debug!(session_id = %session.id, "controller dropped with a live session");
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Some(connection) = connection {
                    let _ = connection.close(CloseCode::GOING_AWAY, "controller dropped").await;
                }
                let _ = device.stop().await;
            });
        }
    }
}

fn replace_timer(slot: &mut Option<JoinHandle<()>>, timer: JoinHandle<()>) {
    if let Some(old) = slot.replace(timer) {
        old.abort();
    }
}

fn invalid_state(expected: &str, actual: SessionState) -> FramelinkError {
    FramelinkError::InvalidState {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
