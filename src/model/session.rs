//! Gemini Live session management for one call.
//!
//! A [`ModelSession`] owns the WebSocket to the model and exposes a typed
//! duplex interface: commands go in through non-blocking senders, events come
//! out of [`ModelSession::recv`]. One reader/writer task per session drives
//! the socket; the orchestrator never touches the connection directly.
//!
//! # Lifecycle
//!
//! [`ModelSession::open`] connects, sends the full configuration as the first
//! frame, and waits for the server's acknowledgement before returning; no
//! realtime audio is forwarded before the ack. The session sends no content
//! on its own at connect: the agent waits for the caller to speak.
//!
//! # Interruption
//!
//! On a server `interrupted` signal, audio chunks already queued for delivery
//! belong to the cancelled turn. Each outgoing [`ModelEvent::AudioOut`] is
//! tagged with a turn generation internally; `recv` silently discards chunks
//! from generations older than the latest interruption, then surfaces
//! [`ModelEvent::Interrupted`] so the orchestrator can clear the carrier side.
//!
//! # Time budget and handover
//!
//! Audio sessions are bounded by the vendor. On `goAway` the session enters
//! draining: new audio is refused with backpressure, the current turn is
//! allowed to finish, and the socket is swapped for a fresh one carrying the
//! latest resumption handle. The blackout duration is reported upstream so
//! the orchestrator can decide whether the handover stayed within budget.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::config::{SessionSettings, GEMINI_LIVE_URL};
use super::messages::{
    build_setup, build_text_turn, build_tool_response, parse_server_frame, FunctionCall,
    FunctionResponse, RealtimeInputMessage, ServerEvent,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Ws, WsMessage>;
type WsStream = SplitStream<Ws>;

/// Capacity of the caller→model audio queue: 200 frames ≈ 4 s of audio.
const SEND_QUEUE_CAPACITY: usize = 200;

/// Capacity of the event channel toward the orchestrator.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// How long to wait for the server's setup acknowledgement.
const SETUP_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnection attempts for unsolicited transient closes.
const RECONNECT_ATTEMPTS: u32 = 3;

/// Initial reconnect backoff; doubles per attempt.
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(250);

/// Backoff ceiling.
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(4);

/// Upper bound on how long draining waits for the turn to finish before the
/// handover proceeds anyway.
const DRAIN_TURN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Errors
// =============================================================================

/// Fatal session errors, per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Credentials rejected by the model endpoint.
    Auth,
    /// The configuration was rejected.
    InvalidConfig,
    /// The named model cannot run a live audio session.
    IncompatibleModel,
    /// The server sent something outside the protocol.
    Protocol,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth => write!(f, "auth"),
            Self::InvalidConfig => write!(f, "invalid_config"),
            Self::IncompatibleModel => write!(f, "incompatible_model"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session setup failed ({kind}): {message}")]
    Setup {
        kind: ErrorKind,
        message: String,
    },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("session is draining; audio refused")]
    Backpressure,
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// The error-kind classification for recording, if this is a setup error.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Setup { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Events
// =============================================================================

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Locally requested close.
    Normal,
    /// The server closed and reconnection was exhausted.
    TransportLost,
    /// A fatal protocol or server error.
    Fatal(ErrorKind),
}

/// Events delivered to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    /// Model speech, PCM s16le at 24 kHz.
    AudioOut(Bytes),
    /// Transcription of caller speech.
    InputTranscription(String),
    /// Transcription of model speech.
    OutputTranscription(String),
    /// The caller barged in; stale audio has already been dropped.
    Interrupted,
    /// The model finished its utterance.
    TurnComplete,
    /// Generation for the turn is complete.
    GenerationComplete,
    /// The model requests a function execution.
    ToolCall(FunctionCall),
    /// The server issued a new resumption handle.
    ResumptionUpdate { handle: String, resumable: bool },
    /// The server announced the session time budget is nearly spent.
    GoAway { time_left: Duration },
    /// A session handover finished; `blackout` is the audio gap it caused.
    HandoverCompleted { blackout: Duration },
    /// The session ended.
    Closed(CloseReason),
    /// Fatal error.
    Error(ErrorKind),
}

/// Commands accepted by the I/O task.
enum Command {
    Text(String),
    ToolResponse(FunctionResponse),
    ActivityStart,
    ActivityEnd,
    AudioStreamEnd,
    Close,
}

// =============================================================================
// Drop-oldest audio queue
// =============================================================================

/// Bounded caller→model audio queue with a drop-oldest overflow policy.
///
/// The producer never blocks: when the queue is full the oldest frame is
/// discarded and counted. The consumer drains after each notification.
struct AudioQueue {
    frames: Mutex<VecDeque<Bytes>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl AudioQueue {
    fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(SEND_QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, frame: Bytes) {
        let mut frames = self.frames.lock().expect("audio queue poisoned");
        if frames.len() >= SEND_QUEUE_CAPACITY {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Bytes> {
        self.frames.lock().expect("audio queue poisoned").pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Session handle
// =============================================================================

/// Everything the I/O task needs to (re)establish a connection.
#[derive(Clone)]
struct ConnectSpec {
    api_key: String,
    settings: SessionSettings,
}

/// One model streaming session for one call.
pub struct ModelSession {
    cmd_tx: mpsc::Sender<Command>,
    event_rx: mpsc::Receiver<(u64, ModelEvent)>,
    audio_queue: Arc<AudioQueue>,
    draining: Arc<AtomicBool>,
    interrupt_gen: Arc<AtomicU64>,
}

impl ModelSession {
    /// Connect, configure, and wait for the server acknowledgement.
    ///
    /// `previous_handle` requests resumption of an earlier session. Returns
    /// only after `setupComplete`; the first audio frame sent afterwards
    /// begins the billable session.
    pub async fn open(
        api_key: &str,
        settings: SessionSettings,
        previous_handle: Option<String>,
    ) -> SessionResult<Self> {
        let spec = ConnectSpec {
            api_key: api_key.to_string(),
            settings,
        };

        let (sink, stream) = establish(&spec, previous_handle.as_deref()).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let audio_queue = Arc::new(AudioQueue::new());
        let draining = Arc::new(AtomicBool::new(false));
        let interrupt_gen = Arc::new(AtomicU64::new(0));

        let task = IoTask {
            spec,
            sink,
            stream,
            cmd_rx,
            event_tx,
            audio_queue: audio_queue.clone(),
            draining: draining.clone(),
            interrupt_gen: interrupt_gen.clone(),
            last_handle: previous_handle,
            drain_deadline: None,
        };
        tokio::spawn(task.run());

        Ok(Self {
            cmd_tx,
            event_rx,
            audio_queue,
            draining,
            interrupt_gen,
        })
    }

    /// Enqueue caller audio (PCM s16le, 16 kHz). Non-blocking.
    ///
    /// While the session is draining for a handover this refuses with
    /// [`SessionError::Backpressure`]; queue overflow otherwise drops the
    /// oldest frame and increments the overflow counter.
    pub fn send_audio(&self, pcm16k: Bytes) -> SessionResult<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(SessionError::Backpressure);
        }
        self.audio_queue.push(pcm16k);
        Ok(())
    }

    /// Inject a synthetic user text turn.
    pub async fn send_text(&self, text: &str) -> SessionResult<()> {
        self.send_command(Command::Text(text.to_string())).await
    }

    /// Complete a tool call initiated by the model.
    pub async fn send_tool_response(&self, response: FunctionResponse) -> SessionResult<()> {
        self.send_command(Command::ToolResponse(response)).await
    }

    /// Manual start-of-turn marker (automatic VAD disabled only).
    pub async fn signal_activity_start(&self) -> SessionResult<()> {
        self.send_command(Command::ActivityStart).await
    }

    /// Manual end-of-turn marker (automatic VAD disabled only).
    pub async fn signal_activity_end(&self) -> SessionResult<()> {
        self.send_command(Command::ActivityEnd).await
    }

    /// Announce intentional silence on the input stream.
    pub async fn signal_audio_stream_end(&self) -> SessionResult<()> {
        self.send_command(Command::AudioStreamEnd).await
    }

    /// A cloneable command handle, usable from tasks that do not own the
    /// session (tool responders).
    pub fn handle(&self) -> ModelHandle {
        ModelHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Receive the next event. `None` after the session has fully closed.
    ///
    /// Audio belonging to an interrupted turn is discarded here so the
    /// orchestrator never replays stale speech after a barge-in.
    pub async fn recv(&mut self) -> Option<ModelEvent> {
        loop {
            let (gen, event) = self.event_rx.recv().await?;
            if matches!(event, ModelEvent::AudioOut(_))
                && gen < self.interrupt_gen.load(Ordering::Acquire)
            {
                continue;
            }
            return Some(event);
        }
    }

    /// Frames dropped from the send queue since the session opened.
    pub fn dropped_input_frames(&self) -> u64 {
        self.audio_queue.dropped()
    }

    /// Graceful shutdown.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }

    async fn send_command(&self, cmd: Command) -> SessionResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

/// Cloneable sender for session commands.
#[derive(Clone)]
pub struct ModelHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ModelHandle {
    /// Inject a synthetic user text turn.
    pub async fn send_text(&self, text: &str) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::Text(text.to_string()))
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Complete a tool call initiated by the model.
    pub async fn send_tool_response(&self, response: FunctionResponse) -> SessionResult<()> {
        self.cmd_tx
            .send(Command::ToolResponse(response))
            .await
            .map_err(|_| SessionError::Closed)
    }
}

// =============================================================================
// Connection establishment
// =============================================================================

/// Connect and run the setup handshake; returns the split socket after
/// `setupComplete`.
async fn establish(
    spec: &ConnectSpec,
    resume_handle: Option<&str>,
) -> SessionResult<(WsSink, WsStream)> {
    let endpoint = spec
        .settings
        .endpoint
        .as_deref()
        .unwrap_or(GEMINI_LIVE_URL);
    let url = format!("{endpoint}?key={}", spec.api_key);

    let (mut ws, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(classify_connect_error)?;

    let setup = build_setup(&spec.settings, resume_handle);
    let json = serde_json::to_string(&setup)
        .map_err(|e| SessionError::Connection(format!("setup serialization: {e}")))?;
    ws.send(WsMessage::Text(json))
        .await
        .map_err(|e| SessionError::Connection(format!("setup send: {e}")))?;

    // Wait for the acknowledgement before any realtime input flows.
    let ack = tokio::time::timeout(SETUP_ACK_TIMEOUT, async {
        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| SessionError::Connection(e.to_string()))?;
            let text = match frame_text(&frame) {
                Some(t) => t,
                None => {
                    if let WsMessage::Close(reason) = &frame {
                        return Err(classify_close_during_setup(reason.as_ref()));
                    }
                    continue;
                }
            };
            for event in parse_server_frame(&text) {
                match event {
                    ServerEvent::SetupComplete => return Ok(()),
                    ServerEvent::Error { message } => {
                        return Err(classify_server_error(&message))
                    }
                    _ => {}
                }
            }
        }
        Err(SessionError::Connection(
            "stream ended before setup acknowledgement".to_string(),
        ))
    })
    .await;

    match ack {
        Ok(Ok(())) => {
            tracing::debug!(model = %spec.settings.model, "model session configured");
            Ok(ws.split())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SessionError::Connection(
            "timed out waiting for setup acknowledgement".to_string(),
        )),
    }
}

/// Extract UTF-8 JSON from a frame. The server sends JSON in Binary frames.
fn frame_text(frame: &WsMessage) -> Option<String> {
    match frame {
        WsMessage::Text(text) => Some(text.clone()),
        WsMessage::Binary(data) if data.first() == Some(&b'{') => {
            std::str::from_utf8(data).ok().map(str::to_string)
        }
        _ => None,
    }
}

fn classify_connect_error(e: tokio_tungstenite::tungstenite::Error) -> SessionError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match &e {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                SessionError::Setup {
                    kind: ErrorKind::Auth,
                    message: format!("endpoint returned HTTP {status}"),
                }
            } else if status == 400 || status == 404 {
                SessionError::Setup {
                    kind: ErrorKind::InvalidConfig,
                    message: format!("endpoint returned HTTP {status}"),
                }
            } else {
                SessionError::Connection(e.to_string())
            }
        }
        _ => SessionError::Connection(e.to_string()),
    }
}

fn classify_close_during_setup(
    reason: Option<&tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>,
) -> SessionError {
    let text = reason
        .map(|f| f.reason.to_string())
        .unwrap_or_default()
        .to_lowercase();
    if text.contains("api key") || text.contains("auth") || text.contains("permission") {
        SessionError::Setup {
            kind: ErrorKind::Auth,
            message: text,
        }
    } else if text.contains("model") {
        SessionError::Setup {
            kind: ErrorKind::IncompatibleModel,
            message: text,
        }
    } else {
        SessionError::Setup {
            kind: ErrorKind::InvalidConfig,
            message: if text.is_empty() {
                "closed during setup".to_string()
            } else {
                text
            },
        }
    }
}

fn classify_server_error(message: &str) -> SessionError {
    let lowered = message.to_lowercase();
    let kind = if lowered.contains("api key") || lowered.contains("auth") {
        ErrorKind::Auth
    } else if lowered.contains("model") {
        ErrorKind::IncompatibleModel
    } else {
        ErrorKind::InvalidConfig
    };
    SessionError::Setup {
        kind,
        message: message.to_string(),
    }
}

// =============================================================================
// I/O task
// =============================================================================

struct IoTask {
    spec: ConnectSpec,
    sink: WsSink,
    stream: WsStream,
    cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<(u64, ModelEvent)>,
    audio_queue: Arc<AudioQueue>,
    draining: Arc<AtomicBool>,
    interrupt_gen: Arc<AtomicU64>,
    last_handle: Option<String>,
    drain_deadline: Option<Instant>,
}

/// Outcome of one socket's message loop.
enum LoopExit {
    /// Local close requested.
    Shutdown,
    /// Drain finished; swap the socket.
    Handover,
    /// The server went away without warning.
    Lost,
    /// Unrecoverable error already reported upstream.
    Fatal,
}

impl IoTask {
    async fn run(mut self) {
        loop {
            match self.socket_loop().await {
                LoopExit::Shutdown => {
                    let _ = self.sink.send(WsMessage::Close(None)).await;
                    self.emit(ModelEvent::Closed(CloseReason::Normal)).await;
                    return;
                }
                LoopExit::Handover => {
                    let started = Instant::now();
                    let _ = self.sink.send(WsMessage::Close(None)).await;
                    if !self.reconnect().await {
                        return;
                    }
                    self.draining.store(false, Ordering::Release);
                    self.drain_deadline = None;
                    self.emit(ModelEvent::HandoverCompleted {
                        blackout: started.elapsed(),
                    })
                    .await;
                }
                LoopExit::Lost => {
                    if !self.reconnect().await {
                        return;
                    }
                    // Resume audio flow on the fresh socket.
                    self.draining.store(false, Ordering::Release);
                    self.drain_deadline = None;
                }
                LoopExit::Fatal => return,
            }
        }
    }

    /// Drive one socket until it closes or a handover is due.
    async fn socket_loop(&mut self) -> LoopExit {
        enum Wake {
            Cmd(Option<Command>),
            Audio,
            DrainExpired,
            Frame(Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>),
        }

        loop {
            // Flush pending audio before parking; a notification may have
            // been consumed while we were busy elsewhere.
            if !self.draining.load(Ordering::Acquire) {
                if let Some(exit) = self.flush_audio().await {
                    return exit;
                }
            }

            let accepting_audio = !self.draining.load(Ordering::Acquire);
            let drain_timer = self
                .drain_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let drain_armed = self.drain_deadline.is_some();

            let wake = tokio::select! {
                cmd = self.cmd_rx.recv() => Wake::Cmd(cmd),
                _ = self.audio_queue.wait(), if accepting_audio => Wake::Audio,
                _ = tokio::time::sleep_until(drain_timer), if drain_armed => Wake::DrainExpired,
                frame = self.stream.next() => Wake::Frame(frame),
            };

            match wake {
                Wake::Cmd(None) | Wake::Cmd(Some(Command::Close)) => {
                    return LoopExit::Shutdown;
                }
                Wake::Cmd(Some(cmd)) => {
                    if self.handle_command(cmd).await.is_err() {
                        return LoopExit::Lost;
                    }
                }
                Wake::Audio => {
                    if let Some(exit) = self.flush_audio().await {
                        return exit;
                    }
                }
                Wake::DrainExpired => {
                    // The turn did not complete inside the drain window;
                    // hand over anyway before the server hard-closes.
                    tracing::warn!("drain window elapsed without turn completion");
                    return LoopExit::Handover;
                }
                Wake::Frame(Some(Ok(frame))) => {
                    if let Some(exit) = self.handle_frame(frame).await {
                        return exit;
                    }
                }
                Wake::Frame(Some(Err(e))) => {
                    tracing::warn!(error = %e, "model socket error");
                    return LoopExit::Lost;
                }
                Wake::Frame(None) => return LoopExit::Lost,
            }
        }
    }

    /// Drain the audio queue onto the socket.
    async fn flush_audio(&mut self) -> Option<LoopExit> {
        while let Some(chunk) = self.audio_queue.pop() {
            let msg = RealtimeInputMessage::audio(&chunk);
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "audio frame serialization failed");
                    continue;
                }
            };
            if self.send_json(json).await.is_err() {
                return Some(LoopExit::Lost);
            }
        }
        None
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<(), ()> {
        let value: Value = match cmd {
            Command::Text(text) => build_text_turn(&text),
            Command::ToolResponse(response) => build_tool_response(&[response]),
            Command::ActivityStart => {
                serde_json::to_value(RealtimeInputMessage::activity_start()).map_err(|_| ())?
            }
            Command::ActivityEnd => {
                serde_json::to_value(RealtimeInputMessage::activity_end()).map_err(|_| ())?
            }
            Command::AudioStreamEnd => {
                serde_json::to_value(RealtimeInputMessage::audio_stream_end()).map_err(|_| ())?
            }
            Command::Close => unreachable!("close handled by caller"),
        };
        self.send_json(value.to_string()).await
    }

    async fn send_json(&mut self, json: String) -> Result<(), ()> {
        self.sink
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "model socket send failed");
            })
    }

    /// Process one inbound frame. Returns an exit when the loop must stop.
    async fn handle_frame(&mut self, frame: WsMessage) -> Option<LoopExit> {
        match &frame {
            WsMessage::Ping(data) => {
                let _ = self.sink.send(WsMessage::Pong(data.clone())).await;
                return None;
            }
            WsMessage::Close(reason) => {
                tracing::info!(?reason, "model socket closed by server");
                if self.draining.load(Ordering::Acquire) {
                    return Some(LoopExit::Handover);
                }
                return Some(LoopExit::Lost);
            }
            _ => {}
        }

        let text = frame_text(&frame)?;
        for event in parse_server_frame(&text) {
            match event {
                ServerEvent::SetupComplete => {}
                ServerEvent::Audio { data } => {
                    self.emit(ModelEvent::AudioOut(Bytes::from(data))).await;
                }
                ServerEvent::InputTranscription { text } => {
                    self.emit(ModelEvent::InputTranscription(text)).await;
                }
                ServerEvent::OutputTranscription { text } => {
                    self.emit(ModelEvent::OutputTranscription(text)).await;
                }
                ServerEvent::Interrupted => {
                    // Invalidate queued audio before the orchestrator hears
                    // about the interruption.
                    self.interrupt_gen.fetch_add(1, Ordering::AcqRel);
                    self.emit(ModelEvent::Interrupted).await;
                }
                ServerEvent::TurnComplete => {
                    self.emit(ModelEvent::TurnComplete).await;
                    if self.draining.load(Ordering::Acquire) {
                        return Some(LoopExit::Handover);
                    }
                }
                ServerEvent::GenerationComplete => {
                    self.emit(ModelEvent::GenerationComplete).await;
                }
                ServerEvent::ToolCall { calls } => {
                    for call in calls {
                        self.emit(ModelEvent::ToolCall(call)).await;
                    }
                }
                ServerEvent::ResumptionUpdate { handle, resumable } => {
                    self.last_handle = Some(handle.clone());
                    self.emit(ModelEvent::ResumptionUpdate { handle, resumable })
                        .await;
                }
                ServerEvent::GoAway { time_left_ms } => {
                    let time_left = Duration::from_millis(time_left_ms);
                    tracing::info!(?time_left, "model session time budget warning");
                    self.draining.store(true, Ordering::Release);
                    let window = DRAIN_TURN_TIMEOUT.min(time_left.mul_f32(0.8).max(
                        Duration::from_millis(100),
                    ));
                    self.drain_deadline = Some(Instant::now() + window);
                    self.emit(ModelEvent::GoAway { time_left }).await;
                }
                ServerEvent::Error { message } => {
                    tracing::error!(%message, "model session error");
                    self.emit(ModelEvent::Error(ErrorKind::Protocol)).await;
                    self.emit(ModelEvent::Closed(CloseReason::Fatal(ErrorKind::Protocol)))
                        .await;
                    return Some(LoopExit::Fatal);
                }
            }
        }
        None
    }

    /// Reopen the socket with the most recent resumption handle.
    ///
    /// Exponential backoff across [`RECONNECT_ATTEMPTS`] tries; returns false
    /// (after reporting closure upstream) when attempts are exhausted or the
    /// failure is non-transient.
    async fn reconnect(&mut self) -> bool {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        for attempt in 1..=RECONNECT_ATTEMPTS {
            match establish(&self.spec, self.last_handle.as_deref()).await {
                Ok((sink, stream)) => {
                    tracing::info!(attempt, "model session re-established");
                    self.sink = sink;
                    self.stream = stream;
                    return true;
                }
                Err(SessionError::Setup { kind, message }) => {
                    // Non-transient: credentials or configuration went bad.
                    tracing::error!(%kind, %message, "reconnect rejected");
                    self.emit(ModelEvent::Error(kind)).await;
                    self.emit(ModelEvent::Closed(CloseReason::Fatal(kind))).await;
                    return false;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
            if attempt < RECONNECT_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
            }
        }
        self.emit(ModelEvent::Closed(CloseReason::TransportLost)).await;
        false
    }

    async fn emit(&self, event: ModelEvent) {
        let gen = self.interrupt_gen.load(Ordering::Acquire);
        if self.event_tx.send((gen, event)).await.is_err() {
            tracing::debug!("event receiver dropped");
        }
    }
}
