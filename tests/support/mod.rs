//! Shared fixtures for end-to-end tests.
//!
//! The model side is a real WebSocket server speaking the Gemini Live frame
//! shapes; the carrier side is driven directly over the session's typed
//! frame channels. Everything runs in-process against the in-memory store.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use voxgate::call::{CallDeps, CallRegistry, CallTiming, RecorderConfig, StubToolHandler};
use voxgate::carrier::{CarrierSession, StreamFrame};
use voxgate::model::VadTuning;
use voxgate::persistence::MemoryStore;
use voxgate::routing::{AgentProfile, DirectionPolicy, RoutingKind, RoutingTable};

pub type ServerWs = WebSocketStream<TcpStream>;
pub type ConnHandler =
    Arc<dyn Fn(usize, ServerWs) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Mock model server
// =============================================================================

/// A scriptable stand-in for the model's live endpoint.
pub struct MockLive {
    url: String,
    connections: Arc<AtomicUsize>,
}

impl MockLive {
    /// Start a server; `handler` runs once per accepted connection with the
    /// zero-based connection index.
    pub async fn start(handler: ConnHandler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let port = listener.local_addr().expect("mock addr").port();
        let connections = Arc::new(AtomicUsize::new(0));

        let conn_counter = connections.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = conn_counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => handler(index, ws).await,
                        Err(e) => eprintln!("mock accept failed: {e}"),
                    }
                });
            }
        });

        Self {
            url: format!("ws://127.0.0.1:{port}/"),
            connections,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Read frames until one parses as JSON; panics if the peer goes away.
pub async fn read_json(ws: &mut ServerWs) -> Value {
    while let Some(msg) = ws.next().await {
        match msg.expect("mock read") {
            Message::Text(text) => return serde_json::from_str(&text).expect("mock json"),
            Message::Binary(data) => {
                return serde_json::from_slice(&data).expect("mock json")
            }
            Message::Close(_) => panic!("peer closed while a frame was expected"),
            _ => {}
        }
    }
    panic!("stream ended while a frame was expected");
}

/// Like [`read_json`] but returns `None` on close/end instead of panicking.
pub async fn try_read_json(ws: &mut ServerWs) -> Option<Value> {
    while let Some(msg) = ws.next().await {
        match msg.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Binary(data) => return serde_json::from_slice(&data).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

pub async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string()))
        .await
        .expect("mock send");
}

/// Complete the setup handshake: read the client's setup, reply
/// `setupComplete`, and return the setup payload for assertions.
pub async fn accept_setup(ws: &mut ServerWs) -> Value {
    let setup = read_json(ws).await;
    assert!(setup.get("setup").is_some(), "first frame must be setup");
    send_json(ws, json!({ "setupComplete": {} })).await;
    setup
}

/// PCM s16le server audio wrapped the way the live API frames it.
pub fn audio_frame(pcm: &[u8]) -> Value {
    json!({
        "serverContent": {
            "modelTurn": {
                "parts": [{
                    "inlineData": {
                        "mimeType": "audio/pcm;rate=24000",
                        "data": BASE64_STANDARD.encode(pcm),
                    }
                }]
            }
        }
    })
}

// =============================================================================
// Carrier driver
// =============================================================================

/// Handle on the carrier side of a call under test.
pub struct TestCarrier {
    pub to_session: mpsc::Sender<StreamFrame>,
    pub from_session: mpsc::Receiver<StreamFrame>,
    seq: u64,
}

impl TestCarrier {
    /// Build a session plus its driver.
    pub fn new() -> (CarrierSession, TestCarrier) {
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (in_tx, in_rx) = mpsc::channel(1024);
        let session = CarrierSession::start(out_tx, in_rx);
        (
            session,
            TestCarrier {
                to_session: in_tx,
                from_session: out_rx,
                seq: 0,
            },
        )
    }

    pub async fn send_connected(&mut self) {
        self.to_session
            .send(StreamFrame::Connected {
                protocol: Some("Call".into()),
                version: Some("1.0.0".into()),
            })
            .await
            .expect("carrier send");
    }

    pub async fn send_start(&mut self, from: &str, to: &str) {
        self.seq += 1;
        let mut params = HashMap::new();
        params.insert("from".to_string(), from.to_string());
        params.insert("to".to_string(), to.to_string());
        params.insert("direction".to_string(), "inbound".to_string());
        self.to_session
            .send(StreamFrame::Start {
                sequence_number: Some(self.seq.to_string()),
                start: voxgate::carrier::messages::StartMeta {
                    account_sid: Some("AC00000000".into()),
                    call_sid: Some("CA00000001".into()),
                    stream_sid: Some("MZ00000001".into()),
                    tracks: vec!["inbound".into()],
                    custom_parameters: params,
                    media_format: Some(voxgate::carrier::messages::MediaFormat {
                        encoding: "audio/x-mulaw".into(),
                        sample_rate: 8000,
                        channels: 1,
                    }),
                },
                stream_sid: "MZ00000001".into(),
            })
            .await
            .expect("carrier send");
    }

    /// Send one 20 ms μ-law frame.
    pub async fn send_media(&mut self, payload: &[u8; 160]) {
        self.seq += 1;
        self.to_session
            .send(StreamFrame::Media {
                sequence_number: Some(self.seq.to_string()),
                media: voxgate::carrier::messages::MediaMeta {
                    track: Some("inbound".into()),
                    chunk: None,
                    timestamp: None,
                    payload: BASE64_STANDARD.encode(payload),
                },
                stream_sid: Some("MZ00000001".into()),
            })
            .await
            .expect("carrier send");
    }

    pub async fn send_mark_echo(&mut self, name: &str) {
        self.to_session
            .send(StreamFrame::Mark {
                mark: voxgate::carrier::messages::MarkMeta {
                    name: name.to_string(),
                },
                stream_sid: Some("MZ00000001".into()),
            })
            .await
            .expect("carrier send");
    }

    pub async fn send_stop(&mut self) {
        self.to_session
            .send(StreamFrame::Stop {
                stop: Some(voxgate::carrier::messages::StopMeta {
                    account_sid: Some("AC00000000".into()),
                    call_sid: Some("CA00000001".into()),
                }),
                stream_sid: Some("MZ00000001".into()),
            })
            .await
            .expect("carrier send");
    }

    /// Drain whatever the session has emitted so far, for `window` long.
    pub async fn collect_frames(&mut self, window: Duration) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, self.from_session.recv()).await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        frames
    }
}

pub fn media_frames(frames: &[StreamFrame]) -> usize {
    frames
        .iter()
        .filter(|f| matches!(f, StreamFrame::Media { .. }))
        .count()
}

pub fn mark_names(frames: &[StreamFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Mark { mark, .. } => Some(mark.name.clone()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// Deps
// =============================================================================

pub fn test_agent() -> AgentProfile {
    AgentProfile {
        id: "agent-under-test".into(),
        name: "Test receptionist".into(),
        voice: "Puck".into(),
        language: "en-US".into(),
        system_prompt: "Answer the phone briefly.".into(),
        model: "gemini-2.0-flash-live-001".into(),
        vad: VadTuning::default(),
        direction_policy: DirectionPolicy::Both,
        routing: RoutingKind::Direct,
        forward_to: None,
        business_hours: None,
        timezone: "UTC".into(),
        max_concurrent_calls: 3,
        primary: true,
        active: true,
        created_at: chrono::Utc::now(),
        extended_sessions: false,
    }
}

pub fn test_table() -> RoutingTable {
    RoutingTable {
        agents: vec![test_agent()],
        ..Default::default()
    }
}

/// Call timings shrunk so failure paths resolve quickly in tests.
pub fn test_timing() -> CallTiming {
    CallTiming {
        setup_timeout: Duration::from_secs(3),
        idle_timeout: Duration::from_secs(10),
        handover_budget: Duration::from_millis(400),
        tool_response_timeout: Duration::from_millis(500),
        drain_timeout: Duration::from_secs(1),
    }
}

pub fn test_deps(
    store: Arc<MemoryStore>,
    endpoint: String,
    table: RoutingTable,
    registry: Arc<CallRegistry>,
) -> CallDeps {
    CallDeps {
        model_api_key: "test-key".into(),
        model_endpoint: Some(endpoint),
        routing: Arc::new(table),
        store,
        registry,
        tools: Arc::new(StubToolHandler),
        timing: test_timing(),
        recorder: RecorderConfig {
            retry_budget: Duration::from_millis(200),
            retry_initial: Duration::from_millis(10),
            retry_max: Duration::from_millis(50),
        },
    }
}

/// 20 ms of μ-law silence.
pub const ULAW_SILENCE: [u8; 160] = [0xFF; 160];
