//! Per-call orchestration: the state machine and the audio wiring.
//!
//! One orchestrator runs per accepted carrier connection. It resolves the
//! agent, opens the model session, and then pumps both directions (carrier
//! media through the codec into the model, model audio through the codec
//! back to the carrier) while forwarding transcripts and tool calls to the
//! lifecycle recorder.
//!
//! # State machine
//!
//! ```text
//! Pending → Ringing → InProgress → (Completed | Failed | Abandoned)
//! ```
//!
//! `Ringing` on the carrier hello; `InProgress` once the carrier start frame
//! has arrived *and* the model session has acknowledged its configuration.
//! Setup that exceeds the timeout fails the call. From `InProgress`, a
//! carrier stop or a normal model close completes the call once outbound
//! audio has drained; fatal errors fail it; a hangup before the agent ever
//! produced audio abandons it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::audio::CallCodec;
use crate::carrier::{CarrierEvent, CarrierSession, StreamStart};
use crate::model::{
    CloseReason, FunctionResponse, ModelEvent, ModelSession, SessionError,
};
use crate::persistence::{CallRecord, CallStatus, CallStore};
use crate::routing::{self, Resolution, RoutingTable};

use super::recorder::{CallRecorder, RecorderConfig};
use super::registry::{CallRegistry, ControlCommand};
use super::tools::{StubToolHandler, ToolHandler};

/// Timing knobs for one call; tests shrink them.
#[derive(Debug, Clone)]
pub struct CallTiming {
    /// Pending/Ringing must reach InProgress within this window.
    pub setup_timeout: Duration,
    /// Caller silence before the "still there?" prompt, and again before
    /// the call is abandoned.
    pub idle_timeout: Duration,
    /// Maximum audio blackout a session handover may cause.
    pub handover_budget: Duration,
    /// Tool handlers must answer within this window or the stub answers.
    pub tool_response_timeout: Duration,
    /// How long to wait for outbound audio to drain at completion.
    pub drain_timeout: Duration,
}

impl Default for CallTiming {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(8),
            idle_timeout: Duration::from_secs(30),
            handover_budget: Duration::from_millis(400),
            tool_response_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Capability bundle injected into each orchestrator.
#[derive(Clone)]
pub struct CallDeps {
    pub model_api_key: String,
    /// Model endpoint override; tests point this at a mock server.
    pub model_endpoint: Option<String>,
    /// Routing snapshot taken at call start.
    pub routing: Arc<RoutingTable>,
    pub store: Arc<dyn CallStore>,
    pub registry: Arc<CallRegistry>,
    pub tools: Arc<dyn ToolHandler>,
    pub timing: CallTiming,
    pub recorder: RecorderConfig,
}

/// Terminal disposition of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Terminal {
    Completed,
    Abandoned,
    Failed(String),
}

impl Terminal {
    fn status(&self) -> CallStatus {
        match self {
            Self::Completed => CallStatus::Completed,
            Self::Abandoned => CallStatus::Abandoned,
            Self::Failed(_) => CallStatus::Failed,
        }
    }

    fn outcome(&self) -> String {
        match self {
            Self::Completed => "completed".to_string(),
            Self::Abandoned => "abandoned".to_string(),
            Self::Failed(reason) => reason.clone(),
        }
    }
}

/// Run one call to completion. Returns the final record (also persisted,
/// except for overload refusals which only increment a counter).
pub async fn run_call(deps: CallDeps, carrier: CarrierSession) -> CallRecord {
    let call_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("call", call_id = %call_id);
    run_call_inner(deps, carrier, call_id).instrument(span).await
}

async fn run_call_inner(
    deps: CallDeps,
    mut carrier: CarrierSession,
    call_id: String,
) -> CallRecord {
    let started_at = Utc::now();
    let setup_deadline = Instant::now() + deps.timing.setup_timeout;

    // --- Pending → Ringing → carrier start -------------------------------
    let start = match wait_for_start(&mut carrier, setup_deadline).await {
        StartWait::Started(start) => start,
        StartWait::Hangup => {
            let mut record = blank_record(&call_id, started_at);
            finish_with_record(&deps, &mut record, Terminal::Abandoned).await;
            return record;
        }
        StartWait::Protocol(detail) => {
            tracing::error!(%detail, "protocol error during setup");
            let mut record = blank_record(&call_id, started_at);
            finish_with_record(&deps, &mut record, Terminal::Failed("protocol".into())).await;
            return record;
        }
        StartWait::TimedOut => {
            let mut record = blank_record(&call_id, started_at);
            finish_with_record(&deps, &mut record, Terminal::Failed("setup_timeout".into()))
                .await;
            carrier.close("setup_timeout").await;
            return record;
        }
    };

    let mut record = CallRecord::new(
        call_id.clone(),
        start.direction,
        start.from.clone(),
        start.to.clone(),
        started_at,
    );
    record.stream_sid = Some(start.stream_sid.clone());
    record.call_sid = start.call_sid.clone();
    record.status = CallStatus::Ringing;

    // --- Routing resolution ----------------------------------------------
    let registry = deps.registry.clone();
    let resolution = routing::resolve(
        &deps.routing,
        start.direction,
        &start.to,
        &start.from,
        Utc::now(),
        |agent_id| registry.count_for_agent(agent_id),
    );

    let agent = match resolution {
        Resolution::Route(agent) => agent,
        Resolution::Forward { number } => {
            tracing::info!(%number, "call routed to forward target");
            record.outcome = Some(format!("forwarded:{number}"));
            finish_with_record(&deps, &mut record, Terminal::Completed).await;
            carrier.close("forwarded").await;
            return record;
        }
        Resolution::Refused(reason) => {
            if reason == routing::RefusalReason::Overloaded {
                // Refused before media: counter only, no record.
                deps.registry.count_refused_overloaded();
                tracing::warn!("call refused: agent at concurrency maximum");
                carrier.close(reason.as_str()).await;
                record.status = CallStatus::Failed;
                record.outcome = Some(reason.as_str().to_string());
                return record;
            }
            tracing::warn!(reason = %reason, "call refused at resolve time");
            finish_with_record(&deps, &mut record, Terminal::Failed(reason.as_str().into()))
                .await;
            carrier.close(reason.as_str()).await;
            return record;
        }
    };
    record.agent_id = Some(agent.id.clone());

    let recorder = Arc::new(CallRecorder::new(
        call_id.clone(),
        deps.store.clone(),
        deps.recorder.clone(),
    ));
    recorder.append_event(
        "created",
        serde_json::json!({
            "direction": start.direction.as_str(),
            "from": start.from,
            "to": start.to,
            "agent_id": agent.id.clone(),
            "stream_sid": start.stream_sid,
        }),
    );

    // --- Model session ----------------------------------------------------
    let settings = match agent.session_settings() {
        Ok(settings) => match &deps.model_endpoint {
            Some(endpoint) => {
                let mut s = settings;
                s.endpoint = Some(endpoint.clone());
                s
            }
            None => settings,
        },
        Err(e) => {
            tracing::error!(error = %e, "agent configuration invalid");
            finalize(&recorder, &mut record, Terminal::Failed("invalid_config".into()))
                .await;
            carrier.close("invalid_config").await;
            return record;
        }
    };

    let remaining = setup_deadline.saturating_duration_since(Instant::now());
    let opened = tokio::time::timeout(
        remaining.max(Duration::from_millis(1)),
        ModelSession::open(&deps.model_api_key, settings, None),
    )
    .await;

    let model = match opened {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            let reason = e
                .kind()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "connect_failed".to_string());
            tracing::error!(error = %e, %reason, "model session open failed");
            finalize(&recorder, &mut record, Terminal::Failed(reason.clone())).await;
            carrier.close(&reason).await;
            return record;
        }
        Err(_) => {
            finalize(&recorder, &mut record, Terminal::Failed("setup_timeout".into()))
                .await;
            carrier.close("setup_timeout").await;
            return record;
        }
    };

    // --- InProgress -------------------------------------------------------
    record.status = CallStatus::InProgress;
    recorder.append_event("updated", serde_json::json!({ "status": "in_progress" }));

    let (control_tx, control_rx) = mpsc::channel(4);
    deps.registry.register(&call_id, &agent.id, control_tx);

    let terminal = steady_state(
        &deps,
        &recorder,
        &mut record,
        &mut carrier,
        model,
        control_rx,
    )
    .await;

    deps.registry.unregister(&call_id);
    finalize(&recorder, &mut record, terminal.clone()).await;
    carrier.close(&terminal.outcome()).await;
    record
}

// =============================================================================
// Setup helpers
// =============================================================================

enum StartWait {
    Started(StreamStart),
    Hangup,
    Protocol(String),
    TimedOut,
}

async fn wait_for_start(carrier: &mut CarrierSession, deadline: Instant) -> StartWait {
    loop {
        let event = tokio::select! {
            event = carrier.recv() => event,
            _ = tokio::time::sleep_until(deadline) => return StartWait::TimedOut,
        };
        match event {
            Some(CarrierEvent::Connected) => {
                tracing::debug!("carrier connected; call ringing");
            }
            Some(CarrierEvent::Start(start)) => return StartWait::Started(start),
            Some(CarrierEvent::ProtocolError { detail }) => return StartWait::Protocol(detail),
            Some(CarrierEvent::Stop { .. }) | Some(CarrierEvent::Closed) | None => {
                return StartWait::Hangup
            }
            Some(_) => {}
        }
    }
}

fn blank_record(call_id: &str, started_at: chrono::DateTime<Utc>) -> CallRecord {
    CallRecord::new(
        call_id.to_string(),
        crate::carrier::CallDirection::Inbound,
        String::new(),
        String::new(),
        started_at,
    )
}

/// Create a short-lived recorder just to persist the terminal record of a
/// call that failed before one existed.
async fn finish_with_record(deps: &CallDeps, record: &mut CallRecord, terminal: Terminal) {
    let recorder = Arc::new(CallRecorder::new(
        record.id.clone(),
        deps.store.clone(),
        deps.recorder.clone(),
    ));
    finalize(&recorder, record, terminal).await;
}

/// Stamp terminal state onto the record and flush it.
async fn finalize(recorder: &Arc<CallRecorder>, record: &mut CallRecord, terminal: Terminal) {
    let ended_at = Utc::now();
    record.status = terminal.status();
    if record.outcome.is_none() {
        record.outcome = Some(terminal.outcome());
    }
    record.ended_at = Some(ended_at);
    let millis = (ended_at - record.started_at).num_milliseconds().max(0);
    record.duration_seconds = Some((millis as f64 / 1000.0).round() as i64);
    recorder.append_event(
        "ended",
        serde_json::json!({
            "status": record.status.as_str(),
            "outcome": record.outcome.clone(),
        }),
    );
    recorder.finalize(record.clone()).await;
    if recorder.is_partial() {
        record.record_only_partial = true;
    }
}

// =============================================================================
// Steady state
// =============================================================================

async fn steady_state(
    deps: &CallDeps,
    recorder: &Arc<CallRecorder>,
    record: &mut CallRecord,
    carrier: &mut CarrierSession,
    mut model: ModelSession,
    mut control_rx: mpsc::Receiver<ControlCommand>,
) -> Terminal {
    enum Wake {
        Carrier(Option<CarrierEvent>),
        Model(Option<ModelEvent>),
        Control(Option<ControlCommand>),
        Idle,
    }

    let mut codec = CallCodec::new();
    let mut agent_spoke = false;
    let mut idle_prompted = false;
    let mut idle_deadline = Instant::now() + deps.timing.idle_timeout;
    let mut pending_marks: HashSet<String> = HashSet::new();
    let mut delivered_turns: u32 = 0;
    let mut mark_seq: u32 = 0;
    let mut handovers: u32 = 0;
    let mut backpressure_drops: u64 = 0;
    let mut pending_fail: Option<String> = None;

    let terminal = loop {
        let idle_at = idle_deadline;
        let wake = tokio::select! {
            event = carrier.recv() => Wake::Carrier(event),
            event = model.recv() => Wake::Model(event),
            cmd = control_rx.recv() => Wake::Control(cmd),
            _ = tokio::time::sleep_until(idle_at) => Wake::Idle,
        };

        match wake {
            // ----------------------------------------------------- carrier
            Wake::Carrier(Some(CarrierEvent::Media { payload })) => {
                let pcm = codec.decode_ulaw_to_pcm16k(&payload);
                match model.send_audio(pcm) {
                    Ok(()) => {}
                    Err(SessionError::Backpressure) => {
                        // Draining for handover; intentional drop.
                        backpressure_drops += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "caller audio rejected");
                    }
                }
            }
            Wake::Carrier(Some(CarrierEvent::MarkEcho { name })) => {
                if pending_marks.remove(&name) {
                    delivered_turns += 1;
                    tracing::debug!(%name, delivered_turns, "turn delivered");
                }
            }
            Wake::Carrier(Some(CarrierEvent::Dtmf { digit })) => {
                recorder.append_event("dtmf", serde_json::json!({ "digit": digit.to_string() }));
            }
            Wake::Carrier(Some(CarrierEvent::Stop { .. }))
            | Wake::Carrier(Some(CarrierEvent::Closed))
            | Wake::Carrier(None) => {
                // A hangup before any agent audio is an abandoned call; a
                // hangup mid-conversation completes it with whatever
                // transcript made it out.
                break if agent_spoke {
                    Terminal::Completed
                } else {
                    Terminal::Abandoned
                };
            }
            Wake::Carrier(Some(CarrierEvent::ProtocolError { detail })) => {
                tracing::error!(%detail, "carrier protocol violation");
                break Terminal::Failed("protocol".into());
            }
            Wake::Carrier(Some(CarrierEvent::Connected))
            | Wake::Carrier(Some(CarrierEvent::Start(_))) => {
                tracing::warn!("unexpected duplicate setup frame, ignoring");
            }

            // ------------------------------------------------------- model
            Wake::Model(Some(ModelEvent::AudioOut(pcm))) => {
                if CallCodec::check_pcm_alignment(&pcm).is_err() {
                    tracing::error!(len = pcm.len(), "corrupt model audio payload");
                    break Terminal::Failed("protocol".into());
                }
                match codec.encode_pcm24k_to_ulaw(&pcm) {
                    Ok(ulaw) => {
                        carrier.send_media(&ulaw);
                        agent_spoke = true;
                        idle_deadline = Instant::now() + deps.timing.idle_timeout;
                        idle_prompted = false;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "transcode failed");
                        break Terminal::Failed("protocol".into());
                    }
                }
            }
            Wake::Model(Some(ModelEvent::InputTranscription(text))) => {
                push_transcript(record, "caller", &text);
                recorder.append_event(
                    "transcript",
                    serde_json::json!({ "source": "caller", "text": text }),
                );
                idle_deadline = Instant::now() + deps.timing.idle_timeout;
                idle_prompted = false;
            }
            Wake::Model(Some(ModelEvent::OutputTranscription(text))) => {
                push_transcript(record, "agent", &text);
                recorder.append_event(
                    "transcript",
                    serde_json::json!({ "source": "agent", "text": text }),
                );
            }
            Wake::Model(Some(ModelEvent::Interrupted)) => {
                // Barge-in: the session already dropped its buffered audio;
                // flush ours and tell the carrier to discard queued frames.
                carrier.send_clear().await;
                codec.reset();
                recorder.append_event("updated", serde_json::json!({ "event": "interrupted" }));
            }
            Wake::Model(Some(ModelEvent::TurnComplete)) => {
                mark_seq += 1;
                let name = format!("turn-{mark_seq}");
                pending_marks.insert(name.clone());
                carrier.send_mark(&name);
                idle_deadline = Instant::now() + deps.timing.idle_timeout;
                idle_prompted = false;
            }
            Wake::Model(Some(ModelEvent::GenerationComplete)) => {}
            Wake::Model(Some(ModelEvent::ToolCall(call))) => {
                recorder.append_event(
                    "tool_call",
                    serde_json::json!({
                        "id": call.id.clone(),
                        "name": call.name.clone(),
                        "args": call.args.clone(),
                    }),
                );
                spawn_tool_responder(deps, recorder.clone(), model.handle(), call);
            }
            Wake::Model(Some(ModelEvent::ResumptionUpdate { .. })) => {}
            Wake::Model(Some(ModelEvent::GoAway { time_left })) => {
                tracing::info!(?time_left, "model session approaching its time budget");
            }
            Wake::Model(Some(ModelEvent::HandoverCompleted { blackout })) => {
                if blackout > deps.timing.handover_budget {
                    tracing::error!(
                        ?blackout,
                        budget = ?deps.timing.handover_budget,
                        "session handover exceeded blackout budget"
                    );
                    break Terminal::Failed("session_handover_failed".into());
                }
                handovers += 1;
                recorder.append_event(
                    "updated",
                    serde_json::json!({
                        "event": "session_handover",
                        "blackout_ms": blackout.as_millis() as u64,
                    }),
                );
            }
            Wake::Model(Some(ModelEvent::Error(kind))) => {
                // The matching Closed event decides the break; remember why.
                pending_fail = Some(kind.to_string());
            }
            Wake::Model(Some(ModelEvent::Closed(reason))) => {
                break match reason {
                    CloseReason::Normal => Terminal::Completed,
                    CloseReason::TransportLost => Terminal::Failed(
                        pending_fail.take().unwrap_or_else(|| "transport_lost".into()),
                    ),
                    CloseReason::Fatal(kind) => Terminal::Failed(
                        pending_fail.take().unwrap_or_else(|| kind.to_string()),
                    ),
                };
            }
            Wake::Model(None) => {
                break Terminal::Failed(
                    pending_fail.take().unwrap_or_else(|| "model_session_lost".into()),
                );
            }

            // ----------------------------------------------------- control
            Wake::Control(Some(ControlCommand::EmergencyStop)) => {
                tracing::warn!("emergency stop received");
                break Terminal::Failed("emergency_stop".into());
            }
            Wake::Control(None) => {
                // Registry dropped the sender; treat as no-op.
            }

            // -------------------------------------------------------- idle
            Wake::Idle => {
                if idle_prompted {
                    tracing::info!("second idle timeout; abandoning call");
                    break Terminal::Abandoned;
                }
                idle_prompted = true;
                idle_deadline = Instant::now() + deps.timing.idle_timeout;
                let _ = model
                    .send_text(
                        "(The caller has been silent for a while. \
                         Briefly ask whether they are still there.)",
                    )
                    .await;
            }
        }
    };

    // Completion waits for the outbound queue to drain so the caller hears
    // the tail of the last utterance.
    if matches!(terminal, Terminal::Completed) {
        drain_outbound(carrier, deps.timing.drain_timeout).await;
    }

    model.close().await;

    record.resumption_handle_count = handovers;
    record.dropped_inbound_frames =
        carrier.dropped_inbound() + model.dropped_input_frames() + backpressure_drops;
    record.dropped_outbound_frames = carrier.dropped_outbound();
    tracing::debug!(delivered_turns, handovers, "call leaving steady state");

    terminal
}

/// Append one transcript fragment in arrival order.
fn push_transcript(record: &mut CallRecord, source: &str, text: &str) {
    record.transcript.push_str(source);
    record.transcript.push_str(": ");
    record.transcript.push_str(text);
    record.transcript.push('\n');
}

/// Answer a tool call within the bounded window, stubbing on timeout.
fn spawn_tool_responder(
    deps: &CallDeps,
    recorder: Arc<CallRecorder>,
    handle: crate::model::ModelHandle,
    call: crate::model::FunctionCall,
) {
    let tools = deps.tools.clone();
    let timeout = deps.timing.tool_response_timeout;
    tokio::spawn(async move {
        let response = match tokio::time::timeout(timeout, tools.handle(&call)).await {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(tool = %call.name, "tool handler timed out, stubbing response");
                StubToolHandler::ok_response()
            }
        };
        recorder.append_event(
            "tool_response",
            serde_json::json!({ "id": call.id.clone(), "response": response.clone() }),
        );
        let _ = handle
            .send_tool_response(FunctionResponse {
                id: call.id,
                name: call.name,
                response,
                scheduling: None,
            })
            .await;
    });
}

/// Poll until the carrier's outbound queue is empty or the timeout elapses.
async fn drain_outbound(carrier: &CarrierSession, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while carrier.pending_outbound() > 0 && Instant::now() < deadline {
        tokio::time::sleep(crate::carrier::FRAME_INTERVAL).await;
    }
}
