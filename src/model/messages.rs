//! Gemini Live WebSocket message types.
//!
//! Client messages are typed `Serialize` structs mirroring the
//! BidiGenerateContent JSON shapes. Server messages arrive as JSON (often in
//! Binary frames) and one frame can carry several logical events, so parsing
//! goes through [`parse_server_frame`] which returns a list.
//!
//! # Protocol overview
//!
//! Client → server:
//! - `setup`: full session configuration, first message on the socket
//! - `realtimeInput.audio`: base64 PCM chunk
//! - `realtimeInput.audioStreamEnd`: intentional end of input audio
//! - `realtimeInput.activityStart` / `activityEnd`: manual turn markers
//! - `clientContent`: synthetic user turn (tests, tool plumbing)
//! - `toolResponse`: function responses for a `toolCall`
//!
//! Server → client:
//! - `setupComplete`: configuration acknowledged
//! - `serverContent`: audio/text parts, `interrupted`, `turnComplete`,
//!   `generationComplete`, input/output transcriptions
//! - `toolCall`: function call requests
//! - `sessionResumptionUpdate`: new resumption handle
//! - `goAway`: server-imposed time budget warning
//! - `error`: terminal error

use base64::prelude::*;
use serde::Serialize;
use serde_json::Value;

use super::config::{SessionSettings, INPUT_AUDIO_MIME};

// =============================================================================
// Setup
// =============================================================================

/// Top-level setup message sent as the first frame of a session.
#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    pub realtime_input_config: RealtimeInputConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_compression: Option<ContextWindowCompression>,
}

/// Marker object for enable-by-presence configuration blocks.
#[derive(Debug, Serialize, Default)]
pub struct EmptyConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputConfig {
    pub automatic_activity_detection: AutomaticActivityDetection,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticActivityDetection {
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_of_speech_sensitivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_of_speech_sensitivity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
}

/// Requests resumption of a previous session when `handle` is present,
/// otherwise asks the server to start issuing handles.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Declares sliding-window compression; the window itself is server-side.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowCompression {
    pub sliding_window: EmptyConfig,
}

/// Build the setup message for a call from its frozen settings.
pub fn build_setup(settings: &SessionSettings, resume_handle: Option<&str>) -> SetupMessage {
    let vad = &settings.vad;
    SetupMessage {
        setup: SetupPayload {
            model: format!("models/{}", settings.model.as_str()),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: settings.voice.as_str().to_string(),
                        },
                    },
                    language_code: Some(settings.language.clone()),
                }),
            },
            system_instruction: if settings.system_prompt.is_empty() {
                None
            } else {
                Some(SystemInstruction {
                    parts: vec![TextPart {
                        text: settings.system_prompt.clone(),
                    }],
                })
            },
            realtime_input_config: RealtimeInputConfig {
                automatic_activity_detection: AutomaticActivityDetection {
                    disabled: vad.disabled,
                    start_of_speech_sensitivity: Some(
                        vad.start_sensitivity.start_value().to_string(),
                    ),
                    end_of_speech_sensitivity: Some(vad.end_sensitivity.end_value().to_string()),
                    prefix_padding_ms: Some(vad.prefix_padding_ms),
                    silence_duration_ms: Some(vad.silence_duration_ms),
                },
            },
            input_audio_transcription: settings.input_transcription.then(EmptyConfig::default),
            output_audio_transcription: settings.output_transcription.then(EmptyConfig::default),
            // Always ask for handles so a mid-call handover has one to use.
            session_resumption: Some(SessionResumptionConfig {
                handle: resume_handle.map(str::to_string),
            }),
            context_window_compression: settings.context_compression.then(|| {
                ContextWindowCompression {
                    sliding_window: EmptyConfig::default(),
                }
            }),
        },
    }
}

// =============================================================================
// Realtime input
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_start: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activity_end: Option<EmptyConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioBlob {
    pub mime_type: String,
    /// Base64-encoded PCM.
    pub data: String,
}

impl RealtimeInputMessage {
    /// Wrap a 16 kHz PCM chunk for transmission.
    pub fn audio(pcm: &[u8]) -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: Some(AudioBlob {
                    mime_type: INPUT_AUDIO_MIME.to_string(),
                    data: BASE64_STANDARD.encode(pcm),
                }),
                audio_stream_end: None,
                activity_start: None,
                activity_end: None,
            },
        }
    }

    /// Announce intentional end of the input audio stream.
    pub fn audio_stream_end() -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: None,
                audio_stream_end: Some(true),
                activity_start: None,
                activity_end: None,
            },
        }
    }

    /// Manual start-of-turn marker, used when automatic VAD is disabled.
    pub fn activity_start() -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: None,
                audio_stream_end: None,
                activity_start: Some(EmptyConfig::default()),
                activity_end: None,
            },
        }
    }

    /// Manual end-of-turn marker, used when automatic VAD is disabled.
    pub fn activity_end() -> Self {
        Self {
            realtime_input: RealtimeInput {
                audio: None,
                audio_stream_end: None,
                activity_start: None,
                activity_end: Some(EmptyConfig::default()),
            },
        }
    }
}

// =============================================================================
// Client content and tool responses
// =============================================================================

/// Build a synthetic user text turn.
pub fn build_text_turn(text: &str) -> Value {
    serde_json::json!({
        "clientContent": {
            "turns": [{
                "role": "user",
                "parts": [{ "text": text }]
            }],
            "turnComplete": true,
        }
    })
}

/// How the model should schedule handling of a tool response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolScheduling {
    /// Block generation until the response is incorporated.
    #[default]
    Blocking,
    /// Interrupt the current generation.
    Interrupt,
    /// Fold in when the model is idle.
    WhenIdle,
    /// Incorporate without producing output.
    Silent,
}

impl ToolScheduling {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blocking" => Some(Self::Blocking),
            "interrupt" => Some(Self::Interrupt),
            "when-idle" | "when_idle" => Some(Self::WhenIdle),
            "silent" => Some(Self::Silent),
            _ => None,
        }
    }
}

/// One completed function response.
#[derive(Debug, Clone, Serialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<ToolScheduling>,
}

/// Build a `toolResponse` frame.
pub fn build_tool_response(responses: &[FunctionResponse]) -> Value {
    serde_json::json!({
        "toolResponse": {
            "functionResponses": responses,
        }
    })
}

// =============================================================================
// Server events
// =============================================================================

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// One logical event parsed from a server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Configuration acknowledged; realtime input may begin.
    SetupComplete,
    /// Audio chunk from the model (24 kHz PCM s16le).
    Audio { data: Vec<u8> },
    /// Transcription of caller speech.
    InputTranscription { text: String },
    /// Transcription of model speech.
    OutputTranscription { text: String },
    /// The caller spoke over the model; buffered output is stale.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// Generation for the current turn is complete.
    GenerationComplete,
    /// The model requests function executions.
    ToolCall { calls: Vec<FunctionCall> },
    /// New resumption handle issued by the server.
    ResumptionUpdate { handle: String, resumable: bool },
    /// The server will close the connection after `time_left_ms`.
    GoAway { time_left_ms: u64 },
    /// Server-reported error.
    Error { message: String },
}

/// Parse one server frame into its logical events.
///
/// Gemini Live sends all frames, including JSON control messages, as
/// WebSocket Binary; callers pass the raw bytes here after checking for a
/// leading `{`. Unknown fields are ignored.
pub fn parse_server_frame(raw: &str) -> Vec<ServerEvent> {
    let mut events = Vec::new();

    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            events.push(ServerEvent::Error {
                message: format!("unparseable server frame: {e}"),
            });
            return events;
        }
    };

    if value.get("setupComplete").is_some() {
        events.push(ServerEvent::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::Interrupted);
        }

        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(inline) = part.get("inlineData") {
                    if let Some(data_b64) = inline.get("data").and_then(Value::as_str) {
                        match BASE64_STANDARD.decode(data_b64) {
                            Ok(data) => events.push(ServerEvent::Audio { data }),
                            Err(e) => events.push(ServerEvent::Error {
                                message: format!("undecodable audio part: {e}"),
                            }),
                        }
                    }
                }
            }
        }

        if let Some(text) = content
            .pointer("/inputTranscription/text")
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                events.push(ServerEvent::InputTranscription {
                    text: text.to_string(),
                });
            }
        }
        if let Some(text) = content
            .pointer("/outputTranscription/text")
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                events.push(ServerEvent::OutputTranscription {
                    text: text.to_string(),
                });
            }
        }

        if content.get("generationComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::GenerationComplete);
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ServerEvent::TurnComplete);
        }
    }

    // Transcriptions also appear at the top level on some protocol versions.
    for (key, variant) in [
        ("inputTranscription", 0u8),
        ("outputTranscription", 1u8),
    ] {
        if let Some(text) = value
            .get(key)
            .and_then(|t| t.get("text"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                let event = if variant == 0 {
                    ServerEvent::InputTranscription {
                        text: text.to_string(),
                    }
                } else {
                    ServerEvent::OutputTranscription {
                        text: text.to_string(),
                    }
                };
                if !events.contains(&event) {
                    events.push(event);
                }
            }
        }
    }

    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        let calls: Vec<FunctionCall> = calls
            .iter()
            .filter_map(|c| {
                Some(FunctionCall {
                    id: c.get("id").and_then(Value::as_str)?.to_string(),
                    name: c.get("name").and_then(Value::as_str)?.to_string(),
                    args: c.get("args").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        if !calls.is_empty() {
            events.push(ServerEvent::ToolCall { calls });
        }
    }

    if let Some(update) = value.get("sessionResumptionUpdate") {
        if let Some(handle) = update.get("newHandle").and_then(Value::as_str) {
            if !handle.is_empty() {
                events.push(ServerEvent::ResumptionUpdate {
                    handle: handle.to_string(),
                    resumable: update
                        .get("resumable")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                });
            }
        }
    }

    if let Some(go_away) = value.get("goAway") {
        let time_left_ms = go_away
            .get("timeLeft")
            .and_then(Value::as_str)
            .and_then(parse_duration_ms)
            .unwrap_or(0);
        events.push(ServerEvent::GoAway { time_left_ms });
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown server error");
        events.push(ServerEvent::Error {
            message: message.to_string(),
        });
    }

    events
}

/// Parse a protobuf-style duration string ("5s", "12.5s") to milliseconds.
fn parse_duration_ms(s: &str) -> Option<u64> {
    let trimmed = s.strip_suffix('s').unwrap_or(s);
    trimmed.parse::<f64>().ok().map(|secs| (secs * 1000.0) as u64)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::SessionSettings;

    fn settings() -> SessionSettings {
        SessionSettings::builder()
            .model("gemini-2.0-flash-live-001")
            .voice("Puck")
            .language("en-US")
            .system_prompt("You answer the phone.")
            .build()
            .unwrap()
    }

    #[test]
    fn setup_serializes_expected_fields() {
        let msg = build_setup(&settings(), None);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"setup\""));
        assert!(json.contains("models/gemini-2.0-flash-live-001"));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("automaticActivityDetection"));
        assert!(json.contains("inputAudioTranscription"));
        assert!(json.contains("outputAudioTranscription"));
        assert!(json.contains("sessionResumption"));
        assert!(!json.contains("contextWindowCompression"));
    }

    #[test]
    fn setup_carries_resume_handle() {
        let msg = build_setup(&settings(), Some("handle-123"));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"handle\":\"handle-123\""));
    }

    #[test]
    fn setup_declares_compression_when_requested() {
        let settings = SessionSettings::builder()
            .context_compression(true)
            .build()
            .unwrap();
        let json = serde_json::to_string(&build_setup(&settings, None)).unwrap();
        assert!(json.contains("contextWindowCompression"));
        assert!(json.contains("slidingWindow"));
    }

    #[test]
    fn audio_message_encodes_base64() {
        let msg = RealtimeInputMessage::audio(&[1, 2, 3, 4]);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(INPUT_AUDIO_MIME));
        assert!(json.contains(&BASE64_STANDARD.encode([1u8, 2, 3, 4])));
        assert!(!json.contains("audioStreamEnd"));
    }

    #[test]
    fn stream_end_message_is_minimal() {
        let json =
            serde_json::to_string(&RealtimeInputMessage::audio_stream_end()).unwrap();
        assert!(json.contains("\"audioStreamEnd\":true"));
        assert!(!json.contains("mimeType"));
    }

    #[test]
    fn tool_response_serializes_scheduling() {
        let frame = build_tool_response(&[FunctionResponse {
            id: "call-1".into(),
            name: "lookup".into(),
            response: serde_json::json!({"result": "ok"}),
            scheduling: Some(ToolScheduling::WhenIdle),
        }]);
        let json = frame.to_string();
        assert!(json.contains("functionResponses"));
        assert!(json.contains("WHEN_IDLE"));
        assert!(json.contains("call-1"));
    }

    #[test]
    fn parse_setup_complete() {
        let events = parse_server_frame(r#"{"setupComplete": {}}"#);
        assert_eq!(events, vec![ServerEvent::SetupComplete]);
    }

    #[test]
    fn parse_audio_part() {
        let b64 = BASE64_STANDARD.encode([9u8, 8, 7]);
        let raw = format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{b64}"}}}}]}}}}}}"#
        );
        let events = parse_server_frame(&raw);
        assert_eq!(events, vec![ServerEvent::Audio { data: vec![9, 8, 7] }]);
    }

    #[test]
    fn parse_interrupted_and_turn_complete_order() {
        let raw = r#"{"serverContent":{"interrupted":true,"turnComplete":true}}"#;
        let events = parse_server_frame(raw);
        assert_eq!(
            events,
            vec![ServerEvent::Interrupted, ServerEvent::TurnComplete]
        );
    }

    #[test]
    fn parse_transcriptions_in_server_content() {
        let raw = r#"{"serverContent":{"inputTranscription":{"text":"hello"},"outputTranscription":{"text":"hi there"}}}"#;
        let events = parse_server_frame(raw);
        assert!(events.contains(&ServerEvent::InputTranscription {
            text: "hello".into()
        }));
        assert!(events.contains(&ServerEvent::OutputTranscription {
            text: "hi there".into()
        }));
    }

    #[test]
    fn parse_tool_call() {
        let raw = r#"{"toolCall":{"functionCalls":[{"id":"f1","name":"transfer","args":{"to":"+15550001111"}}]}}"#;
        let events = parse_server_frame(raw);
        match &events[0] {
            ServerEvent::ToolCall { calls } => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "f1");
                assert_eq!(calls[0].name, "transfer");
                assert_eq!(calls[0].args["to"], "+15550001111");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn parse_resumption_update() {
        let raw = r#"{"sessionResumptionUpdate":{"newHandle":"h-42","resumable":true}}"#;
        let events = parse_server_frame(raw);
        assert_eq!(
            events,
            vec![ServerEvent::ResumptionUpdate {
                handle: "h-42".into(),
                resumable: true
            }]
        );
    }

    #[test]
    fn parse_go_away_duration() {
        let raw = r#"{"goAway":{"timeLeft":"5s"}}"#;
        let events = parse_server_frame(raw);
        assert_eq!(events, vec![ServerEvent::GoAway { time_left_ms: 5000 }]);
    }

    #[test]
    fn parse_invalid_json_yields_error() {
        let events = parse_server_frame("definitely not json");
        assert!(matches!(events[0], ServerEvent::Error { .. }));
    }

    #[test]
    fn parse_empty_transcription_is_skipped() {
        let raw = r#"{"inputTranscription":{"text":""}}"#;
        assert!(parse_server_frame(raw).is_empty());
    }
}
