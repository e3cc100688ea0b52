//! Gemini Live session configuration types.
//!
//! This module contains the enumerated allowed sets (models, voices, VAD
//! sensitivities) and the validated, immutable per-call session settings.
//! Validation happens here, before a socket is opened: a configuration that
//! names an unknown model or voice fails the call at setup rather than
//! mid-stream.

use serde::{Deserialize, Serialize};

/// Gemini Live WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// MIME type for realtime input audio (16 kHz PCM mono).
pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";

/// Sample rate of audio received from the model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

// =============================================================================
// Models
// =============================================================================

/// Supported Gemini Live models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LiveModel {
    /// Gemini Live 2.5 Flash preview (default)
    #[default]
    #[serde(rename = "gemini-live-2.5-flash-preview")]
    Live25FlashPreview,
    /// Gemini 2.0 Flash Live
    #[serde(rename = "gemini-2.0-flash-live-001")]
    Flash20Live001,
    /// Gemini 2.5 Flash native-audio dialog preview
    #[serde(rename = "gemini-2.5-flash-preview-native-audio-dialog")]
    Flash25NativeAudioDialog,
}

impl LiveModel {
    /// Convert to the API model identifier.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live25FlashPreview => "gemini-live-2.5-flash-preview",
            Self::Flash20Live001 => "gemini-2.0-flash-live-001",
            Self::Flash25NativeAudioDialog => "gemini-2.5-flash-preview-native-audio-dialog",
        }
    }

    /// Strict parse against the allowed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gemini-live-2.5-flash-preview" => Some(Self::Live25FlashPreview),
            "gemini-2.0-flash-live-001" => Some(Self::Flash20Live001),
            "gemini-2.5-flash-preview-native-audio-dialog" => {
                Some(Self::Flash25NativeAudioDialog)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for LiveModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Voices
// =============================================================================

/// Prebuilt voices available on Gemini Live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LiveVoice {
    /// Puck (default)
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
    Leda,
    Orus,
    Zephyr,
}

impl LiveVoice {
    /// Convert to the API voice name.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
            Self::Leda => "Leda",
            Self::Orus => "Orus",
            Self::Zephyr => "Zephyr",
        }
    }

    /// Strict parse against the allowed set (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "puck" => Some(Self::Puck),
            "charon" => Some(Self::Charon),
            "kore" => Some(Self::Kore),
            "fenrir" => Some(Self::Fenrir),
            "aoede" => Some(Self::Aoede),
            "leda" => Some(Self::Leda),
            "orus" => Some(Self::Orus),
            "zephyr" => Some(Self::Zephyr),
            _ => None,
        }
    }

    /// All voices in the allowed set.
    pub fn all() -> &'static [LiveVoice] {
        &[
            Self::Puck,
            Self::Charon,
            Self::Kore,
            Self::Fenrir,
            Self::Aoede,
            Self::Leda,
            Self::Orus,
            Self::Zephyr,
        ]
    }
}

impl std::fmt::Display for LiveVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// VAD tuning
// =============================================================================

/// Sensitivity levels for automatic activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadSensitivity {
    Low,
    #[default]
    Medium,
    High,
}

impl VadSensitivity {
    /// API value for start-of-speech sensitivity.
    pub fn start_value(&self) -> &'static str {
        match self {
            Self::Low => "START_SENSITIVITY_LOW",
            Self::Medium => "START_SENSITIVITY_MEDIUM",
            Self::High => "START_SENSITIVITY_HIGH",
        }
    }

    /// API value for end-of-speech sensitivity.
    pub fn end_value(&self) -> &'static str {
        match self {
            Self::Low => "END_SENSITIVITY_LOW",
            Self::Medium => "END_SENSITIVITY_MEDIUM",
            Self::High => "END_SENSITIVITY_HIGH",
        }
    }

    /// Strict parse against the allowed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "med" | "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Voice-activity-detection tuning for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VadTuning {
    /// Automatic activity detection disabled; turn markers become manual.
    pub disabled: bool,
    pub start_sensitivity: VadSensitivity,
    pub end_sensitivity: VadSensitivity,
    /// Milliseconds of audio included before a detected speech start.
    pub prefix_padding_ms: u32,
    /// Milliseconds of silence before a turn is considered ended.
    pub silence_duration_ms: u32,
}

impl Default for VadTuning {
    fn default() -> Self {
        Self {
            disabled: false,
            start_sensitivity: VadSensitivity::Medium,
            end_sensitivity: VadSensitivity::Medium,
            prefix_padding_ms: 100,
            silence_duration_ms: 500,
        }
    }
}

// =============================================================================
// Session settings
// =============================================================================

/// Validated, immutable configuration for one model session.
///
/// Built once per call from the resolved agent profile; never mutated after
/// construction. The response modality is always audio and the session never
/// speaks first; it waits for caller audio.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub model: LiveModel,
    pub voice: LiveVoice,
    /// BCP-47 language code, e.g. "en-US".
    pub language: String,
    pub system_prompt: String,
    pub vad: VadTuning,
    pub input_transcription: bool,
    pub output_transcription: bool,
    /// Declare sliding-window context compression for extended sessions.
    pub context_compression: bool,
    /// Endpoint override, used by tests to point at a local mock server.
    pub endpoint: Option<String>,
}

/// Configuration rejected during validation.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown model \"{0}\"")]
    UnknownModel(String),
    #[error("unknown voice \"{0}\"")]
    UnknownVoice(String),
    #[error("unknown VAD sensitivity \"{0}\"")]
    UnknownSensitivity(String),
    #[error("language code must not be empty")]
    EmptyLanguage,
}

/// Builder that validates against the enumerated allowed sets.
#[derive(Debug, Default)]
pub struct SessionSettingsBuilder {
    model: Option<String>,
    voice: Option<String>,
    language: Option<String>,
    system_prompt: String,
    vad: VadTuning,
    vad_start: Option<String>,
    vad_end: Option<String>,
    input_transcription: bool,
    output_transcription: bool,
    context_compression: bool,
    endpoint: Option<String>,
}

impl SessionSettingsBuilder {
    pub fn new() -> Self {
        Self {
            input_transcription: true,
            output_transcription: true,
            ..Default::default()
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn vad(mut self, vad: VadTuning) -> Self {
        self.vad = vad;
        self
    }

    pub fn vad_sensitivities(
        mut self,
        start: impl Into<String>,
        end: impl Into<String>,
    ) -> Self {
        self.vad_start = Some(start.into());
        self.vad_end = Some(end.into());
        self
    }

    pub fn input_transcription(mut self, enabled: bool) -> Self {
        self.input_transcription = enabled;
        self
    }

    pub fn output_transcription(mut self, enabled: bool) -> Self {
        self.output_transcription = enabled;
        self
    }

    pub fn context_compression(mut self, enabled: bool) -> Self {
        self.context_compression = enabled;
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<SessionSettings, SettingsError> {
        let model = match self.model {
            Some(raw) => LiveModel::parse(&raw).ok_or(SettingsError::UnknownModel(raw))?,
            None => LiveModel::default(),
        };
        let voice = match self.voice {
            Some(raw) => LiveVoice::parse(&raw).ok_or(SettingsError::UnknownVoice(raw))?,
            None => LiveVoice::default(),
        };
        let language = match self.language {
            Some(code) if code.trim().is_empty() => return Err(SettingsError::EmptyLanguage),
            Some(code) => code,
            None => "en-US".to_string(),
        };

        let mut vad = self.vad;
        if let Some(raw) = self.vad_start {
            vad.start_sensitivity =
                VadSensitivity::parse(&raw).ok_or(SettingsError::UnknownSensitivity(raw))?;
        }
        if let Some(raw) = self.vad_end {
            vad.end_sensitivity =
                VadSensitivity::parse(&raw).ok_or(SettingsError::UnknownSensitivity(raw))?;
        }

        Ok(SessionSettings {
            model,
            voice,
            language,
            system_prompt: self.system_prompt,
            vad,
            input_transcription: self.input_transcription,
            output_transcription: self.output_transcription,
            context_compression: self.context_compression,
            endpoint: self.endpoint,
        })
    }
}

impl SessionSettings {
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
