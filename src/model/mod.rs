//! Model-side streaming: one Gemini Live session per call.
//!
//! [`session::ModelSession`] owns the socket and exposes a typed duplex
//! interface; [`config`] holds the enumerated allowed sets and the validated
//! per-call settings; [`messages`] is the wire format.

pub mod config;
pub mod messages;
pub mod session;

pub use config::{
    LiveModel, LiveVoice, SessionSettings, SessionSettingsBuilder, SettingsError, VadSensitivity,
    VadTuning,
};
pub use messages::{FunctionCall, FunctionResponse, ToolScheduling};
pub use session::{
    CloseReason, ErrorKind, ModelEvent, ModelHandle, ModelSession, SessionError, SessionResult,
};
