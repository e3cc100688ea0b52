//! Voxgate: a real-time voice gateway.
//!
//! Bridges a telephony carrier's media-stream WebSocket (8 kHz μ-law) to a
//! Gemini Live session (16 kHz PCM in, 24 kHz PCM out), one bidirectional
//! pipeline per call: codec, turn-taking, routing, lifecycle recording.

pub mod audio;
pub mod call;
pub mod carrier;
pub mod config;
pub mod handlers;
pub mod model;
pub mod persistence;
pub mod routes;
pub mod routing;
pub mod state;

pub use config::GatewayConfig;
pub use state::AppState;
