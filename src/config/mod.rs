//! Process configuration.
//!
//! Configuration comes from the environment (with `.env` loaded by the
//! binary before this runs). Missing required variables fail startup with a
//! descriptive error and a non-zero exit; optional settings fall back to
//! documented defaults.

use std::collections::HashSet;

use thiserror::Error;

/// Default listener bind address.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Default carrier media WebSocket path.
const DEFAULT_MEDIA_PATH: &str = "/twilio";

/// Configuration errors at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {detail}")]
    InvalidVar { name: &'static str, detail: String },
}

/// Everything the gateway needs from its environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Carrier account SID.
    pub carrier_account_sid: String,
    /// Carrier auth token.
    pub carrier_auth_token: String,
    /// Number outbound calls are placed from.
    pub carrier_dialout_number: String,
    /// Model API key.
    pub model_api_key: String,
    /// Persistence service base URL.
    pub store_url: String,
    /// Persistence service API key.
    pub store_api_key: String,
    /// Listener bind address, e.g. "0.0.0.0:8080".
    pub bind_addr: String,
    /// Path the carrier connects its media WebSocket to.
    pub media_path: String,
    /// Publicly reachable base URL, used for dial-out callback URLs.
    pub public_url: Option<String>,
    /// Numbers that must never be connected.
    pub do_not_call: HashSet<String>,
    /// Override for the model VAD silence duration, milliseconds.
    pub vad_silence_ms: Option<u32>,
    /// Override for the model VAD prefix padding, milliseconds.
    pub vad_prefix_ms: Option<u32>,
}

impl GatewayConfig {
    /// Load from process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            carrier_account_sid: require("TWILIO_ACCOUNT_SID")?,
            carrier_auth_token: require("TWILIO_AUTH_TOKEN")?,
            carrier_dialout_number: require("TWILIO_PHONE_NUMBER")?,
            model_api_key: require("GEMINI_API_KEY")?,
            store_url: require("STORE_URL")?,
            store_api_key: require("STORE_API_KEY")?,
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            media_path: optional("MEDIA_WS_PATH")
                .unwrap_or_else(|| DEFAULT_MEDIA_PATH.to_string()),
            public_url: optional("PUBLIC_URL").map(|url| url.trim_end_matches('/').to_string()),
            do_not_call: optional("DNC_NUMBERS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            vad_silence_ms: parse_optional("VAD_SILENCE_MS")?,
            vad_prefix_ms: parse_optional("VAD_PREFIX_MS")?,
        })
    }

    /// The media WebSocket URL the carrier should connect back to.
    pub fn media_callback_url(&self) -> Option<String> {
        self.public_url.as_ref().map(|base| {
            let ws_base = base
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1);
            format!("{}{}", ws_base, self.media_path)
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_optional(name: &'static str) -> Result<Option<u32>, ConfigError> {
    match optional(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                name,
                detail: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GatewayConfig {
        GatewayConfig {
            carrier_account_sid: "AC".into(),
            carrier_auth_token: "tok".into(),
            carrier_dialout_number: "+15550000000".into(),
            model_api_key: "key".into(),
            store_url: "https://store.example".into(),
            store_api_key: "key".into(),
            bind_addr: DEFAULT_BIND_ADDR.into(),
            media_path: "/twilio".into(),
            public_url: Some("https://gw.example.com".into()),
            do_not_call: HashSet::new(),
            vad_silence_ms: None,
            vad_prefix_ms: None,
        }
    }

    #[test]
    fn media_callback_url_switches_scheme() {
        assert_eq!(
            sample().media_callback_url().as_deref(),
            Some("wss://gw.example.com/twilio")
        );
    }

    #[test]
    fn media_callback_absent_without_public_url() {
        let mut config = sample();
        config.public_url = None;
        assert!(config.media_callback_url().is_none());
    }
}
