//! Carrier media-stream WebSocket frame types.
//!
//! The carrier speaks JSON text frames tagged by an `event` field. Inbound
//! media is base64 μ-law at 8 kHz in 20 ms frames; outbound frames use the
//! same shape. `mark` frames we send are echoed back by the carrier once the
//! audio queued before them has been played out.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Direction of a call as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Wire frames
// =============================================================================

/// One carrier protocol frame, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamFrame {
    /// Socket-level hello, before any call state exists.
    Connected {
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },

    /// Media stream begins; carries the stream and call identifiers.
    Start {
        #[serde(rename = "sequenceNumber", skip_serializing_if = "Option::is_none")]
        sequence_number: Option<String>,
        start: StartMeta,
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },

    /// One 20 ms frame of base64 μ-law audio.
    Media {
        #[serde(rename = "sequenceNumber", skip_serializing_if = "Option::is_none")]
        sequence_number: Option<String>,
        media: MediaMeta,
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },

    /// Marker frame; echoed by the carrier once preceding audio played out.
    Mark {
        mark: MarkMeta,
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },

    /// A DTMF keypress from the caller.
    Dtmf {
        dtmf: DtmfMeta,
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },

    /// The media stream ended on the carrier side.
    Stop {
        #[serde(skip_serializing_if = "Option::is_none")]
        stop: Option<StopMeta>,
        #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
        stream_sid: Option<String>,
    },

    /// Instruct the carrier to discard queued outbound audio.
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Metadata carried by the `start` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<String>,
    /// Parameters injected at stream creation (`from`, `to`, `direction`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_parameters: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Base64-encoded μ-law payload.
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkMeta {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DtmfMeta {
    pub digit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

impl StreamFrame {
    /// Build an outbound media frame from a base64 payload.
    pub fn media(stream_sid: &str, payload_b64: String) -> Self {
        Self::Media {
            sequence_number: None,
            media: MediaMeta {
                track: None,
                chunk: None,
                timestamp: None,
                payload: payload_b64,
            },
            stream_sid: Some(stream_sid.to_string()),
        }
    }

    /// Build an outbound mark frame.
    pub fn mark(stream_sid: &str, name: &str) -> Self {
        Self::Mark {
            mark: MarkMeta {
                name: name.to_string(),
            },
            stream_sid: Some(stream_sid.to_string()),
        }
    }

    /// Build an outbound clear frame.
    pub fn clear(stream_sid: &str) -> Self {
        Self::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
