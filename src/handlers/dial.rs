//! Outbound dialing: the carrier REST dial API and the TwiML callback.
//!
//! `POST /dialout` asks the carrier to place a call; when the callee
//! answers, the carrier fetches TwiML from `POST /twiml`, which points the
//! media stream back at this gateway's WebSocket path with the call tuple
//! attached as stream parameters.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DialRequest {
    /// Number to call.
    pub to: String,
}

/// `POST /dialout`: place an outbound call via the carrier REST API.
pub async fn dialout_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DialRequest>,
) -> impl IntoResponse {
    let Some(public_url) = state.config.public_url.clone() else {
        return (
            StatusCode::PRECONDITION_FAILED,
            Json(json!({ "error": "PUBLIC_URL is not configured; dial-out disabled" })),
        )
            .into_response();
    };
    let twiml_url = format!("{public_url}/twiml");

    let account_sid = &state.config.carrier_account_sid;
    let response = state
        .http
        .post(format!(
            "https://api.twilio.com/2010-04-01/Accounts/{account_sid}/Calls.json"
        ))
        .basic_auth(account_sid, Some(&state.config.carrier_auth_token))
        .form(&[
            ("To", request.to.as_str()),
            ("From", state.config.carrier_dialout_number.as_str()),
            ("Url", twiml_url.as_str()),
            ("Method", "POST"),
        ])
        .send()
        .await;

    match response {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().await.unwrap_or(json!({}));
            let call_sid = body["sid"].as_str().unwrap_or("unknown");
            info!(call_sid, to = %request.to, "outbound call placed");
            Json(json!({
                "status": "dialing",
                "call_sid": call_sid,
                "to": request.to,
            }))
            .into_response()
        }
        Ok(r) => {
            let status = r.status();
            let body: serde_json::Value = r.json().await.unwrap_or(json!({}));
            error!(%status, ?body, "carrier dial API rejected the call");
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": body }))).into_response()
        }
        Err(e) => {
            error!(error = %e, "carrier dial API unreachable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Form fields the carrier posts when fetching call instructions.
#[derive(Debug, Deserialize)]
pub struct TwimlRequest {
    #[serde(rename = "To", default)]
    pub to: String,
    #[serde(rename = "From", default)]
    pub from: String,
}

/// `POST /twiml`: instructions telling the carrier to open the media
/// stream toward this gateway.
pub async fn twiml_handler(
    State(state): State<Arc<AppState>>,
    axum::Form(request): axum::Form<TwimlRequest>,
) -> impl IntoResponse {
    let Some(ws_url) = state.config.media_callback_url() else {
        return (
            StatusCode::PRECONDITION_FAILED,
            Html("PUBLIC_URL is not configured".to_string()),
        )
            .into_response();
    };

    let twiml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
  <Connect>
    <Stream url="{ws_url}">
      <Parameter name="direction" value="outbound"/>
      <Parameter name="from" value="{from}"/>
      <Parameter name="to" value="{to}"/>
    </Stream>
  </Connect>
  <Pause length="120"/>
</Response>"#,
        ws_url = ws_url,
        from = xml_escape(&request.from),
        to = xml_escape(&request.to),
    );
    Html(twiml).into_response()
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xml_escape_covers_attribute_characters() {
        assert_eq!(xml_escape(r#"<a&"b>"#), "&lt;a&amp;&quot;b&gt;");
        assert_eq!(xml_escape("+15550001111"), "+15550001111");
    }
}
