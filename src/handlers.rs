use crate::adapters;
use crate::app::AppState;
use crate::chat::ChatRequest;
use crate::error::AppResult;
use crate::relay::relay;
use crate::routing::{self, Credentials};
use crate::upstream;
use crate::verify::{self, KeyService};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Routes one conversation to a provider and relays its answer as SSE.
/// Every failure before the upstream accepts the request is a JSON error;
/// once the stream starts, failures only end it.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let request = ChatRequest::decode(&body)?;
    let credentials =
        Credentials::from_headers(&headers, state.runtime.gemini_fallback_key.as_deref());
    let decision = routing::select(request.mode, request.model.as_deref(), &credentials)?;

    tracing::info!(
        provider = %decision.provider,
        model = %decision.model,
        mode = %request.mode,
        messages = request.messages.len(),
        "routing chat request"
    );
    metrics::counter!(
        "chatgate_chat_requests_total",
        "provider" => decision.provider.as_str(),
        "mode" => request.mode.as_str()
    )
    .increment(1);

    let call = adapters::build_call(
        &decision,
        &state.runtime.system_prompt,
        &request.messages,
        &state.runtime.generation,
    );
    let resp = upstream::send(
        &state.http,
        &state.runtime.endpoints,
        &call,
        &decision.credential,
        state.runtime.timeouts.handshake_ms,
    )
    .await
    .inspect_err(|err| {
        metrics::counter!(
            "chatgate_upstream_errors_total",
            "provider" => decision.provider.as_str(),
            "code" => err.code()
        )
        .increment(1);
    })?;

    state.usage.record(&decision, request.mode, &request.messages);

    let bytes = upstream::body_stream(resp, state.runtime.timeouts.idle_ms);
    let frames = adapters::transcode(decision.provider, bytes);
    Ok(Sse::new(relay(decision.provider, frames)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct VerifyKeyRequest {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyKeyResponse {
    pub valid: bool,
    pub message: String,
}

fn verify_rejection(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(VerifyKeyResponse {
            valid: false,
            message: message.into(),
        }),
    )
        .into_response()
}

/// Checks a caller-supplied key with the cheapest authenticated call the
/// service offers. The key is used for that one call and never stored.
pub async fn verify_key(State(state): State<AppState>, body: Bytes) -> Response {
    let request: VerifyKeyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return verify_rejection(format!("invalid request body: {err}")),
    };
    let Some(key) = request
        .key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    else {
        return verify_rejection("Key is required");
    };
    let Some(service) = request.provider.as_deref().and_then(KeyService::parse) else {
        return verify_rejection("Unknown provider");
    };

    let verdict = match verify::check_key(
        &state.http,
        &state.runtime.endpoints,
        &state.runtime.key_check_endpoints,
        service,
        key,
        state.runtime.timeouts.handshake_ms,
    )
    .await
    {
        Ok(verdict) => verdict,
        Err(message) => return verify_rejection(message),
    };
    tracing::info!(
        service = service.display_name(),
        valid = verdict.valid,
        "verified key"
    );
    Json(VerifyKeyResponse {
        valid: verdict.valid,
        message: verdict.message,
    })
    .into_response()
}
