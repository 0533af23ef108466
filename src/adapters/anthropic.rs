use super::{Frame, FrameStream, SseAction, StreamError, record_parse_error, sse_frames};
use crate::chat::{ChatMessage, Role, system_text};
use crate::config::ProviderKind;
use crate::routing::cheap_model;
use crate::upstream::UpstreamCall;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};

pub fn build_call(
    model: &str,
    system_prompt: &str,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> UpstreamCall {
    let turns: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| json!({ "role": m.role, "content": m.content }))
        .collect();
    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": turns,
        "stream": true,
    });
    let system = system_text(system_prompt, messages);
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    UpstreamCall::post(ProviderKind::Anthropic, "/v1/messages", body)
}

/// There is no key-only endpoint, so the check is a one-token message on
/// the cheapest model.
pub fn key_check_call() -> UpstreamCall {
    UpstreamCall::post(
        ProviderKind::Anthropic,
        "/v1/messages",
        json!({
            "model": cheap_model(ProviderKind::Anthropic),
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        }),
    )
}

/// Maps one Messages-API event to a canonical action. Only non-empty text
/// deltas produce output; lifecycle events and pings are dropped.
pub(crate) fn map_event(data: &str) -> SseAction {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(err) => {
            record_parse_error(ProviderKind::Anthropic, &err);
            return SseAction::Skip;
        }
    };
    match value.get("type").and_then(|v| v.as_str()) {
        Some("content_block_delta") => {
            match value
                .get("delta")
                .and_then(|d| d.get("text"))
                .and_then(|t| t.as_str())
            {
                Some(text) if !text.is_empty() => SseAction::Emit(Frame::text(text)),
                _ => SseAction::Skip,
            }
        }
        Some("error") => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            tracing::warn!(provider = "anthropic", %message, "upstream error event");
            SseAction::Fail(StreamError::Upstream(message))
        }
        _ => SseAction::Skip,
    }
}

pub fn transcode<S>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    sse_frames(ProviderKind::Anthropic, bytes, map_event)
}
