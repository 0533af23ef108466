pub mod anthropic;
pub mod gemini;
pub mod openai;

use crate::chat::ChatMessage;
use crate::config::{GenerationConfig, ProviderKind};
use crate::routing::RoutingDecision;
use crate::upstream::UpstreamCall;
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;

pub const DONE_MARKER: &str = "[DONE]";

/// One client-facing SSE payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON payload of a `data:` line.
    Delta(String),
    Done,
}

impl Frame {
    pub fn text(content: &str) -> Self {
        Frame::Delta(json!({ "choices": [{ "delta": { "content": content } }] }).to_string())
    }

    pub fn payload(&self) -> &str {
        match self {
            Frame::Delta(data) => data,
            Frame::Done => DONE_MARKER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("no upstream data for {0}ms")]
    IdleTimeout(u64),
    #[error("upstream reported an error mid-stream: {0}")]
    Upstream(String),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, StreamError>> + Send>>;

pub fn build_call(
    decision: &RoutingDecision,
    system_prompt: &str,
    messages: &[ChatMessage],
    generation: &GenerationConfig,
) -> UpstreamCall {
    match decision.provider {
        ProviderKind::Openai => openai::build_call(&decision.model, system_prompt, messages),
        ProviderKind::Anthropic => anthropic::build_call(
            &decision.model,
            system_prompt,
            messages,
            generation.anthropic_max_tokens,
        ),
        ProviderKind::Gemini => {
            gemini::build_call(&decision.model, system_prompt, messages, generation)
        }
    }
}

/// Minimal authenticated request used to check a caller's key.
pub fn key_check_call(provider: ProviderKind) -> UpstreamCall {
    match provider {
        ProviderKind::Openai => openai::key_check_call(),
        ProviderKind::Anthropic => anthropic::key_check_call(),
        ProviderKind::Gemini => gemini::key_check_call(),
    }
}

/// Turns an upstream body into canonical [`Frame`]s. Transcoders are plain
/// stream transforms over `Result<Bytes, StreamError>`.
pub fn transcode<S>(provider: ProviderKind, bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    match provider {
        ProviderKind::Openai => openai::transcode(bytes),
        ProviderKind::Anthropic => anthropic::transcode(bytes),
        ProviderKind::Gemini => gemini::transcode(bytes),
    }
}

/// Malformed fragments are skipped, never fatal; they are counted so a
/// misbehaving upstream stays visible.
pub(crate) fn record_parse_error(provider: ProviderKind, err: &dyn std::fmt::Display) {
    metrics::counter!("chatgate_stream_parse_errors_total", "provider" => provider.as_str())
        .increment(1);
    tracing::debug!(provider = %provider, error = %err, "skipping malformed stream fragment");
}

/// What an SSE-speaking adapter does with one event's data.
pub(crate) enum SseAction {
    Emit(Frame),
    Skip,
    Finish,
    Fail(StreamError),
}

/// Shared driver for upstreams that already speak SSE. A clean end of the
/// body yields `Frame::Done`; transport failures end the stream without it.
pub(crate) fn sse_frames<S, F>(provider: ProviderKind, bytes: S, on_data: F) -> FrameStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
    F: FnMut(&str) -> SseAction + Send + 'static,
{
    let events = Box::pin(bytes.eventsource());
    let stream = futures_util::stream::unfold(Some((events, on_data)), move |state| async move {
        let (mut events, mut on_data) = state?;
        loop {
            let data = match events.next().await {
                None => return Some((Ok(Frame::Done), None)),
                Some(Err(EventStreamError::Transport(err))) => return Some((Err(err), None)),
                Some(Err(err)) => {
                    record_parse_error(provider, &err);
                    continue;
                }
                Some(Ok(event)) => event.data,
            };
            match on_data(&data) {
                SseAction::Emit(frame) => return Some((Ok(frame), Some((events, on_data)))),
                SseAction::Skip => continue,
                SseAction::Finish => return Some((Ok(Frame::Done), None)),
                SseAction::Fail(err) => return Some((Err(err), None)),
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{Frame, FrameStream, StreamError};
    use bytes::Bytes;
    use futures_util::StreamExt;

    pub fn feed(
        chunks: &[&str],
    ) -> impl futures_util::Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        let owned: Vec<Result<Bytes, StreamError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        futures_util::stream::iter(owned)
    }

    pub async fn collect(stream: FrameStream) -> Vec<Result<Frame, StreamError>> {
        stream.collect().await
    }

    pub fn content_of(frame: &Frame) -> Option<String> {
        let Frame::Delta(data) = frame else {
            return None;
        };
        let value: serde_json::Value = serde_json::from_str(data).ok()?;
        value["choices"][0]["delta"]["content"]
            .as_str()
            .map(|s| s.to_string())
    }
}
