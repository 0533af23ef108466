use super::{DONE_MARKER, Frame, FrameStream, SseAction, StreamError, sse_frames};
use crate::chat::ChatMessage;
use crate::config::ProviderKind;
use crate::upstream::UpstreamCall;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};

pub fn build_call(model: &str, system_prompt: &str, messages: &[ChatMessage]) -> UpstreamCall {
    let mut upstream_messages = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        upstream_messages.push(json!({ "role": "system", "content": system_prompt }));
    }
    upstream_messages.extend(
        messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content })),
    );
    UpstreamCall::post(
        ProviderKind::Openai,
        "/v1/chat/completions",
        json!({
            "model": model,
            "messages": Value::Array(upstream_messages),
            "stream": true,
        }),
    )
}

/// Cheapest authenticated call: listing models needs a valid key and
/// nothing else.
pub fn key_check_call() -> UpstreamCall {
    UpstreamCall::get(ProviderKind::Openai, "/v1/models")
}

/// Chat-completions chunks already carry the canonical shape, so payloads
/// are forwarded verbatim.
pub fn transcode<S>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    sse_frames(ProviderKind::Openai, bytes, |data| {
        let data = data.trim();
        if data == DONE_MARKER {
            SseAction::Finish
        } else if data.is_empty() {
            SseAction::Skip
        } else {
            SseAction::Emit(Frame::Delta(data.to_string()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{collect, content_of, feed};
    use crate::chat::Role;

    #[test]
    fn request_prepends_system_prompt() {
        let call = build_call(
            "gpt-4o",
            "be helpful",
            &[ChatMessage::new(Role::User, "hi")],
        );
        assert_eq!(call.path, "/v1/chat/completions");
        let body = call.body.unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be helpful");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "hi");
    }

    #[tokio::test]
    async fn chunks_pass_through_and_done_terminates() {
        let chunk_a = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let chunk_b = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"lo"}}]}"#;
        let body = format!("data: {chunk_a}\n\ndata: {chunk_b}\n\ndata: [DONE]\n\n");
        let (first, second) = body.split_at(body.len() / 2);
        let frames = collect(transcode(feed(&[first, second]))).await;
        assert_eq!(
            frames,
            vec![
                Ok(Frame::Delta(chunk_a.to_string())),
                Ok(Frame::Delta(chunk_b.to_string())),
                Ok(Frame::Done),
            ]
        );
        assert_eq!(
            content_of(frames[0].as_ref().unwrap()).as_deref(),
            Some("Hel")
        );
    }

    #[tokio::test]
    async fn clean_close_without_marker_still_completes() {
        let frames = collect(transcode(feed(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
        ])))
        .await;
        assert_eq!(frames.last(), Some(&Ok(Frame::Done)));
    }

    #[tokio::test]
    async fn transport_error_ends_without_done() {
        let items = vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n",
            )),
            Err(StreamError::Transport("reset".to_string())),
        ];
        let frames = collect(transcode(futures_util::stream::iter(items))).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_ok());
        assert_eq!(
            frames[1],
            Err(StreamError::Transport("reset".to_string()))
        );
    }
}
