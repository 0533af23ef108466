use super::{Frame, FrameStream, StreamError, record_parse_error};
use crate::chat::{ChatMessage, Role, system_text};
use crate::config::{GenerationConfig, ProviderKind};
use crate::upstream::UpstreamCall;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::{Value, json};
use std::collections::VecDeque;

const MODEL_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_');

pub fn build_call(
    model: &str,
    system_prompt: &str,
    messages: &[ChatMessage],
    generation: &GenerationConfig,
) -> UpstreamCall {
    let contents: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant {
                "model"
            } else {
                "user"
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();
    let mut body = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": generation.gemini_temperature,
            "maxOutputTokens": generation.gemini_max_output_tokens,
        },
    });
    let system = system_text(system_prompt, messages);
    if !system.is_empty() {
        body["system_instruction"] = json!({ "parts": [{ "text": system }] });
    }
    let path = format!(
        "/v1beta/models/{}:streamGenerateContent",
        utf8_percent_encode(model, MODEL_SEGMENT)
    );
    UpstreamCall::post(ProviderKind::Gemini, path, body)
}

pub fn key_check_call() -> UpstreamCall {
    UpstreamCall::get(ProviderKind::Gemini, "/v1beta/models")
}

/// Incremental extractor for concatenated JSON objects.
///
/// Text is appended with [`push`](Self::push); [`next_object`](Self::next_object)
/// returns each complete top-level `{...}` once its closing brace has
/// arrived. Braces inside string literals do not count toward nesting, and a
/// backslash escapes the character after it, so `\"` never toggles string
/// state. Scan progress survives across pushes, so a large object split over
/// many reads is scanned once.
#[derive(Debug, Default)]
pub struct JsonObjectExtractor {
    buffer: String,
    utf8_tail: Vec<u8>,
    /// True once `buffer` starts with the `{` of the object being scanned.
    in_object: bool,
    cursor: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw bytes. A UTF-8 sequence cut at the end of `chunk` is held
    /// back until the rest of it arrives.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut pending = std::mem::take(&mut self.utf8_tail);
        pending.extend_from_slice(chunk);
        let mut rest: &[u8] = &pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.buffer
                        .push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    pub fn next_object(&mut self) -> Option<String> {
        if !self.in_object {
            let Some(open) = self.buffer.find('{') else {
                // Only separators (`[`, `,`, whitespace) so far.
                self.buffer.clear();
                return None;
            };
            self.buffer.drain(..open);
            self.in_object = true;
            self.cursor = 0;
            self.depth = 0;
            self.in_string = false;
            self.escaped = false;
        }

        let bytes = self.buffer.as_bytes();
        for idx in self.cursor..bytes.len() {
            let b = bytes[idx];
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let end = idx + 1;
                        let object: String = self.buffer.drain(..end).collect();
                        self.in_object = false;
                        self.cursor = 0;
                        return Some(object);
                    }
                }
                _ => {}
            }
        }
        self.cursor = bytes.len();
        None
    }

    /// Text received but not yet returned as a complete object.
    pub fn residual(&self) -> &str {
        &self.buffer
    }
}

/// Turns extracted objects into canonical frames.
#[derive(Debug, Default)]
pub struct GeminiDecoder {
    extractor: JsonObjectExtractor,
    skipped: u64,
}

impl GeminiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one upstream read and returns every frame it completes. An
    /// `error` object from the upstream ends decoding with an error.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, StreamError> {
        self.extractor.push(chunk);
        let mut frames = Vec::new();
        while let Some(object) = self.extractor.next_object() {
            let value: Value = match serde_json::from_str(&object) {
                Ok(v) => v,
                Err(err) => {
                    self.skipped += 1;
                    record_parse_error(ProviderKind::Gemini, &err);
                    continue;
                }
            };
            if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                tracing::warn!(provider = "gemini", %message, "upstream error object");
                return Err(StreamError::Upstream(message));
            }
            if let Some(text) = candidate_text(&value) {
                frames.push(Frame::text(text));
            }
        }
        Ok(frames)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn residual(&self) -> &str {
        self.extractor.residual()
    }
}

fn candidate_text(value: &Value) -> Option<&str> {
    value
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
        .filter(|text| !text.is_empty())
}

struct DecodeState<S> {
    bytes: S,
    decoder: GeminiDecoder,
    ready: VecDeque<Frame>,
}

/// Without `alt=sse` the body is one JSON array whose elements arrive with
/// no reliable delimiter between reads, so objects are recovered with a
/// [`JsonObjectExtractor`].
pub fn transcode<S>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<Bytes, StreamError>> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: GeminiDecoder::new(),
        ready: VecDeque::new(),
    };
    let stream = futures_util::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(frame) = state.ready.pop_front() {
                return Some((Ok(frame), Some(state)));
            }
            match state.bytes.next().await {
                None => {
                    if !state.decoder.residual().trim().trim_end_matches(']').is_empty() {
                        tracing::debug!(
                            provider = "gemini",
                            residual_len = state.decoder.residual().len(),
                            "stream ended with an incomplete object"
                        );
                    }
                    return Some((Ok(Frame::Done), None));
                }
                Some(Err(err)) => return Some((Err(err), None)),
                Some(Ok(chunk)) => match state.decoder.feed(&chunk) {
                    Ok(frames) => state.ready.extend(frames),
                    Err(err) => return Some((Err(err), None)),
                },
            }
        }
    });
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{collect, content_of, feed};

    fn chunk(text: &str) -> String {
        json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": text }] },
                "index": 0
            }]
        })
        .to_string()
    }

    #[test]
    fn request_uses_stream_endpoint_and_model_role() {
        let call = build_call(
            "gemini-1.5-flash",
            "sys",
            &[
                ChatMessage::new(Role::User, "hi"),
                ChatMessage::new(Role::Assistant, "hello"),
            ],
            &GenerationConfig::default(),
        );
        assert_eq!(
            call.path,
            "/v1beta/models/gemini-1.5-flash:streamGenerateContent"
        );
        let body = call.body.unwrap();
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "hello");
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
        assert_eq!(body["generationConfig"]["temperature"], 0.7);
    }

    #[test]
    fn model_name_is_path_encoded() {
        let call = build_call(
            "gemini/../x y",
            "",
            &[ChatMessage::new(Role::User, "hi")],
            &GenerationConfig::default(),
        );
        assert_eq!(
            call.path,
            "/v1beta/models/gemini%2F..%2Fx%20y:streamGenerateContent"
        );
    }

    #[test]
    fn one_complete_object_then_partial_leaves_residual() {
        let mut decoder = GeminiDecoder::new();
        let second = chunk("second");
        let input = format!("[{},\r\n{}", chunk("first"), &second[..10]);
        let frames = decoder.feed(input.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(content_of(&frames[0]).as_deref(), Some("first"));
        assert_eq!(decoder.residual(), &second[..10]);

        let frames = decoder.feed(second[10..].as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(content_of(&frames[0]).as_deref(), Some("second"));
    }

    #[test]
    fn braces_and_escaped_quotes_inside_strings_do_not_affect_depth() {
        let tricky = r#"a "quoted" {brace} and } stray { and \ backslash"#;
        let mut extractor = JsonObjectExtractor::new();
        extractor.push(chunk(tricky).as_bytes());
        let object = extractor.next_object().unwrap();
        let value: Value = serde_json::from_str(&object).unwrap();
        assert_eq!(
            value["candidates"][0]["content"]["parts"][0]["text"],
            tricky
        );
        assert_eq!(extractor.residual(), "");
        assert!(extractor.next_object().is_none());
    }

    #[test]
    fn escaped_backslash_before_closing_quote() {
        let mut extractor = JsonObjectExtractor::new();
        extractor.push(br#"{"text":"ends with \\"}{"text":"next"}"#);
        assert_eq!(
            extractor.next_object().as_deref(),
            Some(r#"{"text":"ends with \\"}"#)
        );
        assert_eq!(
            extractor.next_object().as_deref(),
            Some(r#"{"text":"next"}"#)
        );
    }

    #[test]
    fn object_split_byte_by_byte() {
        let payload = chunk("ünïcødé {}");
        let mut decoder = GeminiDecoder::new();
        let mut frames = Vec::new();
        for byte in payload.as_bytes() {
            frames.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(content_of(&frames[0]).as_deref(), Some("ünïcødé {}"));
        assert_eq!(decoder.residual(), "");
    }

    #[test]
    fn objects_without_text_are_ignored() {
        let mut decoder = GeminiDecoder::new();
        let input = format!(
            "[{},{},{}]",
            json!({"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3}}),
            chunk(""),
            chunk("kept")
        );
        let frames = decoder.feed(input.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(content_of(&frames[0]).as_deref(), Some("kept"));
        assert_eq!(decoder.skipped(), 0);
    }

    #[test]
    fn malformed_object_is_skipped_and_counted() {
        let mut decoder = GeminiDecoder::new();
        let input = format!("{{\"candidates\": [nope]}}{}", chunk("after"));
        let frames = decoder.feed(input.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn upstream_error_object_fails_decoding() {
        let mut decoder = GeminiDecoder::new();
        let err = decoder
            .feed(br#"[{"error":{"code":429,"message":"quota exceeded"}}]"#)
            .unwrap_err();
        assert_eq!(err, StreamError::Upstream("quota exceeded".to_string()));
    }

    #[tokio::test]
    async fn transcode_emits_deltas_then_done() {
        let body = format!("[{},\n{}]", chunk("Hel"), chunk("lo"));
        let (a, b) = body.split_at(body.len() / 2 + 3);
        let frames = collect(transcode(feed(&["", a, b]))).await;
        let texts: Vec<String> = frames
            .iter()
            .filter_map(|f| f.as_ref().ok().and_then(content_of))
            .collect();
        assert_eq!(texts, vec!["Hel".to_string(), "lo".to_string()]);
        assert_eq!(frames.last(), Some(&Ok(Frame::Done)));
    }

    #[tokio::test]
    async fn transcode_idle_timeout_ends_without_done() {
        let items = vec![
            Ok(Bytes::from(chunk("only"))),
            Err(StreamError::IdleTimeout(50)),
        ];
        let frames = collect(transcode(futures_util::stream::iter(items))).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Err(StreamError::IdleTimeout(50)));
    }
}
