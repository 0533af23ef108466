use crate::adapters::{Frame, FrameStream, StreamError};
use crate::config::ProviderKind;
use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Streaming,
    Completed,
    Failed,
}

/// Tracks how a relayed stream ended. Dropped while still `Streaming`
/// means the client went away first; dropping the relay also drops the
/// upstream body, which closes that connection.
struct RelayGuard {
    provider: ProviderKind,
    frames: u64,
    outcome: Outcome,
}

impl RelayGuard {
    fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            frames: 0,
            outcome: Outcome::Streaming,
        }
    }

    fn complete(&mut self) {
        self.outcome = Outcome::Completed;
        metrics::counter!(
            "chatgate_streams_total",
            "provider" => self.provider.as_str(),
            "outcome" => "completed"
        )
        .increment(1);
        tracing::debug!(provider = %self.provider, frames = self.frames, "stream completed");
    }

    fn fail(&mut self, err: &StreamError) {
        self.outcome = Outcome::Failed;
        metrics::counter!(
            "chatgate_streams_total",
            "provider" => self.provider.as_str(),
            "outcome" => "truncated"
        )
        .increment(1);
        tracing::warn!(
            provider = %self.provider,
            frames = self.frames,
            error = %err,
            "upstream stream ended abnormally; closing without [DONE]"
        );
    }
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        if self.outcome == Outcome::Streaming {
            metrics::counter!(
                "chatgate_streams_total",
                "provider" => self.provider.as_str(),
                "outcome" => "client_disconnected"
            )
            .increment(1);
            tracing::info!(
                provider = %self.provider,
                frames = self.frames,
                "client disconnected before completion; upstream read cancelled"
            );
        }
    }
}

/// Forwards adapter frames to the client one SSE event per frame, in
/// arrival order. A failed upstream ends the stream without the `[DONE]`
/// marker so clients can tell truncation from completion.
pub fn relay(
    provider: ProviderKind,
    frames: FrameStream,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let guard = RelayGuard::new(provider);
    futures_util::stream::unfold(Some((frames, guard)), |state| async move {
        let (mut frames, mut guard) = state?;
        match frames.next().await {
            Some(Ok(Frame::Done)) => {
                guard.complete();
                Some((Ok(Event::default().data(Frame::Done.payload())), None))
            }
            Some(Ok(frame)) => {
                guard.frames += 1;
                let event = Event::default().data(frame.payload());
                Some((Ok(event), Some((frames, guard))))
            }
            Some(Err(err)) => {
                guard.fail(&err);
                None
            }
            None => {
                guard.fail(&StreamError::Transport(
                    "adapter ended without a terminal frame".to_string(),
                ));
                None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::{IntoResponse, Sse};
    use http_body_util::BodyExt;

    async fn render(frames: Vec<Result<Frame, StreamError>>) -> String {
        let stream: FrameStream = Box::pin(futures_util::stream::iter(frames));
        let resp = Sse::new(relay(ProviderKind::Openai, stream)).into_response();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn frames_are_written_in_order_with_done() {
        let body = render(vec![
            Ok(Frame::text("a")),
            Ok(Frame::text("b")),
            Ok(Frame::Done),
        ])
        .await;
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n\
             data: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn failure_omits_done_marker() {
        let body = render(vec![
            Ok(Frame::text("a")),
            Err(StreamError::Transport("reset".to_string())),
            Ok(Frame::text("never")),
        ])
        .await;
        assert_eq!(
            body,
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n"
        );
    }

    #[tokio::test]
    async fn nothing_after_done_is_forwarded() {
        let body = render(vec![Ok(Frame::Done), Ok(Frame::text("late"))]).await;
        assert_eq!(body, "data: [DONE]\n\n");
    }
}
