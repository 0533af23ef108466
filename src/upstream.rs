use crate::adapters::StreamError;
use crate::config::{ProviderAuth, ProviderKind, UpstreamEndpoints};
use crate::error::GatewayError;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

const MAX_ERROR_BODY_CHARS: usize = 2_000;

/// One outbound call to a provider, fully described before any I/O starts.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    pub provider: ProviderKind,
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl UpstreamCall {
    pub fn post(provider: ProviderKind, path: impl Into<String>, body: Value) -> Self {
        Self {
            provider,
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    pub fn get(provider: ProviderKind, path: impl Into<String>) -> Self {
        Self {
            provider,
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }
}

/// Sends the call and waits for response headers. Non-2xx answers are read
/// in full and turned into `GatewayError::Upstream`; the body of a
/// successful response is left unread for the caller to stream.
pub async fn send(
    client: &reqwest::Client,
    endpoints: &UpstreamEndpoints,
    call: &UpstreamCall,
    credential: &str,
    handshake_timeout_ms: u64,
) -> Result<reqwest::Response, GatewayError> {
    let provider = call.provider;
    let url = join_url(endpoints.base_url(provider), &call.path);
    let mut req = client.request(call.method.clone(), url);
    if let Some(body) = &call.body {
        req = req.json(body);
    }
    req = apply_auth(req, provider.auth(), credential);
    for (k, v) in provider.extra_headers() {
        req = req.header(*k, *v);
    }

    match exchange(req, handshake_timeout_ms).await {
        Ok(Reply::Accepted(resp)) => Ok(resp),
        Ok(Reply::Rejected { status, body }) => {
            tracing::warn!(
                provider = %provider,
                status = status.as_u16(),
                "upstream rejected request"
            );
            Err(GatewayError::Upstream {
                provider,
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY_CHARS),
            })
        }
        Err(SendFailure::TimedOut) => Err(GatewayError::UpstreamTimeout {
            provider,
            timeout_ms: handshake_timeout_ms,
        }),
        Err(SendFailure::Network(err)) => Err(GatewayError::UpstreamNetwork {
            provider,
            message: err.to_string(),
        }),
    }
}

pub(crate) enum Reply {
    Accepted(reqwest::Response),
    Rejected { status: StatusCode, body: String },
}

pub(crate) enum SendFailure {
    TimedOut,
    Network(reqwest::Error),
}

/// Sends `req` under one deadline that covers the response headers and,
/// for non-2xx answers, the whole error body.
pub(crate) async fn exchange(
    req: reqwest::RequestBuilder,
    timeout_ms: u64,
) -> Result<Reply, SendFailure> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let resp = match tokio::time::timeout_at(deadline, req.send()).await {
        Err(_) => return Err(SendFailure::TimedOut),
        Ok(Err(err)) if err.is_timeout() => return Err(SendFailure::TimedOut),
        Ok(Err(err)) => return Err(SendFailure::Network(err)),
        Ok(Ok(resp)) => resp,
    };
    let status = resp.status();
    if status.is_success() {
        return Ok(Reply::Accepted(resp));
    }
    let body = tokio::time::timeout_at(deadline, resp.text())
        .await
        .map_err(|_| SendFailure::TimedOut)?
        .unwrap_or_default();
    Ok(Reply::Rejected { status, body })
}

/// Response body as a byte stream. A gap longer than `idle_ms` between two
/// chunks ends the stream with [`StreamError::IdleTimeout`].
pub fn body_stream(
    resp: reqwest::Response,
    idle_ms: u64,
) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
    use tokio_stream::StreamExt as _;
    let chunks = resp.bytes_stream().timeout(Duration::from_millis(idle_ms));
    futures_util::stream::unfold(Some(Box::pin(chunks)), move |state| async move {
        let mut chunks = state?;
        match chunks.next().await? {
            Ok(Ok(bytes)) => Some((Ok(bytes), Some(chunks))),
            Ok(Err(err)) => Some((Err(StreamError::Transport(err.to_string())), None)),
            Err(_) => Some((Err(StreamError::IdleTimeout(idle_ms)), None)),
        }
    })
}

fn apply_auth(
    req: reqwest::RequestBuilder,
    auth: ProviderAuth,
    credential: &str,
) -> reqwest::RequestBuilder {
    match auth {
        ProviderAuth::Bearer => req.bearer_auth(credential),
        ProviderAuth::Header(name) => req.header(name, credential),
        ProviderAuth::Query(name) => req.query(&[(name, credential)]),
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
