use crate::config::ProviderKind;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

/// Client-facing error body. Existing clients only read `error`.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::debug!(code = %self.code, status = %self.status, "request failed");
        let body = ErrorEnvelope {
            error: self.message,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failures that can end a chat request before the SSE body starts.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),
    #[error("No API key available for provider {provider}. Configure the {header} header{hint}.")]
    NoCredential {
        provider: ProviderKind,
        header: &'static str,
        hint: &'static str,
    },
    #[error("No API key available for any provider. Send one of x-anthropic-key, x-openai-key, x-gemini-key or configure GOOGLE_API_KEY.")]
    NoCredentialAny,
    #[error("unrecognized model '{0}': expected a gpt*, claude* or gemini* model")]
    UnknownModel(String),
    #[error("{provider} error (status {status}): {body}")]
    Upstream {
        provider: ProviderKind,
        status: u16,
        body: String,
    },
    #[error("{provider} did not respond within {timeout_ms}ms")]
    UpstreamTimeout {
        provider: ProviderKind,
        timeout_ms: u64,
    },
    #[error("{provider} request failed: {message}")]
    UpstreamNetwork {
        provider: ProviderKind,
        message: String,
    },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_)
            | GatewayError::NoCredential { .. }
            | GatewayError::NoCredentialAny
            | GatewayError::UnknownModel(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { .. }
            | GatewayError::UpstreamNetwork { .. }
            | GatewayError::UpstreamTimeout { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::NoCredential { .. } | GatewayError::NoCredentialAny => "no_credential",
            GatewayError::UnknownModel(_) => "unknown_model",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::UpstreamTimeout { .. } => "upstream_timeout",
            GatewayError::UpstreamNetwork { .. } => "upstream_network",
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::new(err.status(), err.code(), err.to_string())
    }
}
