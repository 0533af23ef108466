use crate::config::{
    DEFAULT_SYSTEM_PROMPT, GenerationConfig, KeyCheckEndpoints, TimeoutConfig, UpstreamEndpoints,
};
use crate::error::{AppError, AppResult};
use crate::usage::{DEFAULT_COST_PER_1K_TOKENS, SqliteUsageSink, UsageRecorder, UsageSink};
use axum::Router;
use axum::http::{HeaderName, Method, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// Request headers browsers may send cross-origin.
const CORS_ALLOWED_HEADERS: [&str; 7] = [
    "authorization",
    "x-client-info",
    "apikey",
    "content-type",
    "x-openai-key",
    "x-anthropic-key",
    "x-gemini-key",
];

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub usage: UsageRecorder,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub endpoints: UpstreamEndpoints,
    pub key_check_endpoints: KeyCheckEndpoints,
    pub timeouts: TimeoutConfig,
    pub generation: GenerationConfig,
    pub system_prompt: String,
    /// Server-side Gemini key used when the caller sends none.
    pub gemini_fallback_key: Option<String>,
    pub cost_per_1k_tokens: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: "sqlite://./data/chatgate.db".to_string(),
            endpoints: UpstreamEndpoints::default(),
            key_check_endpoints: KeyCheckEndpoints::default(),
            timeouts: TimeoutConfig::default(),
            generation: GenerationConfig::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            gemini_fallback_key: None,
            cost_per_1k_tokens: DEFAULT_COST_PER_1K_TOKENS,
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("listen", &self.listen)
            .field("metrics_path", &self.metrics_path)
            .field("database_dsn", &self.database_dsn)
            .field("endpoints", &self.endpoints)
            .field("key_check_endpoints", &self.key_check_endpoints)
            .field("timeouts", &self.timeouts)
            .field("generation", &self.generation)
            .field("system_prompt_chars", &self.system_prompt.chars().count())
            .field(
                "gemini_fallback_key",
                &self.gemini_fallback_key.as_ref().map(|_| "<set>"),
            )
            .field("cost_per_1k_tokens", &self.cost_per_1k_tokens)
            .finish()
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let endpoints = UpstreamEndpoints {
            openai: env_string("CHATGATE_OPENAI_BASE_URL").unwrap_or(defaults.endpoints.openai),
            anthropic: env_string("CHATGATE_ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.endpoints.anthropic),
            gemini: env_string("CHATGATE_GEMINI_BASE_URL").unwrap_or(defaults.endpoints.gemini),
        };
        let key_check_endpoints = KeyCheckEndpoints {
            github: env_string("CHATGATE_GITHUB_BASE_URL")
                .unwrap_or(defaults.key_check_endpoints.github),
            mapbox: env_string("CHATGATE_MAPBOX_BASE_URL")
                .unwrap_or(defaults.key_check_endpoints.mapbox),
        };
        let timeouts = TimeoutConfig {
            connect_ms: env_parse("CHATGATE_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.timeouts.connect_ms),
            handshake_ms: env_parse("CHATGATE_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.timeouts.handshake_ms),
            idle_ms: env_parse("CHATGATE_IDLE_TIMEOUT_MS").unwrap_or(defaults.timeouts.idle_ms),
        };
        let generation = GenerationConfig {
            anthropic_max_tokens: env_parse("CHATGATE_ANTHROPIC_MAX_TOKENS")
                .unwrap_or(defaults.generation.anthropic_max_tokens),
            ..defaults.generation
        };
        Self {
            listen: env_string("CHATGATE_LISTEN").unwrap_or(defaults.listen),
            metrics_path: env_string("CHATGATE_METRICS_PATH").unwrap_or(defaults.metrics_path),
            database_dsn: env_string("CHATGATE_DATABASE_DSN")
                .or_else(|| env_string("DATABASE_URL"))
                .unwrap_or(defaults.database_dsn),
            endpoints,
            key_check_endpoints,
            timeouts,
            generation,
            system_prompt: env_string("CHATGATE_SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            gemini_fallback_key: env_string("GOOGLE_API_KEY"),
            cost_per_1k_tokens: env_parse("CHATGATE_COST_PER_1K_TOKENS")
                .filter(|rate: &f64| rate.is_finite() && *rate >= 0.0)
                .unwrap_or(defaults.cost_per_1k_tokens),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, "ignoring unparsable value");
            None
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let sink = SqliteUsageSink::connect(&runtime.database_dsn)
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "usage_store_init_failed",
                err.to_string(),
            )
        })?;
    load_state_with_sink(runtime, Arc::new(sink))
}

/// Builds state around an existing usage sink.
pub fn load_state_with_sink(
    runtime: RuntimeConfig,
    sink: Arc<dyn UsageSink>,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatgate/0.1")
        .connect_timeout(Duration::from_millis(runtime.timeouts.connect_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;
    let metrics = init_metrics()?;
    let usage = UsageRecorder::new(sink, runtime.cost_per_1k_tokens);
    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        usage,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router(&metrics_path);
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .with_state(state)
        .layer(cors_layer())
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::handlers::chat))
        .route("/verify-key", post(crate::handlers::verify_key))
        .route("/health", get(crate::handlers::health))
        .route(metrics_path, get(crate::handlers::metrics))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(CORS_ALLOWED_HEADERS.map(HeaderName::from_static))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_fallback_key() {
        let runtime = RuntimeConfig {
            gemini_fallback_key: Some("AIza-secret".to_string()),
            ..RuntimeConfig::default()
        };
        let rendered = format!("{runtime:?}");
        assert!(!rendered.contains("AIza-secret"));
        assert!(rendered.contains("<set>"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.metrics_path, "/metrics");
        assert_eq!(runtime.cost_per_1k_tokens, 0.01);
        assert_eq!(runtime.generation.anthropic_max_tokens, 4096);
        assert!(runtime.gemini_fallback_key.is_none());
    }
}
