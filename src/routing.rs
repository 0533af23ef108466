use crate::config::ProviderKind;
use crate::error::GatewayError;
use axum::http::HeaderMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RoutingMode {
    #[default]
    #[serde(rename = "auto-power")]
    AutoPower,
    #[serde(rename = "auto-cost")]
    AutoCost,
    #[serde(rename = "manual")]
    Manual,
}

impl RoutingMode {
    /// Unrecognized values fall back to `auto-power`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "auto-cost" => RoutingMode::AutoCost,
            "manual" => RoutingMode::Manual,
            _ => RoutingMode::AutoPower,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoutingMode::AutoPower => "auto-power",
            RoutingMode::AutoCost => "auto-cost",
            RoutingMode::Manual => "manual",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoutingMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(raw
            .as_ref()
            .and_then(|v| v.as_str())
            .map(RoutingMode::parse)
            .unwrap_or_default())
    }
}

/// Per-request provider keys. Built fresh for every request.
#[derive(Clone, Default)]
pub struct Credentials {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub gemini: Option<String>,
}

impl Credentials {
    /// Reads the `x-*-key` headers; the server-side Gemini key fills in
    /// when the caller sent none.
    pub fn from_headers(headers: &HeaderMap, gemini_fallback: Option<&str>) -> Self {
        let read = |provider: ProviderKind| {
            headers
                .get(provider.credential_header())
                .and_then(|v| v.to_str().ok())
                .and_then(non_blank)
        };
        Self {
            openai: read(ProviderKind::Openai),
            anthropic: read(ProviderKind::Anthropic),
            gemini: read(ProviderKind::Gemini).or_else(|| gemini_fallback.and_then(non_blank)),
        }
    }

    pub fn get(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Openai => self.openai.as_deref(),
            ProviderKind::Anthropic => self.anthropic.as_deref(),
            ProviderKind::Gemini => self.gemini.as_deref(),
        }
    }

    pub fn with(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        let key = non_blank(&key.into());
        match provider {
            ProviderKind::Openai => self.openai = key,
            ProviderKind::Anthropic => self.anthropic = key,
            ProviderKind::Gemini => self.gemini = key,
        }
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "<set>" } else { "<none>" };
        f.debug_struct("Credentials")
            .field("openai", &mask(&self.openai))
            .field("anthropic", &mask(&self.anthropic))
            .field("gemini", &mask(&self.gemini))
            .finish()
    }
}

fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub provider: ProviderKind,
    pub model: String,
    pub credential: String,
}

impl fmt::Debug for RoutingDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDecision")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

const MODEL_PREFIXES: [(&str, ProviderKind); 3] = [
    ("gpt", ProviderKind::Openai),
    ("claude", ProviderKind::Anthropic),
    ("gemini", ProviderKind::Gemini),
];

const POWER_ORDER: [(ProviderKind, &str); 3] = [
    (ProviderKind::Anthropic, "claude-3-5-sonnet-20240620"),
    (ProviderKind::Openai, "gpt-4o"),
    (ProviderKind::Gemini, "gemini-1.5-pro"),
];

const COST_ORDER: [(ProviderKind, &str); 3] = [
    (ProviderKind::Gemini, "gemini-1.5-flash"),
    (ProviderKind::Openai, "gpt-4o-mini"),
    (ProviderKind::Anthropic, "claude-3-haiku-20240307"),
];

pub fn provider_for_model(model: &str) -> Option<ProviderKind> {
    MODEL_PREFIXES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, provider)| *provider)
}

pub fn cheap_model(provider: ProviderKind) -> &'static str {
    pinned_model(&COST_ORDER, provider)
}

fn pinned_model(table: &[(ProviderKind, &'static str)], provider: ProviderKind) -> &'static str {
    table
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, model)| *model)
        .unwrap_or_default()
}

/// Picks provider and model from the routing mode, the optional explicit
/// model and the credentials present. Pure; the preference orders and pinned
/// models are fixed tables.
pub fn select(
    mode: RoutingMode,
    explicit_model: Option<&str>,
    credentials: &Credentials,
) -> Result<RoutingDecision, GatewayError> {
    let explicit_model = explicit_model.map(str::trim).filter(|m| !m.is_empty());
    if let (RoutingMode::Manual, Some(model)) = (mode, explicit_model) {
        let provider = provider_for_model(model)
            .ok_or_else(|| GatewayError::UnknownModel(model.to_string()))?;
        let credential = credentials
            .get(provider)
            .ok_or_else(|| no_credential(provider))?;
        return Ok(RoutingDecision {
            provider,
            model: model.to_string(),
            credential: credential.to_string(),
        });
    }

    let order = match mode {
        RoutingMode::AutoCost => &COST_ORDER,
        RoutingMode::AutoPower | RoutingMode::Manual => &POWER_ORDER,
    };
    order
        .iter()
        .find_map(|(provider, model)| {
            credentials.get(*provider).map(|credential| RoutingDecision {
                provider: *provider,
                model: model.to_string(),
                credential: credential.to_string(),
            })
        })
        .ok_or(GatewayError::NoCredentialAny)
}

fn no_credential(provider: ProviderKind) -> GatewayError {
    GatewayError::NoCredential {
        provider,
        header: provider.credential_header(),
        hint: if provider == ProviderKind::Gemini {
            " or set GOOGLE_API_KEY on the server"
        } else {
            ""
        },
    }
}
