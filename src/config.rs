use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Openai,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ProviderKind::Openai => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Gemini => "Gemini",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(raw.trim()))
    }

    /// Request header carrying the caller's key for this provider.
    pub fn credential_header(self) -> &'static str {
        match self {
            ProviderKind::Openai => "x-openai-key",
            ProviderKind::Anthropic => "x-anthropic-key",
            ProviderKind::Gemini => "x-gemini-key",
        }
    }

    /// Where the upstream expects the credential.
    pub fn auth(self) -> ProviderAuth {
        match self {
            ProviderKind::Openai => ProviderAuth::Bearer,
            ProviderKind::Anthropic => ProviderAuth::Header("x-api-key"),
            ProviderKind::Gemini => ProviderAuth::Query("key"),
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Openai => "https://api.openai.com",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com",
        }
    }

    pub fn extra_headers(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ProviderKind::Anthropic => &[("anthropic-version", ANTHROPIC_VERSION)],
            _ => &[],
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAuth {
    Bearer,
    Header(&'static str),
    Query(&'static str),
}

/// Upstream base URLs. Overridable so tests and self-hosted compatible
/// endpoints can stand in for the public APIs.
#[derive(Debug, Clone)]
pub struct UpstreamEndpoints {
    pub openai: String,
    pub anthropic: String,
    pub gemini: String,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            openai: ProviderKind::Openai.default_base_url().to_string(),
            anthropic: ProviderKind::Anthropic.default_base_url().to_string(),
            gemini: ProviderKind::Gemini.default_base_url().to_string(),
        }
    }
}

impl UpstreamEndpoints {
    pub fn single(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            openai: base_url.clone(),
            anthropic: base_url.clone(),
            gemini: base_url,
        }
    }

    pub fn base_url(&self, provider: ProviderKind) -> &str {
        match provider {
            ProviderKind::Openai => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
            ProviderKind::Gemini => &self.gemini,
        }
    }
}

/// Base URLs of the non-chat services `/verify-key` can check.
#[derive(Debug, Clone)]
pub struct KeyCheckEndpoints {
    pub github: String,
    pub mapbox: String,
}

impl Default for KeyCheckEndpoints {
    fn default() -> Self {
        Self {
            github: "https://api.github.com".to_string(),
            mapbox: "https://api.mapbox.com".to_string(),
        }
    }
}

impl KeyCheckEndpoints {
    pub fn single(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            github: base_url.clone(),
            mapbox: base_url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub anthropic_max_tokens: u32,
    pub gemini_temperature: f64,
    pub gemini_max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            anthropic_max_tokens: 4096,
            gemini_temperature: 0.7,
            gemini_max_output_tokens: 8192,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    /// Time allowed until the upstream answers with response headers.
    pub handshake_ms: u64,
    /// Longest gap tolerated between two body chunks.
    pub idle_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            handshake_ms: 60_000,
            idle_ms: 120_000,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are iAsted, an automated solution architect. \
Turn the user's raw idea into a complete technical execution plan split into three phases: \
a no-code interface phase, a production frontend phase and a backend phase covering schema, \
edge functions, security rules, API endpoints and optimisation. Do not write the final code \
yourself; produce precise, detailed prompts that specialised coding assistants can execute. \
Structure every answer as: 1. Analysis, 2. Interface prompt, 3. Frontend architecture prompt, \
4. Backend architecture prompt. Keep the analysis brief and the prompts exhaustive.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(ProviderKind::parse("OpenAI"), Some(ProviderKind::Openai));
        assert_eq!(ProviderKind::parse(" gemini "), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::parse("mapbox"), None);
    }

    #[test]
    fn gemini_credential_travels_in_query() {
        assert_eq!(ProviderKind::Gemini.auth(), ProviderAuth::Query("key"));
        assert_eq!(
            ProviderKind::Anthropic.extra_headers(),
            &[("anthropic-version", "2023-06-01")]
        );
    }
}
