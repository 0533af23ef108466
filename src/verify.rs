use crate::adapters;
use crate::config::{KeyCheckEndpoints, ProviderKind, UpstreamEndpoints};
use crate::error::GatewayError;
use crate::upstream::{self, Reply, SendFailure, join_url};
use reqwest::StatusCode;

const GITHUB_USER_AGENT: &str = "chatgate-verifier";

/// Everything whose key `/verify-key` can check. Only `Provider` services
/// are chat routes; the others are checked and nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyService {
    Provider(ProviderKind),
    Github,
    Mapbox,
}

impl KeyService {
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(provider) = ProviderKind::parse(raw) {
            return Some(KeyService::Provider(provider));
        }
        match raw.trim().to_ascii_lowercase().as_str() {
            "github" => Some(KeyService::Github),
            "mapbox" => Some(KeyService::Mapbox),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            KeyService::Provider(provider) => provider.display_name(),
            KeyService::Github => "GitHub",
            KeyService::Mapbox => "Mapbox",
        }
    }

    /// What the service calls its secret in user-facing messages.
    fn credential_noun(self) -> &'static str {
        match self {
            KeyService::Github => "Token",
            _ => "Key",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVerdict {
    pub valid: bool,
    pub message: String,
}

impl KeyVerdict {
    fn accepted(service: KeyService) -> Self {
        Self {
            valid: true,
            message: format!(
                "{} {} is valid",
                service.display_name(),
                service.credential_noun()
            ),
        }
    }

    fn rejected(service: KeyService, status: u16) -> Self {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .map(str::to_string)
            .unwrap_or_else(|| format!("status {status}"));
        Self {
            valid: false,
            message: format!("{} Error: {reason}", service.display_name()),
        }
    }
}

/// Runs the cheapest authenticated call the service offers. A rejected key
/// is a verdict; only transport trouble is an error.
pub async fn check_key(
    client: &reqwest::Client,
    providers: &UpstreamEndpoints,
    services: &KeyCheckEndpoints,
    service: KeyService,
    key: &str,
    timeout_ms: u64,
) -> Result<KeyVerdict, String> {
    let req = match service {
        KeyService::Provider(provider) => {
            let call = adapters::key_check_call(provider);
            return match upstream::send(client, providers, &call, key, timeout_ms).await {
                Ok(_) => Ok(KeyVerdict::accepted(service)),
                Err(GatewayError::Upstream { status, .. }) => {
                    Ok(KeyVerdict::rejected(service, status))
                }
                Err(err) => Err(err.to_string()),
            };
        }
        KeyService::Github => client
            .get(join_url(&services.github, "/user"))
            .bearer_auth(key)
            .header(reqwest::header::USER_AGENT, GITHUB_USER_AGENT),
        KeyService::Mapbox => client
            .get(join_url(
                &services.mapbox,
                "/geocoding/v5/mapbox.places/Paris.json",
            ))
            .query(&[("access_token", key), ("limit", "1")]),
    };

    let name = service.display_name();
    match upstream::exchange(req, timeout_ms).await {
        Ok(Reply::Accepted(_)) => Ok(KeyVerdict::accepted(service)),
        Ok(Reply::Rejected { status, .. }) => Ok(KeyVerdict::rejected(service, status.as_u16())),
        Err(SendFailure::TimedOut) => Err(format!("{name} did not respond within {timeout_ms}ms")),
        Err(SendFailure::Network(err)) => Err(format!("{name} request failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_providers_and_key_only_services() {
        assert_eq!(
            KeyService::parse("Anthropic"),
            Some(KeyService::Provider(ProviderKind::Anthropic))
        );
        assert_eq!(KeyService::parse(" GitHub "), Some(KeyService::Github));
        assert_eq!(KeyService::parse("mapbox"), Some(KeyService::Mapbox));
        assert_eq!(KeyService::parse("stripe"), None);
    }

    #[test]
    fn verdict_messages_name_the_service() {
        assert_eq!(
            KeyVerdict::accepted(KeyService::Github).message,
            "GitHub Token is valid"
        );
        assert_eq!(
            KeyVerdict::accepted(KeyService::Provider(ProviderKind::Openai)).message,
            "OpenAI Key is valid"
        );
        assert_eq!(
            KeyVerdict::rejected(KeyService::Mapbox, 401),
            KeyVerdict {
                valid: false,
                message: "Mapbox Error: Unauthorized".to_string(),
            }
        );
    }
}
