use crate::error::GatewayError;
use crate::routing::RoutingMode;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Decoded body of a chat request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn decode(body: &[u8]) -> Result<Self, GatewayError> {
        let req: ChatRequest = serde_json::from_slice(body)
            .map_err(|err| GatewayError::BadRequest(format!("invalid request body: {err}")))?;
        if req.messages.is_empty() {
            return Err(GatewayError::BadRequest(
                "messages must be a non-empty array".to_string(),
            ));
        }
        Ok(req)
    }
}

/// Joins the gateway prompt with any system turns sent by the caller.
pub fn system_text(system_prompt: &str, messages: &[ChatMessage]) -> String {
    let mut out = system_prompt.to_string();
    for message in messages.iter().filter(|m| m.role == Role::System) {
        if message.content.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&message.content);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_requires_messages() {
        let err = ChatRequest::decode(br#"{"mode":"manual"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
        let err = ChatRequest::decode(br#"{"messages":[]}"#).unwrap_err();
        assert!(err.to_string().contains("non-empty"));
        let err = ChatRequest::decode(b"{not json").unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test]
    fn decode_defaults_mode_and_keeps_order() {
        let req = ChatRequest::decode(
            br#"{"messages":[{"role":"user","content":"a"},{"role":"assistant","content":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(req.mode, RoutingMode::AutoPower);
        assert_eq!(req.model, None);
        assert_eq!(req.messages[0].content, "a");
        assert_eq!(req.messages[1].role, Role::Assistant);
    }

    #[test]
    fn system_text_appends_caller_system_turns() {
        let messages = vec![
            ChatMessage::new(Role::System, "be brief"),
            ChatMessage::new(Role::User, "hi"),
        ];
        assert_eq!(system_text("base", &messages), "base\n\nbe brief");
        assert_eq!(system_text("", &messages), "be brief");
    }
}
