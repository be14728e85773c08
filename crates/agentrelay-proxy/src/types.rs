//! Incoming OpenAI chat-completions request types.
//!
//! Clients send `content` either as a plain string or as an array of typed
//! parts (`[{"type": "text", "text": "..."}, {"type": "image_url", ...}]`).
//! Both shapes are accepted via an `#[serde(untagged)]` enum; only text parts
//! carry meaning for the backends.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.model.as_deref().unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default)]
    pub content: MessageContent,
}

fn default_role() -> String {
    "user".to_string()
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: MessageContent::Text(content.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
    /// `null` or any other shape.
    Other(serde_json::Value),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Text parts joined with newlines. Non-text parts are dropped.
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .map(|p| p.text.as_deref().unwrap_or(""))
                .collect::<Vec<_>>()
                .join("\n"),
            MessageContent::Other(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_and_part_content() {
        let req: ChatRequest = serde_json::from_value(json!({
            "model": "claude-opus",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "first"},
                    {"type": "image_url", "image_url": {"url": "data:"}},
                    {"type": "text", "text": "second"}
                ]},
                {"role": "assistant", "content": null}
            ]
        }))
        .unwrap();

        assert!(req.stream);
        assert_eq!(req.model_or("claude-sonnet"), "claude-opus");
        assert_eq!(req.messages[0].content.to_text(), "be brief");
        assert_eq!(req.messages[1].content.to_text(), "first\nsecond");
        assert_eq!(req.messages[2].content.to_text(), "");
    }

    #[test]
    fn test_defaults() {
        let req: ChatRequest = serde_json::from_value(json!({
            "messages": [{"content": "hi"}]
        }))
        .unwrap();
        assert!(!req.stream);
        assert_eq!(req.model_or("opencode"), "opencode");
        assert_eq!(req.messages[0].role, "user");
    }
}
