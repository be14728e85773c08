//! Request reshaping shared by the backends.
//!
//! - The CLI backend takes one flat prompt: [`build_prompt`].
//! - The session backend only forwards the newest user turn: [`last_user_message`].
//! - Public model names are mapped to backend ids by a [`ModelMap`].

use crate::types::ChatMessage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flatten a conversation into a single role-tagged prompt.
///
/// Empty messages are skipped. Roles other than `system` and `assistant`
/// are treated as user turns.
pub fn build_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|msg| {
            let content = msg.content.to_text();
            if content.is_empty() {
                return None;
            }
            let tag = match msg.role.as_str() {
                "system" => "System",
                "assistant" => "Assistant",
                _ => "User",
            };
            Some(format!("[{}]: {}", tag, content))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Text of the last `user` message, if it has any.
pub fn last_user_message(messages: &[ChatMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|msg| msg.role == "user")
        .map(|msg| msg.content.to_text())
        .filter(|text| !text.is_empty())
}

/// Public model name -> backend model id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMap {
    pub aliases: BTreeMap<String, String>,

    /// Backend id used for names not in `aliases`.
    pub fallback: String,

    /// Aliases accepted on requests but left out of `/v1/models`.
    #[serde(default)]
    pub hidden: Vec<String>,
}

impl ModelMap {
    pub fn new<I, K, V>(aliases: I, fallback: &str) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            aliases: aliases
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            fallback: fallback.to_string(),
            hidden: Vec::new(),
        }
    }

    pub fn hiding(mut self, alias: &str) -> Self {
        self.hidden.push(alias.to_string());
        self
    }

    /// Model names understood by the Claude CLI.
    pub fn claude() -> Self {
        Self::new(
            [
                ("claude-opus", "opus"),
                ("claude-sonnet", "sonnet"),
                ("claude-haiku", "haiku"),
            ],
            "sonnet",
        )
    }

    /// Provider-qualified ids served by OpenCode.
    pub fn opencode() -> Self {
        Self::new(
            [
                ("glm-4.7", "zai-coding-plan/glm-4.7"),
                ("glm-4.7-flash", "zai-coding-plan/glm-4.7-flash"),
                ("glm-4.5", "zai-coding-plan/glm-4.5"),
                ("glm-4.7-free", "opencode/glm-4.7-free"),
                ("kimi-k2.5-free", "opencode/kimi-k2.5-free"),
                ("minimax-m2.1-free", "opencode/minimax-m2.1-free"),
                ("trinity-large-preview-free", "opencode/trinity-large-preview-free"),
                ("gpt-5-nano", "opencode/gpt-5-nano"),
                ("big-pickle", "opencode/big-pickle"),
                ("opencode", "zai-coding-plan/glm-4.7"),
            ],
            "zai-coding-plan/glm-4.7",
        )
        .hiding("opencode")
    }

    pub fn resolve<'a>(&'a self, model: &str) -> &'a str {
        self.aliases
            .get(model)
            .map(String::as_str)
            .unwrap_or(&self.fallback)
    }

    /// Names advertised on `/v1/models`.
    pub fn public_ids(&self) -> impl Iterator<Item = &str> {
        self.aliases
            .keys()
            .map(String::as_str)
            .filter(|id| !self.hidden.iter().any(|h| h == id))
    }
}
