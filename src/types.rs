//! Shared inference request/response types.

use serde::{Deserialize, Serialize};

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A completion request as routed through the gateway. Either `messages`
/// (chat form) or `prompt` (pipeline-native form) is populated.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub prompt: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl CompletionRequest {
    /// Concatenated request text used for prompt-token estimation.
    pub fn input_text_len(&self) -> usize {
        let messages: usize = self.messages.iter().map(|m| m.content.len()).sum();
        messages + self.prompt.as_deref().map(str::len).unwrap_or(0)
    }
}

/// Result of a completed (non-streaming) request.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    /// Tokens reported by the node, if any.
    pub completion_tokens: Option<u32>,
    /// Wallet address of the serving node, for usage attribution.
    pub node_address: Option<String>,
}

/// Approximate token count for accounting when a node reports none.
/// Roughly four characters per token.
pub fn estimate_tokens(text_len: usize) -> u32 {
    (text_len as u32).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
        assert_eq!(estimate_tokens(400), 100);
    }

    #[test]
    fn test_input_text_len_covers_both_forms() {
        let req = CompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::new("user", "hello")],
            prompt: Some("world".to_string()),
            max_tokens: None,
            temperature: None,
            top_p: None,
        };
        assert_eq!(req.input_text_len(), 10);
    }
}
