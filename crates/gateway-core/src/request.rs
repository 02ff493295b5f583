//! Request types for the gateway.
//!
//! Inbound OpenAI-style bodies for `/v1/chat/completions` and
//! `/v1/completions`. Completion requests are normalised into a
//! [`ChatRequest`] before admission and dispatch.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};

/// Rough characters-per-token ratio used for admission estimates
const CHARS_PER_TOKEN: usize = 4;

/// Chat completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Target model (e.g., "gpt-4o-mini")
    pub model: String,

    /// Chat messages for conversation
    pub messages: Vec<ChatMessage>,

    /// Enable streaming response
    #[serde(default)]
    pub stream: bool,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature (0.0 - 2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Top-p (nucleus sampling) parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// End-user identifier forwarded upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    /// Create a non-streaming request with a single user message
    #[must_use]
    pub fn simple(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
            stream: false,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            user: None,
        }
    }

    /// Validate the request
    ///
    /// # Errors
    /// Returns `GatewayError::Validation` naming the offending field
    pub fn validate(&self) -> GatewayResult<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("model is required", Some("model")));
        }

        if self.messages.is_empty() {
            return Err(GatewayError::validation(
                "messages cannot be empty",
                Some("messages"),
            ));
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(GatewayError::validation(
                    format!("temperature must be between 0.0 and 2.0, got {temperature}"),
                    Some("temperature"),
                ));
            }
        }

        if let Some(top_p) = self.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(GatewayError::validation(
                    format!("top_p must be between 0.0 and 1.0, got {top_p}"),
                    Some("top_p"),
                ));
            }
        }

        if self.max_tokens == Some(0) {
            return Err(GatewayError::validation(
                "max_tokens must be at least 1",
                Some("max_tokens"),
            ));
        }

        Ok(())
    }

    /// Estimate the token cost of this request for admission.
    ///
    /// Prompt tokens are approximated from text length; the completion budget
    /// is `max_tokens` when given. Never returns zero.
    #[must_use]
    pub fn estimated_tokens(&self) -> u32 {
        let chars: usize = self.messages.iter().map(|m| m.content.text_len()).sum();
        let prompt = chars.div_ceil(CHARS_PER_TOKEN);
        let prompt = u32::try_from(prompt).unwrap_or(u32::MAX);
        prompt.saturating_add(self.max_tokens.unwrap_or(0)).max(1)
    }
}

/// Legacy completion request (`/v1/completions`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Target model
    pub model: String,

    /// Prompt text
    pub prompt: Prompt,

    /// Enable streaming response
    #[serde(default)]
    pub stream: bool,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Top-p parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// End-user identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CompletionRequest {
    /// Convert into the chat form used by the dispatcher
    #[must_use]
    pub fn into_chat(self) -> ChatRequest {
        ChatRequest {
            model: self.model,
            messages: vec![ChatMessage::user(self.prompt.joined())],
            stream: self.stream,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stop: self.stop,
            user: self.user,
        }
    }
}

/// Completion prompt: a single string or a batch joined with newlines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    /// Single prompt
    Text(String),
    /// Several prompt segments
    Many(Vec<String>),
}

impl Prompt {
    /// Flatten into one prompt string
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Many(parts) => parts.join("\n"),
        }
    }
}

/// Chat message with role and content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message author
    pub role: MessageRole,

    /// Content of the message
    pub content: MessageContent,

    /// Optional name of the author
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    /// Create a message with the given role
    #[must_use]
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
            name: None,
        }
    }

    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Text content with multimodal parts flattened
    #[must_use]
    pub fn text(&self) -> String {
        self.content.to_text()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message
    System,
    /// User message
    User,
    /// Assistant message
    Assistant,
    /// Tool response message
    Tool,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    /// Parse a wire role name, defaulting unknown roles to `user`
    #[must_use]
    pub fn parse(role: &str) -> Self {
        match role.to_ascii_lowercase().as_str() {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content (text or multimodal parts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content
    Text(String),
    /// Multimodal content parts
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenate all text carried by this content
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    fn text_len(&self) -> usize {
        match self {
            Self::Text(s) => s.chars().count(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        }
    }

    /// Check if content is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Content part for multimodal messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content part
    Text {
        /// The text content
        text: String,
    },
    /// Image content part, forwarded untouched
    ImageUrl {
        /// Image URL details
        image_url: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_openai_body() {
        let body = r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"max_tokens":16}"#;
        let request: ChatRequest = serde_json::from_str(body).expect("parse");
        assert_eq!(request.model, "gpt-4o-mini");
        assert!(!request.stream);
        assert_eq!(request.max_tokens, Some(16));
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_empty_messages() {
        let mut request = ChatRequest::simple("gpt-4", "hello");
        request.messages.clear();
        let err = request.validate().expect_err("must fail");
        assert!(matches!(
            err,
            GatewayError::Validation { field: Some(ref f), .. } if f == "messages"
        ));
    }

    #[test]
    fn test_validation_rejects_bad_temperature() {
        let mut request = ChatRequest::simple("gpt-4", "hello");
        request.temperature = Some(3.0);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_estimated_tokens() {
        let mut request = ChatRequest::simple("gpt-4", "abcdefgh");
        assert_eq!(request.estimated_tokens(), 2);

        request.max_tokens = Some(100);
        assert_eq!(request.estimated_tokens(), 102);

        request.messages[0].content = MessageContent::Text(String::new());
        request.max_tokens = None;
        assert_eq!(request.estimated_tokens(), 1);
    }

    #[test]
    fn test_completion_into_chat() {
        let body = r#"{"model":"m","prompt":["a","b"],"stream":true}"#;
        let request: CompletionRequest = serde_json::from_str(body).expect("parse");
        let chat = request.into_chat();
        assert!(chat.stream);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].text(), "a\nb");
        assert_eq!(chat.messages[0].role, MessageRole::User);
    }

    #[test]
    fn test_multimodal_text_flattening() {
        let body = r#"{"role":"user","content":[{"type":"text","text":"look "},{"type":"image_url","image_url":{"url":"x"}},{"type":"text","text":"here"}]}"#;
        let message: ChatMessage = serde_json::from_str(body).expect("parse");
        assert_eq!(message.text(), "look here");
    }
}
