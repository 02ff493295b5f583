//! Response types for the gateway.

use crate::request::ChatMessage;
use serde::{Deserialize, Serialize};

/// Which public API surface a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `/v1/chat/completions`
    Chat,
    /// `/v1/completions`
    Completion,
}

impl ApiFlavor {
    /// Route key used for rate rules and metrics
    #[must_use]
    pub fn route(&self) -> &'static str {
        match self {
            Self::Chat => "/v1/chat/completions",
            Self::Completion => "/v1/completions",
        }
    }
}

/// Chat completion response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Response identifier
    pub id: String,
    /// Object type, always `chat.completion`
    pub object: String,
    /// Unix timestamp of creation
    pub created: i64,
    /// Model that produced the response
    pub model: String,
    /// Generated choices
    pub choices: Vec<Choice>,
    /// Token accounting
    pub usage: Usage,
}

impl ChatResponse {
    /// Text of the first choice, empty when there is none
    #[must_use]
    pub fn text(&self) -> String {
        self.choices
            .first()
            .map(|c| c.message.text())
            .unwrap_or_default()
    }
}

/// One generated choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index
    pub index: u32,
    /// Generated message
    pub message: ChatMessage,
    /// Why generation stopped
    pub finish_reason: FinishReason,
}

/// Reason generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop or stop sequence
    #[default]
    Stop,
    /// Token limit reached
    Length,
    /// Filtered by the provider
    ContentFilter,
    /// Model requested tool calls
    ToolCalls,
}

impl FinishReason {
    /// Parse an upstream finish reason, tolerating provider aliases
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "length" | "max_tokens" => Self::Length,
            "content_filter" | "safety" => Self::ContentFilter,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            _ => Self::Stop,
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ContentFilter => "content_filter",
            Self::ToolCalls => "tool_calls",
        }
    }
}

/// Token usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage with the total computed
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Legacy completion response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response identifier
    pub id: String,
    /// Object type, always `text_completion`
    pub object: String,
    /// Unix timestamp of creation
    pub created: i64,
    /// Model that produced the response
    pub model: String,
    /// Generated choices
    pub choices: Vec<CompletionChoice>,
    /// Token accounting
    pub usage: Usage,
}

/// One legacy completion choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Choice index
    pub index: u32,
    /// Generated text
    pub text: String,
    /// Why generation stopped
    pub finish_reason: FinishReason,
}

impl From<ChatResponse> for CompletionResponse {
    fn from(response: ChatResponse) -> Self {
        Self {
            id: response.id,
            object: "text_completion".to_string(),
            created: response.created,
            model: response.model,
            choices: response
                .choices
                .into_iter()
                .map(|c| CompletionChoice {
                    index: c.index,
                    text: c.message.text(),
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: response.usage,
        }
    }
}

/// `GET /v1/models` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    /// Always `list`
    pub object: String,
    /// Models served by at least one provider
    pub data: Vec<ModelObject>,
}

/// A model entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    /// Model name
    pub id: String,
    /// Always `model`
    pub object: String,
    /// First provider that serves it
    pub owned_by: String,
}
