//! OpenAI-compatible upstream schema and its mapping to gateway types.
//!
//! Upstreams disagree on details: some omit `finish_reason` or `total_tokens`,
//! some use `input_tokens`/`output_tokens`, some return legacy `text` choices.
//! Everything is normalised here so the rest of the gateway sees one shape.

use gateway_core::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, GatewayError, GatewayResult,
    MessageContent, MessageRole, Usage,
};
use serde::{Deserialize, Serialize};

const CHARS_PER_TOKEN: usize = 4;

/// Body sent to `/v1/chat/completions`
#[derive(Debug, Serialize)]
pub struct UpstreamRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> UpstreamRequest<'a> {
    /// Build the upstream body for `request`
    #[must_use]
    pub fn from_chat(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            stream,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stop: request.stop.as_deref(),
            user: request.user.as_deref(),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<UpstreamChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChoice {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    message: Option<UpstreamMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct UpstreamUsage {
    #[serde(default, alias = "input_tokens")]
    prompt_tokens: u32,
    #[serde(default, alias = "output_tokens")]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: Option<u32>,
}

impl UpstreamUsage {
    fn normalise(self) -> Usage {
        let sum = self.prompt_tokens.saturating_add(self.completion_tokens);
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens.filter(|t| *t >= sum).unwrap_or(sum),
        }
    }
}

/// Rough token count for `text`
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

fn parse_finish_reason(raw: Option<&str>) -> FinishReason {
    raw.map(FinishReason::parse).unwrap_or_default()
}

/// Parse a unary upstream body.
///
/// # Errors
/// Returns `GatewayError::UpstreamProtocol` if the body is not a usable
/// completion
pub fn parse_chat_response(
    provider: &str,
    body: &[u8],
    request: &ChatRequest,
) -> GatewayResult<ChatResponse> {
    let raw: UpstreamResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::upstream_protocol(provider, format!("malformed response body: {e}"))
    })?;

    if raw.choices.is_empty() {
        return Err(GatewayError::upstream_protocol(
            provider,
            "response contains no choices",
        ));
    }

    let choices: Vec<Choice> = raw
        .choices
        .into_iter()
        .enumerate()
        .map(|(position, choice)| {
            let (role, content) = match (choice.message, choice.text) {
                (Some(message), _) => (
                    message
                        .role
                        .as_deref()
                        .map_or(MessageRole::Assistant, MessageRole::parse),
                    message.content.unwrap_or_default(),
                ),
                (None, Some(text)) => (MessageRole::Assistant, MessageContent::Text(text)),
                (None, None) => (MessageRole::Assistant, MessageContent::default()),
            };
            Choice {
                index: choice
                    .index
                    .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX)),
                message: ChatMessage {
                    role,
                    content,
                    name: None,
                },
                finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            }
        })
        .collect();

    let usage = match raw.usage {
        Some(usage) => usage.normalise(),
        None => {
            let completion: u32 = choices
                .iter()
                .map(|c| estimate_tokens(&c.message.text()))
                .sum();
            let prompt: u32 = request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.text()))
                .sum();
            Usage::new(prompt, completion)
        }
    };

    Ok(ChatResponse {
        id: raw
            .id
            .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
        object: "chat.completion".to_string(),
        created: raw.created.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        model: raw.model.unwrap_or_else(|| request.model.clone()),
        choices,
        usage,
    })
}

#[derive(Debug, Deserialize)]
struct UpstreamChunk {
    #[serde(default)]
    choices: Vec<UpstreamChunkChoice>,
    #[serde(default)]
    usage: Option<UpstreamUsage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamChunkChoice {
    #[serde(default)]
    delta: Option<UpstreamDelta>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// The useful part of one upstream stream event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkPiece {
    /// Text delta
    pub text: String,
    /// Finish reason, when this event carries one
    pub finish_reason: Option<FinishReason>,
    /// Total tokens, when this event reports usage
    pub total_tokens: Option<u32>,
}

impl ChunkPiece {
    /// Whether the event carried nothing worth forwarding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.finish_reason.is_none() && self.total_tokens.is_none()
    }
}

/// Parse one SSE `data:` payload.
///
/// # Errors
/// Returns `GatewayError::UpstreamProtocol` for malformed JSON
pub fn parse_chunk(provider: &str, data: &str) -> GatewayResult<ChunkPiece> {
    let raw: UpstreamChunk = serde_json::from_str(data).map_err(|e| {
        GatewayError::upstream_protocol(provider, format!("malformed stream event: {e}"))
    })?;

    let mut piece = ChunkPiece {
        total_tokens: raw.usage.map(|u| u.normalise().total_tokens),
        ..ChunkPiece::default()
    };
    if let Some(choice) = raw.choices.into_iter().next() {
        piece.text = choice
            .delta
            .and_then(|d| d.content)
            .or(choice.text)
            .unwrap_or_default();
        piece.finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);
    }
    Ok(piece)
}

/// Map a non-success upstream HTTP status to a gateway error
#[must_use]
pub fn status_error(provider: &str, status: u16, body: &str) -> GatewayError {
    let detail = extract_error_message(body).unwrap_or_else(|| truncate(body, 256));
    let retryable = matches!(status, 408 | 429 | 500..=599);
    GatewayError::transport(
        provider,
        format!("upstream returned {status}: {detail}"),
        Some(status),
        retryable,
    )
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message")
        .or_else(|| value.get("error"))
        .or_else(|| value.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
