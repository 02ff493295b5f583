//! Streaming types.
//!
//! Transports yield [`StreamChunk`]s; the server renders them as
//! OpenAI-style [`ChatChunk`] or [`CompletionChunk`] SSE events.

use crate::error::GatewayResult;
use crate::response::{FinishReason, Usage};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stream of chunks produced by a transport
pub type ChunkStream = BoxStream<'static, GatewayResult<StreamChunk>>;

/// One incremental piece of a streamed completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Gateway request id
    pub request_id: String,
    /// Position in the stream, starting at 0
    pub index: u64,
    /// Text delta
    pub text: String,
    /// Set on the terminal chunk only
    pub is_final: bool,
    /// Highest token count reported so far
    pub tokens_used_so_far: u32,
    /// Finish reason, on the chunk that carries it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl StreamChunk {
    /// Create a content chunk
    #[must_use]
    pub fn content(request_id: impl Into<String>, index: u64, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            index,
            text: text.into(),
            is_final: false,
            tokens_used_so_far: 0,
            finish_reason: None,
        }
    }

    /// Create the terminal chunk
    #[must_use]
    pub fn terminal(request_id: impl Into<String>, index: u64, tokens_used_so_far: u32) -> Self {
        Self {
            request_id: request_id.into(),
            index,
            text: String::new(),
            is_final: true,
            tokens_used_so_far,
            finish_reason: None,
        }
    }
}

/// OpenAI `chat.completion.chunk`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Response id
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix timestamp
    pub created: i64,
    /// Model name
    pub model: String,
    /// Chunk choices
    pub choices: Vec<ChunkChoice>,
    /// Usage, when the upstream reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    /// Render a relay chunk for the chat surface
    #[must_use]
    pub fn from_stream_chunk(chunk: &StreamChunk, model: &str, created: i64) -> Self {
        Self {
            id: chunk.request_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: (chunk.index == 0).then(|| "assistant".to_string()),
                    content: (!chunk.text.is_empty()).then(|| chunk.text.clone()),
                },
                finish_reason: chunk.finish_reason,
            }],
            usage: None,
        }
    }
}

/// Choice inside a chat chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index
    pub index: u32,
    /// Incremental message
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Set when this choice finishes
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, on the first chunk only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Text delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Legacy `text_completion` stream event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    /// Response id
    pub id: String,
    /// Always `text_completion`
    pub object: String,
    /// Unix timestamp
    pub created: i64,
    /// Model name
    pub model: String,
    /// Choices
    pub choices: Vec<CompletionChunkChoice>,
}

/// Choice inside a legacy completion chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunkChoice {
    /// Choice index
    pub index: u32,
    /// Text delta
    pub text: String,
    /// Set when generation finishes
    pub finish_reason: Option<FinishReason>,
}

impl CompletionChunk {
    /// Render a relay chunk for the legacy completion surface
    #[must_use]
    pub fn from_stream_chunk(chunk: &StreamChunk, model: &str, created: i64) -> Self {
        Self {
            id: chunk.request_id.clone(),
            object: "text_completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![CompletionChunkChoice {
                index: 0,
                text: chunk.text.clone(),
                finish_reason: chunk.finish_reason,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_chunk_carries_role() {
        let chunk = StreamChunk::content("req-1", 0, "Hel");
        let rendered = ChatChunk::from_stream_chunk(&chunk, "m", 1);
        assert_eq!(rendered.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(rendered.choices[0].delta.content.as_deref(), Some("Hel"));

        let next = StreamChunk::content("req-1", 1, "lo");
        let rendered = ChatChunk::from_stream_chunk(&next, "m", 1);
        assert!(rendered.choices[0].delta.role.is_none());
    }

    #[test]
    fn test_chunk_json_shape() {
        let chunk = StreamChunk::content("req-1", 2, "x");
        let json =
            serde_json::to_value(ChatChunk::from_stream_chunk(&chunk, "m", 1)).expect("json");
        assert_eq!(json["object"], "chat.completion.chunk");
        assert_eq!(json["choices"][0]["delta"]["content"], "x");
        assert!(json.get("usage").is_none());
    }
}
