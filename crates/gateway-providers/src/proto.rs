//! `llmgateway.v1.ChatCompletion` wire messages.
//!
//! Shared by the outbound RPC transport and the inbound gRPC service.
//!
//! ```proto
//! service ChatCompletion {
//!   rpc Complete(CompletionRequest) returns (CompletionResponse);
//!   rpc StreamComplete(CompletionRequest) returns (stream CompletionChunk);
//! }
//! ```

use gateway_core::{
    ChatMessage, ChatRequest, ChatResponse, Choice, FinishReason, MessageRole, StreamChunk,
    Usage as GatewayUsage,
};

/// Fully qualified service name
pub const SERVICE_NAME: &str = "llmgateway.v1.ChatCompletion";
/// Unary method path
pub const COMPLETE_PATH: &str = "/llmgateway.v1.ChatCompletion/Complete";
/// Server-streaming method path
pub const STREAM_COMPLETE_PATH: &str = "/llmgateway.v1.ChatCompletion/StreamComplete";

/// One chat message
#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    /// `system`, `user`, `assistant` or `tool`
    #[prost(string, tag = "1")]
    pub role: String,
    /// Plain text content
    #[prost(string, tag = "2")]
    pub content: String,
}

/// Completion request
#[derive(Clone, PartialEq, prost::Message)]
pub struct CompletionRequest {
    /// Caller-chosen request id; the gateway assigns one when empty
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Model name
    #[prost(string, tag = "2")]
    pub model: String,
    /// Conversation
    #[prost(message, repeated, tag = "3")]
    pub messages: Vec<Message>,
    /// Sampling temperature
    #[prost(float, optional, tag = "4")]
    pub temperature: Option<f32>,
    /// Completion budget
    #[prost(uint32, optional, tag = "5")]
    pub max_tokens: Option<u32>,
    /// Whether the caller wants a stream
    #[prost(bool, tag = "6")]
    pub stream: bool,
    /// Nucleus sampling
    #[prost(float, optional, tag = "7")]
    pub top_p: Option<f32>,
}

/// Token accounting
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Usage {
    /// Prompt tokens
    #[prost(uint32, tag = "1")]
    pub prompt_tokens: u32,
    /// Completion tokens
    #[prost(uint32, tag = "2")]
    pub completion_tokens: u32,
    /// Total tokens
    #[prost(uint32, tag = "3")]
    pub total_tokens: u32,
}

/// Unary completion result
#[derive(Clone, PartialEq, prost::Message)]
pub struct CompletionResponse {
    /// Request id
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Response id
    #[prost(string, tag = "2")]
    pub id: String,
    /// Model that answered
    #[prost(string, tag = "3")]
    pub model: String,
    /// Generated text
    #[prost(string, tag = "4")]
    pub text: String,
    /// Finish reason; empty means `stop`
    #[prost(string, tag = "5")]
    pub finish_reason: String,
    /// Token accounting
    #[prost(message, optional, tag = "6")]
    pub usage: Option<Usage>,
    /// Unix timestamp
    #[prost(int64, tag = "7")]
    pub created: i64,
}

/// One streamed piece
#[derive(Clone, PartialEq, prost::Message)]
pub struct CompletionChunk {
    /// Request id
    #[prost(string, tag = "1")]
    pub request_id: String,
    /// Position in the stream
    #[prost(uint64, tag = "2")]
    pub index: u64,
    /// Text delta
    #[prost(string, tag = "3")]
    pub text: String,
    /// Set on the last chunk only
    #[prost(bool, tag = "4")]
    pub is_final: bool,
    /// Highest token count reported so far
    #[prost(uint32, tag = "5")]
    pub tokens_used_so_far: u32,
    /// Finish reason, on the chunk that carries it
    #[prost(string, tag = "6")]
    pub finish_reason: String,
}

impl CompletionRequest {
    /// Encode a gateway request
    #[must_use]
    pub fn from_chat(request_id: &str, request: &ChatRequest, stream: bool) -> Self {
        Self {
            request_id: request_id.to_string(),
            model: request.model.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| Message {
                    role: m.role.as_str().to_string(),
                    content: m.text(),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
            top_p: request.top_p,
        }
    }

    /// Decode into a gateway request
    #[must_use]
    pub fn into_chat(self) -> ChatRequest {
        ChatRequest {
            model: self.model,
            messages: self
                .messages
                .into_iter()
                .map(|m| ChatMessage::new(MessageRole::parse(&m.role), m.content))
                .collect(),
            stream: self.stream,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            stop: None,
            user: None,
        }
    }
}

impl From<GatewayUsage> for Usage {
    fn from(usage: GatewayUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

impl From<Usage> for GatewayUsage {
    fn from(usage: Usage) -> Self {
        let mut normalised = Self::new(usage.prompt_tokens, usage.completion_tokens);
        normalised.total_tokens = normalised.total_tokens.max(usage.total_tokens);
        normalised
    }
}

fn finish_reason_from_wire(raw: &str) -> Option<FinishReason> {
    (!raw.is_empty()).then(|| FinishReason::parse(raw))
}

impl CompletionResponse {
    /// Encode a gateway response
    #[must_use]
    pub fn from_chat(request_id: &str, response: &ChatResponse) -> Self {
        let finish_reason = response
            .choices
            .first()
            .map(|c| c.finish_reason)
            .unwrap_or_default();
        Self {
            request_id: request_id.to_string(),
            id: response.id.clone(),
            model: response.model.clone(),
            text: response.text(),
            finish_reason: finish_reason.as_str().to_string(),
            usage: Some(response.usage.into()),
            created: response.created,
        }
    }

    /// Decode into a gateway response, filling defaults
    #[must_use]
    pub fn into_chat(self, requested_model: &str) -> ChatResponse {
        let usage = self.usage.map_or_else(
            || GatewayUsage::new(0, crate::translate::estimate_tokens(&self.text)),
            GatewayUsage::from,
        );
        ChatResponse {
            id: if self.id.is_empty() {
                self.request_id.clone()
            } else {
                self.id
            },
            object: "chat.completion".to_string(),
            created: if self.created == 0 {
                chrono::Utc::now().timestamp()
            } else {
                self.created
            },
            model: if self.model.is_empty() {
                requested_model.to_string()
            } else {
                self.model
            },
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::assistant(self.text),
                finish_reason: finish_reason_from_wire(&self.finish_reason).unwrap_or_default(),
            }],
            usage,
        }
    }
}

impl CompletionChunk {
    /// Encode a relay chunk
    #[must_use]
    pub fn from_stream_chunk(chunk: &StreamChunk) -> Self {
        Self {
            request_id: chunk.request_id.clone(),
            index: chunk.index,
            text: chunk.text.clone(),
            is_final: chunk.is_final,
            tokens_used_so_far: chunk.tokens_used_so_far,
            finish_reason: chunk
                .finish_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        }
    }

    /// Decode into a relay chunk
    #[must_use]
    pub fn into_stream_chunk(self) -> StreamChunk {
        StreamChunk {
            finish_reason: finish_reason_from_wire(&self.finish_reason),
            request_id: self.request_id,
            index: self.index,
            text: self.text,
            is_final: self.is_final,
            tokens_used_so_far: self.tokens_used_so_far,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn test_request_survives_the_wire() {
        let mut chat = ChatRequest::simple("llama-3", "hello");
        chat.messages.insert(0, ChatMessage::system("be brief"));
        chat.temperature = Some(0.5);
        chat.max_tokens = Some(32);

        let encoded = CompletionRequest::from_chat("req-1", &chat, true).encode_to_vec();
        let decoded = CompletionRequest::decode(encoded.as_slice()).expect("decode");
        assert_eq!(decoded.request_id, "req-1");
        assert!(decoded.stream);

        let back = decoded.into_chat();
        assert_eq!(back.model, "llama-3");
        assert_eq!(back.messages.len(), 2);
        assert_eq!(back.messages[0].role, MessageRole::System);
        assert_eq!(back.temperature, Some(0.5));
        assert_eq!(back.max_tokens, Some(32));
    }

    #[test]
    fn test_response_defaults() {
        let response = CompletionResponse {
            request_id: "req-1".to_string(),
            text: "abcd".to_string(),
            ..Default::default()
        }
        .into_chat("llama-3");

        assert_eq!(response.id, "req-1");
        assert_eq!(response.model, "llama-3");
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.completion_tokens, 1);
        assert!(response.created > 0);
    }

    #[test]
    fn test_chunk_finish_reason() {
        let mut chunk = StreamChunk::content("req-1", 3, "x");
        chunk.finish_reason = Some(FinishReason::Length);
        let wire = CompletionChunk::from_stream_chunk(&chunk);
        assert_eq!(wire.finish_reason, "length");
        assert_eq!(wire.into_stream_chunk(), chunk);

        let plain = CompletionChunk::from_stream_chunk(&StreamChunk::content("req-1", 0, "y"));
        assert_eq!(plain.into_stream_chunk().finish_reason, None);
    }
}
