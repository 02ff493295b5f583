//! Streaming relay.
//!
//! Normalises an upstream chunk stream for the client: indices are
//! contiguous from zero, `tokens_used_so_far` never decreases, duplicate
//! upstream indices are dropped, and a clean end emits exactly one terminal
//! chunk. A mid-stream error ends the stream without a terminal chunk.
//!
//! The finish callback runs exactly once: on clean end, on error, or when
//! the consumer drops the stream early.

use async_stream::stream;
use futures::StreamExt;
use gateway_core::{CallContext, ChunkStream, FinishReason, StreamChunk};
use gateway_providers::translate::estimate_tokens;
use gateway_telemetry::Metrics;
use tracing::{debug, warn};

/// How a relayed stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Upstream finished and the terminal chunk was emitted
    Complete,
    /// Upstream failed mid-stream
    Failed(String),
    /// Consumer went away or the call was cancelled
    Abandoned,
}

impl RelayOutcome {
    /// Whether the stream ran to completion
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// What the relay saw, handed to the finish callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    /// Gateway request id
    pub request_id: String,
    /// Provider that served the stream
    pub provider: String,
    /// Content chunks forwarded
    pub chunks: u64,
    /// Highest token count seen, or an estimate from the text when the
    /// upstream never reported one
    pub tokens_used: u32,
    /// How the stream ended
    pub outcome: RelayOutcome,
}

type FinishFn = Box<dyn FnOnce(RelaySummary) + Send>;

struct FinishGuard {
    request_id: String,
    provider: String,
    chunks: u64,
    reported_tokens: u32,
    text: String,
    on_finish: Option<FinishFn>,
}

impl FinishGuard {
    fn tokens_used(&self) -> u32 {
        self.reported_tokens.max(estimate_tokens(&self.text))
    }

    fn finish(&mut self, outcome: RelayOutcome) {
        let Some(on_finish) = self.on_finish.take() else {
            return;
        };
        on_finish(RelaySummary {
            request_id: self.request_id.clone(),
            provider: self.provider.clone(),
            chunks: self.chunks,
            tokens_used: self.tokens_used(),
            outcome,
        });
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.on_finish.is_some() {
            debug!(
                request_id = %self.request_id,
                provider = %self.provider,
                chunks = self.chunks,
                "Stream abandoned by consumer"
            );
            self.finish(RelayOutcome::Abandoned);
        }
    }
}

/// Wrap an upstream stream.
///
/// Reads stop as soon as `ctx` is cancelled or its deadline passes.
pub fn relay_stream<F>(
    ctx: CallContext,
    provider: impl Into<String>,
    mut upstream: ChunkStream,
    metrics: Option<Metrics>,
    on_finish: F,
) -> ChunkStream
where
    F: FnOnce(RelaySummary) + Send + 'static,
{
    let request_id = ctx.request_id().to_string();
    let mut guard = FinishGuard {
        request_id: request_id.clone(),
        provider: provider.into(),
        chunks: 0,
        reported_tokens: 0,
        text: String::new(),
        on_finish: Some(Box::new(on_finish)),
    };

    let relayed = stream! {
        let mut next_index: u64 = 0;
        let mut last_upstream_index: Option<u64> = None;
        let mut finish_reason: Option<FinishReason> = None;

        loop {
            let item = match ctx.run(async { Ok(upstream.next().await) }).await {
                Ok(item) => item,
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "Stream read stopped");
                    let outcome = if e.is_cancellation() {
                        RelayOutcome::Abandoned
                    } else {
                        RelayOutcome::Failed(e.to_string())
                    };
                    guard.finish(outcome);
                    yield Err(e);
                    break;
                }
            };

            match item {
                Some(Ok(chunk)) => {
                    if last_upstream_index.is_some_and(|last| chunk.index <= last) {
                        debug!(
                            request_id = %request_id,
                            index = chunk.index,
                            "Dropping duplicate chunk"
                        );
                        continue;
                    }
                    last_upstream_index = Some(chunk.index);

                    guard.reported_tokens = guard.reported_tokens.max(chunk.tokens_used_so_far);
                    if chunk.finish_reason.is_some() {
                        finish_reason = chunk.finish_reason;
                    }
                    if chunk.text.is_empty() {
                        continue;
                    }
                    guard.text.push_str(&chunk.text);
                    guard.chunks += 1;
                    if let Some(metrics) = &metrics {
                        metrics.record_stream_chunk(&guard.provider);
                    }

                    let out = StreamChunk {
                        request_id: request_id.clone(),
                        index: next_index,
                        text: chunk.text,
                        is_final: false,
                        tokens_used_so_far: guard.reported_tokens,
                        finish_reason: None,
                    };
                    next_index += 1;
                    yield Ok(out);
                }
                Some(Err(e)) => {
                    warn!(
                        request_id = %request_id,
                        provider = %guard.provider,
                        error = %e,
                        "Upstream stream failed"
                    );
                    guard.finish(RelayOutcome::Failed(e.to_string()));
                    yield Err(e);
                    break;
                }
                None => {
                    let mut terminal =
                        StreamChunk::terminal(request_id.clone(), next_index, guard.tokens_used());
                    terminal.finish_reason = Some(finish_reason.unwrap_or_default());
                    guard.finish(RelayOutcome::Complete);
                    yield Ok(terminal);
                    break;
                }
            }
        }
    };

    Box::pin(relayed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::{GatewayError, GatewayResult};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn upstream(items: Vec<GatewayResult<StreamChunk>>) -> ChunkStream {
        Box::pin(futures::stream::iter(items))
    }

    fn chunk(index: u64, text: &str, tokens: u32) -> GatewayResult<StreamChunk> {
        let mut chunk = StreamChunk::content("up", index, text);
        chunk.tokens_used_so_far = tokens;
        Ok(chunk)
    }

    fn recorder() -> (Arc<Mutex<Vec<RelaySummary>>>, impl FnOnce(RelaySummary) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |summary| sink.lock().push(summary))
    }

    fn ctx() -> CallContext {
        CallContext::new("req-9", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_clean_stream_has_one_terminal_chunk() {
        let (seen, on_finish) = recorder();
        let relayed = relay_stream(
            ctx(),
            "alpha",
            upstream(vec![chunk(0, "Hel", 3), chunk(1, "lo", 5), chunk(2, "!", 4)]),
            None,
            on_finish,
        );
        let out: Vec<StreamChunk> = relayed.map(|c| c.expect("chunk")).collect().await;

        assert_eq!(out.len(), 4);
        let finals: Vec<_> = out.iter().filter(|c| c.is_final).collect();
        assert_eq!(finals.len(), 1);
        assert!(out.last().expect("last").is_final);
        assert_eq!(out.last().expect("last").finish_reason, Some(FinishReason::Stop));

        let text: String = out.iter().filter(|c| !c.is_final).map(|c| c.text.as_str()).collect();
        assert_eq!(text, "Hello!");
        let indices: Vec<u64> = out.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let tokens: Vec<u32> = out.iter().map(|c| c.tokens_used_so_far).collect();
        assert_eq!(tokens, vec![3, 5, 5, 5]);
        assert!(out.iter().all(|c| c.request_id == "req-9"));

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].outcome, RelayOutcome::Complete);
        assert_eq!(seen[0].chunks, 3);
        assert_eq!(seen[0].tokens_used, 5);
    }

    #[tokio::test]
    async fn test_duplicate_indices_are_dropped() {
        let (_, on_finish) = recorder();
        let relayed = relay_stream(
            ctx(),
            "alpha",
            upstream(vec![chunk(0, "a", 1), chunk(0, "a", 1), chunk(1, "b", 2)]),
            None,
            on_finish,
        );
        let out: Vec<StreamChunk> = relayed.map(|c| c.expect("chunk")).collect().await;
        let text: String = out.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn test_mid_stream_error_ends_without_terminal() {
        let (seen, on_finish) = recorder();
        let relayed = relay_stream(
            ctx(),
            "alpha",
            upstream(vec![
                chunk(0, "partial", 7),
                Err(GatewayError::transport("alpha", "stream interrupted", None, false)),
                chunk(1, "never", 9),
            ]),
            None,
            on_finish,
        );
        let out: Vec<GatewayResult<StreamChunk>> = relayed.collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0].outcome, RelayOutcome::Failed(_)));
        assert_eq!(seen[0].tokens_used, 7);
    }

    #[tokio::test]
    async fn test_dropped_consumer_finishes_once() {
        let (seen, on_finish) = recorder();
        let mut relayed = relay_stream(
            ctx(),
            "alpha",
            upstream(vec![chunk(0, "one", 2), chunk(1, "two", 4)]),
            None,
            on_finish,
        );
        let first = relayed.next().await.expect("item").expect("chunk");
        assert_eq!(first.text, "one");
        drop(relayed);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].outcome, RelayOutcome::Abandoned);
        assert_eq!(seen[0].tokens_used, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_reads() {
        let (seen, on_finish) = recorder();
        let ctx = ctx();
        let token = ctx.token().clone();
        let pending: ChunkStream = Box::pin(futures::stream::pending());
        let mut relayed = relay_stream(ctx, "alpha", pending, None, on_finish);

        token.cancel();
        let item = relayed.next().await.expect("item");
        assert!(item.expect_err("cancelled").is_cancellation());
        assert!(relayed.next().await.is_none());
        assert_eq!(seen.lock()[0].outcome, RelayOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_tokens_estimated_when_unreported() {
        let (seen, on_finish) = recorder();
        let relayed = relay_stream(
            ctx(),
            "alpha",
            upstream(vec![chunk(0, "abcdefgh", 0)]),
            Some(Metrics::new().expect("metrics")),
            on_finish,
        );
        let out: Vec<StreamChunk> = relayed.map(|c| c.expect("chunk")).collect().await;
        assert_eq!(out.last().expect("terminal").tokens_used_so_far, 2);
        assert_eq!(seen.lock()[0].tokens_used, 2);
    }
}
