//! Usage reporting.
//!
//! Request paths hand events to [`UsageReporter::report`], which never
//! waits: events go into a bounded queue drained by one background task.
//! A full queue drops the event and bumps `gateway_usage_events_dropped_total`.

use async_trait::async_trait;
use gateway_core::{GatewayError, GatewayResult, UsageEvent, UsageSink};
use gateway_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle used by request paths to enqueue usage events
#[derive(Clone)]
pub struct UsageReporter {
    tx: mpsc::Sender<UsageEvent>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageReporter")
            .field("capacity", &self.tx.max_capacity())
            .finish_non_exhaustive()
    }
}

impl UsageReporter {
    /// Start the delivery task.
    ///
    /// On cancellation the task stops accepting events, delivers what is
    /// already queued, and exits.
    pub fn spawn(
        sink: Arc<dyn UsageSink>,
        capacity: usize,
        metrics: Option<Metrics>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(capacity.max(1));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => deliver(sink.as_ref(), &event).await,
                        None => return,
                    },
                }
            }

            rx.close();
            let mut drained = 0_usize;
            while let Some(event) = rx.recv().await {
                deliver(sink.as_ref(), &event).await;
                drained += 1;
            }
            info!(drained, "Usage reporter stopped");
        });

        (Self { tx, metrics }, handle)
    }

    /// Enqueue an event without waiting
    pub fn report(&self, event: UsageEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    request_id = %event.request_id,
                    client = %event.client_id,
                    "Usage queue full, dropping event"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_usage_dropped();
                }
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(request_id = %event.request_id, "Usage reporter stopped, dropping event");
                if let Some(metrics) = &self.metrics {
                    metrics.record_usage_dropped();
                }
            }
        }
    }
}

async fn deliver(sink: &dyn UsageSink, event: &UsageEvent) {
    if let Err(e) = sink.record(event).await {
        warn!(request_id = %event.request_id, error = %e, "Failed to deliver usage event");
    }
}

/// Writes usage events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingUsageSink;

#[async_trait]
impl UsageSink for LoggingUsageSink {
    async fn record(&self, event: &UsageEvent) -> GatewayResult<()> {
        info!(
            target: "usage",
            client = %event.client_id,
            model = %event.model,
            provider = %event.provider,
            tokens = event.tokens_used,
            request_id = %event.request_id,
            outcome = ?event.outcome,
            "Usage recorded"
        );
        Ok(())
    }
}

/// POSTs usage events as JSON to a ledger endpoint
#[derive(Debug, Clone)]
pub struct HttpUsageSink {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpUsageSink {
    /// Create a sink
    #[must_use]
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn record(&self, event: &UsageEvent) -> GatewayResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(event)
            .send()
            .await
            .map_err(|e| GatewayError::internal(format!("usage ledger unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(GatewayError::internal(format!(
                "usage ledger returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gateway_core::UsageOutcome;
    use parking_lot::Mutex;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(request_id: &str) -> UsageEvent {
        UsageEvent {
            client_id: "key:k1".to_string(),
            model: "m".to_string(),
            provider: "alpha".to_string(),
            tokens_used: 12,
            request_id: request_id.to_string(),
            outcome: UsageOutcome::Complete,
            recorded_at: Utc::now(),
        }
    }

    #[derive(Default)]
    struct Collecting(Mutex<Vec<String>>);

    #[async_trait]
    impl UsageSink for Collecting {
        async fn record(&self, event: &UsageEvent) -> GatewayResult<()> {
            self.0.lock().push(event.request_id.clone());
            Ok(())
        }
    }

    struct Blocking(tokio::sync::Notify);

    #[async_trait]
    impl UsageSink for Blocking {
        async fn record(&self, _: &UsageEvent) -> GatewayResult<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_events_are_delivered_and_drained_on_cancel() {
        let sink = Arc::new(Collecting::default());
        let cancel = CancellationToken::new();
        let (reporter, handle) =
            UsageReporter::spawn(Arc::clone(&sink) as Arc<dyn UsageSink>, 8, None, cancel.clone());

        for i in 0..3 {
            reporter.report(event(&format!("req-{i}")));
        }
        cancel.cancel();
        handle.await.expect("joined");

        assert_eq!(sink.0.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let sink = Arc::new(Blocking(tokio::sync::Notify::new()));
        let metrics = Metrics::new().expect("metrics");
        let cancel = CancellationToken::new();
        let (reporter, _handle) = UsageReporter::spawn(
            Arc::clone(&sink) as Arc<dyn UsageSink>,
            1,
            Some(metrics.clone()),
            cancel.clone(),
        );

        // The worker takes the first event and blocks on it; the second
        // fills the queue.
        reporter.report(event("req-0"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        reporter.report(event("req-1"));
        reporter.report(event("req-2"));
        reporter.report(event("req-3"));

        assert_eq!(metrics.usage_events_dropped(), 2);
        cancel.cancel();
        sink.0.notify_waiters();
    }

    #[tokio::test]
    async fn test_http_sink_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/usage"))
            .and(body_partial_json(serde_json::json!({
                "client_id": "key:k1",
                "tokens_used": 12,
                "outcome": "complete"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpUsageSink::new(
            reqwest::Client::new(),
            format!("{}/usage", server.uri()),
            Duration::from_secs(2),
        );
        sink.record(&event("req-1")).await.expect("delivered");
    }

    #[tokio::test]
    async fn test_http_sink_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = HttpUsageSink::new(reqwest::Client::new(), server.uri(), Duration::from_secs(2));
        assert!(sink.record(&event("req-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_logging_sink_accepts_everything() {
        assert!(LoggingUsageSink.record(&event("req-1")).await.is_ok());
    }
}
