//! End-to-end tests driving the HTTP router against a mock upstream.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use gateway_core::{ProviderConfig, StaticCredentialSource};
use gateway_providers::{DefaultTransportFactory, ProviderRegistry};
use gateway_ratelimit::{
    AdmissionConfig, AdmissionController, ManualClock, MemoryCounterStore, RateRule, RuleStore,
    StaticRuleSource,
};
use gateway_resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use gateway_routing::{circuit_state_listener, Dispatcher, LoggingUsageSink, UsageReporter};
use gateway_server::{create_router, AppState};
use gateway_telemetry::Metrics;
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MODEL: &str = "gpt-test";

struct Harness {
    app: Router,
    clock: Arc<ManualClock>,
    upstream: MockServer,
    _cancel: CancellationToken,
}

async fn harness(rules: Vec<RateRule>, admin_token: Option<&str>) -> Harness {
    let upstream = MockServer::start().await;
    let metrics = Metrics::new().expect("metrics");

    let factory = DefaultTransportFactory::new(Arc::new(StaticCredentialSource::new()), None)
        .expect("factory");
    let registry = Arc::new(ProviderRegistry::new(Arc::new(factory)));
    registry
        .register(ProviderConfig::new(
            "alpha",
            upstream.uri(),
            vec![MODEL.to_string()],
        ))
        .expect("register");

    let breakers = Arc::new(
        CircuitBreakerRegistry::new(CircuitBreakerConfig::default())
            .with_listener(circuit_state_listener(metrics.clone())),
    );
    let retry = RetryPolicy::builder()
        .max_attempts(2)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter_factor(0.0)
        .build();
    let dispatcher = Arc::new(Dispatcher::new(registry, breakers, retry, metrics.clone()));

    let clock = Arc::new(ManualClock::new(1_000_000));
    let rule_store = Arc::new(RuleStore::new(
        RateRule::unlimited("*"),
        Arc::new(StaticRuleSource::new(rules)),
    ));
    rule_store.reload().await.expect("rules");
    let admission = Arc::new(AdmissionController::new(
        Arc::new(MemoryCounterStore::new()),
        rule_store,
        clock.clone(),
        AdmissionConfig::default(),
    ));

    let cancel = CancellationToken::new();
    let (usage, _worker) = UsageReporter::spawn(
        Arc::new(LoggingUsageSink),
        64,
        Some(metrics.clone()),
        cancel.clone(),
    );

    let state = AppState::builder()
        .dispatcher(dispatcher)
        .admission(admission)
        .usage(usage)
        .metrics(metrics)
        .timeouts(Duration::from_secs(5), Duration::from_secs(5))
        .admin_token(admin_token.map(|t| SecretString::new(t.to_string())))
        .build()
        .expect("state");

    Harness {
        app: create_router(state),
        clock,
        upstream,
        _cancel: cancel,
    }
}

async fn mount_completion(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "created": 1,
            "model": MODEL,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        })))
        .mount(server)
        .await;
}

async fn mount_stream(server: &MockServer) {
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(server)
        .await;
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-api-key", "client-1")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn chat_body(stream: bool) -> Value {
    json!({
        "model": MODEL,
        "messages": [{"role": "user", "content": "hi"}],
        "stream": stream
    })
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

async fn send(
    app: &Router,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, headers, body)
}

fn json_of(body: &[u8]) -> Value {
    serde_json::from_slice(body).expect("json body")
}

/// `data:` payloads of an SSE body
fn sse_data(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|event| {
            event
                .lines()
                .find_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
                .map(str::to_string)
        })
        .collect()
}

mod health {
    use super::*;

    #[tokio::test]
    async fn test_health_and_ready() {
        let h = harness(Vec::new(), None).await;

        let (status, _, body) = send(&h.app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["status"], "healthy");

        let (status, _, body) = send(&h.app, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["providers"], 1);
    }

    #[tokio::test]
    async fn test_not_ready_without_providers() {
        let h = harness(Vec::new(), None).await;
        let delete = Request::builder()
            .method(Method::DELETE)
            .uri("/v1/providers/alpha")
            .body(Body::empty())
            .expect("request");
        let (status, _, _) = send(&h.app, delete).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&h.app, get("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_of(&body)["status"], "not_ready");
    }

    #[tokio::test]
    async fn test_models_and_metrics() {
        let h = harness(Vec::new(), None).await;

        let (status, _, body) = send(&h.app, get("/v1/models")).await;
        assert_eq!(status, StatusCode::OK);
        let models = json_of(&body);
        assert_eq!(models["object"], "list");
        assert_eq!(models["data"][0]["id"], MODEL);
        assert_eq!(models["data"][0]["owned_by"], "alpha");

        mount_completion(&h.upstream, "ok").await;
        let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, headers, body) = send(&h.app, get("/metrics")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .expect("content type")
            .starts_with("text/plain"));
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("gateway_admission_decisions_total"));
        assert!(text.contains("gateway_upstream_requests_total"));
    }
}

mod completions {
    use super::*;

    #[tokio::test]
    async fn test_chat_completion() {
        let h = harness(Vec::new(), None).await;
        mount_completion(&h.upstream, "Hello there").await;

        let mut request = chat_request(chat_body(false));
        request
            .headers_mut()
            .insert("x-request-id", "req-e2e".parse().expect("header"));
        let (status, headers, body) = send(&h.app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-request-id"], "req-e2e");
        let body = json_of(&body);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 5);
    }

    #[tokio::test]
    async fn test_legacy_completion() {
        let h = harness(Vec::new(), None).await;
        mount_completion(&h.upstream, "four").await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"model": MODEL, "prompt": "2+2=", "max_tokens": 5}).to_string(),
            ))
            .expect("request");
        let (status, _, body) = send(&h.app, request).await;

        assert_eq!(status, StatusCode::OK);
        let body = json_of(&body);
        assert_eq!(body["object"], "text_completion");
        assert_eq!(body["choices"][0]["text"], "four");
    }

    #[tokio::test]
    async fn test_unsupported_model_is_bad_request() {
        let h = harness(Vec::new(), None).await;
        let (status, _, body) = send(
            &h.app,
            chat_request(json!({"model": "nope", "messages": [{"role": "user", "content": "hi"}]})),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["code"], "unsupported_model");
        assert!(h
            .upstream
            .received_requests()
            .await
            .unwrap_or_default()
            .is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_and_empty_messages() {
        let h = harness(Vec::new(), None).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, _, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_of(&body)["code"], "invalid_request");

        let (status, _, _) = send(
            &h.app,
            chat_request(json!({"model": MODEL, "messages": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_provider_unavailable() {
        let h = harness(Vec::new(), None).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(2)
            .mount(&h.upstream)
            .await;

        let (status, _, body) = send(&h.app, chat_request(chat_body(false))).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        let body = json_of(&body);
        assert_eq!(body["code"], "provider_unavailable");
        assert!(!body["error"].as_str().unwrap_or_default().contains("overloaded"));
    }
}

mod streaming {
    use super::*;

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let h = harness(Vec::new(), None).await;
        mount_stream(&h.upstream).await;

        let (status, headers, body) = send(&h.app, chat_request(chat_body(true))).await;

        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .expect("content type")
            .starts_with("text/event-stream"));

        let events = sse_data(&body);
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
        assert_eq!(events.iter().filter(|e| *e == "[DONE]").count(), 1);

        let chunks: Vec<Value> = events[..events.len() - 1]
            .iter()
            .map(|e| serde_json::from_str(e).expect("chunk json"))
            .collect();
        let text: String = chunks
            .iter()
            .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
            .collect();
        assert_eq!(text, "Hello");
        assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(
            chunks.last().expect("terminal chunk")["choices"][0]["finish_reason"],
            "stop"
        );
    }

    #[tokio::test]
    async fn test_stream_setup_failure_is_json_error() {
        let h = harness(Vec::new(), None).await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&h.upstream)
            .await;

        let (status, headers, body) = send(&h.app, chat_request(chat_body(true))).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(headers[header::CONTENT_TYPE]
            .to_str()
            .expect("content type")
            .starts_with("application/json"));
        assert_eq!(json_of(&body)["code"], "provider_unavailable");
    }
}

mod rate_limiting {
    use super::*;

    #[tokio::test]
    async fn test_two_per_minute_then_retry_after() {
        let h = harness(
            vec![RateRule::requests("/v1/chat/completions", 2, 60)],
            None,
        )
        .await;
        mount_completion(&h.upstream, "ok").await;

        for _ in 0..2 {
            let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, headers, body) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(headers[header::RETRY_AFTER], "30");
        let body = json_of(&body);
        assert_eq!(body["error"], "rate limit exceeded");
        assert_eq!(body["code"], "rate_limit_exceeded");

        h.clock.advance(Duration::from_secs(61));
        let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_limits_are_per_client() {
        let h = harness(
            vec![RateRule::requests("/v1/chat/completions", 1, 60)],
            None,
        )
        .await;
        mount_completion(&h.upstream, "ok").await;

        let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let mut other = chat_request(chat_body(false));
        other
            .headers_mut()
            .insert("x-api-key", "client-2".parse().expect("header"));
        let (status, _, _) = send(&h.app, other).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_routes_use_default_rule() {
        let h = harness(
            vec![RateRule::requests("/v1/chat/completions", 1, 60)],
            None,
        )
        .await;
        mount_completion(&h.upstream, "ok").await;

        for _ in 0..3 {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/v1/completions")
                .header(header::CONTENT_TYPE, "application/json")
                .header("x-api-key", "client-1")
                .body(Body::from(json!({"model": MODEL, "prompt": "hi"}).to_string()))
                .expect("request");
            let (status, _, _) = send(&h.app, request).await;
            assert_eq!(status, StatusCode::OK);
        }
    }
}

mod admin {
    use super::*;

    fn admin(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request")
    }

    #[tokio::test]
    async fn test_provider_lifecycle() {
        let h = harness(Vec::new(), None).await;

        let (status, _, body) = send(&h.app, admin(Method::GET, "/v1/providers", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)[0]["name"], "alpha");

        let beta = json!({
            "name": "beta",
            "base_address": "http://127.0.0.1:9",
            "supported_models": ["other-model"]
        });
        let (status, _, body) = send(
            &h.app,
            admin(Method::POST, "/v1/providers", None, Some(beta.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json_of(&body)["is_healthy"], true);

        let (status, _, _) =
            send(&h.app, admin(Method::POST, "/v1/providers", None, Some(beta))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _, body) = send(&h.app, get("/v1/models")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["data"].as_array().map(Vec::len), Some(2));

        let (status, _, _) =
            send(&h.app, admin(Method::DELETE, "/v1/providers/beta", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) =
            send(&h.app, admin(Method::DELETE, "/v1/providers/beta", None, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_circuit_breaker_endpoints() {
        let h = harness(Vec::new(), None).await;

        let (status, _, body) = send(
            &h.app,
            admin(Method::GET, "/v1/circuit-breakers/alpha", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["state"], "closed");

        let (status, _, body) =
            send(&h.app, admin(Method::GET, "/v1/circuit-breakers", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)[0]["name"], "alpha");

        let (status, _, body) = send(
            &h.app,
            admin(Method::POST, "/v1/circuit-breakers/alpha/reset", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_of(&body)["state"], "closed");

        let (status, _, _) = send(
            &h.app,
            admin(Method::GET, "/v1/circuit-breakers/ghost", None, None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_token_guards_admin_routes_only() {
        let h = harness(Vec::new(), Some("s3cret")).await;
        mount_completion(&h.upstream, "ok").await;

        let (status, _, body) = send(&h.app, admin(Method::GET, "/v1/providers", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json_of(&body)["code"], "unauthorized");

        let (status, _, _) = send(
            &h.app,
            admin(Method::GET, "/v1/providers", Some("wrong"), None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(
            &h.app,
            admin(Method::GET, "/v1/providers", Some("s3cret"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(&h.app, chat_request(chat_body(false))).await;
        assert_eq!(status, StatusCode::OK);
    }
}
