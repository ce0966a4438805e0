//! End-to-end coverage of the round/model failover loop against a mocked
//! upstream, exercising the scenarios worked through in the routing and
//! failover design: sequential failover honoring `retry_on_empty`, a 429
//! triggering a cooldown rather than a retryable skip, and the TTFT-budget
//! vs generation-budget timeout distinction.

use std::sync::Arc;
use std::time::Duration;

use tiered_inference_gateway::config::{ConfigFile, ConfigSnapshot, TierId};
use tiered_inference_gateway::health::HealthStore;
use tiered_inference_gateway::orchestrator::{FailoverOrchestrator, RouteError};
use tiered_inference_gateway::protocol::openai::{ChatCompletionRequest, ChatMessage};
use tiered_inference_gateway::tier::TierClassifier;
use tiered_inference_gateway::trace::TraceBus;
use tiered_inference_gateway::upstream::UpstreamCaller;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_request(model: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: Some(serde_json::Value::String("hello".to_string())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }],
        stream: false,
        tools: None,
        tool_choice: None,
        temperature: None,
        max_tokens: None,
        extra: Default::default(),
    }
}

fn new_orchestrator() -> (FailoverOrchestrator, Arc<HealthStore>) {
    let client = reqwest::Client::new();
    let classifier = TierClassifier::new(client.clone(), client.clone());
    let caller = UpstreamCaller::new(client.clone(), client);
    let health = Arc::new(HealthStore::new(0.05, None));
    let bus = Arc::new(TraceBus::new());

    (
        FailoverOrchestrator::new(classifier, caller, health.clone(), bus),
        health,
    )
}

fn sse_body(lines: &[&str]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("data: [DONE]\n");
    out
}

#[tokio::test]
async fn sequential_failover_retries_past_empty_response() {
    let server = MockServer::start().await;

    // model-a "succeeds" with an empty delta and immediately finishes -
    // retry_on_empty must advance to model-b rather than returning it.
    let empty_chunk = sse_body(&[
        r#"{"model":"model-a","choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("model-a"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(empty_chunk, "text/event-stream")
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let full_chunk = sse_body(&[
        r#"{"model":"model-b","choices":[{"delta":{"content":"hi"},"finish_reason":"stop"}]}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("model-b"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(full_chunk, "text/event-stream")
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let (orchestrator, health) = new_orchestrator();
    let config = {
        let mut file = ConfigFile::default();
        file.providers.upstream.base_url = server.uri();
        file.models.t1 = vec!["model-a".to_string(), "model-b".to_string()];
        ConfigSnapshot::new(file).unwrap()
    };

    let response = orchestrator
        .handle(&chat_request("model-a"), &config)
        .await
        .expect("model-b should serve the request after model-a's empty response");

    assert_eq!(response.choices[0].message.text(), "hi");
    assert!(health.failure_score("model-a") > 0.0);
}

#[tokio::test]
async fn rate_limit_status_triggers_cooldown_and_hard_exclude() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let (orchestrator, health) = new_orchestrator();
    let config = {
        let mut file = ConfigFile::default();
        file.providers.upstream.base_url = server.uri();
        file.models.t1 = vec!["model-a".to_string()];
        ConfigSnapshot::new(file).unwrap()
    };

    let err = orchestrator
        .handle(&chat_request("model-a"), &config)
        .await
        .expect_err("single model returning 429 exhausts the request");

    match err {
        RouteError::Exhausted(e) => assert!(e.attempt_errors[0].contains("触发错误状态码: 429")),
        RouteError::Configuration(_) => panic!("expected exhaustion, not a configuration error"),
    }

    assert!(health.failure_score("model-a") >= 10.0);
    assert!(health.is_cooling_down("model-a"));
}

#[tokio::test]
async fn ttft_budget_exceeded_is_distinct_from_generation_timeout() {
    let server = MockServer::start().await;

    // Headers arrive well past the tier's TTFT budget.
    let full_chunk = sse_body(&[
        r#"{"model":"model-a","choices":[{"delta":{"content":"late"},"finish_reason":"stop"}]}"#,
    ]);
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(250))
                .set_body_raw(full_chunk, "text/event-stream"),
        )
        .mount(&server)
        .await;

    let mut file = ConfigFile::default();
    file.providers.upstream.base_url = server.uri();
    file.models.t1 = vec!["model-a".to_string()];
    file.timeouts.connect.insert("t1".to_string(), 50);
    file.timeouts.generation.insert("t1".to_string(), 5000);
    let config = ConfigSnapshot::new(file).unwrap();
    let (orchestrator, _health) = new_orchestrator();

    let err = orchestrator
        .handle(&chat_request("model-a"), &config)
        .await
        .expect_err("a 50ms TTFT budget against a 250ms-delayed response must time out");

    match err {
        RouteError::Exhausted(e) => {
            assert!(
                e.attempt_errors[0].contains("超首token限制时长"),
                "expected a TTFT timeout, got: {}",
                e.attempt_errors[0]
            );
        }
        RouteError::Configuration(_) => panic!("expected exhaustion, not a configuration error"),
    }
}

#[tokio::test]
async fn tier_with_no_configured_models_fails_without_calling_upstream() {
    let server = MockServer::start().await;
    // No mock registered: any call would be an unexpected request and panic
    // wiremock's strict-by-default request matching.

    let mut file = ConfigFile::default();
    file.providers.upstream.base_url = server.uri();
    file.models.t1 = vec![];
    let config = ConfigSnapshot::new(file).unwrap();
    let (orchestrator, _health) = new_orchestrator();

    let err = orchestrator
        .handle(&chat_request("model-a"), &config)
        .await
        .expect_err("an empty tier must fail immediately");

    match err {
        RouteError::Configuration(e) => assert_eq!(e.tier, TierId::T1),
        RouteError::Exhausted(_) => panic!("expected a configuration error, not exhaustion"),
    }
}
