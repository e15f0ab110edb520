//! Integration tests for dispatch over real HTTP.
//!
//! Verifies that:
//! - The outbound request carries the bearer credential and the inference body
//! - 503 "loading" backends are retried, then failed over
//! - 200 bodies carrying an `error` object are classified correctly
//! - Slow backends are abandoned at the attempt timeout
//! - Plain-text bodies are accepted as raw payloads
//!
//! Backends are `wiremock` servers; the engine talks to them through
//! `HttpTransport`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use genrelay::catalog::{
    BackendCatalog, BackendDescriptor, ExtractionKind, GenerationParameters, TemplateKind,
};
use genrelay::config::ApiKey;
use genrelay::dispatch::{
    BackendError, BackendRequest, DispatchEngine, DispatchError, FailureClass, HttpTransport,
    RecoverySettings, RetryPolicy, Transport,
};
use genrelay::normalize::{Extraction, ResponseNormalizer};
use genrelay::prompt::Language;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_timeout: Duration::from_millis(500),
        timeout_increment: Duration::from_millis(100),
        max_attempts_per_backend: 2,
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        failover_delay: Duration::from_millis(1),
        failure_threshold: 50,
    }
}

fn descriptor(id: &str) -> BackendDescriptor {
    BackendDescriptor::new(
        id,
        TemplateKind::QuestionAnswer,
        ExtractionKind::AnswerPrefix,
        GenerationParameters::new(64, 0.5, 0.9, true),
    )
}

fn engine_for(server: &MockServer, ids: &[&str]) -> DispatchEngine {
    let transport = HttpTransport::new(server.uri(), Duration::from_secs(2)).expect("client");
    DispatchEngine::new(
        BackendCatalog::new(ids.iter().map(|id| descriptor(id)).collect()),
        Arc::new(transport),
        ResponseNormalizer::default(),
        fast_policy(),
        RecoverySettings::default(),
        Some(ApiKey::from("hf_integration")),
    )
}

#[tokio::test]
async fn test_outbound_request_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/org/qa-large"))
        .and(header("authorization", "Bearer hf_integration"))
        .and(body_partial_json(json!({
            "inputs": "Answer the following question.\n\nQuestion: Why is the sky blue?\nAnswer:",
            "parameters": {
                "max_new_tokens": 64,
                "do_sample": true,
                "return_full_text": false
            },
            "options": { "wait_for_model": false, "use_cache": false }
        })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "generated_text": "Rayleigh scattering of sunlight." }])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, &["org/qa-large"]);
    let result = assert_ok!(engine.dispatch("Why is the sky blue?", Language::English).await);
    assert_eq!(
        result.output,
        Extraction::Text("Rayleigh scattering of sunlight.".to_string())
    );
    assert_eq!(result.backend_used.as_deref(), Some("org/qa-large"));
}

#[tokio::test]
async fn test_loading_backend_retried_then_failed_over() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/x"))
        .respond_with(
            ResponseTemplate::new(503)
                .set_body_json(json!({ "error": "Model x is currently loading", "estimated_time": 20.0 })),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/y"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{ "generated_text": "Answer: a useful reply" }])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = engine_for(&server, &["x", "y"]);
    let result = assert_ok!(engine.dispatch("question", Language::English).await);
    assert_eq!(result.backend_used.as_deref(), Some("y"));
    assert_eq!(result.output, Extraction::Text("a useful reply".to_string()));
    assert_eq!(result.failed_attempts.len(), 2);
    assert!(result
        .failed_attempts
        .iter()
        .all(|a| a.class == FailureClass::Busy));
    assert_eq!(engine.status().consecutive_failures, 0);
}

#[tokio::test]
async fn test_error_payload_on_200_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/loading"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "error": "Model is loading" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/models/broken"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "error": "Input validation error" })),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(server.uri(), Duration::from_secs(2)).expect("client");
    let key = ApiKey::from("hf_integration");
    let parameters = GenerationParameters::default();
    let request = |backend_id: &'static str| BackendRequest {
        backend_id,
        prompt: "hi",
        parameters: &parameters,
        timeout: Duration::from_secs(2),
        credential: &key,
    };

    let loading = assert_err!(transport.generate(request("loading")).await);
    assert!(matches!(loading, BackendError::Loading { .. }));

    let broken = assert_err!(transport.generate(request("broken")).await);
    assert!(matches!(broken, BackendError::Upstream { ref message, .. } if message == "Input validation error"));
}

#[tokio::test]
async fn test_plain_text_body_becomes_raw_payload() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/plain"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Answer: plain text works"))
        .mount(&server)
        .await;

    let engine = engine_for(&server, &["plain"]);
    let result = assert_ok!(engine.dispatch("q", Language::English).await);
    assert_eq!(result.output, Extraction::Text("plain text works".to_string()));
}

#[tokio::test]
async fn test_slow_backend_times_out_and_exhausts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/models/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "generated_text": "too late to matter" }]))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let engine = engine_for(&server, &["slow"]);
    let err = assert_err!(engine.dispatch("q", Language::English).await);
    match err {
        DispatchError::Exhausted {
            attempts,
            last_failure,
            ..
        } => {
            // Timeouts fail over immediately; no retry on the same backend
            assert_eq!(attempts.len(), 1);
            assert_eq!(last_failure, Some(FailureClass::Timeout));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(engine.status().consecutive_failures, 1);
}
