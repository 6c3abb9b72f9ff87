use std::time::Duration as StdDuration;

use futures::StreamExt;
use httpmock::prelude::*;
use ollama_chat_lib::error::{AppResult, ChatErrorCode};
use ollama_chat_lib::models::chat::{GenerateRequest, GenerationEvent, Role, WireMessage};
use ollama_chat_lib::models::config::OllamaConfig;
use ollama_chat_lib::services::ollama_service::testing::map_http_error;
use ollama_chat_lib::services::ollama_service::{ChatOptions, GenerationStream, OllamaService};
use reqwest::StatusCode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn config_for(server: &MockServer) -> OllamaConfig {
    OllamaConfig {
        base_url: Some(server.base_url()),
        retry_base_delay_ms: 1,
        max_retries: 2,
        ..OllamaConfig::default()
    }
}

fn ndjson(lines: &[serde_json::Value]) -> String {
    lines
        .iter()
        .map(|line| format!("{line}\n"))
        .collect::<String>()
}

fn chat_chunk(content: &str, done: bool) -> serde_json::Value {
    json!({
        "model": "m1",
        "created_at": "2024-01-01T00:00:00Z",
        "message": { "role": "assistant", "content": content },
        "done": done,
    })
}

async fn collect(stream: GenerationStream) -> Vec<AppResult<GenerationEvent>> {
    tokio::time::timeout(StdDuration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream finishes")
}

fn user(content: &str) -> Vec<WireMessage> {
    vec![WireMessage::new(Role::User, content)]
}

#[test]
fn http_statuses_map_to_response_errors() {
    let (error, retryable) = map_http_error(StatusCode::TOO_MANY_REQUESTS, "");
    assert!(retryable);
    assert_eq!(error.chat_code(), Some(ChatErrorCode::ResponseError));
    assert_eq!(error.chat_correlation_id(), Some("test-correlation-id"));
    assert_eq!(error.to_string(), "Ollama server is busy (status 429)");

    let (error, retryable) = map_http_error(StatusCode::SERVICE_UNAVAILABLE, "");
    assert!(retryable);
    assert_eq!(error.to_string(), "Ollama server error (status 503)");

    let (error, retryable) = map_http_error(
        StatusCode::NOT_FOUND,
        r#"{"error":"model 'ghost' not found"}"#,
    );
    assert!(!retryable);
    assert_eq!(
        error.to_string(),
        "model or endpoint not found (status 404): model 'ghost' not found"
    );
    let details = error.chat_details().expect("details");
    assert_eq!(details["status"], 404);
    assert_eq!(details["serverMessage"], "model 'ghost' not found");

    let (error, retryable) = map_http_error(StatusCode::BAD_REQUEST, "not json");
    assert!(!retryable);
    assert_eq!(error.to_string(), "invalid request (status 400)");

    let (error, retryable) = map_http_error(StatusCode::IM_A_TEAPOT, "");
    assert!(!retryable);
    assert_eq!(error.to_string(), "unexpected response status 418");
}

#[tokio::test]
async fn lists_installed_models() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "models": [
                        {
                            "name": "llama3:latest",
                            "model": "llama3:latest",
                            "modified_at": "2024-05-01T10:00:00Z",
                            "size": 4661224676u64,
                            "digest": "365c0bd3c000",
                            "details": { "family": "llama", "parameter_size": "8B" }
                        },
                        { "name": "qwen3:4b" }
                    ]
                }));
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let models = service.fetch_models().await.expect("models");

    assert_eq!(models.len(), 2);
    assert_eq!(models[0].id(), "llama3:latest");
    assert_eq!(models[1].id(), "qwen3:4b");

    let status = service.status().await;
    assert!(status.reachable);
    assert_eq!(status.model_count, 2);
}

#[tokio::test]
async fn streams_chat_chunks_until_done() {
    let server = MockServer::start_async().await;
    let body = ndjson(&[
        chat_chunk("Hel", false),
        chat_chunk("lo", false),
        json!({
            "model": "m1",
            "message": { "role": "assistant", "content": "" },
            "done": true,
            "done_reason": "stop",
            "eval_count": 2
        }),
    ]);
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body_partial(r#"{"model":"m1","stream":true}"#);
            then.status(200)
                .header("content-type", "application/x-ndjson")
                .body(body);
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let events = collect(service.chat_stream(
        "m1",
        user("Hello"),
        ChatOptions::default(),
        CancellationToken::new(),
    ))
    .await;

    mock.assert_async().await;
    let texts: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            Ok(GenerationEvent::Content { text }) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["Hel", "lo", ""]);
    match events.last() {
        Some(Ok(GenerationEvent::Done { metrics })) => {
            assert_eq!(metrics.done_reason.as_deref(), Some("stop"));
            assert_eq!(metrics.eval_count, Some(2));
        }
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test]
async fn streams_generate_responses() {
    let server = MockServer::start_async().await;
    let body = ndjson(&[
        json!({ "model": "m1", "response": "4", "done": false }),
        json!({ "model": "m1", "response": "", "done": true }),
    ]);
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/generate")
                .json_body_partial(r#"{"prompt":"2+2?","stream":true}"#);
            then.status(200).body(body);
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let events = collect(service.generate(
        GenerateRequest::new("m1", "2+2?"),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], Ok(GenerationEvent::Content { text }) if text == "4"));
    assert!(matches!(events[2], Ok(GenerationEvent::Done { .. })));
}

#[tokio::test]
async fn missing_model_is_not_retried() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(404)
                .json_body(json!({ "error": "model 'ghost' not found" }));
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let events = collect(service.chat_stream(
        "ghost",
        user("Hello"),
        ChatOptions::default(),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(events.len(), 1);
    let error = events[0].as_ref().expect_err("error event");
    assert_eq!(error.chat_code(), Some(ChatErrorCode::ResponseError));
    assert!(error.to_string().contains("not found"));
}

#[tokio::test]
async fn server_errors_are_retried_before_surfacing() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(503);
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let events = collect(service.chat_stream(
        "m1",
        user("Hello"),
        ChatOptions::default(),
        CancellationToken::new(),
    ))
    .await;

    assert_eq!(mock.hits_async().await, 3);
    let error = events[0].as_ref().expect_err("error event");
    assert_eq!(error.to_string(), "Ollama server error (status 503)");
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200)
                .delay(StdDuration::from_secs(3))
                .body(ndjson(&[chat_chunk("late", true)]));
        })
        .await;

    let config = OllamaConfig {
        request_timeout_ms: 200,
        max_retries: 0,
        ..config_for(&server)
    };
    let service = OllamaService::new(config).expect("service");
    let events = collect(service.chat_stream(
        "m1",
        user("Hello"),
        ChatOptions::default(),
        CancellationToken::new(),
    ))
    .await;

    let error = events[0].as_ref().expect_err("timeout");
    assert_eq!(error.chat_code(), Some(ChatErrorCode::TimeoutError));
}

#[tokio::test]
async fn cancelling_ends_the_stream_without_error() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200)
                .delay(StdDuration::from_secs(10))
                .body(ndjson(&[chat_chunk("never", true)]));
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let cancel = CancellationToken::new();
    let stream = service.chat_stream("m1", user("Hello"), ChatOptions::default(), cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        canceller.cancel();
    });

    let events = collect(stream).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn embeds_inputs() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/embed")
                .json_body_partial(r#"{"model":"embedder","input":"hello"}"#);
            then.status(200)
                .json_body(json!({ "embeddings": [[0.1, 0.2, 0.3]], "prompt_eval_count": 1 }));
        })
        .await;

    let service = OllamaService::new(config_for(&server)).expect("service");
    let response = service
        .embed("embedder", &["hello".to_string()], None)
        .await
        .expect("embedding");

    assert_eq!(response.embeddings.len(), 1);
    assert_eq!(response.embeddings[0].len(), 3);
    assert!(service.embed("embedder", &[], None).await.is_err());
}

#[tokio::test]
async fn unreachable_server_is_reported_not_raised() {
    let config = OllamaConfig {
        base_url: Some("http://127.0.0.1:1".to_string()),
        max_retries: 0,
        connect_timeout_ms: 500,
        ..OllamaConfig::default()
    };
    let service = OllamaService::new(config).expect("service");

    let status = service.status().await;

    assert!(!status.reachable);
    assert_eq!(status.model_count, 0);
    assert!(status.message.is_some());
}
