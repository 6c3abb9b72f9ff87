use std::sync::Arc;

use httpmock::prelude::*;
use ollama_chat_lib::error::{AppError, ChatErrorCode};
use ollama_chat_lib::models::chat::MessageStatus;
use ollama_chat_lib::models::config::OllamaConfig;
use ollama_chat_lib::services::chat_orchestrator::{
    ChatOrchestrator, ChatUpdate, SendOutcome, SendRequest,
};
use ollama_chat_lib::services::chat_repository::InMemoryChatRepository;
use ollama_chat_lib::services::ollama_service::OllamaService;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;

fn orchestrator(config: OllamaConfig) -> (ChatOrchestrator, UnboundedReceiver<ChatUpdate>) {
    let service = OllamaService::new(config.clone()).expect("service");
    ChatOrchestrator::new(
        Arc::new(service),
        Arc::new(InMemoryChatRepository::new()),
        &config,
    )
}

fn expect_errored(outcome: SendOutcome) -> (String, String) {
    match outcome {
        SendOutcome::Errored { message, error } => {
            assert_eq!(message.status, MessageStatus::Error);
            (message.content, error)
        }
        other => panic!("expected failure, got {:?}", other.phase()),
    }
}

#[tokio::test]
async fn refused_connection_marks_message_failed_after_retries() {
    let (chat, mut updates) = orchestrator(OllamaConfig {
        base_url: Some("http://127.0.0.1:1".to_string()),
        max_retries: 2,
        retry_base_delay_ms: 1,
        ..OllamaConfig::default()
    });

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");
    let session_id = outcome.message().session_id.clone();
    let (content, error) = expect_errored(outcome);

    assert!(content.starts_with("Error: failed to connect to Ollama"));
    assert_eq!(content, format!("Error: {error}"));
    assert!(!chat.active_sessions().await.contains(&session_id));

    let mut saw_error = false;
    while let Ok(update) = updates.try_recv() {
        if let ChatUpdate::Error { session_id: Some(id), .. } = update {
            saw_error = id == session_id;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn unknown_model_surfaces_server_message() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(404)
                .json_body(json!({ "error": "model 'ghost' not found, try pulling it first" }));
        })
        .await;
    let (chat, _updates) = orchestrator(OllamaConfig {
        base_url: Some(server.base_url()),
        retry_base_delay_ms: 1,
        ..OllamaConfig::default()
    });

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("ghost"))
        .await
        .expect("send");
    let (content, _) = expect_errored(outcome);

    assert_eq!(mock.hits_async().await, 1);
    assert!(content.contains("status 404"));
    assert!(content.contains("try pulling it first"));
}

#[tokio::test]
async fn oversized_response_is_rejected() {
    let server = MockServer::start_async().await;
    let runaway = format!(
        "{{\"model\":\"m1\",\"message\":{{\"role\":\"assistant\",\"content\":\"{}\n",
        "x".repeat(512)
    );
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(runaway);
        })
        .await;
    let (chat, _updates) = orchestrator(OllamaConfig {
        base_url: Some(server.base_url()),
        max_content_length: 128,
        ..OllamaConfig::default()
    });

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");
    let (content, _) = expect_errored(outcome);

    assert!(content.starts_with("Error: content exceeds limit"));
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let server = MockServer::start_async().await;
    let body = format!(
        "this is not json\n{}\n",
        json!({ "model": "m1", "message": { "role": "assistant", "content": "ok" }, "done": true })
    );
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(body);
        })
        .await;
    let (chat, _updates) = orchestrator(OllamaConfig {
        base_url: Some(server.base_url()),
        ..OllamaConfig::default()
    });

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");

    assert!(matches!(outcome, SendOutcome::Completed { .. }));
    assert_eq!(outcome.message().content, "ok");
}

#[tokio::test]
async fn sending_without_any_model_is_a_validation_error() {
    let (chat, mut updates) = orchestrator(OllamaConfig::default());

    let err = chat
        .send_message(SendRequest::new("Hello"))
        .await
        .expect_err("no model");

    assert!(matches!(err, AppError::Validation { .. }));
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let (chat, mut updates) = orchestrator(OllamaConfig {
        default_model: Some("m1".to_string()),
        ..OllamaConfig::default()
    });

    let err = chat
        .send_message(SendRequest::new("Hello").in_session("missing"))
        .await
        .expect_err("missing session");

    assert!(matches!(err, AppError::NotFound));
    assert!(matches!(
        updates.try_recv(),
        Ok(ChatUpdate::Error { session_id: Some(_), .. })
    ));
}

#[test]
fn invalid_yaml_config_is_rejected() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("ollama.yaml");
    std::fs::write(&path, "contextWindow: 0\n").expect("write config");

    let err = OllamaConfig::from_yaml_file(&path).expect_err("zero window");
    assert!(matches!(err, AppError::Config(_)));

    std::fs::write(&path, "port: [not, a, number]\n").expect("write config");
    assert!(OllamaConfig::from_yaml_file(&path).is_err());
}

#[test]
fn chat_error_codes_have_stable_names() {
    assert_eq!(ChatErrorCode::ConnectionError.as_str(), "CONNECTION_ERROR");
    assert_eq!(ChatErrorCode::ContentTooLargeError.as_str(), "CONTENT_TOO_LARGE");
}
