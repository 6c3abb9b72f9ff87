use std::sync::Arc;
use std::time::Duration as StdDuration;

use httpmock::prelude::*;
use ollama_chat_lib::models::chat::{MessageStatus, Role};
use ollama_chat_lib::models::config::OllamaConfig;
use ollama_chat_lib::services::chat_orchestrator::{
    ChatOrchestrator, ChatUpdate, SendOutcome, SendPhase, SendRequest,
};
use ollama_chat_lib::services::chat_repository::InMemoryChatRepository;
use ollama_chat_lib::services::ollama_service::OllamaService;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;

fn ndjson(chunks: &[(&str, bool)]) -> String {
    chunks
        .iter()
        .map(|(content, done)| {
            format!(
                "{}\n",
                json!({
                    "model": "m1",
                    "created_at": "2024-01-01T00:00:00Z",
                    "message": { "role": "assistant", "content": content },
                    "done": done,
                })
            )
        })
        .collect()
}

fn config_for(server: &MockServer) -> OllamaConfig {
    OllamaConfig {
        base_url: Some(server.base_url()),
        retry_base_delay_ms: 1,
        max_retries: 0,
        ..OllamaConfig::default()
    }
}

fn orchestrator(config: OllamaConfig) -> (ChatOrchestrator, UnboundedReceiver<ChatUpdate>) {
    let service = OllamaService::new(config.clone()).expect("service");
    ChatOrchestrator::new(
        Arc::new(service),
        Arc::new(InMemoryChatRepository::new()),
        &config,
    )
}

fn drain(updates: &mut UnboundedReceiver<ChatUpdate>) -> Vec<ChatUpdate> {
    let mut collected = Vec::new();
    while let Ok(update) = updates.try_recv() {
        collected.push(update);
    }
    collected
}

#[tokio::test]
async fn hello_is_answered_and_persisted() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200)
                .header("content-type", "application/x-ndjson")
                .body(ndjson(&[("Hi", false), (" there", false), ("", true)]));
        })
        .await;
    let (chat, mut updates) = orchestrator(config_for(&server));

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");

    let SendOutcome::Completed { message } = outcome else {
        panic!("expected completion");
    };
    assert_eq!(message.content, "Hi there");
    assert_eq!(message.status, MessageStatus::Sent);

    let stored = chat
        .repository()
        .get_messages(&message.session_id)
        .await
        .expect("messages");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].content, "Hello");
    assert_eq!(stored[0].status, MessageStatus::Sent);
    assert_eq!(stored[1], message);

    let session = chat
        .repository()
        .get_session(&message.session_id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(session.title, "Hello");
    assert!(chat.active_sessions().await.is_empty());

    let partials: Vec<String> = drain(&mut updates)
        .into_iter()
        .filter_map(|update| match update {
            ChatUpdate::MessageUpdated(m) => Some(m.content),
            _ => None,
        })
        .collect();
    assert_eq!(partials, vec!["", "Hi", "Hi there", "Hi there"]);
}

#[tokio::test]
async fn follow_up_carries_previous_exchange() {
    let server = MockServer::start_async().await;
    let first = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body_partial(r#"{"model":"m1"}"#);
            then.status(200).body(ndjson(&[("Hi there", true)]));
        })
        .await;
    let (chat, _updates) = orchestrator(OllamaConfig {
        default_model: Some("m1".to_string()),
        ..config_for(&server)
    });

    let outcome = chat
        .send_message(SendRequest::new("Hello"))
        .await
        .expect("first send");
    let session_id = outcome.message().session_id.clone();
    first.delete_async().await;

    let follow_up = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains(r#""content":"Hi there""#)
                .body_contains(r#""content":"And you?""#);
            then.status(200).body(ndjson(&[("Fine", true)]));
        })
        .await;

    let outcome = chat
        .send_message(SendRequest::new("And you?").in_session(&session_id))
        .await
        .expect("second send");

    follow_up.assert_async().await;
    assert_eq!(outcome.message().content, "Fine");
    assert_eq!(
        chat.repository()
            .get_messages(&session_id)
            .await
            .expect("messages")
            .len(),
        4
    );
}

#[tokio::test]
async fn thinking_is_streamed_separately_from_the_answer() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(ndjson(&[
                ("<think>plan", false),
                (" more</think>", false),
                ("Answer", false),
                ("", true),
            ]));
        })
        .await;
    let (chat, mut updates) = orchestrator(config_for(&server));

    let outcome = chat
        .send_message(SendRequest::new("Think first").with_model("m1"))
        .await
        .expect("send");

    assert_eq!(outcome.phase(), SendPhase::Completed);
    assert_eq!(outcome.message().content, "Answer");

    let updates = drain(&mut updates);
    let thinking: Vec<&str> = updates
        .iter()
        .filter_map(|update| match update {
            ChatUpdate::Thinking { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(thinking, vec!["plan", "plan more"]);
    assert_eq!(
        updates
            .iter()
            .filter(|update| matches!(update, ChatUpdate::ThinkingCleared { .. }))
            .count(),
        1
    );
    assert!(updates.iter().all(|update| match update {
        ChatUpdate::MessageUpdated(message) => !message.content.contains("plan"),
        _ => true,
    }));
}

#[tokio::test]
async fn stream_without_done_completes_implicitly() {
    let server = MockServer::start_async().await;
    let _mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(ndjson(&[("partial ", false), ("answer", false)]));
        })
        .await;
    let (chat, _updates) = orchestrator(config_for(&server));

    let outcome = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");

    assert_eq!(outcome.phase(), SendPhase::Completed);
    assert_eq!(outcome.message().content, "partial answer");
    assert_eq!(outcome.message().status, MessageStatus::Sent);
}

#[tokio::test]
async fn new_session_evicts_the_least_recent_generation() {
    let server = MockServer::start_async().await;
    let _slow = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body_partial(r#"{"model":"slow"}"#);
            then.status(200)
                .delay(StdDuration::from_secs(10))
                .body(ndjson(&[("too late", true)]));
        })
        .await;
    let _fast = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body_partial(r#"{"model":"fast"}"#);
            then.status(200).body(ndjson(&[("quick", true)]));
        })
        .await;
    let (chat, _updates) = orchestrator(OllamaConfig {
        max_concurrent_chats: 1,
        ..config_for(&server)
    });

    let slow_session = chat.create_session("Slow").await.expect("session");
    let slow = chat.spawn_send(
        SendRequest::new("take your time")
            .in_session(&slow_session.id)
            .with_model("slow"),
    );
    while !chat.active_sessions().await.contains(&slow_session.id) {
        tokio::task::yield_now().await;
    }

    let fast = chat
        .send_message(SendRequest::new("be quick").with_model("fast"))
        .await
        .expect("fast send");
    assert_eq!(fast.message().content, "quick");

    let evicted = tokio::time::timeout(StdDuration::from_secs(5), slow)
        .await
        .expect("evicted send finishes promptly")
        .expect("join")
        .expect("send");
    let SendOutcome::Cancelled { message } = evicted else {
        panic!("expected cancellation");
    };
    assert_eq!(message.status, MessageStatus::Sending);

    let stored = chat
        .repository()
        .get_messages(&slow_session.id)
        .await
        .expect("messages");
    let assistant = stored
        .iter()
        .find(|m| m.role == Role::Assistant)
        .expect("placeholder");
    assert_eq!(assistant.status, MessageStatus::Sending);
    assert!(assistant.content.is_empty());
}

#[tokio::test]
async fn failed_reply_can_be_retried() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(500).json_body(json!({ "error": "out of memory" }));
        })
        .await;
    let (chat, _updates) = orchestrator(config_for(&server));

    let failed = chat
        .send_message(SendRequest::new("Hello").with_model("m1"))
        .await
        .expect("send");
    let SendOutcome::Errored { message: failed, .. } = failed else {
        panic!("expected failure");
    };
    assert!(failed
        .content
        .starts_with("Error: Ollama server error (status 500)"));
    failing.delete_async().await;

    let _healthy = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains(r#""content":"Hello""#);
            then.status(200).body(ndjson(&[("Recovered", true)]));
        })
        .await;

    let retried = chat
        .retry_message(&failed, Some("m1".to_string()))
        .await
        .expect("retry");
    assert_eq!(retried.phase(), SendPhase::Completed);
    assert_eq!(retried.message().content, "Recovered");

    let stored = chat
        .repository()
        .get_messages(&failed.session_id)
        .await
        .expect("messages");
    assert_eq!(stored.len(), 4);
    let original = stored.iter().find(|m| m.id == failed.id).expect("failed reply");
    assert_eq!(original.status, MessageStatus::Error);
}
