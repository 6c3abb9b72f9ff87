use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use ollama_chat_lib::models::chat::MessageStatus;
use ollama_chat_lib::services::chat_orchestrator::{
    ChatOrchestrator, ChatUpdate, SendOutcome, SendRequest,
};
use ollama_chat_lib::services::chat_repository::InMemoryChatRepository;
use ollama_chat_lib::services::ollama_service::OllamaService;
use ollama_chat_lib::utils::logger::init_logging;
use ollama_chat_lib::{AppError, OllamaConfig};

#[tokio::main]
async fn main() {
    if let Err(error) = try_run().await {
        eprintln!("ollama-chat failed: {error}");
        std::process::exit(1);
    }
}

async fn try_run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => OllamaConfig::from_yaml_file(path)?,
        None => {
            let config = OllamaConfig::from_env();
            config.validate()?;
            config
        }
    };

    let log_dir = std::env::var("OLLAMA_CHAT_LOG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("ollama-chat"));
    init_logging(&log_dir)?;

    let service = OllamaService::new(config.clone())?;
    let status = service.status().await;
    info!(
        target: "app::chat",
        reachable = status.reachable,
        models = ?status.model_count,
        "server status"
    );

    let model = match config.default_model.clone() {
        Some(model) => model,
        None => service
            .fetch_models()
            .await?
            .first()
            .map(|model| model.id().to_string())
            .ok_or_else(|| {
                AppError::validation("no models installed and OLLAMA_CHAT_MODEL unset")
            })?,
    };

    let (orchestrator, mut updates) = ChatOrchestrator::new(
        Arc::new(service),
        Arc::new(InMemoryChatRepository::new()),
        &config,
    );

    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        let mut stdout = std::io::stdout();
        while let Some(update) = updates.recv().await {
            match update {
                ChatUpdate::MessageUpdated(message) => {
                    if message.status == MessageStatus::Error || message.content.len() < printed {
                        printed = 0;
                        continue;
                    }
                    if let Some(tail) = message.content.get(printed..) {
                        let _ = write!(stdout, "{tail}");
                        let _ = stdout.flush();
                    }
                    printed = message.content.len();
                }
                ChatUpdate::Thinking { content, .. } => {
                    eprint!("\r[thinking {} chars]", content.chars().count());
                }
                ChatUpdate::ThinkingCleared { .. } => eprintln!(),
                ChatUpdate::Error { message, .. } => eprintln!("\nerror: {message}"),
            }
        }
    });

    let mut session_id: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut request = SendRequest::new(line).with_model(model.clone());
        if let Some(id) = &session_id {
            request = request.in_session(id.clone());
        }
        match orchestrator.send_message(request).await {
            Ok(outcome) => {
                session_id = Some(outcome.message().session_id.clone());
                if let SendOutcome::Errored { error, .. } = &outcome {
                    error!(target: "app::chat", error = %error, "generation failed");
                }
                println!();
            }
            Err(err) => eprintln!("could not send: {err}"),
        }
    }

    orchestrator.shutdown().await;
    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}
