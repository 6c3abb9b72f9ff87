use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::chat::{
    session_title_from, ChatMessage, ChatSession, GenerationEvent, MessageStatus, Role,
    WireMessage, DEFAULT_SESSION_TITLE,
};
use crate::models::config::OllamaConfig;
use crate::models::ollama::OllamaModel;
use crate::services::chat_repository::ChatRepository;
use crate::services::job_manager::{ChatJobManager, JobState};
use crate::services::ollama_service::{ChatOptions, ChatProvider, GenerationStream};
use crate::services::thinking_segmenter::SegmentUpdate;

/// Notifications for whatever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    /// The assistant message was persisted with new content or status.
    MessageUpdated(ChatMessage),
    /// Full reasoning text so far. Never persisted.
    Thinking {
        session_id: String,
        message_id: String,
        content: String,
    },
    ThinkingCleared {
        session_id: String,
        message_id: String,
    },
    Error {
        session_id: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    AwaitingSession,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl SendPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SendPhase::Idle => "idle",
            SendPhase::AwaitingSession => "awaiting_session",
            SendPhase::Streaming => "streaming",
            SendPhase::Completed => "completed",
            SendPhase::Errored => "errored",
            SendPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SendPhase::Completed | SendPhase::Errored | SendPhase::Cancelled
        )
    }
}

/// How a send ended. `message` is the assistant message as last persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Completed { message: ChatMessage },
    Errored { message: ChatMessage, error: String },
    Cancelled { message: ChatMessage },
}

impl SendOutcome {
    pub fn message(&self) -> &ChatMessage {
        match self {
            SendOutcome::Completed { message }
            | SendOutcome::Errored { message, .. }
            | SendOutcome::Cancelled { message } => message,
        }
    }

    pub fn phase(&self) -> SendPhase {
        match self {
            SendOutcome::Completed { .. } => SendPhase::Completed,
            SendOutcome::Errored { .. } => SendPhase::Errored,
            SendOutcome::Cancelled { .. } => SendPhase::Cancelled,
        }
    }
}

/// A user turn to send. Without `session_id` a new session is created.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub session_id: Option<String>,
    pub content: String,
    pub model: Option<String>,
    pub images: Option<Vec<String>>,
    pub options: ChatOptions,
}

impl SendRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }
}

enum StreamEnd {
    Done,
    Exhausted,
    Cancelled,
}

/// Drives a user message through persistence, the model stream and the
/// thinking segmenter, one job per session.
#[derive(Clone)]
pub struct ChatOrchestrator {
    provider: Arc<dyn ChatProvider>,
    repository: Arc<dyn ChatRepository>,
    jobs: Arc<ChatJobManager>,
    updates: UnboundedSender<ChatUpdate>,
    default_model: Option<String>,
    context_window: usize,
}

impl ChatOrchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        repository: Arc<dyn ChatRepository>,
        config: &OllamaConfig,
    ) -> (Self, UnboundedReceiver<ChatUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        let orchestrator = Self {
            provider,
            repository,
            jobs: Arc::new(ChatJobManager::with_capacity(config.max_concurrent_chats)),
            updates,
            default_model: config
                .default_model
                .as_ref()
                .filter(|model| !model.trim().is_empty())
                .cloned(),
            context_window: config.context_window.max(1),
        };
        (orchestrator, receiver)
    }

    pub fn jobs(&self) -> &ChatJobManager {
        &self.jobs
    }

    pub fn repository(&self) -> &Arc<dyn ChatRepository> {
        &self.repository
    }

    pub async fn list_models(&self) -> AppResult<Vec<OllamaModel>> {
        self.provider.list_models().await
    }

    pub async fn create_session(&self, title: impl Into<String>) -> AppResult<ChatSession> {
        let title = title.into();
        let title = if title.trim().is_empty() {
            DEFAULT_SESSION_TITLE.to_string()
        } else {
            title
        };
        let session = ChatSession::new(title);
        self.repository.insert_session(&session).await?;
        info!(target: "app::chat", session_id = %session.id, "session created");
        Ok(session)
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> AppResult<ChatSession> {
        if title.trim().is_empty() {
            return Err(AppError::validation("session title must not be empty"));
        }
        let mut session = self
            .repository
            .get_session(session_id)
            .await?
            .ok_or_else(AppError::not_found)?;
        session.title = title.trim().to_string();
        session.last_modified = Utc::now().timestamp_millis();
        self.repository.update_session(&session).await?;
        Ok(session)
    }

    /// Cancel the session's generation, if any, and delete it with its messages.
    pub async fn delete_session(&self, session_id: &str) -> AppResult<()> {
        self.jobs.remove_job(session_id).await;
        self.repository.delete_session(session_id).await
    }

    pub async fn cancel_session(&self, session_id: &str) {
        self.jobs.remove_job(session_id).await;
    }

    pub async fn active_sessions(&self) -> HashSet<String> {
        self.jobs.active_session_ids().await
    }

    pub async fn shutdown(&self) {
        self.jobs.cancel_all().await;
    }

    /// Run [`send_message`](Self::send_message) on its own task.
    pub fn spawn_send(&self, request: SendRequest) -> JoinHandle<AppResult<SendOutcome>> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.send_message(request).await })
    }

    /// Send a user message and stream the assistant's answer into the session.
    ///
    /// Returns `Err` only when the send fails before streaming starts. Stream
    /// failures are recorded on the assistant message and reported as
    /// [`SendOutcome::Errored`].
    pub async fn send_message(&self, request: SendRequest) -> AppResult<SendOutcome> {
        let model = self.resolve_model(request.model.as_deref())?;
        let has_images = request
            .images
            .as_ref()
            .map(|images| !images.is_empty())
            .unwrap_or(false);
        if request.content.trim().is_empty() && !has_images {
            return Err(AppError::validation("message content must not be empty"));
        }

        let mut phase = SendPhase::Idle;
        self.advance(&mut phase, SendPhase::AwaitingSession, request.session_id.as_deref());

        let session = match self.prepare_session(&request).await {
            Ok(session) => session,
            Err(err) => {
                self.emit(ChatUpdate::Error {
                    session_id: request.session_id.clone(),
                    message: format!("Failed to send message: {err}"),
                });
                return Err(err);
            }
        };

        let mut user_message = ChatMessage::user(&session.id, request.content.clone());
        user_message.images = request.images.clone();
        if let Err(err) = self.repository.insert_message(&user_message).await {
            self.emit(ChatUpdate::Error {
                session_id: Some(session.id.clone()),
                message: format!("Failed to send message: {err}"),
            });
            return Err(err);
        }

        self.advance(&mut phase, SendPhase::Streaming, Some(&session.id));
        let job = self.jobs.add_job(&session.id).await;

        let placeholder = ChatMessage::assistant_placeholder(&session.id);
        if let Err(err) = self.repository.insert_message(&placeholder).await {
            if job.is_cancelled() {
                let outcome = self.cancelled(&job, placeholder);
                self.advance(&mut phase, outcome.phase(), Some(&session.id));
                return Ok(outcome);
            }
            self.jobs.complete_job(&session.id, job.job_id).await;
            self.emit(ChatUpdate::Error {
                session_id: Some(session.id.clone()),
                message: format!("Failed to send message: {err}"),
            });
            return Err(err);
        }
        self.emit(ChatUpdate::MessageUpdated(placeholder.clone()));

        let history = match self.history(&session.id, &placeholder.id).await {
            Ok(history) => history,
            Err(err) => return Ok(self.fail(&job, &placeholder, err).await),
        };

        debug!(
            target: "app::chat",
            session_id = %session.id,
            job_id = %job.job_id,
            model = %model,
            history_len = history.len(),
            "opening generation stream"
        );

        let stream = self
            .provider
            .chat(&model, history, request.options, job.cancel.clone());
        let outcome = self.drive(job, stream, placeholder).await;

        self.advance(&mut phase, outcome.phase(), Some(&session.id));
        Ok(outcome)
    }

    /// Re-send the user message that preceded a failed assistant message.
    ///
    /// The failed message is left as is; the retry produces a new exchange.
    pub async fn retry_message(
        &self,
        failed: &ChatMessage,
        model: Option<String>,
    ) -> AppResult<SendOutcome> {
        if failed.role != Role::Assistant || failed.status != MessageStatus::Error {
            return Err(AppError::validation(
                "only failed assistant messages can be retried",
            ));
        }

        let messages = self.repository.get_messages(&failed.session_id).await?;
        let position = messages
            .iter()
            .position(|message| message.id == failed.id)
            .ok_or_else(AppError::not_found)?;
        let prompt = messages[..position]
            .iter()
            .rev()
            .find(|message| message.is_user())
            .ok_or_else(|| AppError::validation("no user message precedes the failed reply"))?;

        info!(
            target: "app::chat",
            session_id = %failed.session_id,
            failed_message_id = %failed.id,
            "retrying failed message"
        );

        self.send_message(SendRequest {
            session_id: Some(failed.session_id.clone()),
            content: prompt.content.clone(),
            model,
            images: prompt.images.clone(),
            options: ChatOptions::default(),
        })
        .await
    }

    fn resolve_model(&self, requested: Option<&str>) -> AppResult<String> {
        requested
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| {
                AppError::validation("no model selected and no default model configured")
            })
    }

    async fn prepare_session(&self, request: &SendRequest) -> AppResult<ChatSession> {
        match request.session_id.as_deref() {
            Some(session_id) => {
                let mut session = self
                    .repository
                    .get_session(session_id)
                    .await?
                    .ok_or_else(AppError::not_found)?;
                if session.has_default_title() {
                    session.title = session_title_from(&request.content);
                    session.last_modified = Utc::now().timestamp_millis();
                    self.repository.update_session(&session).await?;
                }
                Ok(session)
            }
            None => {
                let session = ChatSession::titled_from(&request.content);
                self.repository.insert_session(&session).await?;
                info!(target: "app::chat", session_id = %session.id, "session created");
                Ok(session)
            }
        }
    }

    /// The most recent `context_window` messages worth sending to the model.
    ///
    /// Skips the placeholder, error replies and assistant messages that never
    /// received content.
    async fn history(&self, session_id: &str, placeholder_id: &str) -> AppResult<Vec<WireMessage>> {
        let messages = self.repository.get_messages(session_id).await?;
        let eligible: Vec<&ChatMessage> = messages
            .iter()
            .filter(|message| message.id != placeholder_id)
            .filter(|message| message.status != MessageStatus::Error)
            .filter(|message| message.is_user() || !message.content.is_empty())
            .collect();
        let skip = eligible.len().saturating_sub(self.context_window);
        Ok(eligible
            .into_iter()
            .skip(skip)
            .map(ChatMessage::to_wire)
            .collect())
    }

    async fn drive(
        &self,
        mut job: JobState,
        mut stream: GenerationStream,
        placeholder: ChatMessage,
    ) -> SendOutcome {
        let mut message = placeholder;

        let end = self.pump(&mut stream, &mut job, &mut message).await;
        // Closes the connection before any final persistence.
        drop(stream);

        match end {
            Ok(StreamEnd::Cancelled) => self.cancelled(&job, message),
            Ok(end) if job.is_cancelled() => {
                debug!(
                    target: "app::chat",
                    session_id = %job.session_id,
                    implicit = matches!(end, StreamEnd::Exhausted),
                    "stream finished after cancellation"
                );
                self.cancelled(&job, message)
            }
            Ok(end) => {
                if matches!(end, StreamEnd::Exhausted) {
                    debug!(
                        target: "app::chat",
                        session_id = %job.session_id,
                        "stream ended without done marker"
                    );
                }
                let finished = message.with_update(job.segmenter.answer(), MessageStatus::Sent);
                if let Err(err) = self.repository.update_message(&finished).await {
                    return self.fail(&job, &message, err).await;
                }
                if job.segmenter.is_thinking() {
                    self.emit(ChatUpdate::ThinkingCleared {
                        session_id: job.session_id.clone(),
                        message_id: finished.id.clone(),
                    });
                }
                self.emit(ChatUpdate::MessageUpdated(finished.clone()));
                self.jobs.complete_job(&job.session_id, job.job_id).await;
                info!(
                    target: "app::chat",
                    session_id = %job.session_id,
                    job_id = %job.job_id,
                    answer_len = finished.content.len(),
                    "generation completed"
                );
                SendOutcome::Completed { message: finished }
            }
            Err(err) if job.is_cancelled() => {
                debug!(
                    target: "app::chat",
                    session_id = %job.session_id,
                    error = %err,
                    "stream error after cancellation"
                );
                self.cancelled(&job, message)
            }
            Err(err) => self.fail(&job, &message, err).await,
        }
    }

    async fn pump(
        &self,
        stream: &mut GenerationStream,
        job: &mut JobState,
        message: &mut ChatMessage,
    ) -> AppResult<StreamEnd> {
        loop {
            let item = tokio::select! {
                biased;
                _ = job.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                item = stream.next() => item,
            };

            let event = match item {
                Some(item) => item?,
                None => return Ok(StreamEnd::Exhausted),
            };

            match event {
                GenerationEvent::Content { text } => {
                    self.jobs.touch(&job.session_id).await;
                    if text.is_empty() {
                        continue;
                    }
                    for update in job.segmenter.push(&text) {
                        if job.cancel.is_cancelled() {
                            return Ok(StreamEnd::Cancelled);
                        }
                        match update {
                            SegmentUpdate::Answer(answer) => {
                                *message = message.with_update(answer, MessageStatus::Sending);
                                self.repository.update_message(message).await?;
                                self.emit(ChatUpdate::MessageUpdated(message.clone()));
                            }
                            SegmentUpdate::Thinking(content) => self.emit(ChatUpdate::Thinking {
                                session_id: job.session_id.clone(),
                                message_id: message.id.clone(),
                                content,
                            }),
                            SegmentUpdate::ThinkingCleared => {
                                self.emit(ChatUpdate::ThinkingCleared {
                                    session_id: job.session_id.clone(),
                                    message_id: message.id.clone(),
                                })
                            }
                        }
                    }
                }
                GenerationEvent::ToolCalls { calls } => {
                    self.jobs.touch(&job.session_id).await;
                    if job.cancel.is_cancelled() {
                        return Ok(StreamEnd::Cancelled);
                    }
                    debug!(
                        target: "app::chat",
                        session_id = %job.session_id,
                        count = calls.len(),
                        "tool calls received"
                    );
                    message.tool_calls.get_or_insert_with(Vec::new).extend(calls);
                    self.repository.update_message(message).await?;
                    self.emit(ChatUpdate::MessageUpdated(message.clone()));
                }
                GenerationEvent::Done { metrics } => {
                    debug!(
                        target: "app::chat",
                        session_id = %job.session_id,
                        done_reason = ?metrics.done_reason,
                        eval_count = ?metrics.eval_count,
                        total_duration = ?metrics.total_duration,
                        "generation done"
                    );
                    return Ok(StreamEnd::Done);
                }
                GenerationEvent::DecodeError { raw_line, cause } => {
                    warn!(
                        target: "app::chat",
                        session_id = %job.session_id,
                        line_len = raw_line.len(),
                        cause = %cause,
                        "skipping undecodable stream line"
                    );
                }
            }
        }
    }

    fn cancelled(&self, job: &JobState, message: ChatMessage) -> SendOutcome {
        info!(
            target: "app::chat",
            session_id = %job.session_id,
            job_id = %job.job_id,
            "generation cancelled"
        );
        if job.segmenter.is_thinking() {
            self.emit(ChatUpdate::ThinkingCleared {
                session_id: job.session_id.clone(),
                message_id: message.id.clone(),
            });
        }
        SendOutcome::Cancelled { message }
    }

    async fn fail(&self, job: &JobState, message: &ChatMessage, err: AppError) -> SendOutcome {
        // A cancelled job no longer owns the message.
        if job.is_cancelled() {
            return self.cancelled(job, message.clone());
        }
        let description = err.to_string();
        let failed = message.with_update(format!("Error: {description}"), MessageStatus::Error);

        if let Err(persist_err) = self.repository.update_message(&failed).await {
            warn!(
                target: "app::chat",
                session_id = %job.session_id,
                error = %persist_err,
                "failed to persist error state"
            );
        }
        self.jobs.complete_job(&job.session_id, job.job_id).await;

        warn!(
            target: "app::chat",
            session_id = %job.session_id,
            job_id = %job.job_id,
            error = %description,
            "generation failed"
        );

        self.emit(ChatUpdate::MessageUpdated(failed.clone()));
        self.emit(ChatUpdate::Error {
            session_id: Some(job.session_id.clone()),
            message: description.clone(),
        });

        SendOutcome::Errored {
            message: failed,
            error: description,
        }
    }

    fn advance(&self, phase: &mut SendPhase, next: SendPhase, session_id: Option<&str>) {
        debug!(
            target: "app::chat",
            session_id = session_id.unwrap_or("-"),
            from = phase.as_str(),
            to = next.as_str(),
            terminal = next.is_terminal(),
            "send phase"
        );
        *phase = next;
    }

    fn emit(&self, update: ChatUpdate) {
        // Nobody listening is fine.
        let _ = self.updates.send(update);
    }
}
