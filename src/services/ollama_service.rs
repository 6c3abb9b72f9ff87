use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::Utc;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::sleep;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, ChatErrorCode};
use crate::models::chat::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, GenerateRequest,
    GenerateResponse, GenerationEvent, WireMessage,
};
use crate::models::config::OllamaConfig;
use crate::models::ollama::{ModelList, OllamaModel, ServerStatus};
use crate::services::stream_decoder::{buffered_lines, decode_lines, LineSplitter, StreamResponse};
use crate::utils::redact::redacted_payload_string;

const CHAT_PATH: &str = "/api/chat";
const GENERATE_PATH: &str = "/api/generate";
const TAGS_PATH: &str = "/api/tags";
const EMBED_PATH: &str = "/api/embed";

/// Optional request fields for a chat generation.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub options: Option<HashMap<String, JsonValue>>,
    pub format: Option<JsonValue>,
    pub keep_alive: Option<String>,
}

/// Events of one generation, fed by a background reader task.
///
/// The stream ends after `Done`, after a single `Err`, when the server closes
/// the body, or when the generation is cancelled. Dropping it stops the reader.
pub struct GenerationStream {
    receiver: UnboundedReceiver<AppResult<GenerationEvent>>,
    _reader_guard: DropGuard,
}

impl GenerationStream {
    /// Stream fed by `sender`; dropping the stream cancels `reader_cancel`.
    pub fn channel(
        reader_cancel: CancellationToken,
    ) -> (UnboundedSender<AppResult<GenerationEvent>>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                receiver,
                _reader_guard: reader_cancel.drop_guard(),
            },
        )
    }
}

impl Stream for GenerationStream {
    type Item = AppResult<GenerationEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

/// Model server operations the chat orchestrator depends on.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    fn chat(
        &self,
        model: &str,
        messages: Vec<WireMessage>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> GenerationStream;

    async fn list_models(&self) -> AppResult<Vec<OllamaModel>>;
}

#[derive(Clone)]
pub struct OllamaService {
    client: reqwest::Client,
    config: Arc<OllamaConfig>,
}

impl OllamaService {
    pub fn new(config: OllamaConfig) -> AppResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Some(std::time::Duration::from_secs(90)))
            .build()
            .map_err(|err| AppError::other(format!("failed to build HTTP client: {err}")))?;

        info!(
            target: "app::chat::ollama",
            base_url = %config.base_url(),
            max_retries = config.max_retries,
            "Ollama client ready"
        );

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Stream a chat completion from `/api/chat`.
    pub fn chat_stream(
        &self,
        model: &str,
        messages: Vec<WireMessage>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> GenerationStream {
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            stream: true,
            format: options.format,
            options: options.options,
            keep_alive: options.keep_alive.or_else(|| self.config.keep_alive.clone()),
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => return Self::failed_stream(err.into()),
        };
        self.spawn_stream::<ChatResponse>(CHAT_PATH, body, cancel)
    }

    /// Stream a raw completion from `/api/generate`.
    pub fn generate(&self, mut request: GenerateRequest, cancel: CancellationToken) -> GenerationStream {
        request.stream = true;
        if request.keep_alive.is_none() {
            request.keep_alive = self.config.keep_alive.clone();
        }
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => return Self::failed_stream(err.into()),
        };
        self.spawn_stream::<GenerateResponse>(GENERATE_PATH, body, cancel)
    }

    pub async fn fetch_models(&self) -> AppResult<Vec<OllamaModel>> {
        let correlation_id = Uuid::new_v4().to_string();
        let url = self.config.endpoint(TAGS_PATH);
        let response = self
            .send_with_retry("listModels", &correlation_id, || self.client.get(&url))
            .await?;

        let list: ModelList = response.json().await.map_err(|err| {
            AppError::chat_with_details(
                ChatErrorCode::ResponseError,
                format!("failed to parse model list: {err}"),
                Some(correlation_id.as_str()),
                None,
            )
        })?;

        debug!(
            target: "app::chat::ollama",
            correlation_id = %correlation_id,
            count = list.models.len(),
            "listed models"
        );
        Ok(list.models)
    }

    pub async fn embed(
        &self,
        model: &str,
        inputs: &[String],
        options: Option<HashMap<String, JsonValue>>,
    ) -> AppResult<EmbeddingResponse> {
        if inputs.is_empty() {
            return Err(AppError::validation("embedding input must not be empty"));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let url = self.config.endpoint(EMBED_PATH);
        let input = match inputs {
            [single] => json!(single),
            many => json!(many),
        };
        let request = EmbeddingRequest {
            model: model.to_string(),
            input,
            options,
            keep_alive: self.config.keep_alive.clone(),
        };

        let response = self
            .send_with_retry("embed", &correlation_id, || self.client.post(&url).json(&request))
            .await?;

        response.json().await.map_err(|err| {
            AppError::chat_with_details(
                ChatErrorCode::ResponseError,
                format!("failed to parse embedding response: {err}"),
                Some(correlation_id.as_str()),
                None,
            )
        })
    }

    /// Probe the server by listing its models. Never fails; unreachable servers
    /// are reported in the returned status.
    pub async fn status(&self) -> ServerStatus {
        let start = Instant::now();
        let base_url = self.config.base_url();
        let last_checked_at = Utc::now().to_rfc3339();

        match self.fetch_models().await {
            Ok(models) => ServerStatus {
                reachable: true,
                base_url,
                last_checked_at,
                latency_ms: Some(start.elapsed().as_millis()),
                model_count: models.len(),
                message: None,
            },
            Err(error) => {
                warn!(target: "app::chat::ollama", error = %error, "Ollama status probe failed");
                ServerStatus {
                    reachable: false,
                    base_url,
                    last_checked_at,
                    latency_ms: None,
                    model_count: 0,
                    message: Some(error.to_string()),
                }
            }
        }
    }

    fn failed_stream(error: AppError) -> GenerationStream {
        let (sender, stream) = GenerationStream::channel(CancellationToken::new());
        let _ = sender.send(Err(error));
        stream
    }

    fn spawn_stream<T>(&self, path: &str, body: JsonValue, cancel: CancellationToken) -> GenerationStream
    where
        T: StreamResponse + Send + 'static,
    {
        let reader_cancel = cancel.child_token();
        let (sender, stream) = GenerationStream::channel(reader_cancel.clone());
        let service = self.clone();
        let url = self.config.endpoint(path);

        tokio::spawn(async move {
            service
                .read_stream::<T>(url, body, reader_cancel, sender)
                .await;
        });

        stream
    }

    async fn read_stream<T>(
        &self,
        url: String,
        body: JsonValue,
        cancel: CancellationToken,
        sender: UnboundedSender<AppResult<GenerationEvent>>,
    ) where
        T: StreamResponse + Send + 'static,
    {
        let correlation_id = Uuid::new_v4().to_string();
        debug!(
            target: "app::chat::ollama",
            correlation_id = %correlation_id,
            url = %url,
            payload = %redacted_payload_string(&body),
            "opening generation stream"
        );

        let connect = self.send_with_retry("stream", &correlation_id, || {
            self.client.post(&url).json(&body)
        });
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target: "app::chat::ollama", correlation_id = %correlation_id, "cancelled while connecting");
                return;
            }
            result = connect => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                let _ = sender.send(Err(error));
                return;
            }
        };

        let limit = self.config.max_content_length;
        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                let _ = sender.send(Err(AppError::content_too_large(length as usize, limit)));
                return;
            }
        }

        let started = Instant::now();
        let stream_correlation = correlation_id.clone();
        let chunks = Box::pin(response.bytes_stream().map(move |chunk| {
            chunk.map_err(|err| Self::error_from_stream(err, &stream_correlation))
        }));
        let splitter = LineSplitter::with_capacity(self.config.buffer_size, limit);
        let lines = Box::pin(buffered_lines(chunks, splitter));
        let mut events = Box::pin(decode_lines::<T, _>(lines, limit));

        let mut emitted = 0usize;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(
                        target: "app::chat::ollama",
                        correlation_id = %correlation_id,
                        emitted,
                        "generation stream cancelled"
                    );
                    break;
                }
                item = events.next() => match item {
                    Some(item) => {
                        let terminal = matches!(item, Err(_) | Ok(GenerationEvent::Done { .. }));
                        emitted += 1;
                        if sender.send(item).is_err() || terminal {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        debug!(
            target: "app::chat::ollama",
            correlation_id = %correlation_id,
            emitted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation stream closed"
        );
    }

    /// Send a request, retrying connection failures and retryable statuses
    /// with exponential backoff. Only establishment is retried: once a
    /// successful response is returned its body is never re-requested.
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        correlation_id: &str,
        build: F,
    ) -> AppResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > 1 {
                sleep(self.config.retry_delay(attempt - 1)).await;
            }

            debug!(
                target: "app::chat::ollama",
                operation,
                attempt,
                correlation_id = %correlation_id,
                "sending request"
            );

            let start = Instant::now();
            let (error, retryable) = match build().send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        target: "app::chat::ollama",
                        operation,
                        correlation_id = %correlation_id,
                        latency_ms = start.elapsed().as_millis() as u64,
                        content_length = ?response.content_length(),
                        "Ollama responded"
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    Self::map_http_error(status, &body, correlation_id)
                }
                Err(err) => Self::error_from_reqwest(err, correlation_id),
            };

            warn!(
                target: "app::chat::ollama",
                operation,
                attempt,
                max_attempts,
                retryable,
                correlation_id = %correlation_id,
                "Ollama request failed"
            );

            if !retryable || attempt >= max_attempts {
                return Err(error);
            }
        }
    }

    fn map_http_error(status: StatusCode, body: &str, correlation_id: &str) -> (AppError, bool) {
        let server_message = serde_json::from_str::<JsonValue>(body)
            .ok()
            .and_then(|value| value.get("error").and_then(|e| e.as_str()).map(str::to_string));
        let details = server_message
            .as_ref()
            .map(|message| json!({ "status": status.as_u16(), "serverMessage": message }))
            .or_else(|| Some(json!({ "status": status.as_u16() })));
        let suffix = server_message
            .map(|message| format!(": {message}"))
            .unwrap_or_default();

        let (message, retryable) = match status {
            StatusCode::TOO_MANY_REQUESTS => (
                format!("Ollama server is busy (status 429){suffix}"),
                true,
            ),
            status if status.is_server_error() => (
                format!("Ollama server error (status {}){suffix}", status.as_u16()),
                true,
            ),
            StatusCode::NOT_FOUND => (
                format!("model or endpoint not found (status 404){suffix}"),
                false,
            ),
            StatusCode::BAD_REQUEST => (format!("invalid request (status 400){suffix}"), false),
            status => (
                format!("unexpected response status {}{suffix}", status.as_u16()),
                false,
            ),
        };

        (
            AppError::chat_with_details(
                ChatErrorCode::ResponseError,
                message,
                Some(correlation_id),
                details,
            ),
            retryable,
        )
    }

    fn error_from_reqwest(err: reqwest::Error, correlation_id: &str) -> (AppError, bool) {
        let description = describe_error(&err);
        if err.is_timeout() {
            (
                AppError::chat_with_details(
                    ChatErrorCode::TimeoutError,
                    format!("request to Ollama timed out: {description}"),
                    Some(correlation_id),
                    None,
                ),
                true,
            )
        } else if err.is_connect() {
            (
                AppError::chat_with_details(
                    ChatErrorCode::ConnectionError,
                    format!("failed to connect to Ollama: {description}"),
                    Some(correlation_id),
                    None,
                ),
                true,
            )
        } else if let Some(status) = err.status() {
            Self::map_http_error(status, "", correlation_id)
        } else {
            (
                AppError::chat_with_details(
                    ChatErrorCode::ConnectionError,
                    format!("network error: {description}"),
                    Some(correlation_id),
                    None,
                ),
                false,
            )
        }
    }

    fn error_from_stream(err: reqwest::Error, correlation_id: &str) -> AppError {
        let description = describe_error(&err);
        let code = if err.is_timeout() {
            ChatErrorCode::TimeoutError
        } else {
            ChatErrorCode::ConnectionError
        };
        AppError::chat_with_details(
            code,
            format!("generation stream interrupted: {description}"),
            Some(correlation_id),
            None,
        )
    }
}

#[async_trait::async_trait]
impl ChatProvider for OllamaService {
    fn chat(
        &self,
        model: &str,
        messages: Vec<WireMessage>,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> GenerationStream {
        self.chat_stream(model, messages, options, cancel)
    }

    async fn list_models(&self) -> AppResult<Vec<OllamaModel>> {
        self.fetch_models().await
    }
}

/// Error text including its source chain, e.g. the OS-level refusal reason.
fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut description = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !description.contains(&text) {
            description.push_str(": ");
            description.push_str(&text);
        }
        source = cause.source();
    }
    description
}

pub mod testing {
    use super::*;

    /// Expose HTTP status mapping for integration tests.
    pub fn map_http_error(status: StatusCode, body: &str) -> (AppError, bool) {
        OllamaService::map_http_error(status, body, "test-correlation-id")
    }
}
