use std::fmt;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, warn};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatErrorCode {
    ConnectionError,
    TimeoutError,
    ResponseError,
    ContentTooLargeError,
}

impl ChatErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatErrorCode::ConnectionError => "CONNECTION_ERROR",
            ChatErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ChatErrorCode::ResponseError => "RESPONSE_ERROR",
            ChatErrorCode::ContentTooLargeError => "CONTENT_TOO_LARGE",
        }
    }
}

impl fmt::Display for ChatErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("record not found")]
    NotFound,

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("{message}")]
    Chat {
        code: ChatErrorCode,
        message: String,
        correlation_id: Option<String>,
        details: Option<JsonValue>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        warn!(target: "app::validation", %message, "validation error");
        AppError::Validation { message }
    }

    pub fn chat(code: ChatErrorCode, message: impl Into<String>) -> Self {
        Self::chat_with_details(code, message, None, None)
    }

    pub fn chat_with_details(
        code: ChatErrorCode,
        message: impl Into<String>,
        correlation_id: Option<&str>,
        details: Option<JsonValue>,
    ) -> Self {
        let message = message.into();
        let correlation = correlation_id.map(|value| value.to_string());
        match (&correlation, &details) {
            (Some(id), Some(payload)) => {
                warn!(
                    target: "app::chat::error",
                    code = %code,
                    correlation_id = %id,
                    details = %payload,
                    %message
                );
            }
            (Some(id), None) => {
                warn!(
                    target: "app::chat::error",
                    code = %code,
                    correlation_id = %id,
                    %message
                );
            }
            (None, Some(payload)) => {
                warn!(target: "app::chat::error", code = %code, details = %payload, %message);
            }
            (None, None) => {
                warn!(target: "app::chat::error", code = %code, %message);
            }
        }

        AppError::Chat {
            code,
            message,
            correlation_id: correlation,
            details,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::chat(ChatErrorCode::ConnectionError, message)
    }

    pub fn response(message: impl Into<String>) -> Self {
        Self::chat(ChatErrorCode::ResponseError, message)
    }

    pub fn content_too_large(observed: usize, limit: usize) -> Self {
        Self::chat_with_details(
            ChatErrorCode::ContentTooLargeError,
            format!("content exceeds limit: {observed} bytes (limit: {limit})"),
            None,
            Some(serde_json::json!({ "observed": observed, "limit": limit })),
        )
    }

    pub fn chat_code(&self) -> Option<ChatErrorCode> {
        match self {
            AppError::Chat { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn chat_correlation_id(&self) -> Option<&str> {
        match self {
            AppError::Chat { correlation_id, .. } => correlation_id.as_deref(),
            _ => None,
        }
    }

    pub fn chat_details(&self) -> Option<&JsonValue> {
        match self {
            AppError::Chat { details, .. } => details.as_ref(),
            _ => None,
        }
    }

    pub fn not_found() -> Self {
        warn!(target: "app::repository", "resource not found");
        AppError::NotFound
    }

    pub fn config(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::config", %message, "configuration error");
        AppError::Config(message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        let message = message.into();
        error!(target: "app::other", %message, "other error");
        AppError::Other(message)
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(error: serde_yaml::Error) -> Self {
        AppError::config(format!("failed to parse YAML configuration: {error}"))
    }
}
