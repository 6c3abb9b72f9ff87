pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use error::{AppError, AppResult};
pub use models::config::OllamaConfig;
pub use services::chat_orchestrator::{ChatOrchestrator, ChatUpdate, SendOutcome, SendRequest};
pub use services::chat_repository::{ChatRepository, InMemoryChatRepository};
pub use services::ollama_service::{ChatProvider, OllamaService};
