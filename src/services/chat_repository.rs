use std::collections::HashMap;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::chat::{ChatMessage, ChatSession};

/// Storage for sessions and messages. The engine only needs at-least-once
/// delivery of updates; the storage format is up to the implementation.
#[async_trait::async_trait]
pub trait ChatRepository: Send + Sync {
    async fn insert_session(&self, session: &ChatSession) -> AppResult<()>;

    async fn update_session(&self, session: &ChatSession) -> AppResult<()>;

    async fn delete_session(&self, session_id: &str) -> AppResult<()>;

    async fn get_session(&self, session_id: &str) -> AppResult<Option<ChatSession>>;

    /// Most recently modified first.
    async fn get_all_sessions(&self) -> AppResult<Vec<ChatSession>>;

    fn watch_sessions(&self) -> BoxStream<'static, Vec<ChatSession>>;

    async fn insert_message(&self, message: &ChatMessage) -> AppResult<()>;

    async fn update_message(&self, message: &ChatMessage) -> AppResult<()>;

    /// Messages of a session in insertion order.
    async fn get_messages(&self, session_id: &str) -> AppResult<Vec<ChatMessage>>;

    fn watch_messages(&self, session_id: &str) -> BoxStream<'static, Vec<ChatMessage>>;
}

/// Process-local repository backed by watch channels, so observers see every
/// committed change.
pub struct InMemoryChatRepository {
    sessions: watch::Sender<Vec<ChatSession>>,
    messages: watch::Sender<HashMap<String, Vec<ChatMessage>>>,
}

impl Default for InMemoryChatRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChatRepository {
    pub fn new() -> Self {
        let (sessions, _) = watch::channel(Vec::new());
        let (messages, _) = watch::channel(HashMap::new());
        Self { sessions, messages }
    }

    fn touch_session(&self, session_id: &str) {
        let now = Utc::now().timestamp_millis();
        self.sessions.send_if_modified(|sessions| {
            match sessions.iter_mut().find(|session| session.id == session_id) {
                Some(session) => {
                    session.last_modified = now;
                    true
                }
                None => false,
            }
        });
    }

    fn session_exists(&self, session_id: &str) -> bool {
        self.sessions
            .borrow()
            .iter()
            .any(|session| session.id == session_id)
    }
}

#[async_trait::async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn insert_session(&self, session: &ChatSession) -> AppResult<()> {
        if self.session_exists(&session.id) {
            return Err(AppError::validation(format!(
                "session '{}' already exists",
                session.id
            )));
        }
        self.sessions.send_modify(|sessions| sessions.push(session.clone()));
        self.messages.send_modify(|messages| {
            messages.entry(session.id.clone()).or_default();
        });
        debug!(target: "app::repository", session_id = %session.id, "session inserted");
        Ok(())
    }

    async fn update_session(&self, session: &ChatSession) -> AppResult<()> {
        let updated = self.sessions.send_if_modified(|sessions| {
            match sessions.iter_mut().find(|existing| existing.id == session.id) {
                Some(existing) => {
                    *existing = session.clone();
                    true
                }
                None => false,
            }
        });
        if updated {
            Ok(())
        } else {
            Err(AppError::not_found())
        }
    }

    async fn delete_session(&self, session_id: &str) -> AppResult<()> {
        let removed = self.sessions.send_if_modified(|sessions| {
            let before = sessions.len();
            sessions.retain(|session| session.id != session_id);
            sessions.len() != before
        });
        if !removed {
            return Err(AppError::not_found());
        }
        self.messages.send_modify(|messages| {
            messages.remove(session_id);
        });
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> AppResult<Option<ChatSession>> {
        Ok(self
            .sessions
            .borrow()
            .iter()
            .find(|session| session.id == session_id)
            .cloned())
    }

    async fn get_all_sessions(&self) -> AppResult<Vec<ChatSession>> {
        let mut sessions = self.sessions.borrow().clone();
        sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(sessions)
    }

    fn watch_sessions(&self) -> BoxStream<'static, Vec<ChatSession>> {
        WatchStream::new(self.sessions.subscribe())
            .map(|mut sessions| {
                sessions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
                sessions
            })
            .boxed()
    }

    async fn insert_message(&self, message: &ChatMessage) -> AppResult<()> {
        if !self.session_exists(&message.session_id) {
            return Err(AppError::not_found());
        }
        self.messages.send_modify(|messages| {
            messages
                .entry(message.session_id.clone())
                .or_default()
                .push(message.clone());
        });
        self.touch_session(&message.session_id);
        Ok(())
    }

    async fn update_message(&self, message: &ChatMessage) -> AppResult<()> {
        let updated = self.messages.send_if_modified(|messages| {
            let existing = messages
                .get_mut(&message.session_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message.id));
            match existing {
                Some(existing) => {
                    *existing = message.clone();
                    true
                }
                None => false,
            }
        });
        if updated {
            Ok(())
        } else {
            Err(AppError::not_found())
        }
    }

    async fn get_messages(&self, session_id: &str) -> AppResult<Vec<ChatMessage>> {
        Ok(self
            .messages
            .borrow()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn watch_messages(&self, session_id: &str) -> BoxStream<'static, Vec<ChatMessage>> {
        let session_id = session_id.to_string();
        WatchStream::new(self.messages.subscribe())
            .map(move |messages| messages.get(&session_id).cloned().unwrap_or_default())
            .boxed()
    }
}
