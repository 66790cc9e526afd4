use std::sync::Arc;

use async_trait::async_trait;
use chatloop_common::{ConversationMessage, MessageId, Result, Role, SessionId};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::session_store::SessionStore;

/// A message on its way to the persistence backend.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub message: ConversationMessage,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn new(session_id: SessionId, message: ConversationMessage) -> Self {
        Self {
            session_id,
            message,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What the backend hands back after a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// External persistence backend. No retry contract: a failed write is returned as an error.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: &NewMessage) -> Result<PersistedMessage>;
}

/// `MessageStore` backed by the SQLite session store.
pub struct SqliteMessageStore {
    store: Arc<Mutex<SessionStore>>,
}

impl SqliteMessageStore {
    pub fn new(store: Arc<Mutex<SessionStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(&self, message: &NewMessage) -> Result<PersistedMessage> {
        let store = self.store.lock().await;
        store.ensure_session(message.session_id.as_str())?;
        let id = store.append_message(
            message.session_id.as_str(),
            &message.message,
            &message.metadata,
        )?;
        Ok(PersistedMessage {
            id: MessageId::from(id),
            session_id: message.session_id.clone(),
            role: message.message.role,
            created_at: message.message.created_at,
        })
    }
}
