use chatloop_common::{
    ConversationMessage, Error, FunctionCall, Result, Role, ToolCallFragment,
    close_unanswered_tool_calls,
};
use rusqlite::Connection;
use rusqlite::params;
use std::path::Path;
use tracing::{info, warn};

/// Persisted message row loaded from the session store.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub function_calls: Vec<FunctionCall>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: serde_json::Value,
}

impl StoredMessage {
    /// Rebuild the working-list form of a stored row. Rows with an unknown role yield `None`.
    pub fn to_conversation_message(&self) -> Option<ConversationMessage> {
        let role = Role::from_name(&self.role)?;
        let tool_calls = self
            .function_calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCallFragment {
                index: index as u32,
                id: call.id.clone(),
                name: call.name.clone(),
                arguments_text: call.arguments.clone(),
            })
            .collect();

        Some(ConversationMessage {
            role,
            content: self.content.clone(),
            reasoning_content: None,
            tool_calls,
            function_calls: self.function_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            created_at: self.created_at,
        })
    }
}

/// Durable storage for conversation sessions and their messages.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening session store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    metadata TEXT DEFAULT '{}'
                );

                CREATE TABLE IF NOT EXISTS messages (
                    id TEXT PRIMARY KEY,
                    session_id TEXT NOT NULL REFERENCES sessions(id),
                    role TEXT NOT NULL,
                    content TEXT NOT NULL,
                    reasoning_content TEXT,
                    tool_call_id TEXT,
                    function_calls TEXT DEFAULT '[]',
                    metadata TEXT DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    inserted_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_messages_session
                    ON messages(session_id, created_at);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Insert the session row if it does not exist yet; existing metadata is left alone.
    pub fn ensure_session(&self, session_id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO sessions (id) VALUES (?1)",
                params![session_id],
            )
            .map_err(|e| Error::Database(format!("failed to create session: {e}")))?;
        Ok(())
    }

    /// Append a single message to a session and return its new id.
    pub fn append_message(
        &self,
        session_id: &str,
        message: &ConversationMessage,
        metadata: &serde_json::Value,
    ) -> Result<String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let function_calls = serde_json::to_string(&message.function_calls)?;
        self.conn
            .execute(
                "INSERT INTO messages (id, session_id, role, content, reasoning_content,
                                       tool_call_id, function_calls, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message_id,
                    session_id,
                    message.role.as_str(),
                    message.content,
                    message.reasoning_content,
                    message.tool_call_id,
                    function_calls,
                    metadata.to_string(),
                    message.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Database(format!("failed to append message: {e}")))?;
        Ok(message_id)
    }

    /// Load recent messages for a session in chronological order.
    pub fn load_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, role, content, tool_call_id, function_calls, created_at, metadata
                 FROM messages
                 WHERE session_id = ?1
                 ORDER BY rowid DESC
                 LIMIT ?2",
            )
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![session_id, limit as i64], |row| {
                let function_calls_raw: Option<String> = row.get(4)?;
                let created_at_raw: String = row.get(5)?;
                let metadata_raw: String = row.get(6)?;
                Ok(StoredMessage {
                    id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    tool_call_id: row.get(3)?,
                    function_calls: function_calls_raw
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default(),
                    created_at: parse_timestamp(&created_at_raw),
                    metadata: serde_json::from_str(&metadata_raw)
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .map_err(|e| Error::Database(format!("failed to load messages: {e}")))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(
                row.map_err(|e| Error::Database(format!("failed to read message row: {e}")))?,
            );
        }

        // Query is DESC for efficient tail fetch; return in chronological order.
        messages.reverse();
        Ok(messages)
    }

    /// Load the tail of a session as a working list a provider will accept: rows with
    /// unknown roles are skipped and tool calls are paired with their results.
    pub fn load_conversation(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let rows = self.load_recent_messages(session_id, limit)?;
        let restored = rows
            .iter()
            .filter_map(|row| {
                let message = row.to_conversation_message();
                if message.is_none() {
                    warn!(
                        id = %row.id,
                        role = %row.role,
                        "skipping stored message with unknown role"
                    );
                }
                message
            })
            .collect();
        Ok(close_unanswered_tool_calls(restored))
    }

    pub fn message_count(&self, session_id: &str) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to count messages: {e}")))?;
        Ok(count as usize)
    }
}

fn parse_timestamp(value: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|e| {
            warn!(
                "failed to parse timestamp '{}': {e}, falling back to now",
                value
            );
            chrono::Utc::now()
        })
}

#[cfg(test)]
mod tests {
    use super::SessionStore;
    use chatloop_common::{ConversationMessage, Role, ToolCallFragment, UNANSWERED_TOOL_CALL};

    #[test]
    fn append_and_load_recent_messages_round_trip() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        let session_id = "session-1";

        store
            .ensure_session(session_id)
            .expect("session creation should succeed");

        store
            .append_message(
                session_id,
                &ConversationMessage::user("hello"),
                &serde_json::json!({}),
            )
            .expect("user message append should succeed");

        let mut assistant = ConversationMessage::assistant();
        assistant.tool_calls.push(ToolCallFragment {
            index: 0,
            id: "call_1".into(),
            name: "weather__get".into(),
            arguments_text: "{\"city\":\"Paris\"}".into(),
        });
        assistant.finalize_function_calls();
        store
            .append_message(session_id, &assistant, &serde_json::json!({}))
            .expect("assistant message append should succeed");

        let messages = store
            .load_recent_messages(session_id, 10)
            .expect("message load should succeed");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].function_calls.len(), 1);
        assert_eq!(messages[1].function_calls[0].name, "weather__get");

        let restored = messages[1]
            .to_conversation_message()
            .expect("assistant row should restore");
        assert!(restored.has_tool_calls());
        assert_eq!(restored.tool_calls[0].arguments_text, "{\"city\":\"Paris\"}");
    }

    #[test]
    fn append_requires_existing_session() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        let result = store.append_message(
            "missing",
            &ConversationMessage::user("orphan"),
            &serde_json::json!({}),
        );
        assert!(result.is_err());
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        store.ensure_session("s").expect("first ensure");
        store
            .append_message("s", &ConversationMessage::user("kept"), &serde_json::json!({}))
            .expect("append should succeed");
        store.ensure_session("s").expect("second ensure");

        let sessions: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM sessions WHERE id = 's'", [], |row| {
                row.get(0)
            })
            .expect("session row should exist");
        assert_eq!(sessions, 1);
        assert_eq!(store.message_count("s").unwrap(), 1);
    }

    fn tool_turn(ids: &[&str]) -> ConversationMessage {
        let mut assistant = ConversationMessage::assistant();
        for (index, id) in ids.iter().enumerate() {
            assistant.tool_calls.push(ToolCallFragment {
                index: index as u32,
                id: id.to_string(),
                name: "weather__get".into(),
                arguments_text: "{}".into(),
            });
        }
        assistant.finalize_function_calls();
        assistant
    }

    #[test]
    fn aborted_tool_batch_resumes_with_closed_calls() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        store.ensure_session("s").unwrap();
        let empty = serde_json::json!({});
        store
            .append_message("s", &ConversationMessage::user("Paris and Rome?"), &empty)
            .unwrap();
        store
            .append_message("s", &tool_turn(&["call_a", "call_b"]), &empty)
            .unwrap();

        let mut history = store.load_conversation("s", 200).unwrap();
        history.push(ConversationMessage::user("try again"));

        let answered: Vec<_> = history
            .iter()
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(answered, vec!["call_a", "call_b"]);
        assert_eq!(history[2].content, UNANSWERED_TOOL_CALL);
        assert_eq!(history.last().unwrap().role, Role::User);
    }

    #[test]
    fn history_window_never_starts_with_a_tool_result() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        store.ensure_session("s").unwrap();
        let empty = serde_json::json!({});
        store
            .append_message("s", &ConversationMessage::user("weather?"), &empty)
            .unwrap();
        store
            .append_message("s", &tool_turn(&["call_a"]), &empty)
            .unwrap();
        store
            .append_message("s", &ConversationMessage::tool("call_a", "18C"), &empty)
            .unwrap();
        store
            .append_message("s", &ConversationMessage::assistant_text("18C."), &empty)
            .unwrap();

        let history = store.load_conversation("s", 2).unwrap();

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].content, "18C.");
    }

    #[test]
    fn message_count_tracks_appends() {
        let store = SessionStore::in_memory().expect("in-memory store should open");
        store.ensure_session("s").expect("ensure should succeed");
        assert_eq!(store.message_count("s").unwrap(), 0);
        store
            .append_message(
                "s",
                &ConversationMessage::tool("call_1", "{\"temp\":18}"),
                &serde_json::json!({"summarized": false}),
            )
            .expect("append should succeed");
        assert_eq!(store.message_count("s").unwrap(), 1);

        let loaded = store.load_recent_messages("s", 5).unwrap();
        assert_eq!(loaded[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(loaded[0].metadata["summarized"], false);
    }

    #[test]
    fn open_file_backed_store() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("chatloop.db");
        {
            let store = SessionStore::open(&path).expect("file store should open");
            store.ensure_session("s").unwrap();
            store
                .append_message("s", &ConversationMessage::user("persisted"), &serde_json::json!({}))
                .unwrap();
        }
        let reopened = SessionStore::open(&path).expect("file store should reopen");
        assert_eq!(reopened.message_count("s").unwrap(), 1);
    }
}
