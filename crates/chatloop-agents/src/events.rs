use chatloop_common::{ConversationMessage, ToolCallFragment, ToolExecutionResult};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Text,
    Reasoning,
}

/// Everything the round loop reports to its host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    Chunk {
        kind: ChunkKind,
        text: String,
    },
    ToolCall {
        calls: Vec<ToolCallFragment>,
    },
    ToolStreamChunk {
        tool_call_id: String,
        name: String,
        text: String,
    },
    ToolResult {
        results: Vec<ToolExecutionResult>,
    },
    ConversationComplete {
        message: ConversationMessage,
    },
    SummaryChunk {
        tool_call_id: String,
        text: String,
    },
    Error {
        message: String,
    },
    Cancelled,
}

/// Fire-and-forget event emitter. A dropped receiver silently discards events.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ConversationEvent>>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that drops everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ConversationEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
