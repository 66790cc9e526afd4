use std::sync::Arc;

use chatloop_common::{ConversationMessage, Result, SessionId, ToolExecutionResult};
use chatloop_config::model::DEFAULT_SUMMARY_THRESHOLD;
use chatloop_db::{MessagePersistenceGuard, NewMessage};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::events::{ConversationEvent, EventSender};
use crate::stream_handler::{CompletionStatus, StreamChunk, StreamRequestHandler};

const SUMMARY_SYSTEM_PROMPT: &str = "You condense tool output for another assistant. \
     Reply with the summary only.";

const SUMMARY_INSTRUCTION: &str = "Summarize the following tool output. Keep every number, \
     identifier, file path and error message that could matter for answering the user, and \
     drop repetition and boilerplate.";

/// Text kept in context when summarization is cancelled.
pub fn summary_placeholder(tool_name: &str, original_length: usize) -> String {
    format!("tool {tool_name} executed, content length {original_length} characters")
}

/// Keeps oversized tool output out of the context window while storing it in full.
pub struct ToolResultSummarizer {
    handler: Arc<StreamRequestHandler>,
    threshold: usize,
    events: EventSender,
    persistence: Option<(Arc<MessagePersistenceGuard>, SessionId)>,
}

impl ToolResultSummarizer {
    pub fn new(handler: Arc<StreamRequestHandler>) -> Self {
        Self {
            handler,
            threshold: DEFAULT_SUMMARY_THRESHOLD,
            events: EventSender::disabled(),
            persistence: None,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn with_persistence(mut self, guard: Arc<MessagePersistenceGuard>, session: SessionId) -> Self {
        self.persistence = Some((guard, session));
        self
    }

    /// Length is counted in characters, not bytes.
    pub fn needs_summary(&self, content: &str) -> bool {
        content.chars().count() > self.threshold
    }

    /// Persist the original result and return the tool message for the working list.
    ///
    /// Results over the threshold are replaced by a streamed summary in the returned
    /// message only. Provider and persistence failures propagate; cancellation during
    /// summarization falls back to a placeholder.
    #[instrument(skip_all, fields(tool = %result.name, tool_call_id = %result.tool_call_id))]
    pub async fn process_tool_result(
        &self,
        result: &ToolExecutionResult,
        cancel: &CancellationToken,
    ) -> Result<ConversationMessage> {
        let original_length = result.content.chars().count();
        let summary = if self.needs_summary(&result.content) {
            Some(self.summarize(result, original_length, cancel).await?)
        } else {
            None
        };

        if let Some((guard, session)) = &self.persistence {
            let original = ConversationMessage::tool(&result.tool_call_id, &result.content);
            let metadata = json!({
                "summarized": summary.is_some(),
                "original_length": original_length,
                "tool_name": result.name,
            });
            if let Err(e) = guard
                .save(NewMessage::new(session.clone(), original).with_metadata(metadata))
                .await
            {
                warn!("failed to persist tool result: {e}");
                self.events.emit(ConversationEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        }

        let content = summary.unwrap_or_else(|| result.content.clone());
        Ok(ConversationMessage::tool(&result.tool_call_id, content))
    }

    async fn summarize(
        &self,
        result: &ToolExecutionResult,
        original_length: usize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        info!(original_length, "summarizing oversized tool result");

        let prompt = vec![ConversationMessage::user(format!(
            "{SUMMARY_INSTRUCTION}\n\nTool: {}\n\n{}",
            result.name, result.content
        ))];

        let events = self.events.clone();
        let tool_call_id = result.tool_call_id.clone();
        let (message, status) = self
            .handler
            .complete_detached(
                prompt,
                Some(SUMMARY_SYSTEM_PROMPT.to_string()),
                cancel,
                move |chunk| {
                    if let StreamChunk::Text(text) = chunk {
                        events.emit(ConversationEvent::SummaryChunk {
                            tool_call_id: tool_call_id.clone(),
                            text,
                        });
                    }
                },
            )
            .await?;

        match status {
            CompletionStatus::Cancelled => {
                info!("summarization cancelled, using placeholder");
                Ok(summary_placeholder(&result.name, original_length))
            }
            CompletionStatus::Completed if message.content.trim().is_empty() => {
                warn!("summarization produced no text, using placeholder");
                Ok(summary_placeholder(&result.name, original_length))
            }
            CompletionStatus::Completed => Ok(message.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_names_tool_and_length() {
        assert_eq!(
            summary_placeholder("fs__read", 5000),
            "tool fs__read executed, content length 5000 characters"
        );
    }
}
