use std::sync::Arc;

use chatloop_common::{
    ConversationMessage, Error, FunctionCall, Result, Role, SessionId, ToolExecutionResult,
};
use chatloop_config::AppConfig;
use chatloop_config::model::DEFAULT_MAX_ROUNDS;
use chatloop_db::{MessagePersistenceGuard, NewMessage};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{ChunkKind, ConversationEvent, EventSender};
use crate::providers::{LlmProvider, ToolDefinition};
use crate::stream_handler::{CompletionStatus, StreamChunk, StreamRequestHandler};
use crate::summarizer::ToolResultSummarizer;
use crate::tools::{ToolExecutor, ToolStreamEvent, ToolStreamOutcome, normalize_chunk};

/// Round bookkeeping for one driver run.
///
/// The aborted flag is not stored here: it is the driver's shared `CancellationToken`,
/// read through [`ConversationDriver::is_aborted`] at every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundState {
    pub current_round: usize,
    pub max_rounds: usize,
}

impl RoundState {
    pub fn new(max_rounds: usize) -> Self {
        Self {
            current_round: 0,
            max_rounds,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.current_round >= self.max_rounds
    }

    pub fn advance(&mut self) {
        self.current_round += 1;
    }
}

/// Cloneable handle that stops a running conversation.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Cancels whichever provider or tool call is outstanding and stops the loop at its
    /// next checkpoint.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone)]
pub enum DriverOutcome {
    /// The final assistant turn, which carries no tool calls.
    Completed(ConversationMessage),
    Cancelled,
}

enum BatchOutcome {
    Dispatched,
    Cancelled,
}

/// Runs provider rounds and tool dispatch until the model answers without tools.
pub struct ConversationDriver {
    handler: Arc<StreamRequestHandler>,
    tools: Arc<dyn ToolExecutor>,
    summarizer: ToolResultSummarizer,
    events: EventSender,
    max_rounds: usize,
    cancel: CancellationToken,
    persistence: Option<(Arc<MessagePersistenceGuard>, SessionId)>,
}

impl ConversationDriver {
    pub fn new(
        handler: Arc<StreamRequestHandler>,
        tools: Arc<dyn ToolExecutor>,
        summarizer: ToolResultSummarizer,
    ) -> Self {
        Self {
            handler,
            tools,
            summarizer,
            events: EventSender::disabled(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            cancel: CancellationToken::new(),
            persistence: None,
        }
    }

    /// Wire a driver, its stream handler and its summarizer from configuration, all
    /// sharing one event channel and one persistence guard.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        events: EventSender,
        persistence: Option<(Arc<MessagePersistenceGuard>, SessionId)>,
    ) -> Self {
        let handler = Arc::new(
            StreamRequestHandler::new(provider, config.provider.model.clone())
                .with_system_prompt(config.provider.system_prompt.clone())
                .with_max_tokens(config.provider.max_tokens)
                .with_temperature(config.provider.temperature)
                .with_events(events.clone()),
        );

        let mut summarizer = ToolResultSummarizer::new(Arc::clone(&handler))
            .with_threshold(config.agent.summary_threshold)
            .with_events(events.clone());
        if let Some((guard, session)) = &persistence {
            summarizer = summarizer.with_persistence(Arc::clone(guard), session.clone());
        }

        let mut driver = Self::new(handler, tools, summarizer)
            .with_max_rounds(config.agent.max_rounds)
            .with_events(events);
        driver.persistence = persistence;
        driver
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Persist assistant turns through `guard`. Tool messages are persisted by the
    /// summarizer.
    pub fn with_persistence(mut self, guard: Arc<MessagePersistenceGuard>, session: SessionId) -> Self {
        self.persistence = Some((guard, session));
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive the conversation in `messages` to completion.
    ///
    /// Returns `Err(Error::RoundLimitExceeded)` once `max_rounds` provider calls have not
    /// produced a final answer. The working list is left as it was at that point.
    #[instrument(skip_all, fields(max_rounds = self.max_rounds))]
    pub async fn start(&self, messages: &mut Vec<ConversationMessage>) -> Result<DriverOutcome> {
        let catalog = match self.tools.definitions().await {
            Ok(catalog) => catalog,
            Err(e) => {
                self.events.emit(ConversationEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        debug!(tools = catalog.len(), "tool catalog loaded");

        let mut state = RoundState::new(self.max_rounds);

        loop {
            if self.is_aborted() {
                return Ok(self.cancelled());
            }

            if let Some(last) = messages.last() {
                if last.role == Role::Assistant && !last.has_tool_calls() {
                    info!(rounds = state.current_round, "conversation complete");
                    let message = last.clone();
                    self.events.emit(ConversationEvent::ConversationComplete {
                        message: message.clone(),
                    });
                    return Ok(DriverOutcome::Completed(message));
                }
            }

            if state.exhausted() {
                let error = Error::RoundLimitExceeded {
                    max_rounds: state.max_rounds,
                };
                warn!("{error}");
                self.events.emit(ConversationEvent::Error {
                    message: error.to_string(),
                });
                return Err(error);
            }

            let pending_tools = messages.last().is_some_and(|m| m.has_tool_calls());
            if pending_tools {
                if let BatchOutcome::Cancelled = self.dispatch_tool_calls(messages).await? {
                    return Ok(self.cancelled());
                }
            }

            if self.is_aborted() {
                return Ok(self.cancelled());
            }

            let status = self.complete_round(messages, &catalog).await?;
            if status == CompletionStatus::Cancelled || self.is_aborted() {
                return Ok(self.cancelled());
            }

            self.persist_assistant_turn(messages, &state).await?;
            state.advance();
            debug!(round = state.current_round, "round finished");
        }
    }

    async fn complete_round(
        &self,
        messages: &mut Vec<ConversationMessage>,
        catalog: &[ToolDefinition],
    ) -> Result<CompletionStatus> {
        let events = &self.events;
        self.handler
            .chat_completion(messages, catalog, &self.cancel, |chunk| {
                let (kind, text) = match chunk {
                    StreamChunk::Text(text) => (ChunkKind::Text, text),
                    StreamChunk::Reasoning(text) => (ChunkKind::Reasoning, text),
                };
                events.emit(ConversationEvent::Chunk { kind, text });
            })
            .await
    }

    /// Run every tool call of the last assistant turn, in order, then append one tool
    /// message per result.
    async fn dispatch_tool_calls(
        &self,
        messages: &mut Vec<ConversationMessage>,
    ) -> Result<BatchOutcome> {
        let Some(turn) = messages.last() else {
            return Ok(BatchOutcome::Dispatched);
        };

        let calls: Vec<FunctionCall> = if turn.function_calls.is_empty() {
            turn.tool_calls.iter().map(FunctionCall::from).collect()
        } else {
            turn.function_calls.clone()
        };

        self.events.emit(ConversationEvent::ToolCall {
            calls: turn.tool_calls.clone(),
        });

        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            if self.is_aborted() {
                return Ok(BatchOutcome::Cancelled);
            }

            debug!(tool = %call.name, tool_call_id = %call.id, "dispatching tool call");
            let result = if self.tools.supports_streaming(&call.name).await {
                match self.run_streaming_tool(call).await {
                    Some(result) => result,
                    None => return Ok(BatchOutcome::Cancelled),
                }
            } else {
                self.tools.execute_single(call, &self.cancel).await
            };

            if self.is_aborted() {
                return Ok(BatchOutcome::Cancelled);
            }
            if result.is_error() {
                warn!(tool = %call.name, "tool call returned an error result");
            }
            results.push(result);
        }

        if self.is_aborted() {
            return Ok(BatchOutcome::Cancelled);
        }

        // Tool messages join the working list together or not at all.
        let mut tool_messages = Vec::with_capacity(results.len());
        for result in &results {
            tool_messages.push(
                self.summarizer
                    .process_tool_result(result, &self.cancel)
                    .await?,
            );
        }
        messages.extend(tool_messages);
        self.events.emit(ConversationEvent::ToolResult { results });

        Ok(BatchOutcome::Dispatched)
    }

    /// `None` when the call was cancelled.
    async fn run_streaming_tool(&self, call: &FunctionCall) -> Option<ToolExecutionResult> {
        let mut buffer = String::new();
        let events = &self.events;
        let mut on_event = |event: ToolStreamEvent| {
            if let ToolStreamEvent::Chunk(raw) = event {
                let text = normalize_chunk(&raw);
                if text.is_empty() {
                    return;
                }
                buffer.push_str(&text);
                events.emit(ConversationEvent::ToolStreamChunk {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    text,
                });
            }
        };

        let outcome = self
            .tools
            .execute_streaming(call, &self.cancel, &mut on_event)
            .await;

        match outcome {
            ToolStreamOutcome::Completed => {
                Some(ToolExecutionResult::success(&call.id, &call.name, buffer))
            }
            ToolStreamOutcome::Failed(message) => {
                let mut result = ToolExecutionResult::failure(&call.id, &call.name, message);
                if !buffer.is_empty() {
                    result.content = format!("{buffer}\n\n{}", result.content);
                }
                Some(result)
            }
            ToolStreamOutcome::Cancelled => None,
        }
    }

    async fn persist_assistant_turn(
        &self,
        messages: &[ConversationMessage],
        state: &RoundState,
    ) -> Result<()> {
        let (Some((guard, session)), Some(turn)) = (&self.persistence, messages.last()) else {
            return Ok(());
        };
        let metadata = json!({ "round": state.current_round });
        if let Err(e) = guard
            .save(NewMessage::new(session.clone(), turn.clone()).with_metadata(metadata))
            .await
        {
            warn!("failed to persist assistant turn: {e}");
            self.events.emit(ConversationEvent::Error {
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }

    fn cancelled(&self) -> DriverOutcome {
        info!("conversation stopped by abort");
        self.events.emit(ConversationEvent::Cancelled);
        DriverOutcome::Cancelled
    }
}
