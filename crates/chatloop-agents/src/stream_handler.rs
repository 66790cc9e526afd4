use std::sync::Arc;

use chatloop_common::{ConversationMessage, Result, ToolCallFragment};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::events::{ConversationEvent, EventSender};
use crate::providers::{LlmProvider, LlmRequest, StreamDelta, ToolCallDelta, ToolDefinition};

/// A typed piece of streamed output, so reasoning can be rendered apart from the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    /// The stream was stopped by cancellation; the appended message is partial.
    Cancelled,
}

/// Issues one streaming completion and folds its deltas into a single assistant turn.
pub struct StreamRequestHandler {
    provider: Arc<dyn LlmProvider>,
    model: String,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    events: EventSender,
}

impl StreamRequestHandler {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            events: EventSender::disabled(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn provider_id(&self) -> &str {
        self.provider.provider_id()
    }

    /// Stream one completion over the full working list and append the resulting
    /// assistant message to it.
    ///
    /// Cancellation returns `Ok(CompletionStatus::Cancelled)` with whatever was
    /// received so far appended. Provider failures are emitted as `error` events and
    /// returned.
    #[instrument(skip_all, fields(provider = self.provider.provider_id(), messages = messages.len()))]
    pub async fn chat_completion<F>(
        &self,
        messages: &mut Vec<ConversationMessage>,
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<CompletionStatus>
    where
        F: FnMut(StreamChunk) + Send,
    {
        let request = LlmRequest {
            model: self.model.clone(),
            messages: messages.clone(),
            system: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: tools.to_vec(),
        };

        let (message, status) = self.run(&request, cancel, on_chunk).await?;
        messages.push(message);
        Ok(status)
    }

    /// Stream a standalone, tool-free completion that does not touch any working list.
    pub async fn complete_detached<F>(
        &self,
        prompt: Vec<ConversationMessage>,
        system: Option<String>,
        cancel: &CancellationToken,
        on_chunk: F,
    ) -> Result<(ConversationMessage, CompletionStatus)>
    where
        F: FnMut(StreamChunk) + Send,
    {
        let request = LlmRequest {
            model: self.model.clone(),
            messages: prompt,
            system,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            tools: Vec::new(),
        };
        self.run(&request, cancel, on_chunk).await
    }

    async fn run<F>(
        &self,
        request: &LlmRequest,
        cancel: &CancellationToken,
        mut on_chunk: F,
    ) -> Result<(ConversationMessage, CompletionStatus)>
    where
        F: FnMut(StreamChunk) + Send,
    {
        // Child token: aborting the conversation cancels this call, not the other way round.
        let call_token = cancel.child_token();
        let mut message = ConversationMessage::assistant();

        let opened = tokio::select! {
            biased;
            _ = call_token.cancelled() => {
                info!("completion cancelled before the stream opened");
                return Ok((message, CompletionStatus::Cancelled));
            }
            opened = self.provider.stream(request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.report_failure(&e);
                return Err(e);
            }
        };

        let mut status = CompletionStatus::Completed;
        loop {
            let next = tokio::select! {
                biased;
                _ = call_token.cancelled() => {
                    status = CompletionStatus::Cancelled;
                    break;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delta)) => apply_delta(&mut message, delta, &mut on_chunk),
                Some(Err(e)) => {
                    self.report_failure(&e);
                    return Err(e);
                }
                None => break,
            }
        }
        drop(stream);

        if status == CompletionStatus::Cancelled {
            info!(
                content_len = message.content.len(),
                tool_calls = message.tool_calls.len(),
                "completion cancelled mid-stream, keeping partial turn"
            );
        }

        finalize_tool_calls(&mut message);
        Ok((message, status))
    }

    fn report_failure(&self, error: &chatloop_common::Error) {
        warn!("provider request failed: {error}");
        self.events.emit(ConversationEvent::Error {
            message: error.to_string(),
        });
    }
}

fn apply_delta<F>(message: &mut ConversationMessage, delta: StreamDelta, on_chunk: &mut F)
where
    F: FnMut(StreamChunk),
{
    if let Some(reasoning) = delta.reasoning_content {
        message
            .reasoning_content
            .get_or_insert_with(String::new)
            .push_str(&reasoning);
        on_chunk(StreamChunk::Reasoning(reasoning));
    }

    if let Some(text) = delta.content {
        message.content.push_str(&text);
        on_chunk(StreamChunk::Text(text));
    }

    for tool_delta in &delta.tool_calls {
        merge_tool_call_delta(&mut message.tool_calls, tool_delta);
    }

    if let Some(reason) = delta.finish_reason {
        debug!(finish_reason = %reason, "stream finished");
    }
}

/// How far past the current list an explicit tool-call index may point before it is
/// treated as unusable.
const MAX_INDEX_GAP: usize = 64;

/// Merge one tool-call delta into the fragment list.
///
/// An explicit index is used as-is, growing the list with empty placeholders as needed.
/// An index more than [`MAX_INDEX_GAP`] slots past the end is ignored. Without a usable
/// index, a delta that opens a new call (a new id, or a name when the
/// latest fragment is already named) goes at the current list length; anything else
/// continues the latest fragment. Name and id are only overwritten by non-empty values;
/// argument text is always appended.
pub fn merge_tool_call_delta(fragments: &mut Vec<ToolCallFragment>, delta: &ToolCallDelta) {
    let id = delta.id.as_deref().filter(|s| !s.is_empty());
    let name = delta.name.as_deref().filter(|s| !s.is_empty());

    let explicit = delta.index.map(|i| i as usize).filter(|&i| {
        let usable = i <= fragments.len() + MAX_INDEX_GAP;
        if !usable {
            warn!(
                index = i,
                fragments = fragments.len(),
                "ignoring out-of-range tool-call index"
            );
        }
        usable
    });

    let index = match explicit {
        Some(index) => index,
        None => match fragments.last() {
            None => 0,
            Some(last) => {
                let opens_new_call = match id {
                    Some(id) => !last.id.is_empty() && last.id != id,
                    None => name.is_some() && !last.name.is_empty(),
                };
                if opens_new_call {
                    fragments.len()
                } else {
                    fragments.len() - 1
                }
            }
        },
    };

    while fragments.len() <= index {
        let position = fragments.len() as u32;
        fragments.push(ToolCallFragment {
            index: position,
            ..Default::default()
        });
    }

    let fragment = &mut fragments[index];
    if let Some(id) = id {
        fragment.id = id.to_string();
    }
    if let Some(name) = name {
        fragment.name = name.to_string();
    }
    if let Some(arguments) = &delta.arguments {
        fragment.arguments_text.push_str(arguments);
    }
}

/// Drop placeholders that never received a name, synthesize missing ids and derive
/// `function_calls`.
fn finalize_tool_calls(message: &mut ConversationMessage) {
    if message.tool_calls.is_empty() {
        return;
    }

    let before = message.tool_calls.len();
    message.tool_calls.retain(|call| !call.name.is_empty());
    if message.tool_calls.len() != before {
        warn!(
            dropped = before - message.tool_calls.len(),
            "discarding tool-call fragments without a name"
        );
    }

    for (position, call) in message.tool_calls.iter_mut().enumerate() {
        call.index = position as u32;
        if call.id.is_empty() {
            call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
    }
    message.finalize_function_calls();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: Option<u32>, name: Option<&str>, arguments: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: None,
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }

    #[test]
    fn index_less_deltas_merge_into_one_fragment() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(&mut fragments, &delta(None, Some("foo"), None));
        merge_tool_call_delta(&mut fragments, &delta(None, None, Some("{")));
        merge_tool_call_delta(&mut fragments, &delta(None, None, Some("}")));

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].index, 0);
        assert_eq!(fragments[0].name, "foo");
        assert_eq!(fragments[0].arguments_text, "{}");
    }

    #[test]
    fn explicit_index_grows_with_placeholders() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(&mut fragments, &delta(Some(2), Some("late"), Some("{}")));

        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].index, 0);
        assert!(fragments[0].name.is_empty());
        assert_eq!(fragments[2].index, 2);
        assert_eq!(fragments[2].name, "late");
    }

    #[test]
    fn out_of_range_index_falls_back_to_index_less_merge() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(&mut fragments, &delta(Some(20_000_000), Some("f"), None));
        merge_tool_call_delta(&mut fragments, &delta(Some(u32::MAX), None, Some("{}")));

        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].index, 0);
        assert_eq!(fragments[0].name, "f");
        assert_eq!(fragments[0].arguments_text, "{}");

        let furthest = (fragments.len() + MAX_INDEX_GAP) as u32;
        merge_tool_call_delta(&mut fragments, &delta(Some(furthest), Some("g"), None));
        assert_eq!(fragments.len(), 2 + MAX_INDEX_GAP);
    }

    #[test]
    fn empty_name_and_id_do_not_overwrite() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(
            &mut fragments,
            &ToolCallDelta {
                index: Some(0),
                id: Some("call_1".into()),
                name: Some("search".into()),
                arguments: Some("{\"q\":".into()),
            },
        );
        merge_tool_call_delta(
            &mut fragments,
            &ToolCallDelta {
                index: Some(0),
                id: Some(String::new()),
                name: Some(String::new()),
                arguments: Some("\"rust\"}".into()),
            },
        );

        assert_eq!(fragments[0].id, "call_1");
        assert_eq!(fragments[0].name, "search");
        assert_eq!(fragments[0].arguments_text, "{\"q\":\"rust\"}");
    }

    #[test]
    fn index_less_new_call_goes_at_current_length() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(&mut fragments, &delta(None, Some("first"), Some("{}")));
        merge_tool_call_delta(&mut fragments, &delta(None, Some("second"), None));
        merge_tool_call_delta(&mut fragments, &delta(None, None, Some("{\"a\":1}")));

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].index, 1);
        assert_eq!(fragments[1].name, "second");
        assert_eq!(fragments[1].arguments_text, "{\"a\":1}");
    }

    #[test]
    fn index_less_delta_with_new_id_opens_call() {
        let mut fragments = Vec::new();
        merge_tool_call_delta(
            &mut fragments,
            &ToolCallDelta {
                index: None,
                id: Some("a".into()),
                name: Some("x".into()),
                arguments: None,
            },
        );
        merge_tool_call_delta(
            &mut fragments,
            &ToolCallDelta {
                index: None,
                id: Some("a".into()),
                name: None,
                arguments: Some("{}".into()),
            },
        );
        merge_tool_call_delta(
            &mut fragments,
            &ToolCallDelta {
                index: None,
                id: Some("b".into()),
                name: Some("y".into()),
                arguments: None,
            },
        );

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].arguments_text, "{}");
        assert_eq!(fragments[1].id, "b");
    }

    #[test]
    fn finalize_synthesizes_ids_and_drops_unnamed_placeholders() {
        let mut message = ConversationMessage::assistant();
        merge_tool_call_delta(&mut message.tool_calls, &delta(Some(1), Some("only"), None));
        finalize_tool_calls(&mut message);

        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].index, 0);
        assert!(message.tool_calls[0].id.starts_with("call_"));
        assert_eq!(message.function_calls.len(), 1);
        assert_eq!(message.function_calls[0].id, message.tool_calls[0].id);
    }

    #[test]
    fn apply_delta_routes_reasoning_separately() {
        let mut message = ConversationMessage::assistant();
        let mut chunks = Vec::new();
        apply_delta(
            &mut message,
            StreamDelta::reasoning("think"),
            &mut |c: StreamChunk| chunks.push(c),
        );
        apply_delta(
            &mut message,
            StreamDelta::text("answer"),
            &mut |c: StreamChunk| chunks.push(c),
        );

        assert_eq!(message.content, "answer");
        assert_eq!(message.reasoning_content.as_deref(), Some("think"));
        assert_eq!(
            chunks,
            vec![
                StreamChunk::Reasoning("think".into()),
                StreamChunk::Text("answer".into())
            ]
        );
    }
}
