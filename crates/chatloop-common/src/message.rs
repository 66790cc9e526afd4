use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// A tool call assembled incrementally from streaming deltas.
///
/// `index` is the stable position of the call inside its assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments_text: String,
}

/// Normalized tool call shape stored alongside persisted assistant turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl From<&ToolCallFragment> for FunctionCall {
    fn from(fragment: &ToolCallFragment) -> Self {
        Self {
            id: fragment.id.clone(),
            name: fragment.name.clone(),
            arguments: fragment.arguments_text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallFragment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning_content: None,
            tool_calls: Vec::new(),
            function_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// An empty assistant turn, ready to be filled by a stream.
    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant, String::new())
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::with_role(Role::Tool, content);
        message.tool_call_id = Some(tool_call_id.into());
        message
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    /// Derive `function_calls` from the accumulated fragments.
    pub fn finalize_function_calls(&mut self) {
        self.function_calls = self.tool_calls.iter().map(FunctionCall::from).collect();
    }
}

/// Outcome of one tool invocation. Tool failures are data, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolExecutionResult {
    pub fn success(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
            error: None,
        }
    }

    /// The error text doubles as content so the model can see what went wrong.
    pub fn failure(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: format!("Error: {error}"),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Content given to a tool call that never received its result, such as one left
/// behind by an aborted run.
pub const UNANSWERED_TOOL_CALL: &str = "Error: tool call did not complete";

/// Make a restored history acceptable to a chat-completions provider.
///
/// Tool messages that do not answer a call of the assistant turn before them are dropped;
/// this covers a history window that starts in the middle of a tool batch. Calls left
/// without a tool message get one carrying [`UNANSWERED_TOOL_CALL`].
pub fn close_unanswered_tool_calls(
    messages: Vec<ConversationMessage>,
) -> Vec<ConversationMessage> {
    let mut repaired = Vec::with_capacity(messages.len());
    let mut open_calls: Vec<String> = Vec::new();

    for message in messages {
        if message.role == Role::Tool {
            let answered = message
                .tool_call_id
                .as_deref()
                .and_then(|id| open_calls.iter().position(|open| open == id));
            if let Some(position) = answered {
                open_calls.remove(position);
                repaired.push(message);
            }
            continue;
        }

        for id in open_calls.drain(..) {
            repaired.push(ConversationMessage::tool(id, UNANSWERED_TOOL_CALL));
        }
        if message.has_tool_calls() {
            open_calls = message.tool_calls.iter().map(|call| call.id.clone()).collect();
        }
        repaired.push(message);
    }

    for id in open_calls {
        repaired.push(ConversationMessage::tool(id, UNANSWERED_TOOL_CALL));
    }
    repaired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            assert_eq!(Role::from_name(role.as_str()), Some(role));
        }
        assert_eq!(Role::from_name("function"), None);
    }

    #[test]
    fn user_factory_sets_role_and_timestamp() {
        let start = Utc::now();
        let message = ConversationMessage::user("What's the weather?");
        let end = Utc::now();

        assert_eq!(message.role, Role::User);
        assert_eq!(message.content, "What's the weather?");
        assert!(message.tool_calls.is_empty());
        assert!(message.created_at >= start && message.created_at <= end);
    }

    #[test]
    fn only_assistant_turns_report_tool_calls() {
        let mut assistant = ConversationMessage::assistant();
        assert!(!assistant.has_tool_calls());

        assistant.tool_calls.push(ToolCallFragment {
            index: 0,
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments_text: "{}".into(),
        });
        assert!(assistant.has_tool_calls());

        let mut tool = ConversationMessage::tool("call_1", "{}");
        tool.tool_calls = assistant.tool_calls.clone();
        assert!(!tool.has_tool_calls());
    }

    #[test]
    fn finalize_derives_function_calls_in_order() {
        let mut message = ConversationMessage::assistant();
        message.tool_calls = vec![
            ToolCallFragment {
                index: 0,
                id: "a".into(),
                name: "first".into(),
                arguments_text: "{\"x\":1}".into(),
            },
            ToolCallFragment {
                index: 1,
                id: "b".into(),
                name: "second".into(),
                arguments_text: String::new(),
            },
        ];
        message.finalize_function_calls();

        assert_eq!(message.function_calls.len(), 2);
        assert_eq!(message.function_calls[0].name, "first");
        assert_eq!(message.function_calls[0].arguments, "{\"x\":1}");
        assert_eq!(message.function_calls[1].id, "b");
    }

    #[test]
    fn failure_result_exposes_error_as_content() {
        let result = ToolExecutionResult::failure("call_1", "weather__get", "timed out");
        assert!(result.is_error());
        assert_eq!(result.content, "Error: timed out");
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Tool).unwrap(), "\"tool\"");
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

    fn roles_and_ids(messages: &[ConversationMessage]) -> Vec<(Role, Option<&str>)> {
        messages
            .iter()
            .map(|m| (m.role, m.tool_call_id.as_deref()))
            .collect()
    }

    #[test]
    fn aborted_batch_gets_closing_tool_messages() {
        let history = vec![
            ConversationMessage::user("weather in Paris and Rome?"),
            tool_turn(&["call_a", "call_b"]),
            ConversationMessage::tool("call_a", "18C"),
            ConversationMessage::user("never mind"),
        ];

        let repaired = close_unanswered_tool_calls(history);

        assert_eq!(
            roles_and_ids(&repaired),
            vec![
                (Role::User, None),
                (Role::Assistant, None),
                (Role::Tool, Some("call_a")),
                (Role::Tool, Some("call_b")),
                (Role::User, None),
            ]
        );
        assert_eq!(repaired[3].content, UNANSWERED_TOOL_CALL);
    }

    #[test]
    fn trailing_tool_turn_is_closed() {
        let repaired = close_unanswered_tool_calls(vec![tool_turn(&["call_a", "call_b"])]);

        assert_eq!(repaired.len(), 3);
        assert_eq!(repaired[1].tool_call_id.as_deref(), Some("call_a"));
        assert_eq!(repaired[2].tool_call_id.as_deref(), Some("call_b"));
    }

    #[test]
    fn orphan_tool_messages_are_dropped() {
        let history = vec![
            ConversationMessage::tool("call_old", "cut off by the history window"),
            ConversationMessage::assistant_text("It is sunny."),
            ConversationMessage::user("thanks"),
            ConversationMessage::tool("call_unknown", "stray"),
        ];

        let repaired = close_unanswered_tool_calls(history);

        assert_eq!(
            roles_and_ids(&repaired),
            vec![(Role::Assistant, None), (Role::User, None)]
        );
    }

    #[test]
    fn complete_history_is_unchanged() {
        let history = vec![
            ConversationMessage::user("weather?"),
            tool_turn(&["call_a"]),
            ConversationMessage::tool("call_a", "18C"),
            ConversationMessage::assistant_text("18C in Paris."),
        ];

        let repaired = close_unanswered_tool_calls(history.clone());

        assert_eq!(roles_and_ids(&repaired), roles_and_ids(&history));
    }
}
