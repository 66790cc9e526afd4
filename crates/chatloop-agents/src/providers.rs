use std::pin::Pin;

use async_trait::async_trait;
use chatloop_common::{ConversationMessage, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trait for chat-completion provider integrations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai").
    fn provider_id(&self) -> &str;

    /// Open a streaming completion and return its deltas.
    async fn stream(&self, request: &LlmRequest) -> Result<LlmStream>;

    /// Check if the provider is reachable and configured.
    async fn health_check(&self) -> Result<bool>;
}

pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One incremental piece of an assistant turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamDelta {
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

impl StreamDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning_content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(delta: ToolCallDelta) -> Self {
        Self {
            tool_calls: vec![delta],
            ..Default::default()
        }
    }
}

/// Canonical tool-call delta. `index` is `None` when the provider sent no usable index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Normalize a raw wire tool-call delta into a `ToolCallDelta`.
///
/// Accepts both the nested `function.{name,arguments}` shape and the flat
/// `{name,arguments}` shape. Non-numeric or negative indexes become `None`.
pub fn normalize_tool_call_delta(raw: &Value) -> ToolCallDelta {
    let index = raw
        .get("index")
        .and_then(Value::as_u64)
        .and_then(|i| u32::try_from(i).ok());

    let function = raw.get("function");
    let field = |name: &str| function.and_then(|f| f.get(name)).or_else(|| raw.get(name));

    let name = field("name")
        .and_then(Value::as_str)
        .map(str::to_string);

    let arguments = field("arguments").and_then(|value| match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    });

    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string);

    ToolCallDelta {
        index,
        id,
        name,
        arguments,
    }
}
