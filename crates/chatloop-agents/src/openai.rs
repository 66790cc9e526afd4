use async_trait::async_trait;
use bytes::Bytes;
use chatloop_common::{ConversationMessage, Error, Result, Role};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::providers::{
    LlmProvider, LlmRequest, LlmStream, StreamDelta, ToolDefinition, normalize_tool_call_delta,
};
use crate::sse::SseFrameParser;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat-completions client (OpenAI, vLLM, DeepSeek, llama.cpp servers...).
#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_id(&self) -> &str {
        "openai"
    }

    async fn stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = convert_request(request);

        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "OpenAI API error (status {}): {error_text}",
                status.as_u16()
            )));
        }

        Ok(delta_stream(response.bytes_stream().boxed()))
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        let response = self.authorized(self.client.get(&url)).send().await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(e) => {
                warn!("OpenAI health check failed: {e}");
                Ok(false)
            }
        }
    }
}

fn convert_request(request: &LlmRequest) -> OpenAiRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system_prompt) = &request.system {
        messages.push(OpenAiMessage::System {
            content: system_prompt.clone(),
        });
    }
    messages.extend(request.messages.iter().map(convert_message));

    let tools = if request.tools.is_empty() {
        None
    } else {
        Some(request.tools.iter().map(convert_tool).collect())
    };

    OpenAiRequest {
        model: request.model.clone(),
        messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        tools,
        stream: true,
    }
}

fn convert_tool(tool: &ToolDefinition) -> OpenAiTool {
    OpenAiTool {
        kind: "function".to_string(),
        function: OpenAiFunctionDefinition {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

fn convert_message(msg: &ConversationMessage) -> OpenAiMessage {
    match msg.role {
        Role::System => OpenAiMessage::System {
            content: msg.content.clone(),
        },
        Role::User => OpenAiMessage::User {
            content: msg.content.clone(),
        },
        Role::Assistant => {
            let tool_calls: Vec<OpenAiToolCall> = msg
                .tool_calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: if call.arguments_text.trim().is_empty() {
                            "{}".to_string()
                        } else {
                            call.arguments_text.clone()
                        },
                    },
                })
                .collect();

            OpenAiMessage::Assistant {
                content: if msg.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(msg.content.clone())
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            }
        }
        Role::Tool => OpenAiMessage::Tool {
            tool_call_id: msg.tool_call_id.clone().unwrap_or_default(),
            content: msg.content.clone(),
        },
    }
}

/// Turn a raw SSE byte stream into provider deltas. `[DONE]` ends the stream.
fn delta_stream(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> LlmStream {
    let state = (bytes, SseFrameParser::new(), false);

    let deltas = stream::try_unfold(state, |(mut bytes, mut parser, mut eof)| async move {
        loop {
            if let Some(frame) = parser.next_frame() {
                let Some(data) = frame.data else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    return Ok(None);
                }
                match parse_stream_data(&data) {
                    Ok(Some(delta)) => return Ok(Some((delta, (bytes, parser, eof)))),
                    Ok(None) => continue,
                    Err(e) => return Err(e),
                }
            }

            if eof {
                return Ok(None);
            }

            match bytes.next().await {
                Some(Ok(chunk)) => parser.push(&chunk),
                Some(Err(e)) => {
                    return Err(Error::Provider(format!("OpenAI stream error: {e}")));
                }
                None => {
                    parser.close();
                    eof = true;
                }
            }
        }
    });

    Box::pin(deltas)
}

/// Parse one `data:` payload. Returns `None` for keep-alive or usage-only chunks.
pub(crate) fn parse_stream_data(data: &str) -> Result<Option<StreamDelta>> {
    let json: Value = serde_json::from_str(data)
        .map_err(|e| Error::Provider(format!("invalid stream chunk: {e}, data: {data}")))?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("an error occurred during streaming");
        return Err(Error::Provider(format!("OpenAI stream error: {message}")));
    }

    let chunk: OpenAiStreamChunk = serde_json::from_value(json)
        .map_err(|e| Error::Provider(format!("unexpected stream chunk shape: {e}")))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        debug!("skipping stream chunk without choices");
        return Ok(None);
    };

    let delta = StreamDelta {
        content: choice.delta.content.filter(|c| !c.is_empty()),
        reasoning_content: choice
            .delta
            .reasoning_content
            .filter(|c| !c.is_empty()),
        tool_calls: choice
            .delta
            .tool_calls
            .unwrap_or_default()
            .iter()
            .map(normalize_tool_call_delta)
            .collect(),
        finish_reason: choice.finish_reason,
    };

    if delta == StreamDelta::default() {
        return Ok(None);
    }
    Ok(Some(delta))
}

// Request Types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionCall,
}

#[derive(Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunctionDefinition,
}

#[derive(Serialize)]
struct OpenAiFunctionDefinition {
    name: String,
    description: String,
    parameters: Value,
}

// Stream Response Types
#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OpenAiStreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatloop_common::ToolCallFragment;
    use serde_json::json;

    #[test]
    fn converts_assistant_tool_calls_and_tool_results() {
        let mut assistant = ConversationMessage::assistant();
        assistant.tool_calls.push(ToolCallFragment {
            index: 0,
            id: "call_1".into(),
            name: "weather__get".into(),
            arguments_text: String::new(),
        });
        let request = LlmRequest {
            model: "m".into(),
            messages: vec![
                ConversationMessage::user("hi"),
                assistant,
                ConversationMessage::tool("call_1", "{\"temp\":18}"),
            ],
            system: Some("be brief".into()),
            max_tokens: None,
            temperature: None,
            tools: vec![],
        };

        let body = serde_json::to_value(convert_request(&request)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert!(messages[2]["content"].is_null());
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert!(body.get("tools").is_none());
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn parses_reasoning_and_text_deltas() {
        let delta = parse_stream_data(
            &json!({"choices":[{"delta":{"reasoning_content":"hmm","content":"Hi"}}]})
                .to_string(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(delta.reasoning_content.as_deref(), Some("hmm"));
        assert_eq!(delta.content.as_deref(), Some("Hi"));
    }

    #[test]
    fn parses_index_less_tool_call_delta() {
        let delta = parse_stream_data(
            &json!({"choices":[{"delta":{"tool_calls":[{"index":null,"function":{"name":"foo"}}]}}]})
                .to_string(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(delta.tool_calls[0].index, None);
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("foo"));
    }

    #[test]
    fn usage_only_chunks_are_skipped() {
        let parsed = parse_stream_data(
            &json!({"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":2}}).to_string(),
        )
        .unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn api_error_payload_is_an_error() {
        let err = parse_stream_data(&json!({"error":{"message":"overloaded"}}).to_string())
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_stream_data("{nope").is_err());
    }
}
