use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl JsonRpcResponse {
    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// A tool as reported by a backend's `tools/list`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub streaming: bool,
}

/// Read the `tools` array of a `tools/list` result. Entries without a name are skipped.
pub fn parse_tool_list(result: &Value) -> Vec<RemoteTool> {
    let entries = result
        .get("tools")
        .or(Some(result))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    entries
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let input_schema = entry
                .get("inputSchema")
                .or_else(|| entry.get("input_schema"))
                .or_else(|| entry.get("parameters"))
                .cloned()
                .unwrap_or_else(|| serde_json::json!({"type": "object", "properties": {}}));
            let streaming = entry
                .get("streaming")
                .or_else(|| entry.get("annotations").and_then(|a| a.get("streaming")))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            Some(RemoteTool {
                name: name.to_string(),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema,
                streaming,
            })
        })
        .collect()
}

/// Flatten a `tools/call` result into text. `Err` carries the text of a result the
/// backend flagged with `isError`.
pub fn call_result_text(result: Value) -> std::result::Result<String, String> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let text = match &result {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        Value::Object(map) => match map.get("content").and_then(Value::as_array) {
            Some(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            None => result.to_string(),
        },
        other => other.to_string(),
    };

    if is_error { Err(text) } else { Ok(text) }
}
