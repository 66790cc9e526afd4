//! Tool event-stream sub-protocol.
//!
//! Each frame carries an `event` of `start`, `data`, `end` or `error` (default `data`) and
//! a JSON `data` payload. A bare `data: [DONE]` is an `end`.

use serde_json::Value;
use tracing::debug;

use crate::sse::SseFrame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStreamFrame {
    Start,
    Data(String),
    End,
    Error(String),
}

impl ToolStreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error(_))
    }
}

/// Interpret one SSE frame. Unknown event names yield `None`.
pub fn interpret_frame(frame: &SseFrame) -> Option<ToolStreamFrame> {
    let data = frame.data.as_deref().unwrap_or("");
    if data.trim() == "[DONE]" {
        return Some(ToolStreamFrame::End);
    }

    match frame.event.as_deref().unwrap_or("data") {
        "start" => Some(ToolStreamFrame::Start),
        "data" => Some(ToolStreamFrame::Data(extract_data_text(data))),
        "end" => Some(ToolStreamFrame::End),
        "error" => Some(ToolStreamFrame::Error(extract_error_message(data))),
        other => {
            debug!(event = other, "ignoring unknown tool stream event");
            None
        }
    }
}

/// Text of a `data` event: structured delta content first, then a legacy `chunk` field,
/// otherwise the raw payload.
fn extract_data_text(data: &str) -> String {
    let Ok(Value::Object(payload)) = serde_json::from_str::<Value>(data) else {
        return data.to_string();
    };

    let delta_content = payload
        .get("delta")
        .and_then(|delta| match delta {
            Value::String(text) => Some(text.as_str()),
            Value::Object(inner) => inner
                .get("content")
                .or_else(|| inner.get("text"))
                .and_then(Value::as_str),
            _ => None,
        })
        .or_else(|| {
            payload
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("delta"))
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
        });

    if let Some(text) = delta_content {
        return text.to_string();
    }
    if let Some(chunk) = payload.get("chunk").and_then(Value::as_str) {
        return chunk.to_string();
    }
    data.to_string()
}

fn extract_error_message(data: &str) -> String {
    let fallback = || {
        if data.trim().is_empty() {
            "tool stream reported an error".to_string()
        } else {
            data.to_string()
        }
    };

    let Ok(payload) = serde_json::from_str::<Value>(data) else {
        return fallback();
    };

    payload
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(fallback)
}
