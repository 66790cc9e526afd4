use serde_json::Value;

/// Payload fields carrying chunk text, in priority order.
const CHUNK_FIELDS: [&str; 3] = ["content", "data", "stream_chunk"];

/// Reduce a raw streamed tool payload to display text.
///
/// Plain text passes through untouched. JSON objects yield the first present field of
/// `content`, `data`, `stream_chunk`; a string value found there is unwrapped once more,
/// including an optional `data:` prefix. Deeper nesting is returned verbatim.
pub fn normalize_chunk(raw: &str) -> String {
    unwrap_payload(raw, 0)
}

fn unwrap_payload(raw: &str, depth: u8) -> String {
    let trimmed = raw.trim();
    let body = if depth > 0 {
        trimmed
            .strip_prefix("data:")
            .map(str::trim_start)
            .unwrap_or(trimmed)
    } else {
        trimmed
    };

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => {
            for field in CHUNK_FIELDS {
                match map.get(field) {
                    None | Some(Value::Null) => continue,
                    Some(Value::String(inner)) if depth == 0 => {
                        return unwrap_payload(inner, depth + 1);
                    }
                    Some(Value::String(inner)) => return inner.clone(),
                    Some(other) => return other.to_string(),
                }
            }
            body.to_string()
        }
        Ok(Value::String(inner)) if depth == 0 => unwrap_payload(&inner, depth + 1),
        Ok(Value::String(inner)) => inner,
        _ if depth > 0 && body.len() != trimmed.len() => body.to_string(),
        _ => raw.to_string(),
    }
}
