//! Incremental server-sent-event framing shared by the provider client and the tool
//! streaming sub-protocol.
//!
//! Frames are pulled one at a time so a consumer that sees a terminal event can stop
//! without touching whatever is still buffered.

/// One parsed event: the fields of a blank-line-terminated block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseFrameParser {
    buffer: Vec<u8>,
}

impl SseFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Signal end of input so a trailing unterminated frame becomes available.
    pub fn close(&mut self) {
        if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(b"\n\n");
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Pop the next complete frame. Blocks holding only comments or blank lines are skipped.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        loop {
            let (pos, len) = find_delimiter(&self.buffer)?;
            let block: Vec<u8> = self.buffer.drain(..pos).collect();
            self.buffer.drain(..len);

            let text = String::from_utf8_lossy(&block);
            if let Some(frame) = parse_block(&text) {
                return Some(frame);
            }
        }
    }
}

/// Earliest blank-line delimiter, accepting `\n\n`, `\r\n\r\n` and mixed forms.
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    let mixed = buffer
        .windows(3)
        .position(|w| w == b"\n\r\n")
        .map(|p| (p, 3));

    [lf, crlf, mixed]
        .into_iter()
        .flatten()
        .min_by_key(|(pos, _)| *pos)
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut frame = SseFrame::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut seen_field = false;

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                frame.event = Some(value.to_string());
                seen_field = true;
            }
            "data" => {
                data_lines.push(value);
                seen_field = true;
            }
            "id" => {
                frame.id = Some(value.to_string());
                seen_field = true;
            }
            _ => {}
        }
    }

    if !data_lines.is_empty() {
        frame.data = Some(data_lines.join("\n"));
    }
    seen_field.then_some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frames_split_across_pushes() {
        let mut parser = SseFrameParser::new();
        parser.push(b"event: data\ndata: {\"a\"");
        assert_eq!(parser.next_frame(), None);
        parser.push(b":1}\n\ndata: second\n\n");

        let first = parser.next_frame().unwrap();
        assert_eq!(first.event.as_deref(), Some("data"));
        assert_eq!(first.data.as_deref(), Some("{\"a\":1}"));

        let second = parser.next_frame().unwrap();
        assert_eq!(second.event, None);
        assert_eq!(second.data.as_deref(), Some("second"));
        assert_eq!(parser.next_frame(), None);
    }

    #[test]
    fn handles_crlf_delimiters() {
        let mut parser = SseFrameParser::new();
        parser.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(parser.next_frame().unwrap().data.as_deref(), Some("one"));
        assert_eq!(parser.next_frame().unwrap().data.as_deref(), Some("two"));
    }

    #[test]
    fn skips_comment_only_blocks() {
        let mut parser = SseFrameParser::new();
        parser.push(b": keep-alive\n\ndata: x\n\n");
        assert_eq!(parser.next_frame().unwrap().data.as_deref(), Some("x"));
    }

    #[test]
    fn joins_multiline_data() {
        let mut parser = SseFrameParser::new();
        parser.push(b"data: line one\ndata: line two\n\n");
        assert_eq!(
            parser.next_frame().unwrap().data.as_deref(),
            Some("line one\nline two")
        );
    }

    #[test]
    fn close_flushes_trailing_frame() {
        let mut parser = SseFrameParser::new();
        parser.push(b"data: [DONE]");
        assert_eq!(parser.next_frame(), None);
        parser.close();
        assert_eq!(parser.next_frame().unwrap().data.as_deref(), Some("[DONE]"));
        assert!(!parser.has_buffered());
    }

    #[test]
    fn value_without_space_after_colon() {
        let mut parser = SseFrameParser::new();
        parser.push(b"event:end\ndata:{}\n\n");
        let frame = parser.next_frame().unwrap();
        assert_eq!(frame.event.as_deref(), Some("end"));
        assert_eq!(frame.data.as_deref(), Some("{}"));
    }
}
