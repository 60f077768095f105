use serde_json::Value;

use crate::error::{code_text, OpenRouterError};
use crate::events::ChatStreamEvent;

/// Incremental parser for chat-completions SSE streams.
///
/// Bytes are buffered until a blank line closes a frame, so a multibyte
/// character split across network chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
    max_buffer_size: Option<usize>,
}

impl SseStreamParser {
    /// Parser that fails once an unterminated frame grows past `limit` bytes.
    #[must_use]
    pub fn with_max_buffer_size(limit: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size: limit.filter(|limit| *limit > 0),
        }
    }

    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChatStreamEvent>, OpenRouterError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some((end, separator)) = find_frame_end(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..end + separator).take(end).collect();
            let frame = match String::from_utf8(frame) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::debug!(error = %error, "skipping SSE frame with invalid UTF-8");
                    continue;
                }
            };

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                continue;
            }

            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => events.extend(map_chunk(&value)),
                Err(error) => {
                    tracing::debug!(error = %error, "skipping unparseable SSE payload");
                }
            }
        }

        if let Some(limit) = self.max_buffer_size {
            if self.buffer.len() > limit {
                let buffered = self.buffer.len();
                self.buffer.clear();
                return Err(OpenRouterError::BufferOverflow { limit, buffered });
            }
        }

        Ok(events)
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<ChatStreamEvent> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes()).unwrap_or_default()
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

/// Position and length of the first blank-line separator, `\n\n` or
/// `\r\n\r\n`.
fn find_frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|window| window == b"\n\n");
    let crlf = buffer.windows(4).position(|window| window == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(lf), Some(crlf)) if crlf < lf => Some((crlf, 4)),
        (Some(lf), _) => Some((lf, 2)),
        (None, Some(crlf)) => Some((crlf, 4)),
        (None, None) => None,
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn map_chunk(value: &Value) -> Vec<ChatStreamEvent> {
    if let Some(error) = value.get("error") {
        return vec![ChatStreamEvent::Error {
            code: code_text(error.get("code")),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .map(ToString::to_string),
        }];
    }

    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    if let Some(delta) = choice.get("delta") {
        let reasoning = delta
            .get("reasoning")
            .or_else(|| delta.get("reasoning_content"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !reasoning.is_empty() {
            events.push(ChatStreamEvent::ReasoningDelta {
                delta: reasoning.to_string(),
            });
        }

        let text = content_text(delta.get("content"));
        if !text.is_empty() {
            events.push(ChatStreamEvent::TextDelta { delta: text });
        }

        for (position, call) in delta
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            let index = call
                .get("index")
                .and_then(Value::as_u64)
                .and_then(|index| usize::try_from(index).ok())
                .unwrap_or(position);
            let function = call.get("function");
            events.push(ChatStreamEvent::ToolCallDelta {
                index,
                id: string_field(call.get("id")),
                name: string_field(function.and_then(|function| function.get("name"))),
                arguments: string_field(function.and_then(|function| function.get("arguments"))),
            });
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        events.push(ChatStreamEvent::Finished {
            reason: Some(reason.to_string()),
        });
    }

    events
}

/// `content` is either a string or a list of `{text}` parts.
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::SseStreamParser;
    use crate::events::ChatStreamEvent;

    #[test]
    fn parse_sse_frames_incrementally() {
        let mut parser = SseStreamParser::default();
        let mut events = Vec::new();

        events.extend(
            parser
                .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")
                .expect("feed"),
        );
        assert!(events.is_empty());
        events.extend(
            parser
                .feed(b"lo\"}}]}\n\n: OPENROUTER PROCESSING\n\n")
                .expect("feed"),
        );
        assert_eq!(
            events,
            vec![ChatStreamEvent::TextDelta {
                delta: "Hello".to_string()
            }]
        );

        events.extend(parser.feed(b"data: [DONE]\n\n").expect("feed"));
        assert_eq!(events.len(), 1);
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn crlf_framing_is_accepted() {
        let events = SseStreamParser::parse_frames(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\r\n\r\n",
        );
        assert_eq!(
            events,
            vec![ChatStreamEvent::Finished {
                reason: Some("stop".to_string())
            }]
        );
    }
}
