use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::{ContentPart, ToolOutput};

/// One tool invocation requested by a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Raw argument text exactly as the model produced it.
    #[serde(default)]
    pub arguments_json: String,
}

impl ToolCall {
    #[must_use]
    pub fn new(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Map<String, Value>,
    ) -> Self {
        let arguments_json = Value::Object(arguments.clone()).to_string();
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            arguments,
            arguments_json,
        }
    }

    /// Builds a call from raw argument text.
    ///
    /// Text that is not a JSON object is preserved as `{"raw": <text>}` so the
    /// call is never dropped.
    #[must_use]
    pub fn from_raw(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments_json: impl Into<String>,
    ) -> Self {
        let arguments_json = arguments_json.into();
        Self {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            arguments: parse_arguments(&arguments_json),
            arguments_json,
        }
    }

    #[must_use]
    pub fn argument_str(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(Value::as_str)
    }
}

fn parse_arguments(raw: &str) -> Map<String, Value> {
    if raw.trim().is_empty() {
        return Map::new();
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            map.insert("raw".to_string(), Value::String(raw.to_string()));
            map
        }
    }
}

/// Role-tagged conversation history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
        /// Image data URLs sent alongside the text.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Assistant {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn user_with_image(content: impl Into<String>, image_data_url: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
            images: vec![image_data_url.into()],
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: content.into(),
            tool_calls,
        }
    }

    #[must_use]
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::System { content }
            | Self::User { content, .. }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }
}

/// Appends a tool output to a message log. Tool messages carry text only, so
/// an image part follows as a user message.
pub fn append_tool_output(messages: &mut Vec<ChatMessage>, call: &ToolCall, output: &ToolOutput) {
    for part in output.content_parts() {
        match part {
            ContentPart::Text { text } => {
                messages.push(ChatMessage::tool(&call.tool_call_id, &call.name, text));
            }
            ContentPart::Image { data, mime_type } => {
                messages.push(ChatMessage::user_with_image(
                    format!("Viewer image captured by tool call {}.", call.tool_call_id),
                    format!("data:{mime_type};base64,{data}"),
                ));
            }
        }
    }
}

/// Drops attached images from all but the newest `keep_latest` user messages
/// that carry them. Returns the number of images dropped.
pub fn strip_stale_images(messages: &mut [ChatMessage], keep_latest: usize) -> usize {
    let mut kept = 0;
    let mut dropped = 0;
    for message in messages.iter_mut().rev() {
        let ChatMessage::User { images, .. } = message else {
            continue;
        };
        if images.is_empty() {
            continue;
        }
        if kept < keep_latest {
            kept += 1;
            continue;
        }
        dropped += images.len();
        images.clear();
    }
    dropped
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Assembles streamed tool-call fragments keyed by their logical index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    partials: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn push_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let partial = self.partials.entry(index).or_default();
        if let Some(id) = id.filter(|value| !value.is_empty()) {
            partial.id = id.to_string();
        }
        if let Some(name) = name {
            partial.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            partial.arguments.push_str(arguments);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    /// Finalizes every call in index order. Fragments that never received a
    /// name are dropped.
    #[must_use]
    pub fn finish(self) -> Vec<ToolCall> {
        self.partials
            .into_iter()
            .filter(|(_, partial)| !partial.name.trim().is_empty())
            .map(|(index, partial)| {
                let id = if partial.id.is_empty() {
                    format!("call_{index}")
                } else {
                    partial.id
                };
                ToolCall::from_raw(id, partial.name.trim(), partial.arguments)
            })
            .collect()
    }
}
