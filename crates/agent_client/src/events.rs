use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transcript role of one [`UiEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiRole {
    User,
    Ai,
    ToolStart,
    ToolResult,
    System,
    Reasoning,
    Error,
}

impl UiRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Ai => "ai",
            Self::ToolStart => "tool_start",
            Self::ToolResult => "tool_result",
            Self::System => "system",
            Self::Reasoning => "reasoning",
            Self::Error => "error",
        }
    }

    /// Prefix used when the transcript is rendered as plain console lines.
    #[must_use]
    pub fn console_prefix(self) -> &'static str {
        match self {
            Self::User => "USER>",
            Self::Ai => "AI>",
            Self::ToolStart | Self::ToolResult => "TOOL>",
            Self::System => "SYS>",
            Self::Reasoning => "RZN>",
            Self::Error => "ERR>",
        }
    }

    /// Roles dropped first when the event queue is compacted.
    #[must_use]
    pub fn is_low_priority(self) -> bool {
        matches!(self, Self::Reasoning | Self::System)
    }
}

/// One unit of transcript output produced by the runtime.
///
/// This is the only event shape accepted by the runtime queue, the chat store
/// journal and renderers. Persisted JSON is converted back through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiEvent {
    pub role: UiRole,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl UiEvent {
    #[must_use]
    pub fn new(role: UiRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            ok: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(UiRole::User, text)
    }

    #[must_use]
    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(UiRole::Ai, text)
    }

    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(UiRole::System, text)
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self::new(UiRole::Error, text)
    }

    #[must_use]
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::new(UiRole::Reasoning, text)
    }

    /// Partial assistant output forwarded while the model is streaming.
    #[must_use]
    pub fn stream_chunk(text: impl Into<String>) -> Self {
        Self::ai(text).with_metadata("stream_chunk", Value::Bool(true))
    }

    #[must_use]
    pub fn tool_start(text: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            role: UiRole::ToolStart,
            text: text.into(),
            ok: None,
            metadata,
        }
    }

    #[must_use]
    pub fn tool_result(text: impl Into<String>, ok: bool, metadata: Map<String, Value>) -> Self {
        Self {
            role: UiRole::ToolResult,
            text: text.into(),
            ok: Some(ok),
            metadata,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn is_stream_chunk(&self) -> bool {
        self.metadata
            .get("stream_chunk")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn console_line(&self) -> String {
        format!("{} {}", self.role.console_prefix(), self.text)
    }
}
