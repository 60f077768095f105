use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

/// Maximum number of history entries kept in exported runtime state.
pub const HISTORY_LIMIT: usize = 80;

/// How non-control input is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum InputMode {
    #[default]
    Ai,
    Cli,
}

impl InputMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::Cli => "cli",
        }
    }
}

impl From<String> for InputMode {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("cli") {
            Self::Cli
        } else {
            Self::Ai
        }
    }
}

/// Model-facing settings carried with persisted runtime state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub reasoning_visible: Option<bool>,
    #[serde(default)]
    pub final_answer_enabled: Option<bool>,
}

/// Conversation state exported by the runtime and stored in chat manifests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model_info: ModelInfo,
}

impl RuntimeState {
    /// Drops all but the last [`HISTORY_LIMIT`] history entries.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        self.session_id = self
            .session_id
            .filter(|session_id| !session_id.trim().is_empty());
        self
    }
}
