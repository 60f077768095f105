use std::path::PathBuf;

use agent_client::{RuntimeState, UiEvent};
use serde::{Deserialize, Serialize};

/// Outcome of the most recent host document save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveStatus {
    #[serde(default)]
    pub last_pse_save_ok: Option<bool>,
    #[serde(default)]
    pub last_pse_save_at: Option<String>,
    #[serde(default)]
    pub last_pse_error: Option<String>,
}

impl Default for SaveStatus {
    fn default() -> Self {
        Self {
            last_pse_save_ok: Some(true),
            last_pse_save_at: None,
            last_pse_error: None,
        }
    }
}

/// `manifest.json` contents for one chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatManifest {
    pub chat_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub last_opened_at: String,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub has_session_pse: bool,
    #[serde(default)]
    pub session_pse_path: String,
    #[serde(default)]
    pub runtime_state: RuntimeState,
    #[serde(default)]
    pub save_status: SaveStatus,
}

impl ChatManifest {
    #[must_use]
    pub fn is_draft(&self) -> bool {
        self.message_count == 0
    }
}

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(default)]
    pub ts: String,
    #[serde(flatten)]
    pub event: UiEvent,
}

/// One line of `index.jsonl`. Tombstones carry only `chat_id`, `deleted` and
/// `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRow {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub preview: String,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub has_session_pse: bool,
    #[serde(default)]
    pub last_pse_save_ok: Option<bool>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

impl IndexRow {
    #[must_use]
    pub fn from_manifest(manifest: &ChatManifest) -> Self {
        Self {
            chat_id: manifest.chat_id.clone(),
            title: manifest.title.clone(),
            updated_at: manifest.updated_at.clone(),
            preview: manifest.preview.clone(),
            message_count: manifest.message_count,
            has_session_pse: manifest.has_session_pse,
            last_pse_save_ok: manifest.save_status.last_pse_save_ok,
            deleted: false,
        }
    }

    #[must_use]
    pub fn tombstone(chat_id: impl Into<String>, updated_at: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            title: String::new(),
            updated_at: updated_at.into(),
            preview: String::new(),
            message_count: 0,
            has_session_pse: false,
            last_pse_save_ok: None,
            deleted: true,
        }
    }

    /// Drafts never appear in listings.
    #[must_use]
    pub fn is_listed(&self) -> bool {
        !self.deleted && self.message_count > 0
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A chat read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedChat {
    pub manifest: ChatManifest,
    pub events: Vec<EventRecord>,
    pub has_session_file: bool,
    pub session_path: PathBuf,
}

impl LoadedChat {
    #[must_use]
    pub fn chat_id(&self) -> &str {
        &self.manifest.chat_id
    }
}

#[cfg(test)]
mod tests {
    use agent_client::{InputMode, UiEvent, UiRole};
    use serde_json::json;

    use super::{ChatManifest, EventRecord, IndexRow};

    #[test]
    fn event_records_flatten_the_ui_event() {
        let record = EventRecord {
            ts: "2026-01-01T00:00:00Z".to_string(),
            event: UiEvent::user("zoom in"),
        };

        let value = serde_json::to_value(&record).expect("serialize record");
        assert_eq!(value["ts"], "2026-01-01T00:00:00Z");
        assert_eq!(value["role"], "user");
        assert_eq!(value["text"], "zoom in");

        let parsed: EventRecord = serde_json::from_value(value).expect("parse record");
        assert_eq!(parsed.event.role, UiRole::User);
    }

    #[test]
    fn tombstones_serialize_compactly() {
        let row = IndexRow::tombstone("chat-1", "2026-01-01T00:00:00Z");
        let value = serde_json::to_value(&row).expect("serialize tombstone");
        assert_eq!(value["deleted"], true);
        assert!(value.get("title").is_none());
        assert!(!row.is_listed());
    }

    #[test]
    fn sparse_manifest_uses_defaults() {
        let manifest: ChatManifest = serde_json::from_value(json!({
            "chat_id": "chat-1",
            "runtime_state": {"input_mode": "cli", "model_info": {}}
        }))
        .expect("sparse manifest should parse");

        assert!(manifest.is_draft());
        assert_eq!(manifest.runtime_state.input_mode, InputMode::Cli);
        assert_eq!(manifest.save_status.last_pse_save_ok, Some(true));
    }
}
