use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};

/// Tool that executes one host viewer command.
pub const RUN_COMMAND_TOOL: &str = "run_viewer_command";
/// Read-only validation tool that captures viewer state and an image.
pub const SNAPSHOT_TOOL: &str = "capture_viewer_snapshot";

/// Generic tool definition exposed to a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// The fixed tool vocabulary offered to every model.
#[must_use]
pub fn viewer_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: RUN_COMMAND_TOOL.to_string(),
            description: Some(
                "Execute exactly one viewer command in the current session.".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "rationale": { "type": "string" }
                },
                "required": ["command"]
            }),
        },
        ToolDefinition {
            name: SNAPSHOT_TOOL.to_string(),
            description: Some(
                "Internal validation only: capture the current viewer image and state summary. \
                 The user cannot see this image."
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "purpose": { "type": "string" }
                }
            }),
        },
    ]
}

/// Result of one host tool call as handed back to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub payload: Value,
    pub image_data_url: Option<String>,
}

impl ToolOutput {
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            image_data_url: None,
        }
    }

    #[must_use]
    pub fn with_image(mut self, image_data_url: Option<String>) -> Self {
        self.image_data_url = image_data_url;
        self
    }

    /// Failure payload for a tool the host does not implement.
    #[must_use]
    pub fn unsupported(tool_name: &str) -> Self {
        Self::new(json!({
            "ok": false,
            "error": format!("unsupported_tool: {tool_name}"),
        }))
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.payload
            .get("ok")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Serialized payload text sent back to the model.
    #[must_use]
    pub fn text(&self) -> String {
        self.payload.to_string()
    }

    /// Multimodal representation: the JSON text first, then the image when it
    /// decodes as a base64 data URL.
    #[must_use]
    pub fn content_parts(&self) -> Vec<ContentPart> {
        let mut parts = vec![ContentPart::Text { text: self.text() }];
        if let Some((data, mime_type)) = self
            .image_data_url
            .as_deref()
            .and_then(decode_data_url_image)
        {
            parts.push(ContentPart::Image { data, mime_type });
        }
        parts
    }
}

/// One content part of a multimodal tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

/// Splits `data:<mime>;base64,<payload>` into payload and mime type.
#[must_use]
pub fn decode_data_url_image(data_url: &str) -> Option<(String, String)> {
    let rest = data_url.trim().strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    if data.is_empty() || general_purpose::STANDARD.decode(data).is_err() {
        return None;
    }

    let mime_type = if mime_type.is_empty() {
        "image/png"
    } else {
        mime_type
    };
    Some((data.to_string(), mime_type.to_string()))
}
