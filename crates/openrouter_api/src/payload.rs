use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Request payload for the chat-completions endpoint.
///
/// `messages` stays as raw JSON so callers can send multimodal content and
/// tool-call history without this crate knowing their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    /// Default: true.
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<FunctionTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl ChatCompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            temperature: None,
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<FunctionTool>) -> Self {
        self.tool_choice = (!tools.is_empty()).then(|| "auto".to_string());
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// `{"type": "function", "function": {...}}` tool declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl FunctionTool {
    pub fn new(name: impl Into<String>, description: Option<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: name.into(),
                description,
                parameters,
            },
        }
    }
}

/// Plain-text or multimodal `content` for a user message. Images are passed
/// through as data URLs.
pub fn build_user_content(text: &str, image_data_urls: &[String]) -> Value {
    if image_data_urls.is_empty() {
        return Value::String(text.to_string());
    }

    let mut parts = vec![json!({"type": "text", "text": text})];
    parts.extend(image_data_urls.iter().map(|url| {
        json!({
            "type": "image_url",
            "image_url": {"url": url},
        })
    }));
    Value::Array(parts)
}

/// Assistant tool-call entry in OpenAI wire shape.
pub fn tool_call_json(id: &str, name: &str, arguments_json: &str) -> Value {
    json!({
        "id": id,
        "type": "function",
        "function": {
            "name": name,
            "arguments": arguments_json,
        },
    })
}
