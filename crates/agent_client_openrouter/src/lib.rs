//! OpenRouter-backed implementation of the `agent_client` contracts.
//!
//! [`OpenRouterChatClient`] adapts `openrouter_api` streaming to the
//! single-turn [`ChatCompletionClient`] shape. [`SessionAgentClient`] layers a
//! session-resumable tool loop over any such client.

mod session;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_client::{
    AssistantTurn, CancelToken, ChatCompletionClient, ChatMessage, ChatTurnRequest, ClientError,
    ClientProfile, StreamSink, ToolCallAccumulator, ToolDefinition,
};
use openrouter_api::payload::{build_user_content, tool_call_json};
use openrouter_api::{
    CancellationSignal, ChatCompletionRequest, ChatStreamEvent, FunctionTool, OpenRouterClient,
    OpenRouterConfig, OpenRouterError,
};
use serde_json::{json, Value};

pub use session::{SessionAgentClient, DEFAULT_MAX_SESSIONS, SESSION_ID_PREFIX};

/// Stable client identifier used in profiles and runtime state.
pub const OPENROUTER_CLIENT_ID: &str = "openrouter";

/// Model used when the configured id is blank.
pub const DEFAULT_OPENROUTER_MODEL: &str = "anthropic/claude-sonnet-4";

/// Runtime configuration for the OpenRouter client.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRouterClientConfig {
    pub api_key: String,
    pub model_id: String,
    pub base_url: Option<String>,
    pub app_title: Option<String>,
    pub timeout: Option<Duration>,
    pub temperature: Option<f64>,
}

impl OpenRouterClientConfig {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: None,
            app_title: None,
            timeout: None,
            temperature: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_app_title(mut self, app_title: impl Into<String>) -> Self {
        self.app_title = Some(app_title.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    fn into_openrouter_config(self) -> OpenRouterConfig {
        let mut config = OpenRouterConfig::new(self.api_key);

        if let Some(base_url) = self.base_url.filter(|url| !url.trim().is_empty()) {
            config = config.with_base_url(base_url);
        }

        if let Some(app_title) = self.app_title {
            config = config.with_app_title(app_title);
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        if self.temperature.is_some() {
            config = config.with_default_temperature(self.temperature);
        }

        config
    }
}

trait StreamClient: Send + Sync {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        max_buffer_size: Option<usize>,
        cancel: &CancellationSignal,
        on_event: &mut dyn FnMut(ChatStreamEvent),
    ) -> Result<Option<String>, OpenRouterError>;
}

#[derive(Debug)]
struct DefaultStreamClient {
    client: OpenRouterClient,
}

impl StreamClient for DefaultStreamClient {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        max_buffer_size: Option<usize>,
        cancel: &CancellationSignal,
        on_event: &mut dyn FnMut(ChatStreamEvent),
    ) -> Result<Option<String>, OpenRouterError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| OpenRouterError::StreamFailed {
                code: None,
                message: format!("failed to initialize tokio runtime: {error}"),
            })?;

        runtime.block_on(self.client.stream_with_buffer_limit(
            request,
            max_buffer_size,
            Some(cancel),
            |event| on_event(event),
        ))
    }
}

/// `ChatCompletionClient` backed by the OpenRouter chat-completions API.
pub struct OpenRouterChatClient {
    model_id: String,
    stream_client: Arc<dyn StreamClient>,
    last_finish_reason: Mutex<Option<String>>,
}

impl OpenRouterChatClient {
    /// Creates a client using real HTTP transport.
    pub fn new(config: OpenRouterClientConfig) -> Result<Self, ClientError> {
        let model_id = sanitize_model_id(&config.model_id);
        let client =
            OpenRouterClient::new(config.into_openrouter_config()).map_err(map_init_error)?;

        Ok(Self {
            model_id,
            stream_client: Arc::new(DefaultStreamClient { client }),
            last_finish_reason: Mutex::new(None),
        })
    }

    /// Finish reason reported by the most recent completed stream.
    #[must_use]
    pub fn last_finish_reason(&self) -> Option<String> {
        lock_unpoisoned(&self.last_finish_reason).clone()
    }

    fn build_request(&self, request: &ChatTurnRequest) -> ChatCompletionRequest {
        let model = if request.model.trim().is_empty() {
            self.model_id.clone()
        } else {
            request.model.trim().to_string()
        };
        let messages = request.messages.iter().map(message_json).collect();
        let tools = request.tools.iter().map(function_tool).collect();
        ChatCompletionRequest::new(model, messages).with_tools(tools)
    }

    #[cfg(test)]
    fn with_stream_client_for_tests(model_id: &str, stream_client: Arc<dyn StreamClient>) -> Self {
        Self {
            model_id: sanitize_model_id(model_id),
            stream_client,
            last_finish_reason: Mutex::new(None),
        }
    }
}

impl ChatCompletionClient for OpenRouterChatClient {
    fn profile(&self) -> ClientProfile {
        ClientProfile {
            client_id: OPENROUTER_CLIENT_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn stream_assistant_turn(
        &self,
        request: ChatTurnRequest,
        sink: &mut dyn StreamSink,
        cancel: &CancelToken,
    ) -> Result<AssistantTurn, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled());
        }

        let payload = self.build_request(&request);
        tracing::debug!(
            model = %payload.model,
            messages = payload.messages.len(),
            tools = payload.tools.len(),
            "starting chat completion stream"
        );

        let mut turn = AssistantTurn::default();
        let mut accumulator = ToolCallAccumulator::default();
        let signal = cancel.signal();

        let max_buffer_size = request.max_buffer_size;
        let mut on_event = |event: ChatStreamEvent| match event {
            ChatStreamEvent::TextDelta { delta } if !delta.is_empty() => {
                sink.on_text_chunk(&delta);
                turn.assistant_text.push_str(&delta);
            }
            ChatStreamEvent::ReasoningDelta { delta } if !delta.is_empty() => {
                sink.on_reasoning_chunk(&delta);
                turn.reasoning.push_str(&delta);
            }
            ChatStreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => accumulator.push_delta(
                index,
                id.as_deref(),
                name.as_deref(),
                arguments.as_deref(),
            ),
            _ => {}
        };
        let outcome = self
            .stream_client
            .stream(&payload, max_buffer_size, &signal, &mut on_event);

        match outcome {
            Ok(finish_reason) => {
                *lock_unpoisoned(&self.last_finish_reason) = finish_reason;
                turn.tool_calls = accumulator.finish();
                Ok(turn)
            }
            Err(OpenRouterError::Cancelled) => Err(ClientError::cancelled()),
            Err(error) => {
                tracing::warn!(error = %error, "chat completion stream failed");
                Err(ClientError::new(format!("OpenRouter request failed: {error}")))
            }
        }
    }
}

/// Converts one history entry to the chat-completions wire shape.
fn message_json(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content, images } => json!({
            "role": "user",
            "content": build_user_content(content, images),
        }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                value["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|call| tool_call_json(&call.tool_call_id, &call.name, &call.arguments_json))
                        .collect(),
                );
            }
            value
        }
        ChatMessage::Tool {
            tool_call_id,
            name,
            content,
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "name": name,
            "content": content,
        }),
    }
}

fn function_tool(tool: &ToolDefinition) -> FunctionTool {
    FunctionTool::new(
        tool.name.clone(),
        tool.description.clone(),
        tool.input_schema.clone(),
    )
}

fn sanitize_model_id(model_id: &str) -> String {
    let trimmed = model_id.trim();
    if trimmed.is_empty() {
        DEFAULT_OPENROUTER_MODEL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn map_init_error(error: OpenRouterError) -> ClientError {
    ClientError::unavailable(format!("Failed to initialize openrouter client: {error}"))
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
