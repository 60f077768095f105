use serde_json::{Map, Value};

use crate::cancel::CancelToken;
use crate::error::{ClientError, ErrorClass};
use crate::message::{ChatMessage, ToolCall};
use crate::tools::{ToolDefinition, ToolOutput, RUN_COMMAND_TOOL, SNAPSHOT_TOOL};

/// Immutable metadata describing a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub client_id: String,
    pub model_id: String,
}

/// Receives streamed model output as it arrives.
pub trait StreamSink {
    fn on_text_chunk(&mut self, chunk: &str);
    fn on_reasoning_chunk(&mut self, chunk: &str);
}

/// Host-side tool implementations supplied to a resumable agent turn.
///
/// Calls are synchronous and serial from the client's perspective.
pub trait AgentToolHost: StreamSink {
    fn run_command_tool(&mut self, tool_call_id: &str, arguments: &Map<String, Value>)
        -> ToolOutput;

    fn snapshot_tool(&mut self, tool_call_id: &str, arguments: &Map<String, Value>) -> ToolOutput;

    /// Called for tool names outside the fixed vocabulary.
    fn unsupported_tool(&mut self, call: &ToolCall) -> ToolOutput {
        ToolOutput::unsupported(&call.name)
    }
}

/// Routes a model tool call to the matching host callback.
pub fn dispatch_tool_call(host: &mut dyn AgentToolHost, call: &ToolCall) -> ToolOutput {
    match call.name.as_str() {
        RUN_COMMAND_TOOL => host.run_command_tool(&call.tool_call_id, &call.arguments),
        SNAPSHOT_TOOL => host.snapshot_tool(&call.tool_call_id, &call.arguments),
        _ => host.unsupported_tool(call),
    }
}

/// Forwards streamed chunks from a tool host into a plain sink.
pub struct HostSink<'a> {
    host: &'a mut dyn AgentToolHost,
}

impl<'a> HostSink<'a> {
    pub fn new(host: &'a mut dyn AgentToolHost) -> Self {
        Self { host }
    }
}

impl StreamSink for HostSink<'_> {
    fn on_text_chunk(&mut self, chunk: &str) {
        self.host.on_text_chunk(chunk);
    }

    fn on_reasoning_chunk(&mut self, chunk: &str) {
        self.host.on_reasoning_chunk(chunk);
    }
}

/// Input for one streaming chat-completion turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurnRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Largest unterminated stream frame the transport may buffer.
    pub max_buffer_size: Option<usize>,
}

/// Fully assembled output of one streaming chat-completion turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub assistant_text: String,
    pub reasoning: String,
    pub tool_calls: Vec<ToolCall>,
}

/// Single-shot streaming chat completion whose tool loop is owned by the caller.
pub trait ChatCompletionClient: Send + Sync + 'static {
    fn profile(&self) -> ClientProfile;

    /// Streams one assistant turn. Text and reasoning deltas reach `sink` as
    /// they arrive; tool-call deltas are assembled before returning.
    fn stream_assistant_turn(
        &self,
        request: ChatTurnRequest,
        sink: &mut dyn StreamSink,
        cancel: &CancelToken,
    ) -> Result<AssistantTurn, ClientError>;
}

/// Input for one resumable multi-step agent turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTurnRequest {
    pub prompt: String,
    pub model: String,
    pub system_prompt: String,
    pub max_turns: usize,
    pub resume_session_id: Option<String>,
    pub max_buffer_size: Option<usize>,
}

/// Outcome of one full agent request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTurnResult {
    pub assistant_text: String,
    pub session_id: Option<String>,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub interrupted: bool,
    pub num_turns: usize,
}

impl AgentTurnResult {
    #[must_use]
    pub fn failed(error: &ClientError) -> Self {
        Self {
            error: Some(error.message().to_string()),
            error_class: Some(error.class()),
            interrupted: error.class() == ErrorClass::Cancelled,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Session-resumable agent that runs its own internal tool loop.
pub trait ResumableAgentClient: Send + Sync + 'static {
    fn profile(&self) -> ClientProfile;

    /// Runs one user request to completion, invoking `host` whenever the model
    /// calls a tool. Hard failures are reported through the result, never
    /// panics.
    fn run_turn(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn AgentToolHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult;

    /// The caller will not resume `session_id` again.
    fn end_session(&self, _session_id: &str) {}
}
