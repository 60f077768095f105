//! Backend-neutral contract between the agent runtime and model clients.
//!
//! This crate defines the shared protocol types (transcript events, tool
//! calls, conversation history, turn results), the cancellation token and the
//! error taxonomy. It also defines the two client shapes the runtime drives:
//!
//! - [`ChatCompletionClient`]: one streaming completion per call; the caller
//!   owns the tool loop.
//! - [`ResumableAgentClient`]: a session-resumable agent that loops tools
//!   internally and calls back into an [`AgentToolHost`].
//!
//! Transport details live in the client implementation crates.

mod cancel;
mod client;
mod error;
mod events;
mod message;
mod state;
mod tools;

pub use cancel::{CancelReason, CancelToken};
pub use client::{
    dispatch_tool_call, AgentToolHost, AgentTurnRequest, AgentTurnResult, AssistantTurn,
    ChatCompletionClient, ChatTurnRequest, ClientProfile, HostSink, ResumableAgentClient,
    StreamSink,
};
pub use error::{classify_error, ClientError, ErrorClass};
pub use events::{UiEvent, UiRole};
pub use message::{
    append_tool_output, strip_stale_images, ChatMessage, ToolCall, ToolCallAccumulator,
};
pub use state::{InputMode, ModelInfo, RuntimeState, HISTORY_LIMIT};
pub use tools::{
    decode_data_url_image, viewer_tool_definitions, ContentPart, ToolDefinition, ToolOutput,
    RUN_COMMAND_TOOL, SNAPSHOT_TOOL,
};
