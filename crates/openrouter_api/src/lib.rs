//! Transport-only OpenRouter chat-completions client primitives.
//!
//! This crate owns request building, SSE chunk parsing, retry and
//! cancellation for the OpenAI-compatible `/chat/completions` endpoint. It has
//! no knowledge of agent turns, tool execution or conversation history.
//!
//! Streamed tool-call fragments are surfaced as
//! [`ChatStreamEvent::ToolCallDelta`] and left for the caller to assemble.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;
pub mod url;

pub use client::{CancellationSignal, OpenRouterClient, StreamResult};
pub use reqwest::StatusCode;
pub use config::OpenRouterConfig;
pub use error::OpenRouterError;
pub use events::ChatStreamEvent;
pub use payload::{ChatCompletionRequest, FunctionTool};
pub use sse::SseStreamParser;
pub use url::{normalize_chat_completions_url, DEFAULT_OPENROUTER_BASE_URL};
