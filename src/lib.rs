//! Natural-language control of a molecular viewer.
//!
//! This crate re-exports the workspace so embedders depend on one package:
//!
//! - [`client`]: the backend-neutral contracts (events, messages, tools,
//!   cancellation, error classes)
//! - [`runtime`]: the agent runtime, host marshalling, strategies and the
//!   chat-session glue
//! - [`store`]: the on-disk chat store
//! - [`openrouter`]: the OpenRouter-backed clients
//! - [`mock`]: scripted clients for tests and offline use
//!
//! The common entry points are also re-exported at the root.

pub use agent_client as client;
pub use agent_client_mock as mock;
pub use agent_client_openrouter as openrouter;
pub use agent_runtime as runtime;
pub use chat_store as store;

pub use agent_client::{
    CancelReason, CancelToken, ChatMessage, ClientError, ErrorClass, InputMode, RuntimeState,
    UiEvent, UiRole,
};
pub use agent_runtime::{
    build_strategy, AgentRuntime, BackendKind, ChatSession, Credentials, HostContext, HostError,
    HostThread, InlineHostContext, RuntimeConfig, RuntimeError, TurnStrategy, ViewerHost,
};
pub use chat_store::{ChatStore, ChatStoreOptions};
