//! Conversational agent runtime for a molecular viewer.
//!
//! ## Bootstrap
//!
//! [`AgentRuntime::new`] takes an explicit [`RuntimeConfig`], a
//! [`HostContext`] that owns the viewer, a [`TurnStrategy`] and the layered
//! [`Credentials`]. There is no global runtime: each conversation owner
//! builds its own.
//!
//! Configuration comes from `MOL_AGENT_*` environment variables through
//! [`RuntimeConfig::from_env`]. The backend is chosen with
//! `MOL_AGENT_BACKEND`:
//!
//! - `resumable` (default): a session-resumable agent that loops tools itself
//! - `tool_loop`: the runtime drives tool calls over single completions
//! - `plan`: the model proposes a `<PLAN_JSON>` command plan that is checked
//!   against the safety policy before it runs
//!
//! ## Threading contract
//!
//! One worker thread runs each turn. Viewer calls never run on the worker
//! directly; they are marshalled through [`HostContext::dispatch`]. The event
//! queue is drained by the presentation layer, or by [`ChatSession::pump`]
//! when a chat store is attached.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod demo;
pub mod doom_loop;
pub mod error;
pub mod events;
pub mod history;
pub mod host;
pub mod plan;
pub mod runtime;
pub mod session;
pub mod state_snapshot;
pub mod strategy;
pub mod tool_execution;
mod turn;
pub mod vision;

use std::any::Any;
use std::sync::{Mutex, MutexGuard};

pub use config::{BackendKind, RuntimeConfig};
pub use credentials::Credentials;
pub use error::{HostError, RuntimeError};
pub use host::{HostContext, HostThread, InlineHostContext, ViewerHost};
pub use runtime::{AgentRuntime, SYSTEM_PROMPT};
pub use session::ChatSession;
pub use strategy::{build_strategy, TurnStrategy};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic without message".to_string()
    }
}
