//! Turn strategies: the three ways a turn can reach the model.

use std::sync::Arc;

use agent_client::{
    AgentToolHost, AgentTurnRequest, AgentTurnResult, CancelToken, ClientError, ClientProfile,
};
use agent_client_openrouter::{OpenRouterChatClient, OpenRouterClientConfig, SessionAgentClient};

use crate::config::{BackendKind, RuntimeConfig};
use crate::credentials::Credentials;

mod plan;
mod resumable;
mod tool_loop;

pub use plan::PlanStrategy;
pub use resumable::ResumableStrategy;
pub use tool_loop::ToolLoopStrategy;

/// Client id reported when no backend could be built.
pub const UNAVAILABLE_CLIENT_ID: &str = "unavailable";

/// What a strategy may call back into while a turn runs.
pub trait StrategyHost: AgentToolHost {
    /// The same host, seen as the plain tool callback surface.
    fn tool_host(&mut self) -> &mut dyn AgentToolHost;

    /// Emits a user-visible system notice.
    fn notify(&mut self, text: &str);
}

/// One way of turning a prompt into an [`AgentTurnResult`].
pub trait TurnStrategy: Send + Sync {
    fn backend(&self) -> BackendKind;

    fn profile(&self) -> ClientProfile;

    /// Whether the backend remembers earlier turns through the resumption
    /// token. Strategies without memory get the history context in every
    /// prompt.
    fn keeps_session(&self) -> bool {
        false
    }

    fn run(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn StrategyHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult;

    /// Releases whatever the backend holds for a token the runtime dropped.
    fn end_session(&self, _session_id: &str) {}
}

/// Fails every turn with `sdk_unavailable`.
#[derive(Debug, Clone)]
pub struct UnavailableStrategy {
    backend: BackendKind,
    reason: String,
}

impl UnavailableStrategy {
    #[must_use]
    pub fn new(backend: BackendKind, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }
}

impl TurnStrategy for UnavailableStrategy {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn profile(&self) -> ClientProfile {
        ClientProfile {
            client_id: UNAVAILABLE_CLIENT_ID.to_string(),
            model_id: String::new(),
        }
    }

    fn run(
        &self,
        _request: AgentTurnRequest,
        _host: &mut dyn StrategyHost,
        _cancel: &CancelToken,
    ) -> AgentTurnResult {
        AgentTurnResult::failed(&ClientError::unavailable(self.reason.clone()))
    }
}

/// Builds the configured backend over OpenRouter.
///
/// Without a credential, or when the transport cannot be constructed, the
/// result is an [`UnavailableStrategy`] so that turns fail with
/// `sdk_unavailable` instead of the runtime refusing to start.
pub fn build_strategy(config: &RuntimeConfig, credentials: &Credentials) -> Arc<dyn TurnStrategy> {
    let Some(api_key) = credentials.api_key() else {
        return Arc::new(UnavailableStrategy::new(
            config.backend,
            "no model credential is configured",
        ));
    };

    let client_config =
        OpenRouterClientConfig::new(api_key, config.model.clone()).with_base_url(&config.base_url);
    let client = match OpenRouterChatClient::new(client_config) {
        Ok(client) => client,
        Err(error) => {
            let reason = credentials.scrub(error.message());
            tracing::error!(target: "mol_agent", backend = config.backend.as_str(), error = %reason, "model client unavailable");
            return Arc::new(UnavailableStrategy::new(config.backend, reason));
        }
    };

    tracing::info!(target: "mol_agent", backend = config.backend.as_str(), model = %config.model, "model backend ready");
    match config.backend {
        BackendKind::Resumable => Arc::new(ResumableStrategy::new(Arc::new(
            SessionAgentClient::new(client),
        ))),
        BackendKind::ToolLoop => Arc::new(ToolLoopStrategy::new(Arc::new(client))),
        BackendKind::Plan => Arc::new(PlanStrategy::new(
            Arc::new(client),
            config.plan_repair_attempts,
        )),
    }
}
