use std::sync::Arc;

use agent_client::{AgentTurnRequest, AgentTurnResult, CancelToken, ClientProfile, ResumableAgentClient};

use super::{StrategyHost, TurnStrategy};
use crate::config::BackendKind;

/// Delegates the whole turn to a session-resumable agent.
pub struct ResumableStrategy {
    client: Arc<dyn ResumableAgentClient>,
}

impl ResumableStrategy {
    #[must_use]
    pub fn new(client: Arc<dyn ResumableAgentClient>) -> Self {
        Self { client }
    }
}

impl TurnStrategy for ResumableStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::Resumable
    }

    fn profile(&self) -> ClientProfile {
        self.client.profile()
    }

    fn keeps_session(&self) -> bool {
        true
    }

    fn run(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn StrategyHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult {
        self.client.run_turn(request, host.tool_host(), cancel)
    }

    fn end_session(&self, session_id: &str) {
        self.client.end_session(session_id);
    }
}
