#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_client::{UiEvent, UiRole};
use agent_client_mock::{ScriptedAgentClient, ScriptedAgentTurn, ScriptedChatClient, ScriptedReply};
use agent_runtime::demo::DemoViewer;
use agent_runtime::strategy::{PlanStrategy, ResumableStrategy, ToolLoopStrategy};
use agent_runtime::{AgentRuntime, Credentials, InlineHostContext, RuntimeConfig, TurnStrategy};

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub runtime: AgentRuntime,
    pub viewer: DemoViewer,
}

impl Harness {
    /// Submits `text`, waits for the turn and returns everything emitted.
    pub fn run(&self, text: &str) -> Vec<UiEvent> {
        assert!(self.runtime.submit(text), "input should be accepted");
        self.wait_and_drain()
    }

    pub fn wait_and_drain(&self) -> Vec<UiEvent> {
        assert!(
            self.runtime.wait_idle(IDLE_TIMEOUT),
            "runtime should become idle"
        );
        self.runtime.drain_events(None)
    }
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig {
        long_tool_warn_sec: -1.0,
        ..RuntimeConfig::default()
    }
}

pub fn harness_with(config: RuntimeConfig, strategy: Arc<dyn TurnStrategy>) -> Harness {
    let viewer = DemoViewer::new().with_objects(["1ubq"]);
    let runtime = AgentRuntime::new(
        config,
        Arc::new(InlineHostContext::new(viewer.clone())),
        strategy,
        Arc::new(Credentials::fixed(Some("sk-or-test-0000"))),
    );
    Harness { runtime, viewer }
}

pub fn resumable(config: RuntimeConfig, turns: Vec<ScriptedAgentTurn>) -> (Harness, Arc<ScriptedAgentClient>) {
    let client = Arc::new(ScriptedAgentClient::new(turns));
    let harness = harness_with(
        config,
        Arc::new(ResumableStrategy::new(Arc::clone(&client) as _)),
    );
    (harness, client)
}

pub fn tool_loop(config: RuntimeConfig, replies: Vec<ScriptedReply>) -> (Harness, Arc<ScriptedChatClient>) {
    let client = Arc::new(ScriptedChatClient::new(replies));
    let harness = harness_with(
        config,
        Arc::new(ToolLoopStrategy::new(Arc::clone(&client) as _)),
    );
    (harness, client)
}

pub fn plan(config: RuntimeConfig, replies: Vec<ScriptedReply>) -> (Harness, Arc<ScriptedChatClient>) {
    let repair_attempts = config.plan_repair_attempts;
    let client = Arc::new(ScriptedChatClient::new(replies));
    let harness = harness_with(
        config,
        Arc::new(PlanStrategy::new(Arc::clone(&client) as _, repair_attempts)),
    );
    (harness, client)
}

pub fn of_role(events: &[UiEvent], role: UiRole) -> Vec<String> {
    events
        .iter()
        .filter(|event| event.role == role)
        .map(|event| event.text.clone())
        .collect()
}

pub fn streamed_text(events: &[UiEvent]) -> String {
    events
        .iter()
        .filter(|event| event.is_stream_chunk())
        .map(|event| event.text.as_str())
        .collect()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
