use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use agent_client::{
    CancelToken, ChatMessage, ClientProfile, InputMode, ModelInfo, RuntimeState, UiEvent,
    RUN_COMMAND_TOOL,
};
use serde_json::{json, Map, Value};

use crate::commands::{
    parse_control, AiControl, CliControl, ControlCommand, AI_HELP, CLI_HELP, KILL_SWITCH_SET,
    MISSING_CREDENTIAL, MODEL_USAGE, UNKNOWN_AI_COMMAND,
};
use crate::config::RuntimeConfig;
use crate::credentials::Credentials;
use crate::error::RuntimeError;
use crate::events::UiEventQueue;
use crate::history::ConversationHistory;
use crate::host::{run_on_host, HostContext};
use crate::state_snapshot::{build_viewer_state_summary, RecentToolResults, StateLimits, ViewerStateSummary};
use crate::strategy::TurnStrategy;
use crate::tool_execution::{
    canonicalize_command, execute_command, metadata_payload, normalized_command_key,
    ToolExecutionResult,
};
use crate::{lock_unpoisoned, panic_message, turn};

pub const SYSTEM_PROMPT: &str = "You are an agent that operates a molecular viewer.
You can either:
1) call tools to act in the viewer, or
2) give a final direct answer without tool calls.

Rules:
- Use tool calls when an action or query in the viewer is needed.
- If tool results already answer the user, give a concise final answer and do not call tools.
- Do not use shell commands.
- Prefer the current session state; avoid redundant fetch or load commands.
- capture_viewer_snapshot is internal validation only. The user cannot see the image in chat.
- If you use capture_viewer_snapshot, describe it as internal validation of the viewer state.
- After state-changing commands, use capture_viewer_snapshot to verify the scene shows the requested outcome.
- Do not claim completion before the scene is validated, or explain why validation failed.
- Do not repeat the same setup sentence or intent text step after step.
- If a strategy fails repeatedly, switch approach or ask the user for clarification.
- Do not re-run a successful command in the same request unless you explain why.
- Keep answers concise and practical.
";

const IDLE_POLL: Duration = Duration::from_millis(5);

/// Conversation state guarded by one short-lived lock. Never held across host
/// calls or model I/O.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) input_mode: InputMode,
    pub(crate) history: ConversationHistory,
    pub(crate) session_id: Option<String>,
    pub(crate) recent: RecentToolResults,
    pub(crate) model: String,
    pub(crate) enabled: bool,
    pub(crate) reasoning_visible: bool,
    pub(crate) final_answer_enabled: bool,
}

struct ActiveTurn {
    turn_id: u64,
    cancel: CancelToken,
}

/// State shared between the runtime handle and its turn workers.
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) host: Arc<dyn HostContext>,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) events: UiEventQueue,
    session: Mutex<SessionState>,
    active_turn: Mutex<Option<ActiveTurn>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: UiEvent) {
        self.events.push(event);
    }

    pub(crate) fn session(&self) -> MutexGuard<'_, SessionState> {
        lock_unpoisoned(&self.session)
    }

    pub(crate) fn push_history(&self, message: ChatMessage) {
        self.session().history.push(message);
    }

    pub(crate) fn remember_tool_result(&self, result: &ToolExecutionResult) {
        self.session()
            .recent
            .remember(&result.command, result.ok, result.error.as_deref());
    }

    pub(crate) fn state_limits(&self) -> StateLimits {
        StateLimits {
            max_objects: self.config.state_max_objects,
            max_selections: self.config.state_max_selections,
            ..StateLimits::default()
        }
    }

    /// Summarizes the viewer on the host context.
    pub(crate) fn viewer_state_summary(&self) -> Result<ViewerStateSummary, RuntimeError> {
        let limits = self.state_limits();
        let recent = self.session().recent.latest();
        run_on_host(self.host.as_ref(), move |host| {
            build_viewer_state_summary(host, limits, &recent)
        })
    }

    /// Runs one command on the host context. Host failures become a failed
    /// result.
    pub(crate) fn run_command(&self, command: &str) -> ToolExecutionResult {
        let owned = command.to_string();
        run_on_host(self.host.as_ref(), move |host| execute_command(host, &owned)).unwrap_or_else(
            |error| {
                tracing::error!(target: "mol_agent", command, error = %error, "host command dispatch failed");
                ToolExecutionResult::failure(command, error.to_string())
            },
        )
    }

    fn is_busy(&self) -> bool {
        lock_unpoisoned(&self.active_turn).is_some()
    }
}

/// Clears the active turn when the worker exits, however it exits.
struct BusyGuard {
    shared: Arc<Shared>,
    turn_id: u64,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut active = lock_unpoisoned(&self.shared.active_turn);
        if active.as_ref().map(|turn| turn.turn_id) == Some(self.turn_id) {
            *active = None;
        }
        tracing::info!(target: "mol_agent", turn_id = self.turn_id, "agent turn finished");
    }
}

/// One conversation's agent runtime.
///
/// Input goes in through [`AgentRuntime::submit`]; transcript events come out
/// through [`AgentRuntime::drain_events`]. At most one AI turn runs at a time
/// on its own worker thread.
pub struct AgentRuntime {
    shared: Arc<Shared>,
    strategy: Arc<dyn TurnStrategy>,
    next_turn_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn new(
        config: RuntimeConfig,
        host: Arc<dyn HostContext>,
        strategy: Arc<dyn TurnStrategy>,
        credentials: Arc<Credentials>,
    ) -> Self {
        let enabled = credentials.has_key() && !config.disabled;
        let session = SessionState {
            input_mode: InputMode::Ai,
            history: ConversationHistory::new(),
            session_id: None,
            recent: RecentToolResults::default(),
            model: config.model.clone(),
            enabled,
            reasoning_visible: false,
            final_answer_enabled: config.final_answer_enabled,
        };
        tracing::info!(
            target: "mol_agent",
            enabled,
            backend = strategy.backend().as_str(),
            model = %config.model,
            credential = credentials.status().source.as_str(),
            "runtime initialized"
        );

        Self {
            shared: Arc::new(Shared {
                events: UiEventQueue::new(config.ui_max_events),
                config,
                host,
                credentials,
                session: Mutex::new(session),
                active_turn: Mutex::new(None),
            }),
            strategy,
            next_turn_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn host_context(&self) -> Arc<dyn HostContext> {
        Arc::clone(&self.shared.host)
    }

    #[must_use]
    pub fn profile(&self) -> ClientProfile {
        self.strategy.profile()
    }

    #[must_use]
    pub fn input_mode(&self) -> InputMode {
        self.shared.session().input_mode
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.session().enabled
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.shared.session().model.clone()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.shared.session().session_id.clone()
    }

    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.shared.session().history.to_vec()
    }

    pub fn set_reasoning_visible(&self, visible: bool) {
        self.shared.session().reasoning_visible = visible;
    }

    /// Handles one line of user input. Returns false for blank input.
    pub fn submit(&self, text: &str) -> bool {
        let input = text.trim();
        if input.is_empty() {
            return false;
        }

        let (input_mode, enabled) = {
            let session = self.shared.session();
            (session.input_mode, session.enabled)
        };
        tracing::info!(
            target: "mol_agent",
            input_mode = input_mode.as_str(),
            enabled,
            busy = self.is_busy(),
            "input received"
        );
        self.shared.emit(UiEvent::user(input));

        if let Some(control) = parse_control(input) {
            self.handle_control(control);
            return true;
        }
        if input_mode == InputMode::Cli {
            self.execute_cli_command(input);
            return true;
        }
        if !enabled {
            tracing::warn!(target: "mol_agent", "ai request rejected: disabled");
            self.shared.emit(UiEvent::error(
                "AI disabled. Use /ai on, or /cli to switch to command mode",
            ));
            return true;
        }

        if let Err(error) = self.start_turn(input.to_string()) {
            tracing::error!(target: "mol_agent", error = %error, "failed to start agent turn");
            self.shared
                .emit(UiEvent::error(format!("unexpected error: {error}")));
        }
        true
    }

    /// Cancels the running turn, if any. Returns whether a turn was running.
    pub fn request_cancel(&self) -> bool {
        let busy = match lock_unpoisoned(&self.shared.active_turn).as_ref() {
            Some(turn) => {
                turn.cancel.cancel();
                true
            }
            None => false,
        };
        tracing::info!(target: "mol_agent", busy, "cancel requested");
        if busy {
            self.shared
                .emit(UiEvent::system("cancellation requested..."));
        }
        busy
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// Blocks until the running turn finishes or `timeout` passes. Returns
    /// whether the runtime is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL.min(deadline - now));
        }
        self.join_finished_worker();
        true
    }

    pub fn drain_events(&self, limit: Option<usize>) -> Vec<UiEvent> {
        self.shared.events.drain(limit)
    }

    #[must_use]
    pub fn has_pending_events(&self) -> bool {
        self.shared.events.has_pending_events()
    }

    /// Forgets the conversation, the resumption token and recent tool
    /// results. Returns the token that was dropped.
    ///
    /// The backend keeps its copy of the session so that a stored chat can
    /// resume it later; `/ai clear` releases it.
    pub fn clear_session(&self, emit_notice: bool) -> Option<String> {
        let dropped = {
            let mut session = self.shared.session();
            session.history.clear();
            session.recent.clear();
            session.session_id.take()
        };
        tracing::info!(target: "mol_agent", emit_notice, "session cleared");
        if emit_notice {
            self.shared.emit(UiEvent::system("session memory cleared"));
        }
        dropped
    }

    /// Switches to AI mode and enables AI when a credential is present and
    /// the kill switch is off.
    pub fn ensure_ai_default_mode(&self, emit_notice: bool) -> bool {
        let has_key = self.shared.credentials.has_key();
        let enabled = has_key && !self.shared.config.disabled;
        {
            let mut session = self.shared.session();
            session.input_mode = InputMode::Ai;
            session.enabled = enabled;
        }
        tracing::info!(
            target: "mol_agent",
            enabled,
            has_key,
            disabled = self.shared.config.disabled,
            "ensure default ai mode"
        );
        if emit_notice && enabled {
            self.shared.emit(UiEvent::system("AI enabled"));
        }
        enabled
    }

    #[must_use]
    pub fn export_session_state(&self) -> RuntimeState {
        let session = self.shared.session();
        RuntimeState {
            input_mode: session.input_mode,
            history: session.history.to_vec(),
            backend: self.strategy.backend().as_str().to_string(),
            session_id: session.session_id.clone(),
            model_info: ModelInfo {
                model: session.model.clone(),
                enabled: Some(session.enabled),
                reasoning_visible: Some(session.reasoning_visible),
                final_answer_enabled: Some(session.final_answer_enabled),
            },
        }
        .sanitized()
    }

    /// Restores mode, token and history. With `apply_model`, also restores the
    /// model, the enabled flag and reasoning visibility. A token issued by a
    /// different backend is dropped.
    pub fn import_session_state(&self, state: RuntimeState, apply_model: bool) {
        let state = state.sanitized();
        let backend = self.strategy.backend().as_str();
        let same_backend = state.backend.is_empty() || state.backend == backend;
        let can_enable = self.shared.credentials.has_key() && !self.shared.config.disabled;

        let mut session = self.shared.session();
        session.input_mode = state.input_mode;
        session.session_id = state
            .session_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && same_backend);
        session.history.replace(state.history);

        if apply_model {
            let model = state.model_info.model.trim();
            if !model.is_empty() {
                session.model = model.to_string();
            }
            if let Some(enabled) = state.model_info.enabled {
                session.enabled = enabled && can_enable;
            }
            if let Some(visible) = state.model_info.reasoning_visible {
                session.reasoning_visible = visible;
            }
        }
        tracing::info!(
            target: "mol_agent",
            apply_model,
            input_mode = session.input_mode.as_str(),
            history_len = session.history.len(),
            has_session_id = session.session_id.is_some(),
            imported_backend = %state.backend,
            enabled = session.enabled,
            "session state imported"
        );
    }

    fn handle_control(&self, control: ControlCommand) {
        match control {
            ControlCommand::Ai(AiControl::On) => {
                self.enable_ai();
            }
            ControlCommand::Ai(AiControl::Off) => {
                self.shared.session().enabled = false;
                tracing::info!(target: "mol_agent", "ai disabled via /ai off");
                self.shared.emit(UiEvent::system("AI disabled"));
            }
            ControlCommand::Ai(AiControl::Model(Some(model))) => {
                self.shared.session().model = model.clone();
                tracing::info!(target: "mol_agent", model = %model, "ai model changed");
                self.shared
                    .emit(UiEvent::system(format!("model set to {model}")));
            }
            ControlCommand::Ai(AiControl::Model(None)) => {
                self.shared.emit(UiEvent::error(MODEL_USAGE));
            }
            ControlCommand::Ai(AiControl::Clear) => {
                if let Some(session_id) = self.clear_session(true) {
                    self.strategy.end_session(&session_id);
                }
            }
            ControlCommand::Ai(AiControl::Help) => self.shared.emit(UiEvent::system(AI_HELP)),
            ControlCommand::Ai(AiControl::Unknown(_)) => {
                self.shared.emit(UiEvent::error(UNKNOWN_AI_COMMAND));
            }
            ControlCommand::Cli(CliControl::On) => {
                self.shared.session().input_mode = InputMode::Cli;
                self.shared.emit(UiEvent::system(
                    "CLI mode enabled. Commands are executed directly",
                ));
            }
            ControlCommand::Cli(CliControl::Off) => {
                self.shared.session().input_mode = InputMode::Ai;
                self.shared.emit(UiEvent::system("AI mode enabled"));
            }
            ControlCommand::Cli(CliControl::Help) => self.shared.emit(UiEvent::system(CLI_HELP)),
            ControlCommand::Cli(CliControl::Execute(command)) => {
                self.execute_cli_command(&command);
            }
        }
    }

    fn enable_ai(&self) -> bool {
        let error = if !self.shared.credentials.has_key() {
            Some(MISSING_CREDENTIAL)
        } else if self.shared.config.disabled {
            Some(KILL_SWITCH_SET)
        } else {
            None
        };

        let mut session = self.shared.session();
        if let Some(error) = error {
            session.enabled = false;
            drop(session);
            tracing::error!(target: "mol_agent", reason = error, "failed to enable AI");
            self.shared.emit(UiEvent::error(error));
            return false;
        }
        session.enabled = true;
        session.input_mode = InputMode::Ai;
        let model = session.model.clone();
        drop(session);
        tracing::info!(target: "mol_agent", model = %model, "ai enabled");
        self.shared.emit(UiEvent::system("AI enabled"));
        true
    }

    fn execute_cli_command(&self, command: &str) {
        let (command, note) = canonicalize_command(command);
        if let Some(note) = note {
            self.shared.emit(UiEvent::system(note));
        }
        tracing::info!(target: "mol_agent", command = %command, "executing cli command");
        self.shared
            .push_history(ChatMessage::user(format!("CLI command: {command}")));

        let result = self.shared.run_command(&command);
        tracing::info!(
            target: "mol_agent",
            command = %result.command,
            ok = result.ok,
            feedback_lines = result.feedback_lines.len(),
            "cli command finished"
        );
        self.shared.remember_tool_result(&result);

        let key = normalized_command_key(&command);
        let payload = result.payload();
        let mut metadata = Map::new();
        metadata.insert(
            "tool_call_id".to_string(),
            Value::String(format!("cli:{}", if key.is_empty() { "command" } else { &key })),
        );
        metadata.insert("tool_name".to_string(), json!(RUN_COMMAND_TOOL));
        metadata.insert("tool_args".to_string(), json!({ "command": command }));
        metadata.insert("tool_command".to_string(), json!(command));
        metadata.insert(
            "tool_result_json".to_string(),
            metadata_payload(&payload, self.shared.config.tool_result_max_chars),
        );
        self.shared.emit(UiEvent::tool_result(
            format!("Executed: {command}"),
            result.ok,
            metadata,
        ));
    }

    fn start_turn(&self, prompt: String) -> Result<(), RuntimeError> {
        let mut active = lock_unpoisoned(&self.shared.active_turn);
        if active.is_some() {
            drop(active);
            tracing::warn!(target: "mol_agent", "request skipped because a turn is running");
            self.shared
                .emit(UiEvent::system("request already in progress"));
            return Ok(());
        }
        self.join_finished_worker();

        let turn_id = self.next_turn_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        let name = format!("mol-agent-turn-{turn_id}");
        let shared = Arc::clone(&self.shared);
        let strategy = Arc::clone(&self.strategy);
        let worker_cancel = cancel.clone();
        tracing::info!(
            target: "mol_agent",
            turn_id,
            has_session_id = self.shared.session().session_id.is_some(),
            "starting agent turn"
        );

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let guard = BusyGuard {
                    shared: Arc::clone(&shared),
                    turn_id,
                };
                run_worker(&guard.shared, strategy.as_ref(), &prompt, &worker_cancel);
            })
            .map_err(|source| RuntimeError::spawn(name, source))?;

        *active = Some(ActiveTurn { turn_id, cancel });
        drop(active);
        *lock_unpoisoned(&self.worker) = Some(handle);
        Ok(())
    }

    fn join_finished_worker(&self) {
        let handle = lock_unpoisoned(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        if let Some(turn) = lock_unpoisoned(&self.shared.active_turn).as_ref() {
            turn.cancel.cancel();
        }
    }
}

/// Worker boundary: panics and internal errors become one error event.
fn run_worker(shared: &Shared, strategy: &dyn TurnStrategy, prompt: &str, cancel: &CancelToken) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        turn::run_turn(shared, strategy, prompt, cancel)
    }));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(error)) => error.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };
    tracing::error!(target: "mol_agent", error = %message, "unexpected runtime failure");
    shared.emit(UiEvent::error(format!(
        "unexpected error: {}",
        shared.credentials.scrub(&message)
    )));
}
