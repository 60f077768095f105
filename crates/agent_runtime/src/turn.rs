use std::time::{Duration, Instant};

use agent_client::{
    AgentToolHost, AgentTurnRequest, AgentTurnResult, CancelReason, CancelToken, ChatMessage,
    ErrorClass, StreamSink, ToolCall, ToolOutput, UiEvent, RUN_COMMAND_TOOL, SNAPSHOT_TOOL,
};
use serde_json::{json, Map, Value};

use crate::doom_loop::{LoopGuard, Verdict};
use crate::error::RuntimeError;
use crate::host::run_on_host;
use crate::runtime::{Shared, SYSTEM_PROMPT};
use crate::state_snapshot::build_viewer_state_summary;
use crate::strategy::{StrategyHost, TurnStrategy};
use crate::tool_execution::{
    canonicalize_command, is_state_changing_command, metadata_payload,
    truncate_chars, ToolExecutionResult,
};
use crate::vision::capture_viewer_snapshot;

const AUTO_VALIDATION_CALL_ID: &str = "auto_capture_viewer_snapshot_1";

const CLARIFICATION_REQUEST: &str = "I keep repeating the same step without making progress. Could you clarify what you want, or suggest a different approach?";

const MISSING_FINAL_ANSWER: &str =
    "I completed the loop but did not receive a final answer from the model.";

/// Runs one AI turn to completion on the calling worker thread.
pub(crate) fn run_turn(
    shared: &Shared,
    strategy: &dyn TurnStrategy,
    prompt: &str,
    cancel: &CancelToken,
) -> Result<(), RuntimeError> {
    tracing::info!(target: "mol_agent", prompt_chars = prompt.chars().count(), "agent turn started");
    if acknowledge_cancel(shared, cancel) {
        return Ok(());
    }

    shared.push_history(ChatMessage::user(prompt));
    let (model, resume_session_id) = {
        let session = shared.session();
        (session.model.clone(), session.session_id.clone())
    };

    let mut host = TurnHost::new(shared, cancel);
    let with_context = !strategy.keeps_session();
    let request = build_request(shared, prompt, &model, with_context, resume_session_id.clone())?;
    tracing::info!(
        target: "mol_agent",
        backend = strategy.backend().as_str(),
        with_context,
        has_session_id = resume_session_id.is_some(),
        max_turns = shared.config.max_steps,
        model = %model,
        "turn strategy run"
    );
    let mut result = strategy.run(request, &mut host, cancel);

    if result.error_class == Some(ErrorClass::ResumeInvalid)
        && resume_session_id.is_some()
        && !cancel.is_cancelled()
    {
        shared.session().session_id = None;
        tracing::info!(target: "mol_agent", "resume token rejected; retrying with local history context");
        let request = build_request(shared, prompt, &model, true, None)?;
        result = strategy.run(request, &mut host, cancel);
    }

    if acknowledge_cancel(shared, cancel) {
        return Ok(());
    }

    if let Some(session_id) = result.session_id.clone() {
        if let Some(previous) = resume_session_id.as_deref().filter(|id| *id != session_id) {
            strategy.end_session(previous);
        }
        shared.session().session_id = Some(session_id);
    }
    tracing::info!(
        target: "mol_agent",
        error_class = result.error_class.map_or("", ErrorClass::as_str),
        has_error = result.is_error(),
        num_turns = result.num_turns,
        "turn strategy completed"
    );

    if let Some(error) = result.error.as_deref() {
        if result.error_class == Some(ErrorClass::Cancelled) {
            acknowledge_cancel(shared, cancel);
            return Ok(());
        }
        tracing::error!(
            target: "mol_agent",
            error_class = result.error_class.map_or("", ErrorClass::as_str),
            "turn failed"
        );
        shared.emit(UiEvent::error(shared.credentials.scrub(error)));
        return Ok(());
    }

    if shared.config.screenshot_validate_required
        && host.validation_pending
        && !host.validation_done
    {
        let mut arguments = Map::new();
        arguments.insert("purpose".to_string(), json!("auto_validation"));
        host.snapshot_tool(AUTO_VALIDATION_CALL_ID, &arguments);
    }

    finish_turn(shared, &host, &result);
    Ok(())
}

fn finish_turn(shared: &Shared, host: &TurnHost<'_>, result: &AgentTurnResult) {
    let assistant_text = result.assistant_text.trim();
    if !assistant_text.is_empty() {
        tracing::info!(target: "mol_agent", chars = assistant_text.chars().count(), "assistant final text emitted");
        if !host.streamed {
            shared.emit(UiEvent::ai(assistant_text));
        }
        shared.push_history(ChatMessage::assistant(assistant_text));
        return;
    }

    let streamed = host.streamed_text.trim();
    if host.streamed && !streamed.is_empty() {
        tracing::info!(target: "mol_agent", chars = streamed.chars().count(), "assistant final text inferred from stream");
        shared.push_history(ChatMessage::assistant(streamed));
        return;
    }

    let max_steps = shared.config.max_steps;
    if result.num_turns >= max_steps {
        tracing::warn!(target: "mol_agent", max_steps, "step limit reached without final answer");
        shared.emit(UiEvent::system(format!(
            "Reached the step limit ({max_steps} steps) before a final answer. Tell me to continue."
        )));
        return;
    }

    let final_answer_enabled = shared.session().final_answer_enabled;
    if final_answer_enabled {
        tracing::error!(target: "mol_agent", "missing final assistant answer");
        shared.emit(UiEvent::error(MISSING_FINAL_ANSWER));
    }
}

/// Emits `request cancelled` on the first acknowledgement of a user cancel.
/// Returns whether the turn is cancelled.
fn acknowledge_cancel(shared: &Shared, cancel: &CancelToken) -> bool {
    if !cancel.is_cancelled() {
        return false;
    }
    if cancel.acknowledge() && cancel.reason() == Some(CancelReason::User) {
        shared.emit(UiEvent::system("request cancelled"));
    }
    true
}

fn build_request(
    shared: &Shared,
    prompt: &str,
    model: &str,
    with_context: bool,
    resume_session_id: Option<String>,
) -> Result<AgentTurnRequest, RuntimeError> {
    let summary = shared.viewer_state_summary()?;
    let mut lines = vec![
        "Current viewer state (compact JSON):".to_string(),
        serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string()),
    ];
    if with_context {
        let context = shared.session().history.context_lines();
        if !context.is_empty() {
            lines.push(String::new());
            lines.push("Conversation context:".to_string());
            lines.extend(context);
        }
    }
    lines.push(String::new());
    lines.push("User request:".to_string());
    lines.push(prompt.to_string());

    let max_buffer_size = shared.config.sdk_max_buffer_size;
    Ok(AgentTurnRequest {
        prompt: lines.join("\n"),
        model: model.to_string(),
        system_prompt: SYSTEM_PROMPT.to_string(),
        max_turns: shared.config.max_steps,
        resume_session_id,
        max_buffer_size: (max_buffer_size > 0).then_some(max_buffer_size),
    })
}

/// The loop guard tripped twice and stopped the turn.
struct Stalled;

/// Per-turn callback surface handed to the strategy.
struct TurnHost<'a> {
    shared: &'a Shared,
    cancel: &'a CancelToken,
    reasoning_visible: bool,
    validation_pending: bool,
    validation_done: bool,
    slow_notice_sent: bool,
    streamed: bool,
    streamed_text: String,
    intent_buffer: String,
    guard: LoopGuard,
}

impl<'a> TurnHost<'a> {
    fn new(shared: &'a Shared, cancel: &'a CancelToken) -> Self {
        let reasoning_visible = shared.session().reasoning_visible;
        Self {
            shared,
            cancel,
            reasoning_visible,
            validation_pending: false,
            validation_done: false,
            slow_notice_sent: false,
            streamed: false,
            streamed_text: String::new(),
            intent_buffer: String::new(),
            guard: LoopGuard::new(shared.config.doom_loop_threshold),
        }
    }

    fn cancelled_output() -> ToolOutput {
        ToolOutput::new(json!({"ok": false, "error": "cancelled"}))
    }

    /// Returns the corrective text on a warning. An abort cancels the turn
    /// and asks the user for clarification.
    fn apply_verdict(&mut self, verdict: Verdict) -> Result<Option<String>, Stalled> {
        match verdict {
            Verdict::Clear => Ok(None),
            Verdict::Warn(report) => {
                let message = report.corrective_message();
                tracing::warn!(
                    target: "mol_agent",
                    kind = report.kind.as_str(),
                    tool = %report.tool_name,
                    call_count = report.call_count,
                    "doom loop warning"
                );
                self.shared.push_history(ChatMessage::system(message.clone()));
                Ok(Some(message))
            }
            Verdict::Abort(report) => {
                tracing::warn!(
                    target: "mol_agent",
                    kind = report.kind.as_str(),
                    tool = %report.tool_name,
                    "doom loop abort"
                );
                self.cancel.cancel_with(CancelReason::Stalled);
                self.shared.emit(UiEvent::ai(CLARIFICATION_REQUEST));
                self.shared
                    .push_history(ChatMessage::assistant(CLARIFICATION_REQUEST));
                Err(Stalled)
            }
        }
    }

    fn note_elapsed(&mut self, elapsed: Duration) {
        let Some(threshold) = self.shared.config.long_tool_warn_threshold() else {
            return;
        };
        if elapsed < threshold || self.slow_notice_sent {
            return;
        }
        self.slow_notice_sent = true;
        tracing::info!(target: "mol_agent", elapsed = format!("{:.3}", elapsed.as_secs_f64()), "slow tool warning emitted");
        self.shared.emit(UiEvent::system(format!(
            "tool step took {:.1}s; UI may be busy during heavy host operations",
            elapsed.as_secs_f64()
        )));
    }

    fn push_tool_history(&self, call_id: &str, tool_name: &str, payload: &Value) {
        self.shared.push_history(ChatMessage::tool(
            call_id,
            tool_name,
            truncate_chars(&payload.to_string(), self.shared.config.tool_result_max_chars),
        ));
    }

    fn tool_metadata(
        call_id: &str,
        tool_name: &str,
        arguments: &Map<String, Value>,
        command: Option<&str>,
    ) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("tool_call_id".to_string(), json!(call_id));
        metadata.insert("tool_name".to_string(), json!(tool_name));
        metadata.insert("tool_args".to_string(), Value::Object(arguments.clone()));
        metadata.insert(
            "tool_command".to_string(),
            command.map_or(Value::Null, |command| json!(command)),
        );
        metadata
    }
}

impl StreamSink for TurnHost<'_> {
    fn on_text_chunk(&mut self, chunk: &str) {
        if self.cancel.is_cancelled() || chunk.is_empty() {
            return;
        }
        self.streamed = true;
        self.streamed_text.push_str(chunk);
        self.intent_buffer.push_str(chunk);
        if self.shared.config.trace_stream {
            let preview = chunk.chars().take(120).collect::<String>();
            tracing::debug!(target: "mol_agent", chars = chunk.chars().count(), preview = %preview, "stream chunk");
        }
        self.shared.emit(UiEvent::stream_chunk(chunk));
    }

    fn on_reasoning_chunk(&mut self, chunk: &str) {
        if self.reasoning_visible && !chunk.is_empty() && !self.cancel.is_cancelled() {
            self.shared.emit(UiEvent::reasoning(chunk));
        }
    }
}

impl AgentToolHost for TurnHost<'_> {
    fn run_command_tool(&mut self, tool_call_id: &str, arguments: &Map<String, Value>) -> ToolOutput {
        if self.cancel.is_cancelled() {
            return Self::cancelled_output();
        }

        let intent = std::mem::take(&mut self.intent_buffer);
        let mut loop_warning = None;
        if !intent.trim().is_empty() {
            let verdict = self.guard.observe_intent(&intent);
            match self.apply_verdict(verdict) {
                Ok(warning) => loop_warning = warning,
                Err(Stalled) => return Self::stalled_output(),
            }
        }

        let raw = arguments
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let (command, note) = canonicalize_command(raw);
        if let Some(note) = note {
            self.shared.emit(UiEvent::system(note));
        }

        let verdict = self
            .guard
            .observe_call(RUN_COMMAND_TOOL, arguments, self.validation_pending);
        match self.apply_verdict(verdict) {
            Ok(warning) => loop_warning = warning.or(loop_warning),
            Err(Stalled) => return Self::stalled_output(),
        }

        let mut metadata = Self::tool_metadata(tool_call_id, RUN_COMMAND_TOOL, arguments, Some(&command));
        self.shared.emit(UiEvent::tool_start(
            format!("Running: {command}"),
            metadata.clone(),
        ));

        let started = Instant::now();
        let result = if command.is_empty() {
            ToolExecutionResult::failure(command.as_str(), "empty command")
        } else {
            self.shared.run_command(&command)
        };
        let elapsed = started.elapsed();
        self.note_elapsed(elapsed);
        tracing::info!(
            target: "mol_agent",
            tool_call_id,
            command = %result.command,
            ok = result.ok,
            elapsed = format!("{:.3}", elapsed.as_secs_f64()),
            error = result.error.as_deref().unwrap_or_default(),
            "tool run done"
        );
        self.shared.remember_tool_result(&result);

        let mut payload = result.payload();
        if let (Some(warning), Value::Object(fields)) = (&loop_warning, &mut payload) {
            fields.insert("loop_warning".to_string(), json!(warning));
        }
        metadata.insert(
            "tool_result_json".to_string(),
            metadata_payload(&payload, self.shared.config.tool_result_max_chars),
        );
        self.shared.emit(UiEvent::tool_result(
            format!("Executed: {command}"),
            result.ok,
            metadata,
        ));
        self.push_tool_history(tool_call_id, RUN_COMMAND_TOOL, &payload);

        if is_state_changing_command(&result.command) {
            self.validation_pending = true;
        }
        self.guard.record_outcome(RUN_COMMAND_TOOL, arguments, result.ok);
        ToolOutput::new(payload)
    }

    fn snapshot_tool(&mut self, tool_call_id: &str, arguments: &Map<String, Value>) -> ToolOutput {
        if self.cancel.is_cancelled() {
            return Self::cancelled_output();
        }
        tracing::info!(target: "mol_agent", tool_call_id, "snapshot tool start");
        self.shared.emit(UiEvent::tool_start(
            format!("Running: {SNAPSHOT_TOOL}"),
            Self::tool_metadata(tool_call_id, SNAPSHOT_TOOL, arguments, None),
        ));

        let config = &self.shared.config;
        let (width, height) = (config.screenshot_width, config.screenshot_height);
        let limits = self.shared.state_limits();
        let recent = self.shared.session().recent.latest();
        let started = Instant::now();
        let outcome = run_on_host(self.shared.host.as_ref(), move |host| {
            let capture = capture_viewer_snapshot(host, width, height);
            let summary = build_viewer_state_summary(host, limits, &recent);
            (capture, summary)
        });
        let elapsed = started.elapsed();
        self.note_elapsed(elapsed);

        let (payload, image_data_url) = match outcome {
            Ok((capture, summary)) => (
                json!({
                    "ok": capture.ok,
                    "error": capture.error,
                    "meta": capture.meta,
                    "state_summary": summary,
                    "used_screenshot": capture.ok,
                }),
                capture.image_data_url.filter(|_| capture.ok),
            ),
            Err(error) => (
                json!({
                    "ok": false,
                    "error": error.to_string(),
                    "meta": {},
                    "state_summary": Value::Null,
                    "used_screenshot": false,
                }),
                None,
            ),
        };
        let ok = payload["ok"].as_bool().unwrap_or(false);
        tracing::info!(
            target: "mol_agent",
            tool_call_id,
            ok,
            elapsed = format!("{:.3}", elapsed.as_secs_f64()),
            "snapshot tool done"
        );

        let mut metadata = Self::tool_metadata(tool_call_id, SNAPSHOT_TOOL, arguments, None);
        metadata.insert(
            "tool_result_json".to_string(),
            metadata_payload(&payload, self.shared.config.tool_result_max_chars),
        );
        metadata.insert(
            "visual_validation".to_string(),
            json!(if ok {
                "validated: screenshot+state"
            } else {
                "validated: state-only (screenshot failed)"
            }),
        );
        self.shared.emit(UiEvent::tool_result(
            "Executed: capture_viewer_snapshot",
            ok,
            metadata,
        ));
        self.push_tool_history(tool_call_id, SNAPSHOT_TOOL, &payload);

        self.validation_done = true;
        self.validation_pending = false;
        ToolOutput::new(payload).with_image(image_data_url)
    }

    fn unsupported_tool(&mut self, call: &ToolCall) -> ToolOutput {
        tracing::warn!(target: "mol_agent", tool_call_id = %call.tool_call_id, tool = %call.name, "unsupported tool requested");
        ToolOutput::unsupported(&call.name)
    }
}

impl TurnHost<'_> {
    fn stalled_output() -> ToolOutput {
        ToolOutput::new(json!({
            "ok": false,
            "error": "stopped: repeated steps without progress",
        }))
    }
}

impl StrategyHost for TurnHost<'_> {
    fn tool_host(&mut self) -> &mut dyn AgentToolHost {
        self
    }

    fn notify(&mut self, text: &str) {
        self.shared.emit(UiEvent::system(text));
    }
}
