//! Deterministic scripted implementations of the `agent_client` contracts.
//!
//! Nothing here talks to a network. Tests queue replies up front and inspect
//! the recorded requests afterwards; the binary falls back to these clients
//! when no credential is configured.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use agent_client::{
    dispatch_tool_call, AgentToolHost, AgentTurnRequest, AgentTurnResult, AssistantTurn,
    CancelToken, ChatCompletionClient, ChatTurnRequest, ClientError, ClientProfile,
    ResumableAgentClient, StreamSink, ToolCall, ToolOutput, RUN_COMMAND_TOOL, SNAPSHOT_TOOL,
};
use serde_json::{Map, Value};

/// Stable client identifier for the scripted clients.
pub const MOCK_CLIENT_ID: &str = "mock";

const DEFAULT_MOCK_MODEL: &str = "mock-model";
const CANCEL_POLL: Duration = Duration::from_millis(5);

/// One scripted design (a) reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub text_chunks: Vec<String>,
    pub reasoning_chunks: Vec<String>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<ClientError>,
    /// Pause before each streamed chunk.
    pub chunk_delay: Option<Duration>,
}

impl ScriptedReply {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text_chunks: vec![text.into()],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text_chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(error: ClientError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning_chunks.push(reasoning.into());
        self
    }

    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    #[must_use]
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// Builds a `run_viewer_command` call.
#[must_use]
pub fn command_call(tool_call_id: &str, command: &str) -> ToolCall {
    let mut arguments = Map::new();
    arguments.insert("command".to_string(), Value::String(command.to_string()));
    ToolCall::new(tool_call_id, RUN_COMMAND_TOOL, arguments)
}

/// Builds a `capture_viewer_snapshot` call.
#[must_use]
pub fn snapshot_call(tool_call_id: &str, purpose: &str) -> ToolCall {
    let mut arguments = Map::new();
    arguments.insert("purpose".to_string(), Value::String(purpose.to_string()));
    ToolCall::new(tool_call_id, SNAPSHOT_TOOL, arguments)
}

/// Design (a) client that replays queued replies in order.
#[derive(Debug)]
pub struct ScriptedChatClient {
    model_id: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<ChatTurnRequest>>,
}

impl ScriptedChatClient {
    #[must_use]
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            model_id: DEFAULT_MOCK_MODEL.to_string(),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.model_id = model_id.trim().to_string();
        }
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock_unpoisoned(&self.replies).push_back(reply);
    }

    /// Every request seen so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatTurnRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        lock_unpoisoned(&self.replies).len()
    }
}

impl Default for ScriptedChatClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ChatCompletionClient for ScriptedChatClient {
    fn profile(&self) -> ClientProfile {
        ClientProfile {
            client_id: MOCK_CLIENT_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn stream_assistant_turn(
        &self,
        request: ChatTurnRequest,
        sink: &mut dyn StreamSink,
        cancel: &CancelToken,
    ) -> Result<AssistantTurn, ClientError> {
        lock_unpoisoned(&self.requests).push(request);

        if cancel.is_cancelled() {
            return Err(ClientError::cancelled());
        }

        let Some(reply) = lock_unpoisoned(&self.replies).pop_front() else {
            return Err(ClientError::new("mock script exhausted"));
        };
        tracing::debug!(
            chunks = reply.text_chunks.len(),
            tool_calls = reply.tool_calls.len(),
            "replaying scripted reply"
        );

        let mut turn = AssistantTurn::default();
        for chunk in &reply.reasoning_chunks {
            pause(reply.chunk_delay, cancel)?;
            sink.on_reasoning_chunk(chunk);
            turn.reasoning.push_str(chunk);
        }
        for chunk in &reply.text_chunks {
            pause(reply.chunk_delay, cancel)?;
            sink.on_text_chunk(chunk);
            turn.assistant_text.push_str(chunk);
        }

        if let Some(error) = reply.error {
            return Err(error);
        }

        turn.tool_calls = reply.tool_calls;
        Ok(turn)
    }
}

/// One step inside a scripted design (b) turn.
#[derive(Debug, Clone)]
pub enum AgentAction {
    Text(String),
    Reasoning(String),
    Tool(ToolCall),
    /// Sleeps while polling the cancel token.
    Pause(Duration),
    Fail(ClientError),
}

/// Scripted outcome of one `run_turn` call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgentTurn {
    pub actions: Vec<AgentAction>,
    /// Reported instead of the streamed text when set.
    pub final_text: Option<String>,
}

impl ScriptedAgentTurn {
    #[must_use]
    pub fn new(actions: Vec<AgentAction>) -> Self {
        Self {
            actions,
            final_text: None,
        }
    }

    #[must_use]
    pub fn with_final_text(mut self, text: impl Into<String>) -> Self {
        self.final_text = Some(text.into());
        self
    }
}

/// Design (b) client that plays scripted actions against the host.
#[derive(Debug)]
pub struct ScriptedAgentClient {
    model_id: String,
    turns: Mutex<VecDeque<ScriptedAgentTurn>>,
    requests: Mutex<Vec<AgentTurnRequest>>,
    tool_outputs: Mutex<Vec<ToolOutput>>,
    sessions_issued: Mutex<usize>,
    ended_sessions: Mutex<Vec<String>>,
}

impl ScriptedAgentClient {
    #[must_use]
    pub fn new(turns: Vec<ScriptedAgentTurn>) -> Self {
        Self {
            model_id: DEFAULT_MOCK_MODEL.to_string(),
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            tool_outputs: Mutex::new(Vec::new()),
            sessions_issued: Mutex::new(0),
            ended_sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn push_turn(&self, turn: ScriptedAgentTurn) {
        lock_unpoisoned(&self.turns).push_back(turn);
    }

    #[must_use]
    pub fn requests(&self) -> Vec<AgentTurnRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    /// Host outputs returned to the client, in call order.
    #[must_use]
    pub fn tool_outputs(&self) -> Vec<ToolOutput> {
        lock_unpoisoned(&self.tool_outputs).clone()
    }

    /// Session ids the caller ended, in order.
    #[must_use]
    pub fn ended_sessions(&self) -> Vec<String> {
        lock_unpoisoned(&self.ended_sessions).clone()
    }

    fn session_for(&self, request: &AgentTurnRequest) -> String {
        if let Some(existing) = request
            .resume_session_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            return existing.to_string();
        }
        let mut issued = lock_unpoisoned(&self.sessions_issued);
        *issued += 1;
        format!("mock-session-{issued}")
    }
}

impl Default for ScriptedAgentClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ResumableAgentClient for ScriptedAgentClient {
    fn profile(&self) -> ClientProfile {
        ClientProfile {
            client_id: MOCK_CLIENT_ID.to_string(),
            model_id: self.model_id.clone(),
        }
    }

    fn run_turn(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn AgentToolHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult {
        lock_unpoisoned(&self.requests).push(request.clone());

        let Some(turn) = lock_unpoisoned(&self.turns).pop_front() else {
            return AgentTurnResult::failed(&ClientError::new("mock script exhausted"));
        };

        let session_id = self.session_for(&request);
        let mut text = String::new();
        let mut num_turns = 1;

        for action in turn.actions {
            if cancel.is_cancelled() {
                return interrupted(text, session_id, num_turns);
            }
            match action {
                AgentAction::Text(chunk) => {
                    host.on_text_chunk(&chunk);
                    text.push_str(&chunk);
                }
                AgentAction::Reasoning(chunk) => host.on_reasoning_chunk(&chunk),
                AgentAction::Tool(call) => {
                    num_turns += 1;
                    let output = dispatch_tool_call(host, &call);
                    lock_unpoisoned(&self.tool_outputs).push(output);
                }
                AgentAction::Pause(duration) => {
                    if pause(Some(duration), cancel).is_err() {
                        return interrupted(text, session_id, num_turns);
                    }
                }
                AgentAction::Fail(error) => {
                    let mut result = AgentTurnResult::failed(&error);
                    result.num_turns = num_turns;
                    return result;
                }
            }
        }

        AgentTurnResult {
            assistant_text: turn.final_text.unwrap_or(text),
            session_id: Some(session_id),
            num_turns,
            ..AgentTurnResult::default()
        }
    }

    fn end_session(&self, session_id: &str) {
        lock_unpoisoned(&self.ended_sessions).push(session_id.to_string());
    }
}

fn interrupted(text: String, session_id: String, num_turns: usize) -> AgentTurnResult {
    let mut result = AgentTurnResult::failed(&ClientError::cancelled());
    result.assistant_text = text;
    result.session_id = Some(session_id);
    result.num_turns = num_turns;
    result
}

fn pause(delay: Option<Duration>, cancel: &CancelToken) -> Result<(), ClientError> {
    let Some(delay) = delay else {
        return if cancel.is_cancelled() {
            Err(ClientError::cancelled())
        } else {
            Ok(())
        };
    };

    let deadline = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return Err(ClientError::cancelled());
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use agent_client::{ErrorClass, ToolOutput};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        text: String,
        reasoning: String,
    }

    impl StreamSink for RecordingSink {
        fn on_text_chunk(&mut self, chunk: &str) {
            self.text.push_str(chunk);
        }

        fn on_reasoning_chunk(&mut self, chunk: &str) {
            self.reasoning.push_str(chunk);
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        sink: RecordingSink,
        commands: Vec<String>,
    }

    impl StreamSink for RecordingHost {
        fn on_text_chunk(&mut self, chunk: &str) {
            self.sink.on_text_chunk(chunk);
        }

        fn on_reasoning_chunk(&mut self, chunk: &str) {
            self.sink.on_reasoning_chunk(chunk);
        }
    }

    impl AgentToolHost for RecordingHost {
        fn run_command_tool(&mut self, _id: &str, arguments: &Map<String, Value>) -> ToolOutput {
            let command = arguments
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.commands.push(command.to_string());
            ToolOutput::new(json!({"ok": true, "command": command}))
        }

        fn snapshot_tool(&mut self, _id: &str, _arguments: &Map<String, Value>) -> ToolOutput {
            ToolOutput::new(json!({"ok": true}))
        }
    }

    fn request(resume: Option<&str>) -> AgentTurnRequest {
        AgentTurnRequest {
            prompt: "zoom in".to_string(),
            model: "mock-model".to_string(),
            system_prompt: "system".to_string(),
            max_turns: 8,
            resume_session_id: resume.map(str::to_string),
            max_buffer_size: None,
        }
    }

    #[test]
    fn chat_client_streams_chunks_and_returns_tool_calls() {
        let client = ScriptedChatClient::new(vec![ScriptedReply::chunks(["Zoom", "ing"])
            .with_reasoning("thinking")
            .with_tool_call(command_call("c1", "zoom"))]);
        let mut sink = RecordingSink::default();

        let turn = client
            .stream_assistant_turn(
                ChatTurnRequest {
                    model: "mock-model".to_string(),
                    messages: Vec::new(),
                    tools: Vec::new(),
                    max_buffer_size: None,
                },
                &mut sink,
                &CancelToken::new(),
            )
            .expect("scripted reply should stream");

        assert_eq!(sink.text, "Zooming");
        assert_eq!(sink.reasoning, "thinking");
        assert_eq!(turn.assistant_text, "Zooming");
        assert_eq!(turn.tool_calls[0].argument_str("command"), Some("zoom"));
        assert_eq!(client.requests().len(), 1);
        assert_eq!(client.remaining(), 0);
    }

    #[test]
    fn chat_client_reports_exhausted_script_as_error() {
        let client = ScriptedChatClient::default();
        let error = client
            .stream_assistant_turn(
                ChatTurnRequest {
                    model: "m".to_string(),
                    messages: Vec::new(),
                    tools: Vec::new(),
                    max_buffer_size: None,
                },
                &mut RecordingSink::default(),
                &CancelToken::new(),
            )
            .expect_err("empty script must fail");

        assert_eq!(error.class(), ErrorClass::SdkError);
    }

    #[test]
    fn agent_client_runs_tools_and_reuses_resumed_session() {
        let client = ScriptedAgentClient::new(vec![
            ScriptedAgentTurn::new(vec![
                AgentAction::Tool(command_call("c1", "zoom")),
                AgentAction::Text("Zoomed in.".to_string()),
            ]),
            ScriptedAgentTurn::new(vec![AgentAction::Text("again".to_string())]),
        ]);
        let mut host = RecordingHost::default();

        let first = client.run_turn(request(None), &mut host, &CancelToken::new());
        let second = client.run_turn(
            request(first.session_id.as_deref()),
            &mut host,
            &CancelToken::new(),
        );

        assert_eq!(first.assistant_text, "Zoomed in.");
        assert_eq!(first.num_turns, 2);
        assert_eq!(first.session_id.as_deref(), Some("mock-session-1"));
        assert_eq!(second.session_id.as_deref(), Some("mock-session-1"));
        assert_eq!(host.commands, vec!["zoom"]);
        assert!(client.tool_outputs()[0].is_ok());
    }

    #[test]
    fn agent_client_stops_at_cancelled_pause() {
        let client = ScriptedAgentClient::new(vec![ScriptedAgentTurn::new(vec![
            AgentAction::Pause(Duration::from_secs(5)),
            AgentAction::Text("late".to_string()),
        ])]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = client.run_turn(request(None), &mut RecordingHost::default(), &cancel);

        assert!(result.interrupted);
        assert!(result.assistant_text.is_empty());
    }
}
