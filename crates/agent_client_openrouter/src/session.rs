use std::collections::HashMap;
use std::sync::Mutex;

use agent_client::{
    append_tool_output, dispatch_tool_call, strip_stale_images, viewer_tool_definitions,
    AgentToolHost, AgentTurnRequest, AgentTurnResult, CancelToken, ChatCompletionClient,
    ChatMessage, ChatTurnRequest, ClientError, ClientProfile, HostSink, ResumableAgentClient,
    ToolOutput,
};
use serde_json::json;

use crate::lock_unpoisoned;

/// Prefix of the opaque ids handed out by [`SessionAgentClient`].
pub const SESSION_ID_PREFIX: &str = "sess_";

/// Viewer images a stored log keeps between turns; older ones are dropped.
const RETAINED_SESSION_IMAGES: usize = 1;

/// Sessions kept before the least recently used one is evicted.
pub const DEFAULT_MAX_SESSIONS: usize = 32;

#[derive(Default)]
struct SessionLogs {
    logs: HashMap<String, StoredLog>,
    clock: u64,
}

struct StoredLog {
    messages: Vec<ChatMessage>,
    last_used: u64,
}

/// Session-resumable agent built on a single-turn chat client.
///
/// Each session keeps its message log in memory, with only the newest viewer
/// image attached. Resuming appends to the stored log; unknown ids fail with a
/// `resume_invalid` error. Logs live until the caller ends the session or
/// until [`DEFAULT_MAX_SESSIONS`] newer sessions push them out.
pub struct SessionAgentClient<C> {
    inner: C,
    sessions: Mutex<SessionLogs>,
    max_sessions: usize,
}

impl<C: ChatCompletionClient> SessionAgentClient<C> {
    #[must_use]
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            sessions: Mutex::new(SessionLogs::default()),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    #[must_use]
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    #[must_use]
    pub fn inner(&self) -> &C {
        &self.inner
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        lock_unpoisoned(&self.sessions).logs.len()
    }

    /// Stored log for `session_id`, if the session exists.
    #[must_use]
    pub fn session_messages(&self, session_id: &str) -> Option<Vec<ChatMessage>> {
        lock_unpoisoned(&self.sessions)
            .logs
            .get(session_id)
            .map(|log| log.messages.clone())
    }

    pub fn forget_session(&self, session_id: &str) -> bool {
        lock_unpoisoned(&self.sessions)
            .logs
            .remove(session_id)
            .is_some()
    }

    fn open_session(
        &self,
        request: &AgentTurnRequest,
    ) -> Result<(String, Vec<ChatMessage>), ClientError> {
        match request
            .resume_session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) => lock_unpoisoned(&self.sessions)
                .logs
                .get(id)
                .map(|log| (id.to_string(), log.messages.clone()))
                .ok_or_else(|| ClientError::new(format!("session not found: {id}"))),
            None => {
                let id = format!("{SESSION_ID_PREFIX}{}", uuid::Uuid::new_v4().simple());
                let mut messages = Vec::new();
                if !request.system_prompt.trim().is_empty() {
                    messages.push(ChatMessage::system(request.system_prompt.clone()));
                }
                Ok((id, messages))
            }
        }
    }

    fn store_session(&self, session_id: &str, mut messages: Vec<ChatMessage>) {
        let dropped = strip_stale_images(&mut messages, RETAINED_SESSION_IMAGES);
        if dropped > 0 {
            tracing::debug!(session_id, dropped, "dropped stale viewer images from session log");
        }
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions.clock += 1;
        let last_used = sessions.clock;
        sessions.logs.insert(
            session_id.to_string(),
            StoredLog {
                messages,
                last_used,
            },
        );
        while sessions.logs.len() > self.max_sessions {
            let Some(oldest) = sessions
                .logs
                .iter()
                .min_by_key(|(_, log)| log.last_used)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            sessions.logs.remove(&oldest);
            tracing::debug!(session_id = %oldest, "evicted least recently used session log");
        }
    }
}

impl<C: ChatCompletionClient> ResumableAgentClient for SessionAgentClient<C> {
    fn profile(&self) -> ClientProfile {
        self.inner.profile()
    }

    fn run_turn(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn AgentToolHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult {
        if cancel.is_cancelled() {
            return AgentTurnResult::failed(&ClientError::cancelled());
        }

        let (session_id, mut messages) = match self.open_session(&request) {
            Ok(session) => session,
            Err(error) => {
                tracing::info!(error = %error, "rejecting resume request");
                return AgentTurnResult::failed(&error);
            }
        };
        messages.push(ChatMessage::user(request.prompt.clone()));

        let tools = viewer_tool_definitions();
        let max_turns = request.max_turns.max(1);
        let mut num_turns = 0;
        let mut assistant_text = String::new();

        while num_turns < max_turns {
            if cancel.is_cancelled() {
                break;
            }
            num_turns += 1;

            let turn = {
                let mut sink = HostSink::new(&mut *host);
                self.inner.stream_assistant_turn(
                    ChatTurnRequest {
                        model: request.model.clone(),
                        messages: messages.clone(),
                        tools: tools.clone(),
                        max_buffer_size: request.max_buffer_size,
                    },
                    &mut sink,
                    cancel,
                )
            };

            let turn = match turn {
                Ok(turn) => turn,
                Err(error) => {
                    self.store_session(&session_id, messages);
                    let mut result = AgentTurnResult::failed(&error);
                    result.session_id = Some(session_id);
                    result.num_turns = num_turns;
                    return result;
                }
            };

            if turn.tool_calls.is_empty() {
                assistant_text = turn.assistant_text.clone();
                messages.push(ChatMessage::assistant(turn.assistant_text));
                break;
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                turn.assistant_text,
                turn.tool_calls.clone(),
            ));
            for call in &turn.tool_calls {
                let output = if cancel.is_cancelled() {
                    ToolOutput::new(json!({"ok": false, "error": "cancelled"}))
                } else {
                    dispatch_tool_call(host, call)
                };
                append_tool_output(&mut messages, call, &output);
            }
        }

        self.store_session(&session_id, messages);

        if cancel.is_cancelled() {
            let mut result = AgentTurnResult::failed(&ClientError::cancelled());
            result.assistant_text = assistant_text;
            result.session_id = Some(session_id);
            result.num_turns = num_turns;
            return result;
        }

        AgentTurnResult {
            assistant_text,
            session_id: Some(session_id),
            num_turns,
            ..AgentTurnResult::default()
        }
    }

    fn end_session(&self, session_id: &str) {
        if self.forget_session(session_id) {
            tracing::debug!(session_id, "session log released");
        }
    }
}
