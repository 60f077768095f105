use std::path::Path;
use std::time::Instant;

use agent_client::{UiEvent, UiRole};
use chat_store::{ChatStore, SaveSession};

use crate::error::RuntimeError;
use crate::host::{run_on_host, HostContext};
use crate::runtime::AgentRuntime;
use crate::tool_execution::is_state_changing_command;

/// Pairs one [`AgentRuntime`] with one [`ChatStore`] and moves transcript
/// events between them.
///
/// Consecutive stream chunks are persisted as one `ai` event. Events are not
/// persisted until the first user event has created a chat. Events the store
/// rejects stay queued and are retried on the next pump.
pub struct ChatSession {
    runtime: AgentRuntime,
    store: ChatStore,
    stream_buffer: String,
    unsaved: Vec<UiEvent>,
}

impl ChatSession {
    #[must_use]
    pub fn new(runtime: AgentRuntime, store: ChatStore) -> Self {
        Self {
            runtime,
            store,
            stream_buffer: String::new(),
            unsaved: Vec::new(),
        }
    }

    #[must_use]
    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    #[must_use]
    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ChatStore {
        &mut self.store
    }

    pub fn submit(&self, text: &str) -> bool {
        self.runtime.submit(text)
    }

    /// Events drained from the runtime that the store has not accepted yet.
    #[must_use]
    pub fn unsaved_events(&self) -> usize {
        self.unsaved.len()
    }

    /// Drains one batch of runtime events into the store, runs due store work
    /// and returns the drained events for rendering.
    pub fn pump(&mut self, now: Instant) -> Result<Vec<UiEvent>, RuntimeError> {
        let batch = self.runtime.config().ui_event_batch;
        let events = self.runtime.drain_events(Some(batch));

        self.queue(events.iter().cloned());
        if !self.runtime.is_busy() && !self.runtime.has_pending_events() {
            self.take_stream_text();
        }
        self.persist_unsaved()?;

        let host = self.runtime.host_context();
        let report = self.store.pump(now, &mut save_on_host(host.as_ref()))?;
        if report.checkpoint.is_some() {
            tracing::info!(target: "mol_agent", ok = ?report.checkpoint, "session checkpoint ran");
        }
        Ok(events)
    }

    /// Starts a fresh chat: forgets the runtime's memory and opens a draft
    /// that the next user event titles.
    pub fn new_chat(&mut self, now: Instant) -> Result<String, RuntimeError> {
        self.pump(now)?;
        self.stream_buffer.clear();
        self.runtime.clear_session(false);
        let chat_id = self.store.create_chat("")?;
        tracing::info!(target: "mol_agent", chat_id = %chat_id, "new chat started");
        Ok(chat_id)
    }

    /// Switches to a stored chat, restores its runtime state and returns its
    /// transcript.
    pub fn open_chat(&mut self, chat_id: &str, now: Instant) -> Result<Vec<UiEvent>, RuntimeError> {
        self.pump(now)?;
        self.stream_buffer.clear();
        let loaded = self.store.open_chat(chat_id)?;
        self.runtime.clear_session(false);
        self.runtime
            .import_session_state(loaded.manifest.runtime_state.clone(), true);
        tracing::info!(
            target: "mol_agent",
            chat_id = %loaded.manifest.chat_id,
            events = loaded.events.len(),
            "chat opened"
        );
        Ok(loaded.events.into_iter().map(|record| record.event).collect())
    }

    /// Persists everything still buffered and checkpoints a dirty scene.
    pub fn close(&mut self) -> Result<(), RuntimeError> {
        let events = self.runtime.drain_events(None);
        self.queue(events);
        self.take_stream_text();
        self.persist_unsaved()?;

        let host = self.runtime.host_context();
        self.store.close(&mut save_on_host(host.as_ref()))?;
        Ok(())
    }

    fn queue(&mut self, events: impl IntoIterator<Item = UiEvent>) {
        for event in events {
            if event.is_stream_chunk() {
                self.stream_buffer.push_str(&event.text);
                continue;
            }
            self.take_stream_text();
            self.unsaved.push(event);
        }
    }

    fn take_stream_text(&mut self) {
        let text = std::mem::take(&mut self.stream_buffer);
        if !text.trim().is_empty() {
            self.unsaved.push(UiEvent::ai(text));
        }
    }

    /// Hands queued events to the store. The queue is cleared only once the
    /// store has taken all of them.
    fn persist_unsaved(&mut self) -> Result<(), RuntimeError> {
        if self.store.current_chat_id().is_none() {
            let Some(first_user) = self
                .unsaved
                .iter()
                .position(|event| event.role == UiRole::User)
            else {
                if !self.unsaved.is_empty() {
                    tracing::debug!(target: "mol_agent", dropped = self.unsaved.len(), "events before first chat not persisted");
                    self.unsaved.clear();
                }
                return Ok(());
            };
            self.store.create_chat(&self.unsaved[first_user].text)?;
        }

        self.store.append_events(&self.unsaved)?;
        let scene_changed = self.unsaved.iter().any(changes_scene);
        self.unsaved.clear();
        if scene_changed {
            self.store.mark_scene_dirty();
        }
        self.store
            .set_runtime_state(self.runtime.export_session_state())?;
        Ok(())
    }
}

fn changes_scene(event: &UiEvent) -> bool {
    event.role == UiRole::ToolResult
        && event.ok == Some(true)
        && event
            .metadata_str("tool_command")
            .is_some_and(is_state_changing_command)
}

fn save_on_host(host: &dyn HostContext) -> impl FnMut(&Path) -> Result<(), String> + '_ {
    move |path: &Path| {
        let path = path.to_path_buf();
        run_on_host(host, move |viewer| viewer.save_session(&path))
            .map_err(|error| error.to_string())?
            .map_err(|error| error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use agent_client_mock::{command_call, AgentAction, ScriptedAgentClient, ScriptedAgentTurn};
    use chat_store::ChatStoreOptions;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::credentials::Credentials;
    use crate::demo::DemoViewer;
    use crate::host::InlineHostContext;
    use crate::strategy::ResumableStrategy;

    fn session(root: &Path, turns: Vec<ScriptedAgentTurn>) -> (ChatSession, DemoViewer) {
        let viewer = DemoViewer::new();
        let runtime = AgentRuntime::new(
            RuntimeConfig::default(),
            Arc::new(InlineHostContext::new(viewer.clone())),
            Arc::new(ResumableStrategy::new(Arc::new(ScriptedAgentClient::new(turns)))),
            Arc::new(Credentials::fixed(Some("sk-test"))),
        );
        let options = ChatStoreOptions {
            flush_delay: Duration::ZERO,
            checkpoint_delay: Duration::ZERO,
            ..ChatStoreOptions::default()
        };
        let store = ChatStore::open(root, options, Arc::new(chat_store::SystemClock))
            .expect("store should open");
        (ChatSession::new(runtime, store), viewer)
    }

    fn pump_until_idle(session: &mut ChatSession) -> Vec<UiEvent> {
        assert!(session.runtime().wait_idle(Duration::from_secs(5)));
        let mut events = Vec::new();
        loop {
            let batch = session.pump(Instant::now()).expect("pump should succeed");
            if batch.is_empty() {
                return events;
            }
            events.extend(batch);
        }
    }

    #[test]
    fn first_user_event_creates_a_titled_chat_and_streams_coalesce() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut session, _viewer) = session(
            dir.path(),
            vec![ScriptedAgentTurn::new(vec![
                AgentAction::Text("Hello ".to_string()),
                AgentAction::Text("there.".to_string()),
            ])],
        );

        session.submit("say hello");
        pump_until_idle(&mut session);
        session.close().expect("close should succeed");

        let chat_id = session
            .store()
            .current_chat_id()
            .expect("chat should exist")
            .to_string();
        let loaded = session
            .store_mut()
            .load_chat(&chat_id)
            .expect("chat should load");
        let roles = loaded
            .events
            .iter()
            .map(|record| (record.event.role, record.event.text.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![(UiRole::User, "say hello"), (UiRole::Ai, "Hello there.")]
        );
        assert!(loaded.manifest.title.contains("say hello"));
        assert_eq!(loaded.manifest.runtime_state.history.len(), 2);
    }

    #[test]
    fn state_changing_tool_results_checkpoint_the_scene() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut session, viewer) = session(
            dir.path(),
            vec![ScriptedAgentTurn::new(vec![AgentAction::Tool(command_call(
                "c1", "color red",
            ))])
            .with_final_text("Colored.")],
        );

        session.submit("color it red");
        pump_until_idle(&mut session);
        session.pump(Instant::now() + Duration::from_secs(1)).expect("pump");

        assert_eq!(viewer.saved_paths().len(), 1);
        let manifest = session.store().current_manifest().expect("current chat");
        assert!(manifest.has_session_pse);
        assert_eq!(manifest.save_status.last_pse_save_ok, Some(true));
    }

    #[test]
    fn open_chat_restores_runtime_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut session, _viewer) = session(
            dir.path(),
            vec![ScriptedAgentTurn::new(vec![]).with_final_text("Done.")],
        );
        session.submit("first request");
        pump_until_idle(&mut session);
        let first = session
            .store()
            .current_chat_id()
            .expect("chat")
            .to_string();

        session.new_chat(Instant::now()).expect("new chat");
        assert!(session.runtime().history().is_empty());
        assert_eq!(session.runtime().session_id(), None);

        let transcript = session.open_chat(&first, Instant::now()).expect("open chat");

        assert_eq!(transcript[0].text, "first request");
        assert_eq!(session.runtime().history().len(), 2);
        assert_eq!(session.runtime().session_id().as_deref(), Some("mock-session-1"));
    }
}
