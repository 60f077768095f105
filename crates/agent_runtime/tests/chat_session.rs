use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_client::{UiEvent, UiRole};
use agent_client_mock::{command_call, AgentAction, ScriptedAgentClient, ScriptedAgentTurn};
use agent_runtime::demo::DemoViewer;
use agent_runtime::strategy::ResumableStrategy;
use agent_runtime::{AgentRuntime, ChatSession, Credentials, InlineHostContext, RuntimeConfig};
use chat_store::{ChatStore, ChatStoreOptions, SystemClock};

fn chat_session(root: &Path, turns: Vec<ScriptedAgentTurn>) -> (ChatSession, DemoViewer) {
    let viewer = DemoViewer::new();
    let runtime = AgentRuntime::new(
        RuntimeConfig {
            long_tool_warn_sec: -1.0,
            screenshot_validate_required: false,
            ..RuntimeConfig::default()
        },
        Arc::new(InlineHostContext::new(viewer.clone())),
        Arc::new(ResumableStrategy::new(Arc::new(ScriptedAgentClient::new(turns)))),
        Arc::new(Credentials::fixed(Some("sk-or-test-0000"))),
    );
    let options = ChatStoreOptions {
        flush_delay: Duration::ZERO,
        checkpoint_delay: Duration::ZERO,
        ..ChatStoreOptions::default()
    };
    let store = ChatStore::open(root, options, Arc::new(SystemClock)).expect("store should open");
    (ChatSession::new(runtime, store), viewer)
}

fn settle(session: &mut ChatSession) -> Vec<UiEvent> {
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

fn color_turn() -> ScriptedAgentTurn {
    ScriptedAgentTurn::new(vec![AgentAction::Tool(command_call("c1", "color red"))])
        .with_final_text("Colored.")
}

#[test]
fn failed_checkpoint_is_recorded_and_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut session, viewer) = chat_session(dir.path(), vec![color_turn()]);
    viewer.set_save_fails(true);

    session.submit("color it red");
    let events = settle(&mut session);

    assert!(events
        .iter()
        .any(|event| event.role == UiRole::Ai && event.text == "Colored."));
    let manifest = session.store().current_manifest().expect("current chat");
    assert_eq!(manifest.save_status.last_pse_save_ok, Some(false));
    assert_eq!(manifest.save_status.last_pse_error.as_deref(), Some("disk full"));
    assert!(!manifest.has_session_pse);
    assert!(viewer.saved_paths().is_empty());

    viewer.set_save_fails(false);
    session
        .pump(Instant::now() + Duration::from_secs(1))
        .expect("pump should succeed");

    let manifest = session.store().current_manifest().expect("current chat");
    assert_eq!(manifest.save_status.last_pse_save_ok, Some(true));
    assert_eq!(manifest.save_status.last_pse_error, None);
    assert_eq!(viewer.saved_paths().len(), 1);
}

#[test]
fn chats_are_searchable_and_reopen_with_their_transcript() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut session, _viewer) = chat_session(
        dir.path(),
        vec![
            ScriptedAgentTurn::new(Vec::new()).with_final_text("Ubiquitin loaded."),
            ScriptedAgentTurn::new(Vec::new()).with_final_text("Crambin loaded."),
        ],
    );

    session.submit("load ubiquitin");
    settle(&mut session);
    let first = session
        .store()
        .current_chat_id()
        .expect("first chat")
        .to_string();

    session.new_chat(Instant::now()).expect("new chat");
    session.submit("load crambin");
    settle(&mut session);

    assert_eq!(session.store().count_chats(""), 2);
    let matches = session.store().list_chats("ubiquitin", 0, 10);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].chat_id, first);

    let transcript = session.open_chat(&first, Instant::now()).expect("open chat");
    let texts = transcript
        .iter()
        .map(|event| (event.role, event.text.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        texts,
        vec![(UiRole::User, "load ubiquitin"), (UiRole::Ai, "Ubiquitin loaded.")]
    );
    assert_eq!(
        session.runtime().history().last().map(|message| message.content().to_string()),
        Some("Ubiquitin loaded.".to_string())
    );
    session.close().expect("close should succeed");
}

#[test]
fn no_chat_exists_until_the_first_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut session, _viewer) = chat_session(
        dir.path(),
        vec![ScriptedAgentTurn::new(Vec::new()).with_final_text("Hi.")],
    );

    session.pump(Instant::now()).expect("pump should succeed");
    assert_eq!(session.store().current_chat_id(), None);

    session.submit("hello");
    settle(&mut session);
    session.close().expect("close should succeed");

    let chat_id = session
        .store()
        .current_chat_id()
        .expect("chat should exist")
        .to_string();
    let loaded = session.store_mut().load_chat(&chat_id).expect("chat should load");
    assert_eq!(loaded.events[0].event.text, "hello");
    assert_eq!(loaded.manifest.message_count, 2);
}

#[test]
fn events_survive_a_store_failure_and_persist_on_retry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("chats");
    let (mut session, _viewer) = chat_session(
        &root,
        vec![ScriptedAgentTurn::new(Vec::new()).with_final_text("Hi.")],
    );
    std::fs::remove_dir_all(&root).expect("store root should be removable");
    std::fs::write(&root, b"not a directory").expect("blocking file should be written");

    session.submit("hello");
    assert!(session.runtime().wait_idle(Duration::from_secs(5)));
    assert!(session.pump(Instant::now()).is_err());
    assert_eq!(session.store().current_chat_id(), None);
    assert_eq!(session.unsaved_events(), 2);

    std::fs::remove_file(&root).expect("blocking file should be removable");
    std::fs::create_dir_all(&root).expect("store root should be recreated");
    settle(&mut session);
    assert_eq!(session.unsaved_events(), 0);
    session.close().expect("close should succeed");

    let chat_id = session
        .store()
        .current_chat_id()
        .expect("chat should exist")
        .to_string();
    let loaded = session.store_mut().load_chat(&chat_id).expect("chat should load");
    let transcript = loaded
        .events
        .iter()
        .map(|record| (record.event.role, record.event.text.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(transcript, vec![(UiRole::User, "hello"), (UiRole::Ai, "Hi.")]);
}
