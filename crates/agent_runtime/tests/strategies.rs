mod support;

use agent_client::{ChatMessage, UiRole};
use agent_client_mock::{command_call, ScriptedReply};
use agent_runtime::plan::DESTRUCTIVE_WARNING;
use agent_runtime::RuntimeConfig;

use support::{config, of_role, plan, streamed_text, tool_loop};

fn plan_reply(summary: &str, commands: &[&str]) -> ScriptedReply {
    let body = serde_json::json!({"summary": summary, "commands": commands});
    ScriptedReply::chunks([
        "Working on it.<PLAN_".to_string(),
        format!("JSON>{body}</PLAN_JSON>"),
    ])
}

#[test]
fn tool_loop_runs_commands_and_sends_history_context() {
    let (harness, client) = tool_loop(
        config(),
        vec![
            ScriptedReply::tool_calls(vec![command_call("c1", "fetch 1crn")]),
            ScriptedReply::chunks(["Loaded ", "crambin."]),
        ],
    );

    let events = harness.run("load crambin");

    assert_eq!(harness.viewer.executed(), vec!["fetch 1crn"]);
    assert_eq!(streamed_text(&events), "Loaded crambin.");
    assert_eq!(
        of_role(&events, UiRole::ToolResult),
        vec!["Executed: fetch 1crn", "Executed: capture_viewer_snapshot"]
    );
    assert!(of_role(&events, UiRole::Error).is_empty());

    let first = &client.requests()[0];
    let prompt = first.messages[1].content();
    assert!(prompt.contains("Conversation context:\nuser: load crambin"));
    assert!(!first.tools.is_empty());
    assert_eq!(
        harness.runtime.history().last().map(ChatMessage::content),
        Some("Loaded crambin.")
    );
    assert_eq!(harness.runtime.session_id(), None);
}

#[test]
fn tool_loop_stops_at_the_step_budget() {
    let (harness, _client) = tool_loop(
        RuntimeConfig {
            max_steps: 2,
            screenshot_validate_required: false,
            ..config()
        },
        vec![
            ScriptedReply::tool_calls(vec![command_call("c1", "turn y, 10")]),
            ScriptedReply::tool_calls(vec![command_call("c2", "turn x, 10")]),
        ],
    );

    let events = harness.run("spin it");

    assert_eq!(harness.viewer.executed().len(), 2);
    assert_eq!(
        of_role(&events, UiRole::System),
        vec!["Reached the step limit (2 steps) before a final answer. Tell me to continue."]
    );
}

#[test]
fn plan_executes_commands_and_records_the_summary() {
    let (harness, client) = plan(
        config(),
        vec![plan_reply(
            "Showed the ligand as sticks",
            &["show sticks, organic", "zoom organic"],
        )],
    );

    let events = harness.run("show the ligand");

    assert_eq!(
        harness.viewer.executed(),
        vec!["show sticks, organic", "zoom organic"]
    );
    assert_eq!(streamed_text(&events), "Working on it.");
    assert!(of_role(&events, UiRole::Ai)
        .iter()
        .all(|text| !text.contains("PLAN_JSON")));
    assert!(client.requests()[0].tools.is_empty());
    assert_eq!(
        harness.runtime.history().last().map(ChatMessage::content),
        Some("Showed the ligand as sticks")
    );
    assert!(of_role(&events, UiRole::ToolResult).contains(&"Executed: capture_viewer_snapshot".to_string()));
}

#[test]
fn destructive_plans_notify_before_running() {
    let (harness, _client) = plan(
        config(),
        vec![plan_reply("Started over", &["delete all", "fetch 1crn"])],
    );

    let events = harness.run("start over");

    let system = of_role(&events, UiRole::System);
    assert!(system.contains(&DESTRUCTIVE_WARNING.to_string()));
    let warning_at = events
        .iter()
        .position(|event| event.text == DESTRUCTIVE_WARNING)
        .expect("warning event");
    let first_tool_at = events
        .iter()
        .position(|event| event.role == UiRole::ToolStart)
        .expect("tool start event");
    assert!(warning_at < first_tool_at);
    assert_eq!(harness.viewer.executed(), vec!["delete all", "fetch 1crn"]);
}

#[test]
fn blocked_plans_surface_one_error_and_run_nothing() {
    let (harness, _client) = plan(
        config(),
        vec![plan_reply("Shell out", &["zoom", "!rm -rf /"])],
    );

    let events = harness.run("clean the disk");

    assert!(harness.viewer.executed().is_empty());
    let errors = of_role(&events, UiRole::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("plan rejected:"));
}

#[test]
fn failed_plan_commands_are_repaired_through_the_runtime() {
    let (harness, client) = plan(
        RuntimeConfig {
            screenshot_validate_required: false,
            ..config()
        },
        vec![
            plan_reply("Colored chain A", &["fetch 1ubq", "colr red, chain A"]),
            plan_reply("Colored chain A", &["color red, chain A"]),
        ],
    );
    harness.viewer.fail_commands_starting_with("colr");

    let events = harness.run("color chain A red");

    assert!(of_role(&events, UiRole::Error).is_empty());
    assert_eq!(client.requests().len(), 2);
    assert_eq!(
        harness.viewer.executed().last().map(String::as_str),
        Some("color red, chain A")
    );
}

#[test]
fn configured_stream_buffer_limit_reaches_every_completion_request() {
    let (harness, client) = tool_loop(
        RuntimeConfig {
            sdk_max_buffer_size: 4096,
            screenshot_validate_required: false,
            ..config()
        },
        vec![
            ScriptedReply::tool_calls(vec![command_call("c1", "zoom")]),
            ScriptedReply::text("Zoomed."),
        ],
    );

    harness.run("zoom in");

    let limits = client
        .requests()
        .iter()
        .map(|request| request.max_buffer_size)
        .collect::<Vec<_>>();
    assert_eq!(limits, vec![Some(4096), Some(4096)]);
}

#[test]
fn zero_stream_buffer_limit_means_unbounded() {
    let (harness, client) = plan(
        RuntimeConfig {
            sdk_max_buffer_size: 0,
            ..config()
        },
        vec![plan_reply("Zoomed", &["zoom"])],
    );

    harness.run("zoom in");

    assert_eq!(client.requests()[0].max_buffer_size, None);
}
