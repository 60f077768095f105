mod support;

use agent_client::{ChatMessage, UiRole};
use agent_client_mock::{command_call, AgentAction, ScriptedAgentTurn};
use agent_runtime::RuntimeConfig;

use support::{config, of_role, resumable};

const CLARIFICATION: &str = "I keep repeating the same step without making progress. Could you clarify what you want, or suggest a different approach?";

fn repeat(command: &str, times: usize) -> Vec<AgentAction> {
    (1..=times)
        .map(|index| AgentAction::Tool(command_call(&format!("c{index}"), command)))
        .collect()
}

fn no_validation() -> RuntimeConfig {
    RuntimeConfig {
        screenshot_validate_required: false,
        ..config()
    }
}

#[test]
fn first_detection_steers_the_model_with_a_hidden_warning() {
    let (harness, client) = resumable(
        no_validation(),
        vec![ScriptedAgentTurn::new(repeat("zoom", 3)).with_final_text("Zoomed.")],
    );

    let events = harness.run("zoom a lot");

    assert_eq!(harness.viewer.executed().len(), 3);
    let outputs = client.tool_outputs();
    assert!(outputs[1].payload.get("loop_warning").is_none());
    let warning = outputs[2].payload["loop_warning"]
        .as_str()
        .expect("third call should carry the loop warning");
    assert!(warning.starts_with("Loop detected:"));

    assert!(of_role(&events, UiRole::System)
        .iter()
        .all(|text| !text.starts_with("Loop detected:")));
    assert!(harness
        .runtime
        .history()
        .iter()
        .any(|message| message.role() == "system" && message.content().starts_with("Loop detected:")));
    assert_eq!(of_role(&events, UiRole::Ai), vec!["Zoomed."]);
}

#[test]
fn second_detection_aborts_and_asks_the_user() {
    let (harness, client) = resumable(
        no_validation(),
        vec![ScriptedAgentTurn::new(repeat("zoom", 6)).with_final_text("never shown")],
    );

    let events = harness.run("zoom forever");

    assert_eq!(harness.viewer.executed().len(), 3);
    assert_eq!(client.tool_outputs().len(), 4);
    assert_eq!(client.tool_outputs()[3].payload["ok"], false);
    assert_eq!(of_role(&events, UiRole::Ai), vec![CLARIFICATION]);
    assert!(!of_role(&events, UiRole::System).contains(&"request cancelled".to_string()));
    assert!(of_role(&events, UiRole::Error).is_empty());
    assert_eq!(
        harness.runtime.history().last().map(ChatMessage::content),
        Some(CLARIFICATION)
    );
    assert!(!harness.runtime.is_busy());
}

#[test]
fn progress_in_another_family_rearms_the_guard() {
    let mut actions = repeat("zoom", 3);
    actions.push(AgentAction::Tool(command_call("f1", "fetch 1crn")));
    actions.extend(repeat("orient", 2));
    let (harness, _client) = resumable(
        no_validation(),
        vec![ScriptedAgentTurn::new(actions).with_final_text("Done.")],
    );

    let events = harness.run("set up the view");

    assert_eq!(harness.viewer.executed().len(), 6);
    assert_eq!(of_role(&events, UiRole::Ai), vec!["Done."]);
}

#[test]
fn alternating_commands_are_flagged_at_threshold_two() {
    let (harness, client) = resumable(
        RuntimeConfig {
            doom_loop_threshold: 2,
            ..no_validation()
        },
        vec![ScriptedAgentTurn::new(vec![
            AgentAction::Tool(command_call("c1", "show cartoon")),
            AgentAction::Tool(command_call("c2", "hide sticks")),
            AgentAction::Tool(command_call("c3", "show lines")),
        ])
        .with_final_text("Styled.")],
    );

    let events = harness.run("style it");

    assert_eq!(harness.viewer.executed().len(), 3);
    let outputs = client.tool_outputs();
    assert!(outputs[0].payload.get("loop_warning").is_none());
    assert!(outputs[1].payload.get("loop_warning").is_none());
    let warning = outputs[2].payload["loop_warning"]
        .as_str()
        .expect("third call should carry the loop warning");
    assert!(warning.contains("alternating between the same two commands"));
    assert_eq!(of_role(&events, UiRole::Ai), vec!["Styled."]);
}
