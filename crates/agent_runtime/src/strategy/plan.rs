use std::sync::Arc;

use agent_client::{
    AgentToolHost, AgentTurnRequest, AgentTurnResult, AssistantTurn, CancelToken,
    ChatCompletionClient, ChatMessage, ChatTurnRequest, ClientError, ClientProfile, ErrorClass,
    StreamSink,
};
use serde_json::{Map, Value};

use super::{StrategyHost, TurnStrategy};
use crate::config::BackendKind;
use crate::plan::{parse_plan_text, validate_plan, AiPlan, PlanStreamFilter, MAX_PLAN_COMMANDS};

const PLAN_INSTRUCTIONS: &str = "Answer with a short explanation for the user, then exactly one plan block:
<PLAN_JSON>{\"summary\": \"...\", \"commands\": [\"...\"], \"warnings\": [], \"reasoning\": \"...\"}</PLAN_JSON>
Each command is one viewer command. Never use shell, python or control commands.";

/// The model proposes a command plan; the runtime checks it against the
/// safety policy and runs it command by command.
pub struct PlanStrategy {
    client: Arc<dyn ChatCompletionClient>,
    repair_attempts: usize,
}

impl PlanStrategy {
    #[must_use]
    pub fn new(client: Arc<dyn ChatCompletionClient>, repair_attempts: usize) -> Self {
        Self {
            client,
            repair_attempts,
        }
    }

    fn request_plan(
        &self,
        request: &AgentTurnRequest,
        messages: &[ChatMessage],
        host: &mut dyn StrategyHost,
        cancel: &CancelToken,
    ) -> Result<AssistantTurn, ClientError> {
        let mut sink = PlanSink {
            host: host.tool_host(),
            filter: PlanStreamFilter::new(),
        };
        let turn = self.client.stream_assistant_turn(
            ChatTurnRequest {
                model: request.model.clone(),
                messages: messages.to_vec(),
                tools: Vec::new(),
                max_buffer_size: request.max_buffer_size,
            },
            &mut sink,
            cancel,
        );
        sink.finish();
        turn
    }

    fn accept_plan(text: &str, host: &mut dyn StrategyHost) -> Result<AiPlan, ClientError> {
        let mut plan = parse_plan_text(text).map_err(|error| {
            ClientError::with_class(format!("invalid plan: {error}"), ErrorClass::SdkError)
        })?;
        let safety = validate_plan(&mut plan).map_err(|error| {
            ClientError::with_class(format!("plan rejected: {error}"), ErrorClass::SdkError)
        })?;
        tracing::info!(
            target: "mol_agent",
            commands = plan.commands.len(),
            destructive = safety.destructive,
            "plan accepted"
        );
        for warning in &plan.warnings {
            host.notify(warning);
        }
        Ok(plan)
    }
}

impl TurnStrategy for PlanStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::Plan
    }

    fn profile(&self) -> ClientProfile {
        self.client.profile()
    }

    fn run(
        &self,
        request: AgentTurnRequest,
        host: &mut dyn StrategyHost,
        cancel: &CancelToken,
    ) -> AgentTurnResult {
        let mut messages = vec![
            ChatMessage::system(format!("{}\n\n{PLAN_INSTRUCTIONS}", request.system_prompt.trim())),
            ChatMessage::user(request.prompt.clone()),
        ];
        let mut num_turns = 1;
        let failed = |error: &ClientError, num_turns: usize| {
            let mut result = AgentTurnResult::failed(error);
            result.num_turns = num_turns;
            result
        };

        let turn = match self.request_plan(&request, &messages, host, cancel) {
            Ok(turn) => turn,
            Err(error) => return failed(&error, num_turns),
        };
        let mut plan = match Self::accept_plan(&turn.assistant_text, host) {
            Ok(plan) => plan,
            Err(error) => return failed(&error, num_turns),
        };
        messages.push(ChatMessage::assistant(turn.assistant_text));

        let mut succeeded: Vec<String> = Vec::new();
        let mut repairs_left = self.repair_attempts;
        let mut queue = plan.commands.clone();
        let mut index = 0;

        while index < queue.len() {
            if cancel.is_cancelled() {
                return failed(&ClientError::cancelled(), num_turns);
            }
            let command = queue[index].clone();
            let tool_call_id = format!("plan_{num_turns}_{}", index + 1);
            let mut arguments = Map::new();
            arguments.insert("command".to_string(), Value::String(command.clone()));
            let output = host.run_command_tool(&tool_call_id, &arguments);
            if output.is_ok() {
                succeeded.push(command);
                index += 1;
                continue;
            }

            let error = output
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string();
            if repairs_left == 0 || cancel.is_cancelled() {
                return failed(
                    &ClientError::with_class(
                        format!("plan stopped at `{command}`: {error}"),
                        ErrorClass::SdkError,
                    ),
                    num_turns,
                );
            }
            repairs_left -= 1;
            num_turns += 1;
            tracing::info!(target: "mol_agent", command = %command, error = %error, repairs_left, "repairing plan");

            messages.push(ChatMessage::user(repair_prompt(&command, &error, &succeeded)));
            let turn = match self.request_plan(&request, &messages, host, cancel) {
                Ok(turn) => turn,
                Err(error) => return failed(&error, num_turns),
            };
            plan = match Self::accept_plan(&turn.assistant_text, host) {
                Ok(plan) => plan,
                Err(error) => return failed(&error, num_turns),
            };
            messages.push(ChatMessage::assistant(turn.assistant_text));
            queue = plan.commands.clone();
            index = 0;
        }

        AgentTurnResult {
            assistant_text: plan.summary,
            num_turns,
            ..AgentTurnResult::default()
        }
    }
}

fn repair_prompt(command: &str, error: &str, succeeded: &[String]) -> String {
    let done = if succeeded.is_empty() {
        "none".to_string()
    } else {
        succeeded.join("; ")
    };
    format!(
        "The command `{command}` failed: {error}\n\
         Commands that already succeeded (do not repeat them): {done}\n\
         Return a corrected plan with the remaining commands only, at most {MAX_PLAN_COMMANDS}, \
         in a <PLAN_JSON> block."
    )
}

/// Streams visible text to the host while holding back the plan block.
struct PlanSink<'a> {
    host: &'a mut dyn AgentToolHost,
    filter: PlanStreamFilter,
}

impl PlanSink<'_> {
    fn finish(&mut self) {
        let rest = self.filter.finish();
        if !rest.is_empty() {
            self.host.on_text_chunk(&rest);
        }
    }
}

impl StreamSink for PlanSink<'_> {
    fn on_text_chunk(&mut self, chunk: &str) {
        let visible = self.filter.push(chunk);
        if !visible.is_empty() {
            self.host.on_text_chunk(&visible);
        }
    }

    fn on_reasoning_chunk(&mut self, chunk: &str) {
        self.host.on_reasoning_chunk(chunk);
    }
}

#[cfg(test)]
mod tests {
    use agent_client_mock::{ScriptedChatClient, ScriptedReply};

    use super::*;
    use crate::plan::DESTRUCTIVE_WARNING;
    use crate::strategy::testing::{request, RecordingHost};

    fn plan_reply(summary: &str, commands: &[&str]) -> ScriptedReply {
        let body = serde_json::json!({"summary": summary, "commands": commands});
        ScriptedReply::chunks([
            "Here is the plan.<PLAN_".to_string(),
            format!("JSON>{body}</PLAN_JSON>"),
        ])
    }

    #[test]
    fn plan_runs_every_command_and_hides_the_block() {
        let client = Arc::new(ScriptedChatClient::new(vec![plan_reply(
            "Show the ligand as sticks",
            &["show sticks, organic", "zoom organic"],
        )]));
        let strategy = PlanStrategy::new(client.clone(), 2);
        let mut host = RecordingHost::default();

        let result = strategy.run(request("show the ligand"), &mut host, &CancelToken::new());

        assert!(!result.is_error(), "unexpected error: {:?}", result.error);
        assert_eq!(result.assistant_text, "Show the ligand as sticks");
        assert_eq!(host.commands, vec!["show sticks, organic", "zoom organic"]);
        assert_eq!(host.call_ids, vec!["plan_1_1", "plan_1_2"]);
        assert_eq!(host.text, "Here is the plan.");
        assert!(client.requests()[0].tools.is_empty());
    }

    #[test]
    fn destructive_plans_warn_before_running() {
        let client = Arc::new(ScriptedChatClient::new(vec![plan_reply(
            "Start over",
            &["delete all", "fetch 1crn"],
        )]));
        let strategy = PlanStrategy::new(client, 0);
        let mut host = RecordingHost::default();

        let result = strategy.run(request("start over"), &mut host, &CancelToken::new());

        assert!(!result.is_error());
        assert_eq!(host.notices, vec![DESTRUCTIVE_WARNING]);
    }

    #[test]
    fn blocked_plans_are_rejected_without_running_anything() {
        let client = Arc::new(ScriptedChatClient::new(vec![plan_reply(
            "Shell out",
            &["zoom", "!rm -rf /"],
        )]));
        let strategy = PlanStrategy::new(client, 2);
        let mut host = RecordingHost::default();

        let result = strategy.run(request("clean disk"), &mut host, &CancelToken::new());

        assert_eq!(result.error_class, Some(ErrorClass::SdkError));
        assert!(result
            .error
            .as_deref()
            .is_some_and(|error| error.starts_with("plan rejected:")));
        assert!(host.commands.is_empty());
    }

    #[test]
    fn failed_command_is_repaired_and_execution_resumes() {
        let client = Arc::new(ScriptedChatClient::new(vec![
            plan_reply("Color chain A", &["fetch 1ubq", "colr red, chain A"]),
            plan_reply("Color chain A", &["color red, chain A"]),
        ]));
        let strategy = PlanStrategy::new(client.clone(), 2);
        let mut host = RecordingHost {
            fail_prefix: Some("colr".to_string()),
            ..RecordingHost::default()
        };

        let result = strategy.run(request("color chain A red"), &mut host, &CancelToken::new());

        assert!(!result.is_error(), "unexpected error: {:?}", result.error);
        assert_eq!(result.num_turns, 2);
        assert_eq!(
            host.commands,
            vec!["fetch 1ubq", "colr red, chain A", "color red, chain A"]
        );
        let repair = client.requests()[1]
            .messages
            .last()
            .map(|message| message.content().to_string())
            .expect("repair prompt");
        assert!(repair.contains("`colr red, chain A` failed"));
        assert!(repair.contains("fetch 1ubq"));
    }

    #[test]
    fn repair_budget_exhaustion_stops_at_the_failure() {
        let client = Arc::new(ScriptedChatClient::new(vec![plan_reply(
            "Broken",
            &["colr red", "zoom"],
        )]));
        let strategy = PlanStrategy::new(client, 0);
        let mut host = RecordingHost {
            fail_prefix: Some("colr".to_string()),
            ..RecordingHost::default()
        };

        let result = strategy.run(request("color"), &mut host, &CancelToken::new());

        assert_eq!(
            result.error.as_deref(),
            Some("plan stopped at `colr red`: Parsing error near 'colr red'")
        );
        assert_eq!(host.commands, vec!["colr red"]);
    }
}
