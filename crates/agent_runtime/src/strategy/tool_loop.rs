use std::sync::Arc;

use agent_client::{
    append_tool_output, dispatch_tool_call, viewer_tool_definitions, AgentTurnRequest,
    AgentTurnResult, CancelToken, ChatCompletionClient, ChatMessage, ChatTurnRequest, ClientError,
    ClientProfile, HostSink, ToolOutput,
};
use serde_json::json;

use super::{StrategyHost, TurnStrategy};
use crate::config::BackendKind;

/// Runtime-owned tool loop over single streaming completions.
///
/// Each turn starts from the system prompt and the user prompt; nothing is
/// remembered between turns.
pub struct ToolLoopStrategy {
    client: Arc<dyn ChatCompletionClient>,
}

impl ToolLoopStrategy {
    #[must_use]
    pub fn new(client: Arc<dyn ChatCompletionClient>) -> Self {
        Self { client }
    }
}

impl TurnStrategy for ToolLoopStrategy {
    fn backend(&self) -> BackendKind {
        BackendKind::ToolLoop
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
        let mut messages = Vec::new();
        if !request.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(request.system_prompt.clone()));
        }
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
                let mut sink = HostSink::new(host.tool_host());
                self.client.stream_assistant_turn(
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
                    let mut result = AgentTurnResult::failed(&error);
                    result.num_turns = num_turns;
                    return result;
                }
            };

            if turn.tool_calls.is_empty() {
                assistant_text = turn.assistant_text;
                break;
            }

            tracing::debug!(target: "mol_agent", step = num_turns, tool_calls = turn.tool_calls.len(), "model requested tools");
            messages.push(ChatMessage::assistant_with_tool_calls(
                turn.assistant_text,
                turn.tool_calls.clone(),
            ));
            for call in &turn.tool_calls {
                let output = if cancel.is_cancelled() {
                    ToolOutput::new(json!({"ok": false, "error": "cancelled"}))
                } else {
                    dispatch_tool_call(host.tool_host(), call)
                };
                append_tool_output(&mut messages, call, &output);
            }
        }

        if cancel.is_cancelled() {
            let mut result = AgentTurnResult::failed(&ClientError::cancelled());
            result.assistant_text = assistant_text;
            result.num_turns = num_turns;
            return result;
        }

        AgentTurnResult {
            assistant_text,
            num_turns,
            ..AgentTurnResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use agent_client::{ErrorClass, ToolCall};
    use agent_client_mock::{command_call, snapshot_call, ScriptedChatClient, ScriptedReply};

    use super::*;
    use crate::strategy::testing::{request, RecordingHost};

    #[test]
    fn loop_feeds_tool_results_back_until_a_final_answer() {
        let client = Arc::new(ScriptedChatClient::new(vec![
            ScriptedReply::tool_calls(vec![command_call("c1", "fetch 1ubq")]),
            ScriptedReply::tool_calls(vec![snapshot_call("c2", "verify")]),
            ScriptedReply::chunks(["Loaded ", "1ubq."]),
        ]));
        let strategy = ToolLoopStrategy::new(client.clone());
        let mut host = RecordingHost::default();

        let result = strategy.run(request("load ubiquitin"), &mut host, &CancelToken::new());

        assert!(!result.is_error(), "unexpected error: {:?}", result.error);
        assert_eq!(result.assistant_text, "Loaded 1ubq.");
        assert_eq!(result.num_turns, 3);
        assert_eq!(result.session_id, None);
        assert_eq!(host.commands, vec!["fetch 1ubq"]);
        assert_eq!(host.snapshots, 1);

        let requests = client.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].messages[0].role(), "system");
        let last = &requests[2].messages;
        assert!(last.iter().any(|message| matches!(
            message,
            ChatMessage::Tool { tool_call_id, .. } if tool_call_id == "c2"
        )));
        assert!(last.iter().any(|message| matches!(
            message,
            ChatMessage::User { images, .. } if images.len() == 1
        )));
    }

    #[test]
    fn step_budget_stops_the_loop_without_text() {
        let client = Arc::new(ScriptedChatClient::new(vec![
            ScriptedReply::tool_calls(vec![command_call("c1", "turn y, 10")]),
            ScriptedReply::tool_calls(vec![command_call("c2", "turn y, 10")]),
        ]));
        let strategy = ToolLoopStrategy::new(client);
        let mut limited = request("spin");
        limited.max_turns = 2;

        let result = strategy.run(limited, &mut RecordingHost::default(), &CancelToken::new());

        assert!(!result.is_error());
        assert_eq!(result.num_turns, 2);
        assert!(result.assistant_text.is_empty());
    }

    #[test]
    fn unknown_tools_are_reported_back_to_the_model() {
        let client = Arc::new(ScriptedChatClient::new(vec![
            ScriptedReply::tool_calls(vec![ToolCall::from_raw("c1", "shell", "{\"cmd\":\"ls\"}")]),
            ScriptedReply::text("I cannot do that."),
        ]));
        let strategy = ToolLoopStrategy::new(client.clone());

        let result = strategy.run(request("ls"), &mut RecordingHost::default(), &CancelToken::new());

        assert_eq!(result.assistant_text, "I cannot do that.");
        let tool_message = client.requests()[1]
            .messages
            .iter()
            .find(|message| message.role() == "tool")
            .map(|message| message.content().to_string())
            .expect("tool result should be sent back");
        assert!(tool_message.contains("unsupported_tool: shell"));
    }

    #[test]
    fn transport_failure_is_classified() {
        let client = Arc::new(ScriptedChatClient::new(vec![ScriptedReply::failure(
            ClientError::new("HTTP 401: invalid api key"),
        )]));
        let strategy = ToolLoopStrategy::new(client);

        let result = strategy.run(request("hi"), &mut RecordingHost::default(), &CancelToken::new());

        assert_eq!(result.error_class, Some(ErrorClass::AuthError));
        assert_eq!(result.num_turns, 1);
    }

    #[test]
    fn cancelled_before_start_reports_interrupted() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let strategy = ToolLoopStrategy::new(Arc::new(ScriptedChatClient::default()));

        let result = strategy.run(request("hi"), &mut RecordingHost::default(), &cancel);

        assert!(result.interrupted);
        assert_eq!(result.error_class, Some(ErrorClass::Cancelled));
        assert_eq!(result.num_turns, 0);
    }
}
