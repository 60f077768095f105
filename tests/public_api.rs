#![allow(unused_imports)]

use mol_agent::client::{
    classify_error, viewer_tool_definitions, AgentTurnRequest, AgentTurnResult, ToolCall,
    ToolOutput, RUN_COMMAND_TOOL, SNAPSHOT_TOOL,
};
use mol_agent::mock::{ScriptedAgentClient, ScriptedChatClient};
use mol_agent::openrouter::{SessionAgentClient, SESSION_ID_PREFIX};
use mol_agent::runtime::demo::DemoViewer;
use mol_agent::runtime::strategy::{PlanStrategy, ResumableStrategy, ToolLoopStrategy};
use mol_agent::store::{ManualClock, SystemClock};
use mol_agent::{
    build_strategy, AgentRuntime, BackendKind, CancelReason, CancelToken, ChatMessage,
    ChatSession, ChatStore, ChatStoreOptions, ClientError, Credentials, ErrorClass, HostContext,
    HostError, HostThread, InlineHostContext, InputMode, RuntimeConfig, RuntimeError,
    RuntimeState, TurnStrategy, UiEvent, UiRole, ViewerHost,
};

#[test]
fn public_api_exports_compile() {}
