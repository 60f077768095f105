//! The `/ai` and `/cli` control grammar.

pub const AI_HELP: &str =
    "/ai (same as /ai on) | /ai on | /ai off | /ai model <id> | /ai clear | /ai help";
pub const CLI_HELP: &str = "/cli | /cli off | /cli <command>";
pub const MISSING_CREDENTIAL: &str =
    "credential is not set. Export OPENROUTER_API_KEY (or ANTHROPIC_AUTH_TOKEN) and retry /ai on";
pub const KILL_SWITCH_SET: &str = "MOL_AGENT_DISABLE=1 is set. Unset it to enable AI";
pub const MODEL_USAGE: &str = "usage: /ai model <model_id>";
pub const UNKNOWN_AI_COMMAND: &str = "unknown /ai command. Try /ai help";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AiControl {
    On,
    Off,
    /// `None` when the id is missing.
    Model(Option<String>),
    Clear,
    Help,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliControl {
    On,
    Off,
    Help,
    /// One-shot execution without switching mode.
    Execute(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Ai(AiControl),
    Cli(CliControl),
}

/// Parses a control line. Returns `None` for anything that is not `/ai` or
/// `/cli` followed by whitespace or end of input.
#[must_use]
pub fn parse_control(input: &str) -> Option<ControlCommand> {
    let trimmed = input.trim();
    if let Some(rest) = control_rest(trimmed, "/cli") {
        return Some(ControlCommand::Cli(parse_cli(rest.trim())));
    }
    control_rest(trimmed, "/ai").map(|rest| ControlCommand::Ai(parse_ai(rest)))
}

fn control_rest<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = input.strip_prefix(keyword)?;
    (rest.is_empty() || rest.starts_with(char::is_whitespace)).then_some(rest)
}

fn parse_ai(rest: &str) -> AiControl {
    let mut parts = rest.split_whitespace();
    let Some(action) = parts.next() else {
        return AiControl::On;
    };
    match action.to_lowercase().as_str() {
        "on" => AiControl::On,
        "off" => AiControl::Off,
        "help" => AiControl::Help,
        "clear" => AiControl::Clear,
        "model" => AiControl::Model(parts.next().map(str::to_string)),
        other => AiControl::Unknown(other.to_string()),
    }
}

fn parse_cli(rest: &str) -> CliControl {
    match rest {
        "" | "on" => CliControl::On,
        "off" => CliControl::Off,
        "help" => CliControl::Help,
        command => CliControl::Execute(command.to_string()),
    }
}
