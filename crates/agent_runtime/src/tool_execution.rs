use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::host::ViewerHost;

pub const TRUNCATION_SUFFIX: &str = "... [truncated]";

/// First-token prefixes of commands that only read viewer state.
const READ_ONLY_PREFIXES: [&str; 5] = ["get_", "count_", "iterate", "indicate", "help"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolExecutionResult {
    pub ok: bool,
    pub command: String,
    pub error: Option<String>,
    pub feedback_lines: Vec<String>,
}

impl ToolExecutionResult {
    #[must_use]
    pub fn failure(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            command: command.into(),
            error: Some(error.into()),
            feedback_lines: Vec::new(),
        }
    }

    /// `{ok, command, error|null, feedback_lines}` as handed to the model.
    #[must_use]
    pub fn payload(&self) -> Value {
        json!({
            "ok": self.ok,
            "command": self.command,
            "error": self.error,
            "feedback_lines": self.feedback_lines,
        })
    }
}

/// Runs one scripting command. Must be called on the host context.
pub fn execute_command(host: &mut dyn ViewerHost, command: &str) -> ToolExecutionResult {
    let command = command.trim();
    if command.is_empty() {
        return ToolExecutionResult::failure(command, "empty command");
    }

    let outcome = host.execute(command);
    let error = if outcome.ok {
        None
    } else {
        Some(
            outcome
                .error
                .filter(|error| !error.trim().is_empty())
                .unwrap_or_else(|| "command failed".to_string()),
        )
    };
    ToolExecutionResult {
        ok: outcome.ok,
        command: command.to_string(),
        error,
        feedback_lines: outcome.feedback_lines,
    }
}

fn structure_id() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[0-9][A-Za-z0-9]{3}$").expect("structure id regex must compile")
    })
}

/// Rewrites `load <id>` to `fetch <id>` for four-character structure ids.
/// Returns the command and, when rewritten, a note for the transcript.
#[must_use]
pub fn canonicalize_command(command: &str) -> (String, Option<String>) {
    let stripped = command.trim();
    let is_load = stripped
        .get(..5)
        .is_some_and(|head| head.eq_ignore_ascii_case("load "));
    if is_load {
        let argument = stripped[5..].trim();
        if structure_id().is_match(argument) {
            return (
                format!("fetch {argument}"),
                Some(format!("translated load {argument} -> fetch {argument}")),
            );
        }
    }
    (stripped.to_string(), None)
}

#[must_use]
pub fn is_state_changing_command(command: &str) -> bool {
    let lowered = command.trim().to_lowercase();
    let Some(first) = lowered.split_whitespace().next() else {
        return false;
    };
    !READ_ONLY_PREFIXES
        .iter()
        .any(|prefix| first.starts_with(prefix))
}

/// Lowercase with whitespace runs collapsed; used for CLI tool call ids.
#[must_use]
pub fn normalized_command_key(command: &str) -> String {
    command
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cuts `text` to `max_chars` characters and marks the cut.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_SUFFIX}", &text[..cut]),
        None => text.to_string(),
    }
}

/// Event metadata form of a tool payload: the payload itself, or a preview
/// when its serialization exceeds `max_chars`.
#[must_use]
pub fn metadata_payload(payload: &Value, max_chars: usize) -> Value {
    let serialized = payload.to_string();
    if serialized.chars().count() <= max_chars {
        return payload.clone();
    }
    json!({
        "truncated": true,
        "preview": truncate_chars(&serialized, max_chars),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoViewer;

    #[test]
    fn empty_and_failing_commands_report_errors() {
        let mut viewer = DemoViewer::new();
        viewer.fail_commands_starting_with("color");

        let empty = execute_command(&mut viewer, "   ");
        let failed = execute_command(&mut viewer, "color red");

        assert_eq!(empty.error.as_deref(), Some("empty command"));
        assert!(!failed.ok);
        assert_eq!(failed.error.as_deref(), Some("Parsing error near 'color'"));
        assert_eq!(failed.feedback_lines.len(), 1);
    }

    #[test]
    fn load_of_a_structure_id_becomes_fetch() {
        assert_eq!(
            canonicalize_command("  load 1ubq "),
            (
                "fetch 1ubq".to_string(),
                Some("translated load 1ubq -> fetch 1ubq".to_string())
            )
        );
        assert_eq!(canonicalize_command("load ./1ubq.pdb").1, None);
        assert_eq!(canonicalize_command("load abcd").1, None);
        assert_eq!(canonicalize_command("LOAD 4hhb").0, "fetch 4hhb");
    }

    #[test]
    fn read_only_prefixes_are_not_state_changing() {
        assert!(is_state_changing_command("color red, chain A"));
        assert!(is_state_changing_command("fetch 1ubq"));
        assert!(!is_state_changing_command("get_names"));
        assert!(!is_state_changing_command("count_atoms all"));
        assert!(!is_state_changing_command("Iterate all, print(name)"));
        assert!(!is_state_changing_command("   "));
    }

    #[test]
    fn command_key_collapses_whitespace() {
        assert_eq!(normalized_command_key("  Show   Cartoon,\tall "), "show cartoon, all");
    }

    #[test]
    fn oversized_payload_becomes_a_preview_of_exact_length() {
        let payload = json!({"ok": true, "feedback_lines": ["x".repeat(100)]});

        let preview = metadata_payload(&payload, 32);

        assert_eq!(preview["truncated"], true);
        let text = preview["preview"].as_str().expect("preview text");
        assert_eq!(text.chars().count(), 32 + TRUNCATION_SUFFIX.len());
        assert!(text.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(metadata_payload(&payload, 4096), payload);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_chars("ångström", 3), format!("ång{TRUNCATION_SUFFIX}"));
        assert_eq!(truncate_chars("short", 10), "short");
    }
}
