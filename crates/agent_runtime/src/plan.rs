//! Command plans: the `<PLAN_JSON>` stream filter, plan parsing and the
//! safety policy applied before any plan command runs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub const PLAN_JSON_START: &str = "<PLAN_JSON>";
pub const PLAN_JSON_END: &str = "</PLAN_JSON>";
pub const MAX_PLAN_COMMANDS: usize = 10;
pub const DESTRUCTIVE_WARNING: &str = "Destructive commands detected. Extra confirmation required.";

const DESTRUCTIVE_PREFIXES: [&str; 4] = ["delete", "remove", "reinitialize", "reset"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("no JSON plan found in model response")]
    NotFound,

    #[error("plan JSON is invalid: {message}")]
    InvalidJson { message: String },

    #[error("'commands' must be a list or string")]
    MalformedCommands,

    #[error("missing plan summary")]
    MissingSummary,

    #[error("plan must contain at least one command")]
    NoCommands,

    #[error("plan contains blocked command syntax: {command:?}")]
    BlockedCommand { command: String },

    #[error("plan has {count} commands, limit is {limit}")]
    TooManyCommands { count: usize, limit: usize },
}

/// A validated-shape plan proposed by the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AiPlan {
    pub summary: String,
    pub commands: Vec<String>,
    pub warnings: Vec<String>,
    pub reasoning: String,
}

impl AiPlan {
    /// Accepts `commands` as an array or a newline-separated string and
    /// `warnings` as an array or a single string.
    pub fn from_value(value: &Value) -> Result<Self, PlanError> {
        let text = |key: &str| {
            value
                .get(key)
                .map(value_text)
                .map(|text| text.trim().to_string())
                .unwrap_or_default()
        };
        let summary = text("summary");
        let reasoning = text("reasoning");

        let commands = match value.get("commands") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(lines)) => lines.lines().map(str::to_string).collect(),
            Some(Value::Array(items)) => items.iter().map(value_text).collect(),
            Some(_) => return Err(PlanError::MalformedCommands),
        };
        let warnings = match value.get("warnings") {
            Some(Value::String(warning)) => vec![warning.clone()],
            Some(Value::Array(items)) => items.iter().map(value_text).collect(),
            _ => Vec::new(),
        };

        let commands = non_empty_trimmed(commands);
        let warnings = non_empty_trimmed(warnings);
        if summary.is_empty() {
            return Err(PlanError::MissingSummary);
        }
        if commands.is_empty() {
            return Err(PlanError::NoCommands);
        }

        Ok(Self {
            summary,
            commands,
            warnings,
            reasoning,
        })
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn non_empty_trimmed(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub fn parse_plan_text(text: &str) -> Result<AiPlan, PlanError> {
    AiPlan::from_value(&extract_plan_json(text)?)
}

/// JSON between the plan markers, or else the last balanced `{...}` object.
pub fn extract_plan_json(text: &str) -> Result<Value, PlanError> {
    let candidate = text
        .split_once(PLAN_JSON_START)
        .and_then(|(_, rest)| rest.split_once(PLAN_JSON_END))
        .map(|(inner, _)| inner.trim())
        .or_else(|| last_balanced_object(text))
        .ok_or(PlanError::NotFound)?;
    serde_json::from_str(candidate).map_err(|error| PlanError::InvalidJson {
        message: error.to_string(),
    })
}

fn last_balanced_object(text: &str) -> Option<&str> {
    let mut last = None;
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = index;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    last = Some(&text[start..=index]);
                }
            }
            _ => {}
        }
    }
    last
}

fn blocked_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(/|!|python\s+|_($|\s+))").expect("blocked prefix regex must compile")
    })
}

fn broad_edit() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^alter\b.*\b(all|\*)\b").expect("broad edit regex must compile")
    })
}

#[must_use]
pub fn is_destructive_command(command: &str) -> bool {
    let text = command.trim().to_lowercase();
    if text.is_empty() {
        return false;
    }
    DESTRUCTIVE_PREFIXES.iter().any(|prefix| {
        text == *prefix
            || text
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(' '))
    }) || broad_edit().is_match(&text)
}

#[must_use]
pub fn is_blocked_command(command: &str) -> bool {
    let text = command.trim();
    text.is_empty() || blocked_prefix().is_match(text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyResult {
    pub destructive: bool,
}

/// Rejects blocked syntax and oversized plans, and adds the destructive
/// warning once when any command is destructive.
pub fn validate_plan(plan: &mut AiPlan) -> Result<SafetyResult, PlanError> {
    if let Some(command) = plan.commands.iter().find(|command| is_blocked_command(command)) {
        return Err(PlanError::BlockedCommand {
            command: command.clone(),
        });
    }
    if plan.commands.len() > MAX_PLAN_COMMANDS {
        return Err(PlanError::TooManyCommands {
            count: plan.commands.len(),
            limit: MAX_PLAN_COMMANDS,
        });
    }

    let destructive = plan
        .commands
        .iter()
        .any(|command| is_destructive_command(command));
    if destructive && !plan.warnings.iter().any(|warning| warning == DESTRUCTIVE_WARNING) {
        plan.warnings.push(DESTRUCTIVE_WARNING.to_string());
    }
    Ok(SafetyResult { destructive })
}

/// Strips the plan block from streamed text as it arrives.
///
/// Text before the start marker passes through, text inside the block is
/// captured, and text after the end marker passes through again. A chunk
/// ending in a partial marker is held back until the next chunk decides it.
#[derive(Debug, Clone, Default)]
pub struct PlanStreamFilter {
    pending: String,
    inside: bool,
    captured: String,
}

impl PlanStreamFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the text that may be shown now.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut visible = String::new();
        loop {
            let marker = if self.inside { PLAN_JSON_END } else { PLAN_JSON_START };
            if let Some(position) = self.pending.find(marker) {
                let before = self.pending[..position].to_string();
                self.pending.drain(..position + marker.len());
                if self.inside {
                    self.captured.push_str(&before);
                } else {
                    visible.push_str(&before);
                }
                self.inside = !self.inside;
                continue;
            }

            let held = partial_marker_len(&self.pending, marker);
            let ready = self.pending.len() - held;
            let text = self.pending[..ready].to_string();
            self.pending.drain(..ready);
            if self.inside {
                self.captured.push_str(&text);
            } else {
                visible.push_str(&text);
            }
            return visible;
        }
    }

    /// Flushes held-back text at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if self.inside {
            self.captured.push_str(&rest);
            String::new()
        } else {
            rest
        }
    }

    /// Text seen inside plan blocks so far.
    #[must_use]
    pub fn captured(&self) -> &str {
        &self.captured
    }
}

/// Length of the longest proper prefix of `marker` that `text` ends with.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    let bytes = text.as_bytes();
    (1..marker.len())
        .rev()
        .find(|&len| bytes.ends_with(&marker.as_bytes()[..len]))
        .unwrap_or(0)
}
