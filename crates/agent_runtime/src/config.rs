use std::path::PathBuf;
use std::time::Duration;

use agent_client_openrouter::DEFAULT_OPENROUTER_MODEL;

/// Prefix shared by every runtime environment variable.
pub const ENV_PREFIX: &str = "MOL_AGENT_";

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Which turn strategy drives the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Session-resumable agent that loops tools internally.
    #[default]
    Resumable,
    /// Streaming chat completions with the loop owned by the runtime.
    ToolLoop,
    /// One validated command plan per request.
    Plan,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resumable => "resumable",
            Self::ToolLoop => "tool_loop",
            Self::Plan => "plan",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "resumable" | "session" => Some(Self::Resumable),
            "tool_loop" | "toolloop" => Some(Self::ToolLoop),
            "plan" => Some(Self::Plan),
            _ => None,
        }
    }
}

/// Runtime tunables. Every field has a default and can be overridden through
/// a `MOL_AGENT_*` environment variable.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub model: String,
    pub max_steps: usize,
    pub tool_result_max_chars: usize,
    /// Seconds a tool call may take before the slow-tool notice. Negative
    /// disables the notice.
    pub long_tool_warn_sec: f64,
    pub screenshot_validate_required: bool,
    /// Event queue capacity. Zero means unbounded.
    pub ui_max_events: usize,
    pub ui_event_batch: usize,
    pub final_answer_enabled: bool,
    /// Kill switch. When set, AI mode cannot be enabled.
    pub disabled: bool,
    pub sdk_max_buffer_size: usize,
    pub screenshot_width: u32,
    pub screenshot_height: u32,
    pub state_max_objects: usize,
    pub state_max_selections: usize,
    pub doom_loop_threshold: usize,
    pub backend: BackendKind,
    pub plan_repair_attempts: usize,
    pub trace_stream: bool,
    pub base_url: String,
    pub chat_root: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_OPENROUTER_MODEL.to_string(),
            max_steps: 16,
            tool_result_max_chars: 4096,
            long_tool_warn_sec: 8.0,
            screenshot_validate_required: true,
            ui_max_events: 2000,
            ui_event_batch: 40,
            final_answer_enabled: true,
            disabled: false,
            sdk_max_buffer_size: 10 * 1024 * 1024,
            screenshot_width: 1024,
            screenshot_height: 0,
            state_max_objects: 30,
            state_max_selections: 20,
            doom_loop_threshold: 3,
            backend: BackendKind::Resumable,
            plan_repair_attempts: 2,
            trace_stream: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_root: None,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`, which receives full variable names.
    /// Missing or malformed values keep their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let model = read("MODEL").unwrap_or(defaults.model);
        let base_url = read("BASE_URL").unwrap_or(defaults.base_url);
        let backend = read("BACKEND")
            .and_then(|value| BackendKind::parse(&value))
            .unwrap_or(defaults.backend);
        let long_tool_warn_sec = read("LONG_TOOL_WARN_SEC")
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(defaults.long_tool_warn_sec);

        Self {
            model,
            max_steps: parse_or(read("MAX_STEPS"), defaults.max_steps).max(1),
            tool_result_max_chars: parse_or(
                read("TOOL_RESULT_MAX_CHARS"),
                defaults.tool_result_max_chars,
            ),
            long_tool_warn_sec,
            screenshot_validate_required: flag_or(
                read("SCREENSHOT_VALIDATE_REQUIRED"),
                defaults.screenshot_validate_required,
            ),
            ui_max_events: parse_or(read("UI_MAX_EVENTS"), defaults.ui_max_events),
            ui_event_batch: parse_or(read("UI_EVENT_BATCH"), defaults.ui_event_batch).max(1),
            final_answer_enabled: flag_or(read("FINAL_ANSWER"), defaults.final_answer_enabled),
            disabled: flag_or(read("DISABLE"), defaults.disabled),
            sdk_max_buffer_size: parse_or(
                read("SDK_MAX_BUFFER_SIZE"),
                defaults.sdk_max_buffer_size,
            ),
            screenshot_width: parse_or(read("SCREENSHOT_WIDTH"), defaults.screenshot_width),
            screenshot_height: parse_or(read("SCREENSHOT_HEIGHT"), defaults.screenshot_height),
            state_max_objects: parse_or(read("STATE_MAX_OBJECTS"), defaults.state_max_objects),
            state_max_selections: parse_or(
                read("STATE_MAX_SELECTIONS"),
                defaults.state_max_selections,
            ),
            doom_loop_threshold: parse_or(
                read("DOOM_LOOP_THRESHOLD"),
                defaults.doom_loop_threshold,
            )
            .max(2),
            backend,
            plan_repair_attempts: parse_or(
                read("PLAN_REPAIR_ATTEMPTS"),
                defaults.plan_repair_attempts,
            ),
            trace_stream: flag_or(read("TRACE_STREAM"), defaults.trace_stream),
            base_url,
            chat_root: read("CHAT_ROOT").map(PathBuf::from),
        }
    }

    /// Slow-tool notice threshold, or `None` when the notice is disabled.
    #[must_use]
    pub fn long_tool_warn_threshold(&self) -> Option<Duration> {
        (self.long_tool_warn_sec >= 0.0).then(|| Duration::from_secs_f64(self.long_tool_warn_sec))
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn flag_or(value: Option<String>, default: bool) -> bool {
    match value.map(|value| value.to_ascii_lowercase()).as_deref() {
        Some("1" | "true" | "yes" | "on") => true,
        Some("0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
