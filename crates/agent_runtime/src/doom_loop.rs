use std::collections::{HashMap, VecDeque};

use agent_client::{RUN_COMMAND_TOOL, SNAPSHOT_TOOL};
use serde_json::{Map, Value};

/// Shortest normalized intent that counts toward `assistant_intent_repeat`.
const MIN_INTENT_CHARS: usize = 20;

/// Fewest family entries that can show an alternation: `a, b, a`.
const MIN_OSCILLATION_WINDOW: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    ExactMatch,
    CommandFamilyRepeat,
    CommandFamilyOscillation,
    AssistantIntentRepeat,
}

impl LoopKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExactMatch => "exact_match",
            Self::CommandFamilyRepeat => "command_family_repeat",
            Self::CommandFamilyOscillation => "command_family_oscillation",
            Self::AssistantIntentRepeat => "assistant_intent_repeat",
        }
    }
}

/// One detected repetition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub kind: LoopKind,
    pub tool_name: String,
    pub call_count: usize,
    /// Window contents for oscillation reports.
    pub sequence: Vec<String>,
    /// Command family the loop is stuck on, when there is one.
    pub family: Option<String>,
}

impl LoopReport {
    /// Hidden steering text handed back to the model.
    #[must_use]
    pub fn corrective_message(&self) -> String {
        let detail = match self.kind {
            LoopKind::ExactMatch => format!(
                "`{}` was called {} times in a row with identical arguments",
                self.tool_name, self.call_count
            ),
            LoopKind::CommandFamilyRepeat => format!(
                "{} consecutive `{}` calls without progress",
                self.call_count,
                self.family.as_deref().unwrap_or(&self.tool_name)
            ),
            LoopKind::CommandFamilyOscillation => format!(
                "alternating between the same two commands ({})",
                self.sequence.join(" -> ")
            ),
            LoopKind::AssistantIntentRepeat => format!(
                "the same intent was restated {} times",
                self.call_count
            ),
        };
        format!(
            "Loop detected: {detail}. Stop repeating this step; change approach or ask the user for clarification."
        )
    }
}

/// Sliding-window repetition detector over tool calls and assistant intents.
///
/// Repeats are judged over the last `threshold` calls. Oscillation needs at
/// least three family entries, so at threshold 2 it is judged over three.
#[derive(Debug, Clone)]
pub struct DoomLoopDetector {
    threshold: usize,
    family_window: usize,
    exact: VecDeque<(String, String, bool)>,
    families: VecDeque<String>,
    intents: VecDeque<String>,
}

impl DoomLoopDetector {
    /// Thresholds below 2 are raised to 2.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(2);
        let family_window = threshold.max(MIN_OSCILLATION_WINDOW);
        Self {
            threshold,
            family_window,
            exact: VecDeque::with_capacity(threshold),
            families: VecDeque::with_capacity(family_window),
            intents: VecDeque::with_capacity(threshold),
        }
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Records one tool call. Snapshot calls are exempt.
    pub fn add_call(
        &mut self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        validation_pending: bool,
    ) -> Option<LoopReport> {
        if tool_name == SNAPSHOT_TOOL {
            return None;
        }

        let signature = (
            tool_name.to_string(),
            sorted_json(arguments),
            validation_pending,
        );
        push_bounded(&mut self.exact, signature, self.threshold);
        let family = command_family(tool_name, arguments);
        push_bounded(&mut self.families, family.clone(), self.family_window);

        if self.exact.len() == self.threshold && all_equal(&self.exact) {
            return Some(LoopReport {
                kind: LoopKind::ExactMatch,
                tool_name: tool_name.to_string(),
                call_count: self.threshold,
                sequence: Vec::new(),
                family: Some(family),
            });
        }

        if self.families.len() < self.threshold {
            return None;
        }
        if self
            .families
            .iter()
            .rev()
            .take(self.threshold)
            .all(|entry| *entry == family)
        {
            return Some(LoopReport {
                kind: LoopKind::CommandFamilyRepeat,
                tool_name: tool_name.to_string(),
                call_count: self.threshold,
                sequence: Vec::new(),
                family: Some(family),
            });
        }
        if self.families.len() == self.family_window && is_oscillating(&self.families) {
            return Some(LoopReport {
                kind: LoopKind::CommandFamilyOscillation,
                tool_name: tool_name.to_string(),
                call_count: self.family_window,
                sequence: self.families.iter().cloned().collect(),
                family: Some(family),
            });
        }
        None
    }

    /// Records assistant text produced between tool calls.
    pub fn add_assistant_intent(&mut self, text: &str) -> Option<LoopReport> {
        let intent = normalize_intent(text);
        if intent.is_empty() {
            return None;
        }
        push_bounded(&mut self.intents, intent, self.threshold);
        if self.intents.len() < self.threshold {
            return None;
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for intent in &self.intents {
            *counts.entry(intent.as_str()).or_default() += 1;
        }
        let (top, count) = counts
            .into_iter()
            .max_by(|left, right| left.1.cmp(&right.1).then_with(|| right.0.cmp(left.0)))?;
        if top.chars().count() >= MIN_INTENT_CHARS && count >= self.threshold - 1 {
            return Some(LoopReport {
                kind: LoopKind::AssistantIntentRepeat,
                tool_name: "assistant".to_string(),
                call_count: count,
                sequence: Vec::new(),
                family: None,
            });
        }
        None
    }

    pub fn clear(&mut self) {
        self.exact.clear();
        self.families.clear();
        self.intents.clear();
    }
}

/// Tool name, plus the lowercased first command token for the command tool.
#[must_use]
pub fn command_family(tool_name: &str, arguments: &Map<String, Value>) -> String {
    if tool_name != RUN_COMMAND_TOOL {
        return tool_name.to_string();
    }
    let first = arguments
        .get("command")
        .and_then(Value::as_str)
        .and_then(|command| command.split_whitespace().next())
        .map(|token| token.trim_end_matches(',').to_ascii_lowercase())
        .unwrap_or_default();
    format!("{tool_name}:{first}")
}

/// Lowercased, punctuation stripped, whitespace collapsed.
#[must_use]
pub fn normalize_intent(text: &str) -> String {
    let stripped = text
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        .collect::<String>();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn sorted_json(arguments: &Map<String, Value>) -> String {
    // Key order must not depend on serde_json's map feature flags.
    let sorted = arguments
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<std::collections::BTreeMap<_, _>>();
    serde_json::to_string(&sorted).unwrap_or_else(|_| "{}".to_string())
}

fn push_bounded<T>(window: &mut VecDeque<T>, item: T, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(item);
}

fn all_equal<T: PartialEq>(window: &VecDeque<T>) -> bool {
    window
        .front()
        .is_some_and(|first| window.iter().all(|item| item == first))
}

fn is_oscillating(window: &VecDeque<String>) -> bool {
    let mut distinct = window.iter().collect::<Vec<_>>();
    distinct.sort();
    distinct.dedup();
    distinct.len() == 2
        && window
            .iter()
            .zip(window.iter().skip(1))
            .all(|(left, right)| left != right)
}

/// What the runtime should do about the latest observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    /// First detection: steer the model and keep going.
    Warn(LoopReport),
    /// Repeated detection without progress: stop the turn.
    Abort(LoopReport),
}

/// Two-strike circuit breaker on top of [`DoomLoopDetector`].
#[derive(Debug, Clone)]
pub struct LoopGuard {
    detector: DoomLoopDetector,
    warned: bool,
    stalled_family: Option<String>,
}

impl LoopGuard {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            detector: DoomLoopDetector::new(threshold),
            warned: false,
            stalled_family: None,
        }
    }

    pub fn observe_call(
        &mut self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        validation_pending: bool,
    ) -> Verdict {
        let report = self
            .detector
            .add_call(tool_name, arguments, validation_pending);
        self.escalate(report)
    }

    pub fn observe_intent(&mut self, text: &str) -> Verdict {
        let report = self.detector.add_assistant_intent(text);
        self.escalate(report)
    }

    /// A successful command outside the stalled family re-arms the guard.
    pub fn record_outcome(&mut self, tool_name: &str, arguments: &Map<String, Value>, ok: bool) {
        if !self.warned || !ok || tool_name != RUN_COMMAND_TOOL {
            return;
        }
        let family = command_family(tool_name, arguments);
        if self.stalled_family.as_deref() != Some(family.as_str()) {
            self.warned = false;
            self.stalled_family = None;
            self.detector.clear();
        }
    }

    #[must_use]
    pub fn is_warned(&self) -> bool {
        self.warned
    }

    fn escalate(&mut self, report: Option<LoopReport>) -> Verdict {
        let Some(report) = report else {
            return Verdict::Clear;
        };
        if self.warned {
            return Verdict::Abort(report);
        }
        self.warned = true;
        self.stalled_family = report.family.clone();
        Verdict::Warn(report)
    }
}
