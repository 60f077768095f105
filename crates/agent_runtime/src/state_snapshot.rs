use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::host::ViewerHost;

const RECENT_RESULTS_KEPT: usize = 20;
const RECENT_RESULTS_REPORTED: usize = 10;
const RECENT_ERROR_MAX_CHARS: usize = 240;

/// Size limits applied while summarizing the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLimits {
    pub max_objects: usize,
    pub max_selections: usize,
    pub max_selection_atoms: usize,
    pub max_detailed_selections: usize,
    /// Selections larger than this get counts only.
    pub max_atom_count_for_details: i64,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            max_objects: 30,
            max_selections: 20,
            max_selection_atoms: 12,
            max_detailed_selections: 4,
            max_atom_count_for_details: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentToolResult {
    pub command: String,
    pub ok: bool,
    pub error: String,
}

/// Rolling window of the last host command outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentToolResults {
    entries: VecDeque<RecentToolResult>,
}

impl RecentToolResults {
    pub fn remember(&mut self, command: &str, ok: bool, error: Option<&str>) {
        let error = error
            .map(|error| error.chars().take(RECENT_ERROR_MAX_CHARS).collect())
            .unwrap_or_default();
        self.entries.push_back(RecentToolResult {
            command: command.to_string(),
            ok,
            error,
        });
        while self.entries.len() > RECENT_RESULTS_KEPT {
            self.entries.pop_front();
        }
    }

    /// The most recent entries reported in a summary.
    #[must_use]
    pub fn latest(&self) -> Vec<RecentToolResult> {
        let skip = self.entries.len().saturating_sub(RECENT_RESULTS_REPORTED);
        self.entries.iter().skip(skip).cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Compact JSON view of the scene sent with every turn prompt and snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewerStateSummary {
    pub objects: Vec<String>,
    pub enabled_objects: Vec<String>,
    pub object_list: Vec<String>,
    pub selections: Vec<String>,
    pub selection_counts: BTreeMap<String, i64>,
    pub selection_atom_ids: BTreeMap<String, Vec<String>>,
    pub selection_atom_ids_truncated: BTreeMap<String, bool>,
    pub vis: Value,
    pub view: Vec<f64>,
    pub viewport: Vec<u32>,
    pub recent_tool_results: Vec<RecentToolResult>,
}

/// Summarizes the viewer. Every failed query degrades to an empty value.
/// Must be called on the host context.
pub fn build_viewer_state_summary(
    host: &mut dyn ViewerHost,
    limits: StateLimits,
    recent: &[RecentToolResult],
) -> ViewerStateSummary {
    let objects = host.object_names(false).unwrap_or_default();
    let enabled_objects = host.object_names(true).unwrap_or_default();
    let selections = host
        .selection_names()
        .unwrap_or_default()
        .into_iter()
        .take(limits.max_selections)
        .collect::<Vec<_>>();

    let selection_counts = selections
        .iter()
        .map(|name| (name.clone(), host.count_atoms(name).unwrap_or(-1)))
        .collect::<BTreeMap<_, _>>();

    let mut selection_atom_ids = BTreeMap::new();
    let mut selection_atom_ids_truncated = BTreeMap::new();
    for name in &selections {
        if selection_atom_ids.len() >= limits.max_detailed_selections {
            break;
        }
        let count = selection_counts.get(name).copied().unwrap_or(-1);
        if count <= 0 || count > limits.max_atom_count_for_details.max(1) {
            continue;
        }
        let ids = host
            .selection_atom_ids(name)
            .unwrap_or_default()
            .into_iter()
            .take(limits.max_selection_atoms.max(1))
            .collect::<Vec<_>>();
        if ids.is_empty() {
            continue;
        }
        selection_atom_ids_truncated.insert(name.clone(), count > ids.len() as i64);
        selection_atom_ids.insert(name.clone(), ids);
    }

    let vis = host
        .visibility()
        .unwrap_or_else(|_| Value::Object(Map::new()));
    let view = host.view().unwrap_or_default();
    let viewport = host
        .viewport()
        .ok()
        .flatten()
        .map(|(width, height)| vec![width, height])
        .unwrap_or_default();
    let object_list = host.object_list().unwrap_or_default();

    let skip = recent.len().saturating_sub(RECENT_RESULTS_REPORTED);
    ViewerStateSummary {
        objects: objects.into_iter().take(limits.max_objects).collect(),
        enabled_objects: enabled_objects.into_iter().take(limits.max_objects).collect(),
        object_list: object_list.into_iter().take(limits.max_objects).collect(),
        selections,
        selection_counts,
        selection_atom_ids,
        selection_atom_ids_truncated,
        vis,
        view,
        viewport,
        recent_tool_results: recent[skip..].to_vec(),
    }
}
