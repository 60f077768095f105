//! In-memory stand-in for a molecular viewer.
//!
//! The `mol-agent` binary drives it when no real viewer is attached, and the
//! tests use it as their host. It understands a small command vocabulary and
//! keeps just enough scene state for the state summary to be meaningful.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::HostError;
use crate::host::{HostCommandOutcome, ViewerHost};
use crate::lock_unpoisoned;

/// PNG signature and a 1x1 IHDR prefix. Only ever base64-encoded.
const PLACEHOLDER_PNG: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13, b'I', b'H', b'D', b'R', 0, 0, 0,
    1, 0, 0, 0, 1, 8, 6, 0, 0, 0,
];

const NO_STATE_CHANGE: [&str; 14] = [
    "zoom", "orient", "center", "turn", "move", "show", "hide", "color", "set", "bg_color",
    "label", "cartoon", "ray", "reset",
];

#[derive(Debug, Default)]
struct DemoState {
    objects: Vec<String>,
    disabled: BTreeSet<String>,
    selections: BTreeMap<String, i64>,
    representations: BTreeMap<String, BTreeSet<String>>,
    view: Vec<f64>,
    executed: Vec<String>,
    saved: Vec<PathBuf>,
    failing_prefixes: Vec<String>,
    command_delay: Option<Duration>,
    capture_fails: bool,
    save_fails: bool,
}

/// Cloneable handle; clones share one scene.
#[derive(Debug, Clone, Default)]
pub struct DemoViewer {
    state: Arc<Mutex<DemoState>>,
}

impl DemoViewer {
    #[must_use]
    pub fn new() -> Self {
        let viewer = Self::default();
        lock_unpoisoned(&viewer.state).view = identity_view();
        viewer
    }

    #[must_use]
    pub fn with_objects<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = lock_unpoisoned(&self.state);
            for name in names {
                let name = name.into();
                state
                    .representations
                    .insert(name.clone(), ["cartoon".to_string()].into());
                state.objects.push(name);
            }
        }
        self
    }

    /// Commands starting with `prefix` fail with a parser error.
    pub fn fail_commands_starting_with(&self, prefix: &str) {
        lock_unpoisoned(&self.state)
            .failing_prefixes
            .push(prefix.to_ascii_lowercase());
    }

    /// Delay applied to every command, for slow-host scenarios.
    pub fn set_command_delay(&self, delay: Option<Duration>) {
        lock_unpoisoned(&self.state).command_delay = delay;
    }

    pub fn set_capture_fails(&self, fails: bool) {
        lock_unpoisoned(&self.state).capture_fails = fails;
    }

    pub fn set_save_fails(&self, fails: bool) {
        lock_unpoisoned(&self.state).save_fails = fails;
    }

    /// Commands received, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        lock_unpoisoned(&self.state).executed.clone()
    }

    #[must_use]
    pub fn objects(&self) -> Vec<String> {
        lock_unpoisoned(&self.state).objects.clone()
    }

    #[must_use]
    pub fn saved_paths(&self) -> Vec<PathBuf> {
        lock_unpoisoned(&self.state).saved.clone()
    }

    #[must_use]
    pub fn view_matrix(&self) -> Vec<f64> {
        lock_unpoisoned(&self.state).view.clone()
    }
}

impl ViewerHost for DemoViewer {
    fn execute(&mut self, command: &str) -> HostCommandOutcome {
        let delay = {
            let mut state = lock_unpoisoned(&self.state);
            state.executed.push(command.to_string());
            state.command_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = lock_unpoisoned(&self.state);
        let lowered = command.trim().to_ascii_lowercase();
        if let Some(prefix) = state
            .failing_prefixes
            .iter()
            .find(|prefix| lowered.starts_with(prefix.as_str()))
        {
            let error = format!("Parsing error near '{prefix}'");
            return HostCommandOutcome::failure(error.clone(), vec![format!(" Error: {error}")]);
        }
        state.apply(command.trim())
    }

    fn object_names(&mut self, enabled_only: bool) -> Result<Vec<String>, HostError> {
        let state = lock_unpoisoned(&self.state);
        Ok(state
            .objects
            .iter()
            .filter(|name| !enabled_only || !state.disabled.contains(*name))
            .cloned()
            .collect())
    }

    fn selection_names(&mut self) -> Result<Vec<String>, HostError> {
        Ok(lock_unpoisoned(&self.state)
            .selections
            .keys()
            .cloned()
            .collect())
    }

    fn count_atoms(&mut self, selection: &str) -> Result<i64, HostError> {
        let state = lock_unpoisoned(&self.state);
        if let Some(count) = state.selections.get(selection) {
            return Ok(*count);
        }
        if state.objects.iter().any(|name| name == selection) {
            return Ok(ATOMS_PER_OBJECT);
        }
        Err(HostError::new(format!("Selector-Error: invalid selection '{selection}'")))
    }

    fn selection_atom_ids(&mut self, selection: &str) -> Result<Vec<String>, HostError> {
        let count = self.count_atoms(selection)?;
        let model = lock_unpoisoned(&self.state)
            .objects
            .first()
            .cloned()
            .unwrap_or_else(|| "obj".to_string());
        Ok((1..=count)
            .map(|index| format!("{model}/A//{index}/ALA/CA/{index}"))
            .collect())
    }

    fn visibility(&mut self) -> Result<Value, HostError> {
        let state = lock_unpoisoned(&self.state);
        Ok(json!(state.representations))
    }

    fn view(&mut self) -> Result<Vec<f64>, HostError> {
        Ok(lock_unpoisoned(&self.state).view.clone())
    }

    fn viewport(&mut self) -> Result<Option<(u32, u32)>, HostError> {
        Ok(Some((640, 480)))
    }

    fn capture_png(&mut self) -> Result<Vec<u8>, HostError> {
        if lock_unpoisoned(&self.state).capture_fails {
            return Err(HostError::new("framebuffer unavailable"));
        }
        Ok(PLACEHOLDER_PNG.to_vec())
    }

    fn save_session(&mut self, path: &Path) -> Result<(), HostError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.save_fails {
            return Err(HostError::new("disk full"));
        }
        let document = json!({"objects": state.objects, "view": state.view});
        std::fs::write(path, document.to_string())
            .map_err(|error| HostError::new(format!("writing {}: {error}", path.display())))?;
        state.saved.push(path.to_path_buf());
        Ok(())
    }
}

const ATOMS_PER_OBJECT: i64 = 1231;

impl DemoState {
    fn apply(&mut self, command: &str) -> HostCommandOutcome {
        let (verb, rest) = command
            .split_once(char::is_whitespace)
            .map_or((command, ""), |(verb, rest)| (verb, rest.trim()));
        let verb = verb.trim_end_matches(',').to_ascii_lowercase();
        let args = rest
            .split(',')
            .map(str::trim)
            .filter(|arg| !arg.is_empty())
            .collect::<Vec<_>>();

        match verb.as_str() {
            "" => HostCommandOutcome::failure("empty command", Vec::new()),
            "fetch" | "load" => {
                let Some(target) = args.first() else {
                    return HostCommandOutcome::failure(format!("{verb} requires a name"), Vec::new());
                };
                let name = args
                    .get(1)
                    .map(|name| (*name).to_string())
                    .unwrap_or_else(|| object_name_for(target));
                if !self.objects.contains(&name) {
                    self.objects.push(name.clone());
                }
                self.representations
                    .insert(name.clone(), ["cartoon".to_string()].into());
                HostCommandOutcome::success(vec![format!(" ObjectMolecule: loaded \"{name}\"")])
            }
            "delete" => {
                let target = args.first().copied().unwrap_or("all");
                if target == "all" {
                    self.objects.clear();
                    self.selections.clear();
                    self.representations.clear();
                } else {
                    self.objects.retain(|name| name != target);
                    self.selections.remove(target);
                    self.representations.remove(target);
                }
                HostCommandOutcome::success(Vec::new())
            }
            "select" => {
                let (name, expression) = match args.as_slice() {
                    [name, expression, ..] => ((*name).to_string(), *expression),
                    [expression] => ("sele".to_string(), *expression),
                    [] => return HostCommandOutcome::failure("select requires an expression", Vec::new()),
                };
                let count = if expression.contains("resn") { 24 } else { 8 };
                self.selections.insert(name.clone(), count);
                HostCommandOutcome::success(vec![format!(" Selector: selection \"{name}\" defined with {count} atoms.")])
            }
            "enable" | "disable" => {
                let target = args.first().copied().unwrap_or("all");
                let names = if target == "all" {
                    self.objects.clone()
                } else {
                    vec![target.to_string()]
                };
                for name in names {
                    if verb == "enable" {
                        self.disabled.remove(&name);
                    } else {
                        self.disabled.insert(name);
                    }
                }
                HostCommandOutcome::success(Vec::new())
            }
            "zoom" | "orient" | "center" => {
                if let Some(distance) = self.view.get_mut(11) {
                    *distance *= 0.8;
                }
                HostCommandOutcome::success(Vec::new())
            }
            "show" | "hide" => {
                let representation = args.first().copied().unwrap_or("lines").to_string();
                for reps in self.representations.values_mut() {
                    if verb == "show" {
                        reps.insert(representation.clone());
                    } else {
                        reps.remove(&representation);
                    }
                }
                HostCommandOutcome::success(Vec::new())
            }
            "get_names" => HostCommandOutcome::success(vec![format!(" {}", self.objects.join(" "))]),
            "count_atoms" => {
                let target = args.first().copied().unwrap_or("all");
                let count = self
                    .selections
                    .get(target)
                    .copied()
                    .unwrap_or(ATOMS_PER_OBJECT * self.objects.len() as i64);
                HostCommandOutcome::success(vec![format!(" count_atoms: {count} atoms")])
            }
            "help" => HostCommandOutcome::success(vec![" commands: fetch, load, select, show, hide, zoom, orient, delete".to_string()]),
            verb if NO_STATE_CHANGE.contains(&verb) => HostCommandOutcome::success(Vec::new()),
            other => {
                let error = format!("Unknown command: {other}");
                HostCommandOutcome::failure(error.clone(), vec![format!(" Error: {error}")])
            }
        }
    }
}

fn object_name_for(target: &str) -> String {
    Path::new(target)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(target)
        .to_string()
}

fn identity_view() -> Vec<f64> {
    let mut view = vec![0.0; 18];
    view[0] = 1.0;
    view[4] = 1.0;
    view[8] = 1.0;
    view[11] = -50.0;
    view[16] = 40.0;
    view[17] = 100.0;
    view
}
