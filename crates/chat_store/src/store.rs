use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_client::{RuntimeState, UiEvent, UiRole};

use crate::clock::{format_timestamp, Clock, SystemClock};
use crate::error::ChatStoreError;
use crate::index::ChatIndex;
use crate::paths::{
    chat_dir, make_chat_id, make_title, preview_line, session_file_name, slugify, EVENTS_FILE,
    MANIFEST_FILE, PREVIEW_MAX,
};
use crate::schema::{ChatManifest, EventRecord, IndexRow, LoadedChat, SaveStatus};

/// Host document writer used for checkpoints. Receives the session file path.
pub type SaveSession<'a> = dyn FnMut(&Path) -> Result<(), String> + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStoreOptions {
    /// Delay between the first buffered change and the journal flush.
    pub flush_delay: Duration,
    /// Delay between the last scene change and the document checkpoint.
    pub checkpoint_delay: Duration,
    /// Buffered journal lines that force an immediate flush.
    pub soft_cap: usize,
    /// Extension of the per-chat host document.
    pub session_extension: String,
}

impl Default for ChatStoreOptions {
    fn default() -> Self {
        Self {
            flush_delay: Duration::from_millis(80),
            checkpoint_delay: Duration::from_millis(1500),
            soft_cap: 100,
            session_extension: "pse".to_string(),
        }
    }
}

/// What one [`ChatStore::pump`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub flushed: bool,
    /// `Some(ok)` when a checkpoint ran.
    pub checkpoint: Option<bool>,
}

#[derive(Debug)]
struct CurrentChat {
    dir: PathBuf,
    manifest: ChatManifest,
    pending_lines: Vec<String>,
    manifest_dirty: bool,
    index_dirty: bool,
    scene_dirty: bool,
    flush_due: Option<Instant>,
    checkpoint_due: Option<Instant>,
    title_is_default: bool,
}

impl CurrentChat {
    fn chat_id(&self) -> &str {
        &self.manifest.chat_id
    }
}

/// Durable chat persistence: per-chat manifest and event journal plus a
/// root-level append-only index.
///
/// The store never spawns threads. Buffered writes and checkpoints happen
/// when the owner calls [`ChatStore::pump`] after their deadlines pass.
pub struct ChatStore {
    root: PathBuf,
    options: ChatStoreOptions,
    clock: Arc<dyn Clock>,
    index: ChatIndex,
    current: Option<CurrentChat>,
}

impl ChatStore {
    pub fn open(
        root: impl Into<PathBuf>,
        options: ChatStoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ChatStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|source| ChatStoreError::io("creating chat root", &root, source))?;
        let index = ChatIndex::load(&root)?;

        Ok(Self {
            root,
            options,
            clock,
            index,
            current: None,
        })
    }

    pub fn open_with_defaults(root: impl Into<PathBuf>) -> Result<Self, ChatStoreError> {
        Self::open(root, ChatStoreOptions::default(), Arc::new(SystemClock))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn current_chat_id(&self) -> Option<&str> {
        self.current.as_ref().map(CurrentChat::chat_id)
    }

    #[must_use]
    pub fn current_manifest(&self) -> Option<&ChatManifest> {
        self.current.as_ref().map(|current| &current.manifest)
    }

    /// Starts a new chat and makes it current. An empty current chat is
    /// discarded first; otherwise its pending state is flushed.
    pub fn create_chat(&mut self, first_text: &str) -> Result<String, ChatStoreError> {
        self.release_current()?;

        let now = self.clock.now_utc();
        let stamp = format_timestamp(now)?;
        let chat_id = make_chat_id(now, first_text);
        let dir = chat_dir(&self.root, &chat_id);
        fs::create_dir_all(&dir)
            .map_err(|source| ChatStoreError::io("creating chat directory", &dir, source))?;

        let manifest = ChatManifest {
            chat_id: chat_id.clone(),
            title: make_title(now, first_text),
            created_at: stamp.clone(),
            updated_at: stamp.clone(),
            last_opened_at: stamp,
            preview: String::new(),
            message_count: 0,
            has_session_pse: false,
            session_pse_path: session_file_name(&self.options.session_extension),
            runtime_state: RuntimeState::default(),
            save_status: SaveStatus::default(),
        };
        write_manifest(&dir, &manifest)?;
        self.index.append(IndexRow::from_manifest(&manifest))?;

        tracing::info!(chat_id = %chat_id, "created chat");
        self.current = Some(CurrentChat {
            dir,
            manifest,
            pending_lines: Vec::new(),
            manifest_dirty: false,
            index_dirty: false,
            scene_dirty: false,
            flush_due: None,
            checkpoint_due: None,
            title_is_default: slugify(first_text, "", usize::MAX).is_empty(),
        });
        Ok(chat_id)
    }

    /// Makes an existing chat current and returns its contents.
    pub fn open_chat(&mut self, chat_id: &str) -> Result<LoadedChat, ChatStoreError> {
        let chat_id = chat_id.trim();
        if self.current_chat_id() == Some(chat_id) {
            return self.load_chat(chat_id);
        }

        self.flush_now()?;
        let mut loaded = read_chat(&self.root, chat_id)?;
        self.release_current()?;

        loaded.manifest.last_opened_at = format_timestamp(self.clock.now_utc())?;
        let title_is_default = loaded.manifest.is_draft() && loaded.manifest.title.ends_with(" - new chat");
        self.current = Some(CurrentChat {
            dir: chat_dir(&self.root, chat_id),
            manifest: loaded.manifest.clone(),
            pending_lines: Vec::new(),
            manifest_dirty: true,
            index_dirty: false,
            scene_dirty: false,
            flush_due: None,
            checkpoint_due: None,
            title_is_default,
        });
        self.flush_now()?;

        tracing::info!(chat_id, events = loaded.events.len(), "opened chat");
        Ok(loaded)
    }

    /// Buffers events for the current chat and returns how many were taken.
    pub fn append_events(&mut self, events: &[UiEvent]) -> Result<usize, ChatStoreError> {
        let now_utc = self.clock.now_utc();
        let now = self.clock.now();
        let flush_delay = self.options.flush_delay;
        let soft_cap = self.options.soft_cap;
        let Some(current) = self.current.as_mut() else {
            return Err(ChatStoreError::NoCurrentChat);
        };
        if events.is_empty() {
            return Ok(0);
        }

        let ts = format_timestamp(now_utc)?;
        let lines = events
            .iter()
            .map(|event| {
                let record = EventRecord {
                    ts: ts.clone(),
                    event: event.clone(),
                };
                serde_json::to_string(&record)
                    .map(|line| line + "\n")
                    .map_err(|source| {
                        ChatStoreError::json_serialize(current.dir.join(EVENTS_FILE), source)
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        current.pending_lines.extend(lines);
        current.manifest.message_count += events.len() as u64;

        for event in events {
            if event.is_stream_chunk() || !matches!(event.role, UiRole::User | UiRole::Ai) {
                continue;
            }
            let preview = preview_line(&event.text, PREVIEW_MAX);
            if preview.is_empty() {
                continue;
            }
            if event.role == UiRole::User && current.title_is_default {
                current.manifest.title = make_title(now_utc, &preview);
                current.title_is_default = false;
            }
            current.manifest.preview = preview;
        }

        current.manifest.updated_at = ts;
        current.manifest_dirty = true;
        current.index_dirty = true;
        current.flush_due.get_or_insert(now + flush_delay);
        self.index.stage(IndexRow::from_manifest(&current.manifest));

        if current.pending_lines.len() >= soft_cap {
            // The events are buffered either way; the next pump retries.
            if let Err(error) = self.flush_now() {
                tracing::warn!(error = %error, "soft-cap flush failed");
            }
        }
        Ok(events.len())
    }

    /// Stores the runtime state snapshot in the current manifest.
    pub fn set_runtime_state(&mut self, state: RuntimeState) -> Result<(), ChatStoreError> {
        let now = self.clock.now();
        let flush_delay = self.options.flush_delay;
        let Some(current) = self.current.as_mut() else {
            return Err(ChatStoreError::NoCurrentChat);
        };

        let state = state.sanitized();
        if current.manifest.runtime_state == state {
            return Ok(());
        }
        current.manifest.runtime_state = state;
        current.manifest_dirty = true;
        current.flush_due.get_or_insert(now + flush_delay);
        Ok(())
    }

    /// Records that the host document changed and (re)arms the checkpoint.
    pub fn mark_scene_dirty(&mut self) {
        let due = self.clock.now() + self.options.checkpoint_delay;
        if let Some(current) = self.current.as_mut() {
            current.scene_dirty = true;
            current.checkpoint_due = Some(due);
        }
    }

    /// Pushes the checkpoint deadline out when the scene is dirty.
    pub fn schedule_checkpoint(&mut self) {
        let due = self.clock.now() + self.options.checkpoint_delay;
        if let Some(current) = self.current.as_mut() {
            if current.scene_dirty {
                current.checkpoint_due = Some(due);
            }
        }
    }

    /// Runs whatever work is due at `now`.
    pub fn pump(
        &mut self,
        now: Instant,
        save: &mut SaveSession<'_>,
    ) -> Result<PumpReport, ChatStoreError> {
        let mut report = PumpReport::default();
        let Some(current) = self.current.as_ref() else {
            return Ok(report);
        };
        let flush_due = current.flush_due.is_some_and(|due| now >= due);
        let checkpoint_due = current.checkpoint_due.is_some_and(|due| now >= due);

        if flush_due {
            self.flush_now()?;
            report.flushed = true;
        }
        if checkpoint_due {
            report.checkpoint = Some(self.run_checkpoint(save)?);
            if report.checkpoint == Some(true) {
                report.flushed = true;
            }
        }
        Ok(report)
    }

    /// Saves the host document when the scene is dirty. Returns whether a
    /// save ran and succeeded.
    pub fn run_checkpoint(&mut self, save: &mut SaveSession<'_>) -> Result<bool, ChatStoreError> {
        match self.current.as_mut() {
            Some(current) if current.scene_dirty => {}
            Some(current) => {
                current.checkpoint_due = None;
                return Ok(false);
            }
            None => return Ok(false),
        }
        self.checkpoint(save)
    }

    /// Saves the host document regardless of the dirty flag.
    pub fn force_checkpoint(&mut self, save: &mut SaveSession<'_>) -> Result<bool, ChatStoreError> {
        if self.current.is_none() {
            return Err(ChatStoreError::NoCurrentChat);
        }
        self.checkpoint(save)
    }

    fn checkpoint(&mut self, save: &mut SaveSession<'_>) -> Result<bool, ChatStoreError> {
        self.flush_now()?;
        let now = self.clock.now();
        let stamp = format_timestamp(self.clock.now_utc())?;
        let checkpoint_delay = self.options.checkpoint_delay;
        let Some(current) = self.current.as_mut() else {
            return Err(ChatStoreError::NoCurrentChat);
        };

        let session_path = current.dir.join(&current.manifest.session_pse_path);
        let result = save(&session_path);
        let status = &mut current.manifest.save_status;
        status.last_pse_save_at = Some(stamp.clone());
        let ok = match result {
            Ok(()) => {
                status.last_pse_save_ok = Some(true);
                status.last_pse_error = None;
                current.manifest.has_session_pse = true;
                current.manifest.updated_at = stamp;
                current.scene_dirty = false;
                current.checkpoint_due = None;
                tracing::debug!(chat_id = %current.manifest.chat_id, "checkpoint saved");
                true
            }
            Err(error) => {
                let error = if error.trim().is_empty() {
                    "unknown error".to_string()
                } else {
                    error
                };
                tracing::warn!(chat_id = %current.manifest.chat_id, error = %error, "checkpoint failed");
                status.last_pse_save_ok = Some(false);
                status.last_pse_error = Some(error);
                current.checkpoint_due = current.scene_dirty.then(|| now + checkpoint_delay);
                false
            }
        };

        current.manifest_dirty = true;
        current.index_dirty = true;
        self.flush_now()?;
        Ok(ok)
    }

    /// Writes buffered journal lines, the manifest and the index row now.
    pub fn flush_now(&mut self) -> Result<(), ChatStoreError> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        if !current.pending_lines.is_empty() {
            let events_path = current.dir.join(EVENTS_FILE);
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&events_path)
                .map_err(|source| {
                    ChatStoreError::io("opening event journal for append", &events_path, source)
                })?;
            file.write_all(current.pending_lines.concat().as_bytes())
                .map_err(|source| {
                    ChatStoreError::io("appending event journal", &events_path, source)
                })?;
            tracing::debug!(
                chat_id = %current.manifest.chat_id,
                lines = current.pending_lines.len(),
                "flushed event journal"
            );
            current.pending_lines.clear();
        }

        if current.manifest_dirty {
            write_manifest(&current.dir, &current.manifest)?;
            current.manifest_dirty = false;
        }

        if current.index_dirty {
            self.index.append(IndexRow::from_manifest(&current.manifest))?;
            current.index_dirty = false;
        }

        current.flush_due = None;
        Ok(())
    }

    /// Reads a chat from disk. Malformed journal lines are skipped. Buffered
    /// events of the current chat are flushed first so they are included.
    pub fn load_chat(&mut self, chat_id: &str) -> Result<LoadedChat, ChatStoreError> {
        let chat_id = chat_id.trim();
        if self.current_chat_id() == Some(chat_id) {
            self.flush_now()?;
        }
        read_chat(&self.root, chat_id)
    }

    /// Removes a chat directory and tombstones it. Returns whether the chat
    /// was known.
    pub fn delete_chat(&mut self, chat_id: &str) -> Result<bool, ChatStoreError> {
        let chat_id = chat_id.trim();
        if chat_id.is_empty() {
            return Ok(false);
        }
        if self.current_chat_id() == Some(chat_id) {
            self.current = None;
        }

        let dir = chat_dir(&self.root, chat_id);
        let existed = dir.exists() || self.index.get(chat_id).is_some();
        if let Err(source) = fs::remove_dir_all(&dir) {
            if source.kind() != ErrorKind::NotFound {
                tracing::warn!(chat_id, error = %source, "failed to remove chat directory");
            }
        }

        let stamp = format_timestamp(self.clock.now_utc())?;
        self.index.append(IndexRow::tombstone(chat_id, stamp))?;
        tracing::info!(chat_id, "deleted chat");
        Ok(existed)
    }

    /// Deletes the `count` least recently updated listed chats.
    pub fn delete_oldest(&mut self, count: usize) -> Result<usize, ChatStoreError> {
        let victims = self
            .index
            .visible("")
            .into_iter()
            .rev()
            .take(count)
            .map(|row| row.chat_id.clone())
            .collect::<Vec<_>>();

        let mut deleted = 0;
        for chat_id in victims {
            if self.delete_chat(&chat_id)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Listed chats matching `query`, newest first.
    #[must_use]
    pub fn list_chats(&self, query: &str, offset: usize, limit: usize) -> Vec<IndexRow> {
        self.index
            .visible(query)
            .into_iter()
            .skip(offset)
            .take(limit.max(1))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn count_chats(&self, query: &str) -> usize {
        self.index.visible(query).len()
    }

    /// Session file of the most recently updated listed chat whose last save
    /// succeeded and whose file still exists.
    #[must_use]
    pub fn get_last_valid_session_path(&self, exclude_chat_id: Option<&str>) -> Option<PathBuf> {
        let file_name = session_file_name(&self.options.session_extension);
        self.index
            .visible("")
            .into_iter()
            .filter(|row| Some(row.chat_id.as_str()) != exclude_chat_id)
            .filter(|row| row.has_session_pse && row.last_pse_save_ok != Some(false))
            .map(|row| chat_dir(&self.root, &row.chat_id).join(&file_name))
            .find(|path| path.exists())
    }

    /// Flushes and runs a final checkpoint when the scene is dirty.
    pub fn close(&mut self, save: &mut SaveSession<'_>) -> Result<(), ChatStoreError> {
        self.flush_now()?;
        if self.current.as_ref().is_some_and(|current| current.scene_dirty) {
            self.run_checkpoint(save)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn has_pending_io(&self) -> bool {
        self.current.as_ref().is_some_and(|current| {
            !current.pending_lines.is_empty() || current.manifest_dirty || current.index_dirty
        })
    }

    #[must_use]
    pub fn has_pending_checkpoint(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.scene_dirty || current.checkpoint_due.is_some())
    }

    #[must_use]
    pub fn has_unsaved_changes(&self) -> bool {
        self.has_pending_io() || self.has_pending_checkpoint()
    }

    /// Discards the current chat if it is a draft, otherwise flushes it.
    fn release_current(&mut self) -> Result<(), ChatStoreError> {
        let draft_id = match self.current.as_ref() {
            Some(current) if current.manifest.is_draft() => Some(current.chat_id().to_string()),
            Some(_) => None,
            None => return Ok(()),
        };

        match draft_id {
            Some(chat_id) => {
                self.delete_chat(&chat_id)?;
            }
            None => {
                self.flush_now()?;
                self.current = None;
            }
        }
        Ok(())
    }
}

fn write_manifest(dir: &Path, manifest: &ChatManifest) -> Result<(), ChatStoreError> {
    let path = dir.join(MANIFEST_FILE);
    let tmp_path = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let mut body = serde_json::to_string_pretty(manifest)
        .map_err(|source| ChatStoreError::json_serialize(&path, source))?;
    body.push('\n');

    fs::write(&tmp_path, body)
        .map_err(|source| ChatStoreError::io("writing manifest temp file", &tmp_path, source))?;
    fs::rename(&tmp_path, &path)
        .map_err(|source| ChatStoreError::io("replacing manifest", &path, source))
}

fn read_chat(root: &Path, chat_id: &str) -> Result<LoadedChat, ChatStoreError> {
    if chat_id.is_empty() {
        return Err(ChatStoreError::unknown_chat(chat_id));
    }
    let dir = chat_dir(root, chat_id);
    let manifest_path = dir.join(MANIFEST_FILE);
    let raw = match fs::read_to_string(&manifest_path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == ErrorKind::NotFound => {
            return Err(ChatStoreError::unknown_chat(chat_id))
        }
        Err(source) => {
            return Err(ChatStoreError::io("reading manifest", &manifest_path, source))
        }
    };
    let manifest = serde_json::from_str::<ChatManifest>(&raw)
        .map_err(|source| ChatStoreError::manifest_parse(&manifest_path, source))?;

    let events = read_events(&dir.join(EVENTS_FILE))?;
    let session_name = if manifest.session_pse_path.trim().is_empty() {
        session_file_name("pse")
    } else {
        manifest.session_pse_path.clone()
    };
    let session_path = dir.join(session_name);

    Ok(LoadedChat {
        has_session_file: session_path.is_file(),
        session_path,
        manifest,
        events,
    })
}

fn read_events(path: &Path) -> Result<Vec<EventRecord>, ChatStoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(ChatStoreError::io("opening event journal", path, source)),
    };

    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else {
            skipped += 1;
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => events.push(record),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        tracing::warn!(skipped, path = %path.display(), "skipped malformed journal lines");
    }
    Ok(events)
}
