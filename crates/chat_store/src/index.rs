use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::clock::parse_timestamp;
use crate::error::ChatStoreError;
use crate::paths::{index_path, MANIFEST_FILE};
use crate::schema::{ChatManifest, IndexRow};

/// Append-only `index.jsonl` plus its in-memory latest-row view.
#[derive(Debug)]
pub(crate) struct ChatIndex {
    path: PathBuf,
    latest: HashMap<String, IndexRow>,
}

impl ChatIndex {
    /// Replays `index.jsonl`. Unreadable lines are skipped. When nothing
    /// survives replay, rows are rebuilt from the per-chat manifests and
    /// appended so the next open does not have to rescan.
    pub(crate) fn load(root: &Path) -> Result<Self, ChatStoreError> {
        let path = index_path(root);
        let mut index = Self {
            path,
            latest: HashMap::new(),
        };
        index.replay()?;

        if index.latest.is_empty() {
            let rebuilt = rebuild_rows(root)?;
            if !rebuilt.is_empty() {
                tracing::info!(rows = rebuilt.len(), "rebuilt chat index from manifests");
            }
            for row in rebuilt {
                index.append(row)?;
            }
        }

        Ok(index)
    }

    fn replay(&mut self) -> Result<(), ChatStoreError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(source) if source.kind() == ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(ChatStoreError::io("opening chat index", &self.path, source))
            }
        };

        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line
                .map_err(|source| ChatStoreError::io("reading chat index", &self.path, source))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(row) = serde_json::from_str::<IndexRow>(line) else {
                skipped += 1;
                continue;
            };
            if row.chat_id.trim().is_empty() {
                continue;
            }
            self.apply(row);
        }

        if skipped > 0 {
            tracing::warn!(skipped, path = %self.path.display(), "skipped malformed index rows");
        }
        Ok(())
    }

    fn apply(&mut self, row: IndexRow) {
        if row.deleted {
            self.latest.remove(&row.chat_id);
        } else {
            self.latest.insert(row.chat_id.clone(), row);
        }
    }

    /// Updates the in-memory view and appends the row to disk.
    pub(crate) fn append(&mut self, row: IndexRow) -> Result<(), ChatStoreError> {
        let mut line = serde_json::to_string(&row)
            .map_err(|source| ChatStoreError::json_serialize(&self.path, source))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| ChatStoreError::io("opening chat index for append", &self.path, source))?;
        file.write_all(line.as_bytes())
            .map_err(|source| ChatStoreError::io("appending chat index row", &self.path, source))?;

        self.apply(row);
        Ok(())
    }

    /// Updates the in-memory view only; the row reaches disk on the next flush.
    pub(crate) fn stage(&mut self, row: IndexRow) {
        self.apply(row);
    }

    pub(crate) fn get(&self, chat_id: &str) -> Option<&IndexRow> {
        self.latest.get(chat_id)
    }

    /// Listed rows matching `query`, newest first.
    pub(crate) fn visible(&self, query: &str) -> Vec<&IndexRow> {
        let needle = query.trim().to_lowercase();
        let mut rows = self
            .latest
            .values()
            .filter(|row| row.is_listed())
            .filter(|row| {
                needle.is_empty()
                    || row.title.to_lowercase().contains(&needle)
                    || row.preview.to_lowercase().contains(&needle)
            })
            .collect::<Vec<_>>();
        rows.sort_by(|left, right| newest_first(left, right));
        rows
    }
}

fn newest_first(left: &IndexRow, right: &IndexRow) -> Ordering {
    let left_ts = parse_timestamp(&left.updated_at);
    let right_ts = parse_timestamp(&right.updated_at);
    right_ts
        .cmp(&left_ts)
        .then_with(|| right.chat_id.cmp(&left.chat_id))
}

fn rebuild_rows(root: &Path) -> Result<Vec<IndexRow>, ChatStoreError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(ChatStoreError::io("scanning chat root", root, source)),
    };

    let mut rows = Vec::new();
    for entry in entries.flatten() {
        let manifest_path = entry.path().join(MANIFEST_FILE);
        let Ok(raw) = fs::read_to_string(&manifest_path) else {
            continue;
        };
        let Ok(manifest) = serde_json::from_str::<ChatManifest>(&raw) else {
            tracing::warn!(path = %manifest_path.display(), "skipping unreadable manifest");
            continue;
        };
        if manifest.chat_id.trim().is_empty() || manifest.is_draft() {
            continue;
        }
        rows.push(IndexRow::from_manifest(&manifest));
    }

    rows.sort_by(|left, right| left.chat_id.cmp(&right.chat_id));
    Ok(rows)
}
