//! Durable chat persistence.
//!
//! Each chat lives under `root/<chat_id>/` as a `manifest.json`, an append-only
//! `events.jsonl` journal and an optional host session document. A root-level
//! `index.jsonl` records the latest listing row per chat, with tombstones for
//! deletions.

mod clock;
mod error;
mod index;
mod paths;
mod schema;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ChatStoreError;
pub use paths::{
    chat_dir, make_chat_id, make_title, preview_line, slugify, EVENTS_FILE, INDEX_FILE,
    MANIFEST_FILE,
};
pub use schema::{ChatManifest, EventRecord, IndexRow, LoadedChat, SaveStatus};
pub use store::{ChatStore, ChatStoreOptions, PumpReport, SaveSession};
