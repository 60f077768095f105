use std::path::{Path, PathBuf};

use time::OffsetDateTime;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const EVENTS_FILE: &str = "events.jsonl";
pub const INDEX_FILE: &str = "index.jsonl";

const CHAT_ID_SLUG_MAX: usize = 36;
const TITLE_SLUG_MAX: usize = 28;
pub(crate) const PREVIEW_MAX: usize = 160;

#[must_use]
pub fn chat_dir(root: &Path, chat_id: &str) -> PathBuf {
    root.join(chat_id)
}

#[must_use]
pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE)
}

#[must_use]
pub fn session_file_name(extension: &str) -> String {
    format!("session.{}", extension.trim_start_matches('.'))
}

/// Lowercases `text` and collapses every run of non-alphanumeric characters
/// into a single `-`.
#[must_use]
pub fn slugify(text: &str, fallback: &str, max_len: usize) -> String {
    let mut raw = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            raw.extend(ch.to_lowercase());
        } else {
            raw.push('-');
        }
    }

    let joined = raw
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = if joined.is_empty() {
        fallback.to_string()
    } else {
        joined
    };

    slug.chars()
        .take(max_len)
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

/// `YYYYmmdd-HHMMSS-<slug>-<6 hex>`.
#[must_use]
pub fn make_chat_id(now: OffsetDateTime, title_hint: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}-{}-{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        slugify(title_hint, "chat", CHAT_ID_SLUG_MAX),
        &suffix[..6]
    )
}

/// `YYYY-mm-dd HH:MM - <words>`; `new chat` when the hint has no usable text.
#[must_use]
pub fn make_title(now: OffsetDateTime, hint: &str) -> String {
    let words = slugify(hint, "new-chat", TITLE_SLUG_MAX).replace('-', " ");
    let words = words.trim();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02} - {}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        if words.is_empty() { "new chat" } else { words }
    )
}

/// First non-empty line of `text`, cut to `max_len` characters with `...`.
#[must_use]
pub fn preview_line(text: &str, max_len: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= max_len {
        return line.to_string();
    }

    let mut cut = line
        .chars()
        .take(max_len.saturating_sub(1))
        .collect::<String>();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::{make_chat_id, make_title, preview_line, slugify};

    fn fixed_now() -> OffsetDateTime {
        // 2026-03-04 05:06:07 UTC
        OffsetDateTime::from_unix_timestamp(1_772_600_767).expect("timestamp should be valid")
    }

    #[test]
    fn slug_collapses_punctuation_and_case() {
        assert_eq!(slugify("Show  the Ligand!!", "chat", 36), "show-the-ligand");
        assert_eq!(slugify("???", "chat", 36), "chat");
        assert_eq!(slugify("abc def", "chat", 4), "abc");
    }

    #[test]
    fn chat_id_has_timestamp_slug_and_suffix() {
        let id = make_chat_id(fixed_now(), "Zoom in on 1ABC");
        let (stamp, rest) = id.split_at(15);
        assert_eq!(stamp, "20260304-050607");
        assert!(rest.starts_with("-zoom-in-on-1abc-"));
        assert_eq!(rest.rsplit('-').next().map(str::len), Some(6));
    }

    #[test]
    fn title_uses_hint_words_or_new_chat() {
        let now = fixed_now();
        assert_eq!(make_title(now, "color by chain"), "2026-03-04 05:06 - color by chain");
        assert_eq!(make_title(now, ""), "2026-03-04 05:06 - new chat");
    }

    #[test]
    fn preview_is_first_line_capped() {
        assert_eq!(preview_line("\n  hello\nworld", 160), "hello");
        let long = "x".repeat(200);
        let preview = preview_line(&long, 160);
        assert_eq!(preview.chars().count(), 162);
        assert!(preview.ends_with("..."));
    }
}
