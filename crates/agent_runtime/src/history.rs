use agent_client::{ChatMessage, HISTORY_LIMIT};

const CONTEXT_ENTRIES: usize = 40;
const CONTEXT_ENTRY_CHARS: usize = 500;

/// Role-tagged conversation log, bounded to the newest [`HISTORY_LIMIT`]
/// entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    entries: Vec<ChatMessage>,
}

impl ConversationHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
        self.trim();
    }

    /// Replaces the log, keeping the newest entries.
    pub fn replace(&mut self, entries: Vec<ChatMessage>) {
        self.entries = entries;
        self.trim();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<ChatMessage> {
        self.entries.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `role: content` lines for the newest user, assistant and system
    /// entries. Tool entries and blank content are skipped.
    #[must_use]
    pub fn context_lines(&self) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(CONTEXT_ENTRIES);
        self.entries[skip..]
            .iter()
            .filter(|message| matches!(message.role(), "user" | "assistant" | "system"))
            .filter_map(|message| {
                let content = message.content().trim();
                if content.is_empty() {
                    return None;
                }
                let clipped = match content.char_indices().nth(CONTEXT_ENTRY_CHARS) {
                    Some((cut, _)) => &content[..cut],
                    None => content,
                };
                Some(format!("{}: {clipped}", message.role()))
            })
            .collect()
    }

    fn trim(&mut self) {
        let excess = self.entries.len().saturating_sub(HISTORY_LIMIT);
        if excess > 0 {
            self.entries.drain(..excess);
        }
    }
}
