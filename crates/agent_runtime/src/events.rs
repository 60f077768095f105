use std::collections::VecDeque;
use std::sync::Mutex;

use agent_client::{UiEvent, UiRole};

use crate::lock_unpoisoned;

/// Injected once per backlog when the queue drops events.
pub const COMPACTION_NOTICE: &str = "chat output compacted to keep UI responsive";

/// System messages with these prefixes steer the model only and never reach
/// the transcript.
pub const HIDDEN_SYSTEM_PREFIXES: [&str; 3] = [
    "Validation required:",
    "Visual validation required now:",
    "Loop detected:",
];

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<UiEvent>,
    notice_sent: bool,
}

/// Bounded, lossy transcript queue shared by the turn worker and the
/// presentation layer.
#[derive(Debug)]
pub struct UiEventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
}

impl UiEventQueue {
    /// `capacity` of zero disables compaction.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queues `event` unless it is hidden. Returns whether it was queued.
    pub fn push(&self, event: UiEvent) -> bool {
        if is_hidden(&event) {
            return false;
        }

        let mut state = lock_unpoisoned(&self.state);
        state.events.push_back(event);
        if self.capacity == 0 || state.events.len() <= self.capacity {
            return true;
        }

        let mut dropped = 0usize;
        while state.events.len() > self.capacity {
            let index = drop_index(&state.events);
            state.events.remove(index);
            dropped += 1;
        }
        if !state.notice_sent {
            if state.events.len() >= self.capacity {
                let index = drop_index(&state.events);
                state.events.remove(index);
                dropped += 1;
            }
            state.events.push_back(UiEvent::system(COMPACTION_NOTICE));
            state.notice_sent = true;
        }
        tracing::debug!(target: "mol_agent", dropped, "compacted ui event queue");
        true
    }

    /// Removes up to `limit` events in order, or everything when `limit` is
    /// `None`.
    pub fn drain(&self, limit: Option<usize>) -> Vec<UiEvent> {
        let mut state = lock_unpoisoned(&self.state);
        let take = limit.map_or(state.events.len(), |limit| limit.min(state.events.len()));
        let drained = state.events.drain(..take).collect::<Vec<_>>();
        if state.events.is_empty() {
            state.notice_sent = false;
        }
        drained
    }

    #[must_use]
    pub fn has_pending_events(&self) -> bool {
        !lock_unpoisoned(&self.state).events.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_hidden(event: &UiEvent) -> bool {
    event.role == UiRole::System
        && HIDDEN_SYSTEM_PREFIXES
            .iter()
            .any(|prefix| event.text.starts_with(prefix))
}

/// Oldest low-priority event other than the compaction notice, else the
/// oldest event.
fn drop_index(events: &VecDeque<UiEvent>) -> usize {
    events
        .iter()
        .position(|event| event.role.is_low_priority() && event.text != COMPACTION_NOTICE)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(events: &[UiEvent]) -> Vec<&str> {
        events.iter().map(|event| event.text.as_str()).collect()
    }

    #[test]
    fn hidden_system_messages_are_never_queued() {
        let queue = UiEventQueue::new(10);

        assert!(!queue.push(UiEvent::system("Loop detected: repeated zoom")));
        assert!(!queue.push(UiEvent::system("Validation required: capture a snapshot")));
        assert!(queue.push(UiEvent::ai("Loop detected: but visible as ai")));

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn overflow_drops_low_priority_first_and_injects_one_notice() {
        let queue = UiEventQueue::new(4);
        queue.push(UiEvent::user("u1"));
        queue.push(UiEvent::reasoning("r1"));
        queue.push(UiEvent::ai("a1"));
        queue.push(UiEvent::system("s1"));
        queue.push(UiEvent::ai("a2"));
        queue.push(UiEvent::ai("a3"));

        let drained = queue.drain(None);
        assert_eq!(texts(&drained), vec!["a1", "a2", COMPACTION_NOTICE, "a3"]);
    }

    #[test]
    fn notice_is_rearmed_after_the_queue_empties() {
        let queue = UiEventQueue::new(2);
        for text in ["a", "b", "c"] {
            queue.push(UiEvent::ai(text));
        }
        queue.push(UiEvent::ai("d"));
        let first = queue.drain(None);
        assert_eq!(
            first.iter().filter(|event| event.text == COMPACTION_NOTICE).count(),
            1
        );

        for text in ["e", "f", "g"] {
            queue.push(UiEvent::ai(text));
        }
        let second = queue.drain(None);
        assert!(second.iter().any(|event| event.text == COMPACTION_NOTICE));
    }

    #[test]
    fn drain_respects_the_limit() {
        let queue = UiEventQueue::new(0);
        for index in 0..5 {
            queue.push(UiEvent::ai(format!("line {index}")));
        }

        assert_eq!(queue.drain(Some(2)).len(), 2);
        assert!(queue.has_pending_events());
        assert_eq!(queue.drain(Some(10)).len(), 3);
        assert!(!queue.has_pending_events());
    }
}
