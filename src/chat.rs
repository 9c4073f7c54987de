use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::typing::TypingEvent;

static NEXT_LINE_ID: AtomicU64 = AtomicU64::new(1);

// ─── Chat line ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub id: u64,
    pub text: String,
}

impl ChatLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: NEXT_LINE_ID.fetch_add(1, Ordering::Relaxed),
            text: text.into(),
        }
    }

    /// Text as shown in the chat feed, one physical line per `\n`.
    pub fn display_line(&self) -> String {
        self.text.replace('\n', " / ")
    }
}

// ─── Host capability ─────────────────────────────────────────────────

/// The host's chat history, reachable only through these operations.
///
/// Implementations own their storage; callers never index into it directly.
pub trait ChatSink {
    /// Add a line as the newest entry.
    fn append(&mut self, line: ChatLine);

    /// Overwrite a stored line, counting back from the newest (0 = newest).
    /// Returns false when no such line exists.
    fn replace(&mut self, index_from_newest: usize, line: ChatLine) -> bool;

    /// Rebuild whatever the host shows from its stored lines.
    fn refresh(&mut self);
}

// ─── In-memory history ───────────────────────────────────────────────

/// Bounded chat history with a separate visible cache, the way a game
/// client keeps its message list and the lines currently drawn.
pub struct ChatHistory {
    messages: VecDeque<ChatLine>,
    visible: Vec<String>,
    limit: usize,
}

impl ChatHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            visible: Vec::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatLine> {
        self.messages.iter()
    }

    pub fn newest(&self) -> Option<&ChatLine> {
        self.messages.back()
    }

    /// Lines as last refreshed, oldest first.
    pub fn visible(&self) -> &[String] {
        &self.visible
    }
}

impl ChatSink for ChatHistory {
    fn append(&mut self, line: ChatLine) {
        trace!("history append #{}: \"{}\"", line.id, truncate_for_log(&line.text, 80));
        self.messages.push_back(line);
        while self.messages.len() > self.limit {
            self.messages.pop_front();
        }
        self.refresh();
    }

    fn replace(&mut self, index_from_newest: usize, line: ChatLine) -> bool {
        let len = self.messages.len();
        if index_from_newest >= len {
            return false;
        }
        self.messages[len - 1 - index_from_newest] = line;
        true
    }

    fn refresh(&mut self) {
        self.visible = self.messages.iter().map(ChatLine::display_line).collect();
    }
}

// ─── NPC line mirroring ──────────────────────────────────────────────

/// Mirrors NPC typing text into the chat history: the first line from an
/// NPC is appended, later updates overwrite the newest line in place.
#[derive(Default)]
pub struct NpcChatMirror {
    npc_lines: HashMap<String, String>,
}

impl NpcChatMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &TypingEvent, sink: &mut dyn ChatSink) {
        match event {
            TypingEvent::Started { npc_id, text, .. } | TypingEvent::Updated { npc_id, text, .. } => {
                if !self.npc_lines.contains_key(npc_id) {
                    sink.append(ChatLine::new(text.trim_start()));
                } else if sink.replace(0, ChatLine::new(text.trim_start())) {
                    sink.refresh();
                }
                self.npc_lines.insert(npc_id.clone(), text.clone());
            }
            TypingEvent::Ended => {
                debug!("mirror: clearing {} tracked NPC lines", self.npc_lines.len());
                self.npc_lines.clear();
            }
            TypingEvent::Ignored => {}
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

pub fn truncate_for_log(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    // Walk back from max to find a valid UTF-8 char boundary.
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(history: &ChatHistory) -> Vec<&str> {
        history.messages().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn append_refreshes_visible_lines() {
        let mut history = ChatHistory::new(10);
        history.append(ChatLine::new("hello"));
        history.append(ChatLine::new("two\nlines"));
        assert_eq!(history.visible(), ["hello", "two / lines"]);
    }

    #[test]
    fn history_is_bounded() {
        let mut history = ChatHistory::new(3);
        for i in 0..5 {
            history.append(ChatLine::new(format!("m{i}")));
        }
        assert_eq!(texts(&history), ["m2", "m3", "m4"]);
        assert_eq!(history.visible().len(), 3);
    }

    #[test]
    fn replace_needs_refresh_to_show() {
        let mut history = ChatHistory::new(10);
        history.append(ChatLine::new("a"));
        history.append(ChatLine::new("b"));
        assert!(history.replace(0, ChatLine::new("B")));
        assert_eq!(texts(&history), ["a", "B"]);
        assert_eq!(history.visible(), ["a", "b"]);
        history.refresh();
        assert_eq!(history.visible(), ["a", "B"]);
    }

    #[test]
    fn replace_out_of_range_is_rejected() {
        let mut history = ChatHistory::new(10);
        assert!(!history.replace(0, ChatLine::new("x")));
        history.append(ChatLine::new("a"));
        assert!(!history.replace(1, ChatLine::new("x")));
        assert_eq!(texts(&history), ["a"]);
    }

    #[test]
    fn line_ids_are_unique() {
        let a = ChatLine::new("a");
        let b = ChatLine::new("a");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn mirror_appends_then_replaces() {
        let mut history = ChatHistory::new(10);
        let mut mirror = NpcChatMirror::new();
        history.append(ChatLine::new("player chat"));

        mirror.apply(
            &TypingEvent::Started {
                npc_id: "npc-1".into(),
                text: "Hel".into(),
                color: None,
            },
            &mut history,
        );
        mirror.apply(
            &TypingEvent::Updated {
                npc_id: "npc-1".into(),
                text: "Hello there".into(),
                color: None,
            },
            &mut history,
        );
        assert_eq!(texts(&history), ["player chat", "Hello there"]);
        assert_eq!(history.visible(), ["player chat", "Hello there"]);
        assert_eq!(mirror.npc_lines["npc-1"], "Hello there");

        mirror.apply(&TypingEvent::Ended, &mut history);
        assert!(mirror.npc_lines.is_empty());
        mirror.apply(
            &TypingEvent::Started {
                npc_id: "npc-1".into(),
                text: "Again".into(),
                color: None,
            },
            &mut history,
        );
        assert_eq!(texts(&history), ["player chat", "Hello there", "Again"]);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        assert_eq!(truncate_for_log("abc", 10), "abc");
        assert_eq!(truncate_for_log("héllo", 2), "h");
        assert_eq!(truncate_for_log("héllo", 3), "hé");
    }
}
