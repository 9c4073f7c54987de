use serde::Serialize;

/// Control tag announcing that an NPC is typing (or has typed more text).
pub const TYPING_START_MARKER: &str = "<npc_typing>";
/// Control tag closing a typing session.
pub const TYPING_END_MARKER: &str = "<npc_typing_end>";

// ─── Inbound event ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ConnectionId(pub u64);

/// One received chat payload, already resolved to text by the host.
#[derive(Debug, Clone)]
pub struct InboundChatEvent {
    raw_text: String,
    source: ConnectionId,
}

impl InboundChatEvent {
    pub fn new(raw_text: impl Into<String>, source: ConnectionId) -> Self {
        Self {
            raw_text: raw_text.into(),
            source,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn source(&self) -> ConnectionId {
        self.source
    }
}

// ─── Classification ──────────────────────────────────────────────────

/// Result of classifying one payload. Typing variants carry the raw text
/// untouched; sender parsing is left to the typing manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text")]
pub enum ClassifiedMessage {
    Normal(String),
    TypingStart(String),
    TypingEnd(String),
}

impl ClassifiedMessage {
    /// Start marker is checked first; a payload carrying both tags is a start.
    pub fn classify(raw_text: &str) -> Self {
        if raw_text.contains(TYPING_START_MARKER) {
            Self::TypingStart(raw_text.to_owned())
        } else if raw_text.contains(TYPING_END_MARKER) {
            Self::TypingEnd(raw_text.to_owned())
        } else {
            Self::Normal(raw_text.to_owned())
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Normal(t) | Self::TypingStart(t) | Self::TypingEnd(t) => t,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal(_) => "normal",
            Self::TypingStart(_) => "typing-start",
            Self::TypingEnd(_) => "typing-end",
        }
    }
}

/// Whether the payload carries either typing control tag.
pub fn is_control_tagged(raw_text: &str) -> bool {
    raw_text.contains(TYPING_START_MARKER) || raw_text.contains(TYPING_END_MARKER)
}

// ─── Routing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub suppress_default_handling: bool,
    pub forward: Option<ClassifiedMessage>,
}

impl RouteDecision {
    fn pass_through() -> Self {
        Self {
            suppress_default_handling: false,
            forward: None,
        }
    }

    fn divert(message: ClassifiedMessage) -> Self {
        Self {
            suppress_default_handling: true,
            forward: Some(message),
        }
    }
}

/// Decide whether the host's default chat pipeline should see this payload.
///
/// Pure function of `raw_text`: no state, no I/O, never fails.
pub fn route(raw_text: &str) -> RouteDecision {
    match ClassifiedMessage::classify(raw_text) {
        ClassifiedMessage::Normal(_) => RouteDecision::pass_through(),
        typing => RouteDecision::divert(typing),
    }
}
