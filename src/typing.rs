use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::chat::truncate_for_log;
use crate::config::StoryConfig;
use crate::dialogue::{DialogueBox, DialogueSettings};
use crate::router::{TYPING_END_MARKER, TYPING_START_MARKER};

const COLOR_PREFIX: &str = "color:";
const ID_PREFIX: &str = "id:";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypingError {
    #[error("malformed typing payload: {0}")]
    MalformedPayload(String),
    #[error("payload carries no typing tag")]
    NotTyping,
    #[error("typing service is not running")]
    ServiceClosed,
}

/// Ingestion entry point for forwarded typing payloads. Receives the raw
/// chat text exactly as it arrived.
pub trait TypingSink {
    fn on_incoming_server_message(&mut self, raw_text: &str) -> Result<(), TypingError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TypingEvent {
    /// Typing payloads are dropped while the client is disabled.
    Ignored,
    Started {
        npc_id: String,
        text: String,
        color: Option<String>,
    },
    Updated {
        npc_id: String,
        text: String,
        color: Option<String>,
    },
    Ended,
}

// ─── Payload parsing ─────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct TypingPayload<'a> {
    npc_id: &'a str,
    text: &'a str,
    color: Option<&'a str>,
}

/// Parse the text following the start tag, up to an optional end tag.
///
/// Two layouts are accepted:
///   `color:<color>id:<npc_id>:<message>`
///   `<npc_id>:<message>`
fn parse_typing_payload(raw_text: &str) -> Result<TypingPayload<'_>, TypingError> {
    let after_start = raw_text
        .split_once(TYPING_START_MARKER)
        .map_or(raw_text, |(_, rest)| rest);
    let content = after_start
        .split_once(TYPING_END_MARKER)
        .map_or(after_start, |(before, _)| before);

    let malformed = || TypingError::MalformedPayload(truncate_for_log(content, 80).to_owned());

    let (color, rest) = match content.strip_prefix(COLOR_PREFIX) {
        Some(colored) => {
            let id_at = colored.find(ID_PREFIX).ok_or_else(malformed)?;
            let color = &colored[..id_at];
            let color = (!color.is_empty()).then_some(color);
            (color, &colored[id_at + ID_PREFIX.len()..])
        }
        None => (None, content),
    };

    let (npc_id, text) = rest.split_once(':').ok_or_else(malformed)?;
    Ok(TypingPayload {
        npc_id,
        text,
        color,
    })
}

// ─── Session ─────────────────────────────────────────────────────────

pub struct TypingSession {
    full_text: String,
    formatted_lines: Vec<String>,
    last_update: Instant,
    inactivity_timeout: Duration,
    done: bool,
}

impl TypingSession {
    pub fn new(text: &str, now: Instant, inactivity_timeout: Duration) -> Self {
        let mut session = Self {
            full_text: String::new(),
            formatted_lines: Vec::new(),
            last_update: now,
            inactivity_timeout,
            done: false,
        };
        session.update_text(text, now);
        session
    }

    pub fn current_text(&self) -> &str {
        &self.full_text
    }

    /// Lines of the current text; empty lines are kept for spacing.
    pub fn formatted_lines(&self) -> &[String] {
        &self.formatted_lines
    }

    pub fn update_text(&mut self, text: &str, now: Instant) {
        self.full_text = text.to_owned();
        self.last_update = now;
        self.formatted_lines = text.split('\n').map(str::to_owned).collect();
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn tick(&mut self, now: Instant) {
        if self.done {
            return;
        }
        if now.saturating_duration_since(self.last_update) > self.inactivity_timeout {
            self.done = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }
}

// ─── Manager ─────────────────────────────────────────────────────────

/// Tracks which NPCs are typing and drives the dialogue box.
pub struct TypingManager {
    enabled: bool,
    sessions: HashMap<String, TypingSession>,
    last_seen: HashMap<String, Instant>,
    inactivity_timeout: Duration,
    cleanup_timeout: Duration,
    dialogue: DialogueBox,
}

impl TypingManager {
    pub fn new(config: &StoryConfig) -> Self {
        Self {
            enabled: config.mod_enabled,
            sessions: HashMap::new(),
            last_seen: HashMap::new(),
            inactivity_timeout: Duration::from_millis(config.session_inactivity_ms),
            cleanup_timeout: Duration::from_millis(config.session_cleanup_ms),
            dialogue: DialogueBox::new(DialogueSettings::from(config)),
        }
    }

    pub fn has_active_session(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn dialogue(&self) -> &DialogueBox {
        &self.dialogue
    }

    /// Handle one forwarded payload at time `now`.
    pub fn ingest(&mut self, raw_text: &str, now: Instant) -> Result<TypingEvent, TypingError> {
        if !self.enabled {
            debug!("typing payload ignored, client disabled");
            return Ok(TypingEvent::Ignored);
        }

        if raw_text.contains(TYPING_START_MARKER) {
            let payload = parse_typing_payload(raw_text)?;
            let npc_id = payload.npc_id.to_owned();
            self.last_seen.insert(npc_id.clone(), now);

            let is_new = !self.sessions.contains_key(&npc_id);
            if is_new {
                self.dialogue.start(&npc_id, payload.text, payload.color);
            } else {
                self.dialogue.update(&npc_id, payload.text, payload.color);
            }

            let timeout = self.inactivity_timeout;
            let session = self
                .sessions
                .entry(npc_id.clone())
                .and_modify(|s| s.update_text(payload.text, now))
                .or_insert_with(|| TypingSession::new(payload.text, now, timeout));

            debug!(
                "typing {} for {} ({} line(s)): \"{}\"",
                if is_new { "started" } else { "updated" },
                npc_id,
                session.formatted_lines().len(),
                truncate_for_log(payload.text, 80),
            );

            let text = payload.text.to_owned();
            let color = payload.color.map(str::to_owned);
            Ok(if is_new {
                TypingEvent::Started { npc_id, text, color }
            } else {
                TypingEvent::Updated { npc_id, text, color }
            })
        } else if raw_text.contains(TYPING_END_MARKER) {
            // The end tag names no NPC; every open session closes.
            self.finish_all_sessions();
            Ok(TypingEvent::Ended)
        } else {
            Err(TypingError::NotTyping)
        }
    }

    pub fn finish_session_for_npc(&mut self, npc_id: &str) {
        if let Some(session) = self.sessions.get_mut(npc_id) {
            session.mark_done();
        }
        self.dialogue.end();
    }

    /// Close every session and fade the dialogue out. Also used to recover
    /// from a stuck dialogue box.
    pub fn finish_all_sessions(&mut self) {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for npc_id in &ids {
            self.finish_session_for_npc(npc_id);
        }
        self.sessions.clear();
        self.last_seen.clear();
        self.dialogue.end();
        if !ids.is_empty() {
            info!("Finished {} typing session(s)", ids.len());
        }
    }

    /// Advance timers. Returns the NPC ids whose sessions closed.
    pub fn tick(&mut self, now: Instant) -> Vec<String> {
        self.dialogue.tick();

        let mut finished = Vec::new();
        for (npc_id, session) in self.sessions.iter_mut() {
            session.tick(now);
            if session.is_complete() {
                finished.push(npc_id.clone());
            }
        }
        for npc_id in &finished {
            self.sessions.remove(npc_id);
            self.last_seen.remove(npc_id);
        }

        let outdated: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(npc_id, seen)| {
                now.saturating_duration_since(**seen) > self.cleanup_timeout
                    && self.sessions.contains_key(npc_id.as_str())
            })
            .map(|(npc_id, _)| npc_id.clone())
            .collect();
        for npc_id in outdated {
            let last_text = self.sessions.get(&npc_id).map_or("", TypingSession::current_text);
            warn!(
                "Typing session for {} went stale, closing (last text \"{}\")",
                npc_id,
                truncate_for_log(last_text, 80)
            );
            self.finish_session_for_npc(&npc_id);
            self.last_seen.remove(&npc_id);
        }

        finished
    }
}

impl TypingSink for TypingManager {
    fn on_incoming_server_message(&mut self, raw_text: &str) -> Result<(), TypingError> {
        self.ingest(raw_text, Instant::now()).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TypingManager {
        TypingManager::new(&StoryConfig::default())
    }

    #[test]
    fn parses_plain_payload() {
        let p = parse_typing_payload("<npc_typing>npc-1:Hello: friend").unwrap();
        assert_eq!(
            p,
            TypingPayload {
                npc_id: "npc-1",
                text: "Hello: friend",
                color: None
            }
        );
    }

    #[test]
    fn parses_colored_payload() {
        let p = parse_typing_payload("<npc_typing>color:#AA00FFid:abc-123:Hi<npc_typing_end>").unwrap();
        assert_eq!(
            p,
            TypingPayload {
                npc_id: "abc-123",
                text: "Hi",
                color: Some("#AA00FF")
            }
        );
    }

    #[test]
    fn text_before_start_tag_is_ignored() {
        let p = parse_typing_payload("[NPC] <npc_typing>guard:Halt").unwrap();
        assert_eq!(p.npc_id, "guard");
        assert_eq!(p.text, "Halt");
    }

    #[test]
    fn malformed_payloads() {
        assert!(matches!(
            parse_typing_payload("<npc_typing>"),
            Err(TypingError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_typing_payload("<npc_typing>no separator"),
            Err(TypingError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_typing_payload("<npc_typing>color:#123456 missing id"),
            Err(TypingError::MalformedPayload(_))
        ));
        assert!(matches!(
            parse_typing_payload("<npc_typing>color:#123456id:no-separator"),
            Err(TypingError::MalformedPayload(_))
        ));
    }

    #[test]
    fn first_payload_starts_then_updates() {
        let mut m = manager();
        let t0 = Instant::now();
        let ev = m.ingest("<npc_typing>npc-1:Bob\nHel", t0).unwrap();
        assert_eq!(
            ev,
            TypingEvent::Started {
                npc_id: "npc-1".into(),
                text: "Bob\nHel".into(),
                color: None
            }
        );
        let ev = m.ingest("<npc_typing>npc-1:Bob\nHello", t0).unwrap();
        assert!(matches!(ev, TypingEvent::Updated { .. }));
        assert_eq!(m.active_session_count(), 1);
        assert_eq!(m.sessions["npc-1"].current_text(), "Bob\nHello");
        assert_eq!(m.sessions["npc-1"].formatted_lines(), ["Bob", "Hello"]);
        let snapshot = m.dialogue().snapshot();
        assert_eq!(snapshot.npc_id.as_deref(), Some("npc-1"));
        assert_eq!(snapshot.name, "Bob");
    }

    #[test]
    fn end_tag_closes_every_session() {
        let mut m = manager();
        let t0 = Instant::now();
        m.ingest("<npc_typing>a:A\nx", t0).unwrap();
        m.ingest("<npc_typing>b:B\ny", t0).unwrap();
        assert_eq!(m.ingest("Villager: <npc_typing_end>", t0).unwrap(), TypingEvent::Ended);
        assert!(!m.has_active_session());
        assert_eq!(
            m.dialogue().snapshot().fade,
            crate::dialogue::FadeState::FadingOut
        );

        let ev = m.ingest("<npc_typing>a:A\nagain", t0).unwrap();
        assert!(matches!(ev, TypingEvent::Started { .. }));
    }

    #[test]
    fn disabled_manager_ignores_payloads() {
        let mut m = TypingManager::new(&StoryConfig {
            mod_enabled: false,
            ..StoryConfig::default()
        });
        let ev = m.ingest("<npc_typing>a:b", Instant::now()).unwrap();
        assert_eq!(ev, TypingEvent::Ignored);
        assert!(!m.has_active_session());
    }

    #[test]
    fn untagged_text_is_rejected() {
        let mut m = manager();
        assert_eq!(m.ingest("hello", Instant::now()), Err(TypingError::NotTyping));
    }

    #[test]
    fn malformed_payload_leaves_state_untouched() {
        let mut m = manager();
        assert!(m.ingest("<npc_typing>", Instant::now()).is_err());
        assert!(!m.has_active_session());
        assert!(!m.dialogue().snapshot().visible);
    }

    #[test]
    fn inactive_sessions_expire_on_tick() {
        let mut m = manager();
        let t0 = Instant::now();
        m.ingest("<npc_typing>a:A\nx", t0).unwrap();
        assert!(m.tick(t0 + Duration::from_secs(4)).is_empty());
        assert!(m.has_active_session());

        m.ingest("<npc_typing>a:A\nxy", t0 + Duration::from_secs(4)).unwrap();
        assert!(m.tick(t0 + Duration::from_secs(8)).is_empty());

        let finished = m.tick(t0 + Duration::from_millis(9_001));
        assert_eq!(finished, ["a"]);
        assert!(!m.has_active_session());
    }

    #[test]
    fn finish_single_npc() {
        let mut m = manager();
        let t0 = Instant::now();
        m.ingest("<npc_typing>a:A\nx", t0).unwrap();
        m.ingest("<npc_typing>b:B\ny", t0).unwrap();
        m.finish_session_for_npc("a");
        assert!(m.sessions["a"].is_complete());
        let finished = m.tick(t0);
        assert_eq!(finished, ["a"]);
        assert_eq!(m.active_session_count(), 1);
    }

    #[test]
    fn last_seen_is_forgotten_with_its_session() {
        let mut m = manager();
        let t0 = Instant::now();
        for i in 0..1000 {
            m.ingest(&format!("<npc_typing>npc-{i}:Tom\nhi"), t0).unwrap();
            m.ingest("<npc_typing_end>", t0).unwrap();
        }
        assert!(m.last_seen.is_empty());

        m.ingest("<npc_typing>a:A\nx", t0).unwrap();
        m.ingest("<npc_typing>b:B\ny", t0).unwrap();
        m.finish_session_for_npc("a");
        assert_eq!(m.tick(t0), ["a"]);
        assert_eq!(m.last_seen.len(), 1);

        m.tick(t0 + Duration::from_secs(3600));
        assert!(m.sessions.is_empty());
        assert!(m.last_seen.is_empty());
    }

    #[test]
    fn sink_entry_point_reports_errors() {
        let mut m = manager();
        assert!(m.on_incoming_server_message("<npc_typing>x:y").is_ok());
        assert_eq!(
            m.on_incoming_server_message("<npc_typing>broken"),
            Err(TypingError::MalformedPayload("broken".into()))
        );
    }
}
