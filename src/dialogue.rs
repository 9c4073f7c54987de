//! Presentation state of the NPC dialogue box: typewriter progress, fade
//! transitions and auto-close. Drawing is left to whoever reads the
//! snapshot.

use log::debug;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::config::{StoryConfig, TICKS_PER_SECOND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FadeState {
    None,
    FadingIn,
    FadingOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text")]
pub enum DialogueSegment {
    Plain(String),
    /// Stage direction written between `*`s, shown in parentheses.
    Action(String),
}

#[derive(Debug, Clone, Copy)]
pub struct DialogueSettings {
    pub typing_speed: u32,
    pub fade_duration_ticks: u32,
    pub vanish_ticks: u32,
}

impl From<&StoryConfig> for DialogueSettings {
    fn from(config: &StoryConfig) -> Self {
        Self {
            typing_speed: config.typing_speed,
            fade_duration_ticks: config.fade_duration_ticks,
            vanish_ticks: config.vanish_ticks(),
        }
    }
}

impl Default for DialogueSettings {
    fn default() -> Self {
        Self::from(&StoryConfig::default())
    }
}

/// What a renderer needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogueSnapshot {
    pub visible: bool,
    pub npc_id: Option<String>,
    pub name: String,
    pub avatar: Option<String>,
    pub name_color: Option<[f32; 4]>,
    pub text: String,
    pub segments: Vec<DialogueSegment>,
    pub typing_complete: bool,
    pub fade: FadeState,
    pub opacity: f32,
}

pub struct DialogueBox {
    settings: DialogueSettings,
    npc_id: Option<String>,
    name: String,
    avatar: Option<String>,
    name_color: Option<[f32; 4]>,
    body: String,
    body_chars: usize,
    displayed_chars: usize,
    ticks_since_char: u32,
    typing_complete: bool,
    visible: bool,
    auto_close_timer: u32,
    fade_state: FadeState,
    fade_progress: f32,
}

impl DialogueBox {
    pub fn new(settings: DialogueSettings) -> Self {
        Self {
            settings,
            npc_id: None,
            name: String::new(),
            avatar: None,
            name_color: None,
            body: String::new(),
            body_chars: 0,
            displayed_chars: 0,
            ticks_since_char: 0,
            typing_complete: false,
            visible: false,
            auto_close_timer: 0,
            fade_state: FadeState::None,
            fade_progress: 0.0,
        }
    }

    pub fn start(&mut self, npc_id: &str, text: &str, color: Option<&str>) {
        debug!("dialogue start for {}", npc_id);
        self.npc_id = Some(npc_id.to_owned());
        self.name_color = color.and_then(parse_hex_color);
        self.name.clear();
        self.avatar = None;
        self.body.clear();
        self.body_chars = 0;
        self.parse(text);
        self.visible = true;
        self.restart_typing();
        self.fade_state = FadeState::FadingIn;
        self.fade_progress = 0.0;
    }

    /// Replace the text for the NPC already shown; a different NPC starts
    /// a fresh dialogue.
    pub fn update(&mut self, npc_id: &str, text: &str, color: Option<&str>) {
        if self.npc_id.as_deref() != Some(npc_id) {
            self.start(npc_id, text, color);
            return;
        }
        self.name_color = color.and_then(parse_hex_color);
        self.parse(text);
        self.restart_typing();
    }

    /// Begin fading out immediately.
    pub fn end(&mut self) {
        self.auto_close_timer = self.settings.vanish_ticks;
        self.fade_state = FadeState::FadingOut;
        self.fade_progress = 0.0;
    }

    fn restart_typing(&mut self) {
        self.typing_complete = false;
        self.displayed_chars = 0;
        self.ticks_since_char = 0;
        self.auto_close_timer = 0;
    }

    fn parse(&mut self, text: &str) {
        let lines: Vec<&str> = text.lines().collect();
        let Some(name_idx) = lines.iter().position(|l| !l.trim().is_empty()) else {
            return;
        };
        if name_idx + 1 >= lines.len() {
            return;
        }

        let (avatar, name) = split_avatar(&strip_tags(lines[name_idx]));
        self.avatar = avatar;
        self.name = name;
        self.body = lines[name_idx + 1..]
            .iter()
            .take_while(|l| !l.trim().is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        self.body_chars = self.body.chars().count();
    }

    /// Advance one client tick.
    pub fn tick(&mut self) {
        if !self.visible {
            return;
        }

        let step = 1.0 / self.settings.fade_duration_ticks.max(1) as f32;
        match self.fade_state {
            FadeState::FadingIn => {
                self.fade_progress += step;
                if self.fade_progress >= 1.0 {
                    self.fade_progress = 1.0;
                    self.fade_state = FadeState::None;
                }
            }
            FadeState::FadingOut => {
                self.fade_progress += step;
                if self.fade_progress >= 1.0 {
                    debug!("dialogue hidden");
                    self.visible = false;
                    self.npc_id = None;
                    self.displayed_chars = 0;
                    self.typing_complete = false;
                    self.fade_state = FadeState::None;
                    self.fade_progress = 1.0;
                    return;
                }
            }
            FadeState::None => {}
        }

        if self.typing_complete {
            self.auto_close_timer += 1;
            if self.auto_close_timer >= self.settings.vanish_ticks {
                self.fade_state = FadeState::FadingOut;
                self.fade_progress = 0.0;
                self.auto_close_timer = 0;
            }
            return;
        }

        self.ticks_since_char += 1;
        let ticks_per_char = (TICKS_PER_SECOND / self.settings.typing_speed.max(1)).max(1);
        if self.ticks_since_char >= ticks_per_char {
            self.displayed_chars += 1;
            self.ticks_since_char = 0;
            if self.displayed_chars >= self.body_chars {
                self.typing_complete = true;
                self.auto_close_timer = 0;
            }
        }
    }

    pub fn opacity(&self) -> f32 {
        match self.fade_state {
            FadeState::FadingIn => self.fade_progress,
            FadeState::FadingOut if self.fade_progress >= 0.99 => 0.0,
            FadeState::FadingOut => 1.0 - self.fade_progress,
            FadeState::None => 1.0,
        }
    }

    /// Body text revealed so far by the typewriter.
    pub fn visible_text(&self) -> String {
        self.body.chars().take(self.displayed_chars).collect()
    }

    pub fn segments(&self) -> Vec<DialogueSegment> {
        split_segments(&self.visible_text())
    }

    pub fn snapshot(&self) -> DialogueSnapshot {
        DialogueSnapshot {
            visible: self.visible,
            npc_id: self.npc_id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            name_color: self.name_color,
            text: self.visible_text(),
            segments: self.segments(),
            typing_complete: self.typing_complete,
            fade: self.fade_state,
            opacity: self.opacity(),
        }
    }
}

// ─── Text helpers ────────────────────────────────────────────────────

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"))
}

fn avatar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([^\p{L}\p{N}\s.,!?'-]+)\s*(.*)$").expect("valid avatar pattern")
    })
}

/// Remove markup tags such as `<gold>` or `</bold>`.
pub fn strip_tags(text: &str) -> String {
    tag_regex().replace_all(text, "").into_owned()
}

/// Split a leading emoji/symbol run (the avatar) from the NPC name.
fn split_avatar(name_line: &str) -> (Option<String>, String) {
    match avatar_regex().captures(name_line) {
        Some(caps) => (
            caps.get(1).map(|m| m.as_str().to_owned()),
            caps.get(2).map_or("", |m| m.as_str()).trim().to_owned(),
        ),
        None => (None, name_line.trim().to_owned()),
    }
}

/// Split body text on `*` into plain speech and parenthesized actions.
pub fn split_segments(text: &str) -> Vec<DialogueSegment> {
    let cleaned = text
        .lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join(" ");

    let mut segments = Vec::new();
    let mut after_action = false;
    for (i, piece) in cleaned.split('*').enumerate() {
        let is_action = i % 2 == 1;
        if piece.is_empty() {
            continue;
        }
        if is_action {
            let core = piece.trim();
            let inside = if core.starts_with('(') && core.ends_with(')') {
                core.to_owned()
            } else {
                format!("({})", core)
            };
            segments.push(DialogueSegment::Action(inside));
            after_action = true;
        } else {
            let text = if after_action { piece.trim_start() } else { piece };
            if !text.is_empty() {
                segments.push(DialogueSegment::Plain(text.to_owned()));
            }
            after_action = false;
        }
    }
    segments
}

/// Parse `#RRGGBB` (leading `#` optional) into RGBA floats.
pub fn parse_hex_color(color: &str) -> Option<[f32; 4]> {
    let hex = color.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
    let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
    let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
    Some([r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, 1.0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DialogueSettings {
        DialogueSettings {
            typing_speed: 10,
            fade_duration_ticks: 4,
            vanish_ticks: 6,
        }
    }

    fn run(dialogue: &mut DialogueBox, ticks: usize) {
        for _ in 0..ticks {
            dialogue.tick();
        }
    }

    #[test]
    fn parses_name_avatar_and_body() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "\n🧙 <gold>Merlin</gold>\nWelcome, traveler.\nSit.\n\nignored", Some("#ff8000"));
        assert!(d.visible);
        assert_eq!(d.avatar.as_deref(), Some("🧙"));
        assert_eq!(d.name, "Merlin");
        assert_eq!(d.body, "Welcome, traveler.\nSit.");
        assert_eq!(d.snapshot().name_color, Some([1.0, 128.0 / 255.0, 0.0, 1.0]));
    }

    #[test]
    fn name_without_avatar() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Old Tom\nHello", None);
        assert_eq!(d.avatar.as_deref(), None);
        assert_eq!(d.name, "Old Tom");
    }

    #[test]
    fn single_line_keeps_previous_text() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nFirst", None);
        d.update("npc-1", "just one line", None);
        assert_eq!(d.name, "Tom");
        assert_eq!(d.body, "First");
    }

    #[test]
    fn new_npc_does_not_inherit_previous_text() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "🧙 Merlin\nWelcome", None);
        d.update("npc-2", "Ann", None);
        assert_eq!(d.npc_id.as_deref(), Some("npc-2"));
        assert_eq!(d.name, "");
        assert_eq!(d.avatar, None);
        assert_eq!(d.body, "");

        let snapshot = d.snapshot();
        assert!(snapshot.visible);
        assert_eq!(snapshot.text, "");
        assert!(snapshot.segments.is_empty());

        d.update("npc-2", "Ann\nHi", None);
        assert_eq!(d.name, "Ann");
        assert_eq!(d.body, "Hi");
    }

    #[test]
    fn typewriter_reveals_one_char_every_two_ticks() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nabc", None);
        assert_eq!(d.visible_text(), "");
        run(&mut d, 2);
        assert_eq!(d.visible_text(), "a");
        run(&mut d, 3);
        assert_eq!(d.visible_text(), "ab");
        run(&mut d, 1);
        assert_eq!(d.visible_text(), "abc");
        assert!(d.typing_complete);
    }

    #[test]
    fn fade_in_then_auto_close() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nab", None);
        assert_eq!(d.opacity(), 0.0);
        run(&mut d, 4);
        assert_eq!(d.fade_state, FadeState::None);
        assert_eq!(d.opacity(), 1.0);
        assert!(d.typing_complete);

        // vanish_ticks of idle time, then a full fade-out.
        run(&mut d, 6);
        assert_eq!(d.fade_state, FadeState::FadingOut);
        run(&mut d, 3);
        assert!(d.visible);
        run(&mut d, 1);
        assert!(!d.visible);
        assert_eq!(d.npc_id.as_deref(), None);
    }

    #[test]
    fn end_starts_fade_out_immediately() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nA long line of text", None);
        run(&mut d, 4);
        d.end();
        assert_eq!(d.fade_state, FadeState::FadingOut);
        assert_eq!(d.opacity(), 1.0);
        run(&mut d, 2);
        assert!((d.opacity() - 0.5).abs() < 1e-6);
        run(&mut d, 2);
        assert!(!d.visible);
    }

    #[test]
    fn update_from_other_npc_restarts() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nabc", None);
        run(&mut d, 10);
        d.update("npc-2", "Ann\nxyz", Some("#00ff00"));
        assert_eq!(d.npc_id.as_deref(), Some("npc-2"));
        assert_eq!(d.fade_state, FadeState::FadingIn);
        assert_eq!(d.visible_text(), "");
        assert_eq!(d.snapshot().name_color, Some([0.0, 1.0, 0.0, 1.0]));
    }

    #[test]
    fn update_same_npc_resets_typing_only() {
        let mut d = DialogueBox::new(settings());
        d.start("npc-1", "Tom\nabc", None);
        run(&mut d, 10);
        d.update("npc-1", "Tom\nabcdef", None);
        assert_eq!(d.fade_state, FadeState::None);
        assert!(!d.typing_complete);
        assert_eq!(d.visible_text(), "");
    }

    #[test]
    fn hidden_box_ignores_ticks() {
        let mut d = DialogueBox::new(settings());
        run(&mut d, 100);
        assert!(!d.visible);
        assert_eq!(d.snapshot().text, "");
    }

    #[test]
    fn segments_split_actions() {
        let segments = split_segments("*bows deeply*  Welcome!\n  *(smiles)* Come in");
        assert_eq!(
            segments,
            vec![
                DialogueSegment::Action("(bows deeply)".into()),
                DialogueSegment::Plain("Welcome! ".into()),
                DialogueSegment::Action("(smiles)".into()),
                DialogueSegment::Plain("Come in".into()),
            ]
        );
    }

    #[test]
    fn hex_colors() {
        assert_eq!(parse_hex_color("#FFFFFF"), Some([1.0, 1.0, 1.0, 1.0]));
        assert_eq!(parse_hex_color("000000"), Some([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(parse_hex_color("#fff"), None);
        assert_eq!(parse_hex_color("#gggggg"), None);
        assert_eq!(parse_hex_color(""), None);
    }
}
