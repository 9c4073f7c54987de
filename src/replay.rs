//! Offline driver: feed a recorded chat log through the interceptor chain
//! one payload per line, with simulated client ticks between lines.

use log::{debug, info, warn};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::chat::{ChatHistory, NpcChatMirror};
use crate::config::{StoryConfig, TICKS_PER_SECOND};
use crate::dialogue::{DialogueSegment, DialogueSnapshot};
use crate::interceptor::{InterceptorChain, TypingInterceptor};
use crate::router::{ConnectionId, InboundChatEvent};
use crate::service::{TypingForwarder, WorkItem};
use crate::typing::{TypingEvent, TypingManager};

/// Client command that force-closes a stuck dialogue.
pub const FIX_DIALOGUE_COMMAND: &str = "/fixdialogue";

#[derive(Debug, Clone, Copy)]
pub struct ReplayOptions {
    pub ticks_per_line: u32,
    pub json: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            ticks_per_line: TICKS_PER_SECOND,
            json: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub lines: usize,
    pub shown: usize,
    pub suppressed: usize,
    pub rejected: usize,
    pub sessions_finished: usize,
}

pub struct Replay {
    chain: InterceptorChain,
    work_rx: UnboundedReceiver<WorkItem>,
    manager: TypingManager,
    history: ChatHistory,
    mirror: Option<NpcChatMirror>,
    options: ReplayOptions,
    clock: Instant,
    last_snapshot: DialogueSnapshot,
    summary: ReplaySummary,
}

impl Replay {
    pub fn new(config: &StoryConfig, options: ReplayOptions) -> Self {
        let (forwarder, work_rx) = TypingForwarder::channel();
        let chain = InterceptorChain::new().with(TypingInterceptor::new(forwarder));
        let manager = TypingManager::new(config);
        let last_snapshot = manager.dialogue().snapshot();
        Self {
            chain,
            work_rx,
            manager,
            history: ChatHistory::new(config.history_limit),
            mirror: config.mirror_to_chat.then(NpcChatMirror::new),
            options,
            clock: Instant::now(),
            last_snapshot,
            summary: ReplaySummary::default(),
        }
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn summary(&self) -> &ReplaySummary {
        &self.summary
    }

    /// Process one recorded payload. A literal `\n` in the line stands for
    /// a newline inside the payload.
    pub fn feed_line(&mut self, line: &str, out: &mut dyn Write) -> io::Result<()> {
        self.summary.lines += 1;

        if line.trim() == FIX_DIALOGUE_COMMAND {
            let open = self.manager.active_session_count();
            info!("Dialogue reset requested with {} open session(s)", open);
            self.manager.finish_all_sessions();
            writeln!(out, "* dialogue reset, {} session(s) closed", open)?;
            return self.advance(out);
        }

        let event = InboundChatEvent::new(line.replace("\\n", "\n"), ConnectionId(0));
        let shown_before = self.history.len();
        let outcome = self.chain.process(&event, &mut self.history);
        if outcome.suppressed {
            self.summary.suppressed += 1;
        } else {
            self.summary.shown += 1;
            if let Some(shown) = self.history.visible().last() {
                writeln!(out, "[chat] {}", shown)?;
            }
        }

        while let Ok(item) = self.work_rx.try_recv() {
            match item {
                WorkItem::Ingest(raw) => match self.manager.ingest(&raw, self.clock) {
                    Ok(ev) => {
                        if let Some(mirror) = self.mirror.as_mut() {
                            mirror.apply(&ev, &mut self.history);
                        }
                        self.print_event(&ev, out)?;
                    }
                    Err(e) => {
                        warn!("Typing payload rejected: {}", e);
                        self.summary.rejected += 1;
                    }
                },
                WorkItem::FinishAll => self.manager.finish_all_sessions(),
                WorkItem::Shutdown => {}
            }
        }
        if self.history.len() != shown_before && outcome.suppressed {
            debug!("mirror wrote {} chat line(s)", self.history.len() - shown_before);
        }

        self.advance(out)
    }

    /// Run `ticks_per_line` simulated ticks and report dialogue changes.
    fn advance(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let tick = Duration::from_millis(1000 / TICKS_PER_SECOND as u64);
        for _ in 0..self.options.ticks_per_line {
            self.clock += tick;
            let finished = self.manager.tick(self.clock);
            self.summary.sessions_finished += finished.len();
        }

        let snapshot = self.manager.dialogue().snapshot();
        if snapshot != self.last_snapshot {
            self.print_snapshot(&snapshot, out)?;
            self.last_snapshot = snapshot;
        }
        Ok(())
    }

    fn print_event(&self, event: &TypingEvent, out: &mut dyn Write) -> io::Result<()> {
        if self.options.json {
            writeln!(out, "{}", serde_json::to_string(event).map_err(io::Error::other)?)
        } else {
            match event {
                TypingEvent::Started { npc_id, .. } => writeln!(out, "[typing] {} started", npc_id),
                TypingEvent::Updated { npc_id, .. } => writeln!(out, "[typing] {} updated", npc_id),
                TypingEvent::Ended => writeln!(out, "[typing] ended"),
                TypingEvent::Ignored => Ok(()),
            }
        }
    }

    fn print_snapshot(&self, snapshot: &DialogueSnapshot, out: &mut dyn Write) -> io::Result<()> {
        if self.options.json {
            return writeln!(out, "{}", serde_json::to_string(snapshot).map_err(io::Error::other)?);
        }
        if !snapshot.visible {
            return writeln!(out, "[dialogue] hidden");
        }
        let avatar = snapshot.avatar.as_deref().map(|a| format!("{a} ")).unwrap_or_default();
        let body: Vec<&str> = snapshot
            .segments
            .iter()
            .map(|s| match s {
                DialogueSegment::Plain(t) | DialogueSegment::Action(t) => t.trim(),
            })
            .collect();
        writeln!(
            out,
            "[dialogue] {}{}: {}{}",
            avatar,
            snapshot.name,
            body.join(" "),
            if snapshot.typing_complete { "" } else { "…" },
        )
    }
}

/// Replay every line from `input`, writing what the player would see.
pub fn run(
    input: impl BufRead,
    config: &StoryConfig,
    options: ReplayOptions,
    out: &mut dyn Write,
) -> io::Result<Replay> {
    let mut replay = Replay::new(config, options);
    for line in input.lines() {
        replay.feed_line(&line?, out)?;
    }
    if options.json {
        writeln!(
            out,
            "{}",
            serde_json::to_string(replay.summary()).map_err(io::Error::other)?
        )?;
    }
    info!(
        "Replay done: {} lines, {} shown, {} suppressed, {} rejected",
        replay.summary.lines, replay.summary.shown, replay.summary.suppressed, replay.summary.rejected,
    );
    Ok(replay)
}
