//! Live driver: payloads read line by line go through the interceptor
//! chain while the typing service runs on its own thread. Service events
//! are printed and, with `mirror_to_chat`, written into the chat history.

use log::{error, info, warn};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::chat::{ChatHistory, ChatLine, NpcChatMirror};
use crate::config::StoryConfig;
use crate::interceptor::{InterceptorChain, TypingInterceptor};
use crate::replay::FIX_DIALOGUE_COMMAND;
use crate::router::{ConnectionId, InboundChatEvent};
use crate::service::{ServiceEvent, TypingService};
use crate::typing::TypingEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Print one service event and apply typing text to the mirror.
pub fn report_event(
    event: &ServiceEvent,
    mirror: Option<&mut NpcChatMirror>,
    history: &Mutex<ChatHistory>,
    out: &mut dyn Write,
) -> io::Result<()> {
    match event {
        ServiceEvent::Typing(ev) => {
            if let Some(mirror) = mirror {
                mirror.apply(ev, &mut *lock(history));
            }
            match ev {
                TypingEvent::Started { npc_id, .. } => writeln!(out, "[typing] {} started", npc_id),
                TypingEvent::Updated { npc_id, .. } => writeln!(out, "[typing] {} updated", npc_id),
                TypingEvent::Ended => writeln!(out, "[typing] ended"),
                TypingEvent::Ignored => Ok(()),
            }
        }
        ServiceEvent::Rejected(reason) => writeln!(out, "[typing] rejected: {}", reason),
        ServiceEvent::SessionsFinished(ids) => writeln!(out, "[typing] finished: {}", ids.join(", ")),
        ServiceEvent::Dialogue(snapshot) if snapshot.visible => writeln!(
            out,
            "[dialogue] {}: {}",
            snapshot.name,
            snapshot.text.replace('\n', " ")
        ),
        ServiceEvent::Dialogue(_) => writeln!(out, "[dialogue] hidden"),
    }
}

/// Run until `input` ends. `on_chat` sees every line the default handler
/// appended. Returns the chat history, NPC lines included when mirrored.
pub fn run<W>(
    input: impl BufRead,
    config: &StoryConfig,
    out: W,
    mut on_chat: impl FnMut(&ChatLine),
) -> io::Result<ChatHistory>
where
    W: Write + Send + 'static,
{
    let out = Arc::new(Mutex::new(out));
    let history = Arc::new(Mutex::new(ChatHistory::new(config.history_limit)));

    let (service, events) = TypingService::start(config.clone());
    let forwarder = service.forwarder();
    let mut chain = InterceptorChain::new().with(TypingInterceptor::new(forwarder.clone()));

    let printer = {
        let out = Arc::clone(&out);
        let history = Arc::clone(&history);
        let mut mirror = config.mirror_to_chat.then(NpcChatMirror::new);
        thread::spawn(move || {
            for event in events {
                if let Err(e) = report_event(&event, mirror.as_mut(), &history, &mut *lock(&out)) {
                    warn!("Could not report typing event: {}", e);
                }
            }
        })
    };

    info!("Watching for chat payloads");
    let mut fed = Ok(());
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                fed = Err(e);
                break;
            }
        };
        if line.trim() == FIX_DIALOGUE_COMMAND {
            if let Err(e) = forwarder.finish_all() {
                warn!("Could not reset dialogue: {}", e);
            }
            continue;
        }

        let event = InboundChatEvent::new(line.replace("\\n", "\n"), ConnectionId(0));
        // The printer takes `out` before `history`; never hold both here.
        let newest = {
            let mut chat = lock(&history);
            if chain.process(&event, &mut *chat).suppressed {
                continue;
            }
            chat.newest().cloned()
        };
        if let Some(newest) = newest {
            let shown = writeln!(lock(&out), "[chat] {}", newest.display_line());
            on_chat(&newest);
            if let Err(e) = shown {
                fed = Err(e);
                break;
            }
        }
    }

    // The worker drains every queued payload before it sees the shutdown.
    service.shutdown();
    drop(chain);
    drop(forwarder);
    drop(service);
    if printer.join().is_err() {
        error!("Typing event printer panicked");
    }
    fed?;

    let history = Arc::try_unwrap(history)
        .map_err(|_| io::Error::other("chat history still shared"))?
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner);
    Ok(history)
}
