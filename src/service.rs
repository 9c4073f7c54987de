use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::{StoryConfig, TICKS_PER_SECOND};
use crate::dialogue::DialogueSnapshot;
use crate::typing::{TypingError, TypingEvent, TypingManager, TypingSink};

// ─── Work / response types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    Ingest(String),
    /// Drop every session and hide the dialogue.
    FinishAll,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServiceEvent {
    Typing(TypingEvent),
    Rejected(String),
    SessionsFinished(Vec<String>),
    Dialogue(DialogueSnapshot),
}

// ─── Forwarder ───────────────────────────────────────────────────────

/// Host-side handle. Sending never blocks the caller.
#[derive(Clone)]
pub struct TypingForwarder {
    work_tx: UnboundedSender<WorkItem>,
}

impl TypingForwarder {
    pub fn new(work_tx: UnboundedSender<WorkItem>) -> Self {
        Self { work_tx }
    }

    /// Forwarder plus the receiving end, for callers that drain it themselves.
    pub fn channel() -> (Self, UnboundedReceiver<WorkItem>) {
        let (tx, rx) = unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn finish_all(&self) -> Result<(), TypingError> {
        self.send(WorkItem::FinishAll)
    }

    fn send(&self, item: WorkItem) -> Result<(), TypingError> {
        self.work_tx.send(item).map_err(|_| TypingError::ServiceClosed)
    }
}

impl TypingSink for TypingForwarder {
    fn on_incoming_server_message(&mut self, raw_text: &str) -> Result<(), TypingError> {
        self.send(WorkItem::Ingest(raw_text.to_owned()))
    }
}

// ─── Typing service ──────────────────────────────────────────────────

/// Background worker owning the typing manager, ticking it at the client
/// tick rate.
pub struct TypingService {
    forwarder: TypingForwarder,
    _handle: thread::JoinHandle<()>,
}

impl TypingService {
    /// Start the worker thread.
    /// Returns (service, event_receiver).
    pub fn start(config: StoryConfig) -> (Self, mpsc::Receiver<ServiceEvent>) {
        let (forwarder, mut work_rx) = TypingForwarder::channel();
        let (event_tx, event_rx) = mpsc::channel::<ServiceEvent>();

        let handle = thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to create tokio runtime: {}", e);
                    return;
                }
            };

            let mut manager = TypingManager::new(&config);
            let mut last_snapshot = manager.dialogue().snapshot();
            info!("Typing service started");

            rt.block_on(async {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(1000 / TICKS_PER_SECOND as u64));
                loop {
                    tokio::select! {
                        item = work_rx.recv() => match item {
                            None | Some(WorkItem::Shutdown) => {
                                if manager.has_active_session() {
                                    info!(
                                        "Typing service shutting down with {} open session(s)",
                                        manager.active_session_count()
                                    );
                                } else {
                                    info!("Typing service shutting down");
                                }
                                break;
                            }
                            Some(WorkItem::Ingest(raw)) => {
                                let event = match manager.ingest(&raw, Instant::now()) {
                                    Ok(ev) => ServiceEvent::Typing(ev),
                                    Err(e) => {
                                        warn!("Typing payload rejected: {}", e);
                                        ServiceEvent::Rejected(e.to_string())
                                    }
                                };
                                let _ = event_tx.send(event);
                            }
                            Some(WorkItem::FinishAll) => {
                                debug!("finishing all sessions on request");
                                manager.finish_all_sessions();
                            }
                        },
                        _ = ticker.tick() => {
                            let finished = manager.tick(Instant::now());
                            if !finished.is_empty() {
                                let _ = event_tx.send(ServiceEvent::SessionsFinished(finished));
                            }
                            let snapshot = manager.dialogue().snapshot();
                            if snapshot != last_snapshot {
                                last_snapshot = snapshot.clone();
                                let _ = event_tx.send(ServiceEvent::Dialogue(snapshot));
                            }
                        }
                    }
                }
            });

            info!("Typing service thread exiting");
        });

        let service = TypingService {
            forwarder,
            _handle: handle,
        };

        (service, event_rx)
    }

    /// A cloneable handle for the packet-handling side.
    pub fn forwarder(&self) -> TypingForwarder {
        self.forwarder.clone()
    }

    /// Shut down the background thread.
    pub fn shutdown(&self) {
        let _ = self.forwarder.send(WorkItem::Shutdown);
    }
}

impl Drop for TypingService {
    fn drop(&mut self) {
        let _ = self.forwarder.send(WorkItem::Shutdown);
    }
}
