use log::{debug, trace, warn};

use crate::chat::{truncate_for_log, ChatLine, ChatSink};
use crate::router::{self, InboundChatEvent};
use crate::typing::TypingSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// Let later interceptors and the default handler see the payload.
    Continue,
    /// Stop here; the default handler must not append or render it.
    Suppress,
}

/// One entry of the chain: a predicate plus a handler.
pub trait Interceptor {
    fn name(&self) -> &str;

    fn applies_to(&self, event: &InboundChatEvent) -> bool;

    fn intercept(&mut self, event: &InboundChatEvent) -> InterceptAction;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub suppressed: bool,
    pub handled_by: Option<String>,
}

// ─── Chain ───────────────────────────────────────────────────────────

/// Interceptors run in registration order ahead of the host's default
/// chat handler. The first `Suppress` short-circuits the rest.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interceptor: Box<dyn Interceptor>) {
        debug!("interceptor registered: {}", interceptor.name());
        self.interceptors.push(interceptor);
    }

    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.register(Box::new(interceptor));
        self
    }

    /// Run the chain only; the caller owns the default handling.
    pub fn dispatch(&mut self, event: &InboundChatEvent) -> ChainOutcome {
        for interceptor in self.interceptors.iter_mut() {
            if !interceptor.applies_to(event) {
                continue;
            }
            if interceptor.intercept(event) == InterceptAction::Suppress {
                trace!(
                    "conn {} payload suppressed by {}",
                    event.source().0,
                    interceptor.name()
                );
                return ChainOutcome {
                    suppressed: true,
                    handled_by: Some(interceptor.name().to_owned()),
                };
            }
        }
        ChainOutcome {
            suppressed: false,
            handled_by: None,
        }
    }

    /// Run the chain, then append to `sink` unless something suppressed it.
    pub fn process(&mut self, event: &InboundChatEvent, sink: &mut dyn ChatSink) -> ChainOutcome {
        let outcome = self.dispatch(event);
        if !outcome.suppressed {
            sink.append(ChatLine::new(event.raw_text()));
        }
        outcome
    }
}

// ─── Typing interceptor ──────────────────────────────────────────────

/// Diverts control-tagged payloads to a [`TypingSink`].
pub struct TypingInterceptor<S> {
    sink: S,
}

impl<S: TypingSink> TypingInterceptor<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

impl<S: TypingSink> Interceptor for TypingInterceptor<S> {
    fn name(&self) -> &str {
        "npc-typing"
    }

    fn applies_to(&self, event: &InboundChatEvent) -> bool {
        router::is_control_tagged(event.raw_text())
    }

    fn intercept(&mut self, event: &InboundChatEvent) -> InterceptAction {
        let decision = router::route(event.raw_text());
        if let Some(message) = &decision.forward {
            debug!(
                "conn {} {} payload diverted: \"{}\"",
                event.source().0,
                message.label(),
                truncate_for_log(message.text(), 80),
            );
            // Suppression stands even if the sink rejects the payload.
            if let Err(e) = self.sink.on_incoming_server_message(message.text()) {
                warn!("Typing sink rejected payload: {}", e);
            }
        }
        if decision.suppress_default_handling {
            InterceptAction::Suppress
        } else {
            InterceptAction::Continue
        }
    }
}
