//! Session events and handlers.
//!
//! A [`Session`](crate::session::Session) reports what it decided each turn
//! through [`SessionEvent`]s: how much history was pruned, which media was
//! skipped, how much of the context cache was reused. Soft failures (pinned
//! messages dropped, unreadable media) are reported here and nowhere else,
//! so callers that care should install a handler.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget sessions |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |
//! | [`CompositeEventHandler`] | Several handlers in order |

use crate::history::{PruneReport, RenderWarning};
use crate::scheduler::ReconcileReport;
use crate::session::StopReason;
use tracing::{debug, info, warn};

/// Events emitted by a session during a turn.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    /// History was pruned to fit the budget cap.
    Pruned(&'a PruneReport),
    /// A soft failure during rendering.
    Warning(&'a RenderWarning),
    /// The context cache was reconciled with the new prompt.
    Reconciled(&'a ReconcileReport),
    /// The scheduler forgot its committed record.
    CacheReset { reason: &'a str },
    /// Generation for this turn ended.
    Finished { tokens: usize, stop: StopReason },
}

/// Handler for session events.
pub trait EventHandler {
    fn on_event(&self, event: &SessionEvent<'_>) {
        let _ = event;
    }
}

/// Ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Forwards events to `tracing`. Soft failures log at `warn`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::Pruned(report) => info!(
                "Pruned {} tail and {} pinned messages (~{} tokens, cap {})",
                report.dropped_tail, report.dropped_head, report.estimated_tokens, report.cap
            ),
            SessionEvent::Warning(RenderWarning::PinnedDropped { count }) => {
                warn!("Budget forced {count} pinned message(s) out of the conversation")
            }
            SessionEvent::Warning(RenderWarning::MediaSkipped { identity, reason }) => {
                warn!("Skipped media '{identity}': {reason}")
            }
            SessionEvent::Reconciled(report) => debug!(
                "Context cache: reused {} tokens over {} chunk(s), computed {} tokens in {} unit(s)",
                report.reused_tokens,
                report.kept_chunks,
                report.computed_tokens,
                report.computed_units
            ),
            SessionEvent::CacheReset { reason } => warn!("Context cache record reset: {reason}"),
            SessionEvent::Finished { tokens, stop } => {
                debug!("Generation finished after {tokens} token(s): {stop:?}")
            }
        }
    }
}

/// An event handler backed by a closure.
pub struct FnEventHandler<F>(F)
where
    F: Fn(&SessionEvent<'_>);

impl<F> FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>),
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&SessionEvent<'_>),
{
    fn on_event(&self, event: &SessionEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &SessionEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}
