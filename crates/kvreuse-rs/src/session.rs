//! A chat session over one sequence of a model runtime.
//!
//! [`Session`] owns the conversation ([`HistoryManager`]), the committed
//! cache record ([`CacheScheduler`]) and the runtime. Each call to
//! [`generate`](Session::generate) runs one turn:
//!
//! 1. Prune and render the conversation, reserving room for generation.
//! 2. Reconcile the runtime's context cache with the rendered chunks.
//! 3. Sample tokens until end-of-generation, the token cap, or the
//!    callback asks to stop, decoding each accepted token into the cache.
//!
//! The generated reply is not added to the conversation; callers append it
//! with [`add_message`](Session::add_message) once they are happy with it.

use crate::backend::{MediaPipeline, ModelRuntime, PromptTemplate, Tokenizer};
use crate::chunk::total_tokens;
use crate::config::{GenerationConfig, SessionConfig};
use crate::error::{RenderResult, RuntimeError, SessionError, SessionResult};
use crate::events::{EventHandler, LoggingHandler, SessionEvent};
use crate::history::estimate::TokenEstimator;
use crate::history::{HistoryManager, MessageSlot, PruneReport, RenderWarning};
use crate::scheduler::{CacheScheduler, ReconcileReport};
use crate::streamer::Streamer;
use crate::{Message, TokenId, Tool};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Why a turn stopped generating.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// The turn reached its token cap.
    MaxTokens,
    /// The fragment callback returned `false`.
    Cancelled,
    /// The turn was asked for zero tokens.
    ZeroBudget,
}

/// Result of one [`Session::generate`] turn.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    /// Text streamed to the callback.
    pub text: String,
    /// Accepted tokens, excluding the end-of-generation token.
    pub tokens: Vec<TokenId>,
    pub stop: StopReason,
    /// How the context cache was reused for the prompt.
    pub report: ReconcileReport,
    pub pruned: Option<PruneReport>,
    pub warnings: Vec<RenderWarning>,
}

impl GenerationOutcome {
    fn empty(stop: StopReason) -> Self {
        Self {
            text: String::new(),
            tokens: Vec::new(),
            stop,
            report: ReconcileReport::default(),
            pruned: None,
            warnings: Vec::new(),
        }
    }
}

/// One conversation bound to one runtime sequence.
pub struct Session<R> {
    runtime: R,
    history: HistoryManager,
    scheduler: CacheScheduler,
    handler: Box<dyn EventHandler>,
    context_size: usize,
}

impl<R: ModelRuntime> Session<R> {
    /// Create a session. The context size is the smaller of the configured
    /// one and the runtime's.
    pub fn new(
        config: SessionConfig,
        runtime: R,
        template: impl PromptTemplate + 'static,
        tokenizer: impl Tokenizer + 'static,
        media: impl MediaPipeline + 'static,
    ) -> Self {
        let runtime_ctx = runtime.context_size();
        let context_size = if config.context_size > runtime_ctx {
            warn!(
                "Configured context of {} tokens exceeds the runtime's {runtime_ctx}; using {runtime_ctx}",
                config.context_size
            );
            runtime_ctx
        } else {
            config.context_size
        };

        let mut history = HistoryManager::new(
            &config,
            Box::new(template),
            Box::new(tokenizer),
            Box::new(media),
        );
        history.set_context_size(context_size);

        Self {
            runtime,
            history,
            scheduler: CacheScheduler::new(config.sequence_id),
            handler: Box::new(LoggingHandler),
            context_size,
        }
    }

    /// Replace the event handler (default: [`LoggingHandler`]).
    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    // ── Conversation ───────────────────────────────────────────────

    pub fn add_message(&mut self, message: Message, pinned: bool) -> RenderResult<()> {
        self.history.add_message(message, pinned)
    }

    pub fn add_tool(&mut self, tool: Tool) -> RenderResult<()> {
        self.history.add_tool(tool)
    }

    pub fn set_content(
        &mut self,
        slot: MessageSlot,
        content: impl Into<String>,
    ) -> RenderResult<()> {
        self.history.set_content(slot, content)
    }

    pub fn clear_history(&mut self) {
        self.history.clear_history();
    }

    pub fn set_estimator(&mut self, estimator: Box<dyn TokenEstimator>) -> RenderResult<()> {
        self.history.set_estimator(estimator)
    }

    /// Forget what the runtime's cache holds. The next turn recomputes the
    /// whole prompt. The runtime itself is not touched.
    pub fn reset_cache(&mut self) {
        self.scheduler.reset();
        self.handler.on_event(&SessionEvent::CacheReset {
            reason: "requested by caller",
        });
    }

    // ── Generation ─────────────────────────────────────────────────

    /// Run one turn, streaming text fragments to `on_fragment`. Returning
    /// `false` from the callback stops generation before the next compute.
    pub fn generate<F>(
        &mut self,
        config: &GenerationConfig,
        mut on_fragment: F,
    ) -> SessionResult<GenerationOutcome>
    where
        F: FnMut(&str) -> bool,
    {
        let mut max_tokens = config.max_tokens;
        if max_tokens == 0 {
            warn!("Asked to generate 0 tokens, nothing to do");
            return Ok(self.finish(GenerationOutcome::empty(StopReason::ZeroBudget)));
        }
        if max_tokens > self.context_size {
            // Largest reserve that still leaves room for the tools.
            let fixed = self.history.estimate().tools + self.history.safety_margin();
            let ceiling = self.context_size.saturating_sub(fixed).max(1);
            warn!(
                "max_tokens {max_tokens} exceeds the context size of {}, clamping to {ceiling}; \
                 the conversation will be pruned",
                self.context_size
            );
            max_tokens = ceiling;
        }

        let rendered = self.history.render(max_tokens)?;
        if total_tokens(&rendered.chunks) == 0 {
            warn!("Rendered prompt is empty, nothing to generate from");
            return Err(SessionError::EmptyPrompt);
        }
        if let Some(report) = &rendered.pruned {
            self.handler.on_event(&SessionEvent::Pruned(report));
        }
        for warning in &rendered.warnings {
            self.handler.on_event(&SessionEvent::Warning(warning));
        }

        let report = match self.scheduler.reconcile(&mut self.runtime, &rendered.chunks) {
            Ok(report) => report,
            Err(e) => return Err(self.runtime_failed(e, "runtime failed while reconciling")),
        };
        if report.computed_units == 0
            && let Err(e) = self.scheduler.refresh_logits(&mut self.runtime)
        {
            return Err(self.runtime_failed(e, "runtime failed while refreshing logits"));
        }
        self.handler.on_event(&SessionEvent::Reconciled(&report));

        let mut outcome = GenerationOutcome {
            pruned: rendered.pruned,
            warnings: rendered.warnings,
            report,
            ..GenerationOutcome::empty(StopReason::EndOfGeneration)
        };
        let mut streamer = Streamer::new();

        outcome.stop = loop {
            let token = match self.runtime.sample_next_token() {
                Ok(token) => token,
                Err(e) => {
                    if e.is_desyncing() {
                        self.scheduler.reset();
                    }
                    return Err(self.runtime_failed(e, "runtime failed while sampling"));
                }
            };
            if self.runtime.is_end_of_generation(token) {
                break StopReason::EndOfGeneration;
            }
            outcome.tokens.push(token);

            if let Some(fragment) = streamer.push(&self.runtime.detokenize(token)) {
                outcome.text.push_str(&fragment);
                if !on_fragment(&fragment) {
                    break StopReason::Cancelled;
                }
            }
            if outcome.tokens.len() >= max_tokens {
                break StopReason::MaxTokens;
            }
            if let Err(e) = self.scheduler.step(&mut self.runtime, token) {
                return Err(self.runtime_failed(e, "runtime failed while decoding"));
            }
        };

        if outcome.stop != StopReason::Cancelled
            && let Some(rest) = streamer.finish()
        {
            outcome.text.push_str(&rest);
            on_fragment(&rest);
        }
        info!(
            "Turn finished: {} token(s), {:?}, reused {}/{} prompt tokens",
            outcome.tokens.len(),
            outcome.stop,
            outcome.report.reused_tokens,
            outcome.report.prompt_tokens
        );
        Ok(self.finish(outcome))
    }

    fn finish(&self, outcome: GenerationOutcome) -> GenerationOutcome {
        self.handler.on_event(&SessionEvent::Finished {
            tokens: outcome.tokens.len(),
            stop: outcome.stop,
        });
        outcome
    }

    fn runtime_failed(&self, error: RuntimeError, context: &str) -> SessionError {
        if error.is_desyncing() {
            self.handler.on_event(&SessionEvent::CacheReset { reason: context });
        } else {
            debug!("{context}: {error}");
        }
        error.into()
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn scheduler(&self) -> &CacheScheduler {
        &self.scheduler
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }
}
