//! Conversation history and token budget.
//!
//! [`HistoryManager`] owns the conversation: pinned head messages, the
//! rolling tail of turns, and the tool list. Every message carries a token
//! estimate computed once, by rendering that message alone, so the cost of
//! adding a turn does not grow with the length of the history. The running
//! total is kept equal to `tools_cost + Σ message estimates` after every
//! mutation.
//!
//! [`render`](HistoryManager::render) enforces the budget: it drops the
//! oldest tail turns first, then pinned messages as a last resort, and
//! finally renders the survivors into a chunk sequence for the
//! [`CacheScheduler`](crate::scheduler::CacheScheduler).

pub mod estimate;
pub mod segment;

use crate::backend::{
    MEDIA_PLACEHOLDER, MediaPart, MediaPipeline, PromptTemplate, RenderOptions, Tokenizer,
};
use crate::chunk::{ChunkRef, MediaChunkCache, MediaGroup, make_media_chunk, make_text_chunk};
use crate::config::SessionConfig;
use crate::error::{MediaError, RenderError, RenderResult, TemplateError};
use crate::{Message, MessageRole, Tool};
use estimate::TokenEstimator;
use segment::Segment;
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Message used to measure the fixed overhead of the tool list.
const TOOL_PROBE_CONTENT: &str = "Placeholder to measure tool overhead.";

/// Position of a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSlot {
    /// Index into the pinned head.
    Head(usize),
    /// Index into the tail, oldest first.
    Tail(usize),
}

/// What pruning removed during one render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Tail messages dropped (oldest first).
    pub dropped_tail: usize,
    /// Pinned messages dropped after the tail was exhausted.
    pub dropped_head: usize,
    /// Media cache entries released because no surviving message uses them.
    pub released_media: usize,
    /// Estimated tokens of tools plus surviving messages after pruning.
    pub estimated_tokens: usize,
    /// The budget cap the render had to fit.
    pub cap: usize,
}

/// A soft failure during rendering. Generation still proceeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderWarning {
    /// Pinned messages had to be dropped to fit the budget.
    PinnedDropped { count: usize },
    /// A media reference could not be loaded and was left out.
    MediaSkipped { identity: String, reason: String },
}

/// Result of [`HistoryManager::render`].
#[derive(Debug, Clone)]
pub struct RenderOutput {
    /// The rendered prompt text.
    pub prompt: String,
    /// The prompt as model input.
    pub chunks: Vec<ChunkRef>,
    /// Set when anything was pruned.
    pub pruned: Option<PruneReport>,
    pub warnings: Vec<RenderWarning>,
}

/// Snapshot of the running token estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationEstimate {
    pub tools: usize,
    pub messages: usize,
    pub total: usize,
}

/// Turns prompt text into chunks, resolving media through the cache.
struct Encoder {
    tokenizer: Box<dyn Tokenizer>,
    media: Box<dyn MediaPipeline>,
    media_cache: MediaChunkCache,
}

impl Encoder {
    fn media_group(&mut self, identity: &str) -> Result<MediaGroup, MediaError> {
        let media = &self.media;
        self.media_cache.lookup_or_insert_media(identity, || {
            let parts = media.load_and_tokenize(identity, MEDIA_PLACEHOLDER)?;
            let mut chunks = Vec::with_capacity(parts.len());
            let mut has_media = false;
            for part in parts {
                chunks.push(match part {
                    MediaPart::Text(tokens) => make_text_chunk(tokens),
                    MediaPart::Media {
                        kind,
                        token_count,
                        payload,
                    } => {
                        has_media = true;
                        make_media_chunk(kind, identity, token_count, payload)
                    }
                });
            }
            if !has_media {
                return Err(MediaError::Empty {
                    identity: identity.to_string(),
                });
            }
            debug!("Encoded media '{identity}' into {} chunk(s)", chunks.len());
            Ok(chunks)
        })
    }

    /// Exact token count of `text`. Unloadable media counts as zero.
    fn count_tokens(&mut self, text: &str) -> usize {
        let mut n = 0;
        for seg in segment::segments(text) {
            match seg {
                Segment::Text(span) => n += self.tokenizer.tokenize(span).len(),
                Segment::Media(identity) => match self.media_group(identity) {
                    Ok(group) => n += group.iter().map(|c| c.token_count()).sum::<usize>(),
                    Err(e) => debug!("Counting media '{identity}' as 0 tokens: {e}"),
                },
            }
        }
        n
    }

    fn encode(&mut self, text: &str, warnings: &mut Vec<RenderWarning>) -> Vec<ChunkRef> {
        let mut chunks = Vec::new();
        for seg in segment::segments(text) {
            match seg {
                Segment::Text(span) => {
                    let tokens = self.tokenizer.tokenize(span);
                    if !tokens.is_empty() {
                        chunks.push(make_text_chunk(tokens));
                    }
                }
                Segment::Media(identity) => match self.media_group(identity) {
                    Ok(group) => chunks.extend(group.iter().cloned()),
                    Err(e) => {
                        warn!("Skipping media '{identity}': {e}");
                        warnings.push(RenderWarning::MediaSkipped {
                            identity: identity.to_string(),
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }
        chunks
    }
}

/// Estimate `messages` + `tools` rendered on their own.
fn isolated_cost(
    template: &dyn PromptTemplate,
    estimator: &dyn TokenEstimator,
    encoder: &mut Encoder,
    messages: &[Message],
    tools: &[Tool],
) -> Result<usize, TemplateError> {
    let rendered = template.render(
        messages,
        tools,
        RenderOptions {
            add_generation_prompt: false,
        },
    )?;
    Ok(estimator.estimate(&rendered, &mut |text: &str| encoder.count_tokens(text)))
}

/// Owns the editable conversation and fits it to the context budget.
pub struct HistoryManager {
    /// Pinned head followed by the tail.
    messages: Vec<Message>,
    /// One estimate per entry of `messages`.
    costs: Vec<usize>,
    head_len: usize,
    tools: Vec<Tool>,
    tools_cost: usize,
    /// `tools_cost + Σ costs`.
    total: usize,
    template: Box<dyn PromptTemplate>,
    estimator: Box<dyn TokenEstimator>,
    encoder: Encoder,
    context_size: usize,
    safety_margin: usize,
    add_generation_prompt: bool,
}

impl HistoryManager {
    pub fn new(
        config: &SessionConfig,
        template: Box<dyn PromptTemplate>,
        tokenizer: Box<dyn Tokenizer>,
        media: Box<dyn MediaPipeline>,
    ) -> Self {
        Self {
            messages: Vec::new(),
            costs: Vec::new(),
            head_len: 0,
            tools: Vec::new(),
            tools_cost: 0,
            total: 0,
            template,
            estimator: config.estimator.build(),
            encoder: Encoder {
                tokenizer,
                media,
                media_cache: MediaChunkCache::new(config.media_cache_capacity),
            },
            context_size: config.context_size,
            safety_margin: config.safety_margin,
            add_generation_prompt: config.add_generation_prompt,
        }
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Add a message. Pinned messages go to the end of the head; others are
    /// appended to the tail. Only this message is rendered for estimation.
    pub fn add_message(&mut self, message: Message, pinned: bool) -> RenderResult<()> {
        let cost = self.message_cost(&message)?;
        let index = if pinned {
            self.head_len += 1;
            self.head_len - 1
        } else {
            self.messages.len()
        };
        self.messages.insert(index, message);
        self.costs.insert(index, cost);
        self.total += cost;
        trace!(
            "Added {} message (pinned={pinned}) costing ~{cost} tokens, total ~{}",
            self.messages[index].role, self.total
        );
        Ok(())
    }

    /// Add a tool definition and re-measure the tool overhead.
    pub fn add_tool(&mut self, tool: Tool) -> RenderResult<()> {
        self.tools.push(tool);
        match self.measure_tools() {
            Ok(cost) => {
                self.total = self.total - self.tools_cost + cost;
                self.tools_cost = cost;
                Ok(())
            }
            Err(e) => {
                self.tools.pop();
                Err(e.into())
            }
        }
    }

    /// Replace the content of one message, re-estimating only that message.
    pub fn set_content(
        &mut self,
        slot: MessageSlot,
        content: impl Into<String>,
    ) -> RenderResult<()> {
        let index = self.index_of(slot).ok_or(RenderError::NoSuchMessage(slot))?;
        let updated = Message::new(self.messages[index].role, content);
        let cost = self.message_cost(&updated)?;

        let old = std::mem::replace(&mut self.messages[index], updated);
        self.total = self.total - self.costs[index] + cost;
        self.costs[index] = cost;
        self.release_unreferenced(std::iter::once(&old));
        Ok(())
    }

    /// Drop every tail message, keeping pinned messages and tools.
    pub fn clear_history(&mut self) {
        let dropped: Vec<Message> = self.messages.drain(self.head_len..).collect();
        self.costs.truncate(self.head_len);
        self.recompute_total();
        self.release_unreferenced(dropped.iter());
    }

    /// Swap the estimation strategy and re-estimate everything with it.
    pub fn set_estimator(&mut self, estimator: Box<dyn TokenEstimator>) -> RenderResult<()> {
        let previous = std::mem::replace(&mut self.estimator, estimator);
        match self.reestimate_all() {
            Ok(()) => {
                debug!(
                    "Token estimator switched from {} to {}",
                    previous.name(),
                    self.estimator.name()
                );
                Ok(())
            }
            Err(e) => {
                self.estimator = previous;
                Err(e)
            }
        }
    }

    pub fn set_context_size(&mut self, tokens: usize) {
        self.context_size = tokens;
    }

    // ── Rendering ──────────────────────────────────────────────────

    /// Prune the conversation to fit, then render it into chunks.
    ///
    /// The budget cap is `context_size - max_generation_tokens`; the safety
    /// margin is added once to the estimate. Pruning is permanent: dropped
    /// messages leave the conversation.
    pub fn render(&mut self, max_generation_tokens: usize) -> RenderResult<RenderOutput> {
        let cap = self.context_size.saturating_sub(max_generation_tokens);
        let margin = self.safety_margin;

        if self.tools_cost + margin > cap {
            return Err(RenderError::BudgetExhausted {
                tools_cost: self.tools_cost,
                margin,
                cap,
                reserve: max_generation_tokens,
            });
        }

        let mut warnings = Vec::new();
        let pruned = if self.total + margin > cap {
            let report = self.prune(cap);
            if report.dropped_head > 0 {
                warn!(
                    "Too many pinned tokens, dropped {} pinned message(s)",
                    report.dropped_head
                );
                warnings.push(RenderWarning::PinnedDropped {
                    count: report.dropped_head,
                });
            }
            Some(report)
        } else {
            None
        };

        let prompt = self.template.render(
            &self.messages,
            &self.tools,
            RenderOptions {
                add_generation_prompt: self.add_generation_prompt,
            },
        )?;
        let chunks = self.encoder.encode(&prompt, &mut warnings);

        Ok(RenderOutput {
            prompt,
            chunks,
            pruned,
            warnings,
        })
    }

    /// Drop tail messages oldest first, then pinned messages oldest first,
    /// stopping as soon as the estimate fits.
    fn prune(&mut self, cap: usize) -> PruneReport {
        let margin = self.safety_margin;
        let mut report = PruneReport {
            cap,
            ..Default::default()
        };

        let mut total = self.total;
        let mut drop_tail = 0;
        while total + margin > cap && self.head_len + drop_tail < self.messages.len() {
            total -= self.costs[self.head_len + drop_tail];
            drop_tail += 1;
        }
        let mut drop_head = 0;
        while total + margin > cap && drop_head < self.head_len {
            total -= self.costs[drop_head];
            drop_head += 1;
        }

        let mut dropped: Vec<Message> = self
            .messages
            .drain(self.head_len..self.head_len + drop_tail)
            .collect();
        self.costs.drain(self.head_len..self.head_len + drop_tail);
        dropped.extend(self.messages.drain(..drop_head));
        self.costs.drain(..drop_head);
        self.head_len -= drop_head;
        self.total = total;

        report.dropped_tail = drop_tail;
        report.dropped_head = drop_head;
        report.released_media = self.release_unreferenced(dropped.iter());
        report.estimated_tokens = total;
        debug!(
            "Pruned {drop_tail} tail and {drop_head} pinned message(s); ~{total} tokens against cap {cap}"
        );
        report
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn head(&self) -> &[Message] {
        &self.messages[..self.head_len]
    }

    pub fn tail(&self) -> &[Message] {
        &self.messages[self.head_len..]
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Estimate for the message at `slot`.
    pub fn message_estimate(&self, slot: MessageSlot) -> Option<usize> {
        self.index_of(slot).map(|i| self.costs[i])
    }

    pub fn estimate(&self) -> ConversationEstimate {
        ConversationEstimate {
            tools: self.tools_cost,
            messages: self.total - self.tools_cost,
            total: self.total,
        }
    }

    pub fn media_cache(&self) -> &MediaChunkCache {
        &self.encoder.media_cache
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn safety_margin(&self) -> usize {
        self.safety_margin
    }

    // ── Internals ──────────────────────────────────────────────────

    fn index_of(&self, slot: MessageSlot) -> Option<usize> {
        match slot {
            MessageSlot::Head(i) if i < self.head_len => Some(i),
            MessageSlot::Tail(i) if self.head_len + i < self.messages.len() => {
                Some(self.head_len + i)
            }
            _ => None,
        }
    }

    fn message_cost(&mut self, message: &Message) -> Result<usize, TemplateError> {
        isolated_cost(
            &*self.template,
            &*self.estimator,
            &mut self.encoder,
            std::slice::from_ref(message),
            &[],
        )
    }

    fn measure_tools(&mut self) -> Result<usize, TemplateError> {
        if self.tools.is_empty() {
            return Ok(0);
        }
        let probe = [Message::new(MessageRole::System, TOOL_PROBE_CONTENT)];
        let with_tools = isolated_cost(
            &*self.template,
            &*self.estimator,
            &mut self.encoder,
            &probe,
            &self.tools,
        )?;
        let without = isolated_cost(
            &*self.template,
            &*self.estimator,
            &mut self.encoder,
            &probe,
            &[],
        )?;
        Ok(with_tools.saturating_sub(without))
    }

    fn reestimate_all(&mut self) -> RenderResult<()> {
        let mut costs = Vec::with_capacity(self.messages.len());
        for i in 0..self.messages.len() {
            let cost = isolated_cost(
                &*self.template,
                &*self.estimator,
                &mut self.encoder,
                std::slice::from_ref(&self.messages[i]),
                &[],
            )?;
            costs.push(cost);
        }
        self.tools_cost = self.measure_tools()?;
        self.costs = costs;
        self.recompute_total();
        Ok(())
    }

    fn recompute_total(&mut self) {
        self.total = self.tools_cost + self.costs.iter().sum::<usize>();
    }

    /// Release media referenced by `removed` that no surviving message still
    /// references. Returns how many cache entries were released.
    fn release_unreferenced<'a>(&mut self, removed: impl Iterator<Item = &'a Message>) -> usize {
        let candidates: HashSet<String> = removed
            .flat_map(|m| m.media_references().map(str::to_string).collect::<Vec<_>>())
            .collect();
        if candidates.is_empty() {
            return 0;
        }
        let live: HashSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| m.media_references())
            .collect();

        let mut released = 0;
        for identity in candidates.iter().filter(|id| !live.contains(id.as_str())) {
            if self.encoder.media_cache.release(identity) {
                debug!("Released media '{identity}' from cache");
                released += 1;
            }
        }
        released
    }
}

impl std::fmt::Debug for HistoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryManager")
            .field("head_len", &self.head_len)
            .field("tail_len", &(self.messages.len() - self.head_len))
            .field("tools", &self.tools.len())
            .field("total", &self.total)
            .field("estimator", &self.estimator.name())
            .finish()
    }
}
