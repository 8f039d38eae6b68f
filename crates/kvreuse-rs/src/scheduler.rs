//! Context cache reconciliation.
//!
//! The [`CacheScheduler`] keeps a record of the chunks it last pushed into
//! the runtime's context cache. Each turn it diffs the newly rendered chunk
//! sequence against that record and sends only the divergent suffix for
//! computation:
//!
//! | Step | Action |
//! |------|--------|
//! | Diff | Walk both sequences; media matches by identity, text by tokens |
//! | Truncate | Keep exactly `perfect_keep + last_keep` tokens in the cache |
//! | Boundary | Compute the unmatched tail of a partially reused text chunk |
//! | Suffix | Compute every later chunk; the last unit produces logits |
//! | Commit | Record the new sequence as resident |
//!
//! A fatal runtime error empties the record, so the next reconcile starts
//! from a full recompute. A retryable error leaves the record describing
//! exactly what the runtime holds.

use crate::backend::{ComputeUnit, ModelRuntime};
use crate::chunk::{Chunk, ChunkKind, ChunkRef, make_text_chunk, total_tokens};
use crate::error::{RuntimeError, RuntimeResult};
use crate::{SequenceId, TokenId};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Outcome of the diff between the committed record and a new sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReusePlan {
    /// Tokens in chunks that matched completely.
    pub perfect_keep: usize,
    /// Matched leading tokens of the boundary text chunk.
    pub last_keep: usize,
    /// Number of chunks that matched completely.
    pub kept_chunks: usize,
}

impl ReusePlan {
    /// Leading tokens the cache keeps.
    pub fn keep(&self) -> usize {
        self.perfect_keep + self.last_keep
    }
}

/// Diff `prior` against `new`, position by position.
///
/// Media chunks match on identity and text chunks on their full token
/// sequence. The walk stops at the first chunk that does not match
/// completely; if that chunk is text on both sides, its common leading
/// tokens become `last_keep`.
pub fn plan(prior: &[ChunkRef], new: &[ChunkRef]) -> ReusePlan {
    let mut plan = ReusePlan::default();
    for (old, next) in prior.iter().zip(new) {
        if old.is_cache_equivalent(next) {
            plan.perfect_keep += next.token_count();
            plan.kept_chunks += 1;
            continue;
        }
        if old.kind() == ChunkKind::Text && next.kind() == ChunkKind::Text {
            plan.last_keep = old
                .tokens()
                .iter()
                .zip(next.tokens())
                .take_while(|(a, b)| a == b)
                .count();
        }
        break;
    }
    plan
}

/// What one [`CacheScheduler::reconcile`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tokens in the new sequence.
    pub prompt_tokens: usize,
    /// Tokens left in the cache and not recomputed.
    pub reused_tokens: usize,
    /// Chunks that matched completely.
    pub kept_chunks: usize,
    /// Tokens sent for computation.
    pub computed_tokens: usize,
    /// Compute calls issued.
    pub computed_units: usize,
}

/// Cumulative counters across reconciles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub reconciles: u64,
    pub reused_tokens: u64,
    pub computed_tokens: u64,
    /// Times the record was emptied after a fatal error or explicit reset.
    pub resets: u64,
}

impl SchedulerStats {
    /// Fraction of prompt tokens served from the cache (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.reused_tokens + self.computed_tokens;
        if total == 0 {
            0.0
        } else {
            self.reused_tokens as f64 / total as f64
        }
    }
}

/// One pending compute call and the chunk it completes.
struct Work<'a> {
    unit: ComputeUnit<'a>,
    completes: usize,
}

/// Owns the committed record for one sequence of the runtime's cache.
#[derive(Debug)]
pub struct CacheScheduler {
    sequence_id: SequenceId,
    committed: Vec<ChunkRef>,
    stats: SchedulerStats,
}

impl CacheScheduler {
    pub fn new(sequence_id: SequenceId) -> Self {
        Self {
            sequence_id,
            committed: Vec::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Bring the runtime's cache in line with `chunks`, computing only what
    /// is not already resident.
    pub fn reconcile<R>(
        &mut self,
        runtime: &mut R,
        chunks: &[ChunkRef],
    ) -> RuntimeResult<ReconcileReport>
    where
        R: ModelRuntime + ?Sized,
    {
        let plan = plan(&self.committed, chunks);
        let mut report = ReconcileReport {
            prompt_tokens: total_tokens(chunks),
            reused_tokens: plan.keep(),
            kept_chunks: plan.kept_chunks,
            ..Default::default()
        };
        trace!(
            "Reconcile plan: perfect_keep={} last_keep={} kept_chunks={}",
            plan.perfect_keep, plan.last_keep, plan.kept_chunks
        );

        if let Err(e) = runtime.truncate(self.sequence_id, plan.keep()) {
            return Err(self.fail(e, None));
        }

        // Chunks fully resident so far, plus a partially resident boundary.
        let mut resident = plan.kept_chunks;
        let mut partial = None;
        let mut work = Vec::new();

        if plan.last_keep > 0
            && let Some(boundary) = chunks.get(plan.kept_chunks)
        {
            let tail = boundary.tokens().get(plan.last_keep..).unwrap_or_default();
            if tail.is_empty() {
                resident += 1;
            } else {
                partial = Some(plan.last_keep);
                work.push(Work {
                    unit: ComputeUnit::Tokens(tail),
                    completes: plan.kept_chunks,
                });
            }
        }
        let first_whole = plan.kept_chunks + usize::from(plan.last_keep > 0);
        for (index, chunk) in chunks.iter().enumerate().skip(first_whole) {
            let unit = match chunk.kind() {
                ChunkKind::Text if chunk.tokens().is_empty() => continue,
                ChunkKind::Text => ComputeUnit::Tokens(chunk.tokens()),
                ChunkKind::Image | ChunkKind::Audio => ComputeUnit::Media(chunk.as_ref()),
            };
            work.push(Work {
                unit,
                completes: index,
            });
        }

        let last = work.len().saturating_sub(1);
        for (i, item) in work.iter().enumerate() {
            if let Err(e) = runtime.compute(self.sequence_id, item.unit, i == last) {
                let survivor = resident_prefix(chunks, resident, partial);
                return Err(self.fail(e, Some(survivor)));
            }
            report.computed_tokens += item.unit.token_count();
            report.computed_units += 1;
            resident = item.completes + 1;
            partial = None;
        }

        self.committed = chunks.to_vec();
        self.stats.reconciles += 1;
        self.stats.reused_tokens += report.reused_tokens as u64;
        self.stats.computed_tokens += report.computed_tokens as u64;
        debug!(
            "Reused {} of {} prompt tokens, computed {} in {} unit(s)",
            report.reused_tokens,
            report.prompt_tokens,
            report.computed_tokens,
            report.computed_units
        );
        Ok(report)
    }

    /// Decode one generated token and append it to the record.
    pub fn step<R>(&mut self, runtime: &mut R, token: TokenId) -> RuntimeResult<()>
    where
        R: ModelRuntime + ?Sized,
    {
        if let Err(e) = runtime.compute(self.sequence_id, ComputeUnit::Tokens(&[token]), true) {
            let survivor = self.committed.clone();
            return Err(self.fail(e, Some(survivor)));
        }
        match self.committed.last_mut() {
            Some(last) if last.kind() == ChunkKind::Text => {
                Arc::make_mut(last).extend_tokens(&[token]);
            }
            _ => self.committed.push(make_text_chunk(vec![token])),
        }
        Ok(())
    }

    /// Recompute the final position of the record so the runtime has fresh
    /// logits. Used when a reconcile matched everything and issued no work.
    pub fn refresh_logits<R>(&mut self, runtime: &mut R) -> RuntimeResult<()>
    where
        R: ModelRuntime + ?Sized,
    {
        let Some(last) = self.committed.last().cloned() else {
            return Ok(());
        };
        let resident = self.resident_tokens();
        let (unit, redo) = match last.kind() {
            ChunkKind::Text => match last.tokens().split_last() {
                Some((token, _)) => (ComputeUnit::Tokens(std::slice::from_ref(token)), 1),
                None => return Ok(()),
            },
            ChunkKind::Image | ChunkKind::Audio => {
                (ComputeUnit::Media(last.as_ref()), last.token_count())
            }
        };

        let survivor = self.committed.clone();
        if let Err(e) = runtime.truncate(self.sequence_id, resident - redo) {
            return Err(self.fail(e, Some(survivor)));
        }
        if let Err(e) = runtime.compute(self.sequence_id, unit, true) {
            // The last position is gone from the cache.
            let mut shorter = survivor;
            shorter.pop();
            if let Some(tokens) = last.tokens().split_last().map(|(_, rest)| rest)
                && !tokens.is_empty()
            {
                shorter.push(make_text_chunk(tokens.to_vec()));
            }
            return Err(self.fail(e, Some(shorter)));
        }
        debug!("Refreshed logits by recomputing {redo} token(s)");
        Ok(())
    }

    /// Forget the committed record without touching the runtime.
    pub fn reset(&mut self) {
        if !self.committed.is_empty() {
            debug!("Context cache record reset ({} chunk(s))", self.committed.len());
        }
        self.committed.clear();
        self.stats.resets += 1;
    }

    /// The chunks believed resident, in the order they were pushed.
    pub fn committed(&self) -> &[ChunkRef] {
        &self.committed
    }

    /// Tokens believed resident.
    pub fn resident_tokens(&self) -> usize {
        total_tokens(&self.committed)
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.sequence_id
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Handle a runtime failure. Fatal errors empty the record; retryable
    /// ones replace it with `survivor`, or leave it unchanged when `None`.
    fn fail(&mut self, error: RuntimeError, survivor: Option<Vec<ChunkRef>>) -> RuntimeError {
        if error.is_desyncing() {
            warn!("Fatal runtime error, dropping context cache record: {error}");
            self.reset();
        } else {
            debug!("Retryable runtime error: {error}");
            if let Some(survivor) = survivor {
                self.committed = survivor;
            }
        }
        error
    }
}

/// The record for `chunks[..complete]` followed by the first `partial`
/// tokens of `chunks[complete]`.
fn resident_prefix(chunks: &[ChunkRef], complete: usize, partial: Option<usize>) -> Vec<ChunkRef> {
    let mut record: Vec<ChunkRef> = chunks.iter().take(complete).cloned().collect();
    if let Some(keep) = partial
        && let Some(tokens) = chunks.get(complete).and_then(|c| c.tokens().get(..keep))
    {
        record.push(Arc::new(Chunk::text(tokens.to_vec())));
    }
    record
}
