//! Fakes for unit tests.

use crate::backend::{
    ComputeUnit, MediaPart, MediaPipeline, ModelRuntime, PromptTemplate, RenderOptions, Tokenizer,
};
use crate::chunk::MediaKind;
use crate::error::{MediaError, RuntimeError, RuntimeResult, TemplateError};
use crate::{Message, SequenceId, TokenId, Tool};
use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

/// Token the fake runtime samples once its script runs out.
pub(crate) const EOG: TokenId = -1;

/// Delimiter tokens [`FakeMedia`] emits around each media unit.
pub(crate) const MEDIA_BEGIN: TokenId = -10;
pub(crate) const MEDIA_END: TokenId = -11;

/// `n` distinct whitespace-separated words.
pub(crate) fn words(n: usize) -> String {
    (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
}

/// Stable token id for a word (FNV-1a).
pub(crate) fn word_token(word: &str) -> TokenId {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in word.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash & 0x7fff_ffff) as TokenId
}

/// One token per whitespace-separated word.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId> {
        text.split_whitespace().map(word_token).collect()
    }
}

/// Renders tool descriptions, then message contents, one per line. Roles
/// and options are ignored so estimates equal word counts.
#[derive(Debug, Default, Clone)]
pub(crate) struct PlainTemplate {
    renders: Rc<Cell<usize>>,
}

impl PlainTemplate {
    pub(crate) fn render_counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.renders)
    }
}

impl PromptTemplate for PlainTemplate {
    fn render(
        &self,
        messages: &[Message],
        tools: &[Tool],
        _options: RenderOptions,
    ) -> Result<String, TemplateError> {
        self.renders.set(self.renders.get() + 1);
        let lines: Vec<&str> = tools
            .iter()
            .map(|t| t.description.as_str())
            .chain(messages.iter().map(|m| m.content.as_str()))
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Media pipeline with a fixed catalogue of identity -> token count.
/// Identities ending in `.wav` are audio; everything else is an image.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeMedia {
    catalogue: HashMap<String, usize>,
    loads: Rc<Cell<usize>>,
}

impl FakeMedia {
    pub(crate) fn new(entries: &[(&str, usize)]) -> Self {
        Self {
            catalogue: entries
                .iter()
                .map(|(id, n)| (id.to_string(), *n))
                .collect(),
            loads: Rc::default(),
        }
    }

    pub(crate) fn load_counter(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.loads)
    }
}

impl MediaPipeline for FakeMedia {
    fn load_and_tokenize(
        &self,
        identity: &str,
        _marker: &str,
    ) -> Result<Vec<MediaPart>, MediaError> {
        self.loads.set(self.loads.get() + 1);
        let Some(&token_count) = self.catalogue.get(identity) else {
            return Err(MediaError::Load {
                identity: identity.to_string(),
                reason: "no such file".into(),
            });
        };
        let kind = if identity.ends_with(".wav") {
            MediaKind::Audio
        } else {
            MediaKind::Image
        };
        Ok(vec![
            MediaPart::Text(vec![MEDIA_BEGIN]),
            MediaPart::Media {
                kind,
                token_count,
                payload: Arc::new(identity.to_string()),
            },
            MediaPart::Text(vec![MEDIA_END]),
        ])
    }
}

/// A compute unit as the fake runtime saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitRecord {
    Tokens(Vec<TokenId>),
    Media(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuntimeCall {
    Truncate {
        seq: SequenceId,
        keep: usize,
    },
    Compute {
        seq: SequenceId,
        unit: UnitRecord,
        logits: bool,
    },
}

/// Runtime that records every cache call and tracks how many tokens are
/// resident. Sampling follows a script, then returns [`EOG`].
#[derive(Debug)]
pub(crate) struct RecordingRuntime {
    pub(crate) calls: Vec<RuntimeCall>,
    pub(crate) resident: usize,
    context_size: usize,
    compute_failure: Option<(usize, RuntimeError)>,
    truncate_failure: Option<RuntimeError>,
    sample_failure: Option<RuntimeError>,
    script: VecDeque<TokenId>,
    vocab: HashMap<TokenId, Vec<u8>>,
}

impl RecordingRuntime {
    pub(crate) fn new(context_size: usize) -> Self {
        Self {
            calls: Vec::new(),
            resident: 0,
            context_size,
            compute_failure: None,
            truncate_failure: None,
            sample_failure: None,
            script: VecDeque::new(),
            vocab: HashMap::new(),
        }
    }

    /// Tokens to sample, each detokenizing to the given bytes.
    pub(crate) fn with_script(mut self, script: &[(TokenId, &[u8])]) -> Self {
        for (token, bytes) in script {
            self.script.push_back(*token);
            self.vocab.insert(*token, bytes.to_vec());
        }
        self
    }

    /// Let `successes` compute calls through, then fail the next one once.
    pub(crate) fn fail_compute_after(&mut self, successes: usize, error: RuntimeError) {
        self.compute_failure = Some((successes, error));
    }

    pub(crate) fn fail_next_truncate(&mut self, error: RuntimeError) {
        self.truncate_failure = Some(error);
    }

    pub(crate) fn fail_next_sample(&mut self, error: RuntimeError) {
        self.sample_failure = Some(error);
    }

    pub(crate) fn compute_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, RuntimeCall::Compute { .. }))
            .count()
    }

    /// Text tokens passed to compute across all calls.
    pub(crate) fn computed_tokens(&self) -> usize {
        self.calls
            .iter()
            .map(|c| match c {
                RuntimeCall::Compute {
                    unit: UnitRecord::Tokens(t),
                    ..
                } => t.len(),
                _ => 0,
            })
            .sum()
    }
}

impl ModelRuntime for RecordingRuntime {
    fn context_size(&self) -> usize {
        self.context_size
    }

    fn truncate(&mut self, seq: SequenceId, keep: usize) -> RuntimeResult<()> {
        self.calls.push(RuntimeCall::Truncate { seq, keep });
        if let Some(error) = self.truncate_failure.take() {
            return Err(error);
        }
        self.resident = self.resident.min(keep);
        Ok(())
    }

    fn compute(
        &mut self,
        seq: SequenceId,
        unit: ComputeUnit<'_>,
        want_logits: bool,
    ) -> RuntimeResult<()> {
        let record = match unit {
            ComputeUnit::Tokens(tokens) => UnitRecord::Tokens(tokens.to_vec()),
            ComputeUnit::Media(chunk) => UnitRecord::Media(chunk.identity().to_string()),
        };
        self.calls.push(RuntimeCall::Compute {
            seq,
            unit: record,
            logits: want_logits,
        });
        match self.compute_failure.take() {
            Some((0, error)) => return Err(error),
            Some((n, error)) => self.compute_failure = Some((n - 1, error)),
            None => {}
        }
        self.resident += unit.token_count();
        Ok(())
    }

    fn sample_next_token(&mut self) -> RuntimeResult<TokenId> {
        if let Some(error) = self.sample_failure.take() {
            return Err(error);
        }
        Ok(self.script.pop_front().unwrap_or(EOG))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG
    }

    fn detokenize(&self, token: TokenId) -> Vec<u8> {
        self.vocab.get(&token).cloned().unwrap_or_default()
    }
}
