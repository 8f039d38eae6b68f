//! Collaborator traits: model runtime, chat template, tokenizer, media.
//!
//! The crate never runs a model itself. A session is handed implementations
//! of these traits, typically thin wrappers over a native inference library.
//! All calls happen on the session's thread; none of the traits require
//! `Send` or `Sync`.

mod chatml;

pub use chatml::ChatMlTemplate;

use crate::chunk::{Chunk, MediaKind, MediaPayload};
use crate::error::{MediaError, RuntimeResult, TemplateError};
use crate::{Message, SequenceId, TokenId, Tool};

/// Placeholder text handed to the media pipeline in place of the marker.
pub const MEDIA_PLACEHOLDER: &str = "<__media__>";

/// One unit of work for [`ModelRuntime::compute`].
#[derive(Debug, Clone, Copy)]
pub enum ComputeUnit<'a> {
    /// A run of text tokens appended after the current cache end.
    Tokens(&'a [TokenId]),
    /// An encoded media chunk.
    Media(&'a Chunk),
}

impl ComputeUnit<'_> {
    pub fn token_count(&self) -> usize {
        match self {
            ComputeUnit::Tokens(tokens) => tokens.len(),
            ComputeUnit::Media(chunk) => chunk.token_count(),
        }
    }
}

/// The model runtime that owns the context cache.
pub trait ModelRuntime {
    /// Context window of the runtime, in tokens.
    fn context_size(&self) -> usize;

    /// Drop everything after the first `keep` tokens of sequence `seq`.
    fn truncate(&mut self, seq: SequenceId, keep: usize) -> RuntimeResult<()>;

    /// Append `unit` to sequence `seq`. When `want_logits` is set, the last
    /// position of the unit must be left ready for sampling.
    fn compute(
        &mut self,
        seq: SequenceId,
        unit: ComputeUnit<'_>,
        want_logits: bool,
    ) -> RuntimeResult<()>;

    /// Sample the next token from the most recent logits.
    fn sample_next_token(&mut self) -> RuntimeResult<TokenId>;

    /// Whether `token` ends generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Raw bytes of a token's text. May end in the middle of a UTF-8 sequence.
    fn detokenize(&self, token: TokenId) -> Vec<u8>;
}

/// Options forwarded to [`PromptTemplate::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Append the assistant turn opener after the last message.
    pub add_generation_prompt: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            add_generation_prompt: true,
        }
    }
}

/// Chat template renderer.
///
/// Rendering must be referentially transparent: the same messages, tools and
/// options always produce the same text. Per-message token estimates rely on
/// this.
pub trait PromptTemplate {
    fn render(
        &self,
        messages: &[Message],
        tools: &[Tool],
        options: RenderOptions,
    ) -> Result<String, TemplateError>;
}

/// Text tokenizer. Special tokens in the text are parsed; BOS/EOS are not
/// added (the template is expected to emit them).
pub trait Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<TokenId>;
}

/// One piece of an encoded media reference.
#[derive(Debug, Clone)]
pub enum MediaPart {
    /// Delimiter text tokens emitted around the media unit.
    Text(Vec<TokenId>),
    /// The media unit itself.
    Media {
        kind: MediaKind,
        token_count: usize,
        payload: MediaPayload,
    },
}

/// Loads media from its identity and encodes it into model input.
pub trait MediaPipeline {
    /// Load the media named by `identity` and encode it as if it appeared
    /// where `marker` sits.
    fn load_and_tokenize(&self, identity: &str, marker: &str) -> Result<Vec<MediaPart>, MediaError>;
}

/// A media pipeline for text-only models: every media reference fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMedia;

impl MediaPipeline for NoMedia {
    fn load_and_tokenize(
        &self,
        identity: &str,
        _marker: &str,
    ) -> Result<Vec<MediaPart>, MediaError> {
        Err(MediaError::Load {
            identity: identity.to_string(),
            reason: "model has no media encoder".into(),
        })
    }
}
