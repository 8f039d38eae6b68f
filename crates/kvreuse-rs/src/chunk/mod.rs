//! The chunk model: the unit of cacheable model input.
//!
//! A [`Chunk`] is either a run of text tokens or an opaque media-derived
//! unit (image or audio) with a stable identity string. Chunks are shared
//! through [`ChunkRef`] so the same media unit can sit in the current turn's
//! sequence and in the [`MediaChunkCache`] at once.

pub mod media_cache;

pub use media_cache::{DEFAULT_MEDIA_CACHE_CAPACITY, MediaChunkCache, MediaGroup};

use crate::TokenId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Shared, reference-counted chunk.
pub type ChunkRef = Arc<Chunk>;

/// Opaque media payload owned by the runtime's media encoder.
pub type MediaPayload = Arc<dyn Any + Send + Sync>;

/// What a chunk holds.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Text,
    Image,
    Audio,
}

/// Kinds a media chunk may take.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
}

impl From<MediaKind> for ChunkKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Image => ChunkKind::Image,
            MediaKind::Audio => ChunkKind::Audio,
        }
    }
}

/// Atomic unit of encoded input.
///
/// The kind is fixed at construction. Text chunks carry their tokens; media
/// chunks carry an identity, a token count, and the runtime's payload.
#[derive(Debug, Clone)]
pub struct Chunk {
    kind: ChunkKind,
    identity: String,
    tokens: Vec<TokenId>,
    token_count: usize,
    payload: Option<MediaPayload>,
}

impl Chunk {
    /// A run of text tokens.
    pub fn text(tokens: Vec<TokenId>) -> Self {
        Self {
            kind: ChunkKind::Text,
            identity: String::new(),
            token_count: tokens.len(),
            tokens,
            payload: None,
        }
    }

    /// A media unit keyed by `identity`.
    pub fn media(
        kind: MediaKind,
        identity: impl Into<String>,
        token_count: usize,
        payload: MediaPayload,
    ) -> Self {
        Self {
            kind: kind.into(),
            identity: identity.into(),
            tokens: Vec::new(),
            token_count,
            payload: Some(payload),
        }
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    /// Stable identity. Empty for text chunks.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Token ids. Empty for media chunks.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// The runtime payload of a media chunk.
    pub fn payload(&self) -> Option<&MediaPayload> {
        self.payload.as_ref()
    }

    pub fn is_media(&self) -> bool {
        self.kind != ChunkKind::Text
    }

    /// Append tokens to a text chunk. No-op for media chunks.
    pub(crate) fn extend_tokens(&mut self, tokens: &[TokenId]) {
        if self.kind == ChunkKind::Text {
            self.tokens.extend_from_slice(tokens);
            self.token_count = self.tokens.len();
        }
    }

    /// Whether a context cache built from `other` can stand in for `self`.
    ///
    /// Text chunks match on their token sequences, media chunks on identity.
    pub fn is_cache_equivalent(&self, other: &Chunk) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            ChunkKind::Text => self.tokens == other.tokens,
            ChunkKind::Image | ChunkKind::Audio => self.identity == other.identity,
        }
    }
}

/// Build a shared text chunk.
pub fn make_text_chunk(tokens: Vec<TokenId>) -> ChunkRef {
    Arc::new(Chunk::text(tokens))
}

/// Build a shared media chunk.
pub fn make_media_chunk(
    kind: MediaKind,
    identity: impl Into<String>,
    token_count: usize,
    payload: MediaPayload,
) -> ChunkRef {
    Arc::new(Chunk::media(kind, identity, token_count, payload))
}

/// Total tokens across a chunk sequence.
pub fn total_tokens(chunks: &[ChunkRef]) -> usize {
    chunks.iter().map(|c| c.token_count()).sum()
}
