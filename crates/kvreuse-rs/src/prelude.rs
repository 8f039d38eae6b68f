//! Convenience re-exports for common `kvreuse-rs` types.
//!
//! ```ignore
//! use kvreuse_rs::prelude::*;
//! ```
//!
//! Covers building a [`Session`], feeding it messages and tools, and
//! implementing the collaborator traits. Lower-level pieces (the diff
//! [`plan`](crate::scheduler::plan), segment parsing, the media cache) are
//! left out; import those from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, SequenceId, TokenId, Tool};

// ── Collaborators ───────────────────────────────────────────────────
pub use crate::backend::{
    ChatMlTemplate, ComputeUnit, MediaPart, MediaPipeline, ModelRuntime, NoMedia, PromptTemplate,
    RenderOptions, Tokenizer,
};
pub use crate::chunk::{Chunk, ChunkKind, ChunkRef, MediaKind};

// ── Session ─────────────────────────────────────────────────────────
pub use crate::config::{EstimatorKind, GenerationConfig, SessionConfig};
pub use crate::events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    SessionEvent,
};
pub use crate::history::{MessageSlot, PruneReport, RenderWarning};
pub use crate::scheduler::ReconcileReport;
pub use crate::session::{GenerationOutcome, Session, StopReason};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{
    MediaError, RegistryError, RenderError, RuntimeError, SessionError, TemplateError,
};

// ── Model sharing ───────────────────────────────────────────────────
pub use crate::registry::ModelRegistry;
