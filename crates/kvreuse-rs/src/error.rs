//! Error types.
//!
//! Runtime failures come in two classes. A [`RuntimeError::Fatal`] means the
//! runtime's context cache may no longer match what the scheduler believes
//! it holds, so the scheduler forgets everything and recomputes from scratch
//! next turn. A [`RuntimeError::Retryable`] means the failing call did not
//! advance the cache (for example, no free slot was available).

use thiserror::Error;

/// Error reported by a [`ModelRuntime`](crate::backend::ModelRuntime).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The call failed without touching the context cache.
    #[error("retryable runtime error: {0}")]
    Retryable(String),

    /// The call failed and may have left the context cache in an unknown state.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

impl RuntimeError {
    /// Whether this failure invalidates the scheduler's committed record.
    pub fn is_desyncing(&self) -> bool {
        matches!(self, RuntimeError::Fatal(_))
    }
}

/// Error reported by a [`PromptTemplate`](crate::backend::PromptTemplate).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("template rendering failed: {0}")]
pub struct TemplateError(pub String);

/// Error reported by a [`MediaPipeline`](crate::backend::MediaPipeline).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("failed to load media '{identity}': {reason}")]
    Load { identity: String, reason: String },

    #[error("media '{identity}' produced no media unit")]
    Empty { identity: String },
}

/// Error from [`HistoryManager`](crate::history::HistoryManager) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The tool definitions alone do not fit in the budget cap.
    #[error(
        "tool definitions need ~{tools_cost} tokens (+{margin} margin) but only {cap} remain \
         after reserving {reserve} for generation"
    )]
    BudgetExhausted {
        tools_cost: usize,
        margin: usize,
        cap: usize,
        reserve: usize,
    },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("no message at {0:?}")]
    NoSuchMessage(crate::history::MessageSlot),
}

/// Error from a [`Session`](crate::session::Session) turn.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The rendered prompt holds no tokens, so there are no logits to sample.
    #[error("rendered prompt is empty, nothing to generate from")]
    EmptyPrompt,
}

/// Error from the [`ModelRegistry`](crate::registry::ModelRegistry).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("failed to load model '{name}': {reason}")]
    LoadFailed { name: String, reason: String },

    #[error("model registry is shut down (model '{0}')")]
    Shutdown(String),
}

/// Error loading a [`SessionConfig`](crate::config::SessionConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
pub type RenderResult<T> = Result<T, RenderError>;
pub type SessionResult<T> = Result<T, SessionError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
