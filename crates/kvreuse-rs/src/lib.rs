//! Incremental context-cache reuse for local sequence-model sessions.
//!
//! `kvreuse-rs` sits between a chat front end and a model runtime's
//! per-sequence context cache (the KV cache). Each turn, the conversation is
//! pruned to fit the context window, rendered through a chat template, split
//! into [`Chunk`](chunk::Chunk)s, and diffed against what the runtime already
//! holds. Only the divergent suffix is sent for computation.
//!
//! # Where to find things
//!
//! - **Chunks and media reuse:** [`chunk::Chunk`] is the unit of cacheable
//!   input. [`chunk::MediaChunkCache`] keeps tokenized media around so a
//!   recurring image is not re-encoded every turn.
//!
//! - **Conversation and budget:** [`history::HistoryManager`] owns the pinned
//!   head, the rolling tail, and the tool list. It keeps a per-message token
//!   estimate so pruning never has to re-render the whole history.
//!
//! - **Cache reconciliation:** [`scheduler::CacheScheduler`] remembers what it
//!   committed to the runtime and computes the longest reusable prefix on
//!   every [`reconcile`](scheduler::CacheScheduler::reconcile).
//!
//! - **Collaborators:** the model runtime, chat template, tokenizer and media
//!   pipeline are traits in [`backend`]. [`backend::ChatMlTemplate`] is a
//!   ready-made template for ChatML-style models.
//!
//! - **Running a turn:** [`session::Session`] ties everything together and
//!   drives the generation loop with a streaming callback.
//!
//! - **Sharing loaded models:** [`registry::ModelRegistry`] loads named models
//!   once and hands them out to many sessions.
//!
//! # Example
//!
//! ```ignore
//! use kvreuse_rs::prelude::*;
//!
//! let config = SessionConfig::default().with_context_size(4096);
//! let mut session = Session::new(config, runtime, template, tokenizer, media);
//!
//! session.add_message(Message::system("You are terse."), true)?;
//! session.add_message(Message::user("Describe <__media:cat.png__>"), false)?;
//!
//! let outcome = session.generate(&GenerationConfig::default(), |fragment| {
//!     print!("{fragment}");
//!     true
//! })?;
//! println!("\nreused {} tokens", outcome.report.reused_tokens);
//! ```

pub mod backend;
pub mod chunk;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod prelude;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod streamer;

#[cfg(test)]
pub(crate) mod testing;

use serde::{Deserialize, Serialize};

/// Vocabulary id of a single token.
pub type TokenId = i32;

/// Identifier of a sequence inside the runtime's context cache.
pub type SequenceId = i32;

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// A message in the conversation.
///
/// Media is referenced inline with `<__media:IDENTITY__>` markers; see
/// [`history::segment`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Tool, content)
    }

    /// Media identities referenced by this message, in order of appearance.
    pub fn media_references(&self) -> impl Iterator<Item = &str> {
        history::segment::media_identities(&self.content)
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// A tool definition offered to the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments.
    pub parameters: serde_json::Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_display_matches_serde() {
        for role in [
            MessageRole::System,
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
        ] {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
    }

    #[test]
    fn media_references_in_order() {
        let msg = Message::user("a <__media:x.png__> b <__media:voice.wav__>");
        let refs: Vec<&str> = msg.media_references().collect();
        assert_eq!(refs, vec!["x.png", "voice.wav"]);
    }

    #[test]
    fn tool_roundtrips_through_json() {
        let tool = Tool::new(
            "lookup",
            "Look up a word",
            serde_json::json!({"type": "object", "properties": {"word": {"type": "string"}}}),
        );
        let json = serde_json::to_string(&tool).unwrap();
        let back: Tool = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tool);
    }
}
