//! Session and generation configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes:
//!
//! ```json
//! { "context_size": 4096, "estimator": { "char_ratio": { "chars_per_token": 3.0 } } }
//! ```

use crate::SequenceId;
use crate::chunk::DEFAULT_MEDIA_CACHE_CAPACITY;
use crate::error::ConfigError;
use crate::history::estimate::{
    CharRatioEstimator, DEFAULT_CHARS_PER_TOKEN, ExactEstimator, TokenEstimator,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Default context window in tokens.
pub const DEFAULT_CONTEXT_SIZE: usize = 8192;

/// Default tokens added once per render to absorb estimation error.
pub const DEFAULT_SAFETY_MARGIN: usize = 16;

/// Default maximum tokens generated per turn.
pub const DEFAULT_MAX_TOKENS: usize = 1024;

/// Which token estimation strategy the history manager uses.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Tokenize each isolated rendering.
    #[default]
    Exact,
    /// Divide character count by a fixed ratio.
    CharRatio { chars_per_token: f64 },
}

impl EstimatorKind {
    /// Heuristic estimator with the default ratio.
    pub fn char_ratio() -> Self {
        EstimatorKind::CharRatio {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }

    pub fn build(&self) -> Box<dyn TokenEstimator> {
        match self {
            EstimatorKind::Exact => Box::new(ExactEstimator),
            EstimatorKind::CharRatio { chars_per_token } => {
                Box::new(CharRatioEstimator::new(*chars_per_token))
            }
        }
    }
}

/// Per-session settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Context window in tokens. Default: `8192`.
    pub context_size: usize,
    /// Tokens reserved once per render for estimation error. Default: `16`.
    pub safety_margin: usize,
    /// Media identities kept in the media cache. Default: `16`.
    pub media_cache_capacity: usize,
    /// Sequence the session writes to in the runtime's cache. Default: `0`.
    pub sequence_id: SequenceId,
    /// Token estimation strategy. Default: exact.
    pub estimator: EstimatorKind,
    /// Append the assistant opener when rendering. Default: `true`.
    pub add_generation_prompt: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            media_cache_capacity: DEFAULT_MEDIA_CACHE_CAPACITY,
            sequence_id: 0,
            estimator: EstimatorKind::default(),
            add_generation_prompt: true,
        }
    }
}

impl SessionConfig {
    pub fn with_context_size(mut self, tokens: usize) -> Self {
        self.context_size = tokens;
        self
    }

    pub fn with_safety_margin(mut self, tokens: usize) -> Self {
        self.safety_margin = tokens;
        self
    }

    pub fn with_media_cache_capacity(mut self, entries: usize) -> Self {
        self.media_cache_capacity = entries;
        self
    }

    pub fn with_sequence_id(mut self, seq: SequenceId) -> Self {
        self.sequence_id = seq;
        self
    }

    pub fn with_estimator(mut self, estimator: EstimatorKind) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_generation_prompt(mut self, enabled: bool) -> Self {
        self.add_generation_prompt = enabled;
        self
    }

    /// Parse a config from JSON text.
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&data)?;
        debug!(
            "Loaded session config from {} (context {} tokens)",
            path.display(),
            config.context_size
        );
        Ok(config)
    }
}

/// Per-turn generation settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate. Also reserved out of the context window
    /// when pruning history. Default: `1024`.
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl GenerationConfig {
    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }
}
