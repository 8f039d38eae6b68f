//! Token estimation strategies.
//!
//! The history manager estimates every message in isolation and keeps a
//! running sum. How a single rendering is turned into a number is up to the
//! [`TokenEstimator`]: [`ExactEstimator`] tokenizes it (and counts media
//! through the media cache), [`CharRatioEstimator`] divides the length of its
//! text by a fixed ratio and only counts media exactly. Either way the pruning
//! algorithm is the same, and a safety margin absorbs the error.

use super::segment::{self, Segment};

/// Default characters per token (conservative estimate for English text).
/// Most tokenizers average 3-4 chars per token; we use 3.5 as a middle ground.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;

/// Turns one isolated rendering into a token count.
pub trait TokenEstimator {
    /// Estimate the tokens in `rendered`. `exact` counts them precisely
    /// (tokenizing text spans and encoding media); cheap strategies may
    /// ignore it.
    fn estimate(&self, rendered: &str, exact: &mut dyn FnMut(&str) -> usize) -> usize;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Counts tokens exactly by tokenizing the rendering.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactEstimator;

impl TokenEstimator for ExactEstimator {
    fn estimate(&self, rendered: &str, exact: &mut dyn FnMut(&str) -> usize) -> usize {
        exact(rendered)
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}

/// Estimates text as `ceil(bytes / chars_per_token)`. Media markers are
/// counted through `exact`, since their size has nothing to do with the
/// marker's length.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl CharRatioEstimator {
    /// Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f64) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, rendered: &str, exact: &mut dyn FnMut(&str) -> usize) -> usize {
        let mut text_bytes = 0;
        let mut media = 0;
        for seg in segment::segments(rendered) {
            match seg {
                Segment::Text(span) => text_bytes += span.len(),
                Segment::Media(identity) => media += exact(&segment::media_marker(identity)),
            }
        }
        (text_bytes as f64 / self.chars_per_token).ceil() as usize + media
    }

    fn name(&self) -> &'static str {
        "char-ratio"
    }
}
