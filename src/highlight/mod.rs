//! Turns a passage into something a viewer can highlight.
//!
//! Page-based passages already carry their geometry. Everything else is located in the live
//! rendered content by [`snippet::find_snippet`]; when that fails the viewer is sent to the
//! containing section, slide, sheet, or page instead.

pub mod snippet;

use crate::config::Config;
use crate::model::{HighlightInstruction, LocationMetadata, PassageChunk, PassageId};
use snippet::{MatchBudget, SnippetMatch, find_snippet};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by highlight resolution.
#[derive(Debug, Error)]
pub enum HighlightError {
    /// The passage is not stored.
    #[error("Unknown passage: {0}")]
    UnknownPassage(PassageId),
}

/// Limits for snippet matching.
#[derive(Debug, Clone, Copy)]
pub struct HighlightConfig {
    /// Smallest window, in words, worth reporting.
    pub min_words: usize,
    /// Windows tried before giving up.
    pub max_attempts: usize,
    /// Wall-clock budget per resolution.
    pub time_budget: Duration,
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HighlightConfig {
    fn from(config: &Config) -> Self {
        Self {
            min_words: config.snippet_min_words,
            max_attempts: config.snippet_max_attempts,
            time_budget: Duration::from_millis(config.snippet_time_budget_ms),
        }
    }
}

impl HighlightConfig {
    fn budget(&self) -> MatchBudget {
        MatchBudget {
            min_words: self.min_words,
            max_attempts: self.max_attempts,
            time_budget: self.time_budget,
        }
    }
}

/// Instruction plus whether it is the coarse fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// What the viewer should highlight.
    pub instruction: HighlightInstruction,
    /// Set when precise location failed.
    pub degraded: bool,
}

/// Resolve `passage` against the content the viewer currently shows.
///
/// `live_content` is ignored for page-based passages.
pub fn resolve_passage(
    passage: &PassageChunk,
    live_content: &str,
    config: &HighlightConfig,
) -> Resolution {
    match &passage.location {
        LocationMetadata::Pdf {
            page,
            bounding_boxes,
            ..
        } => {
            if bounding_boxes.is_empty() {
                return coarse(passage, "passage has no stored geometry", 0);
            }
            Resolution {
                instruction: HighlightInstruction::BoundingBox {
                    page: *page,
                    boxes: bounding_boxes.clone(),
                },
                degraded: false,
            }
        }
        LocationMetadata::Flowed { .. }
        | LocationMetadata::Slide { .. }
        | LocationMetadata::Tabular { .. }
        | LocationMetadata::Text { .. }
        | LocationMetadata::Web { .. } => {
            match find_snippet(&passage.normalized_text, live_content, config.budget()) {
                SnippetMatch::Found { start, end, words } => {
                    tracing::debug!(
                        passage_id = %passage.id(),
                        start,
                        end,
                        words,
                        "Resolved text snippet"
                    );
                    Resolution {
                        instruction: HighlightInstruction::TextSnippet {
                            start_offset: start,
                            end_offset: end,
                        },
                        degraded: false,
                    }
                }
                SnippetMatch::NotFound { attempts } => {
                    coarse(passage, "no window matched the live content", attempts)
                }
                SnippetMatch::Exhausted { attempts } => {
                    coarse(passage, "matching budget exhausted", attempts)
                }
            }
        }
    }
}

fn coarse(passage: &PassageChunk, reason: &str, attempts: usize) -> Resolution {
    let container_id = passage.location.container_id();
    tracing::warn!(
        passage_id = %passage.id(),
        container_id = %container_id,
        attempts,
        reason,
        "Falling back to coarse highlight"
    );
    Resolution {
        instruction: HighlightInstruction::CoarseLocation { container_id },
        degraded: true,
    }
}
