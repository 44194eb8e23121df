//! Multi-format extraction pipeline.
//!
//! Every format extractor turns raw bytes into an ordered list of [`Draft`] passages: text plus
//! format-specific location metadata. This module then assigns the gapless sequence numbers and
//! the owning document, so numbering rules live in one place regardless of format.
//!
//! Failures are split in two tiers. Whole-container problems (unknown format, unreadable zip,
//! missing root part, encrypted PDF) abort with an [`ExtractionError`] and no passages. Problems
//! confined to one page, slide, sheet, or body element become [`ExtractionWarning`]s and the rest
//! of the document is still extracted.

pub mod chunking;
mod docx;
mod ooxml;
mod pdf;
mod pptx;
mod text;
pub mod web;
mod xlsx;

use crate::config::Config;
use crate::model::{DocumentFormat, DocumentId, LocationMetadata, PassageChunk};
use crate::text::collapse_whitespace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use web::{FetchedSource, WebFetchConfig, fetch_web_source};

/// Errors that abort extraction of a whole document.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Format is unknown, unsupported, or the bytes are a different container kind.
    #[error("Unsupported document: {0}")]
    UnsupportedDocument(String),
    /// Container or its root part could not be read.
    #[error("Corrupt document: {0}")]
    CorruptDocument(String),
    /// Fetching a web source failed.
    #[error("Failed to fetch web source: {0}")]
    Fetch(String),
    /// Web source exceeded the configured size cap.
    #[error("Web source exceeds {limit} bytes")]
    FetchTooLarge {
        /// Configured byte limit.
        limit: usize,
    },
}

/// Non-fatal problem confined to one sub-unit of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionWarning {
    /// Sub-unit that was skipped, such as `page:3`, `slide:2`, `sheet:Data`, or `element:14`.
    pub unit: String,
    /// Human-readable cause.
    pub message: String,
}

impl ExtractionWarning {
    pub(crate) fn new(unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            message: message.into(),
        }
    }
}

/// Result of extracting one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Passages in reading order with gapless sequence numbers starting at zero.
    pub passages: Vec<PassageChunk>,
    /// Sub-units skipped during extraction.
    pub warnings: Vec<ExtractionWarning>,
    /// SHA-256 of the input bytes, hex encoded.
    pub content_digest: String,
}

/// Parameters that shape passages.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Upper bound on tokens per passage.
    pub passage_max_tokens: usize,
    /// Tokenizer or encoding name used to count tokens.
    pub tokenizer: String,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExtractionConfig {
    fn from(config: &Config) -> Self {
        Self {
            passage_max_tokens: config.passage_max_tokens,
            tokenizer: config.passage_tokenizer.clone(),
        }
    }
}

/// Passage before numbering.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Draft {
    pub text: String,
    pub location: LocationMetadata,
}

/// Output of a single format extractor.
#[derive(Debug, Default)]
pub(crate) struct DraftSet {
    pub drafts: Vec<Draft>,
    pub warnings: Vec<ExtractionWarning>,
}

impl DraftSet {
    pub(crate) fn push(&mut self, text: String, location: LocationMetadata) {
        if !text.trim().is_empty() {
            self.drafts.push(Draft { text, location });
        }
    }

    pub(crate) fn warn(&mut self, warning: ExtractionWarning) {
        tracing::warn!(unit = %warning.unit, message = %warning.message, "Skipped document unit");
        self.warnings.push(warning);
    }
}

/// Extract `bytes` of the declared `format` into ordered passages.
pub fn extract(
    document_id: &DocumentId,
    bytes: &[u8],
    format: DocumentFormat,
    config: &ExtractionConfig,
) -> Result<Extraction, ExtractionError> {
    if config.passage_max_tokens == 0 {
        return Err(ExtractionError::UnsupportedDocument(
            "passage token budget must be greater than zero".to_string(),
        ));
    }

    let counter = chunking::build_token_counter(&config.tokenizer);
    let budget = chunking::TokenBudget::new(config.passage_max_tokens, counter);

    let drafts = match format {
        DocumentFormat::Pdf => pdf::extract(bytes, &budget)?,
        DocumentFormat::Docx => docx::extract(bytes, &budget)?,
        DocumentFormat::Pptx => pptx::extract(bytes, &budget)?,
        DocumentFormat::Xlsx => xlsx::extract(bytes, &budget)?,
        DocumentFormat::PlainText => text::extract_plain(bytes, &budget),
        DocumentFormat::Markdown => text::extract_markdown(bytes, &budget),
        DocumentFormat::Web => web::extract_html(bytes, &budget)?,
    };

    let passages = number_drafts(document_id, format, drafts.drafts);
    tracing::debug!(
        document_id = %document_id,
        format = ?format,
        passages = passages.len(),
        warnings = drafts.warnings.len(),
        "Extracted document"
    );

    Ok(Extraction {
        passages,
        warnings: drafts.warnings,
        content_digest: content_digest(bytes),
    })
}

/// Whitespace-normalized copy of a text-based document: the text that `Text` and `Web` passage
/// offsets index. `None` for formats located by geometry or structure instead.
pub fn normalized_content(bytes: &[u8], format: DocumentFormat) -> Option<String> {
    let source = String::from_utf8_lossy(bytes);
    let blocks = match format {
        DocumentFormat::PlainText => text::plain_blocks(&source),
        DocumentFormat::Markdown => text::markdown_blocks(&source),
        DocumentFormat::Web => web::html_blocks(&source),
        DocumentFormat::Pdf | DocumentFormat::Docx | DocumentFormat::Pptx | DocumentFormat::Xlsx => {
            return None;
        }
    };
    Some(text::normalized_copy(&blocks))
}

/// Hex-encoded SHA-256 digest of `bytes`.
pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn number_drafts(
    document_id: &DocumentId,
    format: DocumentFormat,
    drafts: Vec<Draft>,
) -> Vec<PassageChunk> {
    drafts
        .into_iter()
        .filter_map(|draft| {
            let text = collapse_whitespace(&draft.text);
            (!text.is_empty()).then_some((text, draft.location))
        })
        .enumerate()
        .map(|(index, (normalized_text, location))| PassageChunk {
            document_id: document_id.clone(),
            sequence_number: index as u32,
            format,
            normalized_text,
            location,
        })
        .collect()
}
