//! Outcome and error types of the grounding service.

use crate::citation::CitationError;
use crate::config::ConfigError;
use crate::embedding::EmbeddingClientError;
use crate::extraction::{ExtractionError, ExtractionWarning};
use crate::highlight::HighlightError;
use crate::index::IndexError;
use crate::model::DocumentId;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by [`crate::service::GroundingService`].
#[derive(Debug, Error)]
pub enum GroundingError {
    /// Configuration could not be loaded or is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The embedding provider could not be constructed.
    #[error("Embedding provider unavailable: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// The document could not be extracted.
    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    /// Indexing or retrieval failed.
    #[error("Passage index error: {0}")]
    Index(#[from] IndexError),
    /// Citation assignment failed.
    #[error("Citation assignment failed: {0}")]
    Citation(#[from] CitationError),
    /// Highlight resolution failed.
    #[error("Highlight resolution failed: {0}")]
    Highlight(#[from] HighlightError),
    /// The ingestion job was cancelled; nothing it wrote was kept.
    #[error("Ingestion of {0} was cancelled")]
    Cancelled(DocumentId),
    /// The blocking extraction task panicked or was aborted.
    #[error("Extraction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// The service is shutting down and accepts no new work.
    #[error("Grounding service is shut down")]
    ShutDown,
}

/// Summary of one ingestion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestOutcome {
    /// Ingested document.
    pub document_id: DocumentId,
    /// Passages indexed by this call (zero when skipped).
    pub passages: usize,
    /// Sub-units skipped during extraction.
    pub warnings: Vec<ExtractionWarning>,
    /// Set when the bytes matched the indexed version and nothing was redone.
    pub skipped_unchanged: bool,
    /// SHA-256 of the ingested bytes.
    pub content_digest: String,
}

/// What a deletion removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    /// An in-flight ingestion was cancelled.
    pub cancelled_job: bool,
    /// The passage index existed and was dropped.
    pub index_removed: bool,
    /// Citations purged because they pointed into the document.
    pub citations_removed: usize,
}
