#![deny(missing_docs)]

//! Citation grounding and highlight navigation for retrieval-grounded answers.
//!
//! Documents are extracted into located passages, embedded into a per-document index, and
//! answers generated from retrieved passages are annotated with numbered citations that a viewer
//! can resolve into an exact highlight.

/// Tracked answers, their citations, and groundedness scoring.
pub mod citation;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Multi-format document extraction into located passages.
pub mod extraction;
/// Highlight resolution against live rendered content.
pub mod highlight;
/// Per-document passage index and semantic retrieval.
pub mod index;
/// Structured logging and tracing setup.
pub mod logging;
/// Grounding activity counters.
pub mod metrics;
/// Passages, citations, locations, and highlight instructions.
pub mod model;
/// Service facade over ingestion, retrieval, citation, and highlighting.
pub mod service;
/// Text normalization shared by the pipeline stages.
pub mod text;

pub use citation::{AnnotatedAnswer, AnnotatedSegment, CitationRecord};
pub use config::Config;
pub use model::{
    AnswerId, Citation, Document, DocumentFormat, DocumentId, HighlightInstruction,
    LocationMetadata, PassageChunk, PassageId,
};
pub use service::{DeletionReport, GroundingApi, GroundingError, GroundingService, IngestOutcome};
