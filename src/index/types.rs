//! Error and result types of the passage index.

use crate::config::Config;
use crate::model::{DocumentId, EmbeddingVector, PassageChunk, PassageId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted while building or querying the passage index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Document exists but its index has not been sealed yet.
    #[error("Index for document {0} is not ready")]
    IndexNotReady(DocumentId),
    /// Document has never been indexed or was removed.
    #[error("Unknown document {0}")]
    UnknownDocument(DocumentId),
    /// Appended passages do not continue the document's sequence, or belong to another document.
    #[error("Passage {actual} cannot follow sequence {expected} of document {document_id}")]
    SequenceGap {
        /// Document being appended to.
        document_id: DocumentId,
        /// Sequence number the next passage must carry.
        expected: u32,
        /// Offending passage key.
        actual: PassageId,
    },
    /// Embedding provider failed to produce vectors.
    #[error("Failed to generate embeddings: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingClientError),
    /// Returned embedding dimension does not match configuration.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Configured embedding dimension.
        expected: usize,
        /// Dimension produced by the provider.
        actual: usize,
    },
    /// Embedding provider returned fewer vectors than texts.
    #[error("Embedding provider returned {actual} vectors for {expected} texts")]
    EmptyEmbedding {
        /// Number of texts submitted.
        expected: usize,
        /// Number of vectors received.
        actual: usize,
    },
}

/// Lifecycle of one document's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    /// Passages are still being appended; queries are rejected.
    Indexing,
    /// Sealed and queryable.
    Ready,
}

/// One retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    /// Key of the matching passage.
    pub passage_id: PassageId,
    /// Cosine similarity between query and passage embeddings.
    pub score: f32,
}

/// Passage together with the embedding stored for it.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPassage {
    /// Immutable passage as produced by extraction.
    pub chunk: PassageChunk,
    /// Embedding computed when the passage was appended.
    pub embedding: EmbeddingVector,
}

/// Tunables of the passage index.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Expected dimensionality of every embedding.
    pub dimension: usize,
    /// Passages embedded per provider call.
    pub batch_size: usize,
    /// Embedding batches in flight per document.
    pub concurrency: usize,
    /// `k` used when the caller does not supply one.
    pub default_top_k: usize,
    /// Upper bound applied to `k`.
    pub max_top_k: usize,
}

impl From<&Config> for IndexConfig {
    fn from(config: &Config) -> Self {
        Self {
            dimension: config.embedding_dimension,
            batch_size: config.embedding_batch_size,
            concurrency: config.embedding_concurrency,
            default_top_k: config.retrieval_top_k,
            max_top_k: config.retrieval_max_top_k,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl IndexConfig {
    /// Resolve a caller-supplied `k` against the defaults and the upper bound.
    pub fn resolve_top_k(&self, k: Option<usize>) -> usize {
        k.unwrap_or(self.default_top_k).clamp(1, self.max_top_k.max(1))
    }
}
