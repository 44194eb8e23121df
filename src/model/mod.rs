//! Core data model shared by extraction, indexing, citation, and highlighting.
//!
//! Every value here is plain data: passages are created by the extraction pipeline and never
//! mutated afterwards, citations are written once by citation assignment, and highlight
//! instructions are computed on demand.

mod location;

pub use location::{LocationMetadata, PageSize, Rect};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a document owned by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Wrap an identifier handed over by the storage collaborator.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Declared format of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    /// Page-based PDF document.
    Pdf,
    /// Flowed word-processing document (paragraphs and tables).
    Docx,
    /// Slide deck with optional speaker notes.
    Pptx,
    /// Workbook made of sheets, rows, and cells.
    Xlsx,
    /// Plain UTF-8 text.
    PlainText,
    /// Markdown source.
    Markdown,
    /// Web page fetched from a URL.
    Web,
}

impl std::str::FromStr for DocumentFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_lowercase().as_str() {
            "pdf" | "application/pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "pptx" => Ok(Self::Pptx),
            "xlsx" => Ok(Self::Xlsx),
            "txt" | "text" | "plain" | "text/plain" => Ok(Self::PlainText),
            "md" | "markdown" | "text/markdown" => Ok(Self::Markdown),
            "url" | "web" | "html" | "htm" | "text/html" => Ok(Self::Web),
            _ => Err(()),
        }
    }
}

/// Document descriptor read by the engine; ownership stays with the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier.
    pub id: DocumentId,
    /// Declared format of the uploaded bytes.
    pub format: DocumentFormat,
    /// Optional BCP-47 language hint; retrieval never filters on it.
    pub language_hint: Option<String>,
}

impl Document {
    /// Describe a document without a language hint.
    pub fn new(id: impl Into<DocumentId>, format: DocumentFormat) -> Self {
        Self {
            id: id.into(),
            format,
            language_hint: None,
        }
    }
}

impl From<String> for DocumentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Persisted key of a passage: `(document_id, sequence_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PassageId {
    /// Owning document.
    pub document_id: DocumentId,
    /// Zero-based position in extraction order.
    pub sequence_number: u32,
}

impl PassageId {
    /// Build a passage key.
    pub fn new(document_id: DocumentId, sequence_number: u32) -> Self {
        Self {
            document_id,
            sequence_number,
        }
    }
}

impl fmt::Display for PassageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.document_id, self.sequence_number)
    }
}

/// Unit of extracted text plus enough location metadata to highlight it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageChunk {
    /// Owning document.
    pub document_id: DocumentId,
    /// Gapless, strictly increasing position in extraction order.
    pub sequence_number: u32,
    /// Format of the source document.
    pub format: DocumentFormat,
    /// Whitespace-normalized passage text.
    pub normalized_text: String,
    /// Format-specific location of the passage inside its source.
    pub location: LocationMetadata,
}

impl PassageChunk {
    /// Key under which the passage is persisted.
    pub fn id(&self) -> PassageId {
        PassageId::new(self.document_id.clone(), self.sequence_number)
    }
}

/// Embedding associated 1:1 with a passage.
pub type EmbeddingVector = Vec<f32>;

/// Identifier of a generated answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnswerId(String);

impl AnswerId {
    /// Wrap an identifier supplied by the answer-generation collaborator.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnswerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numbered reference from an answer to one passage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    /// Answer the citation belongs to.
    pub answer_id: AnswerId,
    /// 1-based ordinal, unique within the answer.
    pub ordinal: u32,
    /// Cited passage.
    pub passage_id: PassageId,
}

/// Renderer-agnostic instruction telling a viewer what to highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HighlightInstruction {
    /// Exact geometry on a rendered page.
    BoundingBox {
        /// 1-based page number.
        page: u32,
        /// Regions in page points, top-left origin.
        boxes: Vec<Rect>,
    },
    /// Char range inside the live rendered content.
    TextSnippet {
        /// Inclusive start offset (Unicode scalar values).
        start_offset: usize,
        /// Exclusive end offset (Unicode scalar values).
        end_offset: usize,
    },
    /// Degraded fallback pointing at the containing section, slide, sheet, or page.
    CoarseLocation {
        /// Container identifier understood by the viewer.
        container_id: String,
    },
}
