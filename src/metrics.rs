use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing grounding activity.
#[derive(Default)]
pub struct EngineMetrics {
    documents_ingested: AtomicU64,
    passages_indexed: AtomicU64,
    extraction_warnings: AtomicU64,
    citations_assigned: AtomicU64,
    uncited_segments: AtomicU64,
    degraded_highlights: AtomicU64,
}

impl EngineMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an ingested document, its passage count, and the warnings raised while extracting it.
    pub fn record_document(&self, passage_count: u64, warnings: u64) {
        self.documents_ingested.fetch_add(1, Ordering::Relaxed);
        self.passages_indexed
            .fetch_add(passage_count, Ordering::Relaxed);
        self.extraction_warnings
            .fetch_add(warnings, Ordering::Relaxed);
    }

    /// Record the outcome of one citation assignment.
    pub fn record_answer(&self, citations: u64, uncited_segments: u64) {
        self.citations_assigned
            .fetch_add(citations, Ordering::Relaxed);
        self.uncited_segments
            .fetch_add(uncited_segments, Ordering::Relaxed);
    }

    /// Record a highlight that fell back to a coarse location.
    pub fn record_degraded_highlight(&self) {
        self.degraded_highlights.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_ingested: self.documents_ingested.load(Ordering::Relaxed),
            passages_indexed: self.passages_indexed.load(Ordering::Relaxed),
            extraction_warnings: self.extraction_warnings.load(Ordering::Relaxed),
            citations_assigned: self.citations_assigned.load(Ordering::Relaxed),
            uncited_segments: self.uncited_segments.load(Ordering::Relaxed),
            degraded_highlights: self.degraded_highlights.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of the counters used for quality monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Documents ingested since startup.
    pub documents_ingested: u64,
    /// Passages indexed across all documents.
    pub passages_indexed: u64,
    /// Sub-units skipped during extraction.
    pub extraction_warnings: u64,
    /// Citations persisted across all answers.
    pub citations_assigned: u64,
    /// Answer segments left uncited for lack of grounding.
    pub uncited_segments: u64,
    /// Highlights resolved to a coarse location.
    pub degraded_highlights: u64,
}
