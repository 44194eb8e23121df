//! Citation assignment: binds answer sentences to retrieved passages.
//!
//! A sentence is cited only when its groundedness against a passage exceeds the configured
//! threshold; otherwise it stays uncited. Inline `[n]` markers written by the answer generator
//! are treated as proposals that must pass the same gate. Ordinals follow first appearance within
//! the answer and are reused when a passage is cited again.

mod grounding;
mod segment;
mod store;

pub use grounding::{content_terms, groundedness, lexical_support};
pub use segment::{RawSegment, Segmenter, segment_text};
pub use store::{CitationRecord, CitationStore};

use crate::index::{IndexError, PassageIndex, RetrievedPassage};
use crate::model::{AnswerId, Citation, DocumentId, PassageId};
use async_stream::try_stream;
use futures_core::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Errors raised while assigning citations.
#[derive(Debug, Error)]
pub enum CitationError {
    /// Embedding a segment failed.
    #[error("Failed to score answer segment: {0}")]
    Index(#[from] IndexError),
    /// Citations were already assigned under this answer id.
    #[error("Answer {0} already has citations")]
    AnswerExists(AnswerId),
    /// Another session recorded this ordinal first.
    #[error("Ordinal {ordinal} of answer {answer_id} is already recorded")]
    OrdinalTaken {
        /// Answer the ordinal belongs to.
        answer_id: AnswerId,
        /// Ordinal that was already taken.
        ordinal: u32,
    },
}

/// One sentence of an answer with the ordinals it cites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedSegment {
    /// Sentence text without markers.
    pub text: String,
    /// Ordinals cited by the sentence; empty when ungrounded.
    pub ordinals: Vec<u32>,
    /// Best groundedness observed for the sentence.
    pub groundedness: f32,
    /// Whether the sentence ended a line in the answer.
    pub line_break: bool,
}

impl AnnotatedSegment {
    /// Whether at least one passage is cited.
    pub fn is_cited(&self) -> bool {
        !self.ordinals.is_empty()
    }

    /// Sentence followed by its `[n]` markers.
    pub fn render(&self) -> String {
        let mut rendered = self.text.clone();
        for ordinal in &self.ordinals {
            rendered.push_str(&format!("[{ordinal}]"));
        }
        rendered
    }
}

/// Answer with citation markers re-emitted after each cited sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedAnswer {
    /// Answer the citations belong to.
    pub answer_id: AnswerId,
    /// Rendered text with `[n]` markers.
    pub text: String,
    /// Sentences in answer order.
    pub segments: Vec<AnnotatedSegment>,
}

impl AnnotatedAnswer {
    /// Render segments back into one text.
    pub fn from_segments(answer_id: AnswerId, segments: Vec<AnnotatedSegment>) -> Self {
        let mut text = String::new();
        for (position, segment) in segments.iter().enumerate() {
            if position > 0 {
                let previous_line_break = segments[position - 1].line_break;
                text.push(if previous_line_break { '\n' } else { ' ' });
            }
            text.push_str(&segment.render());
        }
        Self {
            answer_id,
            text,
            segments,
        }
    }
}

/// Scores answers against the passage index and persists the citations it assigns.
pub struct CitationAssigner<'a> {
    index: &'a PassageIndex,
    store: &'a CitationStore,
    threshold: f32,
}

impl<'a> CitationAssigner<'a> {
    /// Assigner citing only when groundedness exceeds `threshold`.
    pub fn new(index: &'a PassageIndex, store: &'a CitationStore, threshold: f32) -> Self {
        Self {
            index,
            store,
            threshold,
        }
    }

    /// Annotate a complete answer generated from `retrieved` passages of `document_id`.
    pub async fn assign_citations(
        &self,
        answer_id: &AnswerId,
        document_id: &DocumentId,
        answer_text: &str,
        retrieved: &[RetrievedPassage],
    ) -> Result<(AnnotatedAnswer, Vec<Citation>), CitationError> {
        let mut session = self.session(answer_id.clone(), document_id, retrieved)?;
        let mut segments = Vec::new();
        for raw in segment_text(answer_text) {
            segments.push(session.annotate(raw).await?);
        }

        let uncited = segments.iter().filter(|segment| !segment.is_cited()).count();
        tracing::info!(
            answer_id = %answer_id,
            document_id = %document_id,
            segments = segments.len(),
            citations = session.citations.len(),
            uncited,
            "Assigned citations"
        );
        let citations = session.citations;
        Ok((
            AnnotatedAnswer::from_segments(answer_id.clone(), segments),
            citations,
        ))
    }

    /// Annotate an answer while it is being generated, yielding each sentence once complete.
    pub fn annotate_stream<S>(
        &'a self,
        answer_id: AnswerId,
        document_id: DocumentId,
        retrieved: Vec<RetrievedPassage>,
        tokens: S,
    ) -> impl Stream<Item = Result<AnnotatedSegment, CitationError>> + 'a
    where
        S: Stream<Item = String> + 'a,
    {
        try_stream! {
            let mut session = self.session(answer_id, &document_id, &retrieved)?;
            let mut segmenter = Segmenter::new();
            futures_util::pin_mut!(tokens);
            while let Some(token) = tokens.next().await {
                for raw in segmenter.push(&token) {
                    let annotated = session.annotate(raw).await?;
                    yield annotated;
                }
            }
            if let Some(raw) = segmenter.finish() {
                let annotated = session.annotate(raw).await?;
                yield annotated;
            }
        }
    }

    fn session(
        &self,
        answer_id: AnswerId,
        document_id: &DocumentId,
        retrieved: &[RetrievedPassage],
    ) -> Result<CitationSession<'a>, CitationError> {
        if self.store.has_answer(&answer_id) {
            return Err(CitationError::AnswerExists(answer_id));
        }
        let candidates = retrieved
            .iter()
            .map(|hit| self.candidate(&answer_id, document_id, hit))
            .collect();
        Ok(CitationSession {
            index: self.index,
            store: self.store,
            threshold: self.threshold,
            answer_id,
            candidates,
            ordinals: HashMap::new(),
            citations: Vec::new(),
        })
    }

    fn candidate(
        &self,
        answer_id: &AnswerId,
        document_id: &DocumentId,
        hit: &RetrievedPassage,
    ) -> Option<Candidate> {
        if &hit.passage_id.document_id != document_id {
            tracing::warn!(
                answer_id = %answer_id,
                passage_id = %hit.passage_id,
                "Ignoring retrieved passage from another document"
            );
            return None;
        }
        let Some(passage) = self.index.passage(&hit.passage_id) else {
            tracing::warn!(
                answer_id = %answer_id,
                passage_id = %hit.passage_id,
                "Ignoring retrieved passage missing from the index"
            );
            return None;
        };
        Some(Candidate {
            embedding: self
                .index
                .stored_embedding(&hit.passage_id)
                .unwrap_or_default(),
            terms: content_terms(&passage.normalized_text),
            passage_id: hit.passage_id.clone(),
        })
    }
}

struct Candidate {
    passage_id: PassageId,
    terms: HashSet<String>,
    embedding: Vec<f32>,
}

/// Ordinal table and validated candidates of one answer.
struct CitationSession<'a> {
    index: &'a PassageIndex,
    store: &'a CitationStore,
    threshold: f32,
    answer_id: AnswerId,
    /// One slot per retrieved passage; `None` for passages that may not be cited.
    candidates: Vec<Option<Candidate>>,
    ordinals: HashMap<PassageId, u32>,
    citations: Vec<Citation>,
}

impl CitationSession<'_> {
    async fn annotate(&mut self, raw: RawSegment) -> Result<AnnotatedSegment, CitationError> {
        if self.candidates.iter().all(Option::is_none) {
            return Ok(AnnotatedSegment {
                text: raw.text,
                ordinals: Vec::new(),
                groundedness: 0.0,
                line_break: raw.line_break,
            });
        }

        let terms = content_terms(&raw.text);
        let embedding = self.index.embed_text(&raw.text).await?;
        let score = |candidate: &Candidate| {
            groundedness(&terms, &candidate.terms, &embedding, &candidate.embedding)
        };

        let mut best = 0.0_f32;
        let mut chosen: Vec<(PassageId, f32)> = Vec::new();
        for proposal in &raw.proposals {
            let slot = (*proposal as usize)
                .checked_sub(1)
                .and_then(|position| self.candidates.get(position));
            match slot {
                Some(Some(candidate)) => {
                    let value = score(candidate);
                    best = best.max(value);
                    if value > self.threshold {
                        chosen.push((candidate.passage_id.clone(), value));
                    } else {
                        tracing::debug!(
                            answer_id = %self.answer_id,
                            proposal,
                            groundedness = value,
                            "Rejected ungrounded citation marker"
                        );
                    }
                }
                Some(None) => {}
                None => tracing::warn!(
                    answer_id = %self.answer_id,
                    proposal,
                    retrieved = self.candidates.len(),
                    "Discarded citation marker beyond retrieved passages"
                ),
            }
        }

        if chosen.is_empty() {
            let mut top: Option<(&Candidate, f32)> = None;
            for candidate in self.candidates.iter().flatten() {
                let value = score(candidate);
                if top.is_none_or(|(_, current)| value > current) {
                    top = Some((candidate, value));
                }
            }
            if let Some((candidate, value)) = top {
                best = best.max(value);
                if value > self.threshold {
                    chosen.push((candidate.passage_id.clone(), value));
                }
            }
        }

        let mut ordinals = Vec::new();
        for (passage_id, value) in chosen {
            let ordinal = self.ordinal_for(passage_id, value)?;
            if !ordinals.contains(&ordinal) {
                ordinals.push(ordinal);
            }
        }

        Ok(AnnotatedSegment {
            text: raw.text,
            ordinals,
            groundedness: best,
            line_break: raw.line_break,
        })
    }

    fn ordinal_for(&mut self, passage_id: PassageId, value: f32) -> Result<u32, CitationError> {
        if let Some(ordinal) = self.ordinals.get(&passage_id) {
            return Ok(*ordinal);
        }
        let ordinal = self.ordinals.len() as u32 + 1;
        let citation = Citation {
            answer_id: self.answer_id.clone(),
            ordinal,
            passage_id,
        };
        self.store.record(citation.clone(), value)?;
        self.ordinals.insert(citation.passage_id.clone(), ordinal);
        self.citations.push(citation);
        Ok(ordinal)
    }
}
