use super::CitationError;
use crate::model::{AnswerId, Citation, DocumentId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::{PoisonError, RwLock};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Persisted citation with the score that justified it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    /// The citation itself.
    pub citation: Citation,
    /// Groundedness of the citing segment against the passage.
    pub groundedness: f32,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// Citation records keyed by `(answer_id, ordinal)`.
#[derive(Default)]
pub struct CitationStore {
    records: RwLock<BTreeMap<(AnswerId, u32), CitationRecord>>,
}

impl CitationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a citation. Records are never replaced; a key that is already taken is an error.
    pub fn record(&self, citation: Citation, groundedness: f32) -> Result<(), CitationError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        match records.entry((citation.answer_id.clone(), citation.ordinal)) {
            Entry::Occupied(_) => Err(CitationError::OrdinalTaken {
                answer_id: citation.answer_id,
                ordinal: citation.ordinal,
            }),
            Entry::Vacant(slot) => {
                slot.insert(CitationRecord {
                    citation,
                    groundedness,
                    created_at: current_timestamp_rfc3339(),
                });
                Ok(())
            }
        }
    }

    /// Whether any citation is stored under `answer_id`.
    pub fn has_answer(&self, answer_id: &AnswerId) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range((answer_id.clone(), 0)..=(answer_id.clone(), u32::MAX))
            .next()
            .is_some()
    }

    /// Records of one answer ordered by ordinal.
    pub fn citations_for(&self, answer_id: &AnswerId) -> Vec<CitationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range((answer_id.clone(), 0)..=(answer_id.clone(), u32::MAX))
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Resolve an ordinal shown in an answer.
    pub fn get(&self, answer_id: &AnswerId, ordinal: u32) -> Option<CitationRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(answer_id.clone(), ordinal))
            .cloned()
    }

    /// Drop every citation pointing into `document_id`. Returns how many were removed.
    pub fn remove_document(&self, document_id: &DocumentId) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, record| &record.citation.passage_id.document_id != document_id);
        before - records.len()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PassageId;

    fn citation(answer: &str, ordinal: u32, document: &str, sequence: u32) -> Citation {
        Citation {
            answer_id: AnswerId::new(answer),
            ordinal,
            passage_id: PassageId::new(DocumentId::new(document), sequence),
        }
    }

    #[test]
    fn lists_citations_of_one_answer_in_ordinal_order() {
        let store = CitationStore::new();
        store.record(citation("a1", 2, "doc", 5), 0.7).unwrap();
        store.record(citation("a1", 1, "doc", 3), 0.9).unwrap();
        store.record(citation("a2", 1, "doc", 3), 0.6).unwrap();

        let ordinals: Vec<u32> = store
            .citations_for(&AnswerId::new("a1"))
            .iter()
            .map(|record| record.citation.ordinal)
            .collect();
        assert_eq!(ordinals, vec![1, 2]);
        let record = store.get(&AnswerId::new("a2"), 1).unwrap();
        assert_eq!(record.citation.passage_id.sequence_number, 3);
        assert!(OffsetDateTime::parse(&record.created_at, &Rfc3339).is_ok());
    }

    #[test]
    fn removing_a_document_purges_its_citations() {
        let store = CitationStore::new();
        store.record(citation("a1", 1, "doc", 0), 0.9).unwrap();
        store.record(citation("a1", 2, "other", 0), 0.9).unwrap();

        assert_eq!(store.remove_document(&DocumentId::new("doc")), 1);
        assert_eq!(store.len(), 1);
        let remaining = store.citations_for(&AnswerId::new("a1"));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].citation.passage_id.document_id, DocumentId::new("other"));
    }

    #[test]
    fn taken_keys_are_never_overwritten() {
        let store = CitationStore::new();
        store.record(citation("a1", 1, "doc", 0), 0.9).unwrap();

        let error = store.record(citation("a1", 1, "doc", 7), 0.8).unwrap_err();
        assert!(matches!(error, CitationError::OrdinalTaken { ordinal: 1, .. }));
        let kept = store.get(&AnswerId::new("a1"), 1).unwrap();
        assert_eq!(kept.citation.passage_id.sequence_number, 0);
        assert!(store.has_answer(&AnswerId::new("a1")));
        assert!(!store.has_answer(&AnswerId::new("a2")));
    }
}
