//! Per-document passage index with semantic retrieval.
//!
//! Each document owns its own entry: a state flag and the passages with their embeddings in
//! sequence order. Building an index is `begin` → `append`* → `seal`; only sealed documents
//! answer queries. Embeddings are computed outside any lock and committed in one step, so readers
//! never observe a half-appended batch and a dropped `append` future leaves nothing behind.
//!
//! [`PassageIndex::index`] rebuilds a document off to the side and swaps the sealed result in,
//! so a failed or abandoned rebuild leaves the previous version serving queries.

mod types;

pub use types::{IndexConfig, IndexError, IndexState, IndexedPassage, RetrievedPassage};

use crate::embedding::{SharedEmbeddingClient, cosine_similarity};
use crate::model::{DocumentId, EmbeddingVector, PassageChunk, PassageId};
use futures_util::{StreamExt, TryStreamExt, stream};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

struct DocumentEntry {
    state: IndexState,
    passages: Vec<IndexedPassage>,
}

type SharedEntry = Arc<RwLock<DocumentEntry>>;

/// In-memory passage and embedding store keyed by `(document_id, sequence_number)`.
pub struct PassageIndex {
    embedder: SharedEmbeddingClient,
    config: IndexConfig,
    documents: RwLock<HashMap<DocumentId, SharedEntry>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl PassageIndex {
    /// Create an empty index embedding through `embedder`.
    pub fn new(embedder: SharedEmbeddingClient, config: IndexConfig) -> Self {
        Self {
            embedder,
            config,
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Tunables in effect.
    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Open a fresh, empty index for `document_id`, replacing any previous one.
    pub fn begin(&self, document_id: &DocumentId) {
        let entry = Arc::new(RwLock::new(DocumentEntry {
            state: IndexState::Indexing,
            passages: Vec::new(),
        }));
        write(&self.documents).insert(document_id.clone(), entry);
        tracing::debug!(document_id = %document_id, "Opened passage index");
    }

    /// Embed and append passages that continue the document's sequence.
    ///
    /// Appending to a sealed index is allowed and keeps it queryable; the new passages become
    /// visible atomically once all of their embeddings exist.
    pub async fn append(
        &self,
        document_id: &DocumentId,
        passages: Vec<PassageChunk>,
    ) -> Result<usize, IndexError> {
        let entry = self.entry(document_id)?;
        let start = read(&entry).passages.len() as u32;
        validate_sequence(document_id, start, &passages)?;
        if passages.is_empty() {
            return Ok(0);
        }

        let indexed = self.embed_passages(passages).await?;

        let mut guard = write(&entry);
        // Another append may have committed while we were embedding.
        validate_sequence(
            document_id,
            guard.passages.len() as u32,
            indexed.iter().map(|passage| &passage.chunk),
        )?;
        let appended = indexed.len();
        guard.passages.extend(indexed);
        tracing::debug!(
            document_id = %document_id,
            appended,
            total = guard.passages.len(),
            "Appended passages"
        );
        Ok(appended)
    }

    /// Mark the document's index as complete and queryable.
    pub fn seal(&self, document_id: &DocumentId) -> Result<(), IndexError> {
        let entry = self.entry(document_id)?;
        let mut guard = write(&entry);
        guard.state = IndexState::Ready;
        tracing::info!(
            document_id = %document_id,
            passages = guard.passages.len(),
            "Passage index sealed"
        );
        Ok(())
    }

    /// Build a complete index and swap it in sealed.
    ///
    /// A document seen for the first time shows as [`IndexState::Indexing`] meanwhile. A
    /// document that already has a version keeps serving it until the swap; on failure that
    /// version is left untouched, and a first-time document is left with no entry.
    pub async fn index(
        &self,
        document_id: &DocumentId,
        passages: Vec<PassageChunk>,
    ) -> Result<usize, IndexError> {
        validate_sequence(document_id, 0, &passages)?;
        let placeholder = self.open_if_absent(document_id);

        let indexed = match self.embed_passages(passages).await {
            Ok(indexed) => indexed,
            Err(error) => {
                if let Some(placeholder) = placeholder {
                    self.remove_entry(document_id, &placeholder);
                }
                return Err(error);
            }
        };

        let count = indexed.len();
        let entry = Arc::new(RwLock::new(DocumentEntry {
            state: IndexState::Ready,
            passages: indexed,
        }));
        write(&self.documents).insert(document_id.clone(), entry);
        let replaced = placeholder.is_none();
        tracing::info!(
            document_id = %document_id,
            passages = count,
            replaced,
            "Passage index sealed"
        );
        Ok(count)
    }

    /// Drop the document's entry if it was never sealed. Returns whether one was dropped.
    pub fn discard_unsealed(&self, document_id: &DocumentId) -> bool {
        let mut documents = write(&self.documents);
        let unsealed = documents
            .get(document_id)
            .is_some_and(|entry| read(entry).state == IndexState::Indexing);
        if unsealed {
            documents.remove(document_id);
            tracing::debug!(document_id = %document_id, "Discarded unsealed passage index");
        }
        unsealed
    }

    /// Insert an empty `Indexing` entry unless the document already has one.
    fn open_if_absent(&self, document_id: &DocumentId) -> Option<SharedEntry> {
        let mut documents = write(&self.documents);
        if documents.contains_key(document_id) {
            return None;
        }
        let entry = Arc::new(RwLock::new(DocumentEntry {
            state: IndexState::Indexing,
            passages: Vec::new(),
        }));
        documents.insert(document_id.clone(), Arc::clone(&entry));
        tracing::debug!(document_id = %document_id, "Opened passage index");
        Some(entry)
    }

    /// Remove the document's entry only while it is still `entry`.
    fn remove_entry(&self, document_id: &DocumentId, entry: &SharedEntry) {
        let mut documents = write(&self.documents);
        if documents
            .get(document_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            documents.remove(document_id);
        }
    }

    /// Delete every passage and embedding of the document. Returns whether anything existed.
    pub fn remove(&self, document_id: &DocumentId) -> bool {
        let removed = write(&self.documents).remove(document_id).is_some();
        if removed {
            tracing::info!(document_id = %document_id, "Removed passage index");
        }
        removed
    }

    /// Current lifecycle state, if the document is known.
    pub fn state(&self, document_id: &DocumentId) -> Option<IndexState> {
        let entry = read(&self.documents).get(document_id).cloned()?;
        let state = read(&entry).state;
        Some(state)
    }

    /// Sequence number the next appended passage must carry.
    pub fn next_sequence(&self, document_id: &DocumentId) -> Result<u32, IndexError> {
        let entry = self.entry(document_id)?;
        let next = read(&entry).passages.len() as u32;
        Ok(next)
    }

    /// All passages of a document in sequence order.
    pub fn passages(&self, document_id: &DocumentId) -> Result<Vec<PassageChunk>, IndexError> {
        let entry = self.entry(document_id)?;
        let guard = read(&entry);
        Ok(guard
            .passages
            .iter()
            .map(|passage| passage.chunk.clone())
            .collect())
    }

    /// Look up one passage by key.
    pub fn passage(&self, passage_id: &PassageId) -> Option<PassageChunk> {
        self.indexed(passage_id).map(|indexed| indexed.chunk)
    }

    /// Embedding stored for a passage.
    pub fn stored_embedding(&self, passage_id: &PassageId) -> Option<EmbeddingVector> {
        self.indexed(passage_id).map(|indexed| indexed.embedding)
    }

    fn indexed(&self, passage_id: &PassageId) -> Option<IndexedPassage> {
        let entry = read(&self.documents)
            .get(&passage_id.document_id)
            .cloned()?;
        let guard = read(&entry);
        guard
            .passages
            .get(passage_id.sequence_number as usize)
            .cloned()
    }

    /// Embed one text (a query or an answer segment) with the index's provider.
    pub async fn embed_text(&self, text: &str) -> Result<EmbeddingVector, IndexError> {
        let mut vectors = self.embed_batches(vec![text.to_string()]).await?;
        vectors.pop().ok_or(IndexError::EmptyEmbedding {
            expected: 1,
            actual: 0,
        })
    }

    /// Rank the document's passages against `query`, best first.
    ///
    /// Ties are broken by ascending sequence number. `k` defaults to the configured top-k and is
    /// clamped to `[1, max_top_k]`.
    pub async fn retrieve(
        &self,
        document_id: &DocumentId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, IndexError> {
        let entry = self.ready_entry(document_id)?;
        let k = self.config.resolve_top_k(k);
        let query_vector = self.embed_text(query).await?;

        let guard = read(&entry);
        let mut hits = score_passages(&guard.passages, &query_vector);
        drop(guard);
        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.passage_id.sequence_number.cmp(&right.passage_id.sequence_number))
        });
        hits.truncate(k);
        tracing::debug!(document_id = %document_id, k, hits = hits.len(), "Retrieved passages");
        Ok(hits)
    }

    /// Rank passages of several documents against `query` and merge the rankings.
    ///
    /// Every listed document must be sealed. Ties are broken by the order of `document_ids`,
    /// then by sequence number.
    pub async fn retrieve_across(
        &self,
        document_ids: &[DocumentId],
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, IndexError> {
        let entries = document_ids
            .iter()
            .map(|document_id| self.ready_entry(document_id))
            .collect::<Result<Vec<_>, _>>()?;
        let k = self.config.resolve_top_k(k);
        let query_vector = self.embed_text(query).await?;

        let mut hits: Vec<(usize, RetrievedPassage)> = Vec::new();
        for (position, entry) in entries.iter().enumerate() {
            let guard = read(entry);
            hits.extend(
                score_passages(&guard.passages, &query_vector)
                    .into_iter()
                    .map(|hit| (position, hit)),
            );
        }
        hits.sort_by(|(left_doc, left), (right_doc, right)| {
            right
                .score
                .total_cmp(&left.score)
                .then(left_doc.cmp(right_doc))
                .then(left.passage_id.sequence_number.cmp(&right.passage_id.sequence_number))
        });
        hits.truncate(k);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }

    fn entry(&self, document_id: &DocumentId) -> Result<SharedEntry, IndexError> {
        read(&self.documents)
            .get(document_id)
            .cloned()
            .ok_or_else(|| IndexError::UnknownDocument(document_id.clone()))
    }

    fn ready_entry(&self, document_id: &DocumentId) -> Result<SharedEntry, IndexError> {
        let entry = self.entry(document_id)?;
        let state = read(&entry).state;
        match state {
            IndexState::Ready => Ok(entry),
            IndexState::Indexing => Err(IndexError::IndexNotReady(document_id.clone())),
        }
    }

    async fn embed_passages(
        &self,
        passages: Vec<PassageChunk>,
    ) -> Result<Vec<IndexedPassage>, IndexError> {
        let texts: Vec<String> = passages
            .iter()
            .map(|passage| passage.normalized_text.clone())
            .collect();
        let embeddings = self.embed_batches(texts).await?;
        Ok(passages
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedPassage { chunk, embedding })
            .collect())
    }

    /// Embed texts in batches with bounded parallelism, preserving input order.
    async fn embed_batches(&self, texts: Vec<String>) -> Result<Vec<EmbeddingVector>, IndexError> {
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);
        let batches: Vec<Vec<String>> = texts
            .chunks(batch_size)
            .map(<[String]>::to_vec)
            .collect();
        tracing::trace!(
            texts = texts.len(),
            batches = batches.len(),
            concurrency,
            "Embedding passages"
        );

        let embedder = &self.embedder;
        let batched: Vec<Vec<EmbeddingVector>> = stream::iter(batches)
            .map(|batch| async move {
                let expected = batch.len();
                let vectors = embedder.generate_embeddings(batch).await?;
                if vectors.len() != expected {
                    return Err(IndexError::EmptyEmbedding {
                        expected,
                        actual: vectors.len(),
                    });
                }
                Ok::<_, IndexError>(vectors)
            })
            .buffered(concurrency)
            .try_collect()
            .await?;

        let vectors: Vec<EmbeddingVector> = batched.into_iter().flatten().collect();
        let expected = self.config.dimension;
        if let Some(vector) = vectors.iter().find(|vector| vector.len() != expected) {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        Ok(vectors)
    }
}

fn validate_sequence<'p>(
    document_id: &DocumentId,
    start: u32,
    passages: impl IntoIterator<Item = &'p PassageChunk>,
) -> Result<(), IndexError> {
    for (offset, passage) in passages.into_iter().enumerate() {
        let expected = start + offset as u32;
        if &passage.document_id != document_id || passage.sequence_number != expected {
            return Err(IndexError::SequenceGap {
                document_id: document_id.clone(),
                expected,
                actual: passage.id(),
            });
        }
    }
    Ok(())
}

fn score_passages(passages: &[IndexedPassage], query: &[f32]) -> Vec<RetrievedPassage> {
    passages
        .iter()
        .map(|passage| RetrievedPassage {
            passage_id: passage.chunk.id(),
            score: cosine_similarity(query, &passage.embedding),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClient, EmbeddingClientError, LocalEmbeddingClient};
    use crate::model::{DocumentFormat, LocationMetadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DIMENSION: usize = 256;

    fn config() -> IndexConfig {
        IndexConfig {
            dimension: DIMENSION,
            batch_size: 2,
            concurrency: 3,
            default_top_k: 2,
            max_top_k: 3,
        }
    }

    fn local_index() -> PassageIndex {
        PassageIndex::new(Arc::new(LocalEmbeddingClient::new(DIMENSION)), config())
    }

    fn passage(document: &str, sequence: u32, text: &str) -> PassageChunk {
        PassageChunk {
            document_id: DocumentId::new(document),
            sequence_number: sequence,
            format: DocumentFormat::PlainText,
            normalized_text: text.to_string(),
            location: LocationMetadata::Text {
                char_offset_start: 0,
                char_offset_end: text.chars().count(),
            },
        }
    }

    fn corpus(document: &str) -> Vec<PassageChunk> {
        [
            "Photosynthesis converts sunlight into chemical energy in plants.",
            "The quarterly revenue grew by ten percent.",
            "Chlorophyll absorbs light for photosynthesis.",
            "Shipping schedules changed after the storm.",
        ]
        .iter()
        .enumerate()
        .map(|(index, text)| passage(document, index as u32, text))
        .collect()
    }

    /// Completes later batches first and counts calls.
    struct SlowFirstEmbedder {
        calls: AtomicUsize,
        inner: LocalEmbeddingClient,
    }

    #[async_trait]
    impl EmbeddingClient for SlowFirstEmbedder {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            self.inner.generate_embeddings(texts).await
        }
    }

    struct WrongDimension;

    #[async_trait]
    impl EmbeddingClient for WrongDimension {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            Ok(texts.iter().map(|_| vec![1.0; 3]).collect())
        }
    }

    /// Refuses any batch mentioning `unembeddable`.
    struct RejectsMarked(LocalEmbeddingClient);

    #[async_trait]
    impl EmbeddingClient for RejectsMarked {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            if texts.iter().any(|text| text.contains("unembeddable")) {
                return Err(EmbeddingClientError::GenerationFailed("rejected".to_string()));
            }
            self.0.generate_embeddings(texts).await
        }
    }

    #[tokio::test]
    async fn failed_rebuild_keeps_the_sealed_version() {
        let index = PassageIndex::new(
            Arc::new(RejectsMarked(LocalEmbeddingClient::new(DIMENSION))),
            config(),
        );
        let doc = DocumentId::new("doc");
        index.index(&doc, corpus("doc")).await.unwrap();

        let rebuild = index
            .index(&doc, vec![passage("doc", 0, "an unembeddable rewrite")])
            .await;
        assert!(matches!(rebuild, Err(IndexError::Embedding(_))));
        assert_eq!(index.state(&doc), Some(IndexState::Ready));
        assert_eq!(index.passages(&doc).unwrap(), corpus("doc"));

        index
            .index(&doc, vec![passage("doc", 0, "a clean rewrite")])
            .await
            .unwrap();
        assert_eq!(index.passages(&doc).unwrap().len(), 1);
        assert!(!index.discard_unsealed(&doc));
    }

    #[tokio::test]
    async fn retrieval_ranks_relevant_passages_first() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.index(&doc, corpus("doc")).await.unwrap();

        let hits = index
            .retrieve(&doc, "how does photosynthesis use light", None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let sequences: Vec<u32> = hits.iter().map(|hit| hit.passage_id.sequence_number).collect();
        assert!(sequences.contains(&0) && sequences.contains(&2), "{sequences:?}");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn k_is_clamped() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.index(&doc, corpus("doc")).await.unwrap();

        assert_eq!(index.retrieve(&doc, "light", Some(0)).await.unwrap().len(), 1);
        assert_eq!(index.retrieve(&doc, "light", Some(99)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ties_break_on_sequence_number() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        let same = vec![
            passage("doc", 0, "identical text"),
            passage("doc", 1, "identical text"),
            passage("doc", 2, "identical text"),
        ];
        index.index(&doc, same).await.unwrap();

        let hits = index.retrieve(&doc, "identical", Some(3)).await.unwrap();
        let sequences: Vec<u32> = hits.iter().map(|hit| hit.passage_id.sequence_number).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unsealed_and_unknown_documents_are_rejected() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.begin(&doc);
        index.append(&doc, corpus("doc")).await.unwrap();

        assert!(matches!(
            index.retrieve(&doc, "light", None).await,
            Err(IndexError::IndexNotReady(_))
        ));
        assert!(matches!(
            index.retrieve(&DocumentId::new("other"), "light", None).await,
            Err(IndexError::UnknownDocument(_))
        ));

        index.seal(&doc).unwrap();
        assert!(index.retrieve(&doc, "light", None).await.is_ok());
    }

    #[tokio::test]
    async fn append_requires_a_gapless_sequence() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.begin(&doc);
        index
            .append(&doc, vec![passage("doc", 0, "first")])
            .await
            .unwrap();

        let gap = index.append(&doc, vec![passage("doc", 2, "third")]).await;
        assert!(matches!(gap, Err(IndexError::SequenceGap { expected: 1, .. })));

        let foreign = index.append(&doc, vec![passage("other", 1, "x")]).await;
        assert!(matches!(foreign, Err(IndexError::SequenceGap { .. })));

        index
            .append(&doc, vec![passage("doc", 1, "second")])
            .await
            .unwrap();
        assert_eq!(index.next_sequence(&doc).unwrap(), 2);
    }

    #[tokio::test]
    async fn incremental_append_keeps_sealed_index_queryable() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.index(&doc, corpus("doc")).await.unwrap();

        index
            .append(&doc, vec![passage("doc", 4, "Mitochondria produce energy.")])
            .await
            .unwrap();
        assert_eq!(index.state(&doc), Some(IndexState::Ready));
        let hits = index.retrieve(&doc, "mitochondria", Some(1)).await.unwrap();
        assert_eq!(hits[0].passage_id.sequence_number, 4);
    }

    #[tokio::test]
    async fn batches_are_stored_in_extraction_order() {
        let embedder = Arc::new(SlowFirstEmbedder {
            calls: AtomicUsize::new(0),
            inner: LocalEmbeddingClient::new(DIMENSION),
        });
        let index = PassageIndex::new(embedder.clone(), config());
        let doc = DocumentId::new("doc");
        let passages = corpus("doc");
        index.index(&doc, passages.clone()).await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        let local = LocalEmbeddingClient::new(DIMENSION);
        for chunk in passages {
            assert_eq!(
                index.stored_embedding(&chunk.id()).unwrap(),
                local.encode(&chunk.normalized_text)
            );
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_leaves_no_entry() {
        let index = PassageIndex::new(Arc::new(WrongDimension), config());
        let doc = DocumentId::new("doc");
        let result = index.index(&doc, corpus("doc")).await;
        assert!(matches!(
            result,
            Err(IndexError::DimensionMismatch {
                expected: DIMENSION,
                actual: 3
            })
        ));
        assert_eq!(index.state(&doc), None);
    }

    #[tokio::test]
    async fn retrieve_across_merges_documents() {
        let index = local_index();
        let first = DocumentId::new("a");
        let second = DocumentId::new("b");
        index.index(&first, corpus("a")).await.unwrap();
        index
            .index(&second, vec![passage("b", 0, "Photosynthesis happens in leaves.")])
            .await
            .unwrap();

        let hits = index
            .retrieve_across(&[first.clone(), second.clone()], "photosynthesis", Some(3))
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().any(|hit| hit.passage_id.document_id == second));

        index.begin(&second);
        assert!(matches!(
            index.retrieve_across(&[first, second], "x", None).await,
            Err(IndexError::IndexNotReady(_))
        ));
    }

    #[tokio::test]
    async fn remove_purges_passages_and_embeddings() {
        let index = local_index();
        let doc = DocumentId::new("doc");
        index.index(&doc, corpus("doc")).await.unwrap();
        let key = PassageId::new(doc.clone(), 0);
        assert!(index.passage(&key).is_some());

        assert!(index.remove(&doc));
        assert!(index.passage(&key).is_none());
        assert!(index.stored_embedding(&key).is_none());
        assert!(matches!(index.passages(&doc), Err(IndexError::UnknownDocument(_))));
    }
}
