//! Grounding service coordinating extraction, indexing, citation, and highlighting.

mod types;

pub use types::{DeletionReport, GroundingError, IngestOutcome};

use crate::citation::{AnnotatedAnswer, AnnotatedSegment, CitationAssigner, CitationRecord, CitationStore};
use crate::config::{Config, get_config, init_config};
use crate::embedding::{SharedEmbeddingClient, get_embedding_client};
use crate::extraction::{
    Extraction, ExtractionConfig, WebFetchConfig, content_digest, extract, fetch_web_source,
};
use crate::highlight::{HighlightConfig, HighlightError, resolve_passage};
use crate::index::{IndexConfig, IndexState, PassageIndex, RetrievedPassage};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::model::{
    AnswerId, Citation, Document, DocumentFormat, DocumentId, HighlightInstruction, PassageChunk,
    PassageId,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Job {
    id: u64,
    token: CancellationToken,
}

/// Owns the passage index, the citation store, and the ingestion worker pool.
///
/// Every document is an independent unit of work: ingestion jobs for different documents run in
/// parallel up to `ingest_workers`, and a job can be cancelled at any point by deleting its
/// document or by ingesting a newer version of it. A cancelled or failed job leaves no passages,
/// embeddings, or citations of its own behind, and never strands citations of the version it
/// was replacing. Construct once and share through an `Arc`.
pub struct GroundingService {
    config: Config,
    extraction: ExtractionConfig,
    highlight: HighlightConfig,
    web: WebFetchConfig,
    index: PassageIndex,
    citations: CitationStore,
    metrics: Arc<EngineMetrics>,
    workers: Semaphore,
    shutdown: CancellationToken,
    jobs: Mutex<HashMap<DocumentId, Job>>,
    next_job: AtomicU64,
    digests: RwLock<HashMap<DocumentId, String>>,
}

/// Surface of the grounding engine used by collaborators (upload handlers, chat backends).
#[async_trait]
pub trait GroundingApi: Send + Sync {
    /// Extract and index a document.
    async fn ingest(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<IngestOutcome, GroundingError>;

    /// Cancel any in-flight work for a document and purge everything stored for it.
    fn delete_document(&self, document_id: &DocumentId) -> DeletionReport;

    /// Rank a document's passages against a query.
    async fn retrieve(
        &self,
        document_id: &DocumentId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, GroundingError>;

    /// Bind the sentences of a generated answer to the passages it was generated from.
    async fn assign_citations(
        &self,
        answer_id: &AnswerId,
        document_id: &DocumentId,
        answer_text: &str,
        retrieved: &[RetrievedPassage],
    ) -> Result<(AnnotatedAnswer, Vec<Citation>), GroundingError>;

    /// Compute what a viewer should highlight for a passage.
    fn resolve_highlight(
        &self,
        passage_id: &PassageId,
        live_content: &str,
    ) -> Result<HighlightInstruction, GroundingError>;

    /// Current counters.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl GroundingService {
    /// Build a service around an explicit configuration and embedding provider.
    pub fn new(config: Config, embedder: SharedEmbeddingClient) -> Result<Self, GroundingError> {
        config.validate()?;
        tracing::info!(
            workers = config.ingest_workers,
            provider = ?config.embedding_provider,
            dimension = config.embedding_dimension,
            "Grounding service initialized"
        );
        Ok(Self {
            extraction: ExtractionConfig::from(&config),
            highlight: HighlightConfig::from(&config),
            web: WebFetchConfig::from(&config),
            index: PassageIndex::new(embedder, IndexConfig::from(&config)),
            citations: CitationStore::new(),
            metrics: Arc::new(EngineMetrics::new()),
            workers: Semaphore::new(config.ingest_workers),
            shutdown: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
            next_job: AtomicU64::new(0),
            digests: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Build a service from the global configuration, loading it from the environment first
    /// when nothing has installed it yet.
    pub fn from_env() -> Result<Self, GroundingError> {
        let config = match get_config() {
            Some(config) => config.clone(),
            None => init_config()?.clone(),
        };
        let embedder = get_embedding_client(&config)?;
        Self::new(config, embedder)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared metrics registry.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Extract `bytes` as `document.format` and replace the document's index.
    ///
    /// Passages become queryable only once the whole document is extracted and embedded.
    /// Re-ingesting identical bytes is a no-op.
    pub async fn ingest(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<IngestOutcome, GroundingError> {
        let digest = content_digest(&bytes);
        if self.is_unchanged(&document.id, &digest) {
            tracing::info!(document_id = %document.id, "Content unchanged; skipping ingestion");
            return Ok(IngestOutcome {
                document_id: document.id.clone(),
                passages: 0,
                warnings: Vec::new(),
                skipped_unchanged: true,
                content_digest: digest,
            });
        }

        let job = self.register_job(&document.id)?;
        tracing::info!(
            document_id = %document.id,
            format = ?document.format,
            bytes = bytes.len(),
            job = job.id,
            "Ingesting document"
        );
        let result = tokio::select! {
            biased;
            _ = job.token.cancelled() => Err(GroundingError::Cancelled(document.id.clone())),
            result = self.build_index(document, bytes) => result,
        };
        let extraction = self.finish_job(&document.id, &job, result, true)?;

        write_digest(&self.digests, &document.id, Some(digest.clone()));
        self.record_extraction(&extraction);
        Ok(IngestOutcome {
            document_id: document.id.clone(),
            passages: extraction.passages.len(),
            warnings: extraction.warnings,
            skipped_unchanged: false,
            content_digest: digest,
        })
    }

    /// Extract `bytes` and append the passages to the document's existing index.
    ///
    /// New passages continue the sequence where the index ends; earlier passages, their
    /// embeddings, and citations pointing at them are untouched.
    pub async fn ingest_incremental(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<IngestOutcome, GroundingError> {
        let digest = content_digest(&bytes);
        let job = self.register_job(&document.id)?;
        let result = tokio::select! {
            biased;
            _ = job.token.cancelled() => Err(GroundingError::Cancelled(document.id.clone())),
            result = self.append_document(document, bytes) => result,
        };
        let extraction = self.finish_job(&document.id, &job, result, false)?;

        // The stored digest no longer describes the whole index.
        write_digest(&self.digests, &document.id, None);
        self.record_extraction(&extraction);
        Ok(IngestOutcome {
            document_id: document.id.clone(),
            passages: extraction.passages.len(),
            warnings: extraction.warnings,
            skipped_unchanged: false,
            content_digest: digest,
        })
    }

    /// Fetch `url` and ingest it as a web page, or as a PDF when the server returns one.
    pub async fn ingest_url(
        &self,
        document_id: &DocumentId,
        url: &str,
    ) -> Result<IngestOutcome, GroundingError> {
        let fetched = fetch_web_source(url, &self.web).await?;
        tracing::debug!(
            document_id = %document_id,
            url = %fetched.url,
            format = ?fetched.format,
            bytes = fetched.bytes.len(),
            "Fetched web source"
        );
        let document = Document::new(document_id.clone(), fetched.format);
        self.ingest(&document, fetched.bytes).await
    }

    /// Cancel in-flight work for the document and delete its passages, embeddings, and
    /// citations.
    pub fn delete_document(&self, document_id: &DocumentId) -> DeletionReport {
        let cancelled_job = match lock(&self.jobs).remove(document_id) {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        };
        let index_removed = self.index.remove(document_id);
        let citations_removed = self.citations.remove_document(document_id);
        write_digest(&self.digests, document_id, None);
        tracing::info!(
            document_id = %document_id,
            cancelled_job,
            index_removed,
            citations_removed,
            "Deleted document"
        );
        DeletionReport {
            cancelled_job,
            index_removed,
            citations_removed,
        }
    }

    /// Cancel every in-flight job and refuse new ones.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down grounding service");
        self.shutdown.cancel();
        self.workers.close();
    }

    /// Rank a document's passages against `query`.
    pub async fn retrieve(
        &self,
        document_id: &DocumentId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, GroundingError> {
        Ok(self.index.retrieve(document_id, query, k).await?)
    }

    /// Rank passages of several documents against `query` in one merged list.
    pub async fn retrieve_across(
        &self,
        document_ids: &[DocumentId],
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, GroundingError> {
        Ok(self.index.retrieve_across(document_ids, query, k).await?)
    }

    /// Annotate a complete answer and persist its citations.
    pub async fn assign_citations(
        &self,
        answer_id: &AnswerId,
        document_id: &DocumentId,
        answer_text: &str,
        retrieved: &[RetrievedPassage],
    ) -> Result<(AnnotatedAnswer, Vec<Citation>), GroundingError> {
        let assigner = self.assigner();
        let (answer, citations) = assigner
            .assign_citations(answer_id, document_id, answer_text, retrieved)
            .await?;
        let uncited = answer
            .segments
            .iter()
            .filter(|segment| !segment.is_cited())
            .count();
        self.metrics
            .record_answer(citations.len() as u64, uncited as u64);
        Ok((answer, citations))
    }

    /// Annotate an answer while it streams in, yielding each sentence once complete.
    pub fn annotate_stream<'s, S>(
        &'s self,
        answer_id: AnswerId,
        document_id: DocumentId,
        retrieved: Vec<RetrievedPassage>,
        tokens: S,
    ) -> impl Stream<Item = Result<AnnotatedSegment, GroundingError>> + 's
    where
        S: Stream<Item = String> + 's,
    {
        try_stream! {
            let assigner = self.assigner();
            let segments = assigner.annotate_stream(answer_id, document_id, retrieved, tokens);
            futures_util::pin_mut!(segments);
            let mut ordinals = HashSet::new();
            let mut uncited = 0u64;
            while let Some(segment) = segments.next().await {
                let segment = segment?;
                if segment.is_cited() {
                    ordinals.extend(segment.ordinals.iter().copied());
                } else {
                    uncited += 1;
                }
                yield segment;
            }
            self.metrics.record_answer(ordinals.len() as u64, uncited);
        }
    }

    /// Resolve what to highlight for a passage given the content the viewer renders.
    pub fn resolve_highlight(
        &self,
        passage_id: &PassageId,
        live_content: &str,
    ) -> Result<HighlightInstruction, GroundingError> {
        let passage = self
            .index
            .passage(passage_id)
            .ok_or_else(|| HighlightError::UnknownPassage(passage_id.clone()))?;
        let resolution = resolve_passage(&passage, live_content, &self.highlight);
        if resolution.degraded {
            self.metrics.record_degraded_highlight();
        }
        Ok(resolution.instruction)
    }

    /// Passages of a document in sequence order.
    pub fn passages(&self, document_id: &DocumentId) -> Result<Vec<PassageChunk>, GroundingError> {
        Ok(self.index.passages(document_id)?)
    }

    /// Index lifecycle state of a document, if known.
    pub fn index_state(&self, document_id: &DocumentId) -> Option<IndexState> {
        self.index.state(document_id)
    }

    /// Citations of an answer ordered by ordinal.
    pub fn citations_for(&self, answer_id: &AnswerId) -> Vec<CitationRecord> {
        self.citations.citations_for(answer_id)
    }

    /// Resolve an ordinal shown in an answer.
    pub fn citation(&self, answer_id: &AnswerId, ordinal: u32) -> Option<CitationRecord> {
        self.citations.get(answer_id, ordinal)
    }

    /// Current counters.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn assigner(&self) -> CitationAssigner<'_> {
        CitationAssigner::new(
            &self.index,
            &self.citations,
            self.config.groundedness_threshold,
        )
    }

    fn is_unchanged(&self, document_id: &DocumentId, digest: &str) -> bool {
        let known = self
            .digests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .is_some_and(|stored| stored == digest);
        known && self.index.state(document_id) == Some(IndexState::Ready)
    }

    /// Register a job for the document, cancelling any older one still running for it.
    fn register_job(&self, document_id: &DocumentId) -> Result<Job, GroundingError> {
        if self.shutdown.is_cancelled() {
            return Err(GroundingError::ShutDown);
        }
        let job = Job {
            id: self.next_job.fetch_add(1, Ordering::Relaxed),
            token: self.shutdown.child_token(),
        };
        if let Some(previous) = lock(&self.jobs).insert(document_id.clone(), job.clone()) {
            tracing::info!(
                document_id = %document_id,
                job = previous.id,
                "Cancelling superseded ingestion"
            );
            previous.token.cancel();
        }
        Ok(job)
    }

    /// Deregister the job and settle what it wrote.
    ///
    /// `owns_index` marks jobs that (re)built the whole index. Such a job either swapped in a
    /// new version, which retires the citations of the previous one, or failed before the swap,
    /// which leaves the previous version and its citations in place. A job cancelled after its
    /// swap is undone entirely. Appends commit atomically and have nothing to undo.
    fn finish_job(
        &self,
        document_id: &DocumentId,
        job: &Job,
        result: Result<Extraction, GroundingError>,
        owns_index: bool,
    ) -> Result<Extraction, GroundingError> {
        let mut jobs = lock(&self.jobs);
        let superseded = jobs
            .get(document_id)
            .is_some_and(|current| current.id != job.id);
        if !superseded {
            jobs.remove(document_id);
        }

        let committed = result.is_ok();
        let result = match result {
            Ok(_) if job.token.is_cancelled() => {
                Err(GroundingError::Cancelled(document_id.clone()))
            }
            other => other,
        };

        match &result {
            Ok(_) if owns_index => {
                // Citations of the previous version point at passages that no longer exist.
                let purged = self.citations.remove_document(document_id);
                if purged > 0 {
                    tracing::debug!(document_id = %document_id, purged, "Purged stale citations");
                }
            }
            Ok(_) => {}
            Err(error) => {
                if owns_index && !superseded {
                    if committed {
                        self.index.remove(document_id);
                        self.citations.remove_document(document_id);
                    } else {
                        self.index.discard_unsealed(document_id);
                    }
                }
                if owns_index {
                    write_digest(&self.digests, document_id, None);
                }
                match error {
                    GroundingError::Cancelled(_) => tracing::warn!(
                        document_id = %document_id,
                        job = job.id,
                        superseded,
                        committed,
                        "Ingestion cancelled"
                    ),
                    other => tracing::warn!(
                        document_id = %document_id,
                        job = job.id,
                        error = %other,
                        "Ingestion failed; previous version kept"
                    ),
                }
            }
        }
        drop(jobs);
        result
    }

    async fn build_index(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<Extraction, GroundingError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| GroundingError::ShutDown)?;
        let extraction = self
            .extract_blocking(&document.id, document.format, bytes)
            .await?;
        self.index
            .index(&document.id, extraction.passages.clone())
            .await?;
        Ok(extraction)
    }

    async fn append_document(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<Extraction, GroundingError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| GroundingError::ShutDown)?;
        // Fail fast for documents that were never indexed.
        self.index.next_sequence(&document.id)?;
        let mut extraction = self
            .extract_blocking(&document.id, document.format, bytes)
            .await?;
        let offset = self.index.next_sequence(&document.id)?;
        for passage in &mut extraction.passages {
            passage.sequence_number += offset;
        }
        self.index
            .append(&document.id, extraction.passages.clone())
            .await?;
        Ok(extraction)
    }

    async fn extract_blocking(
        &self,
        document_id: &DocumentId,
        format: DocumentFormat,
        bytes: Vec<u8>,
    ) -> Result<Extraction, GroundingError> {
        let document_id = document_id.clone();
        let config = self.extraction.clone();
        let extraction =
            tokio::task::spawn_blocking(move || extract(&document_id, &bytes, format, &config))
                .await??;
        Ok(extraction)
    }

    fn record_extraction(&self, extraction: &Extraction) {
        self.metrics.record_document(
            extraction.passages.len() as u64,
            extraction.warnings.len() as u64,
        );
    }
}

fn write_digest(
    digests: &RwLock<HashMap<DocumentId, String>>,
    document_id: &DocumentId,
    digest: Option<String>,
) {
    let mut digests = digests.write().unwrap_or_else(PoisonError::into_inner);
    match digest {
        Some(digest) => digests.insert(document_id.clone(), digest),
        None => digests.remove(document_id),
    };
}

#[async_trait]
impl GroundingApi for GroundingService {
    async fn ingest(
        &self,
        document: &Document,
        bytes: Vec<u8>,
    ) -> Result<IngestOutcome, GroundingError> {
        GroundingService::ingest(self, document, bytes).await
    }

    fn delete_document(&self, document_id: &DocumentId) -> DeletionReport {
        GroundingService::delete_document(self, document_id)
    }

    async fn retrieve(
        &self,
        document_id: &DocumentId,
        query: &str,
        k: Option<usize>,
    ) -> Result<Vec<RetrievedPassage>, GroundingError> {
        GroundingService::retrieve(self, document_id, query, k).await
    }

    async fn assign_citations(
        &self,
        answer_id: &AnswerId,
        document_id: &DocumentId,
        answer_text: &str,
        retrieved: &[RetrievedPassage],
    ) -> Result<(AnnotatedAnswer, Vec<Citation>), GroundingError> {
        GroundingService::assign_citations(self, answer_id, document_id, answer_text, retrieved)
            .await
    }

    fn resolve_highlight(
        &self,
        passage_id: &PassageId,
        live_content: &str,
    ) -> Result<HighlightInstruction, GroundingError> {
        GroundingService::resolve_highlight(self, passage_id, live_content)
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        GroundingService::metrics_snapshot(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingClient, EmbeddingClientError, LocalEmbeddingClient};
    use crate::index::IndexError;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    const DIMENSION: usize = 256;

    fn config() -> Config {
        Config {
            embedding_dimension: DIMENSION,
            ..Config::default()
        }
    }

    fn service() -> GroundingService {
        GroundingService::new(config(), Arc::new(LocalEmbeddingClient::new(DIMENSION)))
            .expect("valid config")
    }

    /// Blocks every embedding call until released, so jobs can be caught mid-flight.
    struct GatedEmbedder {
        inner: LocalEmbeddingClient,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EmbeddingClient for GatedEmbedder {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.generate_embeddings(texts).await
        }
    }

    /// Fails every call while `failing` is set.
    struct SwitchableEmbedder {
        inner: LocalEmbeddingClient,
        failing: Arc<AtomicBool>,
    }

    #[async_trait]
    impl EmbeddingClient for SwitchableEmbedder {
        async fn generate_embeddings(
            &self,
            texts: Vec<String>,
        ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EmbeddingClientError::GenerationFailed(
                    "provider down".to_string(),
                ));
            }
            self.inner.generate_embeddings(texts).await
        }
    }

    fn switchable_service() -> (GroundingService, Arc<AtomicBool>) {
        let failing = Arc::new(AtomicBool::new(false));
        let embedder = SwitchableEmbedder {
            inner: LocalEmbeddingClient::new(DIMENSION),
            failing: Arc::clone(&failing),
        };
        let service = GroundingService::new(config(), Arc::new(embedder)).expect("valid config");
        (service, failing)
    }

    fn text_document(id: &str) -> Document {
        Document::new(id, DocumentFormat::PlainText)
    }

    #[tokio::test]
    async fn unchanged_content_is_skipped() {
        let service = service();
        let document = text_document("notes");
        let bytes = b"Photosynthesis converts light into chemical energy.".to_vec();

        let first = service.ingest(&document, bytes.clone()).await.unwrap();
        assert!(!first.skipped_unchanged);
        assert_eq!(first.passages, 1);

        let second = service.ingest(&document, bytes).await.unwrap();
        assert!(second.skipped_unchanged);
        assert_eq!(second.content_digest, first.content_digest);
        assert_eq!(service.metrics_snapshot().documents_ingested, 1);
    }

    #[tokio::test]
    async fn incremental_ingestion_continues_the_sequence() {
        let service = service();
        let document = text_document("log");
        service
            .ingest(&document, b"Day one: the pump was installed.".to_vec())
            .await
            .unwrap();
        let before = service.passages(&document.id).unwrap().len();

        let outcome = service
            .ingest_incremental(&document, b"Day two: the pump was tested.".to_vec())
            .await
            .unwrap();

        let passages = service.passages(&document.id).unwrap();
        assert_eq!(passages.len(), before + outcome.passages);
        for (expected, passage) in passages.iter().enumerate() {
            assert_eq!(passage.sequence_number as usize, expected);
        }
        assert_eq!(service.index_state(&document.id), Some(IndexState::Ready));
    }

    #[tokio::test]
    async fn incremental_ingestion_requires_an_index() {
        let service = service();
        let error = service
            .ingest_incremental(&text_document("missing"), b"Some text.".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            GroundingError::Index(IndexError::UnknownDocument(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_document_cancels_its_ingestion() {
        let started = Arc::new(Notify::new());
        let embedder = GatedEmbedder {
            inner: LocalEmbeddingClient::new(DIMENSION),
            started: Arc::clone(&started),
            release: Arc::new(Notify::new()),
        };
        let service = Arc::new(GroundingService::new(config(), Arc::new(embedder)).unwrap());
        let document = text_document("draft");

        let job = tokio::spawn({
            let service = Arc::clone(&service);
            let document = document.clone();
            async move {
                service
                    .ingest(&document, b"Text that never finishes indexing.".to_vec())
                    .await
            }
        });
        started.notified().await;

        let report = service.delete_document(&document.id);
        assert!(report.cancelled_job);

        let result = job.await.unwrap();
        assert!(matches!(result, Err(GroundingError::Cancelled(_))));
        assert_eq!(service.index_state(&document.id), None);
        assert!(service.passages(&document.id).is_err());
        assert_eq!(service.metrics_snapshot().documents_ingested, 0);
    }

    #[tokio::test]
    async fn reingesting_purges_citations_of_the_old_version() {
        let service = service();
        let document = text_document("facts");
        service
            .ingest(&document, b"Water boils at one hundred degrees Celsius.".to_vec())
            .await
            .unwrap();
        let retrieved = service
            .retrieve(&document.id, "boiling point of water", None)
            .await
            .unwrap();
        let answer_id = AnswerId::new("answer");
        let (_, citations) = service
            .assign_citations(
                &answer_id,
                &document.id,
                "Water boils at one hundred degrees Celsius.",
                &retrieved,
            )
            .await
            .unwrap();
        assert_eq!(citations.len(), 1);

        service
            .ingest(&document, b"Ice melts at zero degrees Celsius.".to_vec())
            .await
            .unwrap();
        assert!(service.citations_for(&answer_id).is_empty());
    }

    #[tokio::test]
    async fn failed_reingest_keeps_the_cited_version() {
        let (service, failing) = switchable_service();
        let document = text_document("facts");
        service
            .ingest(&document, b"Water boils at one hundred degrees Celsius.".to_vec())
            .await
            .unwrap();
        let retrieved = service
            .retrieve(&document.id, "boiling point of water", None)
            .await
            .unwrap();
        let answer_id = AnswerId::new("answer");
        let (_, citations) = service
            .assign_citations(
                &answer_id,
                &document.id,
                "Water boils at one hundred degrees Celsius.",
                &retrieved,
            )
            .await
            .unwrap();
        assert_eq!(citations.len(), 1);

        failing.store(true, Ordering::SeqCst);
        let error = service
            .ingest(&document, b"Ice melts at zero degrees Celsius.".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            GroundingError::Index(IndexError::Embedding(_))
        ));

        assert_eq!(service.index_state(&document.id), Some(IndexState::Ready));
        let records = service.citations_for(&answer_id);
        assert_eq!(records.len(), 1);
        let passages = service.passages(&document.id).unwrap();
        for record in &records {
            assert!(
                passages
                    .iter()
                    .any(|passage| passage.id() == record.citation.passage_id)
            );
            assert!(service.resolve_highlight(&record.citation.passage_id, "").is_ok());
        }
        assert_eq!(passages[0].normalized_text, "Water boils at one hundred degrees Celsius.");

        failing.store(false, Ordering::SeqCst);
        let outcome = service
            .ingest(&document, b"Ice melts at zero degrees Celsius.".to_vec())
            .await
            .unwrap();
        assert!(!outcome.skipped_unchanged);
        assert!(service.citations_for(&answer_id).is_empty());
    }

    #[tokio::test]
    async fn failed_first_ingest_leaves_no_entry() {
        let (service, failing) = switchable_service();
        failing.store(true, Ordering::SeqCst);
        let document = text_document("fresh");
        assert!(
            service
                .ingest(&document, b"Never embedded.".to_vec())
                .await
                .is_err()
        );
        assert_eq!(service.index_state(&document.id), None);
        assert_eq!(service.metrics_snapshot().documents_ingested, 0);
    }

    #[tokio::test]
    async fn unknown_passages_are_reported() {
        let service = service();
        let error = service
            .resolve_highlight(&PassageId::new(DocumentId::new("none"), 0), "text")
            .unwrap_err();
        assert!(matches!(
            error,
            GroundingError::Highlight(HighlightError::UnknownPassage(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let service = service();
        service.shutdown();
        let error = service
            .ingest(&text_document("late"), b"Too late.".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(error, GroundingError::ShutDown));
    }
}
