//! Embedding providers used to vectorize passages, queries, and answer segments.
//!
//! Two backends are available:
//!
//! - [`LocalEmbeddingClient`]: deterministic hashed character n-gram model. It treats every
//!   script the same way (no stemming, no stop words, no language detection), so documents in
//!   any language are indexed and queried identically without network access.
//! - [`HttpEmbeddingClient`]: any OpenAI-compatible `/embeddings` endpoint, typically serving a
//!   multilingual model. Transient failures are retried with exponential backoff.

use crate::config::{Config, EmbeddingProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// Transport-level failure talking to a remote provider.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Remote provider answered with a payload we could not use.
    #[error("Embedding provider returned an invalid response: {0}")]
    InvalidResponse(String),
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient {
    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;
}

/// Embedding client shared between the index, the citation scorer, and ingestion jobs.
pub type SharedEmbeddingClient = Arc<dyn EmbeddingClient + Send + Sync>;

/// Cosine similarity of two vectors; `0.0` when either is empty, zero, or lengths differ.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut left_norm = 0.0_f32;
    let mut right_norm = 0.0_f32;
    for (a, b) in left.iter().zip(right) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Deterministic multilingual embedding client based on hashed character n-grams.
pub struct LocalEmbeddingClient {
    dimension: usize,
}

impl LocalEmbeddingClient {
    /// Construct a client producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Encode one text. Exposed for callers that need a synchronous embedding.
    pub fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];
        if self.dimension == 0 {
            return embedding;
        }

        for term in fold_terms(text) {
            let chars: Vec<char> = term.chars().collect();
            if chars.iter().all(|c| is_cjk(*c)) {
                // Scripts written without spaces: unigrams and bigrams carry the meaning.
                for c in &chars {
                    add_feature(&mut embedding, &c.to_string(), 1.0);
                }
                for pair in chars.windows(2) {
                    add_feature(&mut embedding, &pair.iter().collect::<String>(), 1.0);
                }
                continue;
            }

            add_feature(&mut embedding, &format!("w:{term}"), 1.0);
            let padded: Vec<char> = std::iter::once('^')
                .chain(chars.iter().copied())
                .chain(std::iter::once('$'))
                .collect();
            for gram in padded.windows(3) {
                add_feature(&mut embedding, &gram.iter().collect::<String>(), 0.5);
            }
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }
}

#[async_trait]
impl EmbeddingClient for LocalEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        tracing::trace!(texts = texts.len(), dimension = self.dimension, "Encoding locally");
        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}

/// Split text into case- and accent-folded terms.
///
/// Text is compatibility-normalized, lowercased, and stripped of combining marks; any
/// character that is neither alphanumeric nor a CJK ideograph separates terms.
pub fn fold_terms(text: &str) -> Vec<String> {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect();

    let mut terms = Vec::new();
    let mut current = String::new();
    let mut current_is_cjk = false;
    for c in folded.chars() {
        let cjk = is_cjk(c);
        if c.is_alphanumeric() || cjk {
            if !current.is_empty() && cjk != current_is_cjk {
                terms.push(std::mem::take(&mut current));
            }
            current_is_cjk = cjk;
            current.push(c);
        } else if !current.is_empty() {
            terms.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        terms.push(current);
    }
    terms
}

/// Ideographic and syllabic scripts that are written without word separators.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF | 0xF900..=0xFAFF
    )
}

fn add_feature(embedding: &mut [f32], feature: &str, weight: f32) {
    let hash = fnv1a(feature.as_bytes());
    let slot = (hash % embedding.len() as u64) as usize;
    // The next hash bit picks the sign so collisions tend to cancel instead of accumulate.
    let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    embedding[slot] += sign * weight;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// Number of attempts made against a remote provider before giving up.
const HTTP_ATTEMPTS: u32 = 3;

/// Client for OpenAI-compatible embedding endpoints.
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    initial_backoff: Duration,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl HttpEmbeddingClient {
    /// Build a client targeting `{base_url}/embeddings`.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, EmbeddingClientError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|err| EmbeddingClientError::GenerationFailed(format!("invalid url: {err}")))?;
        let endpoint = format!("{}/embeddings", parsed.as_str().trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .user_agent("citegrounder/0.1")
            .timeout(Duration::from_secs(60))
            .build()?;

        tracing::debug!(
            endpoint = %endpoint,
            has_api_key = api_key.as_deref().map(|key| !key.is_empty()).unwrap_or(false),
            "Initialized HTTP embedding client"
        );

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
            initial_backoff: Duration::from_millis(500),
        })
    }

    /// Override the delay before the first retry; later retries double it.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AttemptError> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AttemptError::Retryable(err.into()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let error = EmbeddingClientError::GenerationFailed(format!("status {status}: {body}"));
            return if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                Err(AttemptError::Retryable(error))
            } else {
                Err(AttemptError::Fatal(error))
            };
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| AttemptError::Fatal(EmbeddingClientError::InvalidResponse(err.to_string())))?;
        order_embeddings(parsed.data, texts.len()).map_err(AttemptError::Fatal)
    }
}

enum AttemptError {
    Retryable(EmbeddingClientError),
    Fatal(EmbeddingClientError),
}

fn order_embeddings(
    mut data: Vec<EmbeddingDatum>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
    if data.len() != expected {
        return Err(EmbeddingClientError::InvalidResponse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    if data.iter().all(|datum| datum.index.is_some()) {
        data.sort_by_key(|datum| datum.index);
    }
    Ok(data.into_iter().map(|datum| datum.embedding).collect())
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.request_once(&texts).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(AttemptError::Fatal(error)) => return Err(error),
                Err(AttemptError::Retryable(error)) if attempt >= HTTP_ATTEMPTS => {
                    return Err(error);
                }
                Err(AttemptError::Retryable(error)) => {
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Embedding request failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }
}

/// Build an embedding client suitable for the supplied configuration.
pub fn get_embedding_client(
    config: &Config,
) -> Result<SharedEmbeddingClient, EmbeddingClientError> {
    match config.embedding_provider {
        EmbeddingProvider::Local => Ok(Arc::new(LocalEmbeddingClient::new(
            config.embedding_dimension,
        ))),
        EmbeddingProvider::OpenAI => {
            let url = config.embedding_api_url.as_deref().ok_or_else(|| {
                EmbeddingClientError::GenerationFailed("EMBEDDING_API_URL is not set".to_string())
            })?;
            Ok(Arc::new(HttpEmbeddingClient::new(
                url,
                config.embedding_model.clone(),
                config.embedding_api_key.clone(),
            )?))
        }
    }
}
