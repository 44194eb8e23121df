use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Configuration was installed twice in the global cache.
    #[error("Configuration already initialized")]
    AlreadyInitialized,
}

/// Runtime configuration for the grounding engine.
///
/// Every threshold is tunable; the defaults are conservative values validated by the
/// scenario tests rather than numbers lifted from product copy.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Embedding provider used to vectorize passages and queries.
    pub embedding_provider: EmbeddingProvider,
    /// Embedding model identifier passed to the provider.
    pub embedding_model: String,
    /// Dimensionality of the produced vectors.
    pub embedding_dimension: usize,
    /// Base URL of an OpenAI-compatible embeddings API.
    pub embedding_api_url: Option<String>,
    /// Optional bearer token for the embeddings API.
    pub embedding_api_key: Option<String>,
    /// Number of passages embedded per provider call.
    pub embedding_batch_size: usize,
    /// Maximum number of embedding batches in flight for one document.
    pub embedding_concurrency: usize,
    /// Default number of passages returned by retrieval.
    pub retrieval_top_k: usize,
    /// Upper bound applied to caller-supplied `k`.
    pub retrieval_max_top_k: usize,
    /// Minimum groundedness a segment needs before it may cite a passage.
    pub groundedness_threshold: f32,
    /// Word floor of the shrinking-window snippet matcher.
    pub snippet_min_words: usize,
    /// Maximum number of windows the matcher may try.
    pub snippet_max_attempts: usize,
    /// Wall-clock budget for one highlight resolution, in milliseconds.
    pub snippet_time_budget_ms: u64,
    /// Token budget of a single passage.
    pub passage_max_tokens: usize,
    /// Tokenizer used to measure passages (`cl100k_base`, `o200k_base`, `whitespace`, ...).
    pub passage_tokenizer: String,
    /// Number of documents ingested concurrently.
    pub ingest_workers: usize,
    /// Timeout for fetching web sources, in seconds.
    pub web_fetch_timeout_secs: u64,
    /// Maximum accepted size of a fetched web source.
    pub web_max_bytes: usize,
}

/// Supported embedding backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic in-process character n-gram model.
    Local,
    /// OpenAI-compatible HTTP embeddings endpoint.
    OpenAI,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding_provider: EmbeddingProvider::Local,
            embedding_model: "local-ngram".to_string(),
            embedding_dimension: 384,
            embedding_api_url: None,
            embedding_api_key: None,
            embedding_batch_size: 32,
            embedding_concurrency: 4,
            retrieval_top_k: 5,
            retrieval_max_top_k: 50,
            groundedness_threshold: 0.5,
            snippet_min_words: 8,
            snippet_max_attempts: 256,
            snippet_time_budget_ms: 25,
            passage_max_tokens: 300,
            passage_tokenizer: "cl100k_base".to_string(),
            ingest_workers: 4,
            web_fetch_timeout_secs: 30,
            web_max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            embedding_provider: parse_optional("EMBEDDING_PROVIDER")?
                .unwrap_or(defaults.embedding_provider),
            embedding_model: load_env_optional("EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            embedding_dimension: parse_optional("EMBEDDING_DIMENSION")?
                .unwrap_or(defaults.embedding_dimension),
            embedding_api_url: load_env_optional("EMBEDDING_API_URL"),
            embedding_api_key: load_env_optional("EMBEDDING_API_KEY"),
            embedding_batch_size: parse_optional("EMBEDDING_BATCH_SIZE")?
                .unwrap_or(defaults.embedding_batch_size),
            embedding_concurrency: parse_optional("EMBEDDING_CONCURRENCY")?
                .unwrap_or(defaults.embedding_concurrency),
            retrieval_top_k: parse_optional("RETRIEVAL_TOP_K")?
                .unwrap_or(defaults.retrieval_top_k),
            retrieval_max_top_k: parse_optional("RETRIEVAL_MAX_TOP_K")?
                .unwrap_or(defaults.retrieval_max_top_k),
            groundedness_threshold: parse_optional("GROUNDEDNESS_THRESHOLD")?
                .unwrap_or(defaults.groundedness_threshold),
            snippet_min_words: parse_optional("SNIPPET_MIN_WORDS")?
                .unwrap_or(defaults.snippet_min_words),
            snippet_max_attempts: parse_optional("SNIPPET_MAX_ATTEMPTS")?
                .unwrap_or(defaults.snippet_max_attempts),
            snippet_time_budget_ms: parse_optional("SNIPPET_TIME_BUDGET_MS")?
                .unwrap_or(defaults.snippet_time_budget_ms),
            passage_max_tokens: parse_optional("PASSAGE_MAX_TOKENS")?
                .unwrap_or(defaults.passage_max_tokens),
            passage_tokenizer: load_env_optional("PASSAGE_TOKENIZER")
                .unwrap_or(defaults.passage_tokenizer),
            ingest_workers: parse_optional("INGEST_WORKERS")?.unwrap_or(defaults.ingest_workers),
            web_fetch_timeout_secs: parse_optional("WEB_FETCH_TIMEOUT_SECS")?
                .unwrap_or(defaults.web_fetch_timeout_secs),
            web_max_bytes: parse_optional("WEB_MAX_BYTES")?.unwrap_or(defaults.web_max_bytes),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_DIMENSION".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(ConfigError::InvalidValue("EMBEDDING_BATCH_SIZE".into()));
        }
        if self.passage_max_tokens == 0 {
            return Err(ConfigError::InvalidValue("PASSAGE_MAX_TOKENS".into()));
        }
        if !(0.0..=1.0).contains(&self.groundedness_threshold) {
            return Err(ConfigError::InvalidValue("GROUNDEDNESS_THRESHOLD".into()));
        }
        if self.ingest_workers == 0 {
            return Err(ConfigError::InvalidValue("INGEST_WORKERS".into()));
        }
        if self.retrieval_max_top_k == 0 {
            return Err(ConfigError::InvalidValue("RETRIEVAL_MAX_TOP_K".into()));
        }
        if self.embedding_provider == EmbeddingProvider::OpenAI && self.embedding_api_url.is_none()
        {
            return Err(ConfigError::InvalidValue("EMBEDDING_API_URL".into()));
        }
        Ok(())
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_optional<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

impl FromStr for EmbeddingProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "openai" => Ok(Self::OpenAI),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, if [`init_config`] has run.
pub fn get_config() -> Option<&'static Config> {
    CONFIG.get()
}

/// Load configuration from `.env` and the environment and install it in the global cache.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        embedding_provider = ?config.embedding_provider,
        model = %config.embedding_model,
        dimension = config.embedding_dimension,
        top_k = config.retrieval_top_k,
        groundedness_threshold = config.groundedness_threshold,
        "Loaded configuration"
    );
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    CONFIG.get().ok_or(ConfigError::AlreadyInitialized)
}
