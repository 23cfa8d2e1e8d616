//! Pipeline configuration.
//!
//! A plain struct with sensible defaults, environment overrides via
//! `LEXGRAPH_*` variables, and `#[must_use]` builder setters for
//! programmatic construction.

use std::path::PathBuf;
use std::time::Duration;

/// Sliding-window rate limiter settings for the enrichment provider.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Maximum admitted units per window.
    pub max_units: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_units: 3000,
            window: Duration::from_secs(60),
        }
    }
}

/// Retry policy for transient fetch/embed failures.
///
/// Delays double on each attempt: `base_delay`, `2 * base_delay`, ...
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retrying after the given (zero-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Top-level configuration for one ingestion run.
#[derive(Clone, Debug)]
pub struct IngestionConfig {
    /// Parse (fetch + tree build) pool size. CPU/IO bound, low concurrency.
    pub parse_workers: usize,
    /// Enrich pool size. Latency bound, highest concurrency.
    pub enrich_workers: usize,
    /// Persist pool size. Disk bound, low concurrency.
    pub persist_workers: usize,
    /// Capacity of each inter-stage channel. Full channels block upstream
    /// producers, bounding memory under document-size skew.
    pub channel_capacity: usize,
    /// Leaf count above which a document is enriched with scatter/gather.
    /// Also the partition size for each scattered task.
    pub scatter_chunk_size: usize,
    /// Pass documents through the enrich stage without computing vectors.
    pub skip_embeddings: bool,
    /// Bypass the cache and use deterministic fake vectors (stress mode).
    pub simulate_embeddings: bool,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    /// Path of the sqlite embedding cache.
    pub cache_path: PathBuf,
    /// Path of the sqlite graph store.
    pub store_path: PathBuf,
    /// Base URL documents are fetched from.
    pub fetch_base_url: String,
    /// Embedding provider endpoint.
    pub embedding_endpoint: String,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            parse_workers: 4,
            enrich_workers: 16,
            persist_workers: 2,
            channel_capacity: 50,
            scatter_chunk_size: 500,
            skip_embeddings: false,
            simulate_embeddings: false,
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            cache_path: PathBuf::from("data/embeddings_cache.db"),
            store_path: PathBuf::from("data/lexgraph.db"),
            fetch_base_url: "https://localhost:8443/documents/".to_string(),
            embedding_endpoint: "https://localhost:8443/embed".to_string(),
            embedding_model: "lex-embed-001".to_string(),
            embedding_dimensions: 768,
        }
    }
}

impl IngestionConfig {
    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// Recognized variables: `LEXGRAPH_PARSE_WORKERS`,
    /// `LEXGRAPH_ENRICH_WORKERS`, `LEXGRAPH_PERSIST_WORKERS`,
    /// `LEXGRAPH_CHANNEL_CAPACITY`, `LEXGRAPH_SCATTER_CHUNK_SIZE`,
    /// `LEXGRAPH_RATE_MAX_UNITS`, `LEXGRAPH_RATE_WINDOW_SECS`,
    /// `LEXGRAPH_CACHE_PATH`, `LEXGRAPH_STORE_PATH`,
    /// `LEXGRAPH_FETCH_BASE_URL`, `LEXGRAPH_EMBED_ENDPOINT`,
    /// `LEXGRAPH_EMBED_MODEL`, `LEXGRAPH_EMBED_DIMENSIONS`.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(n) = env_usize("LEXGRAPH_PARSE_WORKERS") {
            config.parse_workers = n;
        }
        if let Some(n) = env_usize("LEXGRAPH_ENRICH_WORKERS") {
            config.enrich_workers = n;
        }
        if let Some(n) = env_usize("LEXGRAPH_PERSIST_WORKERS") {
            config.persist_workers = n;
        }
        if let Some(n) = env_usize("LEXGRAPH_CHANNEL_CAPACITY") {
            config.channel_capacity = n;
        }
        if let Some(n) = env_usize("LEXGRAPH_SCATTER_CHUNK_SIZE") {
            config.scatter_chunk_size = n;
        }
        if let Some(n) = env_usize("LEXGRAPH_RATE_MAX_UNITS") {
            config.rate_limit.max_units = n as u32;
        }
        if let Some(n) = env_usize("LEXGRAPH_RATE_WINDOW_SECS") {
            config.rate_limit.window = Duration::from_secs(n as u64);
        }
        if let Ok(path) = std::env::var("LEXGRAPH_CACHE_PATH") {
            config.cache_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("LEXGRAPH_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Ok(url) = std::env::var("LEXGRAPH_FETCH_BASE_URL") {
            config.fetch_base_url = url;
        }
        if let Ok(url) = std::env::var("LEXGRAPH_EMBED_ENDPOINT") {
            config.embedding_endpoint = url;
        }
        if let Ok(model) = std::env::var("LEXGRAPH_EMBED_MODEL") {
            config.embedding_model = model;
        }
        if let Some(n) = env_usize("LEXGRAPH_EMBED_DIMENSIONS") {
            config.embedding_dimensions = n;
        }
        config
    }

    #[must_use]
    pub fn with_pool_sizes(mut self, parse: usize, enrich: usize, persist: usize) -> Self {
        self.parse_workers = parse.max(1);
        self.enrich_workers = enrich.max(1);
        self.persist_workers = persist.max(1);
        self
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_scatter_chunk_size(mut self, size: usize) -> Self {
        self.scatter_chunk_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, max_units: u32, window: Duration) -> Self {
        self.rate_limit = RateLimitConfig { max_units, window };
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_skip_embeddings(mut self, skip: bool) -> Self {
        self.skip_embeddings = skip;
        self
    }

    #[must_use]
    pub fn with_simulated_embeddings(mut self, simulate: bool) -> Self {
        self.simulate_embeddings = simulate;
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
