//! Shared singletons for one ingestion run.
//!
//! The [`ResourceManager`] owns the store connection, embedding cache,
//! provider, rate limiter, and fetcher that every worker shares. Any
//! failure here aborts the run before streaming starts; there is no
//! per-document degradation for a missing store or provider.
//!
//! It also preloads the shared dictionaries (subject areas, issuing
//! bodies, normative ranks) exactly once, before any worker runs, so
//! concurrent documents never race to create the same reference node.

use std::sync::Arc;

use tracing::info;

use crate::cache::{EnrichmentCache, MemoryVectorCache, SqliteVectorCache, VectorCache};
use crate::config::IngestionConfig;
use crate::context::IngestionContext;
use crate::embeddings::{EmbeddingProvider, HttpEmbeddings, SimulatedEmbeddings};
use crate::error::IngestError;
use crate::fetch::{DocumentFetcher, HttpFetcher};
use crate::limiter::SlidingWindowRateLimiter;
use crate::linker::ReferenceLinker;
use crate::model::DictionaryStats;
use crate::persist::{GraphStore, SqliteGraphStore};

const SUBJECT_AREAS: &[&str] = &[
    "administrative law",
    "civil law",
    "commercial law",
    "constitutional law",
    "contracts",
    "criminal law",
    "environmental law",
    "family law",
    "labor law",
    "obligations",
    "procedure",
    "property",
    "tax law",
];

const ISSUING_BODIES: &[&str] = &[
    "national assembly",
    "ministry of justice",
    "ministry of finance",
    "constitutional court",
    "supreme court",
    "council of state",
];

const RANKS: &[&str] = &[
    "constitution",
    "organic law",
    "ordinary law",
    "decree",
    "regulation",
    "resolution",
];

pub struct ResourceManager {
    pub store: Arc<dyn GraphStore>,
    pub cache: Arc<EnrichmentCache>,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub limiter: Arc<SlidingWindowRateLimiter>,
    pub fetcher: Arc<dyn DocumentFetcher>,
    pub context: Arc<IngestionContext>,
}

impl ResourceManager {
    /// Open real backends per the configuration. Any failure is
    /// unrecoverable for the run.
    pub async fn initialize(config: &IngestionConfig) -> Result<Self, IngestError> {
        if let Some(parent) = config.store_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let store = SqliteGraphStore::open(&config.store_path)
            .await
            .map_err(|err| IngestError::ResourceInit(format!("graph store: {err}")))?;

        let vector_cache: Arc<dyn VectorCache> = if config.simulate_embeddings {
            // Simulation should not pollute the persistent cache.
            Arc::new(MemoryVectorCache::new())
        } else {
            Arc::new(
                SqliteVectorCache::open(&config.cache_path)
                    .await
                    .map_err(|err| IngestError::ResourceInit(format!("vector cache: {err}")))?,
            )
        };

        let provider: Arc<dyn EmbeddingProvider> = if config.simulate_embeddings {
            Arc::new(SimulatedEmbeddings::new(config.embedding_dimensions))
        } else {
            Arc::new(
                HttpEmbeddings::new(
                    &config.embedding_endpoint,
                    config.embedding_model.clone(),
                    config.embedding_dimensions,
                )
                .map_err(|err| {
                    IngestError::ResourceInit(format!("embedding provider: {err}"))
                })?,
            )
        };

        let fetcher = HttpFetcher::new(&config.fetch_base_url)
            .map_err(|err| IngestError::ResourceInit(format!("fetcher: {err}")))?;

        Ok(Self::assemble(
            Arc::new(store),
            vector_cache,
            provider,
            Arc::new(fetcher),
            config,
        ))
    }

    /// Wire injected collaborators (tests, embedded use).
    pub fn with_collaborators(
        store: Arc<dyn GraphStore>,
        vector_cache: Arc<dyn VectorCache>,
        provider: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn DocumentFetcher>,
        config: &IngestionConfig,
    ) -> Self {
        Self::assemble(store, vector_cache, provider, fetcher, config)
    }

    fn assemble(
        store: Arc<dyn GraphStore>,
        vector_cache: Arc<dyn VectorCache>,
        provider: Arc<dyn EmbeddingProvider>,
        fetcher: Arc<dyn DocumentFetcher>,
        config: &IngestionConfig,
    ) -> Self {
        Self {
            store,
            cache: Arc::new(EnrichmentCache::new(vector_cache)),
            provider,
            limiter: Arc::new(SlidingWindowRateLimiter::new(
                config.rate_limit.max_units,
                config.rate_limit.window,
            )),
            fetcher,
            context: Arc::new(IngestionContext::new()),
        }
    }

    /// Merge the shared dictionaries, insert-if-absent. Runs before
    /// streaming so no two documents race to create a subject node.
    pub async fn preload_dictionaries(&self) -> Result<DictionaryStats, IngestError> {
        let stats = DictionaryStats {
            subject_areas: self
                .store
                .merge_dictionary("subject_area", SUBJECT_AREAS)
                .await?,
            issuing_bodies: self
                .store
                .merge_dictionary("issuing_body", ISSUING_BODIES)
                .await?,
            ranks: self.store.merge_dictionary("rank", RANKS).await?,
        };
        info!(
            subject_areas = stats.subject_areas,
            issuing_bodies = stats.issuing_bodies,
            ranks = stats.ranks,
            "dictionaries preloaded"
        );
        Ok(stats)
    }

    /// Drop the derived vector index before a batch of writes.
    pub async fn prepare_store(&self) -> Result<(), IngestError> {
        self.store.drop_vector_index().await?;
        Ok(())
    }

    /// Rebuild the index once the batch has drained.
    pub async fn finalize_store(&self) -> Result<usize, IngestError> {
        let indexed = self.store.rebuild_vector_index().await?;
        info!(indexed, "vector index rebuilt");
        Ok(indexed)
    }

    pub fn linker(&self) -> ReferenceLinker {
        ReferenceLinker::new(Arc::clone(&self.store))
    }
}
