//! ```text
//! document ids ──► parse::ParseStage ──► model::ParsedDocument
//!                      │ fetch::DocumentFetcher
//!                      ▼
//!              enrich::EnrichStage ──► model::EnrichedDocument
//!                      │ cache::EnrichmentCache
//!                      │ limiter::SlidingWindowRateLimiter
//!                      │ embeddings::EmbeddingProvider
//!                      ▼
//!              persist::PersistStage ──► model::DocumentResult
//!                      │ persist::GraphStore
//!                      │ context::IngestionContext (rollback ledger)
//!                      ▼
//!       orchestrator::Orchestrator ──► model::BatchReport
//!                      └─► linker::ReferenceLinker (post-batch pass)
//! ```
//!
pub mod cache;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod limiter;
pub mod linker;
pub mod model;
pub mod orchestrator;
pub mod parse;
pub mod persist;
pub mod resources;

pub use cache::{EnrichmentCache, MemoryVectorCache, SqliteVectorCache, VectorCache};
pub use config::{IngestionConfig, RetryPolicy};
pub use context::IngestionContext;
pub use embeddings::{EmbeddingProvider, HttpEmbeddings, SimulatedEmbeddings};
pub use error::{EmbedError, FetchError, IngestError, StageError, StoreError};
pub use fetch::{DocumentFetcher, FixtureFetcher, HttpFetcher};
pub use limiter::SlidingWindowRateLimiter;
pub use linker::ReferenceLinker;
pub use model::{BatchReport, DocumentResult, EnrichedDocument, ParsedDocument};
pub use orchestrator::{CancelHandle, Orchestrator};
pub use persist::{GraphStore, MemoryGraphStore, PersistStage, SqliteGraphStore};
pub use resources::ResourceManager;
