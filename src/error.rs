//! Error taxonomy for the ingestion pipeline.
//!
//! Three tiers, mirrored by how each error is handled:
//!
//! * **Transient** — retried with exponential backoff at the stage where they
//!   occur (fetch, embed). After the retry budget is spent they are demoted
//!   to a permanent per-document failure.
//! * **Permanent** — short-circuit the remaining stages for that document,
//!   trigger rollback of anything already persisted for it, and end up in
//!   [`DocumentResult::error_message`](crate::model::DocumentResult).
//! * **Fatal** — [`IngestError`]: resource initialization failures that abort
//!   the whole run before streaming begins.

use thiserror::Error;

/// Errors from the document retrieval collaborator.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The source registry has no document under this id. Permanent.
    #[error("document not found: {id}")]
    NotFound { id: String },

    /// Network-level failure (timeout, reset, 5xx). Retryable.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The payload arrived but cannot be interpreted. Permanent.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Errors from the enrichment provider or the cache backing it.
#[derive(Debug, Clone, Error)]
pub enum EmbedError {
    /// Timeout, connection error, or provider throttle response. Retryable.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// The provider rejected the input itself. Permanent, never retried.
    #[error("embedding input rejected: {0}")]
    Rejected(String),

    /// The cache store failed while reading or writing. Permanent.
    #[error("embedding cache storage failure: {0}")]
    Storage(String),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Transient(_))
    }
}

/// Errors from the graph store collaborator.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("graph store failure: {0}")]
    Storage(String),

    /// A lookup referenced a unit that does not exist.
    #[error("unknown unit id: {0}")]
    UnknownUnit(i64),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Per-document failure, tagged with the stage that produced it.
///
/// These never abort the batch; they are folded into a failed
/// [`DocumentResult`](crate::model::DocumentResult) for the document.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("enrichment failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("persist failed: {0}")]
    Store(#[from] StoreError),

    #[error("duplicate submission")]
    Duplicate,

    #[error("run cancelled before the document completed")]
    Cancelled,
}

impl StageError {
    /// Name of the pipeline stage the failure belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            StageError::Fetch(_) | StageError::Parse(_) => "parse",
            StageError::Embed(_) => "enrich",
            StageError::Store(_) => "persist",
            StageError::Duplicate | StageError::Cancelled => "orchestrator",
        }
    }
}

/// Run-level failures. Anything here aborts the batch outright.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A shared resource (store connection, cache, provider) could not be
    /// constructed. Nothing has streamed yet when this is raised.
    #[error("resource initialization failed: {0}")]
    ResourceInit(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker task panicked: {0}")]
    Join(String),

    #[error("report serialization failed: {0}")]
    Report(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
