//! Content-addressed embedding cache with single-flight computation.
//!
//! Keys are sha256 digests of whitespace-normalized text, so a unit
//! keeps its cached vector across re-parses that only reshuffle
//! spacing. The persistent backend is sqlite in WAL mode; a map-backed
//! implementation serves tests.
//!
//! [`EnrichmentCache`] layers per-key single-flight on top of a
//! [`VectorCache`]: concurrent requests for the same digest compute the
//! vector once and share the result.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use tokio_rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::EmbedError;

/// Digest of normalized content, used as the cache key.
///
/// Whitespace runs collapse to a single space and the result is
/// trimmed before hashing.
pub fn content_hash(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                normalized.push(' ');
                last_was_space = true;
            }
        } else {
            normalized.push(ch);
            last_was_space = false;
        }
    }
    let normalized = normalized.trim_end();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Persistent key → vector store.
#[async_trait]
pub trait VectorCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, EmbedError>;
    /// Insert-if-absent. An existing entry for `key` is left untouched.
    async fn insert(&self, key: &str, vector: &[f32]) -> Result<(), EmbedError>;
    async fn len(&self) -> Result<usize, EmbedError>;
}

/// Sqlite-backed cache, safe for concurrent access through WAL mode.
pub struct SqliteVectorCache {
    conn: Connection,
}

impl SqliteVectorCache {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, EmbedError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(|err| EmbedError::Storage(err.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 CREATE TABLE IF NOT EXISTS embedding_cache (
                     key        TEXT PRIMARY KEY,
                     vector     BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );",
            )
            .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await
        .map_err(|err| EmbedError::Storage(err.to_string()))?;
        Ok(Self { conn })
    }
}

pub(crate) fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn unpack_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl VectorCache for SqliteVectorCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, EmbedError> {
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let blob = conn
                    .query_row(
                        "SELECT vector FROM embedding_cache WHERE key = ?",
                        [&key],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(blob.map(|blob| unpack_vector(&blob)))
            })
            .await
            .map_err(|err| EmbedError::Storage(err.to_string()))
    }

    async fn insert(&self, key: &str, vector: &[f32]) -> Result<(), EmbedError> {
        let key = key.to_string();
        let blob = pack_vector(vector);
        let created_at = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO embedding_cache (key, vector, created_at)
                     VALUES (?, ?, ?)",
                    (&key, &blob, &created_at),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| EmbedError::Storage(err.to_string()))
    }

    async fn len(&self) -> Result<usize, EmbedError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM embedding_cache", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(|err| EmbedError::Storage(err.to_string()))
    }
}

/// In-memory cache for tests and simulation runs.
#[derive(Default)]
pub struct MemoryVectorCache {
    entries: parking_lot::RwLock<FxHashMap<String, Vec<f32>>>,
}

impl MemoryVectorCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorCache for MemoryVectorCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<f32>>, EmbedError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn insert(&self, key: &str, vector: &[f32]) -> Result<(), EmbedError> {
        self.entries
            .write()
            .entry(key.to_string())
            .or_insert_with(|| vector.to_vec());
        Ok(())
    }

    async fn len(&self) -> Result<usize, EmbedError> {
        Ok(self.entries.read().len())
    }
}

/// Whether a vector came from the cache or from a fresh computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Computed,
}

/// Single-flight front over a [`VectorCache`].
pub struct EnrichmentCache {
    store: Arc<dyn VectorCache>,
    inflight: parking_lot::Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    hits: AtomicUsize,
    computed: AtomicUsize,
}

impl EnrichmentCache {
    pub fn new(store: Arc<dyn VectorCache>) -> Self {
        Self {
            store,
            inflight: parking_lot::Mutex::new(FxHashMap::default()),
            hits: AtomicUsize::new(0),
            computed: AtomicUsize::new(0),
        }
    }

    /// Return the cached vector for `text`, or run `compute` exactly
    /// once across all concurrent callers with the same content hash.
    pub async fn get_or_compute<F, Fut>(
        &self,
        text: &str,
        compute: F,
    ) -> Result<(Vec<f32>, CacheStatus), EmbedError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<f32>, EmbedError>>,
    {
        let key = content_hash(text);

        if let Some(vector) = self.store.get(&key).await? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((vector, CacheStatus::Hit));
        }

        let gate = {
            let mut inflight = self.inflight.lock();
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = gate.lock().await;

        // A concurrent holder may have filled the entry while we waited.
        if let Some(vector) = self.store.get(&key).await? {
            self.release_gate(&key, &gate);
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok((vector, CacheStatus::Hit));
        }

        match compute().await {
            Ok(vector) => {
                self.store.insert(&key, &vector).await?;
                self.release_gate(&key, &gate);
                self.computed.fetch_add(1, Ordering::Relaxed);
                debug!(key = %&key[..12], dimensions = vector.len(), "cached new vector");
                Ok((vector, CacheStatus::Computed))
            }
            Err(error) => {
                self.release_gate(&key, &gate);
                Err(error)
            }
        }
    }

    /// Total hits and fresh computations since construction.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.computed.load(Ordering::Relaxed),
        )
    }

    pub async fn persisted_entries(&self) -> Result<usize, EmbedError> {
        self.store.len().await
    }

    fn release_gate(&self, key: &str, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock();
        // Remove the entry once no other caller still holds a clone, so
        // late arrivals fall through to a plain store lookup.
        if let Some(current) = inflight.get(key) {
            if Arc::ptr_eq(current, gate) && Arc::strong_count(current) <= 2 {
                inflight.remove(key);
            }
        }
    }
}
