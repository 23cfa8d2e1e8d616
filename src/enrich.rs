//! Enrich stage: attach an embedding vector to every leaf.
//!
//! The embedding input for a leaf is deterministic given the tree:
//!
//! ```text
//! Context: {structural path, root excluded}
//! Article: {label}
//! Status: {validity}          <- only when the source declares one
//! Content:
//! {body}
//! ```
//!
//! Small documents enrich their leaves inline on the worker task. When
//! the leaf count exceeds the scatter threshold, leaves are partitioned
//! into fixed-size chunks processed concurrently; each chunk task owns
//! a disjoint set of node ids and the gather step writes vectors back
//! through those exclusive ids, so no two tasks ever touch one leaf.
//!
//! Any leaf failing after retries fails the whole document. Vectors
//! already cached for its other leaves stay in the cache, so a re-run
//! only recomputes the leaf that failed.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheStatus, EnrichmentCache};
use crate::config::RetryPolicy;
use crate::embeddings::EmbeddingProvider;
use crate::error::{EmbedError, StageError};
use crate::limiter::SlidingWindowRateLimiter;
use crate::model::tree::NodeId;
use crate::model::{EnrichedDocument, ParsedDocument};

pub struct EnrichStage {
    cache: Arc<EnrichmentCache>,
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<SlidingWindowRateLimiter>,
    scatter_chunk_size: usize,
    retry: RetryPolicy,
    skip_embeddings: bool,
    simulate: bool,
}

impl EnrichStage {
    pub fn new(
        cache: Arc<EnrichmentCache>,
        provider: Arc<dyn EmbeddingProvider>,
        limiter: Arc<SlidingWindowRateLimiter>,
        scatter_chunk_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            cache,
            provider,
            limiter,
            scatter_chunk_size: scatter_chunk_size.max(1),
            retry,
            skip_embeddings: false,
            simulate: false,
        }
    }

    /// Pass documents through without computing vectors.
    #[must_use]
    pub fn with_skip_embeddings(mut self, skip: bool) -> Self {
        self.skip_embeddings = skip;
        self
    }

    /// Bypass the cache so every leaf exercises the limiter + provider
    /// path (stress mode; pair with a deterministic provider).
    #[must_use]
    pub fn with_simulation(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    #[instrument(skip_all, fields(document_id = %parsed.document_id))]
    pub async fn process(&self, mut parsed: ParsedDocument) -> Result<EnrichedDocument, StageError> {
        let started = Instant::now();

        if self.skip_embeddings {
            return Ok(EnrichedDocument {
                parsed,
                embed_duration: started.elapsed(),
                cache_hits: 0,
                embeddings_computed: 0,
                embeddings_skipped: true,
            });
        }

        let leaves = parsed.tree.leaves();
        let results = if leaves.len() > self.scatter_chunk_size {
            self.scatter_gather(&parsed, &leaves).await?
        } else {
            let mut out = Vec::with_capacity(leaves.len());
            for &id in &leaves {
                let input = embedding_input(&parsed, id);
                let (vector, status) = self.embed_one(&input).await?;
                out.push((id, vector, status));
            }
            out
        };

        let mut cache_hits = 0;
        let mut computed = 0;
        for (id, vector, status) in results {
            match status {
                CacheStatus::Hit => cache_hits += 1,
                CacheStatus::Computed => computed += 1,
            }
            parsed.tree.node_mut(id).vector = Some(vector);
        }

        // Terminal-state invariant: every leaf carries a vector.
        debug_assert!(
            parsed
                .tree
                .leaves()
                .iter()
                .all(|&id| parsed.tree.node(id).vector.is_some())
        );

        debug!(
            leaves = leaves.len(),
            cache_hits, computed, "document enriched"
        );
        Ok(EnrichedDocument {
            parsed,
            embed_duration: started.elapsed(),
            cache_hits,
            embeddings_computed: computed,
            embeddings_skipped: false,
        })
    }

    /// Partition leaves into chunks, embed chunks concurrently, gather.
    async fn scatter_gather(
        &self,
        parsed: &ParsedDocument,
        leaves: &[NodeId],
    ) -> Result<Vec<(NodeId, Vec<f32>, CacheStatus)>, StageError> {
        let mut join_set = JoinSet::new();
        for chunk in leaves.chunks(self.scatter_chunk_size) {
            // Each task receives only the (id, input) pairs of its own
            // partition; writes later go through these exclusive ids.
            let inputs: Vec<(NodeId, String)> = chunk
                .iter()
                .map(|&id| (id, embedding_input(parsed, id)))
                .collect();
            let stage = self.clone_handles();
            join_set.spawn(async move {
                let mut out = Vec::with_capacity(inputs.len());
                for (id, input) in inputs {
                    let (vector, status) = stage.embed_one(&input).await?;
                    out.push((id, vector, status));
                }
                Ok::<_, StageError>(out)
            });
        }

        let mut gathered = Vec::with_capacity(leaves.len());
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(chunk)) => gathered.extend(chunk),
                Ok(Err(err)) => {
                    // Let remaining chunks finish so their cache inserts
                    // land, then fail the document.
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(StageError::Embed(EmbedError::Transient(
                            join_err.to_string(),
                        )));
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(gathered),
        }
    }

    /// Cheap clone of the shared handles for a scattered task.
    fn clone_handles(&self) -> EnrichTask {
        EnrichTask {
            cache: Arc::clone(&self.cache),
            provider: Arc::clone(&self.provider),
            limiter: Arc::clone(&self.limiter),
            retry: self.retry,
            simulate: self.simulate,
        }
    }

    async fn embed_one(&self, input: &str) -> Result<(Vec<f32>, CacheStatus), StageError> {
        self.clone_handles().embed_one(input).await
    }
}

struct EnrichTask {
    cache: Arc<EnrichmentCache>,
    provider: Arc<dyn EmbeddingProvider>,
    limiter: Arc<SlidingWindowRateLimiter>,
    retry: RetryPolicy,
    simulate: bool,
}

impl EnrichTask {
    async fn embed_one(&self, input: &str) -> Result<(Vec<f32>, CacheStatus), StageError> {
        if self.simulate {
            let vector = self.call_with_retry(input).await?;
            return Ok((vector, CacheStatus::Computed));
        }
        let provider = Arc::clone(&self.provider);
        let limiter = Arc::clone(&self.limiter);
        let retry = self.retry;
        let result = self
            .cache
            .get_or_compute(input, || async move {
                call_with_retry(&*provider, &limiter, retry, input).await
            })
            .await?;
        Ok(result)
    }

    async fn call_with_retry(&self, input: &str) -> Result<Vec<f32>, EmbedError> {
        call_with_retry(&*self.provider, &self.limiter, self.retry, input).await
    }
}

/// Rate-limited provider call with backoff on transient failures.
async fn call_with_retry(
    provider: &dyn EmbeddingProvider,
    limiter: &SlidingWindowRateLimiter,
    retry: RetryPolicy,
    input: &str,
) -> Result<Vec<f32>, EmbedError> {
    let mut attempt = 0u32;
    loop {
        limiter.acquire(1).await;
        match provider.embed(input).await {
            Ok(vector) => return Ok(vector),
            Err(err) if err.is_transient() && attempt + 1 < retry.max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient embedding failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deterministic embedding input for one leaf.
///
/// Deliberately excludes the document id and title: two documents
/// carrying an identical article at the same structural position
/// produce the same input, so the second one is a cache hit instead of
/// a second provider call.
pub fn embedding_input(parsed: &ParsedDocument, id: NodeId) -> String {
    let node = parsed.tree.node(id);
    let mut input = format!(
        "Context: {}\nArticle: {}\n",
        parsed.tree.structural_path(id),
        node.label,
    );
    if let Some(validity) = node.validity {
        input.push_str("Status: ");
        input.push_str(validity.as_str());
        input.push('\n');
    }
    input.push_str("Content:\n");
    input.push_str(&node.text);
    input
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::MemoryVectorCache;
    use crate::embeddings::SimulatedEmbeddings;
    use crate::parse::OutlineParser;

    fn stage_with(provider: Arc<dyn EmbeddingProvider>, chunk_size: usize) -> EnrichStage {
        EnrichStage::new(
            Arc::new(EnrichmentCache::new(Arc::new(MemoryVectorCache::new()))),
            provider,
            Arc::new(SlidingWindowRateLimiter::new(10_000, Duration::from_secs(1))),
            chunk_size,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    fn large_document(leaves: usize) -> ParsedDocument {
        let mut body = String::from("Big Code\n");
        for n in 1..=leaves {
            body.push_str(&format!("Article {n}\nBody of article {n}.\n"));
        }
        OutlineParser::new().parse("LAW-BIG", &body).unwrap()
    }

    struct CountingProvider {
        inner: SimulatedEmbeddings,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model(&self) -> &str {
            "counting"
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Rejected("no service".into()))
        }

        fn dimensions(&self) -> usize {
            8
        }

        fn model(&self) -> &str {
            "failing"
        }
    }

    /// Fails transiently the first `failures` calls, then delegates.
    struct FlakyProvider {
        inner: SimulatedEmbeddings,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyProvider {
        fn new(failures: usize) -> Self {
            Self {
                inner: SimulatedEmbeddings::new(8),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EmbedError::Transient("throttled".into()));
            }
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn transient_provider_failures_are_retried_to_success() {
        // One leaf, one transient failure, two-attempt budget.
        let provider = Arc::new(FlakyProvider::new(1));
        let stage = stage_with(provider.clone(), 500);
        let enriched = stage.process(large_document(1)).await.unwrap();
        assert_eq!(enriched.embeddings_computed, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_embed_retries_fail_the_document() {
        // Two transient failures exceed the two-attempt budget.
        let provider = Arc::new(FlakyProvider::new(2));
        let stage = stage_with(provider.clone(), 500);
        let err = stage.process(large_document(1)).await.unwrap_err();
        assert!(matches!(err, StageError::Embed(EmbedError::Transient(_))));
        assert_eq!(err.stage(), "enrich");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn every_leaf_gets_a_vector() {
        let stage = stage_with(Arc::new(SimulatedEmbeddings::new(16)), 500);
        let enriched = stage.process(large_document(20)).await.unwrap();
        for id in enriched.parsed.tree.leaves() {
            assert!(enriched.parsed.tree.node(id).vector.is_some());
        }
        assert_eq!(enriched.embeddings_computed, 20);
        assert!(!enriched.embeddings_skipped);
    }

    #[tokio::test]
    async fn scatter_matches_inline_results() {
        // Same deterministic provider; only the chunking differs.
        let doc = large_document(1200);
        let inline = stage_with(Arc::new(SimulatedEmbeddings::new(8)), 1500)
            .process(doc.clone())
            .await
            .unwrap();
        let scattered = stage_with(Arc::new(SimulatedEmbeddings::new(8)), 500)
            .process(doc)
            .await
            .unwrap();
        assert_eq!(scattered.parsed.tree.leaf_count(), 1200);
        for id in inline.parsed.tree.leaves() {
            assert_eq!(
                inline.parsed.tree.node(id).vector,
                scattered.parsed.tree.node(id).vector
            );
        }
    }

    #[tokio::test]
    async fn repeated_content_hits_the_cache() {
        let provider = Arc::new(CountingProvider {
            inner: SimulatedEmbeddings::new(8),
            calls: AtomicUsize::new(0),
        });
        let stage = stage_with(provider.clone(), 500);
        let doc = large_document(5);
        stage.process(doc.clone()).await.unwrap();
        let second = stage.process(doc).await.unwrap();
        assert_eq!(second.cache_hits, 5);
        assert_eq!(second.embeddings_computed, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn any_leaf_failure_fails_the_document() {
        let stage = stage_with(Arc::new(FailingProvider), 500);
        let err = stage.process(large_document(3)).await.unwrap_err();
        assert!(matches!(err, StageError::Embed(EmbedError::Rejected(_))));
    }

    #[tokio::test]
    async fn skip_mode_passes_documents_through() {
        let stage = stage_with(Arc::new(FailingProvider), 500).with_skip_embeddings(true);
        let enriched = stage.process(large_document(4)).await.unwrap();
        assert!(enriched.embeddings_skipped);
        for id in enriched.parsed.tree.leaves() {
            assert!(enriched.parsed.tree.node(id).vector.is_none());
        }
    }

    #[tokio::test]
    async fn simulation_bypasses_the_cache() {
        let provider = Arc::new(CountingProvider {
            inner: SimulatedEmbeddings::new(8),
            calls: AtomicUsize::new(0),
        });
        let stage = stage_with(provider.clone(), 500).with_simulation(true);
        let doc = large_document(4);
        stage.process(doc.clone()).await.unwrap();
        stage.process(doc).await.unwrap();
        // No cache between runs: the provider is called for every leaf
        // both times.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 8);
    }
}
