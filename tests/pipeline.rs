//! End-to-end pipeline runs over in-memory collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use lexgraph_ingest::cache::MemoryVectorCache;
use lexgraph_ingest::config::{IngestionConfig, RetryPolicy};
use lexgraph_ingest::embeddings::{EmbeddingProvider, SimulatedEmbeddings};
use lexgraph_ingest::error::{EmbedError, FetchError, StoreError};
use lexgraph_ingest::fetch::{DocumentFetcher, FixtureFetcher, RawDocument};
use lexgraph_ingest::orchestrator::Orchestrator;
use lexgraph_ingest::persist::{
    EdgeKind, GraphStore, MemoryGraphStore, PendingCitation, UnitRecord,
};
use lexgraph_ingest::resources::ResourceManager;

fn law_body(title: &str, articles: usize) -> String {
    let mut body = format!("{title}\nSubjects: contracts\n");
    for n in 1..=articles {
        body.push_str(&format!("Article {n}\nBody of article {n} in {title}.\n"));
    }
    body
}

fn test_config() -> IngestionConfig {
    IngestionConfig::default()
        .with_pool_sizes(2, 4, 1)
        .with_channel_capacity(8)
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        })
}

fn resources_with(
    store: Arc<dyn GraphStore>,
    provider: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn DocumentFetcher>,
    config: &IngestionConfig,
) -> Arc<ResourceManager> {
    Arc::new(ResourceManager::with_collaborators(
        store,
        Arc::new(MemoryVectorCache::new()),
        provider,
        fetcher,
        config,
    ))
}

fn three_law_fetcher() -> FixtureFetcher {
    FixtureFetcher::new()
        .with_document("LAW-1", law_body("First Law", 3))
        .with_document("LAW-2", law_body("Second Law", 2))
        .with_document("LAW-3", law_body("Third Law", 4))
}

#[tokio::test]
async fn one_bad_document_does_not_poison_the_batch() {
    let config = test_config();
    let store = Arc::new(MemoryGraphStore::new());
    let resources = resources_with(
        store.clone(),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(three_law_fetcher()),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let report = orchestrator
        .run(vec![
            "LAW-1".into(),
            "LAW-MISSING".into(),
            "LAW-2".into(),
            "LAW-3".into(),
        ])
        .await
        .unwrap();

    assert_eq!(report.submitted, 4);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 1);
    let failed = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.document_id, "LAW-MISSING");
    assert_eq!(failed.failed_stage.as_deref(), Some("parse"));
    // The three good documents landed fully: 1 root + N articles each.
    assert!(store.contains_document("LAW-1"));
    assert!(store.contains_document("LAW-3"));
    assert_eq!(store.unit_count(), 4 + 3 + 5);
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

#[tokio::test]
async fn second_run_is_served_from_the_cache() {
    let config = test_config();
    let provider = Arc::new(CountingProvider {
        inner: SimulatedEmbeddings::new(8),
        calls: AtomicUsize::new(0),
    });
    let resources = resources_with(
        Arc::new(MemoryGraphStore::new()),
        provider.clone(),
        Arc::new(three_law_fetcher()),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let first = orchestrator.run(vec!["LAW-1".into()]).await.unwrap();
    assert_eq!(first.embeddings_computed, 3);
    assert_eq!(first.cache_hits, 0);
    let calls_after_first = provider.calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_first, 3);

    let second = orchestrator.run(vec!["LAW-1".into()]).await.unwrap();
    assert_eq!(second.cache_hits, 3);
    assert_eq!(second.embeddings_computed, 0);
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);
}

#[tokio::test]
async fn identical_article_text_across_documents_embeds_once() {
    let config = test_config();
    let provider = Arc::new(CountingProvider {
        inner: SimulatedEmbeddings::new(8),
        calls: AtomicUsize::new(0),
    });
    // Different documents, identical article at the same structural
    // position: one provider call serves both.
    let shared = "Article 1\nHe who sows discord shall answer for it.\n";
    let fetcher = FixtureFetcher::new()
        .with_document("LAW-A", format!("Alpha Law\n{shared}"))
        .with_document("LAW-B", format!("Beta Law\n{shared}"));
    let resources = resources_with(
        Arc::new(MemoryGraphStore::new()),
        provider.clone(),
        Arc::new(fetcher),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    orchestrator.run(vec!["LAW-A".into()]).await.unwrap();
    let second = orchestrator.run(vec!["LAW-B".into()]).await.unwrap();
    assert_eq!(second.cache_hits, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn large_documents_scatter_without_losing_leaves() {
    let config = test_config().with_scatter_chunk_size(25);
    let store = Arc::new(MemoryGraphStore::new());
    let fetcher = FixtureFetcher::new().with_document("LAW-BIG", law_body("Big Law", 130));
    let resources = resources_with(
        store.clone(),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(fetcher),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let report = orchestrator.run(vec!["LAW-BIG".into()]).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.embeddings_computed, 130);
    // Root + 130 articles, every article indexed.
    assert_eq!(store.unit_count(), 131);
    assert_eq!(store.index_size(), Some(130));
}

#[tokio::test]
async fn persist_failure_rolls_back_without_touching_other_documents() {
    let config = test_config().with_pool_sizes(1, 1, 1);
    // LAW-1 needs 4 units; allow 6 so LAW-2 (3 units) fails on its third.
    let store = Arc::new(MemoryGraphStore::new().fail_after_units(6));
    let resources = resources_with(
        store.clone(),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(three_law_fetcher()),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let report = orchestrator
        .run(vec!["LAW-1".into(), "LAW-2".into()])
        .await
        .unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let failed = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(failed.document_id, "LAW-2");
    assert_eq!(failed.failed_stage.as_deref(), Some("persist"));
    // Rollback removed LAW-2's partial units; LAW-1 and the shared
    // dictionary survive untouched.
    assert!(store.contains_document("LAW-1"));
    assert!(!store.contains_document("LAW-2"));
    assert_eq!(store.unit_count(), 4);
    assert!(store.dictionary_len() > 0);
}

#[tokio::test]
async fn duplicate_submissions_are_rejected_not_reingested() {
    let config = test_config();
    let store = Arc::new(MemoryGraphStore::new());
    let resources = resources_with(
        store.clone(),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(three_law_fetcher()),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let report = orchestrator
        .run(vec!["LAW-1".into(), "LAW-1".into(), "LAW-2".into()])
        .await
        .unwrap();

    assert_eq!(report.submitted, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    let rejected = report.results.iter().find(|r| !r.success).unwrap();
    assert_eq!(rejected.document_id, "LAW-1");
    assert_eq!(rejected.failed_stage.as_deref(), Some("orchestrator"));
    assert_eq!(store.unit_count(), 4 + 3);
}

#[tokio::test]
async fn citations_across_documents_become_edges_after_the_batch() {
    let config = test_config();
    let store = Arc::new(MemoryGraphStore::new());
    let fetcher = FixtureFetcher::new()
        .with_document(
            "LAW-A",
            "Alpha Law\nArticle 1\nAs provided by Article 2 of LAW-B, this applies.\n",
        )
        .with_document("LAW-B", law_body("Beta Law", 2));
    let resources = resources_with(
        store.clone(),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(fetcher),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let report = orchestrator
        .run(vec!["LAW-A".into(), "LAW-B".into()])
        .await
        .unwrap();

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.reference_links, 1);
    assert_eq!(store.edges_of_kind(EdgeKind::Cites), 1);
    assert!(store.pending_citations().await.unwrap().is_empty());
}

// ===== Backpressure and cancellation =====

struct CountingFetcher {
    inner: FixtureFetcher,
    fetched: AtomicUsize,
}

#[async_trait]
impl DocumentFetcher for CountingFetcher {
    async fn fetch(&self, document_id: &str) -> Result<RawDocument, FetchError> {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(document_id).await
    }
}

/// Store whose unit writes block until the gate opens.
struct GatedStore {
    inner: MemoryGraphStore,
    gate: tokio::sync::watch::Receiver<bool>,
}

impl GatedStore {
    fn new() -> (Self, tokio::sync::watch::Sender<bool>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        (
            Self {
                inner: MemoryGraphStore::new(),
                gate: rx,
            },
            tx,
        )
    }

    async fn wait_open(&self) {
        let mut gate = self.gate.clone();
        while !*gate.borrow() {
            if gate.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl GraphStore for GatedStore {
    async fn write_unit(&self, record: UnitRecord) -> Result<i64, StoreError> {
        self.wait_open().await;
        self.inner.write_unit(record).await
    }

    async fn write_edge(&self, from: i64, to: i64, kind: EdgeKind) -> Result<i64, StoreError> {
        self.inner.write_edge(from, to, kind).await
    }

    async fn delete_unit(&self, unit_id: i64) -> Result<(), StoreError> {
        self.inner.delete_unit(unit_id).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        self.inner.delete_document(document_id).await
    }

    async fn document_unit_ids(&self, document_id: &str) -> Result<Vec<i64>, StoreError> {
        self.inner.document_unit_ids(document_id).await
    }

    async fn merge_dictionary(
        &self,
        category: &str,
        entries: &[&str],
    ) -> Result<usize, StoreError> {
        self.inner.merge_dictionary(category, entries).await
    }

    async fn dictionary_id(&self, category: &str, name: &str) -> Result<Option<i64>, StoreError> {
        self.inner.dictionary_id(category, name).await
    }

    async fn record_citation(
        &self,
        from_unit: i64,
        target_document: &str,
        target_label: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .record_citation(from_unit, target_document, target_label)
            .await
    }

    async fn pending_citations(&self) -> Result<Vec<PendingCitation>, StoreError> {
        self.inner.pending_citations().await
    }

    async fn resolve_unit(
        &self,
        document_id: &str,
        label: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.inner.resolve_unit(document_id, label).await
    }

    async fn mark_citation_resolved(&self, citation_id: i64) -> Result<(), StoreError> {
        self.inner.mark_citation_resolved(citation_id).await
    }

    async fn drop_vector_index(&self) -> Result<(), StoreError> {
        self.inner.drop_vector_index().await
    }

    async fn rebuild_vector_index(&self) -> Result<usize, StoreError> {
        self.inner.rebuild_vector_index().await
    }
}

#[tokio::test]
async fn full_channels_stall_the_fetch_side() {
    let total = 12;
    let mut fixture = FixtureFetcher::new();
    let mut ids = Vec::new();
    for n in 0..total {
        let id = format!("LAW-{n}");
        fixture = fixture.with_document(&id, law_body(&format!("Law {n}"), 2));
        ids.push(id);
    }
    let fetcher = Arc::new(CountingFetcher {
        inner: fixture,
        fetched: AtomicUsize::new(0),
    });
    let (store, gate) = GatedStore::new();

    let config = IngestionConfig::default()
        .with_pool_sizes(1, 1, 1)
        .with_channel_capacity(1)
        .with_retry(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        });
    let resources = resources_with(
        Arc::new(store),
        Arc::new(SimulatedEmbeddings::new(8)),
        fetcher.clone(),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);

    let run = tokio::spawn(async move { orchestrator.run(ids).await });

    // With persist blocked, bounded channels cap how far ahead the
    // fetch side can run: 1 in-flight per stage plus 1 queued per
    // channel, far short of all 12.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stalled_at = fetcher.fetched.load(Ordering::SeqCst);
    assert!(
        stalled_at < total,
        "fetch ran ahead unbounded: {stalled_at} of {total}"
    );
    assert!(stalled_at <= 6, "backpressure too loose: {stalled_at}");

    gate.send(true).unwrap();
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.succeeded, total);
    assert_eq!(fetcher.fetched.load(Ordering::SeqCst), total);
}

#[tokio::test]
async fn cancellation_accounts_for_every_submitted_document() {
    let total = 6;
    let mut fixture = FixtureFetcher::new();
    let mut ids = Vec::new();
    for n in 0..total {
        let id = format!("LAW-{n}");
        fixture = fixture.with_document(&id, law_body(&format!("Law {n}"), 2));
        ids.push(id);
    }
    let (store, gate) = GatedStore::new();

    let config = IngestionConfig::default()
        .with_pool_sizes(1, 1, 1)
        .with_channel_capacity(1)
        .with_retry(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        });
    let resources = resources_with(
        Arc::new(store),
        Arc::new(SimulatedEmbeddings::new(8)),
        Arc::new(fixture),
        &config,
    );
    let orchestrator = Orchestrator::new(config, resources);
    let cancel = orchestrator.cancel_handle();

    let run = tokio::spawn(async move { orchestrator.run(ids).await });

    // Let the pipeline wedge against the closed gate, then cancel and
    // release the one write that is already in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    gate.send(true).unwrap();

    let report = run.await.unwrap().unwrap();
    // Exactly one result per submitted id, nothing silently lost.
    assert_eq!(report.results.len(), total);
    let mut seen: Vec<&str> = report
        .results
        .iter()
        .map(|r| r.document_id.as_str())
        .collect();
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), total);
    assert!(report.failed >= total - 2, "most documents should be cancelled");
    assert!(
        report
            .results
            .iter()
            .filter(|r| !r.success)
            .all(|r| r.failed_stage.is_some())
    );
}
