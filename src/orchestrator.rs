//! Run orchestration: pools, channels, draining, reporting.
//!
//! ```text
//!         ids            parsed           enriched          results
//! feeder ----> [parse xN1] ----> [enrich xN2] ----> [persist xN3] ----> collector
//!        bounded         bounded           bounded          unbounded
//! ```
//!
//! A run moves through four phases. INIT opens resources and preloads
//! the shared dictionaries before any worker exists, so concurrent
//! documents never race to create reference nodes. STREAMING runs the
//! three fixed-size pools over bounded flume channels; a full channel
//! blocks the upstream sender, which is the backpressure that bounds
//! memory when document sizes are skewed. DRAINING is channel-closure
//! cascade: the feeder drops the id sender when done, each pool drops
//! its downstream sender as its workers exit, and the collector stops
//! when the result channel closes. DONE links cross-document
//! references, rebuilds the vector index, and assembles the report.
//!
//! Documents fail independently: every submitted id produces exactly
//! one [`DocumentResult`]. Only resource initialization aborts a run.
//!
//! Cancellation is a watch signal checked at every channel operation.
//! Items still queued when the signal lands are drained into failed
//! results rather than silently dropped; a document mid-persist is
//! rolled back by the persist stage's own failure path.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::enrich::EnrichStage;
use crate::error::{IngestError, StageError};
use crate::model::{
    BatchReport, DictionaryStats, DocumentResult, EnrichedDocument, ParsedDocument, StageSummary,
};
use crate::parse::ParseStage;
use crate::persist::PersistStage;
use crate::resources::ResourceManager;

/// Cancels the run it was taken from. Cheap to clone and send across
/// tasks; cancelling twice is harmless.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct Orchestrator {
    config: IngestionConfig,
    resources: Arc<ResourceManager>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(config: IngestionConfig, resources: Arc<ResourceManager>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            resources,
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// Run the full pipeline over a batch of document ids.
    pub async fn run(&self, document_ids: Vec<String>) -> Result<BatchReport, IngestError> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let started = Instant::now();
        let submitted = document_ids.len();

        // ----- INIT -----
        info!(run_id = %run_id, submitted, phase = "init", "run starting");
        let dictionary = self.resources.preload_dictionaries().await?;
        self.resources.prepare_store().await?;

        // Duplicate ids get a failed result instead of a second ingest,
        // which would race the first one through every stage.
        let mut seen = FxHashSet::default();
        let mut unique_ids = Vec::with_capacity(document_ids.len());
        let mut results: Vec<DocumentResult> = Vec::with_capacity(submitted);
        for id in document_ids {
            if seen.insert(id.clone()) {
                unique_ids.push(id);
            } else {
                warn!(document_id = %id, "duplicate submission rejected");
                results.push(DocumentResult::failure(
                    id,
                    "orchestrator",
                    StageError::Duplicate.to_string(),
                ));
            }
        }

        // ----- STREAMING -----
        info!(run_id = %run_id, phase = "streaming", "pools starting");
        let capacity = self.config.channel_capacity;
        let (id_tx, id_rx) = flume::bounded::<String>(capacity);
        let (parsed_tx, parsed_rx) = flume::bounded::<ParsedDocument>(capacity);
        let (enriched_tx, enriched_rx) = flume::bounded::<EnrichedDocument>(capacity);
        let (result_tx, result_rx) = flume::unbounded::<DocumentResult>();

        let parse_stage = Arc::new(ParseStage::new(
            Arc::clone(&self.resources.fetcher),
            self.config.retry,
        ));
        let enrich_stage = Arc::new(
            EnrichStage::new(
                Arc::clone(&self.resources.cache),
                Arc::clone(&self.resources.provider),
                Arc::clone(&self.resources.limiter),
                self.config.scatter_chunk_size,
                self.config.retry,
            )
            .with_skip_embeddings(self.config.skip_embeddings)
            .with_simulation(self.config.simulate_embeddings),
        );
        let persist_stage = Arc::new(PersistStage::new(
            Arc::clone(&self.resources.store),
            Arc::clone(&self.resources.context),
        ));

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Feeder: closes the id channel by dropping its only sender.
        {
            let ids = unique_ids.clone();
            let mut cancel = self.cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                'feed: for id in ids {
                    tokio::select! {
                        _ = cancel.changed() => break 'feed,
                        sent = id_tx.send_async(id) => {
                            if sent.is_err() {
                                break 'feed;
                            }
                        }
                    }
                }
            }));
        }

        for _ in 0..self.config.parse_workers {
            let stage = Arc::clone(&parse_stage);
            let id_rx = id_rx.clone();
            let parsed_tx = parsed_tx.clone();
            let result_tx = result_tx.clone();
            let mut cancel = self.cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let id = tokio::select! {
                        _ = cancel.changed() => break,
                        msg = id_rx.recv_async() => match msg {
                            Ok(id) => id,
                            Err(_) => break,
                        },
                    };
                    match stage.process(&id).await {
                        Ok(parsed) => {
                            tokio::select! {
                                _ = cancel.changed() => break,
                                sent = parsed_tx.send_async(parsed) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            let _ = result_tx.send(DocumentResult::failure(
                                id,
                                err.stage(),
                                err.to_string(),
                            ));
                        }
                    }
                }
            }));
        }

        for _ in 0..self.config.enrich_workers {
            let stage = Arc::clone(&enrich_stage);
            let parsed_rx = parsed_rx.clone();
            let enriched_tx = enriched_tx.clone();
            let result_tx = result_tx.clone();
            let mut cancel = self.cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let parsed = tokio::select! {
                        _ = cancel.changed() => break,
                        msg = parsed_rx.recv_async() => match msg {
                            Ok(parsed) => parsed,
                            Err(_) => break,
                        },
                    };
                    let document_id = parsed.document_id.clone();
                    match stage.process(parsed).await {
                        Ok(enriched) => {
                            tokio::select! {
                                _ = cancel.changed() => break,
                                sent = enriched_tx.send_async(enriched) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            let _ = result_tx.send(DocumentResult::failure(
                                document_id,
                                err.stage(),
                                err.to_string(),
                            ));
                        }
                    }
                }
            }));
        }

        for _ in 0..self.config.persist_workers {
            let stage = Arc::clone(&persist_stage);
            let enriched_rx = enriched_rx.clone();
            let result_tx = result_tx.clone();
            let mut cancel = self.cancel_tx.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let enriched = tokio::select! {
                        _ = cancel.changed() => break,
                        msg = enriched_rx.recv_async() => match msg {
                            Ok(enriched) => enriched,
                            Err(_) => break,
                        },
                    };
                    let _ = result_tx.send(stage.process(enriched).await);
                }
            }));
        }

        // Our own sender clones must go, or the collector never sees
        // the channels close. Receiver clones stay for the cancel drain.
        drop(parsed_tx);
        drop(enriched_tx);
        drop(result_tx);

        while let Ok(result) = result_rx.recv_async().await {
            results.push(result);
        }

        // ----- DRAINING -----
        info!(run_id = %run_id, phase = "draining", "pools stopped");
        for handle in handles {
            handle
                .await
                .map_err(|err| IngestError::Join(err.to_string()))?;
        }

        // Anything still queued was cancelled out from under its stage.
        let cancelled = *self.cancel_tx.subscribe().borrow();
        if cancelled {
            while let Ok(id) = id_rx.try_recv() {
                results.push(cancelled_result(id));
            }
            while let Ok(parsed) = parsed_rx.try_recv() {
                results.push(cancelled_result(parsed.document_id));
            }
            while let Ok(enriched) = enriched_rx.try_recv() {
                results.push(cancelled_result(enriched.parsed.document_id));
            }
            // Ids the feeder never got to send.
            let reported: FxHashSet<&str> =
                results.iter().map(|r| r.document_id.as_str()).collect();
            let missing: Vec<String> = unique_ids
                .iter()
                .filter(|id| !reported.contains(id.as_str()))
                .cloned()
                .collect();
            for id in missing {
                results.push(cancelled_result(id));
            }
        }

        // ----- DONE -----
        info!(run_id = %run_id, phase = "done", "post-processing");
        let reference_links = if cancelled {
            0
        } else {
            self.resources.linker().link_pending().await?
        };
        self.resources.finalize_store().await?;

        let report = assemble_report(
            run_id,
            started_at,
            started.elapsed(),
            submitted,
            dictionary,
            reference_links,
            results,
        );
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration.as_millis() as u64,
            "run complete"
        );
        Ok(report)
    }
}

fn cancelled_result(document_id: String) -> DocumentResult {
    DocumentResult::failure(
        document_id,
        "orchestrator",
        StageError::Cancelled.to_string(),
    )
}

fn assemble_report(
    run_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
    duration: Duration,
    submitted: usize,
    dictionary: DictionaryStats,
    reference_links: usize,
    results: Vec<DocumentResult>,
) -> BatchReport {
    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;
    let successful = || results.iter().filter(|r| r.success);
    BatchReport {
        run_id,
        started_at,
        duration,
        submitted,
        succeeded,
        failed,
        nodes_created: successful().map(|r| r.nodes_created).sum(),
        edges_created: successful().map(|r| r.edges_created).sum(),
        cache_hits: successful().map(|r| r.cache_hits).sum(),
        embeddings_computed: successful().map(|r| r.embeddings_computed).sum(),
        reference_links,
        dictionary,
        parse_summary: StageSummary::from_durations(
            successful().map(|r| r.timings.parse).collect(),
        ),
        enrich_summary: StageSummary::from_durations(
            successful().map(|r| r.timings.enrich).collect(),
        ),
        persist_summary: StageSummary::from_durations(
            successful().map(|r| r.timings.persist).collect(),
        ),
        results,
    }
}
