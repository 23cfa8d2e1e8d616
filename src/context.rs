//! Per-run rollback ledger.
//!
//! Every identifier the persist stage creates is recorded under its
//! document id. A mid-document failure (or an explicit request) undoes
//! exactly that document's writes, in reverse creation order, leaving
//! shared dictionary nodes and every other document untouched. The map
//! is partitioned by document id, so persist workers never contend on
//! each other's entries beyond the brief lock around the map itself.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::persist::GraphStore;

#[derive(Default)]
pub struct IngestionContext {
    ledgers: Mutex<FxHashMap<String, Vec<i64>>>,
}

impl IngestionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or reset) the ledger for a document.
    pub fn open(&self, document_id: &str) {
        self.ledgers
            .lock()
            .insert(document_id.to_string(), Vec::new());
    }

    /// Record a created unit id under its document.
    pub fn record(&self, document_id: &str, unit_id: i64) {
        self.ledgers
            .lock()
            .entry(document_id.to_string())
            .or_default()
            .push(unit_id);
    }

    /// The document persisted fully; nothing left to roll back.
    pub fn commit(&self, document_id: &str) -> usize {
        self.ledgers
            .lock()
            .remove(document_id)
            .map_or(0, |ids| ids.len())
    }

    /// Delete this document's recorded units, newest first.
    ///
    /// Only ids recorded for `document_id` are touched. Returns how
    /// many were deleted.
    pub async fn rollback(
        &self,
        document_id: &str,
        store: &Arc<dyn GraphStore>,
    ) -> Result<usize, StoreError> {
        let ids = self.ledgers.lock().remove(document_id).unwrap_or_default();
        if ids.is_empty() {
            return Ok(0);
        }
        warn!(document_id, units = ids.len(), "rolling back document");
        let mut deleted = 0;
        for id in ids.into_iter().rev() {
            store.delete_unit(id).await?;
            deleted += 1;
        }
        info!(document_id, deleted, "rollback complete");
        Ok(deleted)
    }

    /// Identifiers currently recorded for a document, oldest first.
    pub fn recorded(&self, document_id: &str) -> Vec<i64> {
        self.ledgers
            .lock()
            .get(document_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn open_documents(&self) -> usize {
        self.ledgers.lock().len()
    }
}
