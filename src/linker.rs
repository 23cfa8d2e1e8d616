//! Cross-document reference linking.
//!
//! Citations recorded during persist point at documents that may not
//! have existed yet while their source was being written. After the
//! batch drains, this pass resolves each pending citation against the
//! now-complete store and writes a `Cites` edge for every target it
//! finds. Unresolvable citations stay pending for a later run.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::StoreError;
use crate::persist::{EdgeKind, GraphStore};

pub struct ReferenceLinker {
    store: Arc<dyn GraphStore>,
}

impl ReferenceLinker {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Resolve pending citations into edges. Returns how many were linked.
    pub async fn link_pending(&self) -> Result<usize, StoreError> {
        let pending = self.store.pending_citations().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let total = pending.len();
        let mut linked = 0;
        for citation in pending {
            match self
                .store
                .resolve_unit(&citation.target_document, &citation.target_label)
                .await?
            {
                Some(target_id) => {
                    self.store
                        .write_edge(citation.from_unit, target_id, EdgeKind::Cites)
                        .await?;
                    self.store.mark_citation_resolved(citation.id).await?;
                    linked += 1;
                }
                None => {
                    debug!(
                        target_document = %citation.target_document,
                        target_label = %citation.target_label,
                        "citation target not yet ingested"
                    );
                }
            }
        }
        info!(linked, unresolved = total - linked, "reference linking pass complete");
        Ok(linked)
    }
}
