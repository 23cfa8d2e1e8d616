//! Persist stage: write enriched documents into the graph store.
//!
//! [`GraphStore`] is the storage seam. The sqlite backend keeps units,
//! containment/citation/subject edges, the shared dictionary, and a
//! derived vector index table; the in-memory backend serves tests and
//! supports injected write failures.
//!
//! Write order per document: root unit first, then the tree depth-first
//! with a `PartOf` edge per child, then `About` edges from the root to
//! matching dictionary entries. Cross-document citations found in leaf
//! text are only *recorded* here; [`crate::linker::ReferenceLinker`]
//! turns them into edges after the whole batch has drained, when their
//! targets may finally exist. Every created unit id lands in the
//! [`IngestionContext`] ledger, so a failure mid-document rolls back
//! exactly that document.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tokio_rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error, instrument};

use crate::cache::pack_vector;
use crate::context::IngestionContext;
use crate::error::{StageError, StoreError};
use crate::model::tree::{NodeId, UnitKind, Validity};
use crate::model::{DocumentResult, EnrichedDocument, StageTimings};

/// Row written for one structural unit.
#[derive(Clone, Debug)]
pub struct UnitRecord {
    pub document_id: String,
    pub kind: UnitKind,
    pub label: String,
    /// Hierarchy path from the root, for display and diagnostics.
    pub path: String,
    pub text: String,
    pub vector: Option<Vec<f32>>,
    pub validity: Option<Validity>,
    pub metadata: serde_json::Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    /// Child unit is part of its parent.
    PartOf,
    /// A unit cites another unit, possibly in another document.
    Cites,
    /// Document root is about a dictionary subject area.
    About,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::PartOf => "part_of",
            EdgeKind::Cites => "cites",
            EdgeKind::About => "about",
        }
    }
}

/// A citation recorded during persist, waiting for its target.
#[derive(Clone, Debug)]
pub struct PendingCitation {
    pub id: i64,
    pub from_unit: i64,
    pub target_document: String,
    pub target_label: String,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn write_unit(&self, record: UnitRecord) -> Result<i64, StoreError>;
    async fn write_edge(&self, from: i64, to: i64, kind: EdgeKind) -> Result<i64, StoreError>;
    /// Delete one unit and every edge touching it.
    async fn delete_unit(&self, unit_id: i64) -> Result<(), StoreError>;
    /// Delete every unit of a document (manual rollback). Returns the
    /// number of units removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError>;
    /// Ids of every persisted unit of a document, in insertion order.
    async fn document_unit_ids(&self, document_id: &str) -> Result<Vec<i64>, StoreError>;
    /// Insert-if-absent a batch of dictionary entries under a category.
    /// Returns how many were newly created.
    async fn merge_dictionary(
        &self,
        category: &str,
        entries: &[&str],
    ) -> Result<usize, StoreError>;
    async fn dictionary_id(&self, category: &str, name: &str)
    -> Result<Option<i64>, StoreError>;
    async fn record_citation(
        &self,
        from_unit: i64,
        target_document: &str,
        target_label: &str,
    ) -> Result<(), StoreError>;
    async fn pending_citations(&self) -> Result<Vec<PendingCitation>, StoreError>;
    /// Unit id for a (document, label) pair, if persisted.
    async fn resolve_unit(
        &self,
        document_id: &str,
        label: &str,
    ) -> Result<Option<i64>, StoreError>;
    async fn mark_citation_resolved(&self, citation_id: i64) -> Result<(), StoreError>;
    /// Drop the derived vector index ahead of a batch of writes.
    async fn drop_vector_index(&self) -> Result<(), StoreError>;
    /// Rebuild the index from persisted vectors. Returns indexed count.
    async fn rebuild_vector_index(&self) -> Result<usize, StoreError>;
}

// ===== Sqlite backend =====

pub struct SqliteGraphStore {
    conn: Connection,
}

impl SqliteGraphStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(|err| StoreError::Storage(err.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS units (
                     id          INTEGER PRIMARY KEY AUTOINCREMENT,
                     document_id TEXT NOT NULL,
                     kind        TEXT NOT NULL,
                     label       TEXT NOT NULL,
                     path        TEXT NOT NULL,
                     text        TEXT NOT NULL,
                     vector      BLOB,
                     validity    TEXT,
                     metadata    TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS units_document ON units(document_id);
                 CREATE INDEX IF NOT EXISTS units_label ON units(document_id, label);
                 CREATE TABLE IF NOT EXISTS edges (
                     id        INTEGER PRIMARY KEY AUTOINCREMENT,
                     from_unit INTEGER NOT NULL,
                     to_unit   INTEGER NOT NULL,
                     kind      TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS edges_from ON edges(from_unit);
                 CREATE INDEX IF NOT EXISTS edges_to ON edges(to_unit);
                 CREATE TABLE IF NOT EXISTS dictionary (
                     id       INTEGER PRIMARY KEY AUTOINCREMENT,
                     category TEXT NOT NULL,
                     name     TEXT NOT NULL,
                     UNIQUE (category, name)
                 );
                 CREATE TABLE IF NOT EXISTS citations (
                     id              INTEGER PRIMARY KEY AUTOINCREMENT,
                     from_unit       INTEGER NOT NULL,
                     target_document TEXT NOT NULL,
                     target_label    TEXT NOT NULL,
                     resolved        INTEGER NOT NULL DEFAULT 0
                 );",
            )
            .map_err(tokio_rusqlite::Error::Rusqlite)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn write_unit(&self, record: UnitRecord) -> Result<i64, StoreError> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO units
                         (document_id, kind, label, path, text, vector, validity, metadata)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        &record.document_id,
                        record.kind.as_str(),
                        &record.label,
                        &record.path,
                        &record.text,
                        record.vector.as_deref().map(pack_vector),
                        record.validity.map(Validity::as_str),
                        record.metadata.to_string(),
                    ),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    async fn write_edge(&self, from: i64, to: i64, kind: EdgeKind) -> Result<i64, StoreError> {
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO edges (from_unit, to_unit, kind) VALUES (?, ?, ?)",
                    (from, to, kind.as_str()),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    async fn delete_unit(&self, unit_id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM edges WHERE from_unit = ? OR to_unit = ?",
                    (unit_id, unit_id),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                conn.execute("DELETE FROM citations WHERE from_unit = ?", [unit_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                conn.execute("DELETE FROM units WHERE id = ?", [unit_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let document_id = document_id.to_string();
        let deleted = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM edges WHERE from_unit IN
                         (SELECT id FROM units WHERE document_id = ?)
                     OR to_unit IN
                         (SELECT id FROM units WHERE document_id = ?)",
                    (&document_id, &document_id),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                conn.execute(
                    "DELETE FROM citations WHERE from_unit IN
                         (SELECT id FROM units WHERE document_id = ?)",
                    [&document_id],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let deleted = conn
                    .execute("DELETE FROM units WHERE document_id = ?", [&document_id])
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }

    async fn document_unit_ids(&self, document_id: &str) -> Result<Vec<i64>, StoreError> {
        let document_id = document_id.to_string();
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT id FROM units WHERE document_id = ? ORDER BY id")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([&document_id], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await?;
        Ok(ids)
    }

    async fn merge_dictionary(
        &self,
        category: &str,
        entries: &[&str],
    ) -> Result<usize, StoreError> {
        let category = category.to_string();
        let entries: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        let inserted = self
            .conn
            .call(move |conn| {
                let mut inserted = 0;
                for name in &entries {
                    inserted += conn
                        .execute(
                            "INSERT OR IGNORE INTO dictionary (category, name) VALUES (?, ?)",
                            (&category, name),
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                Ok(inserted)
            })
            .await?;
        Ok(inserted)
    }

    async fn dictionary_id(
        &self,
        category: &str,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let category = category.to_string();
        let name = name.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id FROM dictionary WHERE category = ? AND name = ?",
                    (&category, &name),
                    |row| row.get(0),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await?;
        Ok(id)
    }

    async fn record_citation(
        &self,
        from_unit: i64,
        target_document: &str,
        target_label: &str,
    ) -> Result<(), StoreError> {
        let target_document = target_document.to_string();
        let target_label = target_label.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO citations (from_unit, target_document, target_label)
                     VALUES (?, ?, ?)",
                    (from_unit, &target_document, &target_label),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn pending_citations(&self) -> Result<Vec<PendingCitation>, StoreError> {
        let pending = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, from_unit, target_document, target_label
                         FROM citations WHERE resolved = 0",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(PendingCitation {
                            id: row.get(0)?,
                            from_unit: row.get(1)?,
                            target_document: row.get(2)?,
                            target_label: row.get(3)?,
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(out)
            })
            .await?;
        Ok(pending)
    }

    async fn resolve_unit(
        &self,
        document_id: &str,
        label: &str,
    ) -> Result<Option<i64>, StoreError> {
        let document_id = document_id.to_string();
        let label = label.to_string();
        let id = self
            .conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id FROM units WHERE document_id = ? AND label = ?",
                    (&document_id, &label),
                    |row| row.get(0),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await?;
        Ok(id)
    }

    async fn mark_citation_resolved(&self, citation_id: i64) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE citations SET resolved = 1 WHERE id = ?",
                    [citation_id],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn drop_vector_index(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("DROP TABLE IF EXISTS vector_index;")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn rebuild_vector_index(&self) -> Result<usize, StoreError> {
        let indexed = self
            .conn
            .call(|conn| {
                conn.execute_batch(
                    "DROP TABLE IF EXISTS vector_index;
                     CREATE TABLE vector_index (
                         unit_id INTEGER PRIMARY KEY,
                         vector  BLOB NOT NULL
                     );",
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let indexed = conn
                    .execute(
                        "INSERT INTO vector_index (unit_id, vector)
                         SELECT id, vector FROM units WHERE vector IS NOT NULL",
                        [],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(indexed)
            })
            .await?;
        Ok(indexed)
    }
}

// ===== In-memory backend =====

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    units: FxHashMap<i64, UnitRecord>,
    edges: Vec<(i64, i64, i64, EdgeKind)>,
    dictionary: FxHashMap<(String, String), i64>,
    citations: Vec<(i64, PendingCitation, bool)>,
    next_citation_id: i64,
    index_size: Option<usize>,
    fail_after_units: Option<usize>,
    units_written: usize,
}

/// Map-backed store for tests. `fail_after_units(n)` makes the n+1-th
/// unit write fail, for rollback exercises.
#[derive(Default)]
pub struct MemoryGraphStore {
    state: parking_lot::Mutex<MemoryState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fail_after_units(self, n: usize) -> Self {
        self.state.lock().fail_after_units = Some(n);
        self
    }

    pub fn unit_count(&self) -> usize {
        self.state.lock().units.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.lock().edges.len()
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.state
            .lock()
            .units
            .values()
            .any(|u| u.document_id == document_id)
    }

    pub fn dictionary_len(&self) -> usize {
        self.state.lock().dictionary.len()
    }

    pub fn index_size(&self) -> Option<usize> {
        self.state.lock().index_size
    }

    pub fn edges_of_kind(&self, kind: EdgeKind) -> usize {
        self.state.lock().edges.iter().filter(|e| e.3 == kind).count()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn write_unit(&self, record: UnitRecord) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if let Some(limit) = state.fail_after_units {
            if state.units_written >= limit {
                return Err(StoreError::Storage("injected write failure".into()));
            }
        }
        state.next_id += 1;
        let id = state.next_id;
        state.units.insert(id, record);
        state.units_written += 1;
        Ok(id)
    }

    async fn write_edge(&self, from: i64, to: i64, kind: EdgeKind) -> Result<i64, StoreError> {
        let mut state = self.state.lock();
        if !state.units.contains_key(&from) {
            return Err(StoreError::UnknownUnit(from));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.edges.push((id, from, to, kind));
        Ok(id)
    }

    async fn delete_unit(&self, unit_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.units.remove(&unit_id);
        state.edges.retain(|&(_, f, t, _)| f != unit_id && t != unit_id);
        state.citations.retain(|(_, c, _)| c.from_unit != unit_id);
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let ids: Vec<i64> = state
            .units
            .iter()
            .filter(|(_, u)| u.document_id == document_id)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            state.units.remove(id);
            state.edges.retain(|&(_, f, t, _)| f != *id && t != *id);
            state.citations.retain(|(_, c, _)| c.from_unit != *id);
        }
        Ok(ids.len())
    }

    async fn document_unit_ids(&self, document_id: &str) -> Result<Vec<i64>, StoreError> {
        let mut ids: Vec<i64> = self
            .state
            .lock()
            .units
            .iter()
            .filter(|(_, u)| u.document_id == document_id)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn merge_dictionary(
        &self,
        category: &str,
        entries: &[&str],
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for name in entries {
            let key = (category.to_string(), name.to_string());
            if !state.dictionary.contains_key(&key) {
                state.next_id += 1;
                let id = state.next_id;
                state.dictionary.insert(key, id);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn dictionary_id(
        &self,
        category: &str,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .dictionary
            .get(&(category.to_string(), name.to_string()))
            .copied())
    }

    async fn record_citation(
        &self,
        from_unit: i64,
        target_document: &str,
        target_label: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.next_citation_id += 1;
        let id = state.next_citation_id;
        state.citations.push((
            id,
            PendingCitation {
                id,
                from_unit,
                target_document: target_document.to_string(),
                target_label: target_label.to_string(),
            },
            false,
        ));
        Ok(())
    }

    async fn pending_citations(&self) -> Result<Vec<PendingCitation>, StoreError> {
        Ok(self
            .state
            .lock()
            .citations
            .iter()
            .filter(|(_, _, resolved)| !resolved)
            .map(|(_, c, _)| c.clone())
            .collect())
    }

    async fn resolve_unit(
        &self,
        document_id: &str,
        label: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .units
            .iter()
            .find(|(_, u)| u.document_id == document_id && u.label == label)
            .map(|(&id, _)| id))
    }

    async fn mark_citation_resolved(&self, citation_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(entry) = state.citations.iter_mut().find(|(id, _, _)| *id == citation_id) {
            entry.2 = true;
        }
        Ok(())
    }

    async fn drop_vector_index(&self) -> Result<(), StoreError> {
        self.state.lock().index_size = None;
        Ok(())
    }

    async fn rebuild_vector_index(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let size = state.units.values().filter(|u| u.vector.is_some()).count();
        state.index_size = Some(size);
        Ok(size)
    }
}

// ===== Persist stage =====

pub struct PersistStage {
    store: Arc<dyn GraphStore>,
    context: Arc<IngestionContext>,
    citation_pattern: Regex,
}

impl PersistStage {
    pub fn new(store: Arc<dyn GraphStore>, context: Arc<IngestionContext>) -> Self {
        Self {
            store,
            context,
            // "Article 12 of LAW-2041" style references in body text.
            citation_pattern: Regex::new(r"Article\s+(\d+[a-z]?)\s+of\s+([A-Z][A-Z0-9/-]{2,})")
                .expect("static regex"),
        }
    }

    /// Write one document; on any failure, roll back its units and
    /// return a failed [`DocumentResult`].
    #[instrument(skip_all, fields(document_id = %enriched.parsed.document_id))]
    pub async fn process(&self, enriched: EnrichedDocument) -> DocumentResult {
        let started = Instant::now();
        let document_id = enriched.parsed.document_id.clone();
        self.context.open(&document_id);

        match self.write_document(&enriched).await {
            Ok((nodes, edges)) => {
                self.context.commit(&document_id);
                debug!(nodes, edges, "document persisted");
                DocumentResult {
                    document_id,
                    success: true,
                    nodes_created: nodes,
                    edges_created: edges,
                    cache_hits: enriched.cache_hits,
                    embeddings_computed: enriched.embeddings_computed,
                    error_message: None,
                    failed_stage: None,
                    timings: StageTimings {
                        parse: enriched.parsed.parse_duration,
                        enrich: enriched.embed_duration,
                        persist: started.elapsed(),
                    },
                }
            }
            Err(err) => {
                error!(error = %err, "persist failed, rolling back");
                if let Err(rollback_err) =
                    self.context.rollback(&document_id, &self.store).await
                {
                    error!(error = %rollback_err, "rollback itself failed");
                }
                let stage_err = StageError::from(err);
                let mut result = DocumentResult::failure(
                    document_id,
                    stage_err.stage(),
                    stage_err.to_string(),
                );
                result.timings = StageTimings {
                    parse: enriched.parsed.parse_duration,
                    enrich: enriched.embed_duration,
                    persist: started.elapsed(),
                };
                result
            }
        }
    }

    async fn write_document(
        &self,
        enriched: &EnrichedDocument,
    ) -> Result<(usize, usize), StoreError> {
        let parsed = &enriched.parsed;
        let document_id = &parsed.document_id;
        // Re-ingest: the previous version stays in place until the
        // replacement has fully persisted, then its units are removed.
        // A mid-document failure rolls back only the new ids.
        let previous_ids = self.store.document_unit_ids(document_id).await?;

        let mut nodes = 0;
        let mut edges = 0;
        let mut unit_ids: FxHashMap<NodeId, i64> = FxHashMap::default();

        let root = parsed.tree.root();
        let root_id = self
            .store
            .write_unit(UnitRecord {
                document_id: document_id.clone(),
                kind: UnitKind::Root,
                label: parsed.title.clone(),
                path: String::new(),
                text: String::new(),
                vector: None,
                validity: None,
                metadata: serde_json::json!({
                    "title": parsed.title,
                    "subjects": parsed.subjects,
                    "structural_events": parsed.structural_events,
                    "embeddings_skipped": enriched.embeddings_skipped,
                }),
            })
            .await?;
        self.context.record(document_id, root_id);
        unit_ids.insert(root, root_id);
        nodes += 1;

        for node_id in parsed.tree.descendants(root) {
            let node = parsed.tree.node(node_id);
            let id = self
                .store
                .write_unit(UnitRecord {
                    document_id: document_id.clone(),
                    kind: node.kind,
                    label: node.label.clone(),
                    path: parsed.tree.hierarchy_path(node_id),
                    text: node.text.clone(),
                    vector: node.vector.clone(),
                    validity: node.validity,
                    metadata: serde_json::Value::Null,
                })
                .await?;
            self.context.record(document_id, id);
            unit_ids.insert(node_id, id);
            nodes += 1;

            let parent = node.parent.expect("descendants always have a parent");
            let parent_id = unit_ids[&parent];
            self.store.write_edge(id, parent_id, EdgeKind::PartOf).await?;
            edges += 1;

            if node.kind.is_leaf() {
                for captures in self.citation_pattern.captures_iter(&node.text) {
                    let target_document = captures[2].to_string();
                    if target_document != *document_id {
                        self.store
                            .record_citation(
                                id,
                                &target_document,
                                &format!("Article {}", &captures[1]),
                            )
                            .await?;
                    }
                }
            }
        }

        for subject in &parsed.subjects {
            if let Some(dict_id) = self
                .store
                .dictionary_id("subject_area", subject)
                .await?
            {
                self.store.write_edge(root_id, dict_id, EdgeKind::About).await?;
                edges += 1;
            }
        }

        for old_id in previous_ids.iter().rev() {
            self.store.delete_unit(*old_id).await?;
        }

        Ok((nodes, edges))
    }
}
