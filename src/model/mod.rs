//! Data types flowing between pipeline stages.
//!
//! ```text
//! document id --parse--> ParsedDocument --enrich--> EnrichedDocument
//!                                         --persist--> DocumentResult
//! ```
//!
//! [`BatchReport`] aggregates per-document results for one run and is
//! what the CLI serializes with `--output-json`.

pub mod tree;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use tree::{ContentTree, NodeId, UnitKind, UnitNode, Validity};

/// Noteworthy observation made while building the tree, surfaced in
/// the run report and root-node metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StructuralEvent {
    /// A compound heading ("Articles 4 to 7") split into multiple leaves.
    CompoundSplit { label: String, produced: usize },
    /// A leaf had no body text; a placeholder was written instead.
    EmptyLeafFilled { label: String },
    /// A line could not be matched to any structural pattern.
    UnrecognizedLine { line_number: usize },
}

/// Output of the parse stage.
#[derive(Clone, Debug)]
pub struct ParsedDocument {
    pub document_id: String,
    pub title: String,
    /// Subject-area names declared by the document header.
    pub subjects: Vec<String>,
    pub tree: ContentTree,
    pub structural_events: Vec<StructuralEvent>,
    pub parse_duration: Duration,
}

/// Output of the enrich stage.
#[derive(Clone, Debug)]
pub struct EnrichedDocument {
    pub parsed: ParsedDocument,
    pub embed_duration: Duration,
    pub cache_hits: usize,
    pub embeddings_computed: usize,
    /// True when the run skipped vector computation entirely.
    pub embeddings_skipped: bool,
}

/// Wall-clock time spent in each stage for one document.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StageTimings {
    #[serde(with = "duration_secs")]
    pub parse: Duration,
    #[serde(with = "duration_secs")]
    pub enrich: Duration,
    #[serde(with = "duration_secs")]
    pub persist: Duration,
}

/// Terminal outcome for one document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocumentResult {
    pub document_id: String,
    pub success: bool,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub cache_hits: usize,
    pub embeddings_computed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Stage name that produced the failure, when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub timings: StageTimings,
}

impl DocumentResult {
    pub fn failure(
        document_id: impl Into<String>,
        stage: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            success: false,
            nodes_created: 0,
            edges_created: 0,
            cache_hits: 0,
            embeddings_computed: 0,
            error_message: Some(message.into()),
            failed_stage: Some(stage.to_string()),
            timings: StageTimings::default(),
        }
    }
}

/// Min/mean/p95/max over per-document stage durations.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct StageSummary {
    pub documents: usize,
    #[serde(with = "duration_secs")]
    pub min: Duration,
    #[serde(with = "duration_secs")]
    pub mean: Duration,
    #[serde(with = "duration_secs")]
    pub p95: Duration,
    #[serde(with = "duration_secs")]
    pub max: Duration,
}

impl StageSummary {
    pub fn from_durations(mut durations: Vec<Duration>) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        durations.sort();
        let documents = durations.len();
        let total: Duration = durations.iter().sum();
        let p95_index = ((documents as f64) * 0.95).ceil() as usize;
        Self {
            documents,
            min: durations[0],
            mean: total / documents as u32,
            p95: durations[p95_index.min(documents) - 1],
            max: durations[documents - 1],
        }
    }
}

/// Dictionary preload counts for one run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DictionaryStats {
    pub subject_areas: usize,
    pub issuing_bodies: usize,
    pub ranks: usize,
}

/// Aggregate outcome of one ingestion run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub cache_hits: usize,
    pub embeddings_computed: usize,
    /// Cross-document citation edges written after the batch drained.
    pub reference_links: usize,
    pub dictionary: DictionaryStats,
    pub parse_summary: StageSummary,
    pub enrich_summary: StageSummary,
    pub persist_summary: StageSummary,
    pub results: Vec<DocumentResult>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
