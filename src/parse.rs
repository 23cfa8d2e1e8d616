//! Parse stage: fetch a raw document and build its [`ContentTree`].
//!
//! Input format is a line-oriented outline:
//!
//! ```text
//! Civil Code of the Republic          <- first plain line is the title
//! Subjects: obligations; contracts    <- optional subject header
//! BOOK I General Provisions
//! TITLE II Sources of Law
//! CHAPTER 1 Scope
//! Section A Preliminary
//! Article 1
//! Body text of article one.
//! Articles 4 to 7 (Repealed)          <- compound heading, splits into 4 leaves
//! ```
//!
//! Compound headings ("Articles 4 to 7", "Articles 4, 5 and 6",
//! "Articles 4 and 5") describe several logical units in one block;
//! they are split into distinct leaves before enrichment so downstream
//! citations can target each unit individually. A trailing
//! "(Repealed)" or "(Amended)" marker sets the unit's validity.

use std::sync::Arc;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{FetchError, StageError};
use crate::fetch::DocumentFetcher;
use crate::model::tree::{ContentTree, NodeId, UnitKind, Validity};
use crate::model::{ParsedDocument, StructuralEvent};

/// Placeholder body for a heading-only article, keeping the non-empty
/// leaf invariant without inventing content.
const EMPTY_LEAF_TEXT: &str = "[no text recorded]";

struct LevelPattern {
    regex: Regex,
    kind: UnitKind,
}

/// Line-oriented outline parser. Stateless and shareable across workers.
pub struct OutlineParser {
    levels: Vec<LevelPattern>,
    compound_range: Regex,
    compound_list: Regex,
    compound_pair: Regex,
    validity_marker: Regex,
    subjects_header: Regex,
}

impl Default for OutlineParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutlineParser {
    pub fn new() -> Self {
        // Patterns are anchored and tried in hierarchy order; Article
        // last so compound forms are checked before the singular form.
        let levels = vec![
            LevelPattern {
                regex: Regex::new(r"^BOOK\s+(\S.*)$").expect("static regex"),
                kind: UnitKind::Book,
            },
            LevelPattern {
                regex: Regex::new(r"^TITLE\s+(\S.*)$").expect("static regex"),
                kind: UnitKind::Title,
            },
            LevelPattern {
                regex: Regex::new(r"^CHAPTER\s+(\S.*)$").expect("static regex"),
                kind: UnitKind::Chapter,
            },
            LevelPattern {
                regex: Regex::new(r"^Section\s+(\S.*)$").expect("static regex"),
                kind: UnitKind::Section,
            },
            LevelPattern {
                regex: Regex::new(r"^Article\s+(\d+[a-z]?)\b").expect("static regex"),
                kind: UnitKind::Article,
            },
        ];
        Self {
            levels,
            compound_range: Regex::new(r"^Articles\s+(\d+)\s+to\s+(\d+)\b").expect("static regex"),
            compound_list: Regex::new(r"^Articles\s+((?:\d+\s*,\s*)+\d+)\s+and\s+(\d+)\b")
                .expect("static regex"),
            compound_pair: Regex::new(r"^Articles\s+(\d+)\s+and\s+(\d+)\b").expect("static regex"),
            validity_marker: Regex::new(r"\((Repealed|Amended)\)\s*$").expect("static regex"),
            subjects_header: Regex::new(r"^Subjects:\s*(.+)$").expect("static regex"),
        }
    }

    /// Parse a raw body into a tree rooted at the document title.
    pub fn parse(&self, document_id: &str, body: &str) -> Result<ParsedDocument, StageError> {
        let started = Instant::now();
        let mut title = String::new();
        let mut subjects = Vec::new();
        let mut events = Vec::new();

        let mut tree = ContentTree::new(document_id);
        // Current attach point per structural depth; headings of a given
        // kind attach under the deepest shallower heading seen.
        let mut cursors: Vec<(UnitKind, NodeId)> = Vec::new();
        // Leaves the current text block belongs to. Compound splits make
        // this hold several ids sharing one body.
        let mut open_leaves: Vec<NodeId> = Vec::new();

        for (index, raw_line) in body.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            if title.is_empty() {
                title = line.to_string();
                tree.node_mut(tree.root()).label = title.clone();
                continue;
            }

            if let Some(captures) = self.subjects_header.captures(line) {
                subjects = captures[1]
                    .split(';')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                continue;
            }

            let validity = self.validity_of(line);

            if let Some(labels) = self.split_compound(line) {
                self.seal_open_leaves(&mut tree, &open_leaves, &mut events);
                let parent = Self::attach_point(&tree, &cursors);
                open_leaves = labels
                    .iter()
                    .map(|label| {
                        let id = tree.push_child(parent, UnitKind::Article, label.clone(), "");
                        tree.node_mut(id).validity = validity;
                        id
                    })
                    .collect();
                events.push(StructuralEvent::CompoundSplit {
                    label: self.strip_validity(line),
                    produced: labels.len(),
                });
                continue;
            }

            if let Some((kind, label)) = self.match_level(line) {
                self.seal_open_leaves(&mut tree, &open_leaves, &mut events);
                open_leaves.clear();
                if kind == UnitKind::Article {
                    let parent = Self::attach_point(&tree, &cursors);
                    let id = tree.push_child(parent, kind, label, "");
                    tree.node_mut(id).validity = validity;
                    open_leaves.push(id);
                } else {
                    // Pop cursors at the same or deeper level.
                    cursors.retain(|(k, _)| Self::depth(*k) < Self::depth(kind));
                    let parent = Self::attach_point(&tree, &cursors);
                    let id = tree.push_child(parent, kind, self.strip_validity(line), "");
                    cursors.push((kind, id));
                }
                continue;
            }

            // Plain line: body text for whichever leaves are open.
            if open_leaves.is_empty() {
                events.push(StructuralEvent::UnrecognizedLine {
                    line_number: index + 1,
                });
                warn!(document_id, line_number = index + 1, "line outside any article");
                continue;
            }
            for &id in &open_leaves {
                let node = tree.node_mut(id);
                if !node.text.is_empty() {
                    node.text.push('\n');
                }
                node.text.push_str(line);
            }
        }

        self.seal_open_leaves(&mut tree, &open_leaves, &mut events);

        if title.is_empty() {
            return Err(StageError::Parse(format!(
                "document {document_id} is empty"
            )));
        }
        if tree.leaf_count() == 0 {
            return Err(StageError::Parse(format!(
                "document {document_id} contains no articles"
            )));
        }

        debug!(
            document_id,
            nodes = tree.len(),
            leaves = tree.leaf_count(),
            "parsed document"
        );
        Ok(ParsedDocument {
            document_id: document_id.to_string(),
            title,
            subjects,
            tree,
            structural_events: events,
            parse_duration: started.elapsed(),
        })
    }

    /// Article labels a compound heading expands to, if it is one.
    fn split_compound(&self, line: &str) -> Option<Vec<String>> {
        if let Some(captures) = self.compound_range.captures(line) {
            let start: u32 = captures[1].parse().ok()?;
            let end: u32 = captures[2].parse().ok()?;
            if end < start || end - start > 200 {
                return None;
            }
            return Some((start..=end).map(|n| format!("Article {n}")).collect());
        }
        if let Some(captures) = self.compound_list.captures(line) {
            let mut labels: Vec<String> = captures[1]
                .split(',')
                .filter_map(|part| part.trim().parse::<u32>().ok())
                .map(|n| format!("Article {n}"))
                .collect();
            if let Ok(last) = captures[2].parse::<u32>() {
                labels.push(format!("Article {last}"));
            }
            return Some(labels);
        }
        if let Some(captures) = self.compound_pair.captures(line) {
            return Some(vec![
                format!("Article {}", &captures[1]),
                format!("Article {}", &captures[2]),
            ]);
        }
        None
    }

    fn match_level(&self, line: &str) -> Option<(UnitKind, String)> {
        for level in &self.levels {
            if let Some(captures) = level.regex.captures(line) {
                let label = if level.kind == UnitKind::Article {
                    format!("Article {}", &captures[1])
                } else {
                    self.strip_validity(line)
                };
                return Some((level.kind, label));
            }
        }
        None
    }

    fn validity_of(&self, line: &str) -> Option<Validity> {
        self.validity_marker
            .captures(line)
            .map(|captures| match &captures[1] {
                "Repealed" => Validity::Repealed,
                _ => Validity::Amended,
            })
    }

    fn strip_validity(&self, line: &str) -> String {
        self.validity_marker.replace(line, "").trim().to_string()
    }

    /// Fill placeholder text into any open leaf left bodyless.
    fn seal_open_leaves(
        &self,
        tree: &mut ContentTree,
        open: &[NodeId],
        events: &mut Vec<StructuralEvent>,
    ) {
        for &id in open {
            if tree.node(id).text.is_empty() {
                let label = tree.node(id).label.clone();
                tree.node_mut(id).text = EMPTY_LEAF_TEXT.to_string();
                events.push(StructuralEvent::EmptyLeafFilled { label });
            }
        }
    }

    fn attach_point(tree: &ContentTree, cursors: &[(UnitKind, NodeId)]) -> NodeId {
        cursors.last().map_or(tree.root(), |&(_, id)| id)
    }

    fn depth(kind: UnitKind) -> usize {
        match kind {
            UnitKind::Root => 0,
            UnitKind::Book => 1,
            UnitKind::Title => 2,
            UnitKind::Chapter => 3,
            UnitKind::Section => 4,
            UnitKind::Article => 5,
        }
    }
}

/// Fetch + parse, with backoff retries on transient fetch failures.
pub struct ParseStage {
    fetcher: Arc<dyn DocumentFetcher>,
    parser: OutlineParser,
    retry: RetryPolicy,
}

impl ParseStage {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, retry: RetryPolicy) -> Self {
        Self {
            fetcher,
            parser: OutlineParser::new(),
            retry,
        }
    }

    pub async fn process(&self, document_id: &str) -> Result<ParsedDocument, StageError> {
        let raw = self.fetch_with_retry(document_id).await?;
        self.parser.parse(document_id, &raw)
    }

    async fn fetch_with_retry(&self, document_id: &str) -> Result<String, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetcher.fetch(document_id).await {
                Ok(raw) => return Ok(raw.body),
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        document_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fetch::FixtureFetcher;

    const TEST_RETRY_DELAY: Duration = Duration::from_millis(1);

    const SAMPLE: &str = "\
Civil Code of the Republic
Subjects: obligations; contracts
BOOK I General Provisions
CHAPTER 1 Scope
Article 1
Law binds everyone within the territory.
Article 2 (Repealed)
Articles 4 to 6
Compound body shared by three units.
CHAPTER 2 Application
Articles 10 and 11 (Amended)
Another shared body.
";

    fn parse_sample() -> ParsedDocument {
        OutlineParser::new().parse("LAW-1", SAMPLE).unwrap()
    }

    #[test]
    fn extracts_title_and_subjects() {
        let doc = parse_sample();
        assert_eq!(doc.title, "Civil Code of the Republic");
        assert_eq!(doc.subjects, ["obligations", "contracts"]);
    }

    #[test]
    fn splits_compound_range_into_distinct_leaves() {
        let doc = parse_sample();
        let labels: Vec<String> = doc
            .tree
            .leaves()
            .into_iter()
            .map(|id| doc.tree.node(id).label.clone())
            .collect();
        assert!(labels.contains(&"Article 4".to_string()));
        assert!(labels.contains(&"Article 5".to_string()));
        assert!(labels.contains(&"Article 6".to_string()));
        // The three split leaves share the compound body.
        for n in 4..=6 {
            let id = doc
                .tree
                .leaves()
                .into_iter()
                .find(|&id| doc.tree.node(id).label == format!("Article {n}"))
                .unwrap();
            assert_eq!(doc.tree.node(id).text, "Compound body shared by three units.");
        }
        assert!(doc.structural_events.iter().any(|e| matches!(
            e,
            StructuralEvent::CompoundSplit { produced: 3, .. }
        )));
    }

    #[test]
    fn pair_form_carries_validity_to_both_leaves() {
        let doc = parse_sample();
        for label in ["Article 10", "Article 11"] {
            let id = doc
                .tree
                .leaves()
                .into_iter()
                .find(|&id| doc.tree.node(id).label == label)
                .unwrap();
            assert_eq!(doc.tree.node(id).validity, Some(Validity::Amended));
        }
    }

    #[test]
    fn list_form_expands_every_member() {
        let doc = OutlineParser::new()
            .parse("LAW-2", "Some Law\nArticles 3, 5 and 8\nShared text.\n")
            .unwrap();
        let labels: Vec<String> = doc
            .tree
            .leaves()
            .into_iter()
            .map(|id| doc.tree.node(id).label.clone())
            .collect();
        assert_eq!(labels, ["Article 3", "Article 5", "Article 8"]);
    }

    #[test]
    fn bodyless_leaf_gets_placeholder_text() {
        let doc = parse_sample();
        let id = doc
            .tree
            .leaves()
            .into_iter()
            .find(|&id| doc.tree.node(id).label == "Article 2")
            .unwrap();
        assert_eq!(doc.tree.node(id).text, EMPTY_LEAF_TEXT);
        assert_eq!(doc.tree.node(id).validity, Some(Validity::Repealed));
        // Invariant: no leaf leaves the stage empty.
        for id in doc.tree.leaves() {
            assert!(!doc.tree.node(id).text.is_empty());
        }
    }

    #[test]
    fn hierarchy_reflects_heading_nesting() {
        let doc = parse_sample();
        let id = doc
            .tree
            .leaves()
            .into_iter()
            .find(|&id| doc.tree.node(id).label == "Article 1")
            .unwrap();
        assert_eq!(
            doc.tree.hierarchy_path(id),
            "Civil Code of the Republic > BOOK I General Provisions > CHAPTER 1 Scope"
        );
    }

    #[test]
    fn empty_document_is_a_parse_failure() {
        let err = OutlineParser::new().parse("LAW-X", "").unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
        let err = OutlineParser::new()
            .parse("LAW-Y", "Title Only\n")
            .unwrap_err();
        assert!(matches!(err, StageError::Parse(_)));
    }

    struct FlakyFetcher {
        inner: FixtureFetcher,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl FlakyFetcher {
        fn new(inner: FixtureFetcher, failures: usize) -> Self {
            Self {
                inner,
                failures: std::sync::atomic::AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::fetch::DocumentFetcher for FlakyFetcher {
        async fn fetch(&self, document_id: &str) -> Result<crate::fetch::RawDocument, FetchError> {
            use std::sync::atomic::Ordering;
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FetchError::Transient("connection reset".into()));
            }
            self.inner.fetch(document_id).await
        }
    }

    #[tokio::test]
    async fn transient_fetch_failures_are_retried_to_success() {
        let fixture = FixtureFetcher::new().with_document("LAW-1", SAMPLE.to_string());
        // Two failures fit inside a three-attempt budget.
        let stage = ParseStage::new(
            Arc::new(FlakyFetcher::new(fixture, 2)),
            RetryPolicy {
                max_attempts: 3,
                base_delay: TEST_RETRY_DELAY,
            },
        );
        let doc = stage.process("LAW-1").await.unwrap();
        assert_eq!(doc.title, "Civil Code of the Republic");
    }

    #[tokio::test]
    async fn exhausted_retries_become_a_permanent_failure() {
        let fixture = FixtureFetcher::new().with_document("LAW-1", SAMPLE.to_string());
        let stage = ParseStage::new(
            Arc::new(FlakyFetcher::new(fixture, 3)),
            RetryPolicy {
                max_attempts: 3,
                base_delay: TEST_RETRY_DELAY,
            },
        );
        let err = stage.process("LAW-1").await.unwrap_err();
        assert!(matches!(err, StageError::Fetch(FetchError::Transient(_))));
        assert_eq!(err.stage(), "parse");
    }

    #[tokio::test]
    async fn stage_surfaces_not_found_as_permanent_failure() {
        let stage = ParseStage::new(
            Arc::new(FixtureFetcher::new()),
            RetryPolicy {
                max_attempts: 2,
                base_delay: TEST_RETRY_DELAY,
            },
        );
        let err = stage.process("MISSING").await.unwrap_err();
        assert!(matches!(err, StageError::Fetch(FetchError::NotFound { .. })));
    }
}
