//! Arena-backed hierarchy of structural units within one document.
//!
//! Nodes are stored in a flat `Vec` and addressed by [`NodeId`] so that
//! subtrees can be partitioned across concurrent enrichment tasks
//! without aliasing: each task receives a disjoint set of ids and the
//! gather step writes vectors back through exclusive indices.

use serde::{Deserialize, Serialize};

/// Index of a node inside its [`ContentTree`] arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Structural level of a unit. `Article` is the only leaf kind; every
/// other kind is an internal grouping node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Root,
    Book,
    Title,
    Chapter,
    Section,
    Article,
}

impl UnitKind {
    pub fn is_leaf(self) -> bool {
        matches!(self, UnitKind::Article)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Root => "root",
            UnitKind::Book => "book",
            UnitKind::Title => "title",
            UnitKind::Chapter => "chapter",
            UnitKind::Section => "section",
            UnitKind::Article => "article",
        }
    }
}

/// Temporal status of a unit, when the source text declares one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    InForce,
    Repealed,
    Amended,
}

impl Validity {
    pub fn as_str(self) -> &'static str {
        match self {
            Validity::InForce => "in_force",
            Validity::Repealed => "repealed",
            Validity::Amended => "amended",
        }
    }
}

/// One structural unit: a heading node or an article leaf.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnitNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: UnitKind,
    /// Human label, e.g. "Article 12" or "Chapter III".
    pub label: String,
    /// Body text. Non-empty for every leaf.
    pub text: String,
    pub validity: Option<Validity>,
    /// Embedding vector, populated by the enrich stage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

/// Arena of [`UnitNode`]s rooted at node 0.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ContentTree {
    nodes: Vec<UnitNode>,
}

impl ContentTree {
    /// Create a tree containing only a root node with the given label.
    pub fn new(root_label: impl Into<String>) -> Self {
        let root = UnitNode {
            id: NodeId(0),
            parent: None,
            children: Vec::new(),
            kind: UnitKind::Root,
            label: root_label.into(),
            text: String::new(),
            validity: None,
            vector: None,
        };
        Self { nodes: vec![root] }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Append a child under `parent` and return its id.
    pub fn push_child(
        &mut self,
        parent: NodeId,
        kind: UnitKind,
        label: impl Into<String>,
        text: impl Into<String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(UnitNode {
            id,
            parent: Some(parent),
            children: Vec::new(),
            kind,
            label: label.into(),
            text: text.into(),
            validity: None,
            vector: None,
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn node(&self, id: NodeId) -> &UnitNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut UnitNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitNode> {
        self.nodes.iter()
    }

    /// Ids of all leaf (article) nodes, in insertion order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind.is_leaf()).count()
    }

    /// Labels from the root down to (and excluding) `id`, joined with " > ".
    pub fn hierarchy_path(&self, id: NodeId) -> String {
        self.path_labels(id, true).join(" > ")
    }

    /// Like [`hierarchy_path`](Self::hierarchy_path) but without the
    /// root label, so the result carries no document identity. Used as
    /// the context prefix of embedding input, keeping the content hash
    /// stable for identical articles across documents.
    pub fn structural_path(&self, id: NodeId) -> String {
        self.path_labels(id, false).join(" > ")
    }

    fn path_labels(&self, id: NodeId, include_root: bool) -> Vec<String> {
        let mut labels = Vec::new();
        let mut current = self.nodes[id.0].parent;
        while let Some(parent) = current {
            if parent.0 != 0 || include_root {
                labels.push(self.nodes[parent.0].label.clone());
            }
            current = self.nodes[parent.0].parent;
        }
        labels.reverse();
        labels
    }

    /// Children of `id`, depth-first preorder over the whole subtree.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.nodes[id.0].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev().copied());
        }
        out
    }
}
