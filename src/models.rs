//! Core data model for the property graph.
//!
//! Everything in the graph is scoped by a **namespace** (a tenant-like
//! string); identity and traversal never cross namespaces. The data
//! lifecycle is:
//!
//! ```text
//! Document → chunker → (Section, Chunk) ┐
//!                                       ├─▶ Node / Edge ─▶ GraphStore
//! Document → extractor → Entity ────────┘
//!                                            │
//!                           analytics ───────┤ (metrics, layout, communities)
//!                           orchestrator ────┘ (delta re-index, merge)
//! ```
//!
//! # Identity
//!
//! | Kind | Node id | Identity key |
//! |------|---------|--------------|
//! | Entity-like | `namespace:lower(name)` | `(namespace, label, normalized_name)` |
//! | Chunk | `namespace:doc_id:chunk_index` | `(namespace, doc_id, chunk_index)` |
//! | Section | `namespace:doc_id:section_path` | `(namespace, doc_id, section_path)` |
//!
//! Edge ids are derived from `(source_id, target_id, relation)` unless
//! supplied by the extractor.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Open key→value property bag carried by nodes and edges.
pub type PropMap = serde_json::Map<String, serde_json::Value>;

/// Namespace used when a request does not specify one.
pub const DEFAULT_NAMESPACE: &str = "public";

/// Default confidence for edges created without an explicit score.
pub const DEFAULT_EDGE_CONFIDENCE: f64 = 0.6;

/// Closed set of node labels. LLM-supplied labels are normalized into this
/// set; anything unrecognized becomes [`NodeLabel::Entity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeLabel {
    Entity,
    Technology,
    Organization,
    Role,
    Achievement,
    Section,
    Chunk,
}

impl NodeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entity => "Entity",
            Self::Technology => "Technology",
            Self::Organization => "Organization",
            Self::Role => "Role",
            Self::Achievement => "Achievement",
            Self::Section => "Section",
            Self::Chunk => "Chunk",
        }
    }

    /// Normalize a free-form label into the closed set.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "technology" | "tool" | "framework" | "tech" => Self::Technology,
            "organization" | "company" | "org" => Self::Organization,
            "role" | "title" | "position" => Self::Role,
            "achievement" | "award" => Self::Achievement,
            "section" => Self::Section,
            "chunk" => Self::Chunk,
            _ => Self::Entity,
        }
    }

    /// Labels that participate in entity identity (everything that is not
    /// a structural Section/Chunk node).
    pub fn is_entity_kind(&self) -> bool {
        !matches!(self, Self::Section | Self::Chunk)
    }
}

impl std::fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known relation labels. The `relation` field on [`Edge`] is an open
/// upper-cased string so LLM-supplied labels survive, but the core pipeline
/// only emits these.
pub mod relation {
    /// Section → Chunk containment.
    pub const CONTAINS: &str = "CONTAINS";
    /// Section → Entity.
    pub const HAS_ENTITY: &str = "HAS_ENTITY";
    /// Entity → Chunk mention provenance.
    pub const MENTIONED_IN: &str = "MENTIONED_IN";
    /// Entity ↔ Entity co-occurrence within one chunk.
    pub const CO_OCCURS: &str = "CO_OCCURS";
    /// Role → Organization.
    pub const ROLE_AT: &str = "ROLE_AT";
    /// Role/Organization → Technology.
    pub const USES_TECH: &str = "USES_TECH";
    /// Generic fallback relation.
    pub const RELATED_TO: &str = "RELATED_TO";
}

/// A node in the property graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub label: NodeLabel,
    pub name: String,
    pub namespace: String,
    /// Fixed-dimension embedding vector; empty when embeddings are disabled
    /// or the provider failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub properties: PropMap,
    /// Doc ids that contributed this node; unioned on merge.
    #[serde(default)]
    pub source_ids: Vec<String>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        label: NodeLabel,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            label,
            name: name.into(),
            namespace: namespace.into(),
            embedding: Vec::new(),
            properties: PropMap::new(),
            source_ids: Vec::new(),
        }
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(|v| v.as_f64())
    }

    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn set_prop(&mut self, key: &str, value: serde_json::Value) {
        self.properties.insert(key.to_string(), value);
    }

    /// Layout coordinates, when a layout pass has run.
    pub fn layout_xy(&self) -> Option<(f64, f64)> {
        let layout = self.properties.get("layout")?.as_object()?;
        Some((layout.get("x")?.as_f64()?, layout.get("y")?.as_f64()?))
    }
}

/// A directed, typed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    /// Upper-cased relation label; see [`relation`] for the core set.
    pub relation: String,
    /// Confidence in `[0, 1]`; merges keep the maximum.
    pub confidence: f64,
    pub namespace: String,
    #[serde(default)]
    pub properties: PropMap,
}

impl Edge {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relation: &str,
        confidence: f64,
        namespace: impl Into<String>,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        let relation = relation.to_uppercase();
        let id = derive_edge_id(&source_id, &target_id, &relation);
        Self {
            id,
            source_id,
            target_id,
            relation,
            confidence: confidence.clamp(0.0, 1.0),
            namespace: namespace.into(),
            properties: PropMap::new(),
        }
    }
}

// ---- Identity derivation ----

/// Lower-cased, whitespace-trimmed entity name used for identity.
pub fn normalized_name(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn entity_node_id(namespace: &str, name: &str) -> String {
    format!("{}:{}", namespace, normalized_name(name))
}

pub fn chunk_node_id(namespace: &str, doc_id: &str, chunk_index: usize) -> String {
    format!("{}:{}:{}", namespace, doc_id, chunk_index)
}

pub fn section_node_id(namespace: &str, doc_id: &str, section_path: &str) -> String {
    format!("{}:{}:{}", namespace, doc_id, section_path)
}

/// Stable edge id from the edge identity triple.
pub fn derive_edge_id(source_id: &str, target_id: &str, relation: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update(b"|");
    hasher.update(target_id.as_bytes());
    hasher.update(b"|");
    hasher.update(relation.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("e{}", &digest[..16])
}

/// SHA-256 hex digest of document content, used for NOOP detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// UTC ISO-8601 timestamp with `Z` suffix; all persisted timestamps use
/// this format.
pub fn utc_now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Compact UTC timestamp for run directory names.
pub fn utc_now_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S%3f").to_string()
}

// ---- IngestLog ----

/// Lifecycle status of a document in the ingest log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// Registered but never indexed into the graph.
    New,
    Indexed,
    /// Content changed since last index; picked up by the next delta run.
    Stale,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Indexed => "indexed",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "stale" => Self::Stale,
            "failed" => Self::Failed,
            _ => Self::New,
        }
    }
}

/// Per-`(namespace, doc_id)` ingest tracking record; drives delta
/// selection in the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRecord {
    pub namespace: String,
    pub doc_id: String,
    pub content_hash: String,
    pub first_seen: String,
    pub last_indexed_at: Option<String>,
    pub status: IngestStatus,
    pub error: Option<String>,
}

// ---- RunRecord ----

/// Outcome status of an orchestrated index run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Failed,
    ImportFailed,
    Noop,
    Locked,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::Noop => "NOOP",
            Self::Locked => "LOCKED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => Self::Success,
            "PARTIAL" => Self::Partial,
            "FAILED" => Self::Failed,
            "IMPORT_FAILED" => Self::ImportFailed,
            "NOOP" => Self::Noop,
            "LOCKED" => Self::Locked,
            _ => Self::Running,
        }
    }
}

/// Persisted record of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub namespace: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: RunStatus,
    pub stale_docs: u64,
    pub indexed_docs: u64,
    pub nodes_new: u64,
    pub edges_new: u64,
    pub percent_reused_nodes: Option<f64>,
    pub percent_reused_edges: Option<f64>,
    pub artifact_dir: Option<String>,
}

// ---- Snapshot ----

/// Immutable capture of graph identity sets and aggregate metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub namespace: String,
    pub created_at: String,
    pub node_count: u64,
    pub edge_count: u64,
    pub modularity: Option<f64>,
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
    pub community_ids: Vec<String>,
}

/// Pairwise structural diff between two snapshots. Pure function output;
/// computing it never mutates stored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub a: String,
    pub b: String,
    pub added_nodes: Vec<String>,
    pub removed_nodes: Vec<String>,
    pub added_edges: Vec<String>,
    pub removed_edges: Vec<String>,
    pub added_communities: Vec<String>,
    pub removed_communities: Vec<String>,
    pub delta_nodes: i64,
    pub delta_edges: i64,
    pub delta_modularity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_is_namespaced_and_lowercased() {
        assert_eq!(entity_node_id("public", "OpenAI"), "public:openai");
        assert_eq!(entity_node_id("teamA", "  Rust  "), "teamA:rust");
    }

    #[test]
    fn test_chunk_and_section_ids() {
        assert_eq!(chunk_node_id("ns", "d1", 3), "ns:d1:3");
        assert_eq!(section_node_id("ns", "d1", "intro"), "ns:d1:intro");
    }

    #[test]
    fn test_edge_id_is_stable() {
        let a = derive_edge_id("n1", "n2", "CO_OCCURS");
        let b = derive_edge_id("n1", "n2", "CO_OCCURS");
        assert_eq!(a, b);
        assert_ne!(a, derive_edge_id("n2", "n1", "CO_OCCURS"));
        assert_ne!(a, derive_edge_id("n1", "n2", "MENTIONED_IN"));
    }

    #[test]
    fn test_label_normalization() {
        assert_eq!(NodeLabel::parse("company"), NodeLabel::Organization);
        assert_eq!(NodeLabel::parse("TOOL"), NodeLabel::Technology);
        assert_eq!(NodeLabel::parse("whatever"), NodeLabel::Entity);
        assert!(!NodeLabel::Chunk.is_entity_kind());
        assert!(NodeLabel::Role.is_entity_kind());
    }

    #[test]
    fn test_edge_new_uppercases_and_clamps() {
        let e = Edge::new("a", "b", "mentioned_in", 1.7, "public");
        assert_eq!(e.relation, "MENTIONED_IN");
        assert_eq!(e.confidence, 1.0);
        let e2 = Edge::new("a", "b", "CO_OCCURS", -0.5, "public");
        assert_eq!(e2.confidence, 0.0);
    }

    #[test]
    fn test_run_status_roundtrip() {
        for s in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::ImportFailed,
            RunStatus::Noop,
            RunStatus::Locked,
        ] {
            assert_eq!(RunStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_utc_timestamp_has_z_suffix() {
        assert!(utc_now_iso().ends_with('Z'));
    }
}
