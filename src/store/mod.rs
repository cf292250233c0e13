//! Storage abstraction for the property graph.
//!
//! The [`GraphStore`] trait defines one contract served by two backends:
//! the embedded SQLite store and a Neo4j graph database driven over its
//! HTTP transactional Cypher API. Every operation returns the same logical
//! result on both backends; callers never branch on which one is active.
//!
//! [`StorageAdapter`] is the only place backend selection lives. When the
//! graph backend is unreachable it transparently retries the operation on
//! the embedded store and tags subsequent responses with
//! `store: "sqlite_fallback"` — observable, but semantics-preserving.
//!
//! Writes within one call are atomic: readers observe either the pre- or
//! post-state, never a partial merge. Namespace-scoped writers serialize
//! through a per-namespace advisory lock held for the transaction.

pub mod neo4j;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::models::{Edge, Node, PropMap};

pub use neo4j::Neo4jStore;
pub use sqlite::SqliteStore;

/// Rows written per transaction during generic bulk upserts.
pub const BULK_CHUNK_ROWS: usize = 500;

/// Outcome of a single upsert: the row was created, or merged into an
/// existing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
}

/// Aggregate counters for a bulk write. `created_node_ids` feeds the
/// event bus (`node_added` is only published for genuinely new nodes).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkStats {
    pub nodes_created: u64,
    pub nodes_merged: u64,
    pub edges_created: u64,
    pub edges_merged: u64,
    #[serde(skip)]
    pub created_node_ids: Vec<String>,
}

impl BulkStats {
    pub fn absorb(&mut self, other: BulkStats) {
        self.nodes_created += other.nodes_created;
        self.nodes_merged += other.nodes_merged;
        self.edges_created += other.edges_created;
        self.edges_merged += other.edges_merged;
        self.created_node_ids.extend(other.created_node_ids);
    }
}

/// Subgraph sampling strategy for the graph exploration endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleMode {
    Random,
    /// Bounding box in layout space; nodes without stored layout
    /// coordinates are excluded.
    Viewport {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },
}

/// Aggregate counts for one namespace.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub node_count: u64,
    pub edge_count: u64,
    pub label_counts: HashMap<String, u64>,
}

/// A shortest path: node ids in order plus the traversed edges.
#[derive(Debug, Clone, Serialize)]
pub struct PathResult {
    pub node_ids: Vec<String>,
    pub edges: Vec<Edge>,
}

/// Abstract graph storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_node`](GraphStore::upsert_node) | Identity-matched node write with non-destructive merge |
/// | [`upsert_edge`](GraphStore::upsert_edge) | Edge write keeping the higher confidence on merge |
/// | [`bulk_upsert`](GraphStore::bulk_upsert) | Chunked transactional batch write |
/// | [`ingest_document_graph`](GraphStore::ingest_document_graph) | Atomic replace of one document's chunks/sections plus entity upserts |
/// | [`neighbors`](GraphStore::neighbors) | BFS neighborhood up to depth 2, namespace-scoped |
/// | [`sample_subgraph`](GraphStore::sample_subgraph) | Random or viewport-bounded sample |
/// | [`iterate_nodes`](GraphStore::iterate_nodes) | Cursor pagination, stable under concurrent inserts |
/// | [`shortest_path`](GraphStore::shortest_path) | BFS path between two nodes |
/// | [`export_graph`](GraphStore::export_graph) | Full namespace dump for analytics |
/// | [`update_node_properties`](GraphStore::update_node_properties) | Batched property merges (analytics writes) |
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node: &Node) -> Result<UpsertOutcome>;

    async fn upsert_edge(&self, edge: &Edge) -> Result<UpsertOutcome>;

    /// Transactional batch write, chunked at [`BULK_CHUNK_ROWS`] rows per
    /// transaction; a failure aborts the current chunk.
    async fn bulk_upsert(&self, nodes: &[Node], edges: &[Edge]) -> Result<BulkStats>;

    /// One-transaction ingest write for a single document: purges the
    /// document's previous chunk/section nodes and their edges, then
    /// upserts the new graph. No partial state is ever visible.
    async fn ingest_document_graph(
        &self,
        namespace: &str,
        doc_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<BulkStats>;

    async fn get_node(&self, id: &str) -> Result<Option<Node>>;

    /// Neighborhood BFS to `depth` (clamped to 2). Only nodes in the start
    /// node's namespace are returned.
    async fn neighbors(&self, id: &str, depth: u32) -> Result<(Vec<Node>, Vec<Edge>)>;

    /// Case-insensitive name-prefix search within a namespace.
    async fn search_by_name(&self, prefix: &str, namespace: &str, limit: i64)
        -> Result<Vec<Node>>;

    async fn sample_subgraph(
        &self,
        namespace: &str,
        mode: &SampleMode,
        cap: usize,
    ) -> Result<(Vec<Node>, Vec<Edge>)>;

    /// Opaque-cursor pagination ordered by insertion; nodes inserted after
    /// a page was served only ever appear on later pages.
    async fn iterate_nodes(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<(Vec<Node>, Option<String>)>;

    async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: u32,
    ) -> Result<Option<PathResult>>;

    /// Edges incident to any of `node_ids`, optionally filtered by
    /// relation labels.
    async fn edges_for(
        &self,
        node_ids: &[String],
        relations: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<Edge>>;

    /// Everything in a namespace, capped; used by analytics and retrieval
    /// candidate sampling.
    async fn export_graph(&self, namespace: &str, cap: usize) -> Result<(Vec<Node>, Vec<Edge>)>;

    /// Merge property maps into existing nodes (overwriting per key).
    /// Used by analytics, layout, and community passes.
    async fn update_node_properties(&self, updates: &[(String, PropMap)]) -> Result<u64>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn stats(&self, namespace: &str) -> Result<GraphStats>;

    fn backend_name(&self) -> &'static str;
}

type NamespaceLockMap = Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Backend selection and fallback. All call sites go through this adapter;
/// it is the only component aware that two backends exist.
pub struct StorageAdapter {
    sqlite: Arc<SqliteStore>,
    graph: Option<Arc<Neo4jStore>>,
    fell_back: AtomicBool,
    locks: NamespaceLockMap,
}

macro_rules! with_fallback {
    ($self:ident, $store:ident, $call:expr) => {{
        let primary: Arc<dyn GraphStore> = $self.primary();
        let $store = primary;
        match $call.await {
            Err(e) if e.is_backend_unavailable() && $self.graph.is_some() => {
                tracing::warn!(error = %e, "graph backend unreachable, falling back to embedded store");
                $self.fell_back.store(true, Ordering::Relaxed);
                let $store: Arc<dyn GraphStore> = $self.sqlite.clone();
                $call.await
            }
            other => other,
        }
    }};
}

impl StorageAdapter {
    pub fn new(sqlite: Arc<SqliteStore>, graph: Option<Arc<Neo4jStore>>) -> Self {
        Self {
            sqlite,
            graph,
            fell_back: AtomicBool::new(false),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn primary(&self) -> Arc<dyn GraphStore> {
        match &self.graph {
            Some(g) => g.clone(),
            None => self.sqlite.clone(),
        }
    }

    /// The embedded store, used directly by components that always live in
    /// SQLite regardless of the graph backend (ingest log, snapshots).
    pub fn embedded(&self) -> &Arc<SqliteStore> {
        &self.sqlite
    }

    /// Tag included in API responses: `sqlite`, `neo4j`, or
    /// `sqlite_fallback` once a fallback has occurred.
    pub fn store_tag(&self) -> &'static str {
        if self.graph.is_some() {
            if self.fell_back.load(Ordering::Relaxed) {
                "sqlite_fallback"
            } else {
                "neo4j"
            }
        } else {
            "sqlite"
        }
    }

    /// Whether the graph backend is configured at all.
    pub fn has_graph_backend(&self) -> bool {
        self.graph.is_some()
    }

    /// Acquire the advisory write lock for a namespace. Held for the
    /// duration of a write transaction; readers are unaffected.
    pub async fn lock_namespace(&self, namespace: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn upsert_node(&self, node: &Node) -> Result<UpsertOutcome> {
        with_fallback!(self, store, store.upsert_node(node))
    }

    pub async fn upsert_edge(&self, edge: &Edge) -> Result<UpsertOutcome> {
        with_fallback!(self, store, store.upsert_edge(edge))
    }

    pub async fn bulk_upsert(&self, nodes: &[Node], edges: &[Edge]) -> Result<BulkStats> {
        with_fallback!(self, store, store.bulk_upsert(nodes, edges))
    }

    pub async fn ingest_document_graph(
        &self,
        namespace: &str,
        doc_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<BulkStats> {
        with_fallback!(
            self,
            store,
            store.ingest_document_graph(namespace, doc_id, nodes, edges)
        )
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        with_fallback!(self, store, store.get_node(id))
    }

    pub async fn neighbors(&self, id: &str, depth: u32) -> Result<(Vec<Node>, Vec<Edge>)> {
        with_fallback!(self, store, store.neighbors(id, depth))
    }

    pub async fn search_by_name(
        &self,
        prefix: &str,
        namespace: &str,
        limit: i64,
    ) -> Result<Vec<Node>> {
        with_fallback!(self, store, store.search_by_name(prefix, namespace, limit))
    }

    pub async fn sample_subgraph(
        &self,
        namespace: &str,
        mode: &SampleMode,
        cap: usize,
    ) -> Result<(Vec<Node>, Vec<Edge>)> {
        with_fallback!(self, store, store.sample_subgraph(namespace, mode, cap))
    }

    pub async fn iterate_nodes(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<(Vec<Node>, Option<String>)> {
        with_fallback!(self, store, store.iterate_nodes(namespace, cursor, limit))
    }

    pub async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: u32,
    ) -> Result<Option<PathResult>> {
        with_fallback!(
            self,
            store,
            store.shortest_path(source_id, target_id, max_depth)
        )
    }

    pub async fn edges_for(
        &self,
        node_ids: &[String],
        relations: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<Edge>> {
        with_fallback!(self, store, store.edges_for(node_ids, relations, limit))
    }

    pub async fn export_graph(&self, namespace: &str, cap: usize) -> Result<(Vec<Node>, Vec<Edge>)> {
        with_fallback!(self, store, store.export_graph(namespace, cap))
    }

    pub async fn update_node_properties(&self, updates: &[(String, PropMap)]) -> Result<u64> {
        with_fallback!(self, store, store.update_node_properties(updates))
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        with_fallback!(self, store, store.list_namespaces())
    }

    pub async fn stats(&self, namespace: &str) -> Result<GraphStats> {
        with_fallback!(self, store, store.stats(namespace))
    }
}
