//! Embedded SQLite backend.
//!
//! The system of record. All merge semantics live in plain read-modify-write
//! transactions so they stay identical to the graph backend:
//!
//! - node upsert matches by id (which encodes identity), unions properties
//!   non-destructively, appends `source_ids`, and only replaces an
//!   embedding when the prior one was empty;
//! - edge upsert matches `(source_id, target_id, relation)` and keeps the
//!   higher confidence;
//! - a label mismatch on an existing node id is a fatal integrity
//!   violation, never auto-healed.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{GraphLoomError, Result};
use crate::models::{Edge, Node, NodeLabel, PropMap};

use super::{
    BulkStats, GraphStats, GraphStore, PathResult, SampleMode, UpsertOutcome, BULK_CHUNK_ROWS,
};

/// Upper bound on rows pulled into memory for namespace-wide scans
/// (analytics export, BFS adjacency, viewport filtering).
const EXPORT_NODE_CAP: usize = 10_000;
const EXPORT_EDGE_CAP: usize = 40_000;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn node_from_row(row: &SqliteRow) -> Node {
    let properties: String = row.get("properties");
    let source_ids: String = row.get("source_ids");
    let embedding: Option<Vec<u8>> = row.get("embedding");
    let label: String = row.get("label");
    Node {
        id: row.get("id"),
        label: NodeLabel::parse(&label),
        name: row.get("name"),
        namespace: row.get("namespace"),
        embedding: embedding.map(|b| blob_to_vec(&b)).unwrap_or_default(),
        properties: serde_json::from_str(&properties).unwrap_or_default(),
        source_ids: serde_json::from_str(&source_ids).unwrap_or_default(),
    }
}

fn edge_from_row(row: &SqliteRow) -> Edge {
    let properties: String = row.get("properties");
    Edge {
        id: row.get("id"),
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        relation: row.get("relation"),
        confidence: row.get("confidence"),
        namespace: row.get("namespace"),
        properties: serde_json::from_str(&properties).unwrap_or_default(),
    }
}

/// Union `incoming` into `base` without clobbering existing values; only
/// null placeholders are replaced.
fn merge_props_non_destructive(base: &mut PropMap, incoming: &PropMap) {
    for (k, v) in incoming {
        let replace = match base.get(k) {
            None => true,
            Some(existing) => existing.is_null(),
        };
        if replace {
            base.insert(k.clone(), v.clone());
        }
    }
}

async fn upsert_node_conn(conn: &mut SqliteConnection, node: &Node) -> Result<UpsertOutcome> {
    let existing = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(&node.id)
        .fetch_optional(&mut *conn)
        .await?;

    let Some(row) = existing else {
        sqlx::query(
            r#"
            INSERT INTO nodes (id, label, name, namespace, embedding, properties, source_ids)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(node.label.as_str())
        .bind(&node.name)
        .bind(&node.namespace)
        .bind(if node.embedding.is_empty() {
            None
        } else {
            Some(vec_to_blob(&node.embedding))
        })
        .bind(serde_json::to_string(&node.properties)?)
        .bind(serde_json::to_string(&node.source_ids)?)
        .execute(&mut *conn)
        .await?;
        return Ok(UpsertOutcome { created: true });
    };

    let mut current = node_from_row(&row);
    if current.label != node.label {
        return Err(GraphLoomError::Fatal(format!(
            "identity collision for node '{}': stored label {} vs incoming {}",
            node.id, current.label, node.label
        )));
    }

    merge_props_non_destructive(&mut current.properties, &node.properties);
    for sid in &node.source_ids {
        if !current.source_ids.contains(sid) {
            current.source_ids.push(sid.clone());
        }
    }
    if current.embedding.is_empty() && !node.embedding.is_empty() {
        current.embedding = node.embedding.clone();
    }

    sqlx::query(
        "UPDATE nodes SET embedding = ?, properties = ?, source_ids = ? WHERE id = ?",
    )
    .bind(if current.embedding.is_empty() {
        None
    } else {
        Some(vec_to_blob(&current.embedding))
    })
    .bind(serde_json::to_string(&current.properties)?)
    .bind(serde_json::to_string(&current.source_ids)?)
    .bind(&node.id)
    .execute(&mut *conn)
    .await?;

    Ok(UpsertOutcome { created: false })
}

async fn upsert_edge_conn(conn: &mut SqliteConnection, edge: &Edge) -> Result<UpsertOutcome> {
    let existing =
        sqlx::query("SELECT * FROM edges WHERE source_id = ? AND target_id = ? AND relation = ?")
            .bind(&edge.source_id)
            .bind(&edge.target_id)
            .bind(&edge.relation)
            .fetch_optional(&mut *conn)
            .await?;

    let Some(row) = existing else {
        sqlx::query(
            r#"
            INSERT INTO edges (id, source_id, target_id, relation, confidence, namespace, properties)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.id)
        .bind(&edge.source_id)
        .bind(&edge.target_id)
        .bind(&edge.relation)
        .bind(edge.confidence)
        .bind(&edge.namespace)
        .bind(serde_json::to_string(&edge.properties)?)
        .execute(&mut *conn)
        .await?;
        return Ok(UpsertOutcome { created: true });
    };

    let mut current = edge_from_row(&row);
    current.confidence = current.confidence.max(edge.confidence);
    merge_props_non_destructive(&mut current.properties, &edge.properties);

    sqlx::query("UPDATE edges SET confidence = ?, properties = ? WHERE id = ?")
        .bind(current.confidence)
        .bind(serde_json::to_string(&current.properties)?)
        .bind(&current.id)
        .execute(&mut *conn)
        .await?;

    Ok(UpsertOutcome { created: false })
}

fn chunked_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Relations that carry structure or weak evidence rather than semantics;
/// path search treats them as fallbacks.
fn is_weak_relation(relation: &str) -> bool {
    matches!(
        relation,
        crate::models::relation::CO_OCCURS
            | crate::models::relation::MENTIONED_IN
            | crate::models::relation::CONTAINS
            | crate::models::relation::HAS_ENTITY
    )
}

fn bfs_path(edges: &[&Edge], source_id: &str, target_id: &str, max_depth: u32) -> Option<PathResult> {
    let mut adjacency: HashMap<&str, Vec<(&str, &Edge)>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source_id.as_str())
            .or_default()
            .push((edge.target_id.as_str(), edge));
        adjacency
            .entry(edge.target_id.as_str())
            .or_default()
            .push((edge.source_id.as_str(), edge));
    }

    let mut prev: HashMap<&str, (&str, &Edge)> = HashMap::new();
    let mut visited: HashSet<&str> = HashSet::from([source_id]);
    let mut queue: VecDeque<(&str, u32)> = VecDeque::from([(source_id, 0)]);
    let mut found = false;

    while let Some((current, dist)) = queue.pop_front() {
        if current == target_id {
            found = true;
            break;
        }
        if dist >= max_depth {
            continue;
        }
        if let Some(nexts) = adjacency.get(current) {
            for &(next, edge) in nexts {
                if visited.insert(next) {
                    prev.insert(next, (current, edge));
                    queue.push_back((next, dist + 1));
                }
            }
        }
    }

    if !found {
        return None;
    }

    let mut node_ids = vec![target_id.to_string()];
    let mut path_edges: Vec<Edge> = Vec::new();
    let mut cursor = target_id;
    while let Some(&(parent, edge)) = prev.get(cursor) {
        node_ids.push(parent.to_string());
        path_edges.push(edge.clone());
        cursor = parent;
    }
    node_ids.reverse();
    path_edges.reverse();
    Some(PathResult {
        node_ids,
        edges: path_edges,
    })
}

async fn fetch_edges_touching(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<Vec<Edge>> {
    let mut out = Vec::new();
    for chunk in ids.chunks(100) {
        let marks = chunked_placeholders(chunk.len());
        let sql = format!(
            "SELECT * FROM edges WHERE source_id IN ({marks}) OR target_id IN ({marks})"
        );
        let mut query = sqlx::query(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for id in chunk {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&mut *conn).await?;
        out.extend(rows.iter().map(edge_from_row));
    }
    Ok(out)
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn upsert_node(&self, node: &Node) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_node_conn(&mut *tx, node).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_edge_conn(&mut *tx, edge).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn bulk_upsert(&self, nodes: &[Node], edges: &[Edge]) -> Result<BulkStats> {
        let mut stats = BulkStats::default();

        for chunk in nodes.chunks(BULK_CHUNK_ROWS) {
            let mut tx = self.pool.begin().await?;
            for node in chunk {
                if upsert_node_conn(&mut *tx, node).await?.created {
                    stats.nodes_created += 1;
                    stats.created_node_ids.push(node.id.clone());
                } else {
                    stats.nodes_merged += 1;
                }
            }
            tx.commit().await?;
        }
        for chunk in edges.chunks(BULK_CHUNK_ROWS) {
            let mut tx = self.pool.begin().await?;
            for edge in chunk {
                if upsert_edge_conn(&mut *tx, edge).await?.created {
                    stats.edges_created += 1;
                } else {
                    stats.edges_merged += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(stats)
    }

    async fn ingest_document_graph(
        &self,
        namespace: &str,
        doc_id: &str,
        nodes: &[Node],
        edges: &[Edge],
    ) -> Result<BulkStats> {
        let mut tx = self.pool.begin().await?;

        // Structural nodes for this doc are replaced wholesale; entity
        // nodes merge. Chunk text is immutable, so replacement (not
        // mutation) is the only way chunk content changes.
        let prefix = format!("{}:{}:", namespace, doc_id);
        let stale_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM nodes WHERE namespace = ? AND label IN ('Chunk', 'Section') AND id LIKE ? || '%'",
        )
        .bind(namespace)
        .bind(&prefix)
        .fetch_all(&mut *tx)
        .await?;

        for chunk in stale_ids.chunks(100) {
            let marks = chunked_placeholders(chunk.len());
            let sql = format!(
                "DELETE FROM edges WHERE source_id IN ({marks}) OR target_id IN ({marks})"
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;

            let sql = format!("DELETE FROM nodes WHERE id IN ({marks})");
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&mut *tx).await?;
        }

        let mut stats = BulkStats::default();
        for node in nodes {
            if upsert_node_conn(&mut *tx, node).await?.created {
                stats.nodes_created += 1;
                stats.created_node_ids.push(node.id.clone());
            } else {
                stats.nodes_merged += 1;
            }
        }
        for edge in edges {
            if upsert_edge_conn(&mut *tx, edge).await?.created {
                stats.edges_created += 1;
            } else {
                stats.edges_merged += 1;
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(node_from_row))
    }

    async fn neighbors(&self, id: &str, depth: u32) -> Result<(Vec<Node>, Vec<Edge>)> {
        let depth = depth.clamp(1, 2);
        let Some(start) = self.get_node(id).await? else {
            return Err(GraphLoomError::NotFound(format!("node '{}'", id)));
        };

        let mut conn = self.pool.acquire().await?;
        let mut seen: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut frontier = vec![start.id.clone()];
        let mut collected_edges: Vec<Edge> = Vec::new();
        let mut edge_ids: HashSet<String> = HashSet::new();

        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let touching = fetch_edges_touching(&mut *conn, &frontier).await?;
            let mut next = Vec::new();
            for edge in touching {
                if !edge_ids.insert(edge.id.clone()) {
                    continue;
                }
                for other in [edge.source_id.clone(), edge.target_id.clone()] {
                    if seen.insert(other.clone()) {
                        next.push(other);
                    }
                }
                collected_edges.push(edge);
            }
            frontier = next;
        }

        // Namespace isolation: only nodes in the start node's namespace are
        // visible; edges that cross out are dropped with them.
        let ids: Vec<String> = seen.into_iter().collect();
        let mut nodes = Vec::new();
        for chunk in ids.chunks(100) {
            let marks = chunked_placeholders(chunk.len());
            let sql = format!("SELECT * FROM nodes WHERE id IN ({marks}) AND namespace = ?");
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            query = query.bind(&start.namespace);
            let rows = query.fetch_all(&mut *conn).await?;
            nodes.extend(rows.iter().map(node_from_row));
        }
        let visible: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        collected_edges.retain(|e| {
            visible.contains(e.source_id.as_str()) && visible.contains(e.target_id.as_str())
        });

        Ok((nodes, collected_edges))
    }

    async fn search_by_name(
        &self,
        prefix: &str,
        namespace: &str,
        limit: i64,
    ) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM nodes
            WHERE namespace = ? AND lower(name) LIKE lower(?) || '%'
            ORDER BY name, id
            LIMIT ?
            "#,
        )
        .bind(namespace)
        .bind(prefix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    async fn sample_subgraph(
        &self,
        namespace: &str,
        mode: &SampleMode,
        cap: usize,
    ) -> Result<(Vec<Node>, Vec<Edge>)> {
        let nodes: Vec<Node> = match mode {
            SampleMode::Random => {
                let rows = sqlx::query(
                    "SELECT * FROM nodes WHERE namespace = ? ORDER BY RANDOM() LIMIT ?",
                )
                .bind(namespace)
                .bind(cap as i64)
                .fetch_all(&self.pool)
                .await?;
                rows.iter().map(node_from_row).collect()
            }
            SampleMode::Viewport {
                min_x,
                min_y,
                max_x,
                max_y,
            } => {
                let rows = sqlx::query("SELECT * FROM nodes WHERE namespace = ? LIMIT ?")
                    .bind(namespace)
                    .bind(EXPORT_NODE_CAP as i64)
                    .fetch_all(&self.pool)
                    .await?;
                let mut in_view: Vec<Node> = rows
                    .iter()
                    .map(node_from_row)
                    .filter(|n| {
                        n.layout_xy().map_or(false, |(x, y)| {
                            x >= *min_x && x <= *max_x && y >= *min_y && y <= *max_y
                        })
                    })
                    .collect();
                // Stable ordering keeps repeated viewport calls consistent.
                in_view.sort_by(|a, b| {
                    b.prop_f64("importance")
                        .unwrap_or(0.0)
                        .partial_cmp(&a.prop_f64("importance").unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.id.cmp(&b.id))
                });
                in_view.truncate(cap);
                in_view
            }
        };

        let id_set: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let rows = sqlx::query("SELECT * FROM edges WHERE namespace = ? LIMIT ?")
            .bind(namespace)
            .bind(EXPORT_EDGE_CAP as i64)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<Edge> = rows
            .iter()
            .map(edge_from_row)
            .filter(|e| {
                id_set.contains(e.source_id.as_str()) && id_set.contains(e.target_id.as_str())
            })
            .collect();

        Ok((nodes, edges))
    }

    async fn iterate_nodes(
        &self,
        namespace: &str,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<(Vec<Node>, Option<String>)> {
        let after: i64 = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| GraphLoomError::Validation(format!("invalid cursor '{}'", c)))?,
            None => 0,
        };
        let rows = sqlx::query(
            "SELECT rowid AS seq, * FROM nodes WHERE namespace = ? AND rowid > ? ORDER BY rowid LIMIT ?",
        )
        .bind(namespace)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let next_cursor = if rows.len() as i64 == limit {
            rows.last().map(|r| {
                let seq: i64 = r.get("seq");
                seq.to_string()
            })
        } else {
            None
        };
        Ok((rows.iter().map(node_from_row).collect(), next_cursor))
    }

    async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: u32,
    ) -> Result<Option<PathResult>> {
        let Some(start) = self.get_node(source_id).await? else {
            return Err(GraphLoomError::NotFound(format!("node '{}'", source_id)));
        };
        if source_id == target_id {
            return Ok(Some(PathResult {
                node_ids: vec![source_id.to_string()],
                edges: Vec::new(),
            }));
        }

        let rows = sqlx::query("SELECT * FROM edges WHERE namespace = ? LIMIT ?")
            .bind(&start.namespace)
            .bind(EXPORT_EDGE_CAP as i64)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<Edge> = rows.iter().map(edge_from_row).collect();

        // Semantic relations first; structural containment, provenance,
        // and co-occurrence links only connect endpoints when nothing
        // stronger does.
        let semantic: Vec<&Edge> = edges
            .iter()
            .filter(|e| !is_weak_relation(&e.relation))
            .collect();
        if let Some(path) = bfs_path(&semantic, source_id, target_id, max_depth) {
            return Ok(Some(path));
        }
        let all: Vec<&Edge> = edges.iter().collect();
        Ok(bfs_path(&all, source_id, target_id, max_depth))
    }

    async fn edges_for(
        &self,
        node_ids: &[String],
        relations: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<Edge>> {
        let mut conn = self.pool.acquire().await?;
        let mut edges = fetch_edges_touching(&mut *conn, node_ids).await?;
        if let Some(allowed) = relations {
            edges.retain(|e| allowed.iter().any(|r| r == &e.relation));
        }
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges.dedup_by(|a, b| a.id == b.id);
        edges.truncate(limit as usize);
        Ok(edges)
    }

    async fn export_graph(&self, namespace: &str, cap: usize) -> Result<(Vec<Node>, Vec<Edge>)> {
        let cap = cap.min(EXPORT_NODE_CAP);
        let rows = sqlx::query("SELECT * FROM nodes WHERE namespace = ? ORDER BY rowid LIMIT ?")
            .bind(namespace)
            .bind(cap as i64)
            .fetch_all(&self.pool)
            .await?;
        let nodes: Vec<Node> = rows.iter().map(node_from_row).collect();

        let rows = sqlx::query("SELECT * FROM edges WHERE namespace = ? LIMIT ?")
            .bind(namespace)
            .bind(EXPORT_EDGE_CAP as i64)
            .fetch_all(&self.pool)
            .await?;
        let edges: Vec<Edge> = rows.iter().map(edge_from_row).collect();

        Ok((nodes, edges))
    }

    async fn update_node_properties(&self, updates: &[(String, PropMap)]) -> Result<u64> {
        let mut updated = 0u64;
        for chunk in updates.chunks(BULK_CHUNK_ROWS) {
            let mut tx = self.pool.begin().await?;
            for (id, props) in chunk {
                let row = sqlx::query("SELECT properties FROM nodes WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;
                let Some(row) = row else { continue };
                let current: String = row.get("properties");
                let mut map: PropMap = serde_json::from_str(&current).unwrap_or_default();
                for (k, v) in props {
                    map.insert(k.clone(), v.clone());
                }
                sqlx::query("UPDATE nodes SET properties = ? WHERE id = ?")
                    .bind(serde_json::to_string(&map)?)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                updated += 1;
            }
            tx.commit().await?;
        }
        Ok(updated)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT namespace FROM nodes ORDER BY namespace")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn stats(&self, namespace: &str) -> Result<GraphStats> {
        let node_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        let edge_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE namespace = ?")
            .bind(namespace)
            .fetch_one(&self.pool)
            .await?;
        let rows = sqlx::query(
            "SELECT label, COUNT(*) AS n FROM nodes WHERE namespace = ? GROUP BY label",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;
        let mut label_counts = HashMap::new();
        for row in rows {
            let label: String = row.get("label");
            let n: i64 = row.get("n");
            label_counts.insert(label, n as u64);
        }
        Ok(GraphStats {
            node_count: node_count as u64,
            edge_count: edge_count as u64,
            label_counts,
        })
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
