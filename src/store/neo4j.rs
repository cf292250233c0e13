//! Neo4j backend over the HTTP transactional Cypher API.
//!
//! Nodes are stored as `(:GraphNode {id, label, name, namespace, props,
//! source_ids, embedding, seq})` where `props` and `source_ids` carry JSON
//! strings (Neo4j properties cannot nest maps) and `seq` is the creation
//! timestamp used for stable cursor iteration. Edges are `[:REL {id,
//! relation, confidence, namespace, props}]` relationships keyed by
//! `(source, target, relation)`.
//!
//! Write operations that need read-modify-write semantics (property union,
//! max-confidence merge) run inside one interactive transaction
//! (`POST /tx` … `POST /tx/{id}/commit`), so readers never observe a
//! partial merge — the same guarantee the embedded store gives.
//!
//! Any transport-level failure maps to
//! [`GraphLoomError::BackendUnavailable`], which the storage adapter
//! catches to retry the call on the embedded store.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::GraphBackendConfig;
use crate::error::{GraphLoomError, Result};
use crate::models::{Edge, Node, NodeLabel, PropMap};

use super::{
    BulkStats, GraphStats, GraphStore, PathResult, SampleMode, UpsertOutcome, BULK_CHUNK_ROWS,
};

const EXPORT_NODE_CAP: usize = 10_000;

pub struct Neo4jStore {
    client: reqwest::Client,
    base: String,
    auth: Option<(String, String)>,
}

impl Neo4jStore {
    pub fn from_config(config: &GraphBackendConfig) -> Result<Self> {
        let uri = config.neo4j_uri.clone().ok_or_else(|| {
            GraphLoomError::Validation("graph.neo4j_uri is required for the neo4j store".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GraphLoomError::BackendUnavailable(e.to_string()))?;
        let auth = match (&config.neo4j_user, &config.neo4j_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };
        Ok(Self {
            client,
            base: format!(
                "{}/db/{}/tx",
                uri.trim_end_matches('/'),
                config.neo4j_database
            ),
            auth,
        })
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).header("Content-Type", "application/json");
        if let Some((user, pass)) = &self.auth {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    async fn post_statements(
        &self,
        url: &str,
        statements: &[(String, Value)],
    ) -> Result<Value> {
        let body = json!({
            "statements": statements
                .iter()
                .map(|(s, p)| json!({"statement": s, "parameters": p}))
                .collect::<Vec<_>>()
        });
        let response = self
            .request(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GraphLoomError::BackendUnavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GraphLoomError::BackendUnavailable(format!(
                "neo4j returned HTTP {}",
                response.status()
            )));
        }
        let json: Value = response
            .json()
            .await
            .map_err(|e| GraphLoomError::BackendUnavailable(e.to_string()))?;
        if let Some(errors) = json.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let joined = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(GraphLoomError::Fatal(format!("cypher error: {}", joined)));
            }
        }
        Ok(json)
    }

    /// One auto-commit round trip; returns rows of the first statement.
    async fn run(&self, statement: &str, params: Value) -> Result<Vec<Vec<Value>>> {
        let url = format!("{}/commit", self.base);
        let json = self
            .post_statements(&url, &[(statement.to_string(), params)])
            .await?;
        Ok(extract_rows(&json, 0))
    }

    /// Open an interactive transaction for multi-statement atomic writes.
    async fn begin(&self) -> Result<HttpTx<'_>> {
        let json = self.post_statements(&self.base, &[]).await?;
        let commit_url = json
            .get("commit")
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                GraphLoomError::BackendUnavailable("neo4j tx begin: missing commit url".into())
            })?
            .to_string();
        Ok(HttpTx {
            store: self,
            exec_url: commit_url.trim_end_matches("/commit").to_string(),
            commit_url,
        })
    }
}

struct HttpTx<'a> {
    store: &'a Neo4jStore,
    exec_url: String,
    commit_url: String,
}

impl HttpTx<'_> {
    async fn run(&self, statement: &str, params: Value) -> Result<Vec<Vec<Value>>> {
        let json = self
            .store
            .post_statements(&self.exec_url, &[(statement.to_string(), params)])
            .await?;
        Ok(extract_rows(&json, 0))
    }

    async fn commit(self) -> Result<()> {
        self.store.post_statements(&self.commit_url, &[]).await?;
        Ok(())
    }
}

fn extract_rows(json: &Value, result_index: usize) -> Vec<Vec<Value>> {
    json.get("results")
        .and_then(|r| r.as_array())
        .and_then(|r| r.get(result_index))
        .and_then(|r| r.get("data"))
        .and_then(|d| d.as_array())
        .map(|rows| {
            rows.iter()
                .filter_map(|r| r.get("row").and_then(|c| c.as_array()).cloned())
                .collect()
        })
        .unwrap_or_default()
}

const NODE_COLUMNS: &str =
    "n.id, n.label, n.name, n.namespace, n.embedding, n.props, n.source_ids";

fn node_from_cols(cols: &[Value]) -> Option<Node> {
    let id = cols.first()?.as_str()?.to_string();
    let label = NodeLabel::parse(cols.get(1)?.as_str().unwrap_or("Entity"));
    let name = cols.get(2)?.as_str().unwrap_or_default().to_string();
    let namespace = cols.get(3)?.as_str().unwrap_or_default().to_string();
    let embedding: Vec<f32> = cols
        .get(4)
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
        .unwrap_or_default();
    let properties: PropMap = cols
        .get(5)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    let source_ids: Vec<String> = cols
        .get(6)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Some(Node {
        id,
        label,
        name,
        namespace,
        embedding,
        properties,
        source_ids,
    })
}

const EDGE_COLUMNS: &str =
    "r.id, startNode(r).id, endNode(r).id, r.relation, r.confidence, r.namespace, r.props";

fn edge_from_cols(cols: &[Value]) -> Option<Edge> {
    Some(Edge {
        id: cols.first()?.as_str()?.to_string(),
        source_id: cols.get(1)?.as_str()?.to_string(),
        target_id: cols.get(2)?.as_str()?.to_string(),
        relation: cols.get(3)?.as_str().unwrap_or("RELATED_TO").to_string(),
        confidence: cols.get(4).and_then(|v| v.as_f64()).unwrap_or(0.6),
        namespace: cols.get(5)?.as_str().unwrap_or_default().to_string(),
        properties: cols
            .get(6)
            .and_then(|v| v.as_str())
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
    })
}

fn embedding_json(embedding: &[f32]) -> Value {
    Value::Array(
        embedding
            .iter()
            .map(|v| json!(*v as f64))
            .collect::<Vec<_>>(),
    )
}

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

async fn upsert_node_tx(tx: &HttpTx<'_>, node: &Node) -> Result<UpsertOutcome> {
    let rows = tx
        .run(
            &format!("MATCH (n:GraphNode {{id: $id}}) RETURN {}", NODE_COLUMNS),
            json!({"id": node.id}),
        )
        .await?;

    match rows.first().and_then(|r| node_from_cols(r)) {
        None => {
            tx.run(
                "CREATE (n:GraphNode {id: $id, label: $label, name: $name, namespace: $namespace, \
                 embedding: $embedding, props: $props, source_ids: $source_ids, seq: timestamp()})",
                json!({
                    "id": node.id,
                    "label": node.label.as_str(),
                    "name": node.name,
                    "namespace": node.namespace,
                    "embedding": embedding_json(&node.embedding),
                    "props": serde_json::to_string(&node.properties)?,
                    "source_ids": serde_json::to_string(&node.source_ids)?,
                }),
            )
            .await?;
            Ok(UpsertOutcome { created: true })
        }
        Some(mut current) => {
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
            tx.run(
                "MATCH (n:GraphNode {id: $id}) \
                 SET n.embedding = $embedding, n.props = $props, n.source_ids = $source_ids",
                json!({
                    "id": node.id,
                    "embedding": embedding_json(&current.embedding),
                    "props": serde_json::to_string(&current.properties)?,
                    "source_ids": serde_json::to_string(&current.source_ids)?,
                }),
            )
            .await?;
            Ok(UpsertOutcome { created: false })
        }
    }
}

async fn upsert_edge_tx(tx: &HttpTx<'_>, edge: &Edge) -> Result<UpsertOutcome> {
    let rows = tx
        .run(
            "MATCH (s:GraphNode {id: $sid})-[r:REL {relation: $rel}]->(t:GraphNode {id: $tid}) \
             RETURN r.confidence, r.props",
            json!({"sid": edge.source_id, "tid": edge.target_id, "rel": edge.relation}),
        )
        .await?;

    match rows.first() {
        None => {
            tx.run(
                "MATCH (s:GraphNode {id: $sid}) MATCH (t:GraphNode {id: $tid}) \
                 CREATE (s)-[r:REL {id: $id, relation: $rel, confidence: $confidence, \
                 namespace: $namespace, props: $props}]->(t)",
                json!({
                    "sid": edge.source_id,
                    "tid": edge.target_id,
                    "id": edge.id,
                    "rel": edge.relation,
                    "confidence": edge.confidence,
                    "namespace": edge.namespace,
                    "props": serde_json::to_string(&edge.properties)?,
                }),
            )
            .await?;
            Ok(UpsertOutcome { created: true })
        }
        Some(cols) => {
            let stored_confidence = cols.first().and_then(|v| v.as_f64()).unwrap_or(0.0);
            let mut props: PropMap = cols
                .get(1)
                .and_then(|v| v.as_str())
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default();
            merge_props_non_destructive(&mut props, &edge.properties);
            tx.run(
                "MATCH (s:GraphNode {id: $sid})-[r:REL {relation: $rel}]->(t:GraphNode {id: $tid}) \
                 SET r.confidence = $confidence, r.props = $props",
                json!({
                    "sid": edge.source_id,
                    "tid": edge.target_id,
                    "rel": edge.relation,
                    "confidence": stored_confidence.max(edge.confidence),
                    "props": serde_json::to_string(&props)?,
                }),
            )
            .await?;
            Ok(UpsertOutcome { created: false })
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn upsert_node(&self, node: &Node) -> Result<UpsertOutcome> {
        let tx = self.begin().await?;
        let outcome = upsert_node_tx(&tx, node).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn upsert_edge(&self, edge: &Edge) -> Result<UpsertOutcome> {
        let tx = self.begin().await?;
        let outcome = upsert_edge_tx(&tx, edge).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn bulk_upsert(&self, nodes: &[Node], edges: &[Edge]) -> Result<BulkStats> {
        let mut stats = BulkStats::default();
        for chunk in nodes.chunks(BULK_CHUNK_ROWS) {
            let tx = self.begin().await?;
            for node in chunk {
                if upsert_node_tx(&tx, node).await?.created {
                    stats.nodes_created += 1;
                    stats.created_node_ids.push(node.id.clone());
                } else {
                    stats.nodes_merged += 1;
                }
            }
            tx.commit().await?;
        }
        for chunk in edges.chunks(BULK_CHUNK_ROWS) {
            let tx = self.begin().await?;
            for edge in chunk {
                if upsert_edge_tx(&tx, edge).await?.created {
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
        let tx = self.begin().await?;
        tx.run(
            "MATCH (n:GraphNode) WHERE n.namespace = $ns AND n.label IN ['Chunk', 'Section'] \
             AND n.id STARTS WITH $prefix DETACH DELETE n",
            json!({"ns": namespace, "prefix": format!("{}:{}:", namespace, doc_id)}),
        )
        .await?;

        let mut stats = BulkStats::default();
        for node in nodes {
            if upsert_node_tx(&tx, node).await?.created {
                stats.nodes_created += 1;
                stats.created_node_ids.push(node.id.clone());
            } else {
                stats.nodes_merged += 1;
            }
        }
        for edge in edges {
            if upsert_edge_tx(&tx, edge).await?.created {
                stats.edges_created += 1;
            } else {
                stats.edges_merged += 1;
            }
        }
        tx.commit().await?;
        Ok(stats)
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let rows = self
            .run(
                &format!("MATCH (n:GraphNode {{id: $id}}) RETURN {}", NODE_COLUMNS),
                json!({"id": id}),
            )
            .await?;
        Ok(rows.first().and_then(|r| node_from_cols(r)))
    }

    async fn neighbors(&self, id: &str, depth: u32) -> Result<(Vec<Node>, Vec<Edge>)> {
        let depth = depth.clamp(1, 2);
        let Some(start) = self.get_node(id).await? else {
            return Err(GraphLoomError::NotFound(format!("node '{}'", id)));
        };

        let mut nodes: HashMap<String, Node> = HashMap::from([(start.id.clone(), start.clone())]);
        let mut edges: HashMap<String, Edge> = HashMap::new();
        let mut frontier: Vec<String> = vec![start.id.clone()];

        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let rows = self
                .run(
                    &format!(
                        "MATCH (n:GraphNode)-[r:REL]-(m:GraphNode) \
                         WHERE n.id IN $ids AND m.namespace = $ns \
                         RETURN {}, m.id, m.label, m.name, m.namespace, m.embedding, m.props, m.source_ids",
                        EDGE_COLUMNS
                    ),
                    json!({"ids": frontier, "ns": start.namespace}),
                )
                .await?;
            let mut next = Vec::new();
            for row in &rows {
                if let Some(edge) = edge_from_cols(row) {
                    edges.entry(edge.id.clone()).or_insert(edge);
                }
                if let Some(node) = row.get(7..).and_then(node_from_cols) {
                    if !nodes.contains_key(&node.id) {
                        next.push(node.id.clone());
                        nodes.insert(node.id.clone(), node);
                    }
                }
            }
            frontier = next;
        }

        let visible: HashSet<&str> = nodes.keys().map(|s| s.as_str()).collect();
        let edges: Vec<Edge> = edges
            .into_values()
            .filter(|e| {
                visible.contains(e.source_id.as_str()) && visible.contains(e.target_id.as_str())
            })
            .collect();
        Ok((nodes.into_values().collect(), edges))
    }

    async fn search_by_name(
        &self,
        prefix: &str,
        namespace: &str,
        limit: i64,
    ) -> Result<Vec<Node>> {
        let rows = self
            .run(
                &format!(
                    "MATCH (n:GraphNode) WHERE n.namespace = $ns \
                     AND toLower(n.name) STARTS WITH toLower($prefix) \
                     RETURN {} ORDER BY n.name, n.id LIMIT $limit",
                    NODE_COLUMNS
                ),
                json!({"ns": namespace, "prefix": prefix, "limit": limit}),
            )
            .await?;
        Ok(rows.iter().filter_map(|r| node_from_cols(r)).collect())
    }

    async fn sample_subgraph(
        &self,
        namespace: &str,
        mode: &SampleMode,
        cap: usize,
    ) -> Result<(Vec<Node>, Vec<Edge>)> {
        let nodes: Vec<Node> = match mode {
            SampleMode::Random => {
                let rows = self
                    .run(
                        &format!(
                            "MATCH (n:GraphNode {{namespace: $ns}}) RETURN {} \
                             ORDER BY rand() LIMIT $cap",
                            NODE_COLUMNS
                        ),
                        json!({"ns": namespace, "cap": cap as i64}),
                    )
                    .await?;
                rows.iter().filter_map(|r| node_from_cols(r)).collect()
            }
            SampleMode::Viewport {
                min_x,
                min_y,
                max_x,
                max_y,
            } => {
                let rows = self
                    .run(
                        &format!(
                            "MATCH (n:GraphNode {{namespace: $ns}}) RETURN {} LIMIT $cap",
                            NODE_COLUMNS
                        ),
                        json!({"ns": namespace, "cap": EXPORT_NODE_CAP as i64}),
                    )
                    .await?;
                let mut in_view: Vec<Node> = rows
                    .iter()
                    .filter_map(|r| node_from_cols(r))
                    .filter(|n| {
                        n.layout_xy().map_or(false, |(x, y)| {
                            x >= *min_x && x <= *max_x && y >= *min_y && y <= *max_y
                        })
                    })
                    .collect();
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

        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let rows = self
            .run(
                &format!(
                    "MATCH (a:GraphNode)-[r:REL]->(b:GraphNode) \
                     WHERE a.id IN $ids AND b.id IN $ids RETURN {}",
                    EDGE_COLUMNS
                ),
                json!({"ids": ids}),
            )
            .await?;
        let edges: Vec<Edge> = rows.iter().filter_map(|r| edge_from_cols(r)).collect();
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
        let rows = self
            .run(
                &format!(
                    "MATCH (n:GraphNode) WHERE n.namespace = $ns AND n.seq > $after \
                     RETURN {}, n.seq ORDER BY n.seq LIMIT $limit",
                    NODE_COLUMNS
                ),
                json!({"ns": namespace, "after": after, "limit": limit}),
            )
            .await?;
        let next_cursor = if rows.len() as i64 == limit {
            rows.last()
                .and_then(|r| r.get(7))
                .and_then(|v| v.as_i64())
                .map(|s| s.to_string())
        } else {
            None
        };
        Ok((
            rows.iter().filter_map(|r| node_from_cols(r)).collect(),
            next_cursor,
        ))
    }

    async fn shortest_path(
        &self,
        source_id: &str,
        target_id: &str,
        max_depth: u32,
    ) -> Result<Option<PathResult>> {
        if source_id == target_id {
            return Ok(Some(PathResult {
                node_ids: vec![source_id.to_string()],
                edges: Vec::new(),
            }));
        }
        let depth = max_depth.clamp(1, 15);
        // Semantic relations first; structural/provenance/co-occurrence
        // links only connect endpoints when nothing stronger does.
        let typed = format!(
            "MATCH (a:GraphNode {{id: $s}}), (b:GraphNode {{id: $t}}), \
             p = shortestPath((a)-[:REL*..{}]-(b)) \
             WHERE all(r IN relationships(p) WHERE NOT r.relation IN ['CO_OCCURS', 'MENTIONED_IN', 'CONTAINS', 'HAS_ENTITY']) \
             RETURN [n IN nodes(p) | n.id], \
                    [r IN relationships(p) | [r.id, startNode(r).id, endNode(r).id, r.relation, r.confidence, r.namespace, r.props]]",
            depth
        );
        let fallback = format!(
            "MATCH (a:GraphNode {{id: $s}}), (b:GraphNode {{id: $t}}), \
             p = shortestPath((a)-[:REL*..{}]-(b)) \
             RETURN [n IN nodes(p) | n.id], \
                    [r IN relationships(p) | [r.id, startNode(r).id, endNode(r).id, r.relation, r.confidence, r.namespace, r.props]]",
            depth
        );
        let mut rows = self
            .run(&typed, json!({"s": source_id, "t": target_id}))
            .await?;
        if rows.is_empty() {
            rows = self
                .run(&fallback, json!({"s": source_id, "t": target_id}))
                .await?;
        }
        let Some(cols) = rows.first() else {
            return Ok(None);
        };
        let node_ids: Vec<String> = cols
            .first()
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let edges: Vec<Edge> = cols
            .get(1)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|x| x.as_array().and_then(|cols| edge_from_cols(cols)))
                    .collect()
            })
            .unwrap_or_default();
        if node_ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathResult { node_ids, edges }))
    }

    async fn edges_for(
        &self,
        node_ids: &[String],
        relations: Option<&[String]>,
        limit: i64,
    ) -> Result<Vec<Edge>> {
        let rows = self
            .run(
                &format!(
                    "MATCH (a:GraphNode)-[r:REL]->(b:GraphNode) \
                     WHERE a.id IN $ids OR b.id IN $ids RETURN {} LIMIT $limit",
                    EDGE_COLUMNS
                ),
                json!({"ids": node_ids, "limit": limit * 4}),
            )
            .await?;
        let mut edges: Vec<Edge> = rows.iter().filter_map(|r| edge_from_cols(r)).collect();
        if let Some(allowed) = relations {
            edges.retain(|e| allowed.iter().any(|rel| rel == &e.relation));
        }
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges.truncate(limit as usize);
        Ok(edges)
    }

    async fn export_graph(&self, namespace: &str, cap: usize) -> Result<(Vec<Node>, Vec<Edge>)> {
        let cap = cap.min(EXPORT_NODE_CAP);
        let node_rows = self
            .run(
                &format!(
                    "MATCH (n:GraphNode {{namespace: $ns}}) RETURN {} ORDER BY n.seq LIMIT $cap",
                    NODE_COLUMNS
                ),
                json!({"ns": namespace, "cap": cap as i64}),
            )
            .await?;
        let edge_rows = self
            .run(
                &format!(
                    "MATCH (a:GraphNode {{namespace: $ns}})-[r:REL]->(b:GraphNode) RETURN {}",
                    EDGE_COLUMNS
                ),
                json!({"ns": namespace}),
            )
            .await?;
        Ok((
            node_rows.iter().filter_map(|r| node_from_cols(r)).collect(),
            edge_rows.iter().filter_map(|r| edge_from_cols(r)).collect(),
        ))
    }

    async fn update_node_properties(&self, updates: &[(String, PropMap)]) -> Result<u64> {
        let mut updated = 0u64;
        for chunk in updates.chunks(BULK_CHUNK_ROWS) {
            let tx = self.begin().await?;
            for (id, props) in chunk {
                let rows = tx
                    .run(
                        "MATCH (n:GraphNode {id: $id}) RETURN n.props",
                        json!({"id": id}),
                    )
                    .await?;
                let Some(cols) = rows.first() else { continue };
                let mut map: PropMap = cols
                    .first()
                    .and_then(|v| v.as_str())
                    .and_then(|s| serde_json::from_str(s).ok())
                    .unwrap_or_default();
                for (k, v) in props {
                    map.insert(k.clone(), v.clone());
                }
                tx.run(
                    "MATCH (n:GraphNode {id: $id}) SET n.props = $props",
                    json!({"id": id, "props": serde_json::to_string(&map)?}),
                )
                .await?;
                updated += 1;
            }
            tx.commit().await?;
        }
        Ok(updated)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let rows = self
            .run(
                "MATCH (n:GraphNode) RETURN DISTINCT n.namespace ORDER BY n.namespace",
                json!({}),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.first().and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect())
    }

    async fn stats(&self, namespace: &str) -> Result<GraphStats> {
        let counts = self
            .run(
                "MATCH (n:GraphNode {namespace: $ns}) RETURN count(n)",
                json!({"ns": namespace}),
            )
            .await?;
        let node_count = counts
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let edge_counts = self
            .run(
                "MATCH (:GraphNode {namespace: $ns})-[r:REL]->() RETURN count(r)",
                json!({"ns": namespace}),
            )
            .await?;
        let edge_count = edge_counts
            .first()
            .and_then(|r| r.first())
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let label_rows = self
            .run(
                "MATCH (n:GraphNode {namespace: $ns}) RETURN n.label, count(n)",
                json!({"ns": namespace}),
            )
            .await?;
        let mut label_counts = HashMap::new();
        for row in label_rows {
            if let (Some(label), Some(n)) = (
                row.first().and_then(|v| v.as_str()),
                row.get(1).and_then(|v| v.as_u64()),
            ) {
                label_counts.insert(label.to_string(), n);
            }
        }
        Ok(GraphStats {
            node_count,
            edge_count,
            label_counts,
        })
    }

    fn backend_name(&self) -> &'static str {
        "neo4j"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_rows_shape() {
        let json = serde_json::json!({
            "results": [{"columns": ["a"], "data": [{"row": [1]}, {"row": [2]}]}],
            "errors": []
        });
        let rows = extract_rows(&json, 0);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], serde_json::json!(1));
    }

    #[test]
    fn test_node_from_cols_roundtrip() {
        let cols = vec![
            serde_json::json!("public:rust"),
            serde_json::json!("Technology"),
            serde_json::json!("Rust"),
            serde_json::json!("public"),
            serde_json::json!([0.5, -0.5]),
            serde_json::json!("{\"degree\": 3}"),
            serde_json::json!("[\"d1\"]"),
        ];
        let node = node_from_cols(&cols).unwrap();
        assert_eq!(node.id, "public:rust");
        assert_eq!(node.label, NodeLabel::Technology);
        assert_eq!(node.embedding, vec![0.5, -0.5]);
        assert_eq!(node.prop_f64("degree"), Some(3.0));
        assert_eq!(node.source_ids, vec!["d1"]);
    }

    #[test]
    fn test_edge_from_cols() {
        let cols = vec![
            serde_json::json!("e1"),
            serde_json::json!("a"),
            serde_json::json!("b"),
            serde_json::json!("CO_OCCURS"),
            serde_json::json!(0.8),
            serde_json::json!("public"),
            serde_json::json!("{}"),
        ];
        let edge = edge_from_cols(&cols).unwrap();
        assert_eq!(edge.relation, "CO_OCCURS");
        assert_eq!(edge.confidence, 0.8);
    }
}
