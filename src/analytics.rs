//! Graph analytics: degree, PageRank, betweenness, importance, layout.
//!
//! All algorithms run over an in-memory [`GraphView`] built from one
//! namespace's export, then persist their results back onto node
//! properties (`degree`, `degree_norm`, `pagerank_norm`,
//! `betweenness_norm`, `importance`, `layout.x/y`, `layout_version`).
//!
//! One analytics job per namespace may be active at a time; a second
//! attempt observes `LOCKED`. Recomputation also triggers automatically
//! once a namespace has grown by the configured ratio since the last run.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::context::GraphLoomContext;
use crate::error::Result;
use crate::models::{Edge, Node, NodeLabel, PropMap};

const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_MAX_ITER: usize = 100;
const PAGERANK_EPSILON: f64 = 1e-6;

/// Above this node count betweenness switches to sampled sources.
const BETWEENNESS_EXACT_LIMIT: usize = 5000;

const IMPORTANCE_W_DEGREE: f64 = 0.4;
const IMPORTANCE_W_PAGERANK: f64 = 0.35;
const IMPORTANCE_W_BETWEENNESS: f64 = 0.25;

/// Undirected adjacency view over one namespace.
pub struct GraphView {
    pub ids: Vec<String>,
    index: HashMap<String, usize>,
    pub adj: Vec<Vec<usize>>,
    /// Endpoint-count degree (in + out), before adjacency dedup.
    pub degree: Vec<u64>,
}

impl GraphView {
    pub fn build(nodes: &[Node], edges: &[Edge]) -> Self {
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let index: HashMap<String, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let mut adj: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
        let mut degree: Vec<u64> = vec![0; ids.len()];

        for edge in edges {
            let (Some(&a), Some(&b)) = (index.get(&edge.source_id), index.get(&edge.target_id))
            else {
                continue;
            };
            degree[a] += 1;
            degree[b] += 1;
            if a != b {
                if !adj[a].contains(&b) {
                    adj[a].push(b);
                }
                if !adj[b].contains(&a) {
                    adj[b].push(a);
                }
            }
        }
        Self {
            ids,
            index,
            adj,
            degree,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// PageRank with uniform teleport over the undirected adjacency.
pub fn pagerank(view: &GraphView) -> Vec<f64> {
    let n = view.len();
    if n == 0 {
        return Vec::new();
    }
    let mut rank = vec![1.0 / n as f64; n];
    let mut next = vec![0.0; n];

    for _ in 0..PAGERANK_MAX_ITER {
        let mut dangling = 0.0;
        for (i, out) in view.adj.iter().enumerate() {
            if out.is_empty() {
                dangling += rank[i];
            }
        }
        for slot in next.iter_mut() {
            *slot = (1.0 - PAGERANK_DAMPING) / n as f64
                + PAGERANK_DAMPING * dangling / n as f64;
        }
        for (i, out) in view.adj.iter().enumerate() {
            if out.is_empty() {
                continue;
            }
            let share = PAGERANK_DAMPING * rank[i] / out.len() as f64;
            for &j in out {
                next[j] += share;
            }
        }
        let delta: f64 = rank
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        std::mem::swap(&mut rank, &mut next);
        if delta < PAGERANK_EPSILON {
            break;
        }
    }
    rank
}

/// Betweenness centrality (Brandes). Exact up to
/// [`BETWEENNESS_EXACT_LIMIT`] nodes, then approximated from a fixed,
/// deterministically chosen set of source pivots so repeated runs agree.
pub fn betweenness(view: &GraphView) -> Vec<f64> {
    let n = view.len();
    if n == 0 {
        return Vec::new();
    }
    let sources: Vec<usize> = if n <= BETWEENNESS_EXACT_LIMIT {
        (0..n).collect()
    } else {
        let pivots = (n / 50).max(64);
        let stride = (n / pivots).max(1);
        (0..n).step_by(stride).take(pivots).collect()
    };

    let mut centrality = vec![0.0f64; n];
    for &s in &sources {
        // Brandes accumulation for one source.
        let mut stack: Vec<usize> = Vec::new();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut sigma = vec![0.0f64; n];
        let mut dist = vec![-1i64; n];
        sigma[s] = 1.0;
        dist[s] = 0;

        let mut queue = VecDeque::from([s]);
        while let Some(v) = queue.pop_front() {
            stack.push(v);
            for &w in &view.adj[v] {
                if dist[w] < 0 {
                    dist[w] = dist[v] + 1;
                    queue.push_back(w);
                }
                if dist[w] == dist[v] + 1 {
                    sigma[w] += sigma[v];
                    preds[w].push(v);
                }
            }
        }

        let mut delta = vec![0.0f64; n];
        while let Some(w) = stack.pop() {
            for &v in &preds[w] {
                delta[v] += sigma[v] / sigma[w] * (1.0 + delta[w]);
            }
            if w != s {
                centrality[w] += delta[w];
            }
        }
    }
    centrality
}

/// Min-max normalize into [0, 1]; a constant vector maps to zeros.
pub fn min_max_normalize(values: &[f64]) -> Vec<f64> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || (max - min).abs() < 1e-12 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct CentralityReport {
    pub namespace: String,
    pub nodes_updated: u64,
    pub max_degree: u64,
}

/// Compute and persist degree/PageRank/betweenness/importance for one
/// namespace.
pub async fn recompute_centrality(
    ctx: &GraphLoomContext,
    namespace: &str,
) -> Result<CentralityReport> {
    let _guard = ctx.analytics_guard(namespace)?;
    let (nodes, edges) = ctx.store.export_graph(namespace, usize::MAX).await?;
    let view = GraphView::build(&nodes, &edges);
    if view.is_empty() {
        return Ok(CentralityReport {
            namespace: namespace.to_string(),
            nodes_updated: 0,
            max_degree: 0,
        });
    }

    let max_degree = view.degree.iter().copied().max().unwrap_or(0);
    let degree_norm: Vec<f64> = view
        .degree
        .iter()
        .map(|&d| if max_degree > 0 { d as f64 / max_degree as f64 } else { 0.0 })
        .collect();
    let pagerank_norm = min_max_normalize(&pagerank(&view));
    let betweenness_norm = min_max_normalize(&betweenness(&view));

    let updates: Vec<(String, PropMap)> = view
        .ids
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let importance = IMPORTANCE_W_DEGREE * degree_norm[i]
                + IMPORTANCE_W_PAGERANK * pagerank_norm[i]
                + IMPORTANCE_W_BETWEENNESS * betweenness_norm[i];
            let mut props = PropMap::new();
            props.insert("degree".into(), serde_json::json!(view.degree[i]));
            props.insert("degree_norm".into(), serde_json::json!(round6(degree_norm[i])));
            props.insert(
                "pagerank_norm".into(),
                serde_json::json!(round6(pagerank_norm[i])),
            );
            props.insert(
                "betweenness_norm".into(),
                serde_json::json!(round6(betweenness_norm[i])),
            );
            props.insert("importance".into(), serde_json::json!(round6(importance)));
            (id.clone(), props)
        })
        .collect();

    let nodes_updated = ctx.store.update_node_properties(&updates).await?;
    ctx.analytics_mark_run(namespace, view.len() as u64);

    Ok(CentralityReport {
        namespace: namespace.to_string(),
        nodes_updated,
        max_degree,
    })
}

/// Fire-and-forget recompute when the namespace grew past the configured
/// ratio since the last analytics run.
pub fn maybe_trigger_recompute(ctx: std::sync::Arc<GraphLoomContext>, namespace: String) {
    tokio::spawn(async move {
        let current = match ctx.store.stats(&namespace).await {
            Ok(stats) => stats.node_count,
            Err(_) => return,
        };
        if !ctx.analytics_growth_due(&namespace, current) {
            return;
        }
        if let Err(e) = recompute_centrality(&ctx, &namespace).await {
            tracing::debug!(error = %e, namespace = %namespace, "background centrality recompute skipped");
        }
    });
}

// ---- Layout ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    /// Section anchors on a radial ring, members placed near their anchor,
    /// then a few deterministic force iterations.
    Hybrid,
    /// Cluster centers on a circle, members arranged around each center.
    Clustered,
}

impl LayoutMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hybrid" => Some(Self::Hybrid),
            "clustered" => Some(Self::Clustered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LayoutReport {
    pub namespace: String,
    pub mode: String,
    pub nodes_positioned: u64,
}

/// FNV-1a over the id; drives deterministic jitter without an RNG so that
/// layout is reproducible run to run.
fn id_hash(id: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn jitter(id: &str, scale: f64) -> (f64, f64) {
    let h = id_hash(id);
    let angle = (h % 3600) as f64 / 3600.0 * std::f64::consts::TAU;
    let radius = ((h >> 16) % 1000) as f64 / 1000.0 * scale;
    (radius * angle.cos(), radius * angle.sin())
}

/// Recompute and persist layout coordinates for one namespace.
pub async fn recompute_layout(
    ctx: &GraphLoomContext,
    namespace: &str,
    mode: LayoutMode,
) -> Result<LayoutReport> {
    let (nodes, edges) = ctx.store.export_graph(namespace, usize::MAX).await?;
    if nodes.is_empty() {
        return Ok(LayoutReport {
            namespace: namespace.to_string(),
            mode: mode_name(mode).to_string(),
            nodes_positioned: 0,
        });
    }

    let positions = match mode {
        LayoutMode::Hybrid => hybrid_layout(&nodes, &edges),
        LayoutMode::Clustered => {
            let members = load_cluster_members(ctx, namespace).await?;
            if members.is_empty() {
                hybrid_layout(&nodes, &edges)
            } else {
                clustered_layout(&nodes, &members)
            }
        }
    };

    let updates: Vec<(String, PropMap)> = nodes
        .iter()
        .filter_map(|node| {
            let (x, y) = positions.get(&node.id)?;
            let version = node.prop_f64("layout_version").unwrap_or(0.0) as u64 + 1;
            let mut props = PropMap::new();
            props.insert(
                "layout".into(),
                serde_json::json!({"x": round6(*x), "y": round6(*y)}),
            );
            props.insert("layout_version".into(), serde_json::json!(version));
            Some((node.id.clone(), props))
        })
        .collect();
    let nodes_positioned = ctx.store.update_node_properties(&updates).await?;

    Ok(LayoutReport {
        namespace: namespace.to_string(),
        mode: mode_name(mode).to_string(),
        nodes_positioned,
    })
}

fn mode_name(mode: LayoutMode) -> &'static str {
    match mode {
        LayoutMode::Hybrid => "hybrid",
        LayoutMode::Clustered => "clustered",
    }
}

fn hybrid_layout(nodes: &[Node], edges: &[Edge]) -> HashMap<String, (f64, f64)> {
    let sections: Vec<&Node> = nodes.iter().filter(|n| n.label == NodeLabel::Section).collect();
    let ring = 1.0 + ((sections.len() + 1) as f64).ln() * 0.2;
    let mut positions: HashMap<String, (f64, f64)> = HashMap::new();

    let mut section_anchor: HashMap<&str, (f64, f64)> = HashMap::new();
    for (i, section) in sections.iter().enumerate() {
        let angle = std::f64::consts::TAU * i as f64 / sections.len().max(1) as f64;
        let pos = (ring * angle.cos(), ring * angle.sin());
        positions.insert(section.id.clone(), pos);
        if let Some(path) = section.prop_str("section_path") {
            section_anchor.insert(path, pos);
        }
    }

    for node in nodes {
        if positions.contains_key(&node.id) {
            continue;
        }
        let anchor = node
            .prop_str("section_path")
            .and_then(|path| section_anchor.get(path).copied());
        let pos = match anchor {
            Some((ax, ay)) => {
                let (jx, jy) = jitter(&node.id, 0.25);
                (ax + jx, ay + jy)
            }
            None => jitter(&node.id, ring * 0.6),
        };
        positions.insert(node.id.clone(), pos);
    }

    // A few attraction rounds pull connected nodes together; anchors stay
    // heavier through a smaller step.
    let view = GraphView::build(nodes, edges);
    for _ in 0..20 {
        let mut moves: HashMap<&str, (f64, f64, usize)> = HashMap::new();
        for (i, neighbors) in view.adj.iter().enumerate() {
            let id = view.ids[i].as_str();
            let (x, y) = positions[id];
            for &j in neighbors {
                let other = view.ids[j].as_str();
                let (ox, oy) = positions[other];
                let entry = moves.entry(id).or_insert((0.0, 0.0, 0));
                entry.0 += ox - x;
                entry.1 += oy - y;
                entry.2 += 1;
            }
        }
        for (id, (dx, dy, count)) in moves {
            if count == 0 {
                continue;
            }
            let step = 0.08 / count as f64;
            let pos = positions.get_mut(id).unwrap();
            pos.0 += dx * step;
            pos.1 += dy * step;
        }
    }

    positions
}

fn clustered_layout(
    nodes: &[Node],
    members: &HashMap<String, String>,
) -> HashMap<String, (f64, f64)> {
    let mut clusters: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node_id, cluster_id) in members {
        clusters.entry(cluster_id).or_default().push(node_id);
    }
    let mut cluster_ids: Vec<&&str> = clusters.keys().collect();
    cluster_ids.sort();

    let big_ring = 4.0 + ((cluster_ids.len() + 1) as f64).ln();
    let mut positions: HashMap<String, (f64, f64)> = HashMap::new();
    for (i, cluster_id) in cluster_ids.iter().enumerate() {
        let angle = std::f64::consts::TAU * i as f64 / cluster_ids.len().max(1) as f64;
        let (cx, cy) = (big_ring * angle.cos(), big_ring * angle.sin());
        let mut ids = clusters[**cluster_id].clone();
        ids.sort();
        let inner = 1.2 + ((ids.len() + 1) as f64).ln() * 0.15;
        for (j, node_id) in ids.iter().enumerate() {
            let inner_angle = std::f64::consts::TAU * j as f64 / ids.len().max(1) as f64;
            positions.insert(
                node_id.to_string(),
                (cx + inner * inner_angle.cos(), cy + inner * inner_angle.sin()),
            );
        }
    }

    // Unclustered nodes fall back to hash placement near the origin.
    for node in nodes {
        positions
            .entry(node.id.clone())
            .or_insert_with(|| jitter(&node.id, 1.0));
    }
    positions
}

async fn load_cluster_members(
    ctx: &GraphLoomContext,
    namespace: &str,
) -> Result<HashMap<String, String>> {
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT node_id, cluster_id FROM cluster_members WHERE namespace = ? AND algorithm = 'louvain'",
    )
    .bind(namespace)
    .fetch_all(ctx.store.embedded().pool())
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("node_id"), r.get::<String, _>("cluster_id")))
        .collect())
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::relation;

    fn node(id: &str) -> Node {
        Node::new(id, NodeLabel::Entity, id, "public")
    }

    fn edge(a: &str, b: &str) -> Edge {
        Edge::new(a, b, relation::CO_OCCURS, 0.5, "public")
    }

    fn path_graph() -> (Vec<Node>, Vec<Edge>) {
        let nodes = vec![node("a"), node("b"), node("c"), node("d"), node("e")];
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("c", "d"), edge("d", "e")];
        (nodes, edges)
    }

    #[test]
    fn test_degree_counts_endpoints() {
        let (nodes, edges) = path_graph();
        let view = GraphView::build(&nodes, &edges);
        assert_eq!(view.degree[view.position("a").unwrap()], 1);
        assert_eq!(view.degree[view.position("c").unwrap()], 2);
    }

    #[test]
    fn test_pagerank_center_of_star_dominates() {
        let nodes = vec![node("hub"), node("s1"), node("s2"), node("s3"), node("s4")];
        let edges = vec![
            edge("hub", "s1"),
            edge("hub", "s2"),
            edge("hub", "s3"),
            edge("hub", "s4"),
        ];
        let view = GraphView::build(&nodes, &edges);
        let pr = pagerank(&view);
        let hub = view.position("hub").unwrap();
        for i in 0..view.len() {
            if i != hub {
                assert!(pr[hub] > pr[i]);
            }
        }
        // Ranks sum to roughly 1.
        let sum: f64 = pr.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3, "sum {}", sum);
    }

    #[test]
    fn test_betweenness_peaks_mid_path() {
        let (nodes, edges) = path_graph();
        let view = GraphView::build(&nodes, &edges);
        let bc = betweenness(&view);
        let c = view.position("c").unwrap();
        let a = view.position("a").unwrap();
        assert!(bc[c] > bc[a]);
        let norm = min_max_normalize(&bc);
        assert_eq!(norm[c], 1.0);
        assert_eq!(norm[a], 0.0);
    }

    #[test]
    fn test_min_max_constant_vector() {
        assert_eq!(min_max_normalize(&[2.0, 2.0, 2.0]), vec![0.0, 0.0, 0.0]);
        assert_eq!(min_max_normalize(&[]), Vec::<f64>::new());
    }

    #[test]
    fn test_hybrid_layout_is_deterministic() {
        let (nodes, edges) = path_graph();
        let a = hybrid_layout(&nodes, &edges);
        let b = hybrid_layout(&nodes, &edges);
        assert_eq!(a.len(), nodes.len());
        for (id, pos) in &a {
            assert_eq!(b[id], *pos);
        }
    }

    #[test]
    fn test_clustered_layout_separates_clusters() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let members: HashMap<String, String> = [
            ("a".to_string(), "c1".to_string()),
            ("b".to_string(), "c1".to_string()),
            ("c".to_string(), "c2".to_string()),
            ("d".to_string(), "c2".to_string()),
        ]
        .into();
        let positions = clustered_layout(&nodes, &members);
        let dist = |p: (f64, f64), q: (f64, f64)| ((p.0 - q.0).powi(2) + (p.1 - q.1).powi(2)).sqrt();
        // Same-cluster nodes are closer than cross-cluster nodes.
        assert!(dist(positions["a"], positions["b"]) < dist(positions["a"], positions["c"]));
    }

    #[tokio::test]
    async fn test_recompute_centrality_persists_properties() {
        use crate::context::tests::test_context;
        use crate::ingest::{ingest_document, IngestRequest};

        let ctx = test_context().await;
        ingest_document(
            &ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "Alice works at Acme. Acme uses Kafka. Kafka talks to Postgres.".to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();

        let report = recompute_centrality(&ctx, "public").await.unwrap();
        assert!(report.nodes_updated > 0);
        assert!(report.max_degree > 0);

        let node = ctx.store.get_node("public:acme").await.unwrap().unwrap();
        assert!(node.prop_f64("degree").unwrap() > 0.0);
        assert!(node.prop_f64("importance").is_some());
        assert!(node.prop_f64("degree_norm").unwrap() <= 1.0);
    }
}
