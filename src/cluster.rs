//! Louvain community detection and cluster summarization.
//!
//! ## Algorithm
//!
//! 1. **Local moving**: move nodes between communities while modularity
//!    improves, visiting nodes in a seeded shuffled order.
//! 2. **Aggregation**: collapse communities into super-nodes and repeat
//!    until a pass yields no further improvement.
//!
//! Modularity: `Q = (1/2m) Σij [Aij − ki·kj/2m] δ(ci, cj)` over the
//! confidence-weighted undirected graph.
//!
//! Results are persisted three ways: the `cluster_members` table, the
//! `community_id`/`community_level` node properties, and (on demand)
//! cached LLM summaries keyed by a hash of the cluster's top terms.
//! Summarization is rate limited per namespace and spends from a daily
//! token budget that resets at UTC midnight.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use sqlx::Row;

use crate::context::GraphLoomContext;
use crate::error::Result;
use crate::llm::extract_json_object;
use crate::models::{utc_now_iso, Edge, Node, NodeLabel};

const LOUVAIN_SEED: u64 = 42;
const MAX_OUTER_PASSES: usize = 10;
const MAX_MOVE_SWEEPS: usize = 100;
const MIN_IMPROVEMENT: f64 = 1e-6;
const TOP_TERMS: usize = 8;
const SUMMARY_SAMPLE_ENTITIES: usize = 10;

struct WeightedGraph {
    n: usize,
    adj: Vec<Vec<(usize, f64)>>,
    /// Weighted degree per node.
    strength: Vec<f64>,
    /// Sum of edge weights (each undirected edge counted once).
    total: f64,
}

impl WeightedGraph {
    fn build(n: usize, edges: &[(usize, usize, f64)]) -> Self {
        let mut adj: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        let mut strength = vec![0.0; n];
        let mut total = 0.0;
        for &(a, b, w) in edges {
            if a == b {
                continue;
            }
            adj[a].push((b, w));
            adj[b].push((a, w));
            strength[a] += w;
            strength[b] += w;
            total += w;
        }
        Self {
            n,
            adj,
            strength,
            total,
        }
    }
}

fn modularity_of(graph: &WeightedGraph, communities: &[usize]) -> f64 {
    if graph.total <= 0.0 {
        return 0.0;
    }
    let two_m = 2.0 * graph.total;
    let mut internal = 0.0;
    for (i, neighbors) in graph.adj.iter().enumerate() {
        for &(j, w) in neighbors {
            if communities[i] == communities[j] {
                internal += w; // each internal edge counted twice
            }
        }
    }
    let mut community_strength: HashMap<usize, f64> = HashMap::new();
    for (i, &c) in communities.iter().enumerate() {
        *community_strength.entry(c).or_insert(0.0) += graph.strength[i];
    }
    let expected: f64 = community_strength
        .values()
        .map(|s| (s / two_m).powi(2))
        .sum();
    internal / two_m - expected
}

/// One local-moving phase; returns whether any node moved.
fn local_moving(
    graph: &WeightedGraph,
    communities: &mut [usize],
    rng: &mut rand::rngs::StdRng,
) -> bool {
    let two_m = 2.0 * graph.total;
    if two_m <= 0.0 {
        return false;
    }
    let mut community_strength: HashMap<usize, f64> = HashMap::new();
    for (i, &c) in communities.iter().enumerate() {
        *community_strength.entry(c).or_insert(0.0) += graph.strength[i];
    }

    let mut order: Vec<usize> = (0..graph.n).collect();
    order.shuffle(rng);

    let mut any_moved = false;
    for _ in 0..MAX_MOVE_SWEEPS {
        let mut moved = false;
        for &i in &order {
            let current = communities[i];
            let mut weight_to: HashMap<usize, f64> = HashMap::new();
            for &(j, w) in &graph.adj[i] {
                *weight_to.entry(communities[j]).or_insert(0.0) += w;
            }

            *community_strength.get_mut(&current).unwrap() -= graph.strength[i];
            let base = weight_to.get(&current).copied().unwrap_or(0.0);
            let mut best = current;
            let mut best_gain = 0.0;
            for (&candidate, &w_in) in &weight_to {
                if candidate == current {
                    continue;
                }
                let cand_strength = community_strength.get(&candidate).copied().unwrap_or(0.0);
                let cur_strength = community_strength.get(&current).copied().unwrap_or(0.0);
                let gain = (w_in - base) / graph.total
                    - graph.strength[i] * (cand_strength - cur_strength) / (two_m * graph.total);
                if gain > best_gain + MIN_IMPROVEMENT {
                    best_gain = gain;
                    best = candidate;
                }
            }
            *community_strength.entry(best).or_insert(0.0) += graph.strength[i];
            if best != current {
                communities[i] = best;
                moved = true;
                any_moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    any_moved
}

/// Full Louvain: returns per-node community index (dense, 0-based) and the
/// final modularity. Deterministic for a given seed.
pub fn detect_communities(nodes: &[Node], edges: &[Edge]) -> (Vec<usize>, f64) {
    let n = nodes.len();
    if n == 0 {
        return (Vec::new(), 0.0);
    }
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), i))
        .collect();
    let weighted: Vec<(usize, usize, f64)> = edges
        .iter()
        .filter_map(|e| {
            let a = *index.get(e.source_id.as_str())?;
            let b = *index.get(e.target_id.as_str())?;
            Some((a, b, e.confidence.max(0.05)))
        })
        .collect();

    let mut graph = WeightedGraph::build(n, &weighted);
    // node → community at the base level, maintained through aggregations.
    let mut assignment: Vec<usize> = (0..n).collect();
    let mut communities: Vec<usize> = (0..graph.n).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(LOUVAIN_SEED);

    for _ in 0..MAX_OUTER_PASSES {
        let moved = local_moving(&graph, &mut communities, &mut rng);
        if !moved {
            break;
        }
        // Aggregate: relabel communities densely, collapse nodes.
        let mut dense: HashMap<usize, usize> = HashMap::new();
        for &c in &communities {
            let next = dense.len();
            dense.entry(c).or_insert(next);
        }
        for slot in assignment.iter_mut() {
            *slot = dense[&communities[*slot]];
        }
        let super_n = dense.len();
        if super_n == graph.n {
            break;
        }
        let mut super_edges: HashMap<(usize, usize), f64> = HashMap::new();
        for (i, neighbors) in graph.adj.iter().enumerate() {
            let ci = dense[&communities[i]];
            for &(j, w) in neighbors {
                if i < j {
                    let cj = dense[&communities[j]];
                    let key = if ci <= cj { (ci, cj) } else { (cj, ci) };
                    *super_edges.entry(key).or_insert(0.0) += w;
                }
            }
        }
        let collapsed: Vec<(usize, usize, f64)> = super_edges
            .into_iter()
            .map(|((a, b), w)| (a, b, w))
            .collect();
        graph = WeightedGraph::build(super_n, &collapsed);
        communities = (0..super_n).collect();
    }

    // Final dense relabel of the base-level assignment.
    let mut dense: HashMap<usize, usize> = HashMap::new();
    for &c in &assignment {
        let next = dense.len();
        dense.entry(c).or_insert(next);
    }
    let final_assignment: Vec<usize> = assignment.iter().map(|c| dense[c]).collect();

    // Modularity over the original graph.
    let base = WeightedGraph::build(n, &weighted);
    let q = modularity_of(&base, &final_assignment);
    (final_assignment, q)
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterInfo {
    pub id: String,
    pub size: usize,
    pub node_ids: Vec<String>,
    pub top_terms: Vec<String>,
    pub centroid: Centroid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Centroid {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterReport {
    pub clusters: Vec<ClusterInfo>,
    pub modularity: Option<f64>,
    pub stats: ClusterStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub clusters: usize,
    pub nodes: usize,
}

/// Run Louvain for one namespace and persist memberships, node
/// properties, and cluster records.
pub async fn compute_clusters(ctx: &GraphLoomContext, namespace: &str) -> Result<ClusterReport> {
    let _guard = ctx.analytics_guard(namespace)?;
    let (nodes, edges) = ctx.store.export_graph(namespace, usize::MAX).await?;
    if nodes.is_empty() {
        return Ok(ClusterReport {
            clusters: Vec::new(),
            modularity: None,
            stats: ClusterStats {
                clusters: 0,
                nodes: 0,
            },
        });
    }

    let (assignment, modularity) = detect_communities(&nodes, &edges);

    // Group and order by size (largest first) for stable c1, c2, … ids.
    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, &c) in assignment.iter().enumerate() {
        groups.entry(c).or_default().push(i);
    }
    let mut ordered: Vec<Vec<usize>> = groups.into_values().collect();
    ordered.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| nodes[a[0]].id.cmp(&nodes[b[0]].id))
    });

    let pool = ctx.store.embedded().pool();
    sqlx::query("DELETE FROM cluster_members WHERE namespace = ? AND algorithm = 'louvain'")
        .bind(namespace)
        .execute(pool)
        .await?;

    let mut clusters = Vec::with_capacity(ordered.len());
    let mut prop_updates = Vec::new();
    for (rank, member_indices) in ordered.iter().enumerate() {
        let cluster_id = format!("c{}", rank + 1);
        let mut node_ids: Vec<String> =
            member_indices.iter().map(|&i| nodes[i].id.clone()).collect();
        node_ids.sort();

        for node_id in &node_ids {
            sqlx::query(
                "INSERT INTO cluster_members (node_id, cluster_id, namespace, algorithm) \
                 VALUES (?, ?, ?, 'louvain')",
            )
            .bind(node_id)
            .bind(&cluster_id)
            .bind(namespace)
            .execute(pool)
            .await?;
        }

        let members: Vec<&Node> = member_indices.iter().map(|&i| &nodes[i]).collect();
        let top_terms = top_terms_for(&members);
        let centroid = centroid_of(&members);

        for node in &members {
            let mut props = crate::models::PropMap::new();
            props.insert("community_id".into(), serde_json::json!(cluster_id));
            props.insert("community_level".into(), serde_json::json!(1));
            prop_updates.push((node.id.clone(), props));
        }

        clusters.push(ClusterInfo {
            id: cluster_id,
            size: node_ids.len(),
            node_ids,
            top_terms,
            centroid,
        });
    }
    ctx.store.update_node_properties(&prop_updates).await?;

    Ok(ClusterReport {
        stats: ClusterStats {
            clusters: clusters.len(),
            nodes: nodes.len(),
        },
        modularity: Some(modularity),
        clusters,
    })
}

/// Top tokens by term frequency across the cluster's chunk texts and
/// entity names.
fn top_terms_for(members: &[&Node]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for node in members {
        let text = match node.prop_str("text") {
            Some(text) => text.to_string(),
            None => node.name.clone(),
        };
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            let token = token.to_lowercase();
            if token.len() < 3 || token.len() > 30 {
                continue;
            }
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(TOP_TERMS).map(|(t, _)| t).collect()
}

fn centroid_of(members: &[&Node]) -> Centroid {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for node in members {
        if let Some((x, y)) = node.layout_xy() {
            xs.push(x);
            ys.push(y);
        }
    }
    if xs.is_empty() {
        return Centroid { x: 0.0, y: 0.0 };
    }
    Centroid {
        x: xs.iter().sum::<f64>() / xs.len() as f64,
        y: ys.iter().sum::<f64>() / ys.len() as f64,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub label: String,
    pub summary: String,
}

/// Summarize the given clusters. Cached by a hash of `(cluster_id,
/// top_terms)`; guarded by the per-minute rate window and the daily token
/// budget. Without an LLM the label degrades to the top terms.
pub async fn summarize_clusters(
    ctx: &GraphLoomContext,
    namespace: &str,
    cluster_ids: &[String],
) -> Result<Vec<ClusterSummary>> {
    let report = compute_clusters(ctx, namespace).await?;
    let by_id: HashMap<&str, &ClusterInfo> =
        report.clusters.iter().map(|c| (c.id.as_str(), c)).collect();
    let pool = ctx.store.embedded().pool();
    let mut summaries = Vec::new();

    let targets: Vec<String> = if cluster_ids.is_empty() {
        report.clusters.iter().map(|c| c.id.clone()).collect()
    } else {
        cluster_ids.to_vec()
    };

    for cluster_id in &targets {
        let Some(info) = by_id.get(cluster_id.as_str()) else {
            continue;
        };
        let terms_hash = crate::embedding::text_hash(&format!(
            "{}|{}",
            cluster_id,
            info.top_terms.join("|")
        ));

        let cached = sqlx::query(
            "SELECT label, summary FROM cluster_summaries \
             WHERE namespace = ? AND cluster_id = ? AND algorithm = 'louvain' AND top_terms_hash = ?",
        )
        .bind(namespace)
        .bind(cluster_id)
        .bind(&terms_hash)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = cached {
            summaries.push(ClusterSummary {
                cluster_id: cluster_id.clone(),
                label: row.get("label"),
                summary: row.get("summary"),
            });
            continue;
        }

        if !ctx.summary_rate_ok(namespace) {
            summaries.push(ClusterSummary {
                cluster_id: cluster_id.clone(),
                label: cluster_id.clone(),
                summary: "Rate limit exceeded; try later.".to_string(),
            });
            continue;
        }

        let max_tokens = ctx.config.cluster.summary_max_tokens;
        let (label, summary) = match &ctx.llm {
            Some(client) if ctx.summary_budget_take(namespace, max_tokens) => {
                let sample: Vec<&str> = info
                    .node_ids
                    .iter()
                    .take(SUMMARY_SAMPLE_ENTITIES)
                    .map(|s| s.as_str())
                    .collect();
                let prompt = format!(
                    "TOP_TERMS: {}\nSAMPLE_ENTITIES: {}\n\
                     Return JSON with keys label (at most 12 words) and summary (2 concise sentences).",
                    info.top_terms.join(", "),
                    sample.join(", ")
                );
                match client
                    .chat("You label graph clusters. Output only JSON.", &prompt, Some(max_tokens))
                    .await
                {
                    Ok(response) => parse_summary_response(&response)
                        .unwrap_or_else(|| heuristic_summary(cluster_id, &info.top_terms)),
                    Err(e) => {
                        tracing::warn!(error = %e, cluster_id = %cluster_id, "cluster summary failed");
                        heuristic_summary(cluster_id, &info.top_terms)
                    }
                }
            }
            Some(_) => (
                cluster_id.clone(),
                "Budget exhausted; skipping summary.".to_string(),
            ),
            None => heuristic_summary(cluster_id, &info.top_terms),
        };

        sqlx::query(
            r#"
            INSERT INTO cluster_summaries (cluster_id, namespace, algorithm, top_terms_hash, label, summary, created_at)
            VALUES (?, ?, 'louvain', ?, ?, ?, ?)
            ON CONFLICT(cluster_id, namespace, algorithm) DO UPDATE SET
                top_terms_hash = excluded.top_terms_hash,
                label = excluded.label,
                summary = excluded.summary,
                created_at = excluded.created_at
            "#,
        )
        .bind(cluster_id)
        .bind(namespace)
        .bind(&terms_hash)
        .bind(&label)
        .bind(&summary)
        .bind(utc_now_iso())
        .execute(pool)
        .await?;

        summaries.push(ClusterSummary {
            cluster_id: cluster_id.clone(),
            label,
            summary,
        });
    }
    Ok(summaries)
}

fn parse_summary_response(response: &str) -> Option<(String, String)> {
    let json: serde_json::Value = serde_json::from_str(extract_json_object(response)?).ok()?;
    let label = json.get("label")?.as_str()?.trim().to_string();
    let summary = json
        .get("summary")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    if label.is_empty() {
        return None;
    }
    Some((truncate(&label, 120), truncate(&summary, 800)))
}

fn heuristic_summary(cluster_id: &str, top_terms: &[String]) -> (String, String) {
    let label = if top_terms.is_empty() {
        format!("Cluster {}", cluster_id)
    } else {
        top_terms.iter().take(3).cloned().collect::<Vec<_>>().join(" ")
    };
    (
        label,
        "LLM disabled; heuristic label derived from frequent terms.".to_string(),
    )
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

pub async fn list_summaries(
    ctx: &GraphLoomContext,
    namespace: &str,
) -> Result<Vec<ClusterSummary>> {
    let rows = sqlx::query(
        "SELECT cluster_id, label, summary FROM cluster_summaries \
         WHERE namespace = ? AND algorithm = 'louvain' ORDER BY cluster_id",
    )
    .bind(namespace)
    .fetch_all(ctx.store.embedded().pool())
    .await?;
    Ok(rows
        .iter()
        .map(|r| ClusterSummary {
            cluster_id: r.get("cluster_id"),
            label: r.get("label"),
            summary: r.get("summary"),
        })
        .collect())
}

/// Community ids currently persisted for a namespace; used by snapshots.
pub async fn current_community_ids(
    ctx: &GraphLoomContext,
    namespace: &str,
) -> Result<Vec<String>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT cluster_id FROM cluster_members \
         WHERE namespace = ? AND algorithm = 'louvain' ORDER BY cluster_id",
    )
    .bind(namespace)
    .fetch_all(ctx.store.embedded().pool())
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::relation;

    fn node(id: &str) -> Node {
        Node::new(id, NodeLabel::Entity, id, "public")
    }

    fn edge(a: &str, b: &str, confidence: f64) -> Edge {
        Edge::new(a, b, relation::CO_OCCURS, confidence, "public")
    }

    /// Two dense cliques joined by a single weak bridge.
    fn two_cliques() -> (Vec<Node>, Vec<Edge>) {
        let names = ["a1", "a2", "a3", "a4", "b1", "b2", "b3", "b4"];
        let nodes: Vec<Node> = names.iter().map(|n| node(n)).collect();
        let mut edges = Vec::new();
        for group in [&names[..4], &names[4..]] {
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    edges.push(edge(group[i], group[j], 0.9));
                }
            }
        }
        edges.push(edge("a1", "b1", 0.1));
        (nodes, edges)
    }

    #[test]
    fn test_two_cliques_split_into_two_communities() {
        let (nodes, edges) = two_cliques();
        let (assignment, modularity) = detect_communities(&nodes, &edges);
        let a_side: HashSet<usize> = assignment[..4].iter().copied().collect();
        let b_side: HashSet<usize> = assignment[4..].iter().copied().collect();
        assert_eq!(a_side.len(), 1, "first clique split: {:?}", assignment);
        assert_eq!(b_side.len(), 1, "second clique split: {:?}", assignment);
        assert_ne!(a_side, b_side);
        assert!(modularity > 0.2, "modularity {}", modularity);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let (nodes, edges) = two_cliques();
        let (a, qa) = detect_communities(&nodes, &edges);
        let (b, qb) = detect_communities(&nodes, &edges);
        assert_eq!(a, b);
        assert_eq!(qa, qb);
    }

    #[test]
    fn test_empty_graph() {
        let (assignment, q) = detect_communities(&[], &[]);
        assert!(assignment.is_empty());
        assert_eq!(q, 0.0);
    }

    #[test]
    fn test_top_terms_ranked_by_frequency() {
        let mut chunk = node("c");
        chunk.set_prop(
            "text",
            serde_json::json!("kafka kafka kafka streams streams events"),
        );
        let members = vec![&chunk];
        let terms = top_terms_for(&members);
        assert_eq!(terms[0], "kafka");
        assert_eq!(terms[1], "streams");
    }

    #[tokio::test]
    async fn test_compute_clusters_persists_memberships() {
        use crate::context::tests::test_context;
        use crate::ingest::{ingest_document, IngestRequest};

        let ctx = test_context().await;
        ingest_document(
            &ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "Alice works at Acme. Acme uses Kafka. Bob works at Initech. Initech uses Postgres.".to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();

        let report = compute_clusters(&ctx, "public").await.unwrap();
        assert!(report.stats.clusters >= 1);
        assert!(report.modularity.is_some());

        let ids = current_community_ids(&ctx, "public").await.unwrap();
        assert_eq!(ids.len(), report.stats.clusters);

        let node = ctx.store.get_node("public:acme").await.unwrap().unwrap();
        assert!(node.prop_str("community_id").is_some());
    }

    #[tokio::test]
    async fn test_summaries_without_llm_are_heuristic_and_cached() {
        use crate::context::tests::test_context;
        use crate::ingest::{ingest_document, IngestRequest};

        let ctx = test_context().await;
        ingest_document(
            &ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "Kafka streams events. Kafka connects services.".to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();

        let first = summarize_clusters(&ctx, "public", &[]).await.unwrap();
        assert!(!first.is_empty());
        assert!(first.iter().all(|s| !s.label.is_empty()));

        let listed = list_summaries(&ctx, "public").await.unwrap();
        assert_eq!(listed.len(), first.len());
    }
}
