//! Hybrid retrieval engine.
//!
//! Query execution is a staged pipeline — candidate generation, structural
//! rerank, adjacency expansion, truncation — with cooperative cancellation
//! checked between stages. Each stage appends a snapshot to the
//! `reasoning_chain` returned with the results.
//!
//! # Modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `local` | Similarity-weighted scoring over the namespace sample |
//! | `global` | Centrality-weighted scoring for broad questions |
//! | `drift` | Centrality-leaning blend for out-of-domain queries |
//! | `auto` | `local` first; retries `global` and merges when the best local score is below the configured threshold |
//! | `structured` | Ranks over the latest index-run artifacts when present, else falls back to `local` |
//!
//! Scoring per candidate:
//! `score = w_sim·sim + w_deg·degree_norm + w_cent·pagerank_norm + w_lex·term_overlap`
//! with per-mode weights from the configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::ModeWeights;
use crate::context::GraphLoomContext;
use crate::embedding::cosine_similarity;
use crate::error::{GraphLoomError, Result};
use crate::models::{relation, Node};
use crate::orchestrator;

/// Relations followed during adjacency expansion.
const EXPANSION_RELATIONS: [&str; 4] = [
    relation::MENTIONED_IN,
    relation::HAS_ENTITY,
    relation::ROLE_AT,
    relation::USES_TECH,
];

/// Ids listed per reasoning-chain step; full candidate sets can be large.
const CHAIN_ID_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Auto,
    Global,
    Local,
    Drift,
    Structured,
}

impl QueryMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "global" => Some(Self::Global),
            "local" => Some(Self::Local),
            "drift" => Some(Self::Drift),
            "structured" => Some(Self::Structured),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Global => "global",
            Self::Local => "local",
            Self::Drift => "drift",
            Self::Structured => "structured",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryFilters {
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub relations: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub namespace: Option<String>,
    pub mode: QueryMode,
    pub top_k: usize,
    pub filters: QueryFilters,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub similarity: f64,
    pub degree: f64,
    pub centrality: f64,
    pub lexical: f64,
    /// Seed node id when this candidate joined via adjacency expansion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_from: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredNode {
    pub id: String,
    pub label: String,
    pub name: String,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub node_id: String,
    pub text: String,
    pub section_path: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasoningStep {
    pub step: String,
    pub candidate_ids: Vec<String>,
    pub score_breakdown: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub mode_used: String,
    pub nodes: Vec<ScoredNode>,
    pub passages: Vec<Passage>,
    pub reasoning_chain: Vec<ReasoningStep>,
}

/// Cooperative cancellation flag checked between pipeline stages. Partial
/// results are never returned from a cancelled query.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(GraphLoomError::Cancelled("query aborted between stages".into()))
        } else {
            Ok(())
        }
    }
}

struct Candidate {
    node: Node,
    similarity: f64,
    lexical: f64,
    score: f64,
    expanded_from: Option<String>,
}

/// Execute a retrieval query.
pub async fn query(
    ctx: &GraphLoomContext,
    request: &QueryRequest,
    cancel: &CancelToken,
) -> Result<QueryResponse> {
    if request.query.trim().is_empty() {
        return Err(GraphLoomError::Validation("query must not be empty".into()));
    }
    let started = Instant::now();
    ctx.metrics
        .retrieval_requests
        .fetch_add(1, Ordering::Relaxed);

    let namespace = ctx.namespace_or_default(request.namespace.as_deref());
    let response = match request.mode {
        QueryMode::Auto => {
            let local = run_mode(ctx, request, &namespace, QueryMode::Local, cancel).await?;
            let best = local.nodes.first().map(|n| n.score).unwrap_or(0.0);
            if best >= ctx.config.retrieval.auto_threshold {
                let mut response = local;
                response.reasoning_chain.insert(
                    0,
                    mode_step("local", "auto: local score above threshold"),
                );
                response
            } else {
                let global = run_mode(ctx, request, &namespace, QueryMode::Global, cancel).await?;
                let mut merged = merge_responses(local, global, request.top_k);
                merged.reasoning_chain.insert(
                    0,
                    mode_step("global", "auto: local below threshold, retried global and merged"),
                );
                merged.mode_used = "global".to_string();
                merged
            }
        }
        QueryMode::Structured => {
            match structured_query(ctx, request, &namespace).await? {
                Some(response) => response,
                None => {
                    let mut response =
                        run_mode(ctx, request, &namespace, QueryMode::Local, cancel).await?;
                    response.reasoning_chain.insert(
                        0,
                        mode_step("local", "structured: no artifacts present, fell back to local"),
                    );
                    response
                }
            }
        }
        mode => run_mode(ctx, request, &namespace, mode, cancel).await?,
    };

    ctx.metrics.record_mode(&response.mode_used);
    ctx.metrics
        .record_latency("retrieval", started.elapsed().as_secs_f64());
    Ok(response)
}

fn mode_step(mode: &str, detail: &str) -> ReasoningStep {
    ReasoningStep {
        step: "mode_selection".to_string(),
        candidate_ids: Vec::new(),
        score_breakdown: serde_json::json!({"mode": mode, "detail": detail}),
    }
}

fn weights_for(ctx: &GraphLoomContext, mode: QueryMode) -> ModeWeights {
    match mode {
        QueryMode::Global => ctx.config.retrieval.global,
        QueryMode::Drift => ctx.config.retrieval.drift,
        _ => ctx.config.retrieval.local,
    }
}

async fn run_mode(
    ctx: &GraphLoomContext,
    request: &QueryRequest,
    namespace: &str,
    mode: QueryMode,
    cancel: &CancelToken,
) -> Result<QueryResponse> {
    let weights = weights_for(ctx, mode);
    let mut chain = Vec::new();

    // Stage 1: candidate generation over a bounded namespace sample.
    cancel.check()?;
    let sample = load_sample(ctx, namespace, &request.filters).await?;

    cancel.check()?;
    let query_vec = if ctx.embedder.is_enabled() {
        ctx.embedder.embed_query(&request.query).await.unwrap_or_default()
    } else {
        Vec::new()
    };

    let query_lower = request.query.to_lowercase();
    let query_terms: Vec<String> = tokenize_query(&query_lower);
    let mut candidates: HashMap<String, Candidate> = HashMap::new();

    let have_vectors =
        !query_vec.is_empty() && sample.iter().any(|n| !n.embedding.is_empty());
    for node in &sample {
        // Without vectors, a case-insensitive name match stands in for the
        // similarity signal (exact match strongest).
        let similarity = if have_vectors && !node.embedding.is_empty() {
            cosine_similarity(&query_vec, &node.embedding) as f64
        } else if !have_vectors {
            let name_lower = node.name.to_lowercase();
            if name_lower == query_lower {
                1.0
            } else if name_lower.contains(&query_lower) {
                0.7
            } else {
                0.0
            }
        } else {
            0.0
        };
        let lexical = lexical_score(node, &query_terms);
        if similarity > 0.0 || lexical > 0.0 {
            candidates.insert(
                node.id.clone(),
                Candidate {
                    node: node.clone(),
                    similarity,
                    lexical,
                    score: 0.0,
                    expanded_from: None,
                },
            );
        }
    }
    chain.push(ReasoningStep {
        step: "candidate_generation".to_string(),
        candidate_ids: capped_ids(candidates.values().map(|c| c.node.id.clone())),
        score_breakdown: serde_json::json!({
            "sample_size": sample.len(),
            "vector_search": have_vectors,
            "candidates": candidates.len(),
        }),
    });

    // Stage 2: structural rerank.
    cancel.check()?;
    for candidate in candidates.values_mut() {
        candidate.score = combine(&weights, candidate);
    }
    chain.push(ReasoningStep {
        step: "structural_rerank".to_string(),
        candidate_ids: capped_ids(top_ids(&candidates)),
        score_breakdown: serde_json::json!({
            "weights": {
                "similarity": weights.similarity,
                "degree": weights.degree,
                "centrality": weights.centrality,
                "lexical": weights.lexical,
            }
        }),
    });

    // Stage 3: adjacency expansion around the top seeds.
    cancel.check()?;
    let seeds: Vec<(String, f64)> = {
        let mut ranked: Vec<&Candidate> = candidates.values().collect();
        sort_candidates(&mut ranked);
        ranked
            .iter()
            .take(ctx.config.retrieval.expansion_seeds)
            .map(|c| (c.node.id.clone(), c.score))
            .collect()
    };
    let mut expanded_ids = Vec::new();
    let allowed: Vec<String> = match &request.filters.relations {
        Some(filter) => EXPANSION_RELATIONS
            .iter()
            .filter(|r| filter.iter().any(|f| f.eq_ignore_ascii_case(r)))
            .map(|r| r.to_string())
            .collect(),
        None => EXPANSION_RELATIONS.iter().map(|r| r.to_string()).collect(),
    };
    for (seed_id, seed_score) in &seeds {
        let (nodes, edges) = ctx.store.neighbors(seed_id, 1).await?;
        for node in nodes {
            if node.id == *seed_id || candidates.contains_key(&node.id) {
                continue;
            }
            let connected = edges.iter().any(|e| {
                allowed.iter().any(|r| r == &e.relation)
                    && ((e.source_id == *seed_id && e.target_id == node.id)
                        || (e.target_id == *seed_id && e.source_id == node.id))
            });
            if !connected {
                continue;
            }
            if !label_allowed(&node, &request.filters) {
                continue;
            }
            let decayed = seed_score * ctx.config.retrieval.expansion_decay;
            expanded_ids.push(node.id.clone());
            candidates.insert(
                node.id.clone(),
                Candidate {
                    node,
                    similarity: 0.0,
                    lexical: 0.0,
                    score: decayed,
                    expanded_from: Some(seed_id.clone()),
                },
            );
        }
    }
    chain.push(ReasoningStep {
        step: "adjacency_expansion".to_string(),
        candidate_ids: capped_ids(expanded_ids.iter().cloned()),
        score_breakdown: serde_json::json!({
            "seeds": seeds.len(),
            "decay": ctx.config.retrieval.expansion_decay,
            "added": expanded_ids.len(),
        }),
    });

    // Stage 4: final ordering and truncation.
    cancel.check()?;
    let mut ranked: Vec<&Candidate> = candidates.values().collect();
    sort_candidates(&mut ranked);
    ranked.truncate(request.top_k);

    let nodes: Vec<ScoredNode> = ranked
        .iter()
        .map(|c| ScoredNode {
            id: c.node.id.clone(),
            label: c.node.label.as_str().to_string(),
            name: c.node.name.clone(),
            score: round6(c.score),
            breakdown: ScoreBreakdown {
                similarity: round6(c.similarity),
                degree: round6(c.node.prop_f64("degree_norm").unwrap_or(0.0)),
                centrality: round6(c.node.prop_f64("pagerank_norm").unwrap_or(0.0)),
                lexical: round6(c.lexical),
                expanded_from: c.expanded_from.clone(),
            },
        })
        .collect();
    let passages: Vec<Passage> = ranked
        .iter()
        .filter_map(|c| {
            c.node.prop_str("text").map(|text| Passage {
                node_id: c.node.id.clone(),
                text: text.to_string(),
                section_path: c.node.prop_str("section_path").map(|s| s.to_string()),
                score: round6(c.score),
            })
        })
        .collect();
    chain.push(ReasoningStep {
        step: "truncation".to_string(),
        candidate_ids: nodes.iter().map(|n| n.id.clone()).collect(),
        score_breakdown: serde_json::json!({"top_k": request.top_k}),
    });

    Ok(QueryResponse {
        mode_used: mode.as_str().to_string(),
        nodes,
        passages,
        reasoning_chain: chain,
    })
}

/// Bounded candidate sample: chunks first, then entities by importance.
async fn load_sample(
    ctx: &GraphLoomContext,
    namespace: &str,
    filters: &QueryFilters,
) -> Result<Vec<Node>> {
    let cap = ctx.config.retrieval.sample_cap;
    let (nodes, _) = ctx.store.export_graph(namespace, cap * 4).await?;
    let mut sample: Vec<Node> = nodes
        .into_iter()
        .filter(|n| label_allowed(n, filters))
        .collect();
    sample.sort_by(|a, b| {
        let a_chunk = a.prop_str("text").is_some();
        let b_chunk = b.prop_str("text").is_some();
        b_chunk
            .cmp(&a_chunk)
            .then_with(|| {
                b.prop_f64("importance")
                    .unwrap_or(0.0)
                    .partial_cmp(&a.prop_f64("importance").unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    sample.truncate(cap);
    Ok(sample)
}

fn label_allowed(node: &Node, filters: &QueryFilters) -> bool {
    match &filters.labels {
        Some(labels) => labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(node.label.as_str())),
        None => true,
    }
}

fn tokenize_query(query_lower: &str) -> Vec<String> {
    query_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// Term-frequency lexical signal in [0, 1]. Chunks score by term hits in
/// their text (no IDF), entities by query-term overlap with their name.
fn lexical_score(node: &Node, query_terms: &[String]) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    match node.prop_str("text") {
        Some(text) => {
            let text_lower = text.to_lowercase();
            let hits = query_terms
                .iter()
                .filter(|t| text_lower.contains(t.as_str()))
                .count();
            hits as f64 / query_terms.len() as f64
        }
        None => {
            let name_lower = node.name.to_lowercase();
            let name_terms: Vec<&str> = name_lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect();
            if name_terms.is_empty() {
                return 0.0;
            }
            let overlap = query_terms
                .iter()
                .filter(|t| name_terms.contains(&t.as_str()))
                .count();
            overlap as f64 / query_terms.len() as f64
        }
    }
}

fn combine(weights: &ModeWeights, candidate: &Candidate) -> f64 {
    weights.similarity * candidate.similarity
        + weights.degree * candidate.node.prop_f64("degree_norm").unwrap_or(0.0)
        + weights.centrality * candidate.node.prop_f64("pagerank_norm").unwrap_or(0.0)
        + weights.lexical * candidate.lexical
}

/// Ties break on higher importance, then lexicographic id.
fn sort_candidates(candidates: &mut [&Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.node
                    .prop_f64("importance")
                    .unwrap_or(0.0)
                    .partial_cmp(&a.node.prop_f64("importance").unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
}

fn top_ids(candidates: &HashMap<String, Candidate>) -> impl Iterator<Item = String> + '_ {
    let mut ranked: Vec<&Candidate> = candidates.values().collect();
    sort_candidates(&mut ranked);
    ranked
        .into_iter()
        .map(|c| c.node.id.clone())
        .collect::<Vec<_>>()
        .into_iter()
}

fn capped_ids(ids: impl Iterator<Item = String>) -> Vec<String> {
    ids.take(CHAIN_ID_CAP).collect()
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

fn merge_responses(a: QueryResponse, b: QueryResponse, top_k: usize) -> QueryResponse {
    let mut by_id: HashMap<String, ScoredNode> = HashMap::new();
    for node in a.nodes.into_iter().chain(b.nodes.into_iter()) {
        let keep_existing = by_id
            .get(&node.id)
            .map(|existing| existing.score >= node.score)
            .unwrap_or(false);
        if !keep_existing {
            by_id.insert(node.id.clone(), node);
        }
    }
    let mut nodes: Vec<ScoredNode> = by_id.into_values().collect();
    nodes.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| x.id.cmp(&y.id))
    });
    nodes.truncate(top_k);

    let mut passages_by_id: HashMap<String, Passage> = HashMap::new();
    for passage in a.passages.into_iter().chain(b.passages.into_iter()) {
        passages_by_id.entry(passage.node_id.clone()).or_insert(passage);
    }
    let kept: std::collections::HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let mut passages: Vec<Passage> = passages_by_id
        .into_values()
        .filter(|p| kept.contains(p.node_id.as_str()))
        .collect();
    passages.sort_by(|x, y| {
        y.score
            .partial_cmp(&x.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| x.node_id.cmp(&y.node_id))
    });

    let mut chain = a.reasoning_chain;
    chain.extend(b.reasoning_chain);

    QueryResponse {
        mode_used: "global".to_string(),
        nodes,
        passages,
        reasoning_chain: chain,
    }
}

/// Rank over the latest run artifacts: term overlap plus a dampened
/// degree signal from the relationship file.
async fn structured_query(
    ctx: &GraphLoomContext,
    request: &QueryRequest,
    namespace: &str,
) -> Result<Option<QueryResponse>> {
    let Some(artifacts) = orchestrator::load_latest_artifacts(ctx, namespace)? else {
        return Ok(None);
    };

    let mut degree: HashMap<&str, u64> = HashMap::new();
    for rel in &artifacts.relationships {
        *degree.entry(rel.src_id.as_str()).or_insert(0) += 1;
        *degree.entry(rel.dst_id.as_str()).or_insert(0) += 1;
    }

    let query_lower = request.query.to_lowercase();
    let query_terms = tokenize_query(&query_lower);
    let mut scored: Vec<ScoredNode> = artifacts
        .entities
        .iter()
        .map(|e| {
            let name_lower = e.name.to_lowercase();
            let name_terms: Vec<&str> = name_lower
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect();
            let overlap = if query_terms.is_empty() {
                0.0
            } else {
                query_terms
                    .iter()
                    .filter(|t| name_terms.contains(&t.as_str()))
                    .count() as f64
                    / query_terms.len() as f64
            };
            let deg = *degree.get(e.entity_id.as_str()).unwrap_or(&0) as f64;
            let score = 0.6 * overlap + 0.4 * ((1.0 + deg).ln() / 4.0);
            ScoredNode {
                id: e.entity_id.clone(),
                label: e.entity_type.clone(),
                name: e.name.clone(),
                score: round6(score),
                breakdown: ScoreBreakdown {
                    similarity: 0.0,
                    degree: round6(deg),
                    centrality: 0.0,
                    lexical: round6(overlap),
                    expanded_from: None,
                },
            }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    scored.truncate(request.top_k);

    Ok(Some(QueryResponse {
        mode_used: "structured".to_string(),
        nodes: scored,
        passages: Vec::new(),
        reasoning_chain: vec![ReasoningStep {
            step: "structured_artifacts".to_string(),
            candidate_ids: Vec::new(),
            score_breakdown: serde_json::json!({
                "entities": artifacts.entities.len(),
                "relationships": artifacts.relationships.len(),
            }),
        }],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::ingest::{ingest_document, IngestRequest};

    fn request(query: &str, mode: QueryMode, top_k: usize) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            namespace: None,
            mode,
            top_k,
            filters: QueryFilters::default(),
        }
    }

    async fn seed(ctx: &crate::context::GraphLoomContext) {
        ingest_document(
            ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "OpenAI collaborates with Microsoft and Google on AI safety."
                    .to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_query_returns_entity_first() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let response = query(&ctx, &request("OpenAI", QueryMode::Local, 5), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(response.mode_used, "local");
        assert!(!response.nodes.is_empty());
        assert_eq!(response.nodes[0].id, "public:openai");
        // The chunk mentioning the query term surfaces as a passage.
        assert!(!response.passages.is_empty());
    }

    #[tokio::test]
    async fn test_reasoning_chain_has_all_stages() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let response = query(&ctx, &request("OpenAI", QueryMode::Local, 5), &CancelToken::new())
            .await
            .unwrap();
        let steps: Vec<&str> = response
            .reasoning_chain
            .iter()
            .map(|s| s.step.as_str())
            .collect();
        assert!(steps.contains(&"candidate_generation"));
        assert!(steps.contains(&"structural_rerank"));
        assert!(steps.contains(&"adjacency_expansion"));
        assert!(steps.contains(&"truncation"));
    }

    #[tokio::test]
    async fn test_top_k_monotonicity() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let small = query(&ctx, &request("OpenAI safety", QueryMode::Local, 3), &CancelToken::new())
            .await
            .unwrap();
        let large = query(&ctx, &request("OpenAI safety", QueryMode::Local, 8), &CancelToken::new())
            .await
            .unwrap();
        let large_ids: Vec<&str> = large.nodes.iter().map(|n| n.id.as_str()).collect();
        for node in &small.nodes {
            assert!(
                large_ids.contains(&node.id.as_str()),
                "{} disappeared when top_k grew",
                node.id
            );
        }
    }

    #[tokio::test]
    async fn test_auto_mode_runs() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let response = query(&ctx, &request("OpenAI", QueryMode::Auto, 5), &CancelToken::new())
            .await
            .unwrap();
        assert!(response.mode_used == "local" || response.mode_used == "global");
        assert_eq!(response.reasoning_chain[0].step, "mode_selection");
    }

    #[tokio::test]
    async fn test_label_filter_applied_before_scoring() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let mut req = request("OpenAI", QueryMode::Local, 10);
        req.filters.labels = Some(vec!["Chunk".to_string()]);
        let response = query(&ctx, &req, &CancelToken::new()).await.unwrap();
        assert!(response.nodes.iter().all(|n| n.label == "Chunk"));
    }

    #[tokio::test]
    async fn test_cancelled_query_returns_no_results() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = query(&ctx, &request("OpenAI", QueryMode::Local, 5), &cancel).await;
        assert!(matches!(result, Err(GraphLoomError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_unknown_namespace_returns_empty() {
        let ctx = test_context().await;
        seed(&ctx).await;
        let mut req = request("OpenAI", QueryMode::Local, 5);
        req.namespace = Some("elsewhere".to_string());
        let response = query(&ctx, &req, &CancelToken::new()).await.unwrap();
        assert!(response.nodes.is_empty());
    }
}
