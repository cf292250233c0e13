//! HTTP API.
//!
//! All endpoints live under `/graphrag`. Responses are JSON; errors use
//! the envelope `{"error": {"code": "...", "message": "..."}}` and raw
//! internal errors never leak. When an API key is configured, mutating
//! endpoints and `/answer` require the `x-api-key` header; `global`
//! queries and cluster summarization run under stricter rate limits.
//!
//! | Method | Path | Purpose |
//! |--------|------|---------|
//! | `POST` | `/graphrag/ingest` | Ingest one document |
//! | `POST` | `/graphrag/ingest-file` | Multipart file upload ingest |
//! | `POST` | `/graphrag/ingest-batch` | Up to `ingest.max_batch` documents |
//! | `POST` | `/graphrag/query` | Hybrid retrieval |
//! | `POST` | `/graphrag/answer` | Grounded answer synthesis |
//! | `GET`  | `/graphrag/graph` | Random/viewport subgraph sample |
//! | `GET`  | `/graphrag/nodes` | Cursor-paged node listing |
//! | `GET`  | `/graphrag/edges` | Edges for a node id set |
//! | `GET`  | `/graphrag/neighbors/{id}` | Neighborhood up to depth 2 |
//! | `GET`  | `/graphrag/search` | Name-prefix search |
//! | `GET`  | `/graphrag/stats`, `/graphrag/namespaces` | Aggregates |
//! | `POST` | `/graphrag/path` | Shortest path |
//! | `GET/POST` | `/graphrag/similar` | Embedding/name similarity |
//! | `POST` | `/graphrag/centrality/recompute`, `/graphrag/layout/recompute` | Analytics |
//! | `GET`  | `/graphrag/cluster`, `/graphrag/cluster/summaries` | Communities |
//! | `POST` | `/graphrag/cluster/summarize` | LLM cluster labels |
//! | `POST` | `/graphrag/index/run` | Background orchestrator run |
//! | `GET`  | `/graphrag/metrics`, `/graphrag/metrics/extended` | Counters |
//! | `GET/POST` | `/graphrag/snapshots`, `/graphrag/snapshots/diff` | Snapshots |
//! | `GET`  | `/graphrag/provenance` | Node neighborhood + supporting chunks |
//! | `GET`  | `/graphrag/stream` | Server-sent events |

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::{
    extract::{Multipart, Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::analytics::{self, LayoutMode};
use crate::answer;
use crate::cluster;
use crate::context::GraphLoomContext;
use crate::error::GraphLoomError;
use crate::ingest::{self, IngestOutcome, IngestRequest};
use crate::models::{utc_now_compact, Edge, Node};
use crate::orchestrator;
use crate::retrieval::{self, CancelToken, QueryFilters, QueryMode, QueryRequest};
use crate::snapshot;
use crate::store::SampleMode;

#[derive(Clone)]
struct AppState {
    ctx: Arc<GraphLoomContext>,
    rate_windows: Arc<Mutex<HashMap<&'static str, Vec<Instant>>>>,
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(ctx: Arc<GraphLoomContext>) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    orchestrator::spawn_scheduler(ctx.clone());

    let state = AppState {
        ctx,
        rate_windows: Arc::new(Mutex::new(HashMap::new())),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/graphrag/ingest", post(handle_ingest))
        .route("/graphrag/ingest-file", post(handle_ingest_file))
        .route("/graphrag/ingest-batch", post(handle_ingest_batch))
        .route("/graphrag/query", post(handle_query))
        .route("/graphrag/answer", post(handle_answer))
        .route("/graphrag/graph", get(handle_graph))
        .route("/graphrag/nodes", get(handle_nodes))
        .route("/graphrag/edges", get(handle_edges))
        .route("/graphrag/neighbors/:node_id", get(handle_neighbors))
        .route("/graphrag/search", get(handle_search))
        .route("/graphrag/stats", get(handle_stats))
        .route("/graphrag/namespaces", get(handle_namespaces))
        .route("/graphrag/path", post(handle_path))
        .route("/graphrag/similar", get(handle_similar_get).post(handle_similar_post))
        .route("/graphrag/centrality/recompute", post(handle_centrality))
        .route("/graphrag/layout/recompute", post(handle_layout))
        .route("/graphrag/cluster", get(handle_cluster))
        .route("/graphrag/cluster/summarize", post(handle_summarize))
        .route("/graphrag/cluster/summaries", get(handle_summaries))
        .route("/graphrag/index/run", post(handle_index_run))
        .route("/graphrag/metrics", get(handle_metrics))
        .route("/graphrag/metrics/extended", get(handle_metrics_extended))
        .route("/graphrag/snapshots", get(handle_snapshots_list).post(handle_snapshots_create))
        .route("/graphrag/snapshots/diff", get(handle_snapshots_diff))
        .route("/graphrag/provenance", get(handle_provenance))
        .route("/graphrag/stream", get(handle_stream))
        .route("/graphrag/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("graphrag API listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ---- error envelope ----

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<GraphLoomError> for AppError {
    fn from(e: GraphLoomError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match e.kind() {
            // Internal storage/serialization details stay server-side.
            "internal" => {
                error!(error = %e, "internal error");
                "internal error".to_string()
            }
            _ => e.to_string(),
        };
        Self {
            status,
            code: e.kind().to_string(),
            message,
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "validation".to_string(),
        message: message.into(),
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: "missing or invalid x-api-key".to_string(),
    }
}

fn rate_limited(class: &str) -> AppError {
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited".to_string(),
        message: format!("rate limit exceeded for {}", class),
    }
}

/// Mutating endpoints and `/answer` require the key when one is set.
fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &state.ctx.config.server.api_key else {
        return Ok(());
    };
    match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        Some(provided) if provided == expected => Ok(()),
        _ => Err(unauthorized()),
    }
}

fn check_rate(state: &AppState, class: &'static str) -> Result<(), AppError> {
    let limit = match class {
        "global" => state.ctx.config.server.rate_global_per_min,
        "summarize" => state.ctx.config.server.rate_summarize_per_min,
        _ => state.ctx.config.server.rate_default_per_min,
    };
    let mut windows = state.rate_windows.lock().unwrap();
    let calls = windows.entry(class).or_default();
    let now = Instant::now();
    calls.retain(|t| now.duration_since(*t).as_secs() < 60);
    if calls.len() >= limit {
        return Err(rate_limited(class));
    }
    calls.push(now);
    Ok(())
}

// ---- shared DTOs ----

#[derive(Serialize)]
struct NodeView {
    id: String,
    label: String,
    name: String,
    namespace: String,
    properties: serde_json::Value,
}

impl From<&Node> for NodeView {
    fn from(n: &Node) -> Self {
        Self {
            id: n.id.clone(),
            label: n.label.as_str().to_string(),
            name: n.name.clone(),
            namespace: n.namespace.clone(),
            properties: serde_json::Value::Object(n.properties.clone()),
        }
    }
}

#[derive(Serialize)]
struct EdgeView {
    id: String,
    source_id: String,
    target_id: String,
    relation: String,
    confidence: f64,
}

impl From<&Edge> for EdgeView {
    fn from(e: &Edge) -> Self {
        Self {
            id: e.id.clone(),
            source_id: e.source_id.clone(),
            target_id: e.target_id.clone(),
            relation: e.relation.clone(),
            confidence: e.confidence,
        }
    }
}

// ---- ingestion ----

async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, AppError> {
    require_api_key(&state, &headers)?;
    check_rate(&state, "default")?;
    let outcome = ingest::ingest_document(&state.ctx, request).await?;
    after_ingest(&state, &outcome.namespace);
    Ok(Json(outcome))
}

fn after_ingest(state: &AppState, namespace: &str) {
    orchestrator::maybe_trigger_threshold(state.ctx.clone(), namespace.to_string());
    analytics::maybe_trigger_recompute(state.ctx.clone(), namespace.to_string());
}

async fn handle_ingest_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<IngestOutcome>, AppError> {
    require_api_key(&state, &headers)?;
    check_rate(&state, "default")?;

    let mut doc_id: Option<String> = None;
    let mut namespace: Option<String> = None;
    let mut text: Option<String> = None;
    let mut force_heuristic = false;
    let mut disable_embeddings = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "doc_id" => doc_id = Some(field.text().await.unwrap_or_default()),
            "namespace" => namespace = Some(field.text().await.unwrap_or_default()),
            "force_heuristic" => {
                force_heuristic = field.text().await.unwrap_or_default() == "true"
            }
            "disable_embeddings" => {
                disable_embeddings = field.text().await.unwrap_or_default() == "true"
            }
            "file" => {
                let filename = field.file_name().map(|f| f.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read upload: {}", e)))?;
                text = Some(String::from_utf8_lossy(&bytes).to_string());
                if doc_id.is_none() {
                    doc_id = filename;
                }
            }
            _ => {}
        }
    }

    let outcome = ingest::ingest_document(
        &state.ctx,
        IngestRequest {
            doc_id: doc_id.ok_or_else(|| bad_request("doc_id or file name required"))?,
            text: text.ok_or_else(|| bad_request("file field required"))?,
            namespace,
            metadata: None,
            force_heuristic,
            disable_embeddings,
        },
    )
    .await?;
    after_ingest(&state, &outcome.namespace);
    Ok(Json(outcome))
}

#[derive(Deserialize)]
struct BatchRequest {
    documents: Vec<IngestRequest>,
}

#[derive(Serialize)]
struct BatchResponse {
    documents: usize,
    indexed: usize,
    noop: usize,
    failed: usize,
    nodes_created: u64,
    edges_created: u64,
}

async fn handle_ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, AppError> {
    require_api_key(&state, &headers)?;
    check_rate(&state, "default")?;
    let max = state.ctx.config.ingest.max_batch;
    if request.documents.is_empty() || request.documents.len() > max {
        return Err(bad_request(format!("batch size must be 1..={}", max)));
    }

    let mut response = BatchResponse {
        documents: request.documents.len(),
        indexed: 0,
        noop: 0,
        failed: 0,
        nodes_created: 0,
        edges_created: 0,
    };
    let mut namespaces: Vec<String> = Vec::new();
    for doc in request.documents {
        match ingest::ingest_document(&state.ctx, doc).await {
            Ok(outcome) => {
                if outcome.status == "noop" {
                    response.noop += 1;
                } else {
                    response.indexed += 1;
                }
                response.nodes_created += outcome.nodes_created;
                response.edges_created += outcome.edges_created;
                if !namespaces.contains(&outcome.namespace) {
                    namespaces.push(outcome.namespace);
                }
            }
            Err(e) => {
                warn!(error = %e, "batch document failed");
                response.failed += 1;
            }
        }
    }
    for namespace in namespaces {
        after_ingest(&state, &namespace);
    }
    Ok(Json(response))
}

// ---- retrieval & answers ----

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    filters: Option<QueryFilters>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(body): Json<QueryBody>,
) -> Result<Json<retrieval::QueryResponse>, AppError> {
    let mode = match body.mode.as_deref() {
        None => QueryMode::Auto,
        Some(raw) => QueryMode::parse(raw)
            .ok_or_else(|| bad_request(format!("unknown query mode: {}", raw)))?,
    };
    let class: &'static str = if matches!(mode, QueryMode::Global) {
        "global"
    } else {
        "default"
    };
    check_rate(&state, class)?;

    let request = QueryRequest {
        query: body.query,
        namespace: body.namespace,
        mode,
        top_k: body.top_k.unwrap_or(8).clamp(1, 100),
        filters: body.filters.unwrap_or_default(),
    };
    let response = retrieval::query(&state.ctx, &request, &CancelToken::new()).await?;
    Ok(Json(response))
}

async fn handle_answer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Result<Json<answer::AnswerResponse>, AppError> {
    require_api_key(&state, &headers)?;
    check_rate(&state, "default")?;
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let response = answer::answer(
        &state.ctx,
        &body.query,
        body.namespace.as_deref(),
        body.top_k.unwrap_or(6).clamp(1, 50),
    )
    .await?;
    Ok(Json(response))
}

// ---- graph exploration ----

#[derive(Deserialize)]
struct GraphParams {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    sample: Option<usize>,
    #[serde(default)]
    min_x: Option<f64>,
    #[serde(default)]
    min_y: Option<f64>,
    #[serde(default)]
    max_x: Option<f64>,
    #[serde(default)]
    max_y: Option<f64>,
}

#[derive(Serialize)]
struct GraphResponse {
    nodes: Vec<NodeView>,
    edges: Vec<EdgeView>,
    namespace: String,
    store: String,
}

async fn handle_graph(
    State(state): State<AppState>,
    Query(params): Query<GraphParams>,
) -> Result<Json<GraphResponse>, AppError> {
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let mode = match params.mode.as_deref() {
        None | Some("random") => SampleMode::Random,
        Some("viewport") => SampleMode::Viewport {
            min_x: params.min_x.unwrap_or(-1.0),
            min_y: params.min_y.unwrap_or(-1.0),
            max_x: params.max_x.unwrap_or(1.0),
            max_y: params.max_y.unwrap_or(1.0),
        },
        Some(other) => return Err(bad_request(format!("unknown graph mode: {}", other))),
    };
    let cap = params.sample.unwrap_or(200).clamp(1, 2000);
    let (nodes, edges) = state.ctx.store.sample_subgraph(&namespace, &mode, cap).await?;
    Ok(Json(GraphResponse {
        nodes: nodes.iter().map(NodeView::from).collect(),
        edges: edges.iter().map(EdgeView::from).collect(),
        namespace,
        store: state.ctx.store.store_tag().to_string(),
    }))
}

#[derive(Deserialize)]
struct NodesParams {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Serialize)]
struct NodesResponse {
    results: Vec<NodeView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

async fn handle_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodesParams>,
) -> Result<Json<NodesResponse>, AppError> {
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let (nodes, cursor) = state
        .ctx
        .store
        .iterate_nodes(&namespace, params.cursor.as_deref(), limit)
        .await?;
    Ok(Json(NodesResponse {
        results: nodes.iter().map(NodeView::from).collect(),
        cursor,
    }))
}

#[derive(Deserialize)]
struct EdgesParams {
    #[serde(default)]
    node_ids: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_edges(
    State(state): State<AppState>,
    Query(params): Query<EdgesParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ids: Vec<String> = params
        .node_ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
        .collect();
    if ids.is_empty() {
        return Err(bad_request("node_ids query parameter required"));
    }
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let edges = state.ctx.store.edges_for(&ids, None, limit).await?;
    Ok(Json(serde_json::json!({
        "results": edges.iter().map(EdgeView::from).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
struct NeighborsParams {
    #[serde(default)]
    depth: Option<u32>,
}

async fn handle_neighbors(
    State(state): State<AppState>,
    AxumPath(node_id): AxumPath<String>,
    Query(params): Query<NeighborsParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let depth = params.depth.unwrap_or(1).clamp(1, 2);
    let (nodes, edges) = state.ctx.store.neighbors(&node_id, depth).await?;
    Ok(Json(serde_json::json!({
        "nodes": nodes.iter().map(NodeView::from).collect::<Vec<_>>(),
        "edges": edges.iter().map(EdgeView::from).collect::<Vec<_>>(),
        "store": state.ctx.store.store_tag(),
    })))
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let limit = params.limit.unwrap_or(20).clamp(1, 200);
    let nodes = state
        .ctx
        .store
        .search_by_name(params.q.trim(), &namespace, limit)
        .await?;
    Ok(Json(serde_json::json!({
        "results": nodes.iter().map(NodeView::from).collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
struct NamespaceParams {
    #[serde(default)]
    namespace: Option<String>,
}

async fn handle_stats(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let stats = state.ctx.store.stats(&namespace).await?;
    Ok(Json(serde_json::json!({
        "namespace": namespace,
        "nodes": stats.node_count,
        "edges": stats.edge_count,
        "labels": stats.label_counts,
        "store": state.ctx.store.store_tag(),
    })))
}

async fn handle_namespaces(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let namespaces = state.ctx.store.list_namespaces().await?;
    Ok(Json(serde_json::json!({ "namespaces": namespaces })))
}

#[derive(Deserialize)]
struct PathBody {
    source_id: String,
    target_id: String,
    #[serde(default)]
    max_depth: Option<u32>,
}

async fn handle_path(
    State(state): State<AppState>,
    Json(body): Json<PathBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let max_depth = body.max_depth.unwrap_or(4).clamp(1, 10);
    let result = state
        .ctx
        .store
        .shortest_path(&body.source_id, &body.target_id, max_depth)
        .await?;
    match result {
        Some(path) => Ok(Json(serde_json::json!({
            "path": path.node_ids,
            "edges": path.edges.iter().map(EdgeView::from).collect::<Vec<_>>(),
        }))),
        None => Ok(Json(serde_json::json!({ "path": [], "edges": [] }))),
    }
}

#[derive(Deserialize)]
struct SimilarParams {
    node_id: String,
    #[serde(default)]
    top_k: Option<usize>,
}

async fn handle_similar_get(
    State(state): State<AppState>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    similar(&state, &params.node_id, params.top_k.unwrap_or(10)).await
}

async fn handle_similar_post(
    State(state): State<AppState>,
    Json(params): Json<SimilarParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    similar(&state, &params.node_id, params.top_k.unwrap_or(10)).await
}

/// Cosine similarity when embeddings exist, name-token overlap otherwise.
async fn similar(
    state: &AppState,
    node_id: &str,
    top_k: usize,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(anchor) = state.ctx.store.get_node(node_id).await? else {
        return Err(GraphLoomError::NotFound(format!("node '{}'", node_id)).into());
    };
    let (nodes, _) = state
        .ctx
        .store
        .export_graph(&anchor.namespace, state.ctx.config.retrieval.sample_cap * 4)
        .await?;

    let anchor_terms: Vec<String> = anchor
        .name
        .to_lowercase()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect();
    let mut scored: Vec<(String, f64)> = nodes
        .iter()
        .filter(|n| n.id != anchor.id)
        .map(|n| {
            let score = if !anchor.embedding.is_empty() && !n.embedding.is_empty() {
                crate::embedding::cosine_similarity(&anchor.embedding, &n.embedding) as f64
            } else {
                let name = n.name.to_lowercase();
                let hits = anchor_terms.iter().filter(|t| name.contains(t.as_str())).count();
                hits as f64 / anchor_terms.len().max(1) as f64
            };
            (n.id.clone(), score)
        })
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(top_k.clamp(1, 100));

    Ok(Json(serde_json::json!({
        "similar": scored
            .iter()
            .map(|(id, score)| serde_json::json!({"id": id, "score": score}))
            .collect::<Vec<_>>(),
    })))
}

// ---- analytics & orchestration ----

async fn handle_centrality(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<NamespaceBody>,
) -> Result<Json<analytics::CentralityReport>, AppError> {
    require_api_key(&state, &headers)?;
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let report = analytics::recompute_centrality(&state.ctx, &namespace).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct NamespaceBody {
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct LayoutBody {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

async fn handle_layout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LayoutBody>,
) -> Result<Json<analytics::LayoutReport>, AppError> {
    require_api_key(&state, &headers)?;
    let mode = match body.mode.as_deref() {
        None => LayoutMode::Hybrid,
        Some(raw) => LayoutMode::parse(raw)
            .ok_or_else(|| bad_request(format!("unknown layout mode: {}", raw)))?,
    };
    let namespace = state.ctx.namespace_or_default(body.namespace.as_deref());
    let report = analytics::recompute_layout(&state.ctx, &namespace, mode).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct ClusterParams {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    algorithm: Option<String>,
}

async fn handle_cluster(
    State(state): State<AppState>,
    Query(params): Query<ClusterParams>,
) -> Result<Json<cluster::ClusterReport>, AppError> {
    if let Some(algorithm) = params.algorithm.as_deref() {
        if algorithm != "louvain" {
            return Err(bad_request(format!(
                "unknown clustering algorithm: {}",
                algorithm
            )));
        }
    }
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let report = cluster::compute_clusters(&state.ctx, &namespace).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SummarizeBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    cluster_ids: Vec<String>,
}

async fn handle_summarize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SummarizeBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;
    check_rate(&state, "summarize")?;
    let namespace = state.ctx.namespace_or_default(body.namespace.as_deref());
    let summaries = cluster::summarize_clusters(&state.ctx, &namespace, &body.cluster_ids).await?;
    Ok(Json(serde_json::json!({ "summaries": summaries })))
}

async fn handle_summaries(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let summaries = cluster::list_summaries(&state.ctx, &namespace).await?;
    Ok(Json(serde_json::json!({ "summaries": summaries })))
}

#[derive(Deserialize)]
struct IndexRunBody {
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    force: bool,
}

async fn handle_index_run(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IndexRunBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;
    let namespace = state.ctx.namespace_or_default(body.namespace.as_deref());
    let run_id = format!("run-{}", utc_now_compact());
    let ctx = state.ctx.clone();
    let force = body.force;
    let spawned_id = run_id.clone();
    let spawned_ns = namespace.clone();
    tokio::spawn(async move {
        match orchestrator::run_index_with_id(&ctx, &spawned_ns, force, spawned_id).await {
            Ok(outcome) => info!(
                run_id = %outcome.run_id,
                status = outcome.status.as_str(),
                "index run finished"
            ),
            Err(e) => error!(error = %e, "index run failed"),
        }
    });
    Ok(Json(serde_json::json!({
        "run_id": run_id,
        "status": "RUNNING",
        "namespace": namespace,
    })))
}

async fn handle_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut metrics = state.ctx.metrics.to_json();
    metrics["store"] = serde_json::json!(state.ctx.store.store_tag());
    Json(metrics)
}

async fn handle_metrics_extended(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut metrics = state.ctx.metrics.to_json();
    metrics["store"] = serde_json::json!(state.ctx.store.store_tag());
    metrics["stream_subscribers"] = serde_json::json!(state.ctx.events.subscriber_count());
    let namespace = state.ctx.config.default_namespace.clone();
    let runs = orchestrator::list_runs(&state.ctx, &namespace, 5).await?;
    metrics["recent_runs"] = serde_json::to_value(&runs).unwrap_or_default();
    metrics["namespaces"] = serde_json::json!(state.ctx.store.list_namespaces().await?);
    Ok(Json(metrics))
}

// ---- snapshots & provenance ----

async fn handle_snapshots_list(
    State(state): State<AppState>,
    Query(params): Query<NamespaceParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let snapshots = snapshot::list_snapshots(&state.ctx, &namespace, 25).await?;
    let summaries: Vec<serde_json::Value> = snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "id": s.id,
                "created_at": s.created_at,
                "node_count": s.node_count,
                "edge_count": s.edge_count,
                "modularity": s.modularity,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "snapshots": summaries })))
}

async fn handle_snapshots_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(params): Json<NamespaceBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    require_api_key(&state, &headers)?;
    let namespace = state.ctx.namespace_or_default(params.namespace.as_deref());
    let record = snapshot::create_snapshot(&state.ctx, &namespace).await?;
    Ok(Json(serde_json::json!({
        "snapshot_id": record.id,
        "node_count": record.node_count,
        "edge_count": record.edge_count,
        "modularity": record.modularity,
    })))
}

#[derive(Deserialize)]
struct DiffParams {
    a: String,
    b: String,
}

async fn handle_snapshots_diff(
    State(state): State<AppState>,
    Query(params): Query<DiffParams>,
) -> Result<Json<crate::models::SnapshotDiff>, AppError> {
    let a = snapshot::get_snapshot(&state.ctx, &params.a).await?;
    let b = snapshot::get_snapshot(&state.ctx, &params.b).await?;
    Ok(Json(snapshot::diff_snapshots(&a, &b)))
}

#[derive(Deserialize)]
struct ProvenanceParams {
    node_id: String,
}

async fn handle_provenance(
    State(state): State<AppState>,
    Query(params): Query<ProvenanceParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (nodes, edges) = state.ctx.store.neighbors(&params.node_id, 1).await?;
    let chunks: Vec<NodeView> = nodes
        .iter()
        .filter(|n| n.prop_str("text").is_some())
        .map(NodeView::from)
        .collect();
    Ok(Json(serde_json::json!({
        "neighbors": {
            "nodes": nodes.iter().map(NodeView::from).collect::<Vec<_>>(),
            "edges": edges.iter().map(EdgeView::from).collect::<Vec<_>>(),
        },
        "chunks": chunks,
    })))
}

// ---- stream ----

/// Decrements the subscriber gauge when the SSE stream is dropped.
struct SubscriberGuard {
    ctx: Arc<GraphLoomContext>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.ctx.events.unsubscribe();
    }
}

async fn handle_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.ctx.events.subscribe();
    let guard = SubscriberGuard {
        ctx: state.ctx.clone(),
    };

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok(Event::default().event(event.kind()).data(json)),
                        Err(e) => error!(error = %e, "failed to serialize stream event"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Slow subscriber: oldest events were dropped.
                    let marker = serde_json::json!({ "skipped": skipped });
                    yield Ok(Event::default().event("dropped").data(marker.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    enabled: bool,
    store: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        enabled: state.ctx.config.enabled,
        store: state.ctx.store.store_tag().to_string(),
    })
}
