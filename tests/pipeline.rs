//! End-to-end pipeline tests over a temporary SQLite database: ingest,
//! retrieval, provenance, and the degraded extraction modes.

use std::sync::Arc;

use tempfile::TempDir;

use graphloom::config::{Config, DbConfig};
use graphloom::context::GraphLoomContext;
use graphloom::ingest::{ingest_document, IngestRequest};
use graphloom::models::{IngestStatus, NodeLabel};
use graphloom::retrieval::{query, CancelToken, QueryFilters, QueryMode, QueryRequest};

async fn engine() -> (Arc<GraphLoomContext>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config {
        db: DbConfig {
            path: tmp.path().join("graph.sqlite"),
        },
        ..Config::default()
    };
    config.index.output_root = tmp.path().join("output");
    let ctx = GraphLoomContext::initialize(config).await.unwrap();
    (ctx, tmp)
}

fn doc(doc_id: &str, text: &str) -> IngestRequest {
    IngestRequest {
        doc_id: doc_id.to_string(),
        text: text.to_string(),
        namespace: None,
        metadata: None,
        force_heuristic: true,
        disable_embeddings: true,
    }
}

fn retrieval_request(q: &str, mode: QueryMode, top_k: usize) -> QueryRequest {
    QueryRequest {
        query: q.to_string(),
        namespace: None,
        mode,
        top_k,
        filters: QueryFilters::default(),
    }
}

#[tokio::test]
async fn ingest_and_query_happy_path() {
    let (ctx, _tmp) = engine().await;
    let outcome = ingest_document(
        &ctx,
        doc("d1", "OpenAI collaborates with Microsoft and Google on AI safety."),
    )
    .await
    .unwrap();
    assert_eq!(outcome.status, "indexed");
    assert_eq!(outcome.chunks, 1);

    // Three entity-kind nodes with pairwise CO_OCCURS and MENTIONED_IN
    // into the single chunk.
    let mut co_occurs = 0;
    for name in ["openai", "microsoft", "google"] {
        let id = format!("public:{}", name);
        let node = ctx.store.get_node(&id).await.unwrap().unwrap();
        assert!(node.label.is_entity_kind());
        let (_, edges) = ctx.store.neighbors(&id, 1).await.unwrap();
        assert!(edges
            .iter()
            .any(|e| e.relation == "MENTIONED_IN" && e.target_id == "public:d1:0"));
        co_occurs += edges.iter().filter(|e| e.relation == "CO_OCCURS").count();
    }
    // Each pair counted from both endpoints.
    assert!(co_occurs >= 6, "expected pairwise co-occurrence, saw {}", co_occurs);

    let response = query(
        &ctx,
        &retrieval_request("OpenAI", QueryMode::Local, 5),
        &CancelToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(response.nodes[0].id, "public:openai");
}

#[tokio::test]
async fn llm_outage_degrades_to_heuristic_fallback() {
    let (ctx, _tmp) = engine().await;
    // Request the LLM path with no LLM configured: extraction degrades,
    // nothing errors.
    let mut request = doc("d1", "Kafka connects services at Initech.");
    request.force_heuristic = false;
    let outcome = ingest_document(&ctx, request).await.unwrap();
    assert_eq!(outcome.status, "indexed");
    assert_eq!(outcome.extraction_mode, "heuristic_fallback");
    assert!(ctx.store.get_node("public:kafka").await.unwrap().is_some());
}

#[tokio::test]
async fn path_query_role_at_then_uses_tech() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "Alice works at Acme. Acme uses Kafka."))
        .await
        .unwrap();

    let path = ctx
        .store
        .shortest_path("public:alice", "public:kafka", 3)
        .await
        .unwrap()
        .expect("path should exist");
    assert_eq!(
        path.node_ids,
        vec!["public:alice", "public:acme", "public:kafka"]
    );
    assert_eq!(path.edges.len(), 2);
    let relations: Vec<&str> = path.edges.iter().map(|e| e.relation.as_str()).collect();
    assert!(relations.contains(&"ROLE_AT"));
    assert!(relations.contains(&"USES_TECH"));
}

#[tokio::test]
async fn reingest_identical_noop_preserves_graph_state() {
    let (ctx, _tmp) = engine().await;
    let text = "# Profile\n\nBob works at Initech. Initech uses Postgres.";
    ingest_document(&ctx, doc("d1", text)).await.unwrap();

    let (mut nodes_before, mut edges_before) =
        ctx.store.export_graph("public", 10_000).await.unwrap();
    let second = ingest_document(&ctx, doc("d1", text)).await.unwrap();
    assert_eq!(second.status, "noop");

    let (mut nodes_after, mut edges_after) =
        ctx.store.export_graph("public", 10_000).await.unwrap();
    nodes_before.sort_by(|a, b| a.id.cmp(&b.id));
    nodes_after.sort_by(|a, b| a.id.cmp(&b.id));
    edges_before.sort_by(|a, b| a.id.cmp(&b.id));
    edges_after.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(
        nodes_before.iter().map(|n| &n.id).collect::<Vec<_>>(),
        nodes_after.iter().map(|n| &n.id).collect::<Vec<_>>()
    );
    assert_eq!(
        edges_before.iter().map(|e| &e.id).collect::<Vec<_>>(),
        edges_after.iter().map(|e| &e.id).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn no_duplicate_identities_across_documents() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "Kafka is used by the data team."))
        .await
        .unwrap();
    ingest_document(&ctx, doc("d2", "Kafka also powers the event bus."))
        .await
        .unwrap();

    let (nodes, _) = ctx.store.export_graph("public", 10_000).await.unwrap();
    let kafka_nodes: Vec<_> = nodes
        .iter()
        .filter(|n| n.label == NodeLabel::Technology && n.name.to_lowercase() == "kafka")
        .collect();
    assert_eq!(kafka_nodes.len(), 1);
    // Both documents contributed provenance.
    assert!(kafka_nodes[0].source_ids.contains(&"d1".to_string()));
    assert!(kafka_nodes[0].source_ids.contains(&"d2".to_string()));
}

#[tokio::test]
async fn namespaces_do_not_leak_through_traversal() {
    let (ctx, _tmp) = engine().await;
    let mut a = doc("d1", "Kafka runs at Acme Corp.");
    a.namespace = Some("alpha".to_string());
    ingest_document(&ctx, a).await.unwrap();
    let mut b = doc("d1", "Kafka runs at Beta Labs.");
    b.namespace = Some("beta".to_string());
    ingest_document(&ctx, b).await.unwrap();

    let (nodes, edges) = ctx.store.neighbors("alpha:kafka", 2).await.unwrap();
    assert!(nodes.iter().all(|n| n.namespace == "alpha"));
    assert!(edges.iter().all(|e| e.namespace == "alpha"));
    assert!(ctx
        .store
        .shortest_path("alpha:kafka", "beta:kafka", 10)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn deterministic_modes_yield_identical_graphs() {
    let text = "# Experience\n\nDana Reyes is a Staff Engineer at Vertex Systems.\n\
                Vertex Systems uses Kubernetes and Postgres.\n\n# Awards\n\nDana launched Orion Platform.";
    let (ctx_a, _ta) = engine().await;
    let (ctx_b, _tb) = engine().await;
    ingest_document(&ctx_a, doc("cv", text)).await.unwrap();
    ingest_document(&ctx_b, doc("cv", text)).await.unwrap();

    let (mut na, mut ea) = ctx_a.store.export_graph("public", 10_000).await.unwrap();
    let (mut nb, mut eb) = ctx_b.store.export_graph("public", 10_000).await.unwrap();
    na.sort_by(|x, y| x.id.cmp(&y.id));
    nb.sort_by(|x, y| x.id.cmp(&y.id));
    ea.sort_by(|x, y| x.id.cmp(&y.id));
    eb.sort_by(|x, y| x.id.cmp(&y.id));

    assert_eq!(
        na.iter().map(|n| (&n.id, n.label)).collect::<Vec<_>>(),
        nb.iter().map(|n| (&n.id, n.label)).collect::<Vec<_>>()
    );
    assert_eq!(
        ea.iter()
            .map(|e| (&e.id, &e.relation, e.confidence))
            .collect::<Vec<_>>(),
        eb.iter()
            .map(|e| (&e.id, &e.relation, e.confidence))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn ingest_log_transitions() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "First version mentions Kafka."))
        .await
        .unwrap();
    let record = graphloom::ingest::get_ingest_record(&ctx.pool, "public", "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IngestStatus::Indexed);
    assert!(record.last_indexed_at.is_some());

    ingest_document(&ctx, doc("d1", "Second version mentions Postgres."))
        .await
        .unwrap();
    let record = graphloom::ingest::get_ingest_record(&ctx.pool, "public", "d1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, IngestStatus::Stale);
}
