//! Orchestrator behavior over a temporary output root: delta selection,
//! NOOP short-circuit, lock contention, markers, and artifact import.

use std::sync::Arc;

use tempfile::TempDir;

use graphloom::config::{Config, DbConfig};
use graphloom::context::GraphLoomContext;
use graphloom::ingest::{ingest_document, IngestRequest};
use graphloom::models::RunStatus;
use graphloom::orchestrator::{run_index, LOCK_FILE};
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

#[tokio::test]
async fn noop_when_nothing_is_stale() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "Kafka powers the pipeline."))
        .await
        .unwrap();

    let outcome = run_index(&ctx, "public", false).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Noop);
    assert_eq!(outcome.stale_docs, 0);
    assert!(outcome.artifact_dir.is_none());
    // No run directory is materialized for a NOOP.
    assert!(!ctx.config.index.output_root.join("public").exists());
}

#[tokio::test]
async fn delta_run_processes_stale_doc_and_reuses_nodes() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "Alice works at Acme. Acme uses Kafka."))
        .await
        .unwrap();
    // Changed content re-indexes inline and leaves the log stale.
    ingest_document(
        &ctx,
        doc("d1", "Alice works at Acme. Acme uses Kafka and Postgres."),
    )
    .await
    .unwrap();

    let outcome = run_index(&ctx, "public", false).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.stale_docs, 1);
    assert_eq!(outcome.indexed_docs, 1);
    let reused = outcome
        .percent_reused_nodes
        .expect("reuse metric should be present");
    assert!(reused >= 0.5, "percent_reused_nodes {}", reused);

    let run_dir = std::path::PathBuf::from(outcome.artifact_dir.unwrap());
    assert!(run_dir.join("_SUCCESS").exists());
    assert!(!run_dir.join("_RUNNING").exists());
    assert!(run_dir.join("entities.csv").exists());
    assert!(run_dir.join("relationships.csv").exists());
    assert!(run_dir.join("communities.csv").exists());

    // The latest link points at the finished run.
    let latest = ctx.config.index.output_root.join("public").join("latest");
    assert!(latest.exists());

    // Everything processed: the next run is a NOOP.
    let second = run_index(&ctx, "public", false).await.unwrap();
    assert_eq!(second.status, RunStatus::Noop);
}

#[tokio::test]
async fn lock_contention_returns_locked() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "First.")).await.unwrap();
    ingest_document(&ctx, doc("d1", "Second, changed.")).await.unwrap();

    // Simulate a concurrent run holding the lock.
    std::fs::create_dir_all(&ctx.config.index.output_root).unwrap();
    let lock_path = ctx.config.index.output_root.join(LOCK_FILE);
    std::fs::write(&lock_path, "held").unwrap();

    let outcome = run_index(&ctx, "public", false).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Locked);
    // The baseline is untouched: the doc is still pending.
    let pending = graphloom::ingest::list_pending(&ctx.pool, "public")
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    // A forced run proceeds past the lock.
    let forced = run_index(&ctx, "public", true).await.unwrap();
    assert_eq!(forced.status, RunStatus::Success);
    std::fs::remove_file(&lock_path).ok();
}

#[tokio::test]
async fn legacy_registration_is_indexed_by_the_orchestrator() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config {
        db: DbConfig {
            path: tmp.path().join("graph.sqlite"),
        },
        ..Config::default()
    };
    config.index.output_root = tmp.path().join("output");
    config.ingest.default_mode = "legacy".to_string();
    let ctx = GraphLoomContext::initialize(config).await.unwrap();

    let outcome = ingest_document(&ctx, doc("d1", "Alice works at Acme."))
        .await
        .unwrap();
    assert_eq!(outcome.status, "registered");
    assert_eq!(outcome.nodes_created, 0);
    // Nothing in the graph yet.
    assert!(ctx.store.get_node("public:acme").await.unwrap().is_none());

    let run = run_index(&ctx, "public", false).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.indexed_docs, 1);
    assert!(ctx.store.get_node("public:acme").await.unwrap().is_some());
}

#[tokio::test]
async fn structured_mode_reads_latest_artifacts() {
    let (ctx, _tmp) = engine().await;
    ingest_document(&ctx, doc("d1", "Alice works at Acme. Acme uses Kafka."))
        .await
        .unwrap();
    ingest_document(&ctx, doc("d1", "Alice works at Acme. Acme uses Kafka daily."))
        .await
        .unwrap();
    run_index(&ctx, "public", false).await.unwrap();

    let response = query(
        &ctx,
        &QueryRequest {
            query: "Kafka".to_string(),
            namespace: None,
            mode: QueryMode::Structured,
            top_k: 5,
            filters: QueryFilters::default(),
        },
        &CancelToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(response.mode_used, "structured");
    assert!(response.nodes.iter().any(|n| n.id == "public:kafka"));
}

#[tokio::test]
async fn run_records_are_persisted() {
    let (ctx, _tmp) = engine().await;
    run_index(&ctx, "public", false).await.unwrap();
    let runs = graphloom::orchestrator::list_runs(&ctx, "public", 10)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Noop);
    assert!(runs[0].started_at.ends_with('Z'));
}
