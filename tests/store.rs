//! Storage contract tests against the embedded backend: merge semantics,
//! cursor iteration, sampling, and integrity enforcement.

use std::sync::Arc;

use tempfile::TempDir;

use graphloom::config::{Config, DbConfig};
use graphloom::context::GraphLoomContext;
use graphloom::error::GraphLoomError;
use graphloom::models::{relation, Edge, Node, NodeLabel};
use graphloom::store::SampleMode;

async fn engine() -> (Arc<GraphLoomContext>, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        db: DbConfig {
            path: tmp.path().join("graph.sqlite"),
        },
        ..Config::default()
    };
    let ctx = GraphLoomContext::initialize(config).await.unwrap();
    (ctx, tmp)
}

fn entity(name: &str) -> Node {
    Node::new(
        graphloom::models::entity_node_id("public", name),
        NodeLabel::Entity,
        name,
        "public",
    )
}

#[tokio::test]
async fn node_merge_is_non_destructive() {
    let (ctx, _tmp) = engine().await;

    let mut first = entity("Rust");
    first.source_ids.push("d1".to_string());
    first.set_prop("origin", serde_json::json!("manual"));
    assert!(ctx.store.upsert_node(&first).await.unwrap().created);

    let mut second = entity("Rust");
    second.source_ids.push("d2".to_string());
    second.set_prop("origin", serde_json::json!("should-not-overwrite"));
    second.set_prop("fresh", serde_json::json!(true));
    second.embedding = vec![0.1, 0.2];
    assert!(!ctx.store.upsert_node(&second).await.unwrap().created);

    let merged = ctx.store.get_node("public:rust").await.unwrap().unwrap();
    // Existing values win; new keys are added; source ids union.
    assert_eq!(merged.prop_str("origin"), Some("manual"));
    assert_eq!(merged.properties.get("fresh"), Some(&serde_json::json!(true)));
    assert_eq!(merged.source_ids, vec!["d1", "d2"]);
    // Empty-before embedding is replaced by the non-empty incoming one.
    assert_eq!(merged.embedding, vec![0.1, 0.2]);

    // A non-empty embedding is not overwritten afterwards.
    let mut third = entity("Rust");
    third.embedding = vec![0.9, 0.9];
    ctx.store.upsert_node(&third).await.unwrap();
    let still = ctx.store.get_node("public:rust").await.unwrap().unwrap();
    assert_eq!(still.embedding, vec![0.1, 0.2]);
}

#[tokio::test]
async fn divergent_label_on_same_identity_is_fatal() {
    let (ctx, _tmp) = engine().await;
    ctx.store.upsert_node(&entity("Kafka")).await.unwrap();

    let mut conflicting = entity("Kafka");
    conflicting.label = NodeLabel::Organization;
    let result = ctx.store.upsert_node(&conflicting).await;
    assert!(matches!(result, Err(GraphLoomError::Fatal(_))));
}

#[tokio::test]
async fn edge_merge_keeps_max_confidence() {
    let (ctx, _tmp) = engine().await;
    ctx.store.upsert_node(&entity("A")).await.unwrap();
    ctx.store.upsert_node(&entity("B")).await.unwrap();

    let low = Edge::new("public:a", "public:b", relation::CO_OCCURS, 0.3, "public");
    let high = Edge::new("public:a", "public:b", relation::CO_OCCURS, 0.8, "public");
    let lower = Edge::new("public:a", "public:b", relation::CO_OCCURS, 0.5, "public");

    assert!(ctx.store.upsert_edge(&low).await.unwrap().created);
    assert!(!ctx.store.upsert_edge(&high).await.unwrap().created);
    assert!(!ctx.store.upsert_edge(&lower).await.unwrap().created);

    let edges = ctx
        .store
        .edges_for(&["public:a".to_string()], None, 10)
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].confidence, 0.8);
}

#[tokio::test]
async fn cursor_iteration_is_stable_under_inserts() {
    let (ctx, _tmp) = engine().await;
    for i in 0..5 {
        ctx.store
            .upsert_node(&entity(&format!("node{:02}", i)))
            .await
            .unwrap();
    }

    let (page1, cursor) = ctx.store.iterate_nodes("public", None, 3).await.unwrap();
    assert_eq!(page1.len(), 3);
    let cursor = cursor.expect("cursor for more pages");

    // A node inserted between pages must not appear in earlier positions.
    ctx.store.upsert_node(&entity("zz-late")).await.unwrap();

    let (page2, cursor2) = ctx
        .store
        .iterate_nodes("public", Some(&cursor), 10)
        .await
        .unwrap();
    let page1_ids: Vec<&str> = page1.iter().map(|n| n.id.as_str()).collect();
    for node in &page2 {
        assert!(!page1_ids.contains(&node.id.as_str()));
    }
    assert!(page2.iter().any(|n| n.id == "public:zz-late"));
    assert!(cursor2.is_none());
}

#[tokio::test]
async fn neighbors_depth_limits() {
    let (ctx, _tmp) = engine().await;
    for name in ["A", "B", "C", "D"] {
        ctx.store.upsert_node(&entity(name)).await.unwrap();
    }
    for (s, t) in [("a", "b"), ("b", "c"), ("c", "d")] {
        ctx.store
            .upsert_edge(&Edge::new(
                format!("public:{}", s),
                format!("public:{}", t),
                relation::ROLE_AT,
                0.6,
                "public",
            ))
            .await
            .unwrap();
    }

    let (nodes, _) = ctx.store.neighbors("public:a", 1).await.unwrap();
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert!(ids.contains(&"public:b"));
    assert!(!ids.contains(&"public:c"));

    let (nodes, _) = ctx.store.neighbors("public:a", 2).await.unwrap();
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert!(ids.contains(&"public:c"));
    assert!(!ids.contains(&"public:d"));
}

#[tokio::test]
async fn viewport_sampling_filters_on_layout() {
    let (ctx, _tmp) = engine().await;
    let mut inside = entity("Inside");
    inside.set_prop("layout", serde_json::json!({"x": 0.5, "y": 0.5}));
    let mut outside = entity("Outside");
    outside.set_prop("layout", serde_json::json!({"x": 5.0, "y": 5.0}));
    let unpositioned = entity("Unpositioned");
    for node in [&inside, &outside, &unpositioned] {
        ctx.store.upsert_node(node).await.unwrap();
    }

    let (nodes, _) = ctx
        .store
        .sample_subgraph(
            "public",
            &SampleMode::Viewport {
                min_x: 0.0,
                min_y: 0.0,
                max_x: 1.0,
                max_y: 1.0,
            },
            10,
        )
        .await
        .unwrap();
    let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["public:inside"]);
}

#[tokio::test]
async fn bulk_upsert_counts_created_and_merged() {
    let (ctx, _tmp) = engine().await;
    let nodes: Vec<Node> = ["X", "Y", "Z"].iter().map(|n| entity(n)).collect();
    let stats = ctx.store.bulk_upsert(&nodes, &[]).await.unwrap();
    assert_eq!(stats.nodes_created, 3);
    assert_eq!(stats.nodes_merged, 0);

    let again = ctx.store.bulk_upsert(&nodes, &[]).await.unwrap();
    assert_eq!(again.nodes_created, 0);
    assert_eq!(again.nodes_merged, 3);
}

#[tokio::test]
async fn search_by_name_is_prefix_and_namespaced() {
    let (ctx, _tmp) = engine().await;
    ctx.store.upsert_node(&entity("Kafka")).await.unwrap();
    ctx.store.upsert_node(&entity("Kabuki")).await.unwrap();
    let mut other = entity("Kafka");
    other.id = "other:kafka".to_string();
    other.namespace = "other".to_string();
    ctx.store.upsert_node(&other).await.unwrap();

    let hits = ctx.store.search_by_name("ka", "public", 10).await.unwrap();
    assert_eq!(hits.len(), 2);
    let hits = ctx.store.search_by_name("kaf", "public", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].namespace, "public");
}
