//! Point-in-time snapshots and structural diffs.
//!
//! A snapshot captures the node/edge identity sets, aggregate counts, the
//! current community ids, and the last computed modularity. Diffing is a
//! pure function over two stored snapshots; nothing is mutated, and
//! `diff(A, B)` mirrors `diff(B, A)` with swapped added/removed sets and
//! negated deltas.

use std::collections::HashSet;

use sqlx::Row;
use uuid::Uuid;

use crate::cluster;
use crate::context::GraphLoomContext;
use crate::error::{GraphLoomError, Result};
use crate::models::{utc_now_iso, SnapshotDiff, SnapshotRecord};

pub async fn create_snapshot(
    ctx: &GraphLoomContext,
    namespace: &str,
) -> Result<SnapshotRecord> {
    let (nodes, edges) = ctx.store.export_graph(namespace, usize::MAX).await?;
    let mut node_ids: Vec<String> = nodes.into_iter().map(|n| n.id).collect();
    let mut edge_ids: Vec<String> = edges.into_iter().map(|e| e.id).collect();
    node_ids.sort();
    edge_ids.sort();
    let community_ids = cluster::current_community_ids(ctx, namespace).await?;

    // Modularity, when a clustering pass has been persisted for this
    // namespace, rides along as an aggregate metric.
    let modularity = if community_ids.is_empty() {
        None
    } else {
        let (nodes, edges) = ctx.store.export_graph(namespace, usize::MAX).await?;
        let (_, q) = cluster::detect_communities(&nodes, &edges);
        Some(q)
    };

    let record = SnapshotRecord {
        id: Uuid::new_v4().to_string(),
        namespace: namespace.to_string(),
        created_at: utc_now_iso(),
        node_count: node_ids.len() as u64,
        edge_count: edge_ids.len() as u64,
        modularity,
        node_ids,
        edge_ids,
        community_ids,
    };

    sqlx::query(
        r#"
        INSERT INTO snapshots (id, namespace, created_at, node_count, edge_count, modularity, node_ids, edge_ids, community_ids)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.namespace)
    .bind(&record.created_at)
    .bind(record.node_count as i64)
    .bind(record.edge_count as i64)
    .bind(record.modularity)
    .bind(serde_json::to_string(&record.node_ids)?)
    .bind(serde_json::to_string(&record.edge_ids)?)
    .bind(serde_json::to_string(&record.community_ids)?)
    .execute(ctx.store.embedded().pool())
    .await?;

    ctx.metrics
        .snapshots_created
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Ok(record)
}

pub async fn get_snapshot(ctx: &GraphLoomContext, id: &str) -> Result<SnapshotRecord> {
    let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?")
        .bind(id)
        .fetch_optional(ctx.store.embedded().pool())
        .await?
        .ok_or_else(|| GraphLoomError::NotFound(format!("snapshot '{}'", id)))?;
    Ok(record_from_row(&row))
}

pub async fn list_snapshots(
    ctx: &GraphLoomContext,
    namespace: &str,
    limit: i64,
) -> Result<Vec<SnapshotRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM snapshots WHERE namespace = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(namespace)
    .bind(limit)
    .fetch_all(ctx.store.embedded().pool())
    .await?;
    Ok(rows.iter().map(record_from_row).collect())
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> SnapshotRecord {
    let node_ids: String = row.get("node_ids");
    let edge_ids: String = row.get("edge_ids");
    let community_ids: String = row.get("community_ids");
    let node_count: i64 = row.get("node_count");
    let edge_count: i64 = row.get("edge_count");
    SnapshotRecord {
        id: row.get("id"),
        namespace: row.get("namespace"),
        created_at: row.get("created_at"),
        node_count: node_count as u64,
        edge_count: edge_count as u64,
        modularity: row.get("modularity"),
        node_ids: serde_json::from_str(&node_ids).unwrap_or_default(),
        edge_ids: serde_json::from_str(&edge_ids).unwrap_or_default(),
        community_ids: serde_json::from_str(&community_ids).unwrap_or_default(),
    }
}

/// Pure structural diff between two snapshots.
pub fn diff_snapshots(a: &SnapshotRecord, b: &SnapshotRecord) -> SnapshotDiff {
    fn set_diff(from: &[String], to: &[String]) -> (Vec<String>, Vec<String>) {
        let from_set: HashSet<&str> = from.iter().map(|s| s.as_str()).collect();
        let to_set: HashSet<&str> = to.iter().map(|s| s.as_str()).collect();
        let mut added: Vec<String> = to
            .iter()
            .filter(|id| !from_set.contains(id.as_str()))
            .cloned()
            .collect();
        let mut removed: Vec<String> = from
            .iter()
            .filter(|id| !to_set.contains(id.as_str()))
            .cloned()
            .collect();
        added.sort();
        removed.sort();
        (added, removed)
    }

    let (added_nodes, removed_nodes) = set_diff(&a.node_ids, &b.node_ids);
    let (added_edges, removed_edges) = set_diff(&a.edge_ids, &b.edge_ids);
    let (added_communities, removed_communities) = set_diff(&a.community_ids, &b.community_ids);

    SnapshotDiff {
        a: a.id.clone(),
        b: b.id.clone(),
        added_nodes,
        removed_nodes,
        added_edges,
        removed_edges,
        added_communities,
        removed_communities,
        delta_nodes: b.node_count as i64 - a.node_count as i64,
        delta_edges: b.edge_count as i64 - a.edge_count as i64,
        delta_modularity: b.modularity.unwrap_or(0.0) - a.modularity.unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, nodes: &[&str], edges: &[&str], communities: &[&str]) -> SnapshotRecord {
        SnapshotRecord {
            id: id.to_string(),
            namespace: "public".to_string(),
            created_at: utc_now_iso(),
            node_count: nodes.len() as u64,
            edge_count: edges.len() as u64,
            modularity: Some(0.4),
            node_ids: nodes.iter().map(|s| s.to_string()).collect(),
            edge_ids: edges.iter().map(|s| s.to_string()).collect(),
            community_ids: communities.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_diff_reports_added_and_removed() {
        let a = record("a", &["n1", "n2"], &["e1"], &["c1"]);
        let b = record("b", &["n2", "n3", "n4"], &["e1", "e2"], &["c1", "c2"]);
        let diff = diff_snapshots(&a, &b);
        assert_eq!(diff.added_nodes, vec!["n3", "n4"]);
        assert_eq!(diff.removed_nodes, vec!["n1"]);
        assert_eq!(diff.added_edges, vec!["e2"]);
        assert!(diff.removed_edges.is_empty());
        assert_eq!(diff.added_communities, vec!["c2"]);
        assert_eq!(diff.delta_nodes, 1);
        assert_eq!(diff.delta_edges, 1);
    }

    #[test]
    fn test_diff_symmetry() {
        let a = record("a", &["n1", "n2"], &["e1"], &["c1"]);
        let b = record("b", &["n2", "n3"], &["e2"], &["c2"]);
        let ab = diff_snapshots(&a, &b);
        let ba = diff_snapshots(&b, &a);
        assert_eq!(ab.added_nodes, ba.removed_nodes);
        assert_eq!(ab.removed_nodes, ba.added_nodes);
        assert_eq!(ab.added_edges, ba.removed_edges);
        assert_eq!(ab.delta_nodes, -ba.delta_nodes);
        assert_eq!(ab.delta_edges, -ba.delta_edges);
        assert_eq!(ab.delta_modularity, -ba.delta_modularity);
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let a = record("a", &["n1"], &["e1"], &["c1"]);
        let b = record("b", &["n1"], &["e1"], &["c1"]);
        let diff = diff_snapshots(&a, &b);
        assert!(diff.added_nodes.is_empty());
        assert!(diff.removed_nodes.is_empty());
        assert_eq!(diff.delta_nodes, 0);
    }

    #[tokio::test]
    async fn test_create_and_list_snapshots() {
        use crate::context::tests::test_context;
        use crate::ingest::{ingest_document, IngestRequest};

        let ctx = test_context().await;
        ingest_document(
            &ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "Alice works at Acme.".to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();

        let snap = create_snapshot(&ctx, "public").await.unwrap();
        assert!(snap.node_count > 0);
        assert_eq!(snap.node_ids.len() as u64, snap.node_count);

        let listed = list_snapshots(&ctx, "public", 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, snap.id);

        let fetched = get_snapshot(&ctx, &snap.id).await.unwrap();
        assert_eq!(fetched.node_ids, snap.node_ids);
        assert!(matches!(
            get_snapshot(&ctx, "missing").await,
            Err(GraphLoomError::NotFound(_))
        ));
    }
}
