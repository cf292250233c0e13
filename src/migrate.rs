//! Database schema migrations.
//!
//! Creates all tables required by the engine and is safe to run repeatedly.
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `nodes` | Graph nodes: label, name, namespace, embedding BLOB, JSON properties |
//! | `edges` | Graph edges keyed by `(source_id, target_id, relation)` |
//! | `documents` | Raw document text, needed for delta re-indexing |
//! | `ingest_log` | Per-`(namespace, doc_id)` status driving delta selection |
//! | `snapshots` | Immutable identity-set captures |
//! | `cluster_members` | Community membership per node |
//! | `cluster_summaries` | Cached LLM cluster labels/summaries |
//! | `embedding_cache` | Persisted embedding vectors keyed by text hash + provider |
//! | `runs` | Orchestrator run records |
//!
//! `nodes` keeps SQLite's implicit `rowid`, which the cursor-based node
//! iterator orders by: rows inserted later always sort after existing ones,
//! so pagination is stable under concurrent inserts.

use sqlx::SqlitePool;

use crate::error::Result;

/// Run all migrations. Every statement is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            name TEXT NOT NULL,
            namespace TEXT NOT NULL,
            embedding BLOB,
            properties TEXT NOT NULL DEFAULT '{}',
            source_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.6,
            namespace TEXT NOT NULL,
            properties TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source_id, target_id, relation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            namespace TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            text TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL,
            PRIMARY KEY (namespace, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_log (
            namespace TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_indexed_at TEXT,
            status TEXT NOT NULL DEFAULT 'new',
            error TEXT,
            PRIMARY KEY (namespace, doc_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            created_at TEXT NOT NULL,
            node_count INTEGER NOT NULL,
            edge_count INTEGER NOT NULL,
            modularity REAL,
            node_ids TEXT NOT NULL DEFAULT '[]',
            edge_ids TEXT NOT NULL DEFAULT '[]',
            community_ids TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_members (
            node_id TEXT NOT NULL,
            cluster_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            algorithm TEXT NOT NULL DEFAULT 'louvain',
            PRIMARY KEY (node_id, namespace, algorithm)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_summaries (
            cluster_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            algorithm TEXT NOT NULL DEFAULT 'louvain',
            top_terms_hash TEXT NOT NULL,
            label TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (cluster_id, namespace, algorithm)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            hash TEXT NOT NULL,
            provider TEXT NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (hash, provider)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            stale_docs INTEGER NOT NULL DEFAULT 0,
            indexed_docs INTEGER NOT NULL DEFAULT 0,
            nodes_new INTEGER NOT NULL DEFAULT 0,
            edges_new INTEGER NOT NULL DEFAULT 0,
            percent_reused_nodes REAL,
            percent_reused_edges REAL,
            artifact_dir TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_namespace ON nodes(namespace)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_nodes_namespace_name ON nodes(namespace, name)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_namespace ON edges(namespace)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ingest_log_status ON ingest_log(namespace, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_cluster_members_ns ON cluster_members(namespace, cluster_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(count >= 9);
    }
}
