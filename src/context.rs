//! Shared engine context.
//!
//! Process-wide resources (storage adapter, embedding cache, event bus,
//! metrics) have explicit init here and are passed by reference everywhere
//! else — pure functions never reach for globals.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::embedding::Embedder;
use crate::error::{GraphLoomError, Result};
use crate::events::EventBus;
use crate::extract::Extractor;
use crate::llm::LlmClient;
use crate::migrate;
use crate::store::{Neo4jStore, SqliteStore, StorageAdapter};

/// Counters and gauges served by `GET /metrics`.
#[derive(Default)]
pub struct Metrics {
    pub ingest_count: AtomicU64,
    pub nodes_created: AtomicU64,
    pub edges_created: AtomicU64,
    pub retrieval_requests: AtomicU64,
    pub answer_requests: AtomicU64,
    pub snapshots_created: AtomicU64,
    pub index_runs_total: AtomicU64,
    latency: Mutex<HashMap<&'static str, (f64, u64)>>,
    namespace_docs: Mutex<HashMap<String, u64>>,
    mode_counts: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn record_latency(&self, key: &'static str, seconds: f64) {
        let mut latency = self.latency.lock().unwrap();
        let entry = latency.entry(key).or_insert((0.0, 0));
        entry.0 += seconds;
        entry.1 += 1;
    }

    pub fn record_namespace_doc(&self, namespace: &str) {
        let mut docs = self.namespace_docs.lock().unwrap();
        *docs.entry(namespace.to_string()).or_insert(0) += 1;
    }

    pub fn record_mode(&self, mode: &str) {
        let mut modes = self.mode_counts.lock().unwrap();
        *modes.entry(mode.to_string()).or_insert(0) += 1;
    }

    pub fn to_json(&self) -> serde_json::Value {
        let latency = self.latency.lock().unwrap();
        let latencies: serde_json::Map<String, serde_json::Value> = latency
            .iter()
            .map(|(k, (sum, count))| {
                (
                    k.to_string(),
                    serde_json::json!({
                        "sum_s": sum,
                        "count": count,
                        "avg_s": if *count > 0 { sum / *count as f64 } else { 0.0 },
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "ingest_count": self.ingest_count.load(Ordering::Relaxed),
            "nodes_created": self.nodes_created.load(Ordering::Relaxed),
            "edges_created": self.edges_created.load(Ordering::Relaxed),
            "retrieval_requests": self.retrieval_requests.load(Ordering::Relaxed),
            "answer_requests": self.answer_requests.load(Ordering::Relaxed),
            "snapshots_created": self.snapshots_created.load(Ordering::Relaxed),
            "index_runs_total": self.index_runs_total.load(Ordering::Relaxed),
            "latency": latencies,
            "namespace_docs": self.namespace_docs.lock().unwrap().clone(),
            "query_modes": self.mode_counts.lock().unwrap().clone(),
        })
    }
}

/// RAII guard marking an analytics job active for a namespace. One job per
/// namespace at a time; concurrent attempts observe `LOCKED`.
pub struct AnalyticsGuard {
    inflight: Arc<Mutex<HashSet<String>>>,
    namespace: String,
}

impl Drop for AnalyticsGuard {
    fn drop(&mut self) {
        self.inflight.lock().unwrap().remove(&self.namespace);
    }
}

pub struct GraphLoomContext {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: StorageAdapter,
    pub embedder: Embedder,
    pub extractor: Extractor,
    pub llm: Option<Arc<LlmClient>>,
    pub events: EventBus,
    pub metrics: Metrics,
    analytics_inflight: Arc<Mutex<HashSet<String>>>,
    /// Cluster-summary token ledger keyed by namespace; the date field
    /// implements the UTC-midnight budget reset.
    summary_budget: Mutex<HashMap<String, (String, u32)>>,
    summary_window: Mutex<HashMap<String, Vec<Instant>>>,
    /// Node count at the last analytics run, for the growth trigger.
    analytics_baseline: Mutex<HashMap<String, u64>>,
}

impl GraphLoomContext {
    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let sqlite = Arc::new(SqliteStore::new(pool.clone()));
        let graph = if config.graph.store == "neo4j" {
            Some(Arc::new(Neo4jStore::from_config(&config.graph)?))
        } else {
            None
        };
        let store = StorageAdapter::new(sqlite, graph);

        let embedder = Embedder::new(config.embedding.clone(), pool.clone());
        let llm = LlmClient::from_config(&config.llm).map(Arc::new);
        let extractor = Extractor::new(llm.clone());

        Ok(Arc::new(Self {
            config,
            pool,
            store,
            embedder,
            extractor,
            llm,
            events: EventBus::default(),
            metrics: Metrics::default(),
            analytics_inflight: Arc::new(Mutex::new(HashSet::new())),
            summary_budget: Mutex::new(HashMap::new()),
            summary_window: Mutex::new(HashMap::new()),
            analytics_baseline: Mutex::new(HashMap::new()),
        }))
    }

    pub fn namespace_or_default(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
            _ => self.config.default_namespace.clone(),
        }
    }

    /// Claim the per-namespace analytics slot, or fail with `LOCKED`.
    pub fn analytics_guard(&self, namespace: &str) -> Result<AnalyticsGuard> {
        let mut inflight = self.analytics_inflight.lock().unwrap();
        if !inflight.insert(namespace.to_string()) {
            return Err(GraphLoomError::Conflict(format!(
                "LOCKED: analytics already running for namespace '{}'",
                namespace
            )));
        }
        Ok(AnalyticsGuard {
            inflight: self.analytics_inflight.clone(),
            namespace: namespace.to_string(),
        })
    }

    /// Try to reserve `tokens` from the namespace's daily summary budget.
    /// The ledger resets when the UTC date changes.
    pub fn summary_budget_take(&self, namespace: &str, tokens: u32) -> bool {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let budget = self.config.cluster.summary_daily_token_budget;
        let mut ledger = self.summary_budget.lock().unwrap();
        let entry = ledger
            .entry(namespace.to_string())
            .or_insert_with(|| (today.clone(), 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        if entry.1 + tokens > budget {
            return false;
        }
        entry.1 += tokens;
        true
    }

    /// Sliding 60-second rate window for cluster summarization.
    pub fn summary_rate_ok(&self, namespace: &str) -> bool {
        let limit = self.config.cluster.summary_rate_per_min;
        let mut windows = self.summary_window.lock().unwrap();
        let calls = windows.entry(namespace.to_string()).or_default();
        let now = Instant::now();
        calls.retain(|t| now.duration_since(*t).as_secs() < 60);
        if calls.len() >= limit {
            return false;
        }
        calls.push(now);
        true
    }

    /// Whether the namespace grew enough since the last analytics run to
    /// justify an automatic recompute.
    pub fn analytics_growth_due(&self, namespace: &str, current_nodes: u64) -> bool {
        let ratio = self.config.cluster.recompute_growth_ratio;
        let baseline = self.analytics_baseline.lock().unwrap();
        match baseline.get(namespace) {
            None => current_nodes > 0,
            Some(&prev) if prev == 0 => current_nodes > 0,
            Some(&prev) => {
                current_nodes > prev
                    && (current_nodes - prev) as f64 / prev as f64 >= ratio
            }
        }
    }

    pub fn analytics_mark_run(&self, namespace: &str, node_count: u64) {
        self.analytics_baseline
            .lock()
            .unwrap()
            .insert(namespace.to_string(), node_count);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::DbConfig;

    pub(crate) async fn test_context() -> Arc<GraphLoomContext> {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db: DbConfig {
                path: dir.path().join("test.sqlite"),
            },
            ..Config::default()
        };
        // Leak the tempdir so the database outlives this helper.
        std::mem::forget(dir);
        GraphLoomContext::initialize(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_namespace_default() {
        let ctx = test_context().await;
        assert_eq!(ctx.namespace_or_default(None), "public");
        assert_eq!(ctx.namespace_or_default(Some("team")), "team");
        assert_eq!(ctx.namespace_or_default(Some("  ")), "public");
        assert_eq!(ctx.store.store_tag(), "sqlite");
    }

    #[tokio::test]
    async fn test_analytics_guard_is_exclusive() {
        let ctx = test_context().await;
        let guard = ctx.analytics_guard("public").unwrap();
        assert!(ctx.analytics_guard("public").is_err());
        assert!(ctx.analytics_guard("other").is_ok());
        drop(guard);
        assert!(ctx.analytics_guard("public").is_ok());
    }

    #[tokio::test]
    async fn test_summary_budget_depletes() {
        let ctx = test_context().await;
        let budget = ctx.config.cluster.summary_daily_token_budget;
        assert!(ctx.summary_budget_take("public", budget));
        assert!(!ctx.summary_budget_take("public", 1));
        // Other namespaces have their own ledger.
        assert!(ctx.summary_budget_take("other", 1));
    }

    #[tokio::test]
    async fn test_growth_trigger() {
        let ctx = test_context().await;
        assert!(ctx.analytics_growth_due("public", 10));
        ctx.analytics_mark_run("public", 100);
        assert!(!ctx.analytics_growth_due("public", 105));
        assert!(ctx.analytics_growth_due("public", 110));
    }
}
