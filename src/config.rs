use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::DEFAULT_NAMESPACE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Master on/off switch for the GraphRAG engine.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphBackendConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_namespace: default_namespace(),
            db: DbConfig::default(),
            graph: GraphBackendConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            ingest: IngestConfig::default(),
            index: IndexConfig::default(),
            cluster: ClusterConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/graphloom.sqlite"),
        }
    }
}

/// Which backend serves graph reads and writes. The embedded SQLite store
/// is always present; when `store = "neo4j"` it doubles as the transparent
/// fallback for an unreachable graph database.
#[derive(Debug, Deserialize, Clone)]
pub struct GraphBackendConfig {
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default)]
    pub neo4j_uri: Option<String>,
    #[serde(default)]
    pub neo4j_user: Option<String>,
    #[serde(default)]
    pub neo4j_password: Option<String>,
    #[serde(default = "default_neo4j_database")]
    pub neo4j_database: String,
    /// Per-request storage timeout.
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
}

impl Default for GraphBackendConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            neo4j_uri: None,
            neo4j_user: None,
            neo4j_password: None,
            neo4j_database: default_neo4j_database(),
            timeout_secs: default_storage_timeout(),
        }
    }
}

fn default_store() -> String {
    "sqlite".to_string()
}
fn default_neo4j_database() -> String {
    "neo4j".to_string()
}
fn default_storage_timeout() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Base URL of an OpenAI-compatible chat completion API.
    #[serde(default)]
    pub url: Option<String>,
    /// Falls back to the `LLM_PROVIDER_KEY` environment variable.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("LLM_PROVIDER_KEY").ok())
    }
}

fn default_llm_timeout() -> u64 {
    30
}

/// Structural rerank weights for one retrieval mode:
/// `score = similarity·sim + degree·degree_norm + centrality·pagerank_norm + lexical·term_overlap`.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ModeWeights {
    pub similarity: f64,
    pub degree: f64,
    pub centrality: f64,
    pub lexical: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `auto` retries `global` when the best `local` score falls below this.
    #[serde(default = "default_auto_threshold")]
    pub auto_threshold: f64,
    /// Cap on the in-memory candidate sample per namespace.
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
    /// Top-N seeds used for adjacency expansion.
    #[serde(default = "default_expansion_seeds")]
    pub expansion_seeds: usize,
    #[serde(default = "default_expansion_decay")]
    pub expansion_decay: f64,
    #[serde(default = "default_local_weights")]
    pub local: ModeWeights,
    #[serde(default = "default_global_weights")]
    pub global: ModeWeights,
    #[serde(default = "default_drift_weights")]
    pub drift: ModeWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            auto_threshold: default_auto_threshold(),
            sample_cap: default_sample_cap(),
            expansion_seeds: default_expansion_seeds(),
            expansion_decay: default_expansion_decay(),
            local: default_local_weights(),
            global: default_global_weights(),
            drift: default_drift_weights(),
        }
    }
}

fn default_auto_threshold() -> f64 {
    0.35
}
fn default_sample_cap() -> usize {
    1000
}
fn default_expansion_seeds() -> usize {
    20
}
fn default_expansion_decay() -> f64 {
    0.5
}
fn default_local_weights() -> ModeWeights {
    ModeWeights {
        similarity: 0.60,
        degree: 0.10,
        centrality: 0.10,
        lexical: 0.20,
    }
}
fn default_global_weights() -> ModeWeights {
    ModeWeights {
        similarity: 0.30,
        degree: 0.25,
        centrality: 0.30,
        lexical: 0.15,
    }
}
fn default_drift_weights() -> ModeWeights {
    ModeWeights {
        similarity: 0.40,
        degree: 0.10,
        centrality: 0.30,
        lexical: 0.20,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// `graphrag` runs the full pipeline inline; `legacy` only registers
    /// the document and leaves indexing to the orchestrator.
    #[serde(default = "default_ingest_mode")]
    pub default_mode: String,
    /// MENTIONED_IN edges per entity per document, embedded backend.
    #[serde(default = "default_mention_cap_embedded")]
    pub mention_cap_embedded: usize,
    /// MENTIONED_IN edges per entity per document, graph backend.
    #[serde(default = "default_mention_cap_graph")]
    pub mention_cap_graph: usize,
    /// Maximum documents per batch ingest request.
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_mode: default_ingest_mode(),
            mention_cap_embedded: default_mention_cap_embedded(),
            mention_cap_graph: default_mention_cap_graph(),
            max_batch: default_max_batch(),
        }
    }
}

fn default_ingest_mode() -> String {
    "graphrag".to_string()
}
fn default_mention_cap_embedded() -> usize {
    10
}
fn default_mention_cap_graph() -> usize {
    5
}
fn default_max_batch() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Run artifacts live under `<output_root>/<namespace>/run-<ts>/`.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Retention: number of past run directories to keep.
    #[serde(default = "default_keep_runs")]
    pub keep_runs: usize,
    /// Timer trigger; 0 disables the scheduler.
    #[serde(default)]
    pub interval_secs: u64,
    /// Threshold trigger: start a run after this many pending docs.
    /// 0 disables.
    #[serde(default)]
    pub threshold_new_docs: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            keep_runs: default_keep_runs(),
            interval_secs: 0,
            threshold_new_docs: 0,
        }
    }
}

fn default_output_root() -> PathBuf {
    PathBuf::from("output")
}
fn default_keep_runs() -> usize {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Daily LLM token budget per namespace for cluster summarization.
    /// Resets at UTC midnight.
    #[serde(default = "default_summary_budget")]
    pub summary_daily_token_budget: u32,
    #[serde(default = "default_summary_rate")]
    pub summary_rate_per_min: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    /// Automatic analytics recompute when the namespace grew by this ratio.
    #[serde(default = "default_growth_ratio")]
    pub recompute_growth_ratio: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            summary_daily_token_budget: default_summary_budget(),
            summary_rate_per_min: default_summary_rate(),
            summary_max_tokens: default_summary_max_tokens(),
            recompute_growth_ratio: default_growth_ratio(),
        }
    }
}

fn default_summary_budget() -> u32 {
    4000
}
fn default_summary_rate() -> usize {
    10
}
fn default_summary_max_tokens() -> u32 {
    120
}
fn default_growth_ratio() -> f64 {
    0.10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, mutating endpoints and `/answer` require the `x-api-key`
    /// header to match.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_rate_default")]
    pub rate_default_per_min: usize,
    /// Stricter limit for `global` mode queries.
    #[serde(default = "default_rate_global")]
    pub rate_global_per_min: usize,
    /// Stricter limit for cluster summarization.
    #[serde(default = "default_rate_summarize")]
    pub rate_summarize_per_min: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
            rate_default_per_min: default_rate_default(),
            rate_global_per_min: default_rate_global(),
            rate_summarize_per_min: default_rate_summarize(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_rate_default() -> usize {
    120
}
fn default_rate_global() -> usize {
    30
}
fn default_rate_summarize() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.graph.store.as_str() {
        "sqlite" => {}
        "neo4j" => {
            if config.graph.neo4j_uri.is_none() {
                anyhow::bail!("graph.neo4j_uri must be set when graph.store is 'neo4j'");
            }
        }
        other => anyhow::bail!("Unknown graph store: '{}'. Must be sqlite or neo4j.", other),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.ingest.default_mode.as_str() {
        "graphrag" | "legacy" => {}
        other => anyhow::bail!(
            "Unknown ingest.default_mode: '{}'. Must be graphrag or legacy.",
            other
        ),
    }

    if !(0.0..=1.0).contains(&config.retrieval.auto_threshold) {
        anyhow::bail!("retrieval.auto_threshold must be in [0.0, 1.0]");
    }
    for (name, w) in [
        ("local", &config.retrieval.local),
        ("global", &config.retrieval.global),
        ("drift", &config.retrieval.drift),
    ] {
        let sum = w.similarity + w.degree + w.centrality + w.lexical;
        if !(0.5..=1.5).contains(&sum) {
            anyhow::bail!("retrieval.{} weights must roughly sum to 1.0 (got {})", name, sum);
        }
    }

    if config.index.keep_runs == 0 {
        anyhow::bail!("index.keep_runs must be >= 1");
    }
    if config.ingest.max_batch == 0 || config.ingest.max_batch > 1000 {
        anyhow::bail!("ingest.max_batch must be in 1..=1000");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        validate(&config).unwrap();
        assert!(config.enabled);
        assert_eq!(config.default_namespace, "public");
        assert_eq!(config.graph.store, "sqlite");
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.index.keep_runs, 7);
        assert_eq!(config.retrieval.auto_threshold, 0.35);
    }

    #[test]
    fn test_mode_weight_defaults_match_documented_values() {
        let r = RetrievalConfig::default();
        assert_eq!(
            (r.local.similarity, r.local.degree, r.local.centrality, r.local.lexical),
            (0.60, 0.10, 0.10, 0.20)
        );
        assert_eq!(
            (r.global.similarity, r.global.degree, r.global.centrality, r.global.lexical),
            (0.30, 0.25, 0.30, 0.15)
        );
        assert_eq!(
            (r.drift.similarity, r.drift.degree, r.drift.centrality, r.drift.lexical),
            (0.40, 0.10, 0.30, 0.20)
        );
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [db]
            path = "/tmp/test.sqlite"

            [graph]
            store = "sqlite"
            "#,
        )
        .unwrap();
        validate(&config).unwrap();
        assert_eq!(config.db.path, PathBuf::from("/tmp/test.sqlite"));
    }

    #[test]
    fn test_neo4j_requires_uri() {
        let config: Config = toml::from_str(
            r#"
            [graph]
            store = "neo4j"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config: Config = toml::from_str(
            r#"
            [embedding]
            provider = "quantum"
            model = "m"
            "#,
        )
        .unwrap();
        assert!(validate(&config).is_err());
    }
}
