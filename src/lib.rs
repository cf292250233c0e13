//! # GraphLoom
//!
//! **A GraphRAG engine: typed property-graph ingestion, hybrid retrieval,
//! and grounded answers over unstructured text.**
//!
//! GraphLoom ingests documents, extracts a typed property graph (entities,
//! relations, sections, chunks), stores embeddings alongside graph
//! structure, and serves hybrid retrieval (dense + structural + lexical)
//! plus grounded answer synthesis over that graph. Around the core sit
//! orchestrated re-indexing with delta detection, graph analytics
//! (centrality, communities, layout), snapshot diffing, and a live event
//! stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────┐   ┌─────────────────┐
//! │ Document │──▶│  chunker → extract → embed │──▶│   GraphStore    │
//! └──────────┘   │        (ingest)            │   │ SQLite / Neo4j  │
//!                └────────────┬───────────────┘   └────────┬────────┘
//!                             │ events                     │
//!                ┌────────────▼────────────┐     ┌─────────▼─────────┐
//!                │  SSE stream (/stream)   │     │ retrieval → answer │
//!                └─────────────────────────┘     │ analytics/cluster  │
//!                                                │ orchestrator       │
//!                                                └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Nodes, edges, ingest log, run records, snapshots |
//! | [`chunker`] | Deterministic section parsing and 700–1200 char chunking |
//! | [`extract`] | LLM + heuristic entity/relation extraction |
//! | [`embedding`] | Embedding providers with a persisted hash-keyed cache |
//! | [`llm`] | Chat-completion client with retry/backoff |
//! | [`store`] | Dual-backend storage adapter with transparent fallback |
//! | [`ingest`] | The document ingestion pipeline |
//! | [`retrieval`] | Mode-adaptive hybrid ranking with reasoning chains |
//! | [`answer`] | Grounded answer synthesis (retrieval-only capable) |
//! | [`analytics`] | Degree, PageRank, betweenness, importance, layout |
//! | [`cluster`] | Louvain communities and cached summaries |
//! | [`orchestrator`] | Delta re-indexing runs with artifacts and retention |
//! | [`snapshot`] | Point-in-time captures and structural diffs |
//! | [`events`] | In-process broadcast bus feeding the SSE stream |
//! | [`server`] | Axum HTTP API under `/graphrag` |
//! | [`context`] | Shared engine state with explicit init |

pub mod analytics;
pub mod answer;
pub mod chunker;
pub mod cluster;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod retrieval;
pub mod server;
pub mod snapshot;
pub mod store;

pub use context::GraphLoomContext;
pub use error::{GraphLoomError, Result};
