//! # GraphLoom CLI (`loom`)
//!
//! ```bash
//! loom --config ./config/loom.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `loom init` | Create the database and run schema migrations |
//! | `loom serve` | Start the HTTP API and event stream |
//! | `loom ingest <file>` | Ingest a document from a file |
//! | `loom query "<text>"` | Hybrid retrieval |
//! | `loom answer "<question>"` | Grounded answer synthesis |
//! | `loom index run` | Run the batch orchestrator once |
//! | `loom snapshot create\|list\|diff` | Manage snapshots |
//! | `loom stats` | Namespace counters |

use std::path::PathBuf;

use anyhow::{bail, Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};

use graphloom::config::{load_config, Config};
use graphloom::context::GraphLoomContext;
use graphloom::ingest::IngestRequest;
use graphloom::retrieval::{CancelToken, QueryFilters, QueryMode, QueryRequest};

/// GraphLoom — a GraphRAG engine over unstructured text.
#[derive(Parser)]
#[command(
    name = "loom",
    about = "GraphLoom — ingest text into a typed property graph and query it",
    version
)]
struct Cli {
    /// Path to configuration file (TOML). Missing file falls back to
    /// built-in defaults.
    #[arg(long, global = true, default_value = "./config/loom.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Ingest a document from a file (or inline text via --text).
    Ingest {
        /// Path to a UTF-8 text/markdown file.
        file: Option<PathBuf>,
        /// Inline document text instead of a file.
        #[arg(long)]
        text: Option<String>,
        /// Document id; defaults to the file stem.
        #[arg(long)]
        doc_id: Option<String>,
        #[arg(long)]
        namespace: Option<String>,
        /// Bypass the LLM extractor.
        #[arg(long)]
        force_heuristic: bool,
        /// Skip embedding computation.
        #[arg(long)]
        disable_embeddings: bool,
    },

    /// Run a retrieval query.
    Query {
        query: String,
        #[arg(long, default_value = "auto")]
        mode: String,
        #[arg(long, default_value_t = 8)]
        top_k: usize,
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Retrieve context and synthesize a grounded answer.
    Answer {
        question: String,
        #[arg(long, default_value_t = 6)]
        top_k: usize,
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Batch index orchestration.
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Snapshot management.
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Show namespace counters.
    Stats {
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Run one orchestrated re-index pass.
    Run {
        #[arg(long)]
        namespace: Option<String>,
        /// Proceed even when another run holds the lock.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    Create {
        #[arg(long)]
        namespace: Option<String>,
    },
    List {
        #[arg(long)]
        namespace: Option<String>,
    },
    Diff {
        a: String,
        b: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "graphloom=info,loom=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        Config::default()
    };
    if !config.enabled {
        bail!("graphrag is disabled in the configuration (enabled = false)");
    }

    let ctx = GraphLoomContext::initialize(config)
        .await
        .context("failed to initialize engine")?;

    match cli.command {
        Commands::Init => {
            // Initialization already ran as part of context startup.
            println!("initialized database at {}", ctx.config.db.path.display());
        }

        Commands::Serve => {
            graphloom::server::run_server(ctx).await?;
        }

        Commands::Ingest {
            file,
            text,
            doc_id,
            namespace,
            force_heuristic,
            disable_embeddings,
        } => {
            let (doc_id, text) = match (file, text) {
                (Some(path), None) => {
                    let body = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    let id = doc_id.unwrap_or_else(|| {
                        path.file_stem()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_else(|| "doc".to_string())
                    });
                    (id, body)
                }
                (None, Some(body)) => {
                    let id = doc_id.context("--doc-id is required with --text")?;
                    (id, body)
                }
                _ => bail!("provide exactly one of <file> or --text"),
            };

            let outcome = graphloom::ingest::ingest_document(
                &ctx,
                IngestRequest {
                    doc_id,
                    text,
                    namespace,
                    metadata: None,
                    force_heuristic,
                    disable_embeddings,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Query {
            query,
            mode,
            top_k,
            namespace,
        } => {
            let mode = QueryMode::parse(&mode)
                .with_context(|| format!("unknown query mode: {}", mode))?;
            let response = graphloom::retrieval::query(
                &ctx,
                &QueryRequest {
                    query,
                    namespace,
                    mode,
                    top_k,
                    filters: QueryFilters::default(),
                },
                &CancelToken::new(),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Answer {
            question,
            top_k,
            namespace,
        } => {
            let response =
                graphloom::answer::answer(&ctx, &question, namespace.as_deref(), top_k).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }

        Commands::Index { command } => match command {
            IndexCommands::Run { namespace, force } => {
                let namespace = ctx.namespace_or_default(namespace.as_deref());
                let outcome = graphloom::orchestrator::run_index(&ctx, &namespace, force).await?;
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                if !matches!(
                    outcome.status,
                    graphloom::models::RunStatus::Success
                        | graphloom::models::RunStatus::Partial
                        | graphloom::models::RunStatus::Noop
                ) {
                    std::process::exit(1);
                }
            }
        },

        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create { namespace } => {
                let namespace = ctx.namespace_or_default(namespace.as_deref());
                let record = graphloom::snapshot::create_snapshot(&ctx, &namespace).await?;
                println!(
                    "snapshot {} — {} nodes, {} edges",
                    record.id, record.node_count, record.edge_count
                );
            }
            SnapshotCommands::List { namespace } => {
                let namespace = ctx.namespace_or_default(namespace.as_deref());
                let snapshots = graphloom::snapshot::list_snapshots(&ctx, &namespace, 25).await?;
                for s in snapshots {
                    println!(
                        "{}  {}  nodes={} edges={} modularity={}",
                        s.id,
                        s.created_at,
                        s.node_count,
                        s.edge_count,
                        s.modularity.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                    );
                }
            }
            SnapshotCommands::Diff { a, b } => {
                let snap_a = graphloom::snapshot::get_snapshot(&ctx, &a).await?;
                let snap_b = graphloom::snapshot::get_snapshot(&ctx, &b).await?;
                let diff = graphloom::snapshot::diff_snapshots(&snap_a, &snap_b);
                println!("{}", serde_json::to_string_pretty(&diff)?);
            }
        },

        Commands::Stats { namespace } => {
            let namespace = ctx.namespace_or_default(namespace.as_deref());
            let stats = ctx.store.stats(&namespace).await?;
            println!("namespace: {}", namespace);
            println!("  nodes: {}", stats.node_count);
            println!("  edges: {}", stats.edge_count);
            let mut labels: Vec<(&String, &u64)> = stats.label_counts.iter().collect();
            labels.sort();
            for (label, count) in labels {
                println!("  {}: {}", label, count);
            }
            println!("  store: {}", ctx.store.store_tag());
        }
    }

    Ok(())
}
