//! Document ingestion pipeline.
//!
//! Per `(namespace, doc_id, text)`:
//!
//! 1. Hash the content; identical to the last indexed hash → `NOOP`.
//! 2. Parse sections and chunks.
//! 3. Extract entities/relations per chunk (LLM or heuristic).
//! 4. Embed chunk texts and unique entity names (unless disabled;
//!    embedding failure is non-fatal and leaves empties).
//! 5. Upsert the document's graph in one transaction: Section and Chunk
//!    nodes, `CONTAINS`, entity nodes, `HAS_ENTITY`, `MENTIONED_IN`,
//!    `CO_OCCURS`, `ROLE_AT`, `USES_TECH`.
//! 6. Update the ingest log. A first-time document is `indexed`; a
//!    re-ingest with changed content refreshes the graph inline and moves
//!    the log to `stale` so the next orchestrator delta run refreshes the
//!    baseline artifacts.
//! 7. Publish `node_added` events for created nodes, then one
//!    `edges_added` summary.
//!
//! A failure in steps 2–5 aborts the transaction, moves the log to
//! `failed`, and leaves no partial graph visible.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::chunker::{parse_document, DocumentOutline};
use crate::context::GraphLoomContext;
use crate::error::{GraphLoomError, Result};
use crate::events::GraphEvent;
use crate::extract::{derive_sentence_relations, ExtractedEntity, ExtractionMode};
use crate::models::{
    chunk_node_id, content_hash, entity_node_id, normalized_name, relation, section_node_id,
    utc_now_iso, Edge, IngestRecord, IngestStatus, Node, NodeLabel,
};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub doc_id: String,
    pub text: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub force_heuristic: bool,
    #[serde(default)]
    pub disable_embeddings: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    /// `indexed`, `noop`, or `registered` (legacy mode).
    pub status: String,
    pub nodes_created: u64,
    pub edges_created: u64,
    pub chunks: usize,
    pub extraction_mode: String,
    pub namespace: String,
    pub store: String,
}

/// Ingest one document end to end.
pub async fn ingest_document(
    ctx: &GraphLoomContext,
    request: IngestRequest,
) -> Result<IngestOutcome> {
    if !ctx.config.enabled {
        return Err(GraphLoomError::Validation("graphrag is disabled".into()));
    }
    if request.doc_id.trim().is_empty() {
        return Err(GraphLoomError::Validation("doc_id must not be empty".into()));
    }
    if request.text.trim().is_empty() {
        return Err(GraphLoomError::Validation("text must not be empty".into()));
    }

    let started = Instant::now();
    let namespace = ctx.namespace_or_default(request.namespace.as_deref());
    let hash = content_hash(&request.text);
    let existing = get_ingest_record(&ctx.pool, &namespace, &request.doc_id).await?;

    if let Some(record) = &existing {
        let settled = matches!(record.status, IngestStatus::Indexed | IngestStatus::Stale);
        if record.content_hash == hash && settled {
            return Ok(IngestOutcome {
                status: "noop".to_string(),
                nodes_created: 0,
                edges_created: 0,
                chunks: 0,
                extraction_mode: "none".to_string(),
                namespace,
                store: ctx.store.store_tag().to_string(),
            });
        }
    }

    store_document(&ctx.pool, &namespace, &request.doc_id, &request.text, &request.metadata)
        .await?;

    if ctx.config.ingest.default_mode == "legacy" {
        // Legacy mode only registers the document; the orchestrator builds
        // the graph on its next delta run.
        let status = if existing.is_some() {
            IngestStatus::Stale
        } else {
            IngestStatus::New
        };
        set_ingest_status(&ctx.pool, &namespace, &request.doc_id, &hash, status, None, false)
            .await?;
        return Ok(IngestOutcome {
            status: "registered".to_string(),
            nodes_created: 0,
            edges_created: 0,
            chunks: 0,
            extraction_mode: "none".to_string(),
            namespace,
            store: ctx.store.store_tag().to_string(),
        });
    }

    let result = run_pipeline(ctx, &namespace, &request).await;

    match result {
        Ok(built) => {
            // Changed content leaves the log stale for the next delta run;
            // a first-time (or previously failed) doc is indexed outright.
            let status = match &existing {
                Some(record) if record.status == IngestStatus::Stale => IngestStatus::Stale,
                Some(record)
                    if record.content_hash != hash
                        && record.status == IngestStatus::Indexed =>
                {
                    IngestStatus::Stale
                }
                _ => IngestStatus::Indexed,
            };
            set_ingest_status(
                &ctx.pool,
                &namespace,
                &request.doc_id,
                &hash,
                status,
                None,
                status == IngestStatus::Indexed,
            )
            .await?;

            for node_id in &built.created_node_ids {
                if let Some((label, name)) = built.created_node_meta.get(node_id) {
                    ctx.events.publish(GraphEvent::NodeAdded {
                        id: node_id.clone(),
                        label: label.clone(),
                        name: name.clone(),
                        namespace: namespace.clone(),
                    });
                }
            }
            if built.edges_created > 0 {
                ctx.events.publish(GraphEvent::EdgesAdded {
                    count: built.edges_created,
                    doc_id: request.doc_id.clone(),
                    namespace: namespace.clone(),
                });
            }

            ctx.metrics.ingest_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            ctx.metrics
                .nodes_created
                .fetch_add(built.nodes_created, std::sync::atomic::Ordering::Relaxed);
            ctx.metrics
                .edges_created
                .fetch_add(built.edges_created, std::sync::atomic::Ordering::Relaxed);
            ctx.metrics.record_namespace_doc(&namespace);
            ctx.metrics
                .record_latency("ingest", started.elapsed().as_secs_f64());

            Ok(IngestOutcome {
                status: "indexed".to_string(),
                nodes_created: built.nodes_created,
                edges_created: built.edges_created,
                chunks: built.chunks,
                extraction_mode: built.extraction_mode,
                namespace,
                store: ctx.store.store_tag().to_string(),
            })
        }
        Err(e) => {
            let category = e.kind().to_string();
            set_ingest_status(
                &ctx.pool,
                &namespace,
                &request.doc_id,
                &hash,
                IngestStatus::Failed,
                Some(&category),
                false,
            )
            .await?;
            Err(e)
        }
    }
}

pub(crate) struct BuiltGraph {
    pub nodes_created: u64,
    pub edges_created: u64,
    pub chunks: usize,
    pub extraction_mode: String,
    pub created_node_ids: Vec<String>,
    pub created_node_meta: HashMap<String, (String, String)>,
}

async fn run_pipeline(
    ctx: &GraphLoomContext,
    namespace: &str,
    request: &IngestRequest,
) -> Result<BuiltGraph> {
    let outline = parse_document(&request.text);
    let (nodes, edges, extraction_mode) =
        build_document_graph(ctx, namespace, &request.doc_id, &outline, request).await?;

    // The namespace advisory lock serializes writers; readers continue to
    // see the pre-transaction state until commit.
    let _guard = ctx.store.lock_namespace(namespace).await;
    let stats = ctx
        .store
        .ingest_document_graph(namespace, &request.doc_id, &nodes, &edges)
        .await?;
    drop(_guard);

    let created: HashSet<&str> = stats.created_node_ids.iter().map(|s| s.as_str()).collect();
    let created_node_meta: HashMap<String, (String, String)> = nodes
        .iter()
        .filter(|n| created.contains(n.id.as_str()))
        .map(|n| (n.id.clone(), (n.label.as_str().to_string(), n.name.clone())))
        .collect();

    Ok(BuiltGraph {
        nodes_created: stats.nodes_created,
        edges_created: stats.edges_created,
        chunks: outline.chunks.len(),
        extraction_mode,
        created_node_ids: stats.created_node_ids,
        created_node_meta,
    })
}

/// Build the node/edge set for one document. Pure with respect to storage;
/// only the embedder and extractor are consulted.
pub(crate) async fn build_document_graph(
    ctx: &GraphLoomContext,
    namespace: &str,
    doc_id: &str,
    outline: &DocumentOutline,
    request: &IngestRequest,
) -> Result<(Vec<Node>, Vec<Edge>, String)> {
    let mode = if request.force_heuristic {
        ExtractionMode::ForceHeuristic
    } else {
        ExtractionMode::Llm
    };

    // Aggregate entities across chunks. Identity is the lowercased name;
    // the most specific label wins, confidence keeps its maximum.
    let mut entity_index: HashMap<String, ExtractedEntity> = HashMap::new();
    let mut entity_order: Vec<String> = Vec::new();
    let mut chunk_entities: Vec<Vec<String>> = Vec::with_capacity(outline.chunks.len());
    let mut llm_relations = Vec::new();
    let mut modes_seen: HashSet<&'static str> = HashSet::new();

    for chunk in &outline.chunks {
        let extraction = ctx.extractor.extract_chunk(&chunk.text, mode).await;
        modes_seen.insert(extraction.mode_used);
        let mut present: Vec<String> = Vec::new();
        for entity in extraction.entities {
            let key = normalized_name(&entity.name);
            if key.is_empty() {
                continue;
            }
            use std::collections::hash_map::Entry;
            match entity_index.entry(key.clone()) {
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing.label == NodeLabel::Entity && entity.label != NodeLabel::Entity {
                        existing.label = entity.label;
                    }
                    existing.confidence = existing.confidence.max(entity.confidence);
                }
                Entry::Vacant(slot) => {
                    slot.insert(entity);
                    entity_order.push(key.clone());
                }
            }
            if !present.contains(&key) {
                present.push(key.clone());
            }
        }
        llm_relations.extend(extraction.relations);
        chunk_entities.push(present);
    }

    // Sentence-derived ROLE_AT over the whole document catches pairs whose
    // labels were only settled after cross-chunk aggregation.
    let aggregated: Vec<ExtractedEntity> = entity_order
        .iter()
        .map(|k| entity_index[k].clone())
        .collect();
    llm_relations.extend(derive_sentence_relations(&request.text, &aggregated));

    let extraction_mode = if request.force_heuristic {
        "heuristic"
    } else if modes_seen.contains("heuristic_fallback") {
        "heuristic_fallback"
    } else if modes_seen.contains("llm") {
        "llm"
    } else {
        "heuristic"
    }
    .to_string();

    // Embeddings for chunk texts and unique entity names. Failure leaves
    // empties and tags nodes, never aborts the ingest.
    let mut chunk_vectors: Vec<Vec<f32>> = vec![Vec::new(); outline.chunks.len()];
    let mut entity_vectors: HashMap<String, Vec<f32>> = HashMap::new();
    let mut embedding_failed = false;
    if !request.disable_embeddings && ctx.embedder.is_enabled() {
        let chunk_texts: Vec<String> = outline.chunks.iter().map(|c| c.text.clone()).collect();
        match ctx.embedder.embed_texts(&chunk_texts).await {
            Ok(vectors) => chunk_vectors = vectors,
            Err(e) => {
                tracing::warn!(error = %e, doc_id, "chunk embedding failed");
                embedding_failed = true;
            }
        }
        let names: Vec<String> = entity_order
            .iter()
            .map(|k| entity_index[k].name.clone())
            .collect();
        match ctx.embedder.embed_texts(&names).await {
            Ok(vectors) => {
                for (key, vector) in entity_order.iter().zip(vectors) {
                    entity_vectors.insert(key.clone(), vector);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, doc_id, "entity embedding failed");
                embedding_failed = true;
            }
        }
    }

    let mut nodes: Vec<Node> = Vec::new();
    let mut edges: Vec<Edge> = Vec::new();

    // Section nodes.
    for section in &outline.sections {
        let mut node = Node::new(
            section_node_id(namespace, doc_id, &section.path),
            NodeLabel::Section,
            section.title.clone(),
            namespace,
        );
        node.source_ids.push(doc_id.to_string());
        node.set_prop("doc_id", serde_json::json!(doc_id));
        node.set_prop("section_path", serde_json::json!(section.path));
        node.set_prop("depth", serde_json::json!(section.depth));
        nodes.push(node);
    }

    // Chunk nodes and CONTAINS edges.
    for chunk in &outline.chunks {
        let id = chunk_node_id(namespace, doc_id, chunk.index);
        let mut node = Node::new(&id, NodeLabel::Chunk, format!("Chunk {}", chunk.index), namespace);
        node.source_ids.push(doc_id.to_string());
        node.embedding = chunk_vectors.get(chunk.index).cloned().unwrap_or_default();
        node.set_prop("doc_id", serde_json::json!(doc_id));
        node.set_prop("chunk_index", serde_json::json!(chunk.index));
        node.set_prop("section_path", serde_json::json!(chunk.section_path));
        node.set_prop("text", serde_json::json!(chunk.text));
        if embedding_failed {
            node.set_prop("embedding_status", serde_json::json!("failed"));
        }
        nodes.push(node);

        edges.push(Edge::new(
            section_node_id(namespace, doc_id, &chunk.section_path),
            &id,
            relation::CONTAINS,
            0.9,
            namespace,
        ));
    }

    // Entity nodes.
    let mut entity_ids: HashMap<String, String> = HashMap::new();
    for key in &entity_order {
        let entity = &entity_index[key];
        let id = entity_node_id(namespace, &entity.name);
        let mut node = Node::new(&id, entity.label, entity.name.clone(), namespace);
        node.source_ids.push(doc_id.to_string());
        node.embedding = entity_vectors.get(key).cloned().unwrap_or_default();
        node.set_prop("extraction_confidence", serde_json::json!(entity.confidence));
        if embedding_failed {
            node.set_prop("embedding_status", serde_json::json!("failed"));
        }
        nodes.push(node);
        entity_ids.insert(key.clone(), id);
    }

    // MENTIONED_IN, capped per entity per document to bound write
    // amplification; the graph backend gets the tighter cap.
    let mention_cap = if ctx.store.has_graph_backend() {
        ctx.config.ingest.mention_cap_graph
    } else {
        ctx.config.ingest.mention_cap_embedded
    };
    let lowered_chunks: Vec<String> = outline
        .chunks
        .iter()
        .map(|c| c.text.to_lowercase())
        .collect();
    for key in &entity_order {
        let entity_id = &entity_ids[key];
        let mut mentions = 0usize;
        for (idx, lowered) in lowered_chunks.iter().enumerate() {
            if mentions >= mention_cap {
                break;
            }
            if lowered.contains(key.as_str()) {
                edges.push(Edge::new(
                    entity_id.clone(),
                    chunk_node_id(namespace, doc_id, idx),
                    relation::MENTIONED_IN,
                    0.6,
                    namespace,
                ));
                mentions += 1;
            }
        }
    }

    // CO_OCCURS per chunk; confidence is the lower of the pair.
    let mut co_seen: HashSet<(String, String)> = HashSet::new();
    for present in &chunk_entities {
        for i in 0..present.len() {
            for j in (i + 1)..present.len() {
                let (a, b) = if present[i] <= present[j] {
                    (present[i].clone(), present[j].clone())
                } else {
                    (present[j].clone(), present[i].clone())
                };
                if !co_seen.insert((a.clone(), b.clone())) {
                    continue;
                }
                let confidence = entity_index[&a]
                    .confidence
                    .min(entity_index[&b].confidence);
                edges.push(Edge::new(
                    entity_ids[&a].clone(),
                    entity_ids[&b].clone(),
                    relation::CO_OCCURS,
                    confidence,
                    namespace,
                ));
            }
        }
    }

    // HAS_ENTITY per section, and USES_TECH for Role/Organization with a
    // Technology co-occurring in the same section.
    let mut section_entities: HashMap<&str, Vec<&String>> = HashMap::new();
    for (chunk, present) in outline.chunks.iter().zip(&chunk_entities) {
        let bucket = section_entities
            .entry(chunk.section_path.as_str())
            .or_default();
        for key in present {
            if !bucket.contains(&key) {
                bucket.push(key);
            }
        }
    }
    let mut derived_seen: HashSet<(String, String, &'static str)> = HashSet::new();
    for (section_path, keys) in &section_entities {
        let section_id = section_node_id(namespace, doc_id, section_path);
        for key in keys {
            edges.push(Edge::new(
                section_id.clone(),
                entity_ids[key.as_str()].clone(),
                relation::HAS_ENTITY,
                0.5,
                namespace,
            ));
        }
        let holders: Vec<&String> = keys
            .iter()
            .copied()
            .filter(|k| {
                matches!(
                    entity_index[k.as_str()].label,
                    NodeLabel::Role | NodeLabel::Organization
                )
            })
            .collect();
        let techs: Vec<&String> = keys
            .iter()
            .copied()
            .filter(|k| entity_index[k.as_str()].label == NodeLabel::Technology)
            .collect();
        for holder in &holders {
            for tech in &techs {
                let key = (
                    holder.as_str().to_string(),
                    tech.as_str().to_string(),
                    relation::USES_TECH,
                );
                if derived_seen.insert(key) {
                    edges.push(Edge::new(
                        entity_ids[holder.as_str()].clone(),
                        entity_ids[tech.as_str()].clone(),
                        relation::USES_TECH,
                        0.55,
                        namespace,
                    ));
                }
            }
        }
    }

    // Extractor-supplied relations (LLM labels and sentence-derived
    // ROLE_AT), mapped from names to node ids.
    let mut relation_seen: HashSet<(String, String, String)> = HashSet::new();
    for rel in llm_relations {
        let source_key = normalized_name(&rel.source_name);
        let target_key = normalized_name(&rel.target_name);
        let (Some(source_id), Some(target_id)) =
            (entity_ids.get(&source_key), entity_ids.get(&target_key))
        else {
            continue;
        };
        let key = (source_id.clone(), target_id.clone(), rel.relation.clone());
        if !relation_seen.insert(key) {
            continue;
        }
        edges.push(Edge::new(
            source_id.clone(),
            target_id.clone(),
            &rel.relation,
            rel.confidence,
            namespace,
        ));
    }

    // The edge list may contain identity duplicates across derivations;
    // the store merges them, but deduping here keeps counters honest.
    let mut edge_seen: HashSet<String> = HashSet::new();
    edges.retain(|e| edge_seen.insert(e.id.clone()));

    Ok((nodes, edges, extraction_mode))
}

// ---- documents & ingest log ----

pub async fn store_document(
    pool: &SqlitePool,
    namespace: &str,
    doc_id: &str,
    text: &str,
    metadata: &Option<serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (namespace, doc_id, text, metadata, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(namespace, doc_id) DO UPDATE SET
            text = excluded.text,
            metadata = excluded.metadata,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(namespace)
    .bind(doc_id)
    .bind(text)
    .bind(serde_json::to_string(metadata.as_ref().unwrap_or(&serde_json::json!({})))?)
    .bind(utc_now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_document(
    pool: &SqlitePool,
    namespace: &str,
    doc_id: &str,
) -> Result<Option<String>> {
    let row = sqlx::query("SELECT text FROM documents WHERE namespace = ? AND doc_id = ?")
        .bind(namespace)
        .bind(doc_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get("text")))
}

pub async fn get_ingest_record(
    pool: &SqlitePool,
    namespace: &str,
    doc_id: &str,
) -> Result<Option<IngestRecord>> {
    let row = sqlx::query("SELECT * FROM ingest_log WHERE namespace = ? AND doc_id = ?")
        .bind(namespace)
        .bind(doc_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| record_from_row(&r)))
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> IngestRecord {
    let status: String = row.get("status");
    IngestRecord {
        namespace: row.get("namespace"),
        doc_id: row.get("doc_id"),
        content_hash: row.get("content_hash"),
        first_seen: row.get("first_seen"),
        last_indexed_at: row.get("last_indexed_at"),
        status: IngestStatus::parse(&status),
        error: row.get("error"),
    }
}

pub async fn set_ingest_status(
    pool: &SqlitePool,
    namespace: &str,
    doc_id: &str,
    content_hash: &str,
    status: IngestStatus,
    error: Option<&str>,
    touch_indexed_at: bool,
) -> Result<()> {
    let now = utc_now_iso();
    let indexed_at = if touch_indexed_at { Some(now.clone()) } else { None };
    sqlx::query(
        r#"
        INSERT INTO ingest_log (namespace, doc_id, content_hash, first_seen, last_indexed_at, status, error)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(namespace, doc_id) DO UPDATE SET
            content_hash = excluded.content_hash,
            status = excluded.status,
            error = excluded.error,
            last_indexed_at = COALESCE(excluded.last_indexed_at, ingest_log.last_indexed_at)
        "#,
    )
    .bind(namespace)
    .bind(doc_id)
    .bind(content_hash)
    .bind(&now)
    .bind(indexed_at)
    .bind(status.as_str())
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Docs the next delta run must process: status `new` or `stale`.
pub async fn list_pending(pool: &SqlitePool, namespace: &str) -> Result<Vec<IngestRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM ingest_log WHERE namespace = ? AND status IN ('new', 'stale') ORDER BY doc_id",
    )
    .bind(namespace)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_from_row).collect())
}

pub async fn count_ingest_records(pool: &SqlitePool, namespace: &str) -> Result<u64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_log WHERE namespace = ?")
        .bind(namespace)
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;

    fn request(doc_id: &str, text: &str) -> IngestRequest {
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
    async fn test_ingest_builds_entities_and_provenance() {
        let ctx = test_context().await;
        let outcome = ingest_document(
            &ctx,
            request("d1", "OpenAI collaborates with Microsoft and Google on AI safety."),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, "indexed");
        assert_eq!(outcome.chunks, 1);
        assert_eq!(outcome.extraction_mode, "heuristic");
        assert!(outcome.nodes_created >= 5, "got {}", outcome.nodes_created);

        for name in ["openai", "microsoft", "google"] {
            let node = ctx
                .store
                .get_node(&format!("public:{}", name))
                .await
                .unwrap()
                .unwrap_or_else(|| panic!("missing entity {}", name));
            assert!(node.label.is_entity_kind());
            // Each entity is mentioned in the single chunk.
            let (_, edges) = ctx.store.neighbors(&node.id, 1).await.unwrap();
            assert!(
                edges
                    .iter()
                    .any(|e| e.relation == "MENTIONED_IN" && e.target_id == "public:d1:0"),
                "no MENTIONED_IN for {}",
                name
            );
        }

        // Pairwise CO_OCCURS between the three entities.
        let (_, edges) = ctx.store.neighbors("public:openai", 1).await.unwrap();
        let co: Vec<_> = edges.iter().filter(|e| e.relation == "CO_OCCURS").collect();
        assert!(co.len() >= 2, "expected pairwise co-occurrence, got {:?}", co);
    }

    #[tokio::test]
    async fn test_reingest_identical_is_noop() {
        let ctx = test_context().await;
        let text = "Alice works at Acme. Acme uses Kafka.";
        let first = ingest_document(&ctx, request("d1", text)).await.unwrap();
        assert_eq!(first.status, "indexed");

        let stats_before = ctx.store.stats("public").await.unwrap();
        let second = ingest_document(&ctx, request("d1", text)).await.unwrap();
        assert_eq!(second.status, "noop");
        let stats_after = ctx.store.stats("public").await.unwrap();
        assert_eq!(stats_before.node_count, stats_after.node_count);
        assert_eq!(stats_before.edge_count, stats_after.edge_count);
    }

    #[tokio::test]
    async fn test_changed_content_marks_stale() {
        let ctx = test_context().await;
        ingest_document(&ctx, request("d1", "Alice works at Acme."))
            .await
            .unwrap();
        ingest_document(&ctx, request("d1", "Alice works at Acme. Acme uses Kafka."))
            .await
            .unwrap();
        let record = get_ingest_record(&ctx.pool, "public", "d1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, IngestStatus::Stale);
        let pending = list_pending(&ctx.pool, "public").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_role_and_tech_edges() {
        let ctx = test_context().await;
        ingest_document(&ctx, request("d1", "Alice works at Acme. Acme uses Kafka."))
            .await
            .unwrap();

        let (_, edges) = ctx.store.neighbors("public:acme", 1).await.unwrap();
        assert!(
            edges
                .iter()
                .any(|e| e.relation == "ROLE_AT" && e.source_id == "public:alice"),
            "missing ROLE_AT: {:?}",
            edges
        );
        assert!(
            edges
                .iter()
                .any(|e| e.relation == "USES_TECH" && e.target_id == "public:kafka"),
            "missing USES_TECH: {:?}",
            edges
        );
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let ctx = test_context().await;
        let mut a = request("d1", "Kafka powers the pipeline at Acme Corp.");
        a.namespace = Some("team-a".to_string());
        ingest_document(&ctx, a).await.unwrap();

        let mut b = request("d1", "Kafka powers the pipeline at Acme Corp.");
        b.namespace = Some("team-b".to_string());
        ingest_document(&ctx, b).await.unwrap();

        let (nodes, _) = ctx.store.neighbors("team-a:kafka", 2).await.unwrap();
        assert!(nodes.iter().all(|n| n.namespace == "team-a"));
        assert!(ctx.store.get_node("team-b:kafka").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deterministic_node_edge_sets() {
        let ctx_a = test_context().await;
        let ctx_b = test_context().await;
        let text = "# Team\n\nAlice works at Acme. Bob works at Acme.\n\n# Stack\n\nAcme uses Kafka and Postgres.";
        ingest_document(&ctx_a, request("d1", text)).await.unwrap();
        ingest_document(&ctx_b, request("d1", text)).await.unwrap();

        let (mut nodes_a, mut edges_a) = ctx_a.store.export_graph("public", 10_000).await.unwrap();
        let (mut nodes_b, mut edges_b) = ctx_b.store.export_graph("public", 10_000).await.unwrap();
        nodes_a.sort_by(|x, y| x.id.cmp(&y.id));
        nodes_b.sort_by(|x, y| x.id.cmp(&y.id));
        edges_a.sort_by(|x, y| x.id.cmp(&y.id));
        edges_b.sort_by(|x, y| x.id.cmp(&y.id));

        let ids_a: Vec<&String> = nodes_a.iter().map(|n| &n.id).collect();
        let ids_b: Vec<&String> = nodes_b.iter().map(|n| &n.id).collect();
        assert_eq!(ids_a, ids_b);
        let eids_a: Vec<(&String, f64)> = edges_a.iter().map(|e| (&e.id, e.confidence)).collect();
        let eids_b: Vec<(&String, f64)> = edges_b.iter().map(|e| (&e.id, e.confidence)).collect();
        assert_eq!(eids_a, eids_b);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let ctx = test_context().await;
        assert!(matches!(
            ingest_document(&ctx, request("", "text")).await,
            Err(GraphLoomError::Validation(_))
        ));
        assert!(matches!(
            ingest_document(&ctx, request("d1", "   ")).await,
            Err(GraphLoomError::Validation(_))
        ));
    }
}
