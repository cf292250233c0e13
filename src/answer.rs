//! Grounded answer synthesis.
//!
//! Retrieves top-K context via the retrieval engine, builds a prompt from
//! the chunk passages, and asks the configured LLM for an answer grounded
//! in that context. Two degraded modes are first-class:
//!
//! - no LLM configured → empty `answer_text` with the retrieved
//!   `contributing_node_ids` intact (retrieval-only mode);
//! - provider failure → empty `answer_text` plus an error tag, never a
//!   surfaced exception.

use std::time::Instant;

use serde::Serialize;

use crate::context::GraphLoomContext;
use crate::error::Result;
use crate::retrieval::{self, CancelToken, QueryFilters, QueryMode, QueryRequest, QueryResponse};

/// Passages included in the synthesis prompt.
const CONTEXT_PASSAGES: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResponse {
    pub answer_text: String,
    /// Chunk node ids actually referenced in the synthesis prompt,
    /// deduplicated with order preserved.
    pub contributing_node_ids: Vec<String>,
    pub retrieval: QueryResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn answer(
    ctx: &GraphLoomContext,
    question: &str,
    namespace: Option<&str>,
    top_k: usize,
) -> Result<AnswerResponse> {
    let started = Instant::now();
    ctx.metrics
        .answer_requests
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let request = QueryRequest {
        query: question.to_string(),
        namespace: namespace.map(|s| s.to_string()),
        mode: QueryMode::Auto,
        top_k,
        filters: QueryFilters::default(),
    };
    let retrieved = retrieval::query(ctx, &request, &CancelToken::new()).await?;

    let mut contributing_node_ids: Vec<String> = Vec::new();
    let mut context_blocks: Vec<&str> = Vec::new();
    for passage in retrieved.passages.iter().take(CONTEXT_PASSAGES) {
        if !contributing_node_ids.contains(&passage.node_id) {
            contributing_node_ids.push(passage.node_id.clone());
            context_blocks.push(&passage.text);
        }
    }

    let (answer_text, error) = match (&ctx.llm, context_blocks.is_empty()) {
        (Some(client), false) => {
            let system = "You answer questions using only the provided context. \
                          If the context is insufficient, say so briefly.";
            let user = format!(
                "CONTEXT\n{}\n\nQUESTION\n{}\n\nAnswer concisely using only the context above.",
                context_blocks.join("\n---\n"),
                question
            );
            match client.chat(system, &user, Some(600)).await {
                Ok(text) => (text.trim().to_string(), None),
                Err(e) => {
                    tracing::warn!(error = %e, "answer synthesis failed");
                    (String::new(), Some(e.kind().to_string()))
                }
            }
        }
        // Retrieval-only mode: no LLM, or nothing to ground an answer in.
        _ => (String::new(), None),
    };

    ctx.metrics
        .record_latency("answer", started.elapsed().as_secs_f64());

    Ok(AnswerResponse {
        answer_text,
        contributing_node_ids,
        retrieval: retrieved,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::ingest::{ingest_document, IngestRequest};

    #[tokio::test]
    async fn test_retrieval_only_mode() {
        let ctx = test_context().await;
        ingest_document(
            &ctx,
            IngestRequest {
                doc_id: "d1".to_string(),
                text: "Kafka streams events between services at Acme Corp.".to_string(),
                namespace: None,
                metadata: None,
                force_heuristic: true,
                disable_embeddings: true,
            },
        )
        .await
        .unwrap();

        let response = answer(&ctx, "Kafka", None, 5).await.unwrap();
        // No LLM configured: empty answer, but contributing ids populated
        // from the retrieved chunks.
        assert!(response.answer_text.is_empty());
        assert!(response.error.is_none());
        assert!(!response.contributing_node_ids.is_empty());
        assert!(response.contributing_node_ids[0].starts_with("public:d1:"));
    }

    #[tokio::test]
    async fn test_empty_graph_answer() {
        let ctx = test_context().await;
        let response = answer(&ctx, "anything", None, 5).await.unwrap();
        assert!(response.answer_text.is_empty());
        assert!(response.contributing_node_ids.is_empty());
    }
}
