use crate::config::RetrievalConfig;
use crate::embeddings::Embedder;
use crate::knowledge::{KnowledgeStore, MetadataFilter, ScoredRecord, StoreError};
use crate::models::EmbeddingSpace;
use providers::ProviderError;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("store was built with {stored} but the active embedder is {active}")]
    EmbeddingSpaceMismatch {
        stored: EmbeddingSpace,
        active: EmbeddingSpace,
    },
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Similarity search over the knowledge store using the indexing embedder.
#[derive(Clone)]
pub struct Retriever {
    embedder: Embedder,
    store: Arc<dyn KnowledgeStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(embedder: Embedder, store: Arc<dyn KnowledgeStore>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        request: &str,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, RetrievalError> {
        self.retrieve_top(request, self.config.top_k, filter).await
    }

    pub async fn retrieve_top(
        &self,
        request: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, RetrievalError> {
        let Some(stored) = self.store.space().await? else {
            debug!("knowledge store is empty");
            return Ok(Vec::new());
        };
        if &stored != self.embedder.space() {
            return Err(RetrievalError::EmbeddingSpaceMismatch {
                stored,
                active: self.embedder.space().clone(),
            });
        }
        let vector = self.embedder.embed_one(request).await?;
        let threshold = self.config.score_threshold;
        let hits: Vec<ScoredRecord> = self
            .store
            .query(&vector, k, filter)
            .await?
            .into_iter()
            .filter(|h| h.score >= threshold)
            .collect();
        debug!(hits = hits.len(), k, threshold, "retrieval finished");
        Ok(hits)
    }

    pub async fn context(
        &self,
        request: &str,
        filter: &MetadataFilter,
    ) -> Result<String, RetrievalError> {
        let hits = self.retrieve(request, filter).await?;
        Ok(context_summary(&hits, self.config.context_max_chars))
    }
}

/// Renders hits grouped by project as prompt context for downstream generation.
pub fn context_summary(hits: &[ScoredRecord], max_chars: usize) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut by_project: BTreeMap<&str, Vec<&ScoredRecord>> = BTreeMap::new();
    for hit in hits {
        by_project.entry(hit.record.project.as_str()).or_default().push(hit);
    }

    let mut out = String::new();
    for (project, hits) in by_project {
        out.push_str(&format!("## Project: {project}\n"));
        for hit in hits {
            let r = &hit.record;
            out.push_str(&format!("- {} (score {:.2})\n", r.path, hit.score));
            out.push_str(&format!("  Purpose: {}\n", r.purpose));
            if !r.rules.is_empty() {
                let rules: Vec<&str> = r.rules.iter().take(3).map(String::as_str).collect();
                out.push_str(&format!("  Rules: {}\n", rules.join("; ")));
            }
            if !r.integration_points.is_empty() {
                let points: Vec<&str> = r
                    .integration_points
                    .iter()
                    .take(3)
                    .map(String::as_str)
                    .collect();
                out.push_str(&format!("  Integrations: {}\n", points.join(", ")));
            }
        }
        out.push('\n');
    }

    if out.chars().count() > max_chars {
        let mut cut: String = out.chars().take(max_chars).collect();
        cut.push_str(TRUNCATION_MARKER);
        return cut;
    }
    out
}
