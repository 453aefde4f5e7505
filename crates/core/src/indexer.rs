use crate::embeddings::{canonical_text, Embedder};
use crate::knowledge::{KnowledgeStore, MetadataFilter, StoreError};
use crate::models::{ClassificationRecord, RecordKey};
use providers::ProviderError;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding failed: {0}")]
    Embedding(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns classification records into searchable knowledge entries.
#[derive(Clone)]
pub struct Indexer {
    embedder: Embedder,
    store: Arc<dyn KnowledgeStore>,
}

impl Indexer {
    pub fn new(embedder: Embedder, store: Arc<dyn KnowledgeStore>) -> Self {
        Self { embedder, store }
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub async fn contains(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.store.contains(key).await
    }

    /// Embeds and writes `record` under its (fingerprint, provider) key.
    pub async fn index(&self, record: &ClassificationRecord) -> Result<(), IndexError> {
        let key = record.key();
        let vector = self.embedder.embed_one(&canonical_text(record)).await?;
        if vector.dimension() != self.embedder.space().dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.embedder.space().dimension,
                actual: vector.dimension(),
            }
            .into());
        }
        self.store.upsert(&key, &vector, record).await?;
        debug!(key = %key, path = %record.path, "indexed record");
        Ok(())
    }

    /// Drops older records of `record`'s path from the same provider.
    /// Records whose fingerprint is in `live` stay: identical content elsewhere
    /// in the ingestion set still resolves to them.
    pub async fn supersede(
        &self,
        record: &ClassificationRecord,
        live: &HashSet<String>,
    ) -> Result<usize, StoreError> {
        let same_path = MetadataFilter::all()
            .provider(&record.provider)
            .path(&record.path);
        let mut dropped = 0;
        for stale in self.store.records(&same_path).await? {
            if stale.fingerprint == record.fingerprint || live.contains(&stale.fingerprint) {
                continue;
            }
            let stale_key = stale.key();
            if self.store.delete(&stale_key).await? {
                debug!(key = %stale_key, "superseded record dropped");
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// Removes records of `provider` whose fingerprint is not in `live`.
    pub async fn prune(&self, provider: &str, live: &HashSet<String>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for record in self.store.records(&MetadataFilter::all().provider(provider)).await? {
            if !live.contains(&record.fingerprint) && self.store.delete(&record.key()).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(provider, removed, "pruned stale records");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::MemoryStore;
    use crate::models::{EmbeddingSpace, FileKind};
    use async_trait::async_trait;
    use chrono::Utc;
    use providers::hashing::HashingEmbedder;
    use providers::{EmbedResponse, EmbeddingProvider};

    fn space(dim: usize) -> EmbeddingSpace {
        EmbeddingSpace { model: "feature-hash".into(), version: "1".into(), dimension: dim }
    }

    fn indexer(store: Arc<MemoryStore>) -> Indexer {
        Indexer::new(
            Embedder::new(Arc::new(HashingEmbedder::new(64)), space(64)),
            store,
        )
    }

    fn record(fp: &str, provider: &str, path: &str) -> ClassificationRecord {
        ClassificationRecord {
            fingerprint: fp.into(),
            provider: provider.into(),
            path: path.into(),
            project: "Loyalty".into(),
            file_kind: FileKind::Code,
            purpose: "Award loyalty points".into(),
            rules: vec![],
            workflows: vec![],
            integration_points: vec![],
            confidence: 0.8,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn new_content_supersedes_old_record_of_same_path() {
        let store = Arc::new(MemoryStore::new());
        let idx = indexer(store.clone());
        let old = record("h1", "P1", "Loyalty/LoyaltyRule.cs");
        let other_provider = record("h1", "P2", "Loyalty/LoyaltyRule.cs");
        idx.index(&old).await.unwrap();
        idx.index(&other_provider).await.unwrap();

        let new = record("h2", "P1", "Loyalty/LoyaltyRule.cs");
        idx.index(&new).await.unwrap();
        let live: HashSet<String> = ["h2".to_string()].into_iter().collect();
        assert_eq!(idx.supersede(&new, &live).await.unwrap(), 1);

        assert!(!store.contains(&old.key()).await.unwrap());
        assert!(store.contains(&new.key()).await.unwrap());
        assert!(store.contains(&other_provider.key()).await.unwrap());
    }

    #[tokio::test]
    async fn supersede_keeps_content_still_present_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let idx = indexer(store.clone());
        // A.cs and B.cs had identical content; the shared record names A.cs.
        let shared = record("same", "P1", "A.cs");
        idx.index(&shared).await.unwrap();

        let edited = record("edited", "P1", "A.cs");
        idx.index(&edited).await.unwrap();
        let live: HashSet<String> = ["edited".to_string(), "same".to_string()]
            .into_iter()
            .collect();
        assert_eq!(idx.supersede(&edited, &live).await.unwrap(), 0);
        assert!(store.contains(&shared.key()).await.unwrap());
        assert!(store.contains(&edited.key()).await.unwrap());
    }

    #[tokio::test]
    async fn prune_keeps_live_and_other_providers() {
        let store = Arc::new(MemoryStore::new());
        let idx = indexer(store.clone());
        idx.index(&record("a", "P1", "a.cs")).await.unwrap();
        idx.index(&record("b", "P1", "b.cs")).await.unwrap();
        idx.index(&record("b", "P2", "b.cs")).await.unwrap();

        let live: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(idx.prune("P1", &live).await.unwrap(), 1);
        assert!(store.contains(&RecordKey::new("a", "P1")).await.unwrap());
        assert!(!store.contains(&RecordKey::new("b", "P1")).await.unwrap());
        assert!(store.contains(&RecordKey::new("b", "P2")).await.unwrap());
    }

    struct Short;

    #[async_trait]
    impl EmbeddingProvider for Short {
        async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
            Ok(EmbedResponse { vectors: texts.iter().map(|_| vec![1.0; 3]).collect() })
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_not_written() {
        let store = Arc::new(MemoryStore::new());
        let idx = Indexer::new(Embedder::new(Arc::new(Short), space(4)), store.clone());
        let r = record("a", "P1", "a.cs");
        let err = idx.index(&r).await.unwrap_err();
        assert!(matches!(
            err,
            IndexError::Store(StoreError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(!store.contains(&r.key()).await.unwrap());
    }
}
