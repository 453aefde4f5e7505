use super::{
    check_space, cosine_similarity, rank, KnowledgeStore, MetadataFilter, ScoredRecord,
    StoreError, StoredEntry,
};
use crate::models::{ClassificationRecord, EmbeddingSpace, EmbeddingVector, RecordKey};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Default)]
struct State {
    space: Option<EmbeddingSpace>,
    entries: HashMap<RecordKey, StoredEntry>,
}

/// Process-local store. Readers take a snapshot `Arc` and never observe a
/// half-applied write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Arc<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Result<Arc<State>, StoreError> {
        self.state
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| StoreError::ConnectionFailure("memory store lock poisoned".into()))
    }

    fn write<T>(
        &self,
        key: &RecordKey,
        f: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.state.write().map_err(|_| StoreError::WriteConflict {
            key: key.to_string(),
            reason: "memory store lock poisoned".into(),
        })?;
        f(Arc::make_mut(&mut guard))
    }
}

#[async_trait::async_trait]
impl KnowledgeStore for MemoryStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        vector: &EmbeddingVector,
        record: &ClassificationRecord,
    ) -> Result<(), StoreError> {
        self.write(key, |state| {
            check_space(state.space.as_ref(), vector)?;
            if state.space.is_none() {
                state.space = Some(vector.space.clone());
            }
            state.entries.insert(
                key.clone(),
                StoredEntry {
                    vector: vector.clone(),
                    record: record.clone(),
                },
            );
            Ok(())
        })
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StoredEntry>, StoreError> {
        Ok(self.snapshot()?.entries.get(key).cloned())
    }

    async fn query(
        &self,
        vector: &EmbeddingVector,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let state = self.snapshot()?;
        check_space(state.space.as_ref(), vector)?;
        let hits = state
            .entries
            .values()
            .filter(|e| filter.matches(&e.record))
            .map(|e| ScoredRecord {
                record: e.record.clone(),
                score: cosine_similarity(&vector.values, &e.vector.values),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.write(key, |state| Ok(state.entries.remove(key).is_some()))
    }

    async fn records(&self, filter: &MetadataFilter) -> Result<Vec<ClassificationRecord>, StoreError> {
        let state = self.snapshot()?;
        let mut out: Vec<ClassificationRecord> = state
            .entries
            .values()
            .filter(|e| filter.matches(&e.record))
            .map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.provider.cmp(&b.provider)));
        Ok(out)
    }

    async fn space(&self) -> Result<Option<EmbeddingSpace>, StoreError> {
        Ok(self.snapshot()?.space.clone())
    }
}
