//! Similarity-searchable store of classification records and their vectors.

use crate::models::{ClassificationRecord, EmbeddingSpace, EmbeddingVector, FileKind, RecordKey};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod memory;
pub mod qdrant;
pub mod sqlite;

pub use memory::MemoryStore;
pub use qdrant::QdrantStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {key}: {reason}")]
    WriteConflict { key: String, reason: String },
    #[error("store connection failure: {0}")]
    ConnectionFailure(String),
    #[error("vector dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector from {incoming} cannot join a store built with {stored}")]
    SpaceMismatch {
        stored: EmbeddingSpace,
        incoming: EmbeddingSpace,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub provider: Option<String>,
    pub file_kind: Option<FileKind>,
    pub project: Option<String>,
    pub path: Option<String>,
}

impl MetadataFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn file_kind(mut self, kind: FileKind) -> Self {
        self.file_kind = Some(kind);
        self
    }

    pub fn project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn matches(&self, record: &ClassificationRecord) -> bool {
        self.provider.as_ref().map_or(true, |p| *p == record.provider)
            && self.file_kind.map_or(true, |k| k == record.file_kind)
            && self.project.as_ref().map_or(true, |p| *p == record.project)
            && self.path.as_ref().map_or(true, |p| *p == record.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub vector: EmbeddingVector,
    pub record: ClassificationRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub record: ClassificationRecord,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_provider: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub by_project: BTreeMap<String, usize>,
    pub average_confidence: f32,
}

impl StoreStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ClassificationRecord>) -> Self {
        let mut stats = StoreStats::default();
        let mut confidence_sum = 0.0f64;
        for r in records {
            stats.total += 1;
            *stats.by_provider.entry(r.provider.clone()).or_default() += 1;
            *stats.by_kind.entry(r.file_kind.to_string()).or_default() += 1;
            *stats.by_project.entry(r.project.clone()).or_default() += 1;
            confidence_sum += f64::from(r.confidence);
        }
        if stats.total > 0 {
            stats.average_confidence = (confidence_sum / stats.total as f64) as f32;
        }
        stats
    }
}

#[async_trait::async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Atomically replaces whatever is stored under `key`.
    async fn upsert(
        &self,
        key: &RecordKey,
        vector: &EmbeddingVector,
        record: &ClassificationRecord,
    ) -> Result<(), StoreError>;

    async fn get(&self, key: &RecordKey) -> Result<Option<StoredEntry>, StoreError>;

    /// Top `k` records by descending similarity, ties broken by most recent timestamp.
    async fn query(
        &self,
        vector: &EmbeddingVector,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    /// Returns whether anything was removed.
    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError>;

    async fn records(&self, filter: &MetadataFilter) -> Result<Vec<ClassificationRecord>, StoreError>;

    /// Space of the vectors already written, `None` for an empty store.
    async fn space(&self) -> Result<Option<EmbeddingSpace>, StoreError>;

    async fn contains(&self, key: &RecordKey) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let records = self.records(&MetadataFilter::all()).await?;
        Ok(StoreStats::from_records(&records))
    }
}

/// Rejects a vector that cannot live next to vectors of `stored`.
pub fn check_space(
    stored: Option<&EmbeddingSpace>,
    vector: &EmbeddingVector,
) -> Result<(), StoreError> {
    if vector.dimension() != vector.space.dimension {
        return Err(StoreError::DimensionMismatch {
            expected: vector.space.dimension,
            actual: vector.dimension(),
        });
    }
    if let Some(stored) = stored {
        if stored.dimension != vector.space.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: stored.dimension,
                actual: vector.space.dimension,
            });
        }
        if stored != &vector.space {
            return Err(StoreError::SpaceMismatch {
                stored: stored.clone(),
                incoming: vector.space.clone(),
            });
        }
    }
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Orders by descending score then most recent timestamp, keeping `k`.
pub fn rank(mut hits: Vec<ScoredRecord>, k: usize) -> Vec<ScoredRecord> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.record.timestamp.cmp(&a.record.timestamp))
    });
    hits.truncate(k);
    hits
}
