use chrono::{DateTime, Utc};
use providers::Classification;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use providers::FileKind;

/// One ingested artifact. Re-derived on every ingestion pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub relative_path: String,
    pub project: String,
    pub kind: FileKind,
    pub content: String,
    pub fingerprint: String,
}

impl SourceFile {
    /// Builds a file from in-memory content, fingerprinting it.
    pub fn new(path: &str, project: &str, kind: FileKind, content: String) -> Self {
        Self {
            path: path.to_string(),
            relative_path: path.to_string(),
            project: project.to_string(),
            kind,
            fingerprint: fingerprint(content.as_bytes()),
            content,
        }
    }
}

pub fn fingerprint(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub fingerprint: String,
    pub provider: String,
}

impl RecordKey {
    pub fn new(fingerprint: &str, provider: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            provider: provider.to_string(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.fingerprint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub fingerprint: String,
    pub provider: String,
    pub path: String,
    pub project: String,
    pub file_kind: FileKind,
    pub purpose: String,
    pub rules: Vec<String>,
    pub workflows: Vec<String>,
    pub integration_points: Vec<String>,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn from_classification(
        file: &SourceFile,
        provider: &str,
        classification: Classification,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: file.fingerprint.clone(),
            provider: provider.to_string(),
            path: file.relative_path.clone(),
            project: file.project.clone(),
            file_kind: file.kind,
            purpose: classification.purpose,
            rules: classification.rules,
            workflows: classification.workflows,
            integration_points: classification.integration_points,
            confidence: classification.confidence,
            timestamp,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.fingerprint, &self.provider)
    }
}

/// Identity of an embedding function. Vectors from different spaces never mix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub model: String,
    pub version: String,
    pub dimension: usize,
}

impl fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.model, self.version, self.dimension)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub space: EmbeddingSpace,
    pub values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}
