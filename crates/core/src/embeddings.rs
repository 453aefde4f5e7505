use crate::models::{ClassificationRecord, EmbeddingSpace, EmbeddingVector};
use providers::{EmbeddingConfig, EmbeddingProvider, ProviderError};
use std::sync::Arc;

/// An embedding engine bound to the space its vectors belong to.
#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    space: EmbeddingSpace,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, space: EmbeddingSpace) -> Self {
        Self { provider, space }
    }

    pub fn from_config(cfg: &EmbeddingConfig) -> Result<Self, ProviderError> {
        Ok(Self::new(
            providers::build_embedder(cfg)?,
            EmbeddingSpace {
                model: cfg.model.clone(),
                version: cfg.version.clone(),
                dimension: cfg.dimension,
            },
        ))
    }

    pub fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    pub async fn embed_one(&self, text: &str) -> Result<EmbeddingVector, ProviderError> {
        let resp = self.provider.embed(&[text.to_string()]).await?;
        let values = resp.vectors.into_iter().next().ok_or_else(|| {
            ProviderError::TransportFailure("embedding response contained no vectors".into())
        })?;
        Ok(EmbeddingVector {
            space: self.space.clone(),
            values,
        })
    }
}

/// Labelled text a record is embedded from. Field order is fixed so identical
/// records always embed identically.
pub fn canonical_text(record: &ClassificationRecord) -> String {
    let mut parts = vec![format!("Business Purpose: {}", record.purpose)];
    if !record.rules.is_empty() {
        parts.push(format!("Business Rules: {}", record.rules.join(", ")));
    }
    if !record.workflows.is_empty() {
        parts.push(format!("Workflows: {}", record.workflows.join(", ")));
    }
    if !record.integration_points.is_empty() {
        parts.push(format!(
            "Integration Points: {}",
            record.integration_points.join(", ")
        ));
    }
    parts.push(format!("File: {}", record.path));
    parts.push(format!("Project: {}", record.project));
    parts.join(" | ")
}
