use crate::config::{AppConfig, StoreBackend, StoreConfig};
use crate::embeddings::Embedder;
use crate::indexer::Indexer;
use crate::knowledge::{
    KnowledgeStore, MemoryStore, MetadataFilter, QdrantStore, SqliteStore, StoreStats,
};
use crate::models::ClassificationRecord;
use crate::orchestrator::{JobReport, Orchestrator};
use crate::retrieval::Retriever;
use anyhow::Context;
use providers::{ClassificationProvider, EmbeddingConfig, ProviderRegistry, TargetSchema};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn build_store(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn KnowledgeStore>> {
    let store: Arc<dyn KnowledgeStore> = match cfg.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => {
            let path = cfg.path.as_deref().context("store.path is required for sqlite")?;
            Arc::new(SqliteStore::open(path).await.context("open sqlite store")?)
        }
        StoreBackend::Qdrant => {
            let url = cfg.url.as_deref().context("store.url is required for qdrant")?;
            let collection = cfg
                .collection
                .as_deref()
                .context("store.collection is required for qdrant")?;
            Arc::new(QdrantStore::new(url, collection, cfg.api_key.clone()))
        }
    };
    info!(backend = ?cfg.backend, "knowledge store ready");
    Ok(store)
}

pub fn build_embedder(cfg: &EmbeddingConfig) -> anyhow::Result<Embedder> {
    Embedder::from_config(cfg).context("configure embedding provider")
}

pub fn build_registry(cfg: &AppConfig) -> ProviderRegistry {
    let registry = ProviderRegistry::from_configs(&cfg.providers);
    match (&cfg.default_provider, cfg.providers.as_slice()) {
        (Some(name), _) => registry.set_preferred_classifier(name),
        (None, [only]) => registry.set_preferred_classifier(&only.name),
        _ => registry,
    }
}

/// Indexing pass with a configured provider (`None` picks the default).
/// Empty `roots` means a full pass over the configured roots; otherwise only
/// `roots` are indexed and nothing outside them is pruned.
pub async fn run_index(
    cfg: &AppConfig,
    provider: Option<&str>,
    roots: &[String],
    cancel: CancellationToken,
) -> anyhow::Result<JobReport> {
    let provider = build_registry(cfg)
        .classifier(provider)
        .context("select classification provider")?;
    let store = build_store(&cfg.store).await?;
    if roots.is_empty() {
        run_index_with(cfg, provider, store, cancel).await
    } else {
        run_roots_with(cfg, roots, provider, store, cancel).await
    }
}

pub async fn run_index_with(
    cfg: &AppConfig,
    provider: Arc<dyn ClassificationProvider>,
    store: Arc<dyn KnowledgeStore>,
    cancel: CancellationToken,
) -> anyhow::Result<JobReport> {
    orchestrator(cfg, provider, store)?
        .run_full_pass(&cfg.ingest, cancel)
        .await
}

pub async fn run_roots_with(
    cfg: &AppConfig,
    roots: &[String],
    provider: Arc<dyn ClassificationProvider>,
    store: Arc<dyn KnowledgeStore>,
    cancel: CancellationToken,
) -> anyhow::Result<JobReport> {
    let mut ingest = cfg.ingest.clone();
    ingest.roots = roots.to_vec();
    orchestrator(cfg, provider, store)?
        .run_partial_pass(&ingest, cancel)
        .await
}

fn orchestrator(
    cfg: &AppConfig,
    provider: Arc<dyn ClassificationProvider>,
    store: Arc<dyn KnowledgeStore>,
) -> anyhow::Result<Orchestrator> {
    let indexer = Indexer::new(build_embedder(&cfg.embeddings)?, store);
    Ok(Orchestrator::new(
        provider,
        indexer,
        TargetSchema::business_semantics(),
        cfg.job.clone(),
    ))
}

pub async fn open_retriever(cfg: &AppConfig) -> anyhow::Result<Retriever> {
    let store = build_store(&cfg.store).await?;
    open_retriever_with(cfg, store)
}

pub fn open_retriever_with(
    cfg: &AppConfig,
    store: Arc<dyn KnowledgeStore>,
) -> anyhow::Result<Retriever> {
    Ok(Retriever::new(
        build_embedder(&cfg.embeddings)?,
        store,
        cfg.retrieval.clone(),
    ))
}

pub async fn stats(cfg: &AppConfig) -> anyhow::Result<StoreStats> {
    let store = build_store(&cfg.store).await?;
    Ok(store.stats().await?)
}

/// Every stored record passing `filter`, ordered by path then provider.
pub async fn export(
    cfg: &AppConfig,
    filter: &MetadataFilter,
) -> anyhow::Result<Vec<ClassificationRecord>> {
    let store = build_store(&cfg.store).await?;
    let records = store.records(filter).await?;
    info!(records = records.len(), "records exported");
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::from_toml_str;

    fn config(extra: &str) -> AppConfig {
        let doc = format!(
            r#"
            {extra}
            [ingest]
            roots = ["."]

            [[providers]]
            name = "local"
            kind = "ollama"
            model = "codellama:7b"
            timeout_ms = 1000

            [job]
            batch_size = 10
            concurrency = 2
            max_attempts = 2
            backoff_base_ms = 1
            backoff_max_ms = 10

            [embeddings]
            provider = "hashing"
            model = "feature-hash"
            version = "1"
            dimension = 64

            [store]
            backend = "memory"

            [retrieval]
            top_k = 3
            score_threshold = 0.1
            "#
        );
        from_toml_str(&doc, |_| None).unwrap()
    }

    #[test]
    fn single_provider_becomes_default() {
        let registry = build_registry(&config(""));
        assert_eq!(registry.preferred_classifier.as_deref(), Some("local"));
        assert!(registry.classifier(None).is_ok());
        assert!(registry.classifier(Some("missing")).is_err());
    }

    #[tokio::test]
    async fn memory_store_starts_empty() {
        let cfg = config("");
        let stats = stats(&cfg).await.unwrap();
        assert_eq!(stats.total, 0);
        let retriever = open_retriever(&cfg).await.unwrap();
        let hits = retriever
            .retrieve("loyalty", &crate::knowledge::MetadataFilter::all())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
