use anyhow::{ensure, Context};
use providers::{EmbeddingConfig, ProviderConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub ingest: IngestConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub default_provider: Option<String>,
    pub job: JobConfig,
    pub embeddings: EmbeddingConfig,
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub roots: Vec<String>,
    #[serde(default = "default_code_extensions")]
    pub code_extensions: Vec<String>,
    #[serde(default = "default_config_extensions")]
    pub config_extensions: Vec<String>,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
}

fn default_code_extensions() -> Vec<String> {
    ["cs", "rs", "py", "ts", "js", "java", "go", "kt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_config_extensions() -> Vec<String> {
    ["json", "yaml", "yml", "toml", "xml", "config"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_excludes() -> Vec<String> {
    [
        "**/bin/**",
        "**/obj/**",
        "**/target/**",
        "**/node_modules/**",
        "**/.git/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl IngestConfig {
    pub fn for_roots(roots: &[&str]) -> Self {
        Self {
            roots: roots.iter().map(|s| s.to_string()).collect(),
            code_extensions: default_code_extensions(),
            config_extensions: default_config_extensions(),
            exclude: default_excludes(),
            max_file_bytes: None,
        }
    }
}

/// Batch parameters handed to the orchestrator at job start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// SQLite path or URL.
    #[serde(default)]
    pub path: Option<String>,
    /// Qdrant base URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub score_threshold: f32,
    #[serde(default = "default_context_chars")]
    pub context_max_chars: usize,
}

fn default_context_chars() -> usize {
    8000
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }
    settings = settings.add_source(
        config::Environment::with_prefix("SEMANTIC")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: AppConfig = settings
        .build()?
        .try_deserialize()
        .context("invalid configuration")?;
    finish(cfg, |name| std::env::var(name).ok())
}

/// Parses a TOML document without touching files or the environment.
pub fn from_toml_str(
    toml: &str,
    secrets: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<AppConfig> {
    let cfg: AppConfig = config::Config::builder()
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
        .context("invalid configuration")?;
    finish(cfg, secrets)
}

fn finish(
    mut cfg: AppConfig,
    secrets: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<AppConfig> {
    resolve_secrets(&mut cfg, &secrets);
    validate(&cfg)?;
    Ok(cfg)
}

fn resolve_secrets(cfg: &mut AppConfig, secrets: &impl Fn(&str) -> Option<String>) {
    let resolve = |key: &mut Option<String>, env: &Option<String>| {
        if key.is_none() {
            if let Some(name) = env {
                *key = secrets(name);
            }
        }
    };
    for p in &mut cfg.providers {
        resolve(&mut p.api_key, &p.api_key_env);
    }
    resolve(&mut cfg.embeddings.api_key, &cfg.embeddings.api_key_env);
    resolve(&mut cfg.store.api_key, &cfg.store.api_key_env);
}

pub fn validate(cfg: &AppConfig) -> anyhow::Result<()> {
    ensure!(cfg.job.batch_size >= 1, "job.batch_size must be at least 1");
    ensure!(cfg.job.concurrency >= 1, "job.concurrency must be at least 1");
    ensure!(cfg.job.max_attempts >= 1, "job.max_attempts must be at least 1");
    ensure!(
        cfg.job.backoff_base_ms <= cfg.job.backoff_max_ms,
        "job.backoff_base_ms exceeds job.backoff_max_ms"
    );
    ensure!(cfg.embeddings.dimension > 0, "embeddings.dimension must be positive");
    ensure!(
        (-1.0..=1.0).contains(&cfg.retrieval.score_threshold),
        "retrieval.score_threshold must be within -1..=1"
    );
    ensure!(cfg.retrieval.top_k >= 1, "retrieval.top_k must be at least 1");
    let mut names: Vec<&str> = cfg.providers.iter().map(|p| p.name.as_str()).collect();
    names.sort_unstable();
    let before = names.len();
    names.dedup();
    ensure!(names.len() == before, "provider names must be unique");
    if let Some(default) = &cfg.default_provider {
        ensure!(
            names.contains(&default.as_str()),
            "default_provider `{default}` is not configured"
        );
    }
    match cfg.store.backend {
        StoreBackend::Sqlite => ensure!(cfg.store.path.is_some(), "store.path is required for sqlite"),
        StoreBackend::Qdrant => ensure!(
            cfg.store.url.is_some() && cfg.store.collection.is_some(),
            "store.url and store.collection are required for qdrant"
        ),
        StoreBackend::Memory => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use providers::{EmbeddingEngineKind, EngineKind};

    const SAMPLE: &str = r#"
        default_provider = "claude"

        [ingest]
        roots = ["./services"]

        [[providers]]
        name = "claude"
        kind = "anthropic"
        model = "claude-3-5-sonnet-20241022"
        api_key_env = "TEST_ANTHROPIC_KEY"
        timeout_ms = 60000
        rate_limit = { requests_per_minute = 50, burst = 5 }

        [[providers]]
        name = "local"
        kind = "ollama"
        model = "codellama:7b"
        timeout_ms = 120000

        [job]
        batch_size = 25
        concurrency = 4
        max_attempts = 3
        backoff_base_ms = 500
        backoff_max_ms = 8000

        [embeddings]
        provider = "hashing"
        model = "feature-hash"
        version = "1"
        dimension = 256

        [store]
        backend = "sqlite"
        path = "./knowledge.db"

        [retrieval]
        top_k = 5
        score_threshold = 0.2
    "#;

    #[test]
    fn parses_full_document_and_resolves_secrets() {
        let cfg = from_toml_str(SAMPLE, |name| {
            (name == "TEST_ANTHROPIC_KEY").then(|| "sk-ant".to_string())
        })
        .unwrap();
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[0].kind, EngineKind::Anthropic);
        assert_eq!(cfg.providers[0].api_key.as_deref(), Some("sk-ant"));
        assert_eq!(cfg.providers[0].rate_limit.requests_per_minute, 50);
        assert_eq!(cfg.providers[1].api_key, None);
        assert_eq!(cfg.embeddings.provider, EmbeddingEngineKind::Hashing);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.retrieval.context_max_chars, 8000);
        assert!(cfg.ingest.code_extensions.contains(&"cs".to_string()));
        assert!(cfg.ingest.exclude.contains(&"**/obj/**".to_string()));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let doc = SAMPLE.replace("concurrency = 4", "concurrency = 0");
        let err = from_toml_str(&doc, |_| None).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn rejects_unknown_default_provider() {
        let doc = SAMPLE.replace("default_provider = \"claude\"", "default_provider = \"gpt\"");
        assert!(from_toml_str(&doc, |_| None).is_err());
    }

    #[test]
    fn sqlite_backend_needs_a_path() {
        let doc = SAMPLE.replace("path = \"./knowledge.db\"", "");
        assert!(from_toml_str(&doc, |_| None).is_err());
    }
}
