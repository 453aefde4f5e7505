//! Provider abstractions for reasoning engines and embeddings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod anthropic;
pub mod guard;
pub mod hashing;
mod http;
pub mod limiter;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod qdrant;
pub mod schema;

pub use schema::{Classification, TargetSchema, ValidationError};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("provider call timed out")]
    Timeout,
    #[error("malformed output: {0}")]
    MalformedOutput(#[from] ValidationError),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout
                | ProviderError::TransportFailure(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Declared type of a source artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Code,
    Configuration,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Code => "code",
            FileKind::Configuration => "configuration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "code" => Some(FileKind::Code),
            "configuration" | "config" => Some(FileKind::Configuration),
            _ => None,
        }
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifyRequest<'a> {
    pub path: &'a str,
    pub project: &'a str,
    pub kind: FileKind,
    pub content: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
}

/// One interchangeable reasoning engine.
#[async_trait::async_trait]
pub trait ClassificationProvider: Send + Sync {
    /// Identifier stamped on every record this provider produces.
    fn name(&self) -> &str;

    async fn classify(
        &self,
        request: &ClassifyRequest<'_>,
        schema: &TargetSchema,
    ) -> Result<Classification, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Openai,
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Zero disables admission control.
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: EngineKind,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable the configuration loader reads `api_key` from.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    1000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingEngineKind {
    Hashing,
    Openai,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingEngineKind,
    pub model: String,
    pub version: String,
    pub dimension: usize,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Per-call limit for remote engines; the local hashing engine ignores it.
    #[serde(default = "default_embed_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_embed_timeout_ms() -> u64 {
    30_000
}

/// Builds the engine described by `cfg`, wrapped with its timeout and rate limit.
pub fn build_classifier(
    cfg: &ProviderConfig,
) -> Result<Arc<dyn ClassificationProvider>, ProviderError> {
    let timeout = Duration::from_millis(cfg.timeout_ms);
    let limiter = limiter::TokenBucket::from_config(&cfg.rate_limit).map(Arc::new);
    let provider: Arc<dyn ClassificationProvider> = match cfg.kind {
        EngineKind::Openai => {
            let api_key = require_key(cfg.api_key.as_deref(), &cfg.name)?;
            let engine = openai::OpenAiProvider::new(openai::OpenAiConfig {
                name: cfg.name.clone(),
                api_key,
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                embedding_model: String::new(),
                chat_model: cfg.model.clone(),
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
            });
            Arc::new(guard::Guarded::new(engine, limiter, timeout))
        }
        EngineKind::Anthropic => {
            let api_key = require_key(cfg.api_key.as_deref(), &cfg.name)?;
            let engine = anthropic::AnthropicProvider::new(anthropic::AnthropicConfig {
                name: cfg.name.clone(),
                api_key,
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
                model: cfg.model.clone(),
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
            });
            Arc::new(guard::Guarded::new(engine, limiter, timeout))
        }
        EngineKind::Ollama => {
            let engine = ollama::OllamaProvider::new(ollama::OllamaConfig {
                name: cfg.name.clone(),
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                chat_model: cfg.model.clone(),
                embedding_model: String::new(),
                temperature: cfg.temperature,
            });
            Arc::new(guard::Guarded::new(engine, limiter, timeout))
        }
    };
    Ok(provider)
}

pub fn build_embedder(cfg: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    let timeout = Duration::from_millis(cfg.timeout_ms);
    let provider: Arc<dyn EmbeddingProvider> = match cfg.provider {
        EmbeddingEngineKind::Hashing => Arc::new(hashing::HashingEmbedder::new(cfg.dimension)),
        EmbeddingEngineKind::Openai => {
            let api_key = require_key(cfg.api_key.as_deref(), "openai embeddings")?;
            let engine = openai::OpenAiProvider::new(openai::OpenAiConfig {
                name: "openai".to_string(),
                api_key,
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com".to_string()),
                embedding_model: cfg.model.clone(),
                chat_model: String::new(),
                temperature: default_temperature(),
                max_tokens: default_max_tokens(),
            });
            Arc::new(guard::Guarded::new(engine, None, timeout))
        }
        EmbeddingEngineKind::Ollama => {
            let engine = ollama::OllamaProvider::new(ollama::OllamaConfig {
                name: "ollama".to_string(),
                base_url: cfg
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                chat_model: String::new(),
                embedding_model: cfg.model.clone(),
                temperature: default_temperature(),
            });
            Arc::new(guard::Guarded::new(engine, None, timeout))
        }
    };
    Ok(provider)
}

fn require_key(key: Option<&str>, provider: &str) -> Result<String, ProviderError> {
    match key {
        Some(k) if !k.trim().is_empty() => Ok(k.to_string()),
        _ => Err(ProviderError::AuthFailure(format!(
            "no api key configured for {provider}"
        ))),
    }
}

/// Classifier lookup by name: injected instances first, then configured engines.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    classifiers: HashMap<String, Arc<dyn ClassificationProvider>>,
    configs: HashMap<String, ProviderConfig>,
    pub preferred_classifier: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[ProviderConfig]) -> Self {
        let mut reg = Self::new();
        for cfg in configs {
            reg = reg.with_config(cfg.clone());
        }
        reg
    }

    pub fn with_classifier(mut self, provider: Arc<dyn ClassificationProvider>) -> Self {
        self.classifiers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn with_config(mut self, cfg: ProviderConfig) -> Self {
        self.configs.insert(cfg.name.clone(), cfg);
        self
    }

    pub fn set_preferred_classifier(mut self, name: &str) -> Self {
        self.preferred_classifier = Some(name.to_string());
        self
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .classifiers
            .keys()
            .chain(self.configs.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn classifier(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn ClassificationProvider>, ProviderError> {
        let key = name
            .map(str::to_string)
            .or_else(|| self.preferred_classifier.clone())
            .ok_or_else(|| ProviderError::UnknownProvider("no provider selected".into()))?;
        if let Some(p) = self.classifiers.get(&key) {
            return Ok(p.clone());
        }
        match self.configs.get(&key) {
            Some(cfg) => build_classifier(cfg),
            None => Err(ProviderError::UnknownProvider(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait::async_trait]
    impl ClassificationProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn classify(
            &self,
            _request: &ClassifyRequest<'_>,
            _schema: &TargetSchema,
        ) -> Result<Classification, ProviderError> {
            Err(ProviderError::Timeout)
        }
    }

    fn ollama_cfg(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            kind: EngineKind::Ollama,
            model: "codellama:7b".to_string(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            temperature: 0.1,
            max_tokens: 1000,
            timeout_ms: 1000,
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[test]
    fn transient_errors_are_the_retryable_ones() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::TransportFailure("reset".into()).is_transient());
        assert!(!ProviderError::AuthFailure("bad key".into()).is_transient());
        assert!(!ProviderError::MalformedOutput(ValidationError::NotJson).is_transient());
        assert!(!ProviderError::Rejected("400".into()).is_transient());
    }

    #[test]
    fn registry_prefers_injected_instances() {
        let reg = ProviderRegistry::from_configs(&[ollama_cfg("local")])
            .with_classifier(Arc::new(Fixed))
            .set_preferred_classifier("fixed");
        assert_eq!(reg.classifier(None).unwrap().name(), "fixed");
        assert_eq!(reg.classifier(Some("local")).unwrap().name(), "local");
        assert_eq!(reg.names(), vec!["fixed".to_string(), "local".to_string()]);
    }

    #[test]
    fn registry_reports_unknown_names() {
        let reg = ProviderRegistry::new();
        assert!(matches!(
            reg.classifier(Some("missing")),
            Err(ProviderError::UnknownProvider(name)) if name == "missing"
        ));
        assert!(matches!(
            reg.classifier(None),
            Err(ProviderError::UnknownProvider(_))
        ));
    }

    #[test]
    fn cloud_engines_require_a_key() {
        let mut cfg = ollama_cfg("cloud");
        cfg.kind = EngineKind::Anthropic;
        assert!(matches!(
            build_classifier(&cfg),
            Err(ProviderError::AuthFailure(_))
        ));
        cfg.api_key = Some("sk-test".into());
        assert_eq!(build_classifier(&cfg).unwrap().name(), "cloud");
    }

    #[test]
    fn embedding_timeout_defaults_when_omitted() {
        let cfg: EmbeddingConfig = serde_json::from_value(serde_json::json!({
            "provider": "ollama",
            "model": "nomic-embed-text",
            "version": "1",
            "dimension": 768
        }))
        .unwrap();
        assert_eq!(cfg.timeout_ms, 30_000);
        assert!(build_embedder(&cfg).is_ok());
    }
}
