//! Local engine served by Ollama.

use crate::http::{check_status, transport};
use crate::prompt::classification_prompt;
use crate::{
    Classification, ClassificationProvider, ClassifyRequest, EmbedResponse, EmbeddingProvider,
    ProviderError, TargetSchema,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_PROMPT_CHARS: usize = 3000;

#[derive(Clone)]
pub struct OllamaConfig {
    pub name: String,
    pub base_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub temperature: f32,
}

#[derive(Clone)]
pub struct OllamaProvider {
    client: Client,
    cfg: Arc<OllamaConfig>,
}

impl OllamaProvider {
    pub fn new(cfg: OllamaConfig) -> Self {
        Self {
            client: Client::new(),
            cfg: Arc::new(cfg),
        }
    }
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[async_trait::async_trait]
impl ClassificationProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    async fn classify(
        &self,
        request: &ClassifyRequest<'_>,
        schema: &TargetSchema,
    ) -> Result<Classification, ProviderError> {
        let prompt = classification_prompt(request, schema, MAX_PROMPT_CHARS);
        let body = GenerateRequest {
            model: &self.cfg.chat_model,
            prompt: &prompt,
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.cfg.temperature,
            },
        };
        let resp = self
            .client
            .post(format!("{}/api/generate", self.cfg.base_url))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        let parsed: GenerateResponse = check_status(resp).await?.json().await.map_err(transport)?;
        Ok(schema.validate(&parsed.response)?)
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OllamaProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        #[derive(Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'a str,
            prompt: &'a str,
        }
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            embedding: Vec<f32>,
        }

        // The endpoint embeds one prompt per call.
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let resp = self
                .client
                .post(format!("{}/api/embeddings", self.cfg.base_url))
                .json(&EmbeddingRequest {
                    model: &self.cfg.embedding_model,
                    prompt: text,
                })
                .send()
                .await
                .map_err(transport)?;
            let parsed: EmbeddingResponse =
                check_status(resp).await?.json().await.map_err(transport)?;
            vectors.push(parsed.embedding);
        }
        Ok(EmbedResponse { vectors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_request_forces_json_format() {
        let body = GenerateRequest {
            model: "codellama:7b",
            prompt: "p",
            stream: false,
            format: "json",
            options: GenerateOptions { temperature: 0.1 },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["format"], "json");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn missing_response_field_defaults_to_empty() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert!(parsed.response.is_empty());
    }
}
