use crate::http::{check_status, transport};
use crate::prompt::classification_prompt;
use crate::{Classification, ClassificationProvider, ClassifyRequest, ProviderError, TargetSchema};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const MAX_PROMPT_CHARS: usize = 4000;
const API_VERSION: &str = "2023-06-01";

#[derive(Clone)]
pub struct AnthropicConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    cfg: Arc<AnthropicConfig>,
}

impl AnthropicProvider {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            client: Client::new(),
            cfg: Arc::new(cfg),
        }
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message<'a>>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

fn response_text(resp: MessagesResponse) -> String {
    resp.content
        .into_iter()
        .filter_map(|b| b.text)
        .collect::<Vec<_>>()
        .join("")
}

#[async_trait::async_trait]
impl ClassificationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    async fn classify(
        &self,
        request: &ClassifyRequest<'_>,
        schema: &TargetSchema,
    ) -> Result<Classification, ProviderError> {
        let prompt = classification_prompt(request, schema, MAX_PROMPT_CHARS);
        let body = MessagesRequest {
            model: &self.cfg.model,
            max_tokens: self.cfg.max_tokens,
            temperature: self.cfg.temperature,
            messages: vec![Message {
                role: "user",
                content: &prompt,
            }],
        };

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.cfg.base_url))
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let parsed: MessagesResponse = check_status(resp).await?.json().await.map_err(transport)?;
        Ok(schema.validate(&response_text(parsed))?)
    }
}
