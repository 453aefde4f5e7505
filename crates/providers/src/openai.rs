use crate::http::{check_status, transport};
use crate::prompt::classification_prompt;
use crate::{
    Classification, ClassificationProvider, ClassifyRequest, EmbedResponse, EmbeddingProvider,
    ProviderError, TargetSchema,
};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;

const MAX_PROMPT_CHARS: usize = 3000;

#[derive(Clone)]
pub struct OpenAiConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct OpenAiProvider {
    client: Client,
    cfg: Arc<OpenAiConfig>,
}

impl OpenAiProvider {
    pub fn new(cfg: OpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            cfg: Arc::new(cfg),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<EmbedResponse, ProviderError> {
        #[derive(serde::Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a [String],
        }

        let body = EmbedRequest {
            model: &self.cfg.embedding_model,
            input: texts,
        };

        let resp = self
            .client
            .post(format!("{}/v1/embeddings", self.cfg.base_url))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let parsed: EmbeddingApiResponse = check_status(resp).await?.json().await.map_err(transport)?;

        Ok(EmbedResponse {
            vectors: parsed.data.into_iter().map(|d| d.embedding).collect(),
        })
    }
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(serde::Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessageResp,
}

#[derive(Deserialize)]
struct ChatMessageResp {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Vec<Choice>,
}

fn completion_text(parsed: ChatApiResponse) -> String {
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ClassificationProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    async fn classify(
        &self,
        request: &ClassifyRequest<'_>,
        schema: &TargetSchema,
    ) -> Result<Classification, ProviderError> {
        let prompt = classification_prompt(request, schema, MAX_PROMPT_CHARS);
        let body = ChatRequest {
            model: &self.cfg.chat_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You extract business semantics from source files. Always respond with valid JSON only.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.cfg.base_url))
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;

        let parsed: ChatApiResponse = check_status(resp).await?.json().await.map_err(transport)?;
        let content = completion_text(parsed);
        tracing::debug!(provider = %self.cfg.name, path = request.path, chars = content.len(), "completion received");
        Ok(schema.validate(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_takes_first_choice() {
        let parsed: ChatApiResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "{\"a\": 1}"}}, {"message": {"content": "x"}}]}"#,
        )
        .unwrap();
        assert_eq!(completion_text(parsed), "{\"a\": 1}");
    }

    #[test]
    fn empty_completion_fails_validation() {
        let parsed: ChatApiResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap();
        let text = completion_text(parsed);
        assert!(TargetSchema::default().validate(&text).is_err());
    }

    #[test]
    fn chat_request_asks_for_json_objects() {
        let body = ChatRequest {
            model: "gpt-4.1",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.1,
            max_tokens: 1000,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
