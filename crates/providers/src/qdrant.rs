use crate::ProviderError;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub collection: String,
    pub api_key: Option<String>,
}

#[derive(Clone)]
pub struct QdrantClient {
    client: Client,
    cfg: QdrantConfig,
}

impl QdrantClient {
    pub fn new(cfg: QdrantConfig) -> Self {
        Self {
            client: Client::new(),
            cfg,
        }
    }

    fn points_url(&self, suffix: &str) -> String {
        format!(
            "{}/collections/{}/points{}",
            self.cfg.url, self.cfg.collection, suffix
        )
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        let builder = match &self.cfg.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        };
        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or(Bytes::from_static(b""));
            return Err(ProviderError::TransportFailure(format!(
                "status {} body {:?}",
                status, body
            )));
        }
        Ok(resp)
    }

    /// Vector size of the collection, `None` when it does not exist yet.
    pub async fn collection_vector_size(&self) -> Result<Option<u64>, ProviderError> {
        #[derive(Deserialize)]
        struct Info {
            result: InfoResult,
        }
        #[derive(Deserialize)]
        struct InfoResult {
            config: InfoConfig,
        }
        #[derive(Deserialize)]
        struct InfoConfig {
            params: InfoParams,
        }
        #[derive(Deserialize)]
        struct InfoParams {
            vectors: VectorParams,
        }
        #[derive(Deserialize)]
        struct VectorParams {
            size: u64,
        }

        let url = format!("{}/collections/{}", self.cfg.url, self.cfg.collection);
        let mut builder = self.client.get(url);
        if let Some(key) = &self.cfg.api_key {
            builder = builder.header("api-key", key);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(ProviderError::TransportFailure(format!(
                "status {}",
                resp.status()
            )));
        }
        let info: Info = resp
            .json()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))?;
        Ok(Some(info.result.config.params.vectors.size))
    }

    pub async fn create_collection(&self, size: u64) -> Result<(), ProviderError> {
        let url = format!("{}/collections/{}", self.cfg.url, self.cfg.collection);
        let body = serde_json::json!({
            "vectors": { "size": size, "distance": "Cosine" }
        });
        self.send(self.client.put(url).json(&body)).await?;
        Ok(())
    }

    pub async fn search(
        &self,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<serde_json::Value>,
    ) -> Result<QdrantSearchResponse, ProviderError> {
        #[derive(Serialize)]
        struct SearchRequest {
            vector: Vec<f32>,
            limit: u64,
            with_payload: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            filter: Option<serde_json::Value>,
        }
        let body = SearchRequest {
            vector,
            limit,
            with_payload: true,
            filter,
        };
        let resp = self
            .send(self.client.post(self.points_url("/search")).json(&body))
            .await?;
        resp.json()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))
    }

    pub async fn upsert(&self, points: Vec<QdrantPoint>) -> Result<(), ProviderError> {
        let req = QdrantUpsert { points };
        self.send(self.client.put(self.points_url("?wait=true")).json(&req))
            .await?;
        Ok(())
    }

    pub async fn retrieve(&self, ids: Vec<String>) -> Result<QdrantPointsResponse, ProviderError> {
        #[derive(Serialize)]
        struct RetrieveRequest {
            ids: Vec<String>,
            with_payload: bool,
            with_vector: bool,
        }
        let body = RetrieveRequest {
            ids,
            with_payload: true,
            with_vector: true,
        };
        let resp = self
            .send(self.client.post(self.points_url("")).json(&body))
            .await?;
        resp.json()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))
    }

    pub async fn delete_points(&self, ids: Vec<String>) -> Result<(), ProviderError> {
        #[derive(Serialize)]
        struct DeletePoints {
            points: Vec<String>,
        }
        let body = DeletePoints { points: ids };
        self.send(
            self.client
                .post(self.points_url("/delete?wait=true"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    /// One page of points matching `filter`; pass the returned offset to continue.
    pub async fn scroll(
        &self,
        filter: Option<serde_json::Value>,
        limit: u64,
        offset: Option<serde_json::Value>,
    ) -> Result<QdrantScrollResult, ProviderError> {
        #[derive(Serialize)]
        struct ScrollRequest {
            limit: u64,
            with_payload: bool,
            with_vector: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            filter: Option<serde_json::Value>,
            #[serde(skip_serializing_if = "Option::is_none")]
            offset: Option<serde_json::Value>,
        }
        #[derive(Deserialize)]
        struct ScrollResponse {
            result: QdrantScrollResult,
        }
        let body = ScrollRequest {
            limit,
            with_payload: true,
            with_vector: false,
            filter,
            offset,
        };
        let resp = self
            .send(self.client.post(self.points_url("/scroll")).json(&body))
            .await?;
        let parsed: ScrollResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::TransportFailure(e.to_string()))?;
        Ok(parsed.result)
    }
}

/// Builds a `must` filter of exact keyword matches.
pub fn match_filter(conditions: &[(&str, String)]) -> Option<serde_json::Value> {
    if conditions.is_empty() {
        return None;
    }
    let must: Vec<serde_json::Value> = conditions
        .iter()
        .map(|(key, value)| serde_json::json!({ "key": key, "match": { "value": value } }))
        .collect();
    Some(serde_json::json!({ "must": must }))
}

#[derive(Debug, Serialize)]
pub struct QdrantUpsert {
    pub points: Vec<QdrantPoint>,
}

#[derive(Debug, Serialize)]
pub struct QdrantPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct QdrantSearchResponse {
    pub result: Vec<SearchResult>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SearchResult {
    pub id: serde_json::Value,
    pub score: f32,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct QdrantPointsResponse {
    pub result: Vec<StoredPoint>,
}

#[derive(Debug, Deserialize)]
pub struct StoredPoint {
    pub id: serde_json::Value,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct QdrantScrollResult {
    pub points: Vec<StoredPoint>,
    #[serde(default)]
    pub next_page_offset: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_filter_builds_must_clauses() {
        assert!(match_filter(&[]).is_none());
        let filter = match_filter(&[("provider", "P1".to_string()), ("file_kind", "code".to_string())])
            .unwrap();
        assert_eq!(filter["must"][0]["key"], "provider");
        assert_eq!(filter["must"][1]["match"]["value"], "code");
    }

    #[test]
    fn scroll_result_tolerates_missing_offset() {
        let parsed: QdrantScrollResult =
            serde_json::from_str(r#"{"points": [{"id": "a", "payload": {"x": 1}}]}"#).unwrap();
        assert_eq!(parsed.points.len(), 1);
        assert!(parsed.next_page_offset.is_none());
        assert!(parsed.points[0].vector.is_none());
    }
}
