use super::{
    check_space, rank, KnowledgeStore, MetadataFilter, ScoredRecord, StoreError, StoredEntry,
};
use crate::models::{ClassificationRecord, EmbeddingSpace, EmbeddingVector, RecordKey};
use providers::qdrant::{match_filter, QdrantClient, QdrantConfig, QdrantPoint, StoredPoint};
use providers::ProviderError;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use uuid::Uuid;
use tracing::{debug, info};

const SCROLL_PAGE: u64 = 256;

/// Store backed by a Qdrant collection. Each record is one point whose
/// payload carries the record and the identity of its embedding space.
pub struct QdrantStore {
    client: QdrantClient,
    space: OnceCell<EmbeddingSpace>,
    collection: OnceCell<()>,
}

impl QdrantStore {
    pub fn new(url: &str, collection: &str, api_key: Option<String>) -> Self {
        Self::with_client(QdrantClient::new(QdrantConfig {
            url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
        }))
    }

    pub fn with_client(client: QdrantClient) -> Self {
        Self {
            client,
            space: OnceCell::new(),
            collection: OnceCell::new(),
        }
    }

    async fn ensure_collection(&self, dimension: usize) -> Result<(), StoreError> {
        let existing = self.client.collection_vector_size().await.map_err(read_error)?;
        if existing.is_some() {
            return check_collection_size(existing, dimension);
        }
        info!(dimension, "creating qdrant collection");
        if let Err(e) = self.client.create_collection(dimension as u64).await {
            // Another writer may have created it in the meantime.
            match self.client.collection_vector_size().await.map_err(read_error)? {
                None => return Err(read_error(e)),
                found => {
                    debug!(error = %e, "qdrant collection already exists");
                    return check_collection_size(found, dimension);
                }
            }
        }
        Ok(())
    }

    async fn scroll_all(&self, filter: &MetadataFilter) -> Result<Vec<StoredPoint>, StoreError> {
        let mut points = Vec::new();
        let mut offset = None;
        loop {
            let page = self
                .client
                .scroll(qdrant_filter(filter), SCROLL_PAGE, offset)
                .await
                .map_err(read_error)?;
            points.extend(page.points);
            match page.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }
        Ok(points)
    }
}

/// Qdrant accepts UUID point ids; derive one from the key.
pub fn point_id(key: &RecordKey) -> String {
    let hash = blake3::hash(key.to_string().as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    Uuid::from_bytes(bytes).to_string()
}

fn check_collection_size(size: Option<u64>, dimension: usize) -> Result<(), StoreError> {
    match size {
        Some(size) if size as usize != dimension => Err(StoreError::DimensionMismatch {
            expected: size as usize,
            actual: dimension,
        }),
        _ => Ok(()),
    }
}

fn qdrant_filter(filter: &MetadataFilter) -> Option<Value> {
    let mut conditions: Vec<(&str, String)> = Vec::new();
    if let Some(p) = &filter.provider {
        conditions.push(("provider", p.clone()));
    }
    if let Some(k) = filter.file_kind {
        conditions.push(("file_kind", k.as_str().to_string()));
    }
    if let Some(p) = &filter.project {
        conditions.push(("project", p.clone()));
    }
    if let Some(p) = &filter.path {
        conditions.push(("path", p.clone()));
    }
    match_filter(&conditions)
}

fn read_error(e: ProviderError) -> StoreError {
    StoreError::ConnectionFailure(e.to_string())
}

fn write_error(key: &RecordKey, e: ProviderError) -> StoreError {
    let msg = e.to_string();
    if msg.contains("409") {
        StoreError::WriteConflict {
            key: key.to_string(),
            reason: msg,
        }
    } else {
        StoreError::ConnectionFailure(msg)
    }
}

fn payload_for(
    record: &ClassificationRecord,
    space: &EmbeddingSpace,
) -> Result<HashMap<String, Value>, StoreError> {
    let value = serde_json::to_value(record)
        .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
    let mut payload: HashMap<String, Value> = match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    };
    payload.insert("embedding_model".into(), Value::String(space.model.clone()));
    payload.insert("embedding_version".into(), Value::String(space.version.clone()));
    payload.insert("embedding_dimension".into(), Value::from(space.dimension as u64));
    payload.insert(
        "timestamp_ms".into(),
        Value::from(record.timestamp.timestamp_millis()),
    );
    Ok(payload)
}

fn record_from(payload: Option<&Value>) -> Result<ClassificationRecord, StoreError> {
    let payload =
        payload.ok_or_else(|| StoreError::ConnectionFailure("point without payload".into()))?;
    serde_json::from_value(payload.clone())
        .map_err(|e| StoreError::ConnectionFailure(format!("corrupt point payload: {e}")))
}

fn space_from(payload: &Value) -> Option<EmbeddingSpace> {
    Some(EmbeddingSpace {
        model: payload.get("embedding_model")?.as_str()?.to_string(),
        version: payload.get("embedding_version")?.as_str()?.to_string(),
        dimension: payload.get("embedding_dimension")?.as_u64()? as usize,
    })
}

#[async_trait::async_trait]
impl KnowledgeStore for QdrantStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        vector: &EmbeddingVector,
        record: &ClassificationRecord,
    ) -> Result<(), StoreError> {
        check_space(self.space().await?.as_ref(), vector)?;
        self.collection
            .get_or_try_init(|| self.ensure_collection(vector.dimension()))
            .await?;
        let point = QdrantPoint {
            id: point_id(key),
            vector: vector.values.clone(),
            payload: payload_for(record, &vector.space)?,
        };
        self.client
            .upsert(vec![point])
            .await
            .map_err(|e| write_error(key, e))?;
        let _ = self.space.set(vector.space.clone());
        debug!(key = %key, "qdrant point written");
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StoredEntry>, StoreError> {
        if self.client.collection_vector_size().await.map_err(read_error)?.is_none() {
            return Ok(None);
        }
        let resp = self
            .client
            .retrieve(vec![point_id(key)])
            .await
            .map_err(read_error)?;
        let Some(point) = resp.result.into_iter().next() else {
            return Ok(None);
        };
        let record = record_from(point.payload.as_ref())?;
        let space = point
            .payload
            .as_ref()
            .and_then(space_from)
            .ok_or_else(|| StoreError::ConnectionFailure("point without embedding space".into()))?;
        Ok(Some(StoredEntry {
            vector: EmbeddingVector {
                space,
                values: point.vector.unwrap_or_default(),
            },
            record,
        }))
    }

    async fn query(
        &self,
        vector: &EmbeddingVector,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        let Some(stored) = self.space().await? else {
            return Ok(Vec::new());
        };
        check_space(Some(&stored), vector)?;
        let resp = self
            .client
            .search(vector.values.clone(), k as u64, qdrant_filter(filter))
            .await
            .map_err(read_error)?;
        let hits = resp
            .result
            .into_iter()
            .map(|hit| {
                Ok(ScoredRecord {
                    record: record_from(hit.payload.as_ref())?,
                    score: hit.score,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(rank(hits, k))
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        if !self.contains(key).await? {
            return Ok(false);
        }
        self.client
            .delete_points(vec![point_id(key)])
            .await
            .map_err(|e| write_error(key, e))?;
        Ok(true)
    }

    async fn records(&self, filter: &MetadataFilter) -> Result<Vec<ClassificationRecord>, StoreError> {
        if self.client.collection_vector_size().await.map_err(read_error)?.is_none() {
            return Ok(Vec::new());
        }
        let mut out = self
            .scroll_all(filter)
            .await?
            .iter()
            .map(|p| record_from(p.payload.as_ref()))
            .collect::<Result<Vec<_>, StoreError>>()?;
        out.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.provider.cmp(&b.provider)));
        Ok(out)
    }

    async fn space(&self) -> Result<Option<EmbeddingSpace>, StoreError> {
        if let Some(space) = self.space.get() {
            return Ok(Some(space.clone()));
        }
        if self.client.collection_vector_size().await.map_err(read_error)?.is_none() {
            return Ok(None);
        }
        let page = self
            .client
            .scroll(None, 1, None)
            .await
            .map_err(read_error)?;
        let found = page
            .points
            .first()
            .and_then(|p| p.payload.as_ref())
            .and_then(space_from);
        if let Some(space) = &found {
            let _ = self.space.set(space.clone());
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileKind;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn record() -> ClassificationRecord {
        ClassificationRecord {
            fingerprint: "h1".into(),
            provider: "P1".into(),
            path: "Loyalty/LoyaltyRule.cs".into(),
            project: "Loyalty".into(),
            file_kind: FileKind::Code,
            purpose: "Award points".into(),
            rules: vec!["order amount > $10 → +100 points".into()],
            workflows: vec![],
            integration_points: vec!["OrderService".into()],
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn point_ids_are_stable_uuids_per_key() {
        let a = point_id(&RecordKey::new("h1", "P1"));
        let b = point_id(&RecordKey::new("h1", "P2"));
        assert_eq!(a, point_id(&RecordKey::new("h1", "P1")));
        assert_ne!(a, b);
        let parsed = Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.to_string(), a);
        let hash = blake3::hash(b"P1:h1");
        assert_eq!(parsed.as_bytes()[..], hash.as_bytes()[..16]);
    }

    #[test]
    fn payload_round_trips_record_and_space() {
        let space = EmbeddingSpace { model: "m".into(), version: "2".into(), dimension: 8 };
        let r = record();
        let payload = payload_for(&r, &space).unwrap();
        let value = Value::Object(payload.into_iter().collect());
        assert_eq!(record_from(Some(&value)).unwrap(), r);
        assert_eq!(space_from(&value), Some(space));
        assert_eq!(value["file_kind"], "code");
    }

    #[test]
    fn filter_translates_to_keyword_matches() {
        assert!(qdrant_filter(&MetadataFilter::all()).is_none());
        let f = qdrant_filter(&MetadataFilter::all().provider("P1").file_kind(FileKind::Configuration))
            .unwrap();
        assert_eq!(f["must"][0]["key"], "provider");
        assert_eq!(f["must"][1]["match"]["value"], "configuration");
    }

    type Seen = Arc<Mutex<Vec<String>>>;

    /// Answers each connection with the next canned `(status, body)` and
    /// records the request line it received.
    async fn scripted_qdrant(responses: Vec<(u16, &'static str)>) -> (String, Seen) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                let line = request.lines().next().unwrap_or_default().to_string();
                log.lock().unwrap().push(line);
                let response = format!(
                    "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), seen)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(end) = text.find("\r\n\r\n") {
                let body_len = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn collection_created_elsewhere_is_accepted_once() {
        const INFO: &str = r#"{"result":{"config":{"params":{"vectors":{"size":3,"distance":"Cosine"}}}}}"#;
        const MISSING: &str = r#"{"status":{"error":"Not found: Collection `knowledge` doesn't exist!"}}"#;
        const EXISTS: &str = r#"{"status":{"error":"Wrong input: Collection `knowledge` already exists!"}}"#;
        const OK: &str = r#"{"result":{"operation_id":1,"status":"completed"},"status":"ok"}"#;
        let (url, seen) = scripted_qdrant(vec![
            (404, MISSING),
            (404, MISSING),
            (409, EXISTS),
            (200, INFO),
            (200, OK),
            (200, OK),
        ])
        .await;

        let store = QdrantStore::new(&url, "knowledge", None);
        let space = EmbeddingSpace { model: "feature-hash".into(), version: "1".into(), dimension: 3 };
        let vector = EmbeddingVector { space, values: vec![1.0, 0.0, 0.0] };
        let first = record();
        let mut second = record();
        second.fingerprint = "h2".into();
        store.upsert(&first.key(), &vector, &first).await.unwrap();
        store.upsert(&second.key(), &vector, &second).await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 6);
        let creates = seen
            .iter()
            .filter(|l| l.starts_with("PUT /collections/knowledge "))
            .count();
        assert_eq!(creates, 1);
        assert!(seen[5].starts_with("PUT /collections/knowledge/points"));
    }
}
