use super::{
    check_space, cosine_similarity, rank, KnowledgeStore, MetadataFilter, ScoredRecord,
    StoreError, StoredEntry,
};
use crate::models::{ClassificationRecord, EmbeddingSpace, EmbeddingVector, RecordKey};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;
use storage::models::{KnowledgeRow, MetaRow};
use tokio::sync::Mutex;
use tracing::debug;

const SPACE_KEY: &str = "embedding_space";

/// Durable store on a single SQLite file. Similarity is computed in-process
/// over the rows that pass the metadata filter.
///
/// SQLite admits one writer at a time, so writes from this process go
/// through `writer` one after another; clones share the same gate.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let pool = storage::connect(url)
            .await
            .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
        storage::migrate(&pool)
            .await
            .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    async fn fetch_rows(&self, filter: &MetadataFilter) -> Result<Vec<KnowledgeRow>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT fingerprint, provider, path, project, file_kind, record_json, vector, \
             dimension, timestamp_ms FROM knowledge_entries WHERE 1 = 1",
        );
        if let Some(provider) = &filter.provider {
            qb.push(" AND provider = ").push_bind(provider.as_str());
        }
        if let Some(kind) = filter.file_kind {
            qb.push(" AND file_kind = ").push_bind(kind.as_str());
        }
        if let Some(project) = &filter.project {
            qb.push(" AND project = ").push_bind(project.as_str());
        }
        if let Some(path) = &filter.path {
            qb.push(" AND path = ").push_bind(path.as_str());
        }
        qb.push(" ORDER BY path, provider");
        qb.build_query_as::<KnowledgeRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(read_error)
    }
}

fn read_error(e: sqlx::Error) -> StoreError {
    StoreError::ConnectionFailure(e.to_string())
}

fn write_error(key: &RecordKey, e: sqlx::Error) -> StoreError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("locked") || lower.contains("busy") {
        StoreError::WriteConflict {
            key: key.to_string(),
            reason: msg,
        }
    } else {
        StoreError::ConnectionFailure(msg)
    }
}

fn decode_space(value: &str) -> Result<EmbeddingSpace, StoreError> {
    serde_json::from_str(value)
        .map_err(|e| StoreError::ConnectionFailure(format!("corrupt embedding space: {e}")))
}

fn decode_record(row: &KnowledgeRow) -> Result<ClassificationRecord, StoreError> {
    serde_json::from_str(&row.record_json).map_err(|e| {
        StoreError::ConnectionFailure(format!(
            "corrupt record {}:{}: {e}",
            row.provider, row.fingerprint
        ))
    })
}

fn decode_values(row: &KnowledgeRow) -> Result<Vec<f32>, StoreError> {
    storage::decode_vector(&row.vector).map_err(|e| StoreError::ConnectionFailure(e.to_string()))
}

#[async_trait::async_trait]
impl KnowledgeStore for SqliteStore {
    async fn upsert(
        &self,
        key: &RecordKey,
        vector: &EmbeddingVector,
        record: &ClassificationRecord,
    ) -> Result<(), StoreError> {
        let record_json = serde_json::to_string(record)
            .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;
        let space_json = serde_json::to_string(&vector.space)
            .map_err(|e| StoreError::ConnectionFailure(e.to_string()))?;

        let _gate = self.writer.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| write_error(key, e))?;

        // Write before reading so the transaction takes the write lock up front;
        // another process holding it makes this wait out the busy timeout.
        sqlx::query("INSERT OR IGNORE INTO store_meta (key, value) VALUES (?, ?)")
            .bind(SPACE_KEY)
            .bind(&space_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(key, e))?;
        let stored: MetaRow = sqlx::query_as("SELECT key, value FROM store_meta WHERE key = ?")
            .bind(SPACE_KEY)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| write_error(key, e))?;
        check_space(Some(&decode_space(&stored.value)?), vector)?;

        sqlx::query(
            "INSERT INTO knowledge_entries \
             (fingerprint, provider, path, project, file_kind, record_json, vector, dimension, timestamp_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(fingerprint, provider) DO UPDATE SET \
             path = excluded.path, project = excluded.project, file_kind = excluded.file_kind, \
             record_json = excluded.record_json, vector = excluded.vector, \
             dimension = excluded.dimension, timestamp_ms = excluded.timestamp_ms",
        )
        .bind(&key.fingerprint)
        .bind(&key.provider)
        .bind(&record.path)
        .bind(&record.project)
        .bind(record.file_kind.as_str())
        .bind(&record_json)
        .bind(storage::encode_vector(&vector.values))
        .bind(vector.dimension() as i64)
        .bind(record.timestamp.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(key, e))?;

        tx.commit().await.map_err(|e| write_error(key, e))?;
        debug!(key = %key, "knowledge entry written");
        Ok(())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<StoredEntry>, StoreError> {
        let row: Option<KnowledgeRow> = sqlx::query_as(
            "SELECT fingerprint, provider, path, project, file_kind, record_json, vector, \
             dimension, timestamp_ms FROM knowledge_entries WHERE fingerprint = ? AND provider = ?",
        )
        .bind(&key.fingerprint)
        .bind(&key.provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let space = self.space().await?.ok_or_else(|| {
            StoreError::ConnectionFailure("entry present without an embedding space".into())
        })?;
        Ok(Some(StoredEntry {
            vector: EmbeddingVector {
                space,
                values: decode_values(&row)?,
            },
            record: decode_record(&row)?,
        }))
    }

    async fn query(
        &self,
        vector: &EmbeddingVector,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        check_space(self.space().await?.as_ref(), vector)?;
        let rows = self.fetch_rows(filter).await?;
        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = decode_values(row)?;
            hits.push(ScoredRecord {
                record: decode_record(row)?,
                score: cosine_similarity(&vector.values, &values),
            });
        }
        Ok(rank(hits, k))
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        let _gate = self.writer.lock().await;
        let res = sqlx::query("DELETE FROM knowledge_entries WHERE fingerprint = ? AND provider = ?")
            .bind(&key.fingerprint)
            .bind(&key.provider)
            .execute(&self.pool)
            .await
            .map_err(|e| write_error(key, e))?;
        Ok(res.rows_affected() > 0)
    }

    async fn records(&self, filter: &MetadataFilter) -> Result<Vec<ClassificationRecord>, StoreError> {
        self.fetch_rows(filter).await?.iter().map(decode_record).collect()
    }

    async fn space(&self) -> Result<Option<EmbeddingSpace>, StoreError> {
        let row: Option<MetaRow> = sqlx::query_as("SELECT key, value FROM store_meta WHERE key = ?")
            .bind(SPACE_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_error)?;
        row.map(|r| decode_space(&r.value)).transpose()
    }
}
