use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KnowledgeRow {
    pub fingerprint: String,
    pub provider: String,
    pub path: String,
    pub project: String,
    pub file_kind: String,
    pub record_json: String,
    pub vector: Vec<u8>,
    pub dimension: i64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct MetaRow {
    pub key: String,
    pub value: String,
}
