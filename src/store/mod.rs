//! Durable embedding records with similarity search.
//!
//! `VectorStore` is implemented by the pgvector-backed `PgVectorStore` used in
//! deployments and by `LocalVectorStore`, an in-process index persisted to a
//! single file.

mod local;
mod postgres;

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::index::{check_vector, IndexError};
use crate::semantic::VectorStorageError;

pub use local::{IvfSettings, LocalVectorStore};
pub use postgres::{PgParams, PgVectorStore};

/// Stable external identifier of a content item (a post id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(i64);

impl ContentId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored embedding and its presentation fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingRecord {
    pub content_id: ContentId,
    pub title: String,
    pub snippet: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A search hit. `score` is `1 - cosine_distance`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub content_id: ContentId,
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

impl From<IndexError> for StoreError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::DimensionMismatch { expected, got } => {
                StoreError::DimensionMismatch { expected, got }
            }
            IndexError::ZeroNormVector => StoreError::ZeroNormVector,
        }
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => StoreError::Unavailable(format!("{}: {}", err, db.message())),
            None => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Persistence and nearest-neighbor search over embedding records.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Vector dimension fixed for the lifetime of the store.
    fn dimensions(&self) -> usize;

    /// Short backend name for logs and stats.
    fn backend_name(&self) -> &'static str;

    /// Ensure schema and similarity index exist. Safe to call on every start.
    async fn init(&self) -> Result<(), StoreError>;

    /// Insert or fully replace the record for `content_id`.
    ///
    /// The snippet is cut to the storage bound before writing.
    async fn upsert(
        &self,
        content_id: ContentId,
        title: &str,
        snippet: &str,
        vector: Vec<f32>,
    ) -> Result<(), StoreError>;

    /// Stored embedding for `content_id`, if any.
    async fn get_vector(&self, content_id: ContentId) -> Result<Option<Vec<f32>>, StoreError>;

    async fn get_record(&self, content_id: ContentId)
        -> Result<Option<EmbeddingRecord>, StoreError>;

    /// Up to `limit` records by descending cosine similarity to `query`.
    ///
    /// `exclude` is omitted from the results and does not count against `limit`.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        exclude: Option<ContentId>,
    ) -> Result<Vec<ScoredRecord>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    /// Rebuild the approximate similarity index from the stored vectors.
    async fn reindex(&self) -> Result<(), StoreError>;
}

/// Approximate lists are only trained once each one can hold this many rows.
const MIN_ROWS_PER_LIST: usize = 39;

/// Whether `rows` vectors are enough to train `lists` partitions.
pub(crate) fn ivf_worth_building(rows: usize, lists: usize) -> bool {
    rows > 0 && rows >= lists.max(1) * MIN_ROWS_PER_LIST
}

/// Reject vectors that do not fit a store of `dimensions`.
pub(crate) fn validate_vector(vector: &[f32], dimensions: usize) -> Result<(), StoreError> {
    check_vector(vector, dimensions).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ivf_needs_enough_rows_per_list() {
        assert!(!ivf_worth_building(0, 1));
        assert!(!ivf_worth_building(0, 0));
        assert!(!ivf_worth_building(3899, 100));
        assert!(ivf_worth_building(3900, 100));
        assert!(ivf_worth_building(39, 1));
    }
}
