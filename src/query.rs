//! Read-side operations: free-text search and related content.

use std::sync::Arc;

use serde::Serialize;

use crate::errors::AppError;
use crate::semantic::{truncate_chars, Embedder, PRESENTED_SNIPPET_CHARS};
use crate::store::{ContentId, ScoredRecord, VectorStore};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const MAX_SEARCH_LIMIT: usize = 50;
pub const DEFAULT_RELATED_LIMIT: usize = 5;
pub const MAX_RELATED_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(rename = "postId")]
    pub post_id: i64,
    pub title: String,
    pub snippet: String,
    pub score: f64,
}

impl From<ScoredRecord> for SearchHit {
    fn from(record: ScoredRecord) -> Self {
        Self {
            post_id: record.content_id.get(),
            title: record.title,
            snippet: truncate_chars(&record.snippet, PRESENTED_SNIPPET_CHARS).to_string(),
            score: round_score(record.score),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedResponse {
    #[serde(rename = "postId")]
    pub post_id: i64,
    pub results: Vec<SearchHit>,
}

/// Round to 4 decimal places.
fn round_score(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

fn check_limit(limit: Option<usize>, default: usize, max: usize) -> Result<usize, AppError> {
    let limit = limit.unwrap_or(default);
    if !(1..=max).contains(&limit) {
        return Err(AppError::InvalidQuery(format!(
            "limit must be between 1 and {}, got {}",
            max, limit
        )));
    }
    Ok(limit)
}

#[derive(Clone)]
pub struct QueryService {
    embedder: Arc<Embedder>,
    store: Arc<dyn VectorStore>,
}

impl QueryService {
    pub fn new(embedder: Arc<Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub async fn search(&self, query: &str, limit: Option<usize>) -> Result<SearchResponse, AppError> {
        if query.is_empty() {
            return Err(AppError::InvalidQuery("q must not be empty".to_string()));
        }
        let limit = check_limit(limit, DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT)?;

        let embedder = self.embedder.clone();
        let text = query.to_string();
        let vector = tokio::task::block_in_place(move || embedder.embed(&text))?;

        let records = self.store.search(&vector, limit, None).await?;
        log::debug!("search {:?}: {} hits", query, records.len());

        Ok(SearchResponse {
            query: query.to_string(),
            results: records.into_iter().map(SearchHit::from).collect(),
        })
    }

    /// Neighbors of an indexed item. An unindexed id has no neighbors yet.
    pub async fn related(&self, post_id: i64, limit: Option<usize>) -> Result<RelatedResponse, AppError> {
        if post_id <= 0 {
            return Err(AppError::InvalidQuery(format!(
                "post_id must be positive, got {}",
                post_id
            )));
        }
        let limit = check_limit(limit, DEFAULT_RELATED_LIMIT, MAX_RELATED_LIMIT)?;
        let content_id = ContentId::new(post_id);

        let results = match self.store.get_vector(content_id).await? {
            Some(vector) => self
                .store
                .search(&vector, limit, Some(content_id))
                .await?
                .into_iter()
                .map(SearchHit::from)
                .collect(),
            None => Vec::new(),
        };

        Ok(RelatedResponse { post_id, results })
    }
}
