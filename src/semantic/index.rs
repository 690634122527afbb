//! In-memory vector index with cosine similarity search.
//!
//! Stores one embedding record per content id and provides exact or
//! IVF-partitioned similarity search.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::semantic::ivf::IvfPartitions;

/// Index size above which scoring fans out over the rayon pool.
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

/// An entry in the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub title: String,
    pub snippet: String,
    /// The embedding vector
    pub embedding: Vec<f32>,
    /// Unix milliseconds of the first insert
    pub created_at: i64,
    /// Unix milliseconds of the latest insert or replace
    pub updated_at: i64,
}

/// In-memory vector index for semantic search.
///
/// Entries are keyed by content id and kept in id order, which is also the
/// scan order used to break score ties.
pub struct VectorIndex {
    entries: BTreeMap<i64, VectorEntry>,
    /// Expected embedding dimensions
    dimensions: usize,
    partitions: Option<IvfPartitions>,
}

/// Search result from the vector index.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: i64,
    /// Cosine similarity score (-1.0 to 1.0)
    pub score: f32,
}

impl VectorIndex {
    /// Create a new empty vector index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            dimensions,
            partitions: None,
        }
    }

    /// Get the expected embedding dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Get the number of entries in the index.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_partitions(&self) -> bool {
        self.partitions.is_some()
    }

    /// Insert or replace the entry for `id`.
    ///
    /// A replaced entry keeps its original `created_at`.
    pub fn insert(&mut self, id: i64, mut entry: VectorEntry) -> Result<(), IndexError> {
        check_vector(&entry.embedding, self.dimensions)?;

        if let Some(previous) = self.entries.get(&id) {
            entry.created_at = previous.created_at;
        }
        if let Some(partitions) = self.partitions.as_mut() {
            partitions.assign(id, &entry.embedding);
        }
        self.entries.insert(id, entry);

        Ok(())
    }

    /// Remove an entry by content id.
    pub fn remove(&mut self, id: i64) -> Option<VectorEntry> {
        if let Some(partitions) = self.partitions.as_mut() {
            partitions.unassign(id);
        }
        self.entries.remove(&id)
    }

    /// Get an entry by content id.
    pub fn get(&self, id: i64) -> Option<&VectorEntry> {
        self.entries.get(&id)
    }

    /// Iterate over all entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &VectorEntry)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    /// Build (or rebuild) IVF partitions over the current entries.
    ///
    /// `lists` is clamped to the number of entries; an empty index drops
    /// any existing partitions.
    pub fn build_partitions(&mut self, lists: usize, probes: usize) {
        if self.entries.is_empty() || lists == 0 {
            self.partitions = None;
            return;
        }
        let vectors: Vec<(i64, &[f32])> = self
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.embedding.as_slice()))
            .collect();
        self.partitions = Some(IvfPartitions::build(&vectors, lists, probes));
    }

    /// Search for similar vectors using cosine similarity.
    ///
    /// # Arguments
    /// * `query` - The query embedding vector
    /// * `limit` - Maximum number of results to return
    /// * `exclude` - Id left out of the results; it does not count against `limit`
    ///
    /// # Returns
    /// Results sorted by similarity score (highest first), ties in id order.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
        exclude: Option<i64>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        check_vector(query, self.dimensions)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query_norm = l2_norm(query);

        if let Some(partitions) = &self.partitions {
            let candidates: Vec<i64> = partitions
                .probe(query)
                .into_iter()
                .filter(|id| Some(*id) != exclude)
                .collect();

            // Probed lists too thin to fill the page: fall back to exact.
            if candidates.len() >= limit {
                let mut candidates = candidates;
                candidates.sort_unstable();
                let scored = candidates
                    .into_iter()
                    .filter_map(|id| self.entries.get(&id).map(|entry| (id, entry)))
                    .map(|(id, entry)| SearchResult {
                        id,
                        score: cosine_similarity(query, &entry.embedding, query_norm),
                    })
                    .collect();
                return Ok(rank(scored, limit));
            }
        }

        let score = |(id, entry): (&i64, &VectorEntry)| SearchResult {
            id: *id,
            score: cosine_similarity(query, &entry.embedding, query_norm),
        };

        let scored: Vec<SearchResult> = if self.entries.len() >= PARALLEL_SCAN_THRESHOLD {
            let entries: Vec<(&i64, &VectorEntry)> = self
                .entries
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .collect();
            entries.into_par_iter().map(score).collect()
        } else {
            self.entries
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .map(score)
                .collect()
        };

        Ok(rank(scored, limit))
    }
}

/// Sort by score descending and keep the first `limit`.
///
/// The sort is stable, so equal scores keep the input (id) order.
fn rank(mut results: Vec<SearchResult>, limit: usize) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(limit);
    results
}

/// Reject vectors of the wrong length or with zero norm.
pub fn check_vector(vector: &[f32], dimensions: usize) -> Result<(), IndexError> {
    if vector.len() != dimensions {
        return Err(IndexError::DimensionMismatch {
            expected: dimensions,
            got: vector.len(),
        });
    }
    if l2_norm(vector) < f32::EPSILON {
        return Err(IndexError::ZeroNormVector);
    }
    Ok(())
}

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Compute cosine similarity between two vectors.
/// Assumes query_norm is precomputed for efficiency.
pub fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON || query_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}
