//! IVF (inverted file) partitioning for approximate nearest-neighbor search.
//!
//! Vectors are grouped around `lists` centroids found by seeded spherical
//! k-means. A query only scores the members of its `probes` nearest lists.

use std::collections::HashMap;

use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;

use crate::semantic::embeddings::normalize;
use crate::semantic::index::{cosine_similarity, l2_norm};

const KMEANS_ITERATIONS: usize = 10;

/// Fixed seed so a rebuild over the same data yields the same partitions.
const KMEANS_SEED: u64 = 0x5eed_1f;

pub struct IvfPartitions {
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<i64>>,
    assignment: HashMap<i64, usize>,
    probes: usize,
}

impl IvfPartitions {
    /// Cluster `vectors` into at most `lists` partitions.
    ///
    /// `vectors` must be non-empty and share one dimension.
    pub fn build(vectors: &[(i64, &[f32])], lists: usize, probes: usize) -> Self {
        let k = lists.min(vectors.len()).max(1);
        let dimensions = vectors.first().map(|(_, v)| v.len()).unwrap_or(0);

        let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
        let mut centroids: Vec<Vec<f32>> = rand::seq::index::sample(&mut rng, vectors.len(), k)
            .iter()
            .map(|i| {
                let mut centroid = vectors[i].1.to_vec();
                normalize(&mut centroid);
                centroid
            })
            .collect();

        for _ in 0..KMEANS_ITERATIONS {
            let labels = assign_all(&centroids, vectors);

            let mut sums = vec![vec![0.0f32; dimensions]; k];
            let mut counts = vec![0usize; k];
            for (label, (_, vector)) in labels.iter().zip(vectors) {
                counts[*label] += 1;
                for (sum, value) in sums[*label].iter_mut().zip(vector.iter()) {
                    *sum += value;
                }
            }

            // empty clusters keep their previous centroid
            for (c, sum) in sums.into_iter().enumerate() {
                if counts[c] > 0 {
                    let mut centroid = sum;
                    normalize(&mut centroid);
                    centroids[c] = centroid;
                }
            }
        }

        let labels = assign_all(&centroids, vectors);
        let mut lists_out = vec![Vec::new(); k];
        let mut assignment = HashMap::with_capacity(vectors.len());
        for (label, (id, _)) in labels.into_iter().zip(vectors) {
            lists_out[label].push(*id);
            assignment.insert(*id, label);
        }

        log::debug!("built {} IVF lists over {} vectors", k, vectors.len());

        Self {
            centroids,
            lists: lists_out,
            assignment,
            probes: probes.clamp(1, k),
        }
    }

    /// Place `id` into the list of its nearest centroid, moving it if present.
    pub fn assign(&mut self, id: i64, vector: &[f32]) {
        self.unassign(id);
        let label = nearest(&self.centroids, vector);
        self.lists[label].push(id);
        self.assignment.insert(id, label);
    }

    pub fn unassign(&mut self, id: i64) {
        if let Some(label) = self.assignment.remove(&id) {
            self.lists[label].retain(|member| *member != id);
        }
    }

    /// Ids in the `probes` lists whose centroids are closest to `query`.
    pub fn probe(&self, query: &[f32]) -> Vec<i64> {
        let query_norm = l2_norm(query);
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, cosine_similarity(query, centroid, query_norm)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        ranked
            .into_iter()
            .take(self.probes)
            .flat_map(|(c, _)| self.lists[c].iter().copied())
            .collect()
    }
}

fn assign_all(centroids: &[Vec<f32>], vectors: &[(i64, &[f32])]) -> Vec<usize> {
    vectors
        .par_iter()
        .map(|(_, vector)| nearest(centroids, vector))
        .collect()
}

fn nearest(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let norm = l2_norm(vector);
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let score = cosine_similarity(vector, centroid, norm);
        if score > best_score {
            best = c;
            best_score = score;
        }
    }
    best
}
