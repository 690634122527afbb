mod scenarios;
mod web;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::semantic::{Embedder, EmbeddingError, TextEmbedder};

/// Bag-of-words embedder: each lowercase token bumps one hashed bucket.
///
/// Texts sharing words get positive cosine similarity, identical texts get 1.0.
pub struct HashingBackend {
    dimensions: usize,
}

impl TextEmbedder for HashingBackend {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase);

        let mut any = false;
        for token in tokens {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            vector[(hasher.finish() % self.dimensions as u64) as usize] += 1.0;
            any = true;
        }
        if !any {
            vector[0] = 1.0;
        }
        Ok(vector)
    }
}

pub fn hashing_embedder(dimensions: usize) -> Embedder {
    Embedder::with_backend("hashing", HashingBackend { dimensions })
}
