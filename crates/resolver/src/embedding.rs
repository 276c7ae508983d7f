//! Summary embeddings.
//!
//! The resolver only needs a deterministic, normalized, fixed-dimension
//! vector per text. [`Embedder`] is the seam; the in-tree implementation is
//! a hashed character-ngram projection, so the whole pipeline runs without
//! model downloads. A model-backed embedder plugs in behind the same trait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    /// L2-normalized embedding; all zeros for empty input.
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic hashed-trigram projection.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let bucket = (h % self.dim as u64) as usize;
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();

        for token in lower.split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }

            let (bucket, sign) = self.bucket(token);
            vector[bucket] += sign;

            // Character trigrams give partial-word overlap a signal.
            let padded: Vec<char> = format!("#{token}#").chars().collect();
            for window in padded.windows(3) {
                let gram: String = window.iter().collect();
                let (bucket, sign) = self.bucket(&gram);
                vector[bucket] += sign * 0.5;
            }
        }

        normalize(&mut vector);
        vector
    }
}

pub(crate) fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
