//! Flat inner-product vector index keyed by entity id.
//!
//! Vectors are normalized on insert, so inner product is cosine similarity.
//! Supports exactly what the resolver contract needs: insert, remove-by-id,
//! and top-k search, plus an all-pairs sweep for merge candidacy.

use std::collections::HashMap;

use crate::embedding::normalize;

#[derive(Default)]
pub struct VectorIndex {
    vectors: HashMap<i64, Vec<f32>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.vectors.contains_key(&id)
    }

    /// Insert or replace the vector for `id`.
    pub fn insert(&mut self, id: i64, mut vector: Vec<f32>) {
        normalize(&mut vector);
        self.vectors.insert(id, vector);
    }

    pub fn remove(&mut self, id: i64) -> bool {
        self.vectors.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.vectors.clear();
    }

    /// Top-k ids by inner product against `query`, highest first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let mut scored: Vec<(i64, f32)> = self
            .vectors
            .iter()
            .map(|(id, vector)| (*id, dot(query, vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }

    /// Every id pair whose similarity reaches `threshold`, lower id first.
    pub fn pairs_above(&self, threshold: f32) -> Vec<(i64, i64, f32)> {
        let mut ids: Vec<i64> = self.vectors.keys().copied().collect();
        ids.sort_unstable();

        let mut pairs = Vec::new();
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let sim = dot(&self.vectors[&a], &self.vectors[&b]);
                if sim >= threshold {
                    pairs.push((a, b, sim));
                }
            }
        }
        pairs
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_ranks_by_similarity() {
        let mut index = VectorIndex::new();
        index.insert(1, vec![1.0, 0.0, 0.0]);
        index.insert(2, vec![0.0, 1.0, 0.0]);
        index.insert(3, vec![0.9, 0.1, 0.0]);

        let hits = index.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].0, 3);
    }

    #[test]
    fn insert_replaces_and_remove_deletes() {
        let mut index = VectorIndex::new();
        index.insert(1, vec![1.0, 0.0]);
        index.insert(1, vec![0.0, 1.0]);
        assert_eq!(index.len(), 1);

        let hits = index.search(&[0.0, 1.0], 1);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert!(index.search(&[0.0, 1.0], 1).is_empty());
    }

    #[test]
    fn pairs_above_orders_lower_id_first() {
        let mut index = VectorIndex::new();
        index.insert(5, vec![1.0, 0.0]);
        index.insert(2, vec![1.0, 0.0]);
        index.insert(9, vec![0.0, 1.0]);

        let pairs = index.pairs_above(0.99);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].0, pairs[0].1), (2, 5));
    }
}
