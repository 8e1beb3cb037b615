//! Dense embedding arena.
//!
//! Vectors are kept in one contiguous `Vec<f32>` addressed by row, with a
//! side map from item id to row. Scoring walks rows directly instead of
//! chasing per-item allocations.

use std::collections::HashMap;

/// Borrowed view of one stored embedding.
#[derive(Debug, Clone, Copy)]
pub struct VectorRef<'a> {
    pub id: u64,
    /// Hash of the text that was embedded
    pub text_hash: u64,
    pub embedding: &'a [f32],
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    ids: Vec<u64>,
    hashes: Vec<u64>,
    data: Vec<f32>,
    rows: HashMap<u64, usize>,
    /// Zero until the first insert fixes it
    dimensions: usize,
}

impl VectorIndex {
    #[cfg(test)]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
            hashes: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity * dimensions),
            rows: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Insert or replace the embedding for `id`.
    ///
    /// Zero-norm vectors are rejected: they carry no direction to score against.
    pub fn insert(&mut self, id: u64, text_hash: u64, embedding: &[f32]) -> Result<(), IndexError> {
        if self.dimensions == 0 && self.is_empty() {
            self.dimensions = embedding.len();
        }

        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if l2_norm(embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        match self.rows.get(&id) {
            Some(&row) => {
                self.hashes[row] = text_hash;
                let start = row * self.dimensions;
                self.data[start..start + self.dimensions].copy_from_slice(embedding);
            }
            None => {
                self.rows.insert(id, self.ids.len());
                self.ids.push(id);
                self.hashes.push(text_hash);
                self.data.extend_from_slice(embedding);
            }
        }

        Ok(())
    }

    /// Remove by swapping the last row into the hole.
    pub fn remove(&mut self, id: u64) -> bool {
        let Some(row) = self.rows.remove(&id) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if row != last {
            let moved_id = self.ids[last];
            self.ids.swap(row, last);
            self.hashes.swap(row, last);
            let dims = self.dimensions;
            let (head, tail) = self.data.split_at_mut(last * dims);
            head[row * dims..(row + 1) * dims].copy_from_slice(&tail[..dims]);
            self.rows.insert(moved_id, row);
        }

        self.ids.pop();
        self.hashes.pop();
        self.data.truncate(last * self.dimensions);
        true
    }

    pub fn get(&self, id: u64) -> Option<VectorRef<'_>> {
        self.rows.get(&id).map(|&row| self.row(row))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = VectorRef<'_>> {
        (0..self.ids.len()).map(|row| self.row(row))
    }

    /// Copy of the rows for `ids` that are present, in the order given.
    pub fn subset(&self, ids: &[u64]) -> VectorIndex {
        let mut out = VectorIndex::with_capacity(self.dimensions, ids.len());
        for entry in ids.iter().filter_map(|id| self.get(*id)) {
            // rows were validated on the way in
            let _ = out.insert(entry.id, entry.text_hash, entry.embedding);
        }
        out
    }

    fn row(&self, row: usize) -> VectorRef<'_> {
        let start = row * self.dimensions;
        VectorRef {
            id: self.ids[row],
            text_hash: self.hashes[row],
            embedding: &self.data[start..start + self.dimensions],
        }
    }
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// `dot(a, b) / (|a| * |b|)`, clamped to [-1, 1].
///
/// Returns 0.0 when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store a zero-norm vector")]
    ZeroNormVector,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_fixes_dimensions() {
        let mut index = VectorIndex::new(0);
        index.insert(1, 10, &[1.0, 0.0]).unwrap();
        assert_eq!(index.dimensions(), 2);

        let result = index.insert(2, 20, &[1.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut index = VectorIndex::new(2);
        index.insert(1, 10, &[1.0, 0.0]).unwrap();
        index.insert(1, 11, &[0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 1);
        let entry = index.get(1).unwrap();
        assert_eq!(entry.text_hash, 11);
        assert_eq!(entry.embedding, &[0.0, 1.0]);
    }

    #[test]
    fn test_zero_norm_rejected() {
        let mut index = VectorIndex::new(3);
        let result = index.insert(1, 0, &[0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_keeps_other_rows_addressable() {
        let mut index = VectorIndex::new(2);
        index.insert(1, 10, &[1.0, 0.0]).unwrap();
        index.insert(2, 20, &[0.0, 1.0]).unwrap();
        index.insert(3, 30, &[1.0, 1.0]).unwrap();

        assert!(index.remove(1));
        assert!(!index.remove(1));
        assert_eq!(index.len(), 2);

        // row of id 3 moved into the hole
        assert_eq!(index.get(3).unwrap().embedding, &[1.0, 1.0]);
        assert_eq!(index.get(2).unwrap().embedding, &[0.0, 1.0]);
        assert!(index.get(1).is_none());
    }

    #[test]
    fn test_subset_preserves_order() {
        let mut index = VectorIndex::new(2);
        index.insert(1, 10, &[1.0, 0.0]).unwrap();
        index.insert(2, 20, &[0.0, 1.0]).unwrap();

        let sub = index.subset(&[2, 99, 1]);
        let ids: Vec<u64> = sub.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn test_cosine_bounds() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);

        let a = [0.3, -2.5, 7.1, 0.01];
        let b = [-4.0, 1.5, 0.2, 9.9];
        let score = cosine_similarity(&a, &b);
        assert!((-1.0..=1.0).contains(&score));

        // near-parallel vectors stay within bounds despite rounding
        let c = [1e-3, 1e-3, 1e-3];
        let d = [2e-3, 2e-3, 2e-3];
        assert!(cosine_similarity(&c, &d) <= 1.0);
    }

    #[test]
    fn test_cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
