use std::cmp::Ordering;

use ndarray::{ArrayView1, ArrayView2};

use crate::error::IndexError;
use crate::normalize::UnitEmbedding;

/// One search hit: insertion position and dot-product similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub similarity: f32,
}

/// Append-only flat index of unit embeddings.
///
/// Rows live back to back in one buffer so appends are amortized O(1) and a
/// search is a single matrix-vector product over an `ndarray` view.
#[derive(Debug, Clone)]
pub struct IdentityIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl IdentityIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn size(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append `embedding` and return the zero-based position it was given.
    pub fn insert(&mut self, embedding: &UnitEmbedding) -> Result<usize, IndexError> {
        self.check_dimension(embedding)?;
        let position = self.size();
        self.data.extend_from_slice(embedding.as_slice());
        Ok(position)
    }

    /// Stored vector at `position`.
    pub fn get(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end)
    }

    /// Row-wise iterator in position order.
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// The `k` most similar entries, highest similarity first. Equal scores
    /// keep the earliest position first. An empty index yields no neighbors.
    pub fn search(&self, query: &UnitEmbedding, k: usize) -> Result<Vec<Neighbor>, IndexError> {
        self.check_dimension(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let matrix = ArrayView2::from_shape((self.size(), self.dimension), &self.data)
            .map_err(|_| IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: self.data.len(),
            })?;
        let q = ArrayView1::from(query.as_slice());
        let scores = matrix.dot(&q);

        let mut hits: Vec<Neighbor> = scores
            .iter()
            .enumerate()
            .map(|(position, &s)| Neighbor {
                position,
                similarity: s.clamp(-1.0, 1.0),
            })
            .collect();

        if k < hits.len() {
            hits.select_nth_unstable_by(k - 1, rank);
            hits.truncate(k);
        }
        hits.sort_unstable_by(rank);

        log::debug!(
            "searched {} entries, best {:?}",
            self.size(),
            hits.first().map(|n| n.similarity)
        );
        Ok(hits)
    }

    fn check_dimension(&self, embedding: &UnitEmbedding) -> Result<(), IndexError> {
        if embedding.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        Ok(())
    }
}

// Descending similarity, then ascending position.
fn rank(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then(a.position.cmp(&b.position))
}
