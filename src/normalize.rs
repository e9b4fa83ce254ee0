use std::ops::Deref;

use crate::error::DegenerateEmbedding;

/// Maximum distance from 1.0 tolerated for a vector's L2 norm to count as unit length.
pub const UNIT_TOLERANCE: f32 = 1e-5;

/// An embedding scaled to unit L2 norm.
///
/// The only way to build one is through [`normalize`] (or a snapshot that was
/// written from one), so the dot product of two `UnitEmbedding`s is their
/// cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEmbedding(Box<[f32]>);

impl UnitEmbedding {
    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Dot product with another unit vector, clamped to [-1, 1].
    pub fn similarity(&self, other: &UnitEmbedding) -> f32 {
        let dot: f32 = self.0.iter().zip(other.0.iter()).map(|(a, b)| a * b).sum();
        dot.clamp(-1.0, 1.0)
    }
}

impl Deref for UnitEmbedding {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

/// Scale `raw` to unit length: `raw / ||raw||₂`.
///
/// The norm is accumulated in f64 so vectors with large components do not
/// overflow before the division.
pub fn normalize(raw: &[f32]) -> Result<UnitEmbedding, DegenerateEmbedding> {
    if raw.is_empty() {
        return Err(DegenerateEmbedding::Empty);
    }
    if raw.iter().any(|x| !x.is_finite()) {
        return Err(DegenerateEmbedding::NonFinite);
    }

    let norm = raw
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();
    if norm == 0.0 {
        return Err(DegenerateEmbedding::ZeroNorm);
    }
    if !norm.is_finite() {
        return Err(DegenerateEmbedding::NonFinite);
    }

    let unit = raw.iter().map(|&x| (f64::from(x) / norm) as f32).collect();
    Ok(UnitEmbedding(unit))
}

impl UnitEmbedding {
    /// Re-admit a vector read back from a snapshot. Returns `None` unless it is
    /// finite and already unit length.
    pub(crate) fn from_stored(v: Vec<f32>) -> Option<Self> {
        if v.is_empty() || v.iter().any(|x| !x.is_finite()) || !is_unit(&v) {
            return None;
        }
        Some(Self(v.into_boxed_slice()))
    }
}

/// Whether `v` already has unit L2 norm within [`UNIT_TOLERANCE`].
pub fn is_unit(v: &[f32]) -> bool {
    let norm = v
        .iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt();
    (norm - 1.0).abs() <= f64::from(UNIT_TOLERANCE)
}
