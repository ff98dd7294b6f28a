//! Distance primitives over `f32` embeddings
//!
//! Face encodings are small (typically 128 floats) and a single identity
//! holds at most a handful of them, so every function here is a plain scalar
//! loop that LLVM auto-vectorizes.
//!
//! For L2-normalized vectors the dot product equals cosine similarity:
//! ```text
//! cos(θ) = A · B  when ||A|| = ||B|| = 1
//! ```

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MathError {
    #[error("Vector has zero norm and cannot be normalized")]
    ZeroNorm,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Compute dot product of two vectors
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Compute squared L2 (Euclidean) distance between two vectors
#[inline]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Compute L2 (Euclidean) distance between two vectors
///
/// Returns ||a - b||
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

/// L2 norm of a vector
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// L2 normalize a vector, returning a new vector
///
/// A zero (or non-finite) norm is rejected with `MathError::ZeroNorm`.
pub fn l2_normalized(v: &[f32]) -> Result<Vec<f32>, MathError> {
    let norm = l2_norm(v);
    if norm == 0.0 || !norm.is_finite() {
        return Err(MathError::ZeroNorm);
    }
    Ok(v.iter().map(|x| x / norm).collect())
}

/// Check that lengths agree before any pairwise computation
pub fn check_dims(expected: usize, actual: usize) -> Result<(), MathError> {
    if expected != actual {
        return Err(MathError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

/// True when every component is a finite float
pub fn is_finite_vector(v: &[f32]) -> bool {
    v.iter().all(|x| x.is_finite())
}
