//! Nearest-reference matching of a query embedding against stored slots
//!
//! The distance between a query and an identity is the minimum distance to
//! any of its stored embeddings, so a query matches when it is close enough
//! to at least one enrollment photo.
//!
//! | Metric      | Distance per stored vector `s`                  | Range   |
//! |-------------|-------------------------------------------------|---------|
//! | `Euclidean` | `‖s − q‖₂`                                      | [0, ∞)  |
//! | `Cosine`    | `1 − (s/‖s‖) · (q/‖q‖)`                         | [0, 2]  |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extractor::{ExtractError, Extractor};
use crate::math::{
    check_dims, dot_product, is_finite_vector, l2_distance, l2_normalized, MathError,
};
use crate::slots::EmbeddingSlots;

/// Default match threshold for Euclidean distance on face encodings
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("No reference embeddings to compare against")]
    NoReference,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Vector has zero norm and cannot be normalized")]
    ZeroNorm,

    #[error("Query embedding contains non-finite values")]
    NonFinite,

    #[error("Unsupported metric: {0}")]
    UnsupportedMetric(String),

    #[error("Face extractor is not configured")]
    ExtractorUnavailable,

    #[error("Extraction failed: {0}")]
    Extract(ExtractError),
}

impl From<MathError> for MatchError {
    fn from(e: MathError) -> Self {
        match e {
            MathError::ZeroNorm => MatchError::ZeroNorm,
            MathError::DimensionMismatch { expected, actual } => {
                MatchError::DimensionMismatch { expected, actual }
            }
        }
    }
}

impl From<ExtractError> for MatchError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NotConfigured => MatchError::ExtractorUnavailable,
            other => MatchError::Extract(other),
        }
    }
}

impl MatchError {
    /// Errors caused by the caller's input rather than the deployment
    pub fn is_input_error(&self) -> bool {
        match self {
            MatchError::DimensionMismatch { .. }
            | MatchError::ZeroNorm
            | MatchError::NonFinite
            | MatchError::UnsupportedMetric(_) => true,
            MatchError::Extract(e) => e.is_input_error(),
            MatchError::NoReference | MatchError::ExtractorUnavailable => false,
        }
    }
}

/// Distance function used to compare embeddings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Euclidean,
    Cosine,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = MatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            other => Err(MatchError::UnsupportedMetric(other.to_string())),
        }
    }
}

/// Minimum distance from `query` to any vector in `stored`
pub fn best_distance(query: &[f32], stored: &[&[f32]], metric: Metric) -> Result<f32, MatchError> {
    if stored.is_empty() {
        return Err(MatchError::NoReference);
    }
    for s in stored {
        check_dims(s.len(), query.len())?;
    }
    if !is_finite_vector(query) {
        return Err(MatchError::NonFinite);
    }

    let best = match metric {
        Metric::Euclidean => stored
            .iter()
            .map(|s| l2_distance(s, query))
            .fold(f32::INFINITY, f32::min),
        Metric::Cosine => {
            let q = l2_normalized(query)?;
            let mut best = f32::INFINITY;
            for s in stored {
                let n = l2_normalized(s)?;
                let d = (1.0 - dot_product(&n, &q)).clamp(0.0, 2.0);
                best = best.min(d);
            }
            best
        }
    };
    Ok(best)
}

/// True iff the closest stored embedding is within `threshold`
///
/// An identity with no stored embeddings never matches.
pub fn matches(
    slots: &EmbeddingSlots,
    query: &[f32],
    threshold: f32,
    metric: Metric,
) -> Result<bool, MatchError> {
    if slots.is_empty() {
        return Ok(false);
    }
    let distance = best_distance(query, &slots.all_vectors(), metric)?;
    Ok(distance <= threshold)
}

/// Extract an embedding from `image` and match it with the Euclidean metric
///
/// No stored embeddings or no detected face yield `Ok(false)`; a missing
/// extractor yields `MatchError::ExtractorUnavailable`.
pub fn matches_image(
    slots: &EmbeddingSlots,
    image: &[u8],
    threshold: f32,
    extractor: &Extractor,
) -> Result<bool, MatchError> {
    if slots.is_empty() {
        return Ok(false);
    }
    match extractor.extract(image)? {
        Some(query) => matches(slots, &query, threshold, Metric::Euclidean),
        None => Ok(false),
    }
}

/// Matching policy: threshold plus default metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub threshold: f32,
    pub metric: Metric,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            metric: Metric::Euclidean,
        }
    }
}

/// Outcome of a scored comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub matched: bool,
    /// `None` when there was nothing to compare against or no face was found
    pub distance: Option<f32>,
    pub metric: Metric,
    pub threshold: f32,
}

/// Matcher bound to a fixed policy
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    config: MatchConfig,
}

impl Matcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Compare a query embedding using the configured threshold
    pub fn score(
        &self,
        slots: &EmbeddingSlots,
        query: &[f32],
        metric: Option<Metric>,
    ) -> Result<MatchOutcome, MatchError> {
        let metric = metric.unwrap_or(self.config.metric);
        let distance = if slots.is_empty() {
            None
        } else {
            Some(best_distance(query, &slots.all_vectors(), metric)?)
        };
        Ok(self.outcome(distance, metric))
    }

    /// Extract from an image, then compare with the Euclidean metric
    pub fn score_image(
        &self,
        slots: &EmbeddingSlots,
        image: &[u8],
        extractor: &Extractor,
    ) -> Result<MatchOutcome, MatchError> {
        let metric = Metric::Euclidean;
        if slots.is_empty() {
            return Ok(self.outcome(None, metric));
        }
        let distance = match extractor.extract(image)? {
            Some(query) => Some(best_distance(&query, &slots.all_vectors(), metric)?),
            None => None,
        };
        Ok(self.outcome(distance, metric))
    }

    fn outcome(&self, distance: Option<f32>, metric: Metric) -> MatchOutcome {
        MatchOutcome {
            matched: distance.is_some_and(|d| d <= self.config.threshold),
            distance,
            metric,
            threshold: self.config.threshold,
        }
    }
}
