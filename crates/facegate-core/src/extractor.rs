//! Face embedding extraction capability
//!
//! The core never decodes images itself. It is handed an [`Extractor`],
//! which is either backed by a real [`FaceExtractor`] or explicitly not
//! configured. A missing extractor is a configuration fault and is kept
//! apart from "no face in this photo" at the type level.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Face extractor is not configured")]
    NotConfigured,

    #[error("Unreadable image: {0}")]
    UnreadableImage(String),

    #[error("Extractor backend failed: {0}")]
    Backend(String),

    #[error("Extractor returned invalid output: {0}")]
    InvalidOutput(String),
}

impl ExtractError {
    /// Errors caused by the submitted image rather than by the deployment
    pub fn is_input_error(&self) -> bool {
        matches!(self, ExtractError::UnreadableImage(_))
    }
}

/// Turns an encoded image into a face embedding
///
/// Returns `Ok(None)` when no face is detected. When several faces are
/// present only the first one is used.
pub trait FaceExtractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Option<Vec<f32>>, ExtractError>;

    /// Short name for logs and health output
    fn name(&self) -> &str {
        "extractor"
    }
}

/// Injected extraction capability
#[derive(Clone, Default)]
pub enum Extractor {
    Configured(Arc<dyn FaceExtractor>),
    #[default]
    NotConfigured,
}

impl Extractor {
    pub fn new(inner: impl FaceExtractor + 'static) -> Self {
        Extractor::Configured(Arc::new(inner))
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Extractor::Configured(_))
    }

    pub fn extract(&self, image: &[u8]) -> Result<Option<Vec<f32>>, ExtractError> {
        match self {
            Extractor::Configured(inner) => inner.extract(image),
            Extractor::NotConfigured => Err(ExtractError::NotConfigured),
        }
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extractor::Configured(inner) => write!(f, "Extractor::Configured({})", inner.name()),
            Extractor::NotConfigured => write!(f, "Extractor::NotConfigured"),
        }
    }
}

/// Extractor that answers every image with a fixed result
///
/// Useful for tests and demos where no real model is deployed.
#[derive(Debug, Clone)]
pub struct StaticExtractor {
    embedding: Option<Vec<f32>>,
}

impl StaticExtractor {
    pub fn face(embedding: Vec<f32>) -> Self {
        Self {
            embedding: Some(embedding),
        }
    }

    pub fn no_face() -> Self {
        Self { embedding: None }
    }
}

impl FaceExtractor for StaticExtractor {
    fn extract(&self, image: &[u8]) -> Result<Option<Vec<f32>>, ExtractError> {
        if image.is_empty() {
            return Err(ExtractError::UnreadableImage("empty image".into()));
        }
        Ok(self.embedding.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}
