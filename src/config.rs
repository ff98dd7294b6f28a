use std::path::PathBuf;

use facegate_core::{MatchConfig, DEFAULT_CONFLICT_RETRIES, DEFAULT_SLOT_CAPACITY};

/// Largest accepted image upload, in bytes
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding `identities.json`; `None` keeps records in memory
    pub data_dir: Option<PathBuf>,
    /// Where enrollment photos are kept; their paths become slot provenance
    pub image_dir: Option<PathBuf>,
    pub matching: MatchConfig,
    pub slot_capacity: usize,
    pub conflict_retries: usize,
    pub max_image_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            image_dir: None,
            matching: MatchConfig::default(),
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

impl ServiceConfig {
    pub fn from_data_dir(data_dir: PathBuf) -> Self {
        let image_dir = data_dir.join("faces");
        Self {
            data_dir: Some(data_dir),
            image_dir: Some(image_dir),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slot_capacity == 0 {
            anyhow::bail!("slot capacity must be at least 1");
        }
        if self.matching.threshold.is_nan() {
            anyhow::bail!("match threshold must be a number");
        }
        if self.max_image_bytes == 0 {
            anyhow::bail!("max image size must be > 0");
        }
        Ok(())
    }
}
