pub mod pipe;
pub mod progress;
pub mod store;
pub mod uploader;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use validator::Validate;

pub static DEFAULT_MAX_CONCURRENCY: usize = 10;
pub static DEFAULT_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Upload tuning. Zero or missing values fall back to the defaults.
#[skip_serializing_none]
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    pub max_concurrency: Option<usize>,
    pub part_size: Option<u64>,
}

impl UploadConfig {
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    pub fn part_size(&self) -> u64 {
        self.part_size.filter(|n| *n > 0).unwrap_or(DEFAULT_PART_SIZE)
    }
}
