//! Request-level disk cache for completions
//!
//! Prompts are fingerprinted together with the backend that serves them and
//! stored on local disk, so repeated requests never hit the model twice.
//!
//! ## Layout
//!
//! ```text
//! <dir>/
//!   staging/                     in-flight writes
//!   shard-00/ .. shard-NN/
//!     <fingerprint>/
//!       <nanos>-<uuid>.json      one file per cached variant
//! ```
//!
//! Each variant becomes visible through a single rename, and removing a key
//! renames its directory out of the shard first, so concurrent processes only
//! ever see complete entries or none.

mod fingerprint;
mod store;
mod tracker;

pub use fingerprint::{fingerprint, Fingerprint};
pub use store::DiskCache;
pub use tracker::{CacheMetrics, CacheTracker};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Default bound on the total size of the store (50 GB)
pub const DEFAULT_SIZE_LIMIT: u64 = 50_000_000_000;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache is full: {needed} more bytes would exceed the {limit}-byte limit ({used} used)")]
    CapacityExceeded { limit: u64, used: u64, needed: u64 },

    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the disk store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the store
    pub dir: PathBuf,
    /// Maximum total bytes; writes beyond this fail instead of evicting
    pub size_limit: u64,
    /// Number of shard directories
    pub shards: usize,
    /// Variants kept per key; older ones are pruned on write
    pub max_variants: usize,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_size_limit(mut self, size_limit: u64) -> Self {
        self.size_limit = size_limit;
        self
    }

    pub fn with_max_variants(mut self, max_variants: usize) -> Self {
        self.max_variants = max_variants;
        self
    }

    /// Default location under the user cache directory
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lm-predict")
            .join("lm_model_cache")
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            size_limit: DEFAULT_SIZE_LIMIT,
            shards: 4,
            max_variants: 8,
        }
    }
}
