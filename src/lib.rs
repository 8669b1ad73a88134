//! lm_predict - Cached predictions over hosted and local language models
//!
//! This library gives one prediction interface over a hosted completion API
//! and a locally served transformer model, with a request-level disk cache so
//! the same prompt is never generated twice unless asked to.
//!
//! ## Key Features
//!
//! - **Prompt fingerprinting**: Cache keys cover every field that changes generation
//! - **Disk cache**: Sharded, size-bounded, safe across processes, single-key removal
//! - **Stop sequences**: Truncation on decoded text, even mid-token
//! - **Sampled variants**: Repeated sampled requests replay until explicitly forgotten

pub mod api;
pub mod backends;
pub mod cache;
pub mod config;
pub mod model;
pub mod stop;

pub use api::{CompletionResult, Prompt, PromptError};
pub use backends::{
    Backend, BackendError, BackendKind, LocalBackend, LocalBackendConfig, OpenAiBackend,
    OpenAiConfig, RawCompletion,
};
pub use cache::{CacheConfig, CacheError, CacheMetrics, CacheTracker, DiskCache, Fingerprint};
pub use config::{Config, ConfigBuilder, ConfigError};
pub use model::{LanguageModel, PredictError};
pub use stop::{apply_stops, StopError};
