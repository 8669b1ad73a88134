//! Prediction facade over a backend and the disk cache
//!
//! A [`LanguageModel`] owns one backend and, optionally, a handle to a
//! [`DiskCache`]. Requests are fingerprinted together with the backend
//! namespace; cache hits skip the backend entirely, misses are generated,
//! truncated at stop strings and written back as new variants.

use crate::api::{CompletionResult, Prompt, PromptError};
use crate::backends::{Backend, BackendError, RawCompletion};
use crate::cache::{fingerprint, CacheError, CacheMetrics, CacheTracker, DiskCache, Fingerprint};
use crate::stop::{apply_stops, StopError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Invalid prompt: {0}")]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Stop handling failed: {0}")]
    Stop(#[from] StopError),
}

/// A backend plus optional request-level caching
#[derive(Clone)]
pub struct LanguageModel {
    backend: Arc<dyn Backend>,
    cache: Option<Arc<DiskCache>>,
    tracker: CacheTracker,
}

impl LanguageModel {
    /// A model that always calls the backend
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            cache: None,
            tracker: CacheTracker::new(),
        }
    }

    /// A model that serves repeated prompts from `cache`
    pub fn with_cache(backend: Arc<dyn Backend>, cache: Arc<DiskCache>) -> Self {
        Self {
            backend,
            cache: Some(cache),
            tracker: CacheTracker::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> Option<&Arc<DiskCache>> {
        self.cache.as_ref()
    }

    /// Cache key for `prompt` on this model's backend
    pub fn fingerprint(&self, prompt: &Prompt) -> Fingerprint {
        fingerprint(prompt, &self.backend.namespace())
    }

    pub fn default_tokens_generated(&self) -> u32 {
        self.backend.default_tokens_generated()
    }

    pub fn remove_special_chars_from_tokens(&self, tokens: &[String]) -> Vec<String> {
        self.backend.remove_special_chars_from_tokens(tokens)
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.tracker.get_metrics()
    }

    /// Predict a single completion; with `num_completions > 1` the first is returned
    pub async fn predict(&self, prompt: &Prompt) -> Result<CompletionResult, PredictError> {
        let mut results = self.predict_many(prompt).await?;
        // predict_many always yields num_completions >= 1 results
        Ok(results.swap_remove(0))
    }

    /// Predict `prompt.num_completions` completions
    pub async fn predict_many(&self, prompt: &Prompt) -> Result<Vec<CompletionResult>, PredictError> {
        prompt.validate()?;
        let wanted = prompt.num_completions as usize;
        let max_tokens = prompt.resolved_max_tokens(self.backend.default_tokens_generated());

        if max_tokens == 0 && !prompt.echo {
            debug!("zero-token prompt without echo, skipping backend");
            return Ok(vec![CompletionResult::empty(prompt.clone()); wanted]);
        }

        let key = self.fingerprint(prompt);
        let cache = self.cache.as_ref().filter(|_| prompt.cache);

        if let Some(cache) = cache {
            match lookup(cache, &key, wanted).await {
                Ok(Some(hit)) => {
                    debug!(key = %key, "cache hit");
                    self.tracker.hit();
                    return Ok(hit);
                }
                Ok(None) => {
                    debug!(key = %key, "cache miss");
                    self.tracker.miss();
                }
                Err(err) => {
                    warn!(key = %key, "cache read failed, treating as miss: {}", err);
                    self.tracker.miss();
                }
            }
        }

        let mut request = prompt.clone();
        request.max_tokens = Some(max_tokens);

        info!(
            backend = %self.backend.namespace(),
            completions = wanted,
            max_tokens,
            "requesting completions"
        );
        let raw = self.backend.predict_raw(&request).await?;
        if raw.len() < wanted {
            return Err(BackendError::MalformedResponse(format!(
                "expected {} completions, got {}",
                wanted,
                raw.len()
            ))
            .into());
        }

        let results = raw
            .into_iter()
            .take(wanted)
            .map(|raw| finish(prompt, max_tokens, raw))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(cache) = cache {
            self.store(cache, &key, &results).await;
        }

        Ok(results)
    }

    /// Forget every cached variant for `prompt`
    ///
    /// Returns whether anything was removed. Without a cache this is a no-op.
    pub async fn remove_prompt_from_cache(&self, prompt: &Prompt) -> Result<bool, CacheError> {
        let Some(cache) = &self.cache else {
            return Ok(false);
        };

        let key = self.fingerprint(prompt);
        let removed = blocking(cache, move |cache| cache.remove(&key)).await?;
        if removed {
            self.tracker.removal();
        }
        Ok(removed)
    }

    /// Write a freshly generated batch; failures are logged, never returned
    async fn store(&self, cache: &Arc<DiskCache>, key: &Fingerprint, results: &[CompletionResult]) {
        let key_owned = key.clone();
        let batch = results.to_vec();
        match blocking(cache, move |cache| cache.put_many(&key_owned, &batch)).await {
            Ok(()) => {
                for _ in results {
                    self.tracker.write(true);
                }
            }
            Err(err @ CacheError::CapacityExceeded { .. }) => {
                warn!(key = %key, "{}; returning uncached result", err);
                self.tracker.write(false);
            }
            Err(err) => {
                warn!(key = %key, "failed to cache completion: {}", err);
                self.tracker.write(false);
            }
        }
    }
}

/// Newest `wanted` variants under `key`, if the store holds that many
async fn lookup(
    cache: &Arc<DiskCache>,
    key: &Fingerprint,
    wanted: usize,
) -> Result<Option<Vec<CompletionResult>>, CacheError> {
    let key = key.clone();
    let mut variants = blocking(cache, move |cache| cache.variants(&key)).await?;
    if variants.len() < wanted {
        return Ok(None);
    }

    let mut hit = variants.split_off(variants.len() - wanted);
    for result in &mut hit {
        result.from_cache = true;
    }
    Ok(Some(hit))
}

/// Run a store operation off the async runtime
async fn blocking<T, F>(cache: &Arc<DiskCache>, op: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce(&DiskCache) -> Result<T, CacheError> + Send + 'static,
{
    let cache = Arc::clone(cache);
    tokio::task::spawn_blocking(move || op(&cache))
        .await
        .map_err(|err| CacheError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?
}

/// Turn one raw backend completion into a result for `prompt`
fn finish(prompt: &Prompt, max_tokens: u32, raw: RawCompletion) -> Result<CompletionResult, PredictError> {
    let mut result = CompletionResult::empty(prompt.clone());
    result.prompt_tokens = raw.prompt_tokens;
    result.prompt_logprobs = raw.prompt_logprobs;
    if !prompt.echo {
        result.prompt_tokens = None;
        result.prompt_logprobs = None;
    }

    if max_tokens == 0 {
        return Ok(result);
    }

    if raw.completion_logprobs.len() != raw.completion_tokens.len() {
        return Err(BackendError::MalformedResponse(format!(
            "{} completion tokens but {} log-probabilities",
            raw.completion_tokens.len(),
            raw.completion_logprobs.len()
        ))
        .into());
    }

    let stopped = apply_stops(
        raw.completion_tokens,
        &raw.completion_pieces,
        raw.completion_logprobs,
        prompt.active_stops(),
    )?;
    result.completion_text = stopped.text;
    result.completion_tokens = stopped.tokens;
    result.completion_logprobs = stopped.logprobs;
    Ok(result)
}
