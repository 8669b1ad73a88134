//! Prompt structures

use super::PromptError;
use serde::{Deserialize, Serialize};

/// A single generation request
///
/// Everything except `cache` describes what the backend should generate;
/// `cache` only controls whether the request goes through the disk cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// Text to continue
    pub text: String,

    /// Upper bound on generated tokens (`None` uses the backend default)
    pub max_tokens: Option<u32>,

    /// Stop strings, matched against generated text
    #[serde(default)]
    pub stop: Vec<String>,

    /// Sampling temperature (0 = greedy)
    pub temperature: f32,

    /// Number of independent completions
    pub num_completions: u32,

    /// Include prompt tokens and their log-probabilities in the result
    pub echo: bool,

    /// Top alternative log-probabilities to request per position
    pub logprobs: u32,

    /// Whether this request participates in the disk cache
    pub cache: bool,
}

impl Prompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            max_tokens: None,
            stop: Vec::new(),
            temperature: 1.0,
            num_completions: 1,
            echo: false,
            logprobs: 1,
            cache: true,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_num_completions(mut self, num_completions: u32) -> Self {
        self.num_completions = num_completions;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_logprobs(mut self, logprobs: u32) -> Self {
        self.logprobs = logprobs;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Token budget after falling back to the backend default
    pub fn resolved_max_tokens(&self, backend_default: u32) -> u32 {
        self.max_tokens.unwrap_or(backend_default)
    }

    /// Stop strings that can actually match (empty strings are ignored)
    pub fn active_stops(&self) -> impl Iterator<Item = &str> {
        self.stop.iter().map(String::as_str).filter(|s| !s.is_empty())
    }

    /// Whether sampling can produce different outputs for the same request
    pub fn is_sampled(&self) -> bool {
        self.temperature > 0.0
    }

    /// Check the request is something a backend can serve
    pub fn validate(&self) -> Result<(), PromptError> {
        if self.num_completions == 0 {
            return Err(PromptError::NoCompletions);
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(PromptError::InvalidTemperature(self.temperature));
        }
        Ok(())
    }
}
