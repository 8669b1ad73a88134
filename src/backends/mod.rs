//! Backend adapters
//!
//! The prediction core only talks to models through [`Backend`]: produce raw
//! tokens with log-probabilities for a prompt, report a default generation
//! length, and strip tokenizer markers for display.

mod local;
mod openai;

pub use local::{LocalBackend, LocalBackendConfig};
pub use openai::{OpenAiBackend, OpenAiConfig};

use crate::api::Prompt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Prompt is {prompt_tokens} tokens; with max_tokens {max_tokens} it exceeds the {limit}-token context window")]
    PromptTooLong {
        prompt_tokens: usize,
        max_tokens: u32,
        limit: usize,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    OpenAi,
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::OpenAi => write!(f, "openai"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "local" => Ok(BackendKind::Local),
            other => Err(format!("unknown backend '{}' (expected openai or local)", other)),
        }
    }
}

/// Untruncated output of one completion, as produced by a backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCompletion {
    /// Tokens in the backend's own representation
    pub completion_tokens: Vec<String>,
    /// Decoded text of each token; concatenated they form the completion text
    pub completion_pieces: Vec<String>,
    /// Log-probability of each token (may be empty if the backend gave none)
    pub completion_logprobs: Vec<f64>,
    /// Prompt tokens when echo was requested
    pub prompt_tokens: Option<Vec<String>>,
    /// Prompt log-probabilities when echo was requested
    pub prompt_logprobs: Option<Vec<Option<f64>>>,
}

impl RawCompletion {
    /// Build from tokens whose raw and decoded forms are identical
    pub fn from_decoded(tokens: Vec<String>, logprobs: Vec<f64>) -> Self {
        Self {
            completion_pieces: tokens.clone(),
            completion_tokens: tokens,
            completion_logprobs: logprobs,
            prompt_tokens: None,
            prompt_logprobs: None,
        }
    }

    pub fn with_prompt(mut self, tokens: Vec<String>, logprobs: Vec<Option<f64>>) -> Self {
        self.prompt_tokens = Some(tokens);
        self.prompt_logprobs = Some(logprobs);
        self
    }
}

/// A model the prediction core can call
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identity of the backend and model variant, used to namespace cache keys
    fn namespace(&self) -> String;

    /// Generate `prompt.num_completions` completions, ignoring stop strings
    /// the backend itself did not honour. `prompt.max_tokens` is already
    /// resolved when this is called.
    async fn predict_raw(&self, prompt: &Prompt) -> Result<Vec<RawCompletion>, BackendError>;

    /// Tokens generated when a prompt leaves `max_tokens` unset
    fn default_tokens_generated(&self) -> u32;

    /// Strip tokenizer-internal markers for human-readable comparison
    fn remove_special_chars_from_tokens(&self, tokens: &[String]) -> Vec<String> {
        tokens.to_vec()
    }
}

/// Replace byte-level BPE and SentencePiece markers with the text they encode
pub fn strip_token_markers(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            'Ġ' | '▁' => ' ',
            'Ċ' => '\n',
            'ĉ' => '\t',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_token_markers() {
        assert_eq!(strip_token_markers("ĠParis"), " Paris");
        assert_eq!(strip_token_markers("▁time"), " time");
        assert_eq!(strip_token_markers("ĊĊdef"), "\n\ndef");
        assert_eq!(strip_token_markers("plain"), "plain");
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("OpenAI".parse::<BackendKind>(), Ok(BackendKind::OpenAi));
        assert_eq!("local".parse::<BackendKind>(), Ok(BackendKind::Local));
        assert!("claude".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::OpenAi.to_string(), "openai");
    }

    #[test]
    fn test_raw_completion_from_decoded() {
        let raw = RawCompletion::from_decoded(vec![" time".into()], vec![-0.1])
            .with_prompt(vec!["Once".into()], vec![None]);
        assert_eq!(raw.completion_pieces, raw.completion_tokens);
        assert_eq!(raw.prompt_logprobs, Some(vec![None]));
    }
}
