//! Completion result structures

use super::Prompt;
use serde::{Deserialize, Serialize};

/// Output of one completion for a [`Prompt`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// The request that produced this result
    pub prompt: Prompt,

    /// Generated text after stop-sequence truncation
    pub completion_text: String,

    /// Raw generated tokens. A token cut by a stop string is kept whole here
    /// even though `completion_text` ends partway through it.
    pub completion_tokens: Vec<String>,

    /// Log-probability of each entry in `completion_tokens`
    pub completion_logprobs: Vec<f64>,

    /// Prompt tokens, only when echo was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<Vec<String>>,

    /// Prompt log-probabilities, only when echo was requested.
    /// The first prompt token has no conditional probability and is `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_logprobs: Option<Vec<Option<f64>>>,

    /// Set when this result was served from the disk cache
    #[serde(skip)]
    pub from_cache: bool,
}

impl CompletionResult {
    /// An empty completion, used when nothing is generated
    pub fn empty(prompt: Prompt) -> Self {
        Self {
            prompt,
            completion_text: String::new(),
            completion_tokens: Vec::new(),
            completion_logprobs: Vec::new(),
            prompt_tokens: None,
            prompt_logprobs: None,
            from_cache: false,
        }
    }

    /// Prompt text followed by the completion text
    pub fn full_text(&self) -> String {
        format!("{}{}", self.prompt.text, self.completion_text)
    }

    /// Echoed prompt tokens (if any) followed by completion tokens
    pub fn full_tokens(&self) -> Vec<String> {
        self.prompt_tokens
            .iter()
            .flatten()
            .chain(self.completion_tokens.iter())
            .cloned()
            .collect()
    }

    /// Echoed prompt log-probabilities (if any) followed by completion ones
    pub fn full_logprobs(&self) -> Vec<Option<f64>> {
        self.prompt_logprobs
            .iter()
            .flatten()
            .copied()
            .chain(self.completion_logprobs.iter().map(|lp| Some(*lp)))
            .collect()
    }

    /// Sum of completion log-probabilities
    pub fn completion_logprob_sum(&self) -> f64 {
        self.completion_logprobs.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.completion_tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echoed() -> CompletionResult {
        CompletionResult {
            prompt: Prompt::new("Once upon a").with_echo(true),
            completion_text: " time".to_string(),
            completion_tokens: vec![" time".to_string()],
            completion_logprobs: vec![-0.05],
            prompt_tokens: Some(vec!["Once".into(), " upon".into(), " a".into()]),
            prompt_logprobs: Some(vec![None, Some(-4.2), Some(-0.3)]),
            from_cache: false,
        }
    }

    #[test]
    fn test_full_views_with_echo() {
        let result = echoed();
        assert_eq!(result.full_text(), "Once upon a time");
        assert_eq!(result.full_tokens(), vec!["Once", " upon", " a", " time"]);
        assert_eq!(result.full_logprobs().len(), 4);
        assert_eq!(result.full_logprobs()[0], None);
        assert_eq!(result.full_logprobs()[3], Some(-0.05));
    }

    #[test]
    fn test_full_views_without_echo() {
        let mut result = echoed();
        result.prompt_tokens = None;
        result.prompt_logprobs = None;
        assert_eq!(result.full_tokens(), vec![" time"]);
        assert_eq!(result.full_logprobs(), vec![Some(-0.05)]);
    }

    #[test]
    fn test_from_cache_is_not_persisted() {
        let mut result = echoed();
        result.from_cache = true;
        let json = serde_json::to_string(&result).unwrap();
        let back: CompletionResult = serde_json::from_str(&json).unwrap();
        assert!(!back.from_cache);
        assert_eq!(back.prompt_logprobs, result.prompt_logprobs);
    }

    #[test]
    fn test_empty() {
        let result = CompletionResult::empty(Prompt::new("I like pie"));
        assert!(result.is_empty());
        assert_eq!(result.completion_logprob_sum(), 0.0);
        assert_eq!(result.full_text(), "I like pie");
    }
}
