//! Locally-run transformer model behind a text-generation server
//!
//! Talks to the `/generate` endpoint of a Hugging Face text-generation-inference
//! style server running on this machine.

use super::{strip_token_markers, Backend, BackendError, BackendKind, RawCompletion};
use crate::api::Prompt;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Configuration for the local model server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    /// Server URL
    pub url: String,
    /// Model served (e.g., "gpt2"); part of the cache namespace
    pub model: String,
    /// Tokens generated when a prompt leaves max_tokens unset
    pub default_max_tokens: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            model: "gpt2".to_string(),
            default_max_tokens: 20,
            timeout_secs: 300,
        }
    }
}

/// Backend for a local text-generation server
pub struct LocalBackend {
    config: LocalBackendConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    details: GenerateDetails,
}

#[derive(Debug, Deserialize)]
struct GenerateDetails {
    #[serde(default)]
    prefill: Vec<TokenInfo>,
    tokens: Vec<TokenInfo>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    text: String,
    logprob: Option<f64>,
    #[serde(default)]
    special: bool,
}

impl LocalBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    fn build_request(&self, prompt: &Prompt) -> Value {
        // The server always generates at least one token; a zero budget is
        // honoured by discarding it afterwards.
        let max_new_tokens = prompt
            .resolved_max_tokens(self.config.default_max_tokens)
            .max(1);

        let mut parameters = json!({
            "max_new_tokens": max_new_tokens,
            "details": true,
            "decoder_input_details": prompt.echo,
            "return_full_text": false,
            "do_sample": prompt.is_sampled(),
        });

        if prompt.is_sampled() {
            parameters["temperature"] = json!(prompt.temperature);
        }
        if prompt.logprobs > 0 {
            parameters["top_n_tokens"] = json!(prompt.logprobs);
        }

        let stops: Vec<&str> = prompt.active_stops().collect();
        if !stops.is_empty() {
            parameters["stop"] = json!(stops);
        }

        json!({
            "inputs": prompt.text,
            "parameters": parameters,
        })
    }

    fn parse_response(&self, prompt: &Prompt, response: Value) -> Result<RawCompletion, BackendError> {
        // Some server versions wrap the single generation in an array
        let response = match response {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        let parsed: GenerateResponse = serde_json::from_value(response)?;

        let mut tokens = Vec::new();
        let mut logprobs = Vec::new();
        if prompt.resolved_max_tokens(self.config.default_max_tokens) > 0 {
            for token in parsed.details.tokens.iter().filter(|t| !t.special) {
                tokens.push(token.text.clone());
                logprobs.push(token.logprob.ok_or_else(|| {
                    BackendError::MalformedResponse("generated token without log-probability".to_string())
                })?);
            }
        }

        let mut raw = RawCompletion::from_decoded(tokens, logprobs);
        if prompt.echo {
            let prompt_tokens = parsed.details.prefill.iter().map(|t| t.text.clone()).collect();
            let mut prompt_logprobs: Vec<Option<f64>> =
                parsed.details.prefill.iter().map(|t| t.logprob).collect();
            if let Some(first) = prompt_logprobs.first_mut() {
                *first = None;
            }
            raw = raw.with_prompt(prompt_tokens, prompt_logprobs);
        }
        Ok(raw)
    }

    async fn generate_once(&self, prompt: &Prompt) -> Result<RawCompletion, BackendError> {
        let response = self
            .client
            .post(format!("{}/generate", self.config.url.trim_end_matches('/')))
            .json(&self.build_request(prompt))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Provider(format!(
                "local model server returned {}: {}",
                status, error_text
            )));
        }

        let json: Value = response.json().await?;
        self.parse_response(prompt, json)
    }

    /// Check if the local server is reachable
    pub async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/health", self.config.url.trim_end_matches('/')))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn namespace(&self) -> String {
        format!("{}/{}", BackendKind::Local, self.config.model)
    }

    async fn predict_raw(&self, prompt: &Prompt) -> Result<Vec<RawCompletion>, BackendError> {
        let mut completions = Vec::with_capacity(prompt.num_completions as usize);
        for i in 0..prompt.num_completions {
            debug!(completion = i, model = %self.config.model, "generating with local model");
            completions.push(self.generate_once(prompt).await?);
        }
        Ok(completions)
    }

    fn default_tokens_generated(&self) -> u32 {
        self.config.default_max_tokens
    }

    fn remove_special_chars_from_tokens(&self, tokens: &[String]) -> Vec<String> {
        tokens.iter().map(|t| strip_token_markers(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LocalBackend {
        LocalBackend::new(LocalBackendConfig::default())
    }

    #[test]
    fn test_greedy_request_has_no_temperature() {
        let body = backend().build_request(&Prompt::new("Once upon a").with_temperature(0.0));
        assert_eq!(body["parameters"]["do_sample"], false);
        assert!(body["parameters"].get("temperature").is_none());
        assert_eq!(body["parameters"]["max_new_tokens"], 20);
    }

    #[test]
    fn test_zero_budget_requests_one_token() {
        let body = backend().build_request(&Prompt::new("I like pie").with_max_tokens(0));
        assert_eq!(body["parameters"]["max_new_tokens"], 1);
    }

    #[test]
    fn test_parse_echo_and_special_tokens() {
        let prompt = Prompt::new("Once upon a").with_echo(true).with_max_tokens(2);
        let response = json!([{
            "generated_text": " time",
            "details": {
                "prefill": [
                    {"id": 7454, "text": "Once", "logprob": null},
                    {"id": 2402, "text": " upon", "logprob": -5.9},
                    {"id": 257, "text": " a", "logprob": -0.5}
                ],
                "tokens": [
                    {"id": 640, "text": " time", "logprob": -0.03, "special": false},
                    {"id": 50256, "text": "<|endoftext|>", "logprob": -3.0, "special": true}
                ]
            }
        }]);
        let raw = backend().parse_response(&prompt, response).unwrap();

        assert_eq!(raw.completion_tokens, vec![" time"]);
        assert_eq!(raw.completion_logprobs, vec![-0.03]);
        assert_eq!(raw.prompt_tokens.as_ref().map(Vec::len), Some(3));
        assert_eq!(raw.prompt_logprobs.as_ref().unwrap()[0], None);
    }

    #[test]
    fn test_parse_zero_budget_discards_generation() {
        let prompt = Prompt::new("I like pie").with_echo(true).with_max_tokens(0);
        let response = json!({
            "details": {
                "prefill": [
                    {"text": "I", "logprob": null},
                    {"text": " like", "logprob": -4.0},
                    {"text": " pie", "logprob": -7.5}
                ],
                "tokens": [{"text": ",", "logprob": -1.2, "special": false}]
            }
        });
        let raw = backend().parse_response(&prompt, response).unwrap();
        assert!(raw.completion_tokens.is_empty());
        assert_eq!(raw.prompt_tokens.map(|t| t.len()), Some(3));
    }

    #[test]
    fn test_marker_stripping() {
        let tokens = vec!["ĠParis".to_string(), "Ċ".to_string()];
        assert_eq!(
            backend().remove_special_chars_from_tokens(&tokens),
            vec![" Paris", "\n"]
        );
    }
}
