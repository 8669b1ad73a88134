//! Hosted completion API backend (OpenAI `/v1/completions` wire format)

use super::{Backend, BackendError, BackendKind, RawCompletion};
use crate::api::Prompt;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the hosted completion API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// API key sent as a bearer token
    pub api_key: String,
    /// Model name (e.g., "gpt-3.5-turbo-instruct", "davinci-002")
    pub model: String,
    /// Base URL (default: https://api.openai.com/v1)
    pub base_url: Option<String>,
    /// Tokens generated when a prompt leaves max_tokens unset
    pub default_max_tokens: u32,
    /// Retries on HTTP 429 before giving up
    pub max_retries: u32,
    /// Context window used to reject over-long prompts before sending them
    pub context_window: Option<usize>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-3.5-turbo-instruct".to_string(),
            base_url: None,
            default_max_tokens: 16, // API default for the completions endpoint
            max_retries: 3,
            context_window: Some(4096),
            timeout_secs: 120,
        }
    }
}

/// Backend for an OpenAI-compatible completions endpoint
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { config, client }
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        format!("{}/completions", base.trim_end_matches('/'))
    }

    fn build_request(&self, prompt: &Prompt) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "prompt": prompt.text,
            "max_tokens": prompt.resolved_max_tokens(self.config.default_max_tokens),
            "temperature": prompt.temperature,
            "n": prompt.num_completions,
            "echo": prompt.echo,
            // Token boundaries only come back with logprobs, and stop
            // truncation needs them even when the caller asked for none.
            "logprobs": prompt.logprobs.max(1),
        });

        let stops: Vec<&str> = prompt.active_stops().collect();
        if !stops.is_empty() {
            body["stop"] = json!(stops);
        }

        body
    }

    /// Reject prompts that cannot fit, when the model's encoding is known
    fn check_prompt_length(&self, prompt: &Prompt) -> Result<(), BackendError> {
        let Some(limit) = self.config.context_window else {
            return Ok(());
        };
        let Ok(bpe) = tiktoken_rs::get_bpe_from_model(&self.config.model) else {
            debug!(model = %self.config.model, "no known encoding, skipping length check");
            return Ok(());
        };

        let prompt_tokens = bpe.encode_with_special_tokens(&prompt.text).len();
        let max_tokens = prompt.resolved_max_tokens(self.config.default_max_tokens);
        if prompt_tokens + max_tokens as usize > limit {
            return Err(BackendError::PromptTooLong {
                prompt_tokens,
                max_tokens,
                limit,
            });
        }
        Ok(())
    }

    fn parse_response(&self, prompt: &Prompt, response: Value) -> Result<Vec<RawCompletion>, BackendError> {
        let mut choices = response["choices"]
            .as_array()
            .cloned()
            .ok_or_else(|| BackendError::MalformedResponse("missing choices".to_string()))?;
        choices.sort_by_key(|c| c["index"].as_u64().unwrap_or(0));

        choices
            .iter()
            .map(|choice| parse_choice(prompt, choice))
            .collect()
    }

    async fn send_once(&self, body: &Value) -> Result<Value, (BackendError, Option<u64>)> {
        let response = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| (BackendError::Http(e), None))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| (BackendError::Http(e), None));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let error_text = response.text().await.unwrap_or_default();

        let err = match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(error_text),
            StatusCode::TOO_MANY_REQUESTS => BackendError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(0),
            },
            _ => BackendError::Provider(format!("{}: {}", status, error_text)),
        };
        Err((err, retry_after))
    }
}

/// Split one choice's token stream into prompt and completion halves
fn parse_choice(prompt: &Prompt, choice: &Value) -> Result<RawCompletion, BackendError> {
    let logprobs = &choice["logprobs"];
    let tokens: Vec<String> = logprobs["tokens"]
        .as_array()
        .ok_or_else(|| BackendError::MalformedResponse("missing logprobs.tokens".to_string()))?
        .iter()
        .map(|t| t.as_str().unwrap_or_default().to_string())
        .collect();
    let token_logprobs: Vec<Option<f64>> = logprobs["token_logprobs"]
        .as_array()
        .map(|lps| lps.iter().map(Value::as_f64).collect())
        .unwrap_or_default();
    if token_logprobs.len() != tokens.len() {
        return Err(BackendError::MalformedResponse(format!(
            "{} tokens but {} log-probabilities",
            tokens.len(),
            token_logprobs.len()
        )));
    }

    // With echo, everything starting before the end of the prompt text is a
    // prompt token. text_offset counts characters.
    let split = if prompt.echo {
        let prompt_chars = prompt.text.chars().count() as u64;
        let offsets: Vec<u64> = logprobs["text_offset"]
            .as_array()
            .map(|o| o.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        offsets.iter().take_while(|&&o| o < prompt_chars).count()
    } else {
        0
    };

    let completion_tokens = tokens[split..].to_vec();
    let completion_logprobs = token_logprobs[split..]
        .iter()
        .map(|lp| {
            lp.ok_or_else(|| BackendError::MalformedResponse("null completion log-probability".to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut raw = RawCompletion::from_decoded(completion_tokens, completion_logprobs);
    if prompt.echo {
        let mut prompt_logprobs = token_logprobs[..split].to_vec();
        if let Some(first) = prompt_logprobs.first_mut() {
            *first = None;
        }
        raw = raw.with_prompt(tokens[..split].to_vec(), prompt_logprobs);
    }
    Ok(raw)
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn namespace(&self) -> String {
        format!("{}/{}", BackendKind::OpenAi, self.config.model)
    }

    async fn predict_raw(&self, prompt: &Prompt) -> Result<Vec<RawCompletion>, BackendError> {
        self.check_prompt_length(prompt)?;
        let body = self.build_request(prompt);

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(json) => return self.parse_response(prompt, json),
                Err((BackendError::RateLimited { retry_after_secs }, retry_after))
                    if attempt < self.config.max_retries =>
                {
                    let wait = retry_after.unwrap_or(1u64 << attempt.min(6));
                    warn!(
                        attempt,
                        wait_secs = wait,
                        retry_after_secs,
                        "rate limited by completion API, retrying"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    fn default_tokens_generated(&self) -> u32 {
        self.config.default_max_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new(OpenAiConfig {
            api_key: "test".to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_request_body() {
        let prompt = Prompt::new("Once upon a")
            .with_max_tokens(1)
            .with_logprobs(0)
            .with_stop(["\n", ""]);
        let body = backend().build_request(&prompt);

        assert_eq!(body["max_tokens"], 1);
        assert_eq!(body["logprobs"], 1);
        assert_eq!(body["stop"], json!(["\n"]));
        assert_eq!(body["n"], 1);
    }

    #[test]
    fn test_request_body_without_stops() {
        let body = backend().build_request(&Prompt::new("x"));
        assert!(body.get("stop").is_none());
        assert_eq!(body["max_tokens"], 16);
    }

    #[test]
    fn test_parse_echo_response() {
        let prompt = Prompt::new("Once upon a").with_echo(true).with_max_tokens(1);
        let response = json!({
            "choices": [{
                "index": 0,
                "text": "Once upon a time",
                "logprobs": {
                    "tokens": ["Once", " upon", " a", " time"],
                    "token_logprobs": [null, -6.1, -0.4, -0.02],
                    "text_offset": [0, 4, 9, 11]
                }
            }]
        });
        let raw = backend().parse_response(&prompt, response).unwrap();

        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].completion_tokens, vec![" time"]);
        assert_eq!(raw[0].completion_logprobs, vec![-0.02]);
        assert_eq!(
            raw[0].prompt_tokens.as_deref(),
            Some(&["Once".to_string(), " upon".to_string(), " a".to_string()][..])
        );
        assert_eq!(raw[0].prompt_logprobs.as_ref().unwrap()[0], None);
    }

    #[test]
    fn test_parse_orders_choices_by_index() {
        let prompt = Prompt::new("x").with_num_completions(2);
        let response = json!({
            "choices": [
                {"index": 1, "logprobs": {"tokens": ["b"], "token_logprobs": [-1.0], "text_offset": [1]}},
                {"index": 0, "logprobs": {"tokens": ["a"], "token_logprobs": [-2.0], "text_offset": [1]}}
            ]
        });
        let raw = backend().parse_response(&prompt, response).unwrap();
        assert_eq!(raw[0].completion_tokens, vec!["a"]);
        assert_eq!(raw[1].completion_tokens, vec!["b"]);
    }

    #[test]
    fn test_parse_rejects_missing_logprobs() {
        let response = json!({"choices": [{"index": 0, "text": "hi", "logprobs": null}]});
        let err = backend()
            .parse_response(&Prompt::new("x"), response)
            .unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[test]
    fn test_namespace_includes_model() {
        assert_eq!(backend().namespace(), "openai/gpt-3.5-turbo-instruct");
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let backend = OpenAiBackend::new(OpenAiConfig {
            base_url: Some("http://localhost:8000/v1/".to_string()),
            ..Default::default()
        });
        assert_eq!(backend.endpoint(), "http://localhost:8000/v1/completions");
    }
}
