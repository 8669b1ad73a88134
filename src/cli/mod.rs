//! Command-line argument types and output rendering

pub mod spinner;

use clap::Args;
use lm_predict::{BackendKind, CompletionResult, Prompt};

/// Flags shared by every command that builds a prompt
#[derive(Args, Debug, Clone)]
pub struct PromptArgs {
    /// Prompt text
    pub text: String,

    /// Backend to use (openai, local); defaults to the configured one
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Model name, overriding the configured one
    #[arg(short, long)]
    pub model: Option<String>,

    /// Tokens to generate (backend default when omitted)
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Stop string; may be repeated
    #[arg(short, long)]
    pub stop: Vec<String>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value = "1.0")]
    pub temperature: f32,

    /// Number of completions
    #[arg(short = 'n', long, default_value = "1")]
    pub num_completions: u32,

    /// Include prompt tokens and log-probabilities
    #[arg(long)]
    pub echo: bool,

    /// Top alternatives to request per position
    #[arg(long, default_value = "1")]
    pub logprobs: u32,

    /// Bypass the disk cache for this request
    #[arg(long)]
    pub no_cache: bool,
}

impl PromptArgs {
    pub fn to_prompt(&self) -> Prompt {
        let mut prompt = Prompt::new(self.text.clone())
            .with_stop(self.stop.iter().cloned())
            .with_temperature(self.temperature)
            .with_num_completions(self.num_completions)
            .with_echo(self.echo)
            .with_logprobs(self.logprobs)
            .with_cache(!self.no_cache);
        if let Some(max_tokens) = self.max_tokens {
            prompt = prompt.with_max_tokens(max_tokens);
        }
        prompt
    }
}

/// Human-readable rendering of one completion
pub fn render_result(index: usize, result: &CompletionResult, markers: &[String]) -> String {
    let mut out = String::new();
    let source = if result.from_cache { "cached" } else { "generated" };

    out.push_str(&format!("--- completion {} ({}) ---\n", index + 1, source));
    out.push_str(&result.full_text());
    out.push('\n');

    if !result.completion_tokens.is_empty() {
        out.push_str("\ntoken                 logprob\n");
        for (token, logprob) in markers.iter().zip(&result.completion_logprobs) {
            out.push_str(&format!("{:<20} {:>8.4}\n", format!("{:?}", token), logprob));
        }
        out.push_str(&format!(
            "total log-probability: {:.4}\n",
            result.completion_logprob_sum()
        ));
    }

    out
}
