//! Request and result types shared by every backend

mod prompt;
mod result;

pub use prompt::Prompt;
pub use result::CompletionResult;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("num_completions must be at least 1")]
    NoCompletions,

    #[error("Temperature must be a finite, non-negative number (got {0})")]
    InvalidTemperature(f32),
}
