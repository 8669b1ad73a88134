//! Stop-sequence truncation over decoded token text
//!
//! Backends hand back the full generated token sequence. Generation is then
//! treated as if it had stopped at the first occurrence of any stop string in
//! the *decoded text*, which rarely lines up with token boundaries:
//!
//! - a match starting exactly on a token boundary drops that token and
//!   everything after it
//! - a match starting inside a token keeps the token (and its log-probability)
//!   but cuts the text at the match
//! - only the generated continuation is scanned, never the prompt

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum StopError {
    #[error("Stop match at byte {offset} does not fall inside the {len}-byte completion text")]
    MalformedStopMatch { offset: usize, len: usize },

    #[error("Token sequences disagree in length: {tokens} tokens, {pieces} decoded pieces, {logprobs} log-probabilities")]
    LengthMismatch {
        tokens: usize,
        pieces: usize,
        logprobs: usize,
    },
}

/// Where a completion should be cut
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncation {
    /// Decoded text up to (not including) the first stop match
    pub text: String,
    /// Number of leading tokens that survive, including a partially cut one
    pub kept_tokens: usize,
    /// Byte offset of the stop match, if there was one
    pub cut: Option<usize>,
}

/// Byte offset of the earliest match of any non-empty stop string
///
/// Two stop strings matching at the same offset cut at the same place, so the
/// order the stops are supplied in never changes the outcome.
pub fn find_stop<'a, I>(text: &str, stops: I) -> Option<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    stops
        .into_iter()
        .filter(|stop| !stop.is_empty())
        .filter_map(|stop| text.find(stop))
        .min()
}

/// Work out how a decoded completion is cut by `stops`
pub fn truncate_at_stop<'a, I>(pieces: &[String], stops: I) -> Result<Truncation, StopError>
where
    I: IntoIterator<Item = &'a str>,
{
    let text: String = pieces.concat();

    let Some(cut) = find_stop(&text, stops) else {
        return Ok(Truncation {
            text,
            kept_tokens: pieces.len(),
            cut: None,
        });
    };

    if cut > text.len() || !text.is_char_boundary(cut) {
        return Err(StopError::MalformedStopMatch {
            offset: cut,
            len: text.len(),
        });
    }

    let mut start = 0;
    let mut kept_tokens = 0;
    for piece in pieces {
        if start >= cut {
            break;
        }
        kept_tokens += 1;
        start += piece.len();
    }

    let mut text = text;
    text.truncate(cut);

    Ok(Truncation {
        text,
        kept_tokens,
        cut: Some(cut),
    })
}

/// A generated token sequence after stop handling
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedCompletion {
    pub text: String,
    pub tokens: Vec<String>,
    pub logprobs: Vec<f64>,
}

/// Apply stop strings to raw tokens, their decoded pieces and log-probabilities
///
/// `logprobs` may be empty when the backend returned none; otherwise all three
/// sequences must have the same length.
pub fn apply_stops<'a, I>(
    mut tokens: Vec<String>,
    pieces: &[String],
    mut logprobs: Vec<f64>,
    stops: I,
) -> Result<StoppedCompletion, StopError>
where
    I: IntoIterator<Item = &'a str>,
{
    if tokens.len() != pieces.len() || (!logprobs.is_empty() && logprobs.len() != tokens.len()) {
        return Err(StopError::LengthMismatch {
            tokens: tokens.len(),
            pieces: pieces.len(),
            logprobs: logprobs.len(),
        });
    }

    let truncation = truncate_at_stop(pieces, stops)?;
    tokens.truncate(truncation.kept_tokens);
    logprobs.truncate(truncation.kept_tokens);

    Ok(StoppedCompletion {
        text: truncation.text,
        tokens,
        logprobs,
    })
}
