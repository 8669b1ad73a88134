//! Cache keys

use crate::api::Prompt;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest identifying a cache-equivalent request
///
/// Only [`fingerprint`] constructs one, so the value is always 64 lowercase
/// hex characters and safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard this key lives in, for a store with `shards` shards
    pub fn shard(&self, shards: usize) -> usize {
        let prefix = self
            .0
            .get(..8)
            .and_then(|p| u64::from_str_radix(p, 16).ok())
            .unwrap_or(0);
        (prefix % shards.max(1) as u64) as usize
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Feeds length-prefixed fields so adjacent fields cannot run together
struct KeyHasher(Sha256);

impl KeyHasher {
    fn field(&mut self, name: &str, value: &[u8]) {
        self.0.update((name.len() as u64).to_le_bytes());
        self.0.update(name.as_bytes());
        self.0.update((value.len() as u64).to_le_bytes());
        self.0.update(value);
    }
}

/// Fingerprint `prompt` as served by the backend identified by `backend_id`
///
/// Every field that affects generation is included. The `cache` flag is not,
/// and stop strings are treated as a set.
pub fn fingerprint(prompt: &Prompt, backend_id: &str) -> Fingerprint {
    let mut hasher = KeyHasher(Sha256::new());

    hasher.field("backend", backend_id.as_bytes());
    hasher.field("text", prompt.text.as_bytes());
    match prompt.max_tokens {
        Some(n) => hasher.field("max_tokens", &n.to_le_bytes()),
        None => hasher.field("max_tokens", b"default"),
    }

    let mut stops: Vec<&str> = prompt.active_stops().collect();
    stops.sort_unstable();
    stops.dedup();
    hasher.field("stop_count", &(stops.len() as u64).to_le_bytes());
    for stop in stops {
        hasher.field("stop", stop.as_bytes());
    }

    // -0.0 and 0.0 request the same thing
    let temperature = if prompt.temperature == 0.0 {
        0.0f32
    } else {
        prompt.temperature
    };
    hasher.field("temperature", &temperature.to_bits().to_le_bytes());
    hasher.field("num_completions", &prompt.num_completions.to_le_bytes());
    hasher.field("echo", &[prompt.echo as u8]);
    hasher.field("logprobs", &prompt.logprobs.to_le_bytes());

    Fingerprint(hex::encode(hasher.0.finalize()))
}
