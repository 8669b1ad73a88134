//! Sharded on-disk store of cached completions

use super::{CacheConfig, CacheError, Fingerprint};
use crate::api::CompletionResult;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_DIR: &str = "staging";
const USAGE_FILE: &str = "usage";
const PERSIST_ATTEMPTS: usize = 8;

/// Disk-backed, size-bounded store mapping fingerprints to completion variants
///
/// Safe to share between threads and between processes pointed at the same
/// directory. Nothing is ever evicted to make room: once `size_limit` is
/// reached, [`DiskCache::put`] fails with [`CacheError::CapacityExceeded`].
///
/// Stored bytes are tallied in a `usage` ledger at the root of the store.
/// Every handle reserves and releases space through that ledger under an
/// exclusive file lock, so the limit holds for all processes together.
pub struct DiskCache {
    config: CacheConfig,
}

impl DiskCache {
    /// Open (creating if needed) the store described by `config`
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        if config.shards == 0 {
            return Err(CacheError::InvalidConfig("shards must be at least 1".to_string()));
        }
        if config.max_variants == 0 {
            return Err(CacheError::InvalidConfig(
                "max_variants must be at least 1".to_string(),
            ));
        }

        let cache = Self { config };
        cache.create_layout()?;
        let volume = cache.volume()?;

        debug!(
            dir = %cache.config.dir.display(),
            shards = cache.config.shards,
            volume,
            "disk cache opened"
        );
        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Bytes of cached entries, across every process using this directory
    pub fn volume(&self) -> Result<u64, CacheError> {
        self.with_usage(|used| Ok((used, used)))
    }

    /// Number of keys with at least one variant
    pub fn len(&self) -> Result<usize, CacheError> {
        let mut count = 0;
        for shard in 0..self.config.shards {
            for entry in fs::read_dir(self.shard_dir(shard))? {
                if entry?.file_type()?.is_dir() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }

    /// Most recently stored variant for `key`; `None` is a plain miss
    pub fn get(&self, key: &Fingerprint) -> Result<Option<CompletionResult>, CacheError> {
        for path in self.variant_files(key)?.iter().rev() {
            if let Some(result) = read_variant(path)? {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Every stored variant for `key`, oldest first
    pub fn variants(&self, key: &Fingerprint) -> Result<Vec<CompletionResult>, CacheError> {
        let mut results = Vec::new();
        for path in self.variant_files(key)? {
            if let Some(result) = read_variant(&path)? {
                results.push(result);
            }
        }
        Ok(results)
    }

    pub fn contains(&self, key: &Fingerprint) -> Result<bool, CacheError> {
        Ok(!self.variant_files(key)?.is_empty())
    }

    /// Append `result` as a new variant under `key`
    ///
    /// Other keys are never touched. Variants beyond `max_variants` are pruned
    /// oldest first.
    pub fn put(&self, key: &Fingerprint, result: &CompletionResult) -> Result<(), CacheError> {
        self.put_many(key, std::slice::from_ref(result))
    }

    /// Append a batch of completions generated together under `key`
    ///
    /// Pruning keeps at least the whole batch, even when it is larger than
    /// `max_variants`. If space runs out partway, the variants already
    /// written stay and the capacity error is returned.
    pub fn put_many(&self, key: &Fingerprint, results: &[CompletionResult]) -> Result<(), CacheError> {
        let mut outcome = Ok(());
        for result in results {
            if let Err(err) = self.append(key, result) {
                outcome = Err(err);
                break;
            }
        }

        // Written variants are already visible; a failed prune only delays cleanup
        let keep = self.config.max_variants.max(results.len());
        if let Err(err) = self.prune(key, keep) {
            warn!(key = %key, error = %err, "failed to prune old cache variants");
        }
        outcome
    }

    /// Delete every variant under `key`, returning whether anything was there
    pub fn remove(&self, key: &Fingerprint) -> Result<bool, CacheError> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging)?;

        // Move the whole key out of the shard in one step, then delete it at
        // leisure. Readers see either every variant or none.
        let graveyard = staging.join(format!("removed-{}", Uuid::new_v4().simple()));
        match fs::rename(self.key_dir(key), &graveyard) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let (files, bytes) = dir_stats(&graveyard)?;
        fs::remove_dir_all(&graveyard)?;
        self.release(bytes);

        debug!(key = %key, variants = files, bytes, "removed cache entry");
        Ok(files > 0)
    }

    /// Delete the whole store and start over empty
    pub fn clear_all(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.config.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.create_layout()?;

        info!(dir = %self.config.dir.display(), "cleared disk cache");
        Ok(())
    }

    fn staging_dir(&self) -> PathBuf {
        self.config.dir.join(STAGING_DIR)
    }

    fn shard_dir(&self, shard: usize) -> PathBuf {
        self.config.dir.join(format!("shard-{:02}", shard))
    }

    fn key_dir(&self, key: &Fingerprint) -> PathBuf {
        self.shard_dir(key.shard(self.config.shards))
            .join(key.as_str())
    }

    fn create_layout(&self) -> io::Result<()> {
        fs::create_dir_all(self.staging_dir())?;
        for shard in 0..self.config.shards {
            fs::create_dir_all(self.shard_dir(shard))?;
        }
        Ok(())
    }

    fn scan_volume(&self) -> io::Result<u64> {
        let mut total = 0;
        for shard in 0..self.config.shards {
            for entry in fs::read_dir(self.shard_dir(shard))? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    total += dir_stats(&entry.path())?.1;
                }
            }
        }
        Ok(total)
    }

    /// Read-modify-write the usage ledger while holding its exclusive lock
    ///
    /// `update` receives the bytes in use and returns the new total plus a
    /// value to hand back. A missing or unreadable ledger is rebuilt from a
    /// scan of the shards.
    fn with_usage<T>(
        &self,
        update: impl FnOnce(u64) -> Result<(u64, T), CacheError>,
    ) -> Result<T, CacheError> {
        fs::create_dir_all(&self.config.dir)?;
        let mut ledger = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.config.dir.join(USAGE_FILE))?;
        ledger.lock()?;

        let mut text = String::new();
        ledger.read_to_string(&mut text)?;
        let (used, rebuilt) = match text.trim().parse::<u64>() {
            Ok(used) => (used, false),
            Err(_) => {
                if !text.trim().is_empty() {
                    warn!(ledger = %text.trim(), "unreadable cache usage ledger, rescanning");
                }
                (self.scan_volume()?, true)
            }
        };

        let (total, out) = update(used)?;
        if total != used || rebuilt {
            write_ledger(&mut ledger, total)?;
        }
        // Dropping the handle releases the lock
        Ok(out)
    }

    /// Variant files for `key` in the order they were stored
    fn variant_files(&self, key: &Fingerprint) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.key_dir(key)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Reserve space for one variant, then write it
    fn append(&self, key: &Fingerprint, result: &CompletionResult) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(result)?;
        let needed = bytes.len() as u64;
        let limit = self.config.size_limit;

        self.with_usage(|used| match used.checked_add(needed).filter(|total| *total <= limit) {
            Some(total) => Ok((total, ())),
            None => Err(CacheError::CapacityExceeded {
                limit,
                used,
                needed,
            }),
        })?;

        if let Err(err) = self.write_variant(key, &bytes) {
            self.release(needed);
            return Err(err.into());
        }
        Ok(())
    }

    fn write_variant(&self, key: &Fingerprint, bytes: &[u8]) -> io::Result<()> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging)?;

        let mut staged = tempfile::Builder::new()
            .prefix("put-")
            .suffix(".json")
            .tempfile_in(&staging)?;
        staged.write_all(bytes)?;
        staged.as_file().sync_all()?;

        let key_dir = self.key_dir(key);
        let target = key_dir.join(variant_file_name());

        // A concurrent remove can take the key directory away between
        // creating it and the rename; recreate it and try again.
        for _ in 0..PERSIST_ATTEMPTS {
            fs::create_dir_all(&key_dir)?;
            match staged.persist(&target) {
                Ok(_) => return Ok(()),
                Err(err) if err.error.kind() == ErrorKind::NotFound => staged = err.file,
                Err(err) => return Err(err.error),
            }
        }
        Err(io::Error::new(
            ErrorKind::Other,
            format!("key directory for {} kept disappearing during write", key),
        ))
    }

    /// Delete the oldest variants of `key` beyond the newest `keep`
    fn prune(&self, key: &Fingerprint, keep: usize) -> Result<(), CacheError> {
        let files = self.variant_files(key)?;
        let excess = files.len().saturating_sub(keep);

        let mut freed = 0;
        for path in files.iter().take(excess) {
            let size = match fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match fs::remove_file(path) {
                Ok(()) => freed += size,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    self.release(freed);
                    return Err(e.into());
                }
            }
        }
        self.release(freed);

        if excess > 0 {
            debug!(key = %key, pruned = excess, "pruned old cache variants");
        }
        Ok(())
    }

    fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Err(err) = self.with_usage(|used| Ok((used.saturating_sub(bytes), ()))) {
            warn!(bytes, error = %err, "failed to release cache space in usage ledger");
        }
    }
}

fn write_ledger(ledger: &mut File, total: u64) -> io::Result<()> {
    ledger.set_len(0)?;
    ledger.seek(SeekFrom::Start(0))?;
    write!(ledger, "{}", total)?;
    ledger.sync_data()
}

/// Read one variant file, treating a vanished or unreadable file as absent
fn read_variant(path: &Path) -> Result<Option<CompletionResult>, CacheError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_slice(&bytes) {
        Ok(result) => Ok(Some(result)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable cache variant");
            Ok(None)
        }
    }
}

/// File count and total bytes of the files directly inside `dir`
fn dir_stats(dir: &Path) -> io::Result<(usize, u64)> {
    let mut files = 0;
    let mut bytes = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_file() {
            files += 1;
            bytes += meta.len();
        }
    }
    Ok((files, bytes))
}

/// Names sort in storage order across processes
fn variant_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{:020}-{}.json", nanos, Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Prompt;
    use crate::cache::fingerprint;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DiskCache {
        DiskCache::open(CacheConfig::new(dir.path().join("cache"))).unwrap()
    }

    fn sample(text: &str) -> CompletionResult {
        CompletionResult {
            prompt: Prompt::new("Give a random base-64 guid:").with_temperature(2.0),
            completion_text: text.to_string(),
            completion_tokens: vec![text.to_string()],
            completion_logprobs: vec![-1.5],
            prompt_tokens: None,
            prompt_logprobs: None,
            from_cache: false,
        }
    }

    fn key(text: &str) -> Fingerprint {
        fingerprint(&Prompt::new(text), "test/model")
    }

    #[test]
    fn test_layout_created() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        assert!(cache.dir().join("staging").is_dir());
        for shard in 0..4 {
            assert!(cache.dir().join(format!("shard-{:02}", shard)).is_dir());
        }
        assert!(cache.is_empty().unwrap());
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        let result = sample(" abc");

        cache.put(&key("a"), &result).unwrap();

        assert_eq!(cache.get(&key("a")).unwrap(), Some(result));
        assert!(cache.contains(&key("a")).unwrap());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_miss_is_none() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        assert_eq!(cache.get(&key("missing")).unwrap(), None);
        assert!(cache.variants(&key("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.put(&key("a"), &sample("1")).unwrap();
        cache.put(&key("b"), &sample("2")).unwrap();

        assert!(cache.remove(&key("a")).unwrap());
        assert_eq!(cache.get(&key("a")).unwrap(), None);
        assert!(!cache.remove(&key("a")).unwrap());

        // Unrelated keys survive
        assert_eq!(cache.get(&key("b")).unwrap(), Some(sample("2")));
    }

    #[test]
    fn test_variants_append_and_newest_wins() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        for text in ["first", "second", "third"] {
            cache.put(&key("a"), &sample(text)).unwrap();
        }

        let texts: Vec<_> = cache
            .variants(&key("a"))
            .unwrap()
            .into_iter()
            .map(|r| r.completion_text)
            .collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(cache.get(&key("a")).unwrap().unwrap().completion_text, "third");
    }

    #[test]
    fn test_variants_are_bounded() {
        let dir = TempDir::new().unwrap();
        let cache =
            DiskCache::open(CacheConfig::new(dir.path()).with_max_variants(2)).unwrap();
        for text in ["1", "2", "3", "4"] {
            cache.put(&key("a"), &sample(text)).unwrap();
        }

        let texts: Vec<_> = cache
            .variants(&key("a"))
            .unwrap()
            .into_iter()
            .map(|r| r.completion_text)
            .collect();
        assert_eq!(texts, vec!["3", "4"]);
    }

    #[test]
    fn test_capacity_exceeded_instead_of_evicting() {
        let dir = TempDir::new().unwrap();
        let entry_size = serde_json::to_vec(&sample("x")).unwrap().len() as u64;
        let cache = DiskCache::open(
            CacheConfig::new(dir.path()).with_size_limit(entry_size * 2),
        )
        .unwrap();

        cache.put(&key("a"), &sample("x")).unwrap();
        cache.put(&key("b"), &sample("y")).unwrap();
        let err = cache.put(&key("c"), &sample("z")).unwrap_err();

        assert!(matches!(err, CacheError::CapacityExceeded { .. }));
        assert!(cache.get(&key("a")).unwrap().is_some());
        assert!(cache.get(&key("b")).unwrap().is_some());
        assert!(cache.get(&key("c")).unwrap().is_none());
    }

    #[test]
    fn test_remove_frees_capacity() {
        let dir = TempDir::new().unwrap();
        let entry_size = serde_json::to_vec(&sample("x")).unwrap().len() as u64;
        let cache =
            DiskCache::open(CacheConfig::new(dir.path()).with_size_limit(entry_size)).unwrap();

        cache.put(&key("a"), &sample("x")).unwrap();
        assert_eq!(cache.volume().unwrap(), entry_size);
        assert!(cache.put(&key("b"), &sample("y")).is_err());

        cache.remove(&key("a")).unwrap();
        assert_eq!(cache.volume().unwrap(), 0);
        cache.put(&key("b"), &sample("y")).unwrap();
    }

    #[test]
    fn test_limit_shared_between_handles() {
        let dir = TempDir::new().unwrap();
        let entry_size = serde_json::to_vec(&sample("x")).unwrap().len() as u64;
        let config = CacheConfig::new(dir.path()).with_size_limit(entry_size * 2);
        let first = DiskCache::open(config.clone()).unwrap();
        let second = DiskCache::open(config.clone()).unwrap();

        let stored = [
            first.put(&key("a"), &sample("x")),
            second.put(&key("b"), &sample("x")),
            first.put(&key("c"), &sample("x")),
            second.put(&key("d"), &sample("x")),
        ]
        .into_iter()
        .filter(Result::is_ok)
        .count();
        assert_eq!(stored, 2);

        let reopened = DiskCache::open(config).unwrap();
        assert_eq!(reopened.volume().unwrap(), entry_size * 2);
        assert_eq!(reopened.scan_volume().unwrap(), entry_size * 2);

        // Space freed through one handle is visible to the other
        assert!(first.remove(&key("b")).unwrap());
        second.put(&key("e"), &sample("x")).unwrap();
    }

    #[test]
    fn test_missing_ledger_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.put(&key("a"), &sample("1")).unwrap();
        let volume = cache.volume().unwrap();

        fs::remove_file(cache.dir().join(USAGE_FILE)).unwrap();
        assert_eq!(cache.volume().unwrap(), volume);

        fs::write(cache.dir().join(USAGE_FILE), b"garbage").unwrap();
        assert_eq!(cache.volume().unwrap(), volume);
    }

    #[test]
    fn test_batch_larger_than_variant_bound_is_kept() {
        let dir = TempDir::new().unwrap();
        let cache =
            DiskCache::open(CacheConfig::new(dir.path()).with_max_variants(2)).unwrap();
        let batch: Vec<_> = ["1", "2", "3"].into_iter().map(sample).collect();

        cache.put_many(&key("a"), &batch).unwrap();
        assert_eq!(cache.variants(&key("a")).unwrap(), batch);

        // A single put falls back to the normal bound
        cache.put(&key("a"), &sample("4")).unwrap();
        assert_eq!(cache.variants(&key("a")).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_prune_still_stores_variant() {
        let dir = TempDir::new().unwrap();
        let cache =
            DiskCache::open(CacheConfig::new(dir.path()).with_max_variants(1)).unwrap();
        cache.put(&key("a"), &sample("old")).unwrap();

        // An oldest "variant" that cannot be removed as a file
        let stuck = cache.key_dir(&key("a")).join(format!("{:020}-stuck.json", 0));
        fs::create_dir(&stuck).unwrap();

        cache.put(&key("a"), &sample("new")).unwrap();
        assert_eq!(cache.get(&key("a")).unwrap(), Some(sample("new")));
        assert!(stuck.is_dir());
    }

    #[test]
    fn test_clear_all() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.put(&key("a"), &sample("1")).unwrap();
        cache.put(&key("b"), &sample("2")).unwrap();

        cache.clear_all().unwrap();

        assert_eq!(cache.len().unwrap(), 0);
        assert_eq!(cache.volume().unwrap(), 0);
        assert_eq!(cache.get(&key("a")).unwrap(), None);
        // Still usable afterwards
        cache.put(&key("a"), &sample("3")).unwrap();
        assert_eq!(cache.get(&key("a")).unwrap(), Some(sample("3")));
    }

    #[test]
    fn test_reopen_sees_entries_and_volume() {
        let dir = TempDir::new().unwrap();
        let volume = {
            let cache = open(&dir);
            cache.put(&key("a"), &sample("persisted")).unwrap();
            cache.volume().unwrap()
        };

        let cache = open(&dir);
        assert_eq!(cache.volume().unwrap(), volume);
        assert_eq!(
            cache.get(&key("a")).unwrap().unwrap().completion_text,
            "persisted"
        );
    }

    #[test]
    fn test_corrupt_variant_is_skipped() {
        let dir = TempDir::new().unwrap();
        let cache = open(&dir);
        cache.put(&key("a"), &sample("good")).unwrap();

        let broken = cache.key_dir(&key("a")).join(format!("{:020}-broken.json", u128::MAX / 2));
        fs::write(&broken, b"{not json").unwrap();

        assert_eq!(cache.get(&key("a")).unwrap().unwrap().completion_text, "good");
        assert_eq!(cache.variants(&key("a")).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            shards: 0,
            ..CacheConfig::new(dir.path())
        };
        assert!(matches!(
            DiskCache::open(config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(DiskCache::open(CacheConfig::new(dir.path()).with_max_variants(64)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..5 {
                        cache.put(&key("shared"), &sample(&format!("{}-{}", i, j))).unwrap();
                        cache.put(&key(&format!("own-{}", i)), &sample("mine")).unwrap();
                        // Any variant seen must be complete
                        let seen = cache.get(&key("shared")).unwrap().unwrap();
                        assert_eq!(seen.completion_tokens.len(), 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.variants(&key("shared")).unwrap().len(), 40);
        assert_eq!(cache.len().unwrap(), 9);
    }

    #[test]
    fn test_remove_racing_put_leaves_consistent_state() {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(open(&dir));

        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..20 {
                    cache.put(&key("k"), &sample(&i.to_string())).unwrap();
                }
            })
        };
        for _ in 0..20 {
            cache.remove(&key("k")).unwrap();
        }
        writer.join().unwrap();

        // Either absent or a complete variant
        if let Some(result) = cache.get(&key("k")).unwrap() {
            assert_eq!(result.completion_logprobs, vec![-1.5]);
        }
    }
}
