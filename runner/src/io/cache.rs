//! TTL-bounded result cache, one JSON file per request key.
//!
//! Entries live at `{dir}/review-{key}-{digest}.json`. The literal key makes
//! names unique and easy to find by hand; the short digest only gives the
//! names a uniform shape. Payloads may quote source code, so files are
//! written owner-only.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Distinguishes temp files of concurrent writers within this process.
static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A cached review result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: u64,
    pub payload: String,
    /// Whether the payload came from a degraded (partial) run.
    #[serde(default)]
    pub partial: bool,
    /// Stamped by [`ReviewCache::set_review`].
    pub cached_at: DateTime<Utc>,
    /// How long the run that produced the payload took.
    pub original_duration_ms: u64,
}

impl CacheEntry {
    pub fn new(key: u64, payload: impl Into<String>, original_duration: Duration) -> Self {
        Self {
            key,
            payload: payload.into(),
            partial: false,
            cached_at: Utc::now(),
            original_duration_ms: original_duration.as_millis() as u64,
        }
    }

    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.cached_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age > ttl,
            // A TTL too large for chrono never expires.
            Err(_) => false,
        }
    }
}

/// Short digest of the key, used only to shape file names.
pub fn key_digest(key: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..4])
}

/// File-backed review cache.
#[derive(Debug)]
pub struct ReviewCache {
    dir: PathBuf,
    enabled: bool,
    ttl: RwLock<Duration>,
}

impl ReviewCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            enabled: true,
            ttl: RwLock::new(ttl),
        }
    }

    /// A cache that never hits and never writes.
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            enabled: false,
            ttl: RwLock::new(Duration::ZERO),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    /// Change the expiry used by subsequent lookups.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }

    pub fn path_for(&self, key: u64) -> PathBuf {
        self.dir
            .join(format!("review-{key}-{}.json", key_digest(key)))
    }

    /// Look up `key`. Missing, unreadable and expired entries are all misses;
    /// expired ones are deleted on the way out.
    pub fn get_review(&self, key: u64) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let path = self.path_for(key);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "read cache entry");
                return None;
            }
        };
        let entry: CacheEntry = match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), err = %e, "parse cache entry");
                return None;
            }
        };
        if entry.is_expired(self.ttl(), Utc::now()) {
            debug!(key, "cache entry expired");
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), err = %e, "remove expired cache entry");
            }
            return None;
        }
        debug!(key, "cache hit");
        Some(entry)
    }

    /// Store `entry` under `key`, stamping the current time.
    pub fn set_review(&self, key: u64, mut entry: CacheEntry) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        entry.key = key;
        entry.cached_at = Utc::now();
        let mut buf = serde_json::to_string_pretty(&entry).context("serialize cache entry")?;
        buf.push('\n');

        create_private_dir(&self.dir)?;
        let path = self.path_for(key);
        let tmp_path = path.with_extension(format!(
            "json.{}-{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(err) = write_private(&tmp_path, buf.as_bytes()).and_then(|()| {
            fs::rename(&tmp_path, &path)
                .with_context(|| format!("replace cache entry {}", path.display()))
        }) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        debug!(key, path = %path.display(), "cached review");
        Ok(())
    }

    /// Drop `key`; absent entries are fine.
    pub fn invalidate(&self, key: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove cache entry {}", path.display())),
        }
    }

    /// Remove every entry, continuing past individual failures.
    ///
    /// Returns how many entries were removed.
    pub fn clear(&self) -> Result<usize> {
        self.remove_entries(|_| true)
    }

    /// Remove every expired entry (and unreadable ones).
    pub fn prune_expired(&self) -> Result<usize> {
        let ttl = self.ttl();
        let now = Utc::now();
        self.remove_entries(|path| {
            fs::read_to_string(path)
                .ok()
                .and_then(|contents| serde_json::from_str::<CacheEntry>(&contents).ok())
                .is_none_or(|entry| entry.is_expired(ttl, now))
        })
    }

    fn remove_entries(&self, mut should_remove: impl FnMut(&Path) -> bool) -> Result<usize> {
        if !self.enabled || !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read cache dir {}", self.dir.display()))?
        {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!(err = %e, "read cache dir entry");
                    continue;
                }
            };
            if !is_entry_file(&path) || !should_remove(&path) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), err = %e, "remove cache entry"),
            }
        }
        Ok(removed)
    }
}

fn is_entry_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with("review-"))
}

fn create_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .with_context(|| format!("create cache dir {}", dir.display()))
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir).with_context(|| format!("create cache dir {}", dir.display()))
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("open cache entry {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write cache entry {}", path.display()))
}
