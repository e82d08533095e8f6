//! Model-metadata disk cache
//!
//! Probing a local server for its context window costs a round trip per
//! process start, so probed figures are remembered on disk with a TTL.
//! The cache file carries no secrets but lives in the user's config dir, so
//! it is written 0600 inside a 0700 directory, whole-file then rename.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Default entry lifetime: 7 days.
const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    context_window: u32,
    /// Unix seconds when the entry was written.
    timestamp: u64,
    /// Seconds the entry stays valid.
    ttl: u64,
}

impl CacheEntry {
    fn is_fresh(&self, now: u64) -> bool {
        now.saturating_sub(self.timestamp) < self.ttl
    }
}

pub struct ModelMetadataCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

impl ModelMetadataCache {
    /// Open (or create) the cache at the default location,
    /// `~/.config/claudish/model-cache.json`.
    pub fn open_default() -> Self {
        let path = dirs::config_dir().map(|d| d.join("claudish").join("model-cache.json"));
        Self::open(path)
    }

    pub fn open(path: Option<PathBuf>) -> Self {
        let entries = path
            .as_deref()
            .and_then(|p| fs::read(p).ok())
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{}:{}", provider, model)
    }

    /// A fresh cached context window, if any.
    pub fn get(&self, provider: &str, model: &str) -> Option<u32> {
        let entries = self.entries.lock();
        let entry = entries.get(&Self::key(provider, model))?;
        entry.is_fresh(now_secs()).then_some(entry.context_window)
    }

    /// Remember a probed context window and persist.
    pub fn put(&self, provider: &str, model: &str, context_window: u32) {
        {
            let mut entries = self.entries.lock();
            entries.insert(
                Self::key(provider, model),
                CacheEntry {
                    context_window,
                    timestamp: now_secs(),
                    ttl: DEFAULT_TTL_SECS,
                },
            );
        }
        if let Err(e) = self.persist() {
            warn!("failed to persist model cache: {}", e);
        }
    }

    fn persist(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = {
            let entries = self.entries.lock();
            serde_json::to_vec_pretty(&*entries)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
            restrict_permissions(dir, 0o700)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        restrict_permissions(&tmp, 0o600)?;
        fs::rename(&tmp, path)?;
        debug!("model cache persisted to {}", path.display());
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (ModelMetadataCache, PathBuf) {
        let dir = std::env::temp_dir().join(format!("claudish-cache-{}", std::process::id()));
        let path = dir.join("model-cache.json");
        (ModelMetadataCache::open(Some(path.clone())), dir)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (cache, dir) = temp_cache();
        cache.put("ollama", "qwen3:8b", 40_960);
        assert_eq!(cache.get("ollama", "qwen3:8b"), Some(40_960));
        assert_eq!(cache.get("ollama", "other"), None);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_reload_from_disk() {
        let (cache, dir) = temp_cache();
        cache.put("lmstudio", "devstral", 131_072);

        let reloaded = ModelMetadataCache::open(Some(dir.join("model-cache.json")));
        assert_eq!(reloaded.get("lmstudio", "devstral"), Some(131_072));
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_stale_entry_ignored() {
        let cache = ModelMetadataCache::open(None);
        cache.entries.lock().insert(
            "x:y".into(),
            CacheEntry {
                context_window: 1,
                timestamp: now_secs() - DEFAULT_TTL_SECS - 1,
                ttl: DEFAULT_TTL_SECS,
            },
        );
        assert_eq!(cache.get("x", "y"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (cache, dir) = temp_cache();
        cache.put("vllm", "llama", 8_192);
        let mode = fs::metadata(dir.join("model-cache.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        fs::remove_dir_all(dir).ok();
    }
}
