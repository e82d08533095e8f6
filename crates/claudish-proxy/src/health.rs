//! Local-backend health probes
//!
//! A local handler's first request checks that something is actually
//! listening before translating the whole conversation. Ollama answers
//! `/api/tags`, everything else `/v1/models`; the first 2xx wins. Results
//! are cached per base URL for a minute so concurrent requests don't stampede.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

const PROBE_TTL: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

const PROBE_PATHS: &[&str] = &["/api/tags", "/v1/models"];

pub struct HealthCache {
    probes: DashMap<String, (bool, Instant)>,
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCache {
    pub fn new() -> Self {
        Self {
            probes: DashMap::new(),
        }
    }

    /// Probe `base_url`, using a cached verdict when it is still warm.
    pub async fn check(&self, client: &reqwest::Client, base_url: &str) -> bool {
        if let Some(entry) = self.probes.get(base_url) {
            let (healthy, at) = *entry;
            if at.elapsed() < PROBE_TTL {
                return healthy;
            }
        }

        let healthy = self.probe(client, base_url).await;
        self.probes
            .insert(base_url.to_string(), (healthy, Instant::now()));
        healthy
    }

    async fn probe(&self, client: &reqwest::Client, base_url: &str) -> bool {
        for path in PROBE_PATHS {
            let url = format!("{}{}", base_url, path);
            match client.get(&url).timeout(PROBE_TIMEOUT).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!("health probe ok: {}", url);
                    return true;
                }
                Ok(resp) => debug!("health probe {}: {}", url, resp.status()),
                Err(e) => debug!("health probe {}: {}", url, e),
            }
        }
        false
    }

    #[cfg(test)]
    pub fn seed(&self, base_url: &str, healthy: bool) {
        self.probes
            .insert(base_url.to_string(), (healthy, Instant::now()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cached_verdict_short_circuits() {
        let cache = HealthCache::new();
        // Seeded healthy for an address nothing listens on: a live probe
        // would fail, so a `true` result proves the cache answered.
        cache.seed("http://127.0.0.1:1", true);
        let client = reqwest::Client::new();
        assert!(cache.check(&client, "http://127.0.0.1:1").await);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unhealthy() {
        let cache = HealthCache::new();
        let client = reqwest::Client::new();
        assert!(!cache.check(&client, "http://127.0.0.1:1").await);
    }
}
