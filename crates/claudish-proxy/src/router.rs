//! Model router
//!
//! Decides which handler serves a request: observer mode pins everything to
//! the Anthropic native pass-through, an explicit override replaces the
//! requested model wholesale, and a profile map substitutes by Claude tier
//! keyword. Handlers are memoised per target model so session state (token
//! counters, Gemini name maps) survives across turns.

use crate::handlers::{Handler, HandlerDeps};
use crate::registry::{Registry, Resolution};
use crate::tokens::StatusSnapshot;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RouteMode {
    /// Route by requested model name.
    #[default]
    Auto,
    /// Intercept-only: everything goes to the Anthropic native endpoint.
    Observer,
    /// Serve every request with this model, whatever the client asked for.
    Override(String),
}

/// Maps the agent's Claude tiers onto replacement models.
#[derive(Debug, Clone, Default)]
pub struct ModelProfile {
    pub opus: Option<String>,
    pub sonnet: Option<String>,
    pub haiku: Option<String>,
}

impl ModelProfile {
    pub fn is_empty(&self) -> bool {
        self.opus.is_none() && self.sonnet.is_none() && self.haiku.is_none()
    }

    /// Case-insensitive tier-keyword match; first hit substitutes.
    fn substitute(&self, requested: &str) -> Option<String> {
        let lower = requested.to_lowercase();
        if lower.contains("opus") {
            return self.opus.clone();
        }
        if lower.contains("sonnet") {
            return self.sonnet.clone();
        }
        if lower.contains("haiku") {
            return self.haiku.clone();
        }
        None
    }
}

pub struct Router {
    registry: Registry,
    mode: RouteMode,
    profile: ModelProfile,
    deps: HandlerDeps,
    handlers: RwLock<HashMap<String, Arc<Handler>>>,
}

impl Router {
    pub fn new(registry: Registry, mode: RouteMode, profile: ModelProfile, deps: HandlerDeps) -> Self {
        Self {
            registry,
            mode,
            profile,
            deps,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// The model that will actually be served for a requested model string.
    pub fn target_for(&self, requested: &str) -> String {
        match &self.mode {
            RouteMode::Observer => requested.to_string(),
            RouteMode::Override(model) => model.clone(),
            RouteMode::Auto => self
                .profile
                .substitute(requested)
                .unwrap_or_else(|| requested.to_string()),
        }
    }

    fn resolve(&self, requested: &str) -> Resolution {
        let target = self.target_for(requested);
        if self.mode == RouteMode::Observer {
            // Observer ignores prefixes entirely: the point is watching real
            // traffic, not routing it.
            return Resolution {
                provider: self.registry.anthropic().clone(),
                model_name: target,
            };
        }
        self.registry.resolve(&target)
    }

    /// The memoised handler for a requested model.
    pub fn handler_for(&self, requested: &str) -> Arc<Handler> {
        let resolution = self.resolve(requested);
        let key = format!("{}:{}", resolution.provider.name, resolution.model_name);

        if let Some(handler) = self.handlers.read().get(&key) {
            return handler.clone();
        }

        let mut handlers = self.handlers.write();
        // Raced another request between locks; theirs wins.
        if let Some(handler) = handlers.get(&key) {
            return handler.clone();
        }

        info!(
            "creating handler for {} (provider {})",
            resolution.model_name, resolution.provider.name
        );
        let handler = Arc::new(Handler::new(resolution, self.deps.clone()));
        handlers.insert(key, handler.clone());
        handler
    }

    /// Whether this request would land on the Anthropic native endpoint.
    pub fn routes_to_anthropic_native(&self, requested: &str) -> bool {
        self.resolve(requested).provider.name == "anthropic"
    }

    /// Session snapshots for the status endpoint.
    pub fn usage_snapshots(&self) -> Vec<(String, StatusSnapshot)> {
        self.handlers
            .read()
            .iter()
            .map(|(key, handler)| (key.clone(), handler.usage_snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::health::HealthCache;
    use crate::middleware::MiddlewareChain;
    use crate::model_cache::ModelMetadataCache;

    fn deps() -> HandlerDeps {
        HandlerDeps {
            http: reqwest::Client::new(),
            settings: Arc::new(Settings::default()),
            middleware: MiddlewareChain::new(),
            health: Arc::new(HealthCache::new()),
            model_cache: Arc::new(ModelMetadataCache::open(None)),
            port: 0,
        }
    }

    fn router(mode: RouteMode, profile: ModelProfile) -> Router {
        Router::new(
            Registry::from_env(&Settings::default()),
            mode,
            profile,
            deps(),
        )
    }

    #[test]
    fn test_auto_mode_passes_model_through() {
        let r = router(RouteMode::Auto, ModelProfile::default());
        assert_eq!(r.target_for("ollama/qwen3"), "ollama/qwen3");
    }

    #[test]
    fn test_override_wins_over_everything() {
        let r = router(
            RouteMode::Override("ollama/qwen3:8b".into()),
            ModelProfile {
                opus: Some("or/x".into()),
                ..Default::default()
            },
        );
        assert_eq!(r.target_for("claude-opus-4"), "ollama/qwen3:8b");
        assert_eq!(r.target_for("anything"), "ollama/qwen3:8b");
    }

    #[test]
    fn test_profile_substitutes_by_tier_keyword() {
        let r = router(
            RouteMode::Auto,
            ModelProfile {
                opus: Some("or/deepseek/deepseek-r1".into()),
                sonnet: Some("ollama/qwen3:14b".into()),
                haiku: Some("ollama/qwen3:4b".into()),
            },
        );
        assert_eq!(r.target_for("claude-OPUS-4-20250514"), "or/deepseek/deepseek-r1");
        assert_eq!(r.target_for("claude-sonnet-4"), "ollama/qwen3:14b");
        assert_eq!(r.target_for("claude-haiku-4"), "ollama/qwen3:4b");
        assert_eq!(r.target_for("gpt-4.1"), "gpt-4.1", "non-tier models untouched");
    }

    #[test]
    fn test_observer_pins_to_anthropic() {
        let r = router(RouteMode::Observer, ModelProfile::default());
        assert!(r.routes_to_anthropic_native("ollama/qwen3"));
        assert!(r.routes_to_anthropic_native("claude-sonnet-4"));
    }

    #[test]
    fn test_handler_memoised_per_target() {
        let r = router(RouteMode::Auto, ModelProfile::default());
        let a = r.handler_for("ollama/qwen3:8b");
        let b = r.handler_for("ollama/qwen3:8b");
        assert!(Arc::ptr_eq(&a, &b), "same target must reuse the handler");

        let c = r.handler_for("ollama/qwen3:4b");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_routing_ignores_credential_presence() {
        // Resolution is total and credential-independent; only activation
        // fails later.
        let r = router(RouteMode::Auto, ModelProfile::default());
        let handler = r.handler_for("g/gemini-2.5-pro");
        assert!(!handler.is_anthropic_native());
    }
}
