//! Environment configuration knobs
//!
//! Everything tunable without flags lives in env vars, read once at startup.
//! Sampling overrides apply to every translated request; the rest are
//! backend-specific hints.

use std::env;

/// Floor for the Ollama `num_ctx` hint; anything lower truncates agent
/// conversations mid-tool-loop.
pub const MIN_NUM_CTX: u32 = 32_768;

const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 32_000;
const DEFAULT_KEEP_ALIVE: &str = "30m";

#[derive(Debug, Clone)]
pub struct Settings {
    /// Sampling overrides (CLAUDISH_TEMPERATURE and friends).
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub min_p: Option<f32>,
    pub repetition_penalty: Option<f32>,

    /// Hard context-window override (skips detection entirely).
    pub context_window_override: Option<u32>,
    /// How long Ollama keeps the model resident after the last request.
    pub ollama_keep_alive: String,
    /// Prepend `/no_think` to Qwen system prompts.
    pub qwen_no_think: bool,
    /// Cap on runaway max_tokens.
    pub max_output_tokens: u32,

    /// Local backend endpoints.
    pub ollama_base_url: String,
    pub lmstudio_base_url: String,
    pub vllm_base_url: String,
    pub mlx_base_url: String,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Settings {
    pub fn from_env() -> Self {
        let ollama_base_url = env::var("OLLAMA_BASE_URL")
            .or_else(|_| env::var("OLLAMA_HOST"))
            .map(normalize_base_url)
            .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());

        Self {
            temperature: env_parse("CLAUDISH_TEMPERATURE"),
            top_p: env_parse("CLAUDISH_TOP_P"),
            top_k: env_parse("CLAUDISH_TOP_K"),
            min_p: env_parse("CLAUDISH_MIN_P"),
            repetition_penalty: env_parse("CLAUDISH_REP_PENALTY"),
            context_window_override: env_parse("CLAUDISH_CONTEXT_WINDOW"),
            ollama_keep_alive: env::var("CLAUDISH_OLLAMA_KEEP_ALIVE")
                .unwrap_or_else(|_| DEFAULT_KEEP_ALIVE.to_string()),
            qwen_no_think: env::var("CLAUDISH_QWEN_NO_THINK")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            max_output_tokens: env_parse("CLAUDISH_MAX_OUTPUT_TOKENS")
                .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
            ollama_base_url,
            lmstudio_base_url: env::var("LMSTUDIO_BASE_URL")
                .map(normalize_base_url)
                .unwrap_or_else(|_| "http://127.0.0.1:1234".to_string()),
            vllm_base_url: env::var("VLLM_BASE_URL")
                .map(normalize_base_url)
                .unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            mlx_base_url: env::var("MLX_BASE_URL")
                .map(normalize_base_url)
                .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temperature: None,
            top_p: None,
            top_k: None,
            min_p: None,
            repetition_penalty: None,
            context_window_override: None,
            ollama_keep_alive: DEFAULT_KEEP_ALIVE.to_string(),
            qwen_no_think: false,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            lmstudio_base_url: "http://127.0.0.1:1234".to_string(),
            vllm_base_url: "http://127.0.0.1:8000".to_string(),
            mlx_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

/// OLLAMA_HOST may arrive as bare `host:port`; everything downstream wants a
/// scheme and no trailing slash.
fn normalize_base_url(raw: String) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_scheme_and_strips_slash() {
        assert_eq!(
            normalize_base_url("localhost:11434/".into()),
            "http://localhost:11434"
        );
        assert_eq!(
            normalize_base_url("https://my.host:8443".into()),
            "https://my.host:8443"
        );
    }

    #[test]
    fn test_defaults_are_loopback() {
        let s = Settings::default();
        assert!(s.ollama_base_url.contains("127.0.0.1"));
        assert_eq!(s.max_output_tokens, 32_000);
        assert_eq!(s.ollama_keep_alive, "30m");
    }
}
