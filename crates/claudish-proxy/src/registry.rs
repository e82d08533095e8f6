//! Provider registry
//!
//! The static table of upstream providers and the model-string resolution
//! rules. Resolution is total: every requested model string maps to exactly
//! one provider, credentials or not. A missing key only fails later, at
//! request time, with an error naming the env var.

use crate::config::Settings;
use claudish_core::GatewayError;

/// Wire dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `POST <base>/v1/chat/completions` (OpenAI and everything compatible).
    OpenAi,
    /// `POST <base>/v1beta/models/{model}:streamGenerateContent?alt=sse`.
    Gemini,
    /// `POST <base><api_path>` with Anthropic headers, body passed through.
    AnthropicCompat,
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub tools: bool,
    pub vision: bool,
    pub streaming: bool,
    pub json_mode: bool,
    pub reasoning: bool,
}

impl Capabilities {
    const FULL: Capabilities = Capabilities {
        tools: true,
        vision: true,
        streaming: true,
        json_mode: true,
        reasoning: true,
    };

    const LOCAL: Capabilities = Capabilities {
        tools: true,
        vision: false,
        streaming: true,
        json_mode: false,
        reasoning: true,
    };
}

#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: String,
    pub base_url: String,
    pub api_path: String,
    pub prefixes: Vec<&'static str>,
    pub cred_env: Option<&'static str>,
    pub cred_hint: &'static str,
    pub dialect: Dialect,
    pub caps: Capabilities,
    pub local: bool,
    /// Degrade translated messages to plain strings (no content parts, no
    /// tool role) for minimalist servers.
    pub simple_format: bool,
}

impl ProviderSpec {
    /// Read this provider's credential, or the structured error naming the
    /// env var and where to get a key.
    pub fn credential(&self) -> Result<Option<String>, GatewayError> {
        match self.cred_env {
            None => Ok(None),
            Some(env) => match std::env::var(env) {
                Ok(v) if !v.is_empty() => Ok(Some(v)),
                _ => Err(GatewayError::MissingCredential {
                    env: env.to_string(),
                    hint: self.cred_hint.to_string(),
                }),
            },
        }
    }
}

/// Result of resolving a requested model string.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub provider: ProviderSpec,
    /// The model name with any routing prefix stripped.
    pub model_name: String,
}

pub struct Registry {
    providers: Vec<ProviderSpec>,
    anthropic: ProviderSpec,
    aggregator: ProviderSpec,
}

impl Registry {
    pub fn from_env(settings: &Settings) -> Self {
        let anthropic = ProviderSpec {
            name: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            api_path: "/v1/messages".into(),
            prefixes: vec![],
            cred_env: Some("ANTHROPIC_API_KEY"),
            cred_hint: "https://console.anthropic.com/settings/keys",
            dialect: Dialect::AnthropicCompat,
            caps: Capabilities::FULL,
            local: false,
            simple_format: false,
        };

        let aggregator = ProviderSpec {
            name: "openrouter".into(),
            base_url: "https://openrouter.ai/api".into(),
            api_path: "/v1/chat/completions".into(),
            prefixes: vec!["or/"],
            cred_env: Some("OPENROUTER_API_KEY"),
            cred_hint: "https://openrouter.ai/keys",
            dialect: Dialect::OpenAi,
            caps: Capabilities::FULL,
            local: false,
            simple_format: false,
        };

        let providers = vec![
            // Local OpenAI-compatible servers. `ollama:` and `lmstudio:` are
            // accepted alongside the slash form; `mlstudio/` is a common typo
            // we keep honouring.
            ProviderSpec {
                name: "ollama".into(),
                base_url: settings.ollama_base_url.clone(),
                api_path: "/v1/chat/completions".into(),
                prefixes: vec!["ollama/", "ollama:"],
                cred_env: None,
                cred_hint: "",
                dialect: Dialect::OpenAi,
                caps: Capabilities::LOCAL,
                local: true,
                simple_format: false,
            },
            ProviderSpec {
                name: "lmstudio".into(),
                base_url: settings.lmstudio_base_url.clone(),
                api_path: "/v1/chat/completions".into(),
                prefixes: vec!["lmstudio/", "lmstudio:", "mlstudio/"],
                cred_env: None,
                cred_hint: "",
                dialect: Dialect::OpenAi,
                caps: Capabilities::LOCAL,
                local: true,
                simple_format: false,
            },
            ProviderSpec {
                name: "vllm".into(),
                base_url: settings.vllm_base_url.clone(),
                api_path: "/v1/chat/completions".into(),
                prefixes: vec!["vllm/"],
                cred_env: None,
                cred_hint: "",
                dialect: Dialect::OpenAi,
                caps: Capabilities::LOCAL,
                local: true,
                simple_format: false,
            },
            ProviderSpec {
                name: "mlx".into(),
                base_url: settings.mlx_base_url.clone(),
                api_path: "/v1/chat/completions".into(),
                prefixes: vec!["mlx/"],
                cred_env: None,
                cred_hint: "",
                dialect: Dialect::OpenAi,
                caps: Capabilities::LOCAL,
                local: true,
                // mlx_lm.server rejects content-part arrays
                simple_format: true,
            },
            // Native Gemini API.
            ProviderSpec {
                name: "gemini".into(),
                base_url: "https://generativelanguage.googleapis.com".into(),
                api_path: "/v1beta/models".into(),
                prefixes: vec!["g/", "gemini/"],
                cred_env: Some("GEMINI_API_KEY"),
                cred_hint: "https://aistudio.google.com/apikey",
                dialect: Dialect::Gemini,
                caps: Capabilities::FULL,
                local: false,
                simple_format: false,
            },
            // Direct OpenAI. Distinct from the aggregator's `openai/...`
            // model ids, which contain a slash and fall through to rule 3.
            ProviderSpec {
                name: "openai".into(),
                base_url: "https://api.openai.com".into(),
                api_path: "/v1/chat/completions".into(),
                prefixes: vec!["oai/"],
                cred_env: Some("OPENAI_API_KEY"),
                cred_hint: "https://platform.openai.com/api-keys",
                dialect: Dialect::OpenAi,
                caps: Capabilities::FULL,
                local: false,
                simple_format: false,
            },
            aggregator.clone(),
            // Anthropic-compatible aggregators.
            ProviderSpec {
                name: "minimax".into(),
                base_url: "https://api.minimax.io".into(),
                api_path: "/anthropic/v1/messages".into(),
                prefixes: vec!["mmax/", "mm/"],
                cred_env: Some("MINIMAX_API_KEY"),
                cred_hint: "https://platform.minimax.io/user-center/basic-information",
                dialect: Dialect::AnthropicCompat,
                caps: Capabilities::FULL,
                local: false,
                simple_format: false,
            },
            ProviderSpec {
                name: "moonshot".into(),
                base_url: "https://api.moonshot.ai".into(),
                api_path: "/anthropic/v1/messages".into(),
                prefixes: vec!["kimi/", "moonshot/"],
                cred_env: Some("MOONSHOT_API_KEY"),
                cred_hint: "https://platform.moonshot.ai/console/api-keys",
                dialect: Dialect::AnthropicCompat,
                caps: Capabilities::FULL,
                local: false,
                simple_format: false,
            },
            // OpenAI-compatible aggregator for GLM.
            ProviderSpec {
                name: "zhipu".into(),
                base_url: "https://open.bigmodel.cn/api/paas/v4".into(),
                api_path: "/chat/completions".into(),
                prefixes: vec!["glm/", "zhipu/"],
                cred_env: Some("ZHIPU_API_KEY"),
                cred_hint: "https://open.bigmodel.cn/usercenter/apikeys",
                dialect: Dialect::OpenAi,
                caps: Capabilities::FULL,
                local: false,
                simple_format: false,
            },
        ];

        Self {
            providers,
            anthropic,
            aggregator,
        }
    }

    /// Resolve a requested model string to a provider + bare model name.
    ///
    /// Order: scheme URL → prefix match (first wins) → contains `/` →
    /// Anthropic native passthrough.
    pub fn resolve(&self, model: &str) -> Resolution {
        if model.starts_with("http://") || model.starts_with("https://") {
            if let Some(r) = self.resolve_url_pinned(model) {
                return r;
            }
        }

        for provider in &self.providers {
            for prefix in &provider.prefixes {
                if let Some(rest) = model.strip_prefix(prefix) {
                    return Resolution {
                        provider: provider.clone(),
                        model_name: rest.to_string(),
                    };
                }
            }
        }

        if model.contains('/') {
            return Resolution {
                provider: self.aggregator.clone(),
                model_name: model.to_string(),
            };
        }

        Resolution {
            provider: self.anthropic.clone(),
            model_name: model.to_string(),
        }
    }

    /// `http://host:port/v1/some-model` pins both the endpoint and the model:
    /// the last path segment is the model name, everything before it is the
    /// base URL of an ad-hoc OpenAI-compatible local server.
    fn resolve_url_pinned(&self, url: &str) -> Option<Resolution> {
        let (scheme, rest) = url.split_once("://")?;
        let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return None;
        }
        let model_name = segments.pop()?.to_string();
        let host = segments.remove(0);

        // Whatever path prefix remains (e.g. `/v1`) stays on the base URL;
        // the chat/completions suffix is appended by the handler.
        let mut base_url = format!("{}://{}", scheme, host);
        for seg in &segments {
            // swallow a trailing /v1 so the api_path doesn't double it
            if *seg == "v1" && segments.len() == 1 {
                break;
            }
            base_url.push('/');
            base_url.push_str(seg);
        }

        Some(Resolution {
            provider: ProviderSpec {
                name: format!("local-url:{}", host),
                base_url,
                api_path: "/v1/chat/completions".into(),
                prefixes: vec![],
                cred_env: None,
                cred_hint: "",
                dialect: Dialect::OpenAi,
                caps: Capabilities::LOCAL,
                local: true,
                simple_format: false,
            },
            model_name,
        })
    }

    /// The native Anthropic passthrough target (observer mode routes here).
    pub fn anthropic(&self) -> &ProviderSpec {
        &self.anthropic
    }
}
