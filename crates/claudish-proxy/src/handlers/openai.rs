//! OpenAI-dialect handler
//!
//! Serves every backend that speaks chat/completions: OpenRouter, direct
//! OpenAI, GLM, and the local servers (Ollama, LM Studio, vLLM, MLX).
//! Translates the Anthropic request out, drives the streaming machine on
//! the way back.

use super::{sse_response, CompletionGuard, HandlerDeps};
use crate::adapters::adapter_for;
use crate::config::MIN_NUM_CTX;
use crate::pruner;
use crate::registry::{ProviderSpec, Resolution};
use crate::retry::{classify_error_response, send_with_retry};
use crate::stream::{EventWriter, SseParser};
use crate::tokens::{ContextWindowSource, UsageTracker};
use axum::response::{IntoResponse, Json, Response};
use claudish_core::anthropic::{self, MessagesRequest};
use claudish_core::{openai as oai, GatewayError};
use claudish_translator::{convert, prompts, ToolSummaryMode};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fallback window when nothing better is known.
const DEFAULT_LOCAL_WINDOW: u32 = 32_768;
const DEFAULT_CLOUD_WINDOW: u32 = 128_000;

/// The brand the coding agent believes it is talking to.
const UPSTREAM_BRAND: &str = "Claude";

pub struct OpenAiHandler {
    provider: ProviderSpec,
    model: String,
    deps: HandlerDeps,
    /// Missing-credential error discovered at construction; requests fail
    /// with it until the env var appears on restart.
    credential: Result<Option<String>, GatewayError>,
    pub(super) tracker: Arc<Mutex<UsageTracker>>,
    /// First-request health probe result (local backends only).
    health_checked: Mutex<bool>,
    window_resolved: Mutex<bool>,
}

impl OpenAiHandler {
    pub fn new(resolution: Resolution, deps: HandlerDeps) -> Self {
        let Resolution {
            provider,
            model_name,
        } = resolution;
        let credential = provider.credential();
        let mut tracker =
            UsageTracker::new(&provider.name, &model_name, provider.local, deps.port);
        if let Some(w) = deps.settings.context_window_override {
            tracker.set_context_window(w, ContextWindowSource::Env);
        }
        Self {
            provider,
            model: model_name,
            deps,
            credential,
            tracker: Arc::new(Mutex::new(tracker)),
            health_checked: Mutex::new(false),
            window_resolved: Mutex::new(false),
        }
    }

    fn credential(&self) -> Result<Option<String>, GatewayError> {
        match &self.credential {
            Ok(v) => Ok(v.clone()),
            Err(GatewayError::MissingCredential { env, hint }) => {
                Err(GatewayError::MissingCredential {
                    env: env.clone(),
                    hint: hint.clone(),
                })
            }
            Err(_) => Err(GatewayError::Internal("credential state corrupt".into())),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}{}", self.provider.base_url, self.provider.api_path)
    }

    fn summary_mode(&self) -> ToolSummaryMode {
        // Local models drown in the agent's full tool prose; cloud models
        // get it verbatim.
        if self.provider.local {
            ToolSummaryMode::Standard
        } else {
            ToolSummaryMode::Full
        }
    }

    // ------------------------------------------------------------------
    // Context window
    // ------------------------------------------------------------------

    async fn ensure_context_window(&self) {
        {
            let mut resolved = self.window_resolved.lock();
            if *resolved {
                return;
            }
            *resolved = true;
        }
        if self.tracker.lock().context_window_source == ContextWindowSource::Env {
            return;
        }

        if let Some(window) = self.deps.model_cache.get(&self.provider.name, &self.model) {
            self.tracker
                .lock()
                .set_context_window(window, ContextWindowSource::Cache);
            return;
        }

        if self.provider.local {
            if let Some(window) = self.probe_context_window().await {
                self.deps
                    .model_cache
                    .put(&self.provider.name, &self.model, window);
                self.tracker
                    .lock()
                    .set_context_window(window, ContextWindowSource::Probed);
                return;
            }
        }

        let default = if self.provider.local {
            DEFAULT_LOCAL_WINDOW
        } else {
            DEFAULT_CLOUD_WINDOW
        };
        self.tracker
            .lock()
            .set_context_window(default, ContextWindowSource::Default);
    }

    /// Ask the local server how big the model's context is. Ollama exposes
    /// it under `/api/show`; LM Studio and vLLM put it on `/v1/models`.
    async fn probe_context_window(&self) -> Option<u32> {
        if self.provider.name == "ollama" {
            let url = format!("{}/api/show", self.provider.base_url);
            let resp = self
                .deps
                .http
                .post(&url)
                .json(&serde_json::json!({"model": self.model}))
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .ok()?;
            let body: serde_json::Value = resp.json().await.ok()?;
            if let Some(info) = body.get("model_info").and_then(|v| v.as_object()) {
                for (key, value) in info {
                    if key.ends_with("context_length") {
                        if let Some(n) = value.as_u64() {
                            return Some(n as u32);
                        }
                    }
                }
            }
            return None;
        }

        let url = format!("{}/v1/models", self.provider.base_url);
        let resp = self
            .deps
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        let body: serde_json::Value = resp.json().await.ok()?;
        let entries = body.get("data").and_then(|v| v.as_array())?;
        let entry = entries
            .iter()
            .find(|e| e.get("id").and_then(|i| i.as_str()) == Some(self.model.as_str()))?;
        entry
            .get("max_model_len")
            .or_else(|| entry.get("context_length"))
            .or_else(|| entry.get("max_context_length"))
            .and_then(|v| v.as_u64())
            .map(|n| n as u32)
    }

    // ------------------------------------------------------------------
    // Request build
    // ------------------------------------------------------------------

    fn build_system(&self, request: &MessagesRequest, pruned: Option<usize>) -> String {
        let base = request
            .system
            .as_ref()
            .map(|s| s.to_text())
            .unwrap_or_default();
        let mut system = prompts::decorate_system(&base, &self.model, UPSTREAM_BRAND);

        if self.deps.settings.qwen_no_think && self.model.to_lowercase().contains("qwen") {
            system = format!("/no_think\n{}", system);
        }
        if let Some(dropped) = pruned {
            system.push_str(&pruner::disclosure_note(dropped));
        }
        system
    }

    fn build_outbound(
        &self,
        request: &MessagesRequest,
        system: &str,
    ) -> oai::ChatCompletionRequest {
        let settings = &self.deps.settings;

        let mut messages = convert::anthropic_request_to_openai(
            &request.messages,
            Some(system),
            self.provider.simple_format,
        );
        convert::fix_orphaned_tool_messages(&mut messages);
        convert::ensure_trailing_user_turn(&mut messages);

        let mut outbound = oai::ChatCompletionRequest::new(self.model.clone(), messages);
        outbound.max_tokens = Some(request.max_tokens.min(settings.max_output_tokens));
        outbound.temperature = settings.temperature.or(request.temperature);
        outbound.top_p = settings.top_p;
        outbound.top_k = settings.top_k;
        outbound.min_p = settings.min_p;
        outbound.repetition_penalty = settings.repetition_penalty;
        outbound.stream = Some(true);
        outbound.stream_options = Some(oai::StreamOptions {
            include_usage: true,
        });

        if let Some(tools) = &request.tools {
            outbound.tools = Some(convert::anthropic_tools_to_openai(tools, self.summary_mode()));
        }
        if let Some(choice) = &request.tool_choice {
            outbound.tool_choice = Some(convert::anthropic_tool_choice_to_openai(choice));
        }

        if self.provider.name == "ollama" {
            let window = self.tracker.lock().context_window;
            outbound.options = Some(oai::LocalOptions {
                num_ctx: Some(window.max(MIN_NUM_CTX)),
                keep_alive: Some(settings.ollama_keep_alive.clone()),
            });
        }

        outbound
    }

    // ------------------------------------------------------------------
    // Entry point
    // ------------------------------------------------------------------

    pub async fn handle(&self, mut request: MessagesRequest) -> Result<Response, GatewayError> {
        let api_key = self.credential()?;

        if request.tools.as_ref().is_some_and(|t| !t.is_empty()) && !self.provider.caps.tools {
            return Err(GatewayError::Capability {
                model: self.model.clone(),
                message: "the request requires tool support".into(),
            });
        }

        if self.provider.local {
            let needs_check = {
                let mut checked = self.health_checked.lock();
                if !*checked {
                    *checked = true;
                    true
                } else {
                    false
                }
            };
            if needs_check {
                if !self
                    .deps
                    .health
                    .check(&self.deps.http, &self.provider.base_url)
                    .await
                {
                    *self.health_checked.lock() = false;
                    return Err(GatewayError::Connection {
                        url: self.provider.base_url.clone(),
                        message: format!(
                            "no {} server answering at {}",
                            self.provider.name, self.provider.base_url
                        ),
                    });
                }
            }
        }

        self.ensure_context_window().await;

        // Prune when the session context is close to the window.
        let pruned = {
            let tracker = self.tracker.lock();
            pruner::should_prune(
                tracker.context_used(),
                tracker.context_window,
                request.messages.len(),
            )
        }
        .then(|| pruner::prune_messages(&mut request.messages))
        .filter(|o| o.pruned)
        .map(|o| o.dropped);

        let system = self.build_system(&request, pruned);
        let mut outbound = self.build_outbound(&request, &system);

        let mut adapter = adapter_for(&self.model);
        adapter.reset();
        adapter.prepare_request(&mut outbound, &request);

        self.deps.middleware.before_request(&mut outbound);

        let streaming = request.stream.unwrap_or(false);
        if !streaming {
            outbound.stream = Some(false);
            outbound.stream_options = None;
        }

        debug!(
            "dispatching {} → {} ({} messages)",
            request.model,
            self.chat_url(),
            outbound.messages.len()
        );

        let url = self.chat_url();
        let http = self.deps.http.clone();
        let body = serde_json::to_value(&outbound)?;
        let key = api_key.clone();
        let resp = send_with_retry(&self.provider, move || {
            let mut req = http.post(&url).header("Content-Type", "application/json");
            if let Some(key) = &key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
            req.json(&body)
        })
        .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_error_response(
                &self.provider,
                &self.model,
                status.as_u16(),
                &body,
            ));
        }

        if streaming {
            Ok(self.stream_response(resp, request))
        } else {
            self.json_response(resp).await
        }
    }

    /// Drive the streaming machine over the upstream SSE body.
    fn stream_response(&self, resp: reqwest::Response, request: MessagesRequest) -> Response {
        let schemas = request.tools.clone().unwrap_or_default();
        let adapter = adapter_for(&self.model);
        let mut writer = EventWriter::new(&request.model, schemas, adapter);
        let middleware = self.deps.middleware.clone();
        let mut guard = CompletionGuard::new(self.tracker.clone());

        let stream = async_stream::stream! {
            for f in writer.start() {
                yield Ok(f);
            }

            let mut parser = SseParser::new();
            let mut body = resp.bytes_stream();
            let mut last_activity = Instant::now();
            let mut ping = tokio::time::interval(Duration::from_secs(1));
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ping.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            last_activity = Instant::now();
                            for payload in parser.feed(&bytes) {
                                if payload == "[DONE]" {
                                    continue;
                                }
                                match serde_json::from_str::<oai::ChatCompletionChunk>(&payload) {
                                    Ok(chunk) => {
                                        for f in writer.on_openai_chunk(&chunk, &middleware) {
                                            yield Ok(f);
                                        }
                                    }
                                    // A malformed chunk must not tear down
                                    // the stream.
                                    Err(e) => warn!("skipping unparseable chunk: {}", e),
                                }
                            }
                            let usage = writer.usage_or_estimate();
                            guard.observe(usage.input_tokens, usage.output_tokens);
                        }
                        Some(Err(e)) => {
                            warn!("upstream stream error: {}", e);
                            for f in writer.finalize_error("connection_error", &e.to_string()) {
                                yield Ok(f);
                            }
                            break;
                        }
                        None => {
                            for f in writer.finalize() {
                                yield Ok(f);
                            }
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if last_activity.elapsed() > Duration::from_secs(1) && writer.can_ping() {
                            yield Ok(writer.ping());
                        }
                    }
                }
            }

            middleware.after_stream_complete(&writer.metadata);
            let usage = writer.usage_or_estimate();
            guard.record(usage.input_tokens, usage.output_tokens);
        };

        sse_response(stream)
    }

    /// Non-streaming path: one upstream call, one Anthropic JSON body back.
    async fn json_response(&self, resp: reqwest::Response) -> Result<Response, GatewayError> {
        let completion: oai::ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Api {
                status: 502,
                message: format!("unparseable completion from {}: {}", self.provider.name, e),
            })?;

        let choice = completion
            .choices
            .first()
            .ok_or_else(|| GatewayError::Api {
                status: 502,
                message: format!("{} returned no choices", self.provider.name),
            })?;

        let mut content = Vec::new();
        if let Some(oai::Content::Text(text)) = &choice.message.content {
            if !text.is_empty() {
                content.push(anthropic::ContentBlock::Text { text: text.clone() });
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for tc in tool_calls {
                let input = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({}));
                content.push(anthropic::ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    input,
                });
            }
        }

        let usage = completion.usage.unwrap_or_default();
        self.tracker
            .lock()
            .record(usage.prompt_tokens, usage.completion_tokens);

        let stop_reason = choice
            .finish_reason
            .map(convert::finish_reason_to_stop)
            .unwrap_or(anthropic::StopReason::EndTurn);

        info!(
            "completed non-streaming {} request ({} in / {} out)",
            self.provider.name, usage.prompt_tokens, usage.completion_tokens
        );

        let response = anthropic::MessagesResponse {
            id: crate::ids::new_message_id(),
            response_type: "message".into(),
            role: anthropic::Role::Assistant,
            content,
            model: self.model.clone(),
            stop_reason: Some(stop_reason),
            usage: anthropic::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        };
        Ok(Json(response).into_response())
    }
}
